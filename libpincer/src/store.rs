// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The persisted target store. One JSON row per known target, keyed by
//! host id, holding everything we have learned about the box across
//! sessions: enumerated facts, installed implants, recorded tampers,
//! and credential discoveries. A lock file prevents two managers from
//! mutating the same store.

use std::{
    collections::HashMap,
    fs,
    io::Write as _,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use serde_derive::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{consts, platform::PlatformKind};

/// When a cached fact must be re-enumerated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Schedule {
    /// Enumerate once per host, ever.
    Once,
    /// Enumerate once per (host, user) pair.
    PerUser,
    /// Never cache.
    Always,
}

/// A typed piece of enumerated knowledge about a target.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Fact {
    pub source_module: String,
    pub type_tag: String,
    pub data: serde_json::Value,
    pub schedule: Schedule,
    /// The user the fact was enumerated as, for per-user scheduling.
    #[serde(default)]
    pub user: Option<String>,
}

impl Fact {
    /// The cache key this fact occupies.
    pub fn cache_key(&self) -> String {
        match self.schedule {
            Schedule::Once => self.type_tag.clone(),
            Schedule::PerUser => {
                format!("{}:{}", self.type_tag, self.user.as_deref().unwrap_or(""))
            }
            Schedule::Always => String::new(),
        }
    }
}

/// A recorded remote state change with a revert recipe.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Tamper {
    pub description: String,
    /// Shell command (Linux) or method call description (Windows) that
    /// undoes the change. Empty when irreversible.
    pub revert_action: String,
    pub principal_user: String,
    pub reversible: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ImplantType {
    /// Lets a local user escalate, e.g. a setuid shim.
    LocalEscalate,
    /// Lets us reconnect from outside, e.g. an authorized key.
    RemoteReconnect,
    /// Replaces an existing binary or config wholesale.
    Replacement,
}

/// A persistent remote modification enabling reconnect or escalation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Implant {
    pub module_name: String,
    #[serde(rename = "type")]
    pub implant_type: ImplantType,
    pub user: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    pub installed: bool,
}

/// A credential discovery for a user on the target.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Credential {
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Path to a private key file on the local box.
    #[serde(default)]
    pub key_path: Option<String>,
}

/// Everything we know about one target.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Target {
    #[serde(default)]
    pub host_id: String,
    /// The last address we talked to the target on, `host:port`.
    #[serde(default)]
    pub last_address: String,
    #[serde(default)]
    pub platform: Option<PlatformKind>,
    #[serde(default)]
    pub facts: Vec<Fact>,
    #[serde(default)]
    pub implants: Vec<Implant>,
    #[serde(default)]
    pub tampers: Vec<Tamper>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

impl Target {
    /// Look up a cached fact honoring its schedule.
    pub fn fact(&self, type_tag: &str, user: Option<&str>) -> Option<&Fact> {
        self.facts.iter().find(|f| match f.schedule {
            Schedule::Once => f.type_tag == type_tag,
            Schedule::PerUser => f.type_tag == type_tag && f.user.as_deref() == user,
            Schedule::Always => false,
        })
    }

    /// Insert or replace a fact under its cache key.
    pub fn put_fact(&mut self, fact: Fact) {
        if fact.schedule != Schedule::Always {
            let key = fact.cache_key();
            self.facts.retain(|f| f.cache_key() != key);
        }
        self.facts.push(fact);
    }

    /// A reconnect identity for the given implant type, if we have one.
    pub fn reconnect_credential(&self) -> Option<&Credential> {
        let user = self
            .implants
            .iter()
            .find(|i| i.installed && i.implant_type == ImplantType::RemoteReconnect)
            .map(|i| i.user.as_str())?;
        self.credentials.iter().find(|c| c.user == user)
    }
}

/// The store itself: a directory of row files plus the lock.
pub struct TargetStore {
    dir: PathBuf,
    lock_path: PathBuf,
}

impl TargetStore {
    /// Open the store, creating the directory and taking the lock. An
    /// existing lock means another manager owns the store.
    #[instrument(skip_all)]
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("creating store dir")?;

        let lock_path = dir.join(consts::STORE_LOCK_FILE);
        let mut lock_file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    anyhow!(
                        "store at {} is locked by another pincer instance (remove {} if stale)",
                        dir.display(),
                        lock_path.display()
                    )
                } else {
                    anyhow::Error::from(e).context("creating store lock")
                }
            })?;
        write!(lock_file, "{}", std::process::id()).context("writing lock pid")?;

        info!("opened target store at {}", dir.display());
        Ok(TargetStore { dir, lock_path })
    }

    fn row_path(&self, host_id: &str) -> PathBuf {
        self.dir.join(format!("{host_id}.json"))
    }

    pub fn get(&self, host_id: &str) -> anyhow::Result<Option<Target>> {
        let path = self.row_path(host_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path).context("reading target row")?;
        let target: Target = serde_json::from_str(&data).context("parsing target row")?;
        Ok(Some(target))
    }

    /// Write a row, atomically via a tempfile rename so a crash can't
    /// leave a torn row behind.
    pub fn put(&self, target: &Target) -> anyhow::Result<()> {
        if target.host_id.is_empty() {
            return Err(anyhow!("refusing to persist a target with no host id"));
        }
        let data = serde_json::to_vec_pretty(target).context("encoding target row")?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).context("creating temp row")?;
        tmp.write_all(&data).context("writing temp row")?;
        tmp.persist(self.row_path(&target.host_id)).context("persisting target row")?;
        Ok(())
    }

    pub fn list(&self) -> anyhow::Result<Vec<Target>> {
        let mut targets = vec![];
        for entry in fs::read_dir(&self.dir).context("listing store dir")? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let data = fs::read_to_string(&path).context("reading target row")?;
                match serde_json::from_str(&data) {
                    Ok(target) => targets.push(target),
                    Err(e) => tracing::warn!("skipping bad row {}: {}", path.display(), e),
                }
            }
        }
        targets.sort_by(|a: &Target, b: &Target| a.host_id.cmp(&b.host_id));
        Ok(targets)
    }
}

impl Drop for TargetStore {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            tracing::warn!("could not remove store lock: {}", e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_target() -> Target {
        Target {
            host_id: String::from("ab8b7df2a1f83fa6694b0315aaf1deec"),
            last_address: String::from("10.0.0.5:22"),
            platform: Some(PlatformKind::Linux),
            implants: vec![Implant {
                module_name: String::from("implant.authorized-key"),
                implant_type: ImplantType::RemoteReconnect,
                user: String::from("caleb"),
                params: HashMap::new(),
                installed: true,
            }],
            credentials: vec![Credential {
                user: String::from("caleb"),
                password: None,
                key_path: Some(String::from("/tmp/key")),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = TargetStore::open(dir.path().join("store"))?;

        let target = sample_target();
        store.put(&target)?;

        let loaded = store.get(&target.host_id)?.expect("row to exist");
        assert_eq!(loaded.host_id, target.host_id);
        assert_eq!(loaded.last_address, target.last_address);
        assert_eq!(loaded.implants.len(), 1);

        assert!(store.get("00000000000000000000000000000000")?.is_none());
        Ok(())
    }

    #[test]
    fn lock_excludes_second_manager() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store_dir = dir.path().join("store");
        let _store = TargetStore::open(&store_dir)?;

        let second = TargetStore::open(&store_dir);
        assert!(second.is_err());
        let errstr = format!("{:?}", second.err().unwrap());
        assert!(errstr.contains("locked"));
        Ok(())
    }

    #[test]
    fn lock_released_on_drop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store_dir = dir.path().join("store");
        {
            let _store = TargetStore::open(&store_dir)?;
        }
        let _again = TargetStore::open(&store_dir)?;
        Ok(())
    }

    #[test]
    fn fact_schedules() {
        let mut target = sample_target();

        target.put_fact(Fact {
            source_module: String::from("enumerate.kernel"),
            type_tag: String::from("kernel"),
            data: serde_json::json!("5.15.0"),
            schedule: Schedule::Once,
            user: None,
        });
        target.put_fact(Fact {
            source_module: String::from("enumerate.sudo"),
            type_tag: String::from("sudo-rules"),
            data: serde_json::json!([]),
            schedule: Schedule::PerUser,
            user: Some(String::from("caleb")),
        });

        assert!(target.fact("kernel", None).is_some());
        assert!(target.fact("kernel", Some("anyone")).is_some());
        assert!(target.fact("sudo-rules", Some("caleb")).is_some());
        assert!(target.fact("sudo-rules", Some("root")).is_none());

        // replacing under the same key does not duplicate
        target.put_fact(Fact {
            source_module: String::from("enumerate.kernel"),
            type_tag: String::from("kernel"),
            data: serde_json::json!("6.1.0"),
            schedule: Schedule::Once,
            user: None,
        });
        assert_eq!(target.facts.iter().filter(|f| f.type_tag == "kernel").count(), 1);
    }

    #[test]
    fn reconnect_credential_follows_implant_user() {
        let target = sample_target();
        let cred = target.reconnect_credential().expect("credential to resolve");
        assert_eq!(cred.user, "caleb");
    }
}
