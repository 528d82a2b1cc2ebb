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

use std::{env, fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::platform::PlatformKind;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else if let Some(mut config_path) = config_dir() {
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

/// The config dir: $XDG_CONFIG_HOME/pincer, or ~/.config/pincer when
/// XDG_CONFIG_HOME is unset.
pub fn config_dir() -> Option<PathBuf> {
    match env::var("XDG_CONFIG_HOME") {
        Ok(dir) => Some(PathBuf::from(dir).join("pincer")),
        Err(_) => {
            env::var("HOME").ok().map(|home| PathBuf::from(home).join(".config").join("pincer"))
        }
    }
}

/// The state dir holding the target store, session logs, and the
/// plugin cache: $XDG_DATA_HOME/pincer or ~/.local/share/pincer.
pub fn state_dir() -> Option<PathBuf> {
    match env::var("XDG_DATA_HOME") {
        Ok(dir) => Some(PathBuf::from(dir).join("pincer")),
        Err(_) => env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".local").join("share").join("pincer")),
    }
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The keystroke that switches the interactive loop between raw
    /// pass-through and the local command prompt. Uses the same
    /// `Ctrl-x` syntax as common terminal tools. Defaults to Ctrl-d.
    pub escape_key: Option<String>,

    /// The keystroke that quotes the next byte so it can be sent
    /// through to the remote session even if it would otherwise match
    /// the escape key. Defaults to Ctrl-g.
    pub quote_key: Option<String>,

    /// The platform assumed for new channels when none is given on the
    /// command line.
    pub default_platform: Option<PlatformKind>,

    /// Where to find stage binaries and plugin assemblies. Overridden
    /// by $PINCER_PLUGIN_PATH.
    pub plugin_path: Option<String>,

    /// If true, framed execution reports 0/1 instead of the remote's
    /// raw `$?` value.
    pub normalize_exit_status: Option<bool>,

    /// What key listeners use when deciding that a new session
    /// duplicates an existing one.
    pub duplicate_key: Option<DuplicateKey>,

    /// Default certificate (combined PEM or cert half) for ssl-bind
    /// listeners that don't specify one.
    pub ssl_cert: Option<String>,

    /// Default private key file for ssl-bind listeners.
    pub ssl_key: Option<String>,

    /// Extra environment variables to export on new Linux sessions
    /// during prompt normalization.
    pub env: Option<std::collections::HashMap<String, String>>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicateKey {
    /// One session per (host id, user) pair.
    #[default]
    HostUser,
    /// One session per host id, regardless of user.
    Host,
}

impl Config {
    /// Resolve the plugin dir: $PINCER_PLUGIN_PATH beats the config
    /// value beats the state dir default.
    pub fn plugin_dir(&self) -> Option<PathBuf> {
        if let Ok(dir) = env::var(crate::consts::PLUGIN_PATH_VAR) {
            return Some(PathBuf::from(dir));
        }
        if let Some(dir) = &self.plugin_path {
            return Some(PathBuf::from(dir));
        }
        state_dir().map(|d| d.join("plugins"))
    }
}
