// Copyright 2025 Google LLC
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

//! The builtin enumeration modules. The real enumeration and
//! escalation knowledge base ships separately; these cover the basics
//! every engagement starts with and double as reference
//! implementations of the module trait.

use crate::{
    error::Result,
    modules::{ArgKind, ArgSpec, Args, Event, Module, TextResult},
    platform::PlatformKind,
    session::Session,
    store::{Fact, Schedule},
};

pub fn builtins() -> Vec<Box<dyn Module>> {
    vec![Box::new(Passwd), Box::new(Groups), Box::new(Whoami)]
}

/// Users parsed from /etc/passwd.
struct Passwd;

impl Module for Passwd {
    fn name(&self) -> &'static str {
        "enumerate.passwd"
    }

    fn platforms(&self) -> &'static [PlatformKind] {
        &[PlatformKind::Linux]
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec {
            name: "shells-only",
            kind: ArgKind::Bool,
            default: Some("false"),
            required: false,
        }]
    }

    fn run(&self, session: &mut Session, args: &Args, emit: &mut dyn FnMut(Event)) -> Result<()> {
        emit(Event::Status(String::from("reading /etc/passwd")));
        let shells_only = args["shells-only"].as_bool().unwrap_or(false);

        let users = session.users()?;
        for user in users.iter() {
            if shells_only && user.shell.ends_with("nologin") {
                continue;
            }
            emit(Event::Result(Box::new(TextResult {
                title: format!("{} (uid={})", user.name, user.id),
                description: Some(format!("home={} shell={}", user.home, user.shell)),
                category: String::from("users"),
            })));
        }

        session.record_fact(Fact {
            source_module: String::from(self.name()),
            type_tag: String::from("users"),
            data: serde_json::json!(users.iter().map(|u| u.name.clone()).collect::<Vec<_>>()),
            schedule: Schedule::Once,
            user: None,
        });
        Ok(())
    }
}

/// Groups parsed from /etc/group.
struct Groups;

impl Module for Groups {
    fn name(&self) -> &'static str {
        "enumerate.groups"
    }

    fn platforms(&self) -> &'static [PlatformKind] {
        &[PlatformKind::Linux]
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![]
    }

    fn run(&self, session: &mut Session, _args: &Args, emit: &mut dyn FnMut(Event)) -> Result<()> {
        emit(Event::Status(String::from("reading /etc/group")));
        for group in session.groups()? {
            emit(Event::Result(Box::new(TextResult {
                title: format!("{} (gid={})", group.name, group.id),
                description: if group.members.is_empty() {
                    None
                } else {
                    Some(group.members.join(", "))
                },
                category: String::from("groups"),
            })));
        }
        Ok(())
    }
}

/// The identity the session runs as.
struct Whoami;

impl Module for Whoami {
    fn name(&self) -> &'static str {
        "enumerate.whoami"
    }

    fn platforms(&self) -> &'static [PlatformKind] {
        &[PlatformKind::Linux, PlatformKind::Windows]
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![]
    }

    fn run(&self, session: &mut Session, _args: &Args, emit: &mut dyn FnMut(Event)) -> Result<()> {
        let (platform, channel) = session.platform_and_channel()?;
        let (uid, name) = platform.current_user(channel)?;
        emit(Event::Result(Box::new(TextResult {
            title: format!("{name} (uid={uid})"),
            description: None,
            category: String::from("identity"),
        })));
        Ok(())
    }
}
