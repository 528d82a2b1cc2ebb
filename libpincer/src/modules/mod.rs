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

//! The module framework: dotted-name registry, typed argument
//! validation and coercion, and streamed Result/Status events.
//!
//! A module yields a stream of events while it runs; Status events
//! drive the progress line and are not handed to the caller, Result
//! events are collected and returned.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};

use globset::Glob;
use tracing::debug;

use crate::{
    error::{Error, Result},
    platform::PlatformKind,
    session::Session,
};

mod enumerate;

/// The type of one declared module argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgKind {
    String,
    Int,
    Bool,
    Path,
    Enum(Vec<&'static str>),
}

/// One declared argument: the registry validates and coerces raw
/// string values against this before the module ever runs.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub default: Option<&'static str>,
    pub required: bool,
}

/// A coerced argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    String(String),
    Int(i64),
    Bool(bool),
    Path(PathBuf),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&PathBuf> {
        match self {
            ArgValue::Path(p) => Some(p),
            _ => None,
        }
    }
}

pub type Args = HashMap<String, ArgValue>;

/// Something a module found. The user-facing terminal shows the title;
/// description and category feed the fuller report view.
pub trait ModuleResult: Send {
    fn title(&self) -> String;
    fn description(&self) -> Option<String> {
        None
    }
    fn category(&self) -> String;
}

/// A plain text result, enough for most enumeration output.
pub struct TextResult {
    pub title: String,
    pub description: Option<String>,
    pub category: String,
}

impl ModuleResult for TextResult {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn description(&self) -> Option<String> {
        self.description.clone()
    }

    fn category(&self) -> String {
        self.category.clone()
    }
}

/// One event in a module's output stream.
pub enum Event {
    Result(Box<dyn ModuleResult>),
    Status(String),
}

pub trait Module: Send + Sync {
    /// Dotted name, e.g. `enumerate.users`.
    fn name(&self) -> &'static str;

    fn platforms(&self) -> &'static [PlatformKind];

    fn args(&self) -> Vec<ArgSpec>;

    /// Run against the given session, emitting events as they happen.
    /// Execution is synchronous; the caller drains the stream.
    fn run(&self, session: &mut Session, args: &Args, emit: &mut dyn FnMut(Event)) -> Result<()>;
}

/// The name → module table. Read-mostly: populated at startup and on
/// explicit registration.
pub struct Registry {
    modules: BTreeMap<&'static str, Box<dyn Module>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry holding the builtin modules.
    pub fn new() -> Registry {
        let mut registry = Registry { modules: BTreeMap::new() };
        for module in enumerate::builtins() {
            registry.register(module);
        }
        registry
    }

    pub fn register(&mut self, module: Box<dyn Module>) {
        debug!("registering module {}", module.name());
        self.modules.insert(module.name(), module);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Module> {
        self.modules.get(name).map(|m| m.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.keys().copied()
    }

    /// Glob search over module names, e.g. `enumerate.*`.
    pub fn search(&self, pattern: &str) -> Result<Vec<&'static str>> {
        let matcher = Glob::new(pattern)
            .map_err(|e| Error::Argument(format!("bad search pattern: {e}")))?
            .compile_matcher();
        Ok(self.modules.keys().copied().filter(|name| matcher.is_match(name)).collect())
    }

    /// Validate raw `key=value` arguments against a module's declared
    /// specs, coercing strings into typed values and applying defaults.
    pub fn validate_args(module: &dyn Module, raw: &[(String, String)]) -> Result<Args> {
        let specs = module.args();
        let mut args = Args::new();

        for (key, value) in raw {
            let spec = specs
                .iter()
                .find(|s| s.name == key)
                .ok_or_else(|| Error::Argument(format!("unknown argument '{key}'")))?;
            args.insert(String::from(spec.name), coerce(spec, value)?);
        }

        for spec in specs.iter() {
            if args.contains_key(spec.name) {
                continue;
            }
            if let Some(default) = spec.default {
                args.insert(String::from(spec.name), coerce(spec, default)?);
            } else if spec.required {
                return Err(Error::Argument(format!("missing required argument '{}'", spec.name)));
            }
        }

        Ok(args)
    }

    /// Resolve, validate, and run a module, draining its event stream.
    /// Status events go to the progress callback; results come back to
    /// the caller.
    pub fn run(
        &self,
        session: &mut Session,
        name: &str,
        raw_args: &[(String, String)],
        progress: &mut dyn FnMut(&str),
    ) -> Result<Vec<Box<dyn ModuleResult>>> {
        let module = self
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("module '{name}'")))?;

        if !module.platforms().contains(&session.platform_kind()) {
            return Err(Error::Argument(format!(
                "module '{}' does not support {} targets",
                name,
                session.platform_kind()
            )));
        }

        let args = Self::validate_args(module, raw_args)?;

        let mut results = vec![];
        let mut emit = |event: Event| match event {
            Event::Result(result) => results.push(result),
            Event::Status(message) => progress(&message),
        };
        module.run(session, &args, &mut emit)?;
        Ok(results)
    }
}

fn coerce(spec: &ArgSpec, value: &str) -> Result<ArgValue> {
    match &spec.kind {
        ArgKind::String => Ok(ArgValue::String(String::from(value))),
        ArgKind::Int => value
            .parse()
            .map(ArgValue::Int)
            .map_err(|_| Error::Argument(format!("argument '{}' wants an integer, got '{value}'", spec.name))),
        ArgKind::Bool => match value {
            "true" | "yes" | "1" => Ok(ArgValue::Bool(true)),
            "false" | "no" | "0" => Ok(ArgValue::Bool(false)),
            _ => Err(Error::Argument(format!(
                "argument '{}' wants a boolean, got '{value}'",
                spec.name
            ))),
        },
        ArgKind::Path => Ok(ArgValue::Path(PathBuf::from(value))),
        ArgKind::Enum(choices) => {
            if choices.contains(&value) {
                Ok(ArgValue::String(String::from(value)))
            } else {
                Err(Error::Argument(format!(
                    "argument '{}' must be one of {choices:?}, got '{value}'",
                    spec.name
                )))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct ProbeModule;

    impl Module for ProbeModule {
        fn name(&self) -> &'static str {
            "test.probe"
        }

        fn platforms(&self) -> &'static [PlatformKind] {
            &[PlatformKind::Linux]
        }

        fn args(&self) -> Vec<ArgSpec> {
            vec![
                ArgSpec { name: "target", kind: ArgKind::String, default: None, required: true },
                ArgSpec { name: "depth", kind: ArgKind::Int, default: Some("3"), required: false },
                ArgSpec { name: "fast", kind: ArgKind::Bool, default: Some("false"), required: false },
                ArgSpec {
                    name: "method",
                    kind: ArgKind::Enum(vec!["scan", "probe"]),
                    default: Some("scan"),
                    required: false,
                },
            ]
        }

        fn run(
            &self,
            _session: &mut Session,
            args: &Args,
            emit: &mut dyn FnMut(Event),
        ) -> Result<()> {
            emit(Event::Status(String::from("working")));
            emit(Event::Result(Box::new(TextResult {
                title: format!("probed {}", args["target"].as_str().unwrap()),
                description: None,
                category: String::from("test"),
            })));
            Ok(())
        }
    }

    fn raw(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (String::from(*k), String::from(*v))).collect()
    }

    #[test]
    fn validate_applies_defaults_and_coercion() -> Result<()> {
        let module = ProbeModule;
        let args = Registry::validate_args(&module, &raw(&[("target", "web01"), ("depth", "5")]))?;

        assert_eq!(args["target"], ArgValue::String(String::from("web01")));
        assert_eq!(args["depth"], ArgValue::Int(5));
        assert_eq!(args["fast"], ArgValue::Bool(false));
        assert_eq!(args["method"], ArgValue::String(String::from("scan")));
        Ok(())
    }

    #[test]
    fn validate_errors() {
        let module = ProbeModule;
        let cases: Vec<(Vec<(String, String)>, &str)> = vec![
            (raw(&[]), "missing required argument 'target'"),
            (raw(&[("target", "x"), ("depth", "deep")]), "wants an integer"),
            (raw(&[("target", "x"), ("fast", "maybe")]), "wants a boolean"),
            (raw(&[("target", "x"), ("method", "guess")]), "must be one of"),
            (raw(&[("target", "x"), ("bogus", "1")]), "unknown argument"),
        ];

        for (input, errsubstr) in cases {
            match Registry::validate_args(&module, &input) {
                Err(Error::Argument(message)) => {
                    assert!(message.contains(errsubstr), "message={message}");
                }
                other => panic!("wanted Argument error with '{errsubstr}', got {other:?}"),
            }
        }
    }

    #[test]
    fn search_globs_names() -> Result<()> {
        let mut registry = Registry { modules: BTreeMap::new() };
        registry.register(Box::new(ProbeModule));

        assert_eq!(registry.search("test.*")?, vec!["test.probe"]);
        assert_eq!(registry.search("*.probe")?, vec!["test.probe"]);
        assert!(registry.search("windows.*")?.is_empty());
        Ok(())
    }

    #[test]
    fn run_separates_status_from_results() -> Result<()> {
        let mut registry = Registry { modules: BTreeMap::new() };
        registry.register(Box::new(ProbeModule));

        let chan = crate::channel::test_support::ScriptedTransport::channel(vec![]);
        let platform =
            crate::platform::Platform::Linux(crate::platform::LinuxPlatform::for_test());
        let mut session = Session::from_parts(1, chan, platform);

        let mut statuses = vec![];
        let results = registry.run(
            &mut session,
            "test.probe",
            &raw(&[("target", "web01")]),
            &mut |message| statuses.push(String::from(message)),
        )?;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title(), "probed web01");
        assert_eq!(statuses, vec![String::from("working")]);
        Ok(())
    }

    #[test]
    fn run_checks_platform() {
        let registry = Registry::new();
        let chan = crate::channel::test_support::ScriptedTransport::channel(vec![]);
        let platform =
            crate::platform::Platform::Windows(crate::platform::WindowsPlatform::for_test());
        let mut session = Session::from_parts(1, chan, platform);

        // enumerate.passwd is linux-only
        let res = registry.run(&mut session, "enumerate.passwd", &[], &mut |_| {});
        assert!(matches!(res, Err(Error::Argument(_))));
    }

    #[test]
    fn unknown_module_is_not_found() {
        let registry = Registry::new();
        let chan = crate::channel::test_support::ScriptedTransport::channel(vec![]);
        let platform =
            crate::platform::Platform::Linux(crate::platform::LinuxPlatform::for_test());
        let mut session = Session::from_parts(1, chan, platform);

        let res = registry.run(&mut session, "no.such.module", &[], &mut |_| {});
        assert!(matches!(res, Err(Error::NotFound(_))));
    }
}
