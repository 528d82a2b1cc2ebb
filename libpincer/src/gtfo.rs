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

//! The payload synthesizer interface: given a binary and a desired
//! capability, produce the shell payload that coerces the binary into
//! providing it, along with any bytes to feed on stdin and the command
//! that exits the resulting context.
//!
//! The full knowledge base of coercible binaries lives outside this
//! crate; what ships here is the interface the Linux driver consumes
//! plus a small builtin table of the portable methods (cat, tee, dd,
//! sh) that realize `open()` and `popen()` on any box with a POSIX
//! userland.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::error::{Error, Result};

bitflags! {
    /// What a method lets us do with the target binary.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capability: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const SHELL = 1 << 2;
    }
}

/// How payload output travels over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Untranslated bytes. Requires a raw-capable tty and a known
    /// length.
    Raw,
    /// Printable passthrough, e.g. text files.
    Print,
    /// Hex encoded on the remote side.
    Hex,
    /// Base64 encoded on the remote side. The default for binary
    /// content of unknown length.
    Base64,
}

/// One known recipe: a payload template with `{path}`, `{length}` and
/// `{lfile}` placeholders.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    /// The binary this method coerces.
    pub binary: &'static str,
    pub capability: Capability,
    pub stream: Stream,
    /// Template for the command to run.
    pub payload: &'static str,
    /// Template for bytes to feed the spawned payload on stdin.
    pub stdin: &'static str,
    /// Template for the command that exits the payload's context.
    pub exit_cmd: &'static str,
}

/// A method bound to a concrete binary path, ready to build.
pub struct MethodWrapper {
    pub spec: MethodSpec,
    /// Absolute path of the binary on the target.
    pub binary_path: String,
}

/// The concrete bytes for one payload invocation.
#[derive(Debug, PartialEq)]
pub struct Payload {
    pub payload: Vec<u8>,
    pub stdin: Vec<u8>,
    pub exit_cmd: Vec<u8>,
}

impl MethodWrapper {
    /// Substitute the given parameters into the templates.
    pub fn build(&self, params: &HashMap<&str, String>) -> Result<Payload> {
        let substitute = |template: &str| -> Result<Vec<u8>> {
            let mut out = template.replace("{binary}", &self.binary_path);
            for (key, value) in params.iter() {
                out = out.replace(&format!("{{{key}}}"), value);
            }
            if let Some(start) = out.find('{') {
                if out[start..].contains('}') {
                    return Err(Error::Argument(format!(
                        "unbound placeholder in payload template '{out}'"
                    )));
                }
            }
            Ok(out.into_bytes())
        };

        Ok(Payload {
            payload: substitute(self.spec.payload)?,
            stdin: substitute(self.spec.stdin)?,
            exit_cmd: substitute(self.spec.exit_cmd)?,
        })
    }
}

/// The source of methods. The Linux driver holds one of these and asks
/// it for recipes whenever it needs to read, write, or spawn something
/// and no direct tool is available or escalation is involved.
pub trait Synthesizer: Send + Sync {
    /// All methods providing any of `caps` over the given stream
    /// encodings, best first.
    fn iter_methods(&self, caps: Capability, streams: &[Stream]) -> Vec<MethodSpec>;

    /// Methods for one specific binary path.
    fn iter_binary(&self, path: &str, caps: Capability, streams: &[Stream]) -> Vec<MethodWrapper>;

    /// Methods reachable through a sudo rule spec like
    /// `(root) NOPASSWD: /usr/bin/tee`.
    fn iter_sudo(&self, spec: &str, caps: Capability) -> Vec<MethodWrapper>;
}

/// The portable builtin methods. Ordered so raw stream methods come
/// before encoded ones; the driver prefers raw when it can use it.
///
/// Read payloads emit the file on stdout; write payloads consume stdin
/// into the file. The driver supplies the framing (markers, heredocs,
/// byte windows) around them.
const BUILTIN_METHODS: &[MethodSpec] = &[
    MethodSpec {
        binary: "dd",
        capability: Capability::READ,
        stream: Stream::Raw,
        payload: "{binary} if={path} bs=1 count={length} 2>/dev/null",
        stdin: "",
        exit_cmd: "",
    },
    MethodSpec {
        binary: "dd",
        capability: Capability::WRITE,
        stream: Stream::Raw,
        payload: "{binary} of={path} bs=1 count={length} 2>/dev/null",
        stdin: "",
        exit_cmd: "",
    },
    MethodSpec {
        binary: "base64",
        capability: Capability::READ,
        stream: Stream::Base64,
        payload: "{binary} {path} 2>/dev/null",
        stdin: "",
        exit_cmd: "",
    },
    MethodSpec {
        binary: "base64",
        capability: Capability::WRITE,
        stream: Stream::Base64,
        payload: "{binary} -d > {path}",
        stdin: "",
        exit_cmd: "",
    },
    MethodSpec {
        binary: "sh",
        capability: Capability::SHELL,
        stream: Stream::Print,
        payload: "{binary} -i",
        stdin: "",
        exit_cmd: "exit\n",
    },
];

/// The zero-knowledge synthesizer: only the portable methods.
#[derive(Default)]
pub struct BuiltinSynthesizer;

impl Synthesizer for BuiltinSynthesizer {
    fn iter_methods(&self, caps: Capability, streams: &[Stream]) -> Vec<MethodSpec> {
        BUILTIN_METHODS
            .iter()
            .filter(|m| caps.intersects(m.capability) && streams.contains(&m.stream))
            .cloned()
            .collect()
    }

    fn iter_binary(&self, path: &str, caps: Capability, streams: &[Stream]) -> Vec<MethodWrapper> {
        let name = path.rsplit('/').next().unwrap_or(path);
        BUILTIN_METHODS
            .iter()
            .filter(|m| {
                m.binary == name && caps.intersects(m.capability) && streams.contains(&m.stream)
            })
            .map(|m| MethodWrapper { spec: m.clone(), binary_path: String::from(path) })
            .collect()
    }

    fn iter_sudo(&self, spec: &str, caps: Capability) -> Vec<MethodWrapper> {
        // We only understand rule specs naming a single binary; the
        // knowledge base handles wildcard rules.
        let binary = spec.split_whitespace().last().unwrap_or("");
        if !binary.starts_with('/') {
            return vec![];
        }
        self.iter_binary(binary, caps, &[Stream::Raw, Stream::Print, Stream::Hex, Stream::Base64])
            .into_iter()
            .map(|mut m| {
                // route through sudo but keep the same templates
                m.binary_path = format!("sudo {}", m.binary_path);
                m
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builtin_read_methods() {
        let synth = BuiltinSynthesizer;
        let methods = synth.iter_methods(Capability::READ, &[Stream::Raw, Stream::Base64]);
        assert!(methods.iter().any(|m| m.binary == "dd"));
        assert!(methods.iter().any(|m| m.binary == "base64"));
        assert!(methods.iter().all(|m| m.capability.contains(Capability::READ)));
        // raw before encoded so a known length picks the byte window
        assert_eq!(methods[0].stream, Stream::Raw);
    }

    #[test]
    fn build_substitutes_params() -> crate::error::Result<()> {
        let synth = BuiltinSynthesizer;
        let methods = synth.iter_binary("/usr/bin/dd", Capability::WRITE, &[Stream::Raw]);
        assert_eq!(methods.len(), 1);

        let mut params = HashMap::new();
        params.insert("path", String::from("/tmp/out"));
        params.insert("length", String::from("42"));
        let payload = methods[0].build(&params)?;
        assert_eq!(
            payload.payload,
            b"/usr/bin/dd of=/tmp/out bs=1 count=42 2>/dev/null".to_vec()
        );
        Ok(())
    }

    #[test]
    fn build_rejects_unbound_placeholders() {
        let synth = BuiltinSynthesizer;
        let methods = synth.iter_binary("/bin/dd", Capability::WRITE, &[Stream::Raw]);
        let params = HashMap::new();
        assert!(methods[0].build(&params).is_err());
    }

    #[test]
    fn sudo_routes_through_sudo() {
        let synth = BuiltinSynthesizer;
        let methods = synth.iter_sudo("(root) NOPASSWD: /usr/bin/dd", Capability::WRITE);
        assert_eq!(methods.len(), 1);
        assert!(methods[0].binary_path.starts_with("sudo "));
    }

    #[test]
    fn shell_method_has_exit_cmd() -> crate::error::Result<()> {
        let synth = BuiltinSynthesizer;
        let methods = synth.iter_binary("/bin/sh", Capability::SHELL, &[Stream::Print]);
        let payload = methods[0].build(&HashMap::new())?;
        assert_eq!(payload.exit_cmd, b"exit\n".to_vec());
        Ok(())
    }
}
