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

//! Parsing for the netcat-style connection string:
//!
//! ```text
//! [protocol://][user[:password]@][host][:port][?k=v&...]
//! ```
//!
//! plus the inference rules that turn a partially specified string and
//! the command line flags into a concrete action. A bare token of 32
//! hex characters is treated as a host id for reconnection instead.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Connect,
    Bind,
    SslConnect,
    SslBind,
    Ssh,
}

impl Protocol {
    fn from_scheme(scheme: &str) -> Result<Self> {
        match scheme {
            "connect" => Ok(Protocol::Connect),
            "bind" => Ok(Protocol::Bind),
            "ssl-connect" => Ok(Protocol::SslConnect),
            "ssl-bind" => Ok(Protocol::SslBind),
            "ssh" => Ok(Protocol::Ssh),
            _ => Err(Error::Argument(format!("unknown protocol '{scheme}'"))),
        }
    }

    /// Fold the --ssl flag into the plain tcp protocols.
    fn with_ssl(self) -> Self {
        match self {
            Protocol::Connect => Protocol::SslConnect,
            Protocol::Bind => Protocol::SslBind,
            p => p,
        }
    }
}

/// The parsed-but-not-yet-inferred connection string.
#[derive(Debug, Default, PartialEq)]
pub struct ConnectionSpec {
    pub protocol: Option<Protocol>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub opts: Vec<(String, String)>,
}

/// What to actually do, after inference.
#[derive(Debug, PartialEq)]
pub enum Action {
    Connect { host: String, port: u16 },
    Bind { host: String, port: u16 },
    SslConnect { host: String, port: u16 },
    SslBind { host: String, port: u16 },
    Ssh { host: String, port: u16, user: String, password: Option<String> },
}

/// True if the token looks like a stored host id rather than an
/// address: exactly 32 lowercase hex characters.
pub fn is_host_id(token: &str) -> bool {
    token.len() == 32 && token.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

impl ConnectionSpec {
    pub fn parse(src: &str) -> Result<Self> {
        let mut spec = ConnectionSpec::default();
        let mut rest = src;

        if let Some((scheme, tail)) = rest.split_once("://") {
            spec.protocol = Some(Protocol::from_scheme(scheme)?);
            rest = tail;
        }

        if let Some((head, query)) = rest.split_once('?') {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) => spec.opts.push((String::from(k), String::from(v))),
                    None => spec.opts.push((String::from(pair), String::new())),
                }
            }
            rest = head;
        }

        // user[:password]@ -- split on the last @ so passwords may
        // contain @ themselves
        if let Some(at) = rest.rfind('@') {
            let cred = &rest[..at];
            rest = &rest[at + 1..];
            match cred.split_once(':') {
                Some((user, password)) => {
                    spec.user = Some(String::from(user));
                    spec.password = Some(String::from(password));
                }
                None => spec.user = Some(String::from(cred)),
            }
            if spec.user.as_deref() == Some("") {
                return Err(Error::Argument(format!("empty user in '{src}'")));
            }
        }

        if let Some((host, port)) = rest.rsplit_once(':') {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::Argument(format!("bad port '{port}' in '{src}'")))?;
            spec.port = Some(port);
            rest = host;
        }

        if !rest.is_empty() {
            spec.host = Some(String::from(rest));
        }

        Ok(spec)
    }

    /// Apply the protocol inference rules:
    ///
    /// * an explicit scheme always wins
    /// * `--listen` forces a bind protocol
    /// * user+host implies ssh
    /// * host+port implies connect
    /// * no host (or host 0.0.0.0) implies bind
    /// * the ssl flag upgrades connect/bind to their ssl variants
    pub fn resolve(
        mut self,
        listen: bool,
        ssl: bool,
        positional_port: Option<u16>,
        port_flag: Option<u16>,
    ) -> Result<Action> {
        // netcat style `pincer host 4444` / -p flag
        if self.port.is_none() {
            self.port = positional_port.or(port_flag);
        } else if positional_port.is_some() || port_flag.is_some() {
            return Err(Error::Argument(String::from("port specified more than once")));
        }

        let bind_addr_given = matches!(self.host.as_deref(), None | Some("0.0.0.0") | Some(""));

        let protocol = match self.protocol {
            Some(p) if ssl => p.with_ssl(),
            Some(p) => p,
            None => {
                if listen || (bind_addr_given && self.user.is_none()) {
                    if ssl { Protocol::SslBind } else { Protocol::Bind }
                } else if self.user.is_some() {
                    Protocol::Ssh
                } else if ssl {
                    Protocol::SslConnect
                } else {
                    Protocol::Connect
                }
            }
        };

        if listen && !matches!(protocol, Protocol::Bind | Protocol::SslBind) {
            return Err(Error::Argument(format!(
                "--listen conflicts with protocol {protocol:?}"
            )));
        }

        let port = self
            .port
            .ok_or_else(|| Error::Argument(String::from("no port specified")))?;

        match protocol {
            Protocol::Connect | Protocol::SslConnect => {
                let host = self
                    .host
                    .ok_or_else(|| Error::Argument(String::from("connect requires a host")))?;
                if protocol == Protocol::Connect {
                    Ok(Action::Connect { host, port })
                } else {
                    Ok(Action::SslConnect { host, port })
                }
            }
            Protocol::Bind | Protocol::SslBind => {
                let host = self.host.filter(|h| !h.is_empty()).unwrap_or_else(|| String::from("0.0.0.0"));
                if protocol == Protocol::Bind {
                    Ok(Action::Bind { host, port })
                } else {
                    Ok(Action::SslBind { host, port })
                }
            }
            Protocol::Ssh => {
                let host = self
                    .host
                    .ok_or_else(|| Error::Argument(String::from("ssh requires a host")))?;
                let user = self
                    .user
                    .ok_or_else(|| Error::Argument(String::from("ssh requires a user")))?;
                Ok(Action::Ssh { host, port, user, password: self.password })
            }
        }
    }
}
