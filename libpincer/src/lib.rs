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

use std::{fmt, fs, io, path::PathBuf, sync::Mutex};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::fmt::format::FmtSpan;

pub mod channel;
pub mod config;
mod connstr;
mod consts;
pub mod error;
mod gtfo;
mod keys;
pub mod listener;
mod manager;
mod marker;
pub mod modules;
pub mod platform;
pub mod session;
pub mod store;
mod trie;
mod tty;

use channel::{SshAuth, SshTransport, SslTransport, TcpTransport};
use connstr::{Action, ConnectionSpec};
use platform::PlatformKind;

/// The command line arguments that pincer expects. The primary
/// interface is a netcat-style connection string; everything else is
/// a refinement flag.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        long,
        action,
        long_help = "The file to write logs to

Logs are discarded by default unless verbosity is raised, in which
case they go to stderr."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config: Option<String>,

    #[clap(short, long, action, help = "Force a bind (listen) protocol")]
    pub listen: bool,

    #[clap(long, action, help = "Wrap the connection in TLS")]
    pub ssl: bool,

    #[clap(long, action, help = "Server certificate (combined PEM accepted) for ssl-bind")]
    pub ssl_cert: Option<PathBuf>,

    #[clap(long, action, help = "Server private key for ssl-bind")]
    pub ssl_key: Option<PathBuf>,

    #[clap(short, long, action, help = "SSH private key for ssh:// targets")]
    pub identity: Option<PathBuf>,

    #[clap(
        short = 'm',
        long,
        value_enum,
        default_value_t = PlatformKind::Linux,
        help = "Platform of the remote host"
    )]
    pub platform: PlatformKind,

    #[clap(short, long, action, help = "Port, if not given in the connection string")]
    pub port: Option<u16>,

    #[clap(long, action, help = "List known reconnect targets and exit")]
    pub list: bool,

    #[clap(long, action, help = "Prefetch stage binaries and plugins into the cache, then exit")]
    pub download_plugins: bool,

    #[clap(help = "Connection string: [protocol://][user[:password]@][host][:port][?k=v&...]")]
    pub target: Option<String>,

    #[clap(help = "Port as a second positional argument, netcat style")]
    pub positional_port: Option<u16>,
}

/// Marker error for bad invocations, so the wrapper binary can exit 2
/// instead of 1.
#[derive(Debug)]
pub struct UsageError(pub String);

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UsageError {}

/// Run the pincer tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if args.verbose > 0 {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_writer(io::stderr)
            .init();
    }

    let config = config::read_config(&args.config)?;

    let state_dir = config::state_dir();
    let store = state_dir.as_ref().and_then(|dir| {
        match store::TargetStore::open(dir.join("targets")) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("target store unavailable, continuing without persistence: {:#}", e);
                None
            }
        }
    });

    if args.list {
        let store = store.ok_or_else(|| anyhow::anyhow!("target store unavailable"))?;
        for target in store.list()? {
            println!(
                "{}  {}  {}  implants={}",
                target.host_id,
                target.platform.map(|p| p.to_string()).unwrap_or_else(|| String::from("?")),
                target.last_address,
                target.implants.len(),
            );
        }
        return Ok(());
    }

    if args.download_plugins {
        return download_plugins(&config);
    }

    let Some(target) = args.target.clone() else {
        return Err(UsageError(String::from("no target given (try --help)")).into());
    };

    let log_dir = state_dir.map(|dir| dir.join("logs"));
    let mut manager = manager::Manager::new(config.clone(), store, log_dir.clone())?;

    // a bare 32-hex token is a stored host id: reconnect through the
    // installed implant instead of parsing an address
    if connstr::is_host_id(&target) {
        reconnect(&mut manager, &target, &args)?;
        return manager.interactive();
    }

    let spec = ConnectionSpec::parse(&target)
        .map_err(|e| UsageError(format!("{e}")))?;
    let action = spec
        .resolve(args.listen, args.ssl, args.positional_port, args.port)
        .map_err(|e| UsageError(format!("{e}")))?;
    info!("resolved action: {:?}", action);

    let chan = match action {
        Action::Connect { host, port } => TcpTransport::connect(&host, port, None)
            .map_err(|e| anyhow::anyhow!("connecting to {host}:{port}: {e}"))?,
        Action::Bind { host, port } => TcpTransport::bind(&host, port)
            .map_err(|e| anyhow::anyhow!("binding {host}:{port}: {e}"))?,
        Action::SslConnect { host, port } => SslTransport::connect(&host, port)
            .map_err(|e| anyhow::anyhow!("ssl-connecting to {host}:{port}: {e}"))?,
        Action::SslBind { host, port } => {
            let cert = args
                .ssl_cert
                .clone()
                .or_else(|| config.ssl_cert.clone().map(PathBuf::from))
                .ok_or_else(|| UsageError(String::from("ssl-bind requires --ssl-cert")))?;
            let key = args.ssl_key.clone().or_else(|| config.ssl_key.clone().map(PathBuf::from));
            SslTransport::bind(&host, port, &cert, key.as_deref())
                .map_err(|e| anyhow::anyhow!("ssl-binding {host}:{port}: {e}"))?
        }
        Action::Ssh { host, port, user, password } => {
            let auth = match (&args.identity, &password) {
                (Some(key), _) => SshAuth::Identity(key),
                (None, Some(password)) => SshAuth::Password(password),
                (None, None) => {
                    return Err(UsageError(String::from(
                        "ssh requires --identity or a password in the connection string",
                    ))
                    .into())
                }
            };
            SshTransport::connect(&host, port, &user, auth)
                .map_err(|e| anyhow::anyhow!("ssh to {user}@{host}:{port}: {e}"))?
        }
    };

    manager.adopt_channel(chan, args.platform).context("session bring-up")?;
    manager.interactive()
}

/// Reconnect to a known target through its stored implant identity.
fn reconnect(
    manager: &mut manager::Manager,
    host_id: &str,
    args: &Args,
) -> anyhow::Result<()> {
    let target = manager
        .store_get(host_id)?
        .ok_or_else(|| anyhow::anyhow!("no stored target with host id {host_id}"))?;

    let cred = target
        .reconnect_credential()
        .ok_or_else(|| anyhow::anyhow!("target {host_id} has no reconnect credential"))?;
    let host = target
        .last_address
        .rsplit_once(':')
        .map(|(host, _)| String::from(host))
        .unwrap_or_else(|| target.last_address.clone());
    let port = args.port.unwrap_or(22);

    let auth = match (&cred.key_path, &cred.password) {
        (Some(key), _) => SshAuth::Identity(std::path::Path::new(key)),
        (None, Some(password)) => SshAuth::Password(password),
        (None, None) => return Err(anyhow::anyhow!("credential for {host_id} is empty")),
    };
    info!("reconnecting to {}@{}:{}", cred.user, host, port);
    let chan = SshTransport::connect(&host, port, &cred.user, auth)
        .map_err(|e| anyhow::anyhow!("reconnecting to {host}:{port}: {e}"))?;

    let platform = target.platform.unwrap_or(args.platform);
    manager.adopt_channel(chan, platform).context("session bring-up")?;
    Ok(())
}

/// Copy the stage binaries and bundled plugins from the install prefix
/// (or $PINCER_STAGE_DIR) into the cache dir.
fn download_plugins(config: &config::Config) -> anyhow::Result<()> {
    let dest = config
        .plugin_dir()
        .ok_or_else(|| anyhow::anyhow!("no plugin directory resolvable"))?;
    fs::create_dir_all(&dest).context("creating plugin dir")?;

    let source = std::env::var("PINCER_STAGE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/usr/share/pincer"));

    let mut fetched = 0;
    if source.is_dir() {
        for entry in fs::read_dir(&source).context("listing stage source dir")? {
            let path = entry?.path();
            if path.is_file() {
                let name = path.file_name().unwrap_or_default();
                fs::copy(&path, dest.join(name)).context("copying stage file")?;
                fetched += 1;
            }
        }
    }

    for stage in [consts::STAGE_ONE_FILE, consts::STAGE_TWO_FILE] {
        if !dest.join(stage).exists() {
            eprintln!("warning: {stage} still missing from {}", dest.display());
        }
    }
    println!("fetched {fetched} files into {}", dest.display());
    Ok(())
}
