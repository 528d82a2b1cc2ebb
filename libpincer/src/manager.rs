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

//! The manager: the multi-target session table and the interactive
//! terminal loop.
//!
//! The loop runs in two states. In RAW, keyboard bytes are forwarded
//! to the current session's channel and channel bytes to local stdout,
//! unmodified. In COMMAND, a local line editor dispatches built-ins
//! and modules. A single configurable keystroke (default Ctrl-d)
//! transitions between them; a prefix keystroke (default Ctrl-g)
//! quotes the next byte through to the remote.

use std::{
    collections::{BTreeMap, HashSet},
    io::{BufRead as _, Read as _, Write as _},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Context as _;
use tracing::{info, instrument, warn};

use crate::{
    channel::Channel,
    config::Config,
    consts,
    error::Error,
    listener::{Listener, ListenerCtx, ListenerSpec},
    marker::MarkerScanner,
    modules::Registry,
    platform::{FileMode, PlatformKind},
    session::Session,
    store::TargetStore,
    tty,
};

const DEFAULT_ESCAPE_KEY: &str = "Ctrl-d";
const DEFAULT_QUOTE_KEY: &str = "Ctrl-g";

/// Why a raw pass-through ended.
#[derive(Debug, PartialEq)]
enum RawOutcome {
    /// The user pressed the escape key.
    Escape,
    /// The remote side finished (ConPTY completion marker or EOF).
    Completed,
    /// The channel died.
    Closed,
}

/// What the command dispatcher wants the outer loop to do next.
#[derive(Debug, PartialEq)]
enum LoopAction {
    Stay,
    EnterRaw,
    Exit,
}

pub struct Manager {
    config: Config,
    registry: Registry,
    store: Option<TargetStore>,
    sessions: BTreeMap<usize, Arc<Mutex<Session>>>,
    listeners: BTreeMap<usize, Listener>,
    current: Option<usize>,
    /// Monotonic session ids, shared with listener threads. Never
    /// reused within a manager lifetime.
    session_ids: Arc<AtomicUsize>,
    /// Identity keys of live sessions, for listener duplicate drops.
    identities: Arc<Mutex<HashSet<String>>>,
    next_listener_id: usize,
    escape_key: u8,
    quote_key: u8,
    log_dir: Option<PathBuf>,
}

impl Manager {
    pub fn new(
        config: Config,
        store: Option<TargetStore>,
        log_dir: Option<PathBuf>,
    ) -> anyhow::Result<Manager> {
        let escape_key =
            crate::keys::parse_key(config.escape_key.as_deref().unwrap_or(DEFAULT_ESCAPE_KEY))
                .context("parsing escape_key")?;
        let quote_key =
            crate::keys::parse_key(config.quote_key.as_deref().unwrap_or(DEFAULT_QUOTE_KEY))
                .context("parsing quote_key")?;
        if escape_key == quote_key {
            return Err(anyhow::anyhow!("escape_key and quote_key must differ"));
        }

        Ok(Manager {
            config,
            registry: Registry::new(),
            store,
            sessions: BTreeMap::new(),
            listeners: BTreeMap::new(),
            current: None,
            session_ids: Arc::new(AtomicUsize::new(1)),
            identities: Arc::new(Mutex::new(HashSet::new())),
            next_listener_id: 1,
            escape_key,
            quote_key,
            log_dir,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Look up a persisted target row, if the store is available.
    pub fn store_get(&self, host_id: &str) -> anyhow::Result<Option<crate::store::Target>> {
        match &self.store {
            Some(store) => store.get(host_id),
            None => Ok(None),
        }
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn session(&self, id: usize) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(&id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    //
    // session table
    //

    /// Establish a session over a fresh channel and make it current.
    #[instrument(skip_all)]
    pub fn adopt_channel(
        &mut self,
        chan: Channel,
        kind: PlatformKind,
    ) -> anyhow::Result<usize> {
        let id = self.session_ids.fetch_add(1, Ordering::SeqCst);
        let session =
            Session::establish(id, chan, kind, &self.config, self.log_dir.as_deref())
                .context("establishing session")?;
        Ok(self.adopt_session(session))
    }

    /// Insert an already established session and make it current.
    pub fn adopt_session(&mut self, session: Session) -> usize {
        let id = session.id;
        self.identities
            .lock()
            .unwrap()
            .insert(session.identity_key(self.config.duplicate_key.unwrap_or_default()));
        self.persist_target(&session);
        info!(
            "session {} established: {}:{} ({})",
            id,
            session.host(),
            session.port(),
            session.platform_kind()
        );
        self.sessions.insert(id, Arc::new(Mutex::new(session)));
        self.current = Some(id);
        id
    }

    fn persist_target(&self, session: &Session) {
        let (Some(store), Some(host_id)) = (&self.store, &session.host_id) else {
            return;
        };
        let result = store.get(host_id).and_then(|row| {
            let mut target = row.unwrap_or_default();
            target.host_id = host_id.clone();
            target.last_address = format!("{}:{}", session.host(), session.port());
            target.platform = Some(session.platform_kind());
            store.put(&target)
        });
        if let Err(e) = result {
            warn!("persisting target row: {:#}", e);
        }
    }

    /// Close a session: channel closed, logger flushed, entry removed.
    /// The id is retired, never reused.
    pub fn close_session(&mut self, id: usize) -> anyhow::Result<()> {
        let session = self
            .sessions
            .remove(&id)
            .ok_or_else(|| anyhow::anyhow!("no session {id}"))?;
        {
            let mut session = session.lock().unwrap();
            self.identities
                .lock()
                .unwrap()
                .remove(&session.identity_key(self.config.duplicate_key.unwrap_or_default()));
            if let Err(e) = session.close() {
                warn!("closing session {}: {}", id, e);
            }
        }
        if self.current == Some(id) {
            self.current = self.sessions.keys().next_back().copied();
        }
        Ok(())
    }

    //
    // listeners
    //

    pub fn start_listener(&mut self, spec: ListenerSpec) -> anyhow::Result<usize> {
        let id = self.next_listener_id;
        self.next_listener_id += 1;

        let ctx = ListenerCtx {
            config: self.config.clone(),
            session_ids: Arc::clone(&self.session_ids),
            identities: Arc::clone(&self.identities),
            log_dir: self.log_dir.clone(),
        };
        let listener = Listener::start(id, spec, ctx)?;
        self.listeners.insert(id, listener);
        Ok(id)
    }

    pub fn stop_listener(&mut self, id: usize) -> anyhow::Result<()> {
        let mut listener = self
            .listeners
            .remove(&id)
            .ok_or_else(|| anyhow::anyhow!("no listener {id}"))?;
        listener.stop();
        Ok(())
    }

    /// Promote a queued channel from a hint-less listener.
    pub fn init_from_listener(
        &mut self,
        listener_id: usize,
        pending_ix: usize,
        kind: PlatformKind,
    ) -> anyhow::Result<usize> {
        let chan = self
            .listeners
            .get(&listener_id)
            .ok_or_else(|| anyhow::anyhow!("no listener {listener_id}"))?
            .take_pending(pending_ix)
            .ok_or_else(|| anyhow::anyhow!("no pending channel {pending_ix}"))?;
        let id = self.adopt_channel(chan, kind)?;
        if let Some(listener) = self.listeners.get(&listener_id) {
            listener.note_established();
        }
        Ok(id)
    }

    /// Pull auto-promoted sessions out of every listener into the
    /// table. Called at the top of each interactive iteration.
    pub fn collect_established(&mut self) -> usize {
        let mut adopted = 0;
        let drained: Vec<Session> = self
            .listeners
            .values()
            .flat_map(|listener| listener.drain_established())
            .collect();
        for session in drained {
            // identity was already registered by the listener thread
            self.persist_target(&session);
            let id = session.id;
            info!("adopting session {} from listener", id);
            self.sessions.insert(id, Arc::new(Mutex::new(session)));
            if self.current.is_none() {
                self.current = Some(id);
            }
            adopted += 1;
        }
        adopted
    }

    //
    // the interactive loop
    //

    /// Run the terminal loop until the user exits. Starts in RAW when
    /// a current session exists, COMMAND otherwise.
    pub fn interactive(&mut self) -> anyhow::Result<()> {
        let mut action =
            if self.current.is_some() { LoopAction::EnterRaw } else { LoopAction::Stay };

        // Ctrl-C at the local prompt aborts the line being typed, not
        // the manager. In raw mode the signal never fires because the
        // local tty has ISIG cleared and the byte travels to the
        // remote instead.
        let sigint = Arc::new(AtomicBool::new(false));
        let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&sigint));

        loop {
            self.collect_established();

            match action {
                LoopAction::Exit => break,
                LoopAction::EnterRaw => {
                    let Some(id) = self.current else {
                        eprintln!("no current session");
                        action = LoopAction::Stay;
                        continue;
                    };
                    match self.raw_passthrough(id) {
                        Ok(RawOutcome::Escape) => {
                            println!();
                            action = LoopAction::Stay;
                        }
                        Ok(RawOutcome::Completed) => {
                            println!();
                            action = LoopAction::Stay;
                        }
                        Ok(RawOutcome::Closed) => {
                            eprintln!("\nsession {id} closed by remote");
                            let _ = self.close_session(id);
                            action = LoopAction::Stay;
                        }
                        Err(e) => {
                            eprintln!("\nsession {id} error: {e:#}");
                            let _ = self.close_session(id);
                            action = LoopAction::Stay;
                        }
                    }
                }
                LoopAction::Stay => {
                    print!("(pincer) ");
                    std::io::stdout().flush().ok();
                    let mut line = String::new();
                    let n = std::io::stdin().lock().read_line(&mut line)?;
                    if n == 0 {
                        break; // stdin eof
                    }
                    if sigint.swap(false, Ordering::Relaxed) {
                        println!();
                        action = LoopAction::Stay;
                        continue;
                    }
                    action = match self.handle_command(line.trim()) {
                        Ok(action) => action,
                        Err(e) => {
                            eprintln!("error: {e:#}");
                            LoopAction::Stay
                        }
                    };
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        let ids: Vec<usize> = self.sessions.keys().copied().collect();
        for id in ids {
            let _ = self.close_session(id);
        }
        let listener_ids: Vec<usize> = self.listeners.keys().copied().collect();
        for id in listener_ids {
            let _ = self.stop_listener(id);
        }
    }

    /// The RAW state: a single-threaded pump between local stdin and
    /// the session channel, with online scanning of the keyboard
    /// stream for the escape and quote keys.
    #[instrument(skip_all, fields(sid = id))]
    fn raw_passthrough(&mut self, id: usize) -> anyhow::Result<RawOutcome> {
        use nix::poll::{poll, PollFd, PollFlags};

        let session = self.session(id).ok_or_else(|| anyhow::anyhow!("no session {id}"))?;
        let mut session = session.lock().unwrap();
        session.enter_raw().context("entering raw mode")?;

        // resize events arrive on a flag; the actual sync happens once
        // we are back in command mode and framed execution is legal
        let sigwinch = Arc::new(AtomicBool::new(false));
        let _ = signal_hook::flag::register(signal_hook::consts::SIGWINCH, Arc::clone(&sigwinch));

        let tty_guard = tty::set_raw_flags()?;
        let mut stdout = std::io::stdout().lock();
        let mut stdin = std::io::stdin().lock();

        let mut complete_scanner = session
            .scans_interactive_marker()
            .then(|| MarkerScanner::for_bytes(pincer_protocol::INTERACTIVE_COMPLETE.as_bytes()));

        let outcome = 'outer: loop {
            // keyboard -> channel
            let mut poll_fds = [PollFd::new(consts::STDIN_FD, PollFlags::POLLIN)];
            let nready = poll(&mut poll_fds, consts::RAW_POLL_DUR.as_millis() as libc::c_int)
                .unwrap_or(0);
            if nready > 0 {
                let mut buf = [0u8; 512];
                let nread = stdin.read(&mut buf).unwrap_or(0);
                if nread == 0 {
                    break 'outer RawOutcome::Escape;
                }

                let mut forward: Vec<u8> = Vec::with_capacity(nread);
                let mut quoted = false;
                for byte in &buf[..nread] {
                    if quoted {
                        forward.push(*byte);
                        quoted = false;
                    } else if *byte == self.quote_key {
                        quoted = true;
                    } else if *byte == self.escape_key {
                        if !forward.is_empty() {
                            let chan = session.raw_channel()?;
                            chan.send_all(&forward).map_err(|e| anyhow::anyhow!("{e}"))?;
                        }
                        break 'outer RawOutcome::Escape;
                    } else {
                        forward.push(*byte);
                    }
                }
                if quoted {
                    // a trailing quote key with no follower: send it
                    // through as itself
                    forward.push(self.quote_key);
                }
                if !forward.is_empty() {
                    let chan = session.raw_channel()?;
                    chan.send_all(&forward).map_err(|e| anyhow::anyhow!("{e}"))?;
                }
            }

            // channel -> screen
            let chan = session.raw_channel()?;
            chan.set_nonblocking(true).map_err(|e| anyhow::anyhow!("{e}"))?;
            match chan.recv(consts::BUF_SIZE) {
                Ok(chunk) => {
                    stdout.write_all(&chunk)?;
                    stdout.flush()?;
                    if let Some(scanner) = complete_scanner.as_mut() {
                        if scanner.scan(&chunk).is_some() {
                            break 'outer RawOutcome::Completed;
                        }
                    }
                }
                Err(Error::Blocked) => {}
                Err(Error::Eof) => break 'outer RawOutcome::Closed,
                Err(Error::Transport(_)) => break 'outer RawOutcome::Closed,
                Err(e) => return Err(anyhow::anyhow!("raw read: {e}")),
            }
        };
        drop(tty_guard);

        if let Ok(chan) = session.raw_channel() {
            let _ = chan.set_nonblocking(false);
        }
        if outcome != RawOutcome::Closed {
            session.leave_raw().context("leaving raw mode")?;
            if sigwinch.load(Ordering::Relaxed) {
                let size = tty::Size::local();
                if let Err(e) = session.set_tty_size(&size) {
                    warn!("syncing tty size: {}", e);
                }
            }
        }

        Ok(outcome)
    }

    //
    // the COMMAND state
    //

    fn handle_command(&mut self, line: &str) -> anyhow::Result<LoopAction> {
        let words = shell_words::split(line).context("parsing command line")?;
        let Some(command) = words.first().map(String::as_str) else {
            return Ok(LoopAction::Stay);
        };

        match command {
            "help" => {
                println!("sessions | use <id> | back | close [id] | run <module> [k=v ...]");
                println!("modules | search <glob> | listen <spec> | listeners | stop-listener <id>");
                println!("upload <local> <remote> | download <remote> <local> | exit");
                Ok(LoopAction::Stay)
            }
            "sessions" => {
                for (id, session) in self.sessions.iter() {
                    let session = session.lock().unwrap();
                    let marker = if Some(*id) == self.current { "*" } else { " " };
                    println!(
                        "{} {:>3}  {}:{}  {}  {}",
                        marker,
                        id,
                        session.host(),
                        session.port(),
                        session.platform_kind(),
                        session
                            .current_user()
                            .map(|(_, name)| name.as_str())
                            .unwrap_or("?"),
                    );
                }
                Ok(LoopAction::Stay)
            }
            "use" => {
                let id: usize = words
                    .get(1)
                    .and_then(|w| w.parse().ok())
                    .ok_or_else(|| anyhow::anyhow!("usage: use <id>"))?;
                if !self.sessions.contains_key(&id) {
                    return Err(anyhow::anyhow!("no session {id}"));
                }
                self.current = Some(id);
                Ok(LoopAction::Stay)
            }
            "back" | "raw" => Ok(LoopAction::EnterRaw),
            "close" => {
                let id = match words.get(1) {
                    Some(word) => word.parse().context("parsing session id")?,
                    None => self.current.ok_or_else(|| anyhow::anyhow!("no current session"))?,
                };
                self.close_session(id)?;
                println!("closed session {id}");
                Ok(LoopAction::Stay)
            }
            "modules" => {
                for name in self.registry.names() {
                    println!("{name}");
                }
                Ok(LoopAction::Stay)
            }
            "search" => {
                let pattern = words.get(1).ok_or_else(|| anyhow::anyhow!("usage: search <glob>"))?;
                for name in self.registry.search(pattern).map_err(|e| anyhow::anyhow!("{e}"))? {
                    println!("{name}");
                }
                Ok(LoopAction::Stay)
            }
            "run" => {
                let name = words.get(1).ok_or_else(|| anyhow::anyhow!("usage: run <module> [k=v ...]"))?;
                let raw_args = parse_kv_args(&words[2..])?;
                let id = self.current.ok_or_else(|| anyhow::anyhow!("no current session"))?;
                let session = self.session(id).ok_or_else(|| anyhow::anyhow!("no session {id}"))?;
                let mut session = session.lock().unwrap();

                let results = self
                    .registry
                    .run(&mut session, name, &raw_args, &mut |status| {
                        eprintln!("[*] {status}");
                    })
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                for result in results {
                    match result.description() {
                        Some(description) => {
                            println!("[+] {}\n    {}", result.title(), description)
                        }
                        None => println!("[+] {}", result.title()),
                    }
                }
                Ok(LoopAction::Stay)
            }
            "listen" => {
                let spec = parse_listen_spec(&words[1..], &self.config)?;
                let id = self.start_listener(spec)?;
                println!("listener {id} started");
                Ok(LoopAction::Stay)
            }
            "listeners" => {
                for (id, listener) in self.listeners.iter() {
                    let spec = listener.spec();
                    println!(
                        "{:>3}  {}:{}  {:?}  established={} pending={}{}",
                        id,
                        spec.host,
                        spec.port,
                        listener.state(),
                        listener.established_count(),
                        listener.pending_len(),
                        listener
                            .error_message()
                            .map(|m| format!("  error={m}"))
                            .unwrap_or_default(),
                    );
                }
                Ok(LoopAction::Stay)
            }
            "stop-listener" => {
                let id: usize = words
                    .get(1)
                    .and_then(|w| w.parse().ok())
                    .ok_or_else(|| anyhow::anyhow!("usage: stop-listener <id>"))?;
                self.stop_listener(id)?;
                Ok(LoopAction::Stay)
            }
            "upload" => {
                let (local, remote) = match (words.get(1), words.get(2)) {
                    (Some(l), Some(r)) => (l.clone(), r.clone()),
                    _ => return Err(anyhow::anyhow!("usage: upload <local> <remote>")),
                };
                self.transfer(TransferDir::Upload, &local, &remote)?;
                Ok(LoopAction::Stay)
            }
            "download" => {
                let (remote, local) = match (words.get(1), words.get(2)) {
                    (Some(r), Some(l)) => (r.clone(), l.clone()),
                    _ => return Err(anyhow::anyhow!("usage: download <remote> <local>")),
                };
                self.transfer(TransferDir::Download, &local, &remote)?;
                Ok(LoopAction::Stay)
            }
            "exit" | "quit" => Ok(LoopAction::Exit),
            other => Err(anyhow::anyhow!("unknown command '{other}' (try help)")),
        }
    }

    fn transfer(&mut self, dir: TransferDir, local: &str, remote: &str) -> anyhow::Result<()> {
        let id = self.current.ok_or_else(|| anyhow::anyhow!("no current session"))?;
        let session = self.session(id).ok_or_else(|| anyhow::anyhow!("no session {id}"))?;
        let mut session = session.lock().unwrap();

        match dir {
            TransferDir::Upload => {
                let data = std::fs::read(local).with_context(|| format!("reading {local}"))?;
                let mut file = session
                    .open(remote, FileMode::Write, Some(data.len()))
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                let (platform, chan) =
                    session.platform_and_channel().map_err(|e| anyhow::anyhow!("{e}"))?;
                let crate::platform::Platform::Linux(linux) = platform else {
                    return Err(anyhow::anyhow!("upload is a linux-session command"));
                };
                linux.write_file(chan, &mut file, &data).map_err(|e| anyhow::anyhow!("{e}"))?;
                linux.close_file(chan, &mut file).map_err(|e| anyhow::anyhow!("{e}"))?;
                println!("uploaded {} bytes to {remote}", data.len());
            }
            TransferDir::Download => {
                let mut file = session
                    .open(remote, FileMode::Read, None)
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                let (platform, chan) =
                    session.platform_and_channel().map_err(|e| anyhow::anyhow!("{e}"))?;
                let crate::platform::Platform::Linux(linux) = platform else {
                    return Err(anyhow::anyhow!("download is a linux-session command"));
                };
                let data =
                    linux.read_file_to_end(chan, &mut file).map_err(|e| anyhow::anyhow!("{e}"))?;
                linux.close_file(chan, &mut file).map_err(|e| anyhow::anyhow!("{e}"))?;
                std::fs::write(local, &data).with_context(|| format!("writing {local}"))?;
                println!("downloaded {} bytes from {remote}", data.len());
            }
        }
        Ok(())
    }
}

enum TransferDir {
    Upload,
    Download,
}

/// Parse `key=value` words into the raw argument pairs the registry
/// validates.
fn parse_kv_args(words: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    words
        .iter()
        .map(|word| {
            word.split_once('=')
                .map(|(k, v)| (String::from(k), String::from(v)))
                .ok_or_else(|| anyhow::anyhow!("argument '{word}' is not of the form key=value"))
        })
        .collect()
}

/// Parse a `listen` command: an address followed by `key=value`
/// options, e.g. `listen :4444 platform=linux count=2 ssl=true`.
fn parse_listen_spec(words: &[String], config: &Config) -> anyhow::Result<ListenerSpec> {
    let addr = words.first().ok_or_else(|| anyhow::anyhow!("usage: listen <[host]:port> [k=v ...]"))?;
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("listen address must be [host]:port"))?;
    let port: u16 = port.parse().context("parsing listen port")?;
    let host = if host.is_empty() { String::from("0.0.0.0") } else { String::from(host) };

    let mut spec = ListenerSpec {
        host,
        port,
        ssl: false,
        ssl_cert: config.ssl_cert.clone().map(PathBuf::from),
        ssl_key: config.ssl_key.clone().map(PathBuf::from),
        platform_hint: None,
        count_limit: None,
        drop_duplicate: false,
    };

    for (key, value) in parse_kv_args(&words[1..])? {
        match key.as_str() {
            "ssl" => spec.ssl = value == "true" || value == "yes" || value == "1",
            "cert" => spec.ssl_cert = Some(PathBuf::from(value)),
            "key" => spec.ssl_key = Some(PathBuf::from(value)),
            "platform" => {
                spec.platform_hint = Some(match value.as_str() {
                    "linux" => PlatformKind::Linux,
                    "windows" => PlatformKind::Windows,
                    other => return Err(anyhow::anyhow!("unknown platform '{other}'")),
                })
            }
            "count" => spec.count_limit = Some(value.parse().context("parsing count")?),
            "drop-duplicate" => {
                spec.drop_duplicate = value == "true" || value == "yes" || value == "1"
            }
            other => return Err(anyhow::anyhow!("unknown listen option '{other}'")),
        }
    }

    Ok(spec)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        channel::test_support::ScriptedTransport,
        platform::{LinuxPlatform, Platform},
    };

    fn manager() -> Manager {
        Manager::new(Config::default(), None, None).expect("manager to build")
    }

    fn scripted_session(id: usize) -> Session {
        let chan = ScriptedTransport::channel(vec![]);
        Session::from_parts(id, chan, Platform::Linux(LinuxPlatform::for_test()))
    }

    #[test]
    fn session_ids_are_never_reused() {
        let mut manager = manager();

        let a = manager.session_ids.fetch_add(1, Ordering::SeqCst);
        let id_a = manager.adopt_session(scripted_session(a));
        manager.close_session(id_a).unwrap();

        let b = manager.session_ids.fetch_add(1, Ordering::SeqCst);
        let id_b = manager.adopt_session(scripted_session(b));
        assert_ne!(id_a, id_b);
        assert!(id_b > id_a);
    }

    #[test]
    fn current_follows_adoption_and_close() {
        let mut manager = manager();

        let a = manager.session_ids.fetch_add(1, Ordering::SeqCst);
        let id_a = manager.adopt_session(scripted_session(a));
        let b = manager.session_ids.fetch_add(1, Ordering::SeqCst);
        let id_b = manager.adopt_session(scripted_session(b));

        assert_eq!(manager.current(), Some(id_b));
        manager.close_session(id_b).unwrap();
        assert_eq!(manager.current(), Some(id_a));
        manager.close_session(id_a).unwrap();
        assert_eq!(manager.current(), None);
    }

    #[test]
    fn use_command_switches_current() -> anyhow::Result<()> {
        let mut manager = manager();
        let a = manager.session_ids.fetch_add(1, Ordering::SeqCst);
        let id_a = manager.adopt_session(scripted_session(a));
        let b = manager.session_ids.fetch_add(1, Ordering::SeqCst);
        let _id_b = manager.adopt_session(scripted_session(b));

        let action = manager.handle_command(&format!("use {id_a}"))?;
        assert_eq!(action, LoopAction::Stay);
        assert_eq!(manager.current(), Some(id_a));

        assert!(manager.handle_command("use 999").is_err());
        Ok(())
    }

    #[test]
    fn back_and_exit_actions() -> anyhow::Result<()> {
        let mut manager = manager();
        assert_eq!(manager.handle_command("back")?, LoopAction::EnterRaw);
        assert_eq!(manager.handle_command("exit")?, LoopAction::Exit);
        assert_eq!(manager.handle_command("")?, LoopAction::Stay);
        assert!(manager.handle_command("frobnicate").is_err());
        Ok(())
    }

    #[test]
    fn kv_args_parsing() {
        let words = vec![String::from("a=1"), String::from("b=x=y")];
        let pairs = parse_kv_args(&words).unwrap();
        assert_eq!(pairs[0], (String::from("a"), String::from("1")));
        assert_eq!(pairs[1], (String::from("b"), String::from("x=y")));

        assert!(parse_kv_args(&[String::from("novalue")]).is_err());
    }

    #[test]
    fn listen_spec_parsing() -> anyhow::Result<()> {
        let config = Config::default();
        let words: Vec<String> = vec![":4444", "platform=linux", "count=2", "drop-duplicate=true"]
            .into_iter()
            .map(String::from)
            .collect();
        let spec = parse_listen_spec(&words, &config)?;
        assert_eq!(spec.host, "0.0.0.0");
        assert_eq!(spec.port, 4444);
        assert_eq!(spec.platform_hint, Some(PlatformKind::Linux));
        assert_eq!(spec.count_limit, Some(2));
        assert!(spec.drop_duplicate);
        assert!(!spec.ssl);

        let words: Vec<String> = vec!["127.0.0.1:9001", "ssl=true", "cert=/tmp/c.pem"]
            .into_iter()
            .map(String::from)
            .collect();
        let spec = parse_listen_spec(&words, &config)?;
        assert_eq!(spec.host, "127.0.0.1");
        assert!(spec.ssl);
        assert_eq!(spec.ssl_cert, Some(PathBuf::from("/tmp/c.pem")));
        Ok(())
    }

    #[test]
    fn escape_and_quote_keys_must_differ() {
        let config = Config {
            escape_key: Some(String::from("Ctrl-d")),
            quote_key: Some(String::from("Ctrl-d")),
            ..Default::default()
        };
        assert!(Manager::new(config, None, None).is_err());
    }
}
