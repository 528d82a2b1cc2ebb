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

//! Background listeners: each one owns an accept thread that pushes
//! inbound channels onto a pending queue. With a platform hint set,
//! every accepted channel is immediately promoted into a full session
//! (optionally dropping duplicates of targets we already hold); with
//! no hint, channels queue until explicitly promoted.

use std::{
    collections::HashSet,
    net::TcpListener,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
};

use tracing::{error, info, instrument, warn};

use crate::{
    channel::{build_acceptor, Channel, SslTransport, TcpTransport},
    config::Config,
    consts,
    platform::PlatformKind,
    session::Session,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Stopped,
    Failed,
}

/// What one listener should do, as assembled from the command line or
/// a `listen` command.
#[derive(Debug, Clone)]
pub struct ListenerSpec {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    /// Promote accepted channels into sessions of this platform
    /// immediately; with `None`, channels queue in `pending`.
    pub platform_hint: Option<PlatformKind>,
    /// Stop after this many sessions have been established.
    pub count_limit: Option<usize>,
    /// Drop fresh sessions whose identity is already in the table.
    pub drop_duplicate: bool,
}

/// Shared state the accept thread needs from the manager.
#[derive(Clone)]
pub struct ListenerCtx {
    pub config: Config,
    /// The manager-wide monotonic session id counter.
    pub session_ids: Arc<AtomicUsize>,
    /// Identity keys of all live sessions, for duplicate dropping.
    pub identities: Arc<Mutex<HashSet<String>>>,
    pub log_dir: Option<PathBuf>,
}

struct Shared {
    state: Mutex<StateInner>,
}

struct StateInner {
    state: State,
    error_message: Option<String>,
    pending: Vec<Channel>,
    established: Vec<Session>,
    established_count: usize,
}

pub struct Listener {
    pub id: usize,
    spec: ListenerSpec,
    shared: Arc<Shared>,
    stop_tx: crossbeam_channel::Sender<()>,
    join_h: Option<thread::JoinHandle<()>>,
    local_port: u16,
}

impl Listener {
    /// Bind the socket and spawn the accept thread.
    #[instrument(skip_all, fields(port = spec.port))]
    pub fn start(id: usize, spec: ListenerSpec, ctx: ListenerCtx) -> anyhow::Result<Listener> {
        use anyhow::Context as _;

        let socket = TcpListener::bind((spec.host.as_str(), spec.port))
            .with_context(|| format!("binding listener to {}:{}", spec.host, spec.port))?;
        socket.set_nonblocking(true).context("marking listener nonblocking")?;
        let local_port = socket.local_addr().context("reading bound address")?.port();

        let acceptor = if spec.ssl {
            let cert = spec
                .ssl_cert
                .clone()
                .or_else(|| ctx.config.ssl_cert.clone().map(PathBuf::from))
                .context("ssl listener requires a certificate")?;
            let key = spec.ssl_key.clone().or_else(|| ctx.config.ssl_key.clone().map(PathBuf::from));
            Some(
                build_acceptor(&cert, key.as_deref())
                    .map_err(|e| anyhow::anyhow!("building tls acceptor: {e}"))?,
            )
        } else {
            None
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(StateInner {
                state: State::Running,
                error_message: None,
                pending: vec![],
                established: vec![],
                established_count: 0,
            }),
        });
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);

        let thread_shared = Arc::clone(&shared);
        let thread_spec = spec.clone();
        let join_h = thread::Builder::new()
            .name(format!("listener({}:{})", spec.host, spec.port))
            .spawn(move || {
                accept_loop(socket, acceptor, thread_spec, ctx, thread_shared, stop_rx)
            })?;

        info!("listener {} started on {}:{}", id, spec.host, local_port);
        Ok(Listener { id, spec, shared, stop_tx, join_h: Some(join_h), local_port })
    }

    pub fn spec(&self) -> &ListenerSpec {
        &self.spec
    }

    /// The port actually bound; differs from the spec when the spec
    /// asked for an ephemeral port.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn state(&self) -> State {
        self.shared.state.lock().unwrap().state
    }

    pub fn error_message(&self) -> Option<String> {
        self.shared.state.lock().unwrap().error_message.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().unwrap().pending.len()
    }

    /// How many sessions this listener has established over its life.
    pub fn established_count(&self) -> usize {
        self.shared.state.lock().unwrap().established_count
    }

    /// Remove and return a queued channel for explicit promotion.
    pub fn take_pending(&self, ix: usize) -> Option<Channel> {
        let mut inner = self.shared.state.lock().unwrap();
        if ix < inner.pending.len() {
            Some(inner.pending.remove(ix))
        } else {
            None
        }
    }

    /// Move auto-promoted sessions out to the caller's session table.
    pub fn drain_established(&self) -> Vec<Session> {
        std::mem::take(&mut self.shared.state.lock().unwrap().established)
    }

    /// Record an externally promoted session against the count limit.
    pub fn note_established(&self) {
        let mut inner = self.shared.state.lock().unwrap();
        inner.established_count += 1;
        if let Some(limit) = self.spec.count_limit {
            if inner.established_count >= limit && inner.state == State::Running {
                inner.state = State::Stopped;
            }
        }
    }

    /// Stop accepting. Pending channels are closed.
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join_h) = self.join_h.take() {
            if join_h.join().is_err() {
                error!("listener thread panicked");
            }
        }
        let mut inner = self.shared.state.lock().unwrap();
        if inner.state == State::Running {
            inner.state = State::Stopped;
        }
        for mut chan in inner.pending.drain(..) {
            let _ = chan.close();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    socket: TcpListener,
    acceptor: Option<openssl::ssl::SslAcceptor>,
    spec: ListenerSpec,
    ctx: ListenerCtx,
    shared: Arc<Shared>,
    stop_rx: crossbeam_channel::Receiver<()>,
) {
    loop {
        if stop_rx.try_recv().is_ok() {
            info!("listener on {}:{} stopping", spec.host, spec.port);
            let mut inner = shared.state.lock().unwrap();
            if inner.state == State::Running {
                inner.state = State::Stopped;
            }
            return;
        }
        {
            let inner = shared.state.lock().unwrap();
            if inner.state != State::Running {
                return;
            }
        }

        let (stream, peer) = match socket.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(consts::ACCEPT_POLL_DUR);
                continue;
            }
            Err(e) => {
                error!("accept failed: {}", e);
                let mut inner = shared.state.lock().unwrap();
                inner.state = State::Failed;
                inner.error_message = Some(format!("accept: {e}"));
                return;
            }
        };
        info!("inbound connection from {}", peer);

        // handshakes and probing run on the accept thread; reverse
        // shells trickle in, they don't stampede
        if let Err(e) = stream.set_nonblocking(false) {
            warn!("marking accepted stream blocking: {}", e);
            continue;
        }
        let channel = match &acceptor {
            Some(acceptor) => match acceptor.accept(stream) {
                Ok(tls) => match SslTransport::from_stream(tls) {
                    Ok(chan) => chan,
                    Err(e) => {
                        warn!("wrapping tls stream: {}", e);
                        continue;
                    }
                },
                Err(e) => {
                    warn!("tls handshake with {} failed: {}", peer, e);
                    continue;
                }
            },
            None => match TcpTransport::from_stream(stream) {
                Ok(chan) => chan,
                Err(e) => {
                    warn!("wrapping tcp stream: {}", e);
                    continue;
                }
            },
        };

        match spec.platform_hint {
            Some(kind) => {
                promote(channel, kind, &spec, &ctx, &shared);
            }
            None => {
                let mut inner = shared.state.lock().unwrap();
                inner.pending.push(channel);
            }
        }

        if let Some(limit) = spec.count_limit {
            let mut inner = shared.state.lock().unwrap();
            if inner.established_count >= limit {
                info!("listener reached count limit of {}", limit);
                inner.state = State::Stopped;
                return;
            }
        }
    }
}

/// Run the full platform bring-up on a fresh channel and either stash
/// the session in `established` or drop it as a duplicate.
fn promote(
    channel: Channel,
    kind: PlatformKind,
    spec: &ListenerSpec,
    ctx: &ListenerCtx,
    shared: &Arc<Shared>,
) {
    let id = ctx.session_ids.fetch_add(1, Ordering::SeqCst);
    let mut session =
        match Session::establish(id, channel, kind, &ctx.config, ctx.log_dir.as_deref()) {
            Ok(session) => session,
            Err(e) => {
                warn!("promoting inbound channel failed: {:#}", e);
                return;
            }
        };

    let identity = session.identity_key(ctx.config.duplicate_key.unwrap_or_default());
    if spec.drop_duplicate {
        let identities = ctx.identities.lock().unwrap();
        if identities.contains(&identity) {
            info!("dropping duplicate session for {}", identity);
            drop(identities);
            let _ = session.close();
            return;
        }
    }
    ctx.identities.lock().unwrap().insert(identity);

    let mut inner = shared.state.lock().unwrap();
    inner.established.push(session);
    inner.established_count += 1;
}
