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

//! The Linux driver: turns an arbitrary inbound shell into a framed,
//! PTY-backed, programmatically addressable session.
//!
//! Every programmatic command is wrapped as
//!
//! ```text
//! echo <S>; <cmd>; echo <E> $?
//! ```
//!
//! with fresh random markers per command. The driver drives the channel
//! until it sees `<S>`, captures until `<E>`, then parses the status.
//! The markers are sent split in half with a quote boundary so the
//! shell's own echo of the command line can never satisfy the scanner;
//! the driver does not rely on echo suppression to locate frames.

use std::{collections::HashMap, thread, time};

use base64::Engine as _;
use sha2::Digest as _;
use tracing::{debug, info, instrument, warn};

use crate::{
    channel::Channel,
    config::Config,
    consts,
    error::{Error, Result},
    gtfo::{BuiltinSynthesizer, Capability, Stream, Synthesizer},
    marker::Marker,
    platform::{
        parse_groups, parse_passwd, render_command, ExecResult, FileMode, Group, ServiceOp, User,
    },
    tty,
};

/// Shells that exit on any stdin. Driving one would close the channel
/// the moment we probe, so we refuse the session instead.
const FORBIDDEN_SHELLS: &[&str] = &["nologin", "false", "sync", "git-shell"];

/// Shell dialects we know how to drive.
const KNOWN_SHELLS: &[&str] = &["bash", "zsh", "dash", "sh", "ash"];

/// How long to let a freshly spawned PTY settle before verifying it.
const PTY_SETTLE_DUR: time::Duration = time::Duration::from_millis(300);

/// Column width for base64 lines during encoded uploads.
const B64_LINE_WIDTH: usize = 76;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyMethod {
    ScriptUtilLinux,
    ScriptBsd,
    Python,
    Socat,
    None,
}

pub struct LinuxPlatform {
    shell_path: String,
    has_pty: bool,
    pty_method: PtyMethod,
    prompt_marker: Marker,
    cwd: String,
    current_user_id: Option<u32>,
    current_user_name: Option<String>,
    busybox_path: Option<String>,
    which_cache: HashMap<String, Option<String>>,
    normalize_status: bool,
    synthesizer: Box<dyn Synthesizer>,
    /// At most one process handle may have unread output on the shared
    /// channel; creating another while this is set is a protocol error.
    stream_bound: bool,
}

impl LinuxPlatform {
    /// Probe the remote shell, normalize the prompt, and upgrade to a
    /// PTY. The channel must carry a live shell when this is called.
    #[instrument(skip_all)]
    pub fn embark(chan: &mut Channel, config: &Config) -> Result<Self> {
        let mut platform = LinuxPlatform {
            shell_path: String::new(),
            has_pty: false,
            pty_method: PtyMethod::None,
            prompt_marker: Marker::prompt(),
            cwd: String::from("/"),
            current_user_id: None,
            current_user_name: None,
            busybox_path: None,
            which_cache: HashMap::new(),
            normalize_status: config.normalize_exit_status.unwrap_or(false),
            synthesizer: Box::new(BuiltinSynthesizer),
            stream_bound: false,
        };

        platform.probe(chan)?;
        platform.normalize_prompt(chan, config)?;
        platform.upgrade_pty(chan, config)?;
        platform.load_identity(chan)?;

        info!(
            "session embarked: shell={} pty={:?} user={:?}",
            platform.shell_path, platform.pty_method, platform.current_user_name
        );
        Ok(platform)
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        LinuxPlatform {
            shell_path: String::from("/bin/sh"),
            has_pty: true,
            pty_method: PtyMethod::ScriptUtilLinux,
            prompt_marker: Marker::prompt(),
            cwd: String::from("/"),
            current_user_id: Some(0),
            current_user_name: Some(String::from("root")),
            busybox_path: None,
            which_cache: HashMap::new(),
            normalize_status: false,
            synthesizer: Box::new(BuiltinSynthesizer),
            stream_bound: false,
        }
    }

    pub fn shell_path(&self) -> &str {
        &self.shell_path
    }

    pub fn has_pty(&self) -> bool {
        self.has_pty
    }

    pub fn pty_method(&self) -> PtyMethod {
        self.pty_method
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn prompt_marker(&self) -> &Marker {
        &self.prompt_marker
    }

    //
    // framed execution
    //

    /// Run a raw command line inside start/end markers and capture
    /// everything in between. This is the only supported way for
    /// modules to execute commands; raw pass-through never wraps.
    pub fn exec_framed(
        &mut self,
        chan: &mut Channel,
        cmd: &str,
        timeout: Option<time::Duration>,
    ) -> Result<ExecResult> {
        if self.stream_bound {
            return Err(Error::Busy("a process handle holds unread output on this channel"));
        }
        let timeout = timeout.or(Some(consts::DEFAULT_EXEC_TIMEOUT));

        let (start, end) = Marker::command_pair();
        // the leading space keeps the line out of any history that
        // survived prompt normalization
        let line = format!(
            " echo {}; {}; echo {} $?\n",
            start.shell_split(),
            cmd,
            end.shell_split()
        );
        chan.send_all(line.as_bytes())?;

        match self.collect_frame(chan, &start, &end, timeout) {
            Ok(result) => Ok(result),
            Err(Error::Timeout(dur)) => {
                // cancel whatever is wedged and resynchronize on the
                // end marker; failing that the channel is poisoned
                warn!("framed execution timed out, interrupting remote");
                self.interrupt(chan)?;
                match chan.recvuntil(end.as_bytes(), Some(consts::DEFAULT_EXEC_TIMEOUT)) {
                    Ok(_) => {
                        let _ = chan.recvuntil(b"\n", Some(consts::DEFAULT_EXEC_TIMEOUT));
                        Err(Error::Timeout(dur))
                    }
                    Err(_) => Err(Error::Protocol(String::from(
                        "channel poisoned: no end marker after interrupt",
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn collect_frame(
        &mut self,
        chan: &mut Channel,
        start: &Marker,
        end: &Marker,
        timeout: Option<time::Duration>,
    ) -> Result<ExecResult> {
        // everything up to the start marker is echo and prompt noise
        chan.recvuntil(start.as_bytes(), timeout)?;

        let mut stdout = chan.recvuntil(end.as_bytes(), timeout)?;
        stdout.truncate(stdout.len() - end.as_bytes().len());
        let stdout = trim_frame(stdout);

        let status_line = chan.recvuntil(b"\n", timeout)?;
        let status = parse_status(&status_line)?;
        let status = if self.normalize_status && status != 0 { 1 } else { status };

        Ok(ExecResult { stdout, status })
    }

    /// Run an argv with optional environment overrides.
    pub fn run(
        &mut self,
        chan: &mut Channel,
        argv: &[String],
        env: &[(String, String)],
        timeout: Option<time::Duration>,
    ) -> Result<ExecResult> {
        if argv.is_empty() {
            return Err(Error::Argument(String::from("empty argv")));
        }
        self.exec_framed(chan, &render_command(argv, env), timeout)
    }

    /// Start a process and return a handle whose stdout is a framed
    /// view over the shared channel.
    pub fn popen(
        &mut self,
        chan: &mut Channel,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<RemoteProcess> {
        if argv.is_empty() {
            return Err(Error::Argument(String::from("empty argv")));
        }
        self.spawn_framed(chan, &render_command(argv, env), None, true)
    }

    fn spawn_framed(
        &mut self,
        chan: &mut Channel,
        cmd: &str,
        exit_cmd: Option<Vec<u8>>,
        trim_tail: bool,
    ) -> Result<RemoteProcess> {
        if self.stream_bound {
            return Err(Error::Busy("a process handle holds unread output on this channel"));
        }

        let (start, end) = Marker::command_pair();
        let line = format!(
            " echo {}; {}; echo {} $?\n",
            start.shell_split(),
            cmd,
            end.shell_split()
        );
        chan.send_all(line.as_bytes())?;
        chan.recvuntil(start.as_bytes(), Some(consts::DEFAULT_EXEC_TIMEOUT))?;
        // drop the newline the start echo produced so the first read
        // returns process output only
        skip_line_break(chan)?;

        self.stream_bound = true;
        Ok(RemoteProcess {
            end_marker: end,
            exit_cmd,
            holdback: Vec::new(),
            status: None,
            done: false,
            trim_tail,
        })
    }

    /// Finish a process handle: drain any unread output, recover the
    /// exit status, and release the channel for framed execution.
    pub fn close_process(&mut self, chan: &mut Channel, proc: &mut RemoteProcess) -> Result<i32> {
        if let Some(exit_cmd) = proc.exit_cmd.take() {
            chan.send_all(&exit_cmd)?;
        }
        while !proc.done {
            let _ = proc.read(chan)?;
        }
        self.stream_bound = false;
        let status = proc.status.unwrap_or(-1);
        let status = if self.normalize_status && status != 0 { 1 } else { status };
        Ok(status)
    }

    //
    // files
    //

    /// Open a remote file. A known length selects raw transport when a
    /// raw-capable method exists; otherwise content is base64 encoded
    /// on the wire. Binary mode is implied by `length` being set.
    pub fn open(
        &mut self,
        chan: &mut Channel,
        path: &str,
        mode: FileMode,
        length: Option<usize>,
    ) -> Result<RemoteFile> {
        if self.stream_bound {
            return Err(Error::Busy("a process handle holds unread output on this channel"));
        }
        let quoted = shell_words::quote(path).into_owned();

        match mode {
            FileMode::Read => self.open_read(chan, path, &quoted, length),
            FileMode::Write => self.open_write(chan, path, &quoted, length),
            FileMode::ReadWrite => Err(Error::Argument(String::from(
                "read-write handles are not supported over a shell transport",
            ))),
        }
    }

    fn open_read(
        &mut self,
        chan: &mut Channel,
        path: &str,
        quoted: &str,
        length: Option<usize>,
    ) -> Result<RemoteFile> {
        let streams: &[Stream] = if length.is_some() {
            &[Stream::Raw, Stream::Base64]
        } else {
            &[Stream::Base64, Stream::Print]
        };
        let methods = self.synthesizer.iter_methods(Capability::READ, streams);
        let method = methods
            .first()
            .ok_or_else(|| Error::NotFound(String::from("no file read method available")))?;
        let raw = method.stream == Stream::Raw && length.is_some();

        let cmd = render_method(method, quoted, length);
        // raw content must come back byte-exact; only line-oriented
        // reads may have the frame's trailing newline stripped
        let proc = self.spawn_framed(chan, &cmd, None, !raw)?;
        Ok(RemoteFile {
            path: String::from(path),
            mode: FileMode::Read,
            binary: length.is_some(),
            length,
            encoding: if raw { Stream::Raw } else { Stream::Base64 },
            reader: Some(FileReader { proc, pending_b64: Vec::new(), decoded: Vec::new() }),
            writer: None,
            open: true,
        })
    }

    fn open_write(
        &mut self,
        chan: &mut Channel,
        path: &str,
        quoted: &str,
        length: Option<usize>,
    ) -> Result<RemoteFile> {
        let streams: &[Stream] = if length.is_some() {
            &[Stream::Raw, Stream::Base64]
        } else {
            // no length means we can't use a raw byte window; encoded
            // transport is forced
            &[Stream::Base64]
        };
        let methods = self.synthesizer.iter_methods(Capability::WRITE, streams);
        let method = methods
            .first()
            .ok_or_else(|| Error::NotFound(String::from("no file write method available")))?;
        let raw = method.stream == Stream::Raw && length.is_some();

        let end = Marker::random(consts::COMMAND_MARKER_BYTES);
        let eof_word = Marker::random(8);

        let payload = render_method(method, quoted, length);
        let line = if raw {
            format!(" {}; echo {}\n", payload, end.shell_split())
        } else {
            format!(" {} << '{}'; echo {}\n", payload, eof_word.as_str(), end.shell_split())
        };
        chan.send_all(line.as_bytes())?;

        self.stream_bound = true;
        Ok(RemoteFile {
            path: String::from(path),
            mode: FileMode::Write,
            binary: length.is_some(),
            length,
            encoding: if raw { Stream::Raw } else { Stream::Base64 },
            reader: None,
            writer: Some(FileWriter {
                end_marker: end,
                eof_word,
                raw,
                written: 0,
                carry: Vec::new(),
                column: 0,
            }),
            open: true,
        })
    }

    /// Close a file handle, draining its EOF marker from the channel.
    pub fn close_file(&mut self, chan: &mut Channel, file: &mut RemoteFile) -> Result<()> {
        if !file.open {
            return Ok(());
        }
        file.open = false;

        if let Some(mut reader) = file.reader.take() {
            while !reader.proc.done {
                let _ = reader.proc.read(chan)?;
            }
            self.stream_bound = false;
        }

        if let Some(writer) = file.writer.take() {
            if writer.raw {
                let expected = file.length.unwrap_or(0);
                if writer.written != expected {
                    // dd is still waiting on bytes that will never
                    // come; the stream is unrecoverable
                    self.stream_bound = false;
                    return Err(Error::Protocol(format!(
                        "short raw write: {} of {} bytes",
                        writer.written, expected
                    )));
                }
            } else {
                let mut tail = Vec::new();
                if !writer.carry.is_empty() {
                    let enc = base64::engine::general_purpose::STANDARD.encode(&writer.carry);
                    tail.extend_from_slice(enc.as_bytes());
                }
                tail.push(b'\n');
                tail.extend_from_slice(writer.eof_word.as_bytes());
                tail.push(b'\n');
                chan.send_all(&tail)?;
            }
            chan.recvuntil(writer.end_marker.as_bytes(), Some(consts::DEFAULT_EXEC_TIMEOUT))?;
            let _ = chan.recvuntil(b"\n", Some(consts::DEFAULT_EXEC_TIMEOUT));
            self.stream_bound = false;
        }

        Ok(())
    }

    /// Write through an open handle. Raw handles count bytes against
    /// the declared length; encoded handles stream base64 lines.
    pub fn write_file(
        &mut self,
        chan: &mut Channel,
        file: &mut RemoteFile,
        data: &[u8],
    ) -> Result<usize> {
        let writer = file
            .writer
            .as_mut()
            .ok_or_else(|| Error::Argument(String::from("file not open for writing")))?;

        if writer.raw {
            if let Some(length) = file.length {
                if writer.written + data.len() > length {
                    return Err(Error::Argument(format!(
                        "write beyond declared length of {length} bytes"
                    )));
                }
            }
            chan.send_all(data)?;
            writer.written += data.len();
            return Ok(data.len());
        }

        // stream base64: encode complete triples, carry the remainder
        let mut buf = std::mem::take(&mut writer.carry);
        buf.extend_from_slice(data);
        let keep = buf.len() % 3;
        let encode_len = buf.len() - keep;
        writer.carry = buf.split_off(encode_len);

        if encode_len > 0 {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&buf);
            let mut wire = Vec::with_capacity(encoded.len() + encoded.len() / B64_LINE_WIDTH + 1);
            for byte in encoded.bytes() {
                wire.push(byte);
                writer.column += 1;
                if writer.column == B64_LINE_WIDTH {
                    wire.push(b'\n');
                    writer.column = 0;
                }
            }
            chan.send_all(&wire)?;
        }
        writer.written += data.len();
        Ok(data.len())
    }

    /// Read from an open handle. Returns an empty buffer at EOF.
    pub fn read_file(&mut self, chan: &mut Channel, file: &mut RemoteFile) -> Result<Vec<u8>> {
        let reader = file
            .reader
            .as_mut()
            .ok_or_else(|| Error::Argument(String::from("file not open for reading")))?;

        if file.encoding == Stream::Raw {
            let out = reader.proc.read(chan)?;
            if reader.proc.done {
                self.stream_bound = false;
            }
            return Ok(out);
        }

        loop {
            if !reader.decoded.is_empty() {
                return Ok(std::mem::take(&mut reader.decoded));
            }
            let chunk = reader.proc.read(chan)?;
            let at_eof = reader.proc.done;

            reader
                .pending_b64
                .extend(chunk.into_iter().filter(|b| !b.is_ascii_whitespace()));
            let take = if at_eof {
                reader.pending_b64.len()
            } else {
                reader.pending_b64.len() - reader.pending_b64.len() % 4
            };
            if take > 0 {
                let quads: Vec<u8> = reader.pending_b64.drain(..take).collect();
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(&quads)
                    .map_err(|e| Error::Protocol(format!("bad base64 from remote: {e}")))?;
                reader.decoded.extend_from_slice(&decoded);
            }

            if at_eof {
                self.stream_bound = false;
                return Ok(std::mem::take(&mut reader.decoded));
            }
        }
    }

    /// Read an entire open handle to a buffer.
    pub fn read_file_to_end(&mut self, chan: &mut Channel, file: &mut RemoteFile) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read_file(chan, file)?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    //
    // enumeration primitives
    //

    /// Locate a binary, with a per-session cache. Falls back to a PATH
    /// walk when `command -v` is unavailable.
    pub fn which(&mut self, chan: &mut Channel, name: &str) -> Result<Option<String>> {
        if let Some(cached) = self.which_cache.get(name) {
            return Ok(cached.clone());
        }

        let quoted = shell_words::quote(name).into_owned();
        let result = self.exec_framed(chan, &format!("command -v {quoted}"), None)?;
        let path = if result.success() {
            let path = result.stdout_str().trim().to_string();
            if path.is_empty() { None } else { Some(path) }
        } else {
            // command -v unavailable (or binary missing): walk PATH
            let result = self.exec_framed(
                chan,
                &format!(
                    "IFS=:; for d in $PATH; do if [ -x \"$d/\"{quoted} ]; then echo \"$d/\"{quoted}; break; fi; done"
                ),
                None,
            )?;
            let path = result.stdout_str().trim().to_string();
            if path.is_empty() { None } else { Some(path) }
        };

        self.which_cache.insert(String::from(name), path.clone());
        Ok(path)
    }

    /// Locate busybox if the target has one; many stripped-down boxes
    /// only provide coreutils through it.
    pub fn busybox(&mut self, chan: &mut Channel) -> Result<Option<String>> {
        if self.busybox_path.is_none() {
            self.busybox_path = self.which(chan, "busybox")?;
        }
        Ok(self.busybox_path.clone())
    }

    pub fn current_user(&mut self, chan: &mut Channel) -> Result<(u32, String)> {
        if let (Some(id), Some(name)) = (self.current_user_id, self.current_user_name.clone()) {
            return Ok((id, name));
        }
        self.load_identity(chan)?;
        Ok((
            self.current_user_id.unwrap_or(u32::MAX),
            self.current_user_name.clone().unwrap_or_default(),
        ))
    }

    fn load_identity(&mut self, chan: &mut Channel) -> Result<()> {
        let result = self.exec_framed(chan, "id -u; id -un; pwd", None)?;
        let text = result.stdout_str();
        let mut lines = text.lines();
        self.current_user_id = lines.next().and_then(|l| l.trim().parse().ok());
        self.current_user_name = lines.next().map(|l| l.trim().to_string());
        if let Some(cwd) = lines.next() {
            self.cwd = cwd.trim().to_string();
        }
        Ok(())
    }

    pub fn users(&mut self, chan: &mut Channel) -> Result<Vec<User>> {
        let result = self.exec_framed(chan, "cat /etc/passwd", None)?;
        if !result.success() {
            return Err(Error::Permission(String::from("could not read /etc/passwd")));
        }
        Ok(parse_passwd(&result.stdout_str()))
    }

    pub fn groups(&mut self, chan: &mut Channel) -> Result<Vec<Group>> {
        let result = self.exec_framed(chan, "cat /etc/group", None)?;
        if !result.success() {
            return Err(Error::Permission(String::from("could not read /etc/group")));
        }
        Ok(parse_groups(&result.stdout_str()))
    }

    /// SystemD introspection, where available.
    pub fn service(&mut self, chan: &mut Channel, name: &str, op: ServiceOp) -> Result<ExecResult> {
        if self.which(chan, "systemctl")?.is_none() {
            return Err(Error::NotFound(String::from("systemctl")));
        }
        let verb = match op {
            ServiceOp::Status => "is-active",
            ServiceOp::Start => "start",
            ServiceOp::Stop => "stop",
            ServiceOp::Restart => "restart",
        };
        let quoted = shell_words::quote(name).into_owned();
        self.exec_framed(chan, &format!("systemctl {verb} {quoted}"), None)
    }

    /// Stable identity: distribution + kernel + the MAC address set,
    /// hashed down to 32 hex characters.
    pub fn host_id(&mut self, chan: &mut Channel) -> Result<String> {
        let result = self.exec_framed(
            chan,
            "cat /sys/class/net/*/address 2>/dev/null | sort; uname -sr; \
             grep ^ID= /etc/os-release 2>/dev/null",
            None,
        )?;
        if result.stdout.is_empty() {
            return Err(Error::Platform(String::from("no identity material enumerated")));
        }
        let digest = sha2::Sha256::digest(&result.stdout);
        Ok(hex::encode(&digest[..16]))
    }

    pub fn interrupt(&mut self, chan: &mut Channel) -> Result<()> {
        // ETX: Ctrl-C on the remote PTY
        chan.send_all(&[0x03])
    }

    pub fn set_tty_size(&mut self, chan: &mut Channel, size: &tty::Size) -> Result<()> {
        self.exec_framed(chan, &format!("stty rows {} cols {}", size.rows, size.cols), None)?;
        Ok(())
    }

    //
    // session bring-up
    //

    #[instrument(skip_all)]
    fn probe(&mut self, chan: &mut Channel) -> Result<()> {
        // a no-op newline flushes any pending banner or prompt
        chan.send_all(b"\n")?;
        thread::sleep(time::Duration::from_millis(100));
        chan.drain()?;

        let result = self.exec_framed(
            chan,
            "readlink /proc/$$/exe 2>/dev/null || echo $0",
            Some(consts::DEFAULT_EXEC_TIMEOUT),
        )?;
        let path = result.stdout_str().trim().trim_start_matches('-').to_string();
        let name = path.rsplit('/').next().unwrap_or(path.as_str()).to_string();

        if FORBIDDEN_SHELLS.contains(&name.as_str()) {
            // these exit on any stdin; continuing would close the
            // channel out from under us
            return Err(Error::Platform(format!("remote shell is {name}, refusing to drive it")));
        }
        if !KNOWN_SHELLS.contains(&name.as_str()) {
            warn!("unrecognized shell dialect '{}', proceeding anyway", name);
        }

        self.shell_path = if path.starts_with('/') { path } else { format!("/bin/{name}") };
        debug!("probed remote shell: {}", self.shell_path);
        Ok(())
    }

    #[instrument(skip_all)]
    fn normalize_prompt(&mut self, chan: &mut Channel, config: &Config) -> Result<()> {
        let term = std::env::var("TERM").unwrap_or_else(|_| String::from("xterm"));
        let mut exports = format!(
            "export HISTFILE=/dev/null HISTSIZE=0 HISTCONTROL=ignorespace TERM={}",
            shell_words::quote(&term)
        );
        if let Some(env) = &config.env {
            for (key, value) in env.iter() {
                exports.push_str(&format!(" {}={}", key, shell_words::quote(value)));
            }
        }
        self.exec_framed(chan, &exports, None)?;

        // a visually distinct prompt carrying the invisible marker the
        // driver scans for
        let ps1 = format!("{}(remote) $ ", self.prompt_marker.prompt_embedding());
        self.exec_framed(chan, &format!("export PS1='{ps1}'"), None)?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn upgrade_pty(&mut self, chan: &mut Channel, config: &Config) -> Result<()> {
        if self.check_pty(chan)? {
            // SSH channels arrive with a server-allocated PTY; nothing
            // to do but skip the ladder
            info!("remote already has a pty");
            self.has_pty = true;
            self.pty_method = PtyMethod::None;
            self.finish_pty_setup(chan, config)?;
            return Ok(());
        }

        let shell = self.shell_path.clone();
        let quoted_shell = shell_words::quote(&shell).into_owned();
        let ladder: Vec<(PtyMethod, &str, String)> = vec![
            (
                PtyMethod::ScriptUtilLinux,
                "script",
                format!("script -qc {quoted_shell} /dev/null"),
            ),
            (PtyMethod::ScriptBsd, "script", format!("script -q /dev/null {quoted_shell}")),
            (
                PtyMethod::Python,
                "python3",
                format!("python3 -c 'import pty; pty.spawn(\"{shell}\")'"),
            ),
            (
                PtyMethod::Python,
                "python",
                format!("python -c 'import pty; pty.spawn(\"{shell}\")'"),
            ),
            (
                PtyMethod::Socat,
                "socat",
                format!("socat exec:{quoted_shell},pty,stderr,setsid,sigint,sane -"),
            ),
        ];

        for (method, binary, spawn) in ladder {
            if self.which(chan, binary)?.is_none() {
                debug!("pty method {:?}: no {}", method, binary);
                continue;
            }

            info!("attempting pty upgrade via {:?}", method);
            chan.send_all(format!(" {spawn}\n").as_bytes())?;
            thread::sleep(PTY_SETTLE_DUR);
            chan.drain()?;

            match self.check_pty(chan) {
                Ok(true) => {
                    self.has_pty = true;
                    self.pty_method = method;
                    // the spawned shell is fresh: prompt setup must be
                    // redone inside it
                    self.normalize_prompt(chan, config)?;
                    self.finish_pty_setup(chan, config)?;
                    info!("pty established via {:?}", method);
                    return Ok(());
                }
                Ok(false) => {
                    debug!("pty method {:?} did not produce a tty", method);
                    chan.drain()?;
                }
                Err(Error::Timeout(_)) => {
                    debug!("pty method {:?} wedged, draining", method);
                    chan.drain()?;
                }
                Err(e) => return Err(e),
            }
        }

        warn!("all pty upgrade methods failed, continuing without a pty");
        self.has_pty = false;
        self.pty_method = PtyMethod::None;
        Ok(())
    }

    fn check_pty(&mut self, chan: &mut Channel) -> Result<bool> {
        let result = self.exec_framed(chan, "tty", Some(consts::PTY_UPGRADE_TIMEOUT))?;
        Ok(result.success() && result.stdout_str().trim_start().starts_with("/dev/"))
    }

    fn finish_pty_setup(&mut self, chan: &mut Channel, _config: &Config) -> Result<()> {
        self.exec_framed(chan, "stty raw -echo", None)?;
        let size = tty::Size::local();
        self.set_tty_size(chan, &size)?;
        Ok(())
    }
}

/// A running remote process bounded by framing delimiters. Its stdout
/// is a view over the shared channel that ends at the end marker;
/// stdin writes go straight through to the remote tty.
#[derive(Debug)]
pub struct RemoteProcess {
    end_marker: Marker,
    exit_cmd: Option<Vec<u8>>,
    /// Tail bytes withheld from the caller because they could be a
    /// prefix of the end marker.
    holdback: Vec<u8>,
    status: Option<i32>,
    done: bool,
    /// Strip the line break separating the last output line from the
    /// end-marker echo. Wanted for command output, fatal for raw byte
    /// windows where a trailing newline belongs to the content.
    trim_tail: bool,
}

impl RemoteProcess {
    /// Read a chunk of process output. Returns an empty buffer once
    /// the end marker has been consumed.
    pub fn read(&mut self, chan: &mut Channel) -> Result<Vec<u8>> {
        if self.done {
            return Ok(vec![]);
        }

        loop {
            let chunk = chan.recv(consts::BUF_SIZE)?;
            self.holdback.extend_from_slice(&chunk);

            if let Some(ix) = find_subsequence(&self.holdback, self.end_marker.as_bytes()) {
                let after = self.holdback.split_off(ix + self.end_marker.as_bytes().len());
                self.holdback.truncate(ix);
                let tail = std::mem::take(&mut self.holdback);
                let out = if self.trim_tail { trim_frame_end(tail) } else { tail };

                // hand the tail back, then pull the status off the line
                chan.unread(&after);
                let status_line = chan.recvuntil(b"\n", Some(consts::DEFAULT_EXEC_TIMEOUT))?;
                self.status = Some(parse_status(&status_line)?);
                self.done = true;
                return Ok(out);
            }

            // release all but a potential marker prefix
            let marker_len = self.end_marker.as_bytes().len();
            if self.holdback.len() >= marker_len {
                let release = self.holdback.len() - (marker_len - 1);
                let out: Vec<u8> = self.holdback.drain(..release).collect();
                if !out.is_empty() {
                    return Ok(out);
                }
            }
        }
    }

    /// Send bytes to the process stdin.
    pub fn write(&mut self, chan: &mut Channel, data: &[u8]) -> Result<()> {
        if self.done {
            return Err(Error::Eof);
        }
        chan.send_all(data)
    }

    /// Drain to completion and return the exit status.
    pub fn wait(&mut self, chan: &mut Channel) -> Result<i32> {
        while !self.done {
            let _ = self.read(chan)?;
        }
        Ok(self.status.unwrap_or(-1))
    }

    pub fn exited(&self) -> bool {
        self.done
    }

    pub fn status(&self) -> Option<i32> {
        self.status
    }
}

/// A remote file opened through the shell transport.
pub struct RemoteFile {
    pub path: String,
    pub mode: FileMode,
    pub binary: bool,
    pub length: Option<usize>,
    encoding: Stream,
    reader: Option<FileReader>,
    writer: Option<FileWriter>,
    open: bool,
}

impl RemoteFile {
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn encoding(&self) -> Stream {
        self.encoding
    }
}

struct FileReader {
    proc: RemoteProcess,
    pending_b64: Vec<u8>,
    decoded: Vec<u8>,
}

struct FileWriter {
    end_marker: Marker,
    eof_word: Marker,
    raw: bool,
    written: usize,
    carry: Vec<u8>,
    column: usize,
}

/// Instantiate a synthesizer method template for a concrete path and
/// length. The builtin templates only use these two placeholders plus
/// the binary's own name.
fn render_method(method: &crate::gtfo::MethodSpec, quoted_path: &str, length: Option<usize>) -> String {
    method
        .payload
        .replace("{binary}", method.binary)
        .replace("{path}", quoted_path)
        .replace("{length}", &length.unwrap_or(0).to_string())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Strip the line breaks that the start and end echos introduce around
/// a frame's real output.
fn trim_frame(out: Vec<u8>) -> Vec<u8> {
    trim_frame_end(trim_frame_start(out))
}

fn trim_frame_start(mut out: Vec<u8>) -> Vec<u8> {
    let skip = if out.starts_with(b"\r\n") {
        2
    } else if out.starts_with(b"\n") || out.starts_with(b"\r") {
        1
    } else {
        0
    };
    out.drain(..skip);
    out
}

fn trim_frame_end(mut out: Vec<u8>) -> Vec<u8> {
    if out.ends_with(b"\n") {
        out.pop();
    }
    if out.ends_with(b"\r") {
        out.pop();
    }
    out
}

/// Pull one line break off the channel if present.
fn skip_line_break(chan: &mut Channel) -> Result<()> {
    match chan.peek(2) {
        Ok(bytes) if bytes.starts_with(b"\r\n") => {
            let _ = chan.recv(2)?;
        }
        Ok(bytes) if bytes.first() == Some(&b'\n') || bytes.first() == Some(&b'\r') => {
            let _ = chan.recv(1)?;
        }
        _ => {}
    }
    Ok(())
}

fn parse_status(line: &[u8]) -> Result<i32> {
    let text = String::from_utf8_lossy(line);
    text.trim()
        .split_whitespace()
        .next_back()
        .and_then(|tok| tok.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("malformed status line '{}'", text.trim())))
}
