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

use std::io::{self, BufRead, Read, Write};

use anyhow::{anyhow, Context};
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The literal line stage two prints once it has finished loading and
/// is ready to accept method invocations.
pub const READY_SENTINEL: &str = "READY";

/// The literal marker line stage two prints when an interactive ConPTY
/// pass-through finishes, returning the stream to request/response mode.
pub const INTERACTIVE_COMPLETE: &str = "INTERACTIVE_COMPLETE";

/// Well known stage-two classes and methods. Plugins expose the same
/// ABI under their own class name.
pub mod methods {
    pub const CORE_CLASS: &str = "Pincer";
    pub const PLUGIN_CLASS: &str = "Plugin";

    pub const PROCESS: &str = "process";
    pub const PPOLL: &str = "ppoll";
    pub const KILL: &str = "kill";
    pub const OPEN: &str = "open";
    pub const READ: &str = "read";
    pub const WRITE: &str = "write";
    pub const CLOSE: &str = "close";
    pub const POWERSHELL: &str = "powershell";
    pub const CSHARP: &str = "csharp";
    pub const INTERACTIVE: &str = "interactive";
    pub const DOTNET_LOAD: &str = "dotnet_load";
    pub const GETUID: &str = "getuid";
    pub const MACHINE_GUID: &str = "machine_guid";
}

/// A single static method invocation on the stage-two agent.
///
/// On the wire, a request is one line of UTF-8 JSON holding an array
/// of the form `["ClassName", "method_name", arg1, arg2, ...]`,
/// newline terminated. We model it as a struct and flatten down to
/// the array form at the framing layer rather than deriving serde
/// traits because the array encoding mixes heterogenous positional
/// fields in a way derive can't express.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub class: String,
    pub method: String,
    pub args: Vec<Value>,
}

impl Request {
    pub fn new<C: Into<String>, M: Into<String>>(class: C, method: M, args: Vec<Value>) -> Self {
        Request { class: class.into(), method: method.into(), args }
    }

    /// Render the single-line wire form, including the trailing newline.
    pub fn to_line(&self) -> anyhow::Result<Vec<u8>> {
        let mut arr = Vec::with_capacity(self.args.len() + 2);
        arr.push(Value::String(self.class.clone()));
        arr.push(Value::String(self.method.clone()));
        arr.extend(self.args.iter().cloned());

        let mut line = serde_json::to_vec(&Value::Array(arr)).context("encoding request")?;
        if line.contains(&b'\n') {
            // A literal newline inside the payload would terminate the
            // frame early on the remote side.
            return Err(anyhow!("request contains an embedded newline"));
        }
        line.push(b'\n');
        Ok(line)
    }

    /// Parse the wire form. The inverse of `to_line`, used by tests and
    /// by anything that wants to proxy a stage-two conversation.
    pub fn from_line(line: &str) -> anyhow::Result<Self> {
        let arr: Vec<Value> = serde_json::from_str(line.trim_end()).context("parsing request")?;
        if arr.len() < 2 {
            return Err(anyhow!("request array has {} elements, want at least 2", arr.len()));
        }
        let class = arr[0]
            .as_str()
            .ok_or_else(|| anyhow!("request class is not a string"))?
            .to_string();
        let method = arr[1]
            .as_str()
            .ok_or_else(|| anyhow!("request method is not a string"))?
            .to_string();
        Ok(Request { class, method, args: arr[2..].to_vec() })
    }
}

/// The stage-two reply to a single `Request`: one line of JSON holding
/// an object with an integer `error`, an arbitrary `result`, and an
/// optional human readable `message`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    #[serde(default)]
    pub error: i32,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn from_line(line: &str) -> anyhow::Result<Self> {
        serde_json::from_str(line.trim_end()).context("parsing response")
    }

    pub fn to_line(&self) -> anyhow::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self).context("encoding response")?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Classification of stage-two error codes. The agent reports raw
/// win32 error numbers; we only distinguish the ones callers branch on.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ErrorClass {
    Ok,
    NotFound,
    AccessDenied,
    Other,
}

impl From<i32> for ErrorClass {
    fn from(code: i32) -> Self {
        // ERROR_FILE_NOT_FOUND / ERROR_PATH_NOT_FOUND / ERROR_ACCESS_DENIED
        match code {
            0 => ErrorClass::Ok,
            2 | 3 => ErrorClass::NotFound,
            5 => ErrorClass::AccessDenied,
            _ => ErrorClass::Other,
        }
    }
}

/// Reads and writes the raw byte window used for binary file transfer.
///
/// Bulk reads and writes travel between two JSON envelopes as a little
/// endian 4 byte length prefix followed by exactly that many raw bytes,
/// so binary content never has to round trip through JSON strings.
///
/// format:
///
/// ```text
/// little endian 4 byte word: length prefix
/// N bytes: data
/// ```
pub struct BinaryWindow;

impl BinaryWindow {
    pub fn write_to<W: Write>(w: &mut W, buf: &[u8]) -> io::Result<()> {
        w.write_u32::<LittleEndian>(buf.len() as u32)?;
        w.write_all(buf)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R, limit: usize) -> anyhow::Result<Vec<u8>> {
        let len = r.read_u32::<LittleEndian>().context("reading window length")? as usize;
        if len > limit {
            return Err(anyhow!("binary window of {} bytes exceeds limit of {}", len, limit));
        }
        let mut buf = vec![0; len];
        r.read_exact(&mut buf).context("reading window body")?;
        Ok(buf)
    }
}

/// Read one newline-terminated line from the given buffered reader,
/// without the terminator. Errors on EOF, since the stage-two stream
/// going away mid-conversation is always a protocol failure.
pub fn read_line<R: BufRead>(r: &mut R) -> anyhow::Result<String> {
    let mut line = String::new();
    let n = r.read_line(&mut line).context("reading protocol line")?;
    if n == 0 {
        return Err(anyhow!("unexpected eof on protocol stream"));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_round_trip() -> anyhow::Result<()> {
        let cases = vec![
            Request::new("Pincer", "process", vec![Value::String(String::from("whoami")), 1.into()]),
            Request::new("Pincer", "ppoll", vec![]),
            Request::new(
                "Plugin",
                "run",
                vec![Value::Array(vec![1.into(), 2.into()]), Value::Null],
            ),
        ];

        for req in cases {
            let line = req.to_line()?;
            let parsed = Request::from_line(std::str::from_utf8(&line)?)?;
            assert_eq!(req, parsed);
        }

        Ok(())
    }

    #[test]
    fn request_rejects_short_arrays() {
        let cases = vec!["[]", "[\"Pincer\"]", "[1, 2]"];
        for case in cases {
            assert!(Request::from_line(case).is_err());
        }
    }

    #[test]
    fn response_round_trip() -> anyhow::Result<()> {
        let cases = vec![
            Response { error: 0, result: Value::String(String::from("ok")), message: None },
            Response { error: 5, result: Value::Null, message: Some(String::from("denied")) },
        ];

        for resp in cases {
            let line = resp.to_line()?;
            let parsed = Response::from_line(std::str::from_utf8(&line)?)?;
            assert_eq!(resp, parsed);
        }

        Ok(())
    }

    #[test]
    fn error_classes() {
        let cases = vec![
            (0, ErrorClass::Ok),
            (2, ErrorClass::NotFound),
            (3, ErrorClass::NotFound),
            (5, ErrorClass::AccessDenied),
            (87, ErrorClass::Other),
        ];
        for (code, want) in cases {
            assert_eq!(ErrorClass::from(code), want);
        }
    }

    #[test]
    fn binary_window_round_trip() -> anyhow::Result<()> {
        let cases: Vec<Vec<u8>> = vec![vec![], vec![0], vec![1, 0, 255, 0, 42]];

        for data in cases {
            let mut cursor = io::Cursor::new(vec![]);
            BinaryWindow::write_to(&mut cursor, &data)?;
            cursor.set_position(0);
            let got = BinaryWindow::read_from(&mut cursor, 1024)?;
            assert_eq!(got, data);
        }

        Ok(())
    }

    #[test]
    fn binary_window_respects_limit() {
        let mut cursor = io::Cursor::new(vec![]);
        BinaryWindow::write_to(&mut cursor, &[0; 64]).expect("write to succeed");
        cursor.set_position(0);
        assert!(BinaryWindow::read_from(&mut cursor, 16).is_err());
    }
}
