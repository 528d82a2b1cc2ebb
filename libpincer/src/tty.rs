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

use std::{
    io,
    os::unix::io::{AsRawFd, RawFd},
};

use anyhow::Context;
use nix::{
    sys::{
        termios,
        termios::{ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg},
    },
    unistd::isatty,
};
use serde_derive::{Deserialize, Serialize};
use tracing::error;

// see `man ioctl_tty` for info on these ioctl commands
nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
}

impl Size {
    /// from_fd returns the terminal size for the given terminal.
    pub fn from_fd(fd: RawFd) -> anyhow::Result<Size> {
        let mut term_size = libc::winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };

        // Saftey: term_size is stack allocated and live for the whole
        //         call.
        unsafe {
            tiocgwinsz(fd, &mut term_size).context("fetching term size")?;
        }

        Ok(Size { rows: term_size.ws_row, cols: term_size.ws_col })
    }

    /// The size of the controlling terminal, falling back to COLUMNS
    /// and ROWS from the environment, then to 80x24, when stdin is not
    /// a tty.
    pub fn local() -> Size {
        if let Ok(size) = Size::from_fd(crate::consts::STDIN_FD) {
            return size;
        }
        let parse = |var: &str| std::env::var(var).ok().and_then(|v| v.parse::<u16>().ok());
        Size { rows: parse("ROWS").unwrap_or(24), cols: parse("COLUMNS").unwrap_or(80) }
    }
}

/// Put the local terminal into raw mode for the duration of a raw
/// pass-through, restoring the old flags on drop. The remote terminal
/// is the one that applies all the line discipline; locally we just
/// want each keystroke immediately and unmodified.
pub fn set_raw_flags() -> anyhow::Result<RawFlagsGuard> {
    let fd = 0;

    if !isatty(io::stdin().as_raw_fd())? || !isatty(io::stdout().as_raw_fd())? {
        // We are not attached to a terminal, so don't futz with its flags.
        return Ok(RawFlagsGuard { fd, old: None });
    }

    // grab settings from the stdin terminal
    let old = termios::tcgetattr(fd).context("grabbing term flags")?;

    let mut new = old.clone();
    new.input_flags &= !(InputFlags::IGNBRK
        | InputFlags::BRKINT
        | InputFlags::PARMRK
        | InputFlags::ISTRIP
        | InputFlags::INLCR
        | InputFlags::IGNCR
        | InputFlags::ICRNL
        | InputFlags::IXON);
    new.output_flags &= !OutputFlags::OPOST;
    new.local_flags &= !(LocalFlags::ECHO
        | LocalFlags::ECHONL
        | LocalFlags::ICANON
        | LocalFlags::ISIG
        | LocalFlags::IEXTEN);
    new.control_flags &= !(ControlFlags::CSIZE | ControlFlags::PARENB);
    new.control_flags |= ControlFlags::CS8;
    termios::tcsetattr(fd, SetArg::TCSANOW, &new)?;

    Ok(RawFlagsGuard { fd, old: Some(old) })
}

pub struct RawFlagsGuard {
    fd: RawFd,
    old: Option<termios::Termios>,
}

impl std::ops::Drop for RawFlagsGuard {
    fn drop(&mut self) {
        if let Some(old) = &self.old {
            if let Err(e) = termios::tcsetattr(self.fd, SetArg::TCSANOW, old) {
                error!("error restoring terminal settings: {:?}", e);
            }
        }
    }
}
