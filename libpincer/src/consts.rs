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

use std::time;

pub const BUF_SIZE: usize = 1024 * 16;

/// How long the interactive raw loop parks in poll before checking
/// for channel output and control flags again.
pub const RAW_POLL_DUR: time::Duration = time::Duration::from_millis(20);

/// How often listener accept threads wake up to check for a stop signal.
pub const ACCEPT_POLL_DUR: time::Duration = time::Duration::from_millis(100);

/// Default deadline for a single framed command. Most shell built-ins
/// answer in milliseconds, but an enumeration sweep on a loaded box can
/// take a while.
pub const DEFAULT_EXEC_TIMEOUT: time::Duration = time::Duration::from_secs(30);

/// Deadline for each individual PTY upgrade attempt. A method that has
/// not produced a live shell by then is considered a dud and we move on
/// down the ladder.
pub const PTY_UPGRADE_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Deadline for the stage-two agent to print its READY line after the
/// loader has been invoked.
pub const STAGE_TWO_TIMEOUT: time::Duration = time::Duration::from_secs(60);

pub const STDIN_FD: i32 = 0;

/// Length in bytes of the per-session prompt marker (rendered as hex,
/// so twice this many characters on the wire).
pub const PROMPT_MARKER_BYTES: usize = 32;

/// Length in bytes of each per-command framing marker (rendered as hex,
/// so twice this many characters on the wire).
pub const COMMAND_MARKER_BYTES: usize = 16;

/// Limit on a single binary transfer window from stage two. Matches
/// the window the agent itself will produce.
pub const BINARY_WINDOW_LIMIT: usize = 8 * 1024 * 1024;

/// Overrides the search path for stage binaries and plugins.
pub const PLUGIN_PATH_VAR: &str = "PINCER_PLUGIN_PATH";

/// Filenames of the two Windows stage binaries within the plugin dir.
pub const STAGE_ONE_FILE: &str = "stage1.exe";
pub const STAGE_TWO_FILE: &str = "stage2.dll";

/// Name of the lock file guarding the persisted target store.
pub const STORE_LOCK_FILE: &str = "store.lock";
