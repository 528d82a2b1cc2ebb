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

/// pincer takes a raw bind or reverse shell on a compromised host and
/// stabilizes it into an interactive, programmable, multi-session
/// post-exploitation framework.
use clap::Parser;

fn main() {
    let args = libpincer::Args::parse();

    if let Err(err) = libpincer::run(args) {
        eprintln!("pincer: {err:#}");
        // usage errors exit 2, connection and runtime failures exit 1
        let code = if err.is::<libpincer::UsageError>() { 2 } else { 1 };
        std::process::exit(code);
    }
}
