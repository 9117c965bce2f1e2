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
/// netlogind is a privilege-separated login daemon kept deliberately
/// small: it exists to demonstrate the correct order of operations
/// for moving a root process into a user's security context, not to
/// be logged into. Run it with no flags to serve, with --client to
/// dial in.
use clap::Parser;

fn main() -> anyhow::Result<()> {
    let args = libnetlogind::Args::parse();

    // The stock binary ships no authentication back end; a wrapping
    // binary can inject a PAM (or other) adapter here.
    libnetlogind::run(args, None)
}
