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

use std::path::PathBuf;

use anyhow::{bail, Context};
use nix::{
    sys::signal::{self, SigHandler, Signal},
    unistd::Uid,
};
use tracing::{info, instrument};

use crate::{auth, config, platform, Args};

mod broker;
mod creds;
mod listener;
mod signals;
mod worker;

#[instrument(skip_all)]
pub fn run(
    args: &Args,
    config: config::Config,
    auth: Option<Box<dyn auth::Adapter + Send>>,
    socket: PathBuf,
) -> anyhow::Result<()> {
    // Every credential operation below assumes full root; a partial
    // identity would fail half way through a transition instead.
    if !Uid::current().is_root() || !Uid::effective().is_root() {
        bail!("daemon must run as root");
    }

    // A vanished peer surfaces as an io error at the write site, not
    // as a process-wide signal. Command children restore the default
    // disposition before exec.
    // Safety: SigIgn installs no handler code.
    unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("ignoring SIGPIPE")?;

    let auth = if args.noauth { None } else { auth };
    if auth.is_none() {
        info!("no auth back end, sessions will skip authentication");
    }

    listener::ensure_not_running(&socket)?;

    if !args.debug {
        daemonize::Daemonize::new()
            .working_directory("/")
            .umask(0o077)
            .start()
            .context("daemonizing")?;
    }

    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    let listener = listener::Listener::bind(&socket)?;
    // spawn the signal handler thread in the background
    signals::Handler::new(socket.clone()).spawn()?;

    listener.serve(listener::ServeCtx {
        auth,
        debug: args.debug,
        auth_timeout: config.auth_timeout(),
        accept_throttle: config.accept_throttle(),
        platform: platform::Native,
    })
}
