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

use std::{path::PathBuf, thread};

use anyhow::Context;
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};
use tracing::{error, info};

/// Cleans up the listening socket when the listener is told to quit.
/// Only the listener runs one of these; brokers and workers tear down
/// through their own exit paths.
pub struct Handler {
    sock: PathBuf,
}

impl Handler {
    pub fn new(sock: PathBuf) -> Self {
        Handler { sock }
    }

    pub fn spawn(self) -> anyhow::Result<()> {
        info!("spawning signal handler thread");

        let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;
        thread::spawn(move || {
            // Signals are exposed via an iterator so this loop is just
            // to consume that by blocking until the first value is
            // emitted; the body always exits the process.
            #[allow(clippy::never_loop)]
            for signal in &mut signals {
                assert!(TERM_SIGNALS.contains(&signal));

                info!("term sig handler: cleaning up socket");
                if let Err(e) = std::fs::remove_file(&self.sock).context("cleaning up socket") {
                    error!("error cleaning up socket file: {}", e);
                }

                info!("term sig handler: exiting");
                std::process::exit(0);
            }
        });

        Ok(())
    }
}
