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

use std::io;

use anyhow::Context;
use nix::sys::{
    termios,
    termios::{LocalFlags, SetArg, Termios},
};
use tracing::error;

/// Restores the terminal's echo flags when dropped. Holding one of
/// these is the only way to get echo turned off, so a panic or early
/// return can't leave the user's terminal dark.
pub struct EchoGuard {
    old: Option<Termios>,
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        if let Some(old) = self.old.take() {
            if let Err(e) = termios::tcsetattr(&io::stdin(), SetArg::TCSAFLUSH, &old) {
                error!("error restoring terminal echo flags: {:?}", e);
            }
        }
    }
}

/// Turns off echo (and the newline echo) on stdin for the duration of
/// the returned guard. When stdin is not a terminal, for example in
/// tests driving the client with a pipe, this does nothing.
pub fn suppress_echo() -> anyhow::Result<EchoGuard> {
    let stdin = io::stdin();
    // Safety: pure ffi on a descriptor we know is open.
    if unsafe { libc::isatty(libc::STDIN_FILENO) } != 1 {
        return Ok(EchoGuard { old: None });
    }

    let old = termios::tcgetattr(&stdin).context("grabbing term flags")?;
    let mut term = old.clone();
    term.local_flags &= !(LocalFlags::ECHO | LocalFlags::ECHONL);
    termios::tcsetattr(&stdin, SetArg::TCSAFLUSH, &term).context("setting term flags")?;

    Ok(EchoGuard { old: Some(old) })
}
