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
    io::Write as _,
    os::unix::net::UnixStream,
    path::Path,
};

use anyhow::{bail, Context};
use netlogind_protocol::Message;

use crate::{
    protocol::{MessageStream, ProtocolError},
    secret, tty,
};

/// The terminal front end for the protocol: Text goes to stdout,
/// Prompt reads a line from stdin (with local echo suppressed for
/// echo-off prompts), and Finish decides the exit status. Returns the
/// status the client process should exit with.
pub fn run(socket: &Path) -> anyhow::Result<i32> {
    let stream = UnixStream::connect(socket)
        .with_context(|| format!("connecting to netlogind daemon on {socket:?}"))?;
    let mut stream = MessageStream::new(stream);
    let mut stdout = io::stdout();

    loop {
        match stream.read_message() {
            Ok(Message::Text(text)) => {
                stdout.write_all(&text).context("writing to stdout")?;
                stdout.flush().context("flushing stdout")?;
            }
            Ok(Message::Prompt(echo)) => {
                let line = read_reply_line(echo)?;
                let mut msg = Message::Reply(line);
                let res = stream.write_message(&msg).context("replying to the daemon");
                // an echo-off reply is a secret; our copy dies here
                if let Message::Reply(payload) = &mut msg {
                    secret::scrub(payload);
                }
                res?;
            }
            Ok(Message::Finish(status)) => {
                return Ok(if status == 0 { 0 } else { 1 });
            }
            Ok(Message::Reply(_)) => bail!("unexpected Reply from the daemon"),
            Err(ProtocolError::Eof) => bail!("daemon closed the connection"),
            Err(e) => return Err(e).context("reading from the daemon"),
        }
    }
}

fn read_reply_line(echo: bool) -> anyhow::Result<Vec<u8>> {
    let _guard = if echo { None } else { Some(tty::suppress_echo()?) };

    let mut line = String::new();
    let nread = io::stdin().read_line(&mut line).context("reading user input")?;
    if nread == 0 {
        // stdin ran dry; an empty reply lets the server wind the
        // session down in an orderly way
        return Ok(Vec::new());
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }

    Ok(line.into_bytes())
}
