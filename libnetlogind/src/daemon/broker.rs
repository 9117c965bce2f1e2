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

use std::{os::unix::net::UnixStream, thread, time};

use anyhow::{bail, Context};
use netlogind_protocol::Message;
use nix::{
    errno::Errno,
    sys::wait::{self, WaitPidFlag, WaitStatus},
    unistd::{self, ForkResult, Pid},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    auth, consts, platform,
    protocol::{MessageStream, ProtocolError},
    secret,
};

const CLIENT: &str = "writing to the client";

/// The per-connection root process that owns the client endpoint.
/// During authentication it is a pure relay between the client and
/// the session worker; after the worker reports success it keeps
/// relaying for the command loop. It never touches the auth back end
/// itself, that lives on the other side of the socketpair.
struct Broker {
    client: MessageStream,
    conversation: MessageStream,
    username: Option<String>,
}

/// Spawns the session worker over a socketpair and relays until the
/// session is over. Returns the process exit status for the broker.
#[instrument(skip_all)]
pub fn run(
    client: UnixStream,
    auth: Option<Box<dyn auth::Adapter + Send>>,
    auth_timeout: time::Duration,
) -> i32 {
    let (broker_end, worker_end) = match UnixStream::pair() {
        Ok(pair) => pair,
        Err(e) => {
            error!("creating the conversation socketpair: {}", e);
            return 1;
        }
    };

    // Safety: the broker is single threaded at this point; the child
    //         continues executing our own code.
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Child) => {
            // the worker must never hold the client endpoint, and has
            // no use for the broker's end of the socketpair
            drop(client);
            drop(broker_end);
            let status = super::worker::Worker::new(worker_end, auth).run();
            std::process::exit(status);
        }
        Ok(ForkResult::Parent { child }) => {
            drop(worker_end);
            let mut broker = Broker {
                client: MessageStream::new(client),
                conversation: MessageStream::new(broker_end),
                username: None,
            };
            let status = match broker.relay(auth_timeout) {
                Ok(status) => status,
                Err(e) => {
                    if is_timeout(&e) {
                        error!("authentication timed out");
                    } else {
                        error!("session relay: {:?}", e);
                    }
                    1
                }
            };
            // closing both endpoints tells the worker the session is
            // over, so the bounded reap below normally returns fast
            drop(broker);
            reap_worker(child);

            status
        }
        Err(e) => {
            error!("forking session worker: {}", e);
            1
        }
    }
}

fn is_timeout(e: &anyhow::Error) -> bool {
    e.root_cause()
        .downcast_ref::<ProtocolError>()
        .map(|p| matches!(p, ProtocolError::TimedOut))
        .unwrap_or(false)
}

impl Broker {
    /// The relay loop. The returned status is what the whole broker
    /// process should exit with; errors are protocol violations or
    /// lost peers and are fatal to this session only.
    fn relay(&mut self, auth_timeout: time::Duration) -> anyhow::Result<i32> {
        // One deadline covers the whole authentication phase on both
        // channels; it is lifted the moment the worker reports
        // success.
        let deadline = time::Instant::now() + auth_timeout;
        self.client.set_deadline(Some(deadline));
        self.conversation.set_deadline(Some(deadline));

        let mut authenticated = false;
        loop {
            let msg = self.conversation.read_message().context("reading from the session worker")?;
            match msg {
                Message::Text(text) => {
                    self.client.write_message(&Message::Text(text)).context(CLIENT)?;
                }
                Message::Prompt(echo) => {
                    self.client.write_message(&Message::Prompt(echo)).context(CLIENT)?;
                    let reply = self.client.read_reply().context("reading the client's reply")?;
                    let mut fwd = Message::Reply(reply);
                    let res = self
                        .conversation
                        .write_message(&fwd)
                        .context("writing to the session worker");
                    // any reply may be a secret; wipe our copy the
                    // moment the worker has it
                    if let Message::Reply(payload) = &mut fwd {
                        secret::scrub(payload);
                    }
                    res?;
                }
                Message::Finish(status) if !authenticated => {
                    if status != 0 {
                        self.client
                            .write_message(&Message::Text(Vec::from(
                                &b"Authentication failed\n"[..],
                            )))
                            .context(CLIENT)?;
                        self.client.write_message(&Message::Finish(status)).context(CLIENT)?;
                        return Ok(1);
                    }

                    // FINISH(0) is followed by the authenticated
                    // username; the pair is a phase transition, not
                    // something the client sees yet
                    let username = String::from_utf8_lossy(
                        &self
                            .conversation
                            .read_reply()
                            .context("reading the authenticated username")?,
                    )
                    .into_owned();
                    info!("session authenticated for {:?}", username);
                    self.client.set_deadline(None);
                    self.conversation.set_deadline(None);
                    platform::set_process_title(&format!("netlogind: {username} [broker]"));
                    self.username = Some(username);
                    authenticated = true;
                }
                Message::Finish(status) => {
                    self.client.write_message(&Message::Finish(status)).context(CLIENT)?;
                    debug!(
                        "command loop over for {:?}, status {}",
                        self.username.as_deref().unwrap_or("<unknown>"),
                        status
                    );
                    return Ok(if status == 0 { 0 } else { 1 });
                }
                Message::Reply(_) => bail!("unexpected Reply from the session worker"),
            }
        }
    }
}

/// Reaps the session worker, bounded so a wedged worker cannot pin
/// the broker; past the bound the worker is abandoned to init.
fn reap_worker(worker: Pid) {
    let deadline = time::Instant::now() + consts::CHILD_WAIT_TIMEOUT;
    loop {
        match wait::waitpid(worker, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if time::Instant::now() >= deadline {
                    debug!("abandoning session worker {}", worker);
                    return;
                }
                thread::sleep(consts::REAP_POLL_DURATION);
            }
            Ok(WaitStatus::Exited(pid, code)) => {
                if code != 0 {
                    warn!("session worker {} exited abnormally: code {}", pid, code);
                }
                return;
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                warn!("session worker {} terminated by {}", pid, sig);
                return;
            }
            Ok(_) => thread::sleep(consts::REAP_POLL_DURATION),
            Err(Errno::ECHILD) => return,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("waitpid({}): {}", worker, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use ntest::timeout;

    use super::*;

    fn streams() -> (Broker, MessageStream, MessageStream) {
        let (client_ours, client_theirs) = UnixStream::pair().expect("socketpair");
        let (conv_ours, conv_theirs) = UnixStream::pair().expect("socketpair");
        let broker = Broker {
            client: MessageStream::new(client_ours),
            conversation: MessageStream::new(conv_ours),
            username: None,
        };
        (broker, MessageStream::new(client_theirs), MessageStream::new(conv_theirs))
    }

    #[test]
    #[timeout(30000)]
    fn relay_happy_path() {
        let (mut broker, mut client, mut worker) = streams();

        let worker_h = thread::spawn(move || {
            worker.write_message(&Message::Text(Vec::from(&b"Username: "[..]))).expect("write");
            worker.write_message(&Message::Prompt(true)).expect("write");
            assert_eq!(worker.read_reply().expect("read reply"), Vec::from(&b"alice"[..]));
            // authentication done: phase-transition pair, then the
            // command loop runs dry immediately
            worker.write_message(&Message::Finish(0)).expect("write");
            worker.write_message(&Message::Reply(Vec::from(&b"alice"[..]))).expect("write");
            worker.write_message(&Message::Finish(0)).expect("write");
        });

        let client_h = thread::spawn(move || {
            assert_eq!(
                client.read_message().expect("read"),
                Message::Text(Vec::from(&b"Username: "[..]))
            );
            assert_eq!(client.read_message().expect("read"), Message::Prompt(true));
            client.write_message(&Message::Reply(Vec::from(&b"alice"[..]))).expect("write");
            // the phase-transition Finish/Reply pair must not reach
            // the client: the next message is the terminal Finish
            assert_eq!(client.read_message().expect("read"), Message::Finish(0));
        });

        let status = broker.relay(time::Duration::from_secs(5)).expect("relay to succeed");
        assert_eq!(status, 0);
        assert_eq!(broker.username.as_deref(), Some("alice"));
        worker_h.join().expect("worker thread");
        client_h.join().expect("client thread");
    }

    #[test]
    #[timeout(30000)]
    fn relay_denied_auth() {
        let (mut broker, mut client, mut worker) = streams();

        let worker_h = thread::spawn(move || {
            worker.write_message(&Message::Finish(1)).expect("write");
        });

        let client_h = thread::spawn(move || {
            assert_eq!(
                client.read_message().expect("read"),
                Message::Text(Vec::from(&b"Authentication failed\n"[..]))
            );
            assert_eq!(client.read_message().expect("read"), Message::Finish(1));
        });

        let status = broker.relay(time::Duration::from_secs(5)).expect("relay to succeed");
        assert_eq!(status, 1);
        assert!(broker.username.is_none());
        worker_h.join().expect("worker thread");
        client_h.join().expect("client thread");
    }

    #[test]
    #[timeout(30000)]
    fn relay_times_out_on_a_silent_client() {
        let (mut broker, mut client, mut worker) = streams();

        let worker_h = thread::spawn(move || {
            worker.write_message(&Message::Text(Vec::from(&b"Username: "[..]))).expect("write");
            worker.write_message(&Message::Prompt(true)).expect("write");
            // never gets a reply
        });

        let client_h = thread::spawn(move || {
            client.read_message().expect("read");
            client.read_message().expect("read");
            // goes silent instead of replying
            client
        });

        let err = broker
            .relay(time::Duration::from_millis(50))
            .expect_err("relay to hit the auth deadline");
        assert!(is_timeout(&err));
        worker_h.join().expect("worker thread");
        client_h.join().expect("client thread");
    }

    #[test]
    #[timeout(30000)]
    fn unexpected_worker_reply_is_fatal() {
        let (mut broker, _client, mut worker) = streams();

        let worker_h = thread::spawn(move || {
            worker.write_message(&Message::Reply(Vec::from(&b"sneaky"[..]))).expect("write");
        });

        let err = broker.relay(time::Duration::from_secs(5)).expect_err("relay to fail");
        assert!(format!("{err:?}").contains("unexpected Reply"));
        worker_h.join().expect("worker thread");
    }

    #[test]
    #[timeout(30000)]
    fn second_finish_with_error_status() {
        let (mut broker, mut client, mut worker) = streams();

        let worker_h = thread::spawn(move || {
            worker.write_message(&Message::Finish(0)).expect("write");
            worker.write_message(&Message::Reply(Vec::from(&b"alice"[..]))).expect("write");
            worker.write_message(&Message::Finish(1)).expect("write");
        });

        let client_h = thread::spawn(move || {
            assert_eq!(client.read_message().expect("read"), Message::Finish(1));
        });

        let status = broker.relay(time::Duration::from_secs(5)).expect("relay to succeed");
        assert_eq!(status, 1);
        worker_h.join().expect("worker thread");
        client_h.join().expect("client thread");
    }
}
