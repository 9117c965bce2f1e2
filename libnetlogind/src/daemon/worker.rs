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

use std::{ffi::CString, os::unix::net::UnixStream, thread, time};

use anyhow::{anyhow, bail, Context};
use netlogind_protocol::Message;
use nix::{
    errno::Errno,
    sys::{
        signal::{self, SigHandler, Signal},
        wait::{self, WaitPidFlag, WaitStatus},
    },
    unistd::{self, ForkResult, Uid},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    auth,
    auth::Verdict,
    consts,
    conversation::Conversation,
    daemon::creds,
    platform,
    platform::Platform as _,
    protocol::MessageStream,
    user,
    user::UserRecord,
};

const DISCONNECT: &str = "unexpected disconnection";

/// The per-session worker: the child of the broker that runs the
/// authentication dialogue, becomes the user, and forks their
/// commands. It talks to the world only through its end of the
/// conversation socketpair; the client endpoint is never in this
/// process.
pub struct Worker {
    stream: MessageStream,
    auth: Option<Box<dyn auth::Adapter + Send>>,
    platform: platform::Native,
    user: Option<UserRecord>,
    session_open: bool,
}

impl Worker {
    pub fn new(conversation: UnixStream, auth: Option<Box<dyn auth::Adapter + Send>>) -> Self {
        Worker {
            stream: MessageStream::new(conversation),
            auth,
            platform: platform::Native,
            user: None,
            session_open: false,
        }
    }

    /// Runs the whole session and returns the worker's exit status.
    /// All teardown the worker owes (auth session, back-end
    /// credentials) happens before this returns, on success and
    /// failure alike.
    #[instrument(skip_all)]
    pub fn run(mut self) -> i32 {
        platform::set_process_title("netlogind: [session]");
        let status = match self.session_main() {
            Ok(()) => 0,
            Err(e) => {
                error!("session: {:?}", e);
                1
            }
        };
        self.cleanup();

        status
    }

    fn session_main(&mut self) -> anyhow::Result<()> {
        self.stream
            .write_message(&Message::Text(Vec::from(&b"Username: "[..])))
            .context(DISCONNECT)?;
        self.stream.write_message(&Message::Prompt(true)).context(DISCONNECT)?;
        let mut username =
            String::from_utf8_lossy(&self.stream.read_reply().context(DISCONNECT)?).into_owned();
        if username.is_empty() {
            let _ = self.stream.write_message(&Message::Finish(1));
            bail!("no username returned");
        }

        match self.auth.as_mut() {
            None => {
                self.stream
                    .write_message(&Message::Text(Vec::from(&b"Skipping authentication\n"[..])))
                    .context(DISCONNECT)?;
            }
            Some(adapter) => {
                // the back end may canonicalize the username during
                // the dialogue; everything below uses the final value
                let mut conv = Conversation::new(&mut self.stream);
                match adapter.authenticate(&mut username, &mut conv) {
                    Ok(Verdict::Allow) => {}
                    Ok(Verdict::Deny) => {
                        let _ = self.stream.write_message(&Message::Finish(1));
                        bail!("authentication failed for {username:?}");
                    }
                    Err(e) => {
                        let _ = self.stream.write_message(&Message::Finish(1));
                        return Err(e.context("authentication dialogue"));
                    }
                }
            }
        }

        let user = match user::lookup(&username).context("reading the account database")? {
            Some(user) => user,
            None => {
                let _ = self.stream.write_message(&Message::Finish(1));
                bail!("no matching passwd entry for {username:?}");
            }
        };
        info!("session user resolved name={:?} uid={}", user.name, user.uid);
        self.user = Some(user.clone());

        if let Err(e) = self.transition(&user) {
            let _ = self.stream.write_message(&Message::Finish(1));
            return Err(e);
        }

        platform::set_process_title(&format!("netlogind: {} [session]", user.name));
        self.stream.write_message(&Message::Finish(0)).context(DISCONNECT)?;
        self.stream
            .write_message(&Message::Reply(user.name.clone().into_bytes()))
            .context(DISCONNECT)?;

        // from here on every fork is on the user's account, so their
        // resource limits apply to it
        if let Err(e) = creds::adopt_real_uid(&user) {
            warn!("adopting the user's real uid: {:?}", e);
        }

        self.command_loop(&user)?;

        if let Err(e) = creds::restore_real_root() {
            warn!("restoring real root: {:?}", e);
        }
        self.stream.write_message(&Message::Finish(0)).context(DISCONNECT)?;
        self.wait_for_children();

        Ok(())
    }

    /// Credential transition steps between authentication and the
    /// post-auth signal to the broker. Any failure here aborts the
    /// session before the user gets a command loop.
    fn transition(&mut self, user: &UserRecord) -> anyhow::Result<()> {
        creds::enter_group_identity(user)?;
        self.platform.post_auth(&user.name, user.uid);

        if let Some(adapter) = self.auth.as_mut() {
            let mut conv = Conversation::reject_prompts(&mut self.stream);
            adapter.begin_session(&user.name, &mut conv).context("opening the auth session")?;
            self.session_open = true;
        }

        self.platform.post_session(&user.name);

        Ok(())
    }

    fn command_loop(&mut self, user: &UserRecord) -> anyhow::Result<()> {
        loop {
            self.reap_finished_children()?;

            self.stream
                .write_message(&Message::Text(Vec::from(&b"Command: "[..])))
                .context(DISCONNECT)?;
            self.stream.write_message(&Message::Prompt(true)).context(DISCONNECT)?;
            let command = self.stream.read_reply().context(DISCONNECT)?;
            if command.is_empty() {
                return Ok(());
            }
            debug!("running command {:?}", String::from_utf8_lossy(&command));

            // Safety: the worker is single threaded, and the child
            //         execs or _exits without touching shared state.
            match unsafe { unistd::fork() } {
                Ok(ForkResult::Parent { .. }) => continue,
                Ok(ForkResult::Child) => {
                    let code = self.exec_command(user, &command);
                    // the child owns nothing cleanable
                    unsafe { libc::_exit(code) }
                }
                Err(e) => {
                    let _ = self.stream.write_message(&Message::Finish(1));
                    return Err(anyhow!("forking command child: {}", e));
                }
            }
        }
    }

    /// Runs in the freshly forked command child. Only returns if the
    /// exec could not happen; the returned code goes to _exit.
    fn exec_command(&mut self, user: &UserRecord, command: &[u8]) -> i32 {
        // the command inherits only the standard streams; this also
        // drops our copy of the conversation endpoint
        close_descriptors_above_stderr();
        // Safety: restoring the default disposition for the command.
        if let Err(e) = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
            eprintln!("netlogind: restoring SIGPIPE: {e}");
        }

        if let Err(e) = creds::become_user(user) {
            eprintln!("netlogind: {e:#}");
            return 1;
        }

        let adapter_env = self.auth.as_ref().map(|a| a.environ()).unwrap_or_default();
        creds::session_environ(user, adapter_env);

        let prog = match CString::new(command.to_vec()) {
            Ok(prog) => prog,
            Err(_) => {
                eprintln!("netlogind: command contains a NUL byte");
                return 1;
            }
        };
        let argv = [prog.clone()];
        let err = unistd::execvp(&prog, &argv).unwrap_err();
        eprintln!("netlogind: exec {:?}: {}", String::from_utf8_lossy(command), err);

        1
    }

    /// Non-blocking drain of finished command children between
    /// prompts. A child that failed is reported and the loop goes on;
    /// a broken waitpid is fatal to the session.
    fn reap_finished_children(&mut self) -> anyhow::Result<()> {
        loop {
            match wait::waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(()),
                Ok(status) => report_child(status),
                Err(Errno::ECHILD) => return Ok(()),
                Err(e) => {
                    let _ = self.stream.write_message(&Message::Finish(1));
                    return Err(anyhow!("waitpid: {}", e));
                }
            }
        }
    }

    /// Blocking wait for the remaining command children on shutdown,
    /// bounded so a wedged command cannot hold the session open
    /// forever; past the bound the children continue under init.
    fn wait_for_children(&self) {
        let deadline = time::Instant::now() + consts::CHILD_WAIT_TIMEOUT;
        loop {
            match wait::waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if time::Instant::now() >= deadline {
                        debug!("abandoning session children");
                        return;
                    }
                    thread::sleep(consts::REAP_POLL_DURATION);
                }
                Ok(status) => report_child(status),
                Err(Errno::ECHILD) => return,
                Err(e) => {
                    warn!("waitpid: {}", e);
                    return;
                }
            }
        }
    }

    fn cleanup(&mut self) {
        if let Some(adapter) = self.auth.as_mut() {
            if self.session_open {
                // User daemons (dbus and friends) detached from the
                // session need a moment to quit before the back end
                // starts unmounting home directories and the like.
                thread::sleep(consts::SESSION_TEARDOWN_GRACE);
            }
            let uid = self.user.as_ref().map(|u| u.uid).unwrap_or_else(Uid::current);
            adapter.cleanup(uid);
        }
    }
}

fn report_child(status: WaitStatus) {
    match status {
        WaitStatus::Exited(pid, code) if code != 0 => {
            warn!("command child {} exited abnormally: code {}", pid, code);
        }
        WaitStatus::Exited(pid, _) => debug!("command child {} exited cleanly", pid),
        WaitStatus::Signaled(pid, sig, _) => {
            warn!("command child {} terminated by {}", pid, sig);
        }
        _ => {}
    }
}

/// Closes every descriptor above stderr. The sweep runs between fork
/// and exec, so a racing allocation cannot sneak a descriptor in.
fn close_descriptors_above_stderr() {
    // Safety: pure ffi; any of these descriptors may already be
    //         closed, which close reports and we ignore.
    unsafe {
        #[cfg(target_os = "linux")]
        if libc::close_range(consts::STDERR_FD as libc::c_uint + 1, libc::c_uint::MAX, 0) == 0 {
            return;
        }

        let max = libc::sysconf(libc::_SC_OPEN_MAX);
        let max = if max < 0 { 1024 } else { max as i32 };
        for fd in (consts::STDERR_FD + 1)..max {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::net::UnixStream;

    use ntest::timeout;

    use super::*;
    use crate::conversation::{Prompt, Style};

    fn pair() -> (MessageStream, UnixStream) {
        let (ours, theirs) = UnixStream::pair().expect("socketpair");
        (MessageStream::new(ours), theirs)
    }

    struct DenyAll;
    impl auth::Adapter for DenyAll {
        fn authenticate(
            &mut self,
            _username: &mut String,
            conv: &mut Conversation<'_>,
        ) -> anyhow::Result<Verdict> {
            let _pw = conv.converse(&[Prompt { style: Style::EchoOff, text: "Password: " }])?;
            Ok(Verdict::Deny)
        }
    }

    #[test]
    #[timeout(30000)]
    fn denied_auth_sends_one_finish_and_stops() {
        let (mut client, worker_end) = pair();
        let worker = Worker::new(worker_end, Some(Box::new(DenyAll)));
        let worker_h = thread::spawn(move || worker.run());

        assert_eq!(
            client.read_message().expect("read"),
            Message::Text(Vec::from(&b"Username: "[..]))
        );
        assert_eq!(client.read_message().expect("read"), Message::Prompt(true));
        client.write_message(&Message::Reply(Vec::from(&b"bob"[..]))).expect("write");

        assert_eq!(
            client.read_message().expect("read"),
            Message::Text(Vec::from(&b"Password: "[..]))
        );
        assert_eq!(client.read_message().expect("read"), Message::Prompt(false));
        client.write_message(&Message::Reply(Vec::from(&b"wrongpw"[..]))).expect("write");

        // exactly one FINISH, then the stream closes with no
        // credential transition having been attempted
        assert_eq!(client.read_message().expect("read"), Message::Finish(1));
        match client.read_message() {
            Err(crate::protocol::ProtocolError::Eof) => {}
            other => panic!("want Eof after the terminal Finish, got {other:?}"),
        }

        assert_eq!(worker_h.join().expect("worker thread"), 1);
    }

    #[test]
    #[timeout(30000)]
    fn empty_username_fails_before_lookup() {
        let (mut client, worker_end) = pair();
        let worker = Worker::new(worker_end, Some(Box::new(DenyAll)));
        let worker_h = thread::spawn(move || worker.run());

        client.read_message().expect("read username text");
        client.read_message().expect("read username prompt");
        client.write_message(&Message::Reply(vec![])).expect("write");

        // no password prompt: the session dies before the back end
        // (or the passwd lookup) ever sees the empty name
        assert_eq!(client.read_message().expect("read"), Message::Finish(1));
        assert_eq!(worker_h.join().expect("worker thread"), 1);
    }

    #[test]
    #[timeout(30000)]
    fn client_disconnect_is_fatal_without_finish() {
        let (client, worker_end) = pair();
        let worker = Worker::new(worker_end, Some(Box::new(DenyAll)));
        let worker_h = thread::spawn(move || worker.run());

        drop(client);
        assert_eq!(worker_h.join().expect("worker thread"), 1);
    }
}
