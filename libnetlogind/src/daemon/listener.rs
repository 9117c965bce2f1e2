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
    fs, io,
    os::unix::{
        fs::PermissionsExt as _,
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    process, thread, time,
};

use anyhow::{bail, Context};
use nix::{
    errno::Errno,
    sys::wait,
    unistd::{self, ForkResult, Pid},
};
use tracing::{info, instrument, warn};

use crate::{auth, daemon::broker, platform, platform::Platform as _};

/// Everything one connection needs, threaded through explicitly so
/// the accept loop has no process-wide state.
pub struct ServeCtx {
    pub auth: Option<Box<dyn auth::Adapter + Send>>,
    pub debug: bool,
    pub auth_timeout: time::Duration,
    pub accept_throttle: time::Duration,
    pub platform: platform::Native,
}

/// Refuses to start when a live daemon already answers on the socket.
/// Runs before daemonizing so the complaint still lands on the
/// caller's terminal.
pub fn ensure_not_running(sock_path: &Path) -> anyhow::Result<()> {
    match UnixStream::connect(sock_path) {
        Ok(_) => bail!("daemon already running on {:?}", sock_path),
        Err(e) if !connect_failure_means_absent(&e) => {
            Err(e).context("probing for a running daemon")
        }
        Err(_) => Ok(()),
    }
}

// A refused or aimless connect means the socket file is stale or
// absent; anything else is a real problem.
fn connect_failure_means_absent(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::ConnectionRefused
        || e.kind() == io::ErrorKind::NotFound
        || e.raw_os_error() == Some(libc::EDESTADDRREQ)
}

pub struct Listener {
    listener: UnixListener,
    sock_path: PathBuf,
}

impl Listener {
    /// Clears any stale socket file, binds, and opens the socket up
    /// mode 0666: any local user may dial in, it is the daemon's job
    /// to decide who they are.
    pub fn bind(sock_path: &Path) -> anyhow::Result<Listener> {
        match fs::remove_file(sock_path) {
            Ok(()) => info!("removed stale socket file {:?}", sock_path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("removing stale socket file"),
        }

        let listener = UnixListener::bind(sock_path).context("binding to socket")?;
        fs::set_permissions(sock_path, fs::Permissions::from_mode(0o666))
            .context("opening up socket permissions")?;

        Ok(Listener { listener, sock_path: PathBuf::from(sock_path) })
    }

    /// The accept loop. Each connection gets a freshly forked,
    /// fully detached broker; the listener reaps the intermediate
    /// child and then naps, which bounds how fast unauthenticated
    /// root processes can be created. In debug mode a single
    /// connection is served in the foreground instead.
    #[instrument(skip_all)]
    pub fn serve(self, ctx: ServeCtx) -> anyhow::Result<()> {
        let ServeCtx { mut auth, debug, auth_timeout, accept_throttle, platform } = ctx;
        loop {
            let (stream, _) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("accepting stream"),
            };
            info!("socket got a new connection");

            if debug {
                let status = broker::run(stream, auth.take(), auth_timeout);
                self.remove_socket_file();
                if status != 0 {
                    bail!("session ended with status {}", status);
                }
                return Ok(());
            }

            // Safety: the listener has only the signal handler thread
            //         beyond this one, and the child execs nothing
            //         that would care about it.
            match unsafe { unistd::fork() }.context("forking connection broker")? {
                ForkResult::Child => {
                    // the broker must not hold the listening socket
                    drop(self);
                    detach();
                    platform.post_fork();
                    let status = broker::run(stream, auth, auth_timeout);
                    process::exit(status);
                }
                ForkResult::Parent { child } => {
                    // the broker owns the client endpoint now
                    drop(stream);
                    reap_exactly(child);
                    thread::sleep(accept_throttle);
                }
            }
        }
    }

    fn remove_socket_file(&self) {
        if let Err(e) = fs::remove_file(&self.sock_path) {
            warn!("cleaning up socket file: {}", e);
        }
    }
}

/// Fully detaches the freshly forked broker from the listener: a new
/// session, then a second fork so the broker is not a session leader.
/// The intermediate process quits immediately and is what the
/// listener reaps.
fn detach() {
    if let Err(e) = unistd::setsid() {
        warn!("creating new session: {}", e);
    }
    // Safety: same argument as the accept-loop fork.
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Child) => {}
        Ok(ForkResult::Parent { .. }) => {
            // Safety: nothing to clean up, and the real broker must
            //         not see this process's destructors run.
            unsafe { libc::_exit(0) }
        }
        Err(e) => {
            // keep serving from the intermediate process; detachment
            // is best effort
            warn!("detach fork: {}", e);
        }
    }
}

/// Blocking reap of exactly the given child.
fn reap_exactly(child: Pid) {
    loop {
        match wait::waitpid(child, None) {
            Ok(_) => return,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("waitpid({}): {}", child, e);
                return;
            }
        }
    }
}
