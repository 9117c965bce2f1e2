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

//! The ordered sequence of operations that moves a root process into a
//! named user's security identity. The order is load bearing: groups
//! before the auth session (session-open may add groups that a later
//! initgroups would discard), every uid drop verified by re-reading
//! the ids afterwards.

use std::{env, ffi::CString, io};

use anyhow::{bail, Context};
use nix::unistd;
use tracing::warn;

use crate::{auth, user::UserRecord};

// Copying openssh; almost always overridden by the inherited PATH.
const DEFAULT_SESSION_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";

// The traditional (uid_t)-1 "leave this id unchanged" argument.
const UNCHANGED: libc::uid_t = libc::uid_t::MAX;

fn setreuid(ruid: libc::uid_t, euid: libc::uid_t) -> anyhow::Result<()> {
    // Safety: pure ffi.
    if unsafe { libc::setreuid(ruid, euid) } < 0 {
        return Err(io::Error::last_os_error()).context("setreuid");
    }

    Ok(())
}

/// Takes on the user's primary group and supplementary group list.
/// Must run before the auth back end opens its session.
pub fn enter_group_identity(user: &UserRecord) -> anyhow::Result<()> {
    unistd::setgid(user.gid).context("setgid")?;
    if unistd::getgid() != user.gid || unistd::getegid() != user.gid {
        bail!("gid not correctly set for {:?}", user.name);
    }

    let name = CString::new(user.name.as_str()).context("user name contains a NUL byte")?;
    unistd::initgroups(&name, user.gid).context("initgroups")?;

    Ok(())
}

/// Adopts the user's real uid while keeping effective root. Every
/// fork the worker does on the user's behalf then counts against the
/// user's resource limits rather than root's.
pub fn adopt_real_uid(user: &UserRecord) -> anyhow::Result<()> {
    setreuid(user.uid.as_raw(), UNCHANGED)
}

/// Undoes [`adopt_real_uid`] for the worker's own teardown work.
pub fn restore_real_root() -> anyhow::Result<()> {
    setreuid(0, UNCHANGED)
}

/// The final, irreversible drop in a command child: make every uid
/// and gid the user's, then re-read all four ids and refuse to
/// continue on any disagreement.
pub fn become_user(user: &UserRecord) -> anyhow::Result<()> {
    // setuid only clears every uid when the caller's effective uid is
    // root, and the worker has given away its real uid by now
    setreuid(0, UNCHANGED).context("restoring real root before setuid")?;
    unistd::setuid(user.uid).context("setuid")?;
    if unistd::getuid() != user.uid
        || unistd::geteuid() != user.uid
        || unistd::getgid() != user.gid
        || unistd::getegid() != user.gid
    {
        bail!("uid/gid not correctly set for {:?}", user.name);
    }

    Ok(())
}

/// Replaces the process environment with the user's login
/// environment: the inherited PATH is preserved, everything else is
/// wiped, the identity variables are set from the account record, and
/// the (blocklist-filtered) back-end variables are merged on top.
/// Finishes in the user's home directory; failure to get there is
/// reported but does not stop the login.
pub fn session_environ(user: &UserRecord, adapter_env: Vec<(String, String)>) {
    let path = env::var("PATH").unwrap_or_else(|_| String::from(DEFAULT_SESSION_PATH));
    for (name, _) in env::vars_os().collect::<Vec<_>>() {
        env::remove_var(name);
    }

    env::set_var("HOME", &user.home_dir);
    env::set_var("USER", &user.name);
    env::set_var("LOGNAME", &user.name);
    // Historical; only strictly needed on AIX.
    env::set_var("LOGIN", &user.name);
    env::set_var("SHELL", if user.shell.is_empty() { "/bin/sh" } else { user.shell.as_str() });
    env::set_var("PATH", &path);
    for (name, value) in auth::filter_environ(adapter_env) {
        env::set_var(name, value);
    }

    if let Err(e) = env::set_current_dir(&user.home_dir) {
        warn!("chdir({}): {}", user.home_dir, e);
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use nix::unistd::{Gid, Uid};

    use super::*;

    fn fake_user() -> UserRecord {
        UserRecord {
            name: String::from("alice"),
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
            home_dir: String::from("/"),
            shell: String::from(""),
        }
    }

    fn environ() -> HashMap<String, String> {
        env::vars().collect()
    }

    // The sanitizer wipes the whole process environment, so this test
    // covers the base set, the blocklist and idempotence in one go
    // rather than fighting over global state across test threads.
    #[test]
    fn session_environ_sanitizes_and_is_idempotent() {
        env::set_var("PATH", "/usr/bin:/bin");
        env::set_var("CDPATH", "/somewhere");
        env::set_var("EVIL_CALLER_VAR", "boo");

        let adapter_env = vec![
            (String::from("KRB5CCNAME"), String::from("/tmp/krb5cc_1000")),
            (String::from("PATH"), String::from("/overridden")),
            (String::from("LD_PRELOAD"), String::from("/tmp/evil.so")),
        ];

        let user = fake_user();
        session_environ(&user, adapter_env.clone());
        let first = environ();

        assert_eq!(first.get("HOME"), Some(&String::from("/")));
        assert_eq!(first.get("USER"), Some(&String::from("alice")));
        assert_eq!(first.get("LOGNAME"), Some(&String::from("alice")));
        assert_eq!(first.get("LOGIN"), Some(&String::from("alice")));
        // an empty passwd shell falls back to /bin/sh
        assert_eq!(first.get("SHELL"), Some(&String::from("/bin/sh")));
        // the pre-wipe PATH survives; the back end cannot override it
        assert_eq!(first.get("PATH"), Some(&String::from("/usr/bin:/bin")));
        assert_eq!(first.get("KRB5CCNAME"), Some(&String::from("/tmp/krb5cc_1000")));
        assert_eq!(first.get("LD_PRELOAD"), None);
        assert_eq!(first.get("CDPATH"), None);
        assert_eq!(first.get("EVIL_CALLER_VAR"), None);

        session_environ(&user, adapter_env);
        assert_eq!(environ(), first);
    }
}
