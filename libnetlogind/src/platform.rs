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

use nix::unistd::Uid;

/// The platform-specific odds and ends of turning a process into a
/// logged-in user: audit and login bookkeeping that varies wildly by
/// OS. One implementation per target; the portable default does
/// nothing, which is a valid capability set.
///
/// All hooks are best effort. A platform that cannot record a login
/// should not stop the login.
pub trait Platform {
    /// Runs in the per-connection broker once it is fully detached
    /// from the listener's session.
    fn post_fork(&self) {}

    /// Runs in the worker after authentication succeeds and groups are
    /// initialized, before the back end opens its session. This is
    /// where per-kernel user-id bookkeeping (audit ids, loginuid)
    /// belongs.
    fn post_auth(&self, _username: &str, _uid: Uid) {}

    /// Runs in the worker after the back end's session is open.
    fn post_session(&self, _username: &str) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Native;

#[cfg(target_os = "linux")]
impl Platform for Native {
    fn post_auth(&self, _username: &str, uid: Uid) {
        // This is ultra-simplistic. Admins who really care about the
        // loginuid should use a dedicated auth module for it; we still
        // write it because every user id the kernel tracks for us is
        // ours to update.
        if let Err(e) = write_loginuid(uid) {
            tracing::debug!("no usable /proc/self/loginuid: {}", e);
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl Platform for Native {}

#[cfg(target_os = "linux")]
fn write_loginuid(uid: Uid) -> std::io::Result<()> {
    use std::io::Write as _;

    let f = std::fs::OpenOptions::new().read(true).write(true).open("/proc/self/loginuid")?;
    f.set_len(0)?;
    (&f).write_all(uid.as_raw().to_string().as_bytes())?;

    Ok(())
}

/// Renames the process as shown in ps/top, where the platform lets us.
/// Purely cosmetic, so failures are swallowed.
pub fn set_process_title(title: &str) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(name) = std::ffi::CString::new(title) {
            let _ = nix::sys::prctl::set_name(&name);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = title;
    }
}
