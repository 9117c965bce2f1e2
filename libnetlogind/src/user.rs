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

use std::{ffi::CStr, ffi::CString, io, ptr};

use anyhow::{anyhow, Context};
use nix::unistd::{Gid, Uid};

/// One account resolved from the OS account database. Immutable once
/// resolved; the session worker owns it for the life of the session.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub home_dir: String,
    pub shell: String,
}

/// Resolves `username` against the account database. `Ok(None)` means
/// the database has no such user, which the caller reports as an
/// authentication failure rather than an internal error.
pub fn lookup(username: &str) -> anyhow::Result<Option<UserRecord>> {
    let name = CString::new(username).context("username contains a NUL byte")?;

    let mut passwd_str_buf: [libc::c_char; 1024 * 4] = [0; 1024 * 4];
    // Safety: getpwnam_r treats the struct as output only, zeroes are
    //         as good a starting value as any.
    let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut passwd_res_ptr: *mut libc::passwd = ptr::null_mut();
    unsafe {
        // Safety: pretty much pure ffi, passwd and passwd_str_buf
        //         correctly have memory backing them.
        let errno = libc::getpwnam_r(
            name.as_ptr(),
            &mut passwd,
            passwd_str_buf.as_mut_ptr(),
            passwd_str_buf.len(),
            &mut passwd_res_ptr as *mut *mut libc::passwd,
        );
        if passwd_res_ptr.is_null() {
            if errno == 0 {
                return Ok(None);
            }
            return Err(anyhow!(
                "error resolving user {:?}: {}",
                username,
                io::Error::from_raw_os_error(errno)
            ));
        }

        // Safety: these pointers are all cstrings into passwd_str_buf
        Ok(Some(UserRecord {
            name: String::from(String::from_utf8_lossy(
                CStr::from_ptr(passwd.pw_name).to_bytes(),
            )),
            uid: Uid::from_raw(passwd.pw_uid),
            gid: Gid::from_raw(passwd.pw_gid),
            home_dir: String::from(String::from_utf8_lossy(
                CStr::from_ptr(passwd.pw_dir).to_bytes(),
            )),
            shell: String::from(String::from_utf8_lossy(
                CStr::from_ptr(passwd.pw_shell).to_bytes(),
            )),
        }))
    }
}
