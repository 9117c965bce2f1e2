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

use crate::conversation::Conversation;

/// What the back end decided about the dialing user.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// The pluggable authentication back end that the wrapping binary can
/// inject into the daemon. The core drives exactly these operations
/// and knows nothing else about the back end; a PAM adapter, an LDAP
/// adapter and the scripted adapters the tests use all plug in the
/// same way.
///
/// The operations are invoked by the session worker only, in this
/// order: `authenticate`, `begin_session`, `environ` (from the command
/// child), and finally `cleanup`. `cleanup` must also be safe to call
/// when nothing was ever established.
pub trait Adapter {
    /// Runs the authentication dialogue for `username`, talking to the
    /// remote user through `conv`. The back end may canonicalize the
    /// username in place (case folding, alias expansion); the caller
    /// re-reads it after this returns. Returning `Verdict::Deny` or an
    /// error both refuse the login; an error additionally means the
    /// dialogue itself broke down.
    fn authenticate(
        &mut self,
        username: &mut String,
        conv: &mut Conversation<'_>,
    ) -> anyhow::Result<Verdict>;

    /// Marks the beginning of an interactive session for the
    /// authenticated user. May establish credentials and add
    /// supplementary groups, which is why the caller must have run
    /// group initialization first. `conv` is in reject-prompts mode:
    /// only informational text can reach the user from here.
    fn begin_session(
        &mut self,
        _username: &str,
        _conv: &mut Conversation<'_>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Environment variables the back end wants in the user's session.
    /// The core filters these through the blocklist before merging, so
    /// a back end cannot override PATH or the identity variables.
    fn environ(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Tears down whatever `authenticate`/`begin_session` established,
    /// in reverse order. Takes the target uid because some back ends
    /// need the effective uid to match the user when revoking
    /// credentials. Errors are logged, not propagated; there is no
    /// caller left that could do anything about them.
    fn cleanup(&mut self, _uid: Uid) {}
}

// Variables the back end is never allowed to inject. LOGIN/USER are
// covered by the sanitized base set; MAIL and the rest follow the
// traditional login(1) blocklist.
const BANNED_ENV: [&str; 7] = ["SHELL", "HOME", "LOGNAME", "MAIL", "CDPATH", "IFS", "PATH"];

/// Drops blocklisted names (and the entire LD_* family) from a set of
/// back-end supplied environment variables.
pub fn filter_environ(pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    pairs
        .into_iter()
        .filter(|(name, _)| !BANNED_ENV.contains(&name.as_str()) && !name.starts_with("LD_"))
        .collect()
}
