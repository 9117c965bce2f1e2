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

use std::time;

/// The well known listening socket. World-connectable by design: the
/// daemon authenticates whoever dials in, the filesystem does not.
pub const SOCK_PATH: &str = "/tmp/netlogind.sock";

/// How long a connection may stay unauthenticated before the broker
/// tears it down.
pub const AUTH_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Minimum delay between per-connection broker forks. Bounds the rate
/// at which unauthenticated root-owned processes can be created.
pub const ACCEPT_THROTTLE: time::Duration = time::Duration::from_secs(1);

/// How long the worker waits for leftover command children on shutdown
/// before abandoning them to init.
pub const CHILD_WAIT_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// Grace period before tearing down the auth session, so user daemons
/// started by session-open have a chance to detach cleanly.
pub const SESSION_TEARDOWN_GRACE: time::Duration = time::Duration::from_secs(5);

pub const REAP_POLL_DURATION: time::Duration = time::Duration::from_millis(100);

/// The largest conversation reply the auth dialogue will accept.
pub const MAX_CONV_REPLY: usize = 512;

pub const STDERR_FD: i32 = 2;
