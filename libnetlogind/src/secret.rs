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

use zeroize::Zeroize;

/// A byte buffer that may hold a secret (a password, an echo-off
/// conversation reply). The contract is that the bytes are zeroed
/// before the allocation is released, with a write the optimizer is
/// not allowed to elide; `Zeroizing` gives us exactly that on drop.
pub type Secret = zeroize::Zeroizing<Vec<u8>>;

/// Wipe a buffer in place. For buffers whose ownership we can't wrap
/// in a [`Secret`], such as a payload sitting inside a protocol
/// message that has already been written to a peer.
pub fn scrub(buf: &mut [u8]) {
    buf.zeroize();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scrub_zeroes_in_place() {
        let mut buf = vec![0xa5u8; 64];
        scrub(&mut buf);
        assert!(buf.iter().all(|b| *b == 0));
        // the buffer is still usable afterwards, just empty of data
        assert_eq!(buf.len(), 64);
    }
}
