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

use anyhow::anyhow;

/// The largest payload a Text or Reply message may carry.
///
/// The length prefix on the wire is a 32 bit unsigned word, but the
/// protocol only admits lengths that fit in an i32 so that no peer
/// ever has to reason about a negative length.
pub const MAX_PAYLOAD: u32 = i32::MAX as u32;

/// MessageKind is the tag that leads every frame on both the
/// client<->broker stream and the broker<->worker socketpair.
///
/// The numeric values are fixed by the protocol and must never be
/// renumbered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Ends a protocol phase. Carries a 4 byte status word; the first
    /// Finish on a connection closes the authentication phase, the
    /// second ends the command loop and the stream.
    Finish = 1,
    /// Free text for the user. Carries a 4 byte length prefix followed
    /// by that many bytes of payload.
    Text = 2,
    /// Asks the peer for a reply. Carries a 4 byte echo word (0 means
    /// the reply must not be displayed while typed).
    Prompt = 3,
    /// The answer to a Prompt. Same framing as Text.
    Reply = 4,
}

impl TryFrom<u32> for MessageKind {
    type Error = anyhow::Error;

    fn try_from(v: u32) -> anyhow::Result<Self> {
        match v {
            1 => Ok(MessageKind::Finish),
            2 => Ok(MessageKind::Text),
            3 => Ok(MessageKind::Prompt),
            4 => Ok(MessageKind::Reply),
            _ => Err(anyhow!("unknown MessageKind {}", v)),
        }
    }
}

/// Message is one frame of conversation traffic.
///
/// format:
///
/// ```text
/// native endian 4 byte word: kind tag
/// Finish: native endian 4 byte word: status
/// Prompt: native endian 4 byte word: echo flag (0/1)
/// Text/Reply: native endian 4 byte word: length prefix
///             N bytes: payload
/// ```
///
/// Integers are native endian because the channel is always a local
/// stream socket; nothing here ever crosses a machine boundary.
/// Payloads are opaque bytes, no encoding is imposed.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    Finish(i32),
    Text(Vec<u8>),
    Prompt(bool),
    Reply(Vec<u8>),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Finish(_) => MessageKind::Finish,
            Message::Text(_) => MessageKind::Text,
            Message::Prompt(_) => MessageKind::Prompt,
            Message::Reply(_) => MessageKind::Reply,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_tags_are_fixed() {
        let cases =
            vec![(1, MessageKind::Finish), (2, MessageKind::Text), (3, MessageKind::Prompt), (4, MessageKind::Reply)];
        for (tag, kind) in cases {
            assert_eq!(kind as u32, tag);
            assert_eq!(MessageKind::try_from(tag).expect("tag to parse"), kind);
        }
    }

    #[test]
    fn unknown_tags_are_rejected() {
        for tag in [0u32, 5, 42, u32::MAX] {
            assert!(MessageKind::try_from(tag).is_err());
        }
    }
}
