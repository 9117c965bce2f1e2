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
    fmt, io,
    io::{Read, Write},
    os::unix::net::UnixStream,
    time,
};

use byteorder::{NativeEndian, ReadBytesExt as _, WriteBytesExt as _};
use netlogind_protocol::{Message, MessageKind, MAX_PAYLOAD};

/// The errors a codec call can produce. The codec never terminates the
/// process; every condition propagates so the owning process can decide
/// what is fatal to it.
#[derive(Debug)]
pub enum ProtocolError {
    /// The peer closed the stream on a frame boundary.
    Eof,
    /// The frame structure was bad: an unknown tag, an over-length
    /// payload, or a stream that ended mid frame.
    Malformed(String),
    /// A well formed message arrived where the protocol does not
    /// allow it.
    UnexpectedMessage { want: MessageKind, got: MessageKind },
    /// The read deadline expired before a full frame arrived.
    TimedOut,
    Io(io::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Eof => write!(f, "peer closed the stream"),
            ProtocolError::Malformed(reason) => write!(f, "malformed frame: {reason}"),
            ProtocolError::UnexpectedMessage { want, got } => {
                write!(f, "unexpected message: want {want:?}, got {got:?}")
            }
            ProtocolError::TimedOut => write!(f, "timed out waiting for a frame"),
            ProtocolError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ProtocolError::TimedOut,
            _ => ProtocolError::Io(e),
        }
    }
}

// Maps errors from reads that happen after a frame has started, where
// running out of bytes means a truncated frame rather than a clean
// end of stream.
fn mid_frame(e: io::Error) -> ProtocolError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::Malformed(String::from("stream ended mid frame"))
    } else {
        ProtocolError::from(e)
    }
}

/// Methods for the Message protocol enum. Protocol types are always
/// bare data, so we use an ext trait to mix in the framing.
///
/// Reads and writes are blocking. Signal interruption is retried
/// transparently and partial writes are always completed, so a
/// successful return means the whole frame moved.
pub trait MessageExt: Sized {
    fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: Write;

    fn read_from<R>(r: &mut R) -> Result<Self, ProtocolError>
    where
        R: Read;
}

impl MessageExt for Message {
    fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        w.write_u32::<NativeEndian>(self.kind() as u32)?;
        match self {
            Message::Finish(status) => w.write_i32::<NativeEndian>(*status)?,
            Message::Prompt(echo) => w.write_u32::<NativeEndian>(u32::from(*echo))?,
            Message::Text(payload) | Message::Reply(payload) => {
                if payload.len() > MAX_PAYLOAD as usize {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("payload of {} bytes exceeds the protocol maximum", payload.len()),
                    ));
                }
                w.write_u32::<NativeEndian>(payload.len() as u32)?;
                w.write_all(payload)?;
            }
        }

        Ok(())
    }

    fn read_from<R>(r: &mut R) -> Result<Self, ProtocolError>
    where
        R: Read,
    {
        let tag = match read_leading_word(r)? {
            Some(tag) => tag,
            None => return Err(ProtocolError::Eof),
        };
        let kind = MessageKind::try_from(tag)
            .map_err(|_| ProtocolError::Malformed(format!("unknown message tag {tag}")))?;

        match kind {
            MessageKind::Finish => {
                Ok(Message::Finish(r.read_i32::<NativeEndian>().map_err(mid_frame)?))
            }
            MessageKind::Prompt => {
                Ok(Message::Prompt(r.read_u32::<NativeEndian>().map_err(mid_frame)? != 0))
            }
            MessageKind::Text => Ok(Message::Text(read_payload(r)?)),
            MessageKind::Reply => Ok(Message::Reply(read_payload(r)?)),
        }
    }
}

// Reads the tag word by hand so that a clean close between frames
// (zero bytes read) can be told apart from a close mid frame.
fn read_leading_word<R>(r: &mut R) -> Result<Option<u32>, ProtocolError>
where
    R: Read,
{
    let mut buf = [0u8; 4];
    let mut nread = 0;
    while nread == 0 {
        match r.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(n) => nread = n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::from(e)),
        }
    }
    r.read_exact(&mut buf[nread..]).map_err(mid_frame)?;

    Ok(Some(u32::from_ne_bytes(buf)))
}

fn read_payload<R>(r: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: Read,
{
    let len = r.read_u32::<NativeEndian>().map_err(mid_frame)?;
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::Malformed(format!(
            "payload length {len} exceeds the protocol maximum of {MAX_PAYLOAD}"
        )));
    }

    let len = len as usize;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| ProtocolError::Malformed(format!("cannot buffer a {len} byte payload")))?;
    buf.resize(len, 0);
    r.read_exact(&mut buf).map_err(mid_frame)?;

    Ok(buf)
}

/// One owned end of a message channel: either the client<->broker
/// socket or one side of the broker<->worker socketpair. Exactly one
/// process owns an endpoint at a time; after a fork the non-owning
/// side must drop its copy immediately.
///
/// An endpoint can carry a read deadline. Rather than juggling SIGALRM
/// handlers, the remaining time is applied to each blocking read and
/// expiry surfaces as [`ProtocolError::TimedOut`] for the owner to
/// treat as fatal.
pub struct MessageStream {
    stream: UnixStream,
    deadline: Option<time::Instant>,
}

impl MessageStream {
    pub fn new(stream: UnixStream) -> Self {
        MessageStream { stream, deadline: None }
    }

    /// Arm or disarm the read deadline.
    pub fn set_deadline(&mut self, deadline: Option<time::Instant>) {
        self.deadline = deadline;
    }

    pub fn read_message(&mut self) -> Result<Message, ProtocolError> {
        match self.deadline {
            Some(deadline) => {
                let now = time::Instant::now();
                if now >= deadline {
                    return Err(ProtocolError::TimedOut);
                }
                self.stream.set_read_timeout(Some(deadline - now))?;
            }
            None => self.stream.set_read_timeout(None)?,
        }

        Message::read_from(&mut self.stream)
    }

    /// Reads the next message, which the protocol requires to be a
    /// Reply, and hands back its payload.
    pub fn read_reply(&mut self) -> Result<Vec<u8>, ProtocolError> {
        match self.read_message()? {
            Message::Reply(payload) => Ok(payload),
            other => {
                Err(ProtocolError::UnexpectedMessage { want: MessageKind::Reply, got: other.kind() })
            }
        }
    }

    pub fn write_message(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        msg.write_to(&mut self.stream).map_err(ProtocolError::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_round_trip() {
        let cases = vec![
            Message::Finish(0),
            Message::Finish(1),
            Message::Finish(-1),
            Message::Text(Vec::from(&b"Username: "[..])),
            Message::Text(vec![]),
            Message::Prompt(true),
            Message::Prompt(false),
            Message::Reply(Vec::from(&b"alice"[..])),
            Message::Reply(vec![]),
        ];

        for msg in cases {
            let mut wire = io::Cursor::new(vec![]);
            msg.write_to(&mut wire).expect("write to succeed");
            wire.set_position(0);
            let round_tripped = Message::read_from(&mut wire).expect("parse to succeed");
            assert_eq!(msg, round_tripped);
        }
    }

    #[test]
    fn clean_eof_between_frames() {
        let mut wire = io::Cursor::new(vec![]);
        match Message::read_from(&mut wire) {
            Err(ProtocolError::Eof) => {}
            other => panic!("want Eof, got {other:?}"),
        }
    }

    #[test]
    fn eof_mid_frame_is_malformed() {
        let mut wire = io::Cursor::new(vec![]);
        Message::Text(Vec::from(&b"truncate me"[..])).write_to(&mut wire).expect("write");
        let mut bytes = wire.into_inner();
        bytes.truncate(6);

        let mut wire = io::Cursor::new(bytes);
        match Message::read_from(&mut wire) {
            Err(ProtocolError::Malformed(_)) => {}
            other => panic!("want Malformed, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let mut wire = io::Cursor::new(vec![]);
        wire.write_u32::<NativeEndian>(9).expect("write");
        wire.set_position(0);
        match Message::read_from(&mut wire) {
            Err(ProtocolError::Malformed(_)) => {}
            other => panic!("want Malformed, got {other:?}"),
        }
    }

    #[test]
    fn over_length_payload_is_malformed() {
        let mut wire = io::Cursor::new(vec![]);
        wire.write_u32::<NativeEndian>(MessageKind::Reply as u32).expect("write");
        // one past the maximum: 2^31
        wire.write_u32::<NativeEndian>(MAX_PAYLOAD + 1).expect("write");
        wire.set_position(0);
        match Message::read_from(&mut wire) {
            Err(ProtocolError::Malformed(reason)) => {
                assert!(reason.contains("exceeds"));
            }
            other => panic!("want Malformed, got {other:?}"),
        }
    }

    #[test]
    fn deadline_expiry_times_out() {
        let (a, _b) = UnixStream::pair().expect("socketpair");
        let mut stream = MessageStream::new(a);
        stream.set_deadline(Some(time::Instant::now() + time::Duration::from_millis(20)));

        // nothing ever arrives, so both reads must time out: one
        // against the socket timeout, one against the expired deadline
        match stream.read_message() {
            Err(ProtocolError::TimedOut) => {}
            other => panic!("want TimedOut, got {other:?}"),
        }
        match stream.read_message() {
            Err(ProtocolError::TimedOut) => {}
            other => panic!("want TimedOut, got {other:?}"),
        }
    }

    #[test]
    fn stream_round_trip() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        let mut tx = MessageStream::new(a);
        let mut rx = MessageStream::new(b);

        tx.write_message(&Message::Text(Vec::from(&b"Command: "[..]))).expect("write");
        tx.write_message(&Message::Prompt(true)).expect("write");
        assert_eq!(rx.read_message().expect("read"), Message::Text(Vec::from(&b"Command: "[..])));
        assert_eq!(rx.read_message().expect("read"), Message::Prompt(true));

        tx.write_message(&Message::Reply(Vec::from(&b"/bin/true"[..]))).expect("write");
        assert_eq!(rx.read_reply().expect("read reply"), Vec::from(&b"/bin/true"[..]));

        // read_reply refuses anything that is not a Reply
        tx.write_message(&Message::Finish(0)).expect("write");
        match rx.read_reply() {
            Err(ProtocolError::UnexpectedMessage { want, got }) => {
                assert_eq!(want, MessageKind::Reply);
                assert_eq!(got, MessageKind::Finish);
            }
            other => panic!("want UnexpectedMessage, got {other:?}"),
        }
    }
}
