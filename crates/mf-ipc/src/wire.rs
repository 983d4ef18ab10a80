//! Message framing.
//!
//! A command is `[i32 token][i32 length][payload]`, a result is
//! `[i64 value][i32 length][payload]`. All integers are little-endian.
//! A handful of tokens are reserved for the transport itself and never
//! reach a handler; see [`EXIT_CODE`] and friends.

use bytes::{Buf, BufMut, BytesMut};
use std::io::{self, Read, Write};

/// Result value meaning "the peer is gone". No peer ever sends it.
pub const READ_RESULT_FAILED: i64 = i64::MIN;

/// Ask the peer to leave its command loop.
pub const EXIT_CODE: i32 = 0x7fff;
/// Relay the enclosed command to a peer held by the receiver.
pub const FORWARD_COMMAND: i32 = 0x7ffe;
/// Inside a forward envelope: read the next result of the peer.
pub const READ_RESULT: i32 = 0x7ffd;
/// Answer to a callback that asked for one.
pub const CONTINUATION: i32 = 0x7ffc;

/// First value of the callback band.
///
/// A callback result encodes `CALLBACK_BASE + (wants_continuation << 32) + tag`.
pub const CALLBACK_BASE: i64 = 0x4000_0000_0000_0000;
/// First value of the failure band; a failure with status `code` is sent
/// as `FAILURE_BASE - code` with the message as payload.
pub const FAILURE_BASE: i64 = -0x4000_0000_0000_0000;

pub const COMMAND_HEADER_LEN: usize = 8;
pub const RESULT_HEADER_LEN: usize = 12;

const MAX_PAYLOAD: usize = 1 << 30;

/// A command read by the child loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub token: i32,
    pub payload: Vec<u8>,
}

/// A result read by the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub value: i64,
    pub payload: Vec<u8>,
}

/// What a [`Reply`] value means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    /// An ordinary result.
    Value(i64),
    /// The handler failed; `code` is the status it reported.
    Failure { code: i64, message: String },
    /// An intermediate callback from inside a running command.
    Callback { tag: u32, wants_continuation: bool },
    /// The peer died or the channel broke.
    Lost,
}

impl Reply {
    pub fn ok(value: i64, payload: Vec<u8>) -> Self {
        debug_assert!(
            value > FAILURE_BASE && value < CALLBACK_BASE,
            "value {value} collides with a reserved band"
        );
        Self { value, payload }
    }

    pub fn failure(code: i64, message: &str) -> Self {
        Self {
            value: FAILURE_BASE - code.clamp(0, i64::from(i32::MAX)),
            payload: message.as_bytes().to_vec(),
        }
    }

    pub fn callback(tag: u32, wants_continuation: bool, payload: Vec<u8>) -> Self {
        Self {
            value: CALLBACK_BASE + ((wants_continuation as i64) << 32) + tag as i64,
            payload,
        }
    }

    pub fn lost() -> Self {
        Self {
            value: READ_RESULT_FAILED,
            payload: Vec::new(),
        }
    }

    pub fn kind(&self) -> ReplyKind {
        let value = self.value;
        if value == READ_RESULT_FAILED {
            ReplyKind::Lost
        } else if value >= CALLBACK_BASE {
            let offset = value - CALLBACK_BASE;
            ReplyKind::Callback {
                tag: (offset & 0xffff_ffff) as u32,
                wants_continuation: (offset >> 32) & 1 == 1,
            }
        } else if value <= FAILURE_BASE {
            ReplyKind::Failure {
                code: FAILURE_BASE - value,
                message: String::from_utf8_lossy(&self.payload).into_owned(),
            }
        } else {
            ReplyKind::Value(value)
        }
    }

    pub fn is_lost(&self) -> bool {
        self.value == READ_RESULT_FAILED
    }
}

/// Write one command as a single buffer.
pub fn write_command<W: Write>(writer: &mut W, token: i32, payload: &[u8]) -> io::Result<()> {
    let mut frame = BytesMut::with_capacity(COMMAND_HEADER_LEN + payload.len());
    frame.put_i32_le(token);
    frame.put_i32_le(payload_len(payload)?);
    frame.put_slice(payload);
    writer.write_all(&frame)?;
    writer.flush()
}

/// Write one result as a single buffer.
pub fn write_reply<W: Write>(writer: &mut W, value: i64, payload: &[u8]) -> io::Result<()> {
    let mut frame = BytesMut::with_capacity(RESULT_HEADER_LEN + payload.len());
    frame.put_i64_le(value);
    frame.put_i32_le(payload_len(payload)?);
    frame.put_slice(payload);
    writer.write_all(&frame)?;
    writer.flush()
}

/// Read one command. `keep_waiting` is consulted each time the reader's
/// timeout expires; returning false abandons the read with `TimedOut`.
pub fn read_command<R: Read>(
    reader: &mut R,
    keep_waiting: &mut dyn FnMut() -> bool,
) -> io::Result<Command> {
    let mut header = [0u8; COMMAND_HEADER_LEN];
    read_exact_polling(reader, &mut header, keep_waiting)?;
    let mut fields = &header[..];
    let token = fields.get_i32_le();
    let len = fields.get_i32_le();
    let payload = read_payload(reader, len, keep_waiting)?;
    Ok(Command { token, payload })
}

/// Read one result, polling like [`read_command`].
pub fn read_reply<R: Read>(
    reader: &mut R,
    keep_waiting: &mut dyn FnMut() -> bool,
) -> io::Result<Reply> {
    let mut header = [0u8; RESULT_HEADER_LEN];
    read_exact_polling(reader, &mut header, keep_waiting)?;
    let mut fields = &header[..];
    let value = fields.get_i64_le();
    let len = fields.get_i32_le();
    let payload = read_payload(reader, len, keep_waiting)?;
    Ok(Reply { value, payload })
}

/// Envelope of a [`FORWARD_COMMAND`]: `[u64 peer][i32 token][i32 len][payload]`.
pub fn encode_forward(peer: u64, token: i32, payload: &[u8]) -> Vec<u8> {
    let mut envelope = BytesMut::with_capacity(8 + COMMAND_HEADER_LEN + payload.len());
    envelope.put_u64_le(peer);
    envelope.put_i32_le(token);
    envelope.put_i32_le(payload.len() as i32);
    envelope.put_slice(payload);
    envelope.to_vec()
}

pub fn decode_forward(envelope: &[u8]) -> io::Result<(u64, Command)> {
    let mut reader = envelope;
    if reader.remaining() < 8 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "forward envelope too short",
        ));
    }
    let peer = reader.get_u64_le();
    let command = read_command(&mut reader, &mut || false)?;
    if reader.has_remaining() {
        return Err(invalid(format!(
            "{} trailing bytes after forwarded command",
            reader.remaining()
        )));
    }
    Ok((peer, command))
}

fn payload_len(payload: &[u8]) -> io::Result<i32> {
    if payload.len() > MAX_PAYLOAD {
        return Err(invalid(format!("payload of {} bytes is too large", payload.len())));
    }
    Ok(payload.len() as i32)
}

fn read_payload<R: Read>(
    reader: &mut R,
    len: i32,
    keep_waiting: &mut dyn FnMut() -> bool,
) -> io::Result<Vec<u8>> {
    let len = usize::try_from(len).map_err(|_| invalid(format!("negative payload length {len}")))?;
    if len > MAX_PAYLOAD {
        return Err(invalid(format!("payload length {len} exceeds limit")));
    }
    let mut payload = vec![0u8; len];
    read_exact_polling(reader, &mut payload, keep_waiting)?;
    Ok(payload)
}

fn read_exact_polling<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    keep_waiting: &mut dyn FnMut() -> bool,
) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the channel",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if !keep_waiting() {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "gave up waiting for peer"));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn command_frame_layout() {
        let mut buf = Vec::new();
        write_command(&mut buf, 3, b"abc").unwrap();
        assert_eq!(&buf[..4], &3i32.to_le_bytes());
        assert_eq!(&buf[4..8], &3i32.to_le_bytes());
        assert_eq!(&buf[8..], b"abc");

        let cmd = read_command(&mut buf.as_slice(), &mut || true).unwrap();
        assert_eq!(cmd, Command { token: 3, payload: b"abc".to_vec() });
    }

    #[test]
    fn reply_frame_layout() {
        let mut buf = Vec::new();
        write_reply(&mut buf, -2, &[]).unwrap();
        assert_eq!(buf.len(), RESULT_HEADER_LEN);
        let reply = read_reply(&mut buf.as_slice(), &mut || true).unwrap();
        assert_eq!(reply.kind(), ReplyKind::Value(-2));
    }

    #[test]
    fn truncated_frame_is_eof() {
        let mut buf = Vec::new();
        write_command(&mut buf, 1, b"payload").unwrap();
        buf.truncate(10);
        let err = read_command(&mut buf.as_slice(), &mut || true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(1);
        buf.put_i32_le(-5);
        let buf = buf.to_vec();
        let err = read_command(&mut buf.as_slice(), &mut || true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn reply_bands_do_not_overlap() {
        assert_eq!(Reply::lost().kind(), ReplyKind::Lost);
        assert_eq!(Reply::ok(0, vec![]).kind(), ReplyKind::Value(0));
        assert_eq!(Reply::ok(-1, vec![]).kind(), ReplyKind::Value(-1));
        assert_eq!(
            Reply::ok(i64::from(i32::MAX) * 4, vec![]).kind(),
            ReplyKind::Value(i64::from(i32::MAX) * 4)
        );

        assert_matches!(
            Reply::failure(5, "decoder crashed").kind(),
            ReplyKind::Failure { code: 5, message } if message == "decoder crashed"
        );
        assert_matches!(
            Reply::failure(0, "").kind(),
            ReplyKind::Failure { code: 0, .. }
        );
        assert_eq!(
            Reply::callback(7, true, vec![]).kind(),
            ReplyKind::Callback { tag: 7, wants_continuation: true }
        );
        assert_eq!(
            Reply::callback(u32::MAX, false, vec![]).kind(),
            ReplyKind::Callback { tag: u32::MAX, wants_continuation: false }
        );
    }

    #[test]
    fn sentinel_is_never_a_failure_code() {
        // The most negative failure any status can produce stays above MIN.
        let worst = Reply::failure(i64::from(i32::MAX), "x");
        assert_ne!(worst.value, READ_RESULT_FAILED);
        assert!(!worst.is_lost());
    }

    #[test]
    fn forward_envelope_round_trip() {
        let envelope = encode_forward(42, 9, b"inner");
        let (peer, cmd) = decode_forward(&envelope).unwrap();
        assert_eq!(peer, 42);
        assert_eq!(cmd.token, 9);
        assert_eq!(cmd.payload, b"inner");

        let mut trailing = envelope.clone();
        trailing.push(0);
        assert!(decode_forward(&trailing).is_err());
    }
}
