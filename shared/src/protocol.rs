//! Binary wire protocol shared by the server and the client
//!
//! Every message is a 4-byte header followed by a fixed-size body:
//!
//! ```text
//! +-----------+----------------+------------------------+
//! | kind: u16 | body_len: u16  | body (body_len bytes)  |
//! +-----------+----------------+------------------------+
//! ```
//!
//! All multi-byte integers travel in network byte order (big-endian).
//! String fields are fixed-size, NUL-padded buffers which must contain at
//! least one NUL byte within their bound. The body length of every kind is
//! fixed, so a header announcing any other length is rejected before the
//! body is read.
//!
//! A framing error leaves the stream in an unknown position; callers must
//! treat the connection as unusable after any [`ProtocolError`] other than
//! [`ProtocolError::WouldBlock`].

use bytes::{Buf, BufMut, BytesMut};
use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use thiserror::Error;

/// Size of the message header on the wire
pub const HEADER_LEN: usize = 4;
/// Size of every nickname buffer, terminator included
pub const NICKNAME_LEN: usize = 32;
/// Size of the chat text buffer, terminator included
pub const TEXT_LEN: usize = 128;
/// Maximum number of entries carried by one `UserChangeBatch`
pub const USER_CHANGE_MAX: usize = 16;

const USER_CHANGE_ENTRY_LEN: usize = NICKNAME_LEN + 2 + 2 + 4;

/// Errors raised while framing messages on a byte stream
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("no data pending")]
    WouldBlock,
    #[error("connection closed by peer")]
    Closed,
    #[error("unknown message kind {0}")]
    UnknownKind(u16),
    #[error("body length {actual} does not match {expected} for {kind:?}")]
    BodyLengthMismatch {
        kind: MessageKind,
        expected: usize,
        actual: usize,
    },
    #[error("unterminated string field `{0}`")]
    Unterminated(&'static str),
    #[error("user change count {0} out of range")]
    CountOutOfRange(u32),
    #[error("invalid value {value} for field `{field}`")]
    InvalidField { field: &'static str, value: u16 },
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

/// Message kind tag carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    Join = 1,
    JoinReply = 2,
    Quit = 3,
    UserChangeBatch = 4,
    Challenge = 5,
    ChallengeReply = 6,
    Turn = 7,
    TurnResult = 8,
    SendText = 9,
}

impl MessageKind {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(MessageKind::Join),
            2 => Some(MessageKind::JoinReply),
            3 => Some(MessageKind::Quit),
            4 => Some(MessageKind::UserChangeBatch),
            5 => Some(MessageKind::Challenge),
            6 => Some(MessageKind::ChallengeReply),
            7 => Some(MessageKind::Turn),
            8 => Some(MessageKind::TurnResult),
            9 => Some(MessageKind::SendText),
            _ => None,
        }
    }

    /// Fixed body size for this kind
    pub fn body_len(self) -> usize {
        match self {
            MessageKind::Join => NICKNAME_LEN,
            MessageKind::JoinReply => NICKNAME_LEN + 2 + 2 + 4,
            MessageKind::Quit => 4 + 2,
            MessageKind::UserChangeBatch => 4 + USER_CHANGE_MAX * USER_CHANGE_ENTRY_LEN,
            MessageKind::Challenge => 2 + 2 + 4 + 2 + 2,
            MessageKind::ChallengeReply => 2 + 2 + 2 + 2 + 1,
            MessageKind::Turn => 2 + 2 + 4 + 2 + 2,
            MessageKind::TurnResult => 2 * 5 + 4 * 4 + 1,
            MessageKind::SendText => 2 + 4 + TEXT_LEN,
        }
    }
}

/// Result codes carried inside reply messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Ok = 0,
    DuplicateNickname = 1,
    NonexistentNickname = 2,
    IllegalNickname = 3,
    NonexistentId = 4,
    IncorrectKey = 5,
    NonexistentChallengeId = 6,
    TooManyUsers = 7,
    JoinedTwice = 8,
    Engaged = 9,
    ChallengingSelf = 10,
    InvalidArgument = 11,
    Rejected = 12,
    Cancelled = 13,
    Other = 14,
}

impl ErrorCode {
    /// Decodes a raw code; anything outside the known range is `Other`
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0 => ErrorCode::Ok,
            1 => ErrorCode::DuplicateNickname,
            2 => ErrorCode::NonexistentNickname,
            3 => ErrorCode::IllegalNickname,
            4 => ErrorCode::NonexistentId,
            5 => ErrorCode::IncorrectKey,
            6 => ErrorCode::NonexistentChallengeId,
            7 => ErrorCode::TooManyUsers,
            8 => ErrorCode::JoinedTwice,
            9 => ErrorCode::Engaged,
            10 => ErrorCode::ChallengingSelf,
            11 => ErrorCode::InvalidArgument,
            12 => ErrorCode::Rejected,
            13 => ErrorCode::Cancelled,
            _ => ErrorCode::Other,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::DuplicateNickname => "Duplicate nickname",
            ErrorCode::NonexistentNickname => "Non-existent nickname",
            ErrorCode::IllegalNickname => "Illegal nickname",
            ErrorCode::NonexistentId => "Non-existent ID",
            ErrorCode::IncorrectKey => "Incorrect key",
            ErrorCode::NonexistentChallengeId => "Non-existent challenge ID",
            ErrorCode::TooManyUsers => "Too many users online",
            ErrorCode::JoinedTwice => "Joining twice on the same client",
            ErrorCode::Engaged => "User is engaged in another battle",
            ErrorCode::ChallengingSelf => "Challenging oneself",
            ErrorCode::InvalidArgument => "Invalid argument",
            ErrorCode::Rejected => "Challenge is rejected",
            ErrorCode::Cancelled => "Challenge has been cancelled",
            ErrorCode::Other => "Other errors",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Lifecycle state of a user as seen on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum UserState {
    Offline = 0,
    Online = 1,
    Battling = 2,
}

impl UserState {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(UserState::Offline),
            1 => Some(UserState::Online),
            2 => Some(UserState::Battling),
            _ => None,
        }
    }
}

/// Action field of a `Challenge` message.
///
/// Unknown raw values are preserved so the server can answer them with
/// `InvalidArgument` instead of dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeAction {
    Start,
    Reject,
    Accept,
    Cancel,
    Unknown(u16),
}

impl From<u16> for ChallengeAction {
    fn from(raw: u16) -> Self {
        match raw {
            0 => ChallengeAction::Start,
            1 => ChallengeAction::Reject,
            2 => ChallengeAction::Accept,
            3 => ChallengeAction::Cancel,
            other => ChallengeAction::Unknown(other),
        }
    }
}

impl From<ChallengeAction> for u16 {
    fn from(action: ChallengeAction) -> u16 {
        match action {
            ChallengeAction::Start => 0,
            ChallengeAction::Reject => 1,
            ChallengeAction::Accept => 2,
            ChallengeAction::Cancel => 3,
            ChallengeAction::Unknown(raw) => raw,
        }
    }
}

/// A rock-paper-scissors move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BattleAction {
    Rock,
    Paper,
    Scissors,
    Unknown(u16),
}

impl BattleAction {
    pub fn name(self) -> &'static str {
        match self {
            BattleAction::Rock => "Rock",
            BattleAction::Paper => "Paper",
            BattleAction::Scissors => "Scissors",
            BattleAction::Unknown(_) => "<unknown>",
        }
    }
}

impl From<u16> for BattleAction {
    fn from(raw: u16) -> Self {
        match raw {
            0 => BattleAction::Rock,
            1 => BattleAction::Paper,
            2 => BattleAction::Scissors,
            other => BattleAction::Unknown(other),
        }
    }
}

impl From<BattleAction> for u16 {
    fn from(action: BattleAction) -> u16 {
        match action {
            BattleAction::Rock => 0,
            BattleAction::Paper => 1,
            BattleAction::Scissors => 2,
            BattleAction::Unknown(raw) => raw,
        }
    }
}

/// One roster entry inside a `UserChangeBatch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserChange {
    pub nickname: String,
    pub id: u16,
    pub state: UserState,
    pub score: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Join {
        nickname: String,
    },
    JoinReply {
        nickname: String,
        error: ErrorCode,
        id: u16,
        key: u32,
    },
    Quit {
        key: u32,
        id: u16,
    },
    /// At most [`USER_CHANGE_MAX`] entries; see [`user_change_batches`]
    UserChangeBatch {
        users: Vec<UserChange>,
    },
    Challenge {
        id1: u16,
        id2: u16,
        key: u32,
        challenge_id: u16,
        action: ChallengeAction,
    },
    ChallengeReply {
        error: ErrorCode,
        id1: u16,
        id2: u16,
        challenge_id: u16,
        is_challenger: bool,
    },
    Turn {
        user: u16,
        challenge_id: u16,
        key: u32,
        turn_no: u16,
        action: BattleAction,
    },
    TurnResult {
        challenge_id: u16,
        turn_no: u16,
        action1: BattleAction,
        action2: BattleAction,
        winner: u16,
        hp1: i32,
        hp2: i32,
        maxhp1: i32,
        maxhp2: i32,
        finished: bool,
    },
    SendText {
        id: u16,
        key: u32,
        text: String,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Join { .. } => MessageKind::Join,
            Message::JoinReply { .. } => MessageKind::JoinReply,
            Message::Quit { .. } => MessageKind::Quit,
            Message::UserChangeBatch { .. } => MessageKind::UserChangeBatch,
            Message::Challenge { .. } => MessageKind::Challenge,
            Message::ChallengeReply { .. } => MessageKind::ChallengeReply,
            Message::Turn { .. } => MessageKind::Turn,
            Message::TurnResult { .. } => MessageKind::TurnResult,
            Message::SendText { .. } => MessageKind::SendText,
        }
    }
}

/// Splits roster entries into as many `UserChangeBatch` messages as needed
pub fn user_change_batches<I>(entries: I) -> Vec<Message>
where
    I: IntoIterator<Item = UserChange>,
{
    let mut batches = Vec::new();
    let mut current = Vec::with_capacity(USER_CHANGE_MAX);
    for entry in entries {
        if current.len() == USER_CHANGE_MAX {
            batches.push(Message::UserChangeBatch {
                users: std::mem::replace(&mut current, Vec::with_capacity(USER_CHANGE_MAX)),
            });
        }
        current.push(entry);
    }
    if !current.is_empty() {
        batches.push(Message::UserChangeBatch { users: current });
    }
    batches
}

fn put_fixed_str(buf: &mut BytesMut, value: &str, len: usize) {
    // Keep at least one NUL inside the bound, cutting on a char boundary.
    let mut end = value.len().min(len - 1);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_slice(&value.as_bytes()[..end]);
    buf.put_bytes(0, len - end);
}

fn get_fixed_str(buf: &mut &[u8], len: usize, field: &'static str) -> Result<String, ProtocolError> {
    let raw = &buf[..len];
    let end = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::Unterminated(field))?;
    let value = String::from_utf8_lossy(&raw[..end]).into_owned();
    buf.advance(len);
    Ok(value)
}

/// Serializes a message (header and body) in network byte order
pub fn encode(message: &Message) -> BytesMut {
    let kind = message.kind();
    let body_len = kind.body_len();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
    buf.put_u16(kind as u16);
    buf.put_u16(body_len as u16);

    match message {
        Message::Join { nickname } => {
            put_fixed_str(&mut buf, nickname, NICKNAME_LEN);
        }
        Message::JoinReply {
            nickname,
            error,
            id,
            key,
        } => {
            put_fixed_str(&mut buf, nickname, NICKNAME_LEN);
            buf.put_u16(*error as u16);
            buf.put_u16(*id);
            buf.put_u32(*key);
        }
        Message::Quit { key, id } => {
            buf.put_u32(*key);
            buf.put_u16(*id);
        }
        Message::UserChangeBatch { users } => {
            assert!(
                users.len() <= USER_CHANGE_MAX,
                "user change batch holds {} entries",
                users.len()
            );
            buf.put_u32(users.len() as u32);
            for user in users {
                put_fixed_str(&mut buf, &user.nickname, NICKNAME_LEN);
                buf.put_u16(user.id);
                buf.put_u16(user.state as u16);
                buf.put_i32(user.score);
            }
            buf.put_bytes(0, (USER_CHANGE_MAX - users.len()) * USER_CHANGE_ENTRY_LEN);
        }
        Message::Challenge {
            id1,
            id2,
            key,
            challenge_id,
            action,
        } => {
            buf.put_u16(*id1);
            buf.put_u16(*id2);
            buf.put_u32(*key);
            buf.put_u16(*challenge_id);
            buf.put_u16((*action).into());
        }
        Message::ChallengeReply {
            error,
            id1,
            id2,
            challenge_id,
            is_challenger,
        } => {
            buf.put_u16(*error as u16);
            buf.put_u16(*id1);
            buf.put_u16(*id2);
            buf.put_u16(*challenge_id);
            buf.put_u8(u8::from(*is_challenger));
        }
        Message::Turn {
            user,
            challenge_id,
            key,
            turn_no,
            action,
        } => {
            buf.put_u16(*user);
            buf.put_u16(*challenge_id);
            buf.put_u32(*key);
            buf.put_u16(*turn_no);
            buf.put_u16((*action).into());
        }
        Message::TurnResult {
            challenge_id,
            turn_no,
            action1,
            action2,
            winner,
            hp1,
            hp2,
            maxhp1,
            maxhp2,
            finished,
        } => {
            buf.put_u16(*challenge_id);
            buf.put_u16(*turn_no);
            buf.put_u16((*action1).into());
            buf.put_u16((*action2).into());
            buf.put_u16(*winner);
            buf.put_i32(*hp1);
            buf.put_i32(*hp2);
            buf.put_i32(*maxhp1);
            buf.put_i32(*maxhp2);
            buf.put_u8(u8::from(*finished));
        }
        Message::SendText { id, key, text } => {
            buf.put_u16(*id);
            buf.put_u32(*key);
            put_fixed_str(&mut buf, text, TEXT_LEN);
        }
    }

    debug_assert_eq!(buf.len(), HEADER_LEN + body_len);
    buf
}

/// Parses and validates a header, returning the kind and body length
pub fn decode_header(head: [u8; HEADER_LEN]) -> Result<(MessageKind, usize), ProtocolError> {
    let mut head = &head[..];
    let raw_kind = head.get_u16();
    let body_len = head.get_u16() as usize;
    let kind = MessageKind::from_u16(raw_kind).ok_or(ProtocolError::UnknownKind(raw_kind))?;
    if body_len != kind.body_len() {
        return Err(ProtocolError::BodyLengthMismatch {
            kind,
            expected: kind.body_len(),
            actual: body_len,
        });
    }
    Ok((kind, body_len))
}

/// Decodes a body whose header has already been validated
pub fn decode_body(kind: MessageKind, body: &[u8]) -> Result<Message, ProtocolError> {
    if body.len() != kind.body_len() {
        return Err(ProtocolError::BodyLengthMismatch {
            kind,
            expected: kind.body_len(),
            actual: body.len(),
        });
    }
    let mut buf = body;

    let message = match kind {
        MessageKind::Join => Message::Join {
            nickname: get_fixed_str(&mut buf, NICKNAME_LEN, "nickname")?,
        },
        MessageKind::JoinReply => Message::JoinReply {
            nickname: get_fixed_str(&mut buf, NICKNAME_LEN, "nickname")?,
            error: ErrorCode::from_u16(buf.get_u16()),
            id: buf.get_u16(),
            key: buf.get_u32(),
        },
        MessageKind::Quit => Message::Quit {
            key: buf.get_u32(),
            id: buf.get_u16(),
        },
        MessageKind::UserChangeBatch => {
            let count = buf.get_u32();
            if count as usize > USER_CHANGE_MAX {
                return Err(ProtocolError::CountOutOfRange(count));
            }
            let mut users = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let nickname = get_fixed_str(&mut buf, NICKNAME_LEN, "nickname")?;
                let id = buf.get_u16();
                let raw_state = buf.get_u16();
                let state = UserState::from_u16(raw_state).ok_or(ProtocolError::InvalidField {
                    field: "state",
                    value: raw_state,
                })?;
                let score = buf.get_i32();
                users.push(UserChange {
                    nickname,
                    id,
                    state,
                    score,
                });
            }
            Message::UserChangeBatch { users }
        }
        MessageKind::Challenge => Message::Challenge {
            id1: buf.get_u16(),
            id2: buf.get_u16(),
            key: buf.get_u32(),
            challenge_id: buf.get_u16(),
            action: ChallengeAction::from(buf.get_u16()),
        },
        MessageKind::ChallengeReply => Message::ChallengeReply {
            error: ErrorCode::from_u16(buf.get_u16()),
            id1: buf.get_u16(),
            id2: buf.get_u16(),
            challenge_id: buf.get_u16(),
            is_challenger: buf.get_u8() != 0,
        },
        MessageKind::Turn => Message::Turn {
            user: buf.get_u16(),
            challenge_id: buf.get_u16(),
            key: buf.get_u32(),
            turn_no: buf.get_u16(),
            action: BattleAction::from(buf.get_u16()),
        },
        MessageKind::TurnResult => Message::TurnResult {
            challenge_id: buf.get_u16(),
            turn_no: buf.get_u16(),
            action1: BattleAction::from(buf.get_u16()),
            action2: BattleAction::from(buf.get_u16()),
            winner: buf.get_u16(),
            hp1: buf.get_i32(),
            hp2: buf.get_i32(),
            maxhp1: buf.get_i32(),
            maxhp2: buf.get_i32(),
            finished: buf.get_u8() != 0,
        },
        MessageKind::SendText => Message::SendText {
            id: buf.get_u16(),
            key: buf.get_u32(),
            text: get_fixed_str(&mut buf, TEXT_LEN, "text")?,
        },
    };

    Ok(message)
}

/// Decodes one complete frame (header followed by body)
pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    if frame.len() < HEADER_LEN {
        return Err(ProtocolError::Closed);
    }
    let mut head = [0u8; HEADER_LEN];
    head.copy_from_slice(&frame[..HEADER_LEN]);
    let (kind, body_len) = decode_header(head)?;
    let body = &frame[HEADER_LEN..];
    if body.len() != body_len {
        return Err(ProtocolError::BodyLengthMismatch {
            kind,
            expected: body_len,
            actual: body.len(),
        });
    }
    decode_body(kind, body)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ProtocolError::Closed),
        Err(e) => Err(ProtocolError::Io(e)),
    }
}

/// Reads one message, blocking until it is complete
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, ProtocolError> {
    let mut head = [0u8; HEADER_LEN];
    read_full(reader, &mut head)?;
    read_after_header(reader, head)
}

fn read_after_header<R: Read>(reader: &mut R, head: [u8; HEADER_LEN]) -> Result<Message, ProtocolError> {
    let (kind, body_len) = decode_header(head)?;
    let mut body = vec![0u8; body_len];
    read_full(reader, &mut body)?;
    decode_body(kind, &body)
}

/// Receives one message from a socket.
///
/// With `block_at_head` unset the call returns [`ProtocolError::WouldBlock`]
/// when no byte of the next header is pending. Once the first byte has
/// arrived the rest of the message is always read in blocking mode.
pub fn recv_message(stream: &TcpStream, block_at_head: bool) -> Result<Message, ProtocolError> {
    let mut reader = stream;
    if block_at_head {
        return read_message(&mut reader);
    }

    let mut head = [0u8; HEADER_LEN];
    stream.set_nonblocking(true)?;
    let first = loop {
        match reader.read(&mut head) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            other => break other,
        }
    };
    stream.set_nonblocking(false)?;

    let got = match first {
        Ok(0) => return Err(ProtocolError::Closed),
        Ok(n) => n,
        Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(ProtocolError::WouldBlock),
        Err(e) => return Err(ProtocolError::Io(e)),
    };
    read_full(&mut reader, &mut head[got..])?;
    read_after_header(&mut reader, head)
}

/// Writes one message with a single write call; a partial write is an error
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), ProtocolError> {
    let frame = encode(message);
    let written = writer.write(&frame)?;
    if written != frame.len() {
        return Err(ProtocolError::ShortWrite {
            written,
            expected: frame.len(),
        });
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Join {
                nickname: "alice".to_string(),
            },
            Message::JoinReply {
                nickname: "alice".to_string(),
                error: ErrorCode::DuplicateNickname,
                id: 513,
                key: 0xdead_beef,
            },
            Message::Quit { key: 7, id: 9 },
            Message::UserChangeBatch {
                users: vec![
                    UserChange {
                        nickname: "bob".to_string(),
                        id: 2,
                        state: UserState::Battling,
                        score: -3,
                    },
                    UserChange {
                        nickname: "carol".to_string(),
                        id: 3,
                        state: UserState::Online,
                        score: 12,
                    },
                ],
            },
            Message::Challenge {
                id1: 1,
                id2: 2,
                key: 99,
                challenge_id: 300,
                action: ChallengeAction::Accept,
            },
            Message::ChallengeReply {
                error: ErrorCode::Cancelled,
                id1: 1,
                id2: 2,
                challenge_id: 300,
                is_challenger: true,
            },
            Message::Turn {
                user: 1,
                challenge_id: 300,
                key: 99,
                turn_no: 4,
                action: BattleAction::Scissors,
            },
            Message::TurnResult {
                challenge_id: 300,
                turn_no: 5,
                action1: BattleAction::Rock,
                action2: BattleAction::Paper,
                winner: 2,
                hp1: -1,
                hp2: 10,
                maxhp1: 10,
                maxhp2: 10,
                finished: true,
            },
            Message::SendText {
                id: 1,
                key: 0,
                text: "good game".to_string(),
            },
        ]
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        for message in sample_messages() {
            let frame = encode(&message);
            assert_eq!(frame.len(), HEADER_LEN + message.kind().body_len());
            let decoded = decode(&frame).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_header_is_network_order() {
        let frame = encode(&Message::Quit { key: 0x0102_0304, id: 0x0506 });
        assert_eq!(&frame[..4], &[0, 3, 0, 6]);
        assert_eq!(&frame[4..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_body_sizes_match_wire_layout() {
        assert_eq!(MessageKind::Join.body_len(), 32);
        assert_eq!(MessageKind::JoinReply.body_len(), 40);
        assert_eq!(MessageKind::Quit.body_len(), 6);
        assert_eq!(MessageKind::UserChangeBatch.body_len(), 644);
        assert_eq!(MessageKind::Challenge.body_len(), 12);
        assert_eq!(MessageKind::ChallengeReply.body_len(), 9);
        assert_eq!(MessageKind::Turn.body_len(), 12);
        assert_eq!(MessageKind::TurnResult.body_len(), 27);
        assert_eq!(MessageKind::SendText.body_len(), 134);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut frame = encode(&Message::Quit { key: 1, id: 1 });
        frame[1] = 42;
        assert!(matches!(decode(&frame), Err(ProtocolError::UnknownKind(42))));

        frame[1] = 0;
        assert!(matches!(decode(&frame), Err(ProtocolError::UnknownKind(0))));
    }

    #[test]
    fn test_wrong_body_length_rejected() {
        let mut frame = encode(&Message::Quit { key: 1, id: 1 });
        frame[3] = 7;
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::BodyLengthMismatch { expected: 6, actual: 7, .. })
        ));
    }

    #[test]
    fn test_unterminated_nickname_rejected() {
        let mut frame = encode(&Message::Join {
            nickname: "x".to_string(),
        });
        for byte in frame[HEADER_LEN..].iter_mut() {
            *byte = b'a';
        }
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::Unterminated("nickname"))
        ));
    }

    #[test]
    fn test_user_change_count_out_of_range() {
        let mut frame = encode(&Message::UserChangeBatch { users: vec![] });
        frame[HEADER_LEN + 3] = 17;
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::CountOutOfRange(17))
        ));
    }

    #[test]
    fn test_long_strings_are_truncated_with_terminator() {
        let long = "n".repeat(40);
        let frame = encode(&Message::Join { nickname: long });
        match decode(&frame).unwrap() {
            Message::Join { nickname } => assert_eq!(nickname.len(), NICKNAME_LEN - 1),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_unknown_actions_survive_roundtrip() {
        let message = Message::Challenge {
            id1: 1,
            id2: 2,
            key: 3,
            challenge_id: 0,
            action: ChallengeAction::Unknown(77),
        };
        assert_eq!(decode(&encode(&message)).unwrap(), message);
    }

    #[test]
    fn test_read_message_from_stream() {
        let mut bytes = Vec::new();
        let messages = sample_messages();
        for message in &messages {
            bytes.extend_from_slice(&encode(message));
        }

        let mut cursor = Cursor::new(bytes);
        for expected in &messages {
            assert_eq!(&read_message(&mut cursor).unwrap(), expected);
        }
        assert!(matches!(
            read_message(&mut cursor),
            Err(ProtocolError::Closed)
        ));
    }

    #[test]
    fn test_truncated_body_is_closed() {
        let frame = encode(&Message::Quit { key: 1, id: 2 });
        let mut cursor = Cursor::new(frame[..HEADER_LEN + 3].to_vec());
        assert!(matches!(
            read_message(&mut cursor),
            Err(ProtocolError::Closed)
        ));
    }

    #[test]
    fn test_user_change_batches_split_at_limit() {
        let entries = (0..40u16).map(|id| UserChange {
            nickname: format!("user{}", id),
            id,
            state: UserState::Online,
            score: 0,
        });
        let batches = user_change_batches(entries);
        let sizes: Vec<usize> = batches
            .iter()
            .map(|m| match m {
                Message::UserChangeBatch { users } => users.len(),
                _ => 0,
            })
            .collect();
        assert_eq!(sizes, vec![16, 16, 8]);
        assert!(user_change_batches(Vec::new()).is_empty());
    }

    #[test]
    fn test_error_code_descriptions() {
        assert_eq!(ErrorCode::from_u16(1), ErrorCode::DuplicateNickname);
        assert_eq!(ErrorCode::from_u16(500), ErrorCode::Other);
        assert_eq!(
            ErrorCode::Cancelled.to_string(),
            "Challenge has been cancelled"
        );
    }

    #[test]
    fn test_write_message_then_read_back() {
        let mut out = Vec::new();
        let message = Message::SendText {
            id: 4,
            key: 5,
            text: "hi".to_string(),
        };
        write_message(&mut out, &message).unwrap();
        assert_eq!(decode(&out).unwrap(), message);
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_recv_without_blocking_at_head() {
        let (mut client, server) = socket_pair();
        server
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        assert!(matches!(
            recv_message(&server, false),
            Err(ProtocolError::WouldBlock)
        ));

        let quit = Message::Quit { key: 1, id: 2 };
        write_message(&mut client, &quit).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let received = loop {
            match recv_message(&server, false) {
                Err(ProtocolError::WouldBlock) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5))
                }
                other => break other,
            }
        };
        assert_eq!(received.unwrap(), quit);

        // The stream is back in blocking mode: a read waits for a late writer
        // instead of failing straight away.
        let late = Message::SendText {
            id: 2,
            key: 1,
            text: "late".to_string(),
        };
        let expected = late.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            write_message(&mut client, &late).unwrap();
            client
        });
        assert_eq!(read_message(&mut &server).unwrap(), expected);
        let client = writer.join().unwrap();

        drop(client);
        assert!(matches!(
            recv_message(&server, true),
            Err(ProtocolError::Closed)
        ));
    }
}
