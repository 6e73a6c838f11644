//! Code shared by the janken server and client: the wire protocol, the
//! bounded queue both sides use to hand work between threads, the battle
//! rules and nickname validation.

pub mod battle;
pub mod cli;
pub mod protocol;
pub mod queue;

pub use battle::{turn_outcome, TurnOutcome};
pub use protocol::{
    BattleAction, ChallengeAction, ErrorCode, Message, MessageKind, ProtocolError, UserChange,
    UserState, NICKNAME_LEN, TEXT_LEN, USER_CHANGE_MAX,
};
pub use queue::{BoundedQueue, QueueEmpty, QueueFull};

/// Hit points each side starts a battle with
pub const MAX_HP: i32 = 10;

/// Letters, digits and ASCII punctuation are allowed in nicknames
pub fn is_nickname_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c.is_ascii_punctuation()
}

/// A nickname is non-empty, fits its buffer with a terminator, and uses
/// only nickname characters
pub fn is_valid_nickname(nickname: &str) -> bool {
    !nickname.is_empty() && nickname.len() < NICKNAME_LEN && nickname.chars().all(is_nickname_char)
}

/// Key under which nicknames are compared (case-insensitively)
pub fn nickname_key(nickname: &str) -> String {
    nickname.to_ascii_lowercase()
}
