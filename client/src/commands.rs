//! Console input: slash commands, everything else is chat

use shared::BattleAction;
use thiserror::Error;

pub const HELP: &str = "\
Commands:
  /users              list online users
  /sort name|score    change the roster order
  /challenge NICK     invite NICK to a battle
  /cancel             withdraw your invitation
  /accept, /reject    answer an invitation
  /rock, /paper, /scissors
                      choose your move for this turn
  /quit               leave the server
  /help               show this text
Anything else is sent as chat.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Name,
    /// Highest score first
    Score,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Users,
    Sort(SortOrder),
    Challenge(String),
    Cancel,
    Accept,
    Reject,
    Act(BattleAction),
    Quit,
    Help,
    Chat(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command /{0}, try /help")]
    Unknown(String),
    #[error("/{0} needs an argument")]
    MissingArgument(&'static str),
    #[error("cannot sort by {0:?}, use name or score")]
    BadSortKey(String),
}

/// Parses one line of input. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Chat(line.to_string())));
    };

    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default().to_ascii_lowercase();
    let argument = words.next();

    let command = match name.as_str() {
        "users" | "who" => Command::Users,
        "sort" => match argument.map(str::to_ascii_lowercase).as_deref() {
            Some("name") => Command::Sort(SortOrder::Name),
            Some("score") => Command::Sort(SortOrder::Score),
            Some(other) => return Err(CommandError::BadSortKey(other.to_string())),
            None => return Err(CommandError::MissingArgument("sort")),
        },
        "challenge" => match argument {
            Some(nickname) => Command::Challenge(nickname.to_string()),
            None => return Err(CommandError::MissingArgument("challenge")),
        },
        "cancel" => Command::Cancel,
        "accept" => Command::Accept,
        "reject" => Command::Reject,
        "rock" => Command::Act(BattleAction::Rock),
        "paper" => Command::Act(BattleAction::Paper),
        "scissors" => Command::Act(BattleAction::Scissors),
        "quit" | "exit" => Command::Quit,
        "help" => Command::Help,
        _ => return Err(CommandError::Unknown(name)),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_chat() {
        assert_eq!(
            parse("hello there\n").unwrap(),
            Some(Command::Chat("hello there".to_string()))
        );
        assert_eq!(parse("   \n").unwrap(), None);
        assert_eq!(parse("").unwrap(), None);
    }

    #[test]
    fn test_commands() {
        assert_eq!(parse("/users").unwrap(), Some(Command::Users));
        assert_eq!(parse("/QUIT").unwrap(), Some(Command::Quit));
        assert_eq!(
            parse("/rock").unwrap(),
            Some(Command::Act(BattleAction::Rock))
        );
        assert_eq!(
            parse("/challenge Bob").unwrap(),
            Some(Command::Challenge("Bob".to_string()))
        );
        assert_eq!(
            parse("/sort Score").unwrap(),
            Some(Command::Sort(SortOrder::Score))
        );
    }

    #[test]
    fn test_command_errors() {
        assert_eq!(
            parse("/dance"),
            Err(CommandError::Unknown("dance".to_string()))
        );
        assert_eq!(
            parse("/challenge"),
            Err(CommandError::MissingArgument("challenge"))
        );
        assert_eq!(
            parse("/sort age"),
            Err(CommandError::BadSortKey("age".to_string()))
        );
        assert!(parse("/").is_err());
    }
}
