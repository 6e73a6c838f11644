//! Client-side view of the server: roster, invitations and the current battle
//!
//! [`ClientState`] does no I/O. Server messages and user commands go in, and
//! an [`Update`] comes out with the text to show and the messages to send.

use crate::commands::{Command, SortOrder, HELP};
use log::debug;
use shared::{
    nickname_key, turn_outcome, BattleAction, ChallengeAction, ErrorCode, Message, TurnOutcome,
    UserChange, UserState,
};
use std::collections::HashMap;

#[derive(Debug, Default, PartialEq)]
pub struct Update {
    pub lines: Vec<String>,
    pub outgoing: Vec<Message>,
    /// The session is over and the client should shut down
    pub exit: bool,
}

impl Update {
    fn line(text: impl Into<String>) -> Self {
        Self {
            lines: vec![text.into()],
            ..Self::default()
        }
    }

    fn send(message: Message, text: impl Into<String>) -> Self {
        Self {
            lines: vec![text.into()],
            outgoing: vec![message],
            exit: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Invitation {
    challenge_id: u16,
    from: u16,
}

#[derive(Debug, Clone)]
pub struct Battle {
    pub challenge_id: u16,
    pub opponent: u16,
    pub is_challenger: bool,
    pub turn: u16,
    /// A move was sent for the current turn
    pub acted: bool,
    pub hp: (i32, i32),
    pub opponent_hp: (i32, i32),
}

pub struct ClientState {
    id: u16,
    key: u32,
    nickname: String,
    users: HashMap<u16, UserChange>,
    sort: SortOrder,
    incoming: Option<Invitation>,
    /// Target of our own pending invitation
    outgoing: Option<u16>,
    battle: Option<Battle>,
}

impl ClientState {
    pub fn new(id: u16, key: u32, nickname: &str) -> Self {
        Self {
            id,
            key,
            nickname: nickname.to_string(),
            users: HashMap::new(),
            sort: SortOrder::default(),
            incoming: None,
            outgoing: None,
            battle: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn battle(&self) -> Option<&Battle> {
        self.battle.as_ref()
    }

    /// Message telling the server this session is ending
    pub fn quit_message(&self) -> Message {
        Message::Quit {
            key: self.key,
            id: self.id,
        }
    }

    fn name_of(&self, id: u16) -> String {
        self.users
            .get(&id)
            .map_or_else(|| format!("#{}", id), |u| u.nickname.clone())
    }

    /// Roster in the current sort order, one line per user
    pub fn roster_lines(&self) -> Vec<String> {
        let mut users: Vec<&UserChange> = self.users.values().collect();
        match self.sort {
            SortOrder::Name => users.sort_by_key(|u| nickname_key(&u.nickname)),
            SortOrder::Score => users.sort_by(|a, b| b.score.cmp(&a.score).then(a.id.cmp(&b.id))),
        }
        let mut lines = vec![format!("{} user(s) online:", users.len())];
        lines.extend(users.into_iter().map(|u| {
            let state = match u.state {
                UserState::Battling => "battling",
                _ => "online",
            };
            let me = if u.id == self.id { " (you)" } else { "" };
            format!("  {:<31} {:>5}  {}{}", u.nickname, u.score, state, me)
        }));
        lines
    }

    pub fn apply_message(&mut self, message: Message) -> Update {
        match message {
            Message::UserChangeBatch { users } => self.apply_user_changes(users),
            Message::Challenge {
                id1,
                challenge_id,
                action: ChallengeAction::Start,
                ..
            } => self.invited(id1, challenge_id),
            Message::ChallengeReply {
                error,
                id1,
                id2,
                challenge_id,
                is_challenger,
            } => self.challenge_reply(error, id1, id2, challenge_id, is_challenger),
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
                let battle = match self.battle.as_mut() {
                    Some(battle) if battle.challenge_id == challenge_id => battle,
                    _ => {
                        debug!("Turn result for unknown battle {}", challenge_id);
                        return Update::default();
                    }
                };
                // Perspective of this client: (mine, theirs)
                let (mine, theirs, hp, opponent_hp) = if battle.is_challenger {
                    (action1, action2, (hp1, maxhp1), (hp2, maxhp2))
                } else {
                    (action2, action1, (hp2, maxhp2), (hp1, maxhp1))
                };
                battle.turn = turn_no;
                battle.acted = false;
                battle.hp = hp;
                battle.opponent_hp = opponent_hp;
                let opponent = battle.opponent;
                self.turn_result(turn_no, mine, theirs, winner, finished, opponent)
            }
            Message::SendText { id, text, .. } => {
                Update::line(format!("<{}> {}", self.name_of(id), text))
            }
            other => {
                debug!("Ignored {:?} from server", other.kind());
                Update::default()
            }
        }
    }

    fn apply_user_changes(&mut self, users: Vec<UserChange>) -> Update {
        let mut update = Update::default();
        for user in users {
            if user.state == UserState::Offline {
                if let Some(gone) = self.users.remove(&user.id) {
                    update.lines.push(format!("{} left", gone.nickname));
                }
            } else {
                self.users.insert(user.id, user);
            }
        }
        update
    }

    fn invited(&mut self, from: u16, challenge_id: u16) -> Update {
        let name = self.name_of(from);
        if self.incoming.is_some() || self.battle.is_some() {
            let reject = Message::Challenge {
                id1: from,
                id2: self.id,
                key: self.key,
                challenge_id,
                action: ChallengeAction::Reject,
            };
            return Update::send(reject, format!("Declined a challenge from {} (busy)", name));
        }
        self.incoming = Some(Invitation { challenge_id, from });
        Update::line(format!("{} challenges you! /accept or /reject", name))
    }

    fn challenge_reply(
        &mut self,
        error: ErrorCode,
        id1: u16,
        id2: u16,
        challenge_id: u16,
        is_challenger: bool,
    ) -> Update {
        match error {
            ErrorCode::Ok => {
                let opponent = if is_challenger { id2 } else { id1 };
                self.incoming = None;
                self.outgoing = None;
                self.battle = Some(Battle {
                    challenge_id,
                    opponent,
                    is_challenger,
                    turn: 0,
                    acted: false,
                    hp: (0, 0),
                    opponent_hp: (0, 0),
                });
                Update::line(format!("Battle against {} begins!", self.name_of(opponent)))
            }
            ErrorCode::Rejected => {
                self.outgoing = None;
                Update::line(format!("{} rejected your challenge", self.name_of(id2)))
            }
            ErrorCode::Cancelled => {
                if self.incoming.map_or(false, |i| i.challenge_id == challenge_id) {
                    self.incoming = None;
                }
                Update::line(format!("{} withdrew the challenge", self.name_of(id1)))
            }
            error => {
                // id1 is whoever issued the invitation, so a refused Start or
                // Cancel names us there. Anything else answered an
                // accept or reject and leaves our own invitation standing.
                if id1 == self.id {
                    self.outgoing = None;
                } else if self.incoming.map_or(false, |i| i.challenge_id == challenge_id) {
                    self.incoming = None;
                }
                Update::line(format!("Challenge failed: {}", error.description()))
            }
        }
    }

    fn turn_result(
        &mut self,
        turn_no: u16,
        mine: BattleAction,
        theirs: BattleAction,
        winner: u16,
        finished: bool,
        opponent: u16,
    ) -> Update {
        let mut lines = Vec::new();
        let (hp, opponent_hp) = match &self.battle {
            Some(battle) => (battle.hp, battle.opponent_hp),
            None => return Update::default(),
        };

        let forfeit = finished && hp.0 > 0 && opponent_hp.0 > 0;
        if turn_no > 1 && !forfeit {
            let outcome = match turn_outcome(mine, theirs) {
                TurnOutcome::Win => "you won",
                TurnOutcome::Lose => "you lost",
                TurnOutcome::Tie => "tie",
            };
            lines.push(format!(
                "Last turn: {} - {} ({})",
                mine.name(),
                theirs.name(),
                outcome
            ));
        }

        if finished {
            self.battle = None;
            if forfeit && winner == self.id {
                lines.push(format!("{} left the battle.", self.name_of(opponent)));
            }
            lines.push(if winner == self.id {
                "You won the battle!".to_string()
            } else {
                "You lost the battle.".to_string()
            });
        } else {
            lines.push(format!(
                "Turn {}: you {}/{} HP, {} {}/{} HP. /rock /paper /scissors",
                turn_no,
                hp.0,
                hp.1,
                self.name_of(opponent),
                opponent_hp.0,
                opponent_hp.1
            ));
        }
        Update {
            lines,
            ..Update::default()
        }
    }

    pub fn apply_command(&mut self, command: Command) -> Update {
        match command {
            Command::Users => Update {
                lines: self.roster_lines(),
                ..Update::default()
            },
            Command::Sort(order) => {
                self.sort = order;
                Update {
                    lines: self.roster_lines(),
                    ..Update::default()
                }
            }
            Command::Challenge(nickname) => self.challenge(&nickname),
            Command::Cancel => match self.outgoing.take() {
                Some(target) => Update::send(
                    Message::Challenge {
                        id1: self.id,
                        id2: target,
                        key: self.key,
                        challenge_id: 0,
                        action: ChallengeAction::Cancel,
                    },
                    format!("Challenge to {} withdrawn", self.name_of(target)),
                ),
                None => Update::line("You have no pending challenge"),
            },
            Command::Accept | Command::Reject => {
                let invitation = match self.incoming.take() {
                    Some(invitation) => invitation,
                    None => return Update::line("Nobody has challenged you"),
                };
                let (action, verb) = if command == Command::Accept {
                    (ChallengeAction::Accept, "Accepted")
                } else {
                    (ChallengeAction::Reject, "Rejected")
                };
                Update::send(
                    Message::Challenge {
                        id1: invitation.from,
                        id2: self.id,
                        key: self.key,
                        challenge_id: invitation.challenge_id,
                        action,
                    },
                    format!("{} the challenge from {}", verb, self.name_of(invitation.from)),
                )
            }
            Command::Act(action) => self.act(action),
            Command::Quit => Update {
                lines: vec!["Bye!".to_string()],
                outgoing: vec![self.quit_message()],
                exit: true,
            },
            Command::Help => Update {
                lines: HELP.lines().map(str::to_string).collect(),
                ..Update::default()
            },
            Command::Chat(text) => Update {
                outgoing: vec![Message::SendText {
                    id: self.id,
                    key: self.key,
                    text,
                }],
                ..Update::default()
            },
        }
    }

    fn challenge(&mut self, nickname: &str) -> Update {
        let wanted = nickname_key(nickname);
        let target = match self
            .users
            .values()
            .find(|u| nickname_key(&u.nickname) == wanted)
        {
            Some(user) => user.id,
            None => return Update::line(format!("No user called {}", nickname)),
        };
        if target == self.id || wanted == nickname_key(&self.nickname) {
            return Update::line("You cannot challenge yourself");
        }
        if self.battle.is_some() {
            return Update::line("You are already in a battle");
        }
        if self.outgoing.is_some() {
            return Update::line("You already have a challenge out; /cancel it first");
        }
        self.outgoing = Some(target);
        Update::send(
            Message::Challenge {
                id1: self.id,
                id2: target,
                key: self.key,
                challenge_id: 0,
                action: ChallengeAction::Start,
            },
            format!("Challenge sent to {}", nickname),
        )
    }

    fn act(&mut self, action: BattleAction) -> Update {
        let (id, key) = (self.id, self.key);
        let battle = match self.battle.as_mut() {
            Some(battle) => battle,
            None => return Update::line("You are not in a battle"),
        };
        if battle.acted {
            return Update::line("You already chose this turn");
        }
        battle.acted = true;
        Update::send(
            Message::Turn {
                user: id,
                challenge_id: battle.challenge_id,
                key,
                turn_no: battle.turn,
                action,
            },
            format!("You chose {}", action.name()),
        )
    }
}
