//! The single writer of session and challenge state
//!
//! One dispatcher thread drains the incoming queue. Every registry and
//! challenge mutation, and every reply or broadcast caused by one, happens
//! here in queue order, so none of this state needs a lock.

use crate::challenge::{battle_awards, ChallengeState, ChallengeTable, Finish};
use crate::network::{ConnectionId, Outbound, QueueEntry};
use crate::registry::SessionRegistry;
use log::{debug, info, warn};
use rand::Rng;
use shared::{BattleAction, BoundedQueue, ChallengeAction, ErrorCode, Message, UserState};

/// Owns the registry, the challenge table and the outbound side.
///
/// `O` is where replies go (sockets in the server, a recorder in tests) and
/// `R` drives ids, keys, damage and score awards.
pub struct Dispatcher<O: Outbound, R: Rng> {
    registry: SessionRegistry,
    challenges: ChallengeTable,
    outbound: O,
    rng: R,
}

impl<O: Outbound, R: Rng> Dispatcher<O, R> {
    /// Creates a dispatcher with empty tables that admits at most
    /// `max_users` sessions
    pub fn new(outbound: O, rng: R, max_users: usize) -> Self {
        Self {
            registry: SessionRegistry::new(max_users),
            challenges: ChallengeTable::new(),
            outbound,
            rng,
        }
    }

    /// Handles queue entries until the queue fails, which a blocking take
    /// only does if the queue is broken
    pub fn run(mut self, queue: &BoundedQueue<QueueEntry>) {
        info!("Dispatcher started");
        while let Ok(entry) = queue.take(true) {
            self.handle_entry(entry);
        }
        warn!("Dispatcher stopped");
    }

    /// Applies one queue entry.
    ///
    /// `Connected` attaches the write half, `Message` goes through
    /// [`Dispatcher::handle_message`], and `Disconnected` forfeits any
    /// battle and removes the session.
    pub fn handle_entry(&mut self, entry: QueueEntry) {
        match entry {
            QueueEntry::Connected { connection, stream } => {
                self.outbound.attach(connection, stream);
            }
            QueueEntry::Message {
                connection,
                message,
            } => self.handle_message(connection, message),
            QueueEntry::Disconnected { connection } => self.handle_disconnect(connection),
        }
    }

    /// Routes a client message to its handler. Server-only kinds are
    /// logged and dropped.
    pub fn handle_message(&mut self, connection: ConnectionId, message: Message) {
        debug!("Got {:?} from {}", message.kind(), connection);
        match message {
            Message::Join { nickname } => self.handle_join(connection, nickname),
            Message::Quit { key, id } => self.handle_quit(key, id),
            Message::Challenge {
                id1,
                id2,
                key,
                challenge_id,
                action,
            } => self.handle_challenge(connection, id1, id2, key, challenge_id, action),
            Message::Turn {
                user,
                challenge_id,
                key,
                action,
                ..
            } => self.handle_turn(user, challenge_id, key, action),
            Message::SendText { id, key, text } => self.handle_send_text(id, key, text),
            other => warn!(
                "Ignored {:?} from {}: only the server sends it",
                other.kind(),
                connection
            ),
        }
    }

    fn send(&mut self, to: ConnectionId, message: &Message) {
        if let Err(e) = self.outbound.send(to, message) {
            warn!("Failed to send {:?} to {}: {}", message.kind(), to, e);
        }
    }

    fn send_to_session(&mut self, id: u16, message: &Message) {
        match self.registry.get(id).map(|s| s.connection()) {
            Some(connection) => self.send(connection, message),
            None => debug!("Dropped {:?} for departed user {}", message.kind(), id),
        }
    }

    fn broadcast_sessions(&mut self, ids: &[u16], exclude: Option<ConnectionId>) {
        let changes = ids
            .iter()
            .filter_map(|id| self.registry.get(*id))
            .map(|s| s.user_change())
            .collect();
        self.registry
            .broadcast_diff(&mut self.outbound, changes, exclude);
    }

    fn handle_join(&mut self, connection: ConnectionId, nickname: String) {
        let joined = self
            .registry
            .join(connection, &nickname, &mut self.rng)
            .map(|s| (s.id(), s.key(), s.user_change()));

        match joined {
            Ok((id, key, change)) => {
                let reply = Message::JoinReply {
                    nickname,
                    error: ErrorCode::Ok,
                    id,
                    key,
                };
                self.send(connection, &reply);
                self.registry.send_roster(&mut self.outbound, connection);
                self.registry
                    .broadcast_diff(&mut self.outbound, vec![change], Some(connection));
            }
            Err(error) => {
                info!("Join of {:?} on {} refused: {}", nickname, connection, error);
                let reply = Message::JoinReply {
                    nickname,
                    error,
                    id: 0,
                    key: 0,
                };
                self.send(connection, &reply);
            }
        }
    }

    fn handle_quit(&mut self, key: u32, id: u16) {
        match self.registry.get(id) {
            None => warn!("Ignored Quit for unknown user {}", id),
            Some(session) if session.key() != key => {
                warn!("Ignored Quit for user {} ({}): incorrect key", id, session.nickname())
            }
            Some(_) => self.quit_session(id, None),
        }
    }

    fn handle_disconnect(&mut self, connection: ConnectionId) {
        if let Some(id) = self.registry.by_connection(connection).map(|s| s.id()) {
            // The peer is gone, so it is left out of its own offline notice.
            self.quit_session(id, Some(connection));
        }
        self.outbound.detach(connection);
    }

    /// Removes a session: forfeits its battle, withdraws its invitations,
    /// then announces it offline
    fn quit_session(&mut self, id: u16, exclude: Option<ConnectionId>) {
        let (state, challenge) = match self.registry.get(id) {
            Some(session) => (session.state, session.challenge),
            None => return,
        };
        info!("User {} is leaving", id);

        if let Some(challenge_id) = challenge {
            if state == UserState::Battling {
                self.resolve(challenge_id, Some(id));
            } else {
                self.withdraw_invitation(challenge_id, id);
            }
        }
        for challenge_id in self.challenges.pending_for_target(id) {
            if let Some(challenge) = self.challenges.remove(challenge_id) {
                let challenger = challenge.challenger.session;
                if let Some(session) = self.registry.get_mut(challenger) {
                    session.challenge = None;
                }
                let reply = Message::ChallengeReply {
                    error: ErrorCode::Rejected,
                    id1: challenger,
                    id2: id,
                    challenge_id,
                    is_challenger: true,
                };
                self.send_to_session(challenger, &reply);
            }
        }

        if let Some(session) = self.registry.get_mut(id) {
            session.state = UserState::Offline;
            session.challenge = None;
        }
        self.broadcast_sessions(&[id], exclude);
        self.registry.remove(id);
    }

    /// Drops an `Asking` challenge issued by `challenger` and tells the
    /// target it was cancelled
    fn withdraw_invitation(&mut self, challenge_id: u16, challenger: u16) {
        let pending = self.challenges.get(challenge_id).map_or(false, |c| {
            c.state == ChallengeState::Asking && c.challenger.session == challenger
        });
        if !pending {
            return;
        }
        if let Some(challenge) = self.challenges.remove(challenge_id) {
            debug!("Challenge {} withdrawn", challenge_id);
            if let Some(session) = self.registry.get_mut(challenger) {
                session.challenge = None;
            }
            let target = challenge.target.session;
            let reply = Message::ChallengeReply {
                error: ErrorCode::Cancelled,
                id1: challenger,
                id2: target,
                challenge_id,
                is_challenger: false,
            };
            self.send_to_session(target, &reply);
        }
    }

    fn handle_challenge(
        &mut self,
        connection: ConnectionId,
        id1: u16,
        id2: u16,
        key: u32,
        challenge_id: u16,
        action: ChallengeAction,
    ) {
        let reply = |error: ErrorCode| Message::ChallengeReply {
            error,
            id1,
            id2,
            challenge_id,
            is_challenger: false,
        };

        let (key1, state1, pending1) = match self.registry.get(id1) {
            Some(s) => (s.key(), s.state, s.challenge),
            None => return self.send(connection, &reply(ErrorCode::NonexistentId)),
        };
        let (key2, state2) = match self.registry.get(id2) {
            Some(s) => (s.key(), s.state),
            None => return self.send(connection, &reply(ErrorCode::NonexistentId)),
        };

        let expected_key = match action {
            ChallengeAction::Start | ChallengeAction::Cancel => key1,
            ChallengeAction::Accept | ChallengeAction::Reject => key2,
            ChallengeAction::Unknown(raw) => {
                debug!("Unknown challenge action {}", raw);
                return self.send(connection, &reply(ErrorCode::InvalidArgument));
            }
        };
        if key != expected_key {
            debug!("Wrong key in challenge from {}", connection);
            return self.send(connection, &reply(ErrorCode::IncorrectKey));
        }

        match action {
            ChallengeAction::Start => {
                if state1 != UserState::Online || state2 != UserState::Online {
                    return self.send(connection, &reply(ErrorCode::Engaged));
                }
                if id1 == id2 {
                    return self.send(connection, &reply(ErrorCode::ChallengingSelf));
                }
                if pending1.is_some() {
                    debug!("User {} already has an invitation out", id1);
                    return self.send(connection, &reply(ErrorCode::Engaged));
                }
                self.start_challenge(connection, id1, id2)
            }
            ChallengeAction::Cancel => {
                if state1 == UserState::Online {
                    if let Some(pending) = pending1 {
                        self.withdraw_invitation(pending, id1);
                    }
                }
            }
            ChallengeAction::Accept | ChallengeAction::Reject => {
                let found = self.challenges.get(challenge_id).and_then(|c| {
                    (c.challenger.session == id1 && c.target.session == id2).then_some(c.state)
                });
                match found {
                    None => self.send(connection, &reply(ErrorCode::NonexistentChallengeId)),
                    Some(ChallengeState::Started) => {
                        debug!("Ignored {:?} for started challenge {}", action, challenge_id)
                    }
                    Some(ChallengeState::Asking) if action == ChallengeAction::Reject => {
                        self.challenges.remove(challenge_id);
                        if let Some(session) = self.registry.get_mut(id1) {
                            session.challenge = None;
                        }
                        let rejected = Message::ChallengeReply {
                            error: ErrorCode::Rejected,
                            id1,
                            id2,
                            challenge_id,
                            is_challenger: true,
                        };
                        self.send_to_session(id1, &rejected);
                    }
                    Some(ChallengeState::Asking) => {
                        if state1 == UserState::Online && state2 == UserState::Online {
                            self.accept_challenge(challenge_id, id1, id2);
                        } else {
                            self.send(connection, &reply(ErrorCode::Engaged));
                        }
                    }
                }
            }
            ChallengeAction::Unknown(_) => {}
        }
    }

    fn start_challenge(&mut self, connection: ConnectionId, id1: u16, id2: u16) {
        let challenge_id = match self.challenges.create(id1, id2, &mut self.rng) {
            Ok(challenge) => challenge.id,
            Err(error) => {
                let reply = Message::ChallengeReply {
                    error,
                    id1,
                    id2,
                    challenge_id: 0,
                    is_challenger: true,
                };
                return self.send(connection, &reply);
            }
        };
        if let Some(session) = self.registry.get_mut(id1) {
            session.challenge = Some(challenge_id);
        }
        info!("User {} challenges user {} ({})", id1, id2, challenge_id);

        // The challenger's key stays private.
        let forward = Message::Challenge {
            id1,
            id2,
            key: 0,
            challenge_id,
            action: ChallengeAction::Start,
        };
        self.send_to_session(id2, &forward);
    }

    fn accept_challenge(&mut self, challenge_id: u16, id1: u16, id2: u16) {
        // The target may have its own invitation out; it is void now.
        let other = self
            .registry
            .get(id2)
            .and_then(|s| s.challenge)
            .filter(|other| *other != challenge_id);
        if let Some(other) = other {
            self.withdraw_invitation(other, id2);
        }

        if let Some(challenge) = self.challenges.get_mut(challenge_id) {
            challenge.state = ChallengeState::Started;
        }
        for id in [id1, id2] {
            if let Some(session) = self.registry.get_mut(id) {
                session.state = UserState::Battling;
                session.challenge = Some(challenge_id);
            }
        }
        info!("Battle {} started: {} vs {}", challenge_id, id1, id2);
        self.broadcast_sessions(&[id1, id2], None);

        for (id, is_challenger) in [(id1, true), (id2, false)] {
            let reply = Message::ChallengeReply {
                error: ErrorCode::Ok,
                id1,
                id2,
                challenge_id,
                is_challenger,
            };
            self.send_to_session(id, &reply);
        }
        self.resolve(challenge_id, None);
    }

    fn handle_turn(&mut self, user: u16, challenge_id: u16, key: u32, action: BattleAction) {
        match self.registry.get(user) {
            Some(session) if session.key() == key => {}
            _ => {
                debug!("Ignored turn from user {}", user);
                return;
            }
        }
        let ready = match self.challenges.get_mut(challenge_id) {
            Some(challenge) if challenge.state == ChallengeState::Started => {
                challenge.record_action(user, action);
                challenge.both_acted()
            }
            _ => {
                debug!("Ignored turn for challenge {}", challenge_id);
                return;
            }
        };
        if ready {
            self.resolve(challenge_id, None);
        }
    }

    /// Runs turn resolution and, if the battle ended, settles it
    fn resolve(&mut self, challenge_id: u16, forced_loser: Option<u16>) {
        let (report, participants) = match self.challenges.get_mut(challenge_id) {
            Some(challenge) => (
                challenge.resolve_turn(forced_loser, &mut self.rng),
                [challenge.challenger.session, challenge.target.session],
            ),
            None => return,
        };
        for id in participants {
            self.send_to_session(id, &report.result);
        }
        if let Some(finish) = report.finish {
            self.finish_battle(challenge_id, finish);
        }
    }

    fn finish_battle(&mut self, challenge_id: u16, finish: Finish) {
        self.challenges.remove(challenge_id);
        let (bonus, penalty) = battle_awards(&mut self.rng);
        info!(
            "Battle {} won by {} (+{}), lost by {} (-{})",
            challenge_id, finish.winner, bonus, finish.loser, penalty
        );

        for (id, delta) in [(finish.winner, bonus), (finish.loser, -penalty)] {
            if let Some(session) = self.registry.get_mut(id) {
                session.score += delta;
                if session.state == UserState::Battling {
                    session.state = UserState::Online;
                }
                session.challenge = None;
            }
        }
        self.broadcast_sessions(&[finish.winner, finish.loser], None);
    }

    fn handle_send_text(&mut self, id: u16, key: u32, text: String) {
        match self.registry.get(id) {
            Some(session) if session.key() == key => {}
            _ => {
                debug!("Ignored text from user {}", id);
                return;
            }
        }
        let relay = Message::SendText { id, key: 0, text };
        let recipients: Vec<ConnectionId> = self.registry.iter().map(|s| s.connection()).collect();
        for connection in recipients {
            self.send(connection, &relay);
        }
    }

    /// Sessions currently joined
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn challenges(&self) -> &ChallengeTable {
        &self.challenges
    }

    pub fn outbound(&self) -> &O {
        &self.outbound
    }

    /// Mutable access to the outbound side, mostly for draining a recorder
    pub fn outbound_mut(&mut self) -> &mut O {
        &mut self.outbound
    }
}
