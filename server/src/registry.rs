//! Directory of connected users
//!
//! Sessions are reachable three ways: by id, by the connection they arrived
//! on, and by nickname (case-insensitively). `by_id` owns the sessions; the
//! other two maps only point at ids. Every insertion and removal goes
//! through [`SessionRegistry::join`] and [`SessionRegistry::remove`], which
//! update all three maps together, and the identifying fields of a session
//! are read-only so the indices cannot drift apart.
//!
//! The registry is owned by the dispatcher thread and is never shared.

use crate::network::{ConnectionId, Outbound};
use log::{debug, error, info, warn};
use rand::Rng;
use shared::protocol::user_change_batches;
use shared::{is_valid_nickname, nickname_key, ErrorCode, UserChange, UserState};
use std::collections::HashMap;

/// Candidate ids tried before a join gives up
const ID_ATTEMPTS: usize = 16;

/// One connected, joined user
#[derive(Debug, Clone)]
pub struct Session {
    id: u16,
    nickname: String,
    connection: ConnectionId,
    key: u32,
    pub state: UserState,
    pub score: i32,
    /// Challenge this user has issued or is battling in
    pub challenge: Option<u16>,
}

impl Session {
    /// Public id, unique among joined sessions and never 0
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Nickname as the user typed it. Lookups compare it case-insensitively.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Connection the session joined on; replies and broadcasts go here
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Secret handed out in the JoinReply.
    ///
    /// Every later request from this user must carry it, and it is never
    /// sent to anyone else.
    pub fn key(&self) -> u32 {
        self.key
    }

    /// Roster entry describing this session
    pub fn user_change(&self) -> UserChange {
        UserChange {
            nickname: self.nickname.clone(),
            id: self.id,
            state: self.state,
            score: self.score,
        }
    }
}

/// Every joined session, indexed by id, connection and nickname
pub struct SessionRegistry {
    by_id: HashMap<u16, Session>,
    by_connection: HashMap<ConnectionId, u16>,
    by_nickname: HashMap<String, u16>,
    max_users: usize,
}

impl SessionRegistry {
    /// Creates an empty registry that admits at most `max_users` sessions
    pub fn new(max_users: usize) -> Self {
        Self {
            by_id: HashMap::new(),
            by_connection: HashMap::new(),
            by_nickname: HashMap::new(),
            max_users,
        }
    }

    /// Registers a new session for `connection`.
    ///
    /// Checks run in a fixed order: nickname syntax, capacity, one session
    /// per connection, then nickname uniqueness. The id is derived from the
    /// connection handle and perturbed randomly on collision.
    pub fn join<R: Rng>(
        &mut self,
        connection: ConnectionId,
        nickname: &str,
        rng: &mut R,
    ) -> Result<&Session, ErrorCode> {
        if !is_valid_nickname(nickname) {
            return Err(ErrorCode::IllegalNickname);
        }
        if self.by_id.len() >= self.max_users {
            return Err(ErrorCode::TooManyUsers);
        }
        if self.by_connection.contains_key(&connection) {
            return Err(ErrorCode::JoinedTwice);
        }
        let nick_key = nickname_key(nickname);
        if self.by_nickname.contains_key(&nick_key) {
            return Err(ErrorCode::DuplicateNickname);
        }

        let id = self.allocate_id(connection, rng).ok_or_else(|| {
            error!("Could not allocate an id for connection {}", connection);
            ErrorCode::Other
        })?;

        let session = Session {
            id,
            nickname: nickname.to_string(),
            connection,
            key: rng.gen(),
            state: UserState::Online,
            score: 0,
            challenge: None,
        };
        info!("User {} ({}) joined on connection {}", id, nickname, connection);

        self.by_connection.insert(connection, id);
        self.by_nickname.insert(nick_key, id);
        Ok(self.by_id.entry(id).or_insert(session))
    }

    // Id 0 is reserved: it marks "no winner" in turn results.
    fn allocate_id<R: Rng>(&self, connection: ConnectionId, rng: &mut R) -> Option<u16> {
        let mut candidate = (connection.0 % u64::from(u16::MAX)) as u16;
        for _ in 0..ID_ATTEMPTS {
            if candidate != 0 && !self.by_id.contains_key(&candidate) {
                return Some(candidate);
            }
            let step = u32::from(rng.gen::<u16>());
            candidate = ((u32::from(candidate) + step) % u32::from(u16::MAX)) as u16;
        }
        None
    }

    /// Looks a session up by its public id
    pub fn get(&self, id: u16) -> Option<&Session> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Session> {
        self.by_id.get_mut(&id)
    }

    /// Session joined on `connection`, if that connection has joined
    pub fn by_connection(&self, connection: ConnectionId) -> Option<&Session> {
        self.by_connection
            .get(&connection)
            .and_then(|id| self.by_id.get(id))
    }

    /// Case-insensitive nickname lookup
    pub fn by_nickname(&self, nickname: &str) -> Option<&Session> {
        self.by_nickname
            .get(&nickname_key(nickname))
            .and_then(|id| self.by_id.get(id))
    }

    /// Drops a session from all three indices. Battle forfeits and the
    /// offline broadcast are the caller's job.
    pub fn remove(&mut self, id: u16) -> Option<Session> {
        let session = self.by_id.remove(&id)?;
        if self.by_connection.remove(&session.connection).is_none() {
            warn!("Connection {} was not indexed", session.connection);
        }
        self.by_nickname.remove(&nickname_key(&session.nickname));
        debug!("Removed session {} ({})", id, session.nickname);
        Some(session)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Full roster ordered by id
    pub fn roster(&self) -> Vec<UserChange> {
        let mut roster: Vec<UserChange> = self.iter().map(Session::user_change).collect();
        roster.sort_by_key(|user| user.id);
        roster
    }

    /// Sends the whole roster to a single connection
    pub fn send_roster<O: Outbound>(&self, out: &mut O, to: ConnectionId) {
        for batch in user_change_batches(self.roster()) {
            if let Err(e) = out.send(to, &batch) {
                warn!("Failed to send roster to connection {}: {}", to, e);
            }
        }
    }

    /// Delivers `changes` to every joined session except `exclude`
    pub fn broadcast_diff<O: Outbound>(
        &self,
        out: &mut O,
        changes: Vec<UserChange>,
        exclude: Option<ConnectionId>,
    ) {
        let batches = user_change_batches(changes);
        for session in self.by_id.values() {
            if Some(session.connection) == exclude {
                continue;
            }
            for batch in &batches {
                debug!("Broadcasting to {} ({})", session.connection, session.nickname);
                if let Err(e) = out.send(session.connection, batch) {
                    warn!("Failed to broadcast to {}: {}", session.nickname, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tests::RecordingOutbound;
    use rand::rngs::mock::StepRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use shared::Message;
    use std::collections::HashSet;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_join_assigns_unique_ids_and_keys() {
        let mut registry = SessionRegistry::new(8);
        let mut rng = rng();

        let alice = registry.join(ConnectionId(1), "alice", &mut rng).unwrap().clone();
        let bob = registry.join(ConnectionId(2), "bob", &mut rng).unwrap().clone();

        assert_eq!(alice.id(), 1);
        assert_eq!(bob.id(), 2);
        assert_eq!(alice.state, UserState::Online);
        assert_eq!(alice.score, 0);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.by_connection(ConnectionId(2)).unwrap().id(), 2);
        assert_eq!(registry.by_nickname("ALICE").unwrap().id(), 1);
    }

    #[test]
    fn test_join_error_order() {
        let mut registry = SessionRegistry::new(1);
        let mut rng = rng();

        assert_eq!(
            registry.join(ConnectionId(1), "bad name", &mut rng).unwrap_err(),
            ErrorCode::IllegalNickname
        );
        registry.join(ConnectionId(1), "alice", &mut rng).unwrap();
        assert_eq!(
            registry.join(ConnectionId(2), "bob", &mut rng).unwrap_err(),
            ErrorCode::TooManyUsers
        );

        let mut registry = SessionRegistry::new(4);
        registry.join(ConnectionId(1), "alice", &mut rng).unwrap();
        assert_eq!(
            registry.join(ConnectionId(1), "bob", &mut rng).unwrap_err(),
            ErrorCode::JoinedTwice
        );
        assert_eq!(
            registry.join(ConnectionId(2), "Alice", &mut rng).unwrap_err(),
            ErrorCode::DuplicateNickname
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_id_collision_is_perturbed() {
        let mut registry = SessionRegistry::new(8);
        let mut rng = rng();

        let first = registry.join(ConnectionId(5), "a", &mut rng).unwrap().id();
        // 5 + 65535 maps onto the same candidate id.
        let second = registry
            .join(ConnectionId(5 + u64::from(u16::MAX)), "b", &mut rng)
            .unwrap()
            .id();
        assert_eq!(first, 5);
        assert_ne!(second, first);
        assert_ne!(second, 0);
    }

    #[test]
    fn test_id_collision_with_largest_step() {
        let mut registry = SessionRegistry::new(8);
        // Every draw is all ones, the largest increment a collision can add.
        let mut rng = StepRng::new(u64::from(u32::MAX), 0);

        let first = registry.join(ConnectionId(5), "a", &mut rng).unwrap().id();
        assert_eq!(first, 5);

        // 5 + 65535 lands back on 5 every time, so the join gives up.
        let second = registry.join(ConnectionId(5 + u64::from(u16::MAX)), "b", &mut rng);
        assert_eq!(second.unwrap_err(), ErrorCode::Other);
        assert_eq!(registry.len(), 1);

        let mut rng = StepRng::new(u64::from(u32::MAX) - 1, 0);
        let third = registry
            .join(ConnectionId(u64::from(u16::MAX) - 1), "c", &mut rng)
            .unwrap()
            .id();
        assert_eq!(third, 65534);
        let fourth = registry
            .join(ConnectionId(2 * u64::from(u16::MAX) - 1), "d", &mut rng)
            .unwrap()
            .id();
        // (65534 + 65534) % 65535
        assert_eq!(fourth, 65533);
    }

    #[test]
    fn test_remove_clears_every_index() {
        let mut registry = SessionRegistry::new(8);
        let mut rng = rng();
        let id = registry.join(ConnectionId(3), "Carol", &mut rng).unwrap().id();

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.nickname(), "Carol");
        assert!(registry.get(id).is_none());
        assert!(registry.by_connection(ConnectionId(3)).is_none());
        assert!(registry.by_nickname("carol").is_none());
        assert!(registry.is_empty());
        assert!(registry.remove(id).is_none());

        // Both the nickname and the connection are free again.
        registry.join(ConnectionId(3), "carol", &mut rng).unwrap();
    }

    #[test]
    fn test_uniqueness_after_churn() {
        let mut registry = SessionRegistry::new(64);
        let mut rng = rng();
        let mut next_connection = 1u64;

        for round in 0..200u64 {
            let nickname = format!("user{}", round % 40);
            let _ = registry.join(ConnectionId(next_connection), &nickname, &mut rng);
            next_connection += 1;
            if round % 3 == 0 {
                let victim = registry.iter().map(Session::id).min();
                if let Some(id) = victim {
                    registry.remove(id);
                }
            }

            let ids: HashSet<u16> = registry.iter().map(Session::id).collect();
            let nicks: HashSet<String> =
                registry.iter().map(|s| nickname_key(s.nickname())).collect();
            assert_eq!(ids.len(), registry.len());
            assert_eq!(nicks.len(), registry.len());
        }
    }

    #[test]
    fn test_roster_and_broadcast() {
        let mut registry = SessionRegistry::new(64);
        let mut rng = rng();
        for i in 1..=20u64 {
            registry
                .join(ConnectionId(i), &format!("user{}", i), &mut rng)
                .unwrap();
        }

        let mut out = RecordingOutbound::default();
        registry.send_roster(&mut out, ConnectionId(1));
        assert_eq!(out.sent.len(), 2);
        let total: usize = out
            .sent
            .iter()
            .map(|(_, m)| match m {
                Message::UserChangeBatch { users } => users.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(total, 20);

        let mut out = RecordingOutbound::default();
        let change = registry.get(4).unwrap().user_change();
        registry.broadcast_diff(&mut out, vec![change], Some(ConnectionId(4)));
        assert_eq!(out.sent.len(), 19);
        assert!(out.sent.iter().all(|(to, _)| *to != ConnectionId(4)));
    }
}
