//! Pending invitations and battles in progress
//!
//! A challenge starts `Asking` when the challenger sends Start and becomes
//! `Started` once the target accepts. It disappears from the table when it
//! is rejected, cancelled, or when the battle ends; there is no explicit
//! terminal state.

use log::{debug, error};
use rand::Rng;
use shared::{turn_outcome, BattleAction, ErrorCode, Message, TurnOutcome, MAX_HP};
use std::collections::HashMap;
use std::ops::RangeInclusive;

const ID_ATTEMPTS: usize = 16;
/// Hit points lost by the losing side of an exchange
pub const DAMAGE: RangeInclusive<i32> = 1..=5;
/// Score gained by the winner of a battle
pub const WIN_BONUS: RangeInclusive<i32> = 1..=4;
/// Score lost by the loser of a battle
pub const LOSS_PENALTY: RangeInclusive<i32> = 0..=3;

/// Lifecycle of a challenge while it is in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    Asking,
    Started,
}

/// One participant's battle state
#[derive(Debug, Clone)]
pub struct Side {
    pub session: u16,
    pub acted: bool,
    pub action: BattleAction,
    pub hp: i32,
    pub max_hp: i32,
}

impl Side {
    fn new(session: u16) -> Self {
        Self {
            session,
            acted: false,
            action: BattleAction::Rock,
            hp: MAX_HP,
            max_hp: MAX_HP,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: u16,
    /// Side that sent Start; the roles never swap
    pub challenger: Side,
    pub target: Side,
    pub turn: u16,
    pub state: ChallengeState,
}

/// How a finished battle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finish {
    pub winner: u16,
    pub loser: u16,
}

/// Outcome of one call to [`Challenge::resolve_turn`]
#[derive(Debug, Clone)]
pub struct TurnReport {
    /// `TurnResult` for both participants
    pub result: Message,
    pub finish: Option<Finish>,
}

impl Challenge {
    /// New invitation from `challenger` to `target`, both at full health
    pub fn new(id: u16, challenger: u16, target: u16) -> Self {
        Self {
            id,
            challenger: Side::new(challenger),
            target: Side::new(target),
            turn: 0,
            state: ChallengeState::Asking,
        }
    }

    /// True if `session` is either participant
    pub fn involves(&self, session: u16) -> bool {
        self.challenger.session == session || self.target.session == session
    }

    /// Records `session`'s move for the current turn.
    ///
    /// Returns `false` if the session is not a participant or has already
    /// acted this turn; the first move of a turn is the one that counts.
    pub fn record_action(&mut self, session: u16, action: BattleAction) -> bool {
        let side = if self.challenger.session == session {
            &mut self.challenger
        } else if self.target.session == session {
            &mut self.target
        } else {
            return false;
        };
        if side.acted {
            return false;
        }
        side.action = action;
        side.acted = true;
        true
    }

    /// Both sides have chosen a move for the current turn
    pub fn both_acted(&self) -> bool {
        self.challenger.acted && self.target.acted
    }

    /// Resolves the current turn.
    ///
    /// Damage is applied only after a real exchange (turn > 0 and both sides
    /// acted); turn 0 just emits the first prompt. `forced_loser` ends the
    /// battle immediately in the other side's favour.
    pub fn resolve_turn<R: Rng>(&mut self, forced_loser: Option<u16>, rng: &mut R) -> TurnReport {
        if self.turn > 0 && self.both_acted() {
            let damage = rng.gen_range(DAMAGE);
            match turn_outcome(self.challenger.action, self.target.action) {
                TurnOutcome::Win => self.target.hp -= damage,
                TurnOutcome::Lose => self.challenger.hp -= damage,
                TurnOutcome::Tie => {}
            }
        }

        self.turn = self.turn.wrapping_add(1);
        self.challenger.acted = false;
        self.target.acted = false;

        let (challenger, target) = (self.challenger.session, self.target.session);
        let finish = match forced_loser {
            Some(loser) if loser == challenger => Some(Finish {
                winner: target,
                loser,
            }),
            Some(loser) if loser == target => Some(Finish {
                winner: challenger,
                loser,
            }),
            _ if self.challenger.hp <= 0 => Some(Finish {
                winner: target,
                loser: challenger,
            }),
            _ if self.target.hp <= 0 => Some(Finish {
                winner: challenger,
                loser: target,
            }),
            _ => None,
        };
        debug!(
            "Challenge {} turn {}: hp {}/{} finish {:?}",
            self.id, self.turn, self.challenger.hp, self.target.hp, finish
        );

        let result = Message::TurnResult {
            challenge_id: self.id,
            turn_no: self.turn,
            action1: self.challenger.action,
            action2: self.target.action,
            winner: finish.map_or(0, |f| f.winner),
            hp1: self.challenger.hp,
            hp2: self.target.hp,
            maxhp1: self.challenger.max_hp,
            maxhp2: self.target.max_hp,
            finished: finish.is_some(),
        };
        TurnReport { result, finish }
    }
}

/// Score changes at the end of a battle: (winner bonus, loser penalty)
pub fn battle_awards<R: Rng>(rng: &mut R) -> (i32, i32) {
    (rng.gen_range(WIN_BONUS), rng.gen_range(LOSS_PENALTY))
}

/// Live challenges by id; owned by the dispatcher
#[derive(Default)]
pub struct ChallengeTable {
    by_id: HashMap<u16, Challenge>,
}

impl ChallengeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an `Asking` challenge under a fresh non-zero id
    pub fn create<R: Rng>(
        &mut self,
        challenger: u16,
        target: u16,
        rng: &mut R,
    ) -> Result<&mut Challenge, ErrorCode> {
        for _ in 0..ID_ATTEMPTS {
            let id = rng.gen_range(1..u16::MAX);
            if self.by_id.contains_key(&id) {
                continue;
            }
            debug!("Challenge {} created: {} -> {}", id, challenger, target);
            return Ok(self
                .by_id
                .entry(id)
                .or_insert_with(|| Challenge::new(id, challenger, target)));
        }
        error!("Could not allocate a challenge id");
        Err(ErrorCode::Other)
    }

    /// Looks a challenge up by id, in either state
    pub fn get(&self, id: u16) -> Option<&Challenge> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Challenge> {
        self.by_id.get_mut(&id)
    }

    /// Deletes a challenge once it is rejected, cancelled or finished.
    ///
    /// The participants' `challenge` links live in the registry and are
    /// cleared by the caller.
    pub fn remove(&mut self, id: u16) -> Option<Challenge> {
        self.by_id.remove(&id)
    }

    /// Ids of `Asking` challenges that target `session`
    pub fn pending_for_target(&self, session: u16) -> Vec<u16> {
        self.by_id
            .values()
            .filter(|c| c.state == ChallengeState::Asking && c.target.session == session)
            .map(|c| c.id)
            .collect()
    }

    /// Number of invitations and battles in progress
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use BattleAction::*;

    fn started(challenger: u16, target: u16) -> Challenge {
        let mut challenge = Challenge::new(77, challenger, target);
        challenge.state = ChallengeState::Started;
        challenge
    }

    fn hp_of(report: &TurnReport) -> (i32, i32, u16, bool) {
        match report.result {
            Message::TurnResult {
                hp1,
                hp2,
                turn_no,
                finished,
                ..
            } => (hp1, hp2, turn_no, finished),
            _ => panic!("not a turn result"),
        }
    }

    #[test]
    fn test_bootstrap_turn_applies_no_damage() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut challenge = started(1, 2);

        let report = challenge.resolve_turn(None, &mut rng);
        assert_eq!(hp_of(&report), (MAX_HP, MAX_HP, 1, false));
        assert!(report.finish.is_none());
    }

    #[test]
    fn test_rock_beats_scissors() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut challenge = started(1, 2);
        challenge.resolve_turn(None, &mut rng);

        assert!(challenge.record_action(1, Rock));
        assert!(challenge.record_action(2, Scissors));
        let report = challenge.resolve_turn(None, &mut rng);
        let (hp1, hp2, turn, finished) = hp_of(&report);

        assert_eq!(hp1, MAX_HP);
        assert!(DAMAGE.contains(&(MAX_HP - hp2)));
        assert_eq!(turn, 2);
        assert!(!finished);
    }

    #[test]
    fn test_target_can_win_an_exchange() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut challenge = started(1, 2);
        challenge.resolve_turn(None, &mut rng);

        challenge.record_action(1, Paper);
        challenge.record_action(2, Scissors);
        let (hp1, hp2, _, _) = hp_of(&challenge.resolve_turn(None, &mut rng));
        assert!(hp1 < MAX_HP);
        assert_eq!(hp2, MAX_HP);
    }

    #[test]
    fn test_tie_applies_no_damage_but_advances_turn() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut challenge = started(1, 2);
        challenge.resolve_turn(None, &mut rng);

        for expected_turn in 2..6 {
            challenge.record_action(1, Paper);
            challenge.record_action(2, Paper);
            let report = challenge.resolve_turn(None, &mut rng);
            assert_eq!(hp_of(&report), (MAX_HP, MAX_HP, expected_turn, false));
            assert!(!challenge.challenger.acted);
            assert!(!challenge.target.acted);
        }
    }

    #[test]
    fn test_only_first_action_per_turn_counts() {
        let mut challenge = started(1, 2);
        assert!(challenge.record_action(1, Rock));
        assert!(!challenge.record_action(1, Paper));
        assert_eq!(challenge.challenger.action, Rock);
        assert!(!challenge.both_acted());
        assert!(!challenge.record_action(3, Paper));
        assert!(challenge.record_action(2, Paper));
        assert!(challenge.both_acted());
    }

    #[test]
    fn test_battle_runs_to_knockout() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut challenge = started(1, 2);
        challenge.resolve_turn(None, &mut rng);

        let mut finish = None;
        for _ in 0..20 {
            challenge.record_action(1, Rock);
            challenge.record_action(2, Scissors);
            let report = challenge.resolve_turn(None, &mut rng);
            if report.finish.is_some() {
                finish = report.finish;
                match report.result {
                    Message::TurnResult {
                        winner, finished, ..
                    } => {
                        assert_eq!(winner, 1);
                        assert!(finished);
                    }
                    _ => unreachable!(),
                }
                break;
            }
        }
        assert_eq!(finish, Some(Finish { winner: 1, loser: 2 }));
        assert!(challenge.target.hp <= 0);
    }

    #[test]
    fn test_forced_loss_ends_battle() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut challenge = started(1, 2);
        challenge.resolve_turn(None, &mut rng);
        challenge.record_action(2, Rock);

        let report = challenge.resolve_turn(Some(2), &mut rng);
        assert_eq!(report.finish, Some(Finish { winner: 1, loser: 2 }));
        // One side acting is not an exchange.
        assert_eq!(challenge.challenger.hp, MAX_HP);
        assert_eq!(challenge.target.hp, MAX_HP);
    }

    #[test]
    fn test_awards_in_range() {
        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..100 {
            let (bonus, penalty) = battle_awards(&mut rng);
            assert!(WIN_BONUS.contains(&bonus));
            assert!(LOSS_PENALTY.contains(&penalty));
        }
    }

    #[test]
    fn test_table_create_and_remove() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut table = ChallengeTable::new();

        let id = table.create(1, 2, &mut rng).unwrap().id;
        assert_ne!(id, 0);
        let other = table.create(3, 2, &mut rng).unwrap().id;
        assert_ne!(id, other);

        let challenge = table.get(id).unwrap();
        assert_eq!(challenge.state, ChallengeState::Asking);
        assert_eq!(challenge.challenger.hp, MAX_HP);
        assert!(challenge.involves(2));

        let mut pending = table.pending_for_target(2);
        pending.sort_unstable();
        let mut expected = vec![id, other];
        expected.sort_unstable();
        assert_eq!(pending, expected);

        assert!(table.remove(id).is_some());
        assert!(table.get(id).is_none());
        assert_eq!(table.len(), 1);
    }
}
