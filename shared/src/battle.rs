//! Rock-paper-scissors rules shared by the server (to resolve turns) and
//! the client (to describe them)

use crate::protocol::BattleAction;

/// Outcome of one exchange from the first side's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Win,
    Lose,
    Tie,
}

fn beats(a: BattleAction, b: BattleAction) -> bool {
    matches!(
        (a, b),
        (BattleAction::Rock, BattleAction::Scissors)
            | (BattleAction::Scissors, BattleAction::Paper)
            | (BattleAction::Paper, BattleAction::Rock)
    )
}

/// Compares two moves. Unknown moves never win, so two unknown moves or an
/// unknown against a known move that does not beat it count as a tie.
pub fn turn_outcome(a: BattleAction, b: BattleAction) -> TurnOutcome {
    if beats(a, b) {
        TurnOutcome::Win
    } else if beats(b, a) {
        TurnOutcome::Lose
    } else {
        TurnOutcome::Tie
    }
}
