use serde_json::Value;

use super::message::ActionRequest;
use crate::signaling::PeerId;

/// Game logic supplied by the application; the host is the only caller of
/// `is_valid`, every peer replays accepted actions through `apply`
pub trait GameRules: Send + Sync {
    fn initial_state(&self) -> Value;

    fn is_valid(&self, state: &Value, action: &ActionRequest) -> bool;

    fn apply(&self, state: &Value, action: &ActionRequest) -> Value;
}

/// Who may act at a given state version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TurnPolicy {
    /// Players take turns in join order, starting from the first mover
    #[default]
    Alternating,
    /// Any room peer may act at any time
    Free,
}

impl TurnPolicy {
    /// Expected actor, or `None` when anyone may act
    pub fn expected_actor(
        self,
        players: &[PeerId],
        first_mover: Option<PeerId>,
        version: u64,
    ) -> Option<PeerId> {
        if self == TurnPolicy::Free || players.is_empty() {
            return None;
        }
        let first = first_mover?;
        let start = players.iter().position(|p| *p == first)?;
        let offset = (version % players.len() as u64) as usize;
        Some(players[(start + offset) % players.len()])
    }

    pub fn permits(
        self,
        players: &[PeerId],
        first_mover: Option<PeerId>,
        version: u64,
        actor: PeerId,
    ) -> bool {
        self.expected_actor(players, first_mover, version)
            .is_none_or(|expected| expected == actor)
    }
}

/// Rules used by the crate's own tests
#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{Value, json};

    use super::GameRules;
    use crate::session::message::ActionRequest;

    /// Two or more players placing marks on a 3x3 board
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TicTacToe;

    const LINES: [[usize; 3]; 8] = [
        [0, 1, 2],
        [3, 4, 5],
        [6, 7, 8],
        [0, 3, 6],
        [1, 4, 7],
        [2, 5, 8],
        [0, 4, 8],
        [2, 4, 6],
    ];

    impl TicTacToe {
        fn position(action: &ActionRequest) -> Option<usize> {
            action
                .input
                .get("position")
                .and_then(Value::as_u64)
                .map(|p| p as usize)
                .filter(|p| *p < 9)
        }

        fn winner(board: &[Value]) -> Option<Value> {
            LINES.iter().find_map(|[a, b, c]| {
                let mark = &board[*a];
                let won = !mark.is_null() && *mark == board[*b] && *mark == board[*c];
                won.then(|| mark.clone())
            })
        }
    }

    impl GameRules for TicTacToe {
        fn initial_state(&self) -> Value {
            json!({ "board": vec![Value::Null; 9], "winner": null })
        }

        fn is_valid(&self, state: &Value, action: &ActionRequest) -> bool {
            if action.action != "Move" || !state["winner"].is_null() {
                return false;
            }
            match Self::position(action) {
                Some(p) => state["board"][p].is_null(),
                None => false,
            }
        }

        fn apply(&self, state: &Value, action: &ActionRequest) -> Value {
            let mut next = state.clone();
            let Some(p) = Self::position(action) else {
                return next;
            };
            if let Some(board) = next["board"].as_array_mut() {
                if board.len() == 9 {
                    board[p] = Value::String(action.from.to_string());
                    if let Some(winner) = Self::winner(board) {
                        next["winner"] = winner;
                    }
                }
            }
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::fixtures::TicTacToe;
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::parse(id).unwrap()
    }

    fn play(from: &str, position: u64) -> ActionRequest {
        ActionRequest::new("Move", peer(from), json!({ "position": position }))
    }

    #[test]
    fn alternating_turns_start_from_first_mover() {
        let players = [peer("host"), peer("guest"), peer("third")];
        let policy = TurnPolicy::Alternating;

        assert_eq!(policy.expected_actor(&players, None, 0), None);
        assert!(policy.permits(&players, None, 0, peer("third")));

        let first = Some(peer("guest"));
        assert_eq!(policy.expected_actor(&players, first, 0), Some(peer("guest")));
        assert_eq!(policy.expected_actor(&players, first, 1), Some(peer("third")));
        assert_eq!(policy.expected_actor(&players, first, 2), Some(peer("host")));
        assert!(!policy.permits(&players, first, 1, peer("guest")));
    }

    #[test]
    fn free_policy_allows_anyone() {
        let players = [peer("host"), peer("guest")];
        assert!(TurnPolicy::Free.permits(&players, Some(peer("host")), 1, peer("host")));
    }

    #[test]
    fn tic_tac_toe_rejects_taken_cells_and_detects_winner() {
        let rules = TicTacToe;
        let mut state = rules.initial_state();

        for (from, position) in [("a", 0), ("b", 3), ("a", 1), ("b", 4)] {
            let action = play(from, position);
            assert!(rules.is_valid(&state, &action));
            state = rules.apply(&state, &action);
        }
        assert!(!rules.is_valid(&state, &play("a", 4)));
        assert!(!rules.is_valid(&state, &play("a", 9)));

        state = rules.apply(&state, &play("a", 2));
        assert_eq!(state["winner"], "a");
        assert!(!rules.is_valid(&state, &play("b", 5)));
    }
}
