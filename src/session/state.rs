use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::ActionRequest;
use super::rules::GameRules;
use crate::signaling::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    /// Payload is the full game state
    Snapshot,
    /// Payload is the accepted `ActionRequest`, replayed by receivers
    Delta,
}

/// Versioned state update broadcast by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Bumped only on restart; orders updates before `version`
    pub epoch: u32,
    pub version: u64,
    /// Milliseconds since the Unix epoch, UTC
    pub timestamp: i64,
    pub kind: StateKind,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_mover: Option<PeerId>,
}

impl SessionState {
    pub fn snapshot(epoch: u32, version: u64, game: Value, first_mover: Option<PeerId>) -> Self {
        Self {
            epoch,
            version,
            timestamp: Utc::now().timestamp_millis(),
            kind: StateKind::Snapshot,
            payload: game,
            first_mover,
        }
    }

    pub fn delta(
        epoch: u32,
        version: u64,
        action: &ActionRequest,
        first_mover: Option<PeerId>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            epoch,
            version,
            timestamp: Utc::now().timestamp_millis(),
            kind: StateKind::Delta,
            payload: serde_json::to_value(action)?,
            first_mover,
        })
    }

    pub fn is_newer_than(&self, epoch: u32, version: u64) -> bool {
        (self.epoch, self.version) > (epoch, version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Not newer than what is held; discarded
    Stale,
    /// A delta that cannot be replayed here; a snapshot is needed
    Gap,
}

/// A peer's replica of the game state
#[derive(Debug, Clone)]
pub struct StateView {
    epoch: u32,
    version: u64,
    game: Value,
    first_mover: Option<PeerId>,
    synced: bool,
}

impl StateView {
    /// Replica waiting for its first snapshot
    pub fn unsynced(initial: Value) -> Self {
        Self {
            epoch: 0,
            version: 0,
            game: initial,
            first_mover: None,
            synced: false,
        }
    }

    /// The host's own copy, authoritative from the start
    pub fn authoritative(initial: Value) -> Self {
        Self {
            synced: true,
            ..Self::unsynced(initial)
        }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn game(&self) -> &Value {
        &self.game
    }

    pub fn first_mover(&self) -> Option<PeerId> {
        self.first_mover
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn snapshot(&self) -> SessionState {
        SessionState::snapshot(self.epoch, self.version, self.game.clone(), self.first_mover)
    }

    /// Apply a host update, enforcing `(epoch, version)` ordering
    pub fn apply_update(
        &mut self,
        update: &SessionState,
        rules: &dyn GameRules,
    ) -> Result<ApplyOutcome, serde_json::Error> {
        if self.synced && !update.is_newer_than(self.epoch, self.version) {
            return Ok(ApplyOutcome::Stale);
        }

        match update.kind {
            StateKind::Snapshot => {
                self.epoch = update.epoch;
                self.version = update.version;
                self.game = update.payload.clone();
                self.first_mover = update.first_mover;
                self.synced = true;
            }
            StateKind::Delta => {
                if !self.synced
                    || update.epoch != self.epoch
                    || update.version != self.version + 1
                {
                    return Ok(ApplyOutcome::Gap);
                }
                let action: ActionRequest = serde_json::from_value(update.payload.clone())?;
                self.game = rules.apply(&self.game, &action);
                self.version = update.version;
                self.first_mover = update.first_mover;
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    /// Host side: record an accepted action's result
    pub(crate) fn advance(&mut self, game: Value, first_mover: Option<PeerId>) {
        self.game = game;
        self.first_mover = first_mover;
        self.version += 1;
    }

    /// Host side: start a new epoch from `initial`
    pub(crate) fn restart(&mut self, initial: Value) {
        self.epoch += 1;
        self.version = 0;
        self.game = initial;
        self.first_mover = None;
        self.synced = true;
    }

    /// Taking over as host keeps whatever was last applied
    pub(crate) fn take_authority(&mut self) {
        self.synced = true;
    }
}
