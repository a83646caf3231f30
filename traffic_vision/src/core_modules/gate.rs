// THEORY:
// The `InitializationGate` models the latency of connecting to an inference backend
// that does not exist. When a slot starts inferencing the gate spends a fixed warmup
// in `Connecting`, during which nothing is simulated or painted, and then opens by
// itself. Turning inferencing off at any point closes the gate and forgets the
// pending warmup; turning it back on restarts the full delay.
//
// The gate is a plain state machine fed with explicit instants. The worker that owns
// it sleeps until `deadline()` and then calls `poll`, which keeps the timing rules in
// one testable place.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_WARMUP: Duration = Duration::from_millis(2500);

/// Externally visible gate phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePhase {
    Closed,
    Connecting,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Closed,
    Connecting { since: Instant },
    Open,
}

#[derive(Debug, Clone)]
pub struct InitializationGate {
    state: GateState,
    warmup: Duration,
    inferencing: bool,
}

impl InitializationGate {
    pub fn new(warmup: Duration) -> Self {
        Self {
            state: GateState::Closed,
            warmup,
            inferencing: false,
        }
    }

    /// Feeds the slot's inferencing flag. Only a false→true edge starts a warmup.
    pub fn set_inferencing(&mut self, inferencing: bool, now: Instant) -> GatePhase {
        if inferencing && !self.inferencing {
            self.state = GateState::Connecting { since: now };
        } else if !inferencing {
            self.state = GateState::Closed;
        }
        self.inferencing = inferencing;
        self.phase()
    }

    /// Opens the gate once the warmup has fully elapsed.
    pub fn poll(&mut self, now: Instant) -> GatePhase {
        if let GateState::Connecting { since } = self.state {
            if now.saturating_duration_since(since) >= self.warmup {
                self.state = GateState::Open;
            }
        }
        self.phase()
    }

    /// When a `Connecting` gate will open.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            GateState::Connecting { since } => Some(since + self.warmup),
            _ => None,
        }
    }

    pub fn phase(&self) -> GatePhase {
        match self.state {
            GateState::Closed => GatePhase::Closed,
            GateState::Connecting { .. } => GatePhase::Connecting,
            GateState::Open => GatePhase::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == GateState::Open
    }
}
