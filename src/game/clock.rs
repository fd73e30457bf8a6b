//! Player clocks.
//!
//! A clock counts whole seconds down and reports expiry exactly once per
//! arming. Every arm or cancel bumps a generation counter; an expiry
//! carries the generation it fired under, so whoever acts on it later can
//! discard it if the clock has been re-armed or stopped in the meantime.

use serde::{Serialize, Deserialize};

/// How a session limits thinking time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerMode {
    /// No clocks.
    #[default]
    None,
    /// Each turn gets a fresh allowance; only the current player's clock runs.
    Turn,
    /// Chess clock: one allowance for the whole game, running only while
    /// the player is on the move.
    Game,
}

/// Clock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockState {
    /// Not counting.
    #[default]
    Idle,
    /// Counting down.
    Running,
    /// Reached zero; the expiry has been reported.
    Expired,
}

/// Emitted once when a running clock reaches zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockExpiry {
    /// Generation the clock was armed with.
    pub generation: u64,
}

/// Countdown clock.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Clock {
    /// Seconds left. `None` until first started.
    pub remaining: Option<i32>,
    /// Current state.
    pub state: ClockState,
    /// Bumped on every start, resume and stop.
    pub generation: u64,
}

impl Clock {
    /// Arm the clock for `seconds`, replacing any pending expiry.
    pub fn start(&mut self, seconds: u32) -> u64 {
        self.remaining = Some(seconds as i32);
        self.state = ClockState::Running;
        self.generation += 1;
        self.generation
    }

    /// Continue counting from the current remaining time.
    ///
    /// A clock that already ran out stays expired.
    pub fn resume(&mut self) -> u64 {
        self.generation += 1;
        match self.remaining {
            Some(r) if r > 0 => self.state = ClockState::Running,
            Some(_) => self.state = ClockState::Expired,
            None => {}
        }
        self.generation
    }

    /// Cancel a pending expiry without firing it.
    pub fn stop(&mut self) {
        if self.state == ClockState::Running {
            self.state = ClockState::Idle;
        }
        self.generation += 1;
    }

    /// Cancel any pending expiry and forget the allowance.
    pub fn reset(&mut self) {
        self.stop();
        self.remaining = None;
    }

    /// Is the clock counting?
    pub fn is_running(&self) -> bool {
        self.state == ClockState::Running
    }

    /// Advance by one second.
    pub fn tick(&mut self) -> Option<ClockExpiry> {
        if self.state != ClockState::Running {
            return None;
        }
        let remaining = self.remaining.unwrap_or(0) - 1;
        self.remaining = Some(remaining);
        if remaining <= 0 {
            self.state = ClockState::Expired;
            Some(ClockExpiry { generation: self.generation })
        } else {
            None
        }
    }
}
