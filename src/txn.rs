// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Single-outstanding-request transaction sequencer.
//!
//! At most one request may be in flight. [`Sequencer`] tracks which kind,
//! applies the chaining rule on completion (real-data and command both
//! chain into get-config), and runs a watchdog that forces the state back
//! to idle if a response never arrives.

use std::time::Duration;

use tracing::warn;

/// Kind of request currently outstanding, or none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    WaitRealDataNew,
    WaitAppGetHistPower,
    WaitGetConfig,
    WaitCommand,
    WaitRestartDevice,
}

/// Watchdog timeout for an outstanding request, per §4.3.
pub const TXN_TIMEOUT: Duration = Duration::from_secs(15);

/// What the caller should do after a response is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    /// No follow-up request; the transaction completed.
    None,
    /// Immediately issue a GetConfig request before yielding to the
    /// executor, per §4.3's chaining rule.
    IssueGetConfig,
}

#[derive(Debug)]
pub struct Sequencer {
    state: TxState,
    /// Monotonic seconds since the current state was entered; compared
    /// against the wall clock supplied to [`Sequencer::tick`].
    state_since: u64,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self { state: TxState::Idle, state_since: 0 }
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == TxState::Idle
    }

    /// Marks `kind` as outstanding. The caller must ensure `is_idle()` was
    /// true before issuing the request; an implementer calling this while
    /// busy would violate the at-most-one-outstanding invariant.
    pub fn begin(&mut self, kind: TxState, now: u64) {
        debug_assert_ne!(kind, TxState::Idle, "begin() must be given a Wait* state");
        self.state = kind;
        self.state_since = now;
    }

    /// Applies a response for the currently outstanding kind, returning
    /// the chaining action per §4.3. Returns `None` chaining and logs if
    /// the response does not match what was outstanding (unknown/stray
    /// response: logged and dropped, state is not reset).
    pub fn complete(&mut self, responding_to: TxState) -> Chain {
        if self.state != responding_to {
            warn!(expected = ?self.state, got = ?responding_to, "response did not match outstanding transaction");
            return Chain::None;
        }
        let chain = match self.state {
            TxState::WaitRealDataNew | TxState::WaitCommand => Chain::IssueGetConfig,
            TxState::WaitGetConfig
            | TxState::WaitRestartDevice
            | TxState::WaitAppGetHistPower
            | TxState::Idle => Chain::None,
        };
        self.state = TxState::Idle;
        chain
    }

    /// Runs once per tick; forces the state back to idle if the 15s
    /// watchdog has elapsed. Returns `true` if it fired.
    pub fn watchdog(&mut self, now: u64) -> bool {
        if self.state == TxState::Idle {
            return false;
        }
        if now.saturating_sub(self.state_since) >= TXN_TIMEOUT.as_secs() {
            warn!(state = ?self.state, "transaction watchdog fired, forcing idle");
            self.state = TxState::Idle;
            return true;
        }
        false
    }
}
