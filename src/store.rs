// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Telemetry snapshot and the validators that guard it: timestamp
//! freshness, the grid-voltage hanging-value detector, and the "night"
//! liveness fallback.

use tracing::{debug, warn};

use crate::protocol::message::{self, GetConfigResponse, RealDataNewResponse, scale};

/// A single electrical channel (grid, or one PV string).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelReading {
    pub current: f64,
    pub voltage: f64,
    pub power: f64,
    pub daily_energy: f64,
    pub total_energy: f64,
}

/// Recovered (non-propagating) error states, mirrored from the source
/// device's `errorState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorState {
    #[default]
    NoError,
    NoTime,
    DataNoChange,
    LastSend,
}

const HANGING_WINDOW: usize = 10;
const TIMESTAMP_SYNC_SLOP_SECS: i64 = 3;
const NIGHT_FALLBACK_SECS: u64 = 180;
const NIGHT_FALLBACK_LOOKAHEAD_SECS: u64 = 5;

/// Ring buffer over the last [`HANGING_WINDOW`] grid-voltage samples, used
/// to detect a DTU that has stopped refreshing its internal state.
#[derive(Debug, Default)]
struct VoltageRing {
    samples: [f64; HANGING_WINDOW],
    filled: usize,
    next: usize,
}

impl VoltageRing {
    fn push(&mut self, v: f64) {
        self.samples[self.next] = v;
        self.next = (self.next + 1) % HANGING_WINDOW;
        self.filled = (self.filled + 1).min(HANGING_WINDOW);
    }

    fn is_hanging(&self) -> bool {
        self.filled == HANGING_WINDOW && self.samples.windows(2).all(|w| w[0] == w[1])
    }
}

/// The single in-memory telemetry snapshot, owned by the actor and
/// published to readers through a clone under a shared lock (see
/// [`crate::dtu_client::DtuHandle`]).
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub grid: ChannelReading,
    pub pv0: ChannelReading,
    pub pv1: ChannelReading,
    pub inverter_temp: f64,
    /// Power limit as last reported by the peer (2..=100), or `None` while
    /// the sentinel value is in effect.
    pub power_limit: Option<u32>,
    /// Power limit the operator last requested.
    pub power_limit_set: Option<u32>,
    pub dtu_rssi: u32,
    pub resp_timestamp: u64,
    pub last_resp_timestamp: u64,
    pub current_timestamp: u64,
    pub uptodate: bool,
    pub update_received: bool,
    pub dtu_reset_requested: u32,
    pub error_state: ErrorState,
    /// `connectState ∈ {CONNECTED, CLOUD_PAUSE}`, debounced 90s on the
    /// falling edge; owned and written by [`crate::dtu_client::DtuClient`].
    pub online: bool,
}

/// Outcome of applying a real-data response, used by the transaction
/// sequencer to decide whether to trigger `handleError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    NoTime,
    DataHanging,
}

/// Owns the snapshot plus the validator state that must not leak into
/// published copies (the voltage ring).
#[derive(Debug, Default)]
pub struct Store {
    pub snapshot: Snapshot,
    ring: VoltageRing,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a decoded real-data response, per §4.5 rule 1 and 2.
    pub fn apply_real_data(&mut self, resp: &RealDataNewResponse) -> ApplyOutcome {
        let resp_ts = resp.timestamp as u64;

        if resp_ts == 0 || resp_ts == self.snapshot.resp_timestamp {
            self.snapshot.uptodate = false;
            self.snapshot.error_state = ErrorState::NoTime;
            warn!(resp_ts, "real-data response carried stale or zero timestamp");
            return ApplyOutcome::NoTime;
        }

        self.snapshot.uptodate = true;
        self.snapshot.error_state = ErrorState::NoError;
        self.snapshot.resp_timestamp = resp_ts;
        self.snapshot.last_resp_timestamp = resp_ts;

        let drift = resp_ts as i64 - self.snapshot.current_timestamp as i64;
        if drift.abs() > TIMESTAMP_SYNC_SLOP_SECS {
            self.snapshot.current_timestamp = resp_ts;
        }

        self.snapshot.grid.current = resp.grid.current as f64 / scale::CURRENT_DIVIDER;
        self.snapshot.grid.voltage = resp.grid.voltage as f64;
        self.snapshot.grid.power = resp.grid.active_power as f64;
        self.snapshot.inverter_temp = resp.grid.temperature as f64;

        self.snapshot.pv0.current = resp.pv[0].current as f64 / scale::CURRENT_DIVIDER;
        self.snapshot.pv0.voltage = resp.pv[0].voltage as f64;
        self.snapshot.pv0.power = resp.pv[0].power as f64;
        self.snapshot.pv0.daily_energy = resp.pv[0].energy_daily as f64 / scale::ENERGY_DIVIDER;
        if resp.pv[0].energy_total != 0 {
            self.snapshot.pv0.total_energy = resp.pv[0].energy_total as f64 / scale::ENERGY_DIVIDER;
        }

        self.snapshot.pv1.current = resp.pv[1].current as f64 / scale::CURRENT_DIVIDER;
        self.snapshot.pv1.voltage = resp.pv[1].voltage as f64;
        self.snapshot.pv1.power = resp.pv[1].power as f64;
        self.snapshot.pv1.daily_energy = resp.pv[1].energy_daily as f64 / scale::ENERGY_DIVIDER;
        // NB: guarded by pv0's total energy, not pv1's. This mirrors a quirk in
        // the source device (`writeReqRealDataNew`/`readRespRealDataNew`) that
        // looks like a copy-paste bug; preserved faithfully rather than fixed,
        // per the behavior this was ported from.
        if resp.pv[0].energy_total != 0 {
            self.snapshot.pv1.total_energy = resp.pv[1].energy_total as f64 / scale::ENERGY_DIVIDER;
        }

        self.snapshot.grid.daily_energy = self.snapshot.pv0.daily_energy + self.snapshot.pv1.daily_energy;
        self.snapshot.grid.total_energy = self.snapshot.pv0.total_energy + self.snapshot.pv1.total_energy;

        self.ring.push(self.snapshot.grid.voltage);
        if self.ring.is_hanging() {
            warn!("grid voltage has not changed over the last {HANGING_WINDOW} samples");
            self.snapshot.error_state = ErrorState::DataNoChange;
            return ApplyOutcome::DataHanging;
        }

        self.snapshot.update_received = true;
        ApplyOutcome::Applied
    }

    /// Applies a decoded get-config response, per §4.2.
    pub fn apply_get_config(&mut self, resp: &GetConfigResponse) {
        self.snapshot.dtu_rssi = resp.wifi_rssi.max(0) as u32;
        if resp.limit_power_mypower != message::POWER_LIMIT_UNKNOWN {
            self.snapshot.power_limit = Some(resp.limit_power_mypower.clamp(2, 100) as u32);
            self.snapshot.update_received = true;
        }
    }

    /// Runs each tick: zeroes the snapshot exactly once if no data has
    /// arrived in [`NIGHT_FALLBACK_SECS`], per §4.5 rule 3.
    pub fn check_liveness(&mut self) -> bool {
        if self.snapshot.error_state == ErrorState::LastSend {
            return false;
        }
        let elapsed = (self.snapshot.current_timestamp + NIGHT_FALLBACK_LOOKAHEAD_SECS)
            .saturating_sub(self.snapshot.last_resp_timestamp);
        if elapsed > NIGHT_FALLBACK_SECS && self.snapshot.grid.voltage > 0.0 {
            debug!("no data for {elapsed}s, zeroing snapshot (night fallback)");
            self.zero_electrical();
            self.snapshot.error_state = ErrorState::LastSend;
            self.snapshot.update_received = true;
            return true;
        }
        false
    }

    fn zero_electrical(&mut self) {
        self.snapshot.grid = ChannelReading {
            daily_energy: self.snapshot.grid.daily_energy,
            total_energy: self.snapshot.grid.total_energy,
            ..Default::default()
        };
        self.snapshot.pv0 = ChannelReading {
            daily_energy: self.snapshot.pv0.daily_energy,
            total_energy: self.snapshot.pv0.total_energy,
            ..Default::default()
        };
        self.snapshot.pv1 = ChannelReading {
            daily_energy: self.snapshot.pv1.daily_energy,
            total_energy: self.snapshot.pv1.total_energy,
            ..Default::default()
        };
        self.snapshot.dtu_rssi = 0;
    }

    /// Clears the one-shot update flag, mirroring the publisher's contract
    /// in §6: it must consume `updateReceived` after reading.
    pub fn take_update_flag(&mut self) -> bool {
        std::mem::take(&mut self.snapshot.update_received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{PvRaw, SgsRaw};

    fn response(ts: u32, voltage: i32) -> RealDataNewResponse {
        RealDataNewResponse {
            timestamp: ts,
            grid: SgsRaw { current: 100, voltage, active_power: 500, temperature: 300 },
            pv: [
                PvRaw { current: 50, voltage: 2000, power: 250, energy_daily: 100, energy_total: 1000 },
                PvRaw { current: 50, voltage: 2000, power: 250, energy_daily: 100, energy_total: 2000 },
            ],
        }
    }

    #[test]
    fn energies_sum_after_real_data_update() {
        let mut store = Store::new();
        store.apply_real_data(&response(1_700_000_000, 23000));
        assert_eq!(
            store.snapshot.grid.daily_energy,
            store.snapshot.pv0.daily_energy + store.snapshot.pv1.daily_energy
        );
        assert_eq!(
            store.snapshot.grid.total_energy,
            store.snapshot.pv0.total_energy + store.snapshot.pv1.total_energy
        );
    }

    #[test]
    fn zero_timestamp_triggers_no_time() {
        let mut store = Store::new();
        let outcome = store.apply_real_data(&response(0, 23000));
        assert_eq!(outcome, ApplyOutcome::NoTime);
        assert_eq!(store.snapshot.error_state, ErrorState::NoTime);
    }

    #[test]
    fn ten_identical_voltages_trigger_hanging() {
        let mut store = Store::new();
        let mut last = ApplyOutcome::Applied;
        for i in 0..10u32 {
            last = store.apply_real_data(&response(1_700_000_000 + i, 23000));
        }
        assert_eq!(last, ApplyOutcome::DataHanging);
    }

    #[test]
    fn pv1_total_energy_guarded_by_pv0_flag_quirk() {
        let mut store = Store::new();
        let mut resp = response(1_700_000_000, 23000);
        resp.pv[0].energy_total = 0; // pv0 reports nothing new...
        resp.pv[1].energy_total = 5000; // ...but pv1 does
        store.apply_real_data(&resp);
        // pv1's total energy is NOT refreshed because pv0's flag gated it.
        assert_eq!(store.snapshot.pv1.total_energy, 0.0);
    }

    #[test]
    fn sentinel_power_limit_does_not_publish_update() {
        let mut store = Store::new();
        store.apply_get_config(&GetConfigResponse {
            request_time: 1,
            wifi_rssi: -50,
            limit_power_mypower: 254,
        });
        assert!(store.snapshot.power_limit.is_none());
        assert!(!store.snapshot.update_received);
    }

    #[test]
    fn liveness_fallback_fires_once() {
        let mut store = Store::new();
        store.apply_real_data(&response(1000, 23000));
        store.snapshot.current_timestamp = 1000 + 200;
        assert!(store.check_liveness());
        assert_eq!(store.snapshot.error_state, ErrorState::LastSend);
        assert_eq!(store.snapshot.grid.voltage, 0.0);
        // does not repeat
        assert!(!store.check_liveness());
    }
}
