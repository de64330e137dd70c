// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cloud-coexistence scheduler (§4.6): the DTU uploads to its vendor cloud
//! at the top, quarter, half, and three-quarter of every hour. The core
//! drops the connection for a fixed window straddling each of those marks
//! so the two peers do not fight over the DTU's single TCP port.

use chrono::{DateTime, Timelike, Utc};

const PAUSE_MINUTES: [u32; 4] = [59, 14, 29, 44];
const PAUSE_SECOND_THRESHOLD: u32 = 40;

#[derive(Debug, Clone, Copy)]
pub struct CloudPauseScheduler {
    enabled: bool,
    cloud_upload_seconds: u64,
    paused: bool,
    last_sw_off: Option<u64>,
}

impl CloudPauseScheduler {
    pub fn new(enabled: bool, cloud_upload_seconds: u64) -> Self {
        Self { enabled, cloud_upload_seconds, paused: false, last_sw_off: None }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Called each tick while connected. Returns `true` the instant the
    /// pause window is entered (the caller should close the socket and
    /// publish a final sample).
    pub fn enter_if_due(&mut self, now_unix: u64) -> bool {
        if !self.enabled || self.paused {
            return false;
        }
        if Self::in_window(now_unix) {
            self.paused = true;
            self.last_sw_off = Some(now_unix);
            return true;
        }
        false
    }

    /// Called each tick while paused. Returns `true` the instant the
    /// window has elapsed (the caller should resume normal retry).
    pub fn exit_if_due(&mut self, now_unix: u64) -> bool {
        if !self.paused {
            return false;
        }
        let Some(start) = self.last_sw_off else { return false };
        if now_unix > start + self.cloud_upload_seconds {
            self.paused = false;
            self.last_sw_off = None;
            return true;
        }
        false
    }

    fn in_window(now_unix: u64) -> bool {
        let Some(dt) = DateTime::<Utc>::from_timestamp(now_unix as i64, 0) else {
            return false;
        };
        PAUSE_MINUTES.contains(&dt.minute()) && dt.second() >= PAUSE_SECOND_THRESHOLD
    }
}
