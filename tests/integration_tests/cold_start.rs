// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use dtu_gateway_rs::{
    dtu_client::DtuClient,
    protocol::message::{CommandResponse, GetConfigResponse, PvRaw, RealDataNewResponse, SgsRaw},
};
use tokio::time::timeout;

use crate::integration_tests::common::{bind_loopback, run_fake_dtu, test_config, TestClock};

/// A freshly-connected client issues a real-data request, chains into a
/// get-config request, and ends up with a populated, up-to-date
/// snapshot (§8 "cold start").
#[tokio::test]
async fn cold_start_populates_snapshot() -> Result<()> {
    let (listener, port) = bind_loopback().await?;
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

    let real_data = Arc::new(RealDataNewResponse {
        timestamp: 1_700_000_000,
        grid: SgsRaw { current: 1000, voltage: 23010, active_power: 500, temperature: 350 },
        pv: [
            PvRaw { current: 500, voltage: 4000, power: 250, energy_daily: 1200, energy_total: 500_000 },
            PvRaw { current: 510, voltage: 4010, power: 255, energy_daily: 1300, energy_total: 600_000 },
        ],
    });
    let get_config =
        Arc::new(GetConfigResponse { request_time: 1, wifi_rssi: -55, limit_power_mypower: 80 });
    let command_ack = Arc::new(CommandResponse::default());

    tokio::spawn(run_fake_dtu(listener, seen_tx, real_data, get_config, command_ack));

    let cfg = test_config("127.0.0.1", port);
    let (handle, _join) = DtuClient::spawn(cfg, Arc::new(TestClock));

    // Give the actor a moment to connect, then ask for a sample.
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.get_data_update().await;

    // Wait until both the real-data and get-config requests round-trip.
    timeout(Duration::from_secs(2), async {
        let mut opcodes = Vec::new();
        while opcodes.len() < 2 {
            if let Some(req) = seen_rx.recv().await {
                opcodes.push(req.opcode);
            }
        }
        opcodes
    })
    .await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = handle.snapshot().await;
    assert!(snapshot.uptodate);
    assert_eq!(snapshot.power_limit, Some(80));
    assert!(snapshot.grid.power > 0.0);

    Ok(())
}
