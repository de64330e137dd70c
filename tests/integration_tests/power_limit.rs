// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use dtu_gateway_rs::{
    dtu_client::DtuClient,
    protocol::{
        frame,
        message::{CommandRequest, CommandResponse, GetConfigResponse, PvRaw, RealDataNewResponse, SgsRaw},
    },
};
use tokio::time::timeout;

use crate::integration_tests::common::{bind_loopback, run_fake_dtu, test_config, TestClock};

fn empty_real_data() -> Arc<RealDataNewResponse> {
    Arc::new(RealDataNewResponse {
        timestamp: 1_700_000_100,
        grid: SgsRaw::default(),
        pv: [PvRaw::default(), PvRaw::default()],
    })
}

/// Setting a power limit of 101% (out of range) is clamped to the
/// maximum wire value before it is ever put on the wire (§8 "clamp
/// high").
#[tokio::test]
async fn power_limit_is_clamped_on_the_wire() -> Result<()> {
    let (listener, port) = bind_loopback().await?;
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

    let get_config =
        Arc::new(GetConfigResponse { request_time: 1, wifi_rssi: -60, limit_power_mypower: 100 });
    let command_ack = Arc::new(CommandResponse { time: 1, action: 1, err_code: 0, tid: 1 });

    tokio::spawn(run_fake_dtu(listener, seen_tx, empty_real_data(), get_config, command_ack));

    let cfg = test_config("127.0.0.1", port);
    let (handle, _join) = DtuClient::spawn(cfg, Arc::new(TestClock));

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.set_power_limit(101).await;

    let command_body = timeout(Duration::from_secs(2), async {
        loop {
            let req = seen_rx.recv().await.expect("fake peer channel closed");
            if req.opcode == frame::opcode::COMMAND {
                return req.body;
            }
        }
    })
    .await?;

    // 101% clamps to 100% -> 1000 tenths in the ASCII payload.
    assert!(String::from_utf8_lossy(&command_body).contains("A:1000"));

    let snapshot = handle.snapshot().await;
    assert_eq!(snapshot.power_limit_set, Some(101));

    Ok(())
}

#[test]
fn clamp_helper_matches_wire_behavior() {
    assert_eq!(CommandRequest::clamp_power_tenths(101), 1000);
    assert_eq!(CommandRequest::clamp_power_tenths(0), 20);
}
