// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use dtu_gateway_rs::{
    dtu_client::DtuClient,
    protocol::message::{CommandResponse, GetConfigResponse, PvRaw, RealDataNewResponse, SgsRaw},
};
use tokio::{net::TcpListener, time::timeout};

use crate::integration_tests::common::{run_fake_dtu, test_config, TestClock};

/// The client is pointed at a port nobody is listening on yet, retries
/// through several failed attempts, and recovers once the peer finally
/// comes up (§8 "connect storm").
#[tokio::test]
async fn recovers_once_peer_starts_listening() -> Result<()> {
    // Reserve a port, then immediately drop the listener so connects to
    // it fail fast until we rebind it below.
    let probe = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = probe.local_addr()?.port();
    drop(probe);

    let cfg = test_config("127.0.0.1", port);
    let (handle, _join) = DtuClient::spawn(cfg, Arc::new(TestClock));

    // Let a few failed connect attempts go by.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.snapshot().await.uptodate);

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let real_data = Arc::new(RealDataNewResponse {
        timestamp: 1_700_000_200,
        grid: SgsRaw { current: 100, voltage: 23000, active_power: 50, temperature: 300 },
        pv: [PvRaw::default(), PvRaw::default()],
    });
    let get_config =
        Arc::new(GetConfigResponse { request_time: 1, wifi_rssi: -50, limit_power_mypower: 90 });
    tokio::spawn(run_fake_dtu(
        listener,
        seen_tx,
        real_data,
        get_config,
        Arc::new(CommandResponse::default()),
    ));

    timeout(Duration::from_secs(5), async {
        loop {
            handle.get_data_update().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            if handle.snapshot().await.uptodate {
                return;
            }
        }
    })
    .await?;

    // Drain anything the fake peer recorded so the channel doesn't
    // outlive the test with a dangling sender.
    while seen_rx.try_recv().is_ok() {}

    Ok(())
}
