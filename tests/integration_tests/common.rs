// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use dtu_gateway_rs::{
    cfg::config::{Config, DtuConfig, RuntimeConfig},
    protocol::{
        frame,
        message::{CommandResponse, GetConfigResponse, RealDataNewResponse},
    },
    time::WallClock,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

/// Config tuned for fast-converging tests: short timeouts, a short
/// retry budget, and no cloud-coexistence pauses.
pub fn test_config(server: &str, port: u16) -> Config {
    Config {
        dtu: DtuConfig {
            server: server.to_string(),
            port,
            prevent_cloud_errors: false,
            cloud_upload_seconds: std::time::Duration::from_secs(40),
        },
        runtime: RuntimeConfig {
            tick_period: std::time::Duration::from_millis(50),
            keepalive_period: std::time::Duration::from_millis(200),
            short_retry_limit: 2,
            long_retry_pause: std::time::Duration::from_secs(60),
            timeout_connection: std::time::Duration::from_secs(2),
        },
    }
}

/// A [`WallClock`] that always reports the link as up and derives "now"
/// from the real system clock, which is good enough for these
/// short-lived tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestClock;

impl WallClock for TestClock {
    fn now_unix(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn link_up(&self) -> bool {
        true
    }
}

/// Binds an ephemeral loopback listener and returns it with its port.
pub async fn bind_loopback() -> Result<(TcpListener, u16)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// One request/response frame exchanged with the fake peer.
pub struct RecordedRequest {
    pub opcode: u8,
    pub body: bytes::Bytes,
}

/// Accepts a single connection and replies to every request with the
/// canned response the caller supplies for that opcode, until the
/// socket closes. Every inbound frame is forwarded on `seen` for the
/// test to assert against.
pub async fn run_fake_dtu(
    listener: TcpListener,
    seen: tokio::sync::mpsc::UnboundedSender<RecordedRequest>,
    real_data: Arc<RealDataNewResponse>,
    get_config: Arc<GetConfigResponse>,
    command_ack: Arc<CommandResponse>,
) -> Result<()> {
    let (mut sock, _) = listener.accept().await?;
    let mut scratch = vec![0u8; 256];

    loop {
        if sock.read_exact(&mut scratch[..frame::HEADER_LEN]).await.is_err() {
            return Ok(());
        }
        let Some(total_len) = frame::peek_total_len(&scratch[..frame::HEADER_LEN]) else {
            return Ok(());
        };
        let body_len = total_len - frame::HEADER_LEN;
        if body_len > 0 {
            if scratch.len() < total_len {
                scratch.resize(total_len, 0);
            }
            if sock.read_exact(&mut scratch[frame::HEADER_LEN..total_len]).await.is_err() {
                return Ok(());
            }
        }

        let whole = bytes::Bytes::copy_from_slice(&scratch[..total_len]);
        let decoded = match frame::decode_frame(&whole) {
            Ok(d) => d,
            Err(_) => continue,
        };
        let _ = seen.send(RecordedRequest { opcode: decoded.opcode, body: decoded.body.clone() });

        let reply = match decoded.opcode {
            op if op == frame::opcode::REAL_DATA_NEW => {
                frame::encode_frame(op, false, &real_data.encode())?
            },
            op if op == frame::opcode::GET_CONFIG => {
                frame::encode_frame(op, false, &get_config.encode())?
            },
            op if op == frame::opcode::COMMAND => {
                frame::encode_frame(op, false, &command_ack.encode())?
            },
            _ => continue,
        };
        if sock.write_all(&reply).await.is_err() {
            return Ok(());
        }
    }
}
