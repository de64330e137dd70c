// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection manager (§4.4): owns the TCP socket, drives the
//! connect/retry/pause/stop state machine, and hands whole inbound frames
//! to the actor via a channel.

use std::{future::Future, time::Duration};

use anyhow::{Result, anyhow, bail};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::OwnedWriteHalf,
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::RuntimeConfig,
    protocol::frame::{self, HEADER_LEN},
};

/// Connection lifecycle state, mirroring the source device's `connectState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Offline,
    TryReconnect,
    Connected,
    CloudPause,
    ConnectError,
    DtuReboot,
    Stopped,
}

async fn io_with_timeout<F, T>(label: &'static str, fut: F, io_timeout: Duration) -> Result<T>
where F: Future<Output = std::io::Result<T>> {
    match tokio::time::timeout(io_timeout, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(anyhow!("{label} timeout")),
    }
}

/// A whole frame read off the wire, or a signal that the read side ended.
#[derive(Debug)]
pub enum InboundEvent {
    Frame(frame::DecodedFrame),
    Closed,
    Error(String),
}

struct ActiveSocket {
    writer: OwnedWriteHalf,
    cancel: CancellationToken,
    inbound: mpsc::Receiver<InboundEvent>,
}

/// Owns the socket and the connect/retry/pause state machine. Does not
/// itself decide *when* to transition to `CloudPause`; the cloud scheduler
/// and the actor drive that through [`ConnectionManager::force_state`].
pub struct ConnectionManager {
    state: ConnectState,
    short_retries: u32,
    long_retries: u32,
    pause_start: Option<u64>,
    socket: Option<ActiveSocket>,
    short_retry_limit: u32,
    long_retry_pause_secs: u64,
    timeout_connection: Duration,
}

impl ConnectionManager {
    pub fn new(cfg: &RuntimeConfig) -> Self {
        Self {
            state: ConnectState::Offline,
            short_retries: 0,
            long_retries: 0,
            pause_start: None,
            socket: None,
            short_retry_limit: cfg.short_retry_limit,
            long_retry_pause_secs: cfg.long_retry_pause.as_secs(),
            timeout_connection: cfg.timeout_connection,
        }
    }

    pub fn state(&self) -> ConnectState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectState::Connected
    }

    /// Whether a new connect attempt may be made this tick, per §4.4's
    /// retry policy: up to 5 short retries, then a 60s pause.
    fn may_attempt_connect(&self, now: u64) -> bool {
        if self.long_retries > 0 {
            match self.pause_start {
                Some(start) => now.saturating_sub(start) >= self.long_retry_pause_secs,
                None => true,
            }
        } else {
            true
        }
    }

    /// Drives one tick of the OFFLINE -> TRY_RECONNECT transition. Returns
    /// `true` if a connect attempt was made (successful or not).
    pub async fn tick_connect(&mut self, addr: &str, port: u16, link_up: bool, now: u64) -> bool {
        if self.state != ConnectState::Offline || !link_up {
            return false;
        }
        if !self.may_attempt_connect(now) {
            return false;
        }
        if self.short_retries >= self.short_retry_limit {
            self.long_retries = 1;
            self.pause_start = Some(now);
            self.short_retries = 0;
            return false;
        }

        self.state = ConnectState::TryReconnect;
        match self.connect(addr, port).await {
            Ok(()) => {
                self.state = ConnectState::Connected;
                self.short_retries = 0;
                self.long_retries = 0;
                self.pause_start = None;
            },
            Err(e) => {
                warn!("connect failed: {e}");
                self.state = ConnectState::ConnectError;
                self.short_retries += 1;
            },
        }
        true
    }

    /// CONNECT_ERROR and DTU_REBOOT both fall back to OFFLINE on the
    /// following tick: a connect error has nothing left to clean up, and a
    /// device told to reboot is assumed to drop the connection itself.
    pub fn tick_error_recovery(&mut self) {
        match self.state {
            ConnectState::ConnectError => self.state = ConnectState::Offline,
            ConnectState::DtuReboot => self.force_state(ConnectState::Offline),
            _ => {},
        }
    }

    /// Changes the logical state without touching the socket, used while a
    /// request is still expected to complete over the current connection
    /// (e.g. the restart-device command itself).
    pub fn set_state(&mut self, state: ConnectState) {
        self.state = state;
    }

    async fn connect(&mut self, addr: &str, port: u16) -> Result<()> {
        let stream =
            io_with_timeout("connect", TcpStream::connect((addr, port)), self.timeout_connection)
                .await?;
        stream.set_nodelay(true)?;

        let (mut reader, writer) = stream.into_split();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut scratch = BytesMut::with_capacity(256);
            loop {
                scratch.clear();
                scratch.resize(HEADER_LEN, 0);
                let read = tokio::select! {
                    _ = reader_cancel.cancelled() => return,
                    res = reader.read_exact(&mut scratch[..HEADER_LEN]) => res,
                };
                match read {
                    Ok(_) => {},
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        let _ = tx.send(InboundEvent::Closed).await;
                        return;
                    },
                    Err(e) => {
                        let _ = tx.send(InboundEvent::Error(e.to_string())).await;
                        return;
                    },
                }

                let Some(total_len) = frame::peek_total_len(&scratch) else {
                    let _ = tx.send(InboundEvent::Error("short header".into())).await;
                    return;
                };
                let body_len = total_len.saturating_sub(HEADER_LEN);
                if body_len > 0 {
                    let old = scratch.len();
                    scratch.resize(old + body_len, 0);
                    let read = tokio::select! {
                        _ = reader_cancel.cancelled() => return,
                        res = reader.read_exact(&mut scratch[old..old + body_len]) => res,
                    };
                    if let Err(e) = read {
                        let _ = tx.send(InboundEvent::Error(e.to_string())).await;
                        return;
                    }
                }

                let whole: Bytes = scratch.split_to(total_len).freeze();
                match frame::decode_frame(&whole) {
                    Ok(decoded) => {
                        if tx.send(InboundEvent::Frame(decoded)).await.is_err() {
                            return;
                        }
                    },
                    Err(e) => {
                        debug!("dropping malformed frame: {e}");
                    },
                }
            }
        });

        self.socket = Some(ActiveSocket { writer, cancel, inbound: rx });
        Ok(())
    }

    /// Writes one already-framed message to the socket.
    pub async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        let Some(sock) = self.socket.as_mut() else {
            bail!("not connected");
        };
        io_with_timeout(
            "write frame",
            sock.writer.write_all(&frame),
            self.timeout_connection,
        )
        .await
    }

    /// Polls for the next inbound event without blocking; returns `None`
    /// if nothing is ready or there is no active socket.
    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        self.socket.as_mut()?.inbound.try_recv().ok()
    }

    /// Awaits the next inbound event; used as one branch of the actor's
    /// `select!`. Never resolves if there is no active socket.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        match self.socket.as_mut() {
            Some(sock) => sock.inbound.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Closes the socket (if any) and forces a specific state, used by the
    /// cloud-pause scheduler and by `handleError`/`flushConnection`.
    pub fn force_state(&mut self, state: ConnectState) {
        if let Some(sock) = self.socket.take() {
            sock.cancel.cancel();
        }
        self.state = state;
    }

    pub fn short_retries(&self) -> u32 {
        self.short_retries
    }

    pub fn long_retries(&self) -> u32 {
        self.long_retries
    }
}
