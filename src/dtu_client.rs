// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The top-level DTU actor: a single task that owns the connection
//! manager, transaction sequencer, data store, and cloud-coexistence
//! scheduler, and drives them from one `tokio::select!` loop (§5).

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{Interval, MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    cloud_pause::CloudPauseScheduler,
    conn::{ConnectState, ConnectionManager, InboundEvent},
    protocol::{
        frame::{self, DecodedFrame},
        message::{CommandRequest, CommandResponse, GetConfigRequest, GetConfigResponse, RealDataNewRequest, RealDataNewResponse, AppGetHistPowerRequest, DTU_TIME_OFFSET},
    },
    store::{ApplyOutcome, ErrorState, Snapshot, Store},
    time::WallClock,
    txn::{Chain, Sequencer, TxState},
};

/// Online/offline aggregate flag with a 90-second de-bounce on the falling
/// edge only, per §3.
#[derive(Debug)]
struct OnlineDebounce {
    online: bool,
    disconnected_since: Option<u64>,
}

const ONLINE_DEBOUNCE_SECS: u64 = 90;

impl Default for OnlineDebounce {
    fn default() -> Self {
        Self { online: false, disconnected_since: None }
    }
}

impl OnlineDebounce {
    fn update(&mut self, raw_connected: bool, now: u64) {
        if raw_connected {
            self.online = true;
            self.disconnected_since = None;
            return;
        }
        match self.disconnected_since {
            None => self.disconnected_since = Some(now),
            Some(start) if now.saturating_sub(start) >= ONLINE_DEBOUNCE_SECS => {
                self.online = false;
            },
            Some(_) => {},
        }
    }
}

/// Operator-facing entry points (§6), delivered to the actor over a
/// channel so every mutation happens on the single actor task.
#[derive(Debug)]
pub enum Command {
    SetServer(String, u16),
    SetPowerLimit(u32),
    RequestRestartDevice,
    GetDataUpdate,
    RequestAppGetHistPower,
    FlushConnection,
}

/// Cheap, cloneable handle to a running [`DtuClient`]. All methods only
/// enqueue a command or read the published snapshot; none block on a
/// round trip to the peer, matching the source device's fire-and-forget
/// control surface.
#[derive(Clone)]
pub struct DtuHandle {
    cmd_tx: mpsc::Sender<Command>,
    snapshot: Arc<Mutex<Snapshot>>,
}

impl DtuHandle {
    async fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).await.is_err() {
            warn!("DTU actor is no longer running");
        }
    }

    pub async fn set_server(&self, server: impl Into<String>, port: u16) {
        self.send(Command::SetServer(server.into(), port)).await;
    }

    pub async fn set_power_limit(&self, percent: u32) {
        self.send(Command::SetPowerLimit(percent)).await;
    }

    pub async fn request_restart_device(&self) {
        self.send(Command::RequestRestartDevice).await;
    }

    pub async fn get_data_update(&self) {
        self.send(Command::GetDataUpdate).await;
    }

    pub async fn request_app_get_hist_power(&self) {
        self.send(Command::RequestAppGetHistPower).await;
    }

    pub async fn flush_connection(&self) {
        self.send(Command::FlushConnection).await;
    }

    /// Read-only clone of the current telemetry snapshot.
    pub async fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().await.clone()
    }

    /// Clones and clears the one-shot update flag in a single step, so a
    /// downstream publisher never misses or double-reads an update.
    pub async fn take_update(&self) -> Option<Snapshot> {
        let mut guard = self.snapshot.lock().await;
        if !guard.update_received {
            return None;
        }
        guard.update_received = false;
        Some(guard.clone())
    }
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(iv) => {
            iv.tick().await;
        },
        None => std::future::pending().await,
    }
}

/// The actor itself.
pub struct DtuClient<C: WallClock> {
    clock: Arc<C>,
    server: String,
    port: u16,
    tick_period: Duration,
    keepalive_period: Duration,

    conn: ConnectionManager,
    seq: Sequencer,
    store: Store,
    cloud: CloudPauseScheduler,
    online: OnlineDebounce,

    snapshot_pub: Arc<Mutex<Snapshot>>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl<C: WallClock> DtuClient<C> {
    /// Starts the actor task and returns a handle to it plus its join
    /// handle.
    pub fn spawn(cfg: Config, clock: Arc<C>) -> (DtuHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let snapshot_pub = Arc::new(Mutex::new(Snapshot::default()));

        let client = DtuClient {
            clock,
            server: cfg.dtu.server.clone(),
            port: cfg.dtu.port,
            tick_period: cfg.runtime.tick_period,
            keepalive_period: cfg.runtime.keepalive_period,
            conn: ConnectionManager::new(&cfg.runtime),
            seq: Sequencer::new(),
            store: Store::new(),
            cloud: CloudPauseScheduler::new(
                cfg.dtu.prevent_cloud_errors,
                cfg.dtu.cloud_upload_seconds.as_secs(),
            ),
            online: OnlineDebounce::default(),
            snapshot_pub: Arc::clone(&snapshot_pub),
            cmd_rx,
        };

        let handle = DtuHandle { cmd_tx, snapshot: snapshot_pub };
        let join = tokio::spawn(client.run());
        (handle, join)
    }

    async fn run(mut self) {
        let mut tick = interval(self.tick_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keepalive: Option<Interval> = None;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.on_tick().await;
                    self.arm_or_disarm_keepalive(&mut keepalive);
                    if self.conn.state() == ConnectState::Stopped {
                        return;
                    }
                },
                _ = tick_optional(&mut keepalive) => {
                    self.send_keepalive().await;
                },
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.on_command(cmd).await,
                        None => return,
                    }
                },
                event = self.conn.recv() => {
                    if let Some(event) = event {
                        self.on_inbound(event).await;
                    }
                },
            }
            self.publish().await;
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_unix()
    }

    async fn publish(&self) {
        let mut guard = self.snapshot_pub.lock().await;
        *guard = self.store.snapshot.clone();
    }

    fn arm_or_disarm_keepalive(&self, keepalive: &mut Option<Interval>) {
        let should_run = self.conn.is_connected();
        match (should_run, keepalive.is_some()) {
            (true, false) => {
                let mut iv = interval(self.keepalive_period);
                iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *keepalive = Some(iv);
            },
            (false, true) => *keepalive = None,
            _ => {},
        }
    }

    async fn send_keepalive(&mut self) {
        if !self.conn.is_connected() {
            return;
        }
        // A one-byte NUL poke, not a protocol request; it does not touch
        // the transaction sequencer.
        if let Err(e) = self.conn.write_frame(Bytes::from_static(&[0u8])).await {
            warn!("keep-alive write failed: {e}");
        }
    }

    async fn on_tick(&mut self) {
        let now = self.now();

        if self.seq.watchdog(now) {
            debug!("txn watchdog reset in-flight request");
        }

        self.online.update(
            matches!(self.conn.state(), ConnectState::Connected | ConnectState::CloudPause),
            now,
        );
        self.store.snapshot.online = self.online.online;

        if self.conn.is_connected() && self.cloud.enter_if_due(now) {
            info!("entering cloud-coexistence pause window");
            self.conn.force_state(ConnectState::CloudPause);
            self.store.snapshot.update_received = true;
        }
        if self.conn.state() == ConnectState::CloudPause && self.cloud.exit_if_due(now) {
            info!("leaving cloud-coexistence pause window");
            self.conn.force_state(ConnectState::Offline);
        }

        if self.store.check_liveness() {
            self.conn.force_state(ConnectState::Offline);
        }

        self.conn.tick_error_recovery();
        let link_up = self.clock.link_up();
        self.conn.tick_connect(&self.server, self.port, link_up, now).await;
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetServer(server, port) => {
                self.server = server;
                self.port = port;
                self.conn.force_state(ConnectState::Offline);
            },
            Command::SetPowerLimit(percent) => {
                self.store.snapshot.power_limit_set = Some(percent);
                if self.conn.is_connected() {
                    self.issue_command(CommandRequest::limit_power(self.now() as u32, percent as i32))
                        .await;
                }
            },
            Command::RequestRestartDevice => {
                if self.conn.is_connected() {
                    self.issue_restart_device().await;
                }
            },
            Command::GetDataUpdate => {
                if self.conn.is_connected() {
                    self.issue_real_data_new().await;
                } else {
                    self.store.snapshot.uptodate = false;
                }
            },
            Command::RequestAppGetHistPower => {
                if self.conn.is_connected() {
                    self.issue_app_get_hist_power().await;
                }
            },
            Command::FlushConnection => {
                self.conn.force_state(ConnectState::Stopped);
                self.store = Store::new();
                self.seq = Sequencer::new();
            },
        }
    }

    async fn issue_real_data_new(&mut self) {
        if !self.seq.is_idle() {
            return;
        }
        let now = self.now();
        let req = RealDataNewRequest { offset: DTU_TIME_OFFSET, time: now as u32 };
        self.write_request(frame::opcode::REAL_DATA_NEW, false, &req.encode(), TxState::WaitRealDataNew)
            .await;
    }

    async fn issue_get_config(&mut self) {
        let now = self.now();
        let req = GetConfigRequest { offset: DTU_TIME_OFFSET, time: now as u32 };
        self.write_request(frame::opcode::GET_CONFIG, false, &req.encode(), TxState::WaitGetConfig)
            .await;
    }

    async fn issue_command(&mut self, req: CommandRequest) {
        if !self.seq.is_idle() {
            return;
        }
        self.write_request(frame::opcode::COMMAND, false, &req.encode(), TxState::WaitCommand)
            .await;
    }

    async fn issue_restart_device(&mut self) {
        if !self.seq.is_idle() {
            return;
        }
        let now = self.now();
        let req = CommandRequest::restart_device(now as u32);
        self.write_request(frame::opcode::COMMAND, true, &req.encode(), TxState::WaitRestartDevice)
            .await;
    }

    async fn issue_app_get_hist_power(&mut self) {
        if !self.seq.is_idle() {
            return;
        }
        let now = self.now();
        let req = AppGetHistPowerRequest { offset: DTU_TIME_OFFSET, time: now as u32 };
        self.write_request(
            frame::opcode::APP_GET_HIST_POWER,
            false,
            &req.encode(),
            TxState::WaitAppGetHistPower,
        )
        .await;
    }

    async fn write_request(&mut self, opcode: u8, restart: bool, body: &[u8], kind: TxState) {
        let frame = match frame::encode_frame(opcode, restart, body) {
            Ok(f) => f,
            Err(e) => {
                warn!("failed to encode outbound request: {e}");
                return;
            },
        };
        self.seq.begin(kind, self.now());
        if let Err(e) = self.conn.write_frame(frame).await {
            warn!("failed to write request: {e}");
            self.seq = Sequencer::new();
        }
    }

    /// §4.5: only acts while connected; commands a restart and counts it.
    async fn handle_error(&mut self, kind: ErrorState) {
        if !self.conn.is_connected() {
            return;
        }
        self.store.snapshot.error_state = kind;
        self.conn.set_state(ConnectState::DtuReboot);
        self.store.snapshot.dtu_reset_requested += 1;
        self.seq = Sequencer::new();
        self.issue_restart_device().await;
    }

    async fn on_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Frame(decoded) => self.on_frame(decoded).await,
            InboundEvent::Closed => {
                info!("DTU closed the connection");
                self.conn.force_state(ConnectState::Offline);
            },
            InboundEvent::Error(reason) => {
                warn!("connection error: {reason}");
                self.conn.force_state(ConnectState::ConnectError);
            },
        }
    }

    async fn on_frame(&mut self, decoded: DecodedFrame) {
        match decoded.opcode {
            frame::opcode::REAL_DATA_NEW => {
                let resp = match RealDataNewResponse::decode(&decoded.body) {
                    Ok(r) => r,
                    Err(e) => return warn!("malformed real-data response: {e}"),
                };
                let outcome = self.store.apply_real_data(&resp);
                let chain = self.seq.complete(TxState::WaitRealDataNew);
                match outcome {
                    ApplyOutcome::NoTime => self.handle_error(ErrorState::NoTime).await,
                    ApplyOutcome::DataHanging => self.handle_error(ErrorState::DataNoChange).await,
                    ApplyOutcome::Applied if chain == Chain::IssueGetConfig => {
                        self.issue_get_config().await;
                    },
                    ApplyOutcome::Applied => {},
                }
            },
            frame::opcode::GET_CONFIG => {
                let resp = match GetConfigResponse::decode(&decoded.body) {
                    Ok(r) => r,
                    Err(e) => return warn!("malformed get-config response: {e}"),
                };
                self.store.apply_get_config(&resp);
                self.seq.complete(TxState::WaitGetConfig);
            },
            frame::opcode::COMMAND => {
                let resp = match CommandResponse::decode(&decoded.body) {
                    Ok(r) => r,
                    Err(e) => return warn!("malformed command response: {e}"),
                };
                let was_restart = self.seq.state() == TxState::WaitRestartDevice;
                let responding_to = match self.seq.state() {
                    TxState::WaitCommand | TxState::WaitRestartDevice => self.seq.state(),
                    _ => TxState::WaitCommand,
                };
                let chain = self.seq.complete(responding_to);
                debug!(err_code = resp.err_code, "command acknowledged");
                if was_restart {
                    self.conn.force_state(ConnectState::Offline);
                } else if chain == Chain::IssueGetConfig {
                    self.issue_get_config().await;
                }
            },
            frame::opcode::APP_GET_HIST_POWER => {
                self.seq.complete(TxState::WaitAppGetHistPower);
            },
            other => {
                warn!("unexpected opcode on the wire: 0x{other:02x}");
            },
        }
    }
}
