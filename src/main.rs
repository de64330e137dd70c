// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use dtu_gateway_rs::{
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    dtu_client::DtuClient,
    time::SystemWallClock,
};
use tokio::time::sleep;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _init_logger = init_logger("config/logger.yaml")?;

    let cfg = resolve_config_path("config/dtu.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    info!(server = %cfg.dtu.server, port = cfg.dtu.port, "starting DTU gateway");

    let (handle, join) = DtuClient::spawn(cfg, Arc::new(SystemWallClock));

    // The core never polls on its own (§4.7): this loop is the "external
    // updater" that requests a fresh sample every tick.
    loop {
        handle.get_data_update().await;
        sleep(Duration::from_secs(5)).await;
        if let Some(update) = handle.take_update().await {
            info!(
                grid_power = update.grid.power,
                pv0_power = update.pv0.power,
                pv1_power = update.pv1.power,
                power_limit = ?update.power_limit,
                "telemetry update"
            );
        }
        if join.is_finished() {
            break;
        }
    }

    Ok(())
}
