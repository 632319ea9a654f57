/*
 * This file is part of RingBMS.
 *
 * Copyright (C) 2025 RingBMS contributors
 *
 * RingBMS is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * RingBMS is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with RingBMS. If not, see <https://www.gnu.org/licenses/>.
 */

mod cli;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::{error, info, warn};

use ringbms::clock::SystemClock;
use ringbms::config::{config_path, load_config, load_saved_config, validate_config, StackConfig};
use ringbms::constants::layout::SHORT_IC_MAX_CELLS;
use ringbms::controller::{BmsController, Peripherals};
use ringbms::driver::PackMonitor;
use ringbms::logger::{self, FileLogSink, LogSink, StdoutSink};
use ringbms::signals::{LineConsole, OperatorConsole};
use ringbms::sim::{ScriptedConsole, SimCharger, SimPack, SimSignals, SimulatedStack};

use cli::{Cli, Commands, RunArgs};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(&log_level)
        .init();

    let result = match cli.command {
        Commands::Run(args) => run(args),
        Commands::CheckConfig { config } => check_config(config.as_deref()),
        Commands::PrintDefaultConfig => {
            let json = serde_json::to_string_pretty(&StackConfig::reference())
                .context("failed to serialize the reference configuration")?;
            println!("{}", json);
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!("{:#}", e);
        logger::log_event("fatal_error", json!({ "error": format!("{:#}", e) }));
    }
    result
}

fn load(path: Option<&Path>) -> anyhow::Result<StackConfig> {
    match path {
        Some(p) => load_config(p).with_context(|| format!("failed to load configuration from {}", p.display())),
        None => load_saved_config()
            .with_context(|| format!("failed to load configuration from {}", config_path().display())),
    }
}

fn check_config(path: Option<&Path>) -> anyhow::Result<()> {
    let cfg = load(path)?;
    println!("Configuration OK: {} cell monitors", cfg.ic_count());
    Ok(())
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    match logger::init_logging() {
        Some(path) => info!("Event log: {}", path.display()),
        None => warn!("Event log unavailable, continuing without it"),
    }

    let mut cfg = load(args.config.as_deref())?;
    if args.seventh_ic {
        cfg = cfg.with_short_ic(SHORT_IC_MAX_CELLS);
        validate_config(&cfg).context("configuration invalid with the seventh monitor")?;
    }
    logger::log_event(
        "config_loaded",
        json!({
            "source": args.config.as_ref().map_or_else(|| config_path().display().to_string(), |p| p.display().to_string()),
            "ics": cfg.ic_count(),
            "circular": cfg.comm.circular,
            "charger": cfg.charger.enabled,
        }),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("SIGNAL: Received SIGINT/SIGTERM - stopping after this cycle");
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    let sink: Box<dyn LogSink> = match &args.csv {
        Some(p) => Box::new(FileLogSink::create(p).with_context(|| format!("cannot open {}", p.display()))?),
        None => Box::new(StdoutSink),
    };
    let console: Box<dyn OperatorConsole> = if args.interactive {
        Box::new(LineConsole::stdin().context("cannot attach the operator console")?)
    } else {
        Box::new(ScriptedConsole::detached())
    };
    let pack: Option<Box<dyn PackMonitor>> = if cfg.pack_monitor {
        Some(Box::new(SimPack::default()))
    } else {
        None
    };

    let hw = Peripherals {
        driver: Box::new(SimulatedStack::new(&cfg)),
        charger: Box::new(SimCharger::charging()),
        lines: Box::new(SimSignals::new()),
        console,
        sink,
        pack,
        clock: Box::new(SystemClock::new()),
    };

    let mut controller = BmsController::new(cfg, hw).context("cannot build the controller")?;
    controller.startup().context("startup failed")?;
    let cycles = controller
        .run(args.cycles, &shutdown)
        .context("acquisition loop failed")?;

    logger::log_event("shutdown", json!({ "cycles": cycles }));
    Ok(())
}
