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

//! Command Line Interface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ringbms")]
#[command(version)]
#[command(about = "RingBMS - dual-direction cell monitor acquisition")]
#[command(long_about = "RingBMS - dual-direction cell monitor acquisition

Reads a ring of cell monitors alternately from both ends, reconciles the two
views, checks every cell against its limits and drives the fault outputs.
The binary runs against the built-in simulated stack.

EXAMPLES:
    ringbms run --cycles 10                 Ten cycles, rows on stdout
    ringbms run --csv run.csv --seventh-ic  Seven monitors, rows to a file
    ringbms check-config --config pack.json
    ringbms print-default-config > pack.json

ENVIRONMENT VARIABLES:
    RUST_LOG=debug         Log filter when --log-level is not given

FILES:
    ~/.config/ringbms/config.json       Stack configuration
    /var/log/ringbms/events.json        JSON event log")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Log filter, e.g. `debug` or `ringbms=trace`
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the acquisition loop
    Run(RunArgs),

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file (default: ~/.config/ringbms/config.json)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the reference pack configuration as JSON
    PrintDefaultConfig,
}

#[derive(Args)]
pub struct RunArgs {
    /// Configuration file (default: ~/.config/ringbms/config.json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Stop after this many cycles
    #[arg(long)]
    pub cycles: Option<u64>,

    /// Read operator keys from stdin during a debug interrupt
    #[arg(long)]
    pub interactive: bool,

    /// Append rows to this file instead of stdout
    #[arg(long)]
    pub csv: Option<PathBuf>,

    /// Close the ring with a short six-cell monitor
    #[arg(long)]
    pub seventh_ic: bool,
}
