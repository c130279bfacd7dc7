// This file is part of icapd, an application to manage bitstream and clock lifecycle of PCIe FPGA accelerators.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// icapd is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// icapd is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! `icapctl`, the command-line client of the icapd daemon.
//!
//! Every subcommand is a thin wrapper around one or more DBus calls made through the
//! [`proxies`]. The daemon does all of the work; the client only formats arguments and results.
//!
//! # Common Concepts
//!
//! ## Images
//!
//! An image is identified by the 16 byte uuid of its container, printed in the usual dashed
//! form. `icapctl status` shows the uuid of the active image.
//!
//! ## Error Handling
//!
//! Errors raised by the daemon arrive as `zbus::Error` values whose message starts with the
//! `IcapError` variant, e.g. `IcapError::FrequencyOutOfRange: ...`.

mod load;
mod proxies;
mod reset;
mod set;
mod status;

use clap::{Parser, Subcommand, arg, command};
use log::debug;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "icapctl")]
#[command(bin_name = "icapctl")]
struct Cli {
    #[arg(
        long = "session",
        help = "talk to a daemon on the session bus instead of the system bus"
    )]
    session: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the image state, active uuid, reference count and clocks
    Status,
    /// Program a container file onto the device
    Download { file: PathBuf },
    /// Take a reference on the active image
    Lock { uuid: String },
    /// Drop a reference on the active image, or every reference when no uuid is given
    Unlock { uuid: Option<String> },
    /// Reload the device from flash, or only reset the AXI gate with --gate
    Reset {
        #[arg(long = "gate")]
        gate: bool,
    },
    /// Read or override the clock frequencies of the active image
    Freq {
        #[command(subcommand)]
        command: FreqSubcommand,
    },
    /// Set the container signature policy (0: none, 1: dedicated keyring, 2: system keyring)
    Security {
        #[arg(value_parser = clap::value_parser!(u32).range(0..=2))]
        level: u32,
    },
    /// Set how long peer snapshots stay valid, in seconds
    CacheTtl { secs: u64 },
    /// Dump a metadata section of the active image, e.g. IP_LAYOUT
    Section {
        kind: String,
        #[arg(long = "out", help = "write the raw section to this file instead of printing")]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum FreqSubcommand {
    /// Show measured and configured frequencies with their bounds
    Get,
    /// Request new frequencies in MHz, in generator order; 0 leaves a clock unchanged
    Set {
        #[arg(required = true)]
        mhz: Vec<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    debug!("parsed cli command with {cli:?}");
    let session = cli.session;
    let result = match cli.command {
        Commands::Status => status::status_handler(session).await,
        Commands::Download { file } => load::download_handler(session, &file).await,
        Commands::Lock { uuid } => load::lock_handler(session, &uuid).await,
        Commands::Unlock { uuid } => load::unlock_handler(session, uuid.as_deref()).await,
        Commands::Reset { gate } => reset::reset_handler(session, gate).await,
        Commands::Freq { command } => match command {
            FreqSubcommand::Get => status::freq_handler(session).await,
            FreqSubcommand::Set { mhz } => set::freq_handler(session, &mhz).await,
        },
        Commands::Security { level } => set::security_handler(session, level).await,
        Commands::CacheTtl { secs } => set::cache_ttl_handler(session, secs).await,
        Commands::Section { kind, out } => {
            status::section_handler(session, &kind, out.as_deref()).await
        }
    };
    match result {
        Ok(msg) => {
            println!("{msg}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
