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

//! icapd - System service managing the bitstream and clock lifecycle of PCIe FPGA accelerators.
//!
//! The daemon manages one device in one of two roles, chosen in its configuration:
//! - **owner**: drives the configuration port, AXI gate and clock generators through the
//!   register resource of the management function (or a simulated device), and answers
//!   requests from peers on the `peer` interface
//! - **peer**: has no register access and delegates to the owner daemon over DBus
//!
//! # DBus Service
//!
//! - **Service Name**: `com.canonical.icapd` (configurable)
//! - **Control Interface**: `/com/canonical/icapd/control` - Downloads, locks and clock changes
//! - **Status Interface**: `/com/canonical/icapd/status` - Read-only queries and `ImageEvent`
//! - **Peer Interface**: `/com/canonical/icapd/peer` - Owner only, called by peers
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (`trace`, `debug`, `info`, `warn`, `error`
//!   or `off`). Defaults to `info`
//! - `ICAPD_CONFIG` - Configuration file. Defaults to `/etc/icapd/config.toml`

use icapd::comm::dbus::serve;
use icapd::config::{DaemonConfig, Role};
use icapd::container::axlf::DeviceInfo;
use icapd::container::signature::KeyringService;
use icapd::error::IcapError;
use icapd::hardware::io::{RegisterIo, ResourceFile, Sleeper, ThreadSleeper};
use icapd::hardware::simulated::{NoopSleeper, SimulatedDevice};
use icapd::lifecycle::IcapBuilder;
use icapd::lifecycle::backend::Backend;
use icapd::lifecycle::hardware_owner::HardwareOwner;
use icapd::lifecycle::notify::{ChannelNotifier, ExecNotifier};
use icapd::lifecycle::peer_delegate::PeerDelegate;
use icapd::peer::cache::PeerCache;
use icapd::peer::dbus_channel::DbusPeer;
use log::{info, warn};
use std::error::Error;
use std::future::pending;
use std::sync::Arc;

/// Attach to the register blocks of the device, or to a simulated one.
fn owner(config: &DaemonConfig, keyrings: &KeyringService) -> Result<HardwareOwner, IcapError> {
    let (io, sleeper): (Arc<dyn RegisterIo>, Arc<dyn Sleeper>) = if config.device.simulate {
        warn!("Simulating the device, no hardware will be programmed");
        (
            Arc::new(SimulatedDevice::new(config.layout.clone())),
            Arc::new(NoopSleeper),
        )
    } else {
        (
            Arc::new(ResourceFile::open(&config.device.resource)?),
            Arc::new(ThreadSleeper),
        )
    };
    let owner = HardwareOwner::new(io, &config.layout, config.device.generation, sleeper)?
        .with_security_level(config.security.level)
        .with_keyring(keyrings.acquire()?);
    Ok(owner)
}

async fn peer(
    config: &DaemonConfig,
    notifier: Arc<dyn ExecNotifier>,
) -> Result<PeerDelegate, IcapError> {
    let channel = DbusPeer::connect(config.dbus.bus, &config.peer.owner_service).await?;
    let cache = PeerCache::new(config.peer.cache_expire_secs)?;
    Ok(PeerDelegate::new(Arc::new(channel), cache, notifier))
}

/// Main entry point for the icapd daemon.
///
/// 1. Sets up logging via `env_logger` (defaults to "info" level)
/// 2. Loads the configuration, falling back to defaults
/// 3. Builds the device backend for the configured role
/// 4. Connects to DBus and advertises the service
/// 5. Runs until terminated
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = DaemonConfig::load_or_default(&DaemonConfig::path_from_env());

    let keyrings = KeyringService::default();
    let (notifier, events) = ChannelNotifier::channel();
    let notifier: Arc<dyn ExecNotifier> = Arc::new(notifier);

    let backend: Box<dyn Backend> = match config.device.role {
        Role::Owner => Box::new(owner(&config, &keyrings)?),
        Role::Peer => Box::new(peer(&config, notifier.clone()).await?),
    };
    let icap = IcapBuilder::boxed(backend)
        .device_info(DeviceInfo {
            feature_rom_timestamp: config.device.feature_rom_timestamp,
            min_version_major: config.device.min_version_major,
        })
        .notifier(notifier)
        .build();
    info!("Device ready as {:?}", config.device.role);

    let _conn = serve(&config, Arc::new(icap), events).await?;
    pending::<()>().await;

    Ok(())
}
