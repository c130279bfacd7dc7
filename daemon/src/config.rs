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

//! Daemon configuration.
//!
//! The configuration is read once at startup from [`DEFAULT_CONFIG_PATH`], or from the path in
//! the [`CONFIG_PATH_ENV`] environment variable. Every key is optional.
//!
//! ```toml
//! [device]
//! role = "owner"
//! resource = "/sys/bus/pci/devices/0000:65:00.1/resource0"
//! generation = "unified"
//! feature_rom_timestamp = 0
//!
//! [layout]
//! icap = 0x020000
//! clock_wizards = [0x050000, 0x051000, 0x053000]
//!
//! [security]
//! level = "dedicated"
//!
//! [peer]
//! cache_expire_secs = 1
//! ```

use crate::container::sections::MAX_CLOCKS;
use crate::container::signature::SecurityLevel;
use crate::error::IcapError;
use crate::hardware::axi_gate::GateGeneration;
use crate::system_io::fs_read;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The default location of the daemon configuration file.
pub static DEFAULT_CONFIG_PATH: &str = "/etc/icapd/config.toml";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub static CONFIG_PATH_ENV: &str = "ICAPD_CONFIG";

/// The well-known D-Bus name of the daemon.
pub static DBUS_SERVICE_NAME: &str = "com.canonical.icapd";

pub static CONTROL_OBJECT_PATH: &str = "/com/canonical/icapd/control";
pub static STATUS_OBJECT_PATH: &str = "/com/canonical/icapd/status";
/// Served by the owner only; peers call it.
pub static PEER_OBJECT_PATH: &str = "/com/canonical/icapd/peer";

/// Seconds a peer trusts its snapshot of the owner's state.
pub const DEFAULT_CACHE_EXPIRE_SECS: u64 = 1;
/// Largest accepted snapshot lifetime.
pub const MAX_CACHE_EXPIRE_SECS: u64 = 10;

/// Which side of the device this daemon instance manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Privileged: drives the registers.
    #[default]
    Owner,
    /// Unprivileged: delegates to the owner.
    Peer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub role: Role,
    /// Register resource file of the management BAR.
    pub resource: PathBuf,
    /// Drive a simulated device instead of `resource`.
    pub simulate: bool,
    pub generation: GateGeneration,
    /// Feature ROM timestamp of the installed shell; `0` accepts any image.
    pub feature_rom_timestamp: u64,
    pub min_version_major: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            role: Role::Owner,
            resource: PathBuf::from("/sys/bus/pci/devices/0000:00:00.0/resource0"),
            simulate: false,
            generation: GateGeneration::Legacy,
            feature_rom_timestamp: 0,
            min_version_major: 2,
        }
    }
}

/// Byte offsets of the register blocks within the resource. Absent blocks are not driven.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockLayout {
    pub icap: u64,
    pub gate: u64,
    pub calibration: Option<u64>,
    /// Data, kernel and system clock generators, in that order.
    pub clock_wizards: Vec<u64>,
    pub counter: Option<u64>,
    pub counter_hbm: Option<u64>,
}

impl Default for BlockLayout {
    fn default() -> Self {
        BlockLayout {
            icap: 0x02_0000,
            gate: 0x03_0000,
            calibration: Some(0x03_1000),
            clock_wizards: vec![0x05_0000, 0x05_1000, 0x05_3000],
            counter: Some(0x05_2000),
            counter_hbm: Some(0x05_5000),
        }
    }
}

impl BlockLayout {
    /// The generator offsets, one slot per clock.
    pub fn wizard_slots(&self) -> Result<[Option<u64>; MAX_CLOCKS], IcapError> {
        if self.clock_wizards.len() > MAX_CLOCKS {
            return Err(IcapError::Argument(format!(
                "{} clock wizards configured, at most {MAX_CLOCKS} supported",
                self.clock_wizards.len()
            )));
        }
        let mut slots = [None; MAX_CLOCKS];
        for (slot, base) in slots.iter_mut().zip(&self.clock_wizards) {
            *slot = Some(*base);
        }
        Ok(slots)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub level: SecurityLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub cache_expire_secs: u64,
    /// Bus name of the owner daemon, used when running as a peer.
    pub owner_service: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            cache_expire_secs: DEFAULT_CACHE_EXPIRE_SECS,
            owner_service: format!("{DBUS_SERVICE_NAME}.owner"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbusConfig {
    pub bus: BusKind,
    pub service_name: String,
}

impl Default for DbusConfig {
    fn default() -> Self {
        DbusConfig {
            bus: BusKind::System,
            service_name: DBUS_SERVICE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub device: DeviceConfig,
    pub layout: BlockLayout,
    pub security: SecurityConfig,
    pub peer: PeerConfig,
    pub dbus: DbusConfig,
}

impl DaemonConfig {
    /// Parse a configuration file.
    ///
    /// # Arguments
    ///
    /// * `path` - the TOML file to read
    ///
    /// # Returns: `Result<DaemonConfig, IcapError>`
    /// * `Ok(DaemonConfig)` - parsed and validated configuration
    /// * `Err(IcapError::IORead)` - the file could not be read
    /// * `Err(IcapError::TomlDe)` - the file is not valid TOML for this schema
    /// * `Err(IcapError::Argument)` - a value is out of range
    pub fn load(path: &Path) -> Result<DaemonConfig, IcapError> {
        let text = fs_read(path)?;
        let config: DaemonConfig = toml::from_str(&text).map_err(|e| IcapError::TomlDe {
            file: path.to_path_buf(),
            e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but fall back to the defaults when the file is missing or bad.
    pub fn load_or_default(path: &Path) -> DaemonConfig {
        match DaemonConfig::load(path) {
            Ok(config) => {
                info!("Loaded configuration from {path:?}");
                config
            }
            Err(e) => {
                warn!("Using default configuration: {e}");
                DaemonConfig::default()
            }
        }
    }

    /// The configuration file to use: `$ICAPD_CONFIG` if set, else [`DEFAULT_CONFIG_PATH`].
    pub fn path_from_env() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    fn validate(&self) -> Result<(), IcapError> {
        if self.peer.cache_expire_secs > MAX_CACHE_EXPIRE_SECS {
            return Err(IcapError::Argument(format!(
                "peer.cache_expire_secs must be at most {MAX_CACHE_EXPIRE_SECS}, got {}",
                self.peer.cache_expire_secs
            )));
        }
        self.layout.wizard_slots()?;
        Ok(())
    }
}
