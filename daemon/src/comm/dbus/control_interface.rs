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

use crate::comm::dbus::{parse_frequencies, parse_uuid, run_blocking};
use crate::container::signature::SecurityLevel;
use crate::error::IcapError;
use crate::lifecycle::Icap;
use crate::system_io::fs_read_bytes;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::{fdo, interface};

pub struct ControlInterface {
    icap: Arc<Icap>,
}

impl ControlInterface {
    pub fn new(icap: Arc<Icap>) -> Self {
        ControlInterface { icap }
    }
}

#[interface(name = "com.canonical.icapd.control")]
impl ControlInterface {
    async fn download_xclbin(&self, xclbin_path_str: &str) -> Result<String, fdo::Error> {
        info!("download_xclbin called with path: {xclbin_path_str}");
        let path = PathBuf::from(xclbin_path_str);
        if !path.exists() || path.is_dir() {
            return Err(IcapError::Argument(format!(
                "{xclbin_path_str} is not a valid path to an xclbin file."
            ))
            .into());
        }
        let id = run_blocking(&self.icap, move |icap| {
            let bytes = fs_read_bytes(&path)?;
            icap.download(&bytes)
        })
        .await?;
        Ok(format!("{xclbin_path_str} downloaded, active image {id}"))
    }

    async fn lock_bitstream(&self, uuid: &str) -> Result<u32, fdo::Error> {
        info!("lock_bitstream called with uuid: {uuid}");
        let id = parse_uuid(uuid)?.ok_or_else(|| {
            IcapError::Argument("A uuid is required to lock an image.".into())
        })?;
        run_blocking(&self.icap, move |icap| icap.lock(&id)).await
    }

    /// An empty `uuid` drops every reference.
    async fn unlock_bitstream(&self, uuid: &str) -> Result<u32, fdo::Error> {
        info!("unlock_bitstream called with uuid: '{uuid}'");
        let id = parse_uuid(uuid)?;
        run_blocking(&self.icap, move |icap| icap.unlock(id.as_ref())).await
    }

    async fn reset_bitstream(&self) -> Result<String, fdo::Error> {
        info!("reset_bitstream called");
        run_blocking(&self.icap, |icap| icap.reset_bitstream()).await?;
        Ok("Device reloaded from flash".to_string())
    }

    async fn reset_axi_gate(&self) -> Result<String, fdo::Error> {
        info!("reset_axi_gate called");
        run_blocking(&self.icap, |icap| icap.reset_axi_gate()).await?;
        Ok("AXI gate reset".to_string())
    }

    /// Override the clocks of the active image, in MHz and generator order; `0` leaves a clock
    /// unchanged.
    async fn set_clock_frequencies(&self, freqs: Vec<u16>) -> Result<String, fdo::Error> {
        info!("set_clock_frequencies called with {freqs:?}");
        let targets = parse_frequencies(&freqs)?;
        run_blocking(&self.icap, move |icap| icap.update_frequencies(&targets)).await?;
        Ok(format!("Clock frequencies set to {targets:?} MHz"))
    }

    async fn set_security_level(&self, level: u32) -> Result<String, fdo::Error> {
        info!("set_security_level called with level: {level}");
        let level = SecurityLevel::try_from(level)?;
        run_blocking(&self.icap, move |icap| icap.set_security_level(level)).await?;
        Ok(format!("Security level set to {level:?}"))
    }

    async fn set_cache_expire_secs(&self, secs: u64) -> Result<String, fdo::Error> {
        info!("set_cache_expire_secs called with secs: {secs}");
        run_blocking(&self.icap, move |icap| icap.set_cache_expiry(secs)).await?;
        Ok(format!("Peer cache lifetime set to {secs}s"))
    }
}
