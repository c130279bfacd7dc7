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

use crate::comm::dbus::run_blocking;
use crate::container::axlf::SectionKind;
use crate::lifecycle::Icap;
use log::{info, trace};
use std::sync::Arc;
use zbus::object_server::SignalEmitter;
use zbus::{fdo, interface};

pub struct StatusInterface {
    icap: Arc<Icap>,
}

impl StatusInterface {
    pub fn new(icap: Arc<Icap>) -> Self {
        StatusInterface { icap }
    }
}

#[interface(name = "com.canonical.icapd.status")]
impl StatusInterface {
    async fn get_image_state(&self) -> Result<String, fdo::Error> {
        trace!("get_image_state called");
        let state = run_blocking(&self.icap, |icap| icap.state()).await?;
        Ok(state.to_string())
    }

    async fn get_active_uuid(&self) -> Result<String, fdo::Error> {
        trace!("get_active_uuid called");
        let id = run_blocking(&self.icap, |icap| icap.active_image()).await?;
        Ok(id.to_string())
    }

    async fn get_refcount(&self) -> Result<u32, fdo::Error> {
        trace!("get_refcount called");
        run_blocking(&self.icap, |icap| icap.refcount()).await
    }

    /// Measured where possible, configured otherwise, in MHz.
    async fn get_clock_freqs(&self) -> Result<Vec<u16>, fdo::Error> {
        info!("get_clock_freqs called");
        let report = run_blocking(&self.icap, |icap| icap.clock_report()).await?;
        Ok(report.to_vec())
    }

    async fn get_clock_freqs_max(&self) -> Result<Vec<u16>, fdo::Error> {
        trace!("get_clock_freqs_max called");
        let bounds = run_blocking(&self.icap, |icap| icap.frequency_bounds()).await?;
        Ok(bounds.iter().map(|(_, max)| *max).collect())
    }

    async fn get_clock_freqs_min(&self) -> Result<Vec<u16>, fdo::Error> {
        trace!("get_clock_freqs_min called");
        let bounds = run_blocking(&self.icap, |icap| icap.frequency_bounds()).await?;
        Ok(bounds.iter().map(|(min, _)| *min).collect())
    }

    async fn get_idcode(&self) -> Result<u32, fdo::Error> {
        trace!("get_idcode called");
        run_blocking(&self.icap, |icap| icap.idcode()).await
    }

    async fn get_mig_calibrated(&self) -> Result<bool, fdo::Error> {
        trace!("get_mig_calibrated called");
        run_blocking(&self.icap, |icap| icap.mig_calibrated()).await
    }

    async fn get_security_level(&self) -> Result<u32, fdo::Error> {
        trace!("get_security_level called");
        let level = run_blocking(&self.icap, |icap| icap.security_level()).await?;
        Ok(level.as_u32())
    }

    async fn get_cache_expire_secs(&self) -> Result<u64, fdo::Error> {
        trace!("get_cache_expire_secs called");
        run_blocking(&self.icap, |icap| icap.cache_expiry()).await
    }

    /// Raw bytes of a metadata section of the active image, e.g. `IP_LAYOUT`.
    async fn read_section(&self, kind: &str) -> Result<Vec<u8>, fdo::Error> {
        info!("read_section called with kind: {kind}");
        let kind: SectionKind = kind.parse()?;
        run_blocking(&self.icap, move |icap| icap.section(kind)).await
    }

    /// `event` is `activated`, `stopped` or `reconfigured`; `uuid` is empty unless activated.
    #[zbus(signal)]
    pub async fn image_event(
        emitter: &SignalEmitter<'_>,
        event: &str,
        uuid: &str,
    ) -> zbus::Result<()>;
}
