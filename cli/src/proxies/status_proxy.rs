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

use zbus::{Result, proxy};

#[proxy(
    default_service = "com.canonical.icapd",
    interface = "com.canonical.icapd.status",
    default_path = "/com/canonical/icapd/status"
)]
pub trait Status {
    async fn get_image_state(&self) -> Result<String>;
    async fn get_active_uuid(&self) -> Result<String>;
    async fn get_refcount(&self) -> Result<u32>;
    async fn get_clock_freqs(&self) -> Result<Vec<u16>>;
    async fn get_clock_freqs_max(&self) -> Result<Vec<u16>>;
    async fn get_clock_freqs_min(&self) -> Result<Vec<u16>>;
    async fn get_idcode(&self) -> Result<u32>;
    async fn get_mig_calibrated(&self) -> Result<bool>;
    async fn get_security_level(&self) -> Result<u32>;
    async fn get_cache_expire_secs(&self) -> Result<u64>;
    async fn read_section(&self, kind: &str) -> Result<Vec<u8>>;
}
