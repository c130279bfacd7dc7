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
    interface = "com.canonical.icapd.control",
    default_path = "/com/canonical/icapd/control"
)]
pub trait Control {
    async fn download_xclbin(&self, xclbin_path_str: &str) -> Result<String>;
    async fn lock_bitstream(&self, uuid: &str) -> Result<u32>;
    async fn unlock_bitstream(&self, uuid: &str) -> Result<u32>;
    async fn reset_bitstream(&self) -> Result<String>;
    async fn reset_axi_gate(&self) -> Result<String>;
    async fn set_clock_frequencies(&self, freqs: &[u16]) -> Result<String>;
    async fn set_security_level(&self, level: u32) -> Result<String>;
    async fn set_cache_expire_secs(&self, secs: u64) -> Result<String>;
}
