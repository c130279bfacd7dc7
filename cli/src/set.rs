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

//! Set command implementations.
//!
//! This module changes runtime settings of the daemon through its control interface:
//! - Clock frequencies of the active image
//! - The container signature policy
//! - The lifetime of cached peer snapshots
//!
//! See [Error Handling](../index.html#error-handling) for how failures are reported.

use crate::proxies::{connect, control_proxy};

/// Sends the requested frequencies, in MHz and generator order.
///
/// # Returns: `Result<String, zbus::Error>`
/// * `Ok(String)` - Success message from the daemon
/// * `Err(zbus::Error)` - DBus communication error, or `FrequencyOutOfRange` when a value lies
///   outside the bounds shown by `icapctl freq get`
///
/// # Examples
///
/// ```bash
/// icapctl freq set 250 400
/// ```
pub async fn freq_handler(session: bool, mhz: &[u16]) -> Result<String, zbus::Error> {
    let connection = connect(session).await?;
    let proxy = control_proxy::ControlProxy::new(&connection).await?;
    proxy.set_clock_frequencies(mhz).await
}

pub async fn security_handler(session: bool, level: u32) -> Result<String, zbus::Error> {
    let connection = connect(session).await?;
    let proxy = control_proxy::ControlProxy::new(&connection).await?;
    proxy.set_security_level(level).await
}

/// Only meaningful on a daemon that reaches the device through a peer; the owner keeps no cache.
pub async fn cache_ttl_handler(session: bool, secs: u64) -> Result<String, zbus::Error> {
    let connection = connect(session).await?;
    let proxy = control_proxy::ControlProxy::new(&connection).await?;
    proxy.set_cache_expire_secs(secs).await
}
