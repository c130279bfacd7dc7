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

//! Download and reference commands.
//!
//! The daemon reads the container itself, so the path handed over DBus must be absolute and
//! readable by the daemon. Relative paths are resolved against the working directory of the
//! client before the call.

use crate::proxies::{connect, control_proxy};
use std::path::Path;

/// Sends the DBus command to program the container at `file_path`.
async fn call_download_xclbin(session: bool, file_path: &str) -> Result<String, zbus::Error> {
    let connection = connect(session).await?;
    let proxy = control_proxy::ControlProxy::new(&connection).await?;
    proxy.download_xclbin(file_path).await
}

/// Main handler for the download command.
///
/// # Examples
///
/// ```bash
/// icapctl download ./kernels.xclbin
/// ```
pub async fn download_handler(session: bool, file: &Path) -> Result<String, zbus::Error> {
    let path = file.canonicalize().map_err(|e| {
        zbus::Error::Failure(format!("Cannot resolve {}: {e}", file.display()))
    })?;
    call_download_xclbin(session, &path.to_string_lossy()).await
}

/// Main handler for the lock command. Prints the new reference count.
pub async fn lock_handler(session: bool, uuid: &str) -> Result<String, zbus::Error> {
    let connection = connect(session).await?;
    let proxy = control_proxy::ControlProxy::new(&connection).await?;
    let refs = proxy.lock_bitstream(uuid).await?;
    Ok(format!("{uuid} locked, {refs} reference(s) held"))
}

/// Main handler for the unlock command. Without a uuid every reference is dropped.
pub async fn unlock_handler(session: bool, uuid: Option<&str>) -> Result<String, zbus::Error> {
    let connection = connect(session).await?;
    let proxy = control_proxy::ControlProxy::new(&connection).await?;
    let refs = proxy.unlock_bitstream(uuid.unwrap_or_default()).await?;
    Ok(format!("Image unlocked, {refs} reference(s) held"))
}
