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

//! Status command implementations.
//!
//! Read-only queries against the daemon's status interface. The formatting helpers are kept
//! separate from the DBus calls so the output layout can be checked without a running daemon.

use crate::proxies::{connect, status_proxy};
use std::fmt::Write;
use std::path::Path;

const CLOCK_NAMES: [&str; 4] = ["data", "kernel", "system", "system1"];

/// Render a clock table, one row per clock with a non-zero upper bound.
pub(crate) fn format_clocks(current: &[u16], min: &[u16], max: &[u16]) -> String {
    let mut out = String::from("clock    | MHz  | min  | max\n");
    for (i, name) in CLOCK_NAMES.iter().enumerate() {
        let hi = max.get(i).copied().unwrap_or(0);
        if hi == 0 {
            continue;
        }
        let cur = current.get(i).copied().unwrap_or(0);
        let lo = min.get(i).copied().unwrap_or(0);
        let _ = writeln!(out, "{name:<8} | {cur:<4} | {lo:<4} | {hi}");
    }
    out.trim_end().to_string()
}

/// Render section bytes as a hex dump, sixteen bytes per line with the offset first.
pub(crate) fn format_section(kind: &str, bytes: &[u8]) -> String {
    let mut out = format!("{kind}: {} bytes", bytes.len());
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "\n{:08x}  {}", row * 16, hex::encode(chunk));
    }
    out
}

async fn get_clocks(session: bool) -> Result<String, zbus::Error> {
    let connection = connect(session).await?;
    let proxy = status_proxy::StatusProxy::new(&connection).await?;
    let current = proxy.get_clock_freqs().await?;
    let min = proxy.get_clock_freqs_min().await?;
    let max = proxy.get_clock_freqs_max().await?;
    Ok(format_clocks(&current, &min, &max))
}

/// Main handler for the status command.
///
/// # Examples
///
/// ```bash
/// icapctl status
/// icapctl --session status
/// ```
pub async fn status_handler(session: bool) -> Result<String, zbus::Error> {
    let connection = connect(session).await?;
    let proxy = status_proxy::StatusProxy::new(&connection).await?;
    let state = proxy.get_image_state().await?;
    let uuid = proxy.get_active_uuid().await?;
    let refs = proxy.get_refcount().await?;
    let idcode = proxy.get_idcode().await?;
    let mig = proxy.get_mig_calibrated().await?;
    let security = proxy.get_security_level().await?;
    let ttl = proxy.get_cache_expire_secs().await?;
    let mut out = format!(
        "state          | {state}\n\
         active uuid    | {uuid}\n\
         references     | {refs}\n\
         idcode         | {idcode:#010x}\n\
         mig calibrated | {mig}\n\
         security level | {security}\n\
         peer cache ttl | {ttl}s\n"
    );
    out.push_str(&get_clocks(session).await?);
    Ok(out)
}

/// Main handler for `freq get`.
pub async fn freq_handler(session: bool) -> Result<String, zbus::Error> {
    get_clocks(session).await
}

/// Main handler for the section command. With `out` the raw bytes are written to that file.
pub async fn section_handler(
    session: bool,
    kind: &str,
    out: Option<&Path>,
) -> Result<String, zbus::Error> {
    let connection = connect(session).await?;
    let proxy = status_proxy::StatusProxy::new(&connection).await?;
    let bytes = proxy.read_section(kind).await?;
    match out {
        Some(path) => {
            std::fs::write(path, &bytes).map_err(|e| {
                zbus::Error::Failure(format!("Cannot write {}: {e}", path.display()))
            })?;
            Ok(format!("{kind}: {} bytes written to {}", bytes.len(), path.display()))
        }
        None => Ok(format_section(kind, &bytes)),
    }
}
