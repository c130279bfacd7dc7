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

//! DBus proxy interfaces for the icapd daemon.
//!
//! The proxies are generated with the `zbus` `#[proxy]` macro and give typed, asynchronous
//! access to the daemon's DBus interfaces.
//!
//! - [`control_proxy`] - Write operations (download, lock, reset, clock and policy changes)
//! - [`status_proxy`] - Read-only operations (image state, clocks, sections)
//!
//! # DBus Service Information
//!
//! - **Service Name**: `com.canonical.icapd`
//! - **Control Interface**: `com.canonical.icapd.control` at `/com/canonical/icapd/control`
//! - **Status Interface**: `com.canonical.icapd.status` at `/com/canonical/icapd/status`

pub mod control_proxy;
pub mod status_proxy;

use zbus::Connection;

/// Connect to the bus the daemon runs on.
pub async fn connect(session: bool) -> zbus::Result<Connection> {
    if session {
        Connection::session().await
    } else {
        Connection::system().await
    }
}
