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

use crate::proxies::{connect, control_proxy};

/// Main handler for the reset command.
///
/// Without `gate` the whole device is reloaded from flash, which drops the active image. With
/// `gate` only the AXI isolation gate is cycled. Both are refused while an image is locked.
pub async fn reset_handler(session: bool, gate: bool) -> Result<String, zbus::Error> {
    let connection = connect(session).await?;
    let proxy = control_proxy::ControlProxy::new(&connection).await?;
    if gate {
        proxy.reset_axi_gate().await
    } else {
        proxy.reset_bitstream().await
    }
}
