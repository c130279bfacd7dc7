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
use crate::error::IcapError;
use crate::lifecycle::Icap;
use crate::peer::protocol::{PeerRequest, PeerResponse, SnapshotWire};
use log::info;
use std::sync::Arc;
use zbus::{fdo, interface};

/// The owner side of the peer protocol.
pub struct PeerInterface {
    icap: Arc<Icap>,
}

impl PeerInterface {
    pub fn new(icap: Arc<Icap>) -> Self {
        PeerInterface { icap }
    }

    async fn serve(&self, request: PeerRequest) -> Result<PeerResponse, fdo::Error> {
        run_blocking(&self.icap, move |icap| Ok(icap.serve_peer(request))).await
    }
}

fn unexpected(response: PeerResponse) -> fdo::Error {
    IcapError::Internal(format!("unexpected peer response {response:?}")).into()
}

#[interface(name = "com.canonical.icapd.peer")]
impl PeerInterface {
    async fn read_snapshot(&self) -> Result<SnapshotWire, fdo::Error> {
        match self.serve(PeerRequest::ReadSnapshot).await? {
            PeerResponse::Snapshot(snapshot) => Ok(snapshot.to_wire()),
            other => Err(unexpected(other)),
        }
    }

    /// `0` on success, a negative errno otherwise.
    async fn load_xclbin(&self, data: Vec<u8>) -> Result<i32, fdo::Error> {
        info!("load_xclbin called with {} bytes", data.len());
        match self.serve(PeerRequest::LoadContainer(data)).await? {
            PeerResponse::DownloadStatus(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }
}
