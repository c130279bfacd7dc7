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

use crate::config::BusKind;
use crate::error::IcapError;
use crate::peer::PeerChannel;
use crate::peer::protocol::{PeerRequest, PeerResponse, PeerSnapshot, SnapshotWire};
use log::{info, trace};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::timeout;
use zbus::{Connection, proxy};

#[proxy(
    interface = "com.canonical.icapd.peer",
    default_path = "/com/canonical/icapd/peer"
)]
pub trait PeerService {
    async fn read_snapshot(&self) -> zbus::Result<SnapshotWire>;
    async fn load_xclbin(&self, data: &[u8]) -> zbus::Result<i32>;
}

/// An owner daemon reached over DBus.
///
/// [`PeerChannel::request`] blocks the calling thread on the runtime for the round trip, so it
/// must be called from a blocking thread such as one started by
/// [`tokio::task::spawn_blocking`], never from an async task.
pub struct DbusPeer {
    proxy: PeerServiceProxy<'static>,
    runtime: Handle,
}

impl DbusPeer {
    /// Connect to the owner daemon registered as `service` on `bus`.
    pub async fn connect(bus: BusKind, service: &str) -> Result<DbusPeer, IcapError> {
        let connection = match bus {
            BusKind::System => Connection::system().await,
            BusKind::Session => Connection::session().await,
        }
        .map_err(|e| {
            IcapError::peer_unreachable(format!("cannot connect to the {bus:?} bus: {e}"))
        })?;
        let proxy = PeerServiceProxy::builder(&connection)
            .destination(service.to_string())
            .map_err(|e| IcapError::peer_unreachable(format!("bad peer address {service}: {e}")))?
            .build()
            .await
            .map_err(|e| IcapError::peer_unreachable(format!("cannot reach {service}: {e}")))?;
        info!("Delegating to the owner at {service}");
        Ok(DbusPeer {
            proxy,
            runtime: Handle::current(),
        })
    }
}

impl PeerChannel for DbusPeer {
    fn request(
        &self,
        request: PeerRequest,
        limit: Duration,
    ) -> Result<PeerResponse, IcapError> {
        match request {
            PeerRequest::ReadSnapshot => {
                trace!("Requesting snapshot over DBus");
                let wire = self.round_trip(limit, self.proxy.read_snapshot())?;
                Ok(PeerResponse::Snapshot(PeerSnapshot::from_wire(wire)?))
            }
            PeerRequest::LoadContainer(data) => self.load(&data, limit),
            PeerRequest::LoadContainerShared(data) => self.load(&data, limit),
        }
    }

    fn same_host(&self) -> bool {
        false
    }
}

impl DbusPeer {
    fn round_trip<T>(
        &self,
        limit: Duration,
        call: impl Future<Output = zbus::Result<T>>,
    ) -> Result<T, IcapError> {
        self.runtime
            .block_on(timeout(limit, call))
            .map_err(|_| IcapError::peer_timeout(format!("no answer within {limit:?}")))?
            .map_err(|e| IcapError::peer_unreachable(e.to_string()))
    }

    fn load(&self, data: &[u8], limit: Duration) -> Result<PeerResponse, IcapError> {
        trace!("Forwarding {} byte container over DBus", data.len());
        let status = self.round_trip(limit, self.proxy.load_xclbin(data))?;
        Ok(PeerResponse::DownloadStatus(status))
    }
}
