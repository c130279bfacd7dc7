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

//! How a function without access to the programming hardware talks to the function that has it.
//!
//! The owner answers two requests: a snapshot of its hardware state, and a container download
//! on the peer's behalf. [`PeerCache`](cache::PeerCache) keeps the last snapshot for a short
//! while so that status reads do not each cost a round trip.
//!
//! Two channels exist: [`LocalPeer`] calls an owner [`Icap`] in the same process, and
//! [`DbusPeer`](dbus_channel::DbusPeer) reaches an owner daemon over DBus.

pub mod cache;
pub mod dbus_channel;
pub mod protocol;

use crate::error::IcapError;
use crate::lifecycle::Icap;
use crate::peer::protocol::{PeerRequest, PeerResponse};
use std::sync::Arc;
use std::time::Duration;

/// Time allowed for a snapshot round trip.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(1);
const TRANSFER_BYTES_PER_SEC: usize = 2 * 1024 * 1024;

/// Time allowed for forwarding a container of `len` bytes: one second plus one second
/// per 2 MiB.
///
/// ```
/// use icapd::peer::transfer_timeout;
/// use std::time::Duration;
///
/// assert_eq!(transfer_timeout(0), Duration::from_secs(1));
/// assert_eq!(transfer_timeout(5 * 1024 * 1024), Duration::from_secs(3));
/// ```
pub fn transfer_timeout(len: usize) -> Duration {
    Duration::from_secs(1 + (len / TRANSFER_BYTES_PER_SEC) as u64)
}

/// A request/response link to the function owning the hardware.
pub trait PeerChannel: Send + Sync {
    /// Send `request` and wait at most `timeout` for the answer.
    ///
    /// # Returns: `Result<PeerResponse, IcapError>`
    /// * `Err(IcapError::Peer)` - the owner could not be reached or did not answer in time
    fn request(&self, request: PeerRequest, timeout: Duration)
    -> Result<PeerResponse, IcapError>;

    /// Whether the owner can read a container from this process's memory, so that it can be
    /// forwarded without a copy.
    fn same_host(&self) -> bool;
}

/// An owner living in the same process.
pub struct LocalPeer {
    owner: Arc<Icap>,
}

impl LocalPeer {
    pub fn new(owner: Arc<Icap>) -> Self {
        LocalPeer { owner }
    }
}

impl PeerChannel for LocalPeer {
    fn request(&self, request: PeerRequest, _: Duration) -> Result<PeerResponse, IcapError> {
        Ok(self.owner.serve_peer(request))
    }

    fn same_host(&self) -> bool {
        true
    }
}
