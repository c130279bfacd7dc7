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

use crate::config::{DEFAULT_CACHE_EXPIRE_SECS, MAX_CACHE_EXPIRE_SECS};
use crate::container::xuid::Xuid;
use crate::error::IcapError;
use crate::peer::protocol::{DataKind, PeerRequest, PeerResponse, PeerSnapshot};
use crate::peer::{PeerChannel, SNAPSHOT_TIMEOUT};
use log::{info, trace};
use std::time::{Duration, Instant};

/// The owner's hardware state as last fetched, trusted for `ttl`.
#[derive(Debug)]
pub struct PeerCache {
    snapshot: PeerSnapshot,
    expires: Option<Instant>,
    ttl: Duration,
}

impl Default for PeerCache {
    fn default() -> Self {
        PeerCache {
            snapshot: PeerSnapshot::default(),
            expires: None,
            ttl: Duration::from_secs(DEFAULT_CACHE_EXPIRE_SECS),
        }
    }
}

impl PeerCache {
    pub fn new(ttl_secs: u64) -> Result<Self, IcapError> {
        let mut cache = PeerCache::default();
        cache.set_ttl(ttl_secs)?;
        Ok(cache)
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs()
    }

    /// # Returns: `Result<(), IcapError>`
    /// * `Err(IcapError::Argument)` - `secs` is above [`MAX_CACHE_EXPIRE_SECS`]
    pub fn set_ttl(&mut self, secs: u64) -> Result<(), IcapError> {
        if secs > MAX_CACHE_EXPIRE_SECS {
            return Err(IcapError::Argument(format!(
                "cache lifetime must be 0..={MAX_CACHE_EXPIRE_SECS} seconds, got {secs}"
            )));
        }
        info!("Peer cache lifetime set to {secs}s");
        self.ttl = Duration::from_secs(secs);
        Ok(())
    }

    fn expired(&self) -> bool {
        self.expires.is_none_or(|at| Instant::now() >= at)
    }

    /// The cached snapshot, fetched from `channel` first if it has expired.
    pub fn snapshot(&mut self, channel: &dyn PeerChannel) -> Result<&PeerSnapshot, IcapError> {
        if self.expired() {
            trace!("Refreshing peer snapshot");
            match channel.request(PeerRequest::ReadSnapshot, SNAPSHOT_TIMEOUT)? {
                PeerResponse::Snapshot(snapshot) => {
                    self.snapshot = snapshot;
                    self.expires = Some(Instant::now() + self.ttl);
                }
                PeerResponse::DownloadStatus(status) => {
                    return Err(IcapError::Peer {
                        status,
                        detail: "peer answered a snapshot request with a download status".into(),
                    });
                }
            }
        }
        Ok(&self.snapshot)
    }

    pub fn value(&mut self, channel: &dyn PeerChannel, kind: DataKind) -> Result<u64, IcapError> {
        Ok(self.snapshot(channel)?.value(kind))
    }

    /// The image active on the owner.
    pub fn peer_uuid(&mut self, channel: &dyn PeerChannel) -> Result<Xuid, IcapError> {
        Ok(self.snapshot(channel)?.uuid)
    }

    /// Drop the snapshot; the next read fetches a new one.
    pub fn invalidate(&mut self) {
        self.snapshot = PeerSnapshot::default();
        self.expires = None;
    }
}
