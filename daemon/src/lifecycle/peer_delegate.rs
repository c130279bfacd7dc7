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

use crate::container::axlf::Axlf;
use crate::container::sections::MAX_CLOCKS;
use crate::container::signature::SecurityLevel;
use crate::error::IcapError;
use crate::lifecycle::backend::Backend;
use crate::lifecycle::notify::ExecNotifier;
use crate::peer::cache::PeerCache;
use crate::peer::protocol::{DataKind, PeerRequest, PeerResponse};
use crate::peer::{PeerChannel, transfer_timeout};
use log::{info, warn};
use std::sync::Arc;

/// The backend of a function that has no access to the programming hardware and asks the
/// owner for everything.
pub struct PeerDelegate {
    channel: Arc<dyn PeerChannel>,
    cache: PeerCache,
    notifier: Arc<dyn ExecNotifier>,
}

impl PeerDelegate {
    pub fn new(
        channel: Arc<dyn PeerChannel>,
        cache: PeerCache,
        notifier: Arc<dyn ExecNotifier>,
    ) -> Self {
        PeerDelegate {
            channel,
            cache,
            notifier,
        }
    }

    fn not_privileged(what: &str) -> IcapError {
        IcapError::NotPrivileged(format!("{what} is only possible on the owning function"))
    }

    fn forward(&mut self, image: &Axlf<'_>) -> Result<(), IcapError> {
        let bytes = image.bytes();
        let request = if self.channel.same_host() {
            PeerRequest::LoadContainerShared(Arc::from(bytes))
        } else {
            PeerRequest::LoadContainer(bytes.to_vec())
        };
        info!("Forwarding image {} ({} bytes) to the owner", image.uuid(), bytes.len());
        match self.channel.request(request, transfer_timeout(bytes.len()))? {
            PeerResponse::DownloadStatus(0) => Ok(()),
            PeerResponse::DownloadStatus(status) => Err(IcapError::Peer {
                status,
                detail: format!("owner failed to program image {}", image.uuid()),
            }),
            PeerResponse::Snapshot(_) => Err(IcapError::peer_unreachable(
                "owner answered a download with a snapshot",
            )),
        }
    }

    fn value(&mut self, kind: DataKind) -> Result<u64, IcapError> {
        self.cache.value(self.channel.as_ref(), kind)
    }
}

impl Backend for PeerDelegate {
    fn privileged(&self) -> bool {
        false
    }

    /// Skipped when the owner already runs the image; the execution subsystem is told about
    /// the reconfiguration either way.
    fn download(&mut self, image: &Axlf<'_>) -> Result<(), IcapError> {
        match self.cache.peer_uuid(self.channel.as_ref()) {
            Ok(active) if active == image.uuid() => {
                info!("Owner already runs image {active}, skipping download");
                self.notifier.reconfigure();
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!("Cannot read the owner's active image: {e}"),
        }
        let forwarded = self.forward(image);
        if forwarded.is_ok() {
            self.cache.invalidate();
        }
        self.notifier.reconfigure();
        forwarded
    }

    fn reset_bitstream(&mut self) -> Result<(), IcapError> {
        Err(Self::not_privileged("resetting the bitstream"))
    }

    fn reset_axi_gate(&mut self) -> Result<(), IcapError> {
        Err(Self::not_privileged("resetting the AXI gate"))
    }

    fn set_frequencies(&mut self, _: &[u16; MAX_CLOCKS]) -> Result<(), IcapError> {
        Err(Self::not_privileged("setting clock frequencies"))
    }

    fn verify_frequencies(&mut self, _: &[u16; MAX_CLOCKS]) -> Result<(), IcapError> {
        Err(Self::not_privileged("verifying clock frequencies"))
    }

    fn frequencies(&mut self) -> Result<[u16; MAX_CLOCKS], IcapError> {
        Ok(self.cache.snapshot(self.channel.as_ref())?.clock_freqs)
    }

    fn counter_khz(&mut self, idx: usize) -> Result<u32, IcapError> {
        Ok(self.value(DataKind::FreqCounter(idx))? as u32)
    }

    fn idcode(&mut self) -> Result<u32, IcapError> {
        Ok(self.value(DataKind::Idcode)? as u32)
    }

    fn mig_calibrated(&mut self) -> Result<bool, IcapError> {
        Ok(self.value(DataKind::MigCalibrated)? != 0)
    }

    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::None
    }

    fn set_security_level(&mut self, _: SecurityLevel) -> Result<(), IcapError> {
        Err(Self::not_privileged("changing the security level"))
    }

    fn cache_expiry(&self) -> u64 {
        self.cache.ttl_secs()
    }

    fn set_cache_expiry(&mut self, secs: u64) -> Result<(), IcapError> {
        self.cache.set_ttl(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::builder::AxlfBuilder;
    use crate::container::xuid::Xuid;
    use crate::lifecycle::notify::{ChannelNotifier, ExecEvent};
    use crate::peer::protocol::PeerSnapshot;
    use crate::peer::tests::ScriptedPeer;
    use googletest::prelude::*;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const IMAGE: Xuid = Xuid::from_bytes([0x5a; 16]);

    fn delegate(peer: Arc<ScriptedPeer>) -> (PeerDelegate, UnboundedReceiver<ExecEvent>) {
        let (notifier, rx) = ChannelNotifier::channel();
        let delegate = PeerDelegate::new(peer, PeerCache::new(10).unwrap(), Arc::new(notifier));
        (delegate, rx)
    }

    fn image() -> Vec<u8> {
        AxlfBuilder::new(IMAGE).bitstream(&[0x11; 32]).build()
    }

    #[gtest]
    fn image_already_on_the_owner_is_not_forwarded() {
        let peer = Arc::new(ScriptedPeer::serving(PeerSnapshot {
            uuid: IMAGE,
            ..PeerSnapshot::default()
        }));
        let (mut delegate, mut rx) = delegate(peer.clone());
        let bytes = image();

        assert_that!(delegate.download(&Axlf::parse(&bytes).unwrap()), ok(anything()));
        assert_that!(peer.requests().len(), eq(1));
        assert_that!(rx.try_recv(), ok(eq(ExecEvent::Reconfigured)));
    }

    #[gtest]
    fn new_image_is_forwarded_by_value() {
        let peer = Arc::new(ScriptedPeer::serving(PeerSnapshot::default()));
        let (mut delegate, mut rx) = delegate(peer.clone());
        let bytes = image();

        assert_that!(delegate.download(&Axlf::parse(&bytes).unwrap()), ok(anything()));

        let requests = peer.requests();
        assert_that!(requests.len(), eq(2));
        let (request, timeout) = &requests[1];
        assert_eq!(*request, PeerRequest::LoadContainer(bytes.clone()));
        assert_that!(*timeout, eq(Duration::from_secs(1)));
        assert_that!(rx.try_recv(), ok(eq(ExecEvent::Reconfigured)));
    }

    #[gtest]
    fn same_host_owner_reads_the_image_in_place() {
        let peer = Arc::new(ScriptedPeer::serving(PeerSnapshot::default()).on_same_host());
        let (mut delegate, _rx) = delegate(peer.clone());
        let bytes = image();

        delegate.download(&Axlf::parse(&bytes).unwrap()).unwrap();

        assert!(matches!(
            peer.requests()[1].0,
            PeerRequest::LoadContainerShared(_)
        ));
    }

    #[gtest]
    fn owner_failure_is_reported_and_still_notified() {
        let peer = Arc::new(ScriptedPeer::serving(PeerSnapshot::default()));
        peer.set_download_status(-16);
        let (mut delegate, mut rx) = delegate(peer.clone());
        let bytes = image();

        let result = delegate.download(&Axlf::parse(&bytes).unwrap());

        assert!(matches!(result, Err(IcapError::Peer { status: -16, .. })));
        assert_that!(rx.try_recv(), ok(eq(ExecEvent::Reconfigured)));
    }

    #[gtest]
    fn unreadable_owner_state_does_not_block_the_download() {
        let peer = Arc::new(ScriptedPeer::serving(PeerSnapshot::default()));
        peer.set_unreachable(true);
        let (mut delegate, _rx) = delegate(peer.clone());
        let bytes = image();

        let result = delegate.download(&Axlf::parse(&bytes).unwrap());

        assert_that!(peer.requests().len(), eq(2));
        assert!(matches!(result, Err(IcapError::Peer { .. })));
    }

    #[gtest]
    fn hardware_controls_are_refused() {
        let peer = Arc::new(ScriptedPeer::serving(PeerSnapshot::default()));
        let (mut delegate, _rx) = delegate(peer);

        assert_that!(
            delegate.reset_bitstream(),
            err(displays_as(contains_substring("IcapError::NotPrivileged")))
        );
        assert_that!(delegate.set_frequencies(&[100; 4]), err(anything()));
        assert_that!(delegate.set_security_level(SecurityLevel::System), err(anything()));
        assert_that!(delegate.security_level(), eq(SecurityLevel::None));
    }

    #[gtest]
    fn readings_come_from_the_snapshot() {
        let peer = Arc::new(ScriptedPeer::serving(PeerSnapshot {
            clock_freqs: [300, 500, 0, 0],
            freq_counters: [300_000, 499_950, 0],
            idcode: 0x1234,
            mig_calibrated: true,
            ..PeerSnapshot::default()
        }));
        let (mut delegate, _rx) = delegate(peer.clone());

        assert_that!(delegate.frequencies(), ok(eq(&[300, 500, 0, 0])));
        assert_that!(delegate.counter_khz(1), ok(eq(&499_950)));
        assert_that!(delegate.idcode(), ok(eq(&0x1234)));
        assert_that!(delegate.mig_calibrated(), ok(eq(&true)));
        assert_that!(peer.requests().len(), eq(1));
    }
}
