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

use crate::common::fixtures::{
    A, B, DATA_MHZ, KERNEL_MHZ, OwnerRig, RecordingFactory, drain, image, image_builder, words,
};
use googletest::prelude::*;
use googletest::matchers::is_empty as empty;
use icapd::container::axlf::SectionKind;
use icapd::container::sections::{IpData, IpLayout, IpType};
use icapd::container::signature::SecurityLevel;
use icapd::lifecycle::image_state::ImageState;
use icapd::lifecycle::notify::{ChannelNotifier, ExecEvent, ExecNotifier};
use icapd::lifecycle::peer_delegate::PeerDelegate;
use icapd::lifecycle::{Icap, IcapBuilder};
use icapd::peer::LocalPeer;
use icapd::peer::cache::PeerCache;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// A peer function delegating to the owner of `owner` in the same process.
struct PeerRig {
    owner: OwnerRig,
    icap: Icap,
    events: UnboundedReceiver<ExecEvent>,
    factory: Arc<RecordingFactory>,
}

impl PeerRig {
    fn new() -> PeerRig {
        let owner = OwnerRig::new();
        let (notifier, events) = ChannelNotifier::channel();
        let notifier: Arc<dyn ExecNotifier> = Arc::new(notifier);
        // a zero lifetime makes every read see the owner's current state
        let delegate = PeerDelegate::new(
            Arc::new(LocalPeer::new(owner.icap.clone())),
            PeerCache::new(0).unwrap(),
            notifier.clone(),
        );
        let factory = Arc::new(RecordingFactory::default());
        let icap = IcapBuilder::new(delegate)
            .notifier(notifier)
            .controller_factory(factory.clone())
            .build();
        PeerRig {
            owner,
            icap,
            events,
            factory,
        }
    }

    fn drain_events(&mut self) -> Vec<ExecEvent> {
        drain(&mut self.events)
    }
}

#[gtest]
fn image_already_on_the_owner_is_not_programmed_again() {
    let mut rig = PeerRig::new();
    rig.owner.icap.download(&image(A)).unwrap();
    rig.owner.device.clear_programmed_words();

    assert_that!(rig.icap.download(&image(A)), ok(eq(&A)));
    assert_that!(rig.owner.device.programmed_words(), empty());
    assert_that!(rig.icap.active_image(), ok(eq(&A)));
    assert_that!(rig.drain_events(), elements_are![eq(&ExecEvent::Reconfigured)]);
}

#[gtest]
fn new_image_is_programmed_by_the_owner() {
    let mut rig = PeerRig::new();
    let bytes = image_builder(B, &[0xbb; 8]).build();

    assert_that!(rig.icap.download(&bytes), ok(eq(&B)));
    assert_that!(rig.owner.icap.active_image(), ok(eq(&B)));
    assert_that!(rig.owner.device.programmed_words(), eq(&words(&[0xbb; 8])));
    assert_that!(rig.icap.state(), ok(eq(&ImageState::Active { id: B, refs: 0 })));
    assert_that!(rig.drain_events(), elements_are![eq(&ExecEvent::Reconfigured)]);
}

#[gtest]
fn owner_refusal_reaches_the_peer_as_a_status() {
    let mut rig = PeerRig::new();
    rig.owner.icap.download(&image(A)).unwrap();
    rig.owner.icap.lock(&A).unwrap();

    assert_that!(
        rig.icap.download(&image(B)),
        err(displays_as(contains_substring(
            "IcapError::Peer: peer failed with status -16"
        )))
    );
    assert_that!(rig.icap.state(), ok(eq(&ImageState::Idle)));
    assert_that!(rig.owner.icap.active_image(), ok(eq(&A)));
    // the execution subsystem hears about the attempt either way
    assert_that!(rig.drain_events(), elements_are![eq(&ExecEvent::Reconfigured)]);
}

#[gtest]
fn peer_references_are_its_own() {
    let mut rig = PeerRig::new();
    rig.icap.download(&image(A)).unwrap();
    rig.drain_events();

    assert_that!(rig.icap.lock(&A), ok(eq(&1)));
    assert_that!(rig.owner.icap.refcount(), ok(eq(&0)));
    assert_that!(rig.icap.unlock(Some(&A)), ok(eq(&0)));
    assert_that!(
        rig.drain_events(),
        elements_are![eq(&ExecEvent::Activated(A)), eq(&ExecEvent::Stopped)]
    );

    // releasing nothing tells nobody
    assert_that!(rig.icap.unlock(None), ok(eq(&0)));
    assert_that!(rig.drain_events(), empty());
}

#[gtest]
fn peer_reads_the_owner_hardware() {
    let rig = PeerRig::new();
    rig.owner.icap.download(&image(A)).unwrap();
    rig.icap.download(&image(A)).unwrap();

    assert_that!(
        rig.icap.frequencies(),
        ok(eq(&[DATA_MHZ, KERNEL_MHZ, 100, 0]))
    );
    rig.owner.device.set_counter_override(1, Some(480_400));
    assert_that!(
        rig.icap.clock_report(),
        ok(eq(&[DATA_MHZ, 480, 100, 0]))
    );
    assert_that!(rig.icap.idcode(), ok(eq(&0x04b3_1093)));
    assert_that!(rig.icap.mig_calibrated(), ok(eq(&true)));
    assert_that!(
        rig.icap.frequency_bounds(),
        ok(eq(&[(60, DATA_MHZ), (60, KERNEL_MHZ), (0, 0), (0, 0)]))
    );
}

#[gtest]
fn cache_lifetime_is_bounded() {
    let rig = PeerRig::new();
    assert_that!(rig.icap.cache_expiry(), ok(eq(&0)));
    assert_that!(rig.icap.set_cache_expiry(5), ok(anything()));
    assert_that!(rig.icap.cache_expiry(), ok(eq(&5)));
    assert_that!(
        rig.icap.set_cache_expiry(11),
        err(displays_as(contains_substring("IcapError::Argument")))
    );
    assert_that!(
        rig.owner.icap.set_cache_expiry(1),
        err(displays_as(contains_substring("IcapError::Argument")))
    );
}

#[gtest]
fn privileged_operations_are_refused() {
    let rig = PeerRig::new();
    rig.icap.download(&image(A)).unwrap();

    assert_that!(rig.icap.privileged(), ok(eq(&false)));
    assert_that!(
        rig.icap.reset_bitstream(),
        err(displays_as(contains_substring("IcapError::NotPrivileged")))
    );
    assert_that!(
        rig.icap.reset_axi_gate(),
        err(displays_as(contains_substring("IcapError::NotPrivileged")))
    );
    assert_that!(
        rig.icap.update_frequencies(&[250, 0, 0, 0]),
        err(displays_as(contains_substring("IcapError::NotPrivileged")))
    );
    assert_that!(
        rig.icap.set_security_level(SecurityLevel::System),
        err(displays_as(contains_substring("IcapError::NotPrivileged")))
    );
    assert_that!(rig.icap.security_level(), ok(eq(&SecurityLevel::None)));
}

#[gtest]
fn controller_failure_is_tolerated_on_a_peer() {
    let rig = PeerRig::new();
    rig.factory.set_failing(true);
    let layout = IpLayout {
        ips: vec![IpData {
            ip_type: IpType::Dnasc,
            properties: 0,
            base_address: 0x1_8000,
            name: "dna_self_check".to_string(),
        }],
    };
    let bytes = image_builder(A, &[0xaa; 4])
        .section(SectionKind::IpLayout, layout.encode())
        .build();

    assert_that!(rig.icap.download(&bytes), ok(eq(&A)));
    assert_that!(rig.icap.controllers(), ok(len(eq(1))));
    // the owner created its own
    assert_that!(rig.owner.factory.created().len(), eq(1));
}
