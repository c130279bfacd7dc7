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
    A, B, OwnerRig, clock, data_and_kernel, image, image_builder, topology, words,
};
use googletest::prelude::*;
use googletest::matchers::is_empty as empty;
use icapd::container::axlf::SectionKind;
use icapd::container::builder::AxlfBuilder;
use icapd::container::sections::{ClockType, ControllerKind, IpData, IpLayout, IpType};
use icapd::container::signature::{KeyringScope, SecurityLevel, SignatureVerifier};
use icapd::container::xuid::Xuid;
use icapd::hardware::regs::{gate, icap};
use icapd::lifecycle::image_state::ImageState;
use icapd::lifecycle::notify::ExecEvent;
use icapd::peer::protocol::{PeerRequest, PeerResponse};
use std::sync::Arc;

fn dna_layout() -> IpLayout {
    IpLayout {
        ips: vec![IpData {
            ip_type: IpType::Dnasc,
            properties: 0,
            base_address: 0x1_8000,
            name: "dna_self_check".to_string(),
        }],
    }
}

#[gtest]
fn refcount_follows_users_of_the_active_image() {
    let mut rig = OwnerRig::new();
    assert_that!(rig.icap.download(&image(A)), ok(eq(&A)));
    assert_that!(rig.icap.state(), ok(eq(&ImageState::Active { id: A, refs: 0 })));

    assert_that!(rig.icap.lock(&A), ok(eq(&1)));
    assert_that!(rig.icap.lock(&A), ok(eq(&2)));
    assert_that!(
        rig.icap.lock(&B),
        err(displays_as(contains_substring("IcapError::IdentityMismatch")))
    );
    assert_that!(
        rig.icap.download(&image(B)),
        err(displays_as(contains_substring(
            "IcapError::ImageInUse: active image is locked by 2 user(s)"
        )))
    );
    assert_that!(rig.icap.active_image(), ok(eq(&A)));

    assert_that!(rig.icap.unlock(Some(&A)), ok(eq(&1)));
    assert_that!(rig.icap.unlock(None), ok(eq(&0)));
    assert_that!(
        rig.icap.unlock(Some(&A)),
        err(displays_as(contains_substring("IcapError::Argument")))
    );

    assert_that!(rig.icap.download(&image(B)), ok(eq(&B)));
    assert_that!(rig.icap.refcount(), ok(eq(&0)));
    // the owner reports activation only; stopping is up to its users
    assert_that!(rig.drain_events(), elements_are![eq(&ExecEvent::Activated(A))]);
}

#[gtest]
fn null_image_cannot_be_locked() {
    let rig = OwnerRig::new();
    rig.icap.download(&image(A)).unwrap();
    assert_that!(
        rig.icap.lock(&Xuid::NULL),
        err(displays_as(contains_substring("IcapError::Argument")))
    );
}

#[gtest]
fn bad_magic_touches_no_register() {
    let rig = OwnerRig::new();
    let before = rig.device.write_log().len();
    let mut bytes = image(A);
    bytes[0] ^= 0xff;

    assert_that!(
        rig.icap.download(&bytes),
        err(displays_as(contains_substring("IcapError::InvalidMagic")))
    );
    assert_that!(rig.device.write_log().len(), eq(before));
    assert_that!(rig.icap.state(), ok(eq(&ImageState::Idle)));
}

#[gtest]
fn missing_data_clock_fails_before_the_gate_freezes() {
    let rig = OwnerRig::new();
    let bytes = AxlfBuilder::new(A)
        .bitstream(&[0xaa; 8])
        .clock_topology(&topology(vec![clock(500, ClockType::Kernel, "kernel_clk")]))
        .build();

    assert_that!(
        rig.icap.download(&bytes),
        err(displays_as(contains_substring("IcapError::ClockTopology")))
    );
    assert_that!(rig.device.gate_writes(), empty());
    assert_that!(rig.device.programmed_words(), empty());
    assert_that!(rig.icap.active_image(), ok(eq(&Xuid::NULL)));
}

#[gtest]
fn clearing_bitstream_is_programmed_before_the_next_image() {
    let rig = OwnerRig::new();
    let with_clearing = image_builder(A, &[0xaa; 4])
        .clearing_bitstream(&[0xcc; 4])
        .build();

    rig.icap.download(&with_clearing).unwrap();
    assert_that!(rig.device.programmed_words(), eq(&words(&[0xaa; 4])));

    rig.device.clear_programmed_words();
    rig.icap
        .download(&image_builder(B, &[0xbb; 8]).build())
        .unwrap();
    assert_that!(
        rig.device.programmed_words(),
        eq(&[words(&[0xcc; 4]), words(&[0xbb; 8])].concat())
    );

    // B stages nothing, so the next image is programmed alone
    rig.device.clear_programmed_words();
    rig.icap.download(&with_clearing).unwrap();
    assert_that!(rig.device.programmed_words(), eq(&words(&[0xaa; 4])));
}

#[gtest]
fn failed_clearing_bitstream_aborts_before_the_next_image() {
    let rig = OwnerRig::new();
    let with_clearing = image_builder(A, &[0xaa; 4])
        .clearing_bitstream(&[0xcc; 4])
        .build();
    rig.icap.download(&with_clearing).unwrap();

    rig.device.clear_programmed_words();
    rig.device.set_done_after_program(false);
    assert_that!(
        rig.icap.download(&image_builder(B, &[0xbb; 8]).build()),
        err(displays_as(contains_substring("IcapError::ProgrammingTimeout")))
    );
    assert_that!(rig.device.programmed_words(), eq(&words(&[0xcc; 4])));
    assert_that!(rig.icap.state(), ok(eq(&ImageState::Idle)));
    expect_false!(rig.device.gate_frozen());
}

#[gtest]
fn malformed_clearing_bitstream_is_refused_before_programming() {
    let rig = OwnerRig::new();
    let bad_clearing = image_builder(A, &[0xaa; 4])
        .section(SectionKind::ClearingBitstream, vec![0x00, 0x09, 0x0f])
        .build();

    assert_that!(
        rig.icap.download(&bad_clearing),
        err(displays_as(contains_substring("IcapError::InvalidHeader")))
    );
    assert_that!(rig.device.programmed_words(), empty());
    assert_that!(rig.device.gate_writes(), empty());
    assert_that!(rig.icap.state(), ok(eq(&ImageState::Idle)));
}

#[gtest]
fn failed_programming_leaves_no_active_image() {
    let rig = OwnerRig::new();
    rig.icap.download(&image(A)).unwrap();
    rig.device.set_done_after_program(false);

    assert_that!(
        rig.icap.download(&image(B)),
        err(displays_as(contains_substring("IcapError::ProgrammingTimeout")))
    );
    assert_that!(rig.icap.state(), ok(eq(&ImageState::Idle)));
    assert_that!(
        rig.icap.section(SectionKind::ClockFreqTopology),
        err(displays_as(contains_substring("IcapError::SectionNotFound")))
    );
    expect_false!(rig.device.gate_frozen());
}

#[gtest]
fn calibration_timeout_fails_the_download() {
    let rig = OwnerRig::new();
    rig.device.set_calibrated(false);
    assert_that!(
        rig.icap.download(&image(A)),
        err(displays_as(contains_substring("IcapError::CalibrationTimeout")))
    );
    assert_that!(rig.icap.mig_calibrated(), ok(eq(&false)));
    assert_that!(rig.icap.state(), ok(eq(&ImageState::Idle)));
}

#[gtest]
fn unsigned_image_is_refused_by_policy() {
    let rig = OwnerRig::new();
    rig.icap.set_security_level(SecurityLevel::System).unwrap();
    assert_that!(
        rig.icap.download(&image(A)),
        err(displays_as(contains_substring("IcapError::UnsignedImage")))
    );
    assert_that!(rig.device.programmed_words(), empty());
    assert_that!(rig.icap.security_level(), ok(eq(&SecurityLevel::System)));
}

/// Trusts signatures reading `good` on the system keyring.
struct SystemKeys;

impl SignatureVerifier for SystemKeys {
    fn verify(&self, _: &[u8], signature: &[u8], scope: KeyringScope<'_>) -> Result<(), String> {
        match scope {
            KeyringScope::System if signature == b"good" => Ok(()),
            _ => Err("untrusted signature".to_string()),
        }
    }
}

fn signed(id: Xuid, signature: &[u8]) -> Vec<u8> {
    image_builder(id, &[0x5a; 4])
        .signature(signature.to_vec())
        .build()
}

#[gtest]
fn signatures_are_checked_against_the_system_keyring() {
    let rig = OwnerRig::configured(|owner| {
        owner
            .with_verifier(Arc::new(SystemKeys))
            .with_security_level(SecurityLevel::System)
    });

    assert_that!(rig.icap.download(&signed(A, b"good")), ok(eq(&A)));
    rig.device.clear_programmed_words();
    assert_that!(
        rig.icap.download(&signed(B, b"evil")),
        err(displays_as(contains_substring("IcapError::SignatureRejected")))
    );
    assert_that!(rig.device.programmed_words(), empty());
}

#[gtest]
fn bad_signature_is_only_logged_without_a_policy() {
    let rig = OwnerRig::configured(|owner| owner.with_verifier(Arc::new(SystemKeys)));
    assert_that!(rig.icap.download(&signed(A, b"evil")), ok(eq(&A)));
}

#[gtest]
fn metadata_of_the_active_image_is_cached() {
    let rig = OwnerRig::new();
    rig.icap.download(&image(A)).unwrap();
    assert_that!(
        rig.icap.section(SectionKind::ClockFreqTopology),
        ok(eq(&data_and_kernel(300, 500).encode()))
    );
    assert_that!(
        rig.icap.section(SectionKind::IpLayout),
        err(displays_as(contains_substring("IcapError::SectionNotFound")))
    );
}

#[gtest]
fn controllers_follow_the_active_image() {
    let rig = OwnerRig::new();
    let with_dna = image_builder(A, &[0xaa; 4])
        .section(SectionKind::IpLayout, dna_layout().encode())
        .build();

    rig.icap.download(&with_dna).unwrap();
    let created = rig.factory.created();
    assert_that!(created.len(), eq(1));
    expect_that!(created[0].kind, eq(ControllerKind::Dna));
    expect_that!(created[0].base_address, eq(0x1_8000));
    assert_that!(rig.icap.controllers(), ok(eq(&created)));

    rig.icap.download(&image(B)).unwrap();
    assert_that!(rig.factory.created(), empty());
    assert_that!(rig.icap.controllers(), ok(empty()));
}

#[gtest]
fn controller_failure_aborts_the_download() {
    let rig = OwnerRig::new();
    rig.factory.set_failing(true);
    let with_dna = image_builder(A, &[0xaa; 4])
        .section(SectionKind::IpLayout, dna_layout().encode())
        .build();

    assert_that!(
        rig.icap.download(&with_dna),
        err(displays_as(contains_substring("IcapError::Internal")))
    );
    assert_that!(rig.icap.state(), ok(eq(&ImageState::Idle)));
}

#[gtest]
fn reset_is_refused_while_the_image_is_held() {
    let rig = OwnerRig::new();
    rig.icap.download(&image(A)).unwrap();
    rig.icap.lock(&A).unwrap();
    rig.device.clear_programmed_words();

    assert_that!(
        rig.icap.reset_bitstream(),
        err(displays_as(contains_substring("IcapError::ImageInUse")))
    );
    assert_that!(
        rig.icap.reset_axi_gate(),
        err(displays_as(contains_substring("IcapError::ImageInUse")))
    );
    assert_that!(rig.device.programmed_words(), empty());

    rig.icap.unlock(None).unwrap();
    assert_that!(rig.icap.reset_bitstream(), ok(anything()));
    assert_that!(rig.device.programmed_words(), eq(&icap::BOOT_SEQUENCE.to_vec()));
    assert_that!(rig.icap.state(), ok(eq(&ImageState::Idle)));
    assert_that!(
        rig.icap.section(SectionKind::ClockFreqTopology),
        err(anything())
    );
}

#[gtest]
fn axi_gate_reset_freezes_then_frees() {
    let rig = OwnerRig::new();
    let cycle: Vec<u32> = std::iter::once(gate::FREEZE)
        .chain(gate::FREE_SEQUENCE)
        .collect();

    rig.icap.reset_axi_gate().unwrap();
    assert_that!(rig.device.gate_writes(), eq(&cycle));
    rig.icap.reset_axi_gate().unwrap();
    assert_that!(rig.device.gate_writes(), eq(&cycle.repeat(2)));
    expect_false!(rig.device.gate_frozen());
}

#[gtest]
fn peer_requests_are_answered_with_errno() {
    let rig = OwnerRig::new();
    assert_that!(
        rig.icap.serve_peer(PeerRequest::LoadContainer(vec![0; 16])),
        eq(&PeerResponse::DownloadStatus(-22))
    );

    assert_that!(
        rig.icap.serve_peer(PeerRequest::LoadContainer(image(A))),
        eq(&PeerResponse::DownloadStatus(0))
    );
    rig.icap.lock(&A).unwrap();
    assert_that!(
        rig.icap.serve_peer(PeerRequest::LoadContainer(image(B))),
        eq(&PeerResponse::DownloadStatus(-16))
    );
    assert_that!(rig.icap.active_image(), ok(eq(&A)));
}

#[gtest]
fn idle_snapshot_has_no_counter_readings() {
    let rig = OwnerRig::new();
    let PeerResponse::Snapshot(snapshot) = rig.icap.serve_peer(PeerRequest::ReadSnapshot) else {
        panic!("expected a snapshot");
    };
    expect_that!(snapshot.uuid, eq(Xuid::NULL));
    expect_that!(snapshot.freq_counters, eq([0, 0, 0]));
    expect_that!(snapshot.clock_freqs, eq([100, 100, 100, 0]));
    expect_that!(snapshot.idcode, eq(0x04b3_1093));
    expect_true!(snapshot.mig_calibrated);
}
