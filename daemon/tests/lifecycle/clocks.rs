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

use crate::common::fixtures::{A, DATA_MHZ, KERNEL_MHZ, OwnerRig, image};
use googletest::prelude::*;
use googletest::matchers::is_empty as empty;
use icapd::container::sections::MAX_CLOCKS;
use icapd::hardware::regs::clock;
use icapd::lifecycle::image_state::ImageState;
use rstest::*;

fn active_rig() -> OwnerRig {
    let rig = OwnerRig::new();
    rig.icap.download(&image(A)).unwrap();
    rig
}

#[gtest]
fn image_clocks_are_applied_on_download() {
    let rig = active_rig();
    // the third generator exists but the image leaves it at its reset setting
    assert_that!(
        rig.icap.frequencies(),
        ok(eq(&[DATA_MHZ, KERNEL_MHZ, 100, 0]))
    );
    assert_that!(
        rig.icap.clock_report(),
        ok(eq(&[DATA_MHZ, KERNEL_MHZ, 100, 0]))
    );
    assert_that!(
        rig.icap.frequency_bounds(),
        ok(eq(&[(60, DATA_MHZ), (60, KERNEL_MHZ), (0, 0), (0, 0)]))
    );
}

#[gtest]
fn without_an_image_there_is_nothing_to_override() {
    let rig = OwnerRig::new();
    assert_that!(
        rig.icap.update_frequencies(&[250, 0, 0, 0]),
        err(displays_as(contains_substring("IcapError::ClockTopology")))
    );
    assert_that!(rig.icap.frequency_bounds(), ok(eq(&[(0, 0); MAX_CLOCKS])));
    // no counters are read while nothing runs
    assert_that!(rig.icap.clock_report(), ok(eq(&[100, 100, 100, 0])));
}

#[gtest]
fn override_within_bounds_is_applied_and_verified() {
    let rig = active_rig();
    assert_that!(rig.icap.update_frequencies(&[250, 0, 0, 0]), ok(anything()));
    assert_that!(rig.icap.frequencies(), ok(eq(&[250, KERNEL_MHZ, 100, 0])));
    assert_that!(rig.icap.clock_report(), ok(eq(&[250, KERNEL_MHZ, 100, 0])));
}

#[gtest]
fn override_snaps_to_the_step_below() {
    let rig = active_rig();
    rig.icap.update_frequencies(&[0, 420, 0, 0]).unwrap();
    assert_that!(rig.icap.frequencies(), ok(eq(&[DATA_MHZ, 400, 100, 0])));
}

#[gtest]
#[rstest]
#[case::above_data(&[301, 0, 0, 0], "301 MHz for clock 0 is outside 60..=300 MHz")]
#[case::below_minimum(&[0, 59, 0, 0], "59 MHz for clock 1 is outside 60..=500 MHz")]
#[case::undeclared_clock(&[0, 0, 200, 0], "200 MHz for clock 2 is outside 0..=0 MHz")]
fn out_of_range_override_writes_nothing(#[case] targets: &[u16], #[case] message: &str) {
    let rig = active_rig();
    let before = rig.device.write_log().len();
    let targets: [u16; MAX_CLOCKS] = targets.try_into().unwrap();

    assert_that!(
        rig.icap.update_frequencies(&targets),
        err(displays_as(contains_substring(message)))
    );
    assert_that!(rig.device.write_log().len(), eq(before));
}

#[gtest]
#[rstest]
#[case::exact(250_000, true)]
#[case::within_five_percent(262_000, true)]
#[case::too_slow(200_000, false)]
#[case::too_fast(263_000, false)]
fn measured_clock_must_match_the_step(#[case] measured_khz: u32, #[case] accepted: bool) {
    let rig = active_rig();
    rig.device.set_counter_override(0, Some(measured_khz));

    let result = rig.icap.update_frequencies(&[250, 0, 0, 0]);
    if accepted {
        assert_that!(result, ok(anything()));
    } else {
        assert_that!(
            result,
            err(displays_as(contains_substring(
                "IcapError::FrequencyOutOfTolerance"
            )))
        );
    }
    // the generator was reprogrammed either way
    assert_that!(rig.icap.frequencies(), ok(eq(&[250, KERNEL_MHZ, 100, 0])));
}

#[gtest]
fn report_prefers_the_counters() {
    let rig = active_rig();
    rig.device.set_counter_override(1, Some(480_400));
    assert_that!(
        rig.icap.clock_report(),
        ok(eq(&[DATA_MHZ, 480, 100, 0]))
    );
}

#[gtest]
fn lock_failure_restores_the_previous_setting() {
    let rig = active_rig();
    rig.device.set_lock_failure(1, true);

    assert_that!(
        rig.icap.update_frequencies(&[0, 400, 0, 0]),
        err(displays_as(contains_substring(
            "IcapError::ClockLockTimeout: clock generator 1 failed to lock"
        )))
    );
    assert_that!(rig.icap.frequencies(), ok(eq(&[DATA_MHZ, KERNEL_MHZ, 100, 0])));
    let controls = rig.device.wizard_control_writes(1);
    assert_that!(
        controls[controls.len() - 3..].to_vec(),
        eq(&vec![clock::SADDR, clock::RESTORE, clock::IDLE])
    );
    expect_false!(rig.device.gate_frozen());
    // the image itself stays active
    assert_that!(rig.icap.active_image(), ok(eq(&A)));
}

#[gtest]
fn lock_failure_during_download_programs_nothing() {
    let rig = OwnerRig::new();
    rig.device.set_lock_failure(0, true);

    assert_that!(
        rig.icap.download(&image(A)),
        err(displays_as(contains_substring("IcapError::ClockLockTimeout")))
    );
    assert_that!(rig.device.programmed_words(), empty());
    assert_that!(rig.icap.state(), ok(eq(&ImageState::Idle)));
    expect_false!(rig.device.gate_frozen());
}

#[gtest]
fn busy_generator_is_not_touched() {
    let rig = active_rig();
    rig.device.set_wizard_locked(0, false);
    let before = rig.device.wizard_control_writes(0).len();

    assert_that!(
        rig.icap.update_frequencies(&[250, 0, 0, 0]),
        err(displays_as(contains_substring("IcapError::ClockBusy")))
    );
    assert_that!(rig.device.wizard_control_writes(0).len(), eq(before));
}

#[gtest]
fn unbounded_set_reaches_unused_generators() {
    let rig = active_rig();
    rig.icap.set_frequencies(&[0, 0, 150, 0]).unwrap();
    assert_that!(rig.icap.frequencies(), ok(eq(&[DATA_MHZ, KERNEL_MHZ, 150, 0])));
}
