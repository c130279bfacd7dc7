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

use crate::error::IcapError;
use crate::hardware::io::Sleeper;
use std::time::Duration;

/// A bounded wait: probe, and if not ready sleep `interval`, at most `attempts` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Write strobe of the configuration port.
    pub const WRITE_STROBE: RetryPolicy = RetryPolicy::new(Duration::from_nanos(50), 20);
    /// Done flag of the configuration port after the last word.
    pub const PROGRAM_DONE: RetryPolicy = RetryPolicy::new(Duration::from_micros(5), 10);
    /// Lock of a clock generator after reconfiguration.
    pub const CLOCK_LOCK: RetryPolicy = RetryPolicy::new(Duration::from_millis(100), 100);
    /// Latch handshake of the frequency counters.
    pub const COUNTER_LATCH: RetryPolicy = RetryPolicy::new(Duration::from_millis(1), 10);
    /// Memory controller calibration after programming.
    pub const CALIBRATION: RetryPolicy = RetryPolicy::new(Duration::from_millis(500), 20);

    pub const fn new(interval: Duration, attempts: u32) -> Self {
        RetryPolicy { interval, attempts }
    }

    /// Longest time [`poll`](Self::poll) sleeps before giving up.
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts
    }

    /// Run `probe` until it reports ready or the attempts are used up.
    ///
    /// # Returns: `Result<bool, IcapError>`
    /// * `Ok(true)` - `probe` reported ready
    /// * `Ok(false)` - still not ready after the last attempt
    /// * `Err(IcapError)` - `probe` failed
    pub fn poll<F>(&self, sleeper: &dyn Sleeper, mut probe: F) -> Result<bool, IcapError>
    where
        F: FnMut() -> Result<bool, IcapError>,
    {
        for _ in 0..self.attempts {
            if probe()? {
                return Ok(true);
            }
            sleeper.sleep(self.interval);
        }
        probe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulated::RecordingSleeper;
    use googletest::prelude::*;
    use rstest::*;

    #[gtest]
    #[rstest]
    #[case::immediately(0, true, 0)]
    #[case::after_three(3, true, 3)]
    #[case::on_final_probe(5, true, 5)]
    #[case::never(6, false, 5)]
    fn probes_until_ready(
        #[case] ready_after: u32,
        #[case] expected: bool,
        #[case] sleeps: usize,
    ) {
        let sleeper = RecordingSleeper::default();
        let policy = RetryPolicy::new(Duration::from_millis(1), 5);
        let mut probes = 0;
        let ready = policy
            .poll(&sleeper, || {
                probes += 1;
                Ok(probes > ready_after)
            })
            .unwrap();
        assert_that!(ready, eq(expected));
        assert_that!(sleeper.calls(), eq(sleeps));
    }

    #[gtest]
    fn probe_errors_stop_the_wait() {
        let sleeper = RecordingSleeper::default();
        let result = RetryPolicy::CALIBRATION.poll(&sleeper, || {
            Err(IcapError::Internal("register read failed".into()))
        });
        assert_that!(result, err(displays_as(contains_substring("register read failed"))));
        assert_that!(sleeper.calls(), eq(0));
    }

    #[gtest]
    fn calibration_waits_ten_seconds() {
        assert_that!(RetryPolicy::CALIBRATION.budget(), eq(Duration::from_secs(10)));
    }
}
