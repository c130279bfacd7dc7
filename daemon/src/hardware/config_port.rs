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

//! The configuration port (AXI HWICAP) write path.
//!
//! Configuration words are pushed into the write FIFO in batches no larger than the FIFO
//! vacancy the port reports; after each batch the write strobe is asserted and polled until the
//! port has drained the FIFO. The payload of a bitstream section is a big-endian word stream.

use crate::container::bitheader::BitHeader;
use crate::error::IcapError;
use crate::hardware::io::{RegisterWindow, Sleeper};
use crate::hardware::poll::RetryPolicy;
use crate::hardware::regs::icap;
use log::{info, trace, warn};
use std::sync::Arc;

#[derive(Clone)]
pub struct ConfigPort {
    regs: RegisterWindow,
    sleeper: Arc<dyn Sleeper>,
}

impl ConfigPort {
    pub fn new(regs: RegisterWindow, sleeper: Arc<dyn Sleeper>) -> Self {
        ConfigPort { regs, sleeper }
    }

    /// Push `words` into the write FIFO and strobe them into the port.
    ///
    /// # Returns: `Result<(), IcapError>`
    /// * `Ok(())` - the port drained the FIFO
    /// * `Err(IcapError::WriteTimeout)` - the strobe did not clear in time
    pub fn write_words(&self, words: &[u32]) -> Result<(), IcapError> {
        for word in words {
            self.regs.write(icap::WF, *word)?;
        }
        self.regs.write(icap::CR, icap::CR_WRITE)?;
        let drained = RetryPolicy::WRITE_STROBE.poll(self.sleeper.as_ref(), || {
            Ok(self.regs.read(icap::CR)? & icap::CR_WRITE == 0)
        })?;
        if !drained {
            return Err(IcapError::WriteTimeout { words: words.len() });
        }
        Ok(())
    }

    /// Stream a big-endian configuration payload, batch size bounded by FIFO vacancy.
    ///
    /// # Returns: `Result<usize, IcapError>`
    /// * `Ok(usize)` - number of words written
    /// * `Err(IcapError::PortBusy)` - the port reported no vacancy
    /// * `Err(IcapError::WriteTimeout)` - a batch was not drained
    pub fn stream_payload(&self, payload: &[u8]) -> Result<usize, IcapError> {
        let chunks = payload.chunks_exact(4);
        if !chunks.remainder().is_empty() {
            warn!(
                "Dropping {} trailing bytes that do not form a word",
                chunks.remainder().len()
            );
        }
        let total = payload.len() / 4;
        let mut words = chunks.map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]));
        let mut batch = Vec::new();
        let mut written = 0;

        while written < total {
            let vacancy = self.regs.read(icap::WFV)?;
            // the vacancy register is signed in hardware
            if vacancy == 0 || vacancy > i32::MAX as u32 {
                return Err(IcapError::PortBusy { vacancy });
            }
            let n = (vacancy as usize).min(total - written);
            batch.clear();
            batch.extend(words.by_ref().take(n));
            self.write_words(&batch)?;
            written += n;
        }
        trace!("Streamed {written} words");
        Ok(written)
    }

    /// Wait for the port to report done or end-of-startup.
    pub fn wait_for_done(&self) -> Result<(), IcapError> {
        let mut status = 0;
        let done = RetryPolicy::PROGRAM_DONE.poll(self.sleeper.as_ref(), || {
            status = self.regs.read(icap::SR)?;
            Ok(status & icap::SR_DONE_MASK != 0)
        })?;
        if !done {
            return Err(IcapError::ProgrammingTimeout { status });
        }
        trace!("Configuration port done, status {status:#x}");
        Ok(())
    }

    /// Program a bitstream section: header, payload, completion.
    ///
    /// # Arguments
    ///
    /// * `section` - a `BITSTREAM` or `CLEARING_BITSTREAM` section, `.bit` header included
    ///
    /// # Returns: `Result<BitHeader, IcapError>`
    /// * `Ok(BitHeader)` - the header of the programmed bitstream
    /// * `Err(IcapError::InvalidHeader)` - the header is malformed or the payload is truncated
    /// * `Err(IcapError)` - any error of [`stream_payload`](Self::stream_payload) or
    ///   [`wait_for_done`](Self::wait_for_done)
    pub fn program(&self, section: &[u8]) -> Result<BitHeader, IcapError> {
        let header = BitHeader::parse(section)?;
        let payload = header.payload(section)?;
        info!(
            "Programming design {} for {} ({} bytes)",
            header.design_name, header.part_name, header.bitstream_length
        );
        self.stream_payload(payload)?;
        self.wait_for_done()?;
        Ok(header)
    }

    /// Ask the device to reload its image from flash.
    pub fn send_boot_sequence(&self) -> Result<(), IcapError> {
        info!("Sending IPROG boot sequence");
        self.write_words(&icap::BOOT_SEQUENCE)
    }

    /// Read the IDCODE of the device through the port.
    pub fn probe_idcode(&self) -> Result<u32, IcapError> {
        self.regs.write(icap::GIER, 0)?;
        self.write_words(&icap::IDCODE_SEQUENCE)?;
        self.regs.write(icap::SZ, 1)?;
        self.regs.write(icap::CR, icap::CR_READ)?;
        let read_back = RetryPolicy::WRITE_STROBE.poll(self.sleeper.as_ref(), || {
            Ok(self.regs.read(icap::CR)? & icap::CR_READ == 0)
        })?;
        if !read_back {
            warn!("IDCODE read did not complete");
        }
        let idcode = self.regs.read(icap::RF)?;
        info!("Device IDCODE {idcode:#010x}");
        Ok(idcode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::regs;
    use crate::hardware::simulated::{RecordingSleeper, SimulatedDevice};
    use googletest::prelude::*;

    fn port(device: &Arc<SimulatedDevice>) -> ConfigPort {
        let layout = device.layout();
        ConfigPort::new(
            RegisterWindow::new(device.clone(), layout.icap),
            Arc::new(RecordingSleeper::default()),
        )
    }

    #[gtest]
    fn payload_is_written_big_endian_in_vacancy_sized_batches() {
        let device = Arc::new(SimulatedDevice::default());
        device.set_fifo_vacancy(2);
        let payload: Vec<u8> = (0u8..20).collect();

        let written = port(&device).stream_payload(&payload).unwrap();

        assert_that!(written, eq(5));
        assert_that!(
            device.programmed_words(),
            eq(&vec![0x00010203, 0x04050607, 0x08090a0b, 0x0c0d0e0f, 0x10111213])
        );
        assert_that!(device.write_strobes(), eq(3));
    }

    #[gtest]
    fn no_vacancy_is_port_busy() {
        let device = Arc::new(SimulatedDevice::default());
        device.set_fifo_vacancy(0);
        assert!(matches!(
            port(&device).stream_payload(&[0; 8]),
            Err(IcapError::PortBusy { vacancy: 0 })
        ));
        assert_that!(device.programmed_words().len(), eq(0));
    }

    #[gtest]
    fn stuck_strobe_times_out() {
        let device = Arc::new(SimulatedDevice::default());
        device.set_stuck_strobe(true);
        assert!(matches!(
            port(&device).write_words(&[1, 2, 3]),
            Err(IcapError::WriteTimeout { words: 3 })
        ));
    }

    #[gtest]
    fn missing_done_flag_times_out() {
        let device = Arc::new(SimulatedDevice::default());
        device.set_done_after_program(false);
        let section = BitHeader::encode("d", "p", "c", "t", &[0; 8]);
        assert_that!(
            port(&device).program(&section),
            err(displays_as(contains_substring("IcapError::ProgrammingTimeout")))
        );
    }

    #[gtest]
    fn program_streams_only_the_payload() {
        let device = Arc::new(SimulatedDevice::default());
        let section = BitHeader::encode("d", "p", "c", "t", &[0xaa, 0x99, 0x55, 0x66]);
        let header = port(&device).program(&section).unwrap();
        assert_that!(header.bitstream_length, eq(4));
        assert_that!(device.programmed_words(), eq(&vec![0xaa995566]));
    }

    #[gtest]
    fn boot_sequence_goes_through_the_write_fifo() {
        let device = Arc::new(SimulatedDevice::default());
        port(&device).send_boot_sequence().unwrap();
        assert_that!(
            device.programmed_words(),
            eq(&regs::icap::BOOT_SEQUENCE.to_vec())
        );
    }

    #[gtest]
    fn idcode_is_read_back() {
        let device = Arc::new(SimulatedDevice::default());
        device.set_idcode(0x04b7_d093);
        assert_that!(port(&device).probe_idcode().unwrap(), eq(0x04b7_d093));
    }
}
