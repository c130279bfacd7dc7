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
use crate::system_io::{fs_open_register_file, fs_read_u32_at, fs_write_u32_at};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// 32-bit register access to a device. Offsets are in bytes.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: u64) -> Result<u32, IcapError>;
    fn write32(&self, offset: u64, value: u32) -> Result<(), IcapError>;
}

/// Delays between register accesses.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A register block at a fixed offset of a [`RegisterIo`].
#[derive(Clone)]
pub struct RegisterWindow {
    io: Arc<dyn RegisterIo>,
    base: u64,
}

impl fmt::Debug for RegisterWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterWindow")
            .field("base", &format_args!("{:#x}", self.base))
            .finish()
    }
}

impl RegisterWindow {
    pub fn new(io: Arc<dyn RegisterIo>, base: u64) -> Self {
        RegisterWindow { io, base }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn read(&self, offset: u64) -> Result<u32, IcapError> {
        self.io.read32(self.base + offset)
    }

    pub fn write(&self, offset: u64, value: u32) -> Result<(), IcapError> {
        self.io.write32(self.base + offset, value)
    }
}

/// Register access through a PCI resource file, e.g. `/sys/bus/pci/devices/<bdf>/resource0`.
#[derive(Debug)]
pub struct ResourceFile {
    file: File,
    path: PathBuf,
}

impl ResourceFile {
    pub fn open(path: &Path) -> Result<Self, IcapError> {
        Ok(ResourceFile {
            file: fs_open_register_file(path)?,
            path: path.to_path_buf(),
        })
    }
}

impl RegisterIo for ResourceFile {
    fn read32(&self, offset: u64) -> Result<u32, IcapError> {
        fs_read_u32_at(&self.file, &self.path, offset)
    }

    fn write32(&self, offset: u64, value: u32) -> Result<(), IcapError> {
        fs_write_u32_at(&self.file, &self.path, offset, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use tempfile::NamedTempFile;

    #[gtest]
    fn window_offsets_are_relative_to_base() {
        let tmp = NamedTempFile::new().unwrap();
        tmp.as_file().set_len(0x1000).unwrap();
        let io: Arc<dyn RegisterIo> = Arc::new(ResourceFile::open(tmp.path()).unwrap());
        let low = RegisterWindow::new(io.clone(), 0);
        let high = RegisterWindow::new(io, 0x800);

        high.write(0x4, 7).unwrap();
        assert_that!(low.read(0x804).unwrap(), eq(7));
        assert_that!(high.base(), eq(0x800));
    }
}
