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

//! Error Wrapping File System I/O Helpers
//!
//! This module provides wrappers around the file operations the daemon needs, with automatic
//! conversion to `IcapError` types. All functions include trace logging and carry the file path
//! in their errors.
//!
//! Includes: whole-file reads of configuration and container images, and positional 32-bit
//! register accesses on a PCI resource file.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use icapd::system_io::{fs_open_register_file, fs_read_u32_at};
//! # use std::path::Path;
//!
//! # fn example() -> Result<(), icapd::error::IcapError> {
//! let path = Path::new("/sys/bus/pci/devices/0000:65:00.0/resource0");
//! let bar = fs_open_register_file(path)?;
//! let status = fs_read_u32_at(&bar, path, 0x2_0110)?;
//! # Ok(())
//! # }
//! ```

use crate::error::IcapError;
use log::trace;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Read the contents of a file to a String.
///
/// # Arguments
///
/// * `file_path` - Path to the file to read
///
/// # Returns: `Result<String, IcapError>`
/// * `Ok(String)` - The complete contents of the file
/// * `Err(IcapError::IORead)` - If the file cannot be read (doesn't exist, permissions, etc.)
pub fn fs_read(file_path: &Path) -> Result<String, IcapError> {
    trace!("Attempting to read from {file_path:?}");
    let mut buf: String = String::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_string(&mut buf));

    match result {
        Ok(_) => {
            trace!("Reading done");
            Ok(buf)
        }
        Err(e) => Err(IcapError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

/// Read the contents of a file as raw bytes.
///
/// # Arguments
///
/// * `file_path` - Path to the file to read, typically an `.xclbin` container
///
/// # Returns: `Result<Vec<u8>, IcapError>`
/// * `Ok(Vec<u8>)` - The complete contents of the file
/// * `Err(IcapError::IORead)` - If the file cannot be read
///
/// # Examples
///
/// ```rust,no_run
/// # use icapd::system_io::fs_read_bytes;
/// # use std::path::Path;
///
/// # fn example() -> Result<(), icapd::error::IcapError> {
/// let image = fs_read_bytes(Path::new("/opt/xilinx/firmware/verify.xclbin"))?;
/// println!("{} bytes", image.len());
/// # Ok(())
/// # }
/// ```
pub fn fs_read_bytes(file_path: &Path) -> Result<Vec<u8>, IcapError> {
    trace!("Attempting to read bytes from {file_path:?}");
    let mut buf = Vec::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_end(&mut buf));

    match result {
        Ok(n) => {
            trace!("Read {n} bytes");
            Ok(buf)
        }
        Err(e) => Err(IcapError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

/// Open a register resource file for positional reads and writes.
///
/// # Returns: `Result<File, IcapError>`
/// * `Ok(File)` - Handle opened read-write
/// * `Err(IcapError::IORead)` - If the file cannot be opened
pub fn fs_open_register_file(file_path: &Path) -> Result<File, IcapError> {
    trace!("Opening register file {file_path:?}");
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(file_path)
        .map_err(|e| IcapError::IORead {
            file: file_path.into(),
            e,
        })
}

/// Read a little-endian 32-bit register at byte `offset` of an open resource file.
///
/// # Arguments
///
/// * `file` - Handle from [`fs_open_register_file`]
/// * `file_path` - Path of `file`, used in errors
/// * `offset` - Byte offset of the register
///
/// # Returns: `Result<u32, IcapError>`
/// * `Ok(u32)` - Register value
/// * `Err(IcapError::IORead)` - If the positional read fails or is short
pub fn fs_read_u32_at(file: &File, file_path: &Path, offset: u64) -> Result<u32, IcapError> {
    let mut buf = [0u8; 4];
    file.read_exact_at(&mut buf, offset)
        .map_err(|e| IcapError::IORead {
            file: file_path.into(),
            e,
        })?;
    let value = u32::from_le_bytes(buf);
    trace!("{file_path:?}[{offset:#x}] -> {value:#010x}");
    Ok(value)
}

/// Write a little-endian 32-bit register at byte `offset` of an open resource file.
///
/// # Returns: `Result<(), IcapError>`
/// * `Ok(())` - Register written
/// * `Err(IcapError::IOWrite)` - If the positional write fails
pub fn fs_write_u32_at(
    file: &File,
    file_path: &Path,
    offset: u64,
    value: u32,
) -> Result<(), IcapError> {
    trace!("{file_path:?}[{offset:#x}] <- {value:#010x}");
    file.write_all_at(&value.to_le_bytes(), offset)
        .map_err(|e| IcapError::IOWrite {
            file: file_path.into(),
            e,
        })
}
