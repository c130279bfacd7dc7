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

//! Signature policy for container images.
//!
//! The cryptography itself lives behind [`SignatureVerifier`]. What this module owns is the
//! policy around it: which keyring a signature is checked against ([`SecurityLevel`]) and the
//! lifetime of the dedicated keyring, which is shared by every device in the process and torn
//! down when the last device releases it ([`KeyringService`]).

use crate::error::IcapError;
use log::{info, trace};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Name of the dedicated keyring that holds trusted container keys.
pub static DEDICATED_KEYRING_NAME: &str = ".xilinx_fpga_xclbin_keys";

/// How strictly container signatures are enforced.
///
/// * `None` - signatures are checked when present but a failure only logs a warning
/// * `Dedicated` - signatures are required and checked against the dedicated keyring
/// * `System` - signatures are required and checked against the system trusted keys
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    None,
    Dedicated,
    System,
}

impl SecurityLevel {
    pub fn as_u32(self) -> u32 {
        match self {
            SecurityLevel::None => 0,
            SecurityLevel::Dedicated => 1,
            SecurityLevel::System => 2,
        }
    }
}

impl TryFrom<u32> for SecurityLevel {
    type Error = IcapError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SecurityLevel::None),
            1 => Ok(SecurityLevel::Dedicated),
            2 => Ok(SecurityLevel::System),
            other => Err(IcapError::Argument(format!(
                "security level {other} is out of range 0..=2"
            ))),
        }
    }
}

/// A keyring of trusted public keys, as handed to the verifier.
#[derive(Debug)]
pub struct Keyring {
    name: String,
    keys: RwLock<Vec<Vec<u8>>>,
}

impl Keyring {
    fn new(name: &str) -> Self {
        info!("Creating keyring {name}");
        Keyring {
            name: name.to_string(),
            keys: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_key(&self, key: Vec<u8>) -> Result<(), IcapError> {
        let mut keys = self
            .keys
            .write()
            .map_err(|e| IcapError::Internal(format!("keyring lock poisoned: {e}")))?;
        keys.push(key);
        Ok(())
    }

    /// Runs `f` over the keys currently in the ring.
    pub fn with_keys<T>(&self, f: impl FnOnce(&[Vec<u8>]) -> T) -> Result<T, IcapError> {
        let keys = self
            .keys
            .read()
            .map_err(|e| IcapError::Internal(format!("keyring lock poisoned: {e}")))?;
        Ok(f(&keys))
    }
}

impl Drop for Keyring {
    fn drop(&mut self) {
        info!("Tearing down keyring {}", self.name);
    }
}

/// A reference to the shared keyring. The keyring lives as long as any handle does.
#[derive(Debug, Clone)]
pub struct KeyringHandle(Arc<Keyring>);

impl Deref for KeyringHandle {
    type Target = Keyring;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Process-wide owner of the dedicated keyring.
///
/// Created once in `main` and passed to every device. The first [`acquire`](Self::acquire)
/// creates the keyring, later calls share it, and it is dropped together with the last
/// [`KeyringHandle`].
#[derive(Debug)]
pub struct KeyringService {
    name: String,
    live: Mutex<Weak<Keyring>>,
}

impl Default for KeyringService {
    fn default() -> Self {
        KeyringService::new(DEDICATED_KEYRING_NAME)
    }
}

impl KeyringService {
    pub fn new(name: &str) -> Self {
        KeyringService {
            name: name.to_string(),
            live: Mutex::new(Weak::new()),
        }
    }

    pub fn acquire(&self) -> Result<KeyringHandle, IcapError> {
        let mut live = self
            .live
            .lock()
            .map_err(|e| IcapError::Internal(format!("keyring service lock poisoned: {e}")))?;
        if let Some(keyring) = live.upgrade() {
            trace!("Sharing keyring {}", keyring.name());
            return Ok(KeyringHandle(keyring));
        }
        let keyring = Arc::new(Keyring::new(&self.name));
        *live = Arc::downgrade(&keyring);
        Ok(KeyringHandle(keyring))
    }

    /// Number of live handles on the keyring.
    pub fn users(&self) -> usize {
        self.live.lock().map(|w| w.strong_count()).unwrap_or(0)
    }
}

/// Which trust anchor a signature is checked against.
#[derive(Debug, Clone, Copy)]
pub enum KeyringScope<'a> {
    Dedicated(&'a Keyring),
    System,
}

/// Cryptographic verification of a detached signature over `data`.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, data: &[u8], signature: &[u8], scope: KeyringScope<'_>)
    -> Result<(), String>;
}

/// Verifier used when no signature backend is configured. Every check fails.
#[derive(Debug, Default)]
pub struct UnavailableVerifier;

impl SignatureVerifier for UnavailableVerifier {
    fn verify(&self, _: &[u8], _: &[u8], _: KeyringScope<'_>) -> Result<(), String> {
        Err("no signature verifier is available".to_string())
    }
}

/// Everything [`Axlf::validate_signature`](crate::container::axlf::Axlf::validate_signature)
/// needs to decide on a container.
pub struct SignaturePolicy<'a> {
    pub level: SecurityLevel,
    pub verifier: &'a dyn SignatureVerifier,
    pub keyring: Option<&'a Keyring>,
}

impl SignaturePolicy<'_> {
    pub(crate) fn scope(&self) -> Result<KeyringScope<'_>, IcapError> {
        match self.level {
            SecurityLevel::System => Ok(KeyringScope::System),
            _ => self.keyring.map(KeyringScope::Dedicated).ok_or_else(|| {
                IcapError::SignatureRejected("dedicated keyring is not available".to_string())
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use rstest::*;

    #[gtest]
    fn keyring_lives_while_handles_exist() {
        let service = KeyringService::default();
        assert_that!(service.users(), eq(0));

        let first = service.acquire().unwrap();
        first.add_key(vec![1, 2, 3]).unwrap();
        let second = service.acquire().unwrap();
        assert_that!(service.users(), eq(2));
        assert_that!(second.with_keys(|k| k.len()).unwrap(), eq(1));

        drop(first);
        assert_that!(service.users(), eq(1));
        drop(second);
        assert_that!(service.users(), eq(0));

        let fresh = service.acquire().unwrap();
        assert_that!(fresh.with_keys(|k| k.len()).unwrap(), eq(0));
    }

    #[gtest]
    #[rstest]
    #[case::none(0, SecurityLevel::None)]
    #[case::dedicated(1, SecurityLevel::Dedicated)]
    #[case::system(2, SecurityLevel::System)]
    fn level_from_u32(#[case] raw: u32, #[case] expected: SecurityLevel) {
        let level = SecurityLevel::try_from(raw).unwrap();
        assert_that!(level, eq(expected));
        assert_that!(level.as_u32(), eq(raw));
    }

    #[gtest]
    fn level_out_of_range() {
        assert_that!(
            SecurityLevel::try_from(3),
            err(displays_as(contains_substring("out of range")))
        );
    }

    #[gtest]
    fn levels_are_ordered() {
        assert!(SecurityLevel::None < SecurityLevel::Dedicated);
        assert!(SecurityLevel::Dedicated < SecurityLevel::System);
    }
}
