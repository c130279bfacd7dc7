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

pub mod control_interface;
pub mod peer_interface;
pub mod status_interface;

use crate::config::{
    BusKind, CONTROL_OBJECT_PATH, DaemonConfig, PEER_OBJECT_PATH, STATUS_OBJECT_PATH,
};
use crate::container::sections::MAX_CLOCKS;
use crate::container::xuid::Xuid;
use crate::error::IcapError;
use crate::lifecycle::Icap;
use crate::lifecycle::notify::ExecEvent;
use control_interface::ControlInterface;
use log::{error, info, trace};
use peer_interface::PeerInterface;
use status_interface::StatusInterface;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use zbus::{Connection, connection, fdo};

/// Run `op` on a blocking thread. Device operations sleep and poll, and a peer round trip
/// blocks on the runtime, so none of them may run on an async worker.
pub(crate) async fn run_blocking<T, F>(icap: &Arc<Icap>, op: F) -> Result<T, fdo::Error>
where
    T: Send + 'static,
    F: FnOnce(&Icap) -> Result<T, IcapError> + Send + 'static,
{
    let icap = icap.clone();
    let result = tokio::task::spawn_blocking(move || op(&icap))
        .await
        .map_err(|e| IcapError::Internal(format!("device task failed: {e}")))?;
    Ok(result?)
}

/// Parse a uuid argument; an empty string means none.
pub fn parse_uuid(uuid: &str) -> Result<Option<Xuid>, IcapError> {
    if uuid.trim().is_empty() {
        return Ok(None);
    }
    uuid.parse().map(Some)
}

/// Clock frequencies from a DBus argument, in generator order. Missing trailing clocks are
/// left unchanged.
pub fn parse_frequencies(freqs: &[u16]) -> Result<[u16; MAX_CLOCKS], IcapError> {
    if freqs.len() > MAX_CLOCKS {
        return Err(IcapError::Argument(format!(
            "{} frequencies given, at most {MAX_CLOCKS} clocks exist",
            freqs.len()
        )));
    }
    let mut out = [0; MAX_CLOCKS];
    out[..freqs.len()].copy_from_slice(freqs);
    Ok(out)
}

/// Register the interfaces of `icap` on the configured bus and start forwarding `events` as
/// `ImageEvent` signals. The peer interface is only served by a privileged device.
///
/// # Returns: `Result<Connection, zbus::Error>`
/// * `Ok(Connection)` - serving; requests are answered for as long as it is kept alive
/// * `Err(zbus::Error)` - the bus is unavailable or the name is taken
pub async fn serve(
    config: &DaemonConfig,
    icap: Arc<Icap>,
    mut events: UnboundedReceiver<ExecEvent>,
) -> Result<Connection, zbus::Error> {
    let builder = match config.dbus.bus {
        BusKind::System => connection::Builder::system()?,
        BusKind::Session => connection::Builder::session()?,
    };
    let mut builder = builder
        .name(config.dbus.service_name.as_str())?
        .serve_at(CONTROL_OBJECT_PATH, ControlInterface::new(icap.clone()))?
        .serve_at(STATUS_OBJECT_PATH, StatusInterface::new(icap.clone()))?;
    if icap.privileged()? {
        builder = builder.serve_at(PEER_OBJECT_PATH, PeerInterface::new(icap.clone()))?;
    }
    let conn = builder.build().await?;

    let status = conn
        .object_server()
        .interface::<_, StatusInterface>(STATUS_OBJECT_PATH)
        .await?;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            trace!("Emitting ImageEvent {event}");
            let uuid = event.uuid();
            if let Err(e) = StatusInterface::image_event(
                status.signal_emitter(),
                &event.to_string(),
                &uuid,
            )
            .await
            {
                error!("Failed to emit ImageEvent {event}: {e}");
            }
        }
        info!("Image event channel closed");
    });

    info!("Started {} dbus service", config.dbus.service_name);
    Ok(conn)
}

impl From<IcapError> for zbus::Error {
    fn from(err: IcapError) -> Self {
        zbus::Error::Failure(err.to_string())
    }
}

#[cfg(test)]
mod test_arguments {
    use super::*;
    use crate::hardware::axi_gate::GateGeneration;
    use crate::hardware::simulated::{NoopSleeper, SimulatedDevice};
    use crate::lifecycle::IcapBuilder;
    use crate::lifecycle::hardware_owner::HardwareOwner;
    use googletest::prelude::*;
    use rstest::*;

    fn simulated_icap() -> Arc<Icap> {
        let device = Arc::new(SimulatedDevice::default());
        let owner = HardwareOwner::new(
            device.clone(),
            &device.layout(),
            GateGeneration::Legacy,
            Arc::new(NoopSleeper),
        )
        .unwrap();
        Arc::new(IcapBuilder::new(owner).build())
    }

    #[gtest]
    #[tokio::test]
    async fn device_work_runs_on_a_blocking_thread() {
        let icap = simulated_icap();
        let idcode = run_blocking(&icap, |icap| icap.idcode()).await;
        assert_that!(idcode, ok(eq(&0x04b3_1093)));
    }

    #[gtest]
    #[tokio::test]
    async fn device_errors_become_dbus_errors() {
        let icap = simulated_icap();
        let other = Xuid::from_bytes([1; 16]);
        let unlocked = run_blocking(&icap, move |icap| icap.unlock(Some(&other))).await;
        assert_that!(
            unlocked,
            err(displays_as(contains_substring("IcapError::IdentityMismatch")))
        );

        let ttl = run_blocking(&icap, |icap| icap.set_cache_expiry(3)).await;
        assert!(matches!(ttl, Err(fdo::Error::InvalidArgs(_))));
    }

    #[gtest]
    #[rstest]
    #[case::none(&[], [0, 0, 0, 0])]
    #[case::data_and_kernel(&[250, 400], [250, 400, 0, 0])]
    #[case::all(&[1, 2, 3, 4], [1, 2, 3, 4])]
    fn frequencies_are_padded(#[case] freqs: &[u16], #[case] expected: [u16; MAX_CLOCKS]) {
        assert_that!(parse_frequencies(freqs), ok(eq(&expected)));
    }

    #[gtest]
    fn too_many_frequencies_are_rejected() {
        assert_that!(
            parse_frequencies(&[1, 2, 3, 4, 5]),
            err(displays_as(contains_substring("IcapError::Argument")))
        );
    }

    #[gtest]
    #[rstest]
    #[case::empty("", None)]
    #[case::blank("  ", None)]
    #[case::dashed(
        "0a0a0a0a-0a0a-0a0a-0a0a-0a0a0a0a0a0a",
        Some(Xuid::from_bytes([0x0a; 16]))
    )]
    fn uuids_are_parsed(#[case] text: &str, #[case] expected: Option<Xuid>) {
        assert_that!(parse_uuid(text), ok(eq(&expected)));
    }

    #[gtest]
    fn bad_uuid_is_an_argument_error() {
        assert_that!(
            parse_uuid("xyz"),
            err(displays_as(contains_substring("IcapError::Argument")))
        );
    }
}
