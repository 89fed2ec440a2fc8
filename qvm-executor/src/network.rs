//! Network device argument generation.
//!
//! Each host platform has one [`NetworkStrategy`]. Linux uses a tap device
//! named after the instance; macOS uses vmnet in either bridged or shared
//! mode, chosen by which [`NetworkMode`] payload is populated.

use qvm_core::{HostPlatform, InstanceId, Os};

use crate::config::{BridgedMode, NetworkDescriptor, SharedMode};
use crate::ExecutorError;

/// Produces the `-device` / `-netdev` flag pair for one instance.
pub trait NetworkStrategy: Send + Sync {
    /// Build the four network arguments: `-device <nic> -netdev <backend>`.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Config`] if the descriptor's mode payload is
    /// missing, ambiguous or incomplete for this platform.
    fn build_network_args(
        &self,
        id: &InstanceId,
        network: &NetworkDescriptor,
    ) -> Result<Vec<String>, ExecutorError>;
}

/// Strategy for the given host.
#[must_use]
pub fn for_platform(host: &HostPlatform) -> Box<dyn NetworkStrategy> {
    match host.os {
        Os::Linux => Box::new(TapNetwork),
        Os::Macos => Box::new(VmnetNetwork),
    }
}

fn device_arg(id: &InstanceId, network: &NetworkDescriptor) -> String {
    match network.mac {
        Some(mac) => format!("{},netdev={id},mac={mac}", network.driver),
        None => format!("{},netdev={id}", network.driver),
    }
}

/// Linux tap networking: the tap interface is named after the instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct TapNetwork;

impl NetworkStrategy for TapNetwork {
    fn build_network_args(
        &self,
        id: &InstanceId,
        network: &NetworkDescriptor,
    ) -> Result<Vec<String>, ExecutorError> {
        if !network.mode.is_empty() {
            tracing::warn!(instance = %id, "vmnet mode payload has no effect with tap networking");
        }
        Ok(vec![
            "-device".to_owned(),
            format!("{},id={id}", device_arg(id, network)),
            "-netdev".to_owned(),
            format!("tap,id={id},ifname={id},script=no,downscript=no"),
        ])
    }
}

/// macOS vmnet networking, bridged or shared.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmnetNetwork;

impl VmnetNetwork {
    fn bridged_netdev(id: &InstanceId, bridged: &BridgedMode) -> Result<String, ExecutorError> {
        match bridged.interface.as_deref().filter(|iface| !iface.is_empty()) {
            Some(iface) => Ok(format!("vmnet-bridged,id={id},ifname={iface}")),
            None => Err(ExecutorError::config(
                "network.mode.bridged.interface",
                "vmnet-bridged requires an interface name",
            )),
        }
    }

    fn shared_netdev(id: &InstanceId, shared: &SharedMode) -> Result<String, ExecutorError> {
        let set = |field: &Option<String>| field.clone().filter(|value| !value.is_empty());
        match (
            set(&shared.start_address),
            set(&shared.end_address),
            set(&shared.subnet_mask),
        ) {
            (None, None, None) => Ok(format!("vmnet-shared,id={id}")),
            (Some(start), Some(end), Some(mask)) => Ok(format!(
                "vmnet-shared,id={id},start-address={start},end-address={end},subnet-mask={mask}"
            )),
            _ => Err(ExecutorError::config(
                "network.mode.shared",
                "start address, end address and subnet mask must be set together or all left empty",
            )),
        }
    }
}

impl NetworkStrategy for VmnetNetwork {
    fn build_network_args(
        &self,
        id: &InstanceId,
        network: &NetworkDescriptor,
    ) -> Result<Vec<String>, ExecutorError> {
        let netdev = match (&network.mode.bridged, &network.mode.shared) {
            (Some(bridged), None) => Self::bridged_netdev(id, bridged)?,
            (None, Some(shared)) => Self::shared_netdev(id, shared)?,
            (Some(_), Some(_)) => {
                return Err(ExecutorError::config(
                    "network.mode",
                    "bridged and shared modes are mutually exclusive",
                ))
            }
            (None, None) => {
                return Err(ExecutorError::config(
                    "network.mode",
                    "one of bridged or shared mode must be set",
                ))
            }
        };
        Ok(vec![
            "-device".to_owned(),
            device_arg(id, network),
            "-netdev".to_owned(),
            netdev,
        ])
    }
}
