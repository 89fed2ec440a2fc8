//! Core value types for the qvm QEMU instance supervisor.
//!
//! Defines the identifiers, sizes and host-platform facts shared by the
//! argument compiler, the cloud-init builder and the process supervisor.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod host;
pub mod id;
pub mod units;

pub use error::CoreError;
pub use host::{Arch, HostPlatform, Os};
pub use id::{InstanceId, MacAddress};
pub use units::Size;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_accepts_path_safe_names() {
        for id in ["example", "vm-1", "web_02", "node.a", "A1"] {
            assert!(InstanceId::new(id).is_ok(), "{id:?} must be accepted");
        }
    }

    #[test]
    fn instance_id_rejects_unsafe_names() {
        for id in ["", "../etc", "a/b", "vm,id=x", "has space", "-flag", ".hidden", "x=y", "qga-web"] {
            assert!(
                matches!(InstanceId::new(id), Err(CoreError::InvalidInstanceId { .. })),
                "{id:?} must be rejected"
            );
        }
    }

    #[test]
    fn instance_id_display_is_the_raw_string() {
        let id = match InstanceId::new("example") {
            Ok(id) => id,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(id.to_string(), "example");
        assert_eq!(id.as_str(), "example");
    }

    #[test]
    fn instance_id_deserialization_validates() {
        let ok: Result<InstanceId, _> = serde_json::from_str("\"vm-1\"");
        assert!(ok.is_ok(), "valid id must deserialize");
        let bad: Result<InstanceId, _> = serde_json::from_str("\"a/b\"");
        assert!(bad.is_err(), "invalid id must fail to deserialize");
    }

    #[test]
    fn mac_address_parse_and_display_agree() {
        let mac: MacAddress = match "52:54:00:ab:cd:EF".parse() {
            Ok(m) => m,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(mac.octets(), [0x52, 0x54, 0x00, 0xab, 0xcd, 0xef]);
        assert_eq!(mac.to_string(), "52:54:00:ab:cd:ef");
    }

    #[test]
    fn mac_address_rejects_malformed_strings() {
        for input in ["", "52:54:00:ab:cd", "52:54:00:ab:cd:ef:01", "5254.00ab.cdef", "52:54:00:ab:cd:zz", "5:54:00:ab:cd:ef", "+2:54:00:ab:cd:ef"] {
            assert!(
                matches!(input.parse::<MacAddress>(), Err(CoreError::InvalidMacAddress { .. })),
                "{input:?} must be rejected"
            );
        }
    }

    #[test]
    fn random_mac_is_local_unicast() {
        for _ in 0..64 {
            let mac = MacAddress::random();
            assert!(mac.is_local(), "{mac} must be locally administered");
            assert!(mac.is_unicast(), "{mac} must be unicast");
        }
    }

    #[test]
    fn host_platform_maps_linux_x86_64() {
        let host = match HostPlatform::from_names("linux", "x86_64") {
            Ok(h) => h,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(host.qemu_binary(), "qemu-system-x86_64");
        assert_eq!(host.machine_type(), "q35");
        assert_eq!(host.accelerator(), "kvm");
        assert_eq!(host.bios(), None);
        assert_eq!(host.to_string(), "linux/x86_64");
    }

    #[test]
    fn host_platform_maps_macos_aarch64() {
        let host = match HostPlatform::from_names("macos", "aarch64") {
            Ok(h) => h,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(host.qemu_binary(), "qemu-system-aarch64");
        assert_eq!(host.machine_type(), "virt");
        assert_eq!(host.accelerator(), "hvf");
        assert_eq!(host.bios(), Some("edk2-aarch64-code.fd"));
    }

    #[test]
    fn host_platform_rejects_unknown_targets() {
        assert!(HostPlatform::from_names("windows", "x86_64").is_err());
        assert!(HostPlatform::from_names("linux", "riscv64").is_err());
    }
}
