//! Host platform detection and the QEMU defaults that follow from it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// CPU architecture of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    /// 64-bit x86.
    X86_64,
    /// 64-bit ARM.
    Aarch64,
}

/// Host operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Os {
    /// Linux with KVM and tap networking.
    Linux,
    /// macOS with HVF and vmnet networking.
    Macos,
}

/// The (OS, architecture) pair the hypervisor runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct HostPlatform {
    pub os: Os,
    pub arch: Arch,
}

impl HostPlatform {
    /// Creates a platform description.
    #[must_use]
    pub const fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// Detects the platform this binary was compiled for.
    ///
    /// # Errors
    /// Returns [`CoreError::UnsupportedPlatform`] on anything other than
    /// Linux or macOS on x86_64 or aarch64.
    pub fn current() -> Result<Self, CoreError> {
        Self::from_names(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Maps Rust target names (`std::env::consts`) to a platform.
    ///
    /// # Errors
    /// Returns [`CoreError::UnsupportedPlatform`] for unknown names.
    pub fn from_names(os: &str, arch: &str) -> Result<Self, CoreError> {
        let unsupported = || CoreError::UnsupportedPlatform {
            os: os.to_owned(),
            arch: arch.to_owned(),
        };
        let os_kind = match os {
            "linux" => Os::Linux,
            "macos" => Os::Macos,
            _ => return Err(unsupported()),
        };
        let arch_kind = match arch {
            "x86_64" => Arch::X86_64,
            "aarch64" => Arch::Aarch64,
            _ => return Err(unsupported()),
        };
        Ok(Self::new(os_kind, arch_kind))
    }

    /// Name of the QEMU system emulator for this architecture.
    #[must_use]
    pub const fn qemu_binary(&self) -> &'static str {
        match self.arch {
            Arch::X86_64 => "qemu-system-x86_64",
            Arch::Aarch64 => "qemu-system-aarch64",
        }
    }

    /// Default `-machine` type.
    #[must_use]
    pub const fn machine_type(&self) -> &'static str {
        match self.arch {
            Arch::X86_64 => "q35",
            Arch::Aarch64 => "virt",
        }
    }

    /// Hardware accelerator for `-accel`.
    #[must_use]
    pub const fn accelerator(&self) -> &'static str {
        match self.os {
            Os::Linux => "kvm",
            Os::Macos => "hvf",
        }
    }

    /// Firmware image to pass as `-bios`, if the architecture needs one.
    #[must_use]
    pub const fn bios(&self) -> Option<&'static str> {
        match self.arch {
            Arch::X86_64 => None,
            Arch::Aarch64 => Some("edk2-aarch64-code.fd"),
        }
    }
}

impl fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let os = match self.os {
            Os::Linux => "linux",
            Os::Macos => "macos",
        };
        let arch = match self.arch {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        };
        write!(f, "{os}/{arch}")
    }
}
