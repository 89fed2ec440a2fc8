/// Errors produced by the `qvm-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A human-readable size string could not be parsed.
    #[error("invalid size '{input}': {reason}")]
    InvalidSize { input: String, reason: String },

    /// An instance identifier is empty or contains characters that cannot
    /// appear in file names or QEMU option strings.
    #[error("invalid instance id '{id}': {reason}")]
    InvalidInstanceId { id: String, reason: String },

    /// A MAC address string is not six colon-separated hex octets.
    #[error("invalid MAC address '{input}'")]
    InvalidMacAddress { input: String },

    /// The host architecture or operating system has no QEMU mapping.
    #[error("unsupported platform {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },
}
