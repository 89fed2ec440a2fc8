//! QEMU instance orchestration for qvm.
//!
//! Compiles declarative instance configurations into `qemu-system-*`
//! invocations, builds the cloud-init seed ISO, and supervises the resulting
//! processes through start, attach, stop and cleanup.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod args;
pub mod binary;
pub mod cloudinit;
pub mod config;
pub mod disk;
pub mod error;
pub mod handle;
pub mod network;
pub mod supervisor;

pub use args::{ArgsCompiler, CompiledArgs};
pub use binary::which_binary;
pub use cloudinit::{merge_cloud_config, CloudInitBuilder, IsoAuthor, IsoTool, MergeError};
pub use config::{
    BridgedMode, CloudInitConfig, ConfigOption, InstanceConfig, NetworkDescriptor, NetworkMode,
    SharedMode, SocketPaths,
};
pub use disk::{DiskImageTool, ImageInfo, QemuImg};
pub use error::ExecutorError;
pub use handle::{stop_pid, Completion, InstanceHandle, InstanceState};
pub use network::{NetworkStrategy, TapNetwork, VmnetNetwork};
pub use supervisor::{StdioMode, Supervisor};
