//! Instance configuration and the directives that build it.

use std::path::{Path, PathBuf};

use qvm_core::{HostPlatform, InstanceId, MacAddress, Size};
use serde::{Deserialize, Serialize};

/// Directory that socket paths are derived under unless overridden.
pub const DEFAULT_RUNTIME_DIR: &str = "/tmp";

/// Default network device driver.
pub const DEFAULT_NIC_DRIVER: &str = "virtio-net";

/// Bridged host networking (macOS `vmnet-bridged`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgedMode {
    /// Host interface to bridge onto, e.g. `en0`.
    pub interface: Option<String>,
}

/// NAT networking on a private subnet (macOS `vmnet-shared`).
///
/// Either all three fields are set or none are; QEMU picks the subnet when
/// none are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMode {
    pub start_address: Option<String>,
    pub end_address: Option<String>,
    pub subnet_mask: Option<String>,
}

/// Platform-specific network mode payload.
///
/// Platforms with mutually exclusive modes require exactly one field to be
/// set; tap networking ignores both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMode {
    pub bridged: Option<BridgedMode>,
    pub shared: Option<SharedMode>,
}

impl NetworkMode {
    /// Bridged mode on the given interface.
    #[must_use]
    pub fn bridged(interface: impl Into<String>) -> Self {
        Self {
            bridged: Some(BridgedMode { interface: Some(interface.into()) }),
            shared: None,
        }
    }

    /// Shared mode with an explicit subnet.
    #[must_use]
    pub fn shared(
        start_address: impl Into<String>,
        end_address: impl Into<String>,
        subnet_mask: impl Into<String>,
    ) -> Self {
        Self {
            bridged: None,
            shared: Some(SharedMode {
                start_address: Some(start_address.into()),
                end_address: Some(end_address.into()),
                subnet_mask: Some(subnet_mask.into()),
            }),
        }
    }

    /// Shared mode with the hypervisor's default subnet.
    #[must_use]
    pub fn shared_default() -> Self {
        Self { bridged: None, shared: Some(SharedMode::default()) }
    }

    /// Returns `true` if no mode payload is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bridged.is_none() && self.shared.is_none()
    }
}

/// Guest network interface description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    /// QEMU device model, e.g. `virtio-net`.
    pub driver: String,

    /// Guest MAC address. QEMU assigns one when absent.
    pub mac: Option<MacAddress>,

    /// Platform-specific mode payload.
    pub mode: NetworkMode,
}

impl Default for NetworkDescriptor {
    fn default() -> Self {
        Self {
            driver: DEFAULT_NIC_DRIVER.to_owned(),
            mac: None,
            mode: NetworkMode::default(),
        }
    }
}

/// First-boot cloud-init payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInitConfig {
    /// `user-data` document, usually starting with `#cloud-config`.
    pub user_data: String,

    /// Optional `network-config` document.
    pub network_config: Option<String>,
}

/// Control and guest-agent socket locations for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketPaths {
    /// QMP control socket.
    pub qmp: PathBuf,
    /// QEMU guest agent socket.
    pub qga: PathBuf,
}

impl SocketPaths {
    /// Derives `<dir>/<id>.sock` and `<dir>/qga-<id>.sock`.
    #[must_use]
    pub fn derive(runtime_dir: &Path, id: &InstanceId) -> Self {
        Self {
            qmp: runtime_dir.join(format!("{id}.sock")),
            qga: runtime_dir.join(format!("qga-{id}.sock")),
        }
    }
}

/// Full declarative description of one instance.
///
/// Built with [`InstanceConfig::new`] and refined with [`ConfigOption`]
/// directives. The identifier is fixed at construction because every
/// derived path depends on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct InstanceConfig {
    pub id: InstanceId,
    pub machine: String,
    pub accelerator: String,
    pub cpus: u32,
    pub memory: Size,
    pub disk: Size,
    pub image: PathBuf,
    pub network: NetworkDescriptor,
    pub cloud_init: CloudInitConfig,
    pub bios: Option<PathBuf>,

    /// Directory the default socket paths are derived under.
    pub runtime_dir: PathBuf,
    pub qmp_socket: Option<PathBuf>,
    pub qga_socket: Option<PathBuf>,

    /// Parent directory for ephemeral cloud-init directories. The system
    /// temp directory is used when unset.
    pub work_dir: Option<PathBuf>,
}

impl InstanceConfig {
    /// Creates a config with the documented defaults: machine `q35`,
    /// `virtio-net`, 1024 MB memory, 40960 MB disk, 1 CPU.
    ///
    /// The accelerator and image have no default and must be supplied.
    #[must_use]
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            machine: "q35".to_owned(),
            accelerator: String::new(),
            cpus: 1,
            memory: Size::Megabytes(1024),
            disk: Size::Megabytes(40 * 1024),
            image: PathBuf::new(),
            network: NetworkDescriptor::default(),
            cloud_init: CloudInitConfig::default(),
            bios: None,
            runtime_dir: PathBuf::from(DEFAULT_RUNTIME_DIR),
            qmp_socket: None,
            qga_socket: None,
            work_dir: None,
        }
    }

    /// Creates a config and applies `options` in order.
    #[must_use]
    pub fn with_options(id: InstanceId, options: impl IntoIterator<Item = ConfigOption>) -> Self {
        let mut config = Self::new(id);
        for option in options {
            config.apply(option);
        }
        config
    }

    /// Applies one directive. Later directives overwrite earlier ones.
    pub fn apply(&mut self, option: ConfigOption) {
        match option {
            ConfigOption::Machine(machine) => self.machine = machine,
            ConfigOption::Accelerator(accel) => self.accelerator = accel,
            ConfigOption::Cpus(cpus) => self.cpus = cpus,
            ConfigOption::Memory(size) => self.memory = size,
            ConfigOption::Disk(size) => self.disk = size,
            ConfigOption::Image(path) => self.image = path,
            ConfigOption::Network(network) => self.network = network,
            ConfigOption::Mac(mac) => self.network.mac = Some(mac),
            ConfigOption::NetworkMode(mode) => self.network.mode = mode,
            ConfigOption::CloudInit(cloud_init) => self.cloud_init = cloud_init,
            ConfigOption::UserData(user_data) => self.cloud_init.user_data = user_data,
            ConfigOption::Bios(path) => self.bios = Some(path),
            ConfigOption::RuntimeDir(dir) => self.runtime_dir = dir,
            ConfigOption::QmpSocket(path) => self.qmp_socket = Some(path),
            ConfigOption::QgaSocket(path) => self.qga_socket = Some(path),
            ConfigOption::WorkDir(dir) => self.work_dir = Some(dir),
        }
    }

    /// Chaining form of [`apply`](Self::apply).
    #[must_use]
    pub fn with(mut self, option: ConfigOption) -> Self {
        self.apply(option);
        self
    }

    /// Effective socket paths: explicit overrides, else derived from the id.
    #[must_use]
    pub fn socket_paths(&self) -> SocketPaths {
        let derived = SocketPaths::derive(&self.runtime_dir, &self.id);
        SocketPaths {
            qmp: self.qmp_socket.clone().unwrap_or(derived.qmp),
            qga: self.qga_socket.clone().unwrap_or(derived.qga),
        }
    }
}

/// A single field-setting directive for [`InstanceConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigOption {
    Machine(String),
    Accelerator(String),
    Cpus(u32),
    Memory(Size),
    Disk(Size),
    Image(PathBuf),
    /// Replaces the whole network descriptor.
    Network(NetworkDescriptor),
    Mac(MacAddress),
    NetworkMode(NetworkMode),
    /// Replaces both cloud-init payloads.
    CloudInit(CloudInitConfig),
    UserData(String),
    Bios(PathBuf),
    RuntimeDir(PathBuf),
    QmpSocket(PathBuf),
    QgaSocket(PathBuf),
    WorkDir(PathBuf),
}

impl ConfigOption {
    /// Machine, accelerator and firmware directives for `host`.
    #[must_use]
    pub fn host_defaults(host: &HostPlatform) -> Vec<Self> {
        let mut options = vec![
            Self::Machine(host.machine_type().to_owned()),
            Self::Accelerator(host.accelerator().to_owned()),
        ];
        if let Some(bios) = host.bios() {
            options.push(Self::Bios(PathBuf::from(bios)));
        }
        options
    }
}
