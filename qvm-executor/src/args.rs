//! Compiles an [`InstanceConfig`] into the hypervisor's argument vector.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use qvm_core::units::{bytes_to_mb, format_bytes, format_mb, mb_to_bytes};
use qvm_core::HostPlatform;

use crate::cloudinit::CloudInitBuilder;
use crate::config::InstanceConfig;
use crate::disk::{DiskImageTool, QemuImg};
use crate::network::{self, NetworkStrategy};
use crate::ExecutorError;

/// Prefix of the ephemeral cloud-init directory.
pub const CLOUD_INIT_DIR_PREFIX: &str = "cloudinit-";

/// A compiled invocation plus the ephemeral directory that backs it.
///
/// The caller owns `cloud_init_dir` and must remove it once the hypervisor
/// no longer needs the ISO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArgs {
    pub args: Vec<String>,
    pub cloud_init_dir: PathBuf,
}

impl CompiledArgs {
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn into_parts(self) -> (Vec<String>, PathBuf) {
        (self.args, self.cloud_init_dir)
    }
}

/// Turns configurations into argument vectors.
///
/// The disk tool, network strategy and cloud-init builder are injected so
/// compilation can be exercised without `qemu-img` or an ISO tool.
pub struct ArgsCompiler {
    disk: Arc<dyn DiskImageTool>,
    network: Box<dyn NetworkStrategy>,
    cloud_init: CloudInitBuilder,
}

impl std::fmt::Debug for ArgsCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgsCompiler")
            .field("cloud_init", &self.cloud_init)
            .finish_non_exhaustive()
    }
}

impl ArgsCompiler {
    #[must_use]
    pub fn new(
        disk: Arc<dyn DiskImageTool>,
        network: Box<dyn NetworkStrategy>,
        cloud_init: CloudInitBuilder,
    ) -> Self {
        Self {
            disk,
            network,
            cloud_init,
        }
    }

    /// Compiler using `qemu-img`, the host's network strategy and its ISO tool.
    #[must_use]
    pub fn for_host(host: &HostPlatform) -> Self {
        Self::new(
            Arc::new(QemuImg::default()),
            network::for_platform(host),
            CloudInitBuilder::for_platform(host),
        )
    }

    /// Compile `config` into an ordered argument vector.
    ///
    /// Side effects, in order: the disk image may be grown to the requested
    /// size, and a fresh `cloudinit-*` directory holding the ISO is created.
    ///
    /// # Errors
    /// - [`ExecutorError::Config`] for invalid fields or network modes.
    /// - [`ExecutorError::DiskImage`] if a required resize fails.
    /// - [`ExecutorError::ImageBuild`] / [`ExecutorError::BinaryNotFound`] if
    ///   the cloud-init ISO cannot be authored.
    pub async fn compile(&self, config: &InstanceConfig) -> Result<CompiledArgs, ExecutorError> {
        let (memory_mb, disk_mb) = validate(config)?;
        let id = &config.id;

        self.ensure_disk_size(config, disk_mb).await?;

        let network_args = self.network.build_network_args(id, &config.network)?;

        let cloud_init_dir = create_cloud_init_dir(config.work_dir.as_deref()).await?;
        let iso_path = match self
            .cloud_init
            .build(&cloud_init_dir, id, &config.cloud_init)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_dir_all(&cloud_init_dir).await {
                    tracing::warn!(instance = %id, path = %cloud_init_dir.display(), error = %rm, "failed to remove cloud-init directory");
                }
                return Err(e);
            }
        };

        let sockets = config.socket_paths();
        let mut args: Vec<String> = vec![
            "-machine".into(),
            config.machine.clone(),
            "-accel".into(),
            config.accelerator.clone(),
            "-m".into(),
            format_mb(memory_mb),
            "-nographic".into(),
        ];
        args.extend(network_args);
        args.extend([
            "-qmp".into(),
            format!("unix:{},server,wait=off", sockets.qmp.display()),
            "-cpu".into(),
            "host".into(),
            "-smp".into(),
            config.cpus.to_string(),
            "-hda".into(),
            config.image.display().to_string(),
            "-device".into(),
            "virtio-serial".into(),
            "-chardev".into(),
            format!(
                "socket,path={},server=on,wait=off,id=charchannel0",
                sockets.qga.display()
            ),
            "-device".into(),
            "virtserialport,chardev=charchannel0,name=org.qemu.guest_agent.0".into(),
            "-drive".into(),
            format!("file={},format=raw,if=virtio", iso_path.display()),
        ]);
        if let Some(bios) = &config.bios {
            args.push("-bios".into());
            args.push(bios.display().to_string());
        }

        tracing::debug!(instance = %id, args = ?args, "compiled hypervisor arguments");

        Ok(CompiledArgs {
            args,
            cloud_init_dir,
        })
    }

    async fn ensure_disk_size(&self, config: &InstanceConfig, disk_mb: u64) -> Result<(), ExecutorError> {
        let id = &config.id;
        let image = &config.image;

        let info = match self.disk.info(image).await {
            Ok(info) => info,
            Err(e) => {
                tracing::error!(instance = %id, path = %image.display(), error = %e, "failed to read disk image info");
                return Ok(());
            }
        };

        let current_mb = bytes_to_mb(info.virtual_size_bytes);
        if current_mb >= disk_mb {
            return Ok(());
        }

        let target = mb_to_bytes(disk_mb);
        tracing::info!(
            instance = %id,
            path = %image.display(),
            from = %format_bytes(info.virtual_size_bytes),
            to = %format_bytes(target),
            "resizing disk image"
        );
        self.disk.resize(image, target).await
    }
}

fn validate(config: &InstanceConfig) -> Result<(u64, u64), ExecutorError> {
    if config.machine.is_empty() {
        return Err(ExecutorError::config("machine", "machine type must be set"));
    }
    if config.accelerator.is_empty() {
        return Err(ExecutorError::config("accelerator", "accelerator must be set"));
    }
    if config.image.as_os_str().is_empty() {
        return Err(ExecutorError::config("image", "disk image path must be set"));
    }
    if config.cpus == 0 {
        return Err(ExecutorError::config("cpus", "at least one CPU is required"));
    }
    let memory_mb = config
        .memory
        .to_mb()
        .map_err(|e| ExecutorError::config("memory", e.to_string()))?;
    let disk_mb = config
        .disk
        .to_mb()
        .map_err(|e| ExecutorError::config("disk", e.to_string()))?;
    Ok((memory_mb, disk_mb))
}

async fn create_cloud_init_dir(work_dir: Option<&Path>) -> Result<PathBuf, ExecutorError> {
    let parent = match work_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir).await?;
            dir.to_path_buf()
        }
        None => std::env::temp_dir(),
    };
    let dir = tempfile::Builder::new()
        .prefix(CLOUD_INIT_DIR_PREFIX)
        .tempdir_in(parent)?;
    Ok(dir.keep())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use qvm_core::units::MIB;
    use qvm_core::{Arch, InstanceId, Os};

    use super::*;
    use crate::cloudinit::IsoAuthor;
    use crate::config::{ConfigOption, NetworkMode};
    use crate::disk::ImageInfo;
    use crate::network::{TapNetwork, VmnetNetwork};

    /// Reports a fixed size and records resize requests.
    struct FakeDisk {
        virtual_size: Option<u64>,
        fail_resize: bool,
        resizes: Mutex<Vec<u64>>,
    }

    impl FakeDisk {
        fn sized(bytes: u64) -> Self {
            Self {
                virtual_size: Some(bytes),
                fail_resize: false,
                resizes: Mutex::new(Vec::new()),
            }
        }

        fn resizes(&self) -> Vec<u64> {
            self.resizes.lock().map(|r| r.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl DiskImageTool for FakeDisk {
        async fn info(&self, _image: &Path) -> Result<ImageInfo, ExecutorError> {
            match self.virtual_size {
                Some(virtual_size_bytes) => Ok(ImageInfo {
                    virtual_size_bytes,
                    actual_size_bytes: 0,
                }),
                None => Err(ExecutorError::DiskImage("no such image".to_owned())),
            }
        }

        async fn resize(&self, _image: &Path, size_bytes: u64) -> Result<(), ExecutorError> {
            if let Ok(mut r) = self.resizes.lock() {
                r.push(size_bytes);
            }
            if self.fail_resize {
                return Err(ExecutorError::DiskImage("resize refused".to_owned()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct EmptyIso {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IsoAuthor for EmptyIso {
        async fn author(&self, iso_path: &Path, _files: &[PathBuf]) -> Result<(), ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(iso_path, b"").await?;
            Ok(())
        }
    }

    struct BrokenIso;

    #[async_trait]
    impl IsoAuthor for BrokenIso {
        async fn author(&self, _iso_path: &Path, _files: &[PathBuf]) -> Result<(), ExecutorError> {
            Err(ExecutorError::ImageBuild {
                tool: "genisoimage".to_owned(),
                diagnostic: "exit status: 1".to_owned(),
            })
        }
    }

    fn work_dir() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        }
    }

    fn config(work: &Path) -> InstanceConfig {
        let id = match InstanceId::new("example") {
            Ok(id) => id,
            Err(e) => panic!("bad id: {e}"),
        };
        InstanceConfig::with_options(id, ConfigOption::host_defaults(&HostPlatform::new(Os::Linux, Arch::X86_64)))
            .with(ConfigOption::Image(PathBuf::from("/images/base.qcow2")))
            .with(ConfigOption::Cpus(2))
            .with(ConfigOption::Memory("2GiB".into()))
            .with(ConfigOption::Disk("10GiB".into()))
            .with(ConfigOption::WorkDir(work.to_path_buf()))
    }

    fn compiler(disk: Arc<FakeDisk>) -> ArgsCompiler {
        ArgsCompiler::new(
            disk,
            Box::new(TapNetwork),
            CloudInitBuilder::new(Arc::new(EmptyIso::default())),
        )
    }

    async fn compile(compiler: &ArgsCompiler, config: &InstanceConfig) -> CompiledArgs {
        match compiler.compile(config).await {
            Ok(c) => c,
            Err(e) => panic!("compile failed: {e}"),
        }
    }

    #[tokio::test]
    async fn compiled_args_follow_documented_order() {
        let work = work_dir();
        let disk = Arc::new(FakeDisk::sized(20 * 1024 * MIB));
        let compiled = compile(&compiler(disk), &config(work.path())).await;

        let iso = compiled.cloud_init_dir.join("cidata.iso");
        let expected: Vec<String> = vec![
            "-machine".into(),
            "q35".into(),
            "-accel".into(),
            "kvm".into(),
            "-m".into(),
            "2048M".into(),
            "-nographic".into(),
            "-device".into(),
            "virtio-net,netdev=example,id=example".into(),
            "-netdev".into(),
            "tap,id=example,ifname=example,script=no,downscript=no".into(),
            "-qmp".into(),
            "unix:/tmp/example.sock,server,wait=off".into(),
            "-cpu".into(),
            "host".into(),
            "-smp".into(),
            "2".into(),
            "-hda".into(),
            "/images/base.qcow2".into(),
            "-device".into(),
            "virtio-serial".into(),
            "-chardev".into(),
            "socket,path=/tmp/qga-example.sock,server=on,wait=off,id=charchannel0".into(),
            "-device".into(),
            "virtserialport,chardev=charchannel0,name=org.qemu.guest_agent.0".into(),
            "-drive".into(),
            format!("file={},format=raw,if=virtio", iso.display()),
        ];
        assert_eq!(compiled.as_slice(), expected.as_slice());
        assert!(compiled.cloud_init_dir.starts_with(work.path()));
        assert!(iso.exists(), "ISO must be written");
    }

    #[tokio::test]
    async fn smaller_image_is_resized_once_in_bytes() {
        let work = work_dir();
        let disk = Arc::new(FakeDisk::sized(2 * 1024 * MIB));
        compile(&compiler(disk.clone()), &config(work.path())).await;
        assert_eq!(disk.resizes(), vec![10 * 1024 * MIB]);
    }

    #[tokio::test]
    async fn large_enough_image_is_not_resized() {
        let work = work_dir();
        for size in [10 * 1024 * MIB, 10 * 1024 * MIB - 1, 64 * 1024 * MIB] {
            let disk = Arc::new(FakeDisk::sized(size));
            compile(&compiler(disk.clone()), &config(work.path())).await;
            assert!(disk.resizes().is_empty(), "{size} bytes must not trigger a resize");
        }
    }

    #[tokio::test]
    async fn info_failure_is_not_fatal() {
        let work = work_dir();
        let disk = Arc::new(FakeDisk {
            virtual_size: None,
            fail_resize: false,
            resizes: Mutex::new(Vec::new()),
        });
        compile(&compiler(disk.clone()), &config(work.path())).await;
        assert!(disk.resizes().is_empty());
    }

    #[tokio::test]
    async fn resize_failure_is_fatal() {
        let work = work_dir();
        let disk = Arc::new(FakeDisk {
            virtual_size: Some(MIB),
            fail_resize: true,
            resizes: Mutex::new(Vec::new()),
        });
        let result = compiler(disk).compile(&config(work.path())).await;
        assert!(matches!(result, Err(ExecutorError::DiskImage(_))));
    }

    #[tokio::test]
    async fn repeated_compiles_keep_the_same_order() {
        let work = work_dir();
        let compiler = compiler(Arc::new(FakeDisk::sized(64 * 1024 * MIB)));
        let config = config(work.path());

        let first = compile(&compiler, &config).await;
        let second = compile(&compiler, &config).await;
        assert_ne!(first.cloud_init_dir, second.cloud_init_dir, "each compile gets its own directory");

        let strip_iso = |c: &CompiledArgs| c.args[..c.args.len() - 1].to_vec();
        assert_eq!(strip_iso(&first), strip_iso(&second));
    }

    #[tokio::test]
    async fn bios_is_appended_only_when_set() {
        let work = work_dir();
        let compiler = compiler(Arc::new(FakeDisk::sized(64 * 1024 * MIB)));

        let without = compile(&compiler, &config(work.path())).await;
        assert!(!without.args.contains(&"-bios".to_owned()));

        let with_bios = config(work.path()).with(ConfigOption::Bios(PathBuf::from("edk2-aarch64-code.fd")));
        let with = compile(&compiler, &with_bios).await;
        let tail = &with.args[with.args.len() - 2..];
        assert_eq!(tail, ["-bios", "edk2-aarch64-code.fd"]);
    }

    #[tokio::test]
    async fn malformed_sizes_name_their_field() {
        let work = work_dir();
        let compiler = compiler(Arc::new(FakeDisk::sized(64 * 1024 * MIB)));

        let bad_memory = config(work.path()).with(ConfigOption::Memory("lots".into()));
        assert!(matches!(
            compiler.compile(&bad_memory).await,
            Err(ExecutorError::Config { field: "memory", .. })
        ));

        let bad_disk = config(work.path()).with(ConfigOption::Disk("10 parsecs".into()));
        assert!(matches!(
            compiler.compile(&bad_disk).await,
            Err(ExecutorError::Config { field: "disk", .. })
        ));
    }

    #[tokio::test]
    async fn missing_required_fields_are_rejected() {
        let work = work_dir();
        let compiler = compiler(Arc::new(FakeDisk::sized(64 * 1024 * MIB)));

        let cases = [
            (ConfigOption::Image(PathBuf::new()), "image"),
            (ConfigOption::Accelerator(String::new()), "accelerator"),
            (ConfigOption::Machine(String::new()), "machine"),
            (ConfigOption::Cpus(0), "cpus"),
        ];
        for (option, expected) in cases {
            let config = config(work.path()).with(option);
            match compiler.compile(&config).await {
                Err(ExecutorError::Config { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected config error on {expected}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn vmnet_without_mode_fails_before_iso_is_built() {
        let work = work_dir();
        let iso = Arc::new(EmptyIso::default());
        let compiler = ArgsCompiler::new(
            Arc::new(FakeDisk::sized(64 * 1024 * MIB)),
            Box::new(VmnetNetwork),
            CloudInitBuilder::new(iso.clone()),
        );

        let result = compiler.compile(&config(work.path())).await;
        assert!(matches!(result, Err(ExecutorError::Config { field: "network.mode", .. })));
        assert_eq!(iso.calls.load(Ordering::SeqCst), 0);

        let shared = config(work.path()).with(ConfigOption::NetworkMode(NetworkMode::shared_default()));
        let compiled = compile(&compiler, &shared).await;
        assert!(compiled.args.contains(&"vmnet-shared,id=example".to_owned()));
    }

    #[tokio::test]
    async fn failed_iso_build_removes_the_directory() {
        let work = work_dir();
        let compiler = ArgsCompiler::new(
            Arc::new(FakeDisk::sized(64 * 1024 * MIB)),
            Box::new(TapNetwork),
            CloudInitBuilder::new(Arc::new(BrokenIso)),
        );

        let result = compiler.compile(&config(work.path())).await;
        assert!(matches!(result, Err(ExecutorError::ImageBuild { .. })));

        let leftovers = std::fs::read_dir(work.path()).map(Iterator::count).unwrap_or(usize::MAX);
        assert_eq!(leftovers, 0, "cloud-init directory must be removed on failure");
    }
}
