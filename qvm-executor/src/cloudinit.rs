//! First-boot cloud-init (NoCloud) ISO builder.
//!
//! The ISO is a `cidata`-labelled volume holding `user-data`, `meta-data`
//! and optionally `network-config`. User data is merged with the settings
//! every instance needs to grow its root disk after a resize.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use qvm_core::{HostPlatform, InstanceId, Os};
use serde_yaml::{Mapping, Value};
use tokio::process::Command;

use crate::binary::which_binary;
use crate::config::CloudInitConfig;
use crate::ExecutorError;

/// First line of a merged user-data document.
pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config";

/// Volume label cloud-init's NoCloud datasource looks for.
pub const VOLUME_LABEL: &str = "cidata";

/// File name of the authored ISO inside the cloud-init directory.
pub const ISO_FILE_NAME: &str = "cidata.iso";

/// Reasons the user data could not be merged.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MergeError {
    /// The document is not valid YAML.
    #[error("invalid YAML provided: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The document parsed, but its top level is not a mapping.
    #[error("user data must be a YAML mapping")]
    NotAMapping,
}

/// Merge `resize_rootfs` and `growpart` defaults into a cloud-config document.
///
/// Keys already present are left untouched, including partially specified
/// `growpart` blocks. The user's document is kept verbatim (comments, quoting
/// and key order included) and only the missing keys are appended, so scalars
/// such as `'no'` or `"off"` keep the quotes YAML 1.1 readers rely on.
/// Merging the result again returns it unchanged.
///
/// # Errors
/// Returns [`MergeError`] if the document is not a YAML mapping.
pub fn merge_cloud_config(user_data: &str) -> Result<String, MergeError> {
    let body = document_body(user_data);
    let config = if body.is_empty() {
        Mapping::new()
    } else {
        match serde_yaml::from_str::<Value>(body)? {
            Value::Null => Mapping::new(),
            Value::Mapping(mapping) => mapping,
            _ => return Err(MergeError::NotAMapping),
        }
    };

    let missing = missing_defaults(&config);
    let mut merged = String::from(CLOUD_CONFIG_HEADER);
    merged.push('\n');
    if !body.is_empty() {
        merged.push_str(body);
        merged.push('\n');
    }
    if !missing.is_empty() {
        merged.push_str(&serde_yaml::to_string(&missing)?);
    }

    let mut expected = config;
    expected.extend(missing);
    if reparses_to(&merged, &expected) {
        return Ok(merged);
    }

    // Flow-style or multi-document input cannot take appended block keys.
    tracing::debug!("user data re-emitted, appended keys would not parse");
    let body = serde_yaml::to_string(&expected)?;
    Ok(format!("{CLOUD_CONFIG_HEADER}\n{body}"))
}

/// The document without its header line, leading blank lines or trailing
/// whitespace. Indentation of the first content line is kept.
fn document_body(user_data: &str) -> &str {
    let mut rest = user_data.trim_end();
    let mut header_seen = false;
    while !rest.is_empty() {
        let (line, tail) = rest.split_once('\n').unwrap_or((rest, ""));
        let line = line.trim();
        if line.is_empty() {
            rest = tail;
        } else if !header_seen && line == CLOUD_CONFIG_HEADER {
            header_seen = true;
            rest = tail;
        } else {
            break;
        }
    }
    rest
}

fn missing_defaults(config: &Mapping) -> Mapping {
    let mut missing = Mapping::new();
    if !config.contains_key("resize_rootfs") {
        missing.insert(Value::from("resize_rootfs"), Value::Bool(true));
    }
    if !config.contains_key("growpart") {
        let mut growpart = Mapping::new();
        growpart.insert(Value::from("mode"), Value::from("auto"));
        growpart.insert(
            Value::from("devices"),
            Value::Sequence(vec![Value::from("/")]),
        );
        missing.insert(Value::from("growpart"), Value::Mapping(growpart));
    }
    missing
}

fn reparses_to(merged: &str, expected: &Mapping) -> bool {
    match serde_yaml::from_str::<Value>(merged) {
        Ok(Value::Mapping(mapping)) => mapping == *expected,
        Ok(Value::Null) => expected.is_empty(),
        _ => false,
    }
}

/// Render the NoCloud `meta-data` document.
#[must_use]
pub fn meta_data(id: &InstanceId) -> String {
    format!("instance-id: {id}\nlocal-hostname: {id}\n")
}

/// Packs files into a `cidata` ISO.
#[async_trait]
pub trait IsoAuthor: Send + Sync {
    /// Write an ISO at `iso_path` containing `files`.
    ///
    /// # Errors
    /// Returns [`ExecutorError::BinaryNotFound`] if the tool is missing and
    /// [`ExecutorError::ImageBuild`] if it exits unsuccessfully.
    async fn author(&self, iso_path: &Path, files: &[PathBuf]) -> Result<(), ExecutorError>;
}

/// The ISO authoring binaries available on supported hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum IsoTool {
    /// `genisoimage` (Linux).
    Genisoimage,
    /// `mkisofs` (macOS, via cdrtools).
    Mkisofs,
}

impl IsoTool {
    /// The tool normally installed on `host`.
    #[must_use]
    pub fn for_platform(host: &HostPlatform) -> Self {
        match host.os {
            Os::Linux => Self::Genisoimage,
            Os::Macos => Self::Mkisofs,
        }
    }

    /// Binary name.
    #[must_use]
    pub const fn binary(self) -> &'static str {
        match self {
            Self::Genisoimage => "genisoimage",
            Self::Mkisofs => "mkisofs",
        }
    }

    /// Full argument list for authoring `iso_path` from `files`.
    #[must_use]
    pub fn command_args(self, iso_path: &Path, files: &[PathBuf]) -> Vec<OsString> {
        let flags: &[&str] = match self {
            Self::Genisoimage => &["-V", VOLUME_LABEL, "-r", "-J"],
            Self::Mkisofs => &["-volid", VOLUME_LABEL, "-joliet", "-rock"],
        };
        let mut args = vec![OsString::from("-output"), iso_path.as_os_str().to_owned()];
        args.extend(flags.iter().map(OsString::from));
        args.extend(files.iter().map(|f| f.as_os_str().to_owned()));
        args
    }
}

#[async_trait]
impl IsoAuthor for IsoTool {
    async fn author(&self, iso_path: &Path, files: &[PathBuf]) -> Result<(), ExecutorError> {
        let binary = which_binary(Path::new(self.binary()))?;
        let output = Command::new(&binary)
            .args(self.command_args(iso_path, files))
            .output()
            .await
            .map_err(|e| ExecutorError::ImageBuild {
                tool: self.binary().to_owned(),
                diagnostic: format!("exec {}: {e}", binary.display()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            return Err(ExecutorError::ImageBuild {
                tool: self.binary().to_owned(),
                diagnostic: if stderr.is_empty() {
                    output.status.to_string()
                } else {
                    format!("{}: {stderr}", output.status)
                },
            });
        }
        Ok(())
    }
}

/// Writes the cloud-init documents and packs them into an ISO.
#[derive(Clone)]
pub struct CloudInitBuilder {
    author: Arc<dyn IsoAuthor>,
}

impl std::fmt::Debug for CloudInitBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudInitBuilder").finish_non_exhaustive()
    }
}

impl CloudInitBuilder {
    /// Create a builder using the given authoring tool.
    #[must_use]
    pub fn new(author: Arc<dyn IsoAuthor>) -> Self {
        Self { author }
    }

    /// Create a builder using the host's usual ISO tool.
    #[must_use]
    pub fn for_platform(host: &HostPlatform) -> Self {
        Self::new(Arc::new(IsoTool::for_platform(host)))
    }

    /// Build `<dir>/cidata.iso` for instance `id` and return its path.
    ///
    /// A user-data merge failure is logged and the original document is used
    /// instead.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] if a document cannot be written, or the
    /// authoring tool's error.
    pub async fn build(
        &self,
        dir: &Path,
        id: &InstanceId,
        cloud_init: &CloudInitConfig,
    ) -> Result<PathBuf, ExecutorError> {
        let user_data = match merge_cloud_config(&cloud_init.user_data) {
            Ok(merged) => merged,
            Err(e) => {
                tracing::warn!(instance = %id, error = %e, "failed to merge cloud-init config, using the original user data");
                cloud_init.user_data.clone()
            }
        };

        let user_data_path = dir.join("user-data");
        tokio::fs::write(&user_data_path, user_data).await?;

        let meta_data_path = dir.join("meta-data");
        tokio::fs::write(&meta_data_path, meta_data(id)).await?;

        let mut files = vec![user_data_path, meta_data_path];
        if let Some(network_config) = &cloud_init.network_config {
            let network_config_path = dir.join("network-config");
            tokio::fs::write(&network_config_path, network_config).await?;
            files.push(network_config_path);
        }

        let iso_path = dir.join(ISO_FILE_NAME);
        self.author.author(&iso_path, &files).await?;

        tracing::debug!(instance = %id, iso = %iso_path.display(), "cloud-init ISO created");

        Ok(iso_path)
    }
}
