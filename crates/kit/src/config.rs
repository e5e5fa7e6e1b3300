//! Configuration file parsing for `chainkit.toml`

use std::collections::HashSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{
    eyre::{bail, eyre, Context as _},
    Result,
};
use serde::{Deserialize, Serialize};

use crate::disk::{DiskHandle, DiskType};
use crate::qemu_img::ForceShare;

/// Configuration file looked up in the current directory
pub const CONFIG_FILE: &str = "chainkit.toml";

/// Configuration loaded from `chainkit.toml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// libvirt connection
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// qemu-img invocation
    #[serde(default)]
    pub qemu_img: QemuImgConfig,

    /// Disks that chain expressions can be resolved against
    #[serde(default, rename = "disk")]
    pub disks: Vec<DiskConfig>,
}

/// `[connection]` section
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectionConfig {
    /// Hypervisor connection URI
    pub uri: Option<String>,
}

/// `[qemu-img]` section
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct QemuImgConfig {
    /// When to pass `-U`
    #[serde(default)]
    pub force_share: ForceShare,
}

/// One `[[disk]]` entry
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DiskConfig {
    /// Name used to select the disk with `--disk`; defaults to the target
    pub name: Option<String>,

    /// Guest target device (e.g. `vda`)
    pub target: String,

    /// Disk type of the active layer
    #[serde(rename = "type", default = "default_disk_type")]
    pub disk_type: DiskType,

    /// Source of the disk before any snapshot
    pub base: String,

    /// External snapshots in creation order
    #[serde(default)]
    pub snapshots: Vec<String>,

    /// Image prepared for the `backing_file` token
    pub backing_file: Option<String>,

    /// Destination prepared for the `copy_file` token
    pub copy_file: Option<String>,
}

fn default_disk_type() -> DiskType {
    DiskType::File
}

impl DiskConfig {
    /// The name this disk is selected by
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.target)
    }

    /// Build the handle that chain expressions are resolved against
    pub fn to_handle(&self) -> DiskHandle {
        let mut handle = DiskHandle::new(&self.target, self.disk_type, &self.base);
        for snapshot in &self.snapshots {
            handle.push_snapshot(snapshot);
        }
        if let Some(path) = &self.backing_file {
            handle.set_backing_file(path);
        }
        if let Some(path) = &self.copy_file {
            handle.set_copy_file(path);
        }
        handle
    }
}

impl Config {
    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for disk in &self.disks {
            if disk.target.is_empty() {
                bail!("disk.target must not be empty");
            }
            if disk.base.is_empty() {
                bail!("disk.base must not be empty for disk {}", disk.name());
            }
            if !seen.insert(disk.name()) {
                bail!("Duplicate disk name: {}", disk.name());
            }
        }
        Ok(())
    }

    /// Load configuration from `path`
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file: {}", path))
    }

    /// Load an explicit config file, or `chainkit.toml` from `dir` if present.
    ///
    /// A missing default file yields an empty configuration; a missing
    /// explicit file is an error.
    pub fn load_or_default(explicit: Option<&Utf8Path>, dir: &Utf8Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let path: Utf8PathBuf = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        tracing::debug!("Loading {path}");
        Self::load(&path)
    }

    /// Look up a disk by name, or the only configured disk when `name` is `None`
    pub fn disk(&self, name: Option<&str>) -> Result<&DiskConfig> {
        match name {
            Some(name) => self
                .disks
                .iter()
                .find(|d| d.name() == name)
                .ok_or_else(|| eyre!("No disk named {name:?} in configuration")),
            None => match self.disks.as_slice() {
                [only] => Ok(only),
                [] => Err(eyre!("No disks configured")),
                _ => Err(eyre!("Several disks configured; select one with --disk")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_parse_minimal_config() {
        let config = Config::parse("").unwrap();
        assert!(config.connection.uri.is_none());
        assert_eq!(config.qemu_img.force_share, ForceShare::Auto);
        assert!(config.disks.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(indoc! {r#"
            [connection]
            uri = "qemu:///system"

            [qemu-img]
            force-share = "never"

            [[disk]]
            name = "vda-case"
            target = "vda"
            type = "block"
            base = "/dev/vg/base"
            snapshots = ["/tmp/snap1", "/tmp/snap2"]
            backing-file = "/tmp/backing.qcow2"
            copy-file = "/tmp/copy.qcow2"

            [[disk]]
            target = "vdb"
            base = "/images/vdb.qcow2"
        "#})
        .unwrap();

        assert_eq!(config.connection.uri.as_deref(), Some("qemu:///system"));
        assert_eq!(config.qemu_img.force_share, ForceShare::Never);
        assert_eq!(config.disks.len(), 2);

        let vda = config.disk(Some("vda-case")).unwrap();
        assert_eq!(vda.disk_type, DiskType::Block);
        let handle = vda.to_handle();
        assert_eq!(handle.snapshots(), ["/tmp/snap1", "/tmp/snap2"]);
        assert_eq!(handle.backing_file(), Some("/tmp/backing.qcow2"));
        assert_eq!(handle.copy_file(), Some("/tmp/copy.qcow2"));

        let vdb = config.disk(Some("vdb")).unwrap();
        assert_eq!(vdb.disk_type, DiskType::File);
        assert!(config.disk(None).is_err());
        assert!(config.disk(Some("vdc")).is_err());
    }

    #[test]
    fn test_validation() {
        let err = Config::parse(indoc! {r#"
            [[disk]]
            target = "vda"
            base = ""
        "#})
        .unwrap_err();
        assert!(err.to_string().contains("disk.base"));

        let err = Config::parse(indoc! {r#"
            [[disk]]
            target = "vda"
            base = "/a"

            [[disk]]
            target = "vda"
            base = "/b"
        "#})
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate disk name"));

        assert!(Config::parse("[bogus]\n").is_err());
    }

    #[test]
    fn test_load_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        let config = Config::load_or_default(None, dir).unwrap();
        assert!(config.disks.is_empty());

        let missing = dir.join("missing.toml");
        assert!(Config::load_or_default(Some(&missing), dir).is_err());

        fs::write(
            dir.join(CONFIG_FILE),
            "[connection]\nuri = \"qemu:///session\"\n",
        )
        .unwrap();
        let config = Config::load_or_default(None, dir).unwrap();
        assert_eq!(config.connection.uri.as_deref(), Some("qemu:///session"));
    }
}
