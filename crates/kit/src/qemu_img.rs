//! Helper functions for interacting with qemu-img

use std::process::Command;

use camino::Utf8Path;
use color_eyre::{eyre::eyre, eyre::Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cmdext::CommandRunExt;

/// First qemu-img release with `-U`/`--force-share`
const FORCE_SHARE_MIN_VERSION: (u32, u32) = (2, 10);

/// Information returned by `qemu-img info --output=json`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct QemuImgInfo {
    /// Virtual size of the disk image in bytes
    pub virtual_size: u64,
    /// Path to the disk image file
    pub filename: String,
    /// Image format (e.g., "qcow2", "raw")
    pub format: String,
    /// Actual size on disk in bytes (if available)
    pub actual_size: Option<u64>,
    /// Cluster size in bytes (for formats like qcow2)
    pub cluster_size: Option<u64>,
    /// Backing file name as recorded in the image header
    pub backing_filename: Option<String>,
    /// Backing file name resolved against the image's directory
    pub full_backing_filename: Option<String>,
    /// Format recorded for the backing file
    pub backing_filename_format: Option<String>,
    /// Whether the image is marked as dirty
    pub dirty_flag: Option<bool>,
}

/// When to pass `-U` (`--force-share`) to `qemu-img info`
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
#[clap(rename_all = "kebab-case")]
pub enum ForceShare {
    /// Pass it when the installed qemu-img supports it
    #[default]
    Auto,
    /// Always pass it
    Always,
    /// Never pass it
    Never,
}

/// Check if `qemu-img` is available on the system.
pub fn is_available() -> bool {
    Command::new("qemu-img")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Parse `qemu-img --version` output into (major, minor, micro)
pub fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    let re = Regex::new(r"qemu-img version (\d+)\.(\d+)(?:\.(\d+))?").ok()?;
    let caps = re.captures(text)?;
    let num = |i: usize| -> Option<u32> {
        caps.get(i)
            .map_or(Some(0), |m| m.as_str().parse().ok())
    };
    Some((num(1)?, num(2)?, num(3)?))
}

/// Installed qemu-img version
pub fn version() -> Result<(u32, u32, u32)> {
    let out = Command::new("qemu-img").arg("--version").run_stdout()?;
    parse_version(&out).ok_or_else(|| eyre!("Unrecognized qemu-img version output: {out:?}"))
}

/// Whether a qemu-img version understands `-U`
pub fn supports_force_share(version: (u32, u32, u32)) -> bool {
    (version.0, version.1) >= FORCE_SHARE_MIN_VERSION
}

/// A configured qemu-img invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QemuImg {
    force_share: bool,
}

impl QemuImg {
    /// Resolve `mode` against the installed qemu-img
    pub fn detect(mode: ForceShare) -> Result<Self> {
        let force_share = match mode {
            ForceShare::Always => true,
            ForceShare::Never => false,
            ForceShare::Auto => {
                let v = version().context("Detecting qemu-img force-share support")?;
                debug!("qemu-img version {}.{}.{}", v.0, v.1, v.2);
                supports_force_share(v)
            }
        };
        Ok(Self { force_share })
    }

    /// Use an explicit setting without probing
    pub fn with_force_share(force_share: bool) -> Self {
        Self { force_share }
    }

    /// Whether `-U` is passed
    pub fn force_share(&self) -> bool {
        self.force_share
    }

    fn info_command(&self, path: &Utf8Path, backing_chain: bool, json: bool) -> Command {
        let mut cmd = Command::new("qemu-img");
        cmd.arg("info");
        if backing_chain {
            cmd.arg("--backing-chain");
        }
        if self.force_share {
            cmd.arg("-U");
        }
        if json {
            cmd.arg("--output=json");
        }
        cmd.arg(path.as_str());
        cmd
    }

    /// Run `qemu-img info --backing-chain --output=json`, active image first
    pub fn backing_chain(&self, path: &Utf8Path) -> Result<Vec<QemuImgInfo>> {
        self.info_command(path, true, true)
            .run_and_parse_json()
            .with_context(|| format!("qemu-img info --backing-chain failed for {path}"))
    }

    /// Run `qemu-img info --backing-chain` and return its human-readable output
    pub fn backing_chain_text(&self, path: &Utf8Path) -> Result<String> {
        self.info_command(path, true, false)
            .run_stdout()
            .with_context(|| format!("qemu-img info --backing-chain failed for {path}"))
    }
}

/// Backing reference for [`create`]
#[derive(Debug, Clone, Copy)]
pub struct Backing<'a> {
    /// Backing file as it should be recorded (relative names stay relative)
    pub file: &'a str,
    /// Format of the backing file
    pub format: &'a str,
}

/// Create an image with `qemu-img create`.
///
/// Without a backing file `size` is required; with one it defaults to the
/// backing file's virtual size.
pub fn create(
    image: &Utf8Path,
    format: &str,
    backing: Option<Backing<'_>>,
    size: Option<&str>,
) -> Result<()> {
    let mut cmd = Command::new("qemu-img");
    cmd.args(["create", "-q", "-f", format]);
    if let Some(b) = backing {
        cmd.args(["-b", b.file, "-F", b.format]);
    } else if size.is_none() {
        return Err(eyre!("Creating {image} without a backing file needs a size"));
    }
    cmd.arg(image.as_str());
    if let Some(size) = size {
        cmd.arg(size);
    }
    cmd.run_stdout()
        .with_context(|| format!("Failed to create {image}"))?;
    info!(
        "Created {image}{}",
        backing.map(|b| format!(" backed by {}", b.file)).unwrap_or_default()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        let out = "qemu-img version 8.2.2 (qemu-8.2.2-1.fc40)\nCopyright (c) 2003-2023 Fabrice Bellard and the QEMU Project developers";
        assert_eq!(parse_version(out), Some((8, 2, 2)));
        assert_eq!(parse_version("qemu-img version 2.9"), Some((2, 9, 0)));
        assert_eq!(parse_version("something else"), None);
    }

    #[test]
    fn test_force_share_threshold() {
        assert!(!supports_force_share((2, 9, 1)));
        assert!(supports_force_share((2, 10, 0)));
        assert!(supports_force_share((9, 0, 0)));
    }

    #[test]
    fn test_info_command_flags() {
        let path = Utf8Path::new("/images/top.qcow2");
        let args = |q: QemuImg, chain: bool, json: bool| -> Vec<String> {
            q.info_command(path, chain, json)
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect()
        };
        assert_eq!(
            args(QemuImg::with_force_share(true), true, false),
            ["info", "--backing-chain", "-U", "/images/top.qcow2"]
        );
        assert_eq!(
            args(QemuImg::with_force_share(false), false, true),
            ["info", "--output=json", "/images/top.qcow2"]
        );
    }

    #[test]
    fn test_parse_backing_chain_json() {
        let json = r#"[
            {
                "virtual-size": 1073741824,
                "filename": "/images/snap1",
                "cluster-size": 65536,
                "format": "qcow2",
                "actual-size": 200704,
                "backing-filename": "base.qcow2",
                "full-backing-filename": "/images/base.qcow2",
                "backing-filename-format": "qcow2",
                "dirty-flag": false
            },
            {
                "virtual-size": 1073741824,
                "filename": "/images/base.qcow2",
                "format": "qcow2",
                "dirty-flag": false
            }
        ]"#;
        let infos: Vec<QemuImgInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].backing_filename.as_deref(), Some("base.qcow2"));
        assert_eq!(infos[1].backing_filename, None);
    }
}
