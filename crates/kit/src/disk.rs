//! Disk handles: a target device plus the images created for it during a test

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::chain::{ChainError, ChainState};

/// libvirt disk type, as found in the `type=` attribute of `<disk>` and
/// `<backingStore>`
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[clap(rename_all = "lowercase")]
pub enum DiskType {
    /// Regular image file, `<source file=...>`
    File,
    /// Host block device, `<source dev=...>`
    Block,
    /// Storage pool volume, `<source pool=... volume=...>`
    Volume,
    /// Network protocol (rbd, nbd, ssh...), `<source protocol=... name=...>`
    Network,
}

impl DiskType {
    /// Whether `qemu-img` can open the layer by its identifier directly
    pub fn is_local(self) -> bool {
        matches!(self, DiskType::File | DiskType::Block)
    }
}

/// A target disk and the images prepared for it over a test's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskHandle {
    /// Guest target device (e.g. `vda`)
    pub target: String,
    /// Disk type of the active layer
    pub disk_type: DiskType,
    original_source: String,
    snapshots: Vec<String>,
    backing_file: Option<String>,
    copy_file: Option<String>,
}

impl DiskHandle {
    /// Create a handle for `target` whose pre-snapshot source is `original_source`
    pub fn new(
        target: impl Into<String>,
        disk_type: DiskType,
        original_source: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            disk_type,
            original_source: original_source.into(),
            snapshots: Vec::new(),
            backing_file: None,
            copy_file: None,
        }
    }

    /// The source the disk had before any snapshot was created
    pub fn original_source(&self) -> &str {
        &self.original_source
    }

    /// Record a newly created external snapshot image
    pub fn push_snapshot(&mut self, image: impl Into<String>) {
        self.snapshots.push(image.into());
    }

    /// Snapshot images in creation order (index 0 is snapshot 1)
    pub fn snapshots(&self) -> &[String] {
        &self.snapshots
    }

    /// External backing file prepared for the test, if any
    pub fn backing_file(&self) -> Option<&str> {
        self.backing_file.as_deref()
    }

    /// Set the external backing file prepared for the test
    pub fn set_backing_file(&mut self, path: impl Into<String>) {
        self.backing_file = Some(path.into());
    }

    /// blockcopy destination, if any
    pub fn copy_file(&self) -> Option<&str> {
        self.copy_file.as_deref()
    }

    /// Set the blockcopy destination
    pub fn set_copy_file(&mut self, path: impl Into<String>) {
        self.copy_file = Some(path.into());
    }

    /// The chain right after snapshot creation: newest snapshot first,
    /// original source last.
    pub fn initial_chain(&self) -> Result<ChainState, ChainError> {
        ChainState::new(
            self.snapshots
                .iter()
                .rev()
                .chain(std::iter::once(&self.original_source))
                .cloned(),
        )
    }
}
