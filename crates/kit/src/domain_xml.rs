//! Backing chain introspection from libvirt domain XML
//!
//! libvirt reports the chain of a disk as its `<source>` followed by nested
//! `<backingStore>` elements, each with its own `type=` and `<source>`:
//!
//! ```xml
//! <disk type='file' device='disk'>
//!   <source file='/images/base.snap2' index='3'/>
//!   <backingStore type='file' index='2'>
//!     <format type='qcow2'/>
//!     <source file='/images/base.snap1'/>
//!     <backingStore type='file' index='1'>
//!       <format type='qcow2'/>
//!       <source file='/images/base.qcow2'/>
//!       <backingStore/>
//!     </backingStore>
//!   </backingStore>
//!   <target dev='vda' bus='virtio'/>
//! </disk>
//! ```

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tracing::debug;

use crate::chain::ChainState;
use crate::disk::DiskType;
use crate::expected::network_identifier;
use crate::libvirt::{run_virsh_xml, LibvirtOptions};
use crate::xml_utils::XmlNode;

/// One layer as described by a `<source>` element
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    /// Identifier: path, device node, `pool/volume`, or `protocol://host/name`
    pub identifier: String,
    /// Type of this layer
    pub disk_type: DiskType,
    /// Image format from `<driver type=...>` or `<format type=...>`
    pub format: Option<String>,
    /// libvirt's layer index, if reported
    pub index: Option<u32>,
    /// External data file from `<dataStore>`
    pub data_store: Option<String>,
}

/// Block job mirror state from `<mirror>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorInfo {
    /// Job kind (`copy`, `active-commit`)
    pub job: Option<String>,
    /// Value of `ready=` (`yes`, `pivot`, `abort`)
    pub ready: Option<String>,
    /// Mirror destination identifier
    pub destination: Option<String>,
}

impl MirrorInfo {
    /// Whether the job reached the ready phase
    pub fn is_ready(&self) -> bool {
        self.ready.as_deref() == Some("yes")
    }
}

/// A `<disk>` element with its backing chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
    /// Guest target device
    pub target: String,
    /// Disk type of the active layer
    pub disk_type: DiskType,
    /// `device=` attribute (disk, cdrom, ...)
    pub device: Option<String>,
    /// Active layer, absent for empty cdrom drives
    pub source: Option<SourceInfo>,
    /// Backing layers, nearest first
    pub backing: Vec<SourceInfo>,
    /// In-progress mirror, if any
    pub mirror: Option<MirrorInfo>,
}

impl DiskInfo {
    /// Parse a `<disk>` node
    pub fn from_node(disk: &XmlNode) -> Result<Self> {
        let disk_type = parse_type(disk)?;
        let target = disk
            .child("target")
            .and_then(|t| t.attr("dev"))
            .ok_or_else(|| eyre!("Disk element has no <target dev=...>"))?
            .to_string();
        let format = disk
            .child("driver")
            .and_then(|d| d.attr("type"))
            .map(str::to_string);
        let source = disk
            .child("source")
            .map(|s| source_info(disk_type, s, format.clone()))
            .transpose()?
            .flatten();

        let mut backing = Vec::new();
        let mut next = disk.child("backingStore");
        while let Some(store) = next {
            // An empty <backingStore/> terminates the chain
            let Some(store_source) = store.child("source") else {
                break;
            };
            let layer_type = parse_type(store)?;
            let layer_format = store
                .child("format")
                .and_then(|f| f.attr("type"))
                .map(str::to_string);
            let Some(mut layer) = source_info(layer_type, store_source, layer_format)? else {
                break;
            };
            if layer.index.is_none() {
                layer.index = store.attr("index").and_then(|i| i.parse().ok());
            }
            backing.push(layer);
            next = store.child("backingStore");
        }

        let mirror = disk.child("mirror").map(|m| mirror_info(disk_type, m));

        Ok(Self {
            target,
            disk_type,
            device: disk.attr("device").map(str::to_string),
            source,
            backing,
            mirror,
        })
    }

    /// The chain from the active layer to the base
    pub fn chain(&self) -> Result<ChainState> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| eyre!("Disk {} has no source", self.target))?;
        let layers = std::iter::once(source)
            .chain(&self.backing)
            .map(|s| s.identifier.clone());
        ChainState::new(layers).map_err(|e| eyre!("Disk {}: {e}", self.target))
    }
}

fn parse_type(node: &XmlNode) -> Result<DiskType> {
    let ty = node.attr("type").unwrap_or("file");
    ty.parse()
        .map_err(|_| eyre!("Unsupported disk type {ty:?} on <{}>", node.name))
}

/// Identifier of a `<source>` element, `None` when the element names no
/// image (e.g. an empty cdrom).
pub fn source_identifier(disk_type: DiskType, source: &XmlNode) -> Option<String> {
    match disk_type {
        DiskType::File => source.attr("file").map(str::to_string),
        DiskType::Block => source.attr("dev").map(str::to_string),
        DiskType::Volume => {
            let volume = source.attr("volume")?;
            Some(match source.attr("pool") {
                Some(pool) => format!("{pool}/{volume}"),
                None => volume.to_string(),
            })
        }
        DiskType::Network => {
            let protocol = source.attr("protocol")?;
            let host = source.child("host");
            let host_name = host.and_then(|h| h.attr("name")).unwrap_or("localhost");
            let port = host.and_then(|h| h.attr("port"));
            Some(network_identifier(
                protocol,
                host_name,
                port,
                source.attr("name"),
            ))
        }
    }
}

fn source_info(
    disk_type: DiskType,
    source: &XmlNode,
    format: Option<String>,
) -> Result<Option<SourceInfo>> {
    let Some(identifier) = source_identifier(disk_type, source) else {
        return Ok(None);
    };
    let data_store = match source.child("dataStore") {
        Some(ds) => {
            let ds_type = parse_type(ds)?;
            ds.child("source").and_then(|s| source_identifier(ds_type, s))
        }
        None => None,
    };
    Ok(Some(SourceInfo {
        identifier,
        disk_type,
        format,
        index: source.attr("index").and_then(|i| i.parse().ok()),
        data_store,
    }))
}

fn mirror_info(disk_type: DiskType, mirror: &XmlNode) -> MirrorInfo {
    let mirror_type = mirror
        .attr("type")
        .and_then(|t| t.parse().ok())
        .unwrap_or(disk_type);
    // Older libvirt only reports the destination as an attribute
    let destination = mirror
        .child("source")
        .and_then(|s| source_identifier(mirror_type, s))
        .or_else(|| mirror.attr("file").map(str::to_string));
    MirrorInfo {
        job: mirror.attr("job").map(str::to_string),
        ready: mirror.attr("ready").map(str::to_string),
        destination,
    }
}

/// All `<disk>` elements of a domain
pub fn disks(domain: &XmlNode) -> Result<Vec<DiskInfo>> {
    let devices = domain
        .find("devices")
        .ok_or_else(|| eyre!("Domain XML has no <devices>"))?;
    devices.children_named("disk").map(DiskInfo::from_node).collect()
}

/// The `<disk>` with the given target device
pub fn find_disk(domain: &XmlNode, target: &str) -> Result<DiskInfo> {
    disks(domain)?
        .into_iter()
        .find(|d| d.target == target)
        .ok_or_else(|| eyre!("No disk with target {target:?} in domain XML"))
}

/// Fetch the live (or inactive) definition of `domain` and return the disk
pub fn introspect_disk(
    opts: &LibvirtOptions,
    domain: &str,
    target: &str,
    inactive: bool,
) -> Result<DiskInfo> {
    let mut args = vec!["dumpxml", domain];
    if inactive {
        args.push("--inactive");
    }
    let dom = run_virsh_xml(opts, &args)?;
    let disk = find_disk(&dom, target)?;
    debug!(
        "Disk {target} of {domain}: {} backing layer(s)",
        disk.backing.len()
    );
    Ok(disk)
}
