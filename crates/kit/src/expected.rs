//! Expected-chain expressions
//!
//! Tests describe the chain they expect after an operation with a short
//! index expression such as `4>2>base` or `top>2>backing_file`, active
//! layer first. Tokens resolve against a [`DiskHandle`]:
//!
//! - `base`: the original (pre-snapshot) disk source
//! - `top`: the most recently created snapshot
//! - `backing_file`: the external backing file prepared for the test
//! - `copy_file`: the blockcopy destination
//! - `N`: the Nth created snapshot, counting from 1

use std::str::FromStr;

use color_eyre::{eyre::eyre, Result};

use crate::chain::{ChainError, ChainState, CHAIN_SEPARATOR};
use crate::disk::{DiskHandle, DiskType};
use crate::xml_utils::XmlWriter;

/// One token of an expected-chain expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainToken {
    /// Original disk source
    Base,
    /// Newest snapshot
    Top,
    /// Prepared external backing file
    BackingFile,
    /// blockcopy destination
    CopyFile,
    /// Nth snapshot in creation order (1-based)
    Snapshot(usize),
}

impl FromStr for ChainToken {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "base" => Ok(Self::Base),
            "top" => Ok(Self::Top),
            "backing_file" => Ok(Self::BackingFile),
            "copy_file" => Ok(Self::CopyFile),
            other => other
                .parse::<usize>()
                .map(Self::Snapshot)
                .map_err(|_| ChainError::UnknownToken(other.to_string())),
        }
    }
}

/// Split an expression into tokens
pub fn parse_expression(expr: &str) -> Result<Vec<ChainToken>, ChainError> {
    expr.split(CHAIN_SEPARATOR).map(str::parse).collect()
}

impl DiskHandle {
    /// Resolve a single token to an image identifier
    pub fn resolve_token(&self, token: ChainToken) -> Result<&str, ChainError> {
        match token {
            ChainToken::Base => Ok(self.original_source()),
            ChainToken::Top => Ok(self
                .snapshots()
                .last()
                .map(String::as_str)
                .unwrap_or(self.original_source())),
            ChainToken::BackingFile => self
                .backing_file()
                .ok_or(ChainError::MissingReference("backing_file")),
            ChainToken::CopyFile => self
                .copy_file()
                .ok_or(ChainError::MissingReference("copy_file")),
            ChainToken::Snapshot(n) => {
                let snapshots = self.snapshots();
                n.checked_sub(1)
                    .and_then(|i| snapshots.get(i))
                    .map(String::as_str)
                    .ok_or(ChainError::IndexOutOfRange {
                        index: n,
                        len: snapshots.len(),
                    })
            }
        }
    }

    /// Resolve an expression like `3>1>base` into a concrete chain
    pub fn expected_chain(&self, expr: &str) -> Result<ChainState, ChainError> {
        let images = parse_expression(expr)?
            .into_iter()
            .map(|t| self.resolve_token(t).map(str::to_string))
            .collect::<Result<Vec<_>, _>>()?;
        ChainState::new(images)
    }

    /// Render `chain` as the `<disk>` element libvirt would report for this
    /// disk: the active source followed by nested `<backingStore>` elements,
    /// terminated by an empty `<backingStore/>`.
    pub fn render_disk_xml(&self, chain: &ChainState) -> Result<String> {
        let mut w = XmlWriter::new();
        let disk_type = self.disk_type.to_string();
        w.start_element("disk", &[("type", &disk_type), ("device", "disk")])?;
        write_source(&mut w, self.disk_type, chain.active())?;

        let layer_type = backing_layer_type(self.disk_type);
        let layer_type_str = layer_type.to_string();
        let backing = &chain.images()[1..];
        for image in backing {
            w.start_element("backingStore", &[("type", &layer_type_str)])?;
            write_source(&mut w, layer_type, image)?;
        }
        w.write_empty_element("backingStore", &[])?;
        for _ in backing {
            w.end_element("backingStore")?;
        }

        w.write_empty_element("target", &[("dev", &self.target)])?;
        w.end_element("disk")?;
        w.into_string()
    }
}

/// Volumes expose their backing layers as plain files
fn backing_layer_type(disk_type: DiskType) -> DiskType {
    match disk_type {
        DiskType::Volume => DiskType::File,
        other => other,
    }
}

fn write_source(w: &mut XmlWriter, disk_type: DiskType, image: &str) -> Result<()> {
    match disk_type {
        DiskType::File => w.write_empty_element("source", &[("file", image)]),
        DiskType::Block => w.write_empty_element("source", &[("dev", image)]),
        DiskType::Volume => {
            let (pool, volume) = image
                .split_once('/')
                .ok_or_else(|| eyre!("Volume identifier {image:?} is not in pool/volume form"))?;
            w.write_empty_element("source", &[("pool", pool), ("volume", volume)])
        }
        DiskType::Network => {
            let url = NetworkUrl::parse(image)?;
            let mut attrs = vec![("protocol", url.protocol)];
            if let Some(name) = url.name {
                attrs.push(("name", name));
            }
            w.start_element("source", &attrs)?;
            let mut host = vec![("name", url.host)];
            if let Some(port) = url.port {
                host.push(("port", port));
            }
            w.write_empty_element("host", &host)?;
            w.end_element("source")
        }
    }
}

/// Borrowed pieces of a `protocol://host[:port][/name]` identifier
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct NetworkUrl<'a> {
    pub(crate) protocol: &'a str,
    pub(crate) host: &'a str,
    pub(crate) port: Option<&'a str>,
    pub(crate) name: Option<&'a str>,
}

impl<'a> NetworkUrl<'a> {
    pub(crate) fn parse(s: &'a str) -> Result<Self> {
        let (protocol, rest) = s
            .split_once("://")
            .ok_or_else(|| eyre!("Network identifier {s:?} has no protocol"))?;
        let (authority, name) = match rest.split_once('/') {
            Some((a, n)) => (a, Some(n).filter(|n| !n.is_empty())),
            None => (rest, None),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => {
                (h, Some(p))
            }
            _ => (authority, None),
        };
        if host.is_empty() {
            return Err(eyre!("Network identifier {s:?} has no host"));
        }
        Ok(Self {
            protocol,
            host,
            port,
            name,
        })
    }
}

/// Compose the identifier used for a network layer
pub(crate) fn network_identifier(
    protocol: &str,
    host: &str,
    port: Option<&str>,
    name: Option<&str>,
) -> String {
    let mut id = format!("{protocol}://{host}");
    if let Some(port) = port {
        id.push(':');
        id.push_str(port);
    }
    if let Some(name) = name {
        id.push('/');
        id.push_str(name);
    }
    id
}
