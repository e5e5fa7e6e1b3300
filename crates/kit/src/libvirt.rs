//! Thin helpers for invoking virsh
//!
//! Only the read-only subset needed for introspection goes through here;
//! block jobs themselves are started by the calling test suite.

use std::process::Command;

use color_eyre::{eyre::Context, Result};

use crate::cmdext::CommandRunExt;
use crate::xml_utils;

/// Global options for libvirt operations
#[derive(Debug, Clone, Default)]
pub struct LibvirtOptions {
    /// Hypervisor connection URI (e.g., qemu:///system, qemu+ssh://host/system)
    pub connect: Option<String>,
}

impl LibvirtOptions {
    /// Options for an explicit connection URI
    pub fn with_connection(uri: impl Into<String>) -> Self {
        Self {
            connect: Some(uri.into()),
        }
    }

    /// Create a virsh Command with the appropriate connection URI
    pub fn virsh_command(&self) -> Command {
        let mut cmd = Command::new("virsh");
        if let Some(ref uri) = self.connect {
            cmd.arg("-c").arg(uri);
        }
        cmd
    }
}

/// Run virsh and return stdout, failing with stderr on a non-zero exit
pub fn run_virsh_stdout(opts: &LibvirtOptions, args: &[&str]) -> Result<String> {
    opts.virsh_command()
        .args(args)
        .run_stdout()
        .with_context(|| format!("virsh {} failed", args.join(" ")))
}

/// Run a virsh command that prints XML and parse it
pub fn run_virsh_xml(opts: &LibvirtOptions, args: &[&str]) -> Result<xml_utils::XmlNode> {
    let stdout = run_virsh_stdout(opts, args)?;
    xml_utils::parse_xml_dom(&stdout)
        .with_context(|| format!("Failed to parse XML from virsh {}", args.join(" ")))
}
