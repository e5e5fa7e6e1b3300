//! Polling block job state
//!
//! Tests start block jobs themselves; this only watches them through
//! `virsh blockjob --info` and the `<mirror>` element of the domain XML.

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::domain_xml;
use crate::libvirt::{run_virsh_stdout, LibvirtOptions};
use crate::utils::wait_for;

/// Kind of block job as printed by virsh
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobKind {
    /// blockpull
    Pull,
    /// blockcopy
    Copy,
    /// Non-active blockcommit
    Commit,
    /// blockcommit of the active layer
    ActiveCommit,
    /// Anything this version does not know about
    Other(String),
}

impl From<&str> for JobKind {
    fn from(s: &str) -> Self {
        match s.trim() {
            "Block Pull" => Self::Pull,
            "Block Copy" => Self::Copy,
            "Block Commit" => Self::Commit,
            "Active Block Commit" => Self::ActiveCommit,
            other => Self::Other(other.to_string()),
        }
    }
}

/// State of the block job on one disk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BlockJobInfo {
    /// No job is running on the disk
    NoJob,
    /// A job is running (or waiting to be pivoted)
    Active {
        /// Job kind
        kind: JobKind,
        /// Progress in percent
        percent: f64,
    },
}

impl BlockJobInfo {
    /// Whether a job reports 100% progress
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Active { percent, .. } if *percent >= 100.0)
    }
}

const PROGRESS_PATTERN: &str = r"(?m)^\s*(?P<kind>[A-Za-z][A-Za-z ]*?):\s*(?:\[\s*(?P<pct>\d+(?:\.\d+)?)\s*%\]|(?P<cur>\d+)/(?P<end>\d+))";

/// Parse the output of `virsh blockjob DOMAIN TARGET --info [--bytes]`
pub fn parse_blockjob_info(output: &str) -> Result<BlockJobInfo> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed.starts_with("No current block job") {
        return Ok(BlockJobInfo::NoJob);
    }
    let re = Regex::new(PROGRESS_PATTERN)?;
    let caps = re
        .captures(trimmed)
        .ok_or_else(|| eyre!("Unrecognized blockjob output: {trimmed:?}"))?;
    let kind = JobKind::from(&caps["kind"]);
    let percent = if let Some(pct) = caps.name("pct") {
        pct.as_str().parse::<f64>()?
    } else {
        let cur: f64 = caps["cur"].parse()?;
        let end: f64 = caps["end"].parse()?;
        if end == 0.0 {
            0.0
        } else {
            cur * 100.0 / end
        }
    };
    Ok(BlockJobInfo::Active { kind, percent })
}

/// Query the block job on `target`
pub fn blockjob_info(opts: &LibvirtOptions, domain: &str, target: &str) -> Result<BlockJobInfo> {
    let out = run_virsh_stdout(opts, &["blockjob", domain, target, "--info"])?;
    parse_blockjob_info(&out)
}

/// Wait until no block job remains on `target`
pub fn wait_for_job_done(
    opts: &LibvirtOptions,
    domain: &str,
    target: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<Duration> {
    wait_for(
        &format!("block job on {domain}/{target} to finish"),
        timeout,
        interval,
        || {
            let info = blockjob_info(opts, domain, target)?;
            debug!("{domain}/{target}: {info:?}");
            Ok(info == BlockJobInfo::NoJob)
        },
    )
}

/// Wait until the mirror of `target` reports `ready='yes'`
pub fn wait_for_mirror_ready(
    opts: &LibvirtOptions,
    domain: &str,
    target: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<Duration> {
    wait_for(
        &format!("mirror of {domain}/{target} to become ready"),
        timeout,
        interval,
        || {
            let disk = domain_xml::introspect_disk(opts, domain, target, false)?;
            Ok(disk.mirror.as_ref().is_some_and(|m| m.is_ready()))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_job() {
        assert_eq!(
            parse_blockjob_info("No current block job for vda\n").unwrap(),
            BlockJobInfo::NoJob
        );
        assert_eq!(parse_blockjob_info("\n").unwrap(), BlockJobInfo::NoJob);
    }

    #[test]
    fn test_percent_forms() {
        let info = parse_blockjob_info("Block Copy: [ 45 %]").unwrap();
        assert_eq!(
            info,
            BlockJobInfo::Active {
                kind: JobKind::Copy,
                percent: 45.0
            }
        );
        assert!(!info.is_complete());

        let info = parse_blockjob_info("Active Block Commit: [100 %]\n").unwrap();
        assert!(info.is_complete());
        assert!(matches!(
            info,
            BlockJobInfo::Active {
                kind: JobKind::ActiveCommit,
                ..
            }
        ));

        let info = parse_blockjob_info("Block Pull: [12.50 %]").unwrap();
        assert_eq!(
            info,
            BlockJobInfo::Active {
                kind: JobKind::Pull,
                percent: 12.5
            }
        );
    }

    #[test]
    fn test_bytes_form() {
        let info = parse_blockjob_info("Block Commit: 524288/1048576\n").unwrap();
        assert_eq!(
            info,
            BlockJobInfo::Active {
                kind: JobKind::Commit,
                percent: 50.0
            }
        );
    }

    #[test]
    fn test_garbage() {
        assert!(parse_blockjob_info("error: failed to get domain 'nope'").is_err());
    }
}
