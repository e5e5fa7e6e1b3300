//! Wait for a block job

use std::time::Duration;

use clap::Parser;
use color_eyre::Result;

use super::CommandContext;
use crate::blockjob;

/// Options for waiting on a block job
#[derive(Debug, Parser)]
pub struct BlockjobWaitOpts {
    /// Domain name
    #[clap(long)]
    pub domain: String,

    /// Guest target device (e.g. vda)
    #[clap(long)]
    pub target: String,

    /// Give up after this many seconds
    #[clap(long, default_value_t = 300)]
    pub timeout: u64,

    /// Seconds between polls
    #[clap(long, default_value_t = 1)]
    pub interval: u64,

    /// Wait for the mirror to become ready instead of the job to finish
    #[clap(long)]
    pub mirror_ready: bool,
}

/// Execute the blockjob-wait command
pub fn run(ctx: &CommandContext, opts: BlockjobWaitOpts) -> Result<()> {
    let timeout = Duration::from_secs(opts.timeout);
    let interval = Duration::from_secs(opts.interval.max(1));
    let (domain, target) = (opts.domain.as_str(), opts.target.as_str());
    let elapsed = if opts.mirror_ready {
        blockjob::wait_for_mirror_ready(&ctx.libvirt, domain, target, timeout, interval)?
    } else {
        blockjob::wait_for_job_done(&ctx.libvirt, domain, target, timeout, interval)?
    };
    let state = if opts.mirror_ready {
        "mirror ready"
    } else {
        "no block job"
    };
    println!("{domain}/{target}: {state} after {:.1}s", elapsed.as_secs_f64());
    Ok(())
}
