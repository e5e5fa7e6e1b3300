//! Verify a live backing chain

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::{eyre::Context as _, Result};

use super::{CommandContext, DiskOpts};
use crate::chain::ChainState;
use crate::qemu_img::{ForceShare, QemuImg};
use crate::verify::{VerifyContext, VerifyMethod};

/// Options for verifying a backing chain
#[derive(Debug, Parser)]
pub struct VerifyOpts {
    /// Expected-chain expression resolved against the disk (e.g. `2>base`)
    #[clap(long, conflicts_with = "chain", required_unless_present = "chain")]
    pub expected: Option<String>,

    /// Literal expected chain, active layer first (`A>B>C`)
    #[clap(long)]
    pub chain: Option<ChainState>,

    /// Domain to introspect
    #[clap(long, requires = "target")]
    pub domain: Option<String>,

    /// Disk for `--expected` expressions and the domain XML target
    #[clap(flatten)]
    pub disk: DiskOpts,

    /// Image qemu-img starts from (default: the expected active layer)
    #[clap(long)]
    pub image: Option<Utf8PathBuf>,

    /// Introspection method
    #[clap(long, value_enum, default_value_t = VerifyMethod::Both)]
    pub method: VerifyMethod,

    /// Read the inactive domain definition
    #[clap(long)]
    pub inactive: bool,

    /// Require every recorded backing reference to be relative
    #[clap(long)]
    pub keep_relative: bool,

    /// Override the configured `-U` behavior
    #[clap(long, value_enum)]
    pub force_share: Option<ForceShare>,
}

impl VerifyOpts {
    fn expected_chain(&self, ctx: &CommandContext) -> Result<(ChainState, Option<String>)> {
        match (&self.chain, &self.expected) {
            (Some(chain), _) => Ok((chain.clone(), self.disk.target.clone())),
            (None, Some(expr)) => {
                let disk = self.disk.handle(&ctx.config)?;
                let chain = disk
                    .expected_chain(expr)
                    .with_context(|| format!("Resolving {expr:?} for {}", disk.target))?;
                Ok((chain, Some(disk.target)))
            }
            (None, None) => color_eyre::eyre::bail!("One of --expected or --chain is required"),
        }
    }
}

/// Execute the verify command
pub fn run(ctx: &CommandContext, opts: VerifyOpts) -> Result<()> {
    let (expected, target) = opts.expected_chain(ctx)?;
    let mode = opts.force_share.unwrap_or(ctx.config.qemu_img.force_share);
    let qemu_img = match opts.method {
        VerifyMethod::Xml => QemuImg::with_force_share(false),
        VerifyMethod::QemuImg | VerifyMethod::Both => QemuImg::detect(mode)?,
    };
    let verifier = VerifyContext {
        libvirt: &ctx.libvirt,
        qemu_img,
        inactive: opts.inactive,
        keep_relative: opts.keep_relative,
    };
    let disk = match (&opts.domain, &target) {
        (Some(domain), Some(target)) => Some((domain.as_str(), target.as_str())),
        _ => None,
    };
    verifier.verify(opts.method, disk, opts.image.as_deref(), &expected)?;
    println!("ok: {expected}");
    Ok(())
}
