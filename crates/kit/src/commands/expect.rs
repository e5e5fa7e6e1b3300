//! Resolve an expected-chain expression

use clap::Parser;
use color_eyre::{eyre::Context as _, Result};

use super::{unsupported_format, CommandContext, DiskOpts, OutputFormat};
use crate::chain::ChainState;
use crate::disk::DiskHandle;

/// Options for resolving an expected chain
#[derive(Debug, Parser)]
pub struct ExpectOpts {
    /// Expression such as `3>1>base`, `top` or `copy_file`
    pub expression: String,

    /// Disk the expression is resolved against
    #[clap(flatten)]
    pub disk: DiskOpts,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Lines)]
    pub format: OutputFormat,
}

/// Render `chain` for `disk` in `format`
pub fn render(disk: &DiskHandle, chain: &ChainState, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Lines => Ok(chain.iter().map(|i| format!("{i}\n")).collect()),
        OutputFormat::Json => {
            serde_json::to_string_pretty(chain).context("Failed to serialize chain as JSON")
        }
        OutputFormat::Xml => disk.render_disk_xml(chain),
        OutputFormat::Table => Err(unsupported_format("expect", format)),
    }
}

/// Execute the expect command
pub fn run(ctx: &CommandContext, opts: ExpectOpts) -> Result<()> {
    let disk = opts.disk.handle(&ctx.config)?;
    let chain = disk
        .expected_chain(&opts.expression)
        .with_context(|| format!("Resolving {:?} for {}", opts.expression, disk.target))?;
    tracing::debug!("{} resolves to {chain}", opts.expression);
    let out = render(&disk, &chain, opts.format)?;
    print!("{out}");
    if !out.ends_with('\n') {
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskType;

    #[test]
    fn test_render_lines_and_json() {
        let mut disk = DiskHandle::new("vda", DiskType::File, "/i/base");
        disk.push_snapshot("/i/s1");
        let chain = disk.expected_chain("1>base").unwrap();

        assert_eq!(
            render(&disk, &chain, OutputFormat::Lines).unwrap(),
            "/i/s1\n/i/base\n"
        );
        let json: Vec<String> =
            serde_json::from_str(&render(&disk, &chain, OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(json, ["/i/s1", "/i/base"]);
        assert!(render(&disk, &chain, OutputFormat::Xml)
            .unwrap()
            .contains("<backingStore"));
        assert!(render(&disk, &chain, OutputFormat::Table).is_err());
    }
}
