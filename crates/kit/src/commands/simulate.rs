//! Apply block operations to a chain without touching a VM

use clap::Parser;
use color_eyre::{eyre::Context as _, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use super::{unsupported_format, OutputFormat};
use crate::chain::ChainState;
use crate::operation::ChainOperation;

/// Options for simulating block operations
#[derive(Debug, Parser)]
pub struct SimulateOpts {
    /// Starting chain, active layer first (`A>B>C`)
    #[clap(long)]
    pub chain: ChainState,

    /// Operations in order: `commit:TOP[:BASE][:pivot][:keep-relative]`,
    /// `pull[:BASE][:keep-relative]`, `copy:DEST[:shallow][:pivot]`
    #[clap(required = true)]
    pub operations: Vec<ChainOperation>,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Lines)]
    pub format: OutputFormat,
}

/// One applied operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    /// The operation
    pub operation: ChainOperation,
    /// Chain after it ran
    pub chain: ChainState,
}

/// Apply each operation in turn, keeping every intermediate chain
pub fn simulate(chain: &ChainState, operations: &[ChainOperation]) -> Result<Vec<Step>> {
    let mut current = chain.clone();
    let mut steps = Vec::with_capacity(operations.len());
    for op in operations {
        current = op
            .apply(&current)
            .with_context(|| format!("Applying {op} to {current}"))?;
        tracing::debug!("{op} -> {current}");
        steps.push(Step {
            operation: op.clone(),
            chain: current.clone(),
        });
    }
    Ok(steps)
}

/// Execute the simulate command
pub fn run(opts: SimulateOpts) -> Result<()> {
    let steps = simulate(&opts.chain, &opts.operations)?;
    let last = steps.last().map_or(&opts.chain, |s| &s.chain);
    match opts.format {
        OutputFormat::Lines => {
            for image in last {
                println!("{image}");
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&steps)
                    .with_context(|| "Failed to serialize steps as JSON")?
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["STEP", "JOB", "OPERATION", "CHAIN"]);
            table.add_row(vec![
                "0".to_string(),
                "-".to_string(),
                "-".to_string(),
                opts.chain.to_string(),
            ]);
            for (i, step) in steps.iter().enumerate() {
                table.add_row(vec![
                    (i + 1).to_string(),
                    step.operation.command_name().to_string(),
                    step.operation.to_string(),
                    step.chain.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Xml => return Err(unsupported_format("simulate", opts.format)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulate_steps() {
        let chain: ChainState = "s3>s2>s1>base".parse().unwrap();
        let ops: Vec<ChainOperation> = ["commit:2:3", "pull"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let steps = simulate(&chain, &ops).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].chain.images(), ["s3", "s1", "base"]);
        assert_eq!(steps[1].chain.images(), ["s3"]);
    }

    #[test]
    fn test_simulate_error_context() {
        let chain: ChainState = "s1>base".parse().unwrap();
        let ops = ["commit:2:1".parse::<ChainOperation>().unwrap()];
        let err = simulate(&chain, &ops).unwrap_err();
        assert!(format!("{err:#}").contains("Applying commit:2:1"));
    }
}
