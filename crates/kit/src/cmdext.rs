//! Extension trait for running external tools

use std::process::{Command, Stdio};

use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use tracing::debug;

use crate::outcome::CapturedOutput;

/// Render a command line for logs and error messages
pub fn command_line(cmd: &Command) -> String {
    let parts: Vec<String> = std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect();
    shlex::try_join(parts.iter().map(|s| s.as_str())).unwrap_or_else(|_| parts.join(" "))
}

/// Helpers for running a [`Command`] to completion
pub trait CommandRunExt {
    /// Run and capture output, whatever the exit status
    fn run_capture(&mut self) -> Result<CapturedOutput>;
    /// Run and return stdout, failing with stderr on a non-zero exit
    fn run_stdout(&mut self) -> Result<String>;
    /// Run and parse stdout as JSON
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;
}

impl CommandRunExt for Command {
    fn run_capture(&mut self) -> Result<CapturedOutput> {
        let cmdline = command_line(self);
        debug!("Running: {cmdline}");
        let output = self
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run {cmdline}"))?;
        Ok(CapturedOutput::new(output))
    }

    fn run_stdout(&mut self) -> Result<String> {
        let out = self.run_capture()?;
        if !out.success() {
            return Err(eyre!(
                "{} exited with status {}: {}",
                command_line(self),
                out.output.status,
                out.stderr.trim()
            ));
        }
        Ok(out.stdout)
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let stdout = self.run_stdout()?;
        serde_json::from_str(&stdout)
            .with_context(|| format!("Failed to parse JSON output of {}", command_line(self)))
    }
}
