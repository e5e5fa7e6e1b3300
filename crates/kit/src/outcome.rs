//! Command outcomes and failure categories
//!
//! A chain test distinguishes three results: the environment could not be
//! set up ([`Failure::Error`]), an observed state did not match
//! ([`Failure::Fail`]), or a command failed the way the test expected it
//! to (see [`check_result`]).

use std::process::Output;

use regex::Regex;

/// Why a test step did not pass
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Failure {
    /// Preconditions could not be met (missing tool, bad fixture)
    #[error("setup error: {0}")]
    Error(String),
    /// Observed state did not match the expectation
    #[error("check failed: {0}")]
    Fail(String),
}

/// Captured output from a command with decoded stdout/stderr strings
#[derive(Debug)]
pub struct CapturedOutput {
    /// Raw process output
    pub output: Output,
    /// Lossily decoded stdout
    pub stdout: String,
    /// Lossily decoded stderr
    pub stderr: String,
}

impl CapturedOutput {
    /// Create from a raw Output
    pub fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    /// Get the exit code
    pub fn exit_code(&self) -> Option<i32> {
        self.output.status.code()
    }

    /// Check if the command succeeded
    pub fn success(&self) -> bool {
        self.output.status.success()
    }
}

/// Check a command result against an optional expected error.
///
/// With `expected_error == None` the command must succeed. Otherwise it
/// must fail and its stderr must match the pattern, which is a regular
/// expression (an invalid pattern is a setup error).
pub fn check_result(output: &CapturedOutput, expected_error: Option<&str>) -> Result<(), Failure> {
    match expected_error {
        None if output.success() => Ok(()),
        None => Err(Failure::Fail(format!(
            "command failed unexpectedly (exit {:?}): {}",
            output.exit_code(),
            output.stderr.trim()
        ))),
        Some(_) if output.success() => Err(Failure::Fail(format!(
            "command succeeded but was expected to fail; stdout: {}",
            output.stdout.trim()
        ))),
        Some(pattern) => {
            let re = Regex::new(pattern)
                .map_err(|e| Failure::Error(format!("invalid expected error {pattern:?}: {e}")))?;
            if re.is_match(&output.stderr) {
                Ok(())
            } else {
                Err(Failure::Fail(format!(
                    "expected error matching {pattern:?}, got: {}",
                    output.stderr.trim()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn output(code: i32, stdout: &str, stderr: &str) -> CapturedOutput {
        CapturedOutput::new(Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        })
    }

    #[test]
    fn test_success_expected() {
        assert_eq!(check_result(&output(0, "ok", ""), None), Ok(()));
        assert!(matches!(
            check_result(&output(1, "", "error: boom"), None),
            Err(Failure::Fail(_))
        ));
    }

    #[test]
    fn test_expected_error() {
        let out = output(
            1,
            "",
            "error: invalid argument: top 'vda[1]' in chain for 'vda' has no backing file",
        );
        assert_eq!(check_result(&out, Some("has no backing file")), Ok(()));
        assert_eq!(check_result(&out, Some(r"top '\w+\[\d\]'")), Ok(()));
        assert!(matches!(
            check_result(&out, Some("Requested operation is not valid")),
            Err(Failure::Fail(_))
        ));
        assert!(matches!(
            check_result(&output(0, "done", ""), Some("error")),
            Err(Failure::Fail(_))
        ));
        assert!(matches!(
            check_result(&out, Some("(unclosed")),
            Err(Failure::Error(_))
        ));
    }
}
