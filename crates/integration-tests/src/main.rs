//! Integration tests for chainkit

use camino::Utf8Path;

use chainkit::outcome::CapturedOutput;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};

pub(crate) use integration_tests::{
    integration_test, INTEGRATION_TESTS, TEST_DOMAIN_ENV, TEST_TARGET_ENV,
};

mod tests {
    pub mod cli;
    pub mod libvirt_chain;
    pub mod qemu_img_chain;
}

/// Get the path to the chainkit binary, checking CHAINKIT_PATH first, then falling back to "chainkit"
pub(crate) fn get_chainkit_command() -> Result<String> {
    if let Ok(path) = std::env::var("CHAINKIT_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/chainkit", "target/release/chainkit"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set CHAINKIT_PATH={path} to run using this binary"
        ));
    }
    Ok("chainkit".to_owned())
}

/// Domain and disk target the libvirt tests introspect
pub(crate) fn get_test_disk() -> Result<(String, String)> {
    let domain = std::env::var(TEST_DOMAIN_ENV)
        .with_context(|| format!("{TEST_DOMAIN_ENV} is not set"))?;
    let target = std::env::var(TEST_TARGET_ENV).unwrap_or_else(|_| "vda".to_string());
    Ok((domain, target))
}

/// Run the chainkit command, capturing output
pub(crate) fn run_chainkit(args: &[&str]) -> Result<CapturedOutput> {
    let bin = get_chainkit_command()?;
    let output = std::process::Command::new(&bin)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {bin}"))?;
    Ok(CapturedOutput::new(output))
}

/// Run chainkit, requiring success, and return its stdout
pub(crate) fn run_chainkit_stdout(args: &[&str]) -> Result<String> {
    let out = run_chainkit(args)?;
    chainkit::outcome::check_result(&out, None)
        .with_context(|| format!("chainkit {}", args.join(" ")))?;
    Ok(out.stdout)
}

fn main() {
    let args = Arguments::from_args();

    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let f = test.f;
            Trial::test(test.name, move || f().map_err(|e| format!("{:?}", e).into()))
                .with_ignored_flag(!test.requires.is_met())
        })
        .collect();

    libtest_mimic::run(&args, tests).exit();
}
