//! Shared library code for integration tests
//!
//! Tests register themselves in [`INTEGRATION_TESTS`] together with the
//! host resources they need; the runner marks a test ignored when one of
//! them is missing.

// Unfortunately needed here to work with linkme
#![allow(unsafe_code)]

use linkme::distributed_slice;

/// Environment variable naming a libvirt domain the tests may introspect
pub const TEST_DOMAIN_ENV: &str = "CHAINKIT_TEST_DOMAIN";

/// Environment variable naming the disk target of the test domain
pub const TEST_TARGET_ENV: &str = "CHAINKIT_TEST_TARGET";

/// A test function that returns a Result
pub type TestFn = fn() -> color_eyre::Result<()>;

/// Host resource a test depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Runs anywhere the binary under test runs
    Nothing,
    /// Needs `qemu-img` in PATH
    QemuImg,
    /// Needs `virsh` and a domain named by [`TEST_DOMAIN_ENV`]
    Domain,
}

impl Requirement {
    /// Whether the requirement is met on this host
    pub fn is_met(self) -> bool {
        match self {
            Self::Nothing => true,
            Self::QemuImg => chainkit::qemu_img::is_available(),
            Self::Domain => std::env::var_os(TEST_DOMAIN_ENV).is_some(),
        }
    }
}

/// Metadata for a registered integration test
#[derive(Debug)]
pub struct IntegrationTest {
    /// Name of the integration test
    pub name: &'static str,
    /// Test function to execute
    pub f: TestFn,
    /// Resource the test needs
    pub requires: Requirement,
}

impl IntegrationTest {
    /// Create a new integration test with the given name and function
    pub const fn new(name: &'static str, f: TestFn, requires: Requirement) -> Self {
        Self { name, f, requires }
    }
}

/// Distributed slice holding all registered integration tests
#[distributed_slice]
pub static INTEGRATION_TESTS: [IntegrationTest];

/// Register an integration test with less boilerplate.
///
/// # Examples
///
/// ```ignore
/// fn test_commit_chain() -> Result<()> {
///     let out = run_chainkit(&["simulate", "--chain", "a>b", "pull"])?;
///     check_result(&out, None)?;
///     Ok(())
/// }
/// integration_test!(test_commit_chain, QemuImg);
/// ```
#[macro_export]
macro_rules! integration_test {
    ($fn_name:ident) => {
        $crate::integration_test!($fn_name, Nothing);
    };
    ($fn_name:ident, $requires:ident) => {
        ::paste::paste! {
            #[::linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            static [<$fn_name:upper>]: $crate::IntegrationTest = $crate::IntegrationTest::new(
                stringify!($fn_name),
                $fn_name,
                $crate::Requirement::$requires,
            );
        }
    };
}
