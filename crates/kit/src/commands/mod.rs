//! chainkit subcommands
//!
//! - `expect`: resolve an expected-chain expression for a disk
//! - `simulate`: apply block operations to a chain without touching a VM
//! - `show`: print the live chain of a disk or image
//! - `verify`: check a live chain against an expected one
//! - `blockjob-wait`: wait for a block job to finish or its mirror to be ready

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Subcommand, ValueEnum};
use color_eyre::{eyre::Context as _, Result};

use crate::config::Config;
use crate::disk::{DiskHandle, DiskType};
use crate::libvirt::LibvirtOptions;

pub mod blockjob_wait;
pub mod expect;
pub mod show;
pub mod simulate;
pub mod verify;

/// Output format for chain listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// One image per line, active layer first
    Lines,
    /// JSON
    Json,
    /// libvirt `<disk>` XML
    Xml,
    /// Human readable table
    Table,
}

/// Options shared by every subcommand
#[derive(Debug, Clone, Default, Args)]
pub struct GlobalOpts {
    /// Hypervisor connection URI (e.g., qemu:///system, qemu+ssh://host/system)
    #[clap(short = 'c', long, global = true)]
    pub connect: Option<String>,

    /// Configuration file (default: ./chainkit.toml when present)
    #[clap(long, global = true)]
    pub config: Option<Utf8PathBuf>,
}

/// Resolved configuration for a command run
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Loaded configuration file, or defaults
    pub config: Config,
    /// libvirt connection, CLI first, then the config file
    pub libvirt: LibvirtOptions,
}

impl CommandContext {
    /// Load configuration from `dir` and apply command line overrides
    fn with_dir(global: &GlobalOpts, dir: &Utf8Path) -> Result<Self> {
        let config = Config::load_or_default(global.config.as_deref(), dir)?;
        let connect = global
            .connect
            .clone()
            .or_else(|| config.connection.uri.clone());
        Ok(Self {
            config,
            libvirt: LibvirtOptions { connect },
        })
    }
}

/// Disk description from flags, layered over a configured `[[disk]]`
#[derive(Debug, Clone, Default, Args)]
pub struct DiskOpts {
    /// Configured disk to start from
    #[clap(long)]
    pub disk: Option<String>,

    /// Guest target device
    #[clap(long)]
    pub target: Option<String>,

    /// Disk type of the active layer
    #[clap(long = "type", value_enum)]
    pub disk_type: Option<DiskType>,

    /// Source of the disk before any snapshot
    #[clap(long)]
    pub base: Option<String>,

    /// External snapshot, in creation order (repeatable)
    #[clap(long = "snapshot")]
    pub snapshots: Vec<String>,

    /// Image for the `backing_file` token
    #[clap(long)]
    pub backing_file: Option<String>,

    /// Destination for the `copy_file` token
    #[clap(long)]
    pub copy_file: Option<String>,
}

impl DiskOpts {
    /// Build the disk handle.
    ///
    /// Without `--base` the disk comes from the configuration; any flag
    /// given overrides the configured value, and `--snapshot` replaces the
    /// configured snapshot list.
    pub fn handle(&self, config: &Config) -> Result<DiskHandle> {
        let configured = match (&self.disk, &self.base) {
            (None, Some(_)) => None,
            (name, _) => Some(config.disk(name.as_deref())?),
        };
        let target = self
            .target
            .clone()
            .or_else(|| configured.map(|d| d.target.clone()))
            .unwrap_or_else(|| "vda".to_string());
        let disk_type = self
            .disk_type
            .or_else(|| configured.map(|d| d.disk_type))
            .unwrap_or(DiskType::File);
        let base = match (&self.base, configured) {
            (Some(base), _) => base.clone(),
            (None, Some(d)) => d.base.clone(),
            (None, None) => color_eyre::eyre::bail!("--base is required"),
        };
        let mut handle = DiskHandle::new(target, disk_type, base);
        let snapshots = if self.snapshots.is_empty() {
            configured.map(|d| d.snapshots.as_slice()).unwrap_or_default()
        } else {
            self.snapshots.as_slice()
        };
        for snapshot in snapshots {
            handle.push_snapshot(snapshot);
        }
        let backing_file = self
            .backing_file
            .as_ref()
            .or_else(|| configured.and_then(|d| d.backing_file.as_ref()));
        if let Some(path) = backing_file {
            handle.set_backing_file(path);
        }
        let copy_file = self
            .copy_file
            .as_ref()
            .or_else(|| configured.and_then(|d| d.copy_file.as_ref()));
        if let Some(path) = copy_file {
            handle.set_copy_file(path);
        }
        Ok(handle)
    }
}

/// Available chainkit commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Resolve an expected-chain expression such as `3>1>base`
    Expect(expect::ExpectOpts),

    /// Apply commit/pull/copy operations to a chain and print the result
    Simulate(simulate::SimulateOpts),

    /// Show the backing chain of a domain disk or an image
    Show(show::ShowOpts),

    /// Verify a live backing chain against an expected one
    Verify(verify::VerifyOpts),

    /// Wait for a block job to finish or its mirror to become ready
    #[clap(name = "blockjob-wait")]
    BlockjobWait(blockjob_wait::BlockjobWaitOpts),
}

impl Commands {
    /// Run the selected command
    pub fn run(self, global: &GlobalOpts) -> Result<()> {
        self.run_in(global, &current_dir()?)
    }

    /// `simulate` never reads the configuration, so it is only loaded for
    /// the other commands
    fn run_in(self, global: &GlobalOpts, dir: &Utf8Path) -> Result<()> {
        let ctx = || CommandContext::with_dir(global, dir);
        match self {
            Self::Expect(opts) => expect::run(&ctx()?, opts),
            Self::Simulate(opts) => simulate::run(opts),
            Self::Show(opts) => show::run(&ctx()?, opts),
            Self::Verify(opts) => verify::run(&ctx()?, opts),
            Self::BlockjobWait(opts) => blockjob_wait::run(&ctx()?, opts),
        }
    }
}

fn current_dir() -> Result<Utf8PathBuf> {
    let cwd = std::env::current_dir().context("Getting current directory")?;
    Utf8PathBuf::try_from(cwd).context("Current directory is not UTF-8")
}

/// Reject a format a command has no rendering for
pub(crate) fn unsupported_format(command: &str, format: OutputFormat) -> color_eyre::Report {
    color_eyre::eyre::eyre!("{format:?} format is not supported for {command} command")
}
