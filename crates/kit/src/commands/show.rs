//! Print the live backing chain of a disk or image

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};
use color_eyre::{
    eyre::{bail, Context as _},
    Result,
};
use comfy_table::{presets::UTF8_FULL, Table};

use super::{unsupported_format, CommandContext, OutputFormat};
use crate::domain_xml::{self, DiskInfo};
use crate::qemu_img::{ForceShare, QemuImg, QemuImgInfo};

/// Where the chain is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum ChainSource {
    /// Domain XML
    Xml,
    /// `qemu-img info --backing-chain`
    QemuImg,
}

/// Options for showing a backing chain
#[derive(Debug, Parser)]
pub struct ShowOpts {
    /// Domain name
    #[clap(long, requires = "target", conflicts_with = "image")]
    pub domain: Option<String>,

    /// Guest target device (e.g. vda)
    #[clap(long, requires = "domain")]
    pub target: Option<String>,

    /// Image to inspect with qemu-img
    #[clap(long)]
    pub image: Option<Utf8PathBuf>,

    /// Read the inactive domain definition
    #[clap(long)]
    pub inactive: bool,

    /// Introspection method
    #[clap(long, value_enum, default_value_t = ChainSource::Xml)]
    pub source: ChainSource,

    /// Override the configured `-U` behavior
    #[clap(long, value_enum)]
    pub force_share: Option<ForceShare>,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

fn xml_table(disk: &DiskInfo) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["#", "TYPE", "FORMAT", "INDEX", "IMAGE"]);
    let layers = disk.source.iter().chain(&disk.backing);
    for (i, layer) in layers.enumerate() {
        table.add_row(vec![
            (i + 1).to_string(),
            layer.disk_type.to_string(),
            layer.format.clone().unwrap_or_else(|| "-".into()),
            layer.index.map_or_else(|| "-".into(), |i| i.to_string()),
            layer.identifier.clone(),
        ]);
    }
    table
}

fn qemu_img_table(infos: &[QemuImgInfo]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["#", "FORMAT", "VIRTUAL SIZE", "IMAGE", "BACKING FILE"]);
    for (i, info) in infos.iter().enumerate() {
        table.add_row(vec![
            (i + 1).to_string(),
            info.format.clone(),
            info.virtual_size.to_string(),
            info.filename.clone(),
            info.backing_filename.clone().unwrap_or_else(|| "-".into()),
        ]);
    }
    table
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).with_context(|| "Failed to serialize chain as JSON")?
    );
    Ok(())
}

/// Execute the show command
pub fn run(ctx: &CommandContext, opts: ShowOpts) -> Result<()> {
    let disk = match (&opts.domain, &opts.target) {
        (Some(domain), Some(target)) => Some(domain_xml::introspect_disk(
            &ctx.libvirt,
            domain,
            target,
            opts.inactive,
        )?),
        _ => None,
    };

    match opts.source {
        ChainSource::Xml => {
            let Some(disk) = disk else {
                bail!("--source xml needs --domain and --target");
            };
            match opts.format {
                OutputFormat::Table => println!("{}", xml_table(&disk)),
                OutputFormat::Json => print_json(&disk)?,
                OutputFormat::Lines => {
                    for image in &disk.chain()? {
                        println!("{image}");
                    }
                }
                OutputFormat::Xml => return Err(unsupported_format("show", opts.format)),
            }
        }
        ChainSource::QemuImg => {
            let active = match (&opts.image, &disk) {
                (Some(image), _) => image.clone(),
                (None, Some(disk)) => Utf8PathBuf::from(disk.chain()?.active()),
                (None, None) => bail!("--source qemu-img needs --image or --domain and --target"),
            };
            let mode = opts.force_share.unwrap_or(ctx.config.qemu_img.force_share);
            let qemu_img = QemuImg::detect(mode)?;
            let infos = qemu_img.backing_chain(Utf8Path::new(&active))?;
            match opts.format {
                OutputFormat::Table => println!("{}", qemu_img_table(&infos)),
                OutputFormat::Json => print_json(&infos)?,
                OutputFormat::Lines => {
                    for image in crate::verify::qemu_img_chain(&infos) {
                        println!("{image}");
                    }
                }
                OutputFormat::Xml => return Err(unsupported_format("show", opts.format)),
            }
        }
    }
    Ok(())
}
