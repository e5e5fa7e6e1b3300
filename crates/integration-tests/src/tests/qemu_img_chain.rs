//! Real qcow2 chains built with qemu-img, checked by the qemu-img method
//!
//! Every test builds `base.qcow2 <- snap1 <- snap2 <- snap3` in a fresh
//! temporary directory and verifies the chain before and after reshaping it
//! with `qemu-img commit`/`rebase`.

use camino::{Utf8Path, Utf8PathBuf};
use chainkit::chain::ChainState;
use chainkit::disk::{DiskHandle, DiskType};
use chainkit::libvirt::LibvirtOptions;
use chainkit::operation::ChainOperation;
use chainkit::outcome::check_result;
use chainkit::qemu_img::{self, Backing, ForceShare, QemuImg};
use chainkit::verify::{ChainMismatch, VerifyContext};
use color_eyre::eyre::{ensure, eyre};
use color_eyre::Result;
use tempfile::TempDir;
use xshell::{cmd, Shell};

use crate::{integration_test, run_chainkit, run_chainkit_stdout};

struct Fixture {
    // Removed on drop
    _dir: TempDir,
    path: Utf8PathBuf,
    disk: DiskHandle,
}

impl Fixture {
    /// Build a base image and `snapshots` external overlays.
    ///
    /// With `relative`, overlays record their backing file by name only.
    fn new(snapshots: usize, relative: bool) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = Utf8Path::from_path(dir.path())
            .ok_or_else(|| eyre!("non-UTF-8 tempdir"))?
            .to_owned();
        let base = path.join("base.qcow2");
        qemu_img::create(&base, "qcow2", None, Some("16M"))?;

        let mut disk = DiskHandle::new("vda", DiskType::File, base.as_str());
        let mut previous = base;
        for i in 1..=snapshots {
            let image = path.join(format!("snap{i}"));
            let recorded = if relative {
                previous.file_name().unwrap_or(previous.as_str()).to_string()
            } else {
                previous.to_string()
            };
            let backing = Backing {
                file: &recorded,
                format: "qcow2",
            };
            qemu_img::create(&image, "qcow2", Some(backing), None)?;
            disk.push_snapshot(image.as_str());
            previous = image;
        }
        Ok(Self {
            _dir: dir,
            path,
            disk,
        })
    }

    fn image(&self, name: &str) -> Utf8PathBuf {
        self.path.join(name)
    }
}

fn verifier(libvirt: &LibvirtOptions, keep_relative: bool) -> Result<VerifyContext<'_>> {
    Ok(VerifyContext {
        libvirt,
        qemu_img: QemuImg::detect(ForceShare::Auto)?,
        inactive: false,
        keep_relative,
    })
}

fn test_qemu_img_fresh_chain() -> Result<()> {
    let fixture = Fixture::new(3, false)?;
    let libvirt = LibvirtOptions::default();
    let verifier = verifier(&libvirt, false)?;

    let expected = fixture.disk.expected_chain("3>2>1>base")?;
    ensure!(expected == fixture.disk.initial_chain()?);
    verifier.verify_qemu_img(None, &expected)?;

    let skipped = fixture.disk.expected_chain("3>1>base")?;
    let err = verifier
        .verify_qemu_img(None, &skipped)
        .err()
        .ok_or_else(|| eyre!("a chain skipping snap2 was accepted"))?;
    let mismatch = err
        .downcast_ref::<ChainMismatch>()
        .ok_or_else(|| eyre!("expected a chain mismatch, got {err:?}"))?;
    ensure!(mismatch.actual.len() == 4, "{mismatch}");
    Ok(())
}
integration_test!(test_qemu_img_fresh_chain, QemuImg);

fn test_qemu_img_relative_backing() -> Result<()> {
    let libvirt = LibvirtOptions::default();

    let relative = Fixture::new(2, true)?;
    let expected = relative.disk.expected_chain("top>1>base")?;
    verifier(&libvirt, true)?.verify_qemu_img(None, &expected)?;

    let absolute = Fixture::new(2, false)?;
    let expected = absolute.disk.expected_chain("top>1>base")?;
    verifier(&libvirt, false)?.verify_qemu_img(None, &expected)?;
    let err = verifier(&libvirt, true)?
        .verify_qemu_img(None, &expected)
        .err()
        .ok_or_else(|| eyre!("absolute backing files passed the relative check"))?;
    ensure!(err.to_string().contains("absolute"), "{err}");
    Ok(())
}
integration_test!(test_qemu_img_relative_backing, QemuImg);

/// A non-active commit of snap1 into base, the way libvirt performs it:
/// merge the data, then point snap2 at base.
fn test_qemu_img_commit_matches_simulation() -> Result<()> {
    let fixture = Fixture::new(3, false)?;
    let op: ChainOperation = "commit:3:4".parse()?;
    let predicted = op.apply(&fixture.disk.initial_chain()?)?;
    ensure!(predicted == fixture.disk.expected_chain("3>2>base")?);

    let sh = Shell::new()?;
    let snap1 = fixture.image("snap1");
    let snap2 = fixture.image("snap2");
    let base = fixture.image("base.qcow2");
    cmd!(sh, "qemu-img commit -q -d {snap1}").run()?;
    cmd!(sh, "qemu-img rebase -u -F qcow2 -b {base} {snap2}").run()?;

    let libvirt = LibvirtOptions::default();
    verifier(&libvirt, false)?.verify_qemu_img(None, &predicted)?;
    Ok(())
}
integration_test!(test_qemu_img_commit_matches_simulation, QemuImg);

fn test_cli_verify_qemu_img() -> Result<()> {
    let fixture = Fixture::new(2, true)?;
    let chain: ChainState = fixture.disk.initial_chain()?;
    let chain_arg = chain.images().join(">");

    let stdout = run_chainkit_stdout(&[
        "verify",
        "--chain",
        &chain_arg,
        "--method",
        "qemu-img",
        "--keep-relative",
    ])?;
    ensure!(stdout.starts_with("ok:"), "{stdout}");

    let wrong = format!("{}>{}", chain.active(), chain.base());
    let out = run_chainkit(&["verify", "--chain", &wrong, "--method", "qemu-img"])?;
    check_result(&out, Some("chain check failed"))?;
    Ok(())
}
integration_test!(test_cli_verify_qemu_img, QemuImg);

fn test_cli_show_image() -> Result<()> {
    let fixture = Fixture::new(2, false)?;
    let top = fixture.image("snap2");
    let stdout = run_chainkit_stdout(&[
        "show",
        "--image",
        top.as_str(),
        "--source",
        "qemu-img",
        "--format",
        "lines",
    ])?;
    let lines: Vec<&str> = stdout.lines().collect();
    ensure!(
        lines == fixture.disk.initial_chain()?.images(),
        "unexpected chain: {lines:?}"
    );
    Ok(())
}
integration_test!(test_cli_show_image, QemuImg);
