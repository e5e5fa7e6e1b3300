//! Backing chain verification
//!
//! An expected [`ChainState`] is checked against the live chain with two
//! independent methods: the `<source>`/`<backingStore>` elements of the
//! domain XML, and `qemu-img info --backing-chain` on the active image.
//! Any missing, extra or mismatched layer is a [`ChainMismatch`]; nothing
//! is retried.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use color_eyre::{eyre::Context, Result};
use itertools::Itertools;
use regex::Regex;
use serde::Serialize;
use strum::Display;
use tracing::{debug, info, warn};

use crate::chain::ChainState;
use crate::domain_xml;
use crate::libvirt::LibvirtOptions;
use crate::qemu_img::{QemuImg, QemuImgInfo};

/// How a chain is introspected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, clap::ValueEnum)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
#[clap(rename_all = "kebab-case")]
pub enum VerifyMethod {
    /// Domain XML `<source>` and `<backingStore>` elements
    Xml,
    /// Text output of `qemu-img info --backing-chain`
    QemuImg,
    /// Both of the above; they must agree
    Both,
}

/// The live chain differs from the expected one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{method} chain check failed: {detail}\n  expected: {}\n  found:    {}",
    .expected.iter().join(" > "), .actual.iter().join(" > "))]
pub struct ChainMismatch {
    /// Which check failed
    pub method: String,
    /// Expected layers, active first
    pub expected: Vec<String>,
    /// Layers found, active first
    pub actual: Vec<String>,
    /// What differs
    pub detail: String,
}

/// Compare element-wise; the first difference is reported
pub fn compare_chains(
    method: &str,
    expected: &ChainState,
    actual: &[String],
) -> Result<(), ChainMismatch> {
    let mismatch = |detail: String| ChainMismatch {
        method: method.to_string(),
        expected: expected.images().to_vec(),
        actual: actual.to_vec(),
        detail,
    };
    for (i, pair) in expected.iter().zip_longest(actual).enumerate() {
        let position = i + 1;
        match pair {
            itertools::EitherOrBoth::Both(e, a) if e == a => {}
            itertools::EitherOrBoth::Both(e, a) => {
                return Err(mismatch(format!(
                    "layer {position} is {a:?}, expected {e:?}"
                )))
            }
            itertools::EitherOrBoth::Left(e) => {
                return Err(mismatch(format!("layer {position} ({e:?}) is missing")))
            }
            itertools::EitherOrBoth::Right(a) => {
                return Err(mismatch(format!("unexpected extra layer {position} ({a:?})")))
            }
        }
    }
    Ok(())
}

/// Build the regex that `qemu-img info --backing-chain` output must match:
/// each image line followed (within its block) by a `backing file:` line
/// naming the next layer, either directly or as its resolved actual path.
pub fn backing_chain_pattern(expected: &ChainState) -> Result<Regex, regex::Error> {
    let mut pattern = String::from("(?s)");
    let images = expected.images();
    for (i, image) in images.iter().enumerate() {
        let escaped = regex::escape(image);
        pattern.push_str(&format!("image: {escaped}\n"));
        if let Some(next) = images.get(i + 1) {
            let next = regex::escape(next);
            pattern.push_str(&format!(
                r".*?backing file: (?:{next}|[^\n]* \(actual path: {next}\))(?:\n|\z).*?"
            ));
        }
    }
    Regex::new(&pattern)
}

/// One image block of the text output
#[derive(Debug, Clone, PartialEq, Eq)]
struct TextBlock {
    image: String,
    backing: Option<String>,
}

fn parse_text_blocks(output: &str) -> Vec<TextBlock> {
    let mut blocks: Vec<TextBlock> = Vec::new();
    for line in output.lines() {
        if let Some(image) = line.strip_prefix("image: ") {
            blocks.push(TextBlock {
                image: image.to_string(),
                backing: None,
            });
        } else if let Some(backing) = line.strip_prefix("backing file: ") {
            // Relative references are printed with the resolved path appended
            let resolved = backing
                .strip_suffix(')')
                .and_then(|b| b.split_once(" (actual path: "))
                .map_or(backing, |(_, actual)| actual);
            if let Some(block) = blocks.last_mut() {
                block.backing = Some(resolved.to_string());
            }
        }
    }
    blocks
}

/// Check `qemu-img info --backing-chain` text output against `expected`
pub fn match_qemu_img_text(expected: &ChainState, output: &str) -> Result<(), ChainMismatch> {
    const METHOD: &str = "qemu-img";
    let blocks = parse_text_blocks(output);
    let actual: Vec<String> = blocks.iter().map(|b| b.image.clone()).collect();
    compare_chains(METHOD, expected, &actual)?;

    let fail = |detail: String| ChainMismatch {
        method: METHOD.to_string(),
        expected: expected.images().to_vec(),
        actual: actual.clone(),
        detail,
    };
    for (block, next) in blocks.iter().tuple_windows() {
        match &block.backing {
            Some(b) if b == &next.image => {}
            Some(b) => {
                return Err(fail(format!(
                    "{} is backed by {b:?}, not {:?}",
                    block.image, next.image
                )))
            }
            None => return Err(fail(format!("{} has no backing file", block.image))),
        }
    }
    if let Some(last) = blocks.last() {
        if let Some(b) = &last.backing {
            return Err(fail(format!("base {} still has backing file {b:?}", last.image)));
        }
    }
    match backing_chain_pattern(expected) {
        Ok(re) if re.is_match(output) => {}
        Ok(_) => return Err(fail("output does not match the backing chain pattern".into())),
        Err(e) => return Err(fail(format!("cannot build backing chain pattern: {e}"))),
    }
    Ok(())
}

/// Lexically normalize a path, dropping `.` and folding `..`
pub fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_str()),
        }
    }
    out
}

/// `protocol://...` references are not filesystem paths
fn is_network(reference: &str) -> bool {
    reference.contains("://")
}

/// Resolve a backing reference recorded in `image` the way qemu does:
/// relative names are relative to the directory holding the image.
/// Network references are returned as recorded.
pub fn resolve_backing(image: &str, backing: &str) -> String {
    if is_network(backing) {
        return backing.to_string();
    }
    let backing_path = Utf8Path::new(backing);
    if backing_path.is_absolute() {
        return normalize_path(backing_path).into_string();
    }
    let dir = Utf8Path::new(image).parent().unwrap_or(Utf8Path::new(""));
    normalize_path(&dir.join(backing_path)).into_string()
}

/// Chain described by `qemu-img info --backing-chain --output=json`.
///
/// The first layer is reported as given on the command line; each further
/// layer is the resolved backing reference of the one above it.
pub fn qemu_img_chain(infos: &[QemuImgInfo]) -> Vec<String> {
    infos
        .iter()
        .map(|i| {
            if is_network(&i.filename) {
                i.filename.clone()
            } else {
                normalize_path(Utf8Path::new(&i.filename)).into_string()
            }
        })
        .collect()
}

/// Check the JSON backing chain element-wise, including backing links
pub fn match_qemu_img_json(
    expected: &ChainState,
    infos: &[QemuImgInfo],
    keep_relative: bool,
) -> Result<(), ChainMismatch> {
    const METHOD: &str = "qemu-img json";
    let actual = qemu_img_chain(infos);
    compare_chains(METHOD, expected, &actual)?;
    let fail = |detail: String| ChainMismatch {
        method: METHOD.to_string(),
        expected: expected.images().to_vec(),
        actual: actual.clone(),
        detail,
    };
    for (info, next) in infos.iter().zip(actual.iter().skip(1)) {
        let Some(recorded) = info.backing_filename.as_deref() else {
            return Err(fail(format!("{} has no backing file", info.filename)));
        };
        let resolved = resolve_backing(&info.filename, recorded);
        if &resolved != next {
            return Err(fail(format!(
                "{} is backed by {recorded:?}, which resolves to {resolved:?}, not {next:?}",
                info.filename
            )));
        }
        if keep_relative && Utf8Path::new(recorded).is_absolute() {
            return Err(fail(format!(
                "{} records absolute backing file {recorded:?}; expected a relative reference",
                info.filename
            )));
        }
    }
    if let Some(last) = infos.last() {
        if let Some(b) = &last.backing_filename {
            return Err(fail(format!(
                "base {} still has backing file {b:?}",
                last.filename
            )));
        }
    }
    Ok(())
}

/// Everything needed to introspect a live disk
#[derive(Debug, Clone)]
pub struct VerifyContext<'a> {
    /// libvirt connection
    pub libvirt: &'a LibvirtOptions,
    /// qemu-img invocation settings
    pub qemu_img: QemuImg,
    /// Read the inactive definition instead of the live one
    pub inactive: bool,
    /// Require relative backing references
    pub keep_relative: bool,
}

impl VerifyContext<'_> {
    /// Compare `expected` with the chain in the domain XML, returning the disk
    pub fn verify_xml(
        &self,
        domain: &str,
        target: &str,
        expected: &ChainState,
    ) -> Result<domain_xml::DiskInfo> {
        let disk = domain_xml::introspect_disk(self.libvirt, domain, target, self.inactive)?;
        check_disk_xml(&disk, expected)?;
        info!("domain XML chain of {domain}/{target} matches: {expected}");
        Ok(disk)
    }

    /// Compare `expected` with qemu-img's view.
    ///
    /// qemu-img is pointed at `image`, or at the expected active layer.
    pub fn verify_qemu_img(&self, image: Option<&Utf8Path>, expected: &ChainState) -> Result<()> {
        let active = image.unwrap_or(Utf8Path::new(expected.active()));
        let text = self.qemu_img.backing_chain_text(active)?;
        debug!("qemu-img backing chain of {active}:\n{text}");
        match_qemu_img_text(expected, &text)?;
        let infos = self.qemu_img.backing_chain(active)?;
        match_qemu_img_json(expected, &infos, self.keep_relative)?;
        info!("qemu-img chain of {active} matches: {expected}");
        Ok(())
    }

    /// Follow a passed domain XML check with the qemu-img check when the
    /// disk is local. Returns whether qemu-img ran.
    fn verify_qemu_img_after_xml(
        &self,
        disk: &domain_xml::DiskInfo,
        image: Option<&Utf8Path>,
        expected: &ChainState,
    ) -> Result<bool> {
        if !disk.disk_type.is_local() {
            warn!(
                "Skipping qemu-img check for {} disk {}; only the domain XML was checked",
                disk.disk_type, disk.target
            );
            return Ok(false);
        }
        self.verify_qemu_img(image, expected)
            .context("qemu-img check")?;
        Ok(true)
    }

    /// Run the checks selected by `method`.
    ///
    /// With [`VerifyMethod::Both`], the qemu-img check only runs when the
    /// active layer in the domain XML is a local file or block device.
    pub fn verify(
        &self,
        method: VerifyMethod,
        disk: Option<(&str, &str)>,
        image: Option<&Utf8Path>,
        expected: &ChainState,
    ) -> Result<()> {
        let require_disk = || {
            disk.ok_or_else(|| {
                color_eyre::eyre::eyre!("The domain XML check needs a domain and a target")
            })
        };
        match method {
            VerifyMethod::Xml => {
                let (domain, target) = require_disk()?;
                self.verify_xml(domain, target, expected).map(drop)
            }
            VerifyMethod::QemuImg => self.verify_qemu_img(image, expected),
            VerifyMethod::Both => {
                let (domain, target) = require_disk()?;
                let info = self
                    .verify_xml(domain, target, expected)
                    .context("Domain XML check")?;
                self.verify_qemu_img_after_xml(&info, image, expected)
                    .map(drop)
            }
        }
    }
}

/// Compare `expected` with an already parsed `<disk>`
pub fn check_disk_xml(disk: &domain_xml::DiskInfo, expected: &ChainState) -> Result<()> {
    let actual = disk.chain()?;
    compare_chains("domain XML", expected, actual.images())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskHandle, DiskType};
    use crate::xml_utils::parse_xml_dom;
    use indoc::indoc;

    const TEXT: &str = indoc! {"
        image: /images/base.snap2
        file format: qcow2
        virtual size: 10 GiB (10737418240 bytes)
        disk size: 196 KiB
        cluster_size: 65536
        backing file: /images/base.snap1
        backing file format: qcow2
        Format specific information:
            compat: 1.1
            compression type: zlib
            lazy refcounts: false
            refcount bits: 16
            corrupt: false
            extended l2: false

        image: /images/base.snap1
        file format: qcow2
        virtual size: 10 GiB (10737418240 bytes)
        disk size: 196 KiB
        cluster_size: 65536
        backing file: base.qcow2 (actual path: /images/base.qcow2)
        backing file format: qcow2

        image: /images/base.qcow2
        file format: qcow2
        virtual size: 10 GiB (10737418240 bytes)
        disk size: 1.2 GiB
        cluster_size: 65536
    "};

    fn expected(images: &[&str]) -> ChainState {
        ChainState::new(images.iter().copied()).unwrap()
    }

    #[test]
    fn test_compare_chains() {
        let e = expected(&["a", "b", "c"]);
        assert!(compare_chains("t", &e, &["a".into(), "b".into(), "c".into()]).is_ok());

        let err = compare_chains("t", &e, &["a".into(), "x".into(), "c".into()]).unwrap_err();
        assert_eq!(err.detail, r#"layer 2 is "x", expected "b""#);

        let err = compare_chains("t", &e, &["a".into(), "b".into()]).unwrap_err();
        assert!(err.detail.contains("missing"));

        let err = compare_chains("t", &e, &["a".into(), "b".into(), "c".into(), "d".into()])
            .unwrap_err();
        assert!(err.detail.contains("extra"));
        assert!(err.to_string().contains("expected: a > b > c"));
    }

    #[test]
    fn test_text_match() {
        let e = expected(&["/images/base.snap2", "/images/base.snap1", "/images/base.qcow2"]);
        match_qemu_img_text(&e, TEXT).unwrap();
        assert!(backing_chain_pattern(&e).unwrap().is_match(TEXT));
    }

    #[test]
    fn test_text_mismatch() {
        let skipped = expected(&["/images/base.snap2", "/images/base.qcow2"]);
        let err = match_qemu_img_text(&skipped, TEXT).unwrap_err();
        assert_eq!(err.actual.len(), 3);

        let wrong = expected(&["/images/base.snap2", "/images/base.snap1", "/images/other"]);
        assert!(match_qemu_img_text(&wrong, TEXT).is_err());
    }

    #[test]
    fn test_text_broken_link() {
        // A block whose backing line points somewhere other than the next image
        let text = TEXT.replace(
            "backing file: /images/base.snap1\n",
            "backing file: /images/elsewhere\n",
        );
        let e = expected(&["/images/base.snap2", "/images/base.snap1", "/images/base.qcow2"]);
        let err = match_qemu_img_text(&e, &text).unwrap_err();
        assert!(err.detail.contains("elsewhere"), "{}", err.detail);
    }

    #[test]
    fn test_pattern_does_not_accept_prefix() {
        let e = expected(&["/images/snap1", "/images/base"]);
        let text = "image: /images/snap1\nbacking file: /images/base10\n\nimage: /images/base10\n";
        assert!(!backing_chain_pattern(&e).unwrap().is_match(text));
    }

    #[test]
    fn test_resolve_backing() {
        assert_eq!(resolve_backing("/images/snap2", "snap1"), "/images/snap1");
        assert_eq!(
            resolve_backing("/images/a/snap2", "../b/./snap1"),
            "/images/b/snap1"
        );
        assert_eq!(resolve_backing("/images/snap2", "/abs/base"), "/abs/base");
        assert_eq!(normalize_path(Utf8Path::new("/x/./y/../z")), "/x/z");
    }

    #[test]
    fn test_resolve_network_backing() {
        assert_eq!(
            resolve_backing("/images/a", "rbd://host/pool/img"),
            "rbd://host/pool/img"
        );
        let infos = [
            info("nbd://localhost/export", Some("nbd://localhost/base")),
            info("nbd://localhost/base", None),
        ];
        assert_eq!(
            qemu_img_chain(&infos),
            ["nbd://localhost/export", "nbd://localhost/base"]
        );
        let e = expected(&["nbd://localhost/export", "nbd://localhost/base"]);
        match_qemu_img_json(&e, &infos, false).unwrap();
    }

    fn info(filename: &str, backing: Option<&str>) -> QemuImgInfo {
        QemuImgInfo {
            virtual_size: 1 << 30,
            filename: filename.to_string(),
            format: "qcow2".to_string(),
            actual_size: None,
            cluster_size: Some(65536),
            backing_filename: backing.map(str::to_string),
            full_backing_filename: None,
            backing_filename_format: backing.map(|_| "qcow2".to_string()),
            dirty_flag: Some(false),
        }
    }

    #[test]
    fn test_json_match_and_keep_relative() {
        let e = expected(&["/images/snap2", "/images/snap1", "/images/base"]);
        let relative = [
            info("/images/snap2", Some("snap1")),
            info("/images/snap1", Some("base")),
            info("/images/base", None),
        ];
        match_qemu_img_json(&e, &relative, true).unwrap();

        let absolute = [
            info("/images/snap2", Some("/images/snap1")),
            info("/images/snap1", Some("/images/base")),
            info("/images/base", None),
        ];
        match_qemu_img_json(&e, &absolute, false).unwrap();
        let err = match_qemu_img_json(&e, &absolute, true).unwrap_err();
        assert!(err.detail.contains("absolute"));
    }

    #[test]
    fn test_json_base_with_backing() {
        let e = expected(&["/images/snap1"]);
        let infos = [info("/images/snap1", Some("base"))];
        let err = match_qemu_img_json(&e, &infos, false).unwrap_err();
        assert!(err.detail.contains("still has backing file"));
    }

    /// What `qemu-img info --backing-chain` prints for a fresh chain
    fn qemu_img_text_for(chain: &ChainState) -> String {
        let images = chain.images();
        let mut text = String::new();
        for (i, image) in images.iter().enumerate() {
            text.push_str(&format!("image: {image}\nfile format: qcow2\n"));
            if let Some(next) = images.get(i + 1) {
                text.push_str(&format!(
                    "backing file: {next}\nbacking file format: qcow2\n"
                ));
            }
            text.push('\n');
        }
        text
    }

    fn parsed_disk(disk: &DiskHandle, chain: &ChainState) -> domain_xml::DiskInfo {
        let xml = disk.render_disk_xml(chain).unwrap();
        domain_xml::DiskInfo::from_node(&parse_xml_dom(&xml).unwrap()).unwrap()
    }

    #[test]
    fn test_fresh_chain_methods_agree() {
        let mut disk = DiskHandle::new("vda", DiskType::File, "/images/base.qcow2");
        for i in 1..=3 {
            disk.push_snapshot(format!("/images/base.snap{i}"));
        }
        let chain = disk.initial_chain().unwrap();
        let parsed = parsed_disk(&disk, &chain);
        check_disk_xml(&parsed, &chain).unwrap();
        match_qemu_img_text(&chain, &qemu_img_text_for(&chain)).unwrap();

        // Both methods reject the same wrong expectation
        let wrong = disk.expected_chain("3>1>base").unwrap();
        assert!(check_disk_xml(&parsed, &wrong).is_err());
        assert!(match_qemu_img_text(&wrong, &qemu_img_text_for(&chain)).is_err());
    }

    fn context(libvirt: &LibvirtOptions) -> VerifyContext<'_> {
        VerifyContext {
            libvirt,
            qemu_img: QemuImg::with_force_share(true),
            inactive: false,
            keep_relative: false,
        }
    }

    #[test]
    fn test_both_skips_qemu_img_for_volume() {
        let mut disk = DiskHandle::new("vdb", DiskType::Volume, "images/base.qcow2");
        disk.push_snapshot("images/snap1.qcow2");
        let chain = disk.initial_chain().unwrap();
        let parsed = parsed_disk(&disk, &chain);
        assert_eq!(parsed.disk_type, DiskType::Volume);
        check_disk_xml(&parsed, &chain).unwrap();

        let libvirt = LibvirtOptions::default();
        let ran = context(&libvirt)
            .verify_qemu_img_after_xml(&parsed, None, &chain)
            .unwrap();
        assert!(!ran);
    }

    #[test]
    fn test_xml_methods_need_disk() {
        let libvirt = LibvirtOptions::default();
        let chain = expected(&["/images/snap1", "/images/base"]);
        for method in [VerifyMethod::Xml, VerifyMethod::Both] {
            let err = context(&libvirt)
                .verify(method, None, None, &chain)
                .unwrap_err();
            assert!(err.to_string().contains("needs a domain and a target"), "{err}");
        }
    }
}
