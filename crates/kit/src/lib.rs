//! Model and verify libvirt disk backing chains.
//!
//! The crate predicts how external snapshots and block jobs (commit, pull,
//! copy) reshape a disk's chain of images, and checks the prediction
//! against what libvirt and qemu-img report.

pub mod blockjob;
pub mod chain;
pub mod cmdext;
pub mod commands;
pub mod config;
pub mod disk;
pub mod domain_xml;
pub mod expected;
pub mod libvirt;
pub mod operation;
pub mod outcome;
pub mod qemu_img;
pub mod utils;
pub mod verify;
pub mod xml_utils;
