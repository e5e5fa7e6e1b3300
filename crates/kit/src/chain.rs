//! Backing chain state
//!
//! A [`ChainState`] is the ordered list of image identifiers a disk depends
//! on, from the active layer (position 1) down to the base image. The
//! identifiers are whatever libvirt and qemu-img report for the layer: a
//! file path, a block device node, a volume name, or a network URL.

use std::fmt;
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Separator between layers in chain expressions, active layer first
pub const CHAIN_SEPARATOR: char = '>';

/// Errors from building or transforming a backing chain
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// A 1-based index fell outside the list it refers to
    #[error("index {index} is out of range (1..={len})")]
    IndexOutOfRange {
        /// The offending index
        index: usize,
        /// Number of entries available
        len: usize,
    },
    /// The same image appears twice
    #[error("image {0:?} appears more than once in the chain")]
    DuplicateImage(String),
    /// A chain needs at least one layer
    #[error("backing chain is empty")]
    EmptyChain,
    /// A token in a chain expression was not recognized
    #[error("unknown chain token {0:?}")]
    UnknownToken(String),
    /// Operation parameters do not describe a valid range of layers
    #[error("invalid range top={top} base={base}: {reason}")]
    InvalidRange {
        /// Top position as given
        top: usize,
        /// Base position as given
        base: usize,
        /// What is wrong with it
        reason: &'static str,
    },
    /// A symbolic reference was used without being prepared first
    #[error("{0} was referenced but has not been prepared")]
    MissingReference(&'static str),
}

/// Ordered backing chain, active layer first
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ChainState {
    images: Vec<String>,
}

impl ChainState {
    /// Build a chain from identifiers ordered active to base.
    pub fn new<I, S>(images: I) -> Result<Self, ChainError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let images: Vec<String> = images.into_iter().map(Into::into).collect();
        if images.is_empty() {
            return Err(ChainError::EmptyChain);
        }
        if let Some(dup) = images.iter().duplicates().next() {
            return Err(ChainError::DuplicateImage(dup.clone()));
        }
        Ok(Self { images })
    }

    /// Number of layers, including the base
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Always false; an empty chain cannot be constructed
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// The active (topmost) layer
    pub fn active(&self) -> &str {
        &self.images[0]
    }

    /// The base (bottom) image
    pub fn base(&self) -> &str {
        &self.images[self.images.len() - 1]
    }

    /// Layer at a 1-based position
    pub fn get(&self, position: usize) -> Result<&str, ChainError> {
        self.check_position(position)?;
        Ok(&self.images[position - 1])
    }

    /// All layers, active first
    pub fn images(&self) -> &[String] {
        &self.images
    }

    /// Whether the chain contains the identifier
    pub fn contains(&self, image: &str) -> bool {
        self.images.iter().any(|i| i == image)
    }

    /// 1-based position of the identifier, if present
    pub fn position_of(&self, image: &str) -> Option<usize> {
        self.images.iter().position(|i| i == image).map(|p| p + 1)
    }

    /// Iterate over layers, active first
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.images.iter()
    }

    pub(crate) fn check_position(&self, position: usize) -> Result<(), ChainError> {
        if position == 0 || position > self.images.len() {
            return Err(ChainError::IndexOutOfRange {
                index: position,
                len: self.images.len(),
            });
        }
        Ok(())
    }
}

impl TryFrom<Vec<String>> for ChainState {
    type Error = ChainError;

    fn try_from(images: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(images)
    }
}

impl From<ChainState> for Vec<String> {
    fn from(chain: ChainState) -> Self {
        chain.images
    }
}

impl<'a> IntoIterator for &'a ChainState {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.images.iter()
    }
}

impl FromStr for ChainState {
    type Err = ChainError;

    /// Parse a literal chain such as `/tmp/top > /tmp/mid > /tmp/base`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let images = s
            .split(CHAIN_SEPARATOR)
            .map(str::trim)
            .map(|part| {
                if part.is_empty() {
                    Err(ChainError::UnknownToken(part.to_string()))
                } else {
                    Ok(part.to_string())
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(images)
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.images.iter().join(&format!(" {CHAIN_SEPARATOR} "))
        )
    }
}
