//! Block operation simulators
//!
//! Given a chain and the parameters of a blockcommit, blockpull or blockcopy,
//! compute the chain libvirt should report once the job has finished.
//! Positions are 1-based with the active layer at position 1.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::debug;

use crate::chain::{ChainError, ChainState};

/// A block job, described by its effect on the backing chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ChainOperation {
    /// `virsh blockcommit --top TOP --base BASE [--pivot] [--keep-relative]`
    Commit {
        /// Topmost layer merged down; 1 is an active commit
        top: usize,
        /// Layer receiving the data; `None` means the chain's base image
        base: Option<usize>,
        /// Pivot to the base once an active commit is ready
        pivot: bool,
        /// Keep relative backing references
        keep_relative: bool,
    },
    /// `virsh blockpull [--base BASE] [--keep-relative]`
    Pull {
        /// Layer that stays as the new backing file; `None` pulls everything
        base: Option<usize>,
        /// Keep relative backing references
        keep_relative: bool,
    },
    /// `virsh blockcopy DEST [--shallow] [--pivot]`
    Copy {
        /// Destination image
        destination: String,
        /// Copy only the active layer and reuse the existing backing chain
        shallow: bool,
        /// Pivot to the destination when the copy is ready
        pivot: bool,
    },
}

impl ChainOperation {
    /// The virsh command implementing this operation
    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Commit { .. } => "blockcommit",
            Self::Pull { .. } => "blockpull",
            Self::Copy { .. } => "blockcopy",
        }
    }

    /// Whether backing references must stay relative afterwards
    pub fn keep_relative(&self) -> bool {
        match self {
            Self::Commit { keep_relative, .. } | Self::Pull { keep_relative, .. } => {
                *keep_relative
            }
            Self::Copy { .. } => false,
        }
    }

    /// Compute the chain after the operation
    pub fn apply(&self, chain: &ChainState) -> Result<ChainState, ChainError> {
        let images = chain.images();
        let result = match self {
            Self::Commit {
                top, base, pivot, ..
            } => {
                let top = *top;
                let base = base.unwrap_or(chain.len());
                chain.check_position(top)?;
                chain.check_position(base)?;
                if top >= base {
                    return Err(ChainError::InvalidRange {
                        top,
                        base,
                        reason: "top must be above base",
                    });
                }
                if top == 1 {
                    if *pivot {
                        ChainState::new(images[base - 1..].iter().cloned())?
                    } else {
                        // Without a pivot an active commit leaves the overlay in place
                        chain.clone()
                    }
                } else if *pivot {
                    return Err(ChainError::InvalidRange {
                        top,
                        base,
                        reason: "pivot only applies to an active commit",
                    });
                } else {
                    ChainState::new(
                        images[..top - 1]
                            .iter()
                            .chain(&images[base - 1..])
                            .cloned(),
                    )?
                }
            }
            Self::Pull { base, .. } => match *base {
                None => ChainState::new([chain.active()])?,
                Some(base) => {
                    chain.check_position(base)?;
                    if base == 1 {
                        return Err(ChainError::InvalidRange {
                            top: 1,
                            base,
                            reason: "the active layer cannot be the pull base",
                        });
                    }
                    ChainState::new(
                        std::iter::once(&images[0])
                            .chain(&images[base - 1..])
                            .cloned(),
                    )?
                }
            },
            Self::Copy {
                destination,
                shallow,
                pivot,
            } => {
                if !*pivot {
                    chain.clone()
                } else if *shallow {
                    ChainState::new(
                        std::iter::once(destination)
                            .chain(&images[1..])
                            .cloned(),
                    )?
                } else {
                    ChainState::new([destination.as_str()])?
                }
            }
        };
        debug!("{self}: [{chain}] -> [{result}]");
        Ok(result)
    }
}

/// Apply operations in order
pub fn apply_all<'a, I>(chain: &ChainState, ops: I) -> Result<ChainState, ChainError>
where
    I: IntoIterator<Item = &'a ChainOperation>,
{
    ops.into_iter()
        .try_fold(chain.clone(), |current, op| op.apply(&current))
}

impl fmt::Display for ChainOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit {
                top,
                base,
                pivot,
                keep_relative,
            } => {
                write!(f, "commit:{top}")?;
                if let Some(base) = base {
                    write!(f, ":{base}")?;
                }
                if *pivot {
                    f.write_str(":pivot")?;
                }
                if *keep_relative {
                    f.write_str(":keep-relative")?;
                }
                Ok(())
            }
            Self::Pull {
                base,
                keep_relative,
            } => {
                f.write_str("pull")?;
                if let Some(base) = base {
                    write!(f, ":{base}")?;
                }
                if *keep_relative {
                    f.write_str(":keep-relative")?;
                }
                Ok(())
            }
            Self::Copy {
                destination,
                shallow,
                pivot,
            } => {
                write!(f, "copy:{destination}")?;
                if *shallow {
                    f.write_str(":shallow")?;
                }
                if *pivot {
                    f.write_str(":pivot")?;
                }
                Ok(())
            }
        }
    }
}

/// Strip known trailing flags, returning the rest and the flags that were set
fn take_flags<'a>(mut parts: Vec<&'a str>, known: &[&str]) -> (Vec<&'a str>, Vec<&'a str>) {
    let mut flags = Vec::new();
    while let Some(last) = parts.last() {
        if known.contains(last) {
            flags.push(*last);
            parts.pop();
        } else {
            break;
        }
    }
    (parts, flags)
}

impl FromStr for ChainOperation {
    type Err = ChainError;

    /// Parse `commit:TOP[:BASE][:pivot][:keep-relative]`,
    /// `pull[:BASE][:keep-relative]` or `copy:DEST[:shallow][:pivot]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || ChainError::UnknownToken(s.to_string());
        let parts: Vec<&str> = s.trim().split(':').collect();
        let (kind, rest) = parts.split_first().ok_or_else(unknown)?;
        let parse_pos = |p: &str| p.parse::<usize>().map_err(|_| unknown());
        match *kind {
            "commit" => {
                let (args, flags) = take_flags(rest.to_vec(), &["pivot", "keep-relative"]);
                let (top, base) = match args.as_slice() {
                    [top] => (parse_pos(top)?, None),
                    [top, base] => (parse_pos(top)?, Some(parse_pos(base)?)),
                    _ => return Err(unknown()),
                };
                Ok(Self::Commit {
                    top,
                    base,
                    pivot: flags.contains(&"pivot"),
                    keep_relative: flags.contains(&"keep-relative"),
                })
            }
            "pull" => {
                let (args, flags) = take_flags(rest.to_vec(), &["keep-relative"]);
                let base = match args.as_slice() {
                    [] => None,
                    [base] => Some(parse_pos(base)?),
                    _ => return Err(unknown()),
                };
                Ok(Self::Pull {
                    base,
                    keep_relative: !flags.is_empty(),
                })
            }
            "copy" => {
                let (args, flags) = take_flags(rest.to_vec(), &["shallow", "pivot"]);
                // Destinations may themselves contain ':'
                let destination = args.join(":");
                if destination.is_empty() {
                    return Err(unknown());
                }
                Ok(Self::Copy {
                    destination,
                    shallow: flags.contains(&"shallow"),
                    pivot: flags.contains(&"pivot"),
                })
            }
            _ => Err(unknown()),
        }
    }
}
