//! Part names and block ranges.

use std::cmp::Ordering;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PartIndexError, Result};

lazy_static! {
    static ref PART_NAME_RE: Regex =
        Regex::new(r"^([A-Za-z0-9]+)_(\d+)_(\d+)_(\d+)(?:_(\d+))?$").expect("valid part name regex");
}

/// Identity of a part's data: partition, the block range it covers, its merge
/// level and the mutation version applied to it.
///
/// Names look like `all_1_4_1` or, after a mutation, `all_1_4_1_7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartInfo {
    pub partition_id: String,
    pub min_block: u64,
    pub max_block: u64,
    pub level: u32,
    pub mutation: u64,
}

impl PartInfo {
    pub fn new(partition_id: impl Into<String>, min_block: u64, max_block: u64, level: u32) -> Self {
        PartInfo {
            partition_id: partition_id.into(),
            min_block,
            max_block,
            level,
            mutation: 0,
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        let caps = PART_NAME_RE
            .captures(name)
            .ok_or_else(|| PartIndexError::part(format!("invalid part name: {name:?}")))?;

        let number = |i: usize| -> Result<u64> {
            caps.get(i)
                .map_or(Ok(0), |m| m.as_str().parse::<u64>())
                .map_err(|e| PartIndexError::part(format!("invalid part name {name:?}: {e}")))
        };

        let info = PartInfo {
            partition_id: caps[1].to_string(),
            min_block: number(2)?,
            max_block: number(3)?,
            level: number(4)? as u32,
            mutation: number(5)?,
        };
        if info.min_block > info.max_block {
            return Err(PartIndexError::part(format!(
                "invalid part name {name:?}: min block above max block"
            )));
        }
        Ok(info)
    }

    pub fn name(&self) -> String {
        if self.mutation == 0 {
            format!(
                "{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level
            )
        } else {
            format!(
                "{}_{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level, self.mutation
            )
        }
    }

    /// True if `self` covers `other`'s data, i.e. `other` is obsolete once
    /// `self` is active.
    pub fn contains(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.min_block
            && self.max_block >= other.max_block
            && self.level >= other.level
            && self.mutation >= other.mutation
    }

    /// Same block range and level, only the mutation version differs.
    pub fn is_mutation_of(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block == other.min_block
            && self.max_block == other.max_block
            && self.level == other.level
            && self.mutation > other.mutation
    }
}

impl Ord for PartInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.min_block
            .cmp(&other.min_block)
            .then_with(|| self.partition_id.cmp(&other.partition_id))
            .then_with(|| self.max_block.cmp(&other.max_block))
            .then_with(|| self.level.cmp(&other.level))
            .then_with(|| self.mutation.cmp(&other.mutation))
    }
}

impl PartialOrd for PartInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
