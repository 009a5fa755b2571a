//! Build result taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Terminal result of one build attempt.
///
/// Cancellation and storage failures during install are not part of this
/// enum; they are reported as errors (see
/// [`PartIndexError::is_cancelled`](crate::error::PartIndexError::is_cancelled)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    /// The part vanished before or during the build. Nothing to do.
    NoDataPart,
    Success,
    /// The index-building library failed.
    BuildFail,
    /// Table metadata does not match the request.
    MetaError,
    /// The index definition is invalid for this table.
    Misconfigured,
    /// Nothing to build: already built, too small, or claimed by another build.
    BuildSkipped,
    /// The destination part was replaced concurrently; re-resolve and retry.
    BuildRetry,
}

impl BuildStatus {
    pub const ALL: [BuildStatus; 7] = [
        BuildStatus::NoDataPart,
        BuildStatus::Success,
        BuildStatus::BuildFail,
        BuildStatus::MetaError,
        BuildStatus::Misconfigured,
        BuildStatus::BuildSkipped,
        BuildStatus::BuildRetry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::NoDataPart => "NO_DATA_PART",
            BuildStatus::Success => "SUCCESS",
            BuildStatus::BuildFail => "BUILD_FAIL",
            BuildStatus::MetaError => "META_ERROR",
            BuildStatus::Misconfigured => "MISCONFIGURED",
            BuildStatus::BuildSkipped => "BUILD_SKIPPED",
            BuildStatus::BuildRetry => "BUILD_RETRY",
        }
    }

    /// Statuses operators should hear about.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            BuildStatus::BuildFail | BuildStatus::MetaError | BuildStatus::Misconfigured
        )
    }

    /// Configuration problems that recur until metadata changes.
    pub fn is_config_error(&self) -> bool {
        matches!(self, BuildStatus::MetaError | BuildStatus::Misconfigured)
    }

    /// Whether a scheduler should try the pair again.
    pub fn should_retry(&self) -> bool {
        matches!(self, BuildStatus::BuildFail | BuildStatus::BuildRetry)
    }

    pub(crate) fn ordinal(&self) -> usize {
        match self {
            BuildStatus::NoDataPart => 0,
            BuildStatus::Success => 1,
            BuildStatus::BuildFail => 2,
            BuildStatus::MetaError => 3,
            BuildStatus::Misconfigured => 4,
            BuildStatus::BuildSkipped => 5,
            BuildStatus::BuildRetry => 6,
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
