// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::PathBuf;

use thiserror::Error;

/// Failures the collection pipeline distinguishes when deciding whether to
/// skip a job, skip a platform, or stop the run.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("unknown test identity for symbol {symbol:?}")]
    UnknownTestIdentity { symbol: String },

    #[error("expected {expected} coverage artifacts, found {found}")]
    ArtifactMismatch { expected: usize, found: usize },

    #[error("found {candidates} notes artifacts for platform {platform}, expected exactly one")]
    MissingNotesArtifact { platform: String, candidates: usize },

    #[error("artifact unpacked to an empty directory: {}", path.display())]
    EmptyArtifact { path: PathBuf },

    #[error("{tool} {step} failed: {status}")]
    ExternalToolFailure {
        tool: String,
        step: String,
        status: String,
    },

    #[error("unable to fetch {location}")]
    TransportFailure {
        location: String,
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other {
        #[from]
        source: anyhow::Error,
    },
}

impl CollectError {
    /// Finds the first `CollectError` in the chain of `err`.
    pub fn find(err: &anyhow::Error) -> Option<&CollectError> {
        err.chain().find_map(|cause| cause.downcast_ref::<CollectError>())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_find_through_context() {
        let err: anyhow::Error = CollectError::ArtifactMismatch {
            expected: 1,
            found: 2,
        }
        .into();
        let err = Err::<(), _>(err).context("processing job").unwrap_err();

        assert!(matches!(
            CollectError::find(&err),
            Some(CollectError::ArtifactMismatch {
                expected: 1,
                found: 2
            })
        ));
        assert_eq!(
            format!("{:#}", err),
            "processing job: expected 1 coverage artifacts, found 2"
        );
    }

    #[test]
    fn test_find_absent() {
        let err = anyhow!("plain failure");
        assert!(CollectError::find(&err).is_none());
    }
}
