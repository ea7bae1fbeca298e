use std::fmt;

use kfold_core::{ObjError, StoreError};

/// Step of the run an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Annotate,
    Merge,
    Upsert,
    Gc,
    Delete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Annotate => "annotate",
            Phase::Merge => "merge",
            Phase::Upsert => "upsert",
            Phase::Gc => "gc",
            Phase::Delete => "delete",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("encoding pristine snapshot: {0}")]
    Encoding(String),
    #[error("decoding pristine snapshot: {0}")]
    Decoding(String),
    #[error("merge: {0}")]
    Merge(String),
    #[error("merge precondition failed: {0} may not change")]
    MergePrecondition(&'static str),
    #[error("{object}: still conflicting after {attempts} attempts")]
    ApplyConflict { object: String, attempts: u32 },
    #[error("{0} does not exist and creation is disabled")]
    NotCreatable(String),
    #[error("deleting {object}: {source}")]
    GcDelete {
        object: String,
        #[source]
        source: StoreError,
    },
    #[error("server does not serve kind {0}")]
    UnknownKind(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Object(#[from] ObjError),
    #[error("{phase} {object}: {source}")]
    Phase {
        phase: Phase,
        object: String,
        #[source]
        source: Box<ApplyError>,
    },
    #[error(transparent)]
    Source(#[from] anyhow::Error),
}

impl ApplyError {
    pub fn in_phase(self, phase: Phase, object: impl Into<String>) -> Self {
        ApplyError::Phase { phase, object: object.into(), source: Box::new(self) }
    }

    /// The error without phase wrappers.
    pub fn root(&self) -> &ApplyError {
        match self {
            ApplyError::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            ApplyError::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), ApplyError::ApplyConflict { .. })
    }
}
