use std::time::Duration;

/// Errors shared by every agentop crate.
///
/// Kubernetes API failures are classified by the object store into
/// `NotFound` / `AlreadyExists` / `Conflict` so callers never inspect HTTP codes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("{}", render_aggregate(.0))]
    Aggregate(Vec<Error>),
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn render_aggregate(errs: &[Error]) -> String {
    match errs {
        [single] => single.to_string(),
        many => {
            let parts: Vec<String> = many.iter().map(|e| e.to_string()).collect();
            format!("[{}]", parts.join(", "))
        }
    }
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Fold independent failures into one error; `Ok` when there were none.
    /// Nested aggregates are flattened.
    pub fn aggregate(errs: Vec<Error>) -> Result<()> {
        let mut flat = Vec::with_capacity(errs.len());
        for e in errs {
            match e {
                Error::Aggregate(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.is_empty() { Ok(()) } else { Err(Error::Aggregate(flat)) }
    }

    /// Number of leaf errors (1 for non-aggregates).
    pub fn count(&self) -> usize {
        match self {
            Error::Aggregate(inner) => inner.iter().map(Error::count).sum(),
            _ => 1,
        }
    }
}
