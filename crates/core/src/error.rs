use thiserror::Error;

/// Errors produced by the workflow engine and its collaborators.
///
/// Action-level failures (assertion failures, timeouts, non-zero exits)
/// are carried as data inside `ActionResult` and only become an
/// `EngineError` once retries are exhausted and `onError` is `abort`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Shape error in a workflow or step definition; no run is created
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// A `dependsOn` entry names a step that does not exist
    #[error("step '{from}' depends on undefined step '{to}'")]
    MissingDependency { from: String, to: String },

    /// The dependency graph contains a cycle
    #[error("workflow contains a cyclic dependency involving step '{step_id}'")]
    CyclicDependency { step_id: String },

    /// A test-case step transitively references its own workflow
    #[error("test case '{test_id}' participates in a cyclic workflow reference")]
    CyclicReference { test_id: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// A step ended `failed` with `onError = abort`
    #[error("step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    #[error("storage error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}
