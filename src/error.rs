use thiserror::Error;

/// Errors raised by the anchor, matching and loss pipeline.
///
/// Images without ground truth or without foreground matches are not errors, they produce a
/// zero regression loss and background only classification targets.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetinaError {
    /// Malformed or inconsistent anchor / loss parameters, or prediction tensors whose shapes do
    /// not line up with the anchors.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A collaborator broke its contract: the matcher returned an index outside of the ground
    /// truth, an unknown sentinel, or labels and boxes differ in length.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Tensor data could not be read back to the host.
    #[error("tensor data error: {0}")]
    Tensor(String),
}

pub type Result<T> = std::result::Result<T, RetinaError>;

impl RetinaError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        RetinaError::Configuration(msg.into())
    }

    pub(crate) fn contract(msg: impl Into<String>) -> Self {
        RetinaError::ContractViolation(msg.into())
    }
}
