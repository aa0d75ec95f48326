use async_trait::async_trait;
use thiserror::Error;

/// Typed failure from the remote resource API.
///
/// The HTTP client itself lives outside this crate; whatever it is, its
/// failures arrive here already classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("request failed with status {0}")]
    Status(u16),
    #[error("network unavailable: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Status(401 | 403))
    }
}

/// Seam to the remote resource API for one collection type (orders, users,
/// products, roles). Implementations attach the authorization header and own
/// the wire format.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    type Item: Clone + Send + Sync + 'static;

    async fn list(&self) -> Result<Vec<Self::Item>, ApiError>;
}
