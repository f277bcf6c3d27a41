//! Remote API trait definition
//!
//! The authenticated transport handle the engine drives. Implementations own
//! credentials and connection reuse; the engine owns chunking, retries and
//! throttling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{
    OperationResult, ParentQuery, RemoteChild, RemoteOperation, RemoteParent, RemoteTag, TagLink,
};

/// A failure reported by the remote API.
///
/// `message` is kept exactly as the remote produced it and is what ends up on
/// failed items. `code` and `status` drive retry classification.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    /// Remote error code, e.g. `CONCURRENT_MODIFICATION`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Transport status, when the failure came from the HTTP/RPC layer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            code: None,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_code<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self {
            code: Some(code.into()),
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status<S: Into<String>>(status: u16, message: S) -> Self {
        Self {
            code: None,
            status: Some(status),
            message: message.into(),
        }
    }
}

/// Bulk read and mutate surface of the remote management API.
///
/// Every read takes a list of ids so callers can batch; callers are
/// responsible for keeping each list within the query chunk size.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// All tags defined in the account.
    async fn list_tags(&self, account: &str) -> Result<Vec<RemoteTag>, RemoteError>;

    /// Parents matching the query.
    async fn search_parents(
        &self,
        account: &str,
        query: &ParentQuery,
    ) -> Result<Vec<RemoteParent>, RemoteError>;

    /// Tag associations of the given parents.
    async fn parent_tags(
        &self,
        account: &str,
        parent_ids: &[String],
    ) -> Result<Vec<TagLink>, RemoteError>;

    /// Existing, non-removed children of the given parents.
    async fn children(
        &self,
        account: &str,
        parent_ids: &[String],
    ) -> Result<Vec<RemoteChild>, RemoteError>;

    /// Tag associations of the given children.
    async fn child_tags(
        &self,
        account: &str,
        child_ids: &[String],
    ) -> Result<Vec<TagLink>, RemoteError>;

    /// Submits one chunk of operations.
    ///
    /// `Err` means the whole call was rejected and nothing was applied.
    /// `Ok` carries one result per applied or individually rejected
    /// operation, keyed by the operation id it echoes back.
    async fn mutate(
        &self,
        account: &str,
        operations: &[RemoteOperation],
    ) -> Result<Vec<OperationResult>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_displays_the_verbatim_message() {
        let parent = "ag-17";
        let err = RemoteError::with_code("POLICY_FINDING", format!("Ad for {parent} violates policy"));
        assert_eq!(err.code.as_deref(), Some("POLICY_FINDING"));
        assert_eq!(err.to_string(), "Ad for ag-17 violates policy");

        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
        assert_eq!(boxed.to_string(), "Ad for ag-17 violates policy");
    }

    #[test]
    fn status_errors_keep_the_transport_status() {
        let err = RemoteError::with_status(503, "The service is currently unavailable.");
        assert_eq!(err.status, Some(503));
        assert!(err.code.is_none());
        assert_eq!(err.to_string(), "The service is currently unavailable.");
    }
}
