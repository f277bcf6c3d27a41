//! Remote API module
//!
//! - The `RemoteApi` trait the engine consumes
//! - Records and mutation operations exchanged with it

pub mod trait_;
pub mod types;

pub use trait_::{RemoteApi, RemoteError};
pub use types::{
    ChildContent, Operation, OperationResult, ParentQuery, RemoteChild, RemoteOperation,
    RemoteParent, RemoteTag, TagLink, TagTarget,
};
