//! Records exchanged with the remote API.

use serde::{Deserialize, Serialize};

use super::trait_::RemoteError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTag {
    pub id: String,
    pub name: String,
}

/// Association of a tag with a parent or child object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagLink {
    pub target_id: String,
    pub tag: RemoteTag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteParent {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_name: Option<String>,
}

/// Existing child artifact under a parent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteChild {
    pub id: String,
    pub parent_id: String,
    #[serde(default)]
    pub headlines: Vec<String>,
    #[serde(default)]
    pub descriptions: Vec<String>,
    #[serde(default)]
    pub final_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path2: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum ParentQuery {
    /// Enabled parents whose name contains the fragment
    NameContains(String),
    /// Parents carrying the named tag
    TaggedWith(String),
    ByIds(Vec<String>),
    ByNames(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TagTarget {
    Parent(String),
    Child(String),
}

/// Text content of a child to create.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChildContent {
    pub headlines: Vec<String>,
    pub descriptions: Vec<String>,
    pub final_url: String,
    pub path1: String,
    pub path2: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    CreateTag {
        name: String,
    },
    CreateChild {
        parent_id: String,
        content: ChildContent,
    },
    /// Lightweight association; never creates the tag itself
    AttachTag {
        target: TagTarget,
        tag_id: String,
    },
    DetachTag {
        target: TagTarget,
        tag_id: String,
    },
}

/// An operation with the caller-chosen id the remote echoes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOperation {
    pub id: String,
    #[serde(flatten)]
    pub operation: Operation,
}

impl RemoteOperation {
    pub fn new<S: Into<String>>(id: S, operation: Operation) -> Self {
        Self {
            id: id.into(),
            operation,
        }
    }
}

/// Per-operation outcome within an accepted mutate call. `Ok` carries the
/// resource reference of the created or modified object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub id: String,
    pub outcome: Result<String, RemoteError>,
}
