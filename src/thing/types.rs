//! Thing record types and list options.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Timestamp;

/// A namespaced row keyed by `(ns, type, id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Thing {
    /// Namespace.
    pub ns: String,
    /// Type within the namespace.
    #[serde(rename = "type")]
    pub kind: String,
    /// Identity within `(ns, type)`.
    pub id: String,
    /// Optional canonical URL.
    pub url: Option<String>,
    /// JSON document body.
    pub data: Value,
    /// Optional context tag.
    pub context: Option<String>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last mutation time; never before `created_at`.
    pub updated_at: Timestamp,
}

/// Input for [`ThingStore::create`](super::ThingStore::create).
#[derive(Clone, Debug)]
pub struct NewThing {
    /// Namespace (defaults to `default`).
    pub ns: String,
    /// Type within the namespace.
    pub kind: String,
    /// Identity within `(ns, type)`.
    pub id: String,
    /// Optional canonical URL.
    pub url: Option<String>,
    /// JSON document body.
    pub data: Value,
    /// Optional context tag.
    pub context: Option<String>,
}

impl NewThing {
    /// Creates input with the default namespace and no url/context.
    pub fn new(kind: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        Self {
            ns: "default".to_string(),
            kind: kind.into(),
            id: id.into(),
            url: None,
            data,
            context: None,
        }
    }

    /// Sets the namespace.
    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self {
        self.ns = ns.into();
        self
    }
}

/// Sort column for [`ListOptions`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThingOrder {
    /// Order by creation time.
    #[default]
    CreatedAt,
    /// Order by last update time.
    UpdatedAt,
    /// Order by id.
    Id,
}

impl ThingOrder {
    /// Whitelisted column name for ORDER BY.
    pub const fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Id => "id",
        }
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

impl SortOrder {
    /// SQL keyword.
    pub const fn keyword(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Options for [`ThingStore::list`](super::ThingStore::list).
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Filter by namespace.
    pub ns: Option<String>,
    /// Filter by type.
    pub kind: Option<String>,
    /// Sort column.
    pub order_by: ThingOrder,
    /// Sort direction.
    pub order: SortOrder,
    /// Page size.
    pub limit: Option<usize>,
    /// Page offset.
    pub offset: Option<usize>,
}

/// Merges `patch` over `base` at the top level.
///
/// Object keys in `patch` replace or extend `base`'s; keys absent from
/// `patch` are preserved. A non-object patch replaces the document.
pub(crate) fn merge_data(base: Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                base_map.insert(key.clone(), value.clone());
            }
            Value::Object(base_map)
        }
        (_, patch) => patch.clone(),
    }
}
