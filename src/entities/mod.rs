// Entity Models - the five address-base entities
//
// Each entity has:
// - Stable identity (UUID) that never changes
// - A natural key (insee, fantoir, cia, ...) used to resolve cross-entity
//   references during import
// - A monotonically increasing version counter, starting at 1
//
// Each entity module also carries its validator: the reconciliation contract
// `validate(existing | None, input, update) -> Result<ChangeSet, ErrorSet>`.

pub mod group;
pub mod housenumber;
pub mod municipality;
pub mod position;
pub mod postcode;

pub use group::{Group, GroupChangeSet, GroupInput, GroupKind};
pub use housenumber::{HouseNumber, HouseNumberChangeSet, HouseNumberInput};
pub use municipality::{Municipality, MunicipalityChangeSet, MunicipalityInput};
pub use position::{Position, PositionChangeSet, PositionInput, PositionKind, Positioning};
pub use postcode::{PostCode, PostCodeChangeSet, PostCodeInput};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// ATTRIBUTE BAG
// ============================================================================

/// Free-form key/value attributes attached to an entity.
///
/// The one documented minimum: imported entities must carry a `source` key
/// identifying the batch/authority the data came from. Group reconciliation
/// compares it to tell "same batch re-sent" from "new authoritative update".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    pub fn new() -> Self {
        Attributes(BTreeMap::new())
    }

    /// Build a bag carrying only the `source` marker.
    pub fn with_source(source: &str) -> Self {
        let mut bag = Attributes::new();
        bag.insert("source", source);
        bag
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The `source` marker, if present.
    pub fn source(&self) -> Option<&str> {
        self.get("source")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// TAGGED PARENT REFERENCE
// ============================================================================

/// Explicit tagged reference to a parent entity by natural key.
///
/// Replaces the `"insee:<code>"` / `"fantoir:<code>"` string encoding: the
/// kind is a variant, the key is just the key, and resolution goes through
/// one store lookup per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum ParentRef {
    /// Municipality referenced by its insee code.
    Municipality(String),
    /// Group referenced by its canonical fantoir code.
    Group(String),
}

impl ParentRef {
    pub fn key(&self) -> &str {
        match self {
            ParentRef::Municipality(key) => key,
            ParentRef::Group(key) => key,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ParentRef::Municipality(_) => "municipality",
            ParentRef::Group(_) => "group",
        }
    }
}

impl std::fmt::Display for ParentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParentRef::Municipality(key) => write!(f, "insee:{}", key),
            ParentRef::Group(key) => write!(f, "fantoir:{}", key),
        }
    }
}

// ============================================================================
// CHANGE-SET
// ============================================================================

/// Validated, ready-to-persist field set plus target version.
///
/// Produced only by a validator; `expected_version` is the version the caller
/// observed (`None` for a create). The store refuses the write with a
/// ConflictError if the stored version has advanced since.
#[derive(Debug, Clone)]
pub struct ChangeSet<F> {
    /// Surrogate id the write targets (fresh UUID for a create).
    pub id: String,

    /// Version this save will produce (1 for create, existing + 1 for update).
    pub version: i64,

    /// Version the caller observed; `None` means create.
    pub expected_version: Option<i64>,

    /// Full field set to persist. Updates always write all fields, even when
    /// values are unchanged.
    pub fields: F,
}

impl<F> ChangeSet<F> {
    /// Change-set creating version 1 of a new entity.
    pub fn create(fields: F) -> Self {
        ChangeSet {
            id: uuid::Uuid::new_v4().to_string(),
            version: 1,
            expected_version: None,
            fields,
        }
    }

    /// Change-set advancing an existing entity from `observed_version`.
    pub fn update(id: &str, observed_version: i64, fields: F) -> Self {
        ChangeSet {
            id: id.to_string(),
            version: observed_version + 1,
            expected_version: Some(observed_version),
            fields,
        }
    }

    pub fn is_create(&self) -> bool {
        self.expected_version.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_source() {
        let bag = Attributes::with_source("BAN");
        assert_eq!(bag.source(), Some("BAN"));
        assert!(Attributes::new().source().is_none());
    }

    #[test]
    fn test_parent_ref_display() {
        assert_eq!(
            ParentRef::Municipality("75100".to_string()).to_string(),
            "insee:75100"
        );
        assert_eq!(
            ParentRef::Group("751000001".to_string()).to_string(),
            "fantoir:751000001"
        );
    }

    #[test]
    fn test_parent_ref_json_shape() {
        let json = serde_json::to_value(ParentRef::Municipality("75100".to_string())).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "municipality", "key": "75100"})
        );
    }

    #[test]
    fn test_change_set_versions() {
        let create = ChangeSet::create(());
        assert_eq!(create.version, 1);
        assert!(create.is_create());

        let update = ChangeSet::update("some-id", 3, ());
        assert_eq!(update.version, 4);
        assert_eq!(update.expected_version, Some(3));
        assert!(!update.is_create());
    }
}
