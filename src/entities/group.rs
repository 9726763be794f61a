// Group Entity - street or locality within a municipality
//
// Natural key: canonical fantoir code (municipality segment + local segment,
// see the identifier codec). Reconciliation policy: first sighting creates
// version 1; a re-sighting with a different `source` bumps the version and
// overwrites every field; a re-sighting with the same `source` is a
// duplicate re-import and must not mutate anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{Attributes, ChangeSet, ParentRef};
use crate::errors::ErrorSet;
use crate::store::Store;

// ============================================================================
// GROUP KIND
// ============================================================================

/// Kind of group: a linear way (street) or a named area (locality).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Way,
    Area,
}

impl GroupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::Way => "way",
            GroupKind::Area => "area",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "way" => Some(GroupKind::Way),
            "area" => Some(GroupKind::Area),
            _ => None,
        }
    }
}

// ============================================================================
// GROUP ENTITY
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    /// Stable identity (UUID) - never changes.
    pub id: String,

    /// Surrogate id of the parent municipality.
    pub municipality_id: String,

    /// Natural key: canonical 9-character fantoir code.
    pub fantoir: String,

    pub name: String,
    pub kind: GroupKind,

    /// Attribute bag; must carry `source` (it drives the dedup policy).
    pub attributes: Attributes,

    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Proposed group field values. `kind` stays a raw string so an unknown kind
/// surfaces as a field error rather than a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInput {
    pub fantoir: String,
    pub name: String,
    pub kind: String,
    pub municipality: ParentRef,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug, Clone)]
pub struct GroupFields {
    pub municipality_id: String,
    pub fantoir: String,
    pub name: String,
    pub kind: GroupKind,
    pub attributes: Attributes,
}

pub type GroupChangeSet = ChangeSet<GroupFields>;

/// Validate proposed group fields, resolving the parent municipality by its
/// natural key. An unresolvable parent is a field-keyed error, not a fault.
pub fn validate(
    store: &Store,
    existing: Option<&Group>,
    input: &GroupInput,
    update: bool,
) -> Result<GroupChangeSet, ErrorSet> {
    let mut errors = ErrorSet::new();

    if input.fantoir.len() != 9 || !input.fantoir.is_ascii() {
        errors.push("fantoir", "must be a canonical 9-character code");
    }
    if input.name.trim().is_empty() {
        errors.push("name", "required field is empty");
    }
    let kind = GroupKind::parse(&input.kind);
    if kind.is_none() {
        errors.push("kind", format!("unknown group kind `{}`", input.kind));
    }
    if input.attributes.source().is_none() {
        errors.push("attributes", "must include a `source` key");
    }
    if update && existing.is_none() {
        errors.push("instance", "update requested without an existing instance");
    }
    // The natural key is identity; an update may not move the entity to a
    // different one.
    if let Some(current) = existing.filter(|_| update) {
        if current.fantoir != input.fantoir {
            errors.push("fantoir", "natural key cannot change on update");
        }
    }

    let municipality_id = match &input.municipality {
        ParentRef::Municipality(insee) => match store.get_municipality_by_insee(insee) {
            Ok(Some(municipality)) => Some(municipality.id),
            Ok(None) => {
                errors.push_reference("municipality", &input.municipality.to_string());
                None
            }
            Err(e) => {
                errors.push("municipality", format!("lookup failed: {}", e));
                None
            }
        },
        other => {
            errors.push(
                "municipality",
                format!("must reference a municipality, got `{}`", other.kind_name()),
            );
            None
        }
    };

    match (errors.is_empty(), municipality_id, kind) {
        (true, Some(municipality_id), Some(kind)) => {
            let fields = GroupFields {
                municipality_id,
                fantoir: input.fantoir.clone(),
                name: input.name.trim().to_string(),
                kind,
                attributes: input.attributes.clone(),
            };
            Ok(match existing.filter(|_| update) {
                Some(current) => ChangeSet::update(&current.id, current.version, fields),
                None => ChangeSet::create(fields),
            })
        }
        _ => Err(errors),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::municipality::{self, MunicipalityInput};

    fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        let input = MunicipalityInput {
            insee: "75100".to_string(),
            name: "Paris 10e".to_string(),
            attributes: Attributes::with_source("BAN"),
        };
        let cs = municipality::validate(&store, None, &input, false).unwrap();
        store.save_municipality(&cs).unwrap();
        store
    }

    fn group_input(fantoir: &str, source: &str) -> GroupInput {
        GroupInput {
            fantoir: fantoir.to_string(),
            name: "Rue du Faubourg Saint-Denis".to_string(),
            kind: "way".to_string(),
            municipality: ParentRef::Municipality("75100".to_string()),
            attributes: Attributes::with_source(source),
        }
    }

    #[test]
    fn test_validate_create_resolves_parent() {
        let store = seeded_store();
        let cs = validate(&store, None, &group_input("751000001", "BAN"), false).unwrap();
        assert_eq!(cs.version, 1);
        assert!(!cs.fields.municipality_id.is_empty());
        assert_eq!(cs.fields.kind, GroupKind::Way);
    }

    #[test]
    fn test_validate_unresolvable_parent_is_field_error() {
        let store = Store::open_in_memory().unwrap();
        let err = validate(&store, None, &group_input("751000001", "BAN"), false).unwrap_err();
        assert_eq!(err.fields(), vec!["municipality"]);
        assert!(err.to_string().contains("insee:75100"));
    }

    #[test]
    fn test_validate_rejects_unknown_kind() {
        let store = seeded_store();
        let mut input = group_input("751000001", "BAN");
        input.kind = "street".to_string();
        let err = validate(&store, None, &input, false).unwrap_err();
        assert_eq!(err.fields(), vec!["kind"]);
    }

    #[test]
    fn test_validate_rejects_group_parent_ref() {
        let store = seeded_store();
        let mut input = group_input("751000001", "BAN");
        input.municipality = ParentRef::Group("751000002".to_string());
        let err = validate(&store, None, &input, false).unwrap_err();
        assert_eq!(err.fields(), vec!["municipality"]);
    }

    #[test]
    fn test_validate_rejects_fantoir_change_on_update() {
        let store = seeded_store();
        let cs = validate(&store, None, &group_input("751000001", "BAN"), false).unwrap();
        let group = store.save_group(&cs).unwrap();

        let err = validate(&store, Some(&group), &group_input("751000002", "DGFiP"), true)
            .unwrap_err();
        assert_eq!(err.fields(), vec!["fantoir"]);
    }

    #[test]
    fn test_validate_update_bumps_version() {
        let store = seeded_store();
        let cs = validate(&store, None, &group_input("751000001", "BAN"), false).unwrap();
        let group = store.save_group(&cs).unwrap();

        let cs2 = validate(&store, Some(&group), &group_input("751000001", "DGFiP"), true).unwrap();
        assert_eq!(cs2.version, 2);
        assert_eq!(cs2.expected_version, Some(1));
        assert_eq!(cs2.id, group.id);
    }
}
