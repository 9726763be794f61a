// HouseNumber Entity - a numbered address on a group
//
// Natural key: cia, derived from municipality code + street local code +
// number + optional ordinal (see the identifier codec). Reconciliation
// policy: every re-sighting is authoritative - absence creates version 1,
// presence always bumps the version and overwrites. There is no source-based
// dedup check for housenumbers; re-importing the identical record twice
// yields v1 then v2 on purpose.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{ChangeSet, ParentRef};
use crate::errors::ErrorSet;
use crate::store::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HouseNumber {
    /// Stable identity (UUID) - never changes.
    pub id: String,

    /// Surrogate id of the parent group.
    pub group_id: String,

    /// Natural key: derived composite cia.
    pub cia: String,

    pub number: String,

    /// Ordinal suffix ("bis", "ter", ...). Empty input normalizes to absent.
    pub ordinal: Option<String>,

    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HouseNumberInput {
    /// Derived cia; callers compute it through the identifier codec.
    pub cia: String,
    pub number: String,
    #[serde(default)]
    pub ordinal: Option<String>,
    pub group: ParentRef,
}

impl HouseNumberInput {
    /// Empty ordinals collapse to absent before any derivation or save.
    pub fn normalized_ordinal(&self) -> Option<String> {
        self.ordinal
            .as_deref()
            .filter(|o| !o.trim().is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone)]
pub struct HouseNumberFields {
    pub group_id: String,
    pub cia: String,
    pub number: String,
    pub ordinal: Option<String>,
}

pub type HouseNumberChangeSet = ChangeSet<HouseNumberFields>;

pub fn validate(
    store: &Store,
    existing: Option<&HouseNumber>,
    input: &HouseNumberInput,
    update: bool,
) -> Result<HouseNumberChangeSet, ErrorSet> {
    let mut errors = ErrorSet::new();

    if input.cia.trim().is_empty() {
        errors.push("cia", "required field is empty");
    }
    if input.number.trim().is_empty() {
        errors.push("number", "required field is empty");
    }
    if update && existing.is_none() {
        errors.push("instance", "update requested without an existing instance");
    }
    // The natural key is identity; an update may not move the entity to a
    // different one.
    if let Some(current) = existing.filter(|_| update) {
        if current.cia != input.cia {
            errors.push("cia", "natural key cannot change on update");
        }
    }

    let group_id = match &input.group {
        ParentRef::Group(fantoir) => match store.get_group_by_fantoir(fantoir) {
            Ok(Some(group)) => Some(group.id),
            Ok(None) => {
                errors.push_reference("group", &input.group.to_string());
                None
            }
            Err(e) => {
                errors.push("group", format!("lookup failed: {}", e));
                None
            }
        },
        other => {
            errors.push(
                "group",
                format!("must reference a group, got `{}`", other.kind_name()),
            );
            None
        }
    };

    match (errors.is_empty(), group_id) {
        (true, Some(group_id)) => {
            let fields = HouseNumberFields {
                group_id,
                cia: input.cia.clone(),
                number: input.number.trim().to_string(),
                ordinal: input.normalized_ordinal(),
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
    use crate::entities::group::{self, GroupInput};
    use crate::entities::municipality::{self, MunicipalityInput};
    use crate::entities::Attributes;

    fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        let m = MunicipalityInput {
            insee: "75100".to_string(),
            name: "Paris 10e".to_string(),
            attributes: Attributes::with_source("BAN"),
        };
        let cs = municipality::validate(&store, None, &m, false).unwrap();
        store.save_municipality(&cs).unwrap();

        let g = GroupInput {
            fantoir: "751000001".to_string(),
            name: "Rue du Faubourg Saint-Denis".to_string(),
            kind: "way".to_string(),
            municipality: ParentRef::Municipality("75100".to_string()),
            attributes: Attributes::with_source("BAN"),
        };
        let cs = group::validate(&store, None, &g, false).unwrap();
        store.save_group(&cs).unwrap();
        store
    }

    fn housenumber_input(number: &str, ordinal: Option<&str>) -> HouseNumberInput {
        HouseNumberInput {
            cia: "75100_0001_12_".to_string(),
            number: number.to_string(),
            ordinal: ordinal.map(str::to_string),
            group: ParentRef::Group("751000001".to_string()),
        }
    }

    #[test]
    fn test_validate_create() {
        let store = seeded_store();
        let cs = validate(&store, None, &housenumber_input("12", None), false).unwrap();
        assert_eq!(cs.version, 1);
        assert_eq!(cs.fields.ordinal, None);
    }

    #[test]
    fn test_empty_ordinal_normalizes_to_absent() {
        let store = seeded_store();
        let cs = validate(&store, None, &housenumber_input("12", Some("")), false).unwrap();
        assert_eq!(cs.fields.ordinal, None);

        let cs = validate(&store, None, &housenumber_input("12", Some("bis")), false).unwrap();
        assert_eq!(cs.fields.ordinal, Some("bis".to_string()));
    }

    #[test]
    fn test_validate_unresolvable_group() {
        let store = Store::open_in_memory().unwrap();
        let err = validate(&store, None, &housenumber_input("12", None), false).unwrap_err();
        assert_eq!(err.fields(), vec!["group"]);
        assert!(err.to_string().contains("fantoir:751000001"));
    }

    #[test]
    fn test_validate_update_bumps_version() {
        let store = seeded_store();
        let cs = validate(&store, None, &housenumber_input("12", None), false).unwrap();
        let hn = store.save_housenumber(&cs).unwrap();

        let cs2 = validate(&store, Some(&hn), &housenumber_input("12", None), true).unwrap();
        assert_eq!(cs2.version, 2);
        assert_eq!(cs2.id, hn.id);
    }

    #[test]
    fn test_validate_rejects_cia_change_on_update() {
        let store = seeded_store();
        let cs = validate(&store, None, &housenumber_input("12", None), false).unwrap();
        let hn = store.save_housenumber(&cs).unwrap();

        let mut moved = housenumber_input("14", None);
        moved.cia = "75100_0001_14_".to_string();
        let err = validate(&store, Some(&hn), &moved, true).unwrap_err();
        assert_eq!(err.fields(), vec!["cia"]);
    }
}
