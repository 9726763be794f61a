// Municipality Entity - root of the address hierarchy
//
// Natural key: insee (national code). The siren registration number is
// derived, never supplied by the caller. Created only via import; the import
// driver never updates municipalities (the UNIQUE index on insee is the
// backstop against re-imports), but the validator supports updates for the
// HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{Attributes, ChangeSet};
use crate::errors::ErrorSet;
use crate::identifiers::derive_siren;
use crate::store::Store;

/// A municipality, identified nationally by its insee code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Municipality {
    /// Stable identity (UUID) - never changes.
    pub id: String,

    /// Natural key: 5-character national insee code.
    pub insee: String,

    pub name: String,

    /// Derived registration number (see `identifiers::derive_siren`).
    pub siren: String,

    /// Attribute bag; must carry `source`.
    pub attributes: Attributes,

    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Proposed municipality field values, as supplied by import or HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MunicipalityInput {
    pub insee: String,
    pub name: String,
    #[serde(default)]
    pub attributes: Attributes,
}

/// Validated field set ready to persist.
#[derive(Debug, Clone)]
pub struct MunicipalityFields {
    pub insee: String,
    pub name: String,
    pub siren: String,
    pub attributes: Attributes,
}

pub type MunicipalityChangeSet = ChangeSet<MunicipalityFields>;

/// Validate proposed municipality fields against the reconciliation contract.
///
/// `_store` is unused today (municipalities have no parent reference) but
/// kept so all five validators share one shape.
pub fn validate(
    _store: &Store,
    existing: Option<&Municipality>,
    input: &MunicipalityInput,
    update: bool,
) -> Result<MunicipalityChangeSet, ErrorSet> {
    let mut errors = ErrorSet::new();

    if input.insee.len() != 5 || !input.insee.chars().all(|c| c.is_ascii_digit()) {
        errors.push("insee", "must be exactly 5 digits");
    }
    if input.name.trim().is_empty() {
        errors.push("name", "required field is empty");
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
        if current.insee != input.insee {
            errors.push("insee", "natural key cannot change on update");
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let fields = MunicipalityFields {
        insee: input.insee.clone(),
        name: input.name.trim().to_string(),
        siren: derive_siren(&input.insee),
        attributes: input.attributes.clone(),
    };

    Ok(match existing.filter(|_| update) {
        Some(current) => ChangeSet::update(&current.id, current.version, fields),
        None => ChangeSet::create(fields),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(insee: &str, name: &str, source: &str) -> MunicipalityInput {
        MunicipalityInput {
            insee: insee.to_string(),
            name: name.to_string(),
            attributes: Attributes::with_source(source),
        }
    }

    #[test]
    fn test_validate_create_derives_siren() {
        let store = Store::open_in_memory().unwrap();
        let cs = validate(&store, None, &input("75100", "Paris 10e", "BAN"), false).unwrap();
        assert_eq!(cs.version, 1);
        assert!(cs.is_create());
        assert_eq!(cs.fields.siren, "210175100");
    }

    #[test]
    fn test_validate_rejects_bad_insee() {
        let store = Store::open_in_memory().unwrap();
        let err = validate(&store, None, &input("7510", "Paris", "BAN"), false).unwrap_err();
        assert_eq!(err.fields(), vec!["insee"]);
    }

    #[test]
    fn test_validate_requires_source_attribute() {
        let store = Store::open_in_memory().unwrap();
        let mut bad = input("75100", "Paris 10e", "BAN");
        bad.attributes = Attributes::new();
        let err = validate(&store, None, &bad, false).unwrap_err();
        assert_eq!(err.fields(), vec!["attributes"]);
    }

    #[test]
    fn test_validate_rejects_insee_change_on_update() {
        let store = Store::open_in_memory().unwrap();
        let cs = validate(&store, None, &input("75100", "Paris 10e", "BAN"), false).unwrap();
        let saved = store.save_municipality(&cs).unwrap();

        let err =
            validate(&store, Some(&saved), &input("75101", "Paris 10e", "BAN"), true).unwrap_err();
        assert_eq!(err.fields(), vec!["insee"]);
    }

    #[test]
    fn test_validate_accumulates_all_field_errors() {
        let store = Store::open_in_memory().unwrap();
        let mut bad = input("x", "", "BAN");
        bad.attributes = Attributes::new();
        let err = validate(&store, None, &bad, false).unwrap_err();
        assert_eq!(err.errors.len(), 3);
    }
}
