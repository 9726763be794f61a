// PostCode Entity - append-only reference data
//
// Natural key: the `(code, name)` pair. Create-once lifecycle: a matching
// pair already in the store makes any re-import a no-op (no version bump, no
// field update). Idempotent by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{ChangeSet, ParentRef};
use crate::errors::ErrorSet;
use crate::store::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostCode {
    /// Stable identity (UUID) - never changes.
    pub id: String,

    /// Surrogate id of the parent municipality.
    pub municipality_id: String,

    /// Natural key, first half: 5-digit postal code.
    pub code: String,

    /// Natural key, second half: the delivery name attached to the code.
    pub name: String,

    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostCodeInput {
    pub code: String,
    pub name: String,
    pub municipality: ParentRef,
}

#[derive(Debug, Clone)]
pub struct PostCodeFields {
    pub municipality_id: String,
    pub code: String,
    pub name: String,
}

pub type PostCodeChangeSet = ChangeSet<PostCodeFields>;

pub fn validate(
    store: &Store,
    existing: Option<&PostCode>,
    input: &PostCodeInput,
    update: bool,
) -> Result<PostCodeChangeSet, ErrorSet> {
    let mut errors = ErrorSet::new();

    if input.code.len() != 5 || !input.code.chars().all(|c| c.is_ascii_digit()) {
        errors.push("code", "must be exactly 5 digits");
    }
    if input.name.trim().is_empty() {
        errors.push("name", "required field is empty");
    }
    if update && existing.is_none() {
        errors.push("instance", "update requested without an existing instance");
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

    match (errors.is_empty(), municipality_id) {
        (true, Some(municipality_id)) => {
            let fields = PostCodeFields {
                municipality_id,
                code: input.code.clone(),
                name: input.name.trim().to_string(),
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
    use crate::entities::Attributes;

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

    fn postcode_input(code: &str, name: &str) -> PostCodeInput {
        PostCodeInput {
            code: code.to_string(),
            name: name.to_string(),
            municipality: ParentRef::Municipality("75100".to_string()),
        }
    }

    #[test]
    fn test_validate_create() {
        let store = seeded_store();
        let cs = validate(&store, None, &postcode_input("75010", "PARIS 10"), false).unwrap();
        assert_eq!(cs.version, 1);
        assert_eq!(cs.fields.code, "75010");
    }

    #[test]
    fn test_validate_rejects_non_numeric_code() {
        let store = seeded_store();
        let err = validate(&store, None, &postcode_input("75A10", "PARIS 10"), false).unwrap_err();
        assert_eq!(err.fields(), vec!["code"]);
    }

    #[test]
    fn test_validate_unresolvable_parent() {
        let store = Store::open_in_memory().unwrap();
        let err = validate(&store, None, &postcode_input("75010", "PARIS 10"), false).unwrap_err();
        assert_eq!(err.fields(), vec!["municipality"]);
    }
}
