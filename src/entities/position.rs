// Position Entity - a geographic position attached to a housenumber
//
// Identity for versioning purposes is the triple (housenumber, kind, source):
// a new triple creates version 1, a matching triple bumps the version and
// overwrites the geometry and positioning classification. The housenumber
// must resolve before any other field is validated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::ChangeSet;
use crate::errors::ErrorSet;
use crate::store::Store;

// ============================================================================
// POSITION KIND
// ============================================================================

/// What the position points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionKind {
    Entrance,
    Building,
    Staircase,
    Unit,
    Parcel,
    Segment,
    Utility,
    Area,
    Postal,
    Other,
}

impl PositionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionKind::Entrance => "entrance",
            PositionKind::Building => "building",
            PositionKind::Staircase => "staircase",
            PositionKind::Unit => "unit",
            PositionKind::Parcel => "parcel",
            PositionKind::Segment => "segment",
            PositionKind::Utility => "utility",
            PositionKind::Area => "area",
            PositionKind::Postal => "postal",
            PositionKind::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "entrance" => Some(PositionKind::Entrance),
            "building" => Some(PositionKind::Building),
            "staircase" => Some(PositionKind::Staircase),
            "unit" => Some(PositionKind::Unit),
            "parcel" => Some(PositionKind::Parcel),
            "segment" => Some(PositionKind::Segment),
            "utility" => Some(PositionKind::Utility),
            "area" => Some(PositionKind::Area),
            "postal" => Some(PositionKind::Postal),
            "other" => Some(PositionKind::Other),
            _ => None,
        }
    }
}

// ============================================================================
// POSITIONING CLASSIFICATION
// ============================================================================

/// How the position was determined. Defaults to `Other` when the import does
/// not specify one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Positioning {
    Dgps,
    Gps,
    Imagery,
    Projection,
    Interpolation,
    Other,
}

impl Positioning {
    pub fn as_str(&self) -> &'static str {
        match self {
            Positioning::Dgps => "dgps",
            Positioning::Gps => "gps",
            Positioning::Imagery => "imagery",
            Positioning::Projection => "projection",
            Positioning::Interpolation => "interpolation",
            Positioning::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dgps" => Some(Positioning::Dgps),
            "gps" => Some(Positioning::Gps),
            "imagery" => Some(Positioning::Imagery),
            "projection" => Some(Positioning::Projection),
            "interpolation" => Some(Positioning::Interpolation),
            "other" => Some(Positioning::Other),
            _ => None,
        }
    }
}

// ============================================================================
// POSITION ENTITY
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Stable identity (UUID) - never changes.
    pub id: String,

    /// Surrogate id of the owning housenumber.
    pub housenumber_id: String,

    pub kind: PositionKind,

    /// Authority/batch marker; part of the versioning triple.
    pub source: String,

    /// Geometry payload (GeoJSON-shaped object).
    pub center: serde_json::Value,

    pub positioning: Positioning,

    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Proposed position field values. `kind`/`positioning` stay raw strings so
/// unknown values surface as field errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInput {
    /// Internal cia of the owning housenumber (control letter already
    /// stripped by the caller).
    pub housenumber: String,
    pub kind: String,
    pub source: String,
    pub center: serde_json::Value,
    #[serde(default)]
    pub positioning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PositionFields {
    pub housenumber_id: String,
    pub kind: PositionKind,
    pub source: String,
    pub center: serde_json::Value,
    pub positioning: Positioning,
}

pub type PositionChangeSet = ChangeSet<PositionFields>;

pub fn validate(
    store: &Store,
    existing: Option<&Position>,
    input: &PositionInput,
    update: bool,
) -> Result<PositionChangeSet, ErrorSet> {
    // The housenumber must resolve before anything else is looked at.
    let housenumber_id = match store.get_housenumber_by_cia(&input.housenumber) {
        Ok(Some(hn)) => hn.id,
        Ok(None) => {
            let mut errors = ErrorSet::new();
            errors.push_reference("housenumber", &format!("cia:{}", input.housenumber));
            return Err(errors);
        }
        Err(e) => {
            let mut errors = ErrorSet::new();
            errors.push("housenumber", format!("lookup failed: {}", e));
            return Err(errors);
        }
    };

    let mut errors = ErrorSet::new();

    let kind = PositionKind::parse(&input.kind);
    if kind.is_none() {
        errors.push("kind", format!("unknown position kind `{}`", input.kind));
    }
    if input.source.trim().is_empty() {
        errors.push("source", "required field is empty");
    }
    if !input.center.is_object() {
        errors.push("center", "must be a geometry object");
    }
    let positioning = match input.positioning.as_deref() {
        None => Some(Positioning::Other),
        Some(raw) => {
            let parsed = Positioning::parse(raw);
            if parsed.is_none() {
                errors.push("positioning", format!("unknown positioning `{}`", raw));
            }
            parsed
        }
    };
    if update && existing.is_none() {
        errors.push("instance", "update requested without an existing instance");
    }

    match (errors.is_empty(), kind, positioning) {
        (true, Some(kind), Some(positioning)) => {
            let fields = PositionFields {
                housenumber_id,
                kind,
                source: input.source.clone(),
                center: input.center.clone(),
                positioning,
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
    use crate::entities::housenumber::{self, HouseNumberInput};
    use crate::entities::municipality::{self, MunicipalityInput};
    use crate::entities::{Attributes, ParentRef};
    use serde_json::json;

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

        let hn = HouseNumberInput {
            cia: "75100_0001_12_".to_string(),
            number: "12".to_string(),
            ordinal: None,
            group: ParentRef::Group("751000001".to_string()),
        };
        let cs = housenumber::validate(&store, None, &hn, false).unwrap();
        store.save_housenumber(&cs).unwrap();
        store
    }

    fn position_input() -> PositionInput {
        PositionInput {
            housenumber: "75100_0001_12_".to_string(),
            kind: "entrance".to_string(),
            source: "BAN".to_string(),
            center: json!({"type": "Point", "coordinates": [2.3550, 48.8760]}),
            positioning: None,
        }
    }

    #[test]
    fn test_validate_defaults_positioning_to_other() {
        let store = seeded_store();
        let cs = validate(&store, None, &position_input(), false).unwrap();
        assert_eq!(cs.fields.positioning, Positioning::Other);
        assert_eq!(cs.fields.kind, PositionKind::Entrance);
    }

    #[test]
    fn test_validate_housenumber_checked_first() {
        let store = seeded_store();
        let mut input = position_input();
        input.housenumber = "99999_9999_1_".to_string();
        input.kind = "bogus".to_string();
        let err = validate(&store, None, &input, false).unwrap_err();
        // Only the housenumber reference error; the kind is never reached.
        assert_eq!(err.fields(), vec!["housenumber"]);
    }

    #[test]
    fn test_validate_rejects_bad_center() {
        let store = seeded_store();
        let mut input = position_input();
        input.center = json!("not a geometry");
        let err = validate(&store, None, &input, false).unwrap_err();
        assert_eq!(err.fields(), vec!["center"]);
    }

    #[test]
    fn test_validate_explicit_positioning() {
        let store = seeded_store();
        let mut input = position_input();
        input.positioning = Some("gps".to_string());
        let cs = validate(&store, None, &input, false).unwrap();
        assert_eq!(cs.fields.positioning, Positioning::Gps);
    }
}
