// Entity Store - SQLite-backed storage with version control
//
// One table per entity, UNIQUE indexes on the natural keys, plus an
// append-only `versions` table that snapshots every saved version as JSON.
// Saves go through change-sets produced by the validators:
// - create: INSERT at version 1 (natural-key UNIQUE constraint is the
//   backstop against racing creates)
// - update: compare-and-swap on the version column; zero affected rows means
//   another writer advanced the entity and the save fails with a conflict
//
// Every save is wrapped in its own transaction so the entity write and the
// version snapshot commit or roll back together.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use crate::entities::{
    Attributes, Group, GroupChangeSet, GroupKind, HouseNumber, HouseNumberChangeSet, Municipality,
    MunicipalityChangeSet, Position, PositionChangeSet, PositionKind, Positioning, PostCode,
    PostCodeChangeSet,
};
use crate::errors::StoreError;

/// One snapshot from the append-only version history.
#[derive(Debug, Clone, Serialize)]
pub struct VersionRecord {
    pub resource: String,
    pub resource_id: String,
    pub version: i64,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (and initialize) a file-backed store.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Store { conn };
        store.setup()?;
        Ok(store)
    }

    /// Open an in-memory store (tests, dry runs).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Store { conn };
        store.setup()?;
        Ok(store)
    }

    fn setup(&self) -> Result<(), StoreError> {
        // WAL for crash recovery and concurrent import workers; a busy
        // timeout so parallel workers queue on the write lock instead of
        // failing immediately.
        let _ = self
            .conn
            .pragma_update(None, "journal_mode", "WAL");
        self.conn.busy_timeout(Duration::from_secs(5))?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS municipalities (
                id TEXT PRIMARY KEY,
                insee TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                siren TEXT NOT NULL,
                attributes TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                municipality_id TEXT NOT NULL REFERENCES municipalities(id),
                fantoir TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                attributes TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS postcodes (
                id TEXT PRIMARY KEY,
                municipality_id TEXT NOT NULL REFERENCES municipalities(id),
                code TEXT NOT NULL,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                UNIQUE(code, name)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS housenumbers (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL REFERENCES groups(id),
                cia TEXT UNIQUE NOT NULL,
                number TEXT NOT NULL,
                ordinal TEXT,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                housenumber_id TEXT NOT NULL REFERENCES housenumbers(id),
                kind TEXT NOT NULL,
                source TEXT NOT NULL,
                center TEXT NOT NULL,
                positioning TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                UNIQUE(housenumber_id, kind, source)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(resource, resource_id, version)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_versions_resource
             ON versions(resource, resource_id)",
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // ROW MAPPING
    // ========================================================================

    fn parse_ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| rusqlite::Error::InvalidQuery)
    }

    fn parse_json<T: serde::de::DeserializeOwned>(raw: String) -> rusqlite::Result<T> {
        serde_json::from_str(&raw).map_err(|_| rusqlite::Error::InvalidQuery)
    }

    fn municipality_from_row(row: &Row<'_>) -> rusqlite::Result<Municipality> {
        Ok(Municipality {
            id: row.get(0)?,
            insee: row.get(1)?,
            name: row.get(2)?,
            siren: row.get(3)?,
            attributes: Self::parse_json::<Attributes>(row.get(4)?)?,
            version: row.get(5)?,
            created_at: Self::parse_ts(row.get(6)?)?,
            modified_at: Self::parse_ts(row.get(7)?)?,
        })
    }

    fn group_from_row(row: &Row<'_>) -> rusqlite::Result<Group> {
        let kind: String = row.get(4)?;
        Ok(Group {
            id: row.get(0)?,
            municipality_id: row.get(1)?,
            fantoir: row.get(2)?,
            name: row.get(3)?,
            kind: GroupKind::parse(&kind).ok_or(rusqlite::Error::InvalidQuery)?,
            attributes: Self::parse_json::<Attributes>(row.get(5)?)?,
            version: row.get(6)?,
            created_at: Self::parse_ts(row.get(7)?)?,
            modified_at: Self::parse_ts(row.get(8)?)?,
        })
    }

    fn postcode_from_row(row: &Row<'_>) -> rusqlite::Result<PostCode> {
        Ok(PostCode {
            id: row.get(0)?,
            municipality_id: row.get(1)?,
            code: row.get(2)?,
            name: row.get(3)?,
            version: row.get(4)?,
            created_at: Self::parse_ts(row.get(5)?)?,
            modified_at: Self::parse_ts(row.get(6)?)?,
        })
    }

    fn housenumber_from_row(row: &Row<'_>) -> rusqlite::Result<HouseNumber> {
        Ok(HouseNumber {
            id: row.get(0)?,
            group_id: row.get(1)?,
            cia: row.get(2)?,
            number: row.get(3)?,
            ordinal: row.get(4)?,
            version: row.get(5)?,
            created_at: Self::parse_ts(row.get(6)?)?,
            modified_at: Self::parse_ts(row.get(7)?)?,
        })
    }

    fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
        let kind: String = row.get(2)?;
        let positioning: String = row.get(5)?;
        Ok(Position {
            id: row.get(0)?,
            housenumber_id: row.get(1)?,
            kind: PositionKind::parse(&kind).ok_or(rusqlite::Error::InvalidQuery)?,
            source: row.get(3)?,
            center: Self::parse_json::<serde_json::Value>(row.get(4)?)?,
            positioning: Positioning::parse(&positioning).ok_or(rusqlite::Error::InvalidQuery)?,
            version: row.get(6)?,
            created_at: Self::parse_ts(row.get(7)?)?,
            modified_at: Self::parse_ts(row.get(8)?)?,
        })
    }

    const MUNICIPALITY_COLS: &'static str =
        "id, insee, name, siren, attributes, version, created_at, modified_at";
    const GROUP_COLS: &'static str =
        "id, municipality_id, fantoir, name, kind, attributes, version, created_at, modified_at";
    const POSTCODE_COLS: &'static str =
        "id, municipality_id, code, name, version, created_at, modified_at";
    const HOUSENUMBER_COLS: &'static str =
        "id, group_id, cia, number, ordinal, version, created_at, modified_at";
    const POSITION_COLS: &'static str =
        "id, housenumber_id, kind, source, center, positioning, version, created_at, modified_at";

    // ========================================================================
    // MUNICIPALITY
    // ========================================================================

    pub fn get_municipality_by_insee(&self, insee: &str) -> Result<Option<Municipality>, StoreError> {
        self.one(
            &format!(
                "SELECT {} FROM municipalities WHERE insee = ?1",
                Self::MUNICIPALITY_COLS
            ),
            insee,
            Self::municipality_from_row,
        )
    }

    pub fn get_municipality_by_siren(&self, siren: &str) -> Result<Option<Municipality>, StoreError> {
        self.one(
            &format!(
                "SELECT {} FROM municipalities WHERE siren = ?1",
                Self::MUNICIPALITY_COLS
            ),
            siren,
            Self::municipality_from_row,
        )
    }

    pub fn get_municipality_by_id(&self, id: &str) -> Result<Option<Municipality>, StoreError> {
        self.one(
            &format!(
                "SELECT {} FROM municipalities WHERE id = ?1",
                Self::MUNICIPALITY_COLS
            ),
            id,
            Self::municipality_from_row,
        )
    }

    pub fn list_municipalities(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Municipality>, StoreError> {
        self.many(
            &format!(
                "SELECT {} FROM municipalities ORDER BY insee LIMIT ?1 OFFSET ?2",
                Self::MUNICIPALITY_COLS
            ),
            limit,
            offset,
            Self::municipality_from_row,
        )
    }

    pub fn count_municipalities(&self) -> Result<i64, StoreError> {
        self.count("municipalities")
    }

    /// Persist a validated municipality change-set.
    pub fn save_municipality(
        &self,
        cs: &MunicipalityChangeSet,
    ) -> Result<Municipality, StoreError> {
        let now = Utc::now().to_rfc3339();
        let attributes = serde_json::to_string(&cs.fields.attributes)?;
        let tx = self.conn.unchecked_transaction()?;

        match cs.expected_version {
            None => {
                tx.execute(
                    "INSERT INTO municipalities
                     (id, insee, name, siren, attributes, version, created_at, modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        cs.id,
                        cs.fields.insee,
                        cs.fields.name,
                        cs.fields.siren,
                        attributes,
                        cs.version,
                        now,
                    ],
                )?;
            }
            Some(expected) => {
                let affected = tx.execute(
                    "UPDATE municipalities
                     SET name = ?1, siren = ?2, attributes = ?3, version = ?4, modified_at = ?5
                     WHERE id = ?6 AND version = ?7",
                    params![
                        cs.fields.name,
                        cs.fields.siren,
                        attributes,
                        cs.version,
                        now,
                        cs.id,
                        expected,
                    ],
                )?;
                if affected == 0 {
                    return Err(Self::conflict(
                        &tx,
                        "municipalities",
                        "municipality",
                        &cs.id,
                        &cs.fields.insee,
                        expected,
                    ));
                }
            }
        }

        let entity = Self::fetch_saved(
            &tx,
            &format!(
                "SELECT {} FROM municipalities WHERE id = ?1",
                Self::MUNICIPALITY_COLS
            ),
            "municipality",
            &cs.id,
            Self::municipality_from_row,
        )?;
        Self::snapshot(&tx, "municipality", &cs.id, cs.version, &entity, &now)?;
        tx.commit()?;
        Ok(entity)
    }

    // ========================================================================
    // GROUP
    // ========================================================================

    pub fn get_group_by_fantoir(&self, fantoir: &str) -> Result<Option<Group>, StoreError> {
        self.one(
            &format!("SELECT {} FROM groups WHERE fantoir = ?1", Self::GROUP_COLS),
            fantoir,
            Self::group_from_row,
        )
    }

    pub fn get_group_by_id(&self, id: &str) -> Result<Option<Group>, StoreError> {
        self.one(
            &format!("SELECT {} FROM groups WHERE id = ?1", Self::GROUP_COLS),
            id,
            Self::group_from_row,
        )
    }

    pub fn list_groups(&self, limit: i64, offset: i64) -> Result<Vec<Group>, StoreError> {
        self.many(
            &format!(
                "SELECT {} FROM groups ORDER BY fantoir LIMIT ?1 OFFSET ?2",
                Self::GROUP_COLS
            ),
            limit,
            offset,
            Self::group_from_row,
        )
    }

    pub fn count_groups(&self) -> Result<i64, StoreError> {
        self.count("groups")
    }

    pub fn save_group(&self, cs: &GroupChangeSet) -> Result<Group, StoreError> {
        let now = Utc::now().to_rfc3339();
        let attributes = serde_json::to_string(&cs.fields.attributes)?;
        let tx = self.conn.unchecked_transaction()?;

        match cs.expected_version {
            None => {
                tx.execute(
                    "INSERT INTO groups
                     (id, municipality_id, fantoir, name, kind, attributes, version,
                      created_at, modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                    params![
                        cs.id,
                        cs.fields.municipality_id,
                        cs.fields.fantoir,
                        cs.fields.name,
                        cs.fields.kind.as_str(),
                        attributes,
                        cs.version,
                        now,
                    ],
                )?;
            }
            Some(expected) => {
                let affected = tx.execute(
                    "UPDATE groups
                     SET municipality_id = ?1, name = ?2, kind = ?3, attributes = ?4,
                         version = ?5, modified_at = ?6
                     WHERE id = ?7 AND version = ?8",
                    params![
                        cs.fields.municipality_id,
                        cs.fields.name,
                        cs.fields.kind.as_str(),
                        attributes,
                        cs.version,
                        now,
                        cs.id,
                        expected,
                    ],
                )?;
                if affected == 0 {
                    return Err(Self::conflict(
                        &tx,
                        "groups",
                        "group",
                        &cs.id,
                        &cs.fields.fantoir,
                        expected,
                    ));
                }
            }
        }

        let entity = Self::fetch_saved(
            &tx,
            &format!("SELECT {} FROM groups WHERE id = ?1", Self::GROUP_COLS),
            "group",
            &cs.id,
            Self::group_from_row,
        )?;
        Self::snapshot(&tx, "group", &cs.id, cs.version, &entity, &now)?;
        tx.commit()?;
        Ok(entity)
    }

    // ========================================================================
    // POSTCODE
    // ========================================================================

    pub fn get_postcode_by_pair(&self, code: &str, name: &str) -> Result<Option<PostCode>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM postcodes WHERE code = ?1 AND name = ?2",
            Self::POSTCODE_COLS
        ))?;
        let mut rows = stmt.query_map(params![code, name], Self::postcode_from_row)?;
        rows.next().transpose().map_err(StoreError::from)
    }

    pub fn get_postcode_by_id(&self, id: &str) -> Result<Option<PostCode>, StoreError> {
        self.one(
            &format!("SELECT {} FROM postcodes WHERE id = ?1", Self::POSTCODE_COLS),
            id,
            Self::postcode_from_row,
        )
    }

    pub fn get_postcode_by_code(&self, code: &str) -> Result<Option<PostCode>, StoreError> {
        self.one(
            &format!(
                "SELECT {} FROM postcodes WHERE code = ?1 ORDER BY name",
                Self::POSTCODE_COLS
            ),
            code,
            Self::postcode_from_row,
        )
    }

    pub fn list_postcodes(&self, limit: i64, offset: i64) -> Result<Vec<PostCode>, StoreError> {
        self.many(
            &format!(
                "SELECT {} FROM postcodes ORDER BY code, name LIMIT ?1 OFFSET ?2",
                Self::POSTCODE_COLS
            ),
            limit,
            offset,
            Self::postcode_from_row,
        )
    }

    pub fn count_postcodes(&self) -> Result<i64, StoreError> {
        self.count("postcodes")
    }

    pub fn save_postcode(&self, cs: &PostCodeChangeSet) -> Result<PostCode, StoreError> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;

        match cs.expected_version {
            None => {
                tx.execute(
                    "INSERT INTO postcodes
                     (id, municipality_id, code, name, version, created_at, modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        cs.id,
                        cs.fields.municipality_id,
                        cs.fields.code,
                        cs.fields.name,
                        cs.version,
                        now,
                    ],
                )?;
            }
            Some(expected) => {
                let affected = tx.execute(
                    "UPDATE postcodes
                     SET municipality_id = ?1, code = ?2, name = ?3, version = ?4,
                         modified_at = ?5
                     WHERE id = ?6 AND version = ?7",
                    params![
                        cs.fields.municipality_id,
                        cs.fields.code,
                        cs.fields.name,
                        cs.version,
                        now,
                        cs.id,
                        expected,
                    ],
                )?;
                if affected == 0 {
                    return Err(Self::conflict(
                        &tx,
                        "postcodes",
                        "postcode",
                        &cs.id,
                        &cs.fields.code,
                        expected,
                    ));
                }
            }
        }

        let entity = Self::fetch_saved(
            &tx,
            &format!("SELECT {} FROM postcodes WHERE id = ?1", Self::POSTCODE_COLS),
            "postcode",
            &cs.id,
            Self::postcode_from_row,
        )?;
        Self::snapshot(&tx, "postcode", &cs.id, cs.version, &entity, &now)?;
        tx.commit()?;
        Ok(entity)
    }

    // ========================================================================
    // HOUSENUMBER
    // ========================================================================

    pub fn get_housenumber_by_cia(&self, cia: &str) -> Result<Option<HouseNumber>, StoreError> {
        self.one(
            &format!(
                "SELECT {} FROM housenumbers WHERE cia = ?1",
                Self::HOUSENUMBER_COLS
            ),
            cia,
            Self::housenumber_from_row,
        )
    }

    pub fn get_housenumber_by_id(&self, id: &str) -> Result<Option<HouseNumber>, StoreError> {
        self.one(
            &format!(
                "SELECT {} FROM housenumbers WHERE id = ?1",
                Self::HOUSENUMBER_COLS
            ),
            id,
            Self::housenumber_from_row,
        )
    }

    pub fn list_housenumbers(&self, limit: i64, offset: i64) -> Result<Vec<HouseNumber>, StoreError> {
        self.many(
            &format!(
                "SELECT {} FROM housenumbers ORDER BY cia LIMIT ?1 OFFSET ?2",
                Self::HOUSENUMBER_COLS
            ),
            limit,
            offset,
            Self::housenumber_from_row,
        )
    }

    pub fn count_housenumbers(&self) -> Result<i64, StoreError> {
        self.count("housenumbers")
    }

    pub fn save_housenumber(&self, cs: &HouseNumberChangeSet) -> Result<HouseNumber, StoreError> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;

        match cs.expected_version {
            None => {
                tx.execute(
                    "INSERT INTO housenumbers
                     (id, group_id, cia, number, ordinal, version, created_at, modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        cs.id,
                        cs.fields.group_id,
                        cs.fields.cia,
                        cs.fields.number,
                        cs.fields.ordinal,
                        cs.version,
                        now,
                    ],
                )?;
            }
            Some(expected) => {
                // Natural keys never change on update; the validators refuse
                // a mismatched cia, so only the mutable columns are written.
                let affected = tx.execute(
                    "UPDATE housenumbers
                     SET group_id = ?1, number = ?2, ordinal = ?3, version = ?4,
                         modified_at = ?5
                     WHERE id = ?6 AND version = ?7",
                    params![
                        cs.fields.group_id,
                        cs.fields.number,
                        cs.fields.ordinal,
                        cs.version,
                        now,
                        cs.id,
                        expected,
                    ],
                )?;
                if affected == 0 {
                    return Err(Self::conflict(
                        &tx,
                        "housenumbers",
                        "housenumber",
                        &cs.id,
                        &cs.fields.cia,
                        expected,
                    ));
                }
            }
        }

        let entity = Self::fetch_saved(
            &tx,
            &format!(
                "SELECT {} FROM housenumbers WHERE id = ?1",
                Self::HOUSENUMBER_COLS
            ),
            "housenumber",
            &cs.id,
            Self::housenumber_from_row,
        )?;
        Self::snapshot(&tx, "housenumber", &cs.id, cs.version, &entity, &now)?;
        tx.commit()?;
        Ok(entity)
    }

    // ========================================================================
    // POSITION
    // ========================================================================

    pub fn get_position_by_triple(
        &self,
        housenumber_id: &str,
        kind: PositionKind,
        source: &str,
    ) -> Result<Option<Position>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM positions
             WHERE housenumber_id = ?1 AND kind = ?2 AND source = ?3",
            Self::POSITION_COLS
        ))?;
        let mut rows = stmt.query_map(
            params![housenumber_id, kind.as_str(), source],
            Self::position_from_row,
        )?;
        rows.next().transpose().map_err(StoreError::from)
    }

    pub fn get_position_by_id(&self, id: &str) -> Result<Option<Position>, StoreError> {
        self.one(
            &format!("SELECT {} FROM positions WHERE id = ?1", Self::POSITION_COLS),
            id,
            Self::position_from_row,
        )
    }

    pub fn list_positions(&self, limit: i64, offset: i64) -> Result<Vec<Position>, StoreError> {
        self.many(
            &format!(
                "SELECT {} FROM positions ORDER BY housenumber_id, kind, source LIMIT ?1 OFFSET ?2",
                Self::POSITION_COLS
            ),
            limit,
            offset,
            Self::position_from_row,
        )
    }

    pub fn count_positions(&self) -> Result<i64, StoreError> {
        self.count("positions")
    }

    pub fn save_position(&self, cs: &PositionChangeSet) -> Result<Position, StoreError> {
        let now = Utc::now().to_rfc3339();
        let center = serde_json::to_string(&cs.fields.center)?;
        let tx = self.conn.unchecked_transaction()?;

        match cs.expected_version {
            None => {
                tx.execute(
                    "INSERT INTO positions
                     (id, housenumber_id, kind, source, center, positioning, version,
                      created_at, modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                    params![
                        cs.id,
                        cs.fields.housenumber_id,
                        cs.fields.kind.as_str(),
                        cs.fields.source,
                        center,
                        cs.fields.positioning.as_str(),
                        cs.version,
                        now,
                    ],
                )?;
            }
            Some(expected) => {
                let affected = tx.execute(
                    "UPDATE positions
                     SET housenumber_id = ?1, kind = ?2, source = ?3, center = ?4,
                         positioning = ?5, version = ?6, modified_at = ?7
                     WHERE id = ?8 AND version = ?9",
                    params![
                        cs.fields.housenumber_id,
                        cs.fields.kind.as_str(),
                        cs.fields.source,
                        center,
                        cs.fields.positioning.as_str(),
                        cs.version,
                        now,
                        cs.id,
                        expected,
                    ],
                )?;
                if affected == 0 {
                    return Err(Self::conflict(
                        &tx,
                        "positions",
                        "position",
                        &cs.id,
                        &cs.id,
                        expected,
                    ));
                }
            }
        }

        let entity = Self::fetch_saved(
            &tx,
            &format!("SELECT {} FROM positions WHERE id = ?1", Self::POSITION_COLS),
            "position",
            &cs.id,
            Self::position_from_row,
        )?;
        Self::snapshot(&tx, "position", &cs.id, cs.version, &entity, &now)?;
        tx.commit()?;
        Ok(entity)
    }

    // ========================================================================
    // VERSION HISTORY
    // ========================================================================

    fn version_from_row(row: &Row<'_>) -> rusqlite::Result<VersionRecord> {
        Ok(VersionRecord {
            resource: row.get(0)?,
            resource_id: row.get(1)?,
            version: row.get(2)?,
            data: Self::parse_json::<serde_json::Value>(row.get(3)?)?,
            created_at: Self::parse_ts(row.get(4)?)?,
        })
    }

    /// Immutable version history for one entity, oldest first.
    pub fn version_history(
        &self,
        resource: &str,
        resource_id: &str,
    ) -> Result<Vec<VersionRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT resource, resource_id, version, data, created_at
             FROM versions
             WHERE resource = ?1 AND resource_id = ?2
             ORDER BY version",
        )?;
        let records = stmt
            .query_map(params![resource, resource_id], Self::version_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// One snapshot by its version number.
    pub fn version_snapshot(
        &self,
        resource: &str,
        resource_id: &str,
        version: i64,
    ) -> Result<Option<VersionRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT resource, resource_id, version, data, created_at
             FROM versions
             WHERE resource = ?1 AND resource_id = ?2 AND version = ?3",
        )?;
        let mut rows = stmt.query_map(
            params![resource, resource_id, version],
            Self::version_from_row,
        )?;
        rows.next().transpose().map_err(StoreError::from)
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn one<T>(
        &self,
        sql: &str,
        key: &str,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Option<T>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query_map(params![key], map)?;
        rows.next().transpose().map_err(StoreError::from)
    }

    fn many<T>(
        &self,
        sql: &str,
        limit: i64,
        offset: i64,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![limit, offset], map)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn count(&self, table: &str) -> Result<i64, StoreError> {
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
        Ok(count)
    }

    /// Build the conflict (or not-found) error for a failed CAS update. The
    /// pending transaction rolls back when dropped by the caller's `?`.
    fn conflict(
        tx: &rusqlite::Transaction<'_>,
        table: &str,
        resource: &'static str,
        id: &str,
        key: &str,
        expected: i64,
    ) -> StoreError {
        let stored: Result<i64, _> = tx.query_row(
            &format!("SELECT version FROM {} WHERE id = ?1", table),
            params![id],
            |row| row.get(0),
        );
        match stored {
            Ok(stored) => StoreError::Conflict {
                resource,
                key: key.to_string(),
                expected,
                stored,
            },
            Err(_) => StoreError::NotFound {
                resource,
                key: key.to_string(),
            },
        }
    }

    fn fetch_saved<T>(
        tx: &rusqlite::Transaction<'_>,
        sql: &str,
        resource: &'static str,
        id: &str,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut stmt = tx.prepare(sql)?;
        let mut rows = stmt.query_map(params![id], map)?;
        rows.next()
            .transpose()?
            .ok_or_else(|| StoreError::NotFound {
                resource,
                key: id.to_string(),
            })
    }

    /// Append an immutable snapshot of the saved version.
    fn snapshot<T: Serialize>(
        tx: &rusqlite::Transaction<'_>,
        resource: &str,
        resource_id: &str,
        version: i64,
        entity: &T,
        now: &str,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(entity)?;
        tx.execute(
            "INSERT INTO versions (resource, resource_id, version, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![resource, resource_id, version, data, now],
        )?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::municipality::{self, MunicipalityInput};
    use crate::entities::{Attributes, ChangeSet};

    fn municipality_input(insee: &str) -> MunicipalityInput {
        MunicipalityInput {
            insee: insee.to_string(),
            name: "Paris 10e".to_string(),
            attributes: Attributes::with_source("BAN"),
        }
    }

    fn create_municipality(store: &Store, insee: &str) -> Municipality {
        let cs = municipality::validate(store, None, &municipality_input(insee), false).unwrap();
        store.save_municipality(&cs).unwrap()
    }

    #[test]
    fn test_create_and_lookup_by_natural_key() {
        let store = Store::open_in_memory().unwrap();
        let saved = create_municipality(&store, "75100");

        let by_insee = store.get_municipality_by_insee("75100").unwrap().unwrap();
        assert_eq!(by_insee.id, saved.id);
        assert_eq!(by_insee.version, 1);
        assert_eq!(by_insee.siren, "210175100");

        let by_id = store.get_municipality_by_id(&saved.id).unwrap().unwrap();
        assert_eq!(by_id.insee, "75100");

        assert!(store.get_municipality_by_insee("99999").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_insee_hits_unique_constraint() {
        let store = Store::open_in_memory().unwrap();
        create_municipality(&store, "75100");

        let cs = municipality::validate(&store, None, &municipality_input("75100"), false).unwrap();
        let err = store.save_municipality(&cs).unwrap_err();
        assert!(err.is_constraint_violation());

        // Nothing partial was written
        assert_eq!(store.count_municipalities().unwrap(), 1);
        let existing = store.get_municipality_by_insee("75100").unwrap().unwrap();
        assert_eq!(store.version_history("municipality", &existing.id).unwrap().len(), 1);
    }

    #[test]
    fn test_update_requires_observed_version() {
        let store = Store::open_in_memory().unwrap();
        let saved = create_municipality(&store, "75100");

        // Two writers both observed version 1
        let input = municipality_input("75100");
        let cs_a = municipality::validate(&store, Some(&saved), &input, true).unwrap();
        let cs_b = municipality::validate(&store, Some(&saved), &input, true).unwrap();

        let updated = store.save_municipality(&cs_a).unwrap();
        assert_eq!(updated.version, 2);

        // Second writer is refused with the stored version in the error
        let err = store.save_municipality(&cs_b).unwrap_err();
        match err {
            StoreError::Conflict { expected, stored, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(stored, 2);
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        // Retry with the fresh version succeeds
        let fresh = store.get_municipality_by_insee("75100").unwrap().unwrap();
        let cs_retry = municipality::validate(&store, Some(&fresh), &input, true).unwrap();
        let retried = store.save_municipality(&cs_retry).unwrap();
        assert_eq!(retried.version, 3);
    }

    #[test]
    fn test_version_history_is_append_only() {
        let store = Store::open_in_memory().unwrap();
        let saved = create_municipality(&store, "75100");

        let input = municipality_input("75100");
        let cs = municipality::validate(&store, Some(&saved), &input, true).unwrap();
        store.save_municipality(&cs).unwrap();

        let history = store.version_history("municipality", &saved.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[1].version, 2);
        assert_eq!(history[1].data["insee"], "75100");
    }

    #[test]
    fn test_version_snapshot_by_number() {
        let store = Store::open_in_memory().unwrap();
        let saved = create_municipality(&store, "75100");

        let input = municipality_input("75100");
        let cs = municipality::validate(&store, Some(&saved), &input, true).unwrap();
        store.save_municipality(&cs).unwrap();

        let snapshot = store
            .version_snapshot("municipality", &saved.id, 1)
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.data["version"], 1);

        assert!(store
            .version_snapshot("municipality", &saved.id, 3)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_update_of_vanished_row_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let fields = municipality::validate(&store, None, &municipality_input("75100"), false)
            .unwrap()
            .fields;
        let cs = ChangeSet::update("no-such-id", 1, fields);
        let err = store.save_municipality(&cs).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_list_pagination() {
        let store = Store::open_in_memory().unwrap();
        for insee in ["75101", "75102", "75103"] {
            create_municipality(&store, insee);
        }
        assert_eq!(store.count_municipalities().unwrap(), 3);

        let page = store.list_municipalities(2, 0).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].insee, "75101");

        let page = store.list_municipalities(2, 2).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].insee, "75103");
    }
}
