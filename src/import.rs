// Import Driver - bulk reconciliation of line-delimited JSON records
//
// Each input line is one record with a `type` discriminator. The driver
// dispatches to the per-entity handler, which resolves natural keys, applies
// the entity's dedup policy, runs the validator, and saves. One record's
// failure never stops the batch: every outcome lands in the Reporter with
// enough context to diagnose it afterwards.
//
// Records are read lazily, grouped into fixed-size chunks, and fanned out to
// a bounded pool of workers, each owning its own store connection. There is
// no ordering guarantee between records: a housenumber processed before its
// parent group simply fails natural-key resolution and is reported. Callers
// feed files in dependency order (municipalities, groups, housenumbers,
// positions).

use serde_json::{json, Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use crate::entities::{
    group, housenumber, municipality, position, postcode, Attributes, GroupInput,
    HouseNumberInput, MunicipalityInput, ParentRef, PositionInput, PositionKind, PostCodeInput,
};
use crate::errors::StoreError;
use crate::identifiers::{derive_cia, split_fantoir, strip_control_char};
use crate::report::Reporter;
use crate::store::Store;

/// How many records between progress lines.
const PROGRESS_EVERY: usize = 5000;

// ============================================================================
// OUTCOME
// ============================================================================

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    /// The record matched its dedup key and the policy says: leave it alone.
    SkippedDuplicate,
    Error,
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Process one import record against the store.
///
/// Never panics, never aborts: every failure path records a report entry and
/// returns `Outcome::Error`.
pub fn process_record(store: &Store, record: &Value, reporter: &mut Reporter) -> Outcome {
    let Some(obj) = record.as_object() else {
        reporter.error("record is not a JSON object", record.clone());
        return Outcome::Error;
    };
    let Some(kind) = obj.get("type").and_then(Value::as_str) else {
        reporter.error("missing `type` key", record.clone());
        return Outcome::Error;
    };
    match kind {
        "municipality" => process_municipality(store, obj, reporter),
        "group" => process_group(store, obj, reporter),
        "postcode" => process_postcode(store, obj, reporter),
        "housenumber" => process_housenumber(store, obj, reporter),
        "position" => process_position(store, obj, reporter),
        other => {
            reporter.error("unknown record type", json!({ "type": other }));
            Outcome::Error
        }
    }
}

fn take_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

// ============================================================================
// PER-ENTITY HANDLERS
// ============================================================================

/// Municipality: create-only. No dedup check; the UNIQUE index on insee is
/// the backstop against re-imports.
fn process_municipality(
    store: &Store,
    obj: &Map<String, Value>,
    reporter: &mut Reporter,
) -> Outcome {
    let insee = take_str(obj, "insee").unwrap_or_default();
    let attributes = match take_str(obj, "source") {
        Some(source) => Attributes::with_source(&source),
        None => Attributes::new(),
    };
    let input = MunicipalityInput {
        insee: insee.clone(),
        name: take_str(obj, "name").unwrap_or_default(),
        attributes,
    };

    let cs = match municipality::validate(store, None, &input, false) {
        Ok(cs) => cs,
        Err(errors) => {
            reporter.error(
                "invalid municipality data",
                json!({ "insee": insee, "errors": errors }),
            );
            return Outcome::Error;
        }
    };
    match store.save_municipality(&cs) {
        Ok(saved) => {
            reporter.notice("imported municipality", json!({ "insee": saved.insee }));
            Outcome::Created
        }
        Err(e) => {
            reporter.error(
                "could not save municipality",
                json!({ "insee": insee, "detail": e.to_string() }),
            );
            Outcome::Error
        }
    }
}

/// Group: the `source` marker tells a re-sent batch from an authoritative
/// update. Same source: skip with a warning. Different source: version + 1
/// and overwrite.
fn process_group(store: &Store, obj: &Map<String, Value>, reporter: &mut Reporter) -> Outcome {
    let Some(raw_fantoir) = take_str(obj, "group:fantoir") else {
        reporter.error("missing `group:fantoir` key", Value::Object(obj.clone()));
        return Outcome::Error;
    };
    let fantoir = match crate::identifiers::derive_fantoir(&raw_fantoir) {
        Ok(fantoir) => fantoir,
        Err(e) => {
            reporter.error(
                "invalid group fantoir",
                json!({ "fantoir": raw_fantoir, "detail": e.to_string() }),
            );
            return Outcome::Error;
        }
    };
    let source = take_str(obj, "source").unwrap_or_default();
    let input = GroupInput {
        fantoir: fantoir.clone(),
        name: take_str(obj, "name").unwrap_or_default(),
        kind: take_str(obj, "group").unwrap_or_default(),
        municipality: ParentRef::Municipality(
            take_str(obj, "municipality:insee").unwrap_or_default(),
        ),
        attributes: Attributes::with_source(&source),
    };

    let existing = match store.get_group_by_fantoir(&fantoir) {
        Ok(existing) => existing,
        Err(e) => {
            reporter.error(
                "group lookup failed",
                json!({ "fantoir": fantoir, "detail": e.to_string() }),
            );
            return Outcome::Error;
        }
    };
    if let Some(current) = &existing {
        if current.attributes.source() == Some(source.as_str()) {
            // Reimporting same data?
            reporter.warning(
                "group already imported",
                json!({ "fantoir": fantoir, "source": source }),
            );
            return Outcome::SkippedDuplicate;
        }
    }

    let update = existing.is_some();
    let cs = match group::validate(store, existing.as_ref(), &input, update) {
        Ok(cs) => cs,
        Err(errors) => {
            reporter.error(
                "invalid group data",
                json!({ "fantoir": fantoir, "errors": errors }),
            );
            return Outcome::Error;
        }
    };
    match store.save_group(&cs) {
        Ok(saved) => {
            if update {
                reporter.notice(
                    "updated group",
                    json!({ "fantoir": saved.fantoir, "version": saved.version }),
                );
                Outcome::Updated
            } else {
                reporter.notice("created group", json!({ "fantoir": saved.fantoir }));
                Outcome::Created
            }
        }
        Err(e) => {
            reporter.error(
                "could not save group",
                json!({ "fantoir": fantoir, "detail": e.to_string() }),
            );
            Outcome::Error
        }
    }
}

/// PostCode: create-once. A stored `(code, name)` pair makes the record a
/// no-op; append-only reference data is idempotent by construction.
fn process_postcode(store: &Store, obj: &Map<String, Value>, reporter: &mut Reporter) -> Outcome {
    let code = take_str(obj, "postcode").unwrap_or_default();
    let name = take_str(obj, "name").unwrap_or_default();

    match store.get_postcode_by_pair(&code, &name) {
        Ok(Some(_)) => {
            reporter.notice(
                "postcode already exists",
                json!({ "code": code, "name": name }),
            );
            return Outcome::SkippedDuplicate;
        }
        Ok(None) => {}
        Err(e) => {
            reporter.error(
                "postcode lookup failed",
                json!({ "code": code, "detail": e.to_string() }),
            );
            return Outcome::Error;
        }
    }

    let input = PostCodeInput {
        code: code.clone(),
        name,
        municipality: ParentRef::Municipality(
            take_str(obj, "municipality:insee").unwrap_or_default(),
        ),
    };
    let cs = match postcode::validate(store, None, &input, false) {
        Ok(cs) => cs,
        Err(errors) => {
            reporter.error(
                "invalid postcode data",
                json!({ "code": code, "errors": errors }),
            );
            return Outcome::Error;
        }
    };
    match store.save_postcode(&cs) {
        Ok(saved) => {
            reporter.notice("imported postcode", json!({ "code": saved.code }));
            Outcome::Created
        }
        Err(e) => {
            reporter.error(
                "could not save postcode",
                json!({ "code": code, "detail": e.to_string() }),
            );
            Outcome::Error
        }
    }
}

/// HouseNumber: every sighting is authoritative. Absent: create version 1.
/// Present: always version + 1 and overwrite, no source-based dedup.
fn process_housenumber(
    store: &Store,
    obj: &Map<String, Value>,
    reporter: &mut Reporter,
) -> Outcome {
    let Some(raw_fantoir) = take_str(obj, "group:fantoir") else {
        reporter.error("missing `group:fantoir` key", Value::Object(obj.clone()));
        return Outcome::Error;
    };
    let (insee, local_code) = match split_fantoir(&raw_fantoir) {
        Ok(parts) => parts,
        Err(e) => {
            reporter.error(
                "invalid housenumber fantoir",
                json!({ "fantoir": raw_fantoir, "detail": e.to_string() }),
            );
            return Outcome::Error;
        }
    };
    let fantoir = format!("{}{}", insee, local_code);
    let number = take_str(obj, "numero").unwrap_or_default();
    let ordinal = take_str(obj, "ordinal").filter(|o| !o.is_empty());
    let cia = derive_cia(&insee, &local_code, &number, ordinal.as_deref());

    let existing = match store.get_housenumber_by_cia(&cia) {
        Ok(existing) => existing,
        Err(e) => {
            reporter.error(
                "housenumber lookup failed",
                json!({ "cia": cia, "detail": e.to_string() }),
            );
            return Outcome::Error;
        }
    };
    let update = existing.is_some();

    let input = HouseNumberInput {
        cia: cia.clone(),
        number: number.clone(),
        ordinal: ordinal.clone(),
        group: ParentRef::Group(fantoir.clone()),
    };
    let cs = match housenumber::validate(store, existing.as_ref(), &input, update) {
        Ok(cs) => cs,
        Err(errors) => {
            reporter.error(
                "invalid housenumber data",
                json!({ "cia": cia, "group": format!("fantoir:{}", fantoir), "errors": errors }),
            );
            return Outcome::Error;
        }
    };
    match store.save_housenumber(&cs) {
        Ok(saved) => {
            let message = if update {
                "housenumber updated"
            } else {
                "housenumber created"
            };
            reporter.notice(
                message,
                json!({ "number": number, "ordinal": ordinal, "cia": saved.cia }),
            );
            if update {
                Outcome::Updated
            } else {
                Outcome::Created
            }
        }
        Err(e) => {
            reporter.error(
                "could not save housenumber",
                json!({ "cia": cia, "detail": e.to_string() }),
            );
            Outcome::Error
        }
    }
}

/// Position: versioned per `(housenumber, kind, source)` triple. A matching
/// triple bumps the version and overwrites geometry and positioning.
fn process_position(store: &Store, obj: &Map<String, Value>, reporter: &mut Reporter) -> Outcome {
    let Some(raw_cia) = take_str(obj, "housenumber:cia") else {
        reporter.error("missing `housenumber:cia` key", Value::Object(obj.clone()));
        return Outcome::Error;
    };
    // Foreign keys carry a control letter that internal keys do not.
    let cia = match strip_control_char(&raw_cia) {
        Ok(cia) => cia,
        Err(e) => {
            reporter.error(
                "invalid position cia",
                json!({ "cia": raw_cia, "detail": e.to_string() }),
            );
            return Outcome::Error;
        }
    };

    let housenumber = match store.get_housenumber_by_cia(&cia) {
        Ok(Some(hn)) => hn,
        Ok(None) => {
            reporter.error("position housenumber does not exist", json!({ "cia": cia }));
            return Outcome::Error;
        }
        Err(e) => {
            reporter.error(
                "housenumber lookup failed",
                json!({ "cia": cia, "detail": e.to_string() }),
            );
            return Outcome::Error;
        }
    };

    let kind = take_str(obj, "kind").unwrap_or_default();
    let source = take_str(obj, "source").unwrap_or_default();
    let existing = match PositionKind::parse(&kind) {
        Some(parsed) => match store.get_position_by_triple(&housenumber.id, parsed, &source) {
            Ok(existing) => existing,
            Err(e) => {
                reporter.error(
                    "position lookup failed",
                    json!({ "cia": cia, "detail": e.to_string() }),
                );
                return Outcome::Error;
            }
        },
        // Unknown kind: let the validator report it as a field error.
        None => None,
    };
    let update = existing.is_some();

    let input = PositionInput {
        housenumber: cia.clone(),
        kind,
        source,
        center: obj.get("geometry").cloned().unwrap_or(Value::Null),
        positioning: take_str(obj, "positioning"),
    };
    let cs = match position::validate(store, existing.as_ref(), &input, update) {
        Ok(cs) => cs,
        Err(errors) => {
            reporter.error(
                "invalid position data",
                json!({ "cia": cia, "errors": errors }),
            );
            return Outcome::Error;
        }
    };
    match store.save_position(&cs) {
        Ok(saved) => {
            let message = if update {
                "position updated"
            } else {
                "position created"
            };
            reporter.notice(message, json!({ "id": saved.id, "version": saved.version }));
            if update {
                Outcome::Updated
            } else {
                Outcome::Created
            }
        }
        Err(e) => {
            reporter.error(
                "could not save position",
                json!({ "cia": cia, "detail": e.to_string() }),
            );
            Outcome::Error
        }
    }
}

// ============================================================================
// BATCH PIPELINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Cap on record count, for dry runs and sampling. 0 means no cap.
    pub limit: usize,
    /// Records per chunk handed to a worker.
    pub chunk_size: usize,
    /// Bounded worker pool size; each worker owns its own store connection.
    pub workers: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        ImportOptions {
            limit: 0,
            chunk_size: 100,
            workers: 4,
        }
    }
}

/// Count non-empty input lines, for progress totals.
pub fn count_records(path: &Path) -> anyhow::Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let mut total = 0;
    for line in reader.lines() {
        if !line?.trim().is_empty() {
            total += 1;
        }
    }
    Ok(total)
}

fn process_chunk(store: &Store, lines: Vec<String>, reporter: &mut Reporter) {
    for line in lines {
        match serde_json::from_str::<Value>(&line) {
            Ok(record) => {
                let outcome = process_record(store, &record, reporter);
                match outcome {
                    Outcome::Created => reporter.tally_created(),
                    Outcome::Updated => reporter.tally_updated(),
                    Outcome::SkippedDuplicate => reporter.tally_skipped(),
                    Outcome::Error => reporter.tally_error(),
                }
            }
            Err(e) => {
                reporter.error(
                    "invalid JSON record",
                    json!({ "line": line, "detail": e.to_string() }),
                );
                reporter.tally_error();
            }
        }
    }
}

/// Run the initial bulk import: read records lazily, fan chunks out to the
/// worker pool, and return the merged report. Always returns `Ok` once the
/// file has been consumed; per-record failures live in the report.
pub fn run_init(
    db_path: &Path,
    input_path: &Path,
    options: &ImportOptions,
) -> anyhow::Result<Reporter> {
    // Initialize the schema up front so workers only ever open an existing
    // database.
    Store::open(db_path)?;

    let mut lines = BufReader::new(File::open(input_path)?).lines();

    let chunk_size = options.chunk_size.max(1);
    let workers = options.workers.max(1);
    let mut remaining = options.limit;
    let limited = options.limit > 0;

    // Pull the next chunk of non-empty lines off the reader, honoring the
    // record limit. An empty chunk means the input is exhausted.
    let mut next_chunk =
        |lines: &mut std::io::Lines<BufReader<File>>| -> anyhow::Result<Vec<String>> {
            let mut chunk = Vec::with_capacity(chunk_size);
            while chunk.len() < chunk_size {
                if limited && remaining == 0 {
                    break;
                }
                match lines.next() {
                    Some(line) => {
                        let line = line?;
                        if line.trim().is_empty() {
                            continue;
                        }
                        chunk.push(line);
                        if limited {
                            remaining -= 1;
                        }
                    }
                    None => break,
                }
            }
            Ok(chunk)
        };

    if workers == 1 {
        let store = Store::open(db_path)?;
        let mut reporter = Reporter::new();
        loop {
            let chunk = next_chunk(&mut lines)?;
            if chunk.is_empty() {
                break;
            }
            process_chunk(&store, chunk, &mut reporter);
        }
        return Ok(reporter);
    }

    let (sender, receiver) = mpsc::sync_channel::<Vec<String>>(workers * 2);
    let receiver = Arc::new(Mutex::new(receiver));
    let progress = AtomicUsize::new(0);
    let mut total_reporter = Reporter::new();

    thread::scope(|scope| -> anyhow::Result<()> {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let receiver = Arc::clone(&receiver);
            let progress = &progress;
            handles.push(scope.spawn(move || -> Result<Reporter, StoreError> {
                let store = Store::open(db_path)?;
                let mut reporter = Reporter::new();
                loop {
                    let chunk = {
                        let guard = receiver.lock().expect("receiver lock poisoned");
                        guard.recv()
                    };
                    let Ok(chunk) = chunk else { break };
                    let count = chunk.len();
                    process_chunk(&store, chunk, &mut reporter);
                    let done = progress.fetch_add(count, Ordering::Relaxed) + count;
                    if done / PROGRESS_EVERY != (done - count) / PROGRESS_EVERY {
                        println!("  ... {} records processed", done);
                    }
                }
                Ok(reporter)
            }));
        }

        loop {
            let chunk = next_chunk(&mut lines)?;
            if chunk.is_empty() {
                break;
            }
            if sender.send(chunk).is_err() {
                // All workers gone; their join results carry the reason.
                break;
            }
        }
        drop(sender);

        for handle in handles {
            let reporter = handle
                .join()
                .map_err(|_| anyhow::anyhow!("import worker panicked"))??;
            total_reporter.merge(reporter);
        }
        Ok(())
    })?;

    Ok(total_reporter)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Level;
    use std::io::Write;

    fn seeded() -> (Store, Reporter) {
        (Store::open_in_memory().unwrap(), Reporter::new())
    }

    fn run(store: &Store, reporter: &mut Reporter, record: Value) -> Outcome {
        process_record(store, &record, reporter)
    }

    fn municipality_record() -> Value {
        json!({
            "type": "municipality",
            "insee": "75100",
            "name": "Paris 10e",
            "source": "X"
        })
    }

    fn group_record(source: &str) -> Value {
        json!({
            "type": "group",
            "group:fantoir": "751000001",
            "municipality:insee": "75100",
            "name": "Rue du Faubourg Saint-Denis",
            "group": "way",
            "source": source
        })
    }

    fn housenumber_record() -> Value {
        json!({
            "type": "housenumber",
            "group:fantoir": "751000001",
            "numero": "12",
            "ordinal": "",
            "source": "X"
        })
    }

    #[test]
    fn test_missing_type_is_error_not_abort() {
        let (store, mut reporter) = seeded();
        let outcome = run(&store, &mut reporter, json!({"insee": "75100"}));
        assert_eq!(outcome, Outcome::Error);
        assert_eq!(reporter.entries_at(Level::Error).len(), 1);

        // The batch keeps going: the next record still lands.
        let outcome = run(&store, &mut reporter, municipality_record());
        assert_eq!(outcome, Outcome::Created);
    }

    #[test]
    fn test_unknown_type_is_error() {
        let (store, mut reporter) = seeded();
        let outcome = run(&store, &mut reporter, json!({"type": "district"}));
        assert_eq!(outcome, Outcome::Error);
    }

    #[test]
    fn test_municipality_import_derives_siren() {
        let (store, mut reporter) = seeded();
        let outcome = run(&store, &mut reporter, municipality_record());
        assert_eq!(outcome, Outcome::Created);

        let saved = store.get_municipality_by_insee("75100").unwrap().unwrap();
        assert_eq!(saved.siren, "210175100");
        assert_eq!(saved.attributes.source(), Some("X"));
        assert_eq!(saved.version, 1);
    }

    #[test]
    fn test_group_same_source_skips_different_source_updates() {
        let (store, mut reporter) = seeded();
        run(&store, &mut reporter, municipality_record());

        // First sighting: version 1
        assert_eq!(run(&store, &mut reporter, group_record("X")), Outcome::Created);
        let v1 = store.get_group_by_fantoir("751000001").unwrap().unwrap();
        assert_eq!(v1.version, 1);

        // Identical payload, same source: skip with a warning, no mutation
        assert_eq!(
            run(&store, &mut reporter, group_record("X")),
            Outcome::SkippedDuplicate
        );
        let unchanged = store.get_group_by_fantoir("751000001").unwrap().unwrap();
        assert_eq!(unchanged.version, 1);
        assert_eq!(reporter.entries_at(Level::Warning).len(), 1);

        // Different source: version 2, fields overwritten
        assert_eq!(run(&store, &mut reporter, group_record("Y")), Outcome::Updated);
        let v2 = store.get_group_by_fantoir("751000001").unwrap().unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.attributes.source(), Some("Y"));
        assert_eq!(v2.id, v1.id);
    }

    #[test]
    fn test_postcode_create_once() {
        let (store, mut reporter) = seeded();
        run(&store, &mut reporter, municipality_record());

        let record = json!({
            "type": "postcode",
            "postcode": "75010",
            "name": "PARIS 10",
            "municipality:insee": "75100"
        });
        assert_eq!(run(&store, &mut reporter, record.clone()), Outcome::Created);
        assert_eq!(
            run(&store, &mut reporter, record),
            Outcome::SkippedDuplicate
        );
        assert_eq!(store.count_postcodes().unwrap(), 1);
    }

    #[test]
    fn test_housenumber_reimport_always_bumps_version() {
        let (store, mut reporter) = seeded();
        run(&store, &mut reporter, municipality_record());
        run(&store, &mut reporter, group_record("X"));

        // Identical record twice: v1 then v2, same field values. This is the
        // contract, not a bug: housenumbers have no source dedup signal.
        assert_eq!(
            run(&store, &mut reporter, housenumber_record()),
            Outcome::Created
        );
        let v1 = store
            .get_housenumber_by_cia("75100_0001_12_")
            .unwrap()
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v1.ordinal, None);

        assert_eq!(
            run(&store, &mut reporter, housenumber_record()),
            Outcome::Updated
        );
        let v2 = store
            .get_housenumber_by_cia("75100_0001_12_")
            .unwrap()
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.number, v1.number);
        assert_eq!(v2.ordinal, v1.ordinal);
        assert_eq!(v2.id, v1.id);
    }

    #[test]
    fn test_housenumber_before_group_is_reference_error() {
        let (store, mut reporter) = seeded();
        run(&store, &mut reporter, municipality_record());

        // Parent group not committed yet: rejected, not retried
        assert_eq!(
            run(&store, &mut reporter, housenumber_record()),
            Outcome::Error
        );
        let errors = reporter.entries_at(Level::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].context.to_string().contains("fantoir:751000001"));
    }

    #[test]
    fn test_position_triple_upsert_and_default_positioning() {
        let (store, mut reporter) = seeded();
        run(&store, &mut reporter, municipality_record());
        run(&store, &mut reporter, group_record("X"));
        run(&store, &mut reporter, housenumber_record());

        // External cia carries a control letter at offset 10
        let record = json!({
            "type": "position",
            "housenumber:cia": "75100_0001K_12_",
            "kind": "entrance",
            "source": "X",
            "geometry": {"type": "Point", "coordinates": [2.3550, 48.8760]}
        });
        assert_eq!(run(&store, &mut reporter, record.clone()), Outcome::Created);

        let hn = store
            .get_housenumber_by_cia("75100_0001_12_")
            .unwrap()
            .unwrap();
        let v1 = store
            .get_position_by_triple(&hn.id, PositionKind::Entrance, "X")
            .unwrap()
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v1.positioning.as_str(), "other");

        // Matching triple: version 2, geometry overwritten
        let mut updated = record.clone();
        updated["geometry"] = json!({"type": "Point", "coordinates": [2.3551, 48.8761]});
        assert_eq!(run(&store, &mut reporter, updated), Outcome::Updated);
        let v2 = store
            .get_position_by_triple(&hn.id, PositionKind::Entrance, "X")
            .unwrap()
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.center["coordinates"][0], 2.3551);

        // Different source: a new triple, version 1
        let mut other_source = record;
        other_source["source"] = json!("Y");
        assert_eq!(run(&store, &mut reporter, other_source), Outcome::Created);
        let fresh = store
            .get_position_by_triple(&hn.id, PositionKind::Entrance, "Y")
            .unwrap()
            .unwrap();
        assert_eq!(fresh.version, 1);
    }

    #[test]
    fn test_position_without_housenumber_is_error() {
        let (store, mut reporter) = seeded();
        let record = json!({
            "type": "position",
            "housenumber:cia": "75100_0001K_12_",
            "kind": "entrance",
            "source": "X",
            "geometry": {"type": "Point", "coordinates": [0.0, 0.0]}
        });
        assert_eq!(run(&store, &mut reporter, record), Outcome::Error);
    }

    #[test]
    fn test_end_to_end_scenario() {
        // The full walkthrough: municipality, group, duplicate group, source
        // change.
        let (store, mut reporter) = seeded();

        assert_eq!(
            run(&store, &mut reporter, municipality_record()),
            Outcome::Created
        );
        let municipality = store.get_municipality_by_insee("75100").unwrap().unwrap();
        assert_eq!(municipality.siren, format!("{}{}", "2101", "75100"));

        assert_eq!(run(&store, &mut reporter, group_record("X")), Outcome::Created);
        let group = store.get_group_by_fantoir("751000001").unwrap().unwrap();
        assert_eq!(group.fantoir, format!("{}{}", "75100", "0001"));
        assert_eq!(group.version, 1);

        assert_eq!(
            run(&store, &mut reporter, group_record("X")),
            Outcome::SkippedDuplicate
        );
        assert_eq!(
            store
                .get_group_by_fantoir("751000001")
                .unwrap()
                .unwrap()
                .version,
            1
        );

        assert_eq!(run(&store, &mut reporter, group_record("Y")), Outcome::Updated);
        let after = store.get_group_by_fantoir("751000001").unwrap().unwrap();
        assert_eq!(after.version, 2);
        assert_eq!(after.attributes.source(), Some("Y"));
    }

    #[test]
    fn test_run_init_with_worker_pool() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("addresses.db");
        let input_path = dir.path().join("records.ndjson");

        let mut file = File::create(&input_path).unwrap();
        writeln!(file, "{}", municipality_record()).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{}", json!({"type": "district"})).unwrap();
        file.sync_all().unwrap();

        assert_eq!(count_records(&input_path).unwrap(), 2);

        let options = ImportOptions {
            workers: 2,
            chunk_size: 1,
            ..ImportOptions::default()
        };
        let reporter = run_init(&db_path, &input_path, &options).unwrap();
        assert_eq!(reporter.processed(), 2);
        assert_eq!(reporter.created(), 1);
        assert_eq!(reporter.errors(), 1);

        let store = Store::open(&db_path).unwrap();
        assert_eq!(store.count_municipalities().unwrap(), 1);
    }

    #[test]
    fn test_run_init_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("addresses.db");
        let input_path = dir.path().join("records.ndjson");

        let mut file = File::create(&input_path).unwrap();
        writeln!(file, "{}", municipality_record()).unwrap();
        writeln!(file, "{}", group_record("X")).unwrap();
        file.sync_all().unwrap();

        let options = ImportOptions {
            limit: 1,
            workers: 1,
            ..ImportOptions::default()
        };
        let reporter = run_init(&db_path, &input_path, &options).unwrap();
        assert_eq!(reporter.processed(), 1);
        assert_eq!(reporter.created(), 1);
    }
}
