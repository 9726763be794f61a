// Address Base - HTTP API Server
//
// One resource per entity, all routes built in one place from the descriptor
// table below. Collection endpoints return the envelope
// `{collection, total, next, previous}`; item endpoints address entities as
// `identifier:key` (for example `insee:75100`), falling back to the surrogate
// id when no identifier prefix is given.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;

use address_base::entities::{group, housenumber, municipality, position, postcode};
use address_base::errors::{ErrorSet, StoreError};
use address_base::store::Store;
use address_base::{
    GroupInput, HouseNumberInput, MunicipalityInput, PositionInput, PostCodeInput,
};

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Store>>,
}

// ============================================================================
// Resource Descriptors
// ============================================================================

/// One addressable resource: its URL segment and the natural-key identifiers
/// it answers to (besides the surrogate `id`).
struct ResourceDescriptor {
    name: &'static str,
    identifiers: &'static [&'static str],
}

const RESOURCES: &[ResourceDescriptor] = &[
    ResourceDescriptor {
        name: "municipality",
        identifiers: &["insee", "siren"],
    },
    ResourceDescriptor {
        name: "group",
        identifiers: &["fantoir"],
    },
    ResourceDescriptor {
        name: "postcode",
        identifiers: &["code"],
    },
    ResourceDescriptor {
        name: "housenumber",
        identifiers: &["cia"],
    },
    ResourceDescriptor {
        name: "position",
        identifiers: &[],
    },
];

// ============================================================================
// Pagination
// ============================================================================

/// Lenient paging: anything unparseable falls back to the default.
#[derive(Deserialize, Default)]
struct PageQuery {
    limit: Option<String>,
    offset: Option<String>,
}

impl PageQuery {
    fn limit(&self) -> i64 {
        self.limit
            .as_deref()
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|limit| *limit > 0)
            .map(|limit| limit.min(MAX_LIMIT))
            .unwrap_or(DEFAULT_LIMIT)
    }

    fn offset(&self) -> i64 {
        self.offset
            .as_deref()
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|offset| *offset >= 0)
            .unwrap_or(0)
    }
}

fn page_link(name: &str, limit: i64, offset: i64) -> String {
    format!("/api/{}?limit={}&offset={}", name, limit, offset)
}

// ============================================================================
// Errors
// ============================================================================

enum WriteError {
    Malformed(String),
    Invalid(ErrorSet),
    /// The caller pinned a version that is no longer the stored one.
    Stale {
        observed: i64,
        stored: i64,
        current: Value,
    },
    Store(StoreError),
}

impl From<StoreError> for WriteError {
    fn from(e: StoreError) -> Self {
        WriteError::Store(e)
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn store_error_response(store: &Store, descriptor: &ResourceDescriptor, e: StoreError) -> Response {
    match e {
        StoreError::Conflict { expected, stored, ref key, .. } => {
            // Hand the caller the stored entity so it can rebase and retry.
            // The conflict key may be the surrogate id or a natural key.
            let mut current = None;
            for identifier in std::iter::once(&"id").chain(descriptor.identifiers) {
                if let Ok(Some(found)) = fetch_item(store, descriptor.name, identifier, key) {
                    current = Some(found);
                    break;
                }
            }
            (
                StatusCode::CONFLICT,
                Json(json!({
                    "error": "version conflict",
                    "expected": expected,
                    "stored": stored,
                    "current": current,
                })),
            )
                .into_response()
        }
        StoreError::NotFound { .. } => json_error(StatusCode::NOT_FOUND, "not found"),
        ref e if e.is_constraint_violation() => {
            json_error(StatusCode::CONFLICT, "resource already exists")
        }
        e => {
            eprintln!("Storage error on {}: {}", descriptor.name, e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage error")
        }
    }
}

fn write_error_response(store: &Store, descriptor: &ResourceDescriptor, e: WriteError) -> Response {
    match e {
        WriteError::Malformed(message) => json_error(StatusCode::BAD_REQUEST, &message),
        WriteError::Invalid(errors) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "errors": errors })),
        )
            .into_response(),
        WriteError::Stale {
            observed,
            stored,
            current,
        } => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "version conflict",
                "expected": observed,
                "stored": stored,
                "current": current,
            })),
        )
            .into_response(),
        WriteError::Store(e) => store_error_response(store, descriptor, e),
    }
}

// ============================================================================
// Store access per resource
// ============================================================================

fn to_value<T: serde::Serialize>(entity: T) -> Result<Value, StoreError> {
    serde_json::to_value(entity).map_err(StoreError::from)
}

fn fetch_item(
    store: &Store,
    resource: &str,
    identifier: &str,
    key: &str,
) -> Result<Option<Value>, StoreError> {
    let found = match (resource, identifier) {
        ("municipality", "id") => store.get_municipality_by_id(key)?.map(to_value),
        ("municipality", "insee") => store.get_municipality_by_insee(key)?.map(to_value),
        ("municipality", "siren") => store.get_municipality_by_siren(key)?.map(to_value),
        ("group", "id") => store.get_group_by_id(key)?.map(to_value),
        ("group", "fantoir") => store.get_group_by_fantoir(key)?.map(to_value),
        ("postcode", "id") => store.get_postcode_by_id(key)?.map(to_value),
        ("postcode", "code") => store.get_postcode_by_code(key)?.map(to_value),
        ("housenumber", "id") => store.get_housenumber_by_id(key)?.map(to_value),
        ("housenumber", "cia") => store.get_housenumber_by_cia(key)?.map(to_value),
        ("position", "id") => store.get_position_by_id(key)?.map(to_value),
        _ => None,
    };
    found.transpose()
}

fn list_items(
    store: &Store,
    resource: &str,
    limit: i64,
    offset: i64,
) -> Result<(Vec<Value>, i64), StoreError> {
    let (items, total) = match resource {
        "municipality" => (
            store
                .list_municipalities(limit, offset)?
                .into_iter()
                .map(to_value)
                .collect::<Result<Vec<_>, _>>()?,
            store.count_municipalities()?,
        ),
        "group" => (
            store
                .list_groups(limit, offset)?
                .into_iter()
                .map(to_value)
                .collect::<Result<Vec<_>, _>>()?,
            store.count_groups()?,
        ),
        "postcode" => (
            store
                .list_postcodes(limit, offset)?
                .into_iter()
                .map(to_value)
                .collect::<Result<Vec<_>, _>>()?,
            store.count_postcodes()?,
        ),
        "housenumber" => (
            store
                .list_housenumbers(limit, offset)?
                .into_iter()
                .map(to_value)
                .collect::<Result<Vec<_>, _>>()?,
            store.count_housenumbers()?,
        ),
        "position" => (
            store
                .list_positions(limit, offset)?
                .into_iter()
                .map(to_value)
                .collect::<Result<Vec<_>, _>>()?,
            store.count_positions()?,
        ),
        _ => (Vec::new(), 0),
    };
    Ok((items, total))
}

fn parse_input<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, WriteError> {
    serde_json::from_value(body).map_err(|e| WriteError::Malformed(format!("invalid body: {}", e)))
}

fn save_new(store: &Store, resource: &str, body: Value) -> Result<Value, WriteError> {
    match resource {
        "municipality" => {
            let input: MunicipalityInput = parse_input(body)?;
            let cs = municipality::validate(store, None, &input, false)
                .map_err(WriteError::Invalid)?;
            Ok(to_value(store.save_municipality(&cs)?)?)
        }
        "group" => {
            let input: GroupInput = parse_input(body)?;
            let cs = group::validate(store, None, &input, false).map_err(WriteError::Invalid)?;
            Ok(to_value(store.save_group(&cs)?)?)
        }
        "postcode" => {
            let input: PostCodeInput = parse_input(body)?;
            let cs = postcode::validate(store, None, &input, false).map_err(WriteError::Invalid)?;
            Ok(to_value(store.save_postcode(&cs)?)?)
        }
        "housenumber" => {
            let input: HouseNumberInput = parse_input(body)?;
            let cs =
                housenumber::validate(store, None, &input, false).map_err(WriteError::Invalid)?;
            Ok(to_value(store.save_housenumber(&cs)?)?)
        }
        "position" => {
            let input: PositionInput = parse_input(body)?;
            let cs = position::validate(store, None, &input, false).map_err(WriteError::Invalid)?;
            Ok(to_value(store.save_position(&cs)?)?)
        }
        other => Err(WriteError::Malformed(format!(
            "unknown resource `{}`",
            other
        ))),
    }
}

/// The caller may pin the version it observed in the body; a stale one is
/// refused before validation. Races between the check and the save are caught
/// by the store's compare-and-swap.
fn check_observed_version<T: serde::Serialize>(
    body: &Value,
    stored: i64,
    current: &T,
) -> Result<(), WriteError> {
    match body.get("version").and_then(Value::as_i64) {
        Some(observed) if observed != stored => Err(WriteError::Stale {
            observed,
            stored,
            current: to_value(current)?,
        }),
        _ => Ok(()),
    }
}

fn save_update(
    store: &Store,
    resource: &str,
    identifier: &str,
    key: &str,
    body: Value,
) -> Result<Option<Value>, WriteError> {
    match resource {
        "municipality" => {
            let existing = match identifier {
                "id" => store.get_municipality_by_id(key)?,
                "insee" => store.get_municipality_by_insee(key)?,
                "siren" => store.get_municipality_by_siren(key)?,
                _ => None,
            };
            let Some(existing) = existing else {
                return Ok(None);
            };
            check_observed_version(&body, existing.version, &existing)?;
            let input: MunicipalityInput = parse_input(body)?;
            let cs = municipality::validate(store, Some(&existing), &input, true)
                .map_err(WriteError::Invalid)?;
            Ok(Some(to_value(store.save_municipality(&cs)?)?))
        }
        "group" => {
            let existing = match identifier {
                "id" => store.get_group_by_id(key)?,
                "fantoir" => store.get_group_by_fantoir(key)?,
                _ => None,
            };
            let Some(existing) = existing else {
                return Ok(None);
            };
            check_observed_version(&body, existing.version, &existing)?;
            let input: GroupInput = parse_input(body)?;
            let cs = group::validate(store, Some(&existing), &input, true)
                .map_err(WriteError::Invalid)?;
            Ok(Some(to_value(store.save_group(&cs)?)?))
        }
        "postcode" => {
            let existing = match identifier {
                "id" => store.get_postcode_by_id(key)?,
                "code" => store.get_postcode_by_code(key)?,
                _ => None,
            };
            let Some(existing) = existing else {
                return Ok(None);
            };
            check_observed_version(&body, existing.version, &existing)?;
            let input: PostCodeInput = parse_input(body)?;
            let cs = postcode::validate(store, Some(&existing), &input, true)
                .map_err(WriteError::Invalid)?;
            Ok(Some(to_value(store.save_postcode(&cs)?)?))
        }
        "housenumber" => {
            let existing = match identifier {
                "id" => store.get_housenumber_by_id(key)?,
                "cia" => store.get_housenumber_by_cia(key)?,
                _ => None,
            };
            let Some(existing) = existing else {
                return Ok(None);
            };
            check_observed_version(&body, existing.version, &existing)?;
            let input: HouseNumberInput = parse_input(body)?;
            let cs = housenumber::validate(store, Some(&existing), &input, true)
                .map_err(WriteError::Invalid)?;
            Ok(Some(to_value(store.save_housenumber(&cs)?)?))
        }
        "position" => {
            let existing = match identifier {
                "id" => store.get_position_by_id(key)?,
                _ => None,
            };
            let Some(existing) = existing else {
                return Ok(None);
            };
            check_observed_version(&body, existing.version, &existing)?;
            let input: PositionInput = parse_input(body)?;
            let cs = position::validate(store, Some(&existing), &input, true)
                .map_err(WriteError::Invalid)?;
            Ok(Some(to_value(store.save_position(&cs)?)?))
        }
        other => Err(WriteError::Malformed(format!(
            "unknown resource `{}`",
            other
        ))),
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Split `identifier:key` into its parts; a bare key addresses the surrogate
/// id. Unknown identifiers are a caller error, not a miss.
fn parse_key<'a>(
    descriptor: &ResourceDescriptor,
    raw: &'a str,
) -> Result<(&'a str, &'a str), Response> {
    match raw.split_once(':') {
        None => Ok(("id", raw)),
        Some((identifier, key)) => {
            if identifier == "id" || descriptor.identifiers.contains(&identifier) {
                Ok((identifier, key))
            } else {
                Err(json_error(
                    StatusCode::BAD_REQUEST,
                    &format!(
                        "unknown identifier `{}` for {}",
                        identifier, descriptor.name
                    ),
                ))
            }
        }
    }
}

fn list_resource(state: &AppState, descriptor: &ResourceDescriptor, page: &PageQuery) -> Response {
    let store = state.db.lock().unwrap();
    let limit = page.limit();
    let offset = page.offset();

    match list_items(&store, descriptor.name, limit, offset) {
        Ok((collection, total)) => {
            let next = (offset + limit < total)
                .then(|| page_link(descriptor.name, limit, offset + limit));
            let previous =
                (offset > 0).then(|| page_link(descriptor.name, limit, (offset - limit).max(0)));
            (
                StatusCode::OK,
                Json(json!({
                    "collection": collection,
                    "total": total,
                    "next": next,
                    "previous": previous,
                })),
            )
                .into_response()
        }
        Err(e) => store_error_response(&store, descriptor, e),
    }
}

fn get_resource(state: &AppState, descriptor: &ResourceDescriptor, raw_key: &str) -> Response {
    let store = state.db.lock().unwrap();
    let decoded = urlencoding::decode(raw_key)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw_key.to_string());
    let (identifier, key) = match parse_key(descriptor, &decoded) {
        Ok(parts) => parts,
        Err(response) => return response,
    };

    match fetch_item(&store, descriptor.name, identifier, key) {
        Ok(Some(entity)) => (StatusCode::OK, Json(entity)).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not found"),
        Err(e) => store_error_response(&store, descriptor, e),
    }
}

fn create_resource(state: &AppState, descriptor: &ResourceDescriptor, body: Value) -> Response {
    let store = state.db.lock().unwrap();
    match save_new(&store, descriptor.name, body) {
        Ok(entity) => (StatusCode::CREATED, Json(entity)).into_response(),
        Err(e) => write_error_response(&store, descriptor, e),
    }
}

fn update_resource(
    state: &AppState,
    descriptor: &ResourceDescriptor,
    raw_key: &str,
    body: Value,
) -> Response {
    let store = state.db.lock().unwrap();
    let decoded = urlencoding::decode(raw_key)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw_key.to_string());
    let (identifier, key) = match parse_key(descriptor, &decoded) {
        Ok(parts) => parts,
        Err(response) => return response,
    };

    match save_update(&store, descriptor.name, identifier, key, body) {
        Ok(Some(entity)) => (StatusCode::OK, Json(entity)).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not found"),
        Err(e) => write_error_response(&store, descriptor, e),
    }
}

fn resource_versions(state: &AppState, descriptor: &ResourceDescriptor, raw_key: &str) -> Response {
    let store = state.db.lock().unwrap();
    let decoded = urlencoding::decode(raw_key)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw_key.to_string());
    let (identifier, key) = match parse_key(descriptor, &decoded) {
        Ok(parts) => parts,
        Err(response) => return response,
    };

    let entity = match fetch_item(&store, descriptor.name, identifier, key) {
        Ok(Some(entity)) => entity,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "not found"),
        Err(e) => return store_error_response(&store, descriptor, e),
    };
    let Some(id) = entity.get("id").and_then(Value::as_str) else {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "entity has no id");
    };

    match store.version_history(descriptor.name, id) {
        Ok(history) => {
            let total = history.len();
            (
                StatusCode::OK,
                Json(json!({
                    "collection": history,
                    "total": total,
                })),
            )
                .into_response()
        }
        Err(e) => store_error_response(&store, descriptor, e),
    }
}

fn resource_version(
    state: &AppState,
    descriptor: &ResourceDescriptor,
    raw_key: &str,
    version: i64,
) -> Response {
    let store = state.db.lock().unwrap();
    let decoded = urlencoding::decode(raw_key)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw_key.to_string());
    let (identifier, key) = match parse_key(descriptor, &decoded) {
        Ok(parts) => parts,
        Err(response) => return response,
    };

    let entity = match fetch_item(&store, descriptor.name, identifier, key) {
        Ok(Some(entity)) => entity,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "not found"),
        Err(e) => return store_error_response(&store, descriptor, e),
    };
    let Some(id) = entity.get("id").and_then(Value::as_str) else {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "entity has no id");
    };

    match store.version_snapshot(descriptor.name, id, version) {
        Ok(Some(snapshot)) => (StatusCode::OK, Json(snapshot)).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "version does not exist"),
        Err(e) => store_error_response(&store, descriptor, e),
    }
}

// ============================================================================
// Router construction
// ============================================================================

/// Build every resource route from the descriptor table. Routes exist only
/// because a descriptor lists them here.
fn build_router(state: AppState) -> Router {
    let mut api = Router::new().route("/health", get(health_check));
    for descriptor in RESOURCES {
        let collection_path = format!("/{}", descriptor.name);
        let item_path = format!("/{}/:key", descriptor.name);
        let versions_path = format!("/{}/:key/versions", descriptor.name);
        let version_path = format!("/{}/:key/versions/:ref", descriptor.name);
        api = api
            .route(
                &collection_path,
                get(
                    move |State(state): State<AppState>, Query(page): Query<PageQuery>| async move {
                        list_resource(&state, descriptor, &page)
                    },
                )
                .post(
                    move |State(state): State<AppState>, Json(body): Json<Value>| async move {
                        create_resource(&state, descriptor, body)
                    },
                ),
            )
            .route(
                &item_path,
                get(
                    move |State(state): State<AppState>, Path(key): Path<String>| async move {
                        get_resource(&state, descriptor, &key)
                    },
                )
                .put(
                    move |State(state): State<AppState>,
                          Path(key): Path<String>,
                          Json(body): Json<Value>| async move {
                        update_resource(&state, descriptor, &key, body)
                    },
                ),
            )
            .route(
                &versions_path,
                get(
                    move |State(state): State<AppState>, Path(key): Path<String>| async move {
                        resource_versions(&state, descriptor, &key)
                    },
                ),
            )
            .route(
                &version_path,
                get(
                    move |State(state): State<AppState>,
                          Path((key, version)): Path<(String, i64)>| async move {
                        resource_version(&state, descriptor, &key, version)
                    },
                ),
            );
    }

    Router::new()
        .nest("/api", api.with_state(state))
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() {
    println!("🌐 Address Base - API Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let args: Vec<String> = std::env::args().collect();
    let mut db_path = std::path::PathBuf::from("addresses.db");
    let mut port: u16 = 3000;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--db" => {
                if let Some(value) = iter.next() {
                    db_path = std::path::PathBuf::from(value);
                }
            }
            "--port" => {
                if let Some(value) = iter.next() {
                    port = value.parse().unwrap_or(3000);
                }
            }
            _ => {}
        }
    }

    if !db_path.exists() {
        eprintln!("❌ Database not found at {:?}", db_path);
        eprintln!("   Run: cargo run init <records.ndjson> --db {:?}", db_path);
        eprintln!("   to import the address base first.");
        std::process::exit(1);
    }

    let store = Store::open(&db_path).expect("Failed to open database");
    println!("✓ Database opened: {:?}", db_path);

    let state = AppState {
        db: Arc::new(Mutex::new(store)),
    };
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    println!("\n🚀 Server running on http://localhost:{}", port);
    println!("   API: http://localhost:{}/api/municipality", port);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
