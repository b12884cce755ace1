//! API Service - Read-only query surface over the generated summary tables
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /filters - Distinct filter options for the dashboard controls
//! - GET /asignaciones - Filter + group-and-sum over the assignment table
//! - GET /nodos - Filter + group-and-sum over the node table
//! - GET /kpis - Totals and distinct country/node counts
//!
//! This service computes nothing the tables don't already contain: it only
//! filters, groups, and sums what the generator wrote. All data-correctness
//! logic lives in the generator.

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

const ASIGNACIONES_FILE: &str = "asignaciones_v2.csv";
const NODOS_FILE: &str = "nodos_detalle.csv";

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    asignaciones: Vec<AsignacionRow>,
    nodos: Vec<NodoRow>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct AsignacionRow {
    country: String,
    year_month: String,
    assignment_type: String,
    status: String,
    service_count: u64,
    case_count: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct NodoRow {
    node: String,
    country: String,
    year_month: String,
    status: String,
    service_count: u64,
    case_count: u64,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct FiltersResponse {
    years: Vec<String>,
    months: Vec<String>,
    countries: Vec<String>,
    assignment_types: Vec<String>,
    statuses: Vec<String>,
    nodes: Vec<String>,
}

/// Note: case totals sum per-key distinct counts, so an expediente spanning
/// several keys is counted once per key. Exact distinct counts exist only in
/// the generator, before the tables are flattened.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct KpisResponse {
    service_total: u64,
    case_total: u64,
    countries: usize,
    nodes: usize,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct AsignacionesQuery {
    year: Option<String>,
    month: Option<String>,
    country: Option<String>,
    assignment_type: Option<String>,
    status: Option<String>,
    /// Comma-separated subset of country,year_month,assignment_type,status
    group_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NodosQuery {
    year: Option<String>,
    month: Option<String>,
    country: Option<String>,
    status: Option<String>,
    /// Comma-separated subset of node,country,year_month,status
    group_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KpisQuery {
    year: Option<String>,
    month: Option<String>,
    country: Option<String>,
    assignment_type: Option<String>,
    status: Option<String>,
}

// ============================================================================
// Filtering and grouping
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Country,
    YearMonth,
    AssignmentType,
    Status,
    Node,
}

const ASIG_DIMENSIONS: &[Dimension] = &[
    Dimension::Country,
    Dimension::YearMonth,
    Dimension::AssignmentType,
    Dimension::Status,
];

const NODO_DIMENSIONS: &[Dimension] = &[
    Dimension::Node,
    Dimension::Country,
    Dimension::YearMonth,
    Dimension::Status,
];

impl Dimension {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "country" => Some(Self::Country),
            "year_month" => Some(Self::YearMonth),
            "assignment_type" => Some(Self::AssignmentType),
            "status" => Some(Self::Status),
            "node" => Some(Self::Node),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Country => "country",
            Self::YearMonth => "year_month",
            Self::AssignmentType => "assignment_type",
            Self::Status => "status",
            Self::Node => "node",
        }
    }
}

/// Parse a comma-separated group_by string against the dimensions the table
/// actually has. Empty or absent means one grand-total row.
fn parse_group_by(raw: Option<&str>, allowed: &[Dimension]) -> Result<Vec<Dimension>, String> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let mut dims = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let dim = Dimension::parse(part)
            .ok_or_else(|| format!("Unknown group_by dimension '{}'", part))?;
        if !allowed.contains(&dim) {
            return Err(format!("Dimension '{}' not available for this table", part));
        }
        if !dims.contains(&dim) {
            dims.push(dim);
        }
    }
    Ok(dims)
}

/// year matches the "YYYY" prefix of year_month; month matches the full "YYYY-MM"
fn year_month_matches(year_month: &str, year: Option<&str>, month: Option<&str>) -> bool {
    if let Some(y) = year {
        if year_month.get(..4) != Some(y) {
            return false;
        }
    }
    if let Some(m) = month {
        if year_month != m {
            return false;
        }
    }
    true
}

fn opt_eq(value: &str, filter: Option<&str>) -> bool {
    filter.map_or(true, |f| value == f)
}

fn asig_dim<'a>(row: &'a AsignacionRow, dim: Dimension) -> &'a str {
    match dim {
        Dimension::Country => &row.country,
        Dimension::YearMonth => &row.year_month,
        Dimension::AssignmentType => &row.assignment_type,
        Dimension::Status => &row.status,
        // Rejected by parse_group_by for this table
        Dimension::Node => "",
    }
}

fn nodo_dim<'a>(row: &'a NodoRow, dim: Dimension) -> &'a str {
    match dim {
        Dimension::Node => &row.node,
        Dimension::Country => &row.country,
        Dimension::YearMonth => &row.year_month,
        Dimension::Status => &row.status,
        // Rejected by parse_group_by for this table
        Dimension::AssignmentType => "",
    }
}

/// Fold (key, service_count, case_count) entries into one summed row per key.
/// BTreeMap keys keep the rows in deterministic ascending order.
fn group_and_sum(
    entries: Vec<(Vec<String>, u64, u64)>,
    dims: &[Dimension],
) -> Vec<serde_json::Value> {
    let mut groups: BTreeMap<Vec<String>, (u64, u64)> = BTreeMap::new();
    for (key, servicios, expedientes) in entries {
        let slot = groups.entry(key).or_default();
        slot.0 += servicios;
        slot.1 += expedientes;
    }

    groups
        .into_iter()
        .map(|(key, (servicios, expedientes))| {
            let mut obj = serde_json::Map::new();
            for (dim, value) in dims.iter().zip(key) {
                obj.insert(dim.name().to_string(), serde_json::Value::String(value));
            }
            obj.insert("service_count".to_string(), servicios.into());
            obj.insert("case_count".to_string(), expedientes.into());
            serde_json::Value::Object(obj)
        })
        .collect()
}

fn query_asignaciones(
    state: &AppState,
    q: &AsignacionesQuery,
) -> Result<Vec<serde_json::Value>, String> {
    let dims = parse_group_by(q.group_by.as_deref(), ASIG_DIMENSIONS)?;
    let entries = state
        .asignaciones
        .iter()
        .filter(|r| {
            year_month_matches(&r.year_month, q.year.as_deref(), q.month.as_deref())
                && opt_eq(&r.country, q.country.as_deref())
                && opt_eq(&r.assignment_type, q.assignment_type.as_deref())
                && opt_eq(&r.status, q.status.as_deref())
        })
        .map(|r| {
            let key = dims.iter().map(|d| asig_dim(r, *d).to_string()).collect();
            (key, r.service_count, r.case_count)
        })
        .collect();
    Ok(group_and_sum(entries, &dims))
}

fn query_nodos(state: &AppState, q: &NodosQuery) -> Result<Vec<serde_json::Value>, String> {
    let dims = parse_group_by(q.group_by.as_deref(), NODO_DIMENSIONS)?;
    let entries = state
        .nodos
        .iter()
        .filter(|r| {
            year_month_matches(&r.year_month, q.year.as_deref(), q.month.as_deref())
                && opt_eq(&r.country, q.country.as_deref())
                && opt_eq(&r.status, q.status.as_deref())
        })
        .map(|r| {
            let key = dims.iter().map(|d| nodo_dim(r, *d).to_string()).collect();
            (key, r.service_count, r.case_count)
        })
        .collect();
    Ok(group_and_sum(entries, &dims))
}

fn compute_filters(state: &AppState) -> FiltersResponse {
    let mut years = BTreeSet::new();
    let mut months = BTreeSet::new();
    let mut countries = BTreeSet::new();
    let mut assignment_types = BTreeSet::new();
    let mut statuses = BTreeSet::new();
    let mut nodes = BTreeSet::new();

    for row in &state.asignaciones {
        if let Some(year) = row.year_month.get(..4) {
            years.insert(year.to_string());
        }
        months.insert(row.year_month.clone());
        countries.insert(row.country.clone());
        assignment_types.insert(row.assignment_type.clone());
        statuses.insert(row.status.clone());
    }
    for row in &state.nodos {
        nodes.insert(row.node.clone());
    }

    FiltersResponse {
        years: years.into_iter().collect(),
        months: months.into_iter().collect(),
        countries: countries.into_iter().collect(),
        assignment_types: assignment_types.into_iter().collect(),
        statuses: statuses.into_iter().collect(),
        nodes: nodes.into_iter().collect(),
    }
}

fn compute_kpis(state: &AppState, q: &KpisQuery) -> KpisResponse {
    let mut service_total = 0;
    let mut case_total = 0;
    let mut countries = BTreeSet::new();
    for row in state.asignaciones.iter().filter(|r| {
        year_month_matches(&r.year_month, q.year.as_deref(), q.month.as_deref())
            && opt_eq(&r.country, q.country.as_deref())
            && opt_eq(&r.assignment_type, q.assignment_type.as_deref())
            && opt_eq(&r.status, q.status.as_deref())
    }) {
        service_total += row.service_count;
        case_total += row.case_count;
        countries.insert(row.country.as_str());
    }

    // The node table carries no assignment_type, so that filter doesn't apply
    let nodes: BTreeSet<&str> = state
        .nodos
        .iter()
        .filter(|r| {
            year_month_matches(&r.year_month, q.year.as_deref(), q.month.as_deref())
                && opt_eq(&r.country, q.country.as_deref())
                && opt_eq(&r.status, q.status.as_deref())
        })
        .map(|r| r.node.as_str())
        .collect();

    KpisResponse {
        service_total,
        case_total,
        countries: countries.len(),
        nodes: nodes.len(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn filters_handler(State(state): State<Arc<AppState>>) -> Json<FiltersResponse> {
    Json(compute_filters(&state))
}

async fn asignaciones_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AsignacionesQuery>,
) -> impl IntoResponse {
    match query_asignaciones(&state, &params) {
        Ok(rows) => Json(serde_json::json!({ "rows": rows })).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: e })).into_response(),
    }
}

async fn nodos_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NodosQuery>,
) -> impl IntoResponse {
    match query_nodos(&state, &params) {
        Ok(rows) => Json(serde_json::json!({ "rows": rows })).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: e })).into_response(),
    }
}

async fn kpis_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KpisQuery>,
) -> Json<KpisResponse> {
    Json(compute_kpis(&state, &params))
}

// ============================================================================
// Main
// ============================================================================

fn load_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    for result in reader.deserialize() {
        rows.push(result.with_context(|| format!("Failed to parse {}", path.display()))?);
    }
    Ok(rows)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== Asignaciones Dashboard API ===");
    println!("Loading summary tables from {}/", data_dir);

    let asignaciones: Vec<AsignacionRow> =
        load_table(&Path::new(&data_dir).join(ASIGNACIONES_FILE))?;
    let nodos: Vec<NodoRow> = load_table(&Path::new(&data_dir).join(NODOS_FILE))?;
    println!(
        "Loaded {} asignaciones rows, {} nodos rows",
        asignaciones.len(),
        nodos.len()
    );

    let state = Arc::new(AppState { asignaciones, nodos });

    // CORS for the dashboard frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/filters", get(filters_handler))
        .route("/asignaciones", get(asignaciones_handler))
        .route("/nodos", get(nodos_handler))
        .route("/kpis", get(kpis_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /filters");
    println!("  GET /asignaciones?year=&month=&country=&assignment_type=&status=&group_by=");
    println!("  GET /nodos?year=&month=&country=&status=&group_by=");
    println!("  GET /kpis?year=&month=&country=&assignment_type=&status=");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
