//! Generator Service - Aggregates raw Client extracts into dashboard summary tables
//!
//! Responsibilities:
//! - Load the expediente -> nodo lookup table
//! - Stream each country's raw extract (semicolon-delimited, latin-1)
//! - Normalize estado/tipo and bucket rows by year-month
//! - Accumulate two grouped aggregates (asignaciones and nodos) with
//!   service counts and distinct expediente counts
//! - Write both aggregates as sorted CSV tables for the dashboard API
//!
//! CRITICAL: This service must be DETERMINISTIC
//! Same extracts + same lookup = byte-identical output tables
//!
//! Usage:
//!   # All configured sources:
//!   cargo run --bin generator -- --config config/sources.json
//!
//!   # Report only, write nothing:
//!   cargo run --bin generator -- --config config/sources.json --dry-run
//!
//!   # Fail on malformed rows instead of skipping them:
//!   cargo run --bin generator -- --config config/sources.json --strict

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tokio::fs;

#[derive(Parser, Debug)]
#[command(name = "generator", about = "Aggregates Client extracts into summary tables")]
struct Args {
    /// Path to sources config file (extract paths with country labels)
    #[arg(long, default_value = "config/sources.json")]
    config: String,

    /// Path to the expediente->nodo lookup CSV
    #[arg(long, default_value = "data/soa_nodos.csv")]
    lookup: String,

    /// Output directory for the summary tables
    #[arg(long, default_value = "data")]
    out_dir: String,

    /// Fail on malformed rows instead of skipping them
    #[arg(long, default_value = "false")]
    strict: bool,

    /// Dry run - aggregate and report, don't write output files
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

// =============================================================================
// Source Configuration Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct SourcesConfig {
    version: String,
    sources: Vec<SourceEntry>,
}

#[derive(Debug, Deserialize)]
struct SourceEntry {
    /// Path to the raw extract file
    path: String,
    /// Country label applied to every row of this extract
    country: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Load the sources configuration from a JSON file
async fn load_sources_config(path: &str) -> Result<SourcesConfig> {
    let content = fs::read_to_string(path)
        .await
        .context("Failed to read sources config")?;
    let config: SourcesConfig =
        serde_json::from_str(&content).context("Failed to parse sources config")?;
    Ok(config)
}

// =============================================================================
// Domain constants
// =============================================================================

/// Closed estado taxonomy: anything non-empty outside this set becomes OTRO
const KNOWN_ESTADOS: &[&str] = &["CONCLUIDA", "CANCELADA", "PROCESO"];
const ESTADO_SIN_ESTADO: &str = "SIN_ESTADO";
const ESTADO_OTRO: &str = "OTRO";
const TIPO_SIN_TIPO: &str = "SIN_TIPO";

/// Sentinel nodo for expedientes absent from the lookup table
const NODO_SIN_NODO: &str = "Sin Nodo";

/// Required raw-extract columns, resolved by header name (order not fixed)
const COL_EXPEDIENTE: &str = "id_expediente";
const COL_ASISTENCIA: &str = "id_asistencia";
const COL_ESTADO: &str = "estado_asistencia";
const COL_TIPO: &str = "tipo_asignacion";
const COL_CREACION: &str = "creacion_asistencia";

/// Required lookup-file columns
const COL_LOOKUP_EXPEDIENTE: &str = "id_expediente";
const COL_LOOKUP_NODO: &str = "nodo";

const ASIGNACIONES_FILE: &str = "asignaciones_v2.csv";
const NODOS_FILE: &str = "nodos_detalle.csv";

// =============================================================================
// Aggregate types
// =============================================================================

/// How to treat rows that fail field extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowPolicy {
    /// Skip the row and keep going (original behavior)
    Lenient,
    /// Abort the extract with an error naming the line
    Strict,
}

/// Per-key measure: raw service rows plus the distinct expedientes behind them
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Measure {
    servicios: u64,
    expedientes: BTreeSet<String>,
}

/// (country, year_month, assignment_type, status)
type AsignacionKey = (String, String, String, String);
/// (node, country, year_month, status)
type NodoKey = (String, String, String, String);

/// The two aggregate maps, built fresh on every run.
/// BTreeMap keys give deterministic, already-sorted flattening.
#[derive(Debug, Default, PartialEq, Eq)]
struct Aggregates {
    asignaciones: BTreeMap<AsignacionKey, Measure>,
    nodos: BTreeMap<NodoKey, Measure>,
}

/// Per-source row accounting, reported after each extract
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SourceReport {
    processed: usize,
    skipped: usize,
}

// =============================================================================
// Normalization
// =============================================================================

/// Normalize a raw estado value into the closed five-value set.
/// Present-but-empty is SIN_ESTADO and is terminal: it never becomes OTRO.
fn normalize_estado(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ESTADO_SIN_ESTADO.to_string();
    }
    let upper = trimmed.to_uppercase();
    if KNOWN_ESTADOS.contains(&upper.as_str()) {
        upper
    } else {
        ESTADO_OTRO.to_string()
    }
}

/// Normalize a raw tipo_asignacion value: empty becomes SIN_TIPO, everything
/// else is upper-cased as-is (App-vs-Manual grouping happens downstream)
fn normalize_tipo(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        TIPO_SIN_TIPO.to_string()
    } else {
        trimmed.to_uppercase()
    }
}

/// Derive the "YYYY-MM" bucket from a creacion timestamp.
/// Fewer than 7 characters means the row cannot be bucketed and is dropped.
fn derive_mes(fecha: &str) -> Option<&str> {
    if fecha.len() < 7 {
        return None;
    }
    fecha.get(..7)
}

/// Raw Client extracts are exported as latin-1; everything downstream is UTF-8
fn decode_latin1(bytes: &[u8]) -> String {
    let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
    decoded.into_owned()
}

// =============================================================================
// Node-Map Loader
// =============================================================================

/// Build the expediente -> nodo mapping from lookup CSV content
/// (comma-delimited, header row with Id_Expediente and Nodo columns).
/// Entries with an empty id or nodo are skipped; last occurrence wins.
fn load_node_map(content: &str) -> Result<HashMap<String, String>> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers = reader.headers().context("Failed to read lookup headers")?.clone();
    let idx_exp = find_required(&headers, COL_LOOKUP_EXPEDIENTE)?;
    let idx_nodo = find_required(&headers, COL_LOOKUP_NODO)?;

    let mut node_map = HashMap::new();
    for result in reader.records() {
        let record = match result {
            Ok(r) => r,
            Err(_) => continue,
        };
        let exp_id = record.get(idx_exp).unwrap_or("").trim();
        let nodo = record.get(idx_nodo).unwrap_or("").trim();
        if exp_id.is_empty() || nodo.is_empty() {
            continue;
        }
        node_map.insert(exp_id.to_string(), nodo.to_string());
    }

    Ok(node_map)
}

// =============================================================================
// Aggregation Engine
// =============================================================================

/// Resolved positions of the required raw-extract columns
#[derive(Debug)]
struct RawColumns {
    expediente: usize,
    asistencia: usize,
    estado: usize,
    tipo: usize,
    creacion: usize,
}

/// Find a required column by name, case-insensitively
fn find_required(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(name))
        .with_context(|| {
            format!(
                "Missing required column '{}' (found: {})",
                name,
                headers.iter().collect::<Vec<_>>().join(", ")
            )
        })
}

fn resolve_raw_columns(headers: &csv::StringRecord) -> Result<RawColumns> {
    Ok(RawColumns {
        expediente: find_required(headers, COL_EXPEDIENTE)?,
        asistencia: find_required(headers, COL_ASISTENCIA)?,
        estado: find_required(headers, COL_ESTADO)?,
        tipo: find_required(headers, COL_TIPO)?,
        creacion: find_required(headers, COL_CREACION)?,
    })
}

/// Fields pulled out of one raw row; None when the row is too short
struct RawFields<'a> {
    expediente: &'a str,
    estado: &'a str,
    tipo: &'a str,
    creacion: &'a str,
}

fn extract_fields<'a>(record: &'a csv::StringRecord, cols: &RawColumns) -> Option<RawFields<'a>> {
    // id_asistencia is unused beyond existence, but a row missing it is malformed
    record.get(cols.asistencia)?;
    Some(RawFields {
        expediente: record.get(cols.expediente)?,
        estado: record.get(cols.estado)?,
        tipo: record.get(cols.tipo)?,
        creacion: record.get(cols.creacion)?,
    })
}

/// Aggregate one country's extract into the shared maps.
///
/// Each surviving row updates exactly one entry in each map: +1 servicio and
/// the expediente id inserted into the distinct set. Accumulation is
/// commutative per key, so the result is independent of row order.
fn process_extract(
    content: &str,
    country: &str,
    node_map: &HashMap<String, String>,
    agg: &mut Aggregates,
    policy: RowPolicy,
) -> Result<SourceReport> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers = reader.headers().context("Failed to read extract headers")?.clone();
    let cols = resolve_raw_columns(&headers)?;

    let mut report = SourceReport::default();

    for (line_idx, result) in reader.records().enumerate() {
        let line_num = line_idx + 2; // 1-indexed, after the header

        let record = match result {
            Ok(r) => r,
            Err(e) => match policy {
                RowPolicy::Strict => anyhow::bail!("Line {}: {}", line_num, e),
                RowPolicy::Lenient => {
                    report.skipped += 1;
                    continue;
                }
            },
        };

        let fields = match extract_fields(&record, &cols) {
            Some(f) => f,
            None => match policy {
                RowPolicy::Strict => {
                    anyhow::bail!("Line {}: row has fewer fields than the header", line_num)
                }
                RowPolicy::Lenient => {
                    report.skipped += 1;
                    continue;
                }
            },
        };

        // Sole row-level filter: a timestamp too short to yield "YYYY-MM"
        let mes = match derive_mes(fields.creacion) {
            Some(m) => m,
            None => {
                report.skipped += 1;
                continue;
            }
        };

        let estado = normalize_estado(fields.estado);
        let tipo = normalize_tipo(fields.tipo);
        let exp_id = fields.expediente.trim().to_string();
        let nodo = node_map
            .get(&exp_id)
            .map(String::as_str)
            .unwrap_or(NODO_SIN_NODO);

        let asig = agg
            .asignaciones
            .entry((country.to_string(), mes.to_string(), tipo, estado.clone()))
            .or_default();
        asig.servicios += 1;
        asig.expedientes.insert(exp_id.clone());

        let detalle = agg
            .nodos
            .entry((nodo.to_string(), country.to_string(), mes.to_string(), estado))
            .or_default();
        detalle.servicios += 1;
        detalle.expedientes.insert(exp_id);

        report.processed += 1;
    }

    Ok(report)
}

// =============================================================================
// Summary Writer
// =============================================================================

#[derive(Debug, Serialize, PartialEq, Eq)]
struct AsignacionRow {
    country: String,
    year_month: String,
    assignment_type: String,
    status: String,
    service_count: u64,
    case_count: u64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct NodoRow {
    node: String,
    country: String,
    year_month: String,
    status: String,
    service_count: u64,
    case_count: u64,
}

/// Flatten the asignaciones aggregate, replacing each distinct set with its
/// cardinality. BTreeMap iteration already yields the required ascending
/// (country, year_month, assignment_type, status) order.
fn flatten_asignaciones(agg: &Aggregates) -> Vec<AsignacionRow> {
    agg.asignaciones
        .iter()
        .map(|((country, mes, tipo, estado), m)| AsignacionRow {
            country: country.clone(),
            year_month: mes.clone(),
            assignment_type: tipo.clone(),
            status: estado.clone(),
            service_count: m.servicios,
            case_count: m.expedientes.len() as u64,
        })
        .collect()
}

/// Flatten the nodos aggregate in ascending (node, country, year_month,
/// status) order.
fn flatten_nodos(agg: &Aggregates) -> Vec<NodoRow> {
    agg.nodos
        .iter()
        .map(|((nodo, country, mes, estado), m)| NodoRow {
            node: nodo.clone(),
            country: country.clone(),
            year_month: mes.clone(),
            status: estado.clone(),
            service_count: m.servicios,
            case_count: m.expedientes.len() as u64,
        })
        .collect()
}

/// Render a table to CSV bytes. Pure so determinism is byte-testable.
fn render_table<T: Serialize>(rows: &[T]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush CSV output: {}", e.into_error()))?;
    Ok(String::from_utf8(bytes)?)
}

async fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let rendered = render_table(rows)?;
    fs::write(path, rendered)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Service totals per estado, for the run summary
fn servicios_por_estado(rows: &[AsignacionRow]) -> BTreeMap<String, u64> {
    let mut totals: BTreeMap<String, u64> = BTreeMap::new();
    for row in rows {
        *totals.entry(row.status.clone()).or_default() += row.service_count;
    }
    totals
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== Dashboard Data Generator ===");
    println!("Run started: {}", Utc::now().to_rfc3339());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });
    println!(
        "Row policy: {}",
        if args.strict { "strict" } else { "lenient" }
    );

    println!("\n1. Loading sources config: {}", args.config);
    let sources_config = load_sources_config(&args.config).await?;
    println!("Config version: {}", sources_config.version);

    println!("\n2. Loading nodo mapping: {}", args.lookup);
    let node_map = if Path::new(&args.lookup).exists() {
        let content = fs::read_to_string(&args.lookup)
            .await
            .with_context(|| format!("Failed to read lookup file {}", args.lookup))?;
        load_node_map(&content)
            .with_context(|| format!("Failed to parse lookup file {}", args.lookup))?
    } else {
        eprintln!(
            "  WARN: lookup file not found, every expediente maps to '{}'",
            NODO_SIN_NODO
        );
        HashMap::new()
    };
    println!("  Loaded {} expediente->nodo mappings", node_map.len());

    let policy = if args.strict {
        RowPolicy::Strict
    } else {
        RowPolicy::Lenient
    };

    println!("\n3. Processing Client extracts...");
    let mut agg = Aggregates::default();
    let mut total = SourceReport::default();
    let mut skipped_sources = 0;

    for source in sources_config.sources.iter().filter(|s| s.enabled) {
        if !Path::new(&source.path).exists() {
            eprintln!("  SKIP (not found): {} ({})", source.path, source.country);
            skipped_sources += 1;
            continue;
        }

        println!("  Processing {} ({})...", source.country, source.path);
        let bytes = fs::read(&source.path)
            .await
            .with_context(|| format!("Failed to read extract {}", source.path))?;
        let content = decode_latin1(&bytes);

        let report = process_extract(&content, &source.country, &node_map, &mut agg, policy)
            .with_context(|| format!("Failed to parse extract {}", source.path))?;
        println!(
            "    -> {} rows aggregated, {} skipped",
            report.processed, report.skipped
        );
        total.processed += report.processed;
        total.skipped += report.skipped;
    }

    let asignaciones = flatten_asignaciones(&agg);
    let nodos = flatten_nodos(&agg);

    println!("\n=== Aggregation Summary ===");
    println!("Rows aggregated: {}", total.processed);
    println!("Rows skipped: {}", total.skipped);
    println!("Sources skipped: {}", skipped_sources);
    println!("Asignaciones keys: {}", asignaciones.len());
    println!("Nodos keys: {}", nodos.len());
    println!("Servicios by estado:");
    for (estado, servicios) in servicios_por_estado(&asignaciones) {
        println!("  {:<12} {}", estado, servicios);
    }

    if args.dry_run {
        println!("\nDry run - no files written");
        return Ok(());
    }

    println!("\n4. Writing summary tables...");
    fs::create_dir_all(&args.out_dir)
        .await
        .with_context(|| format!("Failed to create output dir {}", args.out_dir))?;

    let asig_path = Path::new(&args.out_dir).join(ASIGNACIONES_FILE);
    write_table(&asig_path, &asignaciones).await?;
    println!("  Written {} rows to {}", asignaciones.len(), asig_path.display());

    let nodos_path = Path::new(&args.out_dir).join(NODOS_FILE);
    write_table(&nodos_path, &nodos).await?;
    println!("  Written {} rows to {}", nodos.len(), nodos_path.display());

    println!("\n=== Generation Complete ===");
    println!("Ready for API queries");

    Ok(())
}

// =============================================================================
// TESTS - Critical for ensuring DETERMINISM
// =============================================================================
