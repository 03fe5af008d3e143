//! Load pipeline: raw rows to normalized batches, dimension resolution,
//! ordered writes against a catalog store, and per-run report directories.

mod normalize;

pub use normalize::{
    clean_name, clean_text, normalize_record, parse_count, parse_date, parse_flag, parse_float,
    parse_price, record_key, title_case, CountError, FieldIssues,
};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int32Array, Int64Array, RecordBatch,
    StringArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use playdex_core::{Application, ApplicationDraft, CategoryGroups, DimensionKind, RawRecord};
use playdex_source::{load_csv, RawDataset};
use playdex_storage::{parse_env_number, CatalogStore, DbConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "playdex-etl";

const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Process-wide settings, read once at start.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DbConfig,
    pub reports_dir: PathBuf,
    pub write_reports: bool,
    pub web_host: String,
    pub web_port: u16,
    pub category_groups: CategoryGroups,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DbConfig::default(),
            reports_dir: PathBuf::from("./reports"),
            write_reports: true,
            web_host: "0.0.0.0".to_string(),
            web_port: 8000,
            category_groups: CategoryGroups::default(),
        }
    }
}

impl Settings {
    /// YAML file named by `PLAYDEX_CONFIG` (if set), then environment overrides.
    pub fn from_env() -> Result<Self> {
        let lookup = |key: &str| std::env::var(key).ok();
        let mut settings = match lookup("PLAYDEX_CONFIG") {
            Some(path) => Self::from_yaml_file(Path::new(&path))?,
            None => Self::default(),
        };
        settings.apply_env(lookup);
        Ok(settings)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("invalid settings document")
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.database.apply_env(&lookup);
        if let Some(dir) = lookup("PLAYDEX_REPORTS_DIR") {
            self.reports_dir = PathBuf::from(dir);
        }
        if let Some(port) = parse_env_number(&lookup, "PLAYDEX_WEB_PORT") {
            self.web_port = port;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeStats {
    pub input_rows: usize,
    pub duplicate_rows: usize,
    pub missing_key_rows: usize,
    pub issues: FieldIssues,
}

/// Output of the pure transform: dimension names in first-seen order plus
/// drafts that still reference them by name.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub categories: Vec<String>,
    pub developers: Vec<String>,
    pub applications: Vec<ApplicationDraft>,
    pub stats: NormalizeStats,
}

pub fn normalize(records: &[RawRecord]) -> NormalizedBatch {
    let mut stats = NormalizeStats {
        input_rows: records.len(),
        ..Default::default()
    };
    let mut seen: HashSet<&RawRecord> = HashSet::with_capacity(records.len());
    let mut applications = Vec::with_capacity(records.len());

    for raw in records {
        if !seen.insert(raw) {
            stats.duplicate_rows += 1;
            continue;
        }
        match normalize_record(raw, &mut stats.issues) {
            Some(draft) => applications.push(draft),
            None => stats.missing_key_rows += 1,
        }
    }

    let categories = distinct_names(applications.iter().filter_map(|a| a.category.as_deref()));
    let developers = distinct_names(applications.iter().filter_map(|a| a.developer.as_deref()));

    NormalizedBatch {
        categories,
        developers,
        applications,
        stats,
    }
}

fn distinct_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .filter(|name| seen.insert(*name))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedBatch {
    pub applications: Vec<Application>,
    /// Keys of drafts dropped because a dimension name had no id.
    pub unresolved: Vec<String>,
}

/// Exact-name lookup of each draft's category and developer.
pub fn resolve(
    drafts: Vec<ApplicationDraft>,
    category_ids: &HashMap<String, i32>,
    developer_ids: &HashMap<String, i32>,
) -> ResolvedBatch {
    let mut batch = ResolvedBatch::default();
    for draft in drafts {
        let category_id = draft
            .category
            .as_deref()
            .and_then(|name| category_ids.get(name))
            .copied();
        let developer_id = draft
            .developer
            .as_deref()
            .and_then(|name| developer_ids.get(name))
            .copied();
        match (category_id, developer_id) {
            (Some(category_id), Some(developer_id)) => batch
                .applications
                .push(Application::from_draft(draft, category_id, developer_id)),
            _ => {
                debug!(
                    app_id = %draft.app_id,
                    category = ?draft.category,
                    developer = ?draft.developer,
                    "dropping record with unresolved reference"
                );
                batch.unresolved.push(draft.app_id);
            }
        }
    }
    batch
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: Option<String>,
    pub dry_run: bool,
    pub input_rows: usize,
    pub duplicate_rows: usize,
    pub missing_key_rows: usize,
    pub unresolved_rows: usize,
    pub categories_seen: usize,
    pub categories_inserted: u64,
    pub developers_seen: usize,
    pub developers_inserted: u64,
    pub applications_emitted: usize,
    pub applications_inserted: u64,
    pub applications_existing: u64,
    pub unparseable_fields: BTreeMap<String, usize>,
    pub oversized_fields: BTreeMap<String, usize>,
    pub reports_dir: Option<String>,
    pub parquet_manifest: Option<String>,
}

/// Summary plus the batches that were written, for snapshotting.
#[derive(Debug, Clone)]
pub struct LoadRun {
    pub summary: LoadSummary,
    pub categories: Vec<String>,
    pub developers: Vec<String>,
    pub applications: Vec<Application>,
}

/// Normalizes `records` and writes categories, developers, then applications.
///
/// Each batch is committed on its own. A failing batch aborts the run and
/// leaves earlier batches in place; every write is insert-if-absent so a
/// rerun converges to the same state.
pub async fn run_load(store: &dyn CatalogStore, records: &[RawRecord]) -> Result<LoadRun> {
    let run_id = Uuid::new_v4();
    load(store, records, run_id)
        .instrument(info_span!("load_run", %run_id))
        .await
}

async fn load(store: &dyn CatalogStore, records: &[RawRecord], run_id: Uuid) -> Result<LoadRun> {
    let started_at = Utc::now();
    let batch = normalize(records);
    let stats = batch.stats;
    info!(
        input_rows = stats.input_rows,
        duplicate_rows = stats.duplicate_rows,
        missing_key_rows = stats.missing_key_rows,
        drafts = batch.applications.len(),
        coerced_fields = stats.issues.total(),
        "normalized dataset"
    );

    let categories_inserted =
        write_dimensions(store, DimensionKind::Category, &batch.categories).await?;
    let developers_inserted =
        write_dimensions(store, DimensionKind::Developer, &batch.developers).await?;

    let category_ids = store
        .dimension_ids(DimensionKind::Category)
        .await
        .context("reading category ids")?;
    let developer_ids = store
        .dimension_ids(DimensionKind::Developer)
        .await
        .context("reading developer ids")?;

    let resolved = resolve(batch.applications, &category_ids, &developer_ids);
    if !resolved.unresolved.is_empty() {
        warn!(
            unresolved_rows = resolved.unresolved.len(),
            "dropped records whose category or developer could not be resolved"
        );
    }

    let applications_inserted = store
        .insert_applications(&resolved.applications)
        .instrument(info_span!(
            "write_batch",
            table = "apps",
            rows = resolved.applications.len()
        ))
        .await
        .context("writing application batch")?;

    let emitted = resolved.applications.len();
    let summary = LoadSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        source: None,
        dry_run: false,
        input_rows: stats.input_rows,
        duplicate_rows: stats.duplicate_rows,
        missing_key_rows: stats.missing_key_rows,
        unresolved_rows: resolved.unresolved.len(),
        categories_seen: batch.categories.len(),
        categories_inserted,
        developers_seen: batch.developers.len(),
        developers_inserted,
        applications_emitted: emitted,
        applications_inserted,
        applications_existing: (emitted as u64).saturating_sub(applications_inserted),
        unparseable_fields: owned_counts(&stats.issues.unparseable),
        oversized_fields: owned_counts(&stats.issues.oversized),
        reports_dir: None,
        parquet_manifest: None,
    };
    info!(
        applications_inserted,
        applications_existing = summary.applications_existing,
        categories_inserted,
        developers_inserted,
        "load complete"
    );

    Ok(LoadRun {
        summary,
        categories: batch.categories,
        developers: batch.developers,
        applications: resolved.applications,
    })
}

async fn write_dimensions(
    store: &dyn CatalogStore,
    kind: DimensionKind,
    names: &[String],
) -> Result<u64> {
    store
        .insert_dimension_names(kind, names)
        .instrument(info_span!("write_batch", table = kind.table(), rows = names.len()))
        .await
        .with_context(|| format!("writing {} batch", kind.table()))
}

fn owned_counts(counts: &BTreeMap<&'static str, usize>) -> BTreeMap<String, usize> {
    counts.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// Reads a dataset, loads it into `store`, and optionally writes the run report.
pub struct LoadPipeline {
    settings: Settings,
    store: Arc<dyn CatalogStore>,
    dry_run: bool,
}

impl LoadPipeline {
    pub fn new(settings: Settings, store: Arc<dyn CatalogStore>) -> Self {
        Self {
            settings,
            store,
            dry_run: false,
        }
    }

    /// Marks the summary as a dry run; the caller supplies a throwaway store.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run_file(&self, path: &Path) -> Result<LoadSummary> {
        let dataset = load_csv(path).with_context(|| format!("loading {}", path.display()))?;
        self.run_dataset(dataset).await
    }

    pub async fn run_dataset(&self, dataset: RawDataset) -> Result<LoadSummary> {
        let mut run = run_load(self.store.as_ref(), &dataset.records).await?;
        run.summary.source = Some(dataset.label);
        run.summary.dry_run = self.dry_run;
        if self.settings.write_reports {
            write_run_report(&self.settings.reports_dir, &mut run).await?;
        }
        Ok(run.summary)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Writes `<reports_root>/<run_id>/` with the summary, a markdown brief and the
/// Parquet snapshot, and records both paths on the summary.
pub async fn write_run_report(reports_root: &Path, run: &mut LoadRun) -> Result<PathBuf> {
    let run_dir = reports_root.join(run.summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let manifest_path = export_parquet_snapshot(&run_dir, run).await?;
    run.summary.reports_dir = Some(run_dir.display().to_string());
    run.summary.parquet_manifest = Some(manifest_path.display().to_string());

    let summary_json =
        serde_json::to_vec_pretty(&run.summary).context("serializing load summary")?;
    fs::write(run_dir.join("load_summary.json"), summary_json)
        .await
        .context("writing load_summary.json")?;
    fs::write(run_dir.join("load_brief.md"), load_brief(&run.summary))
        .await
        .context("writing load_brief.md")?;

    info!(reports_dir = %run_dir.display(), "run report written");
    Ok(run_dir)
}

fn load_brief(summary: &LoadSummary) -> String {
    let mut lines = vec![
        "# Playdex Load Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Source: {}", summary.source.as_deref().unwrap_or("unknown")),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
    ];
    if summary.dry_run {
        lines.push("- Dry run: nothing was written to the database".to_string());
    }
    lines.extend([
        String::new(),
        "## Rows".to_string(),
        format!("- input: {}", summary.input_rows),
        format!("- exact duplicates: {}", summary.duplicate_rows),
        format!("- missing app id: {}", summary.missing_key_rows),
        format!("- unresolved references: {}", summary.unresolved_rows),
        format!(
            "- applications: {} emitted, {} inserted, {} already present",
            summary.applications_emitted,
            summary.applications_inserted,
            summary.applications_existing
        ),
        format!(
            "- categories: {} seen, {} inserted",
            summary.categories_seen, summary.categories_inserted
        ),
        format!(
            "- developers: {} seen, {} inserted",
            summary.developers_seen, summary.developers_inserted
        ),
    ]);
    if !summary.unparseable_fields.is_empty() || !summary.oversized_fields.is_empty() {
        lines.push(String::new());
        lines.push("## Values set to null".to_string());
        for (column, n) in &summary.unparseable_fields {
            lines.push(format!("- {column}: {n} unparseable"));
        }
        for (column, n) in &summary.oversized_fields {
            lines.push(format!("- {column}: {n} out of BIGINT range"));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

async fn export_parquet_snapshot(run_dir: &Path, run: &LoadRun) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let applications_path = snapshot_dir.join("applications.parquet");
    let dimensions_path = snapshot_dir.join("dimensions.parquet");
    write_applications_parquet(&applications_path, &run.applications)?;
    write_dimensions_parquet(&dimensions_path, &run.categories, &run.developers)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id: run.summary.run_id,
        files: vec![
            manifest_entry("applications", run_dir, &applications_path, run.applications.len())?,
            manifest_entry(
                "dimensions",
                run_dir,
                &dimensions_path,
                run.categories.len() + run.developers.len(),
            )?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn date32(date: Option<NaiveDate>) -> Option<i32> {
    date.map(|d| d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
}

fn write_applications_parquet(path: &Path, apps: &[Application]) -> Result<()> {
    let text = |f: fn(&Application) -> Option<&str>| -> ArrayRef {
        Arc::new(StringArray::from(apps.iter().map(f).collect::<Vec<_>>()))
    };
    let int64 = |f: fn(&Application) -> Option<i64>| -> ArrayRef {
        Arc::new(Int64Array::from(apps.iter().map(f).collect::<Vec<_>>()))
    };
    let float64 = |f: fn(&Application) -> Option<f64>| -> ArrayRef {
        Arc::new(Float64Array::from(apps.iter().map(f).collect::<Vec<_>>()))
    };
    let flag = |f: fn(&Application) -> bool| -> ArrayRef {
        Arc::new(BooleanArray::from(apps.iter().map(f).collect::<Vec<_>>()))
    };
    let date = |f: fn(&Application) -> Option<NaiveDate>| -> ArrayRef {
        Arc::new(Date32Array::from(
            apps.iter().map(|a| date32(f(a))).collect::<Vec<_>>(),
        ))
    };

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("app_id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, true),
        ArrowField::new("category_id", DataType::Int32, false),
        ArrowField::new("developer_id", DataType::Int32, false),
        ArrowField::new("rating", DataType::Float64, true),
        ArrowField::new("rating_count", DataType::Int64, true),
        ArrowField::new("installs", DataType::Int64, true),
        ArrowField::new("min_installs", DataType::Int64, true),
        ArrowField::new("max_installs", DataType::Int64, true),
        ArrowField::new("free", DataType::Boolean, false),
        ArrowField::new("price", DataType::Float64, true),
        ArrowField::new("currency", DataType::Utf8, true),
        ArrowField::new("size", DataType::Utf8, true),
        ArrowField::new("min_os_version", DataType::Utf8, true),
        ArrowField::new("released", DataType::Date32, true),
        ArrowField::new("last_updated", DataType::Date32, true),
        ArrowField::new("content_rating", DataType::Utf8, true),
        ArrowField::new("privacy_policy_url", DataType::Utf8, true),
        ArrowField::new("ad_supported", DataType::Boolean, false),
        ArrowField::new("has_in_app_purchases", DataType::Boolean, false),
        ArrowField::new("is_editors_choice", DataType::Boolean, false),
        ArrowField::new("scraped_at", DataType::Utf8, true),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            apps.iter().map(|a| Some(a.app_id.as_str())).collect::<Vec<_>>(),
        )),
        text(|a| a.name.as_deref()),
        Arc::new(Int32Array::from(
            apps.iter().map(|a| a.category_id).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            apps.iter().map(|a| a.developer_id).collect::<Vec<_>>(),
        )),
        float64(|a| a.attributes.rating),
        int64(|a| a.attributes.rating_count),
        int64(|a| a.attributes.installs),
        int64(|a| a.attributes.min_installs),
        int64(|a| a.attributes.max_installs),
        flag(|a| a.attributes.free),
        float64(|a| a.attributes.price),
        text(|a| a.attributes.currency.as_deref()),
        text(|a| a.attributes.size.as_deref()),
        text(|a| a.attributes.min_os_version.as_deref()),
        date(|a| a.attributes.released),
        date(|a| a.attributes.last_updated),
        text(|a| a.attributes.content_rating.as_deref()),
        text(|a| a.attributes.privacy_policy_url.as_deref()),
        flag(|a| a.attributes.ad_supported),
        flag(|a| a.attributes.has_in_app_purchases),
        flag(|a| a.attributes.is_editors_choice),
        text(|a| a.attributes.scraped_at.as_deref()),
    ];

    let batch =
        RecordBatch::try_new(schema, columns).context("building applications record batch")?;
    write_parquet(path, batch)
}

fn write_dimensions_parquet(path: &Path, categories: &[String], developers: &[String]) -> Result<()> {
    let rows = categories
        .iter()
        .map(|name| (DimensionKind::Category.label(), name.as_str()))
        .chain(
            developers
                .iter()
                .map(|name| (DimensionKind::Developer.label(), name.as_str())),
        )
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
    ]));
    let kinds = StringArray::from(rows.iter().map(|(k, _)| Some(*k)).collect::<Vec<_>>());
    let names = StringArray::from(rows.iter().map(|(_, n)| Some(*n)).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(schema, vec![Arc::new(kinds), Arc::new(names)])
        .context("building dimensions record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

/// Markdown listing of the `runs` most recent load reports under `reports_root`.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut lines = vec!["# Playdex Load Runs".to_string(), String::new()];
    if !reports_root.exists() {
        lines.push(format!("No runs recorded under `{}`.", reports_root.display()));
        return Ok(lines.join("\n"));
    }

    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
    {
        let summary_path = entry.path().join("load_summary.json");
        if !summary_path.exists() {
            continue;
        }
        let summary: LoadSummary = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        summaries.push((entry.path(), summary));
    }
    summaries.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));

    for (dir, summary) in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- source: {}",
            summary.source.as_deref().unwrap_or("unknown")
        ));
        lines.push(format!(
            "- applications: {} emitted, {} inserted",
            summary.applications_emitted, summary.applications_inserted
        ));
        lines.push(format!(
            "- dropped: {} duplicate, {} missing key, {} unresolved",
            summary.duplicate_rows, summary.missing_key_rows, summary.unresolved_rows
        ));
        if summary.dry_run {
            lines.push("- dry run".to_string());
        }
        let brief_path = dir.join("load_brief.md");
        if brief_path.exists() {
            lines.push(format!("- brief: `{}`", brief_path.display()));
        }
        if let Some(manifest) = &summary.parquet_manifest {
            lines.push(format!("- parquet manifest: `{manifest}`"));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
