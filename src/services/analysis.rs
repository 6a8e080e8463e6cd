//! Dataset analysis run by the consumers.
//!
//! For each population snapshot referenced by a message this computes:
//! - population mean and sample standard deviation over 2013-2018,
//! - for every BLS series, the year with the largest summed value,
//! - the `PRS30006032` / `Q01` rows joined with that year's population.
//!
//! The report depends only on its inputs and is written to a key outside the
//! watched prefix, so re-running a message just adds an identical version.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::message::Message;
use crate::services::consumer::{MessageHandler, ProcessingError};
use crate::services::storage_service::{StorageError, StorageService};

pub const POPULATION_YEARS: std::ops::RangeInclusive<i32> = 2013..=2018;
pub const REPORT_SERIES: &str = "PRS30006032";
pub const REPORT_PERIOD: &str = "Q01";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("population data is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("population data has unexpected shape: {0}")]
    Shape(String),
    #[error("BLS data is not UTF-8")]
    BlsEncoding,
    #[error("BLS data is missing column `{0}`")]
    BlsColumn(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PopulationRecord {
    pub year: i32,
    pub population: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlsRecord {
    pub series_id: String,
    pub year: i32,
    pub period: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopulationStats {
    pub mean: f64,
    /// Sample standard deviation; `None` with fewer than two years.
    pub std_dev: Option<f64>,
    pub years: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestYear {
    pub year: i32,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedRow {
    pub series_id: String,
    pub year: i32,
    pub period: String,
    pub value: f64,
    pub population: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub source_key: String,
    pub source_version: i64,
    pub bls_version: Option<i64>,
    pub population_stats: Option<PopulationStats>,
    pub best_years: BTreeMap<String, BestYear>,
    pub combined_report: Vec<CombinedRow>,
}

/// Parse population JSON: either an array of `{year, population}` records
/// or an object with a `data` array (`Year`/`Population` keys). Years may be
/// numbers or strings.
pub fn parse_population(bytes: &[u8]) -> Result<Vec<PopulationRecord>, AnalysisError> {
    let root: Value = serde_json::from_slice(bytes)?;
    let rows = match &root {
        Value::Array(rows) => rows,
        Value::Object(map) => match map.get("data") {
            Some(Value::Array(rows)) => rows,
            _ => return Err(AnalysisError::Shape("object without a `data` array".into())),
        },
        _ => return Err(AnalysisError::Shape("expected an array or object".into())),
    };

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let year = field(row, "year")
                .and_then(as_f64)
                .ok_or_else(|| AnalysisError::Shape(format!("row {} has no year", i)))?;
            let population = field(row, "population")
                .and_then(as_f64)
                .ok_or_else(|| AnalysisError::Shape(format!("row {} has no population", i)))?;
            Ok(PopulationRecord {
                year: year as i32,
                population,
            })
        })
        .collect()
}

fn field<'a>(row: &'a Value, name: &str) -> Option<&'a Value> {
    row.as_object()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse the tab-separated BLS time series file. Header and cell padding is
/// trimmed; rows with unparsable year or value are skipped.
pub fn parse_bls(bytes: &[u8]) -> Result<Vec<BlsRecord>, AnalysisError> {
    let text = std::str::from_utf8(bytes).map_err(|_| AnalysisError::BlsEncoding)?;
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let header: Vec<&str> = lines
        .next()
        .map(|line| line.split('\t').map(str::trim).collect())
        .unwrap_or_default();
    let column = |name: &'static str| {
        header
            .iter()
            .position(|h| *h == name)
            .ok_or(AnalysisError::BlsColumn(name))
    };
    let (series_col, year_col, period_col, value_col) = (
        column("series_id")?,
        column("year")?,
        column("period")?,
        column("value")?,
    );

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for line in lines {
        let cells: Vec<&str> = line.split('\t').map(str::trim).collect();
        let parsed = (|| {
            Some(BlsRecord {
                series_id: cells.get(series_col)?.to_string(),
                year: cells.get(year_col)?.parse().ok()?,
                period: cells.get(period_col)?.to_string(),
                value: cells.get(value_col)?.parse().ok()?,
            })
        })();
        match parsed {
            Some(record) => records.push(record),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(skipped, "skipped malformed BLS rows");
    }
    Ok(records)
}

pub fn population_stats(records: &[PopulationRecord]) -> Option<PopulationStats> {
    let selected: Vec<&PopulationRecord> = records
        .iter()
        .filter(|r| POPULATION_YEARS.contains(&r.year))
        .collect();
    if selected.is_empty() {
        return None;
    }
    let n = selected.len() as f64;
    let mean = selected.iter().map(|r| r.population).sum::<f64>() / n;
    let std_dev = (selected.len() > 1).then(|| {
        let variance = selected
            .iter()
            .map(|r| (r.population - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0);
        variance.sqrt()
    });
    let mut years: Vec<i32> = selected.iter().map(|r| r.year).collect();
    years.sort_unstable();
    Some(PopulationStats {
        mean,
        std_dev,
        years,
    })
}

/// Per series, the year whose values sum highest. Ties go to the earlier year.
pub fn best_years(records: &[BlsRecord]) -> BTreeMap<String, BestYear> {
    let mut sums: BTreeMap<(&str, i32), f64> = BTreeMap::new();
    for record in records {
        *sums.entry((record.series_id.as_str(), record.year)).or_default() += record.value;
    }

    let mut best: BTreeMap<String, BestYear> = BTreeMap::new();
    for ((series, year), value) in sums {
        match best.get(series) {
            Some(current) if current.value >= value => {}
            _ => {
                best.insert(series.to_string(), BestYear { year, value });
            }
        }
    }
    best
}

pub fn combined_report(bls: &[BlsRecord], population: &[PopulationRecord]) -> Vec<CombinedRow> {
    let by_year: HashMap<i32, f64> = population.iter().map(|r| (r.year, r.population)).collect();
    bls.iter()
        .filter(|r| r.series_id == REPORT_SERIES && r.period == REPORT_PERIOD)
        .map(|r| CombinedRow {
            series_id: r.series_id.clone(),
            year: r.year,
            period: r.period.clone(),
            value: r.value,
            population: by_year.get(&r.year).copied(),
        })
        .collect()
}

/// The report key for a population object: the key with `watched_prefix`
/// and any `.json` suffix removed, placed under `report_prefix` with an
/// `.analysis.json` suffix. Nested paths below the watched prefix are kept so
/// distinct sources never share a report.
pub fn report_key(report_prefix: &str, watched_prefix: &str, source_key: &str) -> String {
    let relative = source_key.strip_prefix(watched_prefix).unwrap_or(source_key);
    let stem = relative.strip_suffix(".json").unwrap_or(relative);
    format!("{}{}.analysis.json", report_prefix, stem)
}

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub bucket: String,
    pub bls_key: String,
    pub watched_prefix: String,
    pub report_prefix: String,
}

/// Message handler that analyses the referenced population snapshot.
pub struct AnalysisHandler {
    storage: StorageService,
    config: AnalysisConfig,
}

impl AnalysisHandler {
    pub fn new(storage: StorageService, config: AnalysisConfig) -> Self {
        Self { storage, config }
    }

    pub async fn analyze(&self, key: &str) -> Result<AnalysisReport, ProcessingError> {
        let (source, population_bytes) = self
            .storage
            .get_object(&self.config.bucket, key)
            .await
            .map_err(|err| ProcessingError::ObjectUnavailable(key.to_string(), err.to_string()))?;
        let population = parse_population(&population_bytes).map_err(analysis_failed)?;

        let (bls_version, bls) = match self
            .storage
            .get_object(&self.config.bucket, &self.config.bls_key)
            .await
        {
            Ok((object, bytes)) => (
                Some(object.version),
                parse_bls(&bytes).map_err(analysis_failed)?,
            ),
            Err(StorageError::ObjectNotFound { .. }) => {
                warn!(bls_key = %self.config.bls_key, "no BLS data yet, population-only report");
                (None, Vec::new())
            }
            Err(err) => {
                return Err(ProcessingError::ObjectUnavailable(
                    self.config.bls_key.clone(),
                    err.to_string(),
                ));
            }
        };

        Ok(AnalysisReport {
            source_key: source.key,
            source_version: source.version,
            bls_version,
            population_stats: population_stats(&population),
            best_years: best_years(&bls),
            combined_report: combined_report(&bls, &population),
        })
    }
}

fn analysis_failed(err: AnalysisError) -> ProcessingError {
    ProcessingError::Analysis(err.to_string())
}

#[async_trait]
impl MessageHandler for AnalysisHandler {
    async fn handle(&self, message: &Message) -> Result<(), ProcessingError> {
        let report = self.analyze(&message.payload).await?;
        let body = serde_json::to_vec_pretty(&report)
            .map_err(|err| ProcessingError::Analysis(err.to_string()))?;
        let key = report_key(
            &self.config.report_prefix,
            &self.config.watched_prefix,
            &message.payload,
        );

        let stored = self
            .storage
            .put_object(
                &self.config.bucket,
                &key,
                Some("application/json".into()),
                Bytes::from(body),
            )
            .await
            .map_err(|err| ProcessingError::Analysis(format!("writing report: {}", err)))?;

        info!(
            message_id = %message.id,
            report_key = %stored.key,
            report_version = stored.version,
            series = report.best_years.len(),
            "analysis report written"
        );
        Ok(())
    }
}
