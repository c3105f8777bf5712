// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hive-partitioned parquet lake for backfilled history.
//!
//! Layout: `{base_dir}/{source}/{subject}/{kind}/{granularity}/YYYY-MM-DD.parquet`,
//! one file per day, rows sorted by `ts_event` and deduplicated on merge.
//! The live tape is never touched from here.

use arrow::array::{Array, ArrayRef, Float64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crunchcoord_core::entities::FeedRecord;
use crunchcoord_core::{CoordError, CoordResult};

const STANDARD_VALUE_COLUMNS: [&str; 5] = ["open", "high", "low", "close", "volume"];

fn lake_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new(
            "ts_event",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new("source", DataType::Utf8, false),
        Field::new("subject", DataType::Utf8, false),
        Field::new("kind", DataType::Utf8, false),
        Field::new("granularity", DataType::Utf8, false),
        Field::new("open", DataType::Float64, true),
        Field::new("high", DataType::Float64, true),
        Field::new("low", DataType::Float64, true),
        Field::new("close", DataType::Float64, true),
        Field::new("volume", DataType::Float64, true),
        Field::new("meta", DataType::Utf8, false),
    ]))
}

/// One flattened lake row.
#[derive(Debug, Clone)]
struct LakeRow {
    ts_event_us: i64,
    source: String,
    subject: String,
    kind: String,
    granularity: String,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<f64>,
    meta: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LakeFileEntry {
    pub path: String,
    pub records: u64,
    pub size_bytes: u64,
    pub date: String,
}

#[derive(Clone)]
pub struct ParquetSink {
    base_dir: PathBuf,
}

impl ParquetSink {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Write records grouped into daily files, merging with any existing
    /// file and deduplicating by `ts_event` (latest write wins).
    pub fn append_records(&self, records: &[FeedRecord]) -> CoordResult<u64> {
        let mut grouped: BTreeMap<PathBuf, Vec<LakeRow>> = BTreeMap::new();
        for record in records {
            let date = record.ts_event.format("%Y-%m-%d").to_string();
            let path = self
                .base_dir
                .join(&record.scope.source)
                .join(&record.scope.subject)
                .join(&record.scope.kind)
                .join(&record.scope.granularity)
                .join(format!("{date}.parquet"));
            grouped.entry(path).or_default().push(to_lake_row(record));
        }

        let mut written = 0u64;
        for (path, rows) in grouped {
            written += rows.len() as u64;
            self.write_or_merge(&path, rows)?;
        }
        Ok(written)
    }

    fn write_or_merge(&self, path: &Path, new_rows: Vec<LakeRow>) -> CoordResult<()> {
        let mut merged: BTreeMap<i64, LakeRow> = BTreeMap::new();
        if path.exists() {
            match read_lake_file(path) {
                Ok(existing) => {
                    for row in existing {
                        merged.insert(row.ts_event_us, row);
                    }
                }
                Err(err) => {
                    tracing::warn!(path=%path.display(), error=%err, "unreadable parquet file, overwriting");
                }
            }
        }
        for row in new_rows {
            merged.insert(row.ts_event_us, row);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoordError::Internal(format!("mkdir failed: {e}")))?;
        }

        let rows: Vec<LakeRow> = merged.into_values().collect();
        let batch = rows_to_batch(&rows)?;
        let file = File::create(path)
            .map_err(|e| CoordError::Internal(format!("create {} failed: {e}", path.display())))?;
        let props = WriterProperties::builder().build();
        let mut writer = ArrowWriter::try_new(file, lake_schema(), Some(props))
            .map_err(|e| CoordError::Internal(format!("parquet writer: {e}")))?;
        writer
            .write(&batch)
            .map_err(|e| CoordError::Internal(format!("parquet write: {e}")))?;
        writer
            .close()
            .map_err(|e| CoordError::Internal(format!("parquet close: {e}")))?;
        Ok(())
    }

    /// Manifest of every lake file, lexicographic path order.
    pub fn list_files(&self) -> Vec<LakeFileEntry> {
        let mut manifest = Vec::new();
        let mut stack = vec![self.base_dir.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                    continue;
                }
                let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
                let records = read_lake_file(&path)
                    .map(|rows| rows.len() as u64)
                    .unwrap_or(0);
                let rel_path = path
                    .strip_prefix(&self.base_dir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                let date = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                manifest.push(LakeFileEntry {
                    path: rel_path,
                    records,
                    size_bytes,
                    date,
                });
            }
        }
        manifest.sort_by(|a, b| a.path.cmp(&b.path));
        manifest
    }

    /// Absolute path for a manifest entry, confined to the lake directory.
    pub fn resolve_file(&self, rel_path: &str) -> Option<PathBuf> {
        if rel_path.contains("..") {
            return None;
        }
        let full = self.base_dir.join(rel_path);
        if full.exists() && full.extension().and_then(|e| e.to_str()) == Some("parquet") {
            Some(full)
        } else {
            None
        }
    }
}

fn to_lake_row(record: &FeedRecord) -> LakeRow {
    let numeric = |key: &str| record.values.get(key).and_then(Value::as_f64);
    let mut extra: serde_json::Map<String, Value> = record
        .values
        .iter()
        .filter(|(k, _)| !STANDARD_VALUE_COLUMNS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !record.meta.is_empty() {
        extra.insert(
            "_record_meta".to_string(),
            Value::Object(record.meta.clone()),
        );
    }

    LakeRow {
        ts_event_us: record.ts_event.timestamp_micros(),
        source: record.scope.source.clone(),
        subject: record.scope.subject.clone(),
        kind: record.scope.kind.clone(),
        granularity: record.scope.granularity.clone(),
        open: numeric("open"),
        high: numeric("high"),
        low: numeric("low"),
        close: numeric("close"),
        volume: numeric("volume"),
        meta: Value::Object(extra).to_string(),
    }
}

fn rows_to_batch(rows: &[LakeRow]) -> CoordResult<RecordBatch> {
    let ts: TimestampMicrosecondArray = rows
        .iter()
        .map(|r| Some(r.ts_event_us))
        .collect::<TimestampMicrosecondArray>()
        .with_timezone("UTC");
    let columns: Vec<ArrayRef> = vec![
        Arc::new(ts),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.source.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.subject.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.kind.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| r.granularity.as_str())
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.open).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.high).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.low).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.close).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.volume).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.meta.as_str()).collect::<Vec<_>>(),
        )),
    ];
    RecordBatch::try_new(lake_schema(), columns)
        .map_err(|e| CoordError::Internal(format!("record batch: {e}")))
}

fn read_lake_file(path: &Path) -> CoordResult<Vec<LakeRow>> {
    let file = File::open(path)
        .map_err(|e| CoordError::Internal(format!("open {} failed: {e}", path.display())))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| CoordError::Internal(format!("parquet reader: {e}")))?
        .build()
        .map_err(|e| CoordError::Internal(format!("parquet reader: {e}")))?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| CoordError::Internal(format!("parquet batch: {e}")))?;
        let ts = column::<TimestampMicrosecondArray>(&batch, 0)?;
        let source = column::<StringArray>(&batch, 1)?;
        let subject = column::<StringArray>(&batch, 2)?;
        let kind = column::<StringArray>(&batch, 3)?;
        let granularity = column::<StringArray>(&batch, 4)?;
        let open = column::<Float64Array>(&batch, 5)?;
        let high = column::<Float64Array>(&batch, 6)?;
        let low = column::<Float64Array>(&batch, 7)?;
        let close = column::<Float64Array>(&batch, 8)?;
        let volume = column::<Float64Array>(&batch, 9)?;
        let meta = column::<StringArray>(&batch, 10)?;

        for i in 0..batch.num_rows() {
            let opt = |array: &Float64Array, i: usize| {
                if array.is_null(i) {
                    None
                } else {
                    Some(array.value(i))
                }
            };
            rows.push(LakeRow {
                ts_event_us: ts.value(i),
                source: source.value(i).to_string(),
                subject: subject.value(i).to_string(),
                kind: kind.value(i).to_string(),
                granularity: granularity.value(i).to_string(),
                open: opt(open, i),
                high: opt(high, i),
                low: opt(low, i),
                close: opt(close, i),
                volume: opt(volume, i),
                meta: meta.value(i).to_string(),
            });
        }
    }
    Ok(rows)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, index: usize) -> CoordResult<&'a T> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| CoordError::Internal(format!("unexpected column type at index {index}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use crunchcoord_core::entities::FeedScope;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(minute: u32, close: f64) -> FeedRecord {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap();
        let scope = FeedScope::new("binance", "BTC", "candle", "1m");
        let mut values = serde_json::Map::new();
        values.insert("open".to_string(), json!(close - 1.0));
        values.insert("high".to_string(), json!(close + 1.0));
        values.insert("low".to_string(), json!(close - 2.0));
        values.insert("close".to_string(), json!(close));
        values.insert("volume".to_string(), json!(3.0));
        values.insert("trades".to_string(), json!(42));
        FeedRecord {
            id: crate::ids::feed_record_id(&scope, ts),
            scope,
            ts_event: ts,
            ts_ingested: ts,
            values,
            meta: serde_json::Map::new(),
        }
    }

    #[test]
    fn writes_hive_partitioned_daily_files() {
        let dir = TempDir::new().unwrap();
        let sink = ParquetSink::new(dir.path());

        let written = sink
            .append_records(&[record(0, 100.0), record(1, 101.0)])
            .unwrap();
        assert_eq!(written, 2);

        let expected = dir
            .path()
            .join("binance/BTC/candle/1m/2026-03-01.parquet");
        assert!(expected.exists());

        let manifest = sink.list_files();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].records, 2);
        assert_eq!(manifest[0].date, "2026-03-01");
        assert_eq!(manifest[0].path, "binance/BTC/candle/1m/2026-03-01.parquet");
    }

    #[test]
    fn merge_deduplicates_by_ts_event() {
        let dir = TempDir::new().unwrap();
        let sink = ParquetSink::new(dir.path());

        sink.append_records(&[record(0, 100.0), record(1, 101.0)])
            .unwrap();
        // Overlapping rewrite: minute 1 again plus a new minute 2.
        sink.append_records(&[record(1, 111.0), record(2, 102.0)])
            .unwrap();

        let path = sink
            .resolve_file("binance/BTC/candle/1m/2026-03-01.parquet")
            .unwrap();
        let rows = read_lake_file(&path).unwrap();
        assert_eq!(rows.len(), 3);
        // Sorted by ts_event and latest write wins on the duplicate.
        assert!(rows.windows(2).all(|w| w[0].ts_event_us < w[1].ts_event_us));
        assert_eq!(rows[1].close, Some(111.0));
        // Non-standard fields land in the meta JSON.
        assert!(rows[0].meta.contains("trades"));
    }

    #[test]
    fn resolve_file_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let sink = ParquetSink::new(dir.path());
        assert!(sink.resolve_file("../../etc/passwd").is_none());
        assert!(sink.resolve_file("missing.parquet").is_none());
    }
}
