//! Timing record store and its JSON document.
//!
//! The document is a map with one key per (kernel, op) pair, e.g.
//! `segmented_bgmv_shrink`, each holding the timing records in sweep order.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::check::Precision;
use crate::kernels::KernelName;
use crate::problem::OpType;

/// File name the CLI writes the record document to.
pub const DEFAULT_RECORD_FILE: &str = "record_bgmv_lee_cudagraph.json";

/// Errors from reading or writing the record document.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to read records from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write records to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed record document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown record key '{0}'")]
    UnknownKey(String),
}

/// One timed kernel run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingRecord {
    pub duration_ms: f64,
    pub batch_count: usize,
    pub hidden_size: usize,
    pub dtype: Precision,
    pub seed: u64,
}

/// Identifies one record list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub kernel: KernelName,
    pub op: OpType,
}

impl RecordKey {
    pub fn new(kernel: KernelName, op: OpType) -> Self {
        Self { kernel, op }
    }

    /// Every key of a complete document.
    pub fn all() -> impl Iterator<Item = RecordKey> {
        KernelName::ALL
            .into_iter()
            .flat_map(|kernel| OpType::ALL.into_iter().map(move |op| RecordKey { kernel, op }))
    }

    pub fn parse(key: &str) -> Option<Self> {
        let (kernel, op) = key.split_once("_bgmv_")?;
        Some(Self {
            kernel: kernel.parse().ok()?,
            op: op.parse().ok()?,
        })
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_bgmv_{}", self.kernel, self.op)
    }
}

/// Append-only timing records grouped by [`RecordKey`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordStore {
    records: BTreeMap<RecordKey, Vec<TimingRecord>>,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    /// Empty store with every key present.
    pub fn new() -> Self {
        Self {
            records: RecordKey::all().map(|key| (key, Vec::new())).collect(),
        }
    }

    pub fn push(&mut self, key: RecordKey, record: TimingRecord) {
        self.records.entry(key).or_default().push(record);
    }

    pub fn records(&self, key: RecordKey) -> &[TimingRecord] {
        self.records.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of records across all keys.
    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct batch counts present in any record, ascending.
    pub fn batch_counts(&self) -> Vec<usize> {
        let mut batches: Vec<usize> = self
            .records
            .values()
            .flatten()
            .map(|r| r.batch_count)
            .collect();
        batches.sort_unstable();
        batches.dedup();
        batches
    }

    pub fn to_json(&self) -> Result<String, RecordError> {
        let document: BTreeMap<String, &Vec<TimingRecord>> = self
            .records
            .iter()
            .map(|(key, records)| (key.to_string(), records))
            .collect();
        Ok(serde_json::to_string_pretty(&document)?)
    }

    pub fn from_json(json: &str) -> Result<Self, RecordError> {
        let document: BTreeMap<String, Vec<TimingRecord>> = serde_json::from_str(json)?;
        let mut store = Self::new();
        for (key, records) in document {
            let parsed = RecordKey::parse(&key).ok_or(RecordError::UnknownKey(key))?;
            store.records.insert(parsed, records);
        }
        Ok(store)
    }

    /// Write the document to `path` through a temporary sibling file, so a
    /// crash mid-write leaves the previous document intact.
    pub fn save(&self, path: &Path) -> Result<(), RecordError> {
        let json = self.to_json()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| RecordError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json).map_err(|source| RecordError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            RecordError::Write {
                path: path.to_path_buf(),
                source,
            }
        })?;
        tracing::debug!(path = %path.display(), records = self.len(), "saved timing records");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, RecordError> {
        let json = fs::read_to_string(path).map_err(|source| RecordError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }
}
