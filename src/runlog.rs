use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::{
    report::StepReport,
    verdict::{AssertionVerdict, Verdict},
};

/// One line of the machine-readable run log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub ts: DateTime<Utc>,
    pub scenario: String,
    pub step_idx: usize,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub input: String,
    pub assistant: Option<String>,
    pub plugin: Option<Value>,
    pub assertions: Vec<AssertionVerdict>,
    pub verdict: Verdict,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl StepRecord {
    pub fn from_report(scenario: &str, report: &StepReport) -> Self {
        let outcome = report.outcome.as_ref();
        Self {
            ts: Utc::now(),
            scenario: scenario.to_string(),
            step_idx: report.index,
            kind: report.kind,
            input: report.input.clone(),
            assistant: outcome.and_then(|o| o.assistant_text.clone()),
            plugin: outcome.and_then(|o| o.plugin_result.clone()),
            assertions: report.assertions.clone(),
            verdict: report.verdict,
            duration_ms: report.duration.as_millis() as u64,
            error: report.error.clone(),
        }
    }
}

/// Sink for per-step records. Called from every scenario worker.
pub trait StepRecorder: Send + Sync {
    fn record(&self, record: &StepRecord) -> io::Result<()>;
}

/// Appends one JSON object per line to `test_run_<timestamp>.jsonl`.
pub struct JsonlRecorder {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlRecorder {
    pub fn create(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("test_run_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S")));
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StepRecorder for JsonlRecorder {
    fn record(&self, record: &StepRecord) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<StepRecord>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<StepRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl StepRecorder for MemoryRecorder {
    fn record(&self, record: &StepRecord) -> io::Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        Ok(())
    }
}
