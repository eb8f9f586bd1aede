//! Resource metrics shaping.
//!
//! The monitor sidecar of every node prints one sample per line:
//!
//! ```text
//! <unix seconds>,<rx bytes>,<tx bytes>,<cpu>,<memory bytes>
//! ```
//!
//! [`shape`] turns those raw logs into a [`Stats`] report restricted to the
//! window of the round, merging in the tags recorded by the round.

use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

/// File name of the report written under the output directory.
pub const REPORT_FILE: &str = "stats.json";

const FIELDS: usize = 5;

/// Inclusive time range, in Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: u64,
    pub end: u64,
}

impl Window {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: u64) -> bool {
        self.start <= ts && ts <= self.end
    }
}

/// Time series of one node. All series have the same length, one entry per
/// accepted sample, in log order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    #[serde(rename = "Timestamps")]
    pub timestamps: Vec<u64>,
    #[serde(rename = "RxBytes")]
    pub rx_bytes: Vec<u64>,
    #[serde(rename = "TxBytes")]
    pub tx_bytes: Vec<u64>,
    #[serde(rename = "CPU")]
    pub cpu: Vec<u64>,
    #[serde(rename = "Memory")]
    pub memory: Vec<u64>,
}

impl NodeStats {
    /// Parses the samples of `log` that fall inside `window`.
    ///
    /// Lines with fewer than five fields, or whose first five fields are not
    /// all non-negative integers, are skipped. Trailing fields are ignored.
    pub fn parse(log: impl BufRead, window: Window) -> Self {
        let mut stats = NodeStats::default();
        for line in log.split(b'\n') {
            let Ok(line) = line else {
                break;
            };
            let Some([ts, rx, tx, cpu, mem]) = parse_sample(&String::from_utf8_lossy(&line)) else {
                continue;
            };
            if !window.contains(ts) {
                continue;
            }
            stats.timestamps.push(ts);
            stats.rx_bytes.push(rx);
            stats.tx_bytes.push(tx);
            stats.cpu.push(cpu);
            stats.memory.push(mem);
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

fn parse_sample(line: &str) -> Option<[u64; FIELDS]> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < FIELDS {
        return None;
    }
    let mut sample = [0u64; FIELDS];
    for (slot, field) in sample.iter_mut().zip(&fields) {
        *slot = field.parse().ok()?;
    }
    Some(sample)
}

/// Report of one simulation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Creation time of the report, in Unix seconds.
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Tags")]
    pub tags: BTreeMap<i64, String>,
    #[serde(rename = "Nodes")]
    pub nodes: BTreeMap<String, NodeStats>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
            ..Self::default()
        }
    }

    /// Writes the report as JSON in `dir`, creating the directory when
    /// missing. Returns the path of the file.
    pub async fn write_report(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(REPORT_FILE);
        let data = serde_json::to_vec_pretty(self)?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| report_error("creating", dir, e))?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| report_error("writing", &path, e))?;
        tracing::info!(path = %path.display(), nodes = self.nodes.len(), "stats report written");
        Ok(path)
    }

    pub async fn from_file(path: &Path) -> Result<Stats> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| report_error("reading", path, e))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

fn report_error(action: &str, path: &Path, err: std::io::Error) -> SimError {
    SimError::Metrics(format!("{action} {}: {err}", path.display()))
}

/// Shapes the raw sidecar logs of every node into a report over `window`.
pub fn shape(logs: &HashMap<String, Bytes>, window: Window, tags: BTreeMap<i64, String>) -> Stats {
    let mut stats = Stats::new();
    stats.tags = tags;
    for (node, log) in logs {
        let data: &[u8] = log;
        let series = NodeStats::parse(data, window);
        tracing::debug!(node = %node, samples = series.len(), "shaped node metrics");
        stats.nodes.insert(node.clone(), series);
    }
    stats
}

// ── Tags ────────────────────────────────────────────────────────────

/// Shared registry of round markers, keyed by Unix seconds.
///
/// A later tag in the same second replaces the earlier one.
#[derive(Debug, Clone, Default)]
pub struct TagRecorder {
    tags: Arc<Mutex<BTreeMap<i64, String>>>,
}

impl TagRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `node` at the current instant.
    pub fn record(&self, node: &str) {
        self.record_at(chrono::Utc::now().timestamp(), node);
    }

    pub fn record_at(&self, timestamp: i64, node: &str) {
        self.tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(timestamp, node.to_string());
    }

    pub fn snapshot(&self) -> BTreeMap<i64, String> {
        self.tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_drops_malformed_lines() {
        let log = "100,10,20,1,2\n200,bad,20,1,2\n300,10,20,1,2";
        let stats = NodeStats::parse(log.as_bytes(), Window::new(100, 300));

        assert_eq!(stats.timestamps, vec![100, 300]);
        assert_eq!(stats.rx_bytes, vec![10, 10]);
        assert_eq!(stats.tx_bytes, vec![20, 20]);
        assert_eq!(stats.cpu, vec![1, 1]);
        assert_eq!(stats.memory, vec![2, 2]);
    }

    #[test]
    fn parse_honours_inclusive_window() {
        let log = "99,1,1,1,1\n100,2,2,2,2\n150,3,3,3,3\n200,4,4,4,4\n201,5,5,5,5\n";
        let stats = NodeStats::parse(log.as_bytes(), Window::new(100, 200));
        assert_eq!(stats.timestamps, vec![100, 150, 200]);
        assert_eq!(stats.memory, vec![2, 3, 4]);
    }

    #[test]
    fn parse_accepts_whitespace_and_extra_fields() {
        let log = " 100 , 1 ,2, 3 ,4 \n101,1,2,3,4,extra\n102,1,2,3\n103,-1,2,3,4\n\n";
        let stats = NodeStats::parse(log.as_bytes(), Window::new(0, u64::MAX));
        assert_eq!(stats.timestamps, vec![100, 101]);
        assert_eq!(stats.cpu, vec![3, 3]);
    }

    #[test]
    fn invalid_utf8_only_drops_its_own_line() {
        let log: &[u8] = b"100,1,2,3,4\n\xff\xfe,garbage\n101,1,2,3,4\n102,\xc3,2,3,4\r\n103,1,2,3,4\r\n";
        let stats = NodeStats::parse(log, Window::new(0, 1000));
        assert_eq!(stats.timestamps, vec![100, 101, 103]);
    }

    #[tokio::test]
    async fn report_path_errors_are_metrics_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").expect("write");

        let err = Stats::new()
            .write_report(&blocker)
            .await
            .expect_err("output dir is a file");
        assert!(matches!(err, SimError::Metrics(_)));
        assert!(err.to_string().starts_with("metrics collection failed: creating"));

        let err = Stats::from_file(&dir.path().join("missing.json"))
            .await
            .expect_err("no report");
        assert!(matches!(err, SimError::Metrics(_)));
    }

    #[test]
    fn series_keep_log_order_and_equal_lengths() {
        let log = "300,1,1,1,1\n100,2,2,2,2\nnot a sample\n200,3,3,3,3";
        let stats = NodeStats::parse(log.as_bytes(), Window::new(0, 1000));
        assert_eq!(stats.timestamps, vec![300, 100, 200]);
        for len in [
            stats.rx_bytes.len(),
            stats.tx_bytes.len(),
            stats.cpu.len(),
            stats.memory.len(),
        ] {
            assert_eq!(len, stats.len());
        }
    }

    #[test]
    fn shape_merges_nodes_and_tags() {
        let logs = HashMap::from([
            ("node-0".to_string(), Bytes::from_static(b"10,1,2,3,4\n")),
            ("node-1".to_string(), Bytes::from_static(b"")),
        ]);
        let tags = BTreeMap::from([(10, "node-0".to_string())]);

        let stats = shape(&logs, Window::new(0, 20), tags.clone());

        assert_eq!(stats.tags, tags);
        assert_eq!(stats.nodes.len(), 2);
        assert_eq!(stats.nodes["node-0"].len(), 1);
        assert!(stats.nodes["node-1"].is_empty());
    }

    #[test]
    fn json_uses_report_field_names() {
        let mut stats = Stats {
            timestamp: 42,
            ..Stats::default()
        };
        stats.nodes.insert(
            "a".into(),
            NodeStats::parse("1,2,3,4,5".as_bytes(), Window::new(0, 10)),
        );
        let value = serde_json::to_value(&stats).expect("json");

        assert_eq!(value["Timestamp"], 42);
        assert_eq!(value["Nodes"]["a"]["Timestamps"][0], 1);
        assert_eq!(value["Nodes"]["a"]["RxBytes"][0], 2);
        assert_eq!(value["Nodes"]["a"]["TxBytes"][0], 3);
        assert_eq!(value["Nodes"]["a"]["CPU"][0], 4);
        assert_eq!(value["Nodes"]["a"]["Memory"][0], 5);
    }

    #[tokio::test]
    async fn report_round_trips_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = HashMap::from([
            ("node-0".to_string(), Bytes::from_static(b"100,1,2,3,4\n101,1,2,3,4\n")),
            ("node-1".to_string(), Bytes::from_static(b"100,5,6,7,8\n")),
        ]);
        let recorder = TagRecorder::new();
        recorder.record_at(100, "node-0");
        recorder.record_at(101, "node-1");

        let stats = shape(&logs, Window::new(100, 101), recorder.snapshot());
        let path = stats
            .write_report(&dir.path().join("nested"))
            .await
            .expect("write");
        assert!(path.ends_with(REPORT_FILE));

        let read = Stats::from_file(&path).await.expect("read");
        assert_eq!(read, stats);
        assert_eq!(read.nodes["node-0"].len(), 2);
        assert_eq!(read.tags.len(), 2);
    }

    #[test]
    fn tag_recorder_is_shared_between_clones() {
        let recorder = TagRecorder::new();
        let clone = recorder.clone();
        clone.record_at(5, "node-1");
        recorder.record_at(5, "node-2");
        recorder.record("node-0");

        let tags = recorder.snapshot();
        assert_eq!(tags.get(&5).map(String::as_str), Some("node-2"));
        assert_eq!(tags.len(), 2);
    }
}
