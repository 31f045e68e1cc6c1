//! Incremental tailing of node log files.
//!
//! One cursor is cached per (node, log path). Each round reads only what was
//! appended since the cursor and only up to the last complete line; a
//! trailing partial line is left for the next round.
//!
//! A read that outlives the round's timeout keeps running in the background
//! and holds its cursor; the node is skipped until that read finishes.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use fleet_protocol::{sha256_hex, NodeConfig, NodeLogState};

const HEADERS_HEIGHT: &str = "Headers.Height:";
const CONSENSUS_HEIGHT: &str = "Consensus.Height:";
const BLOCK_STORE_HEIGHT: &str = "BlockStore.Height:";
const WALLET_HEIGHT: &str = "Wallet.Height:";

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Stable cache key for a node's log file.
pub fn cursor_key(node: &str, path: &Path) -> String {
    sha256_hex(format!("{node}\n{}", path.display()).as_bytes())
}

/// Value following `label` on `line`: the first whitespace separated token.
/// `None` when the label is absent; `Some(None)` when the value is not numeric.
fn field(line: &str, label: &str) -> Option<Option<u64>> {
    let start = line.find(label)? + label.len();
    Some(
        line[start..]
            .split_whitespace()
            .next()
            .and_then(|token| token.parse().ok()),
    )
}

/// Fold one log line into the parsed state.
pub fn parse_line(state: &mut NodeLogState, line: &str) {
    if let Some(value) = field(line, HEADERS_HEIGHT) {
        state.headers_height = value;
    }
    if let Some(value) = field(line, CONSENSUS_HEIGHT) {
        state.consensus_height = value;
    }
    if let Some(value) = field(line, BLOCK_STORE_HEIGHT) {
        state.block_store_height = value;
    }
    if let Some(value) = field(line, WALLET_HEIGHT) {
        state.wallet_height = value;
    }
}

/// Cursor over one log file.
#[derive(Debug)]
pub struct LogCursor {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    offset: u64,
    state: NodeLogState,
}

/// What one read consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRead {
    pub lines: u64,
    pub bytes: u64,
    pub state: NodeLogState,
}

impl LogCursor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            offset: 0,
            state: NodeLogState::default(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Consume the complete lines appended since the last read.
    pub async fn read_appended(&mut self) -> std::io::Result<LogRead> {
        // The path is checked every round so a deleted file is noticed even
        // while an old handle is still open.
        let len = tokio::fs::metadata(&self.path).await?.len();
        if len < self.offset {
            tracing::debug!(path = %self.path.display(), "Log truncated, rereading from start");
            self.offset = 0;
            self.file = None;
        }

        let mut file = match self.file.take() {
            Some(file) => file,
            None => tokio::fs::File::open(&self.path).await?,
        };

        let mut buf = Vec::new();
        if len > self.offset {
            file.seek(SeekFrom::Start(self.offset)).await?;
            (&mut file).take(len - self.offset).read_to_end(&mut buf).await?;
        }
        self.file = Some(file);

        let complete = match buf.iter().rposition(|b| *b == b'\n') {
            Some(last) => &buf[..=last],
            None => &[][..],
        };

        let text = String::from_utf8_lossy(complete);
        let mut lines = 0;
        for line in text.lines() {
            parse_line(&mut self.state, line);
            lines += 1;
        }

        self.offset += complete.len() as u64;
        self.state.lines_read += lines;
        if lines > 0 {
            self.state.updated_at = Some(chrono::Utc::now());
        }

        Ok(LogRead {
            lines,
            bytes: complete.len() as u64,
            state: self.state.clone(),
        })
    }
}

enum ReadOutcome {
    Read(LogRead),
    Failed(std::io::Error),
    TimedOut,
}

/// Tails the log of every managed node, one task per node per round.
#[derive(Debug, Clone)]
pub struct NodeLogProbe {
    cursors: Arc<Mutex<HashMap<String, Arc<Mutex<LogCursor>>>>>,
    read_timeout: Duration,
}

impl Default for NodeLogProbe {
    fn default() -> Self {
        Self::with_read_timeout(DEFAULT_READ_TIMEOUT)
    }
}

impl NodeLogProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_timeout(read_timeout: Duration) -> Self {
        Self {
            cursors: Arc::default(),
            read_timeout,
        }
    }

    pub async fn cached(&self) -> usize {
        self.cursors.lock().await.len()
    }

    /// Run one round over `nodes`. Returns the log state of every node whose
    /// log could be read within the read timeout; a failing node is logged
    /// and its cursor evicted without affecting the others.
    pub async fn probe(&self, nodes: &[NodeConfig]) -> Vec<(String, NodeLogState)> {
        let mut jobs = JoinSet::new();
        {
            let mut cursors = self.cursors.lock().await;
            let mut live = Vec::with_capacity(nodes.len());
            for node in nodes {
                let path = node.log_file();
                let key = cursor_key(node.full_name(), &path);
                let cursor = Arc::clone(
                    cursors
                        .entry(key.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(LogCursor::new(path)))),
                );
                live.push(key.clone());

                let name = node.full_name().to_string();
                let Ok(mut guard) = cursor.try_lock_owned() else {
                    tracing::debug!(node = %name, "Previous log read still running, node skipped");
                    continue;
                };
                let read_timeout = self.read_timeout;
                jobs.spawn(async move {
                    let read = tokio::spawn(async move { guard.read_appended().await });
                    let outcome = match tokio::time::timeout(read_timeout, read).await {
                        Ok(Ok(Ok(read))) => ReadOutcome::Read(read),
                        Ok(Ok(Err(e))) => ReadOutcome::Failed(e),
                        Ok(Err(e)) => ReadOutcome::Failed(std::io::Error::other(e)),
                        Err(_) => ReadOutcome::TimedOut,
                    };
                    (name, key, outcome)
                });
            }
            // Nodes no longer managed give up their cursor.
            cursors.retain(|key, _| live.contains(key));
        }

        let mut results = Vec::new();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((name, _, ReadOutcome::Read(read))) => {
                    if read.lines > 0 {
                        tracing::trace!(node = %name, lines = read.lines, "Read node log");
                    }
                    results.push((name, read.state));
                }
                Ok((name, key, ReadOutcome::Failed(e))) => {
                    tracing::warn!(node = %name, error = %e, "Cannot read node log");
                    self.cursors.lock().await.remove(&key);
                }
                Ok((name, _, ReadOutcome::TimedOut)) => {
                    tracing::warn!(
                        node = %name,
                        timeout_ms = self.read_timeout.as_millis() as u64,
                        "Node log read timed out"
                    );
                }
                Err(e) => tracing::error!(error = %e, "Log probe task failed"),
            }
        }
        results
    }

    /// Drop every cached cursor and its file handle.
    pub async fn close(&self) {
        self.cursors.lock().await.clear();
    }
}
