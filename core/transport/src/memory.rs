//! In-memory transport for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::transport::{EntryKind, RemoteEntry, Transport};
use sitesync_common::{Error, RemotePath, Result, SiteConfig};

/// Transport operations, used for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    List,
    Upload,
    Download,
    Remove,
    RemoveDir,
    EnsureDir,
}

/// In-memory storage entry.
#[derive(Debug, Clone)]
enum Entry {
    File {
        data: Vec<u8>,
        modified: DateTime<Utc>,
    },
    Directory {
        modified: DateTime<Utc>,
    },
}

struct Injected {
    operation: Operation,
    error: Error,
    close: bool,
}

struct MemoryState {
    entries: BTreeMap<String, Entry>,
    closed: bool,
    report_mtimes: bool,
    failures: VecDeque<Injected>,
    calls: HashMap<Operation, usize>,
    latency: HashMap<Operation, Duration>,
    in_flight: usize,
    max_in_flight: usize,
}

/// In-memory transport.
///
/// Models a remote server as a tree of files and directories held in
/// memory. Tests can preload content with explicit modification times,
/// queue failures for specific operations and simulate a dropped
/// connection. All data is lost on drop.
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

/// Marks one call as in flight until dropped.
struct InFlight<'a> {
    transport: &'a MemoryTransport,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.transport.state().in_flight -= 1;
    }
}

impl MemoryTransport {
    /// Create a new transport with an empty root directory.
    ///
    /// The transport starts closed; call `connect` before use.
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "/".to_string(),
            Entry::Directory {
                modified: Utc::now(),
            },
        );
        Self {
            state: Mutex::new(MemoryState {
                entries,
                closed: true,
                report_mtimes: true,
                failures: VecDeque::new(),
                calls: HashMap::new(),
                latency: HashMap::new(),
                in_flight: 0,
                max_in_flight: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key(path: &RemotePath) -> String {
        format!("/{}", path.components().join("/"))
    }

    fn parent_key(path: &RemotePath) -> Option<String> {
        path.parent().map(|p| Self::key(&p))
    }

    /// Store a file with an explicit modification time, creating parents.
    pub fn put_file(&self, path: &str, data: impl Into<Vec<u8>>, modified: DateTime<Utc>) {
        let path = RemotePath::parse(path);
        let mut state = self.state();
        Self::create_parents(&mut state, &path);
        state.entries.insert(
            Self::key(&path),
            Entry::File {
                data: data.into(),
                modified,
            },
        );
    }

    /// Create a directory and its parents.
    pub fn put_dir(&self, path: &str) {
        let path = RemotePath::parse(path);
        let mut state = self.state();
        Self::create_parents(&mut state, &path);
        state
            .entries
            .entry(Self::key(&path))
            .or_insert(Entry::Directory {
                modified: Utc::now(),
            });
    }

    /// Content of a stored file.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state().entries.get(&Self::key(&RemotePath::parse(path))) {
            Some(Entry::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Check whether a file or directory exists.
    pub fn exists(&self, path: &str) -> bool {
        self.state()
            .entries
            .contains_key(&Self::key(&RemotePath::parse(path)))
    }

    /// Stop reporting modification times in listings.
    pub fn without_mtimes(self) -> Self {
        self.state().report_mtimes = false;
        self
    }

    /// Fail the next call of `operation` with `error`.
    pub fn fail_next(&self, operation: Operation, error: Error) {
        self.state().failures.push_back(Injected {
            operation,
            error,
            close: false,
        });
    }

    /// Fail the next call of `operation` and drop the connection with it.
    pub fn fail_next_and_close(&self, operation: Operation, error: Error) {
        self.state().failures.push_back(Injected {
            operation,
            error,
            close: true,
        });
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self) {
        self.state().closed = true;
    }

    /// Number of times `operation` was invoked.
    pub fn calls(&self, operation: Operation) -> usize {
        self.state().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Make every later call of `operation` take `delay` before it completes.
    pub fn set_latency(&self, operation: Operation, delay: Duration) {
        self.state().latency.insert(operation, delay);
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    /// Start a call: check it, mark it in flight and wait out its latency.
    async fn enter(&self, operation: Operation) -> Result<InFlight<'_>> {
        self.begin(operation)?;
        let delay = {
            let mut state = self.state();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.latency.get(&operation).copied()
        };
        let guard = InFlight { transport: self };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(guard)
    }

    /// Count the call, then apply injected failures and the liveness check.
    fn begin(&self, operation: Operation) -> Result<()> {
        let mut state = self.state();
        *state.calls.entry(operation).or_insert(0) += 1;

        if let Some(pos) = state
            .failures
            .iter()
            .position(|f| f.operation == operation)
        {
            if let Some(injected) = state.failures.remove(pos) {
                if injected.close {
                    state.closed = true;
                }
                debug!("Injected failure for {:?}: {}", operation, injected.error);
                return Err(injected.error);
            }
        }

        if operation != Operation::Connect && state.closed {
            return Err(Error::NotConnected("connection closed".to_string()));
        }
        Ok(())
    }

    fn create_parents(state: &mut MemoryState, path: &RemotePath) {
        let mut current = path.parent();
        let mut missing = Vec::new();
        while let Some(dir) = current {
            let key = Self::key(&dir);
            if state.entries.contains_key(&key) {
                break;
            }
            missing.push(key);
            current = dir.parent();
        }
        for key in missing {
            state.entries.insert(
                key,
                Entry::Directory {
                    modified: Utc::now(),
                },
            );
        }
    }

    fn require_parent_dir(state: &MemoryState, path: &RemotePath) -> Result<()> {
        if let Some(parent_key) = Self::parent_key(path) {
            match state.entries.get(&parent_key) {
                Some(Entry::Directory { .. }) => {}
                Some(Entry::File { .. }) => {
                    return Err(Error::InvalidInput("Parent is a file".to_string()));
                }
                None => {
                    return Err(Error::NotFound(format!(
                        "Parent directory not found: {}",
                        path
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, _config: &SiteConfig) -> Result<()> {
        self.begin(Operation::Connect)?;
        self.state().closed = false;
        Ok(())
    }

    async fn list(&self, path: &RemotePath) -> Result<Vec<RemoteEntry>> {
        let _call = self.enter(Operation::List).await?;
        let key = Self::key(path);
        let state = self.state();

        match state.entries.get(&key) {
            Some(Entry::Directory { .. }) => {}
            Some(Entry::File { .. }) => {
                return Err(Error::InvalidInput("Not a directory".to_string()));
            }
            None => {
                return Err(Error::NotFound(format!("Directory not found: {}", path)));
            }
        }

        let prefix = if key == "/" {
            "/".to_string()
        } else {
            format!("{}/", key)
        };

        let mut results = Vec::new();
        for (entry_key, entry) in state.entries.range(prefix.clone()..) {
            let Some(relative) = entry_key.strip_prefix(&prefix) else {
                break;
            };
            // Only direct children
            if relative.is_empty() || relative.contains('/') {
                continue;
            }
            let (kind, size, modified) = match entry {
                Entry::File { data, modified } => (EntryKind::File, data.len() as u64, *modified),
                Entry::Directory { modified } => (EntryKind::Directory, 0, *modified),
            };
            results.push(RemoteEntry {
                name: relative.to_string(),
                kind,
                size,
                modified: state.report_mtimes.then_some(modified),
            });
        }

        Ok(results)
    }

    async fn upload_from(&self, local: &Path, remote: &RemotePath) -> Result<()> {
        let _call = self.enter(Operation::Upload).await?;
        let data = tokio::fs::read(local).await?;

        let mut state = self.state();
        Self::require_parent_dir(&state, remote)?;
        if let Some(Entry::Directory { .. }) = state.entries.get(&Self::key(remote)) {
            return Err(Error::InvalidInput(format!("{} is a directory", remote)));
        }
        state.entries.insert(
            Self::key(remote),
            Entry::File {
                data,
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn download_to(&self, local: &Path, remote: &RemotePath) -> Result<()> {
        let _call = self.enter(Operation::Download).await?;
        let data = match self.state().entries.get(&Self::key(remote)) {
            Some(Entry::File { data, .. }) => data.clone(),
            Some(Entry::Directory { .. }) => {
                return Err(Error::InvalidInput("Cannot download directory".to_string()));
            }
            None => return Err(Error::NotFound(format!("File not found: {}", remote))),
        };
        tokio::fs::write(local, data).await?;
        Ok(())
    }

    async fn remove(&self, path: &RemotePath) -> Result<()> {
        let _call = self.enter(Operation::Remove).await?;
        let key = Self::key(path);
        let mut state = self.state();

        match state.entries.get(&key) {
            Some(Entry::File { .. }) => {
                state.entries.remove(&key);
                Ok(())
            }
            Some(Entry::Directory { .. }) => Err(Error::InvalidInput(
                "Use remove_dir for directories".to_string(),
            )),
            None => Err(Error::NotFound(format!("File not found: {}", path))),
        }
    }

    async fn remove_dir(&self, path: &RemotePath) -> Result<()> {
        let _call = self.enter(Operation::RemoveDir).await?;
        let key = Self::key(path);
        let mut state = self.state();

        match state.entries.get(&key) {
            Some(Entry::Directory { .. }) => {}
            Some(Entry::File { .. }) => {
                return Err(Error::InvalidInput("Not a directory".to_string()));
            }
            None => return Err(Error::NotFound(format!("Directory not found: {}", path))),
        }

        let prefix = format!("{}/", key);
        state
            .entries
            .retain(|k, _| k != &key && !k.starts_with(&prefix));
        Ok(())
    }

    async fn ensure_dir(&self, path: &RemotePath) -> Result<()> {
        let _call = self.enter(Operation::EnsureDir).await?;
        let mut state = self.state();

        let mut current = RemotePath::root();
        for component in path.components() {
            current = current.join(component)?;
            match state.entries.get(&Self::key(&current)) {
                Some(Entry::Directory { .. }) => {}
                Some(Entry::File { .. }) => {
                    return Err(Error::InvalidInput(format!("{} is a file", current)));
                }
                None => {
                    state.entries.insert(
                        Self::key(&current),
                        Entry::Directory {
                            modified: Utc::now(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.state().closed = true;
    }

    fn is_closed(&self) -> bool {
        self.state().closed
    }
}
