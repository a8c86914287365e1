//! File-backed journal and snapshot store.
//!
//! The on-disk layout:
//! ```text
//! <base_dir>/
//!     streams/
//!         <aggregate_name>/
//!             <identity>/
//!                 events.jsonl        -- one JSON array (a batch) per line
//!     snapshots/
//!         <aggregate_name>/
//!             <identity>/
//!                 <sequence>.json     -- one file per captured version
//! ```
//!
//! Names and identities are used as single path segments: `%`, `/`, `\`
//! and NUL are percent-encoded, as is a segment made only of dots, so no
//! identity can address a file outside its own directory.
//!
//! Each journal line holds a whole batch, so a torn write can only damage the
//! final line; readers skip an unterminated final line instead of failing,
//! and the next append cuts it off before writing. Snapshot writes are atomic
//! via a temp-rename pattern.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::{JournalError, SnapshotStoreError};
use crate::event::SerializedEvent;
use crate::journal::{EventJournal, StreamId, check_batch};
use crate::snapshot::SerializedSnapshot;
use crate::snapshot_store::SnapshotStore;

/// Manages the on-disk directory layout for event streams and snapshots.
///
/// `StreamLayout` is cheap to clone (it wraps a single `PathBuf`) and only
/// computes paths; directories are created lazily by the backends.
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

impl StreamLayout {
    /// Create a new `StreamLayout` rooted at the given base directory.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Root directory for all store data.
    ///   The directory does not need to exist yet.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the path to a stream's directory.
    ///
    /// # Returns
    ///
    /// `<base_dir>/streams/<aggregate_name>/<identity>`
    pub fn stream_dir(&self, stream: &StreamId) -> PathBuf {
        self.base_dir
            .join("streams")
            .join(&*path_segment(stream.aggregate_name()))
            .join(&*path_segment(stream.identity()))
    }

    /// Returns the path to a stream's event log.
    ///
    /// # Returns
    ///
    /// `<base_dir>/streams/<aggregate_name>/<identity>/events.jsonl`
    pub fn events_path(&self, stream: &StreamId) -> PathBuf {
        self.stream_dir(stream).join("events.jsonl")
    }

    /// Returns the path to a stream's snapshot directory.
    ///
    /// # Returns
    ///
    /// `<base_dir>/snapshots/<aggregate_name>/<identity>`
    pub fn snapshot_dir(&self, stream: &StreamId) -> PathBuf {
        self.base_dir
            .join("snapshots")
            .join(&*path_segment(stream.aggregate_name()))
            .join(&*path_segment(stream.identity()))
    }

    /// Returns the path of the snapshot captured at `sequence_number`.
    ///
    /// # Returns
    ///
    /// `<base_dir>/snapshots/<aggregate_name>/<identity>/<sequence_number>.json`
    pub fn snapshot_path(&self, stream: &StreamId, sequence_number: u64) -> PathBuf {
        self.snapshot_dir(stream)
            .join(format!("{sequence_number}.json"))
    }
}

/// Encode `raw` so it stays one path segment. Plain names pass through.
fn path_segment(raw: &str) -> Cow<'_, str> {
    let only_dots = raw.bytes().all(|b| b == b'.');
    let needs_escape = |c: char| matches!(c, '%' | '/' | '\\' | '\0') || (only_dots && c == '.');
    if !raw.is_empty() && !raw.chars().any(needs_escape) {
        return Cow::Borrowed(raw);
    }
    let mut encoded = String::with_capacity(raw.len() + 2);
    for c in raw.chars() {
        if needs_escape(c) {
            encoded.push_str(&format!("%{:02X}", c as u32));
        } else {
            encoded.push(c);
        }
    }
    if encoded.is_empty() {
        encoded.push('%');
    }
    Cow::Owned(encoded)
}

/// Event journal storing each stream as a JSONL file of batches.
///
/// Stream heads are cached after the first read so appends do not rescan
/// the file.
#[derive(Debug, Clone)]
pub struct FileJournal {
    layout: StreamLayout,
    heads: Arc<Mutex<HashMap<StreamId, u64>>>,
}

impl FileJournal {
    /// Create a journal rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: StreamLayout::new(base_dir),
            heads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The layout this journal writes to.
    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    fn cached_head(&self, stream: &StreamId) -> Option<u64> {
        self.heads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream)
            .copied()
    }

    fn set_head(&self, stream: &StreamId, head: u64) {
        self.heads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream.clone(), head);
    }
}

#[async_trait]
impl EventJournal for FileJournal {
    async fn append(
        &self,
        stream: &StreamId,
        events: Vec<SerializedEvent>,
    ) -> Result<(), JournalError> {
        if events.is_empty() {
            return Ok(());
        }
        let journal = self.clone();
        let stream = stream.clone();
        tokio::task::spawn_blocking(move || journal.append_blocking(&stream, &events))
            .await
            .map_err(|e| JournalError::Unavailable(e.to_string()))?
    }

    async fn read_from(
        &self,
        stream: &StreamId,
        after: u64,
    ) -> Result<Vec<SerializedEvent>, JournalError> {
        let path = self.layout.events_path(stream);
        let events = tokio::task::spawn_blocking(move || read_events(&path))
            .await
            .map_err(|e| JournalError::Unavailable(e.to_string()))??;
        self.set_head(stream, events.last().map_or(0, |e| e.sequence_number));
        Ok(events
            .into_iter()
            .filter(|e| e.sequence_number > after)
            .collect())
    }
}

impl FileJournal {
    fn append_blocking(
        &self,
        stream: &StreamId,
        events: &[SerializedEvent],
    ) -> Result<(), JournalError> {
        let path = self.layout.events_path(stream);
        let head = match self.cached_head(stream) {
            Some(head) => head,
            None => read_events(&path)?.last().map_or(0, |e| e.sequence_number),
        };
        check_batch(stream, head, events)?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut line = serde_json::to_vec(events)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        repair_torn_tail(&mut file, &path)?;
        // One write per batch: the line is either complete or torn, never
        // split across batches.
        file.write_all(&line)?;
        file.sync_data()?;

        let new_head = events.last().map_or(head, |e| e.sequence_number);
        self.set_head(stream, new_head);
        tracing::debug!(stream = %stream, head = new_head, count = events.len(), "batch appended");
        Ok(())
    }
}

/// Make sure the file ends on a line boundary before the next batch lands.
///
/// An unterminated tail that still parses as a batch only lost its newline
/// and gets one; anything else is a torn write and is truncated away, so it
/// can never end up in the middle of the file.
fn repair_torn_tail(file: &mut File, path: &Path) -> io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    let keep = contents
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);
    let tail = &contents[keep..];
    if serde_json::from_slice::<Vec<SerializedEvent>>(tail).is_ok() {
        file.write_all(b"\n")?;
    } else {
        tracing::warn!(
            path = %path.display(),
            bytes = tail.len(),
            "truncating torn final batch"
        );
        file.set_len(keep as u64)?;
    }
    Ok(())
}

/// Read every event in a JSONL batch file.
///
/// A missing file is an empty stream. An unparsable final line without a
/// trailing newline is a torn write and is skipped.
fn read_events(path: &Path) -> Result<Vec<SerializedEvent>, JournalError> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let terminated = contents.ends_with('\n');
    let lines: Vec<&str> = contents.lines().collect();

    let mut events = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Vec<SerializedEvent>>(line) {
            Ok(batch) => events.extend(batch),
            Err(e) if i + 1 == lines.len() && !terminated => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping torn final batch"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(events)
}

/// Snapshot store writing one JSON file per captured version.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    layout: StreamLayout,
}

impl FileSnapshotStore {
    /// Create a snapshot store rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: StreamLayout::new(base_dir),
        }
    }

    /// The layout this store writes to.
    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(
        &self,
        stream: &StreamId,
        snapshot: SerializedSnapshot,
    ) -> Result<(), SnapshotStoreError> {
        let path = self
            .layout
            .snapshot_path(stream, snapshot.sequence_number);
        tokio::task::spawn_blocking(move || save_snapshot(&path, &snapshot))
            .await
            .map_err(|e| SnapshotStoreError::Unavailable(e.to_string()))?
    }

    async fn load_latest(
        &self,
        stream: &StreamId,
    ) -> Result<Option<SerializedSnapshot>, SnapshotStoreError> {
        let dir = self.layout.snapshot_dir(stream);
        tokio::task::spawn_blocking(move || load_latest_snapshot(&dir))
            .await
            .map_err(|e| SnapshotStoreError::Unavailable(e.to_string()))?
    }

    async fn delete_up_to(
        &self,
        stream: &StreamId,
        sequence_number: u64,
    ) -> Result<(), SnapshotStoreError> {
        let dir = self.layout.snapshot_dir(stream);
        tokio::task::spawn_blocking(move || delete_snapshots_up_to(&dir, sequence_number))
            .await
            .map_err(|e| SnapshotStoreError::Unavailable(e.to_string()))?
    }
}

/// Write a snapshot atomically: temp file in the same directory, then rename.
fn save_snapshot(path: &Path, snapshot: &SerializedSnapshot) -> Result<(), SnapshotStoreError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(snapshot)?;
    fs::write(&tmp_path, &json)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Snapshot versions present in `dir`, descending.
fn snapshot_versions(dir: &Path) -> io::Result<Vec<u64>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut versions: Vec<u64> = entries
        .filter_map(|entry| {
            let name = entry.ok()?.file_name();
            let name = name.to_str()?;
            name.strip_suffix(".json")?.parse().ok()
        })
        .collect();
    versions.sort_unstable_by(|a, b| b.cmp(a));
    Ok(versions)
}

/// Load the newest readable snapshot. Corrupt files are logged and skipped,
/// falling back to older versions.
fn load_latest_snapshot(dir: &Path) -> Result<Option<SerializedSnapshot>, SnapshotStoreError> {
    for version in snapshot_versions(dir)? {
        let path = dir.join(format!("{version}.json"));
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<SerializedSnapshot>(&bytes) {
            Ok(snapshot) => return Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as cache miss"
                );
            }
        }
    }
    Ok(None)
}

fn delete_snapshots_up_to(dir: &Path, sequence_number: u64) -> Result<(), SnapshotStoreError> {
    for version in snapshot_versions(dir)? {
        if version > sequence_number {
            continue;
        }
        match fs::remove_file(dir.join(format!("{version}.json"))) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
