//! Content index over a directory tree.
//!
//! A [`TreeIndex`] keeps one [`FileRecord`] per filesystem object under a
//! root, reachable by file identity, by relative path, and by content id.
//! [`TreeIndex::refresh`] brings it up to date with the filesystem; only
//! entries that are new or whose modification time changed are re-read.

use std::{
    collections::{BTreeMap, HashMap},
    ffi::OsString,
    fs::{self, Metadata},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use jiff::Timestamp;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::builder::IdBuilder;
use crate::codec;
use crate::config::TreeConfig;
use crate::error::{CasError, HashError, Result, StoreError};
use crate::format::size_str;
use crate::id::ContentId;
use crate::names::NameCache;
use crate::record::{FileId, FileRecord, ObjectType, Snapshot};
use crate::store::Store;
use crate::tracker::Progress;

/// Options for one [`TreeIndex::refresh`] pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshOptions {
    /// Recompute every content id, changed or not.
    pub force: bool,
    /// Save the index before recomputing ids and then at this interval.
    pub checkpoint: Option<Duration>,
}

/// What a refresh pass found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub new_entries: u64,
    pub new_bytes: u64,
    pub changed_entries: u64,
    pub changed_bytes: u64,
    pub vanished_entries: u64,
    pub vanished_bytes: u64,
    pub refreshed_entries: u64,
    pub refreshed_bytes: u64,
    /// Entries left without a content id.
    pub failed_entries: u64,
    /// The pass stopped early on request.
    pub interrupted: bool,
}

enum Recompute {
    Resolved,
    Failed,
}

pub struct TreeIndex {
    root: PathBuf,
    metadata: PathBuf,
    config: TreeConfig,
    names: Arc<NameCache>,
    builder: IdBuilder,
    by_fileid: HashMap<FileId, FileRecord>,
    by_path: BTreeMap<String, FileId>,
    by_cid: HashMap<ContentId, FileId>,
    generation: u64,
}

impl std::fmt::Debug for TreeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeIndex")
            .field("root", &self.root)
            .field("metadata", &self.metadata)
            .field("records", &self.by_fileid.len())
            .finish_non_exhaustive()
    }
}

impl TreeIndex {
    /// An empty index over `root` with the default configuration.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_config(root, TreeConfig::default())
    }

    pub fn with_config(root: impl Into<PathBuf>, config: TreeConfig) -> Self {
        let root = root.into();
        let metadata = root.join(&config.metadata);
        Self {
            builder: IdBuilder::with_threshold(config.literal_threshold),
            root,
            metadata,
            config,
            names: NameCache::shared(),
            by_fileid: HashMap::new(),
            by_path: BTreeMap::new(),
            by_cid: HashMap::new(),
            generation: 0,
        }
    }

    /// Use `names` instead of the process-wide name cache.
    pub fn with_names(mut self, names: Arc<NameCache>) -> Self {
        self.names = names;
        self
    }

    /// Load the saved index for `root`, scanning the tree if there is none.
    pub fn open(root: impl Into<PathBuf>, config: TreeConfig) -> Result<Self> {
        let mut index = Self::with_config(root, config);
        if !index.load()? {
            index.refresh(RefreshOptions::default())?;
        }
        Ok(index)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.by_fileid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fileid.is_empty()
    }

    /// All records, in path order.
    pub fn records(&self) -> impl Iterator<Item = &FileRecord> + '_ {
        self.by_path
            .values()
            .filter_map(|fileid| self.by_fileid.get(fileid))
    }

    pub fn get_by_path(&self, path: &str) -> Option<&FileRecord> {
        self.by_path
            .get(path)
            .and_then(|fileid| self.by_fileid.get(fileid))
    }

    pub fn get_by_fileid(&self, fileid: FileId) -> Option<&FileRecord> {
        self.by_fileid.get(&fileid)
    }

    /// The record last indexed under `id`.
    ///
    /// When several entries share content only one of them is kept here;
    /// use [`records`](Self::records) to see them all.
    pub fn get_by_id(&self, id: &ContentId) -> Option<&FileRecord> {
        self.by_cid
            .get(id)
            .and_then(|fileid| self.by_fileid.get(fileid))
    }

    /// Save the index to its metadata file.
    pub fn save(&self) -> Result<()> {
        info!(items = self.by_fileid.len(), path = ?self.metadata, "Saving index");
        codec::save(&self.metadata, self.records())
    }

    /// Replace the index with the saved one. Returns false if there was no
    /// usable saved index, leaving this one untouched.
    pub fn load(&mut self) -> Result<bool> {
        debug!(path = ?self.metadata, "Loading index");
        let Some(records) = codec::load(&self.metadata)? else {
            return Ok(false);
        };

        self.by_fileid.clear();
        self.by_path.clear();
        self.by_cid.clear();
        for record in records {
            let fileid = record.fileid;
            self.by_path.insert(record.path.clone(), fileid);
            if let Some(cid) = &record.cid {
                self.by_cid.insert(cid.clone(), fileid);
            }
            self.by_fileid.insert(fileid, record);
        }

        info!(
            ids = self.by_cid.len(),
            paths = self.by_path.len(),
            fileids = self.by_fileid.len(),
            "Loaded index"
        );
        Ok(true)
    }

    /// Bring the index up to date with the filesystem.
    pub fn refresh(&mut self, options: RefreshOptions) -> Result<RefreshStats> {
        self.refresh_inner(options, None)
    }

    /// [`refresh`](Self::refresh), reporting through a tracker's worker
    /// handle. During the walk the goal is the number of entries already
    /// known; it is then reset to the number of entries whose id must be
    /// recomputed. A stop request ends the pass between entries.
    pub fn refresh_with_progress(
        &mut self,
        options: RefreshOptions,
        progress: &Progress,
    ) -> Result<RefreshStats> {
        self.refresh_inner(options, Some(progress))
    }

    fn refresh_inner(
        &mut self,
        options: RefreshOptions,
        progress: Option<&Progress>,
    ) -> Result<RefreshStats> {
        let mut stats = RefreshStats::default();
        self.generation += 1;
        let generation = self.generation;

        // Provisional goal for the walk: the entries known so far.
        if let Some(progress) = progress {
            progress.set_goal(self.by_fileid.len() as u64, 0);
        }

        if !self.scan(generation, options.force, progress, &mut stats) {
            info!("Refresh stopped during scan");
            stats.interrupted = true;
            return Ok(stats);
        }
        self.remove_vanished(generation, &mut stats);

        info!(
            new = stats.new_entries,
            new_bytes = %size_str(stats.new_bytes),
            changed = stats.changed_entries,
            changed_bytes = %size_str(stats.changed_bytes),
            vanished = stats.vanished_entries,
            vanished_bytes = %size_str(stats.vanished_bytes),
            "Scan complete"
        );

        self.recompute_stale(options, progress, &mut stats)?;
        info!(?stats, "Refresh completed");
        Ok(stats)
    }

    /// Walk the tree, stamping every entry seen with `generation`.
    ///
    /// Returns false if stopped before the walk finished.
    fn scan(
        &mut self,
        generation: u64,
        force: bool,
        progress: Option<&Progress>,
        stats: &mut RefreshStats,
    ) -> bool {
        let excluded = MetadataFiles::new(&self.metadata);
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !excluded.matches(entry.path()));

        let mut last_log = Instant::now();
        for entry in walker {
            if progress.is_some_and(Progress::stopping) {
                return false;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(path = ?err.path(), %err, "Failed to walk entry");
                    continue;
                }
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(path = ?entry.path(), %err, "Failed to stat entry");
                    continue;
                }
            };

            let Some(relative) = relative_path(entry.path(), &self.root) else {
                warn!(path = ?entry.path(), "Skipping entry with a non-UTF-8 path");
                continue;
            };
            self.observe(relative, &meta, generation, force, stats);
            if let Some(progress) = progress {
                progress.update(1);
            }

            if last_log.elapsed() >= self.config.log_interval {
                info!(
                    new = stats.new_entries,
                    new_bytes = %size_str(stats.new_bytes),
                    changed = stats.changed_entries,
                    changed_bytes = %size_str(stats.changed_bytes),
                    "Scanning"
                );
                last_log = Instant::now();
            }
        }
        true
    }

    fn observe(
        &mut self,
        path: String,
        meta: &Metadata,
        generation: u64,
        force: bool,
        stats: &mut RefreshStats,
    ) {
        let fileid = FileId::of(meta);

        let previous_path = match self.by_fileid.get_mut(&fileid) {
            None => {
                debug!(%path, "New item");
                let mut record = FileRecord::new(path.clone(), meta, &self.names);
                record.generation = generation;
                stats.new_entries += 1;
                stats.new_bytes += record.size;
                self.by_fileid.insert(fileid, record);
                None
            }
            Some(record) => {
                let previous = (record.path != path).then(|| record.path.clone());
                if record.observe(&path, meta, &self.names, force) {
                    debug!(%path, "Updated item");
                    stats.changed_entries += 1;
                    stats.changed_bytes += record.size;
                }
                record.generation = generation;
                previous
            }
        };

        if let Some(previous) = previous_path {
            debug!(from = %previous, to = %path, "Item moved");
            if self.by_path.get(&previous) == Some(&fileid) {
                self.by_path.remove(&previous);
            }
        }
        self.by_path.insert(path, fileid);
    }

    /// Drop every record the last walk did not see.
    fn remove_vanished(&mut self, generation: u64, stats: &mut RefreshStats) {
        let vanished: Vec<FileId> = self
            .by_fileid
            .iter()
            .filter(|(_, record)| record.generation != generation)
            .map(|(fileid, _)| *fileid)
            .collect();

        for fileid in vanished {
            let Some(record) = self.by_fileid.remove(&fileid) else {
                continue;
            };
            debug!(path = %record.path, "Vanished item");
            if self.by_path.get(&record.path) == Some(&fileid) {
                self.by_path.remove(&record.path);
            }
            if let Some(cid) = &record.cid {
                if self.by_cid.get(cid) == Some(&fileid) {
                    self.by_cid.remove(cid);
                }
            }
            stats.vanished_entries += 1;
            stats.vanished_bytes += record.size;
        }
    }

    fn recompute_stale(
        &mut self,
        options: RefreshOptions,
        progress: Option<&Progress>,
        stats: &mut RefreshStats,
    ) -> Result<()> {
        let stale: Vec<FileId> = self
            .records()
            .filter(|record| record.stale)
            .map(|record| record.fileid)
            .collect();
        let stale_bytes: u64 = stale
            .iter()
            .filter_map(|fileid| self.by_fileid.get(fileid))
            .map(|record| record.size)
            .sum();

        let mut last_checkpoint = Instant::now();
        if options.checkpoint.is_some() {
            info!("Doing first checkpoint save");
            self.checkpoint()?;
            last_checkpoint = Instant::now();
        }

        if let Some(progress) = progress {
            progress.set_goal(stale.len() as u64, 0);
        }

        let started = Instant::now();
        let mut last_log = started;
        for fileid in &stale {
            if progress.is_some_and(Progress::stopping) {
                info!("Refresh stopped");
                stats.interrupted = true;
                break;
            }

            let Some(record) = self.by_fileid.get_mut(fileid) else {
                continue;
            };
            debug!(path = %record.path, "Refresh item");
            let old_cid = record.cid.clone();
            let outcome = recompute(
                record,
                &self.root,
                &mut self.builder,
                &self.config,
                &self.names,
            );

            if let Some(old) = &old_cid {
                if self.by_cid.get(old) == Some(fileid) {
                    self.by_cid.remove(old);
                }
            }
            if let Some(cid) = &record.cid {
                self.by_cid.insert(cid.clone(), *fileid);
            }

            stats.refreshed_entries += 1;
            stats.refreshed_bytes += record.size;
            if matches!(outcome, Recompute::Failed) {
                stats.failed_entries += 1;
            }
            if let Some(progress) = progress {
                progress.update(1);
            }

            if last_log.elapsed() >= self.config.log_interval {
                log_refresh_progress(stats, stale.len() as u64, stale_bytes, started);
                last_log = Instant::now();
            }

            if let Some(interval) = options.checkpoint {
                if last_checkpoint.elapsed() >= interval {
                    info!("Doing checkpoint save");
                    self.checkpoint()?;
                    last_checkpoint = Instant::now();
                }
            }
        }

        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        self.save().map_err(|err| {
            error!(%err, "Cannot save metadata, giving up");
            CasError::Checkpoint {
                source: Box::new(err),
            }
        })
    }
}

/// Recompute a record's content id, retrying while the entry changes
/// underneath the read.
fn recompute(
    record: &mut FileRecord,
    root: &Path,
    builder: &mut IdBuilder,
    config: &TreeConfig,
    names: &NameCache,
) -> Recompute {
    recompute_with(record, root, config, names, |path, meta| {
        read_content(builder, path, meta, config.block_size)
    })
}

/// Content id of the entry at `path`, null for types without content.
fn read_content(
    builder: &mut IdBuilder,
    path: &Path,
    meta: &Metadata,
    block_size: usize,
) -> Result<Option<ContentId>, HashError> {
    let expected = Some(meta.len());
    match ObjectType::from_file_type(meta.file_type()) {
        Some(ObjectType::File) => builder.identify_file(path, expected, block_size).map(Some),
        Some(ObjectType::Symlink) => builder.identify_link(path, expected).map(Some),
        _ => Ok(None),
    }
}

fn recompute_with(
    record: &mut FileRecord,
    root: &Path,
    config: &TreeConfig,
    names: &NameCache,
    mut read: impl FnMut(&Path, &Metadata) -> Result<Option<ContentId>, HashError>,
) -> Recompute {
    let path = root.join(&record.path);

    for attempt in 1..=config.max_attempts {
        let before = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(?path, %err, "Failed to stat");
                record.cid = None;
                return Recompute::Failed;
            }
        };

        if FileId::of(&before) != record.fileid {
            // Another object now lives at this path; the next walk picks it up.
            warn!(?path, "Entry replaced since the scan");
            record.cid = None;
            return Recompute::Failed;
        }

        let result = read(&path, &before);

        let after = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(?path, %err, "Failed to stat");
                record.cid = None;
                return Recompute::Failed;
            }
        };

        if FileId::of(&after) != record.fileid {
            warn!(?path, "Entry replaced while reading");
            record.cid = None;
            return Recompute::Failed;
        }

        let changed = Snapshot::of(&before) != Snapshot::of(&after);
        match result {
            Ok(cid) if !changed => {
                let current = record.path.clone();
                record.observe(&current, &after, names, false);
                record.cid = cid;
                record.stale = false;
                return Recompute::Resolved;
            }
            Ok(_) | Err(HashError::LengthMismatch { .. }) => {
                warn!(?path, attempt, "File changed during reading, retrying");
            }
            Err(HashError::Io(err)) => {
                warn!(?path, %err, "Failed to read");
                record.cid = None;
                return Recompute::Failed;
            }
        }
    }

    error!(?path, "File is changing too often, giving up");
    record.cid = None;
    Recompute::Failed
}

fn log_refresh_progress(stats: &RefreshStats, entries: u64, bytes: u64, started: Instant) {
    let elapsed = started.elapsed().as_secs_f64();
    let count_pc = percent(stats.refreshed_entries, entries);
    let bytes_pc = percent(stats.refreshed_bytes, bytes);
    let to_go = if stats.refreshed_bytes > 0 {
        elapsed * bytes.saturating_sub(stats.refreshed_bytes) as f64 / stats.refreshed_bytes as f64
    } else {
        0.0
    };
    let eta = jiff::SignedDuration::try_from_secs_f64(to_go)
        .ok()
        .and_then(|to_go| Timestamp::now().checked_add(to_go).ok());

    info!(
        done = stats.refreshed_entries,
        entries,
        count_pc,
        done_bytes = %size_str(stats.refreshed_bytes),
        bytes = %size_str(bytes),
        bytes_pc,
        elapsed = elapsed as u64,
        to_go = to_go as u64,
        eta = ?eta,
        "Refreshing"
    );
}

fn percent(done: u64, total: u64) -> u64 {
    if total == 0 {
        100
    } else {
        done.saturating_mul(100) / total
    }
}

/// Root-relative form of `path`, or `None` if it is not valid UTF-8.
fn relative_path(path: &Path, root: &Path) -> Option<String> {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_str()
        .map(str::to_string)
}

/// The metadata file and the temporary and backup files written beside it.
struct MetadataFiles {
    dir: PathBuf,
    name: OsString,
}

impl MetadataFiles {
    fn new(metadata: &Path) -> Self {
        Self {
            dir: metadata.parent().map(Path::to_path_buf).unwrap_or_default(),
            name: metadata.file_name().map(OsString::from).unwrap_or_default(),
        }
    }

    fn matches(&self, path: &Path) -> bool {
        if self.name.is_empty() || path.parent() != Some(self.dir.as_path()) {
            return false;
        }
        let Some(file_name) = path.file_name() else {
            return false;
        };
        if file_name == self.name.as_os_str() {
            return true;
        }

        let (name, file_name) = (self.name.to_string_lossy(), file_name.to_string_lossy());
        file_name
            .strip_prefix(name.as_ref())
            .is_some_and(|rest| rest == ".bak" || (rest.starts_with('.') && rest.ends_with(".tmp")))
    }
}

impl Store for TreeIndex {
    fn ids(&self) -> Box<dyn Iterator<Item = &ContentId> + '_> {
        Box::new(self.records().filter_map(|record| record.cid.as_ref()))
    }

    fn contains(&self, id: &ContentId) -> bool {
        self.by_cid.contains_key(id)
    }

    /// The tree index tracks identity and location only.
    fn get(&mut self, _id: &ContentId) -> Result<Vec<u8>, StoreError> {
        Err(StoreError::Unsupported)
    }

    fn put(
        &mut self,
        _content: &[u8],
        _expiry: Option<Timestamp>,
        _expected: Option<&ContentId>,
    ) -> Result<ContentId, StoreError> {
        Err(StoreError::ReadOnly)
    }
}
