use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::ScanError;
use crate::models::ScanJob;
use crate::queue::JobQueue;
use crate::worker::elapsed_ms;

/// Only the head of large media files is hashed.
const HASH_PREFIX_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DiscoveryRules {
    extensions: Vec<String>,
    ignore_patterns: Vec<String>,
}

impl DiscoveryRules {
    /// Extensions may be given with or without the leading dot. Ignore
    /// patterns match as substrings once their `*` wildcards are trimmed.
    pub fn new(extensions: &[String], ignore_patterns: &[String]) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            ignore_patterns: ignore_patterns
                .iter()
                .map(|pattern| pattern.trim().trim_matches('*').to_ascii_lowercase())
                .filter(|pattern| !pattern.is_empty())
                .collect(),
        }
    }

    pub fn accepts_extension(&self, path: &Path) -> bool {
        match file_type(path) {
            Some(ext) => self.extensions.contains(&ext),
            None => false,
        }
    }

    pub fn is_ignored(&self, filename: &str) -> bool {
        let filename = filename.to_ascii_lowercase();
        self.ignore_patterns
            .iter()
            .any(|pattern| filename.contains(pattern.as_str()))
    }
}

/// A media file found on disk that passed the extension and ignore rules.
#[derive(Debug, Clone)]
pub struct MediaFile {
    pub path: String,
    pub filename: String,
    pub file_type: String,
    pub size: i64,
    pub modified: DateTime<Utc>,
}

/// What the catalog remembers about a path from earlier passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct KnownFile {
    pub last_modified: Option<DateTime<Utc>>,
    pub last_scanned: Option<DateTime<Utc>>,
}

/// New files, files touched since the last pass and files never scanned are
/// queued; everything else is skipped.
pub fn needs_scan(known: Option<&KnownFile>, modified: DateTime<Utc>) -> bool {
    let Some(known) = known else {
        return true;
    };
    let changed = known.last_modified.map_or(true, |seen| modified > seen);
    changed || known.last_scanned.is_none()
}

/// Hex md5 of the first mebibyte of the file.
pub fn hash_prefix(path: &Path) -> io::Result<String> {
    let mut head = File::open(path)?.take(HASH_PREFIX_BYTES);
    let mut context = md5::Context::new();
    io::copy(&mut head, &mut context)?;
    Ok(format!("{:x}", context.compute()))
}

fn file_type(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

/// Walk `root` and return how many regular files were seen along with the
/// ones worth cataloguing.
pub fn walk(root: &Path, rules: &DiscoveryRules) -> (usize, Vec<MediaFile>) {
    let mut seen = 0;
    let mut found = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(root = %root.display(), error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        seen += 1;

        let path = entry.path();
        if !rules.accepts_extension(path) {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().to_string();
        if rules.is_ignored(&filename) {
            debug!(path = %path.display(), "ignored by pattern");
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not stat file");
                continue;
            }
        };
        let modified = match metadata.modified() {
            // Postgres keeps microseconds; truncating keeps reruns stable.
            Ok(modified) => DateTime::<Utc>::from(modified).trunc_subsecs(6),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "no modification time");
                continue;
            }
        };

        found.push(MediaFile {
            path: path.to_string_lossy().to_string(),
            filename,
            file_type: file_type(path).unwrap_or_default(),
            size: i64::try_from(metadata.len()).unwrap_or(i64::MAX),
            modified,
        });
    }

    (seen, found)
}

/// The `files` table as seen by discovery.
#[async_trait]
pub trait FileCatalog: Send + Sync {
    async fn known_file(&self, path: &str) -> Result<Option<KnownFile>, ScanError>;

    /// Insert or refresh the row for `file`, marking it queued. Returns its id.
    async fn upsert_discovered(&self, file: &MediaFile, hash: &str) -> Result<i64, ScanError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub files_seen: usize,
    pub queued: usize,
}

/// Walks media roots and feeds new or changed files to the scan queue.
pub struct Discovery {
    catalog: Arc<dyn FileCatalog>,
    queue: Arc<dyn JobQueue>,
    roots: Vec<PathBuf>,
    rules: DiscoveryRules,
}

impl Discovery {
    pub fn new(
        catalog: Arc<dyn FileCatalog>,
        queue: Arc<dyn JobQueue>,
        roots: Vec<PathBuf>,
        rules: DiscoveryRules,
    ) -> Self {
        Self {
            catalog,
            queue,
            roots,
            rules,
        }
    }

    pub async fn scan_once(&self) -> DiscoveryStats {
        let started = Instant::now();
        let mut stats = DiscoveryStats::default();

        for root in &self.roots {
            if !root.exists() {
                warn!(root = %root.display(), "media path does not exist");
                continue;
            }

            let walk_root = root.clone();
            let rules = self.rules.clone();
            let (seen, files) =
                match tokio::task::spawn_blocking(move || walk(&walk_root, &rules)).await {
                    Ok(walked) => walked,
                    Err(err) => {
                        warn!(root = %root.display(), error = %err, "directory walk aborted");
                        continue;
                    }
                };
            stats.files_seen += seen;

            for file in files {
                match self.enqueue_if_changed(&file).await {
                    Ok(true) => stats.queued += 1,
                    Ok(false) => {}
                    Err(err) => warn!(path = %file.path, error = %err, "could not queue file"),
                }
            }
        }

        info!(
            files_seen = stats.files_seen,
            queued = stats.queued,
            elapsed_ms = elapsed_ms(started),
            "directory scan completed"
        );
        stats
    }

    async fn enqueue_if_changed(&self, file: &MediaFile) -> Result<bool, ScanError> {
        let known = self.catalog.known_file(&file.path).await?;
        if !needs_scan(known.as_ref(), file.modified) {
            debug!(path = %file.path, "unchanged since last scan");
            return Ok(false);
        }

        let path = PathBuf::from(&file.path);
        let hash = match tokio::task::spawn_blocking(move || hash_prefix(&path)).await {
            Ok(Ok(hash)) => hash,
            Ok(Err(err)) => {
                warn!(path = %file.path, error = %err, "could not hash file");
                String::new()
            }
            Err(err) => {
                warn!(path = %file.path, error = %err, "hashing aborted");
                String::new()
            }
        };

        let id = self.catalog.upsert_discovered(file, &hash).await?;
        let job = ScanJob {
            id: format!("file_{id}"),
            file_path: file.path.clone(),
            file_type: Some(file.file_type.clone()),
            priority: 1,
            created_at: Some(Utc::now()),
        };
        self.queue.push(&job).await?;
        debug!(job_id = %job.id, path = %file.path, "queued discovered file");
        Ok(true)
    }

    /// Scan immediately, then again every `interval`, until `cancel` fires.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        info!(roots = self.roots.len(), "discovery started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.scan_once().await;
                }
            }
        }

        info!("discovery stopped");
    }
}
