use std::{
    collections::HashSet,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::{
    config::{BackupStrategy, Config},
    crypto::Cipher,
    errors::Error,
    ports::{ObjectStore, StateStore},
    snapshot, Result,
};

pub const ARCHIVE_SUFFIX: &str = ".enc";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const TIMESTAMP_LEN: usize = 19;
const COMPRESSION_LEVEL: u32 = 6;

/// Outcome of one successful backup run.
#[derive(Clone, Debug)]
pub struct BackupReport {
    pub strategy: String,
    pub archive_path: PathBuf,
    pub record_count: usize,
    /// SHA-256 of the finished archive bytes.
    pub checksum: String,
    /// False when remote storage is unconfigured or the upload failed; the
    /// run is successful either way.
    pub uploaded: bool,
    /// Non-fatal retention issues.
    pub warnings: Vec<String>,
}

/// Orchestrates one archive run: snapshot, compress, encrypt, atomically
/// place the file, enforce retention, best-effort upload.
///
/// At most one run per strategy is in flight at a time; a second concurrent
/// run for the same strategy is refused rather than queued.
pub struct BackupService {
    cfg: Arc<Config>,
    cipher: Arc<Cipher>,
    store: Arc<dyn StateStore>,
    remote: Option<Arc<dyn ObjectStore>>,
    in_flight: std::sync::Mutex<HashSet<String>>,
}

impl BackupService {
    pub fn new(cfg: Arc<Config>, cipher: Arc<Cipher>, store: Arc<dyn StateStore>) -> Self {
        Self {
            cfg,
            cipher,
            store,
            remote: None,
            in_flight: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn ObjectStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub async fn run(&self, strategy_name: &str) -> Result<BackupReport> {
        let strategy = self
            .cfg
            .strategy(strategy_name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown backup strategy: {strategy_name}")))?;

        if !self.claim(&strategy.name) {
            return Err(Error::Backup(format!(
                "{} backup already in flight",
                strategy.name
            )));
        }

        let result = self.run_claimed(&strategy).await;
        self.release(&strategy.name);

        match &result {
            Ok(report) => info!(
                strategy = %report.strategy,
                archive = %report.archive_path.display(),
                records = report.record_count,
                uploaded = report.uploaded,
                "backup completed"
            ),
            Err(e) => error!(strategy = %strategy.name, error = %e, "backup run failed"),
        }

        result
    }

    async fn run_claimed(&self, strategy: &BackupStrategy) -> Result<BackupReport> {
        let doc = snapshot::produce(self.store.as_ref(), strategy).await?;
        let record_count = doc.record_count();
        debug!(
            strategy = %strategy.name,
            collections = doc.collections.len(),
            records = record_count,
            "snapshot produced"
        );

        let payload = serde_json::to_vec(&doc)
            .map_err(|e| Error::Backup(format!("serialize snapshot: {e}")))?;

        fs::create_dir_all(&self.cfg.backup_dir)
            .map_err(|e| Error::Backup(format!("create archive directory: {e}")))?;

        let file_name = unique_archive_name(&self.cfg.backup_dir, &strategy.name, Utc::now());
        let dest = self.cfg.backup_dir.join(&file_name);
        let tmp = self.cfg.backup_dir.join(format!("{file_name}.tmp"));

        // Compress-then-encrypt is synchronous CPU work; keep it off the
        // runtime threads so session operations stay responsive.
        let cipher = self.cipher.clone();
        let (sealed, checksum) = tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, String)> {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
            encoder
                .write_all(&payload)
                .map_err(|e| Error::Backup(format!("compress snapshot: {e}")))?;
            let compressed = encoder
                .finish()
                .map_err(|e| Error::Backup(format!("compress snapshot: {e}")))?;

            let sealed = cipher
                .seal(&compressed)
                .map_err(|e| Error::Backup(format!("encrypt archive: {e}")))?;

            let mut hasher = Sha256::new();
            hasher.update(&sealed);
            Ok((sealed, format!("{:x}", hasher.finalize())))
        })
        .await
        .map_err(|e| Error::Backup(format!("archive worker failed: {e}")))??;

        write_archive(&tmp, &dest, &sealed)?;

        let warnings = enforce_retention(
            &self.cfg.backup_dir,
            &strategy.name,
            self.cfg.max_local_archives,
        );
        for w in &warnings {
            warn!(strategy = %strategy.name, "{w}");
        }

        let uploaded = self.upload(&strategy.name, &file_name, &dest).await;

        Ok(BackupReport {
            strategy: strategy.name.clone(),
            archive_path: dest,
            record_count,
            checksum,
            uploaded,
            warnings,
        })
    }

    async fn upload(&self, strategy: &str, file_name: &str, path: &Path) -> bool {
        let Some(remote) = &self.remote else {
            debug!(strategy, "remote storage not configured, skipping upload");
            return false;
        };

        let prefix = self
            .cfg
            .remote
            .as_ref()
            .map(|r| r.key_prefix.as_str())
            .unwrap_or("backups");
        let key = remote_key(prefix, strategy, file_name);

        match tokio::time::timeout(self.cfg.upload_timeout, remote.put_file(&key, path)).await {
            Ok(Ok(())) => {
                info!(strategy, key = %key, "archive uploaded");
                true
            }
            Ok(Err(e)) => {
                warn!(strategy, key = %key, error = %e, "archive upload failed");
                false
            }
            Err(_) => {
                warn!(strategy, key = %key, "archive upload timed out");
                false
            }
        }
    }

    fn claim(&self, strategy: &str) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight set poisoned")
            .insert(strategy.to_string())
    }

    fn release(&self, strategy: &str) {
        self.in_flight
            .lock()
            .expect("in-flight set poisoned")
            .remove(strategy);
    }
}

/// Deterministic remote object key, so re-uploading the same archive is an
/// idempotent overwrite.
pub fn remote_key(prefix: &str, strategy: &str, file_name: &str) -> String {
    format!("{}/{}/{}", prefix.trim_end_matches('/'), strategy, file_name)
}

/// Write `bytes` to `tmp`, flush + sync, then atomically rename to `dest`.
/// On any failure the temp file is removed; a half-finished run never
/// appears under a candidate archive name.
fn write_archive(tmp: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    let res = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(tmp, dest)
    })();

    if let Err(e) = res {
        let _ = fs::remove_file(tmp);
        return Err(Error::Backup(format!(
            "write archive {}: {e}",
            dest.display()
        )));
    }
    Ok(())
}

fn unique_archive_name(dir: &Path, strategy: &str, now: DateTime<Utc>) -> String {
    let stem = format!("{}_{}", strategy, now.format(TIMESTAMP_FORMAT));

    let candidate = format!("{stem}{ARCHIVE_SUFFIX}");
    if !dir.join(&candidate).exists() {
        return candidate;
    }

    // Same-second collision: disambiguate instead of overwriting.
    let mut seq = 2u32;
    loop {
        let candidate = format!("{stem}-{seq}{ARCHIVE_SUFFIX}");
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        seq += 1;
    }
}

/// Extract the creation marker embedded in an archive file name:
/// the timestamp plus the same-second sequence number (1 when absent).
/// Returns `None` for anything that is not a finalized archive of
/// `strategy` (temp files, other strategies, foreign files).
fn parse_archive_marker(file_name: &str, strategy: &str) -> Option<(NaiveDateTime, u32)> {
    let stem = file_name.strip_suffix(ARCHIVE_SUFFIX)?;
    let rest = stem.strip_prefix(strategy)?.strip_prefix('_')?;

    let ts = NaiveDateTime::parse_from_str(rest.get(..TIMESTAMP_LEN)?, TIMESTAMP_FORMAT).ok()?;
    let seq = match &rest[TIMESTAMP_LEN..] {
        "" => 1,
        tail => tail.strip_prefix('-')?.parse().ok()?,
    };
    Some((ts, seq))
}

/// Delete the oldest finalized archives of `strategy` beyond `max_count`,
/// ordered by the timestamp embedded in the file name (never mtime, which
/// copy/restore operations can alter). Deletion is best-effort per file;
/// failures come back as warnings and never abort the pass.
pub fn enforce_retention(dir: &Path, strategy: &str, max_count: usize) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) => return vec![format!("cannot list archive directory {}: {e}", dir.display())],
    };

    let mut archives = Vec::new();
    for ent in entries.flatten() {
        let name = ent.file_name().to_string_lossy().to_string();
        let Some(marker) = parse_archive_marker(&name, strategy) else {
            continue;
        };
        archives.push((marker, name, ent.path()));
    }

    // Newest first; everything past max_count goes.
    archives.sort_by(|a, b| b.0.cmp(&a.0));

    let mut warnings = Vec::new();
    for (_, name, path) in archives.iter().skip(max_count) {
        match fs::remove_file(path) {
            Ok(()) => debug!(archive = %name, "deleted expired archive"),
            Err(e) => warnings.push(format!("failed to delete expired archive {name}: {e}")),
        }
    }
    warnings
}
