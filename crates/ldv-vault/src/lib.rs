//! Version artifact vault: canonical serialization + content hashing,
//! latest-version lookup, rotation into backup storage, dedup-checked
//! backup copies.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, Terminator, WriterBuilder};
use ldv_core::{ColumnSchema, MergedDataset, Record};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ldv-vault";

const HASH_CHUNK_SIZE: usize = 8192;
const VERSION_EXTENSION: &str = "csv";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a file already on disk in chunked reads. Used for raw-file dedup;
/// the same algorithm hashes canonical dataset bytes, so backup dedup and
/// version dedup share one notion of "identical".
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("opening {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("reading {} for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Byte-stable serialization of a dataset: fixed column order, re-trimmed
/// values, rows stable-sorted by the full column tuple, `,` delimiter and
/// `\n` terminator. Depends on nothing but its input; two datasets holding
/// the same multiset of records serialize identically regardless of input
/// order.
pub fn canonical_bytes(dataset: &MergedDataset, schema: &ColumnSchema) -> Result<Vec<u8>> {
    let columns = schema.output_columns();
    let mut rows: Vec<Vec<String>> = dataset
        .records
        .iter()
        .map(|record| {
            let mut values: Vec<String> = record
                .values
                .iter()
                .map(|v| v.trim().to_string())
                .collect();
            values.resize(columns.len(), String::new());
            values
        })
        .collect();
    rows.sort();

    let mut writer = WriterBuilder::new()
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer
        .write_record(&columns)
        .context("writing canonical header")?;
    for row in &rows {
        writer.write_record(row).context("writing canonical row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing canonical serialization: {err}"))
}

/// Identity hash of a dataset: SHA-256 over its canonical bytes.
pub fn dataset_hash(dataset: &MergedDataset, schema: &ColumnSchema) -> Result<String> {
    Ok(sha256_hex(&canonical_bytes(dataset, schema)?))
}

/// Parse a stored version back into records reindexed to the output schema,
/// so an existing artifact canonicalizes exactly like a fresh dataset.
pub fn load_version(path: &Path, schema: &ColumnSchema) -> Result<MergedDataset> {
    let bytes = fs::read(path).with_context(|| format!("reading version {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let mut reader = ReaderBuilder::new().flexible(true).from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .with_context(|| format!("parsing version header in {}", path.display()))?
        .clone();
    let columns = schema.output_columns();
    let header_index: Vec<Option<usize>> = columns
        .iter()
        .map(|column| headers.iter().position(|h| h.trim() == column.as_str()))
        .collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.with_context(|| format!("parsing version row in {}", path.display()))?;
        let values = header_index
            .iter()
            .copied()
            .map(|index| {
                index
                    .and_then(|i| row.get(i))
                    .map(|v| v.trim().to_string())
                    .unwrap_or_default()
            })
            .collect();
        records.push(Record::new(values));
    }
    Ok(MergedDataset { records })
}

/// Canonical hash of a version artifact already on disk.
pub fn hash_version_file(path: &Path, schema: &ColumnSchema) -> Result<String> {
    let dataset = load_version(path, schema)?;
    dataset_hash(&dataset, schema)
}

/// A backup copy of a retired or freshly written version.
#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub deduplicated: bool,
}

/// Live + backup storage for timestamped version artifacts of one target.
#[derive(Debug, Clone)]
pub struct VersionVault {
    live_dir: PathBuf,
    backup_dir: Option<PathBuf>,
    prefix: String,
}

impl VersionVault {
    pub fn new(
        live_dir: impl Into<PathBuf>,
        backup_dir: Option<PathBuf>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            live_dir: live_dir.into(),
            backup_dir,
            prefix: prefix.into(),
        }
    }

    pub fn live_dir(&self) -> &Path {
        &self.live_dir
    }

    pub fn backup_dir(&self) -> Option<&Path> {
        self.backup_dir.as_deref()
    }

    fn version_file_name(&self, at: DateTime<Utc>) -> String {
        format!(
            "{}_{}.{}",
            self.prefix,
            at.format("%Y%m%d_%H%M%S"),
            VERSION_EXTENSION
        )
    }

    fn is_version_name(&self, name: &str) -> bool {
        name.starts_with(&format!("{}_", self.prefix))
            && name.ends_with(&format!(".{VERSION_EXTENSION}"))
    }

    /// Locate the current live version: newest matching artifact by
    /// filesystem mtime in the live directory, falling back to the backup
    /// directory. `None` is the valid first-run state.
    pub fn find_latest_version(&self) -> Option<PathBuf> {
        self.latest_in(&self.live_dir)
            .or_else(|| self.backup_dir.as_deref().and_then(|dir| self.latest_in(dir)))
    }

    fn latest_in(&self, dir: &Path) -> Option<PathBuf> {
        let entries = fs::read_dir(dir).ok()?;
        let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .filter(|entry| self.is_version_name(&entry.file_name().to_string_lossy()))
            .filter_map(|entry| {
                let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
                Some((modified, entry.path()))
            })
            .collect();
        candidates.sort();
        candidates.pop().map(|(_, path)| path)
    }

    /// Persist a new timestamped version: header + rows in discovery order
    /// (canonical order exists only for hashing), written to a temp file and
    /// atomically renamed into place.
    pub fn write_version(
        &self,
        dataset: &MergedDataset,
        schema: &ColumnSchema,
        at: DateTime<Utc>,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.live_dir)
            .with_context(|| format!("creating output directory {}", self.live_dir.display()))?;
        let path = self.live_dir.join(self.version_file_name(at));

        let columns = schema.output_columns();
        let mut writer = WriterBuilder::new()
            .terminator(Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record(&columns)
            .context("writing version header")?;
        for record in &dataset.records {
            let mut row = record.values.clone();
            row.resize(columns.len(), String::new());
            writer.write_record(&row).context("writing version row")?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flushing version serialization: {err}"))?;

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = self.live_dir.join(temp_name);
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| format!("opening temp version file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("writing temp version file {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("flushing temp version file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path) {
            Ok(()) => Ok(path),
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                Err(err).with_context(|| {
                    format!(
                        "renaming temp version {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }

    /// Retire every matching live artifact before a new version is written.
    /// Per-artifact failures are logged and never abort the caller: a missed
    /// rotation degrades to two live artifacts, which beats blocking
    /// ingestion.
    pub fn rotate_live_versions(&self, now: DateTime<Utc>) {
        let Ok(entries) = fs::read_dir(&self.live_dir) else {
            return;
        };
        let mut live: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.file_name()
                    .map(|name| self.is_version_name(&name.to_string_lossy()))
                    .unwrap_or(false)
            })
            .collect();
        live.sort();

        for path in live {
            if let Err(err) = self.rotate_one(&path, now) {
                warn!(
                    artifact = %path.display(),
                    error = %format!("{err:#}"),
                    "rotation failed; continuing"
                );
            }
        }
    }

    fn rotate_one(&self, live: &Path, now: DateTime<Utc>) -> Result<()> {
        let Some(backup_dir) = self.backup_dir.as_deref() else {
            fs::remove_file(live).with_context(|| format!("deleting {}", live.display()))?;
            info!(artifact = %live.display(), "no backup configured; deleted live version");
            return Ok(());
        };

        fs::create_dir_all(backup_dir)
            .with_context(|| format!("creating backup directory {}", backup_dir.display()))?;
        let name = live
            .file_name()
            .with_context(|| format!("no file name in {}", live.display()))?;
        let mut dest = backup_dir.join(name);
        if dest.exists() {
            match (hash_file(live), hash_file(&dest)) {
                (Ok(live_hash), Ok(dest_hash)) if live_hash == dest_hash => {
                    fs::remove_file(live)
                        .with_context(|| format!("deleting {}", live.display()))?;
                    info!(
                        artifact = %live.display(),
                        "identical content already in backup; deleted live version"
                    );
                    return Ok(());
                }
                (Err(err), _) | (_, Err(err)) => {
                    warn!(
                        error = %format!("{err:#}"),
                        "hash comparison failed before rotation; keeping both copies"
                    );
                }
                _ => {}
            }
            dest = backup_dir.join(suffixed_name(&name.to_string_lossy(), now));
        }
        move_file(live, &dest)?;
        info!(from = %live.display(), to = %dest.display(), "rotated live version into backup");
        Ok(())
    }

    /// Copy a freshly written version into backup, deduplicating by content
    /// hash. Returns `None` when no backup is configured or the copy failed;
    /// backup failure never fails the run.
    pub fn copy_to_backup(&self, version: &Path, now: DateTime<Utc>) -> Option<BackupEntry> {
        let backup_dir = self.backup_dir.as_deref()?;
        match copy_with_dedup(version, backup_dir, now) {
            Ok(entry) => {
                if entry.deduplicated {
                    info!(entry = %entry.path.display(), "identical backup entry exists; not copying");
                } else {
                    info!(from = %version.display(), to = %entry.path.display(), "copied version into backup");
                }
                Some(entry)
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "backup copy failed");
                None
            }
        }
    }
}

fn copy_with_dedup(version: &Path, backup_dir: &Path, at: DateTime<Utc>) -> Result<BackupEntry> {
    fs::create_dir_all(backup_dir)
        .with_context(|| format!("creating backup directory {}", backup_dir.display()))?;
    let name = version
        .file_name()
        .with_context(|| format!("no file name in {}", version.display()))?;
    let mut dest = backup_dir.join(name);
    if dest.exists() {
        match (hash_file(version), hash_file(&dest)) {
            (Ok(version_hash), Ok(dest_hash)) if version_hash == dest_hash => {
                return Ok(BackupEntry {
                    path: dest,
                    deduplicated: true,
                });
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(
                    error = %format!("{err:#}"),
                    "hash comparison failed before backup copy; copying under a new name"
                );
            }
            _ => {}
        }
        dest = backup_dir.join(suffixed_name(&name.to_string_lossy(), at));
    }
    fs::copy(version, &dest)
        .with_context(|| format!("copying {} -> {}", version.display(), dest.display()))?;
    Ok(BackupEntry {
        path: dest,
        deduplicated: false,
    })
}

fn suffixed_name(name: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y%m%d%H%M%S");
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}_{stamp}.{ext}"),
        None => format!("{name}_{stamp}"),
    }
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // rename fails across filesystems; fall back to copy + delete
    fs::copy(from, to).with_context(|| format!("copying {} -> {}", from.display(), to.display()))?;
    fs::remove_file(from).with_context(|| format!("removing {} after copy", from.display()))?;
    Ok(())
}
