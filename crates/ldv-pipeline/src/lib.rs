//! Merge pipeline orchestration: scan input drops, normalize, compare
//! against the previous version, rotate, write, back up, clean up.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ldv_core::{ColumnSchema, MergedDataset, TextEncoding};
use ldv_ingest::normalize_file;
use ldv_vault::{dataset_hash, hash_version_file, VersionVault};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ldv-pipeline";

pub const DEFAULT_GLOB_PATTERN: &str = "*.csv";
pub const DEFAULT_CHUNK_SIZE: usize = 200_000;
pub const DEFAULT_VERSION_PREFIX: &str = "leads";

/// One merge target: explicit input/output/backup locations plus knobs.
/// All paths are supplied by the caller; the pipeline never discovers
/// directories on its own.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub pattern: String,
    pub chunk_size: usize,
    pub version_prefix: String,
    pub overwrite_existing: bool,
    pub schema: ColumnSchema,
}

impl MergeConfig {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            backup_dir: None,
            pattern: DEFAULT_GLOB_PATTERN.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            version_prefix: DEFAULT_VERSION_PREFIX.to_string(),
            overwrite_existing: false,
            schema: ColumnSchema::default(),
        }
    }

    pub fn from_env() -> Self {
        let mut config = Self::new(
            std::env::var("LDV_INPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./input")),
            std::env::var("LDV_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./output")),
        );
        config.backup_dir = std::env::var("LDV_BACKUP_DIR").ok().map(PathBuf::from);
        if let Ok(pattern) = std::env::var("LDV_GLOB_PATTERN") {
            config.pattern = pattern;
        }
        config.chunk_size = std::env::var("LDV_CHUNK_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        if let Ok(prefix) = std::env::var("LDV_VERSION_PREFIX") {
            config.version_prefix = prefix;
        }
        config.overwrite_existing = std::env::var("LDV_OVERWRITE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ColumnRegistry {
    columns: Vec<String>,
}

/// Load the expected-column registry from a YAML file (`columns: [...]`).
pub fn load_column_registry(path: &Path) -> Result<ColumnSchema> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let registry: ColumnRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(ColumnSchema::new(registry.columns))
}

/// How a discovered input file fared during normalization.
#[derive(Debug, Clone, Serialize)]
pub struct FileDisposition {
    pub file_name: String,
    pub status: FileStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileStatus {
    Merged { rows: usize, encoding: TextEncoding },
    Skipped { reason: String },
}

/// Terminal outcome of a run that completed without a fatal failure.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Nothing discovered, or nothing normalized. No side effects.
    NoInput,
    /// Content identical to the previous version; inputs consumed, nothing
    /// written.
    Unchanged { version: PathBuf },
    /// A new version was written (and backed up when configured).
    Written {
        version: PathBuf,
        backup: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: MergeOutcome,
    pub total_rows: usize,
    pub files: Vec<FileDisposition>,
}

pub struct MergePipeline {
    config: MergeConfig,
    vault: VersionVault,
}

impl MergePipeline {
    pub fn new(config: MergeConfig) -> Self {
        let vault = VersionVault::new(
            config.output_dir.clone(),
            config.backup_dir.clone(),
            config.version_prefix.clone(),
        );
        Self { config, vault }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// One full merge run. Returns `Err` only on a fatal failure (the new
    /// version could not be written); in that case no input file has been
    /// deleted and re-invoking the pipeline retries from the same inputs.
    pub fn run_once(&self) -> Result<MergeSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let config = &self.config;

        info!(
            run_id = %run_id,
            input = %config.input_dir.display(),
            output = %config.output_dir.display(),
            "starting merge run"
        );
        match &config.backup_dir {
            Some(dir) => info!(backup = %dir.display(), "backup directory configured"),
            None => info!("no backup directory configured; retired versions will be deleted"),
        }

        fs::create_dir_all(&config.input_dir)
            .with_context(|| format!("creating input directory {}", config.input_dir.display()))?;
        fs::create_dir_all(&config.output_dir).with_context(|| {
            format!("creating output directory {}", config.output_dir.display())
        })?;

        let files = self.scan_input_files()?;
        if files.is_empty() {
            info!(pattern = %config.pattern, "no input files found; nothing to do");
            return Ok(self.summary(run_id, started_at, Vec::new(), 0, MergeOutcome::NoInput));
        }

        let mut dataset = MergedDataset::default();
        let mut processed: Vec<PathBuf> = Vec::new();
        let mut dispositions: Vec<FileDisposition> = Vec::new();
        for file in &files {
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match normalize_file(file, &config.schema, config.chunk_size) {
                Ok(normalized) => {
                    info!(
                        file = %file_name,
                        encoding = %normalized.encoding,
                        rows = normalized.records.len(),
                        "normalized input file"
                    );
                    dispositions.push(FileDisposition {
                        file_name,
                        status: FileStatus::Merged {
                            rows: normalized.records.len(),
                            encoding: normalized.encoding,
                        },
                    });
                    dataset.extend(normalized.records);
                    processed.push(file.clone());
                }
                Err(err) => {
                    warn!(file = %file_name, error = %err, "skipping input file");
                    dispositions.push(FileDisposition {
                        file_name,
                        status: FileStatus::Skipped {
                            reason: err.to_string(),
                        },
                    });
                }
            }
        }

        if processed.is_empty() {
            info!("no input files normalized; nothing to do");
            return Ok(self.summary(run_id, started_at, dispositions, 0, MergeOutcome::NoInput));
        }

        let total_rows = dataset.len();
        let new_hash = dataset_hash(&dataset, &config.schema).context("hashing merged dataset")?;

        if !config.overwrite_existing {
            if let Some(previous) = self.vault.find_latest_version() {
                match hash_version_file(&previous, &config.schema) {
                    Ok(previous_hash) => {
                        info!(
                            new = %new_hash,
                            previous = %previous_hash,
                            artifact = %previous.display(),
                            "comparing against previous version"
                        );
                        if new_hash == previous_hash {
                            info!("content identical to previous version; not writing a new artifact");
                            self.delete_processed_inputs(&processed);
                            return Ok(self.summary(
                                run_id,
                                started_at,
                                dispositions,
                                total_rows,
                                MergeOutcome::Unchanged { version: previous },
                            ));
                        }
                        info!("content differs; live version will be replaced");
                    }
                    Err(err) => {
                        warn!(
                            artifact = %previous.display(),
                            error = %format!("{err:#}"),
                            "could not compare against previous version; proceeding as different"
                        );
                    }
                }
            }
        }

        self.vault.rotate_live_versions(Utc::now());
        let version = self
            .vault
            .write_version(&dataset, &config.schema, Utc::now())
            .context("writing new version")?;
        info!(rows = total_rows, version = %version.display(), "wrote new version");

        let backup = self.vault.copy_to_backup(&version, Utc::now());
        self.delete_processed_inputs(&processed);

        Ok(self.summary(
            run_id,
            started_at,
            dispositions,
            total_rows,
            MergeOutcome::Written {
                version,
                backup: backup.map(|entry| entry.path),
            },
        ))
    }

    fn scan_input_files(&self) -> Result<Vec<PathBuf>> {
        let pattern = self.config.input_dir.join(&self.config.pattern);
        let pattern = pattern.to_string_lossy().into_owned();
        let mut files: Vec<PathBuf> = glob::glob(&pattern)
            .with_context(|| format!("invalid glob pattern {pattern}"))?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        Ok(files)
    }

    fn delete_processed_inputs(&self, processed: &[PathBuf]) {
        for file in processed {
            match fs::remove_file(file) {
                Ok(()) => info!(file = %file.display(), "deleted processed input file"),
                Err(err) => {
                    warn!(file = %file.display(), error = %err, "failed to delete processed input file");
                }
            }
        }
    }

    fn summary(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        files: Vec<FileDisposition>,
        total_rows: usize,
        outcome: MergeOutcome,
    ) -> MergeSummary {
        MergeSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome,
            total_rows,
            files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    #[test]
    fn config_defaults_match_conventions() {
        let config = MergeConfig::new("/in", "/out");
        assert_eq!(config.pattern, "*.csv");
        assert_eq!(config.chunk_size, 200_000);
        assert_eq!(config.version_prefix, "leads");
        assert!(config.backup_dir.is_none());
        assert!(!config.overwrite_existing);
    }

    #[test]
    fn column_registry_loads_from_yaml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("schema.yaml");
        let mut f = fs::File::create(&path).expect("create schema.yaml");
        f.write_all(b"columns:\n  - name\n  - email\n").expect("write schema.yaml");

        let schema = load_column_registry(&path).expect("load registry");
        assert_eq!(schema.expected().to_vec(), vec!["name".to_string(), "email".to_string()]);
    }

    #[test]
    fn column_registry_rejects_malformed_yaml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("schema.yaml");
        fs::write(&path, "not: a registry").expect("write schema.yaml");
        assert!(load_column_registry(&path).is_err());
    }
}
