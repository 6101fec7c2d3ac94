//! Append-only JSONL audit log with size-based rotation.
//!
//! `audit.jsonl` is the active file; backups are `audit.jsonl.1` (newest) up to
//! `audit.jsonl.{max_files - 1}`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const AUDIT_LOG_MAX_BYTES_ENV: &str = "XPOST_AUDIT_LOG_MAX_BYTES";
pub const AUDIT_LOG_MAX_FILES_ENV: &str = "XPOST_AUDIT_LOG_MAX_FILES";

const DEFAULT_AUDIT_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_AUDIT_LOG_MAX_FILES: usize = 5;

/// Rotation limits. `max_files` counts the active file plus its backups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditLogRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for AuditLogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_AUDIT_LOG_MAX_BYTES,
            max_files: DEFAULT_AUDIT_LOG_MAX_FILES,
        }
    }
}

impl AuditLogRotationPolicy {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves limits through `lookup`; unset, unparsable or zero values keep the default.
    pub fn from_lookup<L>(lookup: L) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            max_bytes: positive(&lookup, AUDIT_LOG_MAX_BYTES_ENV).unwrap_or(defaults.max_bytes),
            max_files: positive(&lookup, AUDIT_LOG_MAX_FILES_ENV).unwrap_or(defaults.max_files),
        }
    }
}

fn positive<L, T>(lookup: &L, key: &str) -> Option<T>
where
    L: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialEq + Default,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|value| *value != T::default())
}

/// Path of the `index`-th backup; `1` is the most recently rotated.
pub fn rotated_audit_log_path(path: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), index))
}

/// Holds the active audit file open and rotates it once a record would push it
/// past `max_bytes`. A single record larger than the limit is still written whole.
#[derive(Debug)]
pub struct AuditLogWriter {
    path: PathBuf,
    policy: AuditLogRotationPolicy,
    file: Option<File>,
    size: u64,
}

impl AuditLogWriter {
    pub fn open(path: impl Into<PathBuf>, policy: AuditLogRotationPolicy) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let file = open_append(&path)?;
        let size = file
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        Ok(Self {
            path,
            policy,
            file: Some(file),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in the active file, including records written by earlier processes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn append(&mut self, line: &str) -> Result<()> {
        let incoming = u64::try_from(line.len())
            .unwrap_or(u64::MAX)
            .saturating_add(1);
        if self.size > 0 && self.size.saturating_add(incoming) > self.policy.max_bytes {
            self.rotate()?;
        }

        let file = match self.file.take() {
            Some(file) => file,
            None => open_append(&self.path)?,
        };
        let file = self.file.insert(file);
        writeln!(file, "{line}")
            .and_then(|()| file.flush())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        self.size = self.size.saturating_add(incoming);
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        // Close the handle first; renaming an open file fails on some platforms.
        self.file = None;
        let backups = self.policy.max_files.saturating_sub(1);
        if backups == 0 {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("failed to truncate {}", self.path.display()))?;
        } else {
            let oldest = rotated_audit_log_path(&self.path, backups);
            if oldest.exists() {
                std::fs::remove_file(&oldest)
                    .with_context(|| format!("failed to drop {}", oldest.display()))?;
            }
            for index in (1..backups).rev() {
                let newer = rotated_audit_log_path(&self.path, index);
                if newer.exists() {
                    let older = rotated_audit_log_path(&self.path, index + 1);
                    std::fs::rename(&newer, &older).with_context(|| {
                        format!("failed to shift {} to {}", newer.display(), older.display())
                    })?;
                }
            }
            let first = rotated_audit_log_path(&self.path, 1);
            std::fs::rename(&self.path, &first)
                .with_context(|| format!("failed to rotate {}", self.path.display()))?;
        }
        self.size = 0;
        self.file = Some(open_append(&self.path)?);
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}
