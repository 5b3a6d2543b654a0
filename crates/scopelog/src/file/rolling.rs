// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rotating log file with retention and fork/restore support.
//!
//! ```text
//! {base}/
//!   2024_05/
//!     2024_05_17-0930.log            general output
//!     2024_05_17-0930 (1).log        rotated general output
//!     17/
//!       4f2a - Import_Succeeded.log  restored fork
//! ```

use crate::file::format::sanitize_file_name;
use chrono::{DateTime, Local, NaiveDate};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

const EXTENSION: &str = "log";

#[derive(Debug, Clone, Copy)]
pub struct RollingOptions {
    /// Size in bytes after which the next write goes to a new file. Zero
    /// disables size based rotation.
    pub max_file_size: u64,
    /// Maximum number of `*.log` files kept under the base directory. Zero
    /// keeps everything.
    pub retain_file_count: usize,
}

#[derive(Debug)]
struct ActiveFile {
    path: PathBuf,
    written: u64,
    created_on: NaiveDate,
}

impl ActiveFile {
    fn open(path: PathBuf, created_on: NaiveDate) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            written,
            created_on,
        })
    }

    fn needs_rotation(&self, options: RollingOptions, today: NaiveDate) -> bool {
        let oversized = options.max_file_size > 0 && self.written > options.max_file_size;
        oversized || self.created_on < today
    }

    fn append(&mut self, text: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(text.as_bytes())?;
        self.written += text.len() as u64;
        Ok(())
    }
}

/// An open fork. `parts` lists every file it has written, oldest first.
#[derive(Debug)]
struct Fork {
    current: ActiveFile,
    parts: Vec<PathBuf>,
}

/// The general output file of one directory plus any number of named forks.
pub struct LogFile {
    base: PathBuf,
    options: RollingOptions,
    clock: Clock,
    current: ActiveFile,
    forks: BTreeMap<String, Fork>,
}

impl LogFile {
    pub fn open(base: impl Into<PathBuf>, options: RollingOptions) -> io::Result<Self> {
        Self::with_clock(base, options, Arc::new(Local::now))
    }

    pub fn with_clock(
        base: impl Into<PathBuf>,
        options: RollingOptions,
        clock: Clock,
    ) -> io::Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        let now = clock();
        let current = ActiveFile::open(general_path(&base, now), now.date_naive())?;
        let file = Self {
            base,
            options,
            clock,
            current,
            forks: BTreeMap::new(),
        };
        file.apply_retention();
        Ok(file)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of the general output file.
    pub fn path(&self) -> &Path {
        &self.current.path
    }

    pub fn is_forked(&self, name: &str) -> bool {
        self.forks.contains_key(&sanitize_file_name(name))
    }

    /// Path the fork named `name` currently writes to.
    pub fn fork_path(&self, name: &str) -> Option<&Path> {
        self.forks
            .get(&sanitize_file_name(name))
            .map(|fork| fork.current.path.as_path())
    }

    pub fn fork_names(&self) -> Vec<String> {
        self.forks.keys().cloned().collect()
    }

    /// Appends `text` to the general file, rotating first when needed.
    pub fn write(&mut self, text: &str) -> io::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let now = (self.clock)();
        if self.current.needs_rotation(self.options, now.date_naive()) {
            let path = general_path(&self.base, now);
            debug!("FILE_SINK | rotating to {}", path.display());
            self.current = ActiveFile::open(path, now.date_naive())?;
            self.apply_retention();
        }
        self.current.append(text)
    }

    /// Appends `text` to the open fork `name`. An oversized fork continues in
    /// `{name} (n).log`.
    pub fn write_fork(&mut self, name: &str, text: &str) -> io::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let name = sanitize_file_name(name);
        let now = (self.clock)();
        let Some(fork) = self.forks.get_mut(&name) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no open fork named {name}"),
            ));
        };

        let rotate = fork.current.needs_rotation(self.options, now.date_naive());
        if rotate {
            let path = continuation_path(&self.base, now, &name);
            debug!("FILE_SINK | rotating fork to {}", path.display());
            fork.current = ActiveFile::open(path, now.date_naive())?;
            fork.parts.push(fork.current.path.clone());
        }
        fork.current.append(text)?;
        if rotate {
            self.apply_retention();
        }
        Ok(())
    }

    /// Opens `{base}/{yyyy_MM}/{dd}/{name}.log` as the fork `name`. Forking to
    /// an open fork does nothing. Other forks stay open.
    pub fn fork_to(&mut self, name: &str) -> io::Result<()> {
        let name = sanitize_file_name(name);
        if self.forks.contains_key(&name) {
            return Ok(());
        }
        let now = (self.clock)();
        let current = ActiveFile::open(named_path(&self.base, now, &name), now.date_naive())?;
        debug!("FILE_SINK | forked output to {}", current.path.display());
        let parts = vec![current.path.clone()];
        self.forks.insert(name, Fork { current, parts });
        self.apply_retention();
        Ok(())
    }

    /// Closes the fork `name` and notes it in the general file.
    ///
    /// With a `state` every part of the fork is renamed to
    /// `{stem}_{state}.log`, adding ` (n)` when that name is taken. Returns the
    /// final path of the last part. The fork is closed even when a rename
    /// fails.
    pub fn restore(&mut self, name: &str, state: Option<&str>) -> io::Result<Option<PathBuf>> {
        let Some(fork) = self.forks.remove(&sanitize_file_name(name)) else {
            return Ok(None);
        };
        let final_path = match state.map(str::trim).filter(|s| !s.is_empty()) {
            Some(state) => rename_parts(&fork.parts, &sanitize_file_name(state))?,
            None => fork.current.path,
        };

        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!("FILE_SINK | restored output from {}", final_path.display());
        self.write(&format!("--- Restored from {file_name}\n"))?;
        Ok(Some(final_path))
    }

    fn is_active(&self, path: &Path) -> bool {
        path == self.current.path || self.forks.values().any(|fork| path == fork.current.path)
    }

    /// Deletes the oldest `*.log` files until the retain limit holds. Errors
    /// are ignored.
    fn apply_retention(&self) {
        let retain = self.options.retain_file_count;
        if retain == 0 {
            return;
        }

        let mut files = Vec::new();
        collect_logs(&self.base, &mut files);
        let active = 1 + self.forks.len();
        files.retain(|(path, _)| !self.is_active(path));
        let total = files.len() + active;
        if total <= retain {
            return;
        }

        files.sort();
        files.sort_by_key(|(_, created)| *created);
        for (path, _) in files.into_iter().take(total - retain) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("FILE_SINK | retention removed {}", path.display());
                    remove_empty_parents(&path, &self.base);
                }
                Err(e) => debug!(
                    "FILE_SINK | retention could not remove {}: {}",
                    path.display(),
                    e
                ),
            }
        }
    }
}

/// Renames each surviving part to `{stem}_{state}.log`. Every part is tried
/// and the first failure is reported.
fn rename_parts(parts: &[PathBuf], state: &str) -> io::Result<PathBuf> {
    let mut last = None;
    let mut failure = None;
    for part in parts.iter().filter(|p| p.exists()) {
        let stem = part
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = part.parent().unwrap_or_else(|| Path::new("."));
        let target = unique_path(dir, &format!("{stem}_{state}"));
        match fs::rename(part, &target) {
            Ok(()) => last = Some(target),
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    last.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "forked output no longer exists"))
}

fn general_path(base: &Path, now: DateTime<Local>) -> PathBuf {
    let dir = base.join(now.format("%Y_%m").to_string());
    unique_path(&dir, &now.format("%Y_%m_%d-%H%M").to_string())
}

fn named_dir(base: &Path, now: DateTime<Local>) -> PathBuf {
    base.join(now.format("%Y_%m").to_string())
        .join(now.format("%d").to_string())
}

fn named_path(base: &Path, now: DateTime<Local>, name: &str) -> PathBuf {
    named_dir(base, now).join(format!("{name}.{EXTENSION}"))
}

fn continuation_path(base: &Path, now: DateTime<Local>, name: &str) -> PathBuf {
    unique_path(&named_dir(base, now), name)
}

/// `{dir}/{stem}.log`, or the first free `{dir}/{stem} (n).log`.
fn unique_path(dir: &Path, stem: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.{EXTENSION}"));
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| dir.join(format!("{stem} ({n}).{EXTENSION}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

fn collect_logs(dir: &Path, out: &mut Vec<(PathBuf, SystemTime)>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            collect_logs(&path, out);
        } else if path.extension().is_some_and(|ext| ext == EXTENSION) {
            let created = metadata
                .created()
                .or_else(|_| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((path, created));
        }
    }
}

fn remove_empty_parents(path: &Path, base: &Path) {
    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == base || !current.starts_with(base) {
            break;
        }
        // fails on non-empty directories, which ends the walk
        if fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}
