use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::checkpoint::record::{CheckpointRecord, ModelTag, NetTypeMatch, FORMAT_VERSION};
use crate::error::CheckpointError;

pub const CHECKPOINT_EXTENSION: &str = "ckpt";
const TMP_EXTENSION: &str = "tmp";

/// How many numbered checkpoints survive a prune. Named checkpoints such as
/// `best` are never pruned. `keep_last_n == 0` keeps everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_last_n: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy { keep_last_n: 5 }
    }
}

/// A numbered checkpoint found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub path: PathBuf,
    pub model_type: String,
    pub epoch: u32,
}

/// Reads and writes the checkpoints of one model type inside
/// `{workspace}/{project_path}`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    model_type: ModelTag,
}

impl CheckpointStore {
    pub fn new(workspace: &Path, project_path: &Path, model_type: ModelTag) -> Self {
        CheckpointStore {
            dir: workspace.join(project_path),
            model_type,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_type(&self) -> &ModelTag {
        &self.model_type
    }

    pub fn numbered_path(&self, epoch: u32) -> PathBuf {
        self.dir.join(format!(
            "{}_ep{:04}.{}",
            self.model_type, epoch, CHECKPOINT_EXTENSION
        ))
    }

    pub fn named_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{}.{}", self.model_type, name, CHECKPOINT_EXTENSION))
    }

    /// Write `record` as a numbered checkpoint, or under `name` when given.
    ///
    /// The record is written to a `.tmp` sibling, synced, and renamed into
    /// place, so readers only ever see complete files under the final name.
    pub fn save(&self, record: &CheckpointRecord, name: Option<&str>) -> Result<PathBuf, CheckpointError> {
        let final_path = match name {
            Some(name) => {
                validate_name(name)?;
                self.named_path(name)
            }
            None => self.numbered_path(record.epoch),
        };

        fs::create_dir_all(&self.dir).map_err(|source| CheckpointError::WriteFailed {
            path: self.dir.clone(),
            source,
        })?;

        self.write_atomic(&final_path, |writer| {
            bincode::serialize_into(writer, record).map_err(io::Error::other)
        })?;

        tracing::info!(path = %final_path.display(), epoch = record.epoch, "saved checkpoint");
        Ok(final_path)
    }

    fn write_atomic<F>(&self, final_path: &Path, write: F) -> Result<(), CheckpointError>
    where
        F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
    {
        let tmp_path = final_path.with_extension(TMP_EXTENSION);
        if let Err(source) = write_then_rename(&tmp_path, final_path, write) {
            // The final name was never touched; only the partial temp file
            // needs cleaning up.
            let _ = fs::remove_file(&tmp_path);
            return Err(CheckpointError::WriteFailed {
                path: final_path.to_path_buf(),
                source,
            });
        }
        Ok(())
    }

    /// Read a checkpoint and check that it belongs to this store's model type.
    pub fn load(&self, path: &Path, mode: NetTypeMatch) -> Result<CheckpointRecord, CheckpointError> {
        load_compatible(path, &self.model_type, mode)
    }

    /// Numbered checkpoints of this model type, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointEntry>, CheckpointError> {
        Ok(list_numbered(&self.dir)?
            .into_iter()
            .filter(|entry| entry.model_type == self.model_type.as_str())
            .collect())
    }

    pub fn latest(&self) -> Result<Option<CheckpointEntry>, CheckpointError> {
        Ok(self.list()?.pop())
    }

    /// Delete all but the newest `policy.keep_last_n` numbered checkpoints of
    /// this model type. Returns the removed checkpoint paths.
    ///
    /// Temp files left behind by an interrupted numbered save of this model
    /// type are deleted too, whatever the policy.
    pub fn prune(&self, policy: RetentionPolicy) -> Result<Vec<PathBuf>, CheckpointError> {
        self.remove_stale_temp_files()?;

        let entries = self.list()?;
        if policy.keep_last_n == 0 || entries.len() <= policy.keep_last_n {
            return Ok(Vec::new());
        }

        let excess = entries.len() - policy.keep_last_n;
        let mut removed = Vec::with_capacity(excess);
        for entry in entries.into_iter().take(excess) {
            match fs::remove_file(&entry.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tracing::debug!(path = %entry.path.display(), "pruned checkpoint");
            removed.push(entry.path);
        }
        Ok(removed)
    }

    /// Named temp files are not touched: the next save under that name
    /// truncates and renames them.
    fn remove_stale_temp_files(&self) -> Result<(), CheckpointError> {
        if !self.dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_tmp = path.extension().is_some_and(|ext| ext == TMP_EXTENSION);
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let ours = parse_numbered(&format!("{stem}.{CHECKPOINT_EXTENSION}"))
                .is_some_and(|(model_type, _)| model_type == self.model_type.as_str());
            if !(is_tmp && ours && path.is_file()) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tracing::debug!(path = %path.display(), "removed stale temp file");
        }
        Ok(())
    }
}

fn write_then_rename<F>(tmp_path: &Path, final_path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let mut writer = BufWriter::new(File::create(tmp_path)?);
    write(&mut writer)?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    fs::rename(tmp_path, final_path)?;
    sync_parent_dir(final_path);
    Ok(())
}

/// Persist the directory entry created by a rename. Best effort: the file
/// contents are already synced and not every platform can open a directory.
fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    {
        if let Some(dir) = path.parent().and_then(|parent| File::open(parent).ok()) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Read a checkpoint and check that its net type is accepted by `expected`.
pub fn load_compatible(
    path: &Path,
    expected: &ModelTag,
    mode: NetTypeMatch,
) -> Result<CheckpointRecord, CheckpointError> {
    let record = read_record(path)?;
    if !expected.accepts(&record.net_type, mode) {
        return Err(CheckpointError::Incompatible {
            expected: expected.to_string(),
            found: record.net_type,
            path: path.to_path_buf(),
        });
    }
    if record.net_type != expected.as_str() {
        tracing::warn!(
            path = %path.display(),
            current = %expected,
            checkpoint = %record.net_type,
            "loading checkpoint through a substring net type match"
        );
    }
    Ok(record)
}

/// Decode a checkpoint file without any model type check.
pub fn read_record(path: &Path) -> Result<CheckpointRecord, CheckpointError> {
    let bytes = fs::read(path).map_err(|source| CheckpointError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    // The version is the first field, so it can be checked before the rest
    // of the layout is trusted.
    let version: u32 = bincode::deserialize(&bytes).map_err(|source| CheckpointError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    if version != FORMAT_VERSION {
        return Err(CheckpointError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: version,
            supported: FORMAT_VERSION,
        });
    }

    bincode::deserialize(&bytes).map_err(|source| CheckpointError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Numbered checkpoints of any model type in `dir`, sorted by epoch. A
/// missing directory has no checkpoints.
pub fn list_numbered(dir: &Path) -> Result<Vec<CheckpointEntry>, CheckpointError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some((model_type, epoch)) = parse_numbered(&entry.file_name().to_string_lossy()) {
            entries.push(CheckpointEntry {
                path,
                model_type,
                epoch,
            });
        }
    }
    entries.sort_by(|a, b| a.epoch.cmp(&b.epoch).then_with(|| a.path.cmp(&b.path)));
    Ok(entries)
}

/// Checkpoints in `dir` saved under a name rather than an epoch number.
pub fn list_named(dir: &Path) -> Result<Vec<PathBuf>, CheckpointError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut named = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let is_checkpoint = path
            .extension()
            .is_some_and(|ext| ext == CHECKPOINT_EXTENSION);
        if path.is_file() && is_checkpoint && parse_numbered(&file_name).is_none() {
            named.push(path);
        }
    }
    named.sort();
    Ok(named)
}

/// Split `{model_type}_ep{epoch:04}.ckpt` into its parts.
fn parse_numbered(file_name: &str) -> Option<(String, u32)> {
    let stem = file_name.strip_suffix(&format!(".{CHECKPOINT_EXTENSION}"))?;
    let (model_type, digits) = stem.rsplit_once("_ep")?;
    if model_type.is_empty() || digits.len() < 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((model_type.to_string(), digits.parse().ok()?))
}

fn validate_name(name: &str) -> Result<(), CheckpointError> {
    let looks_numbered = parse_numbered(&format!("x_{name}.{CHECKPOINT_EXTENSION}")).is_some();
    if name.is_empty() || name.contains(['/', '\\', '.']) || looks_numbered {
        return Err(CheckpointError::InvalidName(name.to_string()));
    }
    Ok(())
}
