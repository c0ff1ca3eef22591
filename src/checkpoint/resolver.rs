use std::path::PathBuf;

use crate::checkpoint::record::{ModelTag, NetTypeMatch};
use crate::checkpoint::store::{list_numbered, CheckpointStore};
use crate::config::expand_home;
use crate::error::CheckpointError;

/// Which checkpoint to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSelector {
    /// Highest numbered checkpoint of the current model type.
    Latest,
    /// Numbered checkpoint of the current model type at this epoch.
    ByEpoch(u32),
    /// A checkpoint file, or a directory to take the latest checkpoint from.
    ByPath(PathBuf),
}

/// Whether a load continues a run or only borrows the weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Continue from the recorded epoch, stats and best value.
    Resume,
    /// Take weights and optimizer state, then start counting from zero.
    Fresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCheckpoint {
    pub path: PathBuf,
    pub mode: LoadMode,
}

impl CheckpointSelector {
    /// Find the file this selector points at. `store` is `None` when the run
    /// has no workspace, in which case only explicit paths can resolve. A
    /// directory resolves to its newest checkpoint that `expected` accepts
    /// under `mode`.
    pub fn resolve(
        &self,
        store: Option<&CheckpointStore>,
        expected: &ModelTag,
        mode: NetTypeMatch,
    ) -> Result<ResolvedCheckpoint, CheckpointError> {
        match self {
            CheckpointSelector::Latest => {
                let store = store.ok_or(CheckpointError::NoWorkspace)?;
                let latest = store.latest()?.ok_or_else(|| CheckpointError::NotFound {
                    location: store.dir().to_path_buf(),
                })?;
                Ok(ResolvedCheckpoint {
                    path: latest.path,
                    mode: LoadMode::Resume,
                })
            }
            CheckpointSelector::ByEpoch(epoch) => {
                let store = store.ok_or(CheckpointError::NoWorkspace)?;
                let path = store.numbered_path(*epoch);
                if !path.is_file() {
                    return Err(CheckpointError::NotFound { location: path });
                }
                Ok(ResolvedCheckpoint {
                    path,
                    mode: LoadMode::Resume,
                })
            }
            CheckpointSelector::ByPath(path) => {
                let path = expand_home(path);
                if path.is_dir() {
                    let latest = list_numbered(&path)?
                        .into_iter()
                        .rev()
                        .find(|entry| expected.accepts(&entry.model_type, mode))
                        .ok_or(CheckpointError::NotFound { location: path })?;
                    Ok(ResolvedCheckpoint {
                        path: latest.path,
                        mode: LoadMode::Resume,
                    })
                } else {
                    Ok(ResolvedCheckpoint {
                        path,
                        mode: LoadMode::Fresh,
                    })
                }
            }
        }
    }
}
