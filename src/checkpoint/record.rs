use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;
use crate::training::state::Stats;

/// Version of the on-disk record layout.
pub const FORMAT_VERSION: u32 = 1;

/// Stable identifier of a network variant, e.g. `"PDCNet"` or `"GLUNet_GOCor"`.
///
/// Used to name checkpoint files and to check that a checkpoint belongs to
/// the network it is loaded into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelTag(String);

impl ModelTag {
    pub fn new(tag: impl Into<String>) -> Result<Self, CheckpointError> {
        let tag = tag.into();
        let valid = !tag.is_empty()
            && !tag.contains(['/', '\\'])
            && tag != "."
            && tag != ".."
            && !tag.chars().any(char::is_control);
        if valid {
            Ok(ModelTag(tag))
        } else {
            Err(CheckpointError::InvalidModelTag(tag))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a checkpoint recorded with `recorded` may be loaded into this
    /// network.
    pub fn accepts(&self, recorded: &str, mode: NetTypeMatch) -> bool {
        match mode {
            NetTypeMatch::Exact => self.0 == recorded,
            NetTypeMatch::Substring => self.0 == recorded || self.0.contains(recorded),
        }
    }
}

impl fmt::Display for ModelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How strictly the recorded net type must match the current model.
///
/// `Substring` accepts any recorded tag contained in the current one (so a
/// `PDCNet` checkpoint loads into `PDCNet_v2`). This is looser than it looks:
/// an empty or very short recorded tag matches almost anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetTypeMatch {
    Exact,
    #[default]
    Substring,
}

/// Recipe for rebuilding a network: the factory function and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetConstructor {
    pub fun_name: String,
    pub fun_module: String,
    pub args: Vec<String>,
    pub kwds: BTreeMap<String, String>,
}

/// Everything written to a checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub format_version: u32,
    pub epoch: u32,
    pub actor_type: String,
    pub net_type: String,
    pub state_dict: Vec<u8>,
    /// Free-form network description, JSON encoded.
    pub net_info: Option<String>,
    pub constructor: Option<NetConstructor>,
    /// Empty when the optimizer had nothing to save.
    pub optimizer: Vec<u8>,
    /// Written for inspection only; loading never restores it.
    pub lr_scheduler: Option<Vec<u8>>,
    pub stats: Stats,
    pub best_val: f64,
    pub epoch_of_best_val: u32,
}

/// The fields of a [`CheckpointRecord`], used to choose what a load restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointField {
    Epoch,
    ActorType,
    NetType,
    StateDict,
    NetInfo,
    Constructor,
    Optimizer,
    LrScheduler,
    Stats,
    BestVal,
    EpochOfBestVal,
}

impl CheckpointField {
    pub const ALL: [CheckpointField; 11] = [
        CheckpointField::Epoch,
        CheckpointField::ActorType,
        CheckpointField::NetType,
        CheckpointField::StateDict,
        CheckpointField::NetInfo,
        CheckpointField::Constructor,
        CheckpointField::Optimizer,
        CheckpointField::LrScheduler,
        CheckpointField::Stats,
        CheckpointField::BestVal,
        CheckpointField::EpochOfBestVal,
    ];

    /// Fields that are descriptive only and never copied into training state.
    /// The scheduler is left out so a resumed run can use a new schedule.
    pub const NEVER_LOADED: [CheckpointField; 5] = [
        CheckpointField::LrScheduler,
        CheckpointField::Constructor,
        CheckpointField::NetType,
        CheckpointField::ActorType,
        CheckpointField::NetInfo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CheckpointField::Epoch => "epoch",
            CheckpointField::ActorType => "actor_type",
            CheckpointField::NetType => "net_type",
            CheckpointField::StateDict => "state_dict",
            CheckpointField::NetInfo => "net_info",
            CheckpointField::Constructor => "constructor",
            CheckpointField::Optimizer => "optimizer",
            CheckpointField::LrScheduler => "lr_scheduler",
            CheckpointField::Stats => "stats",
            CheckpointField::BestVal => "best_val",
            CheckpointField::EpochOfBestVal => "epoch_of_best_val",
        }
    }
}

impl fmt::Display for CheckpointField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which parts of a checkpoint a load restores.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Restrict the load to these fields. `None` means every field.
    pub fields: Option<Vec<CheckpointField>>,
    /// Extra fields to skip on top of [`CheckpointField::NEVER_LOADED`].
    pub ignore: Vec<CheckpointField>,
    /// Hand the recorded constructor to the actor.
    pub load_constructor: bool,
}

impl LoadOptions {
    pub fn ignoring(fields: impl IntoIterator<Item = CheckpointField>) -> Self {
        LoadOptions {
            ignore: fields.into_iter().collect(),
            ..LoadOptions::default()
        }
    }

    pub fn loads(&self, field: CheckpointField) -> bool {
        let requested = self
            .fields
            .as_ref()
            .map_or(true, |fields| fields.contains(&field));
        requested && !self.ignore.contains(&field) && !CheckpointField::NEVER_LOADED.contains(&field)
    }

    /// The fields this load restores, in record order.
    pub fn selected(&self) -> impl Iterator<Item = CheckpointField> + '_ {
        CheckpointField::ALL
            .into_iter()
            .filter(move |field| self.loads(*field))
    }
}
