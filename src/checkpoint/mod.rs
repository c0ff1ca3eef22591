//! Durable checkpoints: the on-disk record, the store that writes it
//! atomically and prunes old files, and the resolver that picks a file to
//! resume from.

mod record;
mod resolver;
mod store;

pub use record::{
    CheckpointField, CheckpointRecord, LoadOptions, ModelTag, NetConstructor, NetTypeMatch,
    FORMAT_VERSION,
};
pub use resolver::{CheckpointSelector, LoadMode, ResolvedCheckpoint};
pub use store::{
    list_named, list_numbered, load_compatible, read_record, CheckpointEntry, CheckpointStore, RetentionPolicy,
    CHECKPOINT_EXTENSION,
};
