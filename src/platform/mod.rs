//! Platform-specific primitives consumed by the locking protocol.

pub mod file_ops;
pub mod filesystem;
pub mod process;

pub use filesystem::{DefaultMandatoryLockProbe, MandatoryLockProbe, MandatorySupport};
pub use process::{current_execution_id, execution_descriptor, split_execution_id};
