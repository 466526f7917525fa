//! zbackup-zfs: zfs host nodes and the replication driver
//!
//! Turns the plans from `zbackup-core` into zfs and zpool commands run
//! through a `zbackup-transport` [`Runner`](zbackup_transport::Runner).

pub mod dataset;
pub mod error;
pub mod job;
pub mod node;
pub mod pool;
pub mod sync;

pub use dataset::DatasetCache;
pub use error::{Result, ZfsError};
pub use job::{BackupJob, JobReport, MissingReport};
pub use node::ZfsNode;
pub use sync::{DatasetSync, SyncReport, TransferFlags};
