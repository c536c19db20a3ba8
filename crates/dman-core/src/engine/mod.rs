//! Multi-connection HTTP(S) download engine: the coordinator, its workers,
//! the splitting policy, status aggregation, persistence, and rebuilding.

pub mod tunables;
pub mod types;

mod coordinator;
mod http;
mod partfile;
mod persistence;
mod rebuilder;
mod splitter;
mod status;
mod worker;

pub use coordinator::{resume, start_new, DownloadHandle};
pub use persistence::{PartDescriptor, ProgressDescriptor};
pub use tunables::Tunables;
pub use types::{DownloadError, StatusSnapshot};
