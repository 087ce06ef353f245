pub mod local;
pub mod persist;
pub mod remote;
pub mod state;

pub use state::{AppService, Backend, Snapshot, SyncError};
