// Directory module: presence registry and the runner that serves it

pub mod server;
pub mod service;

pub use server::{DirectoryServer, REQUEST_ACTIONS};
pub use service::{DirectoryConfig, DirectoryEntry, DirectoryService, DirectoryStats, Handled};
