//! Terminal sessions and viewer multiplexing

mod manager;
mod multiplexer;

pub use manager::{Session, SessionManager, SessionSpec};
pub use multiplexer::{ExitInfo, ViewerHandle, ViewerId, ViewerSet, VIEWER_BUFFER};
