//! Pseudo-terminal processes

mod process;

pub use process::{
    resolve_shell, spawn, validate_shell_path, PtyCommand, PtyProcess, PtySpawnRequest, SpawnedPty,
};
