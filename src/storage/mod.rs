// src/storage/mod.rs

pub mod lock;
pub mod state;
pub mod writer;

pub use lock::{atomic_write, FileLock};
pub use state::{
    load_state, load_state_logged, migrate_document, save_state, BlockReason, KeyState,
    RotationState, CURRENT_STATE_SCHEMA,
};
pub use writer::StateWriter;
