//! Session registry — authoritative, serialized session state.
//!
//! Each session's mutations run single-writer: an async operation lock
//! serializes admissions and role switches, while a sync state mutex
//! guards the short, never-suspending critical sections. Checkpoints live
//! in a bounded FIFO ring; a durable mirror and a file-per-session store
//! give best-effort recovery across restarts.

mod registry;
mod ring;
mod state;
mod store;

pub use registry::{SessionHandle, SessionRegistry, SessionView};
pub use ring::CheckpointRing;
pub use state::{EscalationState, SessionPrefs, SessionState};
pub use store::{PersistedSession, SessionStore};
