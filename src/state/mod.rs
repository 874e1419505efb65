//! Persistent keyed state.
//!
//! - [`keyed`] - Path-addressed observable state
//! - [`persistent`] - Keyed state mirrored into a storage backend
//! - [`storage`] - Storage backends
//! - [`video`] - Video playback preferences

pub mod keyed;
pub mod persistent;
pub mod storage;
pub mod video;

pub use keyed::{Change, KeyedState, StateError, Subscription};
pub use persistent::PersistentState;
pub use storage::{FileStorage, MemoryStorage, StorageBackend, StorageError};
pub use video::{jitter_threshold, VideoSettings, VideoSettingsStore, VIDEO_SETTINGS_KEY};
