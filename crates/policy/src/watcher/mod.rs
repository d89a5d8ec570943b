//! Change detection for file-mode policy sources.

mod debounce;
mod detector;

pub use self::debounce::Debouncer;
pub use self::detector::{ChangeDetector, EventFilter, WatchTarget};
