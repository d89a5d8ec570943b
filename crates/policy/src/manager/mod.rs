//! Policy lifecycle manager.
//!
//! [`PolicyManager`] owns a [`PolicyRegistry`](crate::registry::PolicyRegistry)
//! and moves it between validated policy sets. Loads run the
//! load → resolve → validate pipeline and only then swap the registry, so
//! readers never observe a partially applied or invalid set.

mod core;
mod pipeline;
mod state;
mod sync;
mod watch;


pub use self::core::{ManagerBuilder, PolicyManager};
pub use self::state::{LoadDiagnostics, ManagerHealth, ManagerState};
