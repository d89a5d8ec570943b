pub mod config;
pub mod error;
pub mod policy;

pub use config::PolicyConfig;
pub use error::*;
pub use policy::*;
