//! Filesystem policy loader.
//!
//! Reads single documents under size, extension, symlink and encoding limits
//! and loads whole directories all-or-nothing. Parsing is delegated to a
//! [`PolicyParser`](crate::parser::PolicyParser).

mod core;

#[cfg(test)]
mod tests;

pub use self::core::PolicyLoader;
