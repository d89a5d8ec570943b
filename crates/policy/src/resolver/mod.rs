//! Include resolution.
//!
//! Policies may declare `includes` naming other documents. The resolver walks
//! those declarations depth-first from each root, producing a
//! [`DependencyGraph`] whose load order places every document after the
//! documents it includes.

mod core;
mod graph;


pub use self::core::IncludeResolver;
pub use self::graph::{DependencyGraph, DependencyNode};
