#![forbid(unsafe_code)]
//! Interior-node update engine for the shadowfs btree.
//!
//! Topology changes (split, merge, rewrite, pointer update) go through a
//! single asynchronous transaction object that reserves journal space,
//! disk space, and pre-allocated nodes up front, builds replacement
//! nodes that shadow the old ones, writes them out, and only then makes
//! them reachable from a parent or a journalled root. A crash at any
//! point leaves a consistent tree.

pub mod cache;
pub mod format;
pub mod fs;
pub mod interior;
pub mod io;
pub mod lock;
pub mod node;
pub mod path;
pub mod reserve;
pub mod root;
pub mod topology;

pub use fs::{Fs, StoreOpts};
pub use interior::{flags, InteriorUpdate, UpdateMode};
pub use lock::LockMode;
pub use node::Node;
pub use path::Path;
