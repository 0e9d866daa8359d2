#![forbid(unsafe_code)]
//! Umbrella crate re-exporting the shadowfs workspace.

pub use sfs_alloc as alloc;
pub use sfs_block as block;
pub use sfs_btree as btree;
pub use sfs_error as error;
pub use sfs_journal as journal;
pub use sfs_key as key;
pub use sfs_types as types;
