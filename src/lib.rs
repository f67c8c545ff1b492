//! stackfs - Branch-stacking union filesystem core
//!
//! This library keeps one virtual inode per logical path on top of several
//! stacked backing trees ("branches"). It provides the per-inode branch
//! shadow table, generation-based staleness detection, the pinning protocol
//! mutating directory operations use, and the pseudo-link registry that keeps
//! hardlink aliases alive after copy-up.

pub mod branch;
pub mod config;
pub mod error;
pub mod inode;
pub mod lock;
pub mod logging;
pub mod pin;
pub mod plink;
pub mod union;

pub use config::UnionConfig;
pub use error::{Error, Result};
pub use union::UnionFs;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::branch::{BackingFs, BackingInode, BranchPerm, FileKind, LocalFs, MemoryFs};
    pub use crate::config::UnionConfig;
    pub use crate::error::{Error, Result};
    pub use crate::inode::{InodeInfo, VirtualInode};
    pub use crate::lock::LockClass;
    pub use crate::pin::{BranchPin, PinFlags, PinPair, PinRequest, PinTarget};
    pub use crate::union::{BranchSource, UnionFs};
}
