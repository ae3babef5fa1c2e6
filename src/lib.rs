mod blocks;
mod buffered;
mod cqf;
mod error;
mod locks;
mod reversible_hasher;
mod storage;
mod utils;

const SLOTS_PER_BLOCK: usize = 64;

pub use buffered::{BufferedFilter, BufferedIter, BufferedParams};
pub use cqf::*;
pub use error::{CqfError, Result};
pub use locks::{LockMode, LockStats, SLOTS_PER_LOCK};
pub use reversible_hasher::*;
pub use storage::{HeapStorage, MmapStorage, Storage};
