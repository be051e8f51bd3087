#![doc = include_str!("../README.md")]
#![warn(missing_docs, missing_debug_implementations)]

#[macro_use]
mod util;
pub(crate) mod loom;

pub mod distributor;
pub mod lock;
pub mod mutex;
pub mod queue;

#[doc(inline)]
pub use self::distributor::Distributor;
#[doc(inline)]
pub use self::lock::{NullLock, RawLock, Spinlock};
#[doc(inline)]
pub use self::mutex::{MultiLock, MultiOwnership, Mutex, Ownership};
#[doc(inline)]
pub use self::queue::Queue;
