#![doc = include_str!("../README.md")]
#![warn(missing_docs, missing_debug_implementations)]

#[macro_use]
mod util;
pub(crate) mod loom;

mod frame;

pub mod alert;
pub mod generator;
pub mod join;
pub mod outcome;
pub mod promise;
pub mod task;
pub mod time;

#[doc(inline)]
pub use self::alert::{AlertFlag, Ident};
pub use self::frame::Prepared;
#[doc(inline)]
pub use self::generator::{Generator, Yielder};
#[doc(inline)]
pub use self::join::{WhenAll, WhenEach};
#[doc(inline)]
pub use self::outcome::{AwaitError, Fault, Outcome};
#[doc(inline)]
pub use self::promise::{Completion, Promise};
#[doc(inline)]
pub use self::task::{is_detached, set_unhandled_fault_hook, Task};
