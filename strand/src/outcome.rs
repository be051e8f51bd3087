//! Resolution outcomes and transported errors.
//!
//! Every rendezvous in this crate resolves to exactly one [`Outcome`]: a
//! value, a transported [`Fault`], or [`Outcome::Empty`] — the cancellation
//! sentinel produced when a [`Completion`](crate::Completion) is dropped
//! without being fulfilled. Consumers observe `Empty` as
//! [`AwaitError::Cancelled`].

use core::fmt;
use std::any::Any;
use std::error::Error;
use std::sync::{Arc, Mutex};

/// The resolved state of a rendezvous.
#[derive(Debug)]
pub enum Outcome<T> {
    /// Resolved with no value. Awaiting this outcome reports
    /// [`AwaitError::Cancelled`].
    Empty,
    /// Resolved with a value.
    Value(T),
    /// Resolved with a transported error.
    Fault(Fault),
}

impl<T> Outcome<T> {
    /// Returns `true` if this outcome carries a value.
    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    /// Returns `true` if this outcome is the cancellation sentinel.
    pub fn is_empty(&self) -> bool {
        matches!(self, Outcome::Empty)
    }

    /// Converts the outcome into the result seen by an awaiting consumer.
    pub fn into_result(self) -> Result<T, AwaitError> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Empty => Err(AwaitError::Cancelled),
            Outcome::Fault(fault) => Err(AwaitError::Fault(fault)),
        }
    }

    /// Maps the value variant, leaving the others untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Value(value) => Outcome::Value(f(value)),
            Outcome::Empty => Outcome::Empty,
            Outcome::Fault(fault) => Outcome::Fault(fault),
        }
    }
}

/// An erased, cheaply-cloneable transported error.
///
/// A `Fault` is what a producer delivers when it fails: either an error value
/// (via [`Completion::fail`](crate::Completion::fail)) or a panic payload
/// captured from a task body. Cloning a `Fault` is an [`Arc`] bump, so one
/// fault can be delivered to many consumers (the queue uses this when it is
/// closed with an error).
#[derive(Clone)]
pub struct Fault(Arc<FaultKind>);

enum FaultKind {
    Error(Box<dyn Error + Send + Sync>),
    Panic(Mutex<Option<Box<dyn Any + Send>>>),
}

impl Fault {
    /// Wraps an error value.
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Fault(Arc::new(FaultKind::Error(Box::new(error))))
    }

    /// Wraps a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Fault(Arc::new(FaultKind::Error(Box::new(MessageError(
            message.into(),
        )))))
    }

    /// Wraps a captured panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Fault(Arc::new(FaultKind::Panic(Mutex::new(Some(payload)))))
    }

    /// Returns `true` if this fault was produced by a panicking producer.
    pub fn is_panic(&self) -> bool {
        matches!(&*self.0, FaultKind::Panic(_))
    }

    /// Takes the panic payload out of this fault, if it carries one and it
    /// has not already been taken.
    pub fn into_panic(self) -> Option<Box<dyn Any + Send>> {
        match &*self.0 {
            FaultKind::Panic(slot) => slot.lock().ok()?.take(),
            FaultKind::Error(_) => None,
        }
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            FaultKind::Error(error) => fmt::Display::fmt(error, f),
            FaultKind::Panic(slot) => {
                let text = slot.lock().ok().and_then(|payload| {
                    let payload = payload.as_ref()?;
                    if let Some(s) = payload.downcast_ref::<&'static str>() {
                        Some((*s).to_string())
                    } else {
                        payload.downcast_ref::<String>().cloned()
                    }
                });
                match text {
                    Some(text) => write!(f, "producer panicked: {text}"),
                    None => f.write_str("producer panicked"),
                }
            }
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.describe(f)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fault(")?;
        self.describe(f)?;
        f.write_str(")")
    }
}

impl Error for Fault {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &*self.0 {
            FaultKind::Error(error) => Some(error.as_ref()),
            FaultKind::Panic(_) => None,
        }
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for MessageError {}

/// The error returned when awaiting a promise that did not produce a value.
#[derive(Clone, Debug)]
pub enum AwaitError {
    /// The producer was dropped, cancelled, or explicitly resolved the
    /// rendezvous to "no value".
    Cancelled,
    /// The producer delivered a transported error.
    Fault(Fault),
}

impl AwaitError {
    /// Returns `true` for the cancellation case.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AwaitError::Cancelled)
    }

    /// Returns the transported fault, if any.
    pub fn into_fault(self) -> Option<Fault> {
        match self {
            AwaitError::Fault(fault) => Some(fault),
            AwaitError::Cancelled => None,
        }
    }
}

impl fmt::Display for AwaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AwaitError::Cancelled => f.pad("await cancelled"),
            AwaitError::Fault(fault) => fault.describe(f),
        }
    }
}

impl Error for AwaitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AwaitError::Fault(fault) => Some(fault),
            AwaitError::Cancelled => None,
        }
    }
}

/// Message used by every invalid-state panic in the crate, so that breaches
/// of the rendezvous state machine are recognizable in test output.
pub(crate) const INVALID_STATE: &str = "invalid promise state";
