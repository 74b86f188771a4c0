//! Observer registry for session events.
//!
//! Every callback runs inside its own panic boundary: a panicking observer is
//! logged and skipped, and the remaining observers in the list still run.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use serde_json::Value;
use tracing::error;

use crate::stream::transport::TransportError;

pub type MessageHandler = Box<dyn FnMut(&Value) + Send>;
pub type ErrorHandler = Box<dyn FnMut(&TransportError) + Send>;
pub type StateHandler = Box<dyn FnMut() + Send>;

/// A single callback tagged with the event list it belongs to.
pub enum Observer {
    Message(MessageHandler),
    Error(ErrorHandler),
    Open(StateHandler),
    Close(StateHandler),
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Message(_) => "Message",
            Self::Error(_) => "Error",
            Self::Open(_) => "Open",
            Self::Close(_) => "Close",
        };
        write!(f, "Observer::{kind}")
    }
}

/// Four append-only, ordered callback lists.
#[derive(Default)]
pub struct Observers {
    message: Vec<MessageHandler>,
    error: Vec<ErrorHandler>,
    open: Vec<StateHandler>,
    close: Vec<StateHandler>,
}

impl Observers {
    pub fn register(&mut self, observer: Observer) {
        match observer {
            Observer::Message(handler) => self.message.push(handler),
            Observer::Error(handler) => self.error.push(handler),
            Observer::Open(handler) => self.open.push(handler),
            Observer::Close(handler) => self.close.push(handler),
        }
    }

    pub fn dispatch_message(&mut self, message: &Value) {
        for (index, handler) in self.message.iter_mut().enumerate() {
            isolate("message", index, || handler(message));
        }
    }

    pub fn dispatch_error(&mut self, err: &TransportError) {
        for (index, handler) in self.error.iter_mut().enumerate() {
            isolate("error", index, || handler(err));
        }
    }

    pub fn dispatch_open(&mut self) {
        for (index, handler) in self.open.iter_mut().enumerate() {
            isolate("open", index, || handler());
        }
    }

    pub fn dispatch_close(&mut self) {
        for (index, handler) in self.close.iter_mut().enumerate() {
            isolate("close", index, || handler());
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("message", &self.message.len())
            .field("error", &self.error.len())
            .field("open", &self.open.len())
            .field("close", &self.close.len())
            .finish()
    }
}

fn isolate(kind: &'static str, index: usize, callback: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        error!(
            event = "stream_observer_panicked",
            kind,
            index,
            reason = panic_reason(payload.as_ref())
        );
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> &str {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        reason
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        reason.as_str()
    } else {
        "non-string panic payload"
    }
}
