//! The output consumer seam and diagnostic formatting.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::rc::Rc;
use std::sync::Arc;

use phlox_asm::{Fault, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Status returned by a consumer.
pub enum ConsumerStatus {
    /// Keep going.
    Ok,
    /// Stop the VM; the dispatcher cleans its operands and returns an
    /// abort result.
    Abort,
}

/// A byte sink for program output and diagnostics. The VM calls it once
/// per emission; buffering, if any, is the consumer's business.
pub trait Consumer {
    /// Consume one emission.
    fn consume(&mut self, bytes: &[u8]) -> ConsumerStatus;
}

impl Consumer for Vec<u8> {
    fn consume(&mut self, bytes: &[u8]) -> ConsumerStatus {
        self.extend_from_slice(bytes);
        ConsumerStatus::Ok
    }
}

#[derive(Debug, Clone, Default)]
/// A consumer appending into a shared buffer; the embedder keeps a handle
/// and reads the output after execution. Used heavily by the test suite.
pub struct MemoryConsumer {
    buffer: Rc<RefCell<Vec<u8>>>,
}

impl MemoryConsumer {
    /// A fresh empty consumer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle onto the shared buffer.
    pub fn handle(&self) -> Rc<RefCell<Vec<u8>>> {
        self.buffer.clone()
    }

    /// The buffered bytes, copied out.
    pub fn contents(&self) -> Vec<u8> {
        self.buffer.borrow().clone()
    }

    /// The buffered bytes as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer.borrow()).into_owned()
    }
}

impl Consumer for MemoryConsumer {
    fn consume(&mut self, bytes: &[u8]) -> ConsumerStatus {
        self.buffer.borrow_mut().extend_from_slice(bytes);
        ConsumerStatus::Ok
    }
}

/// A consumer that aborts after passing through a byte budget.
#[derive(Debug)]
pub struct AbortingConsumer {
    remaining: usize,
}

impl AbortingConsumer {
    /// Abort once more than `budget` bytes have been offered.
    pub fn new(budget: usize) -> Self {
        Self { remaining: budget }
    }
}

impl Consumer for AbortingConsumer {
    fn consume(&mut self, bytes: &[u8]) -> ConsumerStatus {
        if bytes.len() > self.remaining {
            return ConsumerStatus::Abort;
        }
        self.remaining -= bytes.len();
        ConsumerStatus::Ok
    }
}

#[derive(Debug, Clone)]
/// The structured form of one diagnostic, offered to the error callback
/// before formatting.
pub struct Diagnostic {
    /// Severity level.
    pub severity: Severity,
    /// The originating fault, when the diagnostic maps to one.
    pub fault: Option<Fault>,
    /// Human-readable message.
    pub message: String,
    /// The currently executing script path.
    pub file: Arc<str>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} in {}", self.severity, self.message, self.file)
    }
}

/// An I/O stream device, registered under a scheme name. Only the
/// registration protocol is part of the VM core; the device's semantics
/// belong to the embedder's stream layer.
pub trait StreamDevice {
    /// Open a path for reading.
    fn open_read(&mut self, path: &str) -> io::Result<Box<dyn io::Read>>;
    /// Open a path for writing.
    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn io::Write>>;
}
