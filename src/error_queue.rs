//! Process-local diagnostic queue.
//!
//! Backends never hand native error codes to their callers. Each failure is
//! rendered into a message and pushed here; the caller drains the queue
//! once, after which it is empty again.

use std::collections::VecDeque;
use std::io::Write;

/// Ordered collection of diagnostic messages.
#[derive(Debug, Default, Clone)]
pub struct ErrorQueue {
    messages: VecDeque<String>,
}

impl ErrorQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message.
    pub fn push(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(target: "superio::errors", "{}", message);
        self.messages.push_back(message);
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Concatenate all messages in push order, each followed by a newline,
    /// and clear the queue.
    pub fn drain(&mut self) -> String {
        let mut out = String::new();
        for message in self.messages.drain(..) {
            out.push_str(&message);
            out.push('\n');
        }
        out
    }

    /// Drain the queue into `out`.
    pub fn print<W: Write>(&mut self, out: &mut W) -> std::io::Result<()> {
        let text = self.drain();
        out.write_all(text.as_bytes())?;
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_is_ordered_and_destructive() {
        let mut queue = ErrorQueue::new();
        queue.push("first");
        queue.push(String::from("second"));
        queue.push("third");
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.drain(), "first\nsecond\nthird\n");
        assert!(queue.is_empty());
        assert_eq!(queue.drain(), "");
    }

    #[test]
    fn print_drains() {
        let mut queue = ErrorQueue::new();
        queue.push("Group g does not exist");

        let mut out = Vec::new();
        queue.print(&mut out).unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "Group g does not exist\n");
        assert!(queue.is_empty());
    }
}
