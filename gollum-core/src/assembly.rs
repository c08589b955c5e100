//! `WriterAssembly` owns the lifecycle of a single rotatable writer
//! resource: opening it lazily, checking the rotation policy before each
//! use, and swapping it out when the policy says to roll. It also adapts a
//! batch flush to that writer: `write` formats and writes each message,
//! consulting an optional `Validator` and `ErrorHandler`; `flush` is the
//! drop-path used when the sink itself is the problem.

use chrono::Utc;
use thiserror::Error;

use crate::message::Message;
use crate::rotation::{BatchedWriter, RotationPolicy, RotationReason};

#[derive(Error, Debug)]
pub enum RotationError {
    #[error("failed to open a new writer resource: {0}")]
    OpenFailed(String),
}

/// Checks a formatted message before it is written; returning `false` fails
/// the write without the writer ever seeing the bytes.
pub type Validator = Box<dyn Fn(&[u8]) -> bool + Send>;

/// Given a write error's message, decides whether the assembly should keep
/// attempting the rest of the batch (`true`) or give up on everything from
/// that message onward and route it to the caller's drop path (`false`).
pub type ErrorHandler = Box<dyn Fn(&str) -> bool + Send>;

/// Wraps a `W: BatchedWriter` with the bookkeeping needed to decide when to
/// rotate it: when it was opened, and the policy to check against. `open_fn`
/// is supplied by the caller (e.g. the File producer opening the next
/// numbered file) rather than baked into this type, since opening is
/// resource-specific.
pub struct WriterAssembly<W> {
    writer: Option<W>,
    opened_at: chrono::DateTime<Utc>,
    policy: RotationPolicy,
    rotation_count: u64,
    validator: Option<Validator>,
    error_handler: Option<ErrorHandler>,
}

impl<W: BatchedWriter> WriterAssembly<W> {
    pub fn new(policy: RotationPolicy) -> Self {
        Self {
            writer: None,
            opened_at: Utc::now(),
            policy,
            rotation_count: 0,
            validator: None,
            error_handler: None,
        }
    }

    /// Installs the validator consulted by `write` before each formatted
    /// message is handed to the writer.
    pub fn set_validator(&mut self, validator: impl Fn(&[u8]) -> bool + Send + 'static) {
        self.validator = Some(Box::new(validator));
    }

    /// Installs the handler `write` consults after a write error, to decide
    /// whether to keep going or give up on the rest of the batch.
    pub fn set_error_handler(&mut self, handler: impl Fn(&str) -> bool + Send + 'static) {
        self.error_handler = Some(Box::new(handler));
    }

    pub fn rotation_count(&self) -> u64 {
        self.rotation_count
    }

    /// Returns the currently open writer, opening one via `open_fn` if none
    /// is open yet, or rotating first if the policy says the current one
    /// has expired.
    pub fn current<F>(&mut self, open_fn: F) -> Result<&mut W, RotationError>
    where
        F: FnOnce() -> Result<W, String>,
    {
        let needs_rotation = match &self.writer {
            None => true,
            Some(writer) => self
                .policy
                .should_rotate(writer, self.opened_at, Utc::now())
                .is_some(),
        };

        if needs_rotation {
            self.open(open_fn)?;
        }

        Ok(self.writer.as_mut().expect("just opened above"))
    }

    /// Forces rotation regardless of policy, for the SIGHUP roll path.
    pub fn rotate_now<F>(&mut self, open_fn: F) -> Result<&mut W, RotationError>
    where
        F: FnOnce() -> Result<W, String>,
    {
        self.open(open_fn)?;
        Ok(self.writer.as_mut().expect("just opened above"))
    }

    /// The reason the current writer would rotate on its next use, without
    /// actually rotating it. Useful for producers that want to log why.
    pub fn pending_reason(&self) -> Option<RotationReason> {
        self.writer
            .as_ref()
            .and_then(|writer| self.policy.should_rotate(writer, self.opened_at, Utc::now()))
    }

    fn open<F>(&mut self, open_fn: F) -> Result<(), RotationError>
    where
        F: FnOnce() -> Result<W, String>,
    {
        let writer = open_fn().map_err(RotationError::OpenFailed)?;
        self.writer = Some(writer);
        self.opened_at = Utc::now();
        self.rotation_count += 1;
        Ok(())
    }
}

impl<W: BatchedWriter + std::io::Write> WriterAssembly<W> {
    /// Swaps in an already-open writer directly, bypassing `open_fn`. Writes
    /// already in progress against the old writer are left to finish on
    /// their own; this just changes what the next `write`/`current` call
    /// sees.
    pub fn set_writer(&mut self, writer: W) {
        self.writer = Some(writer);
        self.opened_at = Utc::now();
        self.rotation_count += 1;
    }

    /// Formats and writes each message in `batch` in order, opening a writer
    /// via `open_fn` first if none is open. Stops at the first message
    /// `validator` rejects, or the first write that errors and whose
    /// `error_handler` says not to continue; that message and everything
    /// after it in `batch` is then handed to `on_drop` instead.
    pub fn write<F>(
        &mut self,
        batch: Vec<Message>,
        open_fn: F,
        format: impl Fn(&Message) -> Vec<u8>,
        mut on_drop: impl FnMut(Message),
    ) -> Result<(), RotationError>
    where
        F: FnOnce() -> Result<W, String>,
    {
        let validator = self.validator.take();
        let error_handler = self.error_handler.take();

        let writer = self.current(open_fn)?;
        let mut batch_iter = batch.into_iter();
        let mut gave_up_from: Option<Message> = None;

        for message in batch_iter.by_ref() {
            let formatted = format(&message);

            if let Some(validator) = &validator {
                if !validator(&formatted) {
                    gave_up_from = Some(message);
                    break;
                }
            }

            if let Err(e) = writer.write_all(&formatted) {
                let keep_going = error_handler
                    .as_ref()
                    .map(|handler| handler(&e.to_string()))
                    .unwrap_or(false);
                if !keep_going {
                    gave_up_from = Some(message);
                    break;
                }
            }
        }

        self.validator = validator;
        self.error_handler = error_handler;

        if let Some(first) = gave_up_from {
            for message in std::iter::once(first).chain(batch_iter) {
                on_drop(message);
            }
        }

        Ok(())
    }

    /// The drop-path: every message in `batch` is handed to `on_drop`
    /// without any attempt to write it. Used during shutdown when the sink
    /// is already known to be unreachable.
    pub fn flush(&mut self, batch: Vec<Message>, mut on_drop: impl FnMut(Message)) {
        for message in batch {
            on_drop(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StreamId;

    struct FakeWriter {
        size: u64,
        written: Vec<u8>,
        fail_next: bool,
    }

    impl BatchedWriter for FakeWriter {
        fn name(&self) -> &str {
            "fake"
        }
        fn size(&self) -> u64 {
            self.size
        }
        fn is_accessible(&self) -> bool {
            true
        }
    }

    impl std::io::Write for FakeWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.fail_next {
                self.fail_next = false;
                return Err(std::io::Error::other("write failed"));
            }
            self.written.extend_from_slice(buf);
            self.size += buf.len() as u64;
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn msg(payload: &str) -> Message {
        Message::new(payload.to_owned(), StreamId::from_name("default"))
    }

    fn fake(size: u64) -> FakeWriter {
        FakeWriter {
            size,
            written: Vec::new(),
            fail_next: false,
        }
    }

    #[test]
    fn opens_lazily_on_first_use() {
        let mut assembly: WriterAssembly<FakeWriter> = WriterAssembly::new(RotationPolicy::default());
        assert_eq!(assembly.rotation_count(), 0);

        assembly.current(|| Ok(fake(0))).unwrap();
        assert_eq!(assembly.rotation_count(), 1);
    }

    #[test]
    fn rotates_when_size_policy_is_exceeded() {
        let policy = RotationPolicy {
            max_size_bytes: Some(10),
            ..Default::default()
        };
        let mut assembly: WriterAssembly<FakeWriter> = WriterAssembly::new(policy);
        assembly.current(|| Ok(fake(20))).unwrap();
        assert_eq!(assembly.rotation_count(), 1);

        // Second call to `current` should see the same over-sized writer
        // and rotate again.
        assembly.current(|| Ok(fake(0))).unwrap();
        assert_eq!(assembly.rotation_count(), 2);
    }

    #[test]
    fn open_failure_is_surfaced() {
        let mut assembly: WriterAssembly<FakeWriter> = WriterAssembly::new(RotationPolicy::default());
        let err = assembly
            .current(|| Err::<FakeWriter, _>("disk full".to_string()))
            .unwrap_err();
        assert!(matches!(err, RotationError::OpenFailed(_)));
    }

    #[test]
    fn rotate_now_ignores_policy() {
        let mut assembly: WriterAssembly<FakeWriter> = WriterAssembly::new(RotationPolicy::default());
        assembly.current(|| Ok(fake(0))).unwrap();
        assembly.rotate_now(|| Ok(fake(0))).unwrap();
        assert_eq!(assembly.rotation_count(), 2);
    }

    #[test]
    fn write_formats_and_writes_every_message() {
        let mut assembly: WriterAssembly<FakeWriter> = WriterAssembly::new(RotationPolicy::default());
        let mut dropped = Vec::new();

        assembly
            .write(
                vec![msg("a"), msg("b")],
                || Ok(fake(0)),
                |m| m.payload().to_vec(),
                |m| dropped.push(m),
            )
            .unwrap();

        assert_eq!(assembly.current(|| Ok(fake(0))).unwrap().written, b"ab");
        assert!(dropped.is_empty());
    }

    #[test]
    fn write_stops_at_first_rejected_message_and_drops_the_rest() {
        let mut assembly: WriterAssembly<FakeWriter> = WriterAssembly::new(RotationPolicy::default());
        assembly.set_validator(|payload| payload != b"b");
        let mut dropped = Vec::new();

        assembly
            .write(
                vec![msg("a"), msg("b"), msg("c")],
                || Ok(fake(0)),
                |m| m.payload().to_vec(),
                |m| dropped.push(m),
            )
            .unwrap();

        assert_eq!(assembly.current(|| Ok(fake(0))).unwrap().written, b"a");
        assert_eq!(dropped.len(), 2);
        assert_eq!(dropped[0].payload(), b"b");
        assert_eq!(dropped[1].payload(), b"c");
    }

    #[test]
    fn write_error_handler_true_keeps_going_past_a_failed_write() {
        let mut assembly: WriterAssembly<FakeWriter> = WriterAssembly::new(RotationPolicy::default());
        assembly.set_error_handler(|_| true);
        let mut dropped = Vec::new();

        assembly.current(|| Ok(fake(0))).unwrap().fail_next = true;
        assembly
            .write(
                vec![msg("a"), msg("b")],
                || Ok(fake(0)),
                |m| m.payload().to_vec(),
                |m| dropped.push(m),
            )
            .unwrap();

        // "a" failed and was swallowed by the writer (not written), "b" went
        // through once fail_next reset itself.
        assert_eq!(assembly.current(|| Ok(fake(0))).unwrap().written, b"b");
        assert!(dropped.is_empty());
    }

    #[test]
    fn write_error_handler_false_gives_up_on_the_rest_of_the_batch() {
        let mut assembly: WriterAssembly<FakeWriter> = WriterAssembly::new(RotationPolicy::default());
        assembly.set_error_handler(|_| false);
        let mut dropped = Vec::new();

        assembly.current(|| Ok(fake(0))).unwrap().fail_next = true;
        assembly
            .write(
                vec![msg("a"), msg("b")],
                || Ok(fake(0)),
                |m| m.payload().to_vec(),
                |m| dropped.push(m),
            )
            .unwrap();

        assert_eq!(dropped.len(), 2);
    }

    #[test]
    fn flush_hands_every_message_to_on_drop_without_writing() {
        let mut assembly: WriterAssembly<FakeWriter> = WriterAssembly::new(RotationPolicy::default());
        let mut dropped = Vec::new();

        assembly.flush(vec![msg("a"), msg("b")], |m| dropped.push(m));

        assert_eq!(dropped.len(), 2);
    }

    #[test]
    fn set_writer_swaps_in_an_already_open_writer() {
        let mut assembly: WriterAssembly<FakeWriter> = WriterAssembly::new(RotationPolicy::default());
        assert_eq!(assembly.rotation_count(), 0);

        assembly.set_writer(fake(5));
        assert_eq!(assembly.rotation_count(), 1);
        assert_eq!(assembly.current(|| Ok(fake(0))).unwrap().size, 5);
    }
}
