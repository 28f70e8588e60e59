//! Sinks consuming correlator output
//!
//! The correlator tries every output once, in order. Whether delivery
//! succeeds is the sink's business: failures come back as [`SinkError`],
//! get logged and counted, and the stream moves on.

use crossbeam_channel::{Sender, TrySendError};
use std::io::Write;

use crate::correlator::{CallRecord, Completion, Diagnostic, Output, ProbeHit};
use crate::domain::SinkError;

pub trait Sink: Send {
    /// Deliver one output
    ///
    /// # Errors
    /// Returns an error if the output could not be delivered
    fn deliver(&mut self, output: &Output) -> Result<(), SinkError>;

    /// Push out anything buffered
    ///
    /// # Errors
    /// Returns an error if buffered output could not be written
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn deliver(&mut self, output: &Output) -> Result<(), SinkError> {
        (**self).deliver(output)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

/// Human-readable lines, one per output
///
/// ```text
/// ENTERED dummy_SSL_read TID:4242 args=[0x5, 0x0]
/// EXITED  dummy_SSL_write TID:4242 15.08ms args=[0x5, 0x0] ret=0x5
/// ```
pub struct TextSink<W: Write + Send> {
    writer: W,
    /// Argument words shown per record
    arg_words: usize,
}

impl<W: Write + Send> TextSink<W> {
    pub fn new(writer: W, arg_words: usize) -> Self {
        Self { writer, arg_words }
    }
}

impl<W: Write + Send> Sink for TextSink<W> {
    fn deliver(&mut self, output: &Output) -> Result<(), SinkError> {
        writeln!(self.writer, "{}", format_line(output, self.arg_words))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Render one output as a text line
#[must_use]
pub fn format_line(output: &Output, arg_words: usize) -> String {
    match output {
        Output::Call(record) => format_call(record, arg_words),
        Output::Hit(hit) => format_hit(hit, arg_words),
        Output::Diagnostic(Diagnostic::OrphanReturn { symbol, tid, exit_payload, .. }) => {
            format!("ORPHAN  {symbol} {tid} ret=0x{:x} (no matching entry)", exit_payload.0[0])
        }
        Output::Diagnostic(Diagnostic::EventsDropped { count, total }) => {
            format!("DROPPED {count} events ({total} total)")
        }
    }
}

fn format_args(words: &[u64]) -> String {
    let rendered: Vec<String> = words.iter().map(|w| format!("0x{w:x}")).collect();
    format!("[{}]", rendered.join(", "))
}

fn format_call(record: &CallRecord, arg_words: usize) -> String {
    let args = format_args(&record.entry_payload.0[..arg_words.min(record.entry_payload.0.len())]);
    match (record.completion, record.exit_payload) {
        (Completion::Returned, Some(exit)) => format!(
            "EXITED  {} {} {} args={args} ret=0x{:x}",
            record.symbol,
            record.tid,
            record.duration(),
            exit.0[0]
        ),
        (Completion::Returned, None) => {
            format!("EXITED  {} {} {} args={args}", record.symbol, record.tid, record.duration())
        }
        (Completion::Incomplete(reason), _) => format!(
            "PENDING {} {} {} args={args} incomplete: {reason:?}",
            record.symbol,
            record.tid,
            record.duration()
        ),
    }
}

fn format_hit(hit: &ProbeHit, arg_words: usize) -> String {
    let args = format_args(&hit.payload.0[..arg_words.min(hit.payload.0.len())]);
    format!("ENTERED {} {} args={args}", hit.symbol, hit.tid)
}

/// One JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> Sink for JsonLinesSink<W> {
    fn deliver(&mut self, output: &Output) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, output)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Hands outputs to another thread without ever blocking the correlator
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Output>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: Sender<Output>) -> Self {
        Self { tx }
    }
}

impl Sink for ChannelSink {
    fn deliver(&mut self, output: &Output) -> Result<(), SinkError> {
        self.tx.try_send(output.clone()).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Disconnected(_) => SinkError::Closed,
        })
    }
}
