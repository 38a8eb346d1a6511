//! Asynchronous message relay
//!
//! A [`MessageRelay`] owns a single-owner resource (a metrics writer, the log
//! sink) on a background thread. Any component may enqueue messages for it;
//! sending never blocks and never fails the caller. Messages are handled in
//! FIFO order. A failing message is turned into an error [`LogRecord`] on the
//! process-wide [`log_relay`] instead of being propagated.

use std::thread::JoinHandle;

use once_cell::sync::Lazy;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Consumer side of a relay, executed on the relay's background thread
pub trait RelayTarget: Send + 'static {
    /// Message type handled by this target
    type Message: Send + 'static;

    /// Name used in thread names and error reports
    fn name(&self) -> &str;

    /// Execute one message
    fn handle(&mut self, message: Self::Message) -> anyhow::Result<()>;

    /// Report a failed message
    fn report_failure(&mut self, error: anyhow::Error) {
        log_relay().send(LogRecord::error(format!(
            "[{}] relay message failed: {error:#}",
            self.name()
        )));
    }
}

enum Envelope<M> {
    Message(M),
    Flush(oneshot::Sender<()>),
}

/// Background executor for the messages of one [`RelayTarget`]
pub struct MessageRelay<T: RelayTarget> {
    name: String,
    sender: Option<mpsc::UnboundedSender<Envelope<T::Message>>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: RelayTarget> MessageRelay<T> {
    /// Move `target` onto a new background thread
    pub fn spawn(mut target: T) -> Self {
        let name = target.name().to_string();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Envelope<T::Message>>();

        let worker = std::thread::Builder::new()
            .name(format!("relay-{name}"))
            .spawn(move || {
                while let Some(envelope) = receiver.blocking_recv() {
                    match envelope {
                        Envelope::Message(message) => {
                            if let Err(err) = target.handle(message) {
                                target.report_failure(err);
                            }
                        }
                        Envelope::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            });

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!("Failed to start relay thread for {name}: {err}");
                None
            }
        };
        debug!("Started message relay {name}");

        Self {
            name,
            sender: Some(sender),
            worker,
        }
    }

    /// Relay name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the background thread is accepting messages
    pub fn is_running(&self) -> bool {
        self.worker.is_some() && self.sender.as_ref().is_some_and(|sender| !sender.is_closed())
    }

    /// Enqueue a message. Dropped with a warning if the relay is down.
    pub fn send(&self, message: T::Message) {
        let delivered = self
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(Envelope::Message(message)).is_ok());
        if !delivered {
            warn!("Message relay {} is not running, message dropped", self.name);
        }
    }

    /// Block until every message sent before this call was handled
    pub fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if sender.send(Envelope::Flush(done)).is_ok() {
            let _ = wait.blocking_recv();
        }
    }
}

impl<T: RelayTarget> Drop for MessageRelay<T> {
    fn drop(&mut self) {
        // closing the channel ends the worker loop once the queue is drained
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Message relay {} thread panicked", self.name);
            }
        }
    }
}

impl<T: RelayTarget> std::fmt::Debug for MessageRelay<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRelay")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Severity of a relayed log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A log line to be emitted by the log relay
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    /// Info-level record
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    /// Error-level record
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Error,
            message: message.into(),
        }
    }
}

/// Re-emits relayed records through `tracing`
#[derive(Debug, Default)]
pub struct TracingSink;

impl RelayTarget for TracingSink {
    type Message = LogRecord;

    fn name(&self) -> &str {
        "log"
    }

    fn handle(&mut self, record: LogRecord) -> anyhow::Result<()> {
        match record.level {
            LogLevel::Debug => debug!(target: "hurricore::relay", "{}", record.message),
            LogLevel::Info => info!(target: "hurricore::relay", "{}", record.message),
            LogLevel::Warn => warn!(target: "hurricore::relay", "{}", record.message),
            LogLevel::Error => error!(target: "hurricore::relay", "{}", record.message),
        }
        Ok(())
    }

    fn report_failure(&mut self, error: anyhow::Error) {
        error!("Log relay failed: {error:#}");
    }
}

static LOG_RELAY: Lazy<MessageRelay<TracingSink>> = Lazy::new(|| MessageRelay::spawn(TracingSink));

/// Process-wide relay for log lines, started on first use
pub fn log_relay() -> &'static MessageRelay<TracingSink> {
    &LOG_RELAY
}
