//! Batch dispatchers.
//!
//! A [`Dispatcher`] receives a finished [`AlertBatch`] exactly once and hands
//! it to whatever delivers notifications. Dispatchers never retry; a failure
//! is reported back to the scheduler, which logs it and moves on.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, WatchError};
use crate::types::{AlertBatch, Destination, Priority};

/// Acknowledgement that a batch was handed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReceipt {
    /// The batch that was delivered.
    pub batch_id: Uuid,
    /// The dispatcher that handled it.
    pub dispatcher: String,
    /// Number of events in the batch.
    pub events: usize,
    /// Optional note from the transport.
    pub message: Option<String>,
}

impl DispatchReceipt {
    /// Creates a receipt for `batch`.
    #[must_use]
    pub fn new(dispatcher: impl Into<String>, batch: &AlertBatch) -> Self {
        Self {
            batch_id: batch.id,
            dispatcher: dispatcher.into(),
            events: batch.len(),
            message: None,
        }
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }
}

/// Hands finished batches to a notification transport.
///
/// Implementations are called from the blocking pool and may block.
pub trait Dispatcher: Send + Sync + fmt::Debug {
    /// Returns the name of this dispatcher.
    fn name(&self) -> &str;

    /// Delivers one batch.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Dispatch` if the batch cannot be handed over.
    fn dispatch(&self, batch: &AlertBatch) -> Result<DispatchReceipt>;
}

/// A dispatcher that writes every batch to the log.
#[derive(Debug, Clone)]
pub struct LogDispatcher {
    name: String,
}

impl LogDispatcher {
    /// Creates a log dispatcher.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogDispatcher {
    fn default() -> Self {
        Self::new("log")
    }
}

impl Dispatcher for LogDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, batch: &AlertBatch) -> Result<DispatchReceipt> {
        for event in &batch.events {
            match event.priority {
                Priority::Critical => error!(
                    destination = %batch.destination,
                    category = %event.category,
                    owner = %event.owner,
                    instances = event.events.len(),
                    reason = %event.reason,
                    "ALERT"
                ),
                Priority::Warning => warn!(
                    destination = %batch.destination,
                    category = %event.category,
                    owner = %event.owner,
                    reason = %event.reason,
                    "ALERT"
                ),
                Priority::Info => info!(
                    destination = %batch.destination,
                    category = %event.category,
                    owner = %event.owner,
                    reason = %event.reason,
                    "NOTICE"
                ),
            }
        }

        Ok(DispatchReceipt::new(self.name(), batch).with_message("logged to tracing"))
    }
}

/// A plain-text message ready for a mail transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    /// Sender address.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

impl MailMessage {
    /// Composes a message for `batch`.
    #[must_use]
    pub fn compose(from: &str, to: Vec<String>, batch: &AlertBatch) -> Self {
        let subject = match batch.events.as_slice() {
            [single] => format!("[{}] {}", batch.priority.as_str().to_uppercase(), single.reason),
            events => format!(
                "[{}] {} fleet changes",
                batch.priority.as_str().to_uppercase(),
                events.len()
            ),
        };

        let mut body = format!(
            "Window: {} to {}\nDestination: {}\n\n",
            batch.window_opened_at.to_rfc3339(),
            batch.window_closed_at.to_rfc3339(),
            batch.destination
        );
        for event in &batch.events {
            let _ = writeln!(
                body,
                "- [{}] {} ({})",
                event.category,
                event.reason,
                event.timestamp.to_rfc3339()
            );
            if event.events.len() > 1 {
                for raw in &event.events {
                    let _ = writeln!(body, "    {} {}", raw.kind(), raw.key());
                }
            }
        }

        Self {
            from: from.to_string(),
            to,
            subject,
            body,
        }
    }
}

/// Delivers composed mail messages.
pub trait MailTransport: Send + Sync + fmt::Debug {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns an error describing why the message was not accepted.
    fn send(&self, message: &MailMessage) -> Result<()>;
}

/// Placeholder transport that logs messages instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

impl MailTransport for LogTransport {
    fn send(&self, message: &MailMessage) -> Result<()> {
        info!(
            from = %message.from,
            to = ?message.to,
            subject = %message.subject,
            "would send email notification"
        );
        debug!(body = %message.body, "email body");
        Ok(())
    }
}

/// A dispatcher that turns batches into mail messages.
#[derive(Debug)]
pub struct MailDispatcher<T> {
    name: String,
    from: String,
    recipients: HashMap<Destination, Vec<String>>,
    transport: T,
}

impl<T: MailTransport> MailDispatcher<T> {
    /// Creates a mail dispatcher with no recipients.
    #[must_use]
    pub fn new(name: impl Into<String>, from: impl Into<String>, transport: T) -> Self {
        Self {
            name: name.into(),
            from: from.into(),
            recipients: HashMap::new(),
            transport,
        }
    }

    /// Sets the recipients for one destination.
    #[must_use]
    pub fn with_recipients(mut self, destination: Destination, to: Vec<String>) -> Self {
        self.recipients.insert(destination, to);
        self
    }

    /// Returns the recipients for a destination.
    #[must_use]
    pub fn recipients(&self, destination: &Destination) -> &[String] {
        self.recipients.get(destination).map_or(&[], Vec::as_slice)
    }

    /// Returns the transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: MailTransport> Dispatcher for MailDispatcher<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, batch: &AlertBatch) -> Result<DispatchReceipt> {
        let to = self.recipients(&batch.destination);
        if to.is_empty() {
            return Err(WatchError::Dispatch {
                destination: batch.destination.to_string(),
                reason: "no recipients configured".to_string(),
            });
        }

        let message = MailMessage::compose(&self.from, to.to_vec(), batch);
        self.transport
            .send(&message)
            .map_err(|e| WatchError::Dispatch {
                destination: batch.destination.to_string(),
                reason: e.to_string(),
            })?;

        Ok(DispatchReceipt::new(self.name(), batch).with_message(message.subject))
    }
}

/// A dispatcher that keeps every batch in memory.
///
/// Used by tests and dry runs. Can be switched to fail every dispatch.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    batches: Mutex<Vec<AlertBatch>>,
    failing: AtomicBool,
}

impl RecordingDispatcher {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following dispatch fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns a copy of every batch received so far.
    #[must_use]
    pub fn batches(&self) -> Vec<AlertBatch> {
        self.batches.lock().clone()
    }

    /// Returns the number of batches received so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    /// Returns true if nothing was received yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn name(&self) -> &str {
        "recording"
    }

    fn dispatch(&self, batch: &AlertBatch) -> Result<DispatchReceipt> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(WatchError::Dispatch {
                destination: batch.destination.to_string(),
                reason: "recording dispatcher set to fail".to_string(),
            });
        }
        self.batches.lock().push(batch.clone());
        Ok(DispatchReceipt::new(self.name(), batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, ClassifiedEvent, Instance, RawChangeEvent};
    use chrono::Utc;

    fn event(name: &str, priority: Priority, category: Category) -> ClassifiedEvent {
        let instance = Instance::new("default", name, Utc::now()).with_owner("api");
        ClassifiedEvent::new(
            priority,
            category,
            format!("default/{name} changed"),
            vec![RawChangeEvent::Disappeared {
                last_known: instance,
            }],
            Utc::now(),
        )
    }

    fn batch(priority: Priority, events: Vec<ClassifiedEvent>) -> AlertBatch {
        let now = Utc::now();
        AlertBatch {
            id: Uuid::new_v4(),
            priority,
            destination: Destination::new("oncall"),
            events,
            window_opened_at: now,
            window_closed_at: now,
        }
    }

    #[derive(Debug, Default)]
    struct CapturingTransport {
        sent: Mutex<Vec<MailMessage>>,
        reject: bool,
    }

    impl MailTransport for CapturingTransport {
        fn send(&self, message: &MailMessage) -> Result<()> {
            if self.reject {
                return Err(WatchError::Io(std::io::Error::other("connection refused")));
            }
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    mod log_dispatcher_tests {
        use super::*;

        #[test]
        fn logs_every_priority() {
            let dispatcher = LogDispatcher::default();
            for priority in [Priority::Info, Priority::Warning, Priority::Critical] {
                let b = batch(priority, vec![event("api-0", priority, Category::IndividualChange)]);
                let receipt = dispatcher.dispatch(&b).unwrap();
                assert_eq!(receipt.dispatcher, "log");
                assert_eq!(receipt.batch_id, b.id);
                assert_eq!(receipt.events, 1);
            }
        }
    }

    mod mail_tests {
        use super::*;

        #[test]
        fn single_event_subject_uses_reason() {
            let b = batch(
                Priority::Critical,
                vec![event("api-0", Priority::Critical, Category::MassFailure)],
            );
            let message = MailMessage::compose("watch@example.com", vec!["ops@example.com".into()], &b);
            assert_eq!(message.subject, "[CRITICAL] default/api-0 changed");
            assert!(message.body.contains("[mass-failure]"));
        }

        #[test]
        fn digest_subject_counts_events() {
            let b = batch(
                Priority::Warning,
                vec![
                    event("api-0", Priority::Warning, Category::IndividualChange),
                    event("api-1", Priority::Warning, Category::Restart),
                ],
            );
            let message = MailMessage::compose("watch@example.com", vec![], &b);
            assert_eq!(message.subject, "[WARNING] 2 fleet changes");
            let first = message.body.find("api-0").unwrap();
            let second = message.body.find("api-1").unwrap();
            assert!(first < second);
        }

        #[test]
        fn dispatch_sends_to_recipients() {
            let dispatcher = MailDispatcher::new("mail", "watch@example.com", CapturingTransport::default())
                .with_recipients(Destination::new("oncall"), vec!["ops@example.com".to_string()]);

            let b = batch(Priority::Info, vec![event("api-0", Priority::Info, Category::Recovery)]);
            let receipt = dispatcher.dispatch(&b).unwrap();

            assert_eq!(receipt.dispatcher, "mail");
            let sent = dispatcher.transport().sent.lock();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].to, vec!["ops@example.com".to_string()]);
            assert_eq!(sent[0].from, "watch@example.com");
        }

        #[test]
        fn missing_recipients_is_an_error() {
            let dispatcher = MailDispatcher::new("mail", "watch@example.com", LogTransport);
            let b = batch(Priority::Info, vec![event("api-0", Priority::Info, Category::Recovery)]);

            let err = dispatcher.dispatch(&b).unwrap_err();
            assert!(matches!(err, WatchError::Dispatch { .. }));
            assert!(err.to_string().contains("no recipients"));
        }

        #[test]
        fn transport_failure_is_dispatch_error() {
            let transport = CapturingTransport {
                reject: true,
                ..Default::default()
            };
            let dispatcher = MailDispatcher::new("mail", "watch@example.com", transport)
                .with_recipients(Destination::new("oncall"), vec!["ops@example.com".to_string()]);
            let b = batch(Priority::Info, vec![event("api-0", Priority::Info, Category::Recovery)]);

            let err = dispatcher.dispatch(&b).unwrap_err();
            assert!(err.to_string().contains("connection refused"));
        }
    }

    mod recording_tests {
        use super::*;

        #[test]
        fn records_and_fails_on_demand() {
            let recorder = RecordingDispatcher::new();
            let b = batch(Priority::Info, vec![event("api-0", Priority::Info, Category::Recovery)]);

            recorder.dispatch(&b).unwrap();
            assert_eq!(recorder.len(), 1);

            recorder.set_failing(true);
            assert!(recorder.dispatch(&b).is_err());
            assert_eq!(recorder.len(), 1);
            assert_eq!(recorder.batches()[0].id, b.id);
        }
    }
}
