//! Observer registry and event dispatch.
//!
//! Each observer gets its own queue and consumer task: events reach a given
//! observer in state-transition order, while observers run independently of
//! each other. An observer that fails (or panics) never takes the reader or
//! its peers down; the failure goes to the user supplied exception handler.

// ───── Std Lib ─────
use std::error::Error as StdError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

// ───── Crates ─────
use tokio::sync::mpsc;

// ───── Local Modules ─────
use crate::error::ServiceError;
use crate::selector::CardSelectionResult;

/// What happened on an observed reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderEventKind {
    CardInserted,
    CardMatched,
    CardRemoved,
    Unavailable,
}

/// Event published to reader observers.
#[derive(Debug, Clone)]
pub struct ReaderEvent {
    pub plugin_name: String,
    pub reader_name: String,
    pub kind: ReaderEventKind,
    pub scenario_result: Option<CardSelectionResult>,
}

/// Capability implemented by anyone interested in reader events.
pub trait ReaderObserver: Send + Sync {
    fn on_reader_event(
        &self,
        event: &ReaderEvent,
    ) -> Result<(), Box<dyn StdError + Send + Sync>>;
}

/// Receives errors raised by observers and by monitoring jobs.
pub trait ObservationExceptionHandler: Send + Sync {
    fn on_reader_observation_error(
        &self,
        plugin_name: &str,
        reader_name: &str,
        error: Box<dyn StdError + Send + Sync>,
    );
}

struct ObserverEntry {
    observer: Arc<dyn ReaderObserver>,
    sender: mpsc::UnboundedSender<Arc<ReaderEvent>>,
}

type SharedHandler = Arc<Mutex<Option<Arc<dyn ObservationExceptionHandler>>>>;

/// Thread-safe observer registry of one observable reader.
pub struct ObservationManager {
    plugin_name: String,
    reader_name: String,
    observers: Mutex<Vec<ObserverEntry>>,
    exception_handler: SharedHandler,
}

impl ObservationManager {
    pub(crate) fn new(plugin_name: impl Into<String>, reader_name: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            reader_name: reader_name.into(),
            observers: Mutex::new(Vec::new()),
            exception_handler: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_exception_handler(&self, handler: Arc<dyn ObservationExceptionHandler>) {
        *self.exception_handler.lock().unwrap() = Some(handler);
    }

    /// Registers an observer and spawns its dispatch task. An exception
    /// handler must be in place first, otherwise observer failures would
    /// have nowhere to go.
    pub fn add_observer(&self, observer: Arc<dyn ReaderObserver>) -> Result<(), ServiceError> {
        if self.exception_handler.lock().unwrap().is_none() {
            return Err(ServiceError::IllegalState(
                "an observation exception handler must be set before adding observers"
                    .to_string(),
            ));
        }

        let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<ReaderEvent>>();

        let task_observer = observer.clone();
        let handler = self.exception_handler.clone();
        let plugin_name = self.plugin_name.clone();
        let reader_name = self.reader_name.clone();

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    task_observer.on_reader_event(&event)
                }));

                let error: Option<Box<dyn StdError + Send + Sync>> = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(panic) => {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "observer panicked".to_string());
                        Some(message.into())
                    }
                };

                if let Some(error) = error {
                    deliver_observation_error(&handler, &plugin_name, &reader_name, error);
                }
            }
        });

        self.observers
            .lock()
            .unwrap()
            .push(ObserverEntry { observer, sender });

        Ok(())
    }

    /// Unregisters by identity. Events already queued for the observer are
    /// still delivered before its task winds down.
    pub fn remove_observer(&self, observer: &Arc<dyn ReaderObserver>) {
        self.observers
            .lock()
            .unwrap()
            .retain(|entry| !Arc::ptr_eq(&entry.observer, observer));
    }

    pub fn clear_observers(&self) {
        self.observers.lock().unwrap().clear();
    }

    pub fn count_observers(&self) -> u32 {
        self.observers.lock().unwrap().len() as u32
    }

    /// Publishes an event to every registered observer.
    pub(crate) fn notify(&self, kind: ReaderEventKind, scenario_result: Option<CardSelectionResult>) {
        let event = Arc::new(ReaderEvent {
            plugin_name: self.plugin_name.clone(),
            reader_name: self.reader_name.clone(),
            kind,
            scenario_result,
        });

        log::info!(
            "Reader '{}' notifies {:?} to {} observer(s)",
            self.reader_name,
            kind,
            self.count_observers()
        );

        for entry in self.observers.lock().unwrap().iter() {
            if entry.sender.send(event.clone()).is_err() {
                log::warn!(
                    "Observer dispatch queue of reader '{}' is gone",
                    self.reader_name
                );
            }
        }
    }

    /// Entry point for monitoring jobs: routes a job failure to the
    /// exception handler, or to the log when none is set.
    pub(crate) fn on_monitoring_error(&self, error: ServiceError) {
        deliver_observation_error(
            &self.exception_handler,
            &self.plugin_name,
            &self.reader_name,
            Box::new(error),
        );
    }
}

fn deliver_observation_error(
    handler: &SharedHandler,
    plugin_name: &str,
    reader_name: &str,
    error: Box<dyn StdError + Send + Sync>,
) {
    let handler = handler.lock().unwrap().clone();
    match handler {
        Some(handler) => handler.on_reader_observation_error(plugin_name, reader_name, error),
        None => log::error!(
            "Unhandled observation error on reader '{}' (plugin '{}'): {}",
            reader_name,
            plugin_name,
            error
        ),
    }
}
