//! Background monitoring jobs.
//!
//! One job is active per observation state that needs one. Jobs run as
//! tokio tasks; blocking driver calls are pushed onto the blocking pool.
//! Cancellation is cooperative through an atomic flag, so `stop()` never
//! blocks and a second call is a no-op.

// ───── Std Lib ─────
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ───── Crates ─────
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ───── Local Modules ─────
use crate::driver::ReaderDriver;
use crate::observation::ObservationManager;
use crate::state_machine::InternalEvent;

/// Default cycle of the active removal polling job.
pub const DEFAULT_REMOVAL_CYCLE: Duration = Duration::from_millis(200);

/// Everything a job needs: the driver to watch, the event queue of the
/// state machine, and the error route towards the exception handler.
#[derive(Clone)]
pub(crate) struct MonitoringContext {
    pub(crate) driver: Arc<dyn ReaderDriver>,
    pub(crate) events: mpsc::UnboundedSender<InternalEvent>,
    pub(crate) observation: Arc<ObservationManager>,
}

impl MonitoringContext {
    fn emit(&self, running: &AtomicBool, event: InternalEvent) {
        // A stopped job must not feed the state machine anymore.
        if !running.load(Ordering::SeqCst) {
            return;
        }
        if self.events.send(event).is_err() {
            log::debug!(
                "Monitoring event {:?} dropped, reader '{}' is shutting down",
                event,
                self.driver.name()
            );
        }
    }
}

/// Handle on a spawned monitoring job.
pub struct JobHandle {
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    on_stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl JobHandle {
    fn new(
        running: Arc<AtomicBool>,
        task: Option<JoinHandle<()>>,
        on_stop: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            running,
            task: Mutex::new(task),
            on_stop: Mutex::new(on_stop),
        }
    }

    /// Signals the job to wind down. Idempotent and non-blocking; a job
    /// that already exited is left alone.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            if let Some(cleanup) = self.on_stop.lock().unwrap().take() {
                cleanup();
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    /// Waits for the job task to finish. Returns immediately for listener
    /// based jobs, which have no task of their own.
    pub async fn join(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Blocking insertion watch: one driver wait, then `CardInserted` or
/// `TimeOut`.
pub(crate) fn start_blocking_insertion_job(
    ctx: MonitoringContext,
    timeout: Duration,
) -> JobHandle {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();

    let task = tokio::spawn(async move {
        let driver = ctx.driver.clone();
        let waited =
            tokio::task::spawn_blocking(move || driver.wait_for_card_insertion(timeout)).await;

        match waited {
            Ok(Ok(true)) => ctx.emit(&flag, InternalEvent::CardInserted),
            Ok(Ok(false)) => ctx.emit(&flag, InternalEvent::TimeOut),
            Ok(Err(e)) => {
                ctx.observation.on_monitoring_error(e);
                ctx.emit(&flag, InternalEvent::TimeOut);
            }
            Err(e) => log::error!("Insertion wait task failed: {}", e),
        }
    });

    JobHandle::new(running, Some(task), None)
}

/// Blocking removal watch: one driver wait, then `CardRemoved`.
pub(crate) fn start_blocking_removal_job(ctx: MonitoringContext) -> JobHandle {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();

    let task = tokio::spawn(async move {
        let driver = ctx.driver.clone();
        let waited = tokio::task::spawn_blocking(move || driver.wait_for_card_removal()).await;

        match waited {
            Ok(Ok(())) => ctx.emit(&flag, InternalEvent::CardRemoved),
            Ok(Err(e)) => {
                // A failed wait usually means the card is already gone.
                ctx.observation.on_monitoring_error(e);
                ctx.emit(&flag, InternalEvent::CardRemoved);
            }
            Err(e) => log::error!("Removal wait task failed: {}", e),
        }
    });

    JobHandle::new(running, Some(task), None)
}

/// Active insertion polling: probes presence every `cycle` until a card
/// shows up or the job is stopped.
pub(crate) fn start_polling_insertion_job(ctx: MonitoringContext, cycle: Duration) -> JobHandle {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();

    let task = tokio::spawn(async move {
        while flag.load(Ordering::SeqCst) {
            let driver = ctx.driver.clone();
            let probed = tokio::task::spawn_blocking(move || driver.is_card_present()).await;

            match probed {
                Ok(Ok(true)) => {
                    ctx.emit(&flag, InternalEvent::CardInserted);
                    return;
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => ctx.observation.on_monitoring_error(e),
                Err(e) => {
                    log::error!("Insertion probe task failed: {}", e);
                    return;
                }
            }

            tokio::time::sleep(cycle).await;
        }
    });

    JobHandle::new(running, Some(task), None)
}

/// Active removal polling: pings the card with a neutral APDU every
/// `cycle`; the first failed ping fires `CardRemoved` and ends the job.
pub(crate) fn start_polling_removal_job(ctx: MonitoringContext, cycle: Duration) -> JobHandle {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();

    let task = tokio::spawn(async move {
        while flag.load(Ordering::SeqCst) {
            let driver = ctx.driver.clone();
            let present =
                tokio::task::spawn_blocking(move || driver.is_card_present_ping()).await;

            match present {
                Ok(true) => {
                    log::debug!("Card still present on reader '{}'", ctx.driver.name());
                }
                Ok(false) => {
                    ctx.emit(&flag, InternalEvent::CardRemoved);
                    return;
                }
                Err(e) => {
                    log::error!("Removal ping task failed: {}", e);
                    return;
                }
            }

            tokio::time::sleep(cycle).await;
        }
    });

    JobHandle::new(running, Some(task), None)
}

/// Smart insertion: the driver notifies by itself, the job only owns the
/// listener registration.
pub(crate) fn start_smart_insertion_job(ctx: MonitoringContext) -> JobHandle {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let events = ctx.events.clone();
    let listener_driver = ctx.driver.clone();

    ctx.driver.set_card_insertion_listener(Some(Box::new(move || {
        if flag.load(Ordering::SeqCst) && events.send(InternalEvent::CardInserted).is_err() {
            log::debug!("Smart insertion event dropped, reader is shutting down");
        }
    })));

    JobHandle::new(
        running,
        None,
        Some(Box::new(move || {
            listener_driver.set_card_insertion_listener(None)
        })),
    )
}
