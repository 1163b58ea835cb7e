//! Reader front ends.
//!
//! [`CardReader`] is the plain synchronous face of one driver: channel
//! bookkeeping, protocol activation, APDU transmission. An
//! [`ObservableCardReader`] adds the asynchronous observation machinery on
//! top: the internal event queue, the state machine pump, the monitoring
//! jobs and the observer dispatch.

// ───── Std Lib ─────
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

// ───── Crates ─────
use tokio::sync::mpsc;

// ───── Local Modules ─────
use crate::apdu::{ApduRequest, ApduResponse, CardRequest, CardResponse};
use crate::channel::{ChannelControl, ChannelController};
use crate::config;
use crate::driver::{InsertionDetection, ReaderDriver, RemovalDetection};
use crate::error::ServiceError;
use crate::monitoring::{
    start_blocking_insertion_job, start_blocking_removal_job, start_polling_insertion_job,
    start_polling_removal_job, start_smart_insertion_job, JobHandle, MonitoringContext,
};
use crate::observation::{
    ObservationExceptionHandler, ObservationManager, ReaderEventKind, ReaderObserver,
};
use crate::scenario::CardSelectionScenario;
use crate::state_machine::{transition, DetectionMode, InternalEvent, MonitoringState, Transition};

/// A reader without observation: the caller drives every exchange itself.
pub struct CardReader {
    plugin_name: String,
    channel: ChannelController,
    active_protocols: Mutex<HashSet<String>>,
    power_on_data: Mutex<Option<String>>,
}

impl std::fmt::Debug for CardReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardReader")
            .field("plugin_name", &self.plugin_name)
            .field("name", &self.name())
            .finish()
    }
}

impl CardReader {
    pub fn new(plugin_name: impl Into<String>, driver: Arc<dyn ReaderDriver>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            channel: ChannelController::new(driver),
            active_protocols: Mutex::new(HashSet::new()),
            power_on_data: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.channel.driver().name()
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub(crate) fn channel(&self) -> &ChannelController {
        &self.channel
    }

    pub fn is_card_present(&self) -> Result<bool, ServiceError> {
        self.channel.driver().is_card_present()
    }

    /// Activates a protocol on the driver and remembers it for selector
    /// filtering.
    pub fn activate_protocol(&self, protocol: &str) -> Result<(), ServiceError> {
        self.channel.driver().activate_protocol(protocol)?;
        self.active_protocols
            .lock()
            .unwrap()
            .insert(protocol.to_string());
        Ok(())
    }

    pub fn deactivate_protocol(&self, protocol: &str) -> Result<(), ServiceError> {
        self.channel.driver().deactivate_protocol(protocol)?;
        self.active_protocols.lock().unwrap().remove(protocol);
        Ok(())
    }

    pub(crate) fn is_protocol_active(&self, protocol: &str) -> bool {
        self.active_protocols.lock().unwrap().contains(protocol)
    }

    /// Power-on data of the present card as upper-case hex, read once per
    /// physical session and cached until the channel is released.
    pub fn power_on_data(&self) -> Result<String, ServiceError> {
        if let Some(cached) = self.power_on_data.lock().unwrap().clone() {
            return Ok(cached);
        }

        self.channel.open_physical_channel()?;
        let data = hex::encode_upper(self.channel.driver().get_power_on_data());
        *self.power_on_data.lock().unwrap() = Some(data.clone());
        Ok(data)
    }

    /// Closes the physical channel and forgets the cached power-on data.
    pub fn release_channel(&self) -> Result<(), ServiceError> {
        self.power_on_data.lock().unwrap().take();
        self.channel.close_physical_channel()
    }

    /// Close/reopen cycle after a card communication failure.
    pub(crate) fn recover_channel(&self) -> Result<(), ServiceError> {
        self.power_on_data.lock().unwrap().take();
        self.channel.close_physical_channel()?;
        self.channel.open_physical_channel()
    }

    pub fn transmit_card_request(
        &self,
        request: &CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse, ServiceError> {
        self.channel.transmit_card_request(request, channel_control)
    }

    /// Transmits a single APDU and insists on an accepted status word.
    pub fn transmit_apdu_strict(
        &self,
        apdu: &ApduRequest,
        channel_control: ChannelControl,
    ) -> Result<ApduResponse, ServiceError> {
        let request = CardRequest::new(vec![apdu.clone()], false);
        let card_response = self.channel.transmit_card_request(&request, channel_control)?;

        let response = card_response.apdus().first().cloned().ok_or_else(|| {
            ServiceError::CardCommunication("no response collected".to_string())
        })?;

        if !apdu.is_successful(response.status_word()) {
            return Err(ServiceError::UnexpectedStatusWord {
                status_word: response.status_word(),
                info: apdu.info().to_string(),
            });
        }

        Ok(response)
    }
}

struct MonitoringRuntime {
    state: MonitoringState,
    detection_mode: DetectionMode,
    job: Option<JobHandle>,
    scheduled_scenario: Option<CardSelectionScenario>,
    insertion_timeout: Duration,
    insertion_cycle: Duration,
    removal_cycle: Duration,
}

struct ReaderInner {
    reader: CardReader,
    observation: Arc<ObservationManager>,
    events: mpsc::UnboundedSender<InternalEvent>,
    monitoring: Mutex<MonitoringRuntime>,
}

/// A reader whose card lifecycle is watched in the background.
///
/// Must be created from within a tokio runtime: construction spawns the
/// event pump task that serializes all state transitions of this reader.
pub struct ObservableCardReader {
    inner: Arc<ReaderInner>,
}

impl Deref for ObservableCardReader {
    type Target = CardReader;

    fn deref(&self) -> &CardReader {
        &self.inner.reader
    }
}

impl ObservableCardReader {
    pub fn new(plugin_name: impl Into<String>, driver: Arc<dyn ReaderDriver>) -> Self {
        let plugin_name = plugin_name.into();
        let reader_name = driver.name().to_string();
        let monitoring = config::monitoring_config();

        let (events, receiver) = mpsc::unbounded_channel();

        let inner = Arc::new(ReaderInner {
            reader: CardReader::new(plugin_name.clone(), driver),
            observation: Arc::new(ObservationManager::new(plugin_name, reader_name)),
            events,
            monitoring: Mutex::new(MonitoringRuntime {
                state: MonitoringState::WaitForStartDetection,
                detection_mode: DetectionMode::Repeating,
                job: None,
                scheduled_scenario: None,
                insertion_timeout: Duration::from_millis(monitoring.insertion_timeout_ms),
                insertion_cycle: Duration::from_millis(monitoring.insertion_cycle_ms),
                removal_cycle: Duration::from_millis(monitoring.removal_cycle_ms),
            }),
        });

        tokio::spawn(run_event_pump(Arc::downgrade(&inner), receiver));

        Self { inner }
    }

    pub fn reader(&self) -> &CardReader {
        &self.inner.reader
    }

    pub fn monitoring_state(&self) -> MonitoringState {
        self.inner.monitoring.lock().unwrap().state
    }

    pub fn set_observation_exception_handler(
        &self,
        handler: Arc<dyn ObservationExceptionHandler>,
    ) {
        self.inner.observation.set_exception_handler(handler);
    }

    pub fn add_observer(&self, observer: Arc<dyn ReaderObserver>) -> Result<(), ServiceError> {
        self.inner.observation.add_observer(observer)
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ReaderObserver>) {
        self.inner.observation.remove_observer(observer);
    }

    pub fn clear_observers(&self) {
        self.inner.observation.clear_observers();
    }

    pub fn count_observers(&self) -> u32 {
        self.inner.observation.count_observers()
    }

    /// Stores the scenario replayed automatically on every card insertion.
    pub fn schedule_card_selection_scenario(&self, scenario: CardSelectionScenario) {
        self.inner.monitoring.lock().unwrap().scheduled_scenario = Some(scenario);
    }

    /// Starts card detection. Fails when detection is already running.
    pub fn start_detection(&self, mode: DetectionMode) -> Result<(), ServiceError> {
        {
            let mut runtime = self.inner.monitoring.lock().unwrap();
            if runtime.state != MonitoringState::WaitForStartDetection {
                return Err(ServiceError::IllegalState(format!(
                    "detection already started on reader '{}'",
                    self.inner.reader.name()
                )));
            }
            runtime.detection_mode = mode;
        }

        log::info!(
            "Starting card detection on reader '{}' ({:?})",
            self.inner.reader.name(),
            mode
        );
        self.post(InternalEvent::StartDetect);
        Ok(())
    }

    /// Stops card detection. The active monitoring job is signalled right
    /// away so blocking waits wind down without waiting for the pump.
    pub fn stop_detection(&self) {
        log::info!("Stopping card detection on reader '{}'", self.inner.reader.name());
        self.post(InternalEvent::StopDetect);

        if let Some(job) = &self.inner.monitoring.lock().unwrap().job {
            job.stop();
        }
    }

    /// Tells the reader the application is done with the inserted card.
    pub fn finalize_card_processing(&self) {
        self.post(InternalEvent::CardProcessed);
    }

    fn post(&self, event: InternalEvent) {
        if self.inner.events.send(event).is_err() {
            log::warn!(
                "Event {:?} dropped, reader '{}' pump is gone",
                event,
                self.inner.reader.name()
            );
        }
    }
}

impl Drop for ObservableCardReader {
    fn drop(&mut self) {
        // Stop the active job so it releases its event sender and the pump
        // can wind down once the last sender is gone.
        if let Some(job) = self.inner.monitoring.lock().unwrap().job.take() {
            job.stop();
        }
    }
}

/// Serializes every state transition of one reader.
async fn run_event_pump(
    weak: Weak<ReaderInner>,
    mut receiver: mpsc::UnboundedReceiver<InternalEvent>,
) {
    while let Some(event) = receiver.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        handle_event(&inner, event).await;
    }
    log::debug!("Reader event pump terminated");
}

async fn handle_event(inner: &Arc<ReaderInner>, event: InternalEvent) {
    // State and job pointer updates happen under the lock; everything that
    // can block happens after it is released.
    let (previous, next, outgoing_job) = {
        let mut runtime = inner.monitoring.lock().unwrap();
        match transition(runtime.state, event, runtime.detection_mode) {
            Transition::Ignore => {
                log::debug!(
                    "Event {:?} ignored in state {:?} on reader '{}'",
                    event,
                    runtime.state,
                    inner.reader.name()
                );
                return;
            }
            Transition::To(next) => {
                let previous = runtime.state;
                runtime.state = next;
                (previous, next, runtime.job.take())
            }
        }
    };

    log::debug!(
        "Reader '{}': {:?} --{:?}--> {:?}",
        inner.reader.name(),
        previous,
        event,
        next
    );

    // Deactivate the outgoing state before the incoming one starts.
    if let Some(job) = outgoing_job {
        job.stop();
    }

    match event {
        InternalEvent::CardInserted if next == MonitoringState::WaitForCardProcessing => {
            process_inserted_card(inner).await;
        }
        InternalEvent::CardRemoved => {
            let _ = inner.reader.release_channel();
            inner.observation.notify(ReaderEventKind::CardRemoved, None);
        }
        InternalEvent::TimeOut => {
            inner.observation.notify(ReaderEventKind::Unavailable, None);
        }
        _ => {}
    }

    activate_state(inner, next);
}

/// Runs the scheduled scenario (when any) and publishes the outcome.
async fn process_inserted_card(inner: &Arc<ReaderInner>) {
    let scenario = inner.monitoring.lock().unwrap().scheduled_scenario.clone();

    let Some(scenario) = scenario else {
        inner.observation.notify(ReaderEventKind::CardInserted, None);
        return;
    };

    let task_inner = inner.clone();
    let outcome =
        tokio::task::spawn_blocking(move || scenario.process_scenario(&task_inner.reader)).await;

    match outcome {
        Ok(Ok(result)) if !result.is_empty() => {
            inner
                .observation
                .notify(ReaderEventKind::CardMatched, Some(result));
        }
        Ok(Ok(result)) => {
            inner
                .observation
                .notify(ReaderEventKind::CardInserted, Some(result));
        }
        Ok(Err(error)) => {
            log::warn!(
                "Scheduled selection scenario failed on reader '{}': {}",
                inner.reader.name(),
                error
            );
            inner.observation.on_monitoring_error(error);
            // The card most likely left mid-exchange.
            let _ = inner.events.send(InternalEvent::CardRemoved);
        }
        Err(e) => log::error!("Selection scenario task failed: {}", e),
    }
}

/// Starts the monitoring job of the incoming state, if it has one.
fn activate_state(inner: &Arc<ReaderInner>, state: MonitoringState) {
    let driver = inner.reader.channel().driver().clone();
    let ctx = MonitoringContext {
        driver: driver.clone(),
        events: inner.events.clone(),
        observation: inner.observation.clone(),
    };

    let mut runtime = inner.monitoring.lock().unwrap();

    let job = match state {
        MonitoringState::WaitForCardInsertion => Some(match driver.insertion_detection() {
            InsertionDetection::Blocking => {
                start_blocking_insertion_job(ctx, runtime.insertion_timeout)
            }
            InsertionDetection::Polling => {
                start_polling_insertion_job(ctx, runtime.insertion_cycle)
            }
            InsertionDetection::Smart => start_smart_insertion_job(ctx),
        }),
        MonitoringState::WaitForCardRemoval => Some(match driver.removal_detection() {
            RemovalDetection::Blocking => start_blocking_removal_job(ctx),
            RemovalDetection::Polling => start_polling_removal_job(ctx, runtime.removal_cycle),
        }),
        // No probe may touch the card while it is being processed, and the
        // idle state watches nothing.
        MonitoringState::WaitForCardProcessing | MonitoringState::WaitForStartDetection => None,
    };

    runtime.job = job;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub(crate) struct ScriptedDriver {
        pub(crate) responses: Mutex<VecDeque<Vec<u8>>>,
        pub(crate) transmitted: Mutex<Vec<Vec<u8>>>,
        pub(crate) power_on_data: Vec<u8>,
        pub(crate) physical_open: AtomicBool,
    }

    impl ScriptedDriver {
        pub(crate) fn new(responses: Vec<Vec<u8>>, power_on_data: Vec<u8>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                transmitted: Mutex::new(Vec::new()),
                power_on_data,
                physical_open: AtomicBool::new(false),
            }
        }
    }

    impl ReaderDriver for ScriptedDriver {
        fn name(&self) -> &str {
            "scripted"
        }

        fn is_card_present(&self) -> Result<bool, ServiceError> {
            Ok(true)
        }

        fn is_card_present_ping(&self) -> bool {
            true
        }

        fn open_physical_channel(&self) -> Result<(), ServiceError> {
            self.physical_open.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn close_physical_channel(&self) -> Result<(), ServiceError> {
            self.physical_open.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_physical_channel_open(&self) -> bool {
            self.physical_open.load(Ordering::SeqCst)
        }

        fn transmit_apdu(&self, apdu: &[u8]) -> Result<Vec<u8>, ServiceError> {
            self.transmitted.lock().unwrap().push(apdu.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ServiceError::CardCommunication("no scripted response".to_string()))
        }

        fn get_power_on_data(&self) -> Vec<u8> {
            self.power_on_data.clone()
        }

        fn activate_protocol(&self, _protocol: &str) -> Result<(), ServiceError> {
            Ok(())
        }

        fn deactivate_protocol(&self, _protocol: &str) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    pub(crate) fn test_reader(responses: Vec<Vec<u8>>) -> CardReader {
        CardReader::new(
            "test-plugin",
            Arc::new(ScriptedDriver::new(responses, vec![0x3B, 0x00])),
        )
    }

    #[test]
    fn strict_transmit_accepts_good_status_word() {
        let reader = test_reader(vec![vec![0x01, 0x90, 0x00]]);
        let apdu = ApduRequest::new(vec![0x00, 0xB0, 0x00, 0x00]).with_info("Read Binary");

        let response = reader
            .transmit_apdu_strict(&apdu, ChannelControl::KeepOpen)
            .unwrap();
        assert_eq!(response.data(), &[0x01]);
    }

    #[test]
    fn strict_transmit_rejects_bad_status_word() {
        let reader = test_reader(vec![vec![0x6A, 0x82]]);
        let apdu = ApduRequest::new(vec![0x00, 0xB0, 0x00, 0x00]).with_info("Read Binary");

        let err = reader
            .transmit_apdu_strict(&apdu, ChannelControl::KeepOpen)
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::UnexpectedStatusWord {
                status_word: 0x6A82,
                ..
            }
        ));
    }

    #[test]
    fn protocol_activation_is_tracked() {
        let reader = test_reader(Vec::new());

        assert!(!reader.is_protocol_active("ISO_14443_4"));
        reader.activate_protocol("ISO_14443_4").unwrap();
        assert!(reader.is_protocol_active("ISO_14443_4"));
        reader.deactivate_protocol("ISO_14443_4").unwrap();
        assert!(!reader.is_protocol_active("ISO_14443_4"));
    }

    #[test]
    fn power_on_data_is_cached_until_release() {
        let reader = test_reader(Vec::new());

        assert_eq!(reader.power_on_data().unwrap(), "3B00");
        assert!(reader.channel().is_physical_channel_open());

        reader.release_channel().unwrap();
        assert!(!reader.channel().is_physical_channel_open());
        // Re-read after release works and reopens the channel.
        assert_eq!(reader.power_on_data().unwrap(), "3B00");
    }
}
