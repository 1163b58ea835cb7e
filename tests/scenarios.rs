//! End-to-end scenarios against a scripted fake driver.

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use card_terminal::{
    CardSelectionRequest, CardSelectionScenario, CardSelector, DetectionMode, FileOccurrence,
    MonitoringState, MultiSelectionProcessing, ObservableCardReader,
    ObservationExceptionHandler, ReaderDriver, ReaderEvent, ReaderEventKind, ReaderObserver,
    ServiceError,
};

/// Scripted driver: queued responses, a transmit log for spy assertions,
/// and a switchable card presence flag.
struct FakeDriver {
    responses: Mutex<VecDeque<Vec<u8>>>,
    transmitted: Mutex<Vec<Vec<u8>>>,
    power_on_data: Vec<u8>,
    physical_open: AtomicBool,
    present: AtomicBool,
}

impl FakeDriver {
    fn new(responses: Vec<Vec<u8>>, power_on_data: Vec<u8>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            transmitted: Mutex::new(Vec::new()),
            power_on_data,
            physical_open: AtomicBool::new(false),
            present: AtomicBool::new(false),
        }
    }

    fn transmitted_count(&self) -> usize {
        self.transmitted.lock().unwrap().len()
    }
}

impl ReaderDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake-reader"
    }

    fn is_card_present(&self) -> Result<bool, ServiceError> {
        Ok(self.present.load(Ordering::SeqCst))
    }

    fn is_card_present_ping(&self) -> bool {
        self.present.load(Ordering::SeqCst)
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

fn aid_selector(occurrence: FileOccurrence) -> CardSelector {
    CardSelector::new()
        .filter_by_aid([0xA0, 0x00, 0x00, 0x00, 0x62])
        .unwrap()
        .with_file_occurrence(occurrence)
}

const AID: [u8; 5] = [0xA0, 0x00, 0x00, 0x00, 0x62];

#[test]
fn s1_process_all_aggregates_both_matches() {
    let driver = Arc::new(FakeDriver::new(
        vec![vec![0xAA, 0x90, 0x00], vec![0xBB, 0x90, 0x00]],
        vec![0x3B, 0x00],
    ));
    let reader = card_terminal::CardReader::new("test-plugin", driver.clone());

    let mut scenario = CardSelectionScenario::new(MultiSelectionProcessing::ProcessAll);
    scenario
        .prepare_selection(CardSelectionRequest::new(
            aid_selector(FileOccurrence::First),
            None,
        ))
        .unwrap();
    scenario
        .prepare_selection(CardSelectionRequest::new(
            aid_selector(FileOccurrence::Next),
            None,
        ))
        .unwrap();
    scenario.prepare_release_channel();

    let result = scenario.process_scenario(&reader).unwrap();

    assert_eq!(result.smart_cards().len(), 2);
    assert_eq!(result.smart_cards()[&0].fci(), Some(&[0xAA][..]));
    assert_eq!(result.smart_cards()[&1].fci(), Some(&[0xBB][..]));
    assert_eq!(result.active_index(), Some(0));
    assert!(!driver.is_physical_channel_open());

    // The two selects differ only in P2 (FIRST vs NEXT).
    let transmitted = driver.transmitted.lock().unwrap();
    assert_eq!(transmitted.len(), 2);
    assert_eq!(transmitted[0][3], 0x00);
    assert_eq!(transmitted[1][3], 0x02);
    assert_eq!(&transmitted[0][5..10], &AID);
}

#[test]
fn s2_first_match_stops_before_the_second_selector() {
    let driver = Arc::new(FakeDriver::new(
        vec![vec![0xAA, 0x90, 0x00], vec![0xBB, 0x90, 0x00]],
        vec![0x3B, 0x00],
    ));
    let reader = card_terminal::CardReader::new("test-plugin", driver.clone());

    let mut scenario = CardSelectionScenario::new(MultiSelectionProcessing::FirstMatch);
    scenario
        .prepare_selection(CardSelectionRequest::new(
            aid_selector(FileOccurrence::First),
            None,
        ))
        .unwrap();
    scenario
        .prepare_selection(CardSelectionRequest::new(
            aid_selector(FileOccurrence::Next),
            None,
        ))
        .unwrap();

    let result = scenario.process_scenario(&reader).unwrap();

    assert_eq!(result.smart_cards().len(), 1);
    assert!(result.smart_cards().contains_key(&0));
    assert_eq!(result.active_index(), Some(0));
    // Selector B was never transmitted.
    assert_eq!(driver.transmitted_count(), 1);
    // No release was prepared and a selector matched: channel stays open.
    assert!(driver.is_physical_channel_open());
}

#[test]
fn s3_power_on_data_mismatch_sends_no_apdu() {
    let driver = Arc::new(FakeDriver::new(Vec::new(), vec![0x3F, 0x00]));
    let reader = card_terminal::CardReader::new("test-plugin", driver.clone());

    let mut scenario = CardSelectionScenario::new(MultiSelectionProcessing::FirstMatch);
    scenario
        .prepare_selection(CardSelectionRequest::new(
            CardSelector::new().filter_by_power_on_data("^3B.*").unwrap(),
            None,
        ))
        .unwrap();

    let result = scenario.process_scenario(&reader).unwrap();

    assert!(result.is_empty());
    assert_eq!(result.active_index(), None);
    assert_eq!(driver.transmitted_count(), 0);
    // Zero matches: the channel was released.
    assert!(!driver.is_physical_channel_open());
}

// ───── Observation scenarios ─────

#[derive(Default)]
struct RecordingObserver {
    kinds: Mutex<Vec<ReaderEventKind>>,
}

impl ReaderObserver for RecordingObserver {
    fn on_reader_event(
        &self,
        event: &ReaderEvent,
    ) -> Result<(), Box<dyn StdError + Send + Sync>> {
        self.kinds.lock().unwrap().push(event.kind);
        Ok(())
    }
}

struct PanickyHandler;

impl ObservationExceptionHandler for PanickyHandler {
    fn on_reader_observation_error(
        &self,
        plugin_name: &str,
        reader_name: &str,
        error: Box<dyn StdError + Send + Sync>,
    ) {
        panic!(
            "unexpected observation error on {}/{}: {}",
            plugin_name, reader_name, error
        );
    }
}

async fn wait_for_state(reader: &ObservableCardReader, state: MonitoringState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while reader.monitoring_state() != state {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {:?}, still in {:?}",
            state,
            reader.monitoring_state()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn observed_reader(
    driver: Arc<FakeDriver>,
) -> (ObservableCardReader, Arc<RecordingObserver>) {
    let reader = ObservableCardReader::new("test-plugin", driver);
    reader.set_observation_exception_handler(Arc::new(PanickyHandler));

    let observer = Arc::new(RecordingObserver::default());
    reader
        .add_observer(observer.clone() as Arc<dyn ReaderObserver>)
        .unwrap();

    let mut scenario = CardSelectionScenario::new(MultiSelectionProcessing::FirstMatch);
    scenario
        .prepare_selection(CardSelectionRequest::new(
            aid_selector(FileOccurrence::First),
            None,
        ))
        .unwrap();
    reader.schedule_card_selection_scenario(scenario);

    (reader, observer)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s4_repeating_detection_cycles_back_to_insertion_wait() {
    let driver = Arc::new(FakeDriver::new(
        vec![vec![0xAA, 0x90, 0x00]],
        vec![0x3B, 0x00],
    ));
    let (reader, observer) = observed_reader(driver.clone());

    reader.start_detection(DetectionMode::Repeating).unwrap();
    wait_for_state(&reader, MonitoringState::WaitForCardInsertion).await;

    // A second start while detection runs is refused.
    assert!(reader.start_detection(DetectionMode::Repeating).is_err());

    driver.present.store(true, Ordering::SeqCst);
    wait_for_state(&reader, MonitoringState::WaitForCardProcessing).await;

    reader.finalize_card_processing();
    wait_for_state(&reader, MonitoringState::WaitForCardRemoval).await;

    driver.present.store(false, Ordering::SeqCst);
    wait_for_state(&reader, MonitoringState::WaitForCardInsertion).await;

    // Let the dispatch tasks drain.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        *observer.kinds.lock().unwrap(),
        vec![ReaderEventKind::CardMatched, ReaderEventKind::CardRemoved]
    );

    reader.stop_detection();
    wait_for_state(&reader, MonitoringState::WaitForStartDetection).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s5_singleshot_detection_returns_to_idle() {
    let driver = Arc::new(FakeDriver::new(
        vec![vec![0xAA, 0x90, 0x00]],
        vec![0x3B, 0x00],
    ));
    let (reader, observer) = observed_reader(driver.clone());

    reader.start_detection(DetectionMode::Singleshot).unwrap();
    wait_for_state(&reader, MonitoringState::WaitForCardInsertion).await;

    driver.present.store(true, Ordering::SeqCst);
    wait_for_state(&reader, MonitoringState::WaitForCardProcessing).await;

    reader.finalize_card_processing();
    wait_for_state(&reader, MonitoringState::WaitForCardRemoval).await;

    driver.present.store(false, Ordering::SeqCst);
    wait_for_state(&reader, MonitoringState::WaitForStartDetection).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        *observer.kinds.lock().unwrap(),
        vec![ReaderEventKind::CardMatched, ReaderEventKind::CardRemoved]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn insertion_without_scheduled_scenario_notifies_card_inserted() {
    let driver = Arc::new(FakeDriver::new(Vec::new(), vec![0x3B, 0x00]));
    let reader = ObservableCardReader::new("test-plugin", driver.clone());
    reader.set_observation_exception_handler(Arc::new(PanickyHandler));

    let observer = Arc::new(RecordingObserver::default());
    reader
        .add_observer(observer.clone() as Arc<dyn ReaderObserver>)
        .unwrap();

    reader.start_detection(DetectionMode::Repeating).unwrap();
    wait_for_state(&reader, MonitoringState::WaitForCardInsertion).await;

    driver.present.store(true, Ordering::SeqCst);
    wait_for_state(&reader, MonitoringState::WaitForCardProcessing).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        *observer.kinds.lock().unwrap(),
        vec![ReaderEventKind::CardInserted]
    );

    reader.stop_detection();
    wait_for_state(&reader, MonitoringState::WaitForStartDetection).await;
}
