//! Physical/logical channel bookkeeping for one reader.

// ───── Std Lib ─────
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ───── Local Modules ─────
use crate::apdu::{ApduResponse, CardRequest, CardResponse};
use crate::driver::ReaderDriver;
use crate::error::ServiceError;

/// What to do with the physical channel once an exchange completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelControl {
    KeepOpen,
    CloseAfter,
}

/// Wraps a driver handle and tracks channel state across exchanges.
///
/// The physical channel is the driver's business; the logical channel (an
/// ISO 7816-4 session opened by a successful application selection) is
/// tracked here and dropped whenever the physical channel closes.
pub struct ChannelController {
    driver: Arc<dyn ReaderDriver>,
    logical_channel_open: AtomicBool,
}

impl ChannelController {
    pub fn new(driver: Arc<dyn ReaderDriver>) -> Self {
        Self {
            driver,
            logical_channel_open: AtomicBool::new(false),
        }
    }

    pub fn driver(&self) -> &Arc<dyn ReaderDriver> {
        &self.driver
    }

    pub fn is_logical_channel_open(&self) -> bool {
        self.logical_channel_open.load(Ordering::SeqCst)
    }

    pub(crate) fn set_logical_channel_open(&self, open: bool) {
        self.logical_channel_open.store(open, Ordering::SeqCst);
    }

    pub fn is_physical_channel_open(&self) -> bool {
        self.driver.is_physical_channel_open()
    }

    /// Opens the physical channel if it is not open yet.
    pub fn open_physical_channel(&self) -> Result<(), ServiceError> {
        if self.driver.is_physical_channel_open() {
            return Ok(());
        }
        log::debug!("Opening physical channel on reader '{}'", self.driver.name());
        self.driver.open_physical_channel()
    }

    /// Closes the physical channel. The logical channel dies with it.
    pub fn close_physical_channel(&self) -> Result<(), ServiceError> {
        self.set_logical_channel_open(false);
        if !self.driver.is_physical_channel_open() {
            return Ok(());
        }
        log::debug!("Closing physical channel on reader '{}'", self.driver.name());
        self.driver.close_physical_channel()
    }

    /// Plays the APDUs of `request` in order against the card.
    ///
    /// Stops early when an unaccepted status word comes back and the request
    /// asked for that; the partial response is returned with the logical
    /// channel still open. With [`ChannelControl::CloseAfter`] the physical
    /// channel is closed once the exchange is over, early stop included.
    pub fn transmit_card_request(
        &self,
        request: &CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse, ServiceError> {
        self.open_physical_channel()?;

        let mut responses = Vec::with_capacity(request.apdus().len());

        for apdu in request.apdus() {
            log::debug!(
                "Reader '{}' >> {} ({})",
                self.driver.name(),
                hex::encode_upper(apdu.bytes()),
                apdu.info()
            );

            let bytes = self.driver.transmit_apdu(apdu.bytes())?;
            let response = ApduResponse::new(bytes)?;

            log::debug!(
                "Reader '{}' << {}",
                self.driver.name(),
                hex::encode_upper(response.bytes())
            );

            let status_word = response.status_word();
            let accepted = apdu.is_successful(status_word);
            responses.push(response);

            if !accepted && request.stop_on_unsuccessful_status_word() {
                log::debug!(
                    "Stopping card request on status word {:04X} ({})",
                    status_word,
                    apdu.info()
                );
                break;
            }
        }

        match channel_control {
            ChannelControl::KeepOpen => Ok(CardResponse::new(responses, true)),
            ChannelControl::CloseAfter => {
                self.close_physical_channel()?;
                Ok(CardResponse::new(responses, false))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::ApduRequest;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct StubDriver {
        responses: Mutex<VecDeque<Vec<u8>>>,
        transmitted: Mutex<Vec<Vec<u8>>>,
        physical_open: AtomicBool,
    }

    impl StubDriver {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                transmitted: Mutex::new(Vec::new()),
                physical_open: AtomicBool::new(false),
            }
        }
    }

    impl ReaderDriver for StubDriver {
        fn name(&self) -> &str {
            "stub"
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
            vec![0x3B, 0x00]
        }

        fn activate_protocol(&self, _protocol: &str) -> Result<(), ServiceError> {
            Ok(())
        }

        fn deactivate_protocol(&self, _protocol: &str) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    fn request(stop: bool) -> CardRequest {
        CardRequest::new(
            vec![
                ApduRequest::new(vec![0x00, 0xB0, 0x00, 0x00]).with_info("read 1"),
                ApduRequest::new(vec![0x00, 0xB0, 0x00, 0x01]).with_info("read 2"),
            ],
            stop,
        )
    }

    #[test]
    fn opens_physical_channel_on_demand() {
        let driver = Arc::new(StubDriver::new(vec![vec![0x90, 0x00], vec![0x90, 0x00]]));
        let controller = ChannelController::new(driver.clone());

        assert!(!controller.is_physical_channel_open());
        let response = controller
            .transmit_card_request(&request(false), ChannelControl::KeepOpen)
            .unwrap();

        assert!(controller.is_physical_channel_open());
        assert_eq!(response.apdus().len(), 2);
        assert!(response.is_logical_channel_open());
    }

    #[test]
    fn stops_on_unaccepted_status_word() {
        let driver = Arc::new(StubDriver::new(vec![
            vec![0x6A, 0x82],
            vec![0x90, 0x00],
        ]));
        let controller = ChannelController::new(driver.clone());

        let response = controller
            .transmit_card_request(&request(true), ChannelControl::KeepOpen)
            .unwrap();

        assert_eq!(response.apdus().len(), 1);
        assert!(response.is_logical_channel_open());
        assert_eq!(driver.transmitted.lock().unwrap().len(), 1);
    }

    #[test]
    fn unaccepted_status_word_without_stop_flag_continues() {
        let driver = Arc::new(StubDriver::new(vec![
            vec![0x6A, 0x82],
            vec![0x90, 0x00],
        ]));
        let controller = ChannelController::new(driver);

        let response = controller
            .transmit_card_request(&request(false), ChannelControl::KeepOpen)
            .unwrap();

        assert_eq!(response.apdus().len(), 2);
    }

    #[test]
    fn close_after_closes_physical_channel() {
        let driver = Arc::new(StubDriver::new(vec![vec![0x90, 0x00], vec![0x90, 0x00]]));
        let controller = ChannelController::new(driver);
        controller.set_logical_channel_open(true);

        let response = controller
            .transmit_card_request(&request(false), ChannelControl::CloseAfter)
            .unwrap();

        assert!(!response.is_logical_channel_open());
        assert!(!controller.is_physical_channel_open());
        assert!(!controller.is_logical_channel_open());
    }

    #[test]
    fn transport_failure_propagates() {
        let driver = Arc::new(StubDriver::new(vec![vec![0x90, 0x00]]));
        let controller = ChannelController::new(driver);

        let err = controller
            .transmit_card_request(&request(false), ChannelControl::KeepOpen)
            .unwrap_err();

        assert!(matches!(err, ServiceError::CardCommunication(_)));
    }
}
