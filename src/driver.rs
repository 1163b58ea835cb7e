//! Contracts implemented by reader plugins and card extensions.
//!
//! The service itself never talks to hardware. It drives whatever
//! [`ReaderDriver`] a plugin hands out and stays agnostic of the transport
//! behind it (contact, contactless, remote, pooled).

// ───── Std Lib ─────
use std::time::Duration;

// ───── Local Modules ─────
use crate::error::ServiceError;
use crate::selector::{CardSelectionRequest, CardSelector};

/// Callback registered on drivers that push insertion notifications
/// themselves instead of being polled.
pub type CardInsertionListener = Box<dyn Fn() + Send + Sync>;

/// How card insertion can be detected on a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertionDetection {
    /// The driver offers a blocking `wait_for_card_insertion`.
    Blocking,
    /// The service probes `is_card_present` on a cycle.
    Polling,
    /// The driver notifies through a registered listener.
    Smart,
}

/// How card removal can be detected on a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalDetection {
    /// The driver offers a blocking `wait_for_card_removal`.
    Blocking,
    /// The service pings the card with a neutral APDU on a cycle.
    Polling,
}

/// Low level transport primitive owned by a reader.
///
/// All methods are synchronous; callers that must not block wrap them in
/// `tokio::task::spawn_blocking`. The blocking-wait and listener entries are
/// optional: a driver only overrides the ones matching the detection modes
/// it declares.
pub trait ReaderDriver: Send + Sync {
    fn name(&self) -> &str;

    fn is_card_present(&self) -> Result<bool, ServiceError>;

    /// Probes the card with a neutral APDU. `false` means the card no
    /// longer answers.
    fn is_card_present_ping(&self) -> bool;

    fn open_physical_channel(&self) -> Result<(), ServiceError>;

    fn close_physical_channel(&self) -> Result<(), ServiceError>;

    fn is_physical_channel_open(&self) -> bool;

    fn transmit_apdu(&self, apdu: &[u8]) -> Result<Vec<u8>, ServiceError>;

    /// Raw power-on data (ATR for contact cards, possibly empty for
    /// contactless ones). Requires an open physical channel.
    fn get_power_on_data(&self) -> Vec<u8>;

    fn activate_protocol(&self, protocol: &str) -> Result<(), ServiceError>;

    fn deactivate_protocol(&self, protocol: &str) -> Result<(), ServiceError>;

    fn insertion_detection(&self) -> InsertionDetection {
        InsertionDetection::Polling
    }

    fn removal_detection(&self) -> RemovalDetection {
        RemovalDetection::Polling
    }

    /// Blocks until a card is inserted or the timeout elapses. Returns
    /// `true` on insertion, `false` on timeout.
    fn wait_for_card_insertion(&self, timeout: Duration) -> Result<bool, ServiceError> {
        let _ = timeout;
        Err(ServiceError::IllegalState(format!(
            "driver '{}' does not support blocking insertion detection",
            self.name()
        )))
    }

    /// Blocks until the card currently present is removed.
    fn wait_for_card_removal(&self) -> Result<(), ServiceError> {
        Err(ServiceError::IllegalState(format!(
            "driver '{}' does not support blocking removal detection",
            self.name()
        )))
    }

    /// Registers (`Some`) or clears (`None`) the insertion listener on a
    /// smart driver.
    fn set_card_insertion_listener(&self, listener: Option<CardInsertionListener>) {
        let _ = listener;
        log::warn!(
            "Driver '{}' ignores insertion listeners. Declared detection mode is {:?}.",
            self.name(),
            self.insertion_detection()
        );
    }
}

/// Domain specific builder turning a high level selector description into a
/// ready-to-run selection request.
pub trait CardExtension {
    /// Packages a selector, possibly with follow-up APDUs, into a
    /// [`CardSelectionRequest`].
    fn create_card_selection(&self, selector: CardSelector) -> CardSelectionRequest;

    /// Verifies that the extension was compiled against a compatible
    /// service API.
    fn check_service_version(&self, major: u32, minor: u32) -> Result<(), ServiceError> {
        let expected = major * 100 + minor;
        let actual = version_to_number(env!("CARGO_PKG_VERSION")) / 100;

        if expected > actual {
            return Err(ServiceError::IllegalState(format!(
                "card extension requires service API {}.{}, running {}",
                major,
                minor,
                env!("CARGO_PKG_VERSION")
            )));
        }

        Ok(())
    }
}

fn version_to_number(version: &str) -> u32 {
    version
        .trim_start_matches('v')
        .split('.')
        .filter_map(|s| s.parse::<u32>().ok())
        .fold(0, |acc, num| acc * 100 + num)
}
