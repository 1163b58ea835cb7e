//! Card selection data model.
//!
//! A [`CardSelector`] describes one application the caller is interested in:
//! an AID, optional power-on data and protocol filters, and the P2 options
//! of the Select Application command. Selectors are packaged into
//! [`CardSelectionRequest`]s (usually by a card extension) and executed by a
//! selection scenario.

// ───── Std Lib ─────
use std::collections::{BTreeMap, HashSet};

// ───── Local Modules ─────
use crate::apdu::{ApduRequest, ApduResponse, CardRequest, CardResponse, SW_SUCCESS};
use crate::error::ServiceError;

/// Maximum AID length allowed by ISO 7816-4.
pub const AID_MAX_LENGTH: usize = 16;

/// Navigation option of the Select Application command (ISO 7816-4 §7.1.1,
/// P2 bits b2b1). The card interprets it; the service only encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOccurrence {
    First,
    Last,
    Next,
    Previous,
}

impl FileOccurrence {
    fn p2(self) -> u8 {
        match self {
            FileOccurrence::First => 0x00,
            FileOccurrence::Last => 0x01,
            FileOccurrence::Next => 0x02,
            FileOccurrence::Previous => 0x03,
        }
    }
}

/// Kind of control information requested from the Select Application
/// command (ISO 7816-4 §7.1.1, P2 bits b4b3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControlInformation {
    Fci,
    Fcp,
    Fmd,
    NoResponse,
}

impl FileControlInformation {
    fn p2(self) -> u8 {
        match self {
            FileControlInformation::Fci => 0x00,
            FileControlInformation::Fcp => 0x04,
            FileControlInformation::Fmd => 0x08,
            FileControlInformation::NoResponse => 0x0C,
        }
    }
}

/// Filters and options identifying one card application.
///
/// At least one of the AID or the power-on data regex should discriminate,
/// otherwise every card matches.
#[derive(Debug, Clone)]
pub struct CardSelector {
    card_protocol: Option<String>,
    power_on_data_regex: Option<String>,
    aid: Option<Vec<u8>>,
    file_occurrence: FileOccurrence,
    file_control_information: FileControlInformation,
    successful_selection_status_words: HashSet<u16>,
}

impl Default for CardSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl CardSelector {
    pub fn new() -> Self {
        let mut successful_selection_status_words = HashSet::new();
        successful_selection_status_words.insert(SW_SUCCESS);

        Self {
            card_protocol: None,
            power_on_data_regex: None,
            aid: None,
            file_occurrence: FileOccurrence::First,
            file_control_information: FileControlInformation::Fci,
            successful_selection_status_words,
        }
    }

    /// Restricts the selector to cards reached through the given protocol.
    pub fn filter_by_card_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.card_protocol = Some(protocol.into());
        self
    }

    /// Restricts the selector to cards whose power-on data (upper-case hex)
    /// matches the given regular expression.
    pub fn filter_by_power_on_data(mut self, regex: impl Into<String>) -> Result<Self, ServiceError> {
        let regex = regex.into();
        regex::Regex::new(&regex).map_err(|e| {
            ServiceError::IllegalState(format!("invalid power-on data regex '{}': {}", regex, e))
        })?;
        self.power_on_data_regex = Some(regex);
        Ok(self)
    }

    /// Targets the application identified by `aid` (1 to 16 bytes).
    pub fn filter_by_aid(mut self, aid: impl AsRef<[u8]>) -> Result<Self, ServiceError> {
        let aid = aid.as_ref();
        if aid.is_empty() || aid.len() > AID_MAX_LENGTH {
            return Err(ServiceError::IllegalState(format!(
                "AID must be 1..={} bytes, got {}",
                AID_MAX_LENGTH,
                aid.len()
            )));
        }
        self.aid = Some(aid.to_vec());
        Ok(self)
    }

    pub fn with_file_occurrence(mut self, file_occurrence: FileOccurrence) -> Self {
        self.file_occurrence = file_occurrence;
        self
    }

    pub fn with_file_control_information(
        mut self,
        file_control_information: FileControlInformation,
    ) -> Self {
        self.file_control_information = file_control_information;
        self
    }

    /// Accepts an additional selection status word besides `0x9000`, e.g.
    /// `0x6283` for an invalidated application.
    pub fn with_successful_selection_status_word(mut self, status_word: u16) -> Self {
        self.successful_selection_status_words.insert(status_word);
        self
    }

    pub fn card_protocol(&self) -> Option<&str> {
        self.card_protocol.as_deref()
    }

    pub fn power_on_data_regex(&self) -> Option<&str> {
        self.power_on_data_regex.as_deref()
    }

    pub fn aid(&self) -> Option<&[u8]> {
        self.aid.as_deref()
    }

    pub fn file_occurrence(&self) -> FileOccurrence {
        self.file_occurrence
    }

    pub fn file_control_information(&self) -> FileControlInformation {
        self.file_control_information
    }

    pub fn successful_selection_status_words(&self) -> &HashSet<u16> {
        &self.successful_selection_status_words
    }

    /// Builds the Select Application APDU, or `None` for an AID-less
    /// selector (power-on data filtering only).
    pub(crate) fn build_select_application_apdu(&self) -> Option<ApduRequest> {
        let aid = self.aid.as_ref()?;

        let p2 = self.file_occurrence.p2() | self.file_control_information.p2();

        let mut bytes = Vec::with_capacity(6 + aid.len());
        bytes.extend_from_slice(&[0x00, 0xA4, 0x04, p2, aid.len() as u8]);
        bytes.extend_from_slice(aid);
        if self.file_control_information != FileControlInformation::NoResponse {
            bytes.push(0x00); // Le
        }

        let mut apdu = ApduRequest::new(bytes)
            .with_info(format!("Select Application {}", hex::encode_upper(aid)));
        for &sw in &self.successful_selection_status_words {
            apdu = apdu.with_successful_status_word(sw);
        }

        Some(apdu)
    }
}

/// A selector plus the optional APDUs to run right after a successful
/// selection. Produced by a card extension.
#[derive(Debug, Clone)]
pub struct CardSelectionRequest {
    selector: CardSelector,
    card_request: Option<CardRequest>,
}

impl CardSelectionRequest {
    pub fn new(selector: CardSelector, card_request: Option<CardRequest>) -> Self {
        Self {
            selector,
            card_request,
        }
    }

    pub fn selector(&self) -> &CardSelector {
        &self.selector
    }

    pub fn card_request(&self) -> Option<&CardRequest> {
        self.card_request.as_ref()
    }
}

/// Outcome of one selector within a scenario, matched or not.
#[derive(Debug, Clone)]
pub struct CardSelectionResponse {
    power_on_data: Option<String>,
    select_application_response: Option<ApduResponse>,
    has_matched: bool,
    card_response: Option<CardResponse>,
}

impl CardSelectionResponse {
    pub(crate) fn not_matched(power_on_data: Option<String>) -> Self {
        Self {
            power_on_data,
            select_application_response: None,
            has_matched: false,
            card_response: None,
        }
    }

    pub(crate) fn new(
        power_on_data: Option<String>,
        select_application_response: Option<ApduResponse>,
        has_matched: bool,
        card_response: Option<CardResponse>,
    ) -> Self {
        Self {
            power_on_data,
            select_application_response,
            has_matched,
            card_response,
        }
    }

    pub fn power_on_data(&self) -> Option<&str> {
        self.power_on_data.as_deref()
    }

    pub fn select_application_response(&self) -> Option<&ApduResponse> {
        self.select_application_response.as_ref()
    }

    pub fn has_matched(&self) -> bool {
        self.has_matched
    }

    pub fn card_response(&self) -> Option<&CardResponse> {
        self.card_response.as_ref()
    }
}

/// Image of a card application selected during a scenario. Owns copies of
/// its FCI/ATR bytes and keeps no reference to the reader.
#[derive(Debug, Clone)]
pub struct SmartCard {
    power_on_data: Option<String>,
    select_application_response: Option<ApduResponse>,
    card_response: Option<CardResponse>,
}

impl SmartCard {
    pub(crate) fn from_selection_response(response: &CardSelectionResponse) -> Self {
        Self {
            power_on_data: response.power_on_data().map(str::to_string),
            select_application_response: response.select_application_response().cloned(),
            card_response: response.card_response().cloned(),
        }
    }

    pub fn power_on_data(&self) -> Option<&str> {
        self.power_on_data.as_deref()
    }

    pub fn select_application_response(&self) -> Option<&ApduResponse> {
        self.select_application_response.as_ref()
    }

    /// File control information returned by the Select Application command
    /// (response data without the status word).
    pub fn fci(&self) -> Option<&[u8]> {
        self.select_application_response.as_ref().map(|r| r.data())
    }

    pub fn card_response(&self) -> Option<&CardResponse> {
        self.card_response.as_ref()
    }
}

/// Aggregated outcome of a selection scenario, keyed by the index in which
/// the selectors were prepared.
#[derive(Debug, Clone, Default)]
pub struct CardSelectionResult {
    smart_cards: BTreeMap<u8, SmartCard>,
    active_index: Option<u8>,
}

impl CardSelectionResult {
    pub(crate) fn insert(&mut self, index: u8, smart_card: SmartCard) {
        self.smart_cards.insert(index, smart_card);
    }

    pub(crate) fn set_active_index(&mut self, index: u8) {
        self.active_index = Some(index);
    }

    pub fn smart_cards(&self) -> &BTreeMap<u8, SmartCard> {
        &self.smart_cards
    }

    /// Index of the first matched selector whose logical channel stayed
    /// open, when any.
    pub fn active_index(&self) -> Option<u8> {
        self.active_index
    }

    pub fn active_smart_card(&self) -> Option<&SmartCard> {
        self.active_index.and_then(|i| self.smart_cards.get(&i))
    }

    pub fn is_empty(&self) -> bool {
        self.smart_cards.is_empty()
    }
}
