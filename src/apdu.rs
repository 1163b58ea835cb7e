//! APDU request/response value types.
//!
//! Everything here is an immutable value: built once, then only read. The
//! reader and the selection pipeline never mutate an APDU after it has been
//! prepared.

// ───── Std Lib ─────
use std::collections::HashSet;
use std::fmt;

// ───── Local Modules ─────
use crate::error::ServiceError;

/// Status word reported by a card when a command succeeded.
pub const SW_SUCCESS: u16 = 0x9000;

/// A single command APDU together with the set of status words its caller
/// is willing to accept. `0x9000` is always part of the set.
#[derive(Clone)]
pub struct ApduRequest {
    bytes: Vec<u8>,
    info: String,
    successful_status_words: HashSet<u16>,
}

impl ApduRequest {
    pub fn new(bytes: Vec<u8>) -> Self {
        let mut successful_status_words = HashSet::new();
        successful_status_words.insert(SW_SUCCESS);

        Self {
            bytes,
            info: String::new(),
            successful_status_words,
        }
    }

    /// Attaches a short human readable label used in logs and errors.
    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    /// Accepts an additional status word besides `0x9000`.
    pub fn with_successful_status_word(mut self, status_word: u16) -> Self {
        self.successful_status_words.insert(status_word);
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn successful_status_words(&self) -> &HashSet<u16> {
        &self.successful_status_words
    }

    /// True when the given status word belongs to the accepted set.
    pub fn is_successful(&self, status_word: u16) -> bool {
        self.successful_status_words.contains(&status_word)
    }
}

impl fmt::Debug for ApduRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApduRequest")
            .field("bytes", &hex::encode_upper(&self.bytes))
            .field("info", &self.info)
            .finish()
    }
}

/// A raw response APDU. The last two bytes are the status word, everything
/// before them is the data field.
#[derive(Clone, PartialEq, Eq)]
pub struct ApduResponse {
    bytes: Vec<u8>,
}

impl ApduResponse {
    /// Wraps the raw bytes returned by a driver. A response shorter than the
    /// two status word bytes means the exchange was cut off.
    pub fn new(bytes: Vec<u8>) -> Result<Self, ServiceError> {
        if bytes.len() < 2 {
            return Err(ServiceError::CardCommunication(format!(
                "truncated response APDU ({} byte(s))",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn status_word(&self) -> u16 {
        let n = self.bytes.len();
        ((self.bytes[n - 2] as u16) << 8) | self.bytes[n - 1] as u16
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 2]
    }
}

impl fmt::Debug for ApduResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApduResponse({})", hex::encode_upper(&self.bytes))
    }
}

/// An ordered sequence of APDUs to play against one card.
#[derive(Debug, Clone)]
pub struct CardRequest {
    apdus: Vec<ApduRequest>,
    stop_on_unsuccessful_status_word: bool,
}

impl CardRequest {
    pub fn new(apdus: Vec<ApduRequest>, stop_on_unsuccessful_status_word: bool) -> Self {
        Self {
            apdus,
            stop_on_unsuccessful_status_word,
        }
    }

    pub fn apdus(&self) -> &[ApduRequest] {
        &self.apdus
    }

    pub fn stop_on_unsuccessful_status_word(&self) -> bool {
        self.stop_on_unsuccessful_status_word
    }
}

/// The responses actually collected for a [`CardRequest`]. May be shorter
/// than the request when the exchange stopped on an unaccepted status word.
#[derive(Debug, Clone)]
pub struct CardResponse {
    apdus: Vec<ApduResponse>,
    is_logical_channel_open: bool,
}

impl CardResponse {
    pub fn new(apdus: Vec<ApduResponse>, is_logical_channel_open: bool) -> Self {
        Self {
            apdus,
            is_logical_channel_open,
        }
    }

    pub fn apdus(&self) -> &[ApduResponse] {
        &self.apdus
    }

    pub fn is_logical_channel_open(&self) -> bool {
        self.is_logical_channel_open
    }
}
