// ───── Std Lib ─────
use std::error::Error as StdError;
use std::fmt;

// ───── Crates ─────
use serde_json::Value;

/// Represents errors that can occur while driving a reader or exchanging
/// APDUs with a card.
#[derive(Debug)]
pub enum ServiceError {
    /// Transport failure between the reader and the card in the middle of
    /// an APDU exchange. The reader itself may still be usable.
    CardCommunication(String),

    /// The reader driver or the underlying hardware is unusable.
    ReaderCommunication(String),

    /// A response carried a status word outside the accepted set while the
    /// caller requested strict checking.
    UnexpectedStatusWord { status_word: u16, info: String },

    /// API misuse: empty scenario, detection started twice, observer added
    /// without an exception handler, and the like. Fatal to the call, never
    /// to the reader.
    IllegalState(String),

    /// A driver failure surfacing from the registry layer.
    Plugin(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::CardCommunication(s) => write!(f, "Card communication failure: {}", s),
            ServiceError::ReaderCommunication(s) => {
                write!(f, "Reader communication failure: {}", s)
            }
            ServiceError::UnexpectedStatusWord { status_word, info } => {
                write!(f, "Unexpected status word {:04X} for '{}'", status_word, info)
            }
            ServiceError::IllegalState(s) => write!(f, "Illegal state: {}", s),
            ServiceError::Plugin(s) => write!(f, "Plugin failure: {}", s),
        }
    }
}

impl StdError for ServiceError {
    // This enables interoperability with other error-handling APIs,
    // such as `?` operator, logging, and boxed error trait objects.
}

impl ServiceError {
    /// JSON representation used whenever an error has to cross a serialized
    /// boundary. Only the message is carried, never a backtrace.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "message": self.to_string(),
        })
    }
}

impl From<Box<dyn StdError + Send + Sync>> for ServiceError {
    fn from(err: Box<dyn StdError + Send + Sync>) -> Self {
        ServiceError::ReaderCommunication(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape_carries_message_only() {
        let err = ServiceError::IllegalState("scenario is empty".to_string());
        let json = err.to_json();

        assert_eq!(
            json.get("message").and_then(|v| v.as_str()),
            Some("Illegal state: scenario is empty")
        );
        assert_eq!(json.as_object().map(|o| o.len()), Some(1));
    }

    #[test]
    fn status_word_is_formatted_as_hex() {
        let err = ServiceError::UnexpectedStatusWord {
            status_word: 0x6A82,
            info: "Select Application".to_string(),
        };
        assert!(err.to_string().contains("6A82"));
    }
}
