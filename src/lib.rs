//! Smart card terminal service.
//!
//! Sits between application code and heterogeneous reader drivers and
//! provides the two hard pieces: an ISO 7816-4 application selection
//! pipeline executed in one physical exchange, and an asynchronous
//! observation state machine tracking card insertion, processing and
//! removal on a reader.

// ───── Modules ─────
pub mod apdu; // APDU request/response value types.
pub mod channel; // Physical/logical channel bookkeeping.
pub mod config; // Configuration handling.
pub mod driver; // Contracts implemented by plugins and card extensions.
pub mod error; // Error taxonomy.
pub mod logger; // Logging functionality.
pub mod monitoring; // Background monitoring jobs.
pub mod observation; // Observer registry and event dispatch.
pub mod reader; // Reader front ends.
pub mod registry; // Process-wide plugin registry.
pub mod scenario; // Selection scenario execution.
pub mod selector; // Card selection data model.
pub mod state_machine; // Observation states, events and transitions.

// ───── Public API ─────
pub use apdu::{ApduRequest, ApduResponse, CardRequest, CardResponse, SW_SUCCESS};
pub use channel::{ChannelControl, ChannelController};
pub use config::{init_config, MonitoringConfig};
pub use driver::{
    CardExtension, CardInsertionListener, InsertionDetection, ReaderDriver, RemovalDetection,
};
pub use error::ServiceError;
pub use logger::setup_logging;
pub use monitoring::JobHandle;
pub use observation::{
    ObservationExceptionHandler, ReaderEvent, ReaderEventKind, ReaderObserver,
};
pub use reader::{CardReader, ObservableCardReader};
pub use registry::{
    find_reader, get_plugin, plugin_names, register_plugin, unregister_plugin, ReaderPlugin,
};
pub use scenario::{CardSelectionScenario, MultiSelectionProcessing};
pub use selector::{
    CardSelectionRequest, CardSelectionResponse, CardSelectionResult, CardSelector,
    FileControlInformation, FileOccurrence, SmartCard,
};
pub use state_machine::{DetectionMode, MonitoringState};
