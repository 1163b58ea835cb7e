//! Reader observation state machine.
//!
//! Four states, six internal events, one total transition function. A
//! transition either names the next state or is an explicit no-op, so no
//! `(state, event)` pair can crash the reader.

/// Observation states of a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringState {
    WaitForStartDetection,
    WaitForCardInsertion,
    WaitForCardProcessing,
    WaitForCardRemoval,
}

/// Events fired by monitoring jobs and service entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalEvent {
    StartDetect,
    StopDetect,
    CardInserted,
    CardProcessed,
    CardRemoved,
    TimeOut,
}

/// Governs where the machine goes once a processed card is removed:
/// back to waiting for the next card, or back to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMode {
    Repeating,
    Singleshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Ignore,
    To(MonitoringState),
}

/// The complete transition table. Every pair not listed is an ignored
/// event, logged by the caller.
pub(crate) fn transition(
    state: MonitoringState,
    event: InternalEvent,
    mode: DetectionMode,
) -> Transition {
    use InternalEvent::*;
    use MonitoringState::*;

    let after_removal = match mode {
        DetectionMode::Repeating => WaitForCardInsertion,
        DetectionMode::Singleshot => WaitForStartDetection,
    };

    match (state, event) {
        (WaitForStartDetection, StartDetect) => Transition::To(WaitForCardInsertion),

        (WaitForCardInsertion, CardInserted) => Transition::To(WaitForCardProcessing),
        (WaitForCardInsertion, TimeOut) => Transition::To(WaitForStartDetection),

        (WaitForCardProcessing, CardProcessed) => Transition::To(WaitForCardRemoval),
        (WaitForCardProcessing, CardRemoved) => Transition::To(after_removal),

        (WaitForCardRemoval, CardRemoved) => Transition::To(after_removal),

        // Stopping detection is honored from any non-idle state.
        (WaitForCardInsertion, StopDetect)
        | (WaitForCardProcessing, StopDetect)
        | (WaitForCardRemoval, StopDetect) => Transition::To(WaitForStartDetection),

        _ => Transition::Ignore,
    }
}
