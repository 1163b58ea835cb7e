//! Selection scenario execution.
//!
//! A scenario is an ordered list of selection requests played against the
//! card currently present in a reader, in one physical exchange. Selectors
//! keep their preparation index all the way into the result map.

// ───── Crates ─────
use regex::Regex;

// ───── Local Modules ─────
use crate::apdu::{CardRequest, CardResponse};
use crate::channel::ChannelControl;
use crate::error::ServiceError;
use crate::reader::CardReader;
use crate::selector::{
    CardSelectionRequest, CardSelectionResponse, CardSelectionResult, SmartCard,
};

/// Upper bound on the number of selectors in one scenario, imposed by the
/// `u8` selection index.
const MAX_SELECTIONS: usize = 256;

/// Whether the scenario stops at the first matching selector or plays all
/// of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiSelectionProcessing {
    FirstMatch,
    ProcessAll,
}

/// An ordered card selection scenario.
///
/// Build it with [`prepare_selection`](Self::prepare_selection), then run it
/// once with [`process_scenario`](Self::process_scenario) — processing
/// consumes the scenario. It is `Clone`, which is how an observable reader
/// replays a scheduled scenario on every insertion.
#[derive(Debug, Clone)]
pub struct CardSelectionScenario {
    requests: Vec<CardSelectionRequest>,
    release_channel: bool,
    multi_selection_processing: MultiSelectionProcessing,
}

impl CardSelectionScenario {
    pub fn new(multi_selection_processing: MultiSelectionProcessing) -> Self {
        Self {
            requests: Vec::new(),
            release_channel: false,
            multi_selection_processing,
        }
    }

    /// Appends a selection request and returns its index in the scenario.
    pub fn prepare_selection(
        &mut self,
        request: CardSelectionRequest,
    ) -> Result<u8, ServiceError> {
        if self.requests.len() >= MAX_SELECTIONS {
            return Err(ServiceError::IllegalState(format!(
                "selection scenario is full ({} selectors)",
                MAX_SELECTIONS
            )));
        }
        self.requests.push(request);
        Ok((self.requests.len() - 1) as u8)
    }

    /// Requests the physical channel to be closed once the scenario is over.
    pub fn prepare_release_channel(&mut self) {
        self.release_channel = true;
    }

    pub fn multi_selection_processing(&self) -> MultiSelectionProcessing {
        self.multi_selection_processing
    }

    pub fn selection_count(&self) -> usize {
        self.requests.len()
    }

    /// Runs the scenario against the card present in `reader`.
    ///
    /// Selectors are processed in preparation order. A selector that does
    /// not match is recorded and does not abort the scenario; a
    /// [`ServiceError::ReaderCommunication`] always does. The physical
    /// channel is released when that was prepared, when no selector
    /// matched, or on the way out of a fatal error.
    pub fn process_scenario(
        self,
        reader: &CardReader,
    ) -> Result<CardSelectionResult, ServiceError> {
        if self.requests.is_empty() {
            return Err(ServiceError::IllegalState(
                "selection scenario is empty".to_string(),
            ));
        }
        if self.multi_selection_processing == MultiSelectionProcessing::ProcessAll
            && self.requests.iter().any(|r| r.selector().aid().is_none())
        {
            return Err(ServiceError::IllegalState(
                "PROCESS_ALL requires every selector to be AID-based".to_string(),
            ));
        }

        log::debug!(
            "Processing selection scenario with {} selector(s) on reader '{}'",
            self.requests.len(),
            reader.name()
        );

        let mut responses: Vec<(u8, CardSelectionResponse)> = Vec::new();

        if let Err(error) = self.run(reader, &mut responses) {
            let _ = reader.release_channel();
            return Err(error);
        }

        let matched_any = responses.iter().any(|(_, r)| r.has_matched());
        if self.release_channel || !matched_any {
            reader.release_channel()?;
        }

        let mut result = CardSelectionResult::default();
        for (index, response) in &responses {
            if !response.has_matched() {
                continue;
            }
            result.insert(*index, SmartCard::from_selection_response(response));

            let channel_open = response
                .card_response()
                .map(CardResponse::is_logical_channel_open)
                .unwrap_or(false);
            if result.active_index().is_none() && channel_open {
                result.set_active_index(*index);
            }
        }

        log::info!(
            "Selection scenario on reader '{}' matched {} of {} selector(s)",
            reader.name(),
            result.smart_cards().len(),
            self.requests.len()
        );

        Ok(result)
    }

    fn run(
        &self,
        reader: &CardReader,
        responses: &mut Vec<(u8, CardSelectionResponse)>,
    ) -> Result<(), ServiceError> {
        for (i, request) in self.requests.iter().enumerate() {
            let index = i as u8;
            let selector = request.selector();

            reader.channel().open_physical_channel()?;
            let power_on_data = reader.power_on_data()?;

            if let Some(protocol) = selector.card_protocol() {
                if !reader.is_protocol_active(protocol) {
                    log::debug!(
                        "Selector {} skipped, protocol '{}' is not active",
                        index,
                        protocol
                    );
                    responses.push((index, CardSelectionResponse::not_matched(Some(power_on_data))));
                    continue;
                }
            }

            if let Some(pattern) = selector.power_on_data_regex() {
                let regex = Regex::new(pattern).map_err(|e| {
                    ServiceError::IllegalState(format!(
                        "invalid power-on data regex '{}': {}",
                        pattern, e
                    ))
                })?;
                if !regex.is_match(&power_on_data) {
                    log::debug!(
                        "Selector {} skipped, power-on data '{}' does not match '{}'",
                        index,
                        power_on_data,
                        pattern
                    );
                    responses.push((index, CardSelectionResponse::not_matched(Some(power_on_data))));
                    continue;
                }
            }

            let (has_matched, select_application_response) =
                match selector.build_select_application_apdu() {
                    Some(select_apdu) => {
                        let select_request = CardRequest::new(vec![select_apdu], true);
                        match reader
                            .channel()
                            .transmit_card_request(&select_request, ChannelControl::KeepOpen)
                        {
                            Ok(card_response) => {
                                let response = card_response.apdus().first().cloned();
                                let matched = response
                                    .as_ref()
                                    .map(|r| {
                                        selector
                                            .successful_selection_status_words()
                                            .contains(&r.status_word())
                                    })
                                    .unwrap_or(false);
                                (matched, response)
                            }
                            Err(error @ ServiceError::CardCommunication(_)) => {
                                log::warn!(
                                    "Selector {} failed on reader '{}': {}. Recovering channel.",
                                    index,
                                    reader.name(),
                                    error
                                );
                                // Subsequent selectors survive only if the
                                // channel comes back.
                                if reader.recover_channel().is_err() {
                                    return Err(error);
                                }
                                responses.push((
                                    index,
                                    CardSelectionResponse::not_matched(Some(power_on_data)),
                                ));
                                continue;
                            }
                            Err(error) => return Err(error),
                        }
                    }
                    // AID-less selector: power-on data already discriminated.
                    None => (true, None),
                };

            if has_matched {
                reader.channel().set_logical_channel_open(true);
            }

            let card_response = if has_matched {
                match request.card_request() {
                    Some(follow_up) => Some(
                        reader
                            .channel()
                            .transmit_card_request(follow_up, ChannelControl::KeepOpen)?,
                    ),
                    None => Some(CardResponse::new(
                        Vec::new(),
                        reader.channel().is_logical_channel_open(),
                    )),
                }
            } else {
                None
            };

            responses.push((
                index,
                CardSelectionResponse::new(
                    Some(power_on_data),
                    select_application_response,
                    has_matched,
                    card_response,
                ),
            ));

            if has_matched
                && self.multi_selection_processing == MultiSelectionProcessing::FirstMatch
            {
                log::debug!("First match at selector {}, stopping scenario", index);
                break;
            }
        }

        Ok(())
    }
}
