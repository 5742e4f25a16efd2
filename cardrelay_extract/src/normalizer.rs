//! Turns candidate extractions into canonical card events.

use cardrelay_core::{
    CandidateExtraction, CardEvent, Completeness, Fingerprint, MessageId, ProviderTag, RawMessage,
};

/// Build the canonical event for `candidate`, which was read from `message`
/// (possibly merged with the messages in `related`).
///
/// Returns `None` for a candidate that carries neither a card number nor a
/// known provider: such a fragment is only useful as a complement.
#[must_use]
pub fn normalize(
    candidate: &CandidateExtraction,
    message: &RawMessage,
    related: &[MessageId],
) -> Option<CardEvent> {
    if candidate.card_number.is_none() && !candidate.has_known_provider() {
        return None;
    }

    let provider = candidate
        .provider
        .clone()
        .unwrap_or_else(ProviderTag::unknown);
    let fingerprint = candidate.card_number.as_deref().map_or_else(
        || Fingerprint::for_message(&provider, message.channel_id, message.message_id),
        |card| Fingerprint::for_card(&provider, card),
    );

    let mut message_ids: Vec<MessageId> = related
        .iter()
        .copied()
        .chain(std::iter::once(message.message_id))
        .collect();
    message_ids.sort_unstable();
    message_ids.dedup();

    Some(CardEvent {
        fingerprint,
        card_number: candidate.card_number.clone(),
        completeness: Completeness::classify(
            candidate.card_number.is_some(),
            !provider.is_unknown(),
            candidate.unit.is_some(),
        ),
        provider,
        unit: candidate.unit,
        card_date: message.received_at.date_naive(),
        source_channel: message.channel_id,
        message_ids,
        first_seen: message.received_at,
    })
}
