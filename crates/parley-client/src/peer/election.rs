use parley_protocol::ParticipantId;

/// Whether `local` sends the first offer to `remote`.
///
/// Byte-wise id order, so for any pair exactly one side is the initiator and
/// both sides agree on which one without talking to each other.
pub fn is_initiator(local: &ParticipantId, remote: &ParticipantId) -> bool {
    local.as_str().as_bytes() < remote.as_str().as_bytes()
}
