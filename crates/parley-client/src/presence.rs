//! Local view of the room's presence.

use parley_protocol::{MediaPatch, MediaStatus, ParticipantId, PresenceRecord};
use std::collections::{HashMap, HashSet};

/// What a `status:update` did to the book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Updated(MediaStatus),
    Created(MediaStatus),
    Ignored,
}

/// Remote participants by id.
///
/// Ids that left are remembered so a late status update cannot bring them
/// back; only a fresh join does. A snapshot lists every live id, so it
/// forgets them all.
#[derive(Debug, Default)]
pub struct PresenceBook {
    records: HashMap<ParticipantId, PresenceRecord>,
    departed: HashSet<ParticipantId>,
}

impl PresenceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the book with a server snapshot.
    ///
    /// Returns the other participants in id order; `self_id` is filtered out.
    pub fn reset(
        &mut self,
        participants: Vec<PresenceRecord>,
        self_id: &ParticipantId,
    ) -> Vec<PresenceRecord> {
        self.records.clear();
        self.departed.clear();
        for record in participants {
            if &record.id == self_id {
                continue;
            }
            self.records.insert(record.id.clone(), record);
        }

        let mut others: Vec<PresenceRecord> = self.records.values().cloned().collect();
        others.sort_by(|a, b| a.id.cmp(&b.id));
        others
    }

    /// Record a joined participant. Returns true when it was not known yet.
    pub fn join(&mut self, record: PresenceRecord) -> bool {
        self.departed.remove(&record.id);
        self.records.insert(record.id.clone(), record).is_none()
    }

    pub fn leave(&mut self, id: &ParticipantId) -> Option<PresenceRecord> {
        self.departed.insert(id.clone());
        self.records.remove(id)
    }

    pub fn apply_status(&mut self, id: &ParticipantId, patch: &MediaPatch) -> StatusOutcome {
        if let Some(record) = self.records.get_mut(id) {
            record.media.apply(patch);
            return StatusOutcome::Updated(record.media);
        }

        if self.departed.contains(id) {
            tracing::debug!("Ignoring status for departed participant {}", id);
            return StatusOutcome::Ignored;
        }
        if patch.reports_inactive() {
            tracing::debug!("Ignoring inactive status for unknown participant {}", id);
            return StatusOutcome::Ignored;
        }

        let mut record = PresenceRecord::new(id.clone());
        record.media.apply(patch);
        let media = record.media;
        self.records.insert(id.clone(), record);
        StatusOutcome::Created(media)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&PresenceRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.records.contains_key(id)
    }

    /// Whether `id` last reported its camera on.
    pub fn expects_camera(&self, id: &ParticipantId) -> bool {
        self.records.get(id).is_some_and(|r| r.media.cam)
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record. Departed ids stay remembered.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> PresenceRecord {
        PresenceRecord::new(ParticipantId::from(id))
    }

    fn patch(cam: bool, mic: bool) -> MediaPatch {
        MediaStatus::new(cam, mic).into()
    }

    #[test]
    fn snapshot_excludes_self_and_is_ordered() {
        let mut book = PresenceBook::new();
        let others = book.reset(
            vec![record("c3"), record("b2"), record("a1")],
            &ParticipantId::from("b2"),
        );

        let ids: Vec<&str> = others.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "c3"]);
        assert!(!book.contains(&ParticipantId::from("b2")));
    }

    #[test]
    fn status_for_known_participant_merges() {
        let mut book = PresenceBook::new();
        book.join(record("a1"));

        let id = ParticipantId::from("a1");
        assert_eq!(
            book.apply_status(&id, &MediaPatch { cam: Some(true), mic: None }),
            StatusOutcome::Updated(MediaStatus::new(true, false))
        );
        assert!(book.expects_camera(&id));
    }

    #[test]
    fn inactive_status_from_stranger_is_dropped() {
        let mut book = PresenceBook::new();
        let stranger = ParticipantId::from("zz9");

        assert_eq!(book.apply_status(&stranger, &patch(false, false)), StatusOutcome::Ignored);
        assert!(book.is_empty());

        assert_eq!(
            book.apply_status(&stranger, &patch(false, true)),
            StatusOutcome::Created(MediaStatus::new(false, true))
        );
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn departed_participant_stays_gone_until_rejoin() {
        let mut book = PresenceBook::new();
        let id = ParticipantId::from("b2");
        book.join(record("b2"));
        assert!(book.leave(&id).is_some());

        assert_eq!(book.apply_status(&id, &patch(true, true)), StatusOutcome::Ignored);
        assert!(!book.contains(&id));

        assert!(book.join(record("b2")));
        assert!(matches!(
            book.apply_status(&id, &patch(true, true)),
            StatusOutcome::Updated(_)
        ));
    }

    #[test]
    fn snapshot_forgets_departed_ids() {
        let mut book = PresenceBook::new();
        let self_id = ParticipantId::from("a1");
        for n in 0..50 {
            let id = ParticipantId::new(format!("gone{}", n));
            book.join(PresenceRecord::new(id.clone()));
            book.leave(&id);
        }
        assert_eq!(book.departed.len(), 50);

        book.reset(vec![record("a1"), record("c3")], &self_id);
        assert!(book.departed.is_empty());
        assert_eq!(book.ids(), vec![ParticipantId::from("c3")]);

        // Leaving still tombstones until the next snapshot.
        book.leave(&ParticipantId::from("c3"));
        assert_eq!(
            book.apply_status(&ParticipantId::from("c3"), &patch(true, true)),
            StatusOutcome::Ignored
        );
    }

    #[test]
    fn join_is_idempotent() {
        let mut book = PresenceBook::new();
        assert!(book.join(record("a1")));
        assert!(!book.join(record("a1")));
        assert_eq!(book.ids(), vec![ParticipantId::from("a1")]);
    }
}
