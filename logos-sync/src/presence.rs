//! Presence state for a room: who is here, where their cursors are, and
//! what they have selected.
//!
//! ## Architecture
//!
//! ```text
//! Transport presence events          Broadcast messages
//! (sync / join / leave)              (cursor / selection)
//!        │                                  │
//!        ▼                                  ▼
//! PresenceTracker::apply_sync()      PresenceTracker::apply_cursor()
//! PresenceTracker::apply_join()      PresenceTracker::apply_selection()
//! PresenceTracker::apply_leave()            │
//!        │                                  │
//!        ▼                                  ▼
//!   participants map  ──── prune ────►  cursor map / selection map
//! ```
//!
//! Participants arrive on the presence channel, cursors and selections on
//! the broadcast channel. A full sync rebuilds the participant map from the
//! snapshot and prunes the other two maps to the surviving ids; it never
//! clears them wholesale, because a cursor may legitimately arrive before
//! the presence entry that owns it.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::model::{CursorPosition, Participant, SelectionRange, UserId};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

/// Colors handed out by the join procedure, in join order.
pub const PALETTE: [CursorColor; 8] = [
    CursorColor::rgb(0.26, 0.52, 0.96),
    CursorColor::rgb(0.92, 0.26, 0.21),
    CursorColor::rgb(0.20, 0.66, 0.33),
    CursorColor::rgb(0.98, 0.74, 0.02),
    CursorColor::rgb(0.61, 0.15, 0.69),
    CursorColor::rgb(0.00, 0.74, 0.83),
    CursorColor::rgb(1.00, 0.44, 0.26),
    CursorColor::rgb(0.47, 0.33, 0.28),
];

impl CursorColor {
    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b, a: 1.0 }
    }

    /// Stable, visually distinct color derived from a user id.
    ///
    /// The hue comes from the id hash; saturation and lightness are fixed
    /// high so cursors stay vivid on a white canvas.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// Palette slot for the n-th participant of a room.
    pub fn for_slot(slot: usize) -> Self {
        PALETTE[slot % PALETTE.len()]
    }

    /// Color handed out by the join procedure: palette entries by join
    /// order, then the id-derived color once the palette is used up.
    pub fn assign(slot: usize, user_id: Uuid) -> Self {
        if slot < PALETTE.len() {
            PALETTE[slot]
        } else {
            Self::from_uuid(user_id)
        }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb` form for web consumers.
    pub fn to_hex(&self) -> String {
        let c = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", c(self.r), c(self.g), c(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        PALETTE[0]
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Remote cursor
// ───────────────────────────────────────────────────────────────────

/// Last known cursor of a remote participant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteCursor {
    pub position: CursorPosition,
    /// Sender-side sequence number; older updates are dropped.
    pub seq: u64,
    pub received_at: Instant,
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Read projection of remote presence for one room membership.
pub struct PresenceTracker {
    local_user_id: UserId,
    participants: HashMap<UserId, Participant>,
    cursors: HashMap<UserId, RemoteCursor>,
    /// `Some(None)` is an explicitly cleared selection; a missing key is unknown.
    selections: HashMap<UserId, Option<SelectionRange>>,
}

impl PresenceTracker {
    pub fn new(local_user_id: UserId) -> Self {
        Self {
            local_user_id,
            participants: HashMap::new(),
            cursors: HashMap::new(),
            selections: HashMap::new(),
        }
    }

    pub fn local_user_id(&self) -> UserId {
        self.local_user_id
    }

    /// Rebuild the participant map from an authoritative snapshot.
    ///
    /// Known cursors and selections are carried onto the rebuilt records,
    /// so `participants()` agrees with `cursors()` and `selections()`.
    /// Returns the ids pruned from the cursor/selection maps.
    pub fn apply_sync(&mut self, snapshot: Vec<Participant>) -> Vec<UserId> {
        let mut participants = HashMap::with_capacity(snapshot.len());
        for participant in snapshot {
            self.forget_previous_membership(&participant);
            participants.insert(participant.user_id, participant);
        }
        self.participants = participants;
        let pruned = self.prune_absent();
        for (id, participant) in self.participants.iter_mut() {
            if let Some(cursor) = self.cursors.get(id) {
                participant.cursor = Some(cursor.position);
            }
            if let Some(selection) = self.selections.get(id) {
                participant.selection = selection.clone();
            }
        }
        pruned
    }

    /// Insert or refresh one participant between full syncs.
    pub fn apply_join(&mut self, mut participant: Participant) {
        self.forget_previous_membership(&participant);
        if let Some(cursor) = self.cursors.get(&participant.user_id) {
            participant.cursor = Some(cursor.position);
        }
        if let Some(selection) = self.selections.get(&participant.user_id) {
            participant.selection = selection.clone();
        }
        self.participants.insert(participant.user_id, participant);
    }

    /// A record with a different join time is a new membership of the same
    /// user whose leave we never saw. Its cursor sequence restarts, so the
    /// old cursor and selection must go.
    fn forget_previous_membership(&mut self, incoming: &Participant) {
        let rejoined = self
            .participants
            .get(&incoming.user_id)
            .is_some_and(|known| known.joined_at != incoming.joined_at);
        if rejoined {
            log::debug!("{} rejoined; dropping their previous cursor", incoming.user_id);
            self.cursors.remove(&incoming.user_id);
            self.selections.remove(&incoming.user_id);
        }
    }

    /// Destroy every trace of a participant. Returns whether anything was removed.
    pub fn apply_leave(&mut self, user_id: &UserId) -> bool {
        let had_presence = self.participants.remove(user_id).is_some();
        let had_cursor = self.cursors.remove(user_id).is_some();
        let had_selection = self.selections.remove(user_id).is_some();
        had_presence || had_cursor || had_selection
    }

    /// Record a remote cursor. Self-originated and stale updates are ignored.
    pub fn apply_cursor(&mut self, sender: UserId, position: CursorPosition, seq: u64) -> bool {
        if sender == self.local_user_id {
            return false;
        }
        if let Some(existing) = self.cursors.get(&sender) {
            if seq <= existing.seq {
                log::trace!("Dropping stale cursor seq {seq} from {sender}");
                return false;
            }
        }
        self.cursors.insert(
            sender,
            RemoteCursor {
                position,
                seq,
                received_at: Instant::now(),
            },
        );
        if let Some(p) = self.participants.get_mut(&sender) {
            p.cursor = Some(position);
        }
        true
    }

    /// Record a remote selection; `None` explicitly clears it.
    pub fn apply_selection(&mut self, sender: UserId, selection: Option<SelectionRange>) -> bool {
        if sender == self.local_user_id {
            return false;
        }
        if let Some(p) = self.participants.get_mut(&sender) {
            p.selection = selection.clone();
        }
        self.selections.insert(sender, selection);
        true
    }

    /// Drop cursor/selection entries whose owner is no longer present.
    fn prune_absent(&mut self) -> Vec<UserId> {
        let mut pruned: Vec<UserId> = self
            .cursors
            .keys()
            .chain(self.selections.keys())
            .filter(|id| !self.participants.contains_key(id))
            .copied()
            .collect();
        pruned.sort();
        pruned.dedup();

        for id in &pruned {
            self.cursors.remove(id);
            self.selections.remove(id);
        }
        pruned
    }

    /// Participants ordered by join time.
    pub fn participants(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> = self.participants.values().cloned().collect();
        list.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.user_id.cmp(&b.user_id)));
        list
    }

    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_present(&self, user_id: &UserId) -> bool {
        self.participants.contains_key(user_id)
    }

    pub fn cursors(&self) -> &HashMap<UserId, RemoteCursor> {
        &self.cursors
    }

    pub fn cursor(&self, user_id: &UserId) -> Option<&RemoteCursor> {
        self.cursors.get(user_id)
    }

    pub fn selections(&self) -> &HashMap<UserId, Option<SelectionRange>> {
        &self.selections
    }

    /// `None` = unknown, `Some(None)` = explicitly nothing selected.
    pub fn selection(&self, user_id: &UserId) -> Option<&Option<SelectionRange>> {
        self.selections.get(user_id)
    }

    pub fn clear(&mut self) {
        self.participants.clear();
        self.cursors.clear();
        self.selections.clear();
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Identity;

    fn participant(name: &str) -> Participant {
        let identity = Identity::new(Uuid::new_v4(), name);
        Participant::new(&identity, CursorColor::from_uuid(identity.user_id))
    }

    // ── Color tests ──────────────────────────────────────────────

    #[test]
    fn test_color_from_uuid_is_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(CursorColor::from_uuid(id), CursorColor::from_uuid(id));
    }

    #[test]
    fn test_color_components_in_range() {
        for _ in 0..50 {
            let c = CursorColor::from_uuid(Uuid::new_v4());
            for v in c.to_array() {
                assert!((0.0..=1.0).contains(&v));
            }
        }
    }

    #[test]
    fn test_palette_wraps() {
        assert_eq!(CursorColor::for_slot(0), CursorColor::for_slot(PALETTE.len()));
    }

    #[test]
    fn test_hex() {
        assert_eq!(CursorColor::rgb(1.0, 0.0, 0.0).to_hex(), "#ff0000");
    }

    // ── Tracker tests ────────────────────────────────────────────

    #[test]
    fn test_sync_rebuilds_participants() {
        let me = participant("Me");
        let alice = participant("Alice");
        let bob = participant("Bob");
        let mut tracker = PresenceTracker::new(me.user_id);

        tracker.apply_sync(vec![me.clone(), alice.clone(), bob.clone()]);
        assert_eq!(tracker.participant_count(), 3);

        tracker.apply_sync(vec![me.clone(), alice.clone()]);
        assert_eq!(tracker.participant_count(), 2);
        assert!(!tracker.is_present(&bob.user_id));
    }

    #[test]
    fn test_sync_prunes_only_absent_cursors() {
        let me = participant("Me");
        let alice = participant("Alice");
        let bob = participant("Bob");
        let mut tracker = PresenceTracker::new(me.user_id);
        tracker.apply_sync(vec![me.clone(), alice.clone(), bob.clone()]);

        tracker.apply_cursor(alice.user_id, CursorPosition::new(1.0, 1.0), 1);
        tracker.apply_cursor(bob.user_id, CursorPosition::new(2.0, 2.0), 1);
        tracker.apply_selection(bob.user_id, None);

        let pruned = tracker.apply_sync(vec![me.clone(), alice.clone()]);

        assert_eq!(pruned, vec![bob.user_id]);
        assert!(tracker.cursor(&alice.user_id).is_some());
        assert!(tracker.cursor(&bob.user_id).is_none());
        assert!(tracker.selection(&bob.user_id).is_none());
    }

    #[test]
    fn test_leave_removes_everything() {
        let me = participant("Me");
        let alice = participant("Alice");
        let mut tracker = PresenceTracker::new(me.user_id);
        tracker.apply_sync(vec![me.clone(), alice.clone()]);
        tracker.apply_cursor(alice.user_id, CursorPosition::new(5.0, 5.0), 1);
        tracker.apply_selection(alice.user_id, Some(SelectionRange::new(vec![Uuid::new_v4()])));

        assert!(tracker.apply_leave(&alice.user_id));

        assert!(!tracker.is_present(&alice.user_id));
        assert!(tracker.cursor(&alice.user_id).is_none());
        assert!(tracker.selection(&alice.user_id).is_none());
        assert!(!tracker.apply_leave(&alice.user_id));
    }

    #[test]
    fn test_own_broadcasts_ignored() {
        let me = participant("Me");
        let mut tracker = PresenceTracker::new(me.user_id);
        assert!(!tracker.apply_cursor(me.user_id, CursorPosition::new(1.0, 2.0), 1));
        assert!(!tracker.apply_selection(me.user_id, None));
        assert!(tracker.cursors().is_empty());
        assert!(tracker.selections().is_empty());
    }

    #[test]
    fn test_stale_cursor_rejected() {
        let me = participant("Me");
        let alice = participant("Alice");
        let mut tracker = PresenceTracker::new(me.user_id);

        assert!(tracker.apply_cursor(alice.user_id, CursorPosition::new(10.0, 10.0), 5));
        assert!(!tracker.apply_cursor(alice.user_id, CursorPosition::new(0.0, 0.0), 4));
        assert_eq!(
            tracker.cursor(&alice.user_id).unwrap().position,
            CursorPosition::new(10.0, 10.0)
        );
    }

    #[test]
    fn test_cursor_before_presence_survives_until_sync() {
        let me = participant("Me");
        let alice = participant("Alice");
        let mut tracker = PresenceTracker::new(me.user_id);

        tracker.apply_cursor(alice.user_id, CursorPosition::new(3.0, 4.0), 1);
        assert!(tracker.cursor(&alice.user_id).is_some());

        tracker.apply_sync(vec![me.clone(), alice.clone()]);
        assert!(tracker.cursor(&alice.user_id).is_some());
        assert_eq!(
            tracker.participant(&alice.user_id).unwrap().cursor,
            Some(CursorPosition::new(3.0, 4.0))
        );
    }

    #[test]
    fn test_sync_keeps_participant_records_in_step_with_maps() {
        let me = participant("Me");
        let alice = participant("Alice");
        let mut tracker = PresenceTracker::new(me.user_id);
        tracker.apply_sync(vec![me.clone(), alice.clone()]);

        let selection = SelectionRange::new(vec![Uuid::new_v4()]);
        tracker.apply_cursor(alice.user_id, CursorPosition::new(7.0, 8.0), 1);
        tracker.apply_selection(alice.user_id, Some(selection.clone()));

        // Snapshot payloads carry no cursor or selection
        tracker.apply_sync(vec![me.clone(), alice.clone()]);

        let record = tracker.participant(&alice.user_id).unwrap();
        assert_eq!(record.cursor, Some(CursorPosition::new(7.0, 8.0)));
        assert_eq!(record.selection, Some(selection));
        assert_eq!(
            record.cursor,
            tracker.cursor(&alice.user_id).map(|c| c.position)
        );
    }

    #[test]
    fn test_rejoin_resets_cursor_sequence() {
        let me = participant("Me");
        let mut alice = participant("Alice");
        alice.joined_at = 100;
        let mut tracker = PresenceTracker::new(me.user_id);
        tracker.apply_sync(vec![me.clone(), alice.clone()]);
        assert!(tracker.apply_cursor(alice.user_id, CursorPosition::new(1.0, 1.0), 40));

        // The leave was missed; the new membership starts counting again
        let mut rejoined = alice.clone();
        rejoined.joined_at = 200;
        tracker.apply_sync(vec![me.clone(), rejoined]);
        assert!(tracker.cursor(&alice.user_id).is_none());

        assert!(tracker.apply_cursor(alice.user_id, CursorPosition::new(2.0, 2.0), 1));
        assert_eq!(
            tracker.cursor(&alice.user_id).unwrap().position,
            CursorPosition::new(2.0, 2.0)
        );
    }

    #[test]
    fn test_repeated_join_keeps_cursor() {
        let me = participant("Me");
        let alice = participant("Alice");
        let mut tracker = PresenceTracker::new(me.user_id);
        tracker.apply_join(alice.clone());
        tracker.apply_cursor(alice.user_id, CursorPosition::new(4.0, 4.0), 3);

        tracker.apply_join(alice.clone());

        assert_eq!(tracker.cursor(&alice.user_id).unwrap().seq, 3);
        assert_eq!(
            tracker.participant(&alice.user_id).unwrap().cursor,
            Some(CursorPosition::new(4.0, 4.0))
        );
    }

    #[test]
    fn test_cleared_selection_distinct_from_unknown() {
        let me = participant("Me");
        let alice = participant("Alice");
        let bob = participant("Bob");
        let mut tracker = PresenceTracker::new(me.user_id);
        tracker.apply_sync(vec![me, alice.clone(), bob.clone()]);

        tracker.apply_selection(alice.user_id, None);

        assert_eq!(tracker.selection(&alice.user_id), Some(&None));
        assert_eq!(tracker.selection(&bob.user_id), None);
    }

    #[test]
    fn test_participants_sorted_by_join_time() {
        let me = participant("Me");
        let mut early = participant("Early");
        let mut late = participant("Late");
        early.joined_at = 10;
        late.joined_at = 20;
        let mut tracker = PresenceTracker::new(me.user_id);
        tracker.apply_join(late.clone());
        tracker.apply_join(early.clone());

        let names: Vec<String> = tracker
            .participants()
            .into_iter()
            .map(|p| p.display_name)
            .collect();
        assert_eq!(names, vec!["Early".to_string(), "Late".to_string()]);
    }

    #[test]
    fn test_clear() {
        let me = participant("Me");
        let alice = participant("Alice");
        let mut tracker = PresenceTracker::new(me.user_id);
        tracker.apply_join(alice.clone());
        tracker.apply_cursor(alice.user_id, CursorPosition::new(1.0, 1.0), 1);
        tracker.clear();
        assert_eq!(tracker.participant_count(), 0);
        assert!(tracker.cursors().is_empty());
    }
}
