use std::collections::HashMap;
use std::sync::Mutex;

use lumen_common::types::ControllerId;

use crate::view::ControllerState;

/// Default purge floor: five minutes past the point a controller went offline.
pub const DEFAULT_EXPIRY_FLOOR_SECS: i64 = -300;

/// Volatile liveness of one controller.
///
/// `ttl` counts down in seconds and goes negative once the controller is
/// offline; the entry is purged when it reaches the table's expiry floor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessEntry {
    pub id: ControllerId,
    pub ttl: i64,
    pub ping_pending: bool,
}

impl LivenessEntry {
    /// Online exactly while the ttl is positive.
    pub fn state(&self) -> ControllerState {
        if self.ttl > 0 {
            ControllerState::Online
        } else {
            ControllerState::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        self.ttl > 0
    }
}

/// Result of [`LivenessTable::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// The id was not in the table; a fresh entry was created.
    Inserted,
    /// Existing entry; `was_online` reports its state before the refresh.
    Refreshed { was_online: bool },
}

/// Changes produced by one decay step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecayReport {
    pub went_offline: Vec<ControllerId>,
    pub purged: Vec<ControllerId>,
}

/// In-memory table of controllers currently considered live.
pub struct LivenessTable {
    entries: Mutex<HashMap<ControllerId, LivenessEntry>>,
    expiry_floor: i64,
}

impl Default for LivenessTable {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRY_FLOOR_SECS)
    }
}

impl LivenessTable {
    pub fn new(expiry_floor: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            expiry_floor,
        }
    }

    pub fn contains(&self, id: ControllerId) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    pub fn entry(&self, id: ControllerId) -> Option<LivenessEntry> {
        self.entries.lock().unwrap().get(&id).cloned()
    }

    /// Mark `id` as seen with confidence `ttl`.
    ///
    /// A fresh entry starts at `ttl`; an existing one is raised to `ttl`
    /// but never lowered, so a weaker discovery source cannot undo a
    /// verified probe.
    pub fn refresh(&self, id: ControllerId, ttl: i64) -> Refresh {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&id) {
            Some(entry) => {
                let was_online = entry.is_online();
                entry.ttl = entry.ttl.max(ttl);
                Refresh::Refreshed { was_online }
            }
            None => {
                entries.insert(
                    id,
                    LivenessEntry {
                        id,
                        ttl,
                        ping_pending: false,
                    },
                );
                Refresh::Inserted
            }
        }
    }

    /// Record a successful verification probe: ttl is set to `ttl` and
    /// the pending flag cleared.
    pub fn verify(&self, id: ControllerId, ttl: i64) -> Refresh {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&id) {
            Some(entry) => {
                let was_online = entry.is_online();
                entry.ttl = ttl;
                entry.ping_pending = false;
                Refresh::Refreshed { was_online }
            }
            None => {
                entries.insert(
                    id,
                    LivenessEntry {
                        id,
                        ttl,
                        ping_pending: false,
                    },
                );
                Refresh::Inserted
            }
        }
    }

    /// Returns false if the id has no entry.
    pub fn set_ping_pending(&self, id: ControllerId, pending: bool) -> bool {
        match self.entries.lock().unwrap().get_mut(&id) {
            Some(entry) => {
                entry.ping_pending = pending;
                true
            }
            None => false,
        }
    }

    /// Advance every entry by `elapsed_secs`.
    pub fn decay(&self, elapsed_secs: i64) -> DecayReport {
        let mut report = DecayReport::default();
        let floor = self.expiry_floor;
        let mut entries = self.entries.lock().unwrap();

        entries.retain(|id, entry| {
            let was_online = entry.is_online();
            entry.ttl = entry.ttl.saturating_sub(elapsed_secs);
            if entry.ttl <= floor {
                report.purged.push(*id);
                return false;
            }
            if was_online && !entry.is_online() {
                report.went_offline.push(*id);
            }
            true
        });

        report.went_offline.sort();
        report.purged.sort();
        report
    }

    pub fn online_ids(&self) -> Vec<ControllerId> {
        let entries = self.entries.lock().unwrap();
        let mut ids: Vec<ControllerId> = entries
            .values()
            .filter(|e| e.is_online())
            .map(|e| e.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn online_count(&self) -> usize {
        let entries = self.entries.lock().unwrap();
        entries.values().filter(|e| e.is_online()).count()
    }

    pub fn snapshot(&self) -> Vec<LivenessEntry> {
        let entries = self.entries.lock().unwrap();
        let mut all: Vec<LivenessEntry> = entries.values().cloned().collect();
        all.sort_by_key(|e| e.id);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> ControllerId {
        ControllerId(n)
    }

    #[test]
    fn refresh_inserts_then_raises_only() {
        let table = LivenessTable::default();
        assert_eq!(table.refresh(id(5), 60), Refresh::Inserted);
        assert_eq!(
            table.refresh(id(5), 30),
            Refresh::Refreshed { was_online: true }
        );
        assert_eq!(table.entry(id(5)).unwrap().ttl, 60);

        table.refresh(id(5), 120);
        assert_eq!(table.entry(id(5)).unwrap().ttl, 120);
    }

    #[test]
    fn state_tracks_ttl_sign_after_every_decay() {
        let table = LivenessTable::default();
        table.refresh(id(2), 25);
        table.refresh(id(3), 60);
        table.refresh(id(4), 5);

        for _ in 0..12 {
            table.decay(10);
            for entry in table.snapshot() {
                assert_eq!(
                    entry.state() == ControllerState::Online,
                    entry.ttl > 0,
                    "entry {entry:?}"
                );
            }
        }
    }

    #[test]
    fn decay_reports_offline_transition_once() {
        let table = LivenessTable::default();
        table.refresh(id(9), 15);

        assert!(table.decay(10).went_offline.is_empty());
        assert_eq!(table.decay(10).went_offline, vec![id(9)]);
        assert!(table.decay(10).went_offline.is_empty());
        assert_eq!(table.entry(id(9)).unwrap().state(), ControllerState::Offline);
    }

    #[test]
    fn entry_is_purged_past_floor_and_recreated_fresh() {
        let table = LivenessTable::default();
        table.refresh(id(8), 60);
        table.set_ping_pending(id(8), true);

        let mut purged = Vec::new();
        for _ in 0..40 {
            purged.extend(table.decay(10).purged);
        }
        assert_eq!(purged, vec![id(8)]);
        assert!(!table.contains(id(8)));

        assert_eq!(table.refresh(id(8), 60), Refresh::Inserted);
        let fresh = table.entry(id(8)).unwrap();
        assert_eq!(fresh.ttl, 60);
        assert!(!fresh.ping_pending);
    }

    #[test]
    fn verify_sets_ttl_and_clears_pending() {
        let table = LivenessTable::default();
        table.refresh(id(4), 60);
        table.set_ping_pending(id(4), true);

        table.verify(id(4), 20);
        let entry = table.entry(id(4)).unwrap();
        assert_eq!(entry.ttl, 20);
        assert!(!entry.ping_pending);
    }

    #[test]
    fn online_ids_excludes_offline() {
        let table = LivenessTable::default();
        table.refresh(id(5), 60);
        table.refresh(id(12), 60);
        table.refresh(id(7), 5);
        table.decay(10);

        assert_eq!(table.online_ids(), vec![id(5), id(12)]);
        assert_eq!(table.online_count(), 2);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn set_ping_pending_on_unknown_id_is_noop() {
        let table = LivenessTable::default();
        assert!(!table.set_ping_pending(id(3), true));
        assert!(table.is_empty());
    }
}
