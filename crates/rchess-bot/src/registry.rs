//! Process-wide set of live game ids.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Slots {
    active: HashSet<String>,
    /// Accepted challenges waiting for their `gameStart`, keyed by challenge id
    /// (the game id once it starts).
    reserved: HashMap<String, Instant>,
}

impl Slots {
    fn occupied(&self) -> usize {
        self.active.len() + self.reserved.len()
    }
}

/// Concurrent set of active games plus reserved slots. Admission check and
/// insert happen under one lock so the parallelism cap cannot be overshot by
/// racing starts.
#[derive(Debug, Default)]
pub struct GameRegistry {
    slots: Mutex<Slots>,
}

impl GameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `game_id` active if a slot is free or was reserved for it.
    ///
    /// Returns false when the registry is full. A game that is already present
    /// counts as admitted.
    pub fn try_admit(&self, game_id: &str, cap: usize) -> bool {
        let mut slots = self.slots.lock();
        if slots.active.contains(game_id) {
            return true;
        }
        if slots.reserved.remove(game_id).is_none() && slots.occupied() >= cap {
            return false;
        }
        slots.active.insert(game_id.to_string())
    }

    /// Holds a slot for an accepted challenge until its game starts.
    pub fn try_reserve(&self, challenge_id: &str, cap: usize) -> bool {
        let mut slots = self.slots.lock();
        if slots.active.contains(challenge_id) || slots.reserved.contains_key(challenge_id) {
            return true;
        }
        if slots.occupied() >= cap {
            return false;
        }
        slots.reserved.insert(challenge_id.to_string(), Instant::now());
        true
    }

    pub fn release_reservation(&self, challenge_id: &str) -> bool {
        self.slots.lock().reserved.remove(challenge_id).is_some()
    }

    /// Drops reservations older than `ttl` and returns their ids.
    pub fn expire_reservations(&self, ttl: Duration) -> Vec<String> {
        let mut slots = self.slots.lock();
        let expired: Vec<String> = slots
            .reserved
            .iter()
            .filter(|(_, since)| since.elapsed() >= ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            slots.reserved.remove(id);
        }
        expired
    }

    pub fn reserved(&self) -> usize {
        self.slots.lock().reserved.len()
    }

    /// Returns true if the id was not yet present.
    pub fn insert(&self, game_id: &str) -> bool {
        self.slots.lock().active.insert(game_id.to_string())
    }

    pub fn remove(&self, game_id: &str) -> bool {
        self.slots.lock().active.remove(game_id)
    }

    /// True if `game_id` is running (reservations excluded).
    pub fn contains(&self, game_id: &str) -> bool {
        self.slots.lock().active.contains(game_id)
    }

    /// Occupied slots: running games plus reservations.
    pub fn len(&self) -> usize {
        self.slots.lock().occupied()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.lock().active.iter().cloned().collect();
        ids.sort();
        ids
    }
}
