//! Helper-side rendezvous controller (§4.4, §5).
//!
//! Grounded in `injector_helper.c`'s `proxy` struct: a `STAILQ` of known
//! injectors, a `pick_random_injector` selector, a discovery timer whose
//! period depends on whether the injector set is empty (`minute` vs
//! `25 * minute`), and an announce timer that starts the first time an
//! injector is learned. The original leaves "stop announcing when the
//! injector count drops back to zero" as an explicit `// TODO`; this
//! controller implements it (§9 Open Question 4).
//!
//! States an injector moves through (`Unknown` is simply "not in the map"):
//! `Known` (freshly discovered) → `InUse` (currently bridging a splice) →
//! `Failing` (a connection attempt or splice errored) → `Evicted` (removed
//! after too many consecutive failures).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;

use crate::types::{Endpoint, InjectorRecord};

const DISCOVERY_EMPTY_INTERVAL: Duration = Duration::from_secs(60);
const DISCOVERY_NONEMPTY_INTERVAL: Duration = Duration::from_secs(25 * 60);
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectorState {
    Known,
    InUse,
    Failing,
    Evicted,
}

struct Entry {
    record: InjectorRecord,
    state: InjectorState,
}

/// Owned by the helper's single-threaded reactor; not `Sync`, not meant to
/// be shared across threads (§3's ownership rule applies here too).
pub struct RendezvousController {
    injectors: HashMap<Endpoint, Entry>,
    announcing: bool,
}

impl Default for RendezvousController {
    fn default() -> Self {
        Self::new()
    }
}

impl RendezvousController {
    pub fn new() -> Self {
        Self { injectors: HashMap::new(), announcing: false }
    }

    pub fn len(&self) -> usize {
        self.injectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.injectors.is_empty()
    }

    /// The interval the next discovery timer should use, chosen by whether
    /// any injector is currently known (§4.4: 1 minute empty, 25 minutes
    /// otherwise).
    pub fn next_discovery_interval(&self) -> Duration {
        if self.is_empty() {
            DISCOVERY_EMPTY_INTERVAL
        } else {
            DISCOVERY_NONEMPTY_INTERVAL
        }
    }

    /// `true` exactly on the transition into "at least one injector known",
    /// i.e. when the caller should start the hourly self-announce timer.
    pub fn add_injector(&mut self, ep: Endpoint, now: Instant) -> bool {
        if ep.is_zero_ip() {
            tracing::debug!(%ep, "dropping bogus 0.0.0.0 injector endpoint from DHT");
            return false;
        }
        if self.injectors.contains_key(&ep) {
            return false;
        }
        self.injectors.insert(ep, Entry { record: InjectorRecord::new(ep, now), state: InjectorState::Known });
        let just_started = !self.announcing;
        self.announcing = true;
        just_started
    }

    /// `true` exactly on the transition into "no injectors known", i.e. when
    /// the caller should cancel the self-announce timer (§9 Open Question 4).
    fn evict(&mut self, ep: Endpoint) -> bool {
        self.injectors.remove(&ep);
        if self.is_empty() && self.announcing {
            self.announcing = false;
            return true;
        }
        false
    }

    pub fn is_announcing(&self) -> bool {
        self.announcing
    }

    pub fn announce_interval() -> Duration {
        ANNOUNCE_INTERVAL
    }

    /// Chooses a random known injector for a fresh inbound client connection
    /// (`pick_random_injector`). Returns `None` iff no injector is known.
    pub fn pick_random(&self) -> Option<Endpoint> {
        let mut rng = rand::thread_rng();
        self.injectors.keys().copied().choose(&mut rng)
    }

    pub fn mark_in_use(&mut self, ep: Endpoint, now: Instant) {
        if let Some(entry) = self.injectors.get_mut(&ep) {
            entry.state = InjectorState::InUse;
            entry.record.last_contacted = Some(now);
        }
    }

    pub fn mark_success(&mut self, ep: Endpoint) {
        if let Some(entry) = self.injectors.get_mut(&ep) {
            entry.state = InjectorState::Known;
            entry.record.consecutive_failures = 0;
        }
    }

    /// Records a connect/splice failure; evicts the injector once it has
    /// failed [`MAX_CONSECUTIVE_FAILURES`] times in a row, returning whether
    /// that eviction just emptied the set (caller should stop announcing).
    pub fn mark_failure(&mut self, ep: Endpoint) -> bool {
        let evict = if let Some(entry) = self.injectors.get_mut(&ep) {
            entry.record.consecutive_failures += 1;
            entry.state = if entry.record.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                InjectorState::Evicted
            } else {
                InjectorState::Failing
            };
            entry.state == InjectorState::Evicted
        } else {
            false
        };
        if evict {
            self.evict(ep)
        } else {
            false
        }
    }

    pub fn state_of(&self, ep: Endpoint) -> Option<InjectorState> {
        self.injectors.get(&ep).map(|e| e.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_all_zero_endpoint() {
        let mut c = RendezvousController::new();
        assert!(!c.add_injector(Endpoint::ZERO, Instant::now()));
        assert!(c.is_empty());
    }

    #[test]
    fn dedups_and_starts_announcing_exactly_once() {
        let mut c = RendezvousController::new();
        let now = Instant::now();
        let ep = Endpoint::new([10, 0, 0, 1], 7000);
        assert!(c.add_injector(ep, now));
        assert!(!c.add_injector(ep, now));
        assert!(c.is_announcing());
    }

    #[test]
    fn discovery_interval_shortens_while_empty() {
        let c = RendezvousController::new();
        assert_eq!(c.next_discovery_interval(), DISCOVERY_EMPTY_INTERVAL);
    }

    #[test]
    fn eviction_after_max_failures_stops_announcing() {
        let mut c = RendezvousController::new();
        let ep = Endpoint::new([10, 0, 0, 1], 7000);
        c.add_injector(ep, Instant::now());
        let mut stopped = false;
        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            stopped = c.mark_failure(ep);
        }
        assert!(stopped);
        assert!(c.is_empty());
        assert!(!c.is_announcing());
    }

    #[test]
    fn pick_random_returns_none_when_empty() {
        let c = RendezvousController::new();
        assert_eq!(c.pick_random(), None);
    }
}
