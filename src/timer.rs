//! Timer / scheduler (§4.6), generalizing `timer.c`'s `timer_start` /
//! `timer_repeating` / `timer_cancel` trio. The original binds an
//! `event`-library timer to a captured Block; here the [`Reactor`] owns a
//! slab of [`Timer`] entries and drives their deadlines each tick.
//!
//! [`Reactor`]: crate::reactor::Reactor

use std::time::{Duration, Instant};

pub type Callback = Box<dyn FnMut() + Send>;

/// Opaque handle returned by [`TimerWheel::start`] / [`TimerWheel::repeating`].
/// Cancellation is idempotent: cancelling an already-fired one-shot, or a
/// handle that was already cancelled, is a no-op.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TimerId(u64);

struct Entry {
    deadline: Instant,
    period: Option<Duration>,
    callback: Callback,
    cancelled: bool,
}

/// Owned exclusively by the reactor (§3's ownership rule). Never shared,
/// never touched from inside a fired callback except to re-arm via the
/// repeating path.
#[derive(Default)]
pub struct TimerWheel {
    next_id: u64,
    entries: Vec<(TimerId, Entry)>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, delay: Duration, callback: Callback) -> TimerId {
        self.insert(delay, None, callback)
    }

    pub fn repeating(&mut self, period: Duration, callback: Callback) -> TimerId {
        self.insert(period, Some(period), callback)
    }

    fn insert(&mut self, delay: Duration, period: Option<Duration>, callback: Callback) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let entry = Entry { deadline: Instant::now() + delay, period, callback, cancelled: false };
        self.entries.push((id, entry));
        id
    }

    /// Idempotent. A repeating timer must be cancelled from outside its own
    /// callback (the callback is mid-call while we'd be iterating `entries`);
    /// one-shot timers may be cancelled from inside their own callback
    /// because they've already been removed from the wheel by the time it runs.
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.retain(|(entry_id, _)| *entry_id != id);
    }

    /// Marks an entry cancelled without removing it mid-iteration; used by
    /// `fire_expired` so a callback that cancels *itself* or a sibling timer
    /// during firing doesn't invalidate the vector we're iterating.
    fn mark_cancelled(&mut self, id: TimerId) {
        if let Some((_, entry)) = self.entries.iter_mut().find(|(e, _)| *e == id) {
            entry.cancelled = true;
        }
    }

    /// Runs every expired timer's callback exactly once, draining one-shots
    /// and re-arming repeaters. Invariant: no timer is left in a "fired"
    /// state with a queued callback once this returns (§3).
    pub fn fire_expired(&mut self, now: Instant) {
        let due: Vec<TimerId> =
            self.entries.iter().filter(|(_, e)| !e.cancelled && e.deadline <= now).map(|(id, _)| *id).collect();

        for id in due {
            let Some(idx) = self.entries.iter().position(|(entry_id, _)| *entry_id == id) else {
                continue;
            };
            if self.entries[idx].1.cancelled {
                continue;
            }
            (self.entries[idx].1.callback)();

            // Re-fetch: the callback may have cancelled other timers (including
            // itself via `mark_cancelled`, never via direct removal).
            let Some(idx) = self.entries.iter().position(|(entry_id, _)| *entry_id == id) else {
                continue;
            };
            match self.entries[idx].1.period {
                Some(period) => self.entries[idx].1.deadline = Instant::now() + period,
                None => {
                    self.entries.remove(idx);
                }
            }
        }
    }

    /// Next deadline across all live timers, used by the reactor to bound
    /// its poll wait (capped at the 500 ms ceiling regardless, per §4.1).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().filter(|(_, e)| !e.cancelled).map(|(_, e)| e.deadline).min()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cancels everything; called from a controller's destruction sequence
    /// per §4.6's lifetime contract.
    pub fn cancel_all(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn mark_cancelled_for_test(&mut self, id: TimerId) {
        self.mark_cancelled(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn one_shot_fires_once_and_is_removed() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        wheel.start(Duration::from_millis(0), Box::new(move || { count2.fetch_add(1, Ordering::SeqCst); }));

        wheel.fire_expired(Instant::now() + Duration::from_millis(1));
        wheel.fire_expired(Instant::now() + Duration::from_millis(2));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn repeating_rearms_after_each_fire() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        let id = wheel.repeating(Duration::from_millis(0), Box::new(move || { count2.fetch_add(1, Ordering::SeqCst); }));

        wheel.fire_expired(Instant::now() + Duration::from_millis(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!wheel.is_empty());

        wheel.cancel(id);
        wheel.fire_expired(Instant::now() + Duration::from_millis(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut wheel = TimerWheel::new();
        let id = wheel.start(Duration::from_secs(60), Box::new(|| {}));
        wheel.cancel(id);
        wheel.cancel(id);
        assert!(wheel.is_empty());
    }
}
