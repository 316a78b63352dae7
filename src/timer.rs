//! Monotonic timer scheduler (spec §4.C).
//!
//! Backed by a `slab::Slab`, enriched from the dependency set of
//! `carvalhof-bkp1`'s demikernel (which leans on `slab` for exactly this
//! "fixed pool, first-free index, stable handle" shape). A `Slab` at
//! capacity returns `None` from `insert`-style calls, which maps directly
//! onto spec §4.C's `OUT_OF_RESOURCES`.

use std::cell::RefCell;
use std::rc::Rc;

use slab::Slab;

use crate::error::{Error, Result};
use crate::time::{Duration, Instant};

/// Default capacity of the timer pool (spec §3: "A fixed pool (e.g., 32)").
pub const DEFAULT_POOL_SIZE: usize = 32;

/// Notified when a scheduled timer fires.
pub trait TimerListener {
    /// `elapsed` is `now - start_time`, i.e. how long after scheduling the
    /// timer actually fired (spec §4.C).
    fn on_timer_fired(&mut self, timer: TimerHandle, elapsed: Duration);
}

/// A stable handle into the scheduler's timer pool. Cheap to copy; does
/// not itself own scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(usize);

struct Entry {
    start_time: Instant,
    fire_time: Option<Instant>,
    insertion_seq: u64,
    listener: Option<Rc<RefCell<dyn TimerListener>>>,
}

/// The scheduler itself. One per event loop (spec §4.D: "all core objects
/// are bound to it"), shared with every loop-affine element via
/// [`crate::event_loop::EventLoop::timers`] so each element can create and
/// schedule its own timers directly.
pub struct Scheduler {
    entries: Slab<Entry>,
    capacity: usize,
    next_insertion_seq: u64,
}

impl Scheduler {
    pub fn new(capacity: usize) -> Scheduler {
        Scheduler {
            entries: Slab::with_capacity(capacity),
            capacity,
            next_insertion_seq: 0,
        }
    }

    /// Allocate a timer slot. Returns `OUT_OF_RESOURCES` once `capacity`
    /// timers are live simultaneously (spec §4.C).
    pub fn create_timer(&mut self) -> Result<TimerHandle> {
        if self.entries.len() >= self.capacity {
            return Err(Error::OutOfResources);
        }
        let key = self.entries.insert(Entry {
            start_time: Instant::ZERO,
            fire_time: None,
            insertion_seq: 0,
            listener: None,
        });
        Ok(TimerHandle(key))
    }

    /// Destroy a timer, freeing its slot for reuse.
    pub fn destroy_timer(&mut self, timer: TimerHandle) {
        if self.entries.contains(timer.0) {
            self.entries.remove(timer.0);
        }
    }

    /// Insert `timer` into the time-ordered schedule, to fire
    /// `ms_from_now` milliseconds after `now`, notifying `listener` when
    /// it does (spec §4.C: `schedule(timer, listener, ms_from_now)`).
    /// Ties are broken by insertion order, realized here by storing a
    /// monotonically increasing sequence number alongside `fire_time` and
    /// sorting on `(fire_time, seq)` at `set_time` time rather than
    /// maintaining a separate ordered list — the pool is small (≤
    /// `capacity`) so an O(n log n) sort per tick is cheap and avoids a
    /// second data structure to keep in sync with the slab.
    pub fn schedule(
        &mut self,
        timer: TimerHandle,
        listener: Rc<RefCell<dyn TimerListener>>,
        now: Instant,
        ms_from_now: u64,
    ) {
        let seq = self.next_insertion_seq;
        self.next_insertion_seq += 1;
        if let Some(entry) = self.entries.get_mut(timer.0) {
            entry.start_time = now;
            entry.fire_time = Some(now + Duration::from_millis(ms_from_now));
            entry.insertion_seq = seq;
            entry.listener = Some(listener);
        }
    }

    /// Detach a timer from the schedule without destroying its slot.
    /// Idempotent (spec §5).
    pub fn unschedule(&mut self, timer: TimerHandle) {
        if let Some(entry) = self.entries.get_mut(timer.0) {
            entry.fire_time = None;
        }
    }

    pub fn is_scheduled(&self, timer: TimerHandle) -> bool {
        self.entries
            .get(timer.0)
            .map(|e| e.fire_time.is_some())
            .unwrap_or(false)
    }

    /// The earliest `fire_time` among all scheduled timers, used by the
    /// event loop to bound how long it may block waiting for I/O.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().filter_map(|(_, e)| e.fire_time).min()
    }

    /// Fire and detach every timer with `fire_time <= now`, in
    /// `(fire_time, insertion order)` order, notifying each one's
    /// listener. A listener that reschedules itself for `0` from within
    /// its own callback is not fired again within this same pass (we
    /// detach before invoking); a listener that destroys a different
    /// not-yet-invoked timer simply causes that later invocation to be
    /// skipped (its slot no longer exists).
    pub fn set_time(&mut self, now: Instant) -> usize {
        let mut due: Vec<(usize, Instant, u64)> = self
            .entries
            .iter()
            .filter_map(|(key, e)| e.fire_time.map(|ft| (key, ft, e.insertion_seq)))
            .filter(|(_, ft, _)| *ft <= now)
            .collect();
        due.sort_by_key(|(_, ft, seq)| (*ft, *seq));

        let mut fired = 0;
        for (key, _, _) in due {
            let (start_time, listener) = match self.entries.get_mut(key) {
                Some(e) if e.fire_time.is_some() => {
                    // Detach before invoking: a reentrant schedule(0) call
                    // must not fire again within this same pass.
                    e.fire_time = None;
                    (e.start_time, e.listener.clone())
                }
                _ => continue, // destroyed or unscheduled by an earlier callback this tick
            };
            let elapsed = now.saturating_duration_since(start_time);
            if let Some(listener) = listener {
                listener.borrow_mut().on_timer_fired(TimerHandle(key), elapsed);
            }
            fired += 1;
        }
        fired
    }
}
