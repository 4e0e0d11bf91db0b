//! Tick-based timers.
//!
//! The engine is single-threaded and cooperative: nothing fires on its own.
//! The embedder advances time with `advance(n)`, which returns the tasks
//! that came due, in schedule order, and the owner dispatches them. All
//! intervals in the session configuration are tick counts against this
//! clock; one tick is whatever the embedder's event loop makes it.

use std::collections::HashSet;

/// Cancellation handle for a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// A deterministic tick scheduler over task keys of type `K`.
#[derive(Debug)]
pub struct Timers<K> {
    now: u64,
    next_id: u64,
    // (due tick, id, key); kept sorted on demand, small n
    queue: Vec<(u64, u64, K)>,
    cancelled: HashSet<u64>,
}

impl<K> Default for Timers<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Timers<K> {
    pub fn new() -> Self {
        Self {
            now: 0,
            next_id: 0,
            queue: Vec::new(),
            cancelled: HashSet::new(),
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Schedule `key` to come due `delay` ticks from now.
    pub fn after(&mut self, delay: u32, key: K) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push((self.now + u64::from(delay), id, key));
        TimerHandle(id)
    }

    pub fn cancel(&mut self, handle: TimerHandle) {
        self.cancelled.insert(handle.0);
    }

    /// Drop every scheduled task.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.cancelled.clear();
    }

    /// Move the clock forward and collect due, uncancelled tasks in
    /// (due-tick, schedule) order.
    pub fn advance(&mut self, ticks: u32) -> Vec<K> {
        self.now += u64::from(ticks);
        let now = self.now;
        self.queue.sort_by_key(|(due, id, _)| (*due, *id));

        let mut due = Vec::new();
        let mut rest = Vec::new();
        for (at, id, key) in self.queue.drain(..) {
            if self.cancelled.remove(&id) {
                continue;
            }
            if at <= now {
                due.push(key);
            } else {
                rest.push((at, id, key));
            }
        }
        self.queue = rest;
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_order() {
        let mut t: Timers<&str> = Timers::new();
        t.after(10, "late");
        t.after(5, "early");
        assert_eq!(t.advance(4), Vec::<&str>::new());
        assert_eq!(t.advance(1), vec!["early"]);
        assert_eq!(t.advance(100), vec!["late"]);
    }

    #[test]
    fn cancelled_tasks_do_not_fire() {
        let mut t: Timers<u8> = Timers::new();
        let a = t.after(5, 1);
        t.after(5, 2);
        t.cancel(a);
        assert_eq!(t.advance(5), vec![2]);
    }

    #[test]
    fn same_tick_keeps_schedule_order() {
        let mut t: Timers<u8> = Timers::new();
        t.after(3, 1);
        t.after(3, 2);
        t.after(3, 3);
        assert_eq!(t.advance(3), vec![1, 2, 3]);
    }
}
