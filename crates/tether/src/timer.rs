//! Per-session housekeeping timers.
//!
//! Each session's network worker owns one [`TimerSystem`], driven by the
//! worker's fixed-interval tick. A run first executes the one-shot callbacks
//! whose deadline has passed, in deadline order, and only then the periodic
//! tick hooks, so a scheduled deadline is never observed late by a hook that
//! depends on it.

use std::time::Instant;

type OnceCallback<E> = Box<dyn FnOnce(&mut E) + Send>;
type TickHook<E> = Box<dyn FnMut(&mut E) + Send>;

/// Handle for cancelling a scheduled one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(u64);

struct Scheduled<E> {
    token: TimerToken,
    deadline: Instant,
    callback: OnceCallback<E>,
}

/// Deadline-ordered one-shot callbacks plus periodic tick hooks.
pub struct TimerSystem<E> {
    scheduled: Vec<Scheduled<E>>,
    hooks: Vec<TickHook<E>>,
    next_token: u64,
}

impl<E> TimerSystem<E> {
    pub fn new() -> Self {
        Self {
            scheduled: Vec::new(),
            hooks: Vec::new(),
            next_token: 0,
        }
    }

    /// Schedule a one-shot callback for `deadline`.
    pub fn schedule(
        &mut self,
        deadline: Instant,
        callback: impl FnOnce(&mut E) + Send + 'static,
    ) -> TimerToken {
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        self.scheduled.push(Scheduled {
            token,
            deadline,
            callback: Box::new(callback),
        });
        token
    }

    /// Cancel a scheduled one-shot. Returns `false` when it already ran or
    /// was cancelled before.
    pub fn cancel(&mut self, token: TimerToken) -> bool {
        let before = self.scheduled.len();
        self.scheduled.retain(|entry| entry.token != token);
        self.scheduled.len() != before
    }

    /// Register a hook run on every tick, after due one-shots.
    pub fn add_tick_hook(&mut self, hook: impl FnMut(&mut E) + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Take the one-shots due at `now`, in deadline order (insertion order
    /// breaks ties). Separated from execution so the caller can run them
    /// against state that also owns this timer.
    pub fn take_due(&mut self, now: Instant) -> Vec<OnceCallback<E>> {
        let mut due: Vec<Scheduled<E>> = Vec::new();
        let mut index = 0;
        while index < self.scheduled.len() {
            if self.scheduled[index].deadline <= now {
                due.push(self.scheduled.swap_remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|entry| (entry.deadline, entry.token.0));
        due.into_iter().map(|entry| entry.callback).collect()
    }

    /// Take the tick hooks for one run; they must be handed back with
    /// [`restore_hooks`](Self::restore_hooks) afterwards.
    pub fn take_hooks(&mut self) -> Vec<TickHook<E>> {
        std::mem::take(&mut self.hooks)
    }

    /// Hand tick hooks back after a run. Hooks registered during the run are
    /// kept and land after the restored ones.
    pub fn restore_hooks(&mut self, mut hooks: Vec<TickHook<E>>) {
        let added = std::mem::take(&mut self.hooks);
        hooks.extend(added);
        self.hooks = hooks;
    }

    /// Deadline of the nearest scheduled one-shot.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduled.iter().map(|entry| entry.deadline).min()
    }
}

impl<E> Default for TimerSystem<E> {
    fn default() -> Self {
        Self::new()
    }
}
