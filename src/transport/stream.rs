// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-thread completion counter underlying the host transport's async ops.
// Submissions bump the counter, completion callbacks drop it, `synchronize`
// parks until it reaches zero and then resets.

use std::sync::{Condvar, Mutex};

pub struct CounterStream {
    count: Mutex<i32>,
    cond: Condvar,
}

impl CounterStream {
    pub fn new(initial: i32) -> CounterStream {
        CounterStream {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Record `tasks` submitted operations.
    pub fn submit_tasks(&self, tasks: i32) {
        let mut count = self.count.lock().unwrap();
        *count += tasks;
    }

    /// One operation completed. `notify = false` is the submit-failure
    /// unwind, which must not wake a synchronizer.
    pub fn finish_one(&self, notify: bool) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if notify && *count <= 0 {
            self.cond.notify_all();
        }
    }

    /// Block until every submitted operation completed, then reset.
    pub fn synchronize(&self) {
        let guard = self.count.lock().unwrap();
        let mut guard = self.cond.wait_while(guard, |count| *count > 0).unwrap();
        *guard = 0;
    }

    pub fn reset(&self) {
        *self.count.lock().unwrap() = 0;
    }

    /// Wake synchronizers without touching the counter.
    pub fn abort(&self) {
        self.cond.notify_all();
    }
}
