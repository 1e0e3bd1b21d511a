// Copyright 2023 The Ledger Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Exponential backoff with jitter for sync retries.

use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use rand::Rng as _;

/// How retry delays are awaited. The embedder installs a real timer; the
/// default resolves immediately, which keeps the library free of an
/// executor dependency.
pub type SleepFn = Box<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// A [`SleepFn`] that does not wait.
pub fn immediate_sleep() -> SleepFn {
    Box::new(|_| futures::future::ready(()).boxed())
}

/// Produces exponentially growing retry delays with +-10% jitter.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max_delay: Duration,
    next: Duration,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at `initial` and doubling up to
    /// `max_delay`.
    pub fn new(initial: Duration, max_delay: Duration) -> Self {
        Self {
            initial,
            max_delay,
            next: initial,
        }
    }

    /// The delay to wait before the next retry. Each call doubles the
    /// following delay, up to the maximum.
    pub fn get_next(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(self.max_delay);
        let jitter = rand::rng().random_range(0.9..=1.1);
        base.mul_f64(jitter)
    }

    /// Resets the delay sequence after a success.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(64))
    }
}
