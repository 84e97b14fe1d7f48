/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Per-listener connection cap (spec §4.6). `0` means unlimited.
pub struct ConcurrencyLimiter {
    max: usize,
    current: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    pub fn new(max: usize) -> Self {
        ConcurrencyLimiter {
            max,
            current: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn try_acquire(&self) -> Option<InFlight> {
        if self.max == 0 {
            return Some(InFlight {
                current: self.current.clone(),
                counted: false,
            });
        }
        loop {
            let now = self.current.load(Ordering::Acquire);
            if now >= self.max {
                return None;
            }
            if self
                .current
                .compare_exchange(now, now + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(InFlight {
                    current: self.current.clone(),
                    counted: true,
                });
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.load(Ordering::Acquire) > 0
    }
}

/// RAII guard releasing one slot of the concurrency limiter on drop.
pub struct InFlight {
    current: Arc<AtomicUsize>,
    counted: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.counted {
            self.current.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_cap() {
        let limiter = ConcurrencyLimiter::new(1);
        let first = limiter.try_acquire();
        assert!(first.is_some());
        assert!(limiter.try_acquire().is_none());
        drop(first);
        assert!(limiter.try_acquire().is_some());
    }
}
