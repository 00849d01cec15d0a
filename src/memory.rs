//! Process-wide memory governor.
//!
//! A single atomic byte counter tracks everything the sibling-group store
//! holds resident: serialized sibling groups and their owned sample
//! arrays. Two thresholds, both fractions of a configured quota, gate
//! behavior: crossing **soft** triggers a best-effort LRU sweep of cold
//! groups; crossing **hard** forces an eviction before the allocation is
//! allowed to proceed, and an allocation that cannot free anything fails
//! with [`OctError::OutOfBudget`] rather than blocking forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use crate::error::{OctError, Result};

/// Default fraction of the quota at which a soft sweep is triggered.
pub const DEFAULT_SOFT_FRACTION: f64 = 0.8;

/// How long a blocked allocation waits for a concurrent `release()` to
/// free something before making one last eviction attempt and giving up.
/// Bounded so a hard-threshold allocation with nothing releasable still
/// surfaces `OutOfBudget` instead of parking forever.
const ALLOC_WAIT_TIMEOUT: Duration = Duration::from_millis(50);

/// Implemented by the sibling-group store so the governor can ask it to
/// give bytes back without knowing anything about groups or disk layout.
pub trait Evictor: Send + Sync {
    /// Releases one cold, non-front, no-pending-operation group and
    /// returns the number of bytes it freed, or `0` if nothing is
    /// currently releasable.
    fn evict_one(&self) -> u64;

    /// Best-effort: release as many cold groups as needed to bring
    /// residency back under `target`. Used by the soft sweep; failures to
    /// free enough are not an error, the hard threshold is the backstop.
    fn sweep_to(&self, target: u64, current: u64) {
        let mut resident = current;
        while resident > target {
            let freed = self.evict_one();
            if freed == 0 {
                break;
            }
            resident = resident.saturating_sub(freed);
        }
    }
}

pub struct MemoryGovernor {
    resident: AtomicU64,
    quota: u64,
    soft: u64,
    lock: Mutex<()>,
    cv: Condvar,
    evictor: RwLock<Option<Arc<dyn Evictor>>>,
}

impl MemoryGovernor {
    pub fn new(quota: u64) -> Arc<Self> {
        Self::with_soft_fraction(quota, DEFAULT_SOFT_FRACTION)
    }

    pub fn with_soft_fraction(quota: u64, soft_fraction: f64) -> Arc<Self> {
        let soft = ((quota as f64) * soft_fraction) as u64;
        Arc::new(Self {
            resident: AtomicU64::new(0),
            quota,
            soft,
            lock: Mutex::new(()),
            cv: Condvar::new(),
            evictor: RwLock::new(None),
        })
    }

    /// Registers the store that owns the groups this governor accounts
    /// for. Must be called once, before the first allocation that could
    /// cross a threshold.
    pub fn set_evictor(&self, evictor: Arc<dyn Evictor>) {
        *self.evictor.write().unwrap() = Some(evictor);
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident.load(Ordering::SeqCst)
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Accounts for `bytes` becoming resident, evicting cold groups first
    /// if needed. If nothing is releasable right away, blocks on a
    /// concurrent `release()` for up to [`ALLOC_WAIT_TIMEOUT`] before
    /// trying eviction once more; only fails if that, too, frees nothing.
    pub fn alloc(&self, bytes: u64) -> Result<()> {
        let mut guard = self.lock.lock().unwrap();
        loop {
            let cur = self.resident.load(Ordering::SeqCst);
            if cur.saturating_add(bytes) <= self.quota {
                self.resident.fetch_add(bytes, Ordering::SeqCst);
                if cur.saturating_add(bytes) > self.soft {
                    self.sweep_soft(cur.saturating_add(bytes));
                }
                return Ok(());
            }
            let freed = self.evictor.read().unwrap().as_ref().map(|e| e.evict_one()).unwrap_or(0);
            if freed > 0 {
                self.resident.fetch_sub(freed, Ordering::SeqCst);
                continue;
            }
            let (new_guard, timeout) = self.cv.wait_timeout(guard, ALLOC_WAIT_TIMEOUT).unwrap();
            guard = new_guard;
            if !timeout.timed_out() {
                // woken by a release(); recheck residency from the top.
                continue;
            }
            let freed = self.evictor.read().unwrap().as_ref().map(|e| e.evict_one()).unwrap_or(0);
            if freed > 0 {
                self.resident.fetch_sub(freed, Ordering::SeqCst);
                continue;
            }
            return Err(OctError::OutOfBudget {
                requested: bytes,
                resident: self.resident.load(Ordering::SeqCst),
                quota: self.quota,
            });
        }
    }

    /// Gives back `bytes` previously accounted for by [`Self::alloc`].
    /// Wakes any thread parked waiting on a release.
    pub fn release(&self, bytes: u64) {
        self.resident.fetch_sub(bytes, Ordering::SeqCst);
        self.cv.notify_all();
    }

    fn sweep_soft(&self, resident_now: u64) {
        if let Some(evictor) = self.evictor.read().unwrap().as_ref() {
            evictor.sweep_to(self.soft, resident_now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as Counter;

    struct FakeEvictor {
        releasable: Counter,
        unit: u64,
    }

    impl Evictor for FakeEvictor {
        fn evict_one(&self) -> u64 {
            let mut cur = self.releasable.load(Ordering::SeqCst);
            loop {
                if cur == 0 {
                    return 0;
                }
                match self.releasable.compare_exchange(
                    cur,
                    cur - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => return self.unit,
                    Err(actual) => cur = actual,
                }
            }
        }
    }

    #[test]
    fn allocation_under_quota_never_touches_the_evictor() {
        let gov = MemoryGovernor::new(1000);
        gov.set_evictor(Arc::new(FakeEvictor {
            releasable: Counter::new(0),
            unit: 100,
        }));
        gov.alloc(500).unwrap();
        assert_eq!(gov.resident_bytes(), 500);
    }

    #[test]
    fn over_hard_threshold_evicts_before_succeeding() {
        let gov = MemoryGovernor::new(1000);
        gov.set_evictor(Arc::new(FakeEvictor {
            releasable: Counter::new(3),
            unit: 100,
        }));
        gov.alloc(900).unwrap();
        // next alloc needs 200 more bytes than the quota allows resident;
        // the fake evictor must be asked to free some first.
        gov.alloc(250).unwrap();
        assert!(gov.resident_bytes() <= 1000);
    }

    #[test]
    fn nothing_releasable_fails_fast_with_out_of_budget() {
        let gov = MemoryGovernor::new(1000);
        gov.set_evictor(Arc::new(FakeEvictor {
            releasable: Counter::new(0),
            unit: 100,
        }));
        gov.alloc(900).unwrap();
        let result = gov.alloc(200);
        assert!(matches!(result, Err(OctError::OutOfBudget { .. })));
    }

    #[test]
    fn alloc_blocks_on_a_concurrent_release_instead_of_failing_immediately() {
        let gov = MemoryGovernor::new(1000);
        gov.set_evictor(Arc::new(FakeEvictor {
            releasable: Counter::new(0),
            unit: 100,
        }));
        gov.alloc(900).unwrap();
        let waiter = Arc::clone(&gov);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            waiter.release(200);
        });
        // nothing is releasable through the evictor; this must wait for
        // the spawned release() rather than failing on the first empty
        // eviction attempt.
        gov.alloc(300).unwrap();
        assert!(gov.resident_bytes() <= 1000);
    }

    #[test]
    fn release_gives_bytes_back() {
        let gov = MemoryGovernor::new(1000);
        gov.set_evictor(Arc::new(FakeEvictor {
            releasable: Counter::new(0),
            unit: 100,
        }));
        gov.alloc(500).unwrap();
        gov.release(200);
        assert_eq!(gov.resident_bytes(), 300);
    }
}
