//! Two-group alpha/beta lock
//!
//! A generalization of a reader/writer lock: members of the *same* group run
//! concurrently, members of *opposing* groups exclude each other. The alpha
//! group is the higher-priority group: a waiting alpha member blocks new beta
//! entries and is woken first when the active group drains. Constrained ring
//! qdiscs map their producer/consumer sides onto the groups to encode a
//! prioritization policy.
//!
//! Recursive acquisition and cross-group upgrades on one thread are caller
//! errors, detected through a per-thread registry of held locks.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{SchedError, SchedResult};

/// Lock group membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    /// Higher-priority group
    Alpha,
    /// Lower-priority group
    Beta,
}

impl Group {
    /// The opposing group
    pub fn opposite(self) -> Self {
        match self {
            Group::Alpha => Group::Beta,
            Group::Beta => Group::Alpha,
        }
    }
}

static NEXT_LOCK_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static HELD: RefCell<HashMap<usize, Group>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Default)]
struct LockState {
    active: Option<Group>,
    active_count: usize,
    alpha_waiting: usize,
    beta_waiting: usize,
}

/// The two-group lock
#[derive(Debug)]
pub struct GroupLock {
    id: usize,
    state: Mutex<LockState>,
    alpha_ready: Condvar,
    beta_ready: Condvar,
}

impl Default for GroupLock {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupLock {
    /// Create an unheld lock
    pub fn new() -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(LockState::default()),
            alpha_ready: Condvar::new(),
            beta_ready: Condvar::new(),
        }
    }

    fn check_reentry(&self, group: Group) -> SchedResult<()> {
        HELD.with(|held| match held.borrow().get(&self.id) {
            Some(current) if *current == group => Err(SchedError::RecursiveLockAcquisition),
            Some(_) => Err(SchedError::CrossGroupUpgrade),
            None => Ok(()),
        })
    }

    fn may_enter(state: &LockState, group: Group) -> bool {
        match state.active {
            None => group == Group::Alpha || state.alpha_waiting == 0,
            Some(active) if active == group => {
                // Same-group entry is concurrent, but beta yields to a
                // waiting alpha so the priority group cannot starve.
                group == Group::Alpha || state.alpha_waiting == 0
            }
            Some(_) => false,
        }
    }

    /// Acquire membership in `group`, waiting as long as necessary
    pub fn acquire(&self, group: Group) -> SchedResult<GroupGuard<'_>> {
        self.acquire_inner(group, None)
            .map(|guard| guard.unwrap_or_else(|| unreachable!("infinite wait cannot time out")))
    }

    /// Acquire membership in `group`, giving up after `timeout`
    ///
    /// `Ok(None)` means the timeout elapsed while the opposing group held the
    /// lock.
    pub fn try_acquire_for(
        &self,
        group: Group,
        timeout: Duration,
    ) -> SchedResult<Option<GroupGuard<'_>>> {
        self.acquire_inner(group, Some(std::time::Instant::now() + timeout))
    }

    fn acquire_inner(
        &self,
        group: Group,
        deadline: Option<std::time::Instant>,
    ) -> SchedResult<Option<GroupGuard<'_>>> {
        self.check_reentry(group)?;

        let mut state = self.state.lock();
        while !Self::may_enter(&state, group) {
            match group {
                Group::Alpha => state.alpha_waiting += 1,
                Group::Beta => state.beta_waiting += 1,
            }
            let timed_out = match (group, deadline) {
                (Group::Alpha, Some(at)) => self.alpha_ready.wait_until(&mut state, at).timed_out(),
                (Group::Beta, Some(at)) => self.beta_ready.wait_until(&mut state, at).timed_out(),
                (Group::Alpha, None) => {
                    self.alpha_ready.wait(&mut state);
                    false
                }
                (Group::Beta, None) => {
                    self.beta_ready.wait(&mut state);
                    false
                }
            };
            match group {
                Group::Alpha => state.alpha_waiting -= 1,
                Group::Beta => state.beta_waiting -= 1,
            }
            if timed_out && !Self::may_enter(&state, group) {
                return Ok(None);
            }
        }

        state.active = Some(group);
        state.active_count += 1;
        drop(state);

        HELD.with(|held| held.borrow_mut().insert(self.id, group));
        Ok(Some(GroupGuard { lock: self, group }))
    }

    fn release(&self, group: Group) {
        HELD.with(|held| held.borrow_mut().remove(&self.id));

        let mut state = self.state.lock();
        debug_assert_eq!(state.active, Some(group));
        state.active_count -= 1;
        if state.active_count == 0 {
            state.active = None;
            // Alpha is preferred on drain; betas only run once no alpha
            // member is waiting.
            if state.alpha_waiting > 0 {
                self.alpha_ready.notify_all();
            } else if state.beta_waiting > 0 {
                self.beta_ready.notify_all();
            }
        } else if group == Group::Alpha && state.alpha_waiting > 0 {
            // More alphas may pile in alongside the remaining holders.
            self.alpha_ready.notify_all();
        }
    }
}

/// RAII membership in one group of a [`GroupLock`]
#[must_use = "dropping the guard releases the group membership"]
#[derive(Debug)]
pub struct GroupGuard<'a> {
    lock: &'a GroupLock,
    group: Group,
}

impl GroupGuard<'_> {
    /// The group this guard belongs to
    pub fn group(&self) -> Group {
        self.group
    }
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_same_group_is_concurrent() {
        let lock = Arc::new(GroupLock::new());
        let first = lock.acquire(Group::Alpha).ok();
        assert!(first.is_some());

        let lock2 = lock.clone();
        let second = thread::spawn(move || {
            lock2
                .try_acquire_for(Group::Alpha, Duration::from_millis(100))
                .ok()
                .flatten()
                .is_some()
        });
        assert!(second.join().unwrap_or(false));
    }

    #[test]
    fn test_opposing_groups_exclude() {
        let lock = Arc::new(GroupLock::new());
        let _alpha = lock.acquire(Group::Alpha).ok();

        let lock2 = lock.clone();
        let beta = thread::spawn(move || {
            lock2
                .try_acquire_for(Group::Beta, Duration::from_millis(50))
                .ok()
                .flatten()
                .is_some()
        });
        assert!(!beta.join().unwrap_or(true));
    }

    #[test]
    fn test_beta_enters_after_alpha_drains() {
        let lock = Arc::new(GroupLock::new());
        let entered = Arc::new(AtomicBool::new(false));

        let guard = lock.acquire(Group::Alpha).ok();

        let waiter = {
            let lock = lock.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                let guard = lock.acquire(Group::Beta);
                entered.store(true, Ordering::SeqCst);
                drop(guard);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!entered.load(Ordering::SeqCst));

        drop(guard);
        waiter.join().ok();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_recursive_acquisition_rejected() {
        let lock = GroupLock::new();
        let _guard = lock.acquire(Group::Alpha).ok();
        assert_eq!(
            lock.acquire(Group::Alpha).err(),
            Some(SchedError::RecursiveLockAcquisition)
        );
    }

    #[test]
    fn test_cross_group_upgrade_rejected() {
        let lock = GroupLock::new();
        let _guard = lock.acquire(Group::Beta).ok();
        assert_eq!(
            lock.acquire(Group::Alpha).err(),
            Some(SchedError::CrossGroupUpgrade)
        );
    }

    #[test]
    fn test_release_allows_reacquisition_on_same_thread() {
        let lock = GroupLock::new();
        drop(lock.acquire(Group::Alpha));
        assert!(lock.acquire(Group::Beta).is_ok());
    }

    #[test]
    fn test_alpha_preferred_over_beta_on_drain() {
        let lock = Arc::new(GroupLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = lock.acquire(Group::Beta).ok();

        let mut waiters = Vec::new();
        for (group, tag) in [(Group::Alpha, "alpha"), (Group::Beta, "beta")] {
            let lock = lock.clone();
            let order = order.clone();
            waiters.push(thread::spawn(move || {
                let _guard = lock.acquire(group);
                order.lock().push(tag);
                thread::sleep(Duration::from_millis(10));
            }));
            // Let the waiter queue up before releasing.
            thread::sleep(Duration::from_millis(20));
        }

        drop(guard);
        for waiter in waiters {
            waiter.join().ok();
        }
        assert_eq!(order.lock().first().copied(), Some("alpha"));
    }
}
