//! Cross-thread access to objects owned by a tick worker.
//!
//! A [`SafeHandle`] wraps one region or dynamic object. During a tick the
//! dispatcher tags the handle with the [`WorkerToken`] of the worker that
//! simulates its partition. That worker takes the fast path: no gate, only
//! an uncontended per-handle mutex. Every other thread first enters the
//! owning partition's [`PartitionGate`], which the worker holds for its
//! whole segment, so a non-owner access waits until the segment has ended
//! and then observes the post-segment state.
//!
//! Recursive access to the *same* handle from inside its own access closure
//! returns [`AccessError::Reentrant`] rather than aliasing `&mut T`, on the
//! owner path and the non-owner path alike. A non-owner access nested
//! inside another one does not re-enter a gate the thread already holds.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;

use tessel_core::{AccessError, HandleId, PartitionId, TickId};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// A panic inside an update is already reported as a fault and the object
/// skipped for the tick, so poisoning carries no extra information.
pub(crate) fn lock_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_TOKEN: Cell<u64> = const { Cell::new(0) };
    static HELD: RefCell<Held> = const {
        RefCell::new(Held {
            gates: Vec::new(),
            handles: Vec::new(),
        })
    };
}

/// Gates and handles the calling thread is inside on the non-owner path.
///
/// Gates are keyed by `Arc::as_ptr`; the accessor keeps its `Arc` alive
/// for as long as the key is listed.
struct Held {
    gates: Vec<usize>,
    handles: Vec<HandleId>,
}

fn gate_key(gate: &Arc<PartitionGate>) -> usize {
    Arc::as_ptr(gate) as usize
}

fn holds_gate(key: usize) -> bool {
    HELD.with(|h| h.borrow().gates.contains(&key))
}

fn holds_handle(id: HandleId) -> bool {
    HELD.with(|h| h.borrow().handles.contains(&id))
}

/// One non-owner access in progress on this thread. Unlisted on drop,
/// panic or not.
struct HeldEntry {
    gate: Option<usize>,
    handle: HandleId,
}

impl HeldEntry {
    fn push(gate: Option<usize>, handle: HandleId) -> Self {
        HELD.with(|h| {
            let mut h = h.borrow_mut();
            if let Some(key) = gate {
                h.gates.push(key);
            }
            h.handles.push(handle);
        });
        Self { gate, handle }
    }
}

impl Drop for HeldEntry {
    fn drop(&mut self) {
        let _ = HELD.try_with(|h| {
            let mut h = h.borrow_mut();
            if let Some(key) = self.gate {
                if let Some(i) = h.gates.iter().rposition(|g| *g == key) {
                    h.gates.swap_remove(i);
                }
            }
            if let Some(i) = h.handles.iter().rposition(|id| *id == self.handle) {
                h.handles.swap_remove(i);
            }
        });
    }
}

/// Identity of a dispatcher worker thread.
///
/// Never zero; zero in an owner tag means "not owned".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerToken(u64);

impl WorkerToken {
    pub(crate) fn allocate() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind this token to the calling thread. Called once, first thing on
    /// a freshly spawned worker.
    pub(crate) fn install(self) {
        CURRENT_TOKEN.with(|c| c.set(self.0));
    }

    /// The token of the calling thread, or `None` off the worker pool.
    pub fn current() -> Option<WorkerToken> {
        let raw = CURRENT_TOKEN.with(Cell::get);
        (raw != 0).then_some(WorkerToken(raw))
    }
}

/// The per-partition exclusion point.
///
/// Held by the partition's worker for the whole simulation segment.
/// Non-owner accesses to any handle in the partition enter it first.
#[derive(Debug)]
pub struct PartitionGate {
    partition: PartitionId,
    lock: Mutex<()>,
}

impl PartitionGate {
    pub(crate) fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            lock: Mutex::new(()),
        }
    }

    /// The partition this gate guards.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub(crate) fn enter(&self) -> MutexGuard<'_, ()> {
        lock_recover(&self.lock)
    }

    pub(crate) fn try_enter(&self) -> Option<MutexGuard<'_, ()>> {
        match self.lock.try_lock() {
            Ok(g) => Some(g),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// Accumulated time spent by non-owner accesses waiting for a handle.
///
/// One instance per world; the tick driver drains it once per tick for
/// the telemetry event.
#[derive(Debug, Default)]
pub struct AcquireStats {
    wait_ns: AtomicU64,
    acquisitions: AtomicU64,
}

/// One drained reading of [`AcquireStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcquireSample {
    /// Total nanoseconds spent waiting.
    pub wait_ns: u64,
    /// Number of blocking accesses.
    pub acquisitions: u64,
}

impl AcquireStats {
    /// Fresh, zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, wait_ns: u64) {
        self.wait_ns.fetch_add(wait_ns, Ordering::Relaxed);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Wait nanoseconds accumulated since the last reset.
    pub fn wait_ns(&self) -> u64 {
        self.wait_ns.load(Ordering::Relaxed)
    }

    /// Blocking accesses since the last reset.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Read and zero both counters.
    pub fn reset(&self) -> AcquireSample {
        AcquireSample {
            wait_ns: self.wait_ns.swap(0, Ordering::Relaxed),
            acquisitions: self.acquisitions.swap(0, Ordering::Relaxed),
        }
    }
}

/// Produces an immutable, generation-tagged view of a wrapped value.
///
/// Views are what snapshots read; they are swapped in as a whole, so a
/// reader always sees one coherent state per handle.
pub trait Publish: Send + 'static {
    /// The published view type.
    type View: Send + Sync + 'static;

    /// Build a view of the current state.
    fn view(&self, generation: TickId) -> Self::View;
}

/// Cross-thread access wrapper with an owner fast path.
pub struct SafeHandle<T: Publish> {
    id: HandleId,
    owner: AtomicU64,
    owner_borrowed: AtomicBool,
    gate: Mutex<Option<Arc<PartitionGate>>>,
    cell: Mutex<Option<T>>,
    invalidated: AtomicBool,
    view: Mutex<Arc<T::View>>,
    stats: Arc<AcquireStats>,
}

impl<T: Publish> std::fmt::Debug for SafeHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeHandle")
            .field("id", &self.id)
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field("invalidated", &self.is_invalidated())
            .finish_non_exhaustive()
    }
}

/// Resets the owner's re-entrancy flag even if the closure panics.
struct BorrowFlag<'a>(&'a AtomicBool);

impl Drop for BorrowFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T: Publish> SafeHandle<T> {
    /// Wrap `value`. Its initial view is published at generation 0.
    pub fn new(value: T, stats: Arc<AcquireStats>) -> Self {
        let view = Arc::new(value.view(TickId(0)));
        Self {
            id: HandleId::next(),
            owner: AtomicU64::new(0),
            owner_borrowed: AtomicBool::new(false),
            gate: Mutex::new(None),
            cell: Mutex::new(Some(value)),
            invalidated: AtomicBool::new(false),
            view: Mutex::new(view),
            stats,
        }
    }

    /// This handle's process-unique id.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Whether the calling thread currently holds the fast path.
    pub fn is_owned_by_current_thread(&self) -> bool {
        match WorkerToken::current() {
            Some(t) => self.owner.load(Ordering::Acquire) == t.0,
            None => false,
        }
    }

    /// Whether the wrapped value has been removed.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Partition whose gate currently guards this handle.
    pub fn partition(&self) -> Option<PartitionId> {
        lock_recover(&self.gate).as_ref().map(|g| g.partition())
    }

    /// Run `f` on the wrapped value.
    ///
    /// The owning worker runs it immediately. Any other thread blocks
    /// until the owning partition's segment has ended. Fails with
    /// [`AccessError::Invalidated`] once the value has been removed, and
    /// with [`AccessError::Reentrant`] when called for this handle from
    /// inside its own closure.
    ///
    /// Nested accesses to other handles of the same partition do not wait
    /// on the gate again. Nesting across partitions waits on each gate in
    /// turn, so two threads nesting in opposite orders can deadlock.
    pub fn access<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, AccessError> {
        self.access_recorded(f, true)
    }

    /// [`access`](Self::access) without adding to the acquisition wait
    /// counter. For the dispatcher's own boundary work.
    pub(crate) fn boundary_access<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, AccessError> {
        self.access_recorded(f, false)
    }

    fn access_recorded<R>(
        &self,
        f: impl FnOnce(&mut T) -> R,
        record: bool,
    ) -> Result<R, AccessError> {
        if self.is_invalidated() {
            return Err(AccessError::Invalidated { handle: self.id });
        }
        if self.is_owned_by_current_thread() {
            return self.access_owned(f);
        }
        if holds_handle(self.id) {
            return Err(AccessError::Reentrant { handle: self.id });
        }

        let started = Instant::now();
        loop {
            let gate = self.current_gate();
            let key = gate.as_ref().map(gate_key);
            let nested = key.is_some_and(holds_gate);
            let _held = match gate.as_ref() {
                Some(g) if !nested => Some(g.enter()),
                _ => None,
            };
            if !self.gate_matches(gate.as_ref()) {
                // Reassigned while we waited; follow the handle.
                continue;
            }
            let mut cell = lock_recover(&self.cell);
            if record {
                self.stats.record(started.elapsed().as_nanos() as u64);
            }
            let _entry = HeldEntry::push(key.filter(|_| !nested), self.id);
            return self.run(&mut cell, f);
        }
    }

    /// Non-blocking [`access`](Self::access).
    ///
    /// Returns [`AccessError::WouldBlock`] when the owning segment is in
    /// progress or another thread holds the value.
    pub fn try_access<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, AccessError> {
        if self.is_invalidated() {
            return Err(AccessError::Invalidated { handle: self.id });
        }
        if self.is_owned_by_current_thread() {
            return self.access_owned(f);
        }
        if holds_handle(self.id) {
            return Err(AccessError::Reentrant { handle: self.id });
        }

        let gate = self.current_gate();
        let key = gate.as_ref().map(gate_key);
        let nested = key.is_some_and(holds_gate);
        let _held = match gate.as_ref() {
            Some(g) if !nested => Some(g.try_enter().ok_or(AccessError::WouldBlock)?),
            _ => None,
        };
        if !self.gate_matches(gate.as_ref()) {
            return Err(AccessError::WouldBlock);
        }
        let mut cell = match self.cell.try_lock() {
            Ok(c) => c,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(AccessError::WouldBlock),
        };
        let _entry = HeldEntry::push(key.filter(|_| !nested), self.id);
        self.run(&mut cell, f)
    }

    /// The most recently published view. Never takes the value lock.
    pub fn latest_view(&self) -> Arc<T::View> {
        Arc::clone(&lock_recover(&self.view))
    }

    fn access_owned<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, AccessError> {
        if self.owner_borrowed.swap(true, Ordering::AcqRel) {
            return Err(AccessError::Reentrant { handle: self.id });
        }
        let _flag = BorrowFlag(&self.owner_borrowed);
        // Uncontended unless a gate-less accessor is just finishing.
        let mut cell = lock_recover(&self.cell);
        self.run(&mut cell, f)
    }

    fn run<R>(&self, cell: &mut Option<T>, f: impl FnOnce(&mut T) -> R) -> Result<R, AccessError> {
        match cell.as_mut() {
            Some(value) => Ok(f(value)),
            None => Err(AccessError::Invalidated { handle: self.id }),
        }
    }

    fn current_gate(&self) -> Option<Arc<PartitionGate>> {
        lock_recover(&self.gate).clone()
    }

    fn gate_matches(&self, expected: Option<&Arc<PartitionGate>>) -> bool {
        let now = lock_recover(&self.gate);
        match (now.as_ref(), expected) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    pub(crate) fn begin_ownership(&self, token: WorkerToken) {
        let prev = self.owner.swap(token.0, Ordering::AcqRel);
        debug_assert!(
            prev == 0 || prev == token.0,
            "handle {} already owned by another worker",
            self.id
        );
    }

    pub(crate) fn end_ownership(&self) {
        self.owner.store(0, Ordering::Release);
    }

    pub(crate) fn set_gate(&self, gate: Option<Arc<PartitionGate>>) {
        *lock_recover(&self.gate) = gate;
    }

    /// Remove the wrapped value. Later accesses fail with `Invalidated`.
    pub(crate) fn invalidate(&self) -> Option<T> {
        self.invalidated.store(true, Ordering::Release);
        self.set_gate(None);
        lock_recover(&self.cell).take()
    }

    /// Swap in a fresh view built from the current state.
    pub(crate) fn publish(&self, generation: TickId) -> Result<(), AccessError> {
        let view = Arc::new(self.boundary_access(|v| v.view(generation))?);
        *lock_recover(&self.view) = view;
        Ok(())
    }
}

struct Probe;

impl Publish for Probe {
    type View = ();
    fn view(&self, _: TickId) {}
}

// Compile-time assertion: handles cross thread boundaries freely.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<SafeHandle<Probe>>();
    assert::<AcquireStats>();
    assert::<PartitionGate>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    struct Counter(u64);

    impl Publish for Counter {
        type View = u64;
        fn view(&self, _: TickId) -> u64 {
            self.0
        }
    }

    fn handle(v: u64) -> Arc<SafeHandle<Counter>> {
        Arc::new(SafeHandle::new(Counter(v), Arc::new(AcquireStats::new())))
    }

    #[test]
    fn access_outside_any_partition() {
        let h = handle(1);
        h.access(|c| c.0 += 1).unwrap();
        assert_eq!(h.access(|c| c.0).unwrap(), 2);
        assert_eq!(h.try_access(|c| c.0).unwrap(), 2);
        assert_eq!(h.stats.acquisitions(), 2);
    }

    #[test]
    fn invalidated_handle_fails() {
        let h = handle(5);
        assert!(matches!(h.invalidate(), Some(Counter(5))));
        let err = h.access(|c| c.0).unwrap_err();
        assert_eq!(err, AccessError::Invalidated { handle: h.id() });
        assert!(h.try_access(|c| c.0).is_err());
        assert!(h.is_invalidated());
    }

    #[test]
    fn off_pool_threads_have_no_token() {
        assert_eq!(WorkerToken::current(), None);
        let h = handle(0);
        assert!(!h.is_owned_by_current_thread());
    }

    #[test]
    fn owner_fast_path_skips_gate_and_detects_reentry() {
        let h = handle(0);
        let gate = Arc::new(PartitionGate::new(PartitionId(0)));
        h.set_gate(Some(Arc::clone(&gate)));

        let h2 = Arc::clone(&h);
        let g2 = Arc::clone(&gate);
        thread::spawn(move || {
            let token = WorkerToken::allocate();
            token.install();
            let _segment = g2.enter();
            h2.begin_ownership(token);
            assert!(h2.is_owned_by_current_thread());
            // Gate is held by this thread; the owner never touches it.
            h2.access(|c| c.0 += 1).unwrap();
            let nested = h2.access(|_| h2.access(|c| c.0)).unwrap();
            assert_eq!(nested, Err(AccessError::Reentrant { handle: h2.id() }));
            h2.end_ownership();
            assert!(!h2.is_owned_by_current_thread());
        })
        .join()
        .unwrap();

        assert_eq!(h.access(|c| c.0).unwrap(), 1);
        // Only the final access was a blocking one.
        assert_eq!(h.stats.acquisitions(), 1);
    }

    #[test]
    fn non_owner_blocks_until_segment_ends() {
        let h = handle(0);
        let gate = Arc::new(PartitionGate::new(PartitionId(3)));
        h.set_gate(Some(Arc::clone(&gate)));
        assert_eq!(h.partition(), Some(PartitionId(3)));

        let (entered_tx, entered_rx) = mpsc::channel();
        let (finish_tx, finish_rx) = mpsc::channel::<()>();
        let h2 = Arc::clone(&h);
        let g2 = Arc::clone(&gate);
        let worker = thread::spawn(move || {
            let token = WorkerToken::allocate();
            token.install();
            let _segment = g2.enter();
            h2.begin_ownership(token);
            h2.access(|c| c.0 = 10).unwrap();
            entered_tx.send(()).unwrap();
            finish_rx.recv().unwrap();
            h2.access(|c| c.0 = 20).unwrap();
            h2.end_ownership();
        });

        entered_rx.recv().unwrap();
        assert_eq!(h.try_access(|c| c.0), Err(AccessError::WouldBlock));

        let h3 = Arc::clone(&h);
        let reader = thread::spawn(move || h3.access(|c| c.0).unwrap());
        thread::sleep(Duration::from_millis(20));
        finish_tx.send(()).unwrap();

        // Never the half-updated 10.
        assert_eq!(reader.join().unwrap(), 20);
        worker.join().unwrap();
        assert!(h.stats.wait_ns() > 0);
    }

    #[test]
    fn nested_outside_access_enters_the_gate_once() {
        let gate = Arc::new(PartitionGate::new(PartitionId(1)));
        let (a, b) = (handle(1), handle(2));
        a.set_gate(Some(Arc::clone(&gate)));
        b.set_gate(Some(Arc::clone(&gate)));

        let sum = a.access(|x| b.access(|y| x.0 + y.0)).unwrap();
        assert_eq!(sum, Ok(3));
        let polled = a.access(|_| b.try_access(|y| y.0)).unwrap();
        assert_eq!(polled, Ok(2));
        assert_eq!(
            a.access(|_| a.access(|x| x.0)).unwrap(),
            Err(AccessError::Reentrant { handle: a.id() })
        );
        assert_eq!(
            a.try_access(|_| a.try_access(|x| x.0)).unwrap(),
            Err(AccessError::Reentrant { handle: a.id() })
        );
        // Everything was released on the way out.
        assert!(gate.try_enter().is_some());
        assert_eq!(b.try_access(|y| y.0), Ok(2));
    }

    #[test]
    fn unwinding_closure_releases_the_thread_claim() {
        let h = handle(4);
        let gate = Arc::new(PartitionGate::new(PartitionId(0)));
        h.set_gate(Some(Arc::clone(&gate)));
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            h.access(|_| panic!("boom")).ok();
        }));
        assert!(caught.is_err());
        assert_eq!(h.access(|c| c.0), Ok(4));
        assert!(gate.try_enter().is_some());
    }

    #[test]
    fn boundary_access_is_not_counted() {
        let h = handle(0);
        h.boundary_access(|c| c.0 = 9).unwrap();
        h.publish(TickId(2)).unwrap();
        assert_eq!(h.stats.acquisitions(), 0);
        assert_eq!(h.access(|c| c.0).unwrap(), 9);
        assert_eq!(h.stats.acquisitions(), 1);
    }

    #[test]
    fn publish_swaps_view_without_touching_readers() {
        let h = handle(7);
        let before = h.latest_view();
        h.access(|c| c.0 = 8).unwrap();
        h.publish(TickId(1)).unwrap();
        assert_eq!(*before, 7);
        assert_eq!(*h.latest_view(), 8);
    }

    #[test]
    fn panicking_closure_does_not_wedge_handle() {
        let h = handle(1);
        let h2 = Arc::clone(&h);
        let res = thread::spawn(move || h2.access(|_| panic!("boom"))).join();
        assert!(res.is_err());
        assert_eq!(h.access(|c| c.0).unwrap(), 1);
    }

    #[test]
    fn reset_drains_stats() {
        let stats = AcquireStats::new();
        stats.record(40);
        stats.record(2);
        assert_eq!(
            stats.reset(),
            AcquireSample {
                wait_ns: 42,
                acquisitions: 2
            }
        );
        assert_eq!(stats.wait_ns(), 0);
    }
}
