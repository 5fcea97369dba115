//! # Deferred Emission
//!
//! Schedules a continuation event to fire once after a delay drawn from a
//! bounded window. A single driver task keeps every pending deadline in a
//! min-heap and sleeps until the earliest one; new tasks reach it over an
//! unbounded channel.
//!
//! Cancelled tasks leave their deadline in the heap; the driver compacts the
//! heap once it holds more than twice the live tasks plus [`COMPACT_SLACK`].
//!
//! Each task is in exactly one of three states. `Pending` moves to `Fired`
//! or `Cancelled` with a compare-and-swap, so a task fires at most once and a
//! cancel that loses the race is a no-op.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use rand::Rng;
use tokio::{
    sync::{mpsc, Notify},
    time::{sleep_until, Instant},
};
use tracing::{debug, trace, warn};

use super::{
    event_bus::{EventError, EventResult},
    namespace::EventName,
    payload::Payload,
};

/// Inclusive `[min, max]` bounds for a delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayWindow {
    pub min: Duration,
    pub max: Duration,
}

impl DelayWindow {
    pub fn new(min: Duration, max: Duration) -> EventResult<Self> {
        if min > max {
            return Err(EventError::InvalidDelayRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, delay: Duration) -> bool {
        self.min <= delay && delay <= self.max
    }

    pub fn clamp(&self, delay: Duration) -> Duration {
        delay.clamp(self.min, self.max)
    }
}

/// Picks a delay for one scheduled task.
pub trait DelayStrategy: Send + Sync {
    fn delay(&self, window: &DelayWindow) -> Duration;
}

impl<F> DelayStrategy for F
where
    F: Fn(&DelayWindow) -> Duration + Send + Sync,
{
    fn delay(&self, window: &DelayWindow) -> Duration {
        self(window)
    }
}

/// Uniformly random delay within the window.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformDelay;

impl DelayStrategy for UniformDelay {
    fn delay(&self, window: &DelayWindow) -> Duration {
        rand::thread_rng().gen_range(window.min..=window.max)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

impl DelayStrategy for FixedDelay {
    fn delay(&self, _window: &DelayWindow) -> Duration {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TaskStatus {
    Pending,
    Fired,
    Cancelled,
}

/// Stale heap entries tolerated before the driver compacts.
pub const COMPACT_SLACK: usize = 64;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

fn decode_status(raw: u8) -> TaskStatus {
    match raw {
        FIRED => TaskStatus::Fired,
        CANCELLED => TaskStatus::Cancelled,
        _ => TaskStatus::Pending,
    }
}

/// The continuation handed to the sink when a task fires.
#[derive(Debug, Clone)]
pub struct DeferredTask {
    pub id: u64,
    pub name: EventName,
    pub payload: Payload,
    pub fire_after: Duration,
}

struct PendingEntry {
    task: DeferredTask,
    state: Arc<AtomicU8>,
}

type PendingMap = Arc<DashMap<u64, Arc<PendingEntry>>>;

pub type DeferredSink = Arc<dyn Fn(DeferredTask) + Send + Sync>;

/// Cancel token and status check for one scheduled task.
#[derive(Clone)]
pub struct DeferredHandle {
    id: u64,
    fire_after: Duration,
    deadline: Instant,
    state: Arc<AtomicU8>,
    pending: PendingMap,
}

impl DeferredHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fire_after(&self) -> Duration {
        self.fire_after
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns `true` when this call cancelled a pending task.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.pending.remove(&self.id);
            debug!("deferred task {} cancelled", self.id);
        }
        cancelled
    }

    pub fn status(&self) -> TaskStatus {
        decode_status(self.state.load(Ordering::Acquire))
    }
}

impl std::fmt::Debug for DeferredHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredHandle")
            .field("id", &self.id)
            .field("fire_after", &self.fire_after)
            .field("status", &self.status())
            .finish()
    }
}

pub struct DeferredEmitter {
    pending: PendingMap,
    queue: mpsc::UnboundedSender<(Instant, u64)>,
    next_id: AtomicU64,
    max_pending: usize,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
    queued: Arc<AtomicUsize>,
}

impl DeferredEmitter {
    /// Starts the driver task. Must be called inside a Tokio runtime.
    pub fn new(max_pending: usize, sink: DeferredSink) -> Self {
        let pending: PendingMap = Arc::new(DashMap::new());
        let (queue, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let queued = Arc::new(AtomicUsize::new(0));

        tokio::spawn(drive(
            rx,
            pending.clone(),
            sink,
            shutdown.clone(),
            queued.clone(),
        ));

        Self {
            pending,
            queue,
            next_id: AtomicU64::new(1),
            max_pending,
            closed: AtomicBool::new(false),
            shutdown,
            queued,
        }
    }

    pub fn schedule(
        &self,
        name: EventName,
        payload: Payload,
        min: Duration,
        max: Duration,
        strategy: &dyn DelayStrategy,
    ) -> EventResult<DeferredHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EventError::ShutdownInProgress);
        }
        let window = DelayWindow::new(min, max)?;
        if self.pending.len() >= self.max_pending {
            return Err(EventError::TooManyPendingTasks {
                limit: self.max_pending,
            });
        }

        let requested = strategy.delay(&window);
        let fire_after = if window.contains(requested) {
            requested
        } else {
            let clamped = window.clamp(requested);
            warn!(
                "delay {:?} outside [{:?}, {:?}] for {}, clamped to {:?}",
                requested, window.min, window.max, name, clamped
            );
            clamped
        };

        let deadline = Instant::now()
            .checked_add(fire_after)
            .ok_or(EventError::DelayOverflow { delay: fire_after })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(AtomicU8::new(PENDING));
        self.pending.insert(
            id,
            Arc::new(PendingEntry {
                task: DeferredTask {
                    id,
                    name,
                    payload,
                    fire_after,
                },
                state: state.clone(),
            }),
        );

        if self.queue.send((deadline, id)).is_err() {
            // driver is gone; nothing would ever fire this task
            self.pending.remove(&id);
            return Err(EventError::ShutdownInProgress);
        }
        trace!("deferred task {} scheduled in {:?}", id, fire_after);

        Ok(DeferredHandle {
            id,
            fire_after,
            deadline,
            state,
            pending: self.pending.clone(),
        })
    }

    /// Cancels every pending task and returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                if entry
                    .state
                    .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    /// Rejects further scheduling and stops the driver.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_one();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Deadlines held by the driver, including cancelled ones not yet compacted.
    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

impl Drop for DeferredEmitter {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drive(
    mut rx: mpsc::UnboundedReceiver<(Instant, u64)>,
    pending: PendingMap,
    sink: DeferredSink,
    shutdown: Arc<Notify>,
    queued: Arc<AtomicUsize>,
) {
    let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    loop {
        queued.store(heap.len(), Ordering::Release);
        let next_deadline = heap
            .peek()
            .map(|Reverse((deadline, _))| *deadline)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

        tokio::select! {
            _ = shutdown.notified() => break,
            received = rx.recv() => match received {
                Some(entry) => {
                    heap.push(Reverse(entry));
                    compact(&mut heap, &pending);
                }
                None => break,
            },
            _ = sleep_until(next_deadline), if !heap.is_empty() => {
                fire_due(&mut heap, &pending, &sink);
            }
        }
    }
    queued.store(0, Ordering::Release);
    debug!("deferred driver stopped with {} tasks queued", heap.len());
}

fn compact(heap: &mut BinaryHeap<Reverse<(Instant, u64)>>, pending: &PendingMap) {
    if heap.len() <= pending.len() * 2 + COMPACT_SLACK {
        return;
    }
    let before = heap.len();
    heap.retain(|Reverse((_, id))| pending.contains_key(id));
    trace!("compacted deferred heap from {} to {}", before, heap.len());
}

fn fire_due(
    heap: &mut BinaryHeap<Reverse<(Instant, u64)>>,
    pending: &PendingMap,
    sink: &DeferredSink,
) {
    let now = Instant::now();
    while let Some(Reverse((deadline, id))) = heap.peek().copied() {
        if deadline > now {
            break;
        }
        heap.pop();
        // cancelled tasks are already gone from the map
        let Some((_, entry)) = pending.remove(&id) else {
            continue;
        };
        if entry
            .state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!("deferred task {} fired", id);
            sink(entry.task.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload;
    use std::sync::Mutex;

    fn collecting_sink() -> (DeferredSink, Arc<Mutex<Vec<DeferredTask>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let fired_clone = fired.clone();
        let sink: DeferredSink = Arc::new(move |task: DeferredTask| {
            fired_clone.lock().unwrap().push(task);
        });
        (sink, fired)
    }

    fn name(s: &str) -> EventName {
        EventName::parse(s).unwrap()
    }

    #[test]
    fn test_delay_window() {
        assert!(matches!(
            DelayWindow::new(Duration::from_millis(10), Duration::from_millis(5)),
            Err(EventError::InvalidDelayRange { .. })
        ));
        let window = DelayWindow::new(Duration::from_millis(5), Duration::from_millis(15)).unwrap();
        assert_eq!(window.clamp(Duration::from_millis(1)), Duration::from_millis(5));
        assert_eq!(window.clamp(Duration::from_millis(99)), Duration::from_millis(15));
        assert!(window.contains(Duration::from_millis(15)));
    }

    #[test]
    fn test_uniform_delay_stays_in_window() {
        let window = DelayWindow::new(Duration::from_millis(5), Duration::from_millis(15)).unwrap();
        for _ in 0..1000 {
            assert!(window.contains(UniformDelay.delay(&window)));
        }
        let point = DelayWindow::new(Duration::from_millis(7), Duration::from_millis(7)).unwrap();
        assert_eq!(UniformDelay.delay(&point), Duration::from_millis(7));
    }

    #[test]
    fn test_uniform_delay_handles_wide_windows() {
        let top = Duration::from_nanos(u64::MAX);
        let window = DelayWindow::new(top, top + Duration::from_nanos(1)).unwrap();
        for _ in 0..100 {
            assert!(window.contains(UniformDelay.delay(&window)));
        }

        let full = DelayWindow::new(Duration::ZERO, Duration::MAX).unwrap();
        assert!(full.contains(UniformDelay.delay(&full)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_deadline_is_rejected() {
        let (sink, _fired) = collecting_sink();
        let emitter = DeferredEmitter::new(16, sink);

        let result = emitter.schedule(
            name("a"),
            Payload::new(),
            Duration::ZERO,
            Duration::MAX,
            &FixedDelay(Duration::MAX),
        );
        assert!(matches!(result, Err(EventError::DelayOverflow { .. })));
        assert_eq!(emitter.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_deadlines_are_compacted() {
        let (sink, fired) = collecting_sink();
        let emitter = DeferredEmitter::new(4, sink);
        let hour = Duration::from_secs(3600);

        let live = emitter
            .schedule(name("keep"), Payload::new(), hour, hour, &UniformDelay)
            .unwrap();
        for _ in 0..1000 {
            let handle = emitter
                .schedule(name("churn"), Payload::new(), hour, hour, &UniformDelay)
                .unwrap();
            assert!(handle.cancel());
        }
        // the clock only advances once the driver has drained its queue
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(emitter.pending_count(), 1);
        assert!(emitter.queued_count() <= 2 + COMPACT_SLACK);

        tokio::time::sleep(hour + Duration::from_millis(1)).await;
        assert_eq!(live.status(), TaskStatus::Fired);
        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].name.to_string(), "keep");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let (sink, fired) = collecting_sink();
        let emitter = DeferredEmitter::new(16, sink);

        let handle = emitter
            .schedule(
                name("followup.check"),
                payload! { "ticketId" => "T-001" },
                Duration::from_millis(10),
                Duration::from_millis(10),
                &UniformDelay,
            )
            .unwrap();
        assert_eq!(handle.status(), TaskStatus::Pending);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(fired.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.lock().unwrap().len(), 1);
        assert_eq!(handle.status(), TaskStatus::Fired);
        assert!(!handle.cancel());
        assert_eq!(emitter.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (sink, fired) = collecting_sink();
        let emitter = DeferredEmitter::new(16, sink);

        let handle = emitter
            .schedule(
                name("followup.check"),
                Payload::new(),
                Duration::from_millis(10),
                Duration::from_millis(20),
                &UniformDelay,
            )
            .unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.lock().unwrap().is_empty());
        assert_eq!(handle.status(), TaskStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let (sink, fired) = collecting_sink();
        let emitter = DeferredEmitter::new(16, sink);

        for (label, ms) in [("late", 30), ("early", 10), ("middle", 20)] {
            emitter
                .schedule(
                    name(&format!("order.{}", label)),
                    Payload::new(),
                    Duration::ZERO,
                    Duration::from_millis(100),
                    &FixedDelay(Duration::from_millis(ms)),
                )
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let order: Vec<String> = fired
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.name.to_string())
            .collect();
        assert_eq!(order, vec!["order.early", "order.middle", "order.late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_window_delay_is_clamped() {
        let (sink, _fired) = collecting_sink();
        let emitter = DeferredEmitter::new(16, sink);

        let handle = emitter
            .schedule(
                name("a"),
                Payload::new(),
                Duration::from_millis(5),
                Duration::from_millis(15),
                &|_: &DelayWindow| Duration::from_secs(10),
            )
            .unwrap();
        assert_eq!(handle.fire_after(), Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_invalid_range_schedules_nothing() {
        let (sink, _fired) = collecting_sink();
        let emitter = DeferredEmitter::new(16, sink);

        let result = emitter.schedule(
            name("a"),
            Payload::new(),
            Duration::from_millis(15),
            Duration::from_millis(5),
            &UniformDelay,
        );
        assert!(matches!(result, Err(EventError::InvalidDelayRange { .. })));
        assert_eq!(emitter.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_pending_and_cancel_all() {
        let (sink, fired) = collecting_sink();
        let emitter = DeferredEmitter::new(2, sink);
        let schedule = || {
            emitter.schedule(
                name("a"),
                Payload::new(),
                Duration::from_millis(10),
                Duration::from_millis(10),
                &UniformDelay,
            )
        };

        let first = schedule().unwrap();
        schedule().unwrap();
        assert!(matches!(
            schedule(),
            Err(EventError::TooManyPendingTasks { limit: 2 })
        ));

        assert_eq!(emitter.cancel_all(), 2);
        assert_eq!(first.status(), TaskStatus::Cancelled);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_emitter_rejects() {
        let (sink, _fired) = collecting_sink();
        let emitter = DeferredEmitter::new(2, sink);
        emitter.close();
        let result = emitter.schedule(
            name("a"),
            Payload::new(),
            Duration::ZERO,
            Duration::ZERO,
            &UniformDelay,
        );
        assert!(matches!(result, Err(EventError::ShutdownInProgress)));
    }
}
