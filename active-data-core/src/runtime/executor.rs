//! Deferred Execution
//!
//! Deferred reaction passes are handed to a [`DeferredExecutor`]. The engine
//! never sleeps or spawns on its own; the host decides what "later" means.
//!
//! - [`TimerQueue`] (default) holds tasks until the host calls
//!   [`Manager::tick`](crate::Manager::tick), one turn of its event loop.
//! - [`TokioExecutor`] posts tasks to the current tokio `LocalSet`.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::time::{Duration, Instant};

/// Work scheduled for later.
pub type DeferredTask = Box<dyn FnOnce()>;

/// Runs deferred tasks on the host's schedule.
pub trait DeferredExecutor {
    /// Run `task` once `delay` has passed, on the same thread.
    fn defer(&self, delay: Duration, task: DeferredTask);

    /// Run every task that is due. Returns how many ran.
    ///
    /// Executors driven by an external event loop keep the default.
    fn run_pending(&self) -> usize {
        0
    }
}

struct Timer {
    due: Instant,
    seq: u64,
    task: DeferredTask,
}

/// Queue of timers flushed by [`Manager::tick`](crate::Manager::tick).
#[derive(Default)]
pub struct TimerQueue {
    timers: RefCell<Vec<Timer>>,
    seq: Cell<u64>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.timers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeferredExecutor for TimerQueue {
    fn defer(&self, delay: Duration, task: DeferredTask) {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        self.timers.borrow_mut().push(Timer {
            due: Instant::now() + delay,
            seq,
            task,
        });
    }

    /// Tasks deferred while running are left for the next call.
    fn run_pending(&self) -> usize {
        let now = Instant::now();
        let mut due: Vec<Timer> = {
            let mut timers = self.timers.borrow_mut();
            let (ready, waiting): (Vec<Timer>, Vec<Timer>) = std::mem::take(&mut *timers)
                .into_iter()
                .partition(|timer| timer.due <= now);
            *timers = waiting;
            ready
        };
        due.sort_by_key(|timer| (timer.due, timer.seq));

        let count = due.len();
        for timer in due {
            (timer.task)();
        }
        count
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue").field("pending", &self.len()).finish()
    }
}

/// Defers onto the tokio `LocalSet` of the calling task.
///
/// Managers are single-threaded, so tasks are spawned with
/// [`tokio::task::spawn_local`]. Scheduling outside a `LocalSet` panics.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioExecutor;

impl DeferredExecutor for TokioExecutor {
    fn defer(&self, delay: Duration, task: DeferredTask) {
        tokio::task::spawn_local(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            task();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn timer_queue_runs_in_order() {
        let queue = TimerQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for n in 0..3 {
            let log = log.clone();
            queue.defer(Duration::ZERO, Box::new(move || log.borrow_mut().push(n)));
        }
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.run_pending(), 3);
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn timers_wait_for_their_delay() {
        let queue = TimerQueue::new();
        queue.defer(Duration::from_secs(3600), Box::new(|| {}));
        assert_eq!(queue.run_pending(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn tasks_deferred_while_running_wait_for_next_turn() {
        let queue = Rc::new(TimerQueue::new());
        let inner = queue.clone();
        queue.defer(
            Duration::ZERO,
            Box::new(move || inner.defer(Duration::ZERO, Box::new(|| {}))),
        );

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.run_pending(), 1);
    }

    #[tokio::test]
    async fn tokio_executor_runs_on_local_set() {
        let local = tokio::task::LocalSet::new();
        let ran = Rc::new(Cell::new(false));

        local
            .run_until({
                let ran = ran.clone();
                async move {
                    TokioExecutor.defer(Duration::from_millis(1), Box::new(move || ran.set(true)));
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await;

        assert!(ran.get());
    }
}
