use std::{
    fmt::{self, Display, Formatter},
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use fusen_governance_common::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, error, info};

pub type Task = BoxFuture<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Registers interest with the backend. Slow, retried.
    Registration,
    /// Pulls the current instance list. Fast.
    Fetch,
}

impl Display for Lane {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Registration => f.write_str("governance-watch"),
            Lane::Fetch => f.write_str("governance-fetch"),
        }
    }
}

struct LaneWorker {
    sender: UnboundedSender<Task>,
    handle: JoinHandle<()>,
}

impl LaneWorker {
    fn spawn(lane: Lane) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let handle = tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                // 单个任务 panic 不能让整条 lane 退出
                if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                    error!("task panicked on {} lane", lane);
                }
            }
            debug!("{} lane closed", lane);
        });
        Self { sender, handle }
    }
}

struct Lanes {
    registration: LaneWorker,
    fetch: LaneWorker,
}

/// Two independent FIFO lanes, one worker each, so at most one task per lane
/// is in flight.
///
/// Must be created inside a tokio runtime.
pub struct WatchDispatcher {
    destroyed: AtomicBool,
    lanes: Mutex<Option<Lanes>>,
}

impl Default for WatchDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchDispatcher {
    pub fn new() -> Self {
        Self {
            destroyed: AtomicBool::new(false),
            lanes: Mutex::new(Some(Lanes {
                registration: LaneWorker::spawn(Lane::Registration),
                fetch: LaneWorker::spawn(Lane::Fetch),
            })),
        }
    }

    /// Queues `task` on `lane`. Returns `false`, dropping the task, once the
    /// dispatcher is shut down.
    pub fn submit(&self, lane: Lane, task: Task) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }
        let lanes = self.lanes.lock();
        let Some(lanes) = lanes.as_ref() else {
            return false;
        };
        let worker = match lane {
            Lane::Registration => &lanes.registration,
            Lane::Fetch => &lanes.fetch,
        };
        worker.sender.send(task).is_ok()
    }

    /// Queues `task` on `lane` after `delay` without holding the lane while
    /// waiting.
    pub fn submit_delayed(self: &Arc<Self>, lane: Lane, delay: Duration, task: Task) {
        if self.is_shutdown() {
            return;
        }
        let dispatcher = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.submit(lane, task);
            }
        });
    }

    pub fn is_shutdown(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Stops accepting tasks and waits for the queued ones to drain. Later
    /// calls return immediately.
    pub async fn shutdown(&self) {
        let lanes = {
            let mut lanes = self.lanes.lock();
            if self
                .destroyed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            lanes.take()
        };
        let Some(Lanes {
            registration,
            fetch,
        }) = lanes
        else {
            return;
        };
        drop(registration.sender);
        drop(fetch.sender);
        let _ = registration.handle.await;
        let _ = fetch.handle.await;
        info!("watch dispatcher shut down");
    }
}
