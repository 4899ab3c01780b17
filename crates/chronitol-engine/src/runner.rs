//! In-process periodic task runner.
//!
//! One loop ticks at a fixed interval. On each tick every registered task
//! whose last start is at least its frequency ago is spawned. A task still in
//! flight from an earlier tick is skipped. Panics stay inside the spawned task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A task body. Receives a token that is cancelled when the runner stops.
pub type TaskAction = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

struct Task {
    name: String,
    frequency: Duration,
    action: TaskAction,
    in_flight: Arc<AtomicBool>,
    last_start: Option<Instant>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PeriodicTaskRunner {
    tick: Duration,
    tasks: Arc<Mutex<Vec<Task>>>,
    running: Mutex<Option<Running>>,
}

impl PeriodicTaskRunner {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick: tick.max(Duration::from_millis(1)),
            tasks: Arc::new(Mutex::new(Vec::new())),
            running: Mutex::new(None),
        }
    }

    /// Add a task. Registering a name twice replaces the earlier task.
    pub fn register(&self, name: impl Into<String>, frequency: Duration, action: TaskAction) {
        let name = name.into();
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| t.name != name);
        debug!(task = %name, ?frequency, "periodic task registered");
        tasks.push(Task {
            name,
            frequency,
            action,
            in_flight: Arc::new(AtomicBool::new(false)),
            last_start: None,
        });
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.lock().iter().map(|t| t.name.clone()).collect()
    }

    /// Start ticking. Returns `false` if the runner was already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.cancel.is_cancelled()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(self.tick, self.tasks.clone(), cancel.clone()));
        *running = Some(Running { cancel, handle });
        info!(tick = ?self.tick, "periodic task runner started");
        true
    }

    /// Cancel the loop and every in-flight action. The returned handle
    /// completes once the loop has exited.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        let running = self.running.lock().take()?;
        running.cancel.cancel();
        info!("periodic task runner stopped");
        Some(running.handle)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled())
    }
}

impl Drop for PeriodicTaskRunner {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
        }
    }
}

async fn run_loop(tick: Duration, tasks: Arc<Mutex<Vec<Task>>>, cancel: CancellationToken) {
    let mut interval = time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => run_due(&tasks, &cancel),
            () = cancel.cancelled() => break,
        }
    }
}

fn run_due(tasks: &Mutex<Vec<Task>>, cancel: &CancellationToken) {
    let now = Instant::now();
    let mut tasks = tasks.lock();
    for task in tasks.iter_mut() {
        let elapsed = task
            .last_start
            .map_or(true, |last| now.duration_since(last) >= task.frequency);
        if !elapsed {
            continue;
        }
        if task.in_flight.swap(true, Ordering::SeqCst) {
            debug!(task = %task.name, "previous run still in flight, skipping");
            continue;
        }
        task.last_start = Some(now);

        let name = task.name.clone();
        let in_flight = task.in_flight.clone();
        let work = (task.action)(cancel.child_token());
        drop(tokio::spawn(async move {
            if let Err(e) = tokio::spawn(work).await {
                if e.is_panic() {
                    warn!(task = %name, "periodic task panicked");
                }
            }
            in_flight.store(false, Ordering::SeqCst);
        }));
    }
}
