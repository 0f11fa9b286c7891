//! "Run now, then every interval" background tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Handle to a task started with [`spawn_periodic`].
#[derive(Debug)]
pub struct Periodic {
    name: &'static str,
    trigger: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Periodic {
    /// Name the task was started with.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run the task body as soon as the current run (if any) finishes.
    pub fn run_now(&self) {
        self.trigger.notify_one();
    }

    /// Shared trigger, for callers that outlive this handle.
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abort the task and wait for it to unwind.
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// Spawn `tick` immediately and then every `period` until `shutdown` fires
/// or its sender is dropped. Missed ticks are skipped, runs never overlap.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> Periodic
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let trigger = Arc::new(Notify::new());
    let notified = Arc::clone(&trigger);

    let handle = tokio::spawn(async move {
        debug!(task = name, ?period, "starting periodic task");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(task = name, "periodic task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    trace!(task = name, "scheduled run");
                    tick().await;
                }
                _ = notified.notified() => {
                    trace!(task = name, "triggered run");
                    tick().await;
                    interval.reset();
                }
            }
        }
    });

    Periodic {
        name,
        trigger,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_on_interval() {
        let (tx, rx) = broadcast::channel(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let task = spawn_periodic("test", Duration::from_secs(30), rx, counting(&runs));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);

        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_runs_out_of_band() {
        let (_tx, rx) = broadcast::channel(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let task = spawn_periodic("test", Duration::from_secs(300), rx, counting(&runs));

        tokio::time::sleep(Duration::from_millis(1)).await;
        task.run_now();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_sender_stops_the_task() {
        let (tx, rx) = broadcast::channel::<()>(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let task = spawn_periodic("test", Duration::from_secs(1), rx, counting(&runs));
        drop(tx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(task.is_finished());
    }
}
