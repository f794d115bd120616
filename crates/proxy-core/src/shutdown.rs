//! Shutdown signal (spec §5 "Cancellation"): stop accepting, give in-flight
//! tasks a grace period to finish on their own, then force-drop whatever is
//! still running.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Triggers a shutdown exactly once; clones of the paired `ShutdownSignal`
/// all observe the same transition.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownSignal(rx))
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Resolves once `Shutdown::trigger` has been called. Safe to hold one
    /// clone per accept loop and `select!` against it repeatedly.
    pub async fn recv(&mut self) {
        if *self.0.borrow() {
            return;
        }
        let _ = self.0.changed().await;
    }
}

/// Drains `tasks`, force-aborting any still running after [`GRACE_PERIOD`]
/// (spec §5: "Any task still running at the deadline is force-dropped; its
/// sockets are closed by resource finalization").
pub async fn join_with_grace_period(mut tasks: JoinSet<()>) {
    let deadline = tokio::time::sleep(GRACE_PERIOD);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            next = tasks.join_next() => {
                if next.is_none() {
                    break;
                }
            }
            _ = &mut deadline => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn signal_resolves_immediately_after_trigger() {
        let (shutdown, mut signal) = Shutdown::new();
        shutdown.trigger();
        signal.recv().await;
    }

    #[tokio::test]
    async fn multiple_clones_all_observe_the_trigger() {
        let (shutdown, signal) = Shutdown::new();
        let mut a = signal.clone();
        let mut b = signal.clone();
        shutdown.trigger();
        a.recv().await;
        b.recv().await;
    }

    #[tokio::test]
    async fn join_with_grace_period_waits_for_quick_tasks() {
        let mut tasks = JoinSet::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        tasks.spawn(async move {
            ran2.store(true, Ordering::SeqCst);
        });
        join_with_grace_period(tasks).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn join_with_grace_period_force_aborts_past_the_deadline() {
        let mut tasks = JoinSet::new();
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let start = tokio::time::Instant::now();
        join_with_grace_period(tasks).await;
        assert!(start.elapsed() >= GRACE_PERIOD);
    }
}
