//! Re-invokes a computation whenever a tracked dependency invalidates.

use crate::resource::Resource;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Control signal a computation returns to its rerunner.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RunnerError {
    /// Re-run on the next trigger without dropping the tracked dependency
    /// set from the last successful pass.
    #[error("computation asked to be retried")]
    RetrySentinel,

    /// Terminate the runner after this pass.
    #[error("computation halted its runner")]
    Halted,
}

/// Dependency-tracking handle passed to each computation pass.
///
/// Cheap to clone; all clones feed the same pass's dependency set.
#[derive(Clone, Debug)]
pub struct RunContext {
    tracked: Arc<Mutex<Vec<Resource>>>,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
}

impl RunContext {
    /// Register `resource` as a dependency of the current pass.
    ///
    /// The watcher arms right away, so an invalidation that lands while the
    /// pass is still executing schedules the next run instead of being
    /// lost between passes.
    pub fn track(&self, resource: &Resource) {
        resource.watch(&self.trigger);
        self.tracked.lock().push(resource.clone());
    }

    /// Cancellation token for this pass, cancelled when the runner stops.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// A computation driven by a [`Rerunner`]. Passes never overlap.
pub type Computation =
    Arc<dyn Fn(RunContext) -> BoxFuture<'static, Result<(), RunnerError>> + Send + Sync>;

/// Schedules a computation: one pass immediately on construction, then one
/// pass per dependency invalidation, paced to at least `min_interval`
/// between pass starts.
#[derive(Debug)]
pub struct Rerunner {
    trigger: Arc<Notify>,
    immediate: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Rerunner {
    /// Spawn a runner for `computation`.
    ///
    /// The runner's lifetime is bounded by `base`: cancelling it stops the
    /// runner and every in-flight pass.
    pub fn new(base: &CancellationToken, computation: Computation, min_interval: Duration) -> Self {
        let cancel = base.child_token();
        let trigger = Arc::new(Notify::new());
        let immediate = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_loop(
            computation,
            min_interval,
            Arc::clone(&trigger),
            Arc::clone(&immediate),
            cancel.clone(),
        ));

        Self {
            trigger,
            immediate,
            cancel,
        }
    }

    /// Trigger one re-run that bypasses the pacing interval.
    pub fn rerun_immediately(&self) {
        self.immediate.store(true, Ordering::SeqCst);
        self.trigger.notify_one();
    }

    /// Stop the runner. Idempotent; cancels any in-flight pass.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether [`Rerunner::stop`] has been called (or the base token
    /// cancelled).
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Rerunner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_loop(
    computation: Computation,
    min_interval: Duration,
    trigger: Arc<Notify>,
    immediate: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut armed: Vec<Resource> = Vec::new();

    loop {
        let pass_started = Instant::now();
        let tracked = Arc::new(Mutex::new(Vec::new()));
        let run = RunContext {
            tracked: Arc::clone(&tracked),
            trigger: Arc::clone(&trigger),
            cancel: cancel.clone(),
        };

        let result = tokio::select! {
            result = computation(run) => result,
            () = cancel.cancelled() => return,
        };

        match result {
            Ok(()) => {
                let tracked = std::mem::take(&mut *tracked.lock());
                // Dependencies this pass stopped reading stop waking us.
                for resource in &armed {
                    if !tracked.iter().any(|kept| kept.same_source(resource)) {
                        resource.unwatch(&trigger);
                    }
                }
                armed = tracked;
            }
            // Retry: the armed set from the last successful pass stays live.
            Err(RunnerError::RetrySentinel) => {}
            Err(RunnerError::Halted) => return,
        }

        for resource in &armed {
            resource.watch(&trigger);
        }

        tokio::select! {
            () = trigger.notified() => {}
            () = cancel.cancelled() => return,
        }

        // Pace the re-run unless an immediate one was requested. Dependency
        // invalidations landing mid-wait do not shorten the wait.
        let deadline = pass_started + min_interval;
        loop {
            if immediate.swap(false, Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => break,
                () = trigger.notified() => {}
                () = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const INTERVAL: Duration = Duration::from_secs(5);
    const WAIT: Duration = Duration::from_secs(60);

    /// Computation that tracks `resource` (when given) and reports each pass.
    fn reporting(
        resource: Option<Resource>,
        tx: mpsc::UnboundedSender<usize>,
    ) -> Computation {
        let passes = Arc::new(Mutex::new(0usize));
        Arc::new(
            move |run: RunContext| -> BoxFuture<'static, Result<(), RunnerError>> {
                let resource = resource.clone();
                let tx = tx.clone();
                let passes = Arc::clone(&passes);
                Box::pin(async move {
                    let pass = {
                        let mut passes = passes.lock();
                        *passes += 1;
                        *passes
                    };
                    if let Some(resource) = &resource {
                        run.track(resource);
                    }
                    let _ = tx.send(pass);
                    Ok(())
                })
            },
        )
    }

    async fn next_pass(rx: &mut mpsc::UnboundedReceiver<usize>) -> usize {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a pass")
            .expect("computation channel closed")
    }

    async fn expect_no_pass(rx: &mut mpsc::UnboundedReceiver<usize>) {
        assert!(
            timeout(WAIT, rx.recv()).await.is_err(),
            "unexpected extra pass"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_pass_runs_on_construction() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _runner = Rerunner::new(&CancellationToken::new(), reporting(None, tx), INTERVAL);

        assert_eq!(next_pass(&mut rx).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_schedules_paced_rerun() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let resource = Resource::new();
        let started = Instant::now();
        let _runner = Rerunner::new(
            &CancellationToken::new(),
            reporting(Some(resource.clone()), tx),
            INTERVAL,
        );

        assert_eq!(next_pass(&mut rx).await, 1);
        resource.invalidate();

        assert_eq!(next_pass(&mut rx).await, 2);
        assert!(started.elapsed() >= INTERVAL, "re-run ignored the pacing floor");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_immediately_bypasses_pacing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = Rerunner::new(&CancellationToken::new(), reporting(None, tx), INTERVAL);
        let started = Instant::now();

        assert_eq!(next_pass(&mut rx).await, 1);
        runner.rerun_immediately();

        assert_eq!(next_pass(&mut rx).await, 2);
        assert!(started.elapsed() < INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidations_coalesce_into_one_rerun() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let resource = Resource::new();
        let _runner = Rerunner::new(
            &CancellationToken::new(),
            reporting(Some(resource.clone()), tx),
            INTERVAL,
        );

        assert_eq!(next_pass(&mut rx).await, 1);
        resource.invalidate();
        resource.invalidate();
        resource.invalidate();

        assert_eq!(next_pass(&mut rx).await, 2);
        expect_no_pass(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_keeps_the_armed_dependency_set() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let resource = Resource::new();
        let passes = Arc::new(Mutex::new(0usize));

        let tracked = resource.clone();
        let computation: Computation = {
            let passes = Arc::clone(&passes);
            Arc::new(
                move |run: RunContext| -> BoxFuture<'static, Result<(), RunnerError>> {
                    let tracked = tracked.clone();
                    let tx = tx.clone();
                    let passes = Arc::clone(&passes);
                    Box::pin(async move {
                        let pass = {
                            let mut passes = passes.lock();
                            *passes += 1;
                            *passes
                        };
                        let _ = tx.send(pass);
                        match pass {
                            // Only the first pass tracks; the retry pass
                            // must stay armed through the kept set.
                            1 => {
                                run.track(&tracked);
                                Ok(())
                            }
                            2 => Err(RunnerError::RetrySentinel),
                            _ => Ok(()),
                        }
                    })
                },
            )
        };

        let _runner = Rerunner::new(&CancellationToken::new(), computation, INTERVAL);

        assert_eq!(next_pass(&mut rx).await, 1);
        resource.invalidate();
        assert_eq!(next_pass(&mut rx).await, 2);
        resource.invalidate();
        assert_eq!(next_pass(&mut rx).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untracked_resources_stop_waking_the_runner() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let kept = Resource::new();
        let dropped = Resource::new();
        let passes = Arc::new(Mutex::new(0usize));

        let computation: Computation = {
            let kept = kept.clone();
            let dropped = dropped.clone();
            let passes = Arc::clone(&passes);
            Arc::new(
                move |run: RunContext| -> BoxFuture<'static, Result<(), RunnerError>> {
                    let kept = kept.clone();
                    let dropped = dropped.clone();
                    let tx = tx.clone();
                    let passes = Arc::clone(&passes);
                    Box::pin(async move {
                        let pass = {
                            let mut passes = passes.lock();
                            *passes += 1;
                            *passes
                        };
                        run.track(&kept);
                        if pass == 1 {
                            run.track(&dropped);
                        }
                        let _ = tx.send(pass);
                        Ok(())
                    })
                },
            )
        };

        let _runner = Rerunner::new(&CancellationToken::new(), computation, INTERVAL);

        assert_eq!(next_pass(&mut rx).await, 1);
        kept.invalidate();
        assert_eq!(next_pass(&mut rx).await, 2);

        // Pass 2 no longer read `dropped`, so invalidating it is inert.
        dropped.invalidate();
        expect_no_pass(&mut rx).await;

        kept.invalidate();
        assert_eq!(next_pass(&mut rx).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_terminates_the_runner() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let computation: Computation = Arc::new(
            move |_run: RunContext| -> BoxFuture<'static, Result<(), RunnerError>> {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(1);
                    Err(RunnerError::Halted)
                })
            },
        );
        let runner = Rerunner::new(&CancellationToken::new(), computation, INTERVAL);

        assert_eq!(next_pass(&mut rx).await, 1);
        runner.rerun_immediately();
        expect_no_pass(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_an_inflight_pass() {
        struct ReportDrop(mpsc::UnboundedSender<&'static str>);
        impl Drop for ReportDrop {
            fn drop(&mut self) {
                let _ = self.0.send("dropped");
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let computation: Computation = Arc::new(
            move |_run: RunContext| -> BoxFuture<'static, Result<(), RunnerError>> {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send("started");
                    let _guard = ReportDrop(tx.clone());
                    futures_util::future::pending::<()>().await;
                    unreachable!()
                })
            },
        );
        let runner = Rerunner::new(&CancellationToken::new(), computation, INTERVAL);

        assert_eq!(rx.recv().await, Some("started"));
        runner.stop();
        assert!(runner.is_stopped());
        assert_eq!(rx.recv().await, Some("dropped"));

        // stop is idempotent
        runner.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_base_token_cancellation_cascades() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let resource = Resource::new();
        let base = CancellationToken::new();
        let runner = Rerunner::new(&base, reporting(Some(resource.clone()), tx), INTERVAL);

        assert_eq!(next_pass(&mut rx).await, 1);
        base.cancel();
        assert!(runner.is_stopped());

        resource.invalidate();
        expect_no_pass(&mut rx).await;
    }
}
