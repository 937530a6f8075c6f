use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};

use log::warn;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use vesper_core::{VesperError, VesperResult};

use crate::stream::{ChangesSubscriptionDelta, ChangesSubscriptionStream, StreamShared};

type Failures = Arc<Mutex<Vec<VesperError>>>;

fn record_failure(failures: &Failures, shared: &StreamShared, error: VesperError) {
    warn!("stream: {} consumer failed: {error}", shared.id);
    match failures.lock() {
        Ok(mut guard) => guard.push(error),
        Err(poisoned) => poisoned.into_inner().push(error),
    }
    shared.abort();
}

fn take_failures(failures: &Failures) -> Vec<VesperError> {
    match failures.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    }
}

impl ChangesSubscriptionStream {
    /// Hands every delta to `consume`, running at most `concurrency` calls at
    /// once. The first failing call aborts the stream; the call returns once
    /// every started call settled and the stream is disposed.
    pub async fn for_each<F, Fut, E>(mut self, concurrency: usize, consume: F) -> VesperResult<()>
    where
        F: Fn(ChangesSubscriptionDelta) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let failures: Failures = Arc::default();
        let mut workers = JoinSet::new();
        let mut aborted = self.aborted_signal();

        let outcome = loop {
            let delta = match self.next().await {
                Ok(Some(delta)) => delta,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(VesperError::Aborted),
                },
                _ = aborted.wait_for(|aborted| *aborted) => break Ok(()),
            };
            let task = consume(delta);
            let shared = self.shared.clone();
            let failures = failures.clone();
            workers.spawn(async move {
                if let Err(err) = task.await {
                    record_failure(&failures, &shared, VesperError::delivery(err.to_string()));
                }
                drop(permit);
            });
            while workers.try_join_next().is_some() {}
        };

        self.finish(workers, failures, outcome).await
    }

    /// Like [`ChangesSubscriptionStream::for_each`], but hands over whole
    /// flushes: deletions first, then upserts, as the stream produced them.
    pub async fn by_batch<F, Fut, E>(mut self, concurrency: usize, consume: F) -> VesperResult<()>
    where
        F: Fn(Vec<ChangesSubscriptionDelta>) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let failures: Failures = Arc::default();
        let mut workers = JoinSet::new();
        let mut aborted = self.aborted_signal();

        let outcome = loop {
            let batch = match self.next_flush().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(VesperError::Aborted),
                },
                _ = aborted.wait_for(|aborted| *aborted) => break Ok(()),
            };
            let task = consume(batch);
            let shared = self.shared.clone();
            let failures = failures.clone();
            workers.spawn(async move {
                if let Err(err) = task.await {
                    record_failure(&failures, &shared, VesperError::delivery(err.to_string()));
                }
                drop(permit);
            });
            while workers.try_join_next().is_some() {}
        };

        self.finish(workers, failures, outcome).await
    }

    async fn finish(
        self,
        mut workers: JoinSet<()>,
        failures: Failures,
        outcome: VesperResult<()>,
    ) -> VesperResult<()> {
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                record_failure(
                    &failures,
                    &self.shared,
                    VesperError::delivery(format!("consumer task: {err}")),
                );
            }
        }
        let disposed = self.dispose().await;
        outcome
            .and(VesperError::settle(take_failures(&failures)))
            .and(disposed)
    }
}
