//! Controller wiring: a bounded worker pool over the Works in the member's
//! reserved hub namespace.
//!
//! The runtime serializes reconciliations per Work while running different
//! Works in parallel up to the configured concurrency. Transient errors are
//! retried with exponential backoff; the periodic re-enqueue keeps drift
//! detection running even without watch events.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::StreamExt;
use kube::{
    ResourceExt,
    runtime::{
        controller::{Action, Config, Controller},
        watcher,
    },
};
use tokio::sync::Mutex;

use fleet_work_api::work::Work;

use crate::applier::{self, WorkApplier};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct Context {
    pub applier: WorkApplier,
    /// Consecutive failure count per Work, for backoff.
    retries: Mutex<HashMap<String, u32>>,
}

/// Runs the Work controller until shutdown.
pub async fn run(applier: WorkApplier, concurrency: u16) {
    let works = applier.works();
    let context = Arc::new(Context {
        applier,
        retries: Mutex::new(HashMap::new()),
    });

    Controller::new(works, watcher::Config::default())
        .with_config(Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((object, _action)) => {
                    tracing::debug!(work = %object.name, "reconciled");
                }
                Err(error) => {
                    tracing::warn!(error = %error, "reconciliation failed");
                }
            }
        })
        .await;
}

async fn reconcile(work: Arc<Work>, context: Arc<Context>) -> Result<Action, applier::Error> {
    let action = context.applier.reconcile(work.clone()).await?;
    context.retries.lock().await.remove(&work.name_any());
    Ok(action)
}

fn error_policy(work: Arc<Work>, error: &applier::Error, context: Arc<Context>) -> Action {
    let name = work.name_any();

    let attempt = {
        // try_lock: the policy is synchronous; on contention fall back to
        // first-attempt backoff rather than blocking the scheduler.
        match context.retries.try_lock() {
            Ok(mut retries) => {
                let attempt = retries.entry(name.clone()).or_insert(0);
                *attempt = attempt.saturating_add(1);
                *attempt
            }
            Err(_) => 1,
        }
    };

    let backoff = if error.is_transient() {
        Duration::from_millis(250 * 2u64.saturating_pow(attempt.min(16)))
    } else {
        // Not retryable until the spec changes, but the periodic
        // re-enqueue interval still re-runs the cycle.
        context.applier.sync_interval
    };
    let backoff = backoff.min(MAX_BACKOFF);

    tracing::warn!(
        work = %name,
        error = %error,
        attempt,
        backoff_ms = backoff.as_millis() as u64,
        "reconciliation error"
    );
    Action::requeue(backoff)
}
