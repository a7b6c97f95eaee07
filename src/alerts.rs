//! Periodic capacity alerting
//!
//! Every tick computes a fresh snapshot for each active worker straight from
//! the aggregator (never the dashboard cache) and raises an alert when a
//! worker is overloaded or over its secondary ceiling.
//!
//! An alert is raised when a condition first appears for a worker, not on
//! every tick it persists. Recovery is logged when the condition clears.
//! A worker whose evaluation fails keeps its raised conditions until a
//! later pass evaluates it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capacity::{CapacityAggregator, WorkloadSnapshot};
use crate::error::{CapacityError, Result};
use crate::model::WorkerId;

/// Buffered alerts per subscriber before lagging ones start missing alerts
const ALERT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    /// Either pool is above its ceiling
    Overloaded,
    SecondaryOverCeiling,
}

impl AlertCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCondition::Overloaded => "overloaded",
            AlertCondition::SecondaryOverCeiling => "secondary_over_ceiling",
        }
    }

    fn present_in(snapshot: &WorkloadSnapshot) -> BTreeSet<AlertCondition> {
        let mut conditions = BTreeSet::new();
        if snapshot.is_overloaded {
            conditions.insert(AlertCondition::Overloaded);
        }
        if snapshot.exceeds_secondary() {
            conditions.insert(AlertCondition::SecondaryOverCeiling);
        }
        conditions
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityAlert {
    pub worker_id: WorkerId,
    pub condition: AlertCondition,
    pub snapshot: WorkloadSnapshot,
    pub raised_at: DateTime<Utc>,
}

struct Running {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct CapacityAlertEvaluator {
    aggregator: CapacityAggregator,
    interval: Duration,
    alerts_tx: broadcast::Sender<CapacityAlert>,
    /// Conditions currently raised, per worker
    raised: Mutex<HashMap<WorkerId, BTreeSet<AlertCondition>>>,
    running: Mutex<Option<Running>>,
}

impl CapacityAlertEvaluator {
    pub fn new(aggregator: CapacityAggregator, interval: Duration) -> Self {
        let (alerts_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            aggregator,
            interval,
            alerts_tx,
            raised: Mutex::new(HashMap::new()),
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CapacityAlert> {
        self.alerts_tx.subscribe()
    }

    /// Run one evaluation pass and return the alerts it raised.
    ///
    /// Failing to list workers fails the pass; a failure for a single worker
    /// is logged and skipped without clearing its raised conditions.
    pub async fn evaluate_once(&self) -> Result<Vec<CapacityAlert>> {
        let workers = self.aggregator.source().list_active_workers().await?;

        let mut observed: HashMap<WorkerId, BTreeSet<AlertCondition>> = HashMap::new();
        let mut snapshots: HashMap<WorkerId, WorkloadSnapshot> = HashMap::new();
        let mut failed = Vec::new();
        for worker_id in workers {
            match self.aggregator.compute_snapshot(worker_id).await {
                Ok(snapshot) => {
                    observed.insert(worker_id, AlertCondition::present_in(&snapshot));
                    snapshots.insert(worker_id, snapshot);
                }
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Capacity evaluation failed for worker");
                    failed.push(worker_id);
                }
            }
        }

        let raised_at = Utc::now();
        let mut alerts = Vec::new();
        {
            let mut raised = self
                .raised
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            for worker_id in &failed {
                if let Some(previous) = raised.get(worker_id) {
                    observed.insert(*worker_id, previous.clone());
                }
            }

            for (worker_id, previous) in raised.iter() {
                let current = observed.get(worker_id);
                for condition in previous {
                    if current.map_or(true, |c| !c.contains(condition)) {
                        info!(
                            worker_id = %worker_id,
                            condition = condition.as_str(),
                            "Capacity condition cleared"
                        );
                    }
                }
            }

            for (worker_id, current) in &observed {
                let previous = raised.get(worker_id);
                for condition in current {
                    if previous.is_some_and(|p| p.contains(condition)) {
                        continue;
                    }
                    let Some(snapshot) = snapshots.get(worker_id) else {
                        continue;
                    };
                    alerts.push(CapacityAlert {
                        worker_id: *worker_id,
                        condition: *condition,
                        snapshot: snapshot.clone(),
                        raised_at,
                    });
                }
            }

            observed.retain(|_, conditions| !conditions.is_empty());
            *raised = observed;
        }

        alerts.sort_by_key(|a| (a.worker_id, a.condition));
        for alert in &alerts {
            warn!(
                worker_id = %alert.worker_id,
                condition = alert.condition.as_str(),
                primary = %alert.snapshot.primary_total,
                secondary = %alert.snapshot.secondary_total,
                "Capacity alert"
            );
            // Nobody listening is fine
            let _ = self.alerts_tx.send(alert.clone());
        }

        debug!(raised = alerts.len(), "Capacity evaluation pass complete");
        Ok(alerts)
    }

    /// Start the periodic evaluation loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if running.is_some() {
            return Err(CapacityError::Conflict(
                "capacity alert evaluator already running".into(),
            ));
        }

        info!(interval_secs = self.interval.as_secs(), "Starting capacity alert evaluator");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let evaluator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(evaluator.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = evaluator.evaluate_once().await {
                            warn!(error = %e, "Capacity evaluation pass failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Capacity alert loop received shutdown");
                        break;
                    }
                }
            }
        });

        *running = Some(Running { shutdown_tx, handle });
        Ok(())
    }

    /// Stop the loop and wait for an in-progress pass to finish
    pub async fn stop(&self) -> Result<()> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(Running { shutdown_tx, handle }) = running {
            info!("Stopping capacity alert evaluator");
            let _ = shutdown_tx.send(()).await;
            let _ = handle.await;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|running| running.is_some())
            .unwrap_or(false)
    }
}
