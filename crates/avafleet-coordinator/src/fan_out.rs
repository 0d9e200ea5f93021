use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use avafleet_core::error::FleetError;

/// What happened to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome<R> {
    Done(R),
    /// Already in the requested state; counts as success.
    Already(String),
    Failed(String),
}

/// Per-node outcomes of one fleet operation, keyed by node ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetOperationResult<R = ()> {
    outcomes: BTreeMap<String, NodeOutcome<R>>,
}

impl<R> Default for FleetOperationResult<R> {
    fn default() -> Self {
        Self {
            outcomes: BTreeMap::new(),
        }
    }
}

impl<R> FleetOperationResult<R> {
    pub fn record(&mut self, node_id: &str, outcome: NodeOutcome<R>) {
        self.outcomes.insert(node_id.to_string(), outcome);
    }

    /// Record a raw result, classifying "already" errors as success.
    pub fn record_result(&mut self, node_id: &str, result: Result<R>) {
        let outcome = match result {
            Ok(value) => NodeOutcome::Done(value),
            Err(e) if FleetError::is_already_in_target_state(&e) => NodeOutcome::Already(format!("{}", e)),
            Err(e) => NodeOutcome::Failed(format!("{:#}", e)),
        };
        self.record(node_id, outcome);
    }

    /// Fold another result in. Later entries win.
    pub fn merge(&mut self, other: FleetOperationResult<R>) {
        self.outcomes.extend(other.outcomes);
    }

    pub fn outcomes(&self) -> &BTreeMap<String, NodeOutcome<R>> {
        &self.outcomes
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeOutcome<R>> {
        self.outcomes.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.failure_count() == 0
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.len() - self.failure_count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, NodeOutcome::Failed(_)))
            .count()
    }

    /// Node IDs that reached the target state, including "already" ones.
    pub fn succeeded(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !matches!(o, NodeOutcome::Failed(_)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Failed node IDs with their reasons.
    pub fn failed(&self) -> BTreeMap<String, String> {
        self.outcomes
            .iter()
            .filter_map(|(id, o)| match o {
                NodeOutcome::Failed(reason) => Some((id.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    /// Nodes that were already in the target state, with the note.
    pub fn notes(&self) -> Vec<(String, String)> {
        self.outcomes
            .iter()
            .filter_map(|(id, o)| match o {
                NodeOutcome::Already(note) => Some((id.clone(), note.clone())),
                _ => None,
            })
            .collect()
    }

    /// Values of nodes that completed the operation.
    pub fn values(&self) -> impl Iterator<Item = (&String, &R)> {
        self.outcomes.iter().filter_map(|(id, o)| match o {
            NodeOutcome::Done(v) => Some((id, v)),
            _ => None,
        })
    }

    /// Only the failed entries, re-typed so they can be merged into a later phase.
    pub fn failures<S>(&self) -> FleetOperationResult<S> {
        let mut out = FleetOperationResult::default();
        for (id, reason) in self.failed() {
            out.record(&id, NodeOutcome::Failed(reason));
        }
        out
    }

    /// Err naming every failed node, or the result itself.
    pub fn into_result(self, operation: &str) -> Result<Self> {
        let failed = self.failed();
        if failed.is_empty() {
            Ok(self)
        } else {
            Err(FleetError::PartialFleetFailure {
                operation: operation.to_string(),
                failed,
            }
            .into())
        }
    }
}

/// Mutex-guarded results map shared by fan-out tasks.
pub struct ResultsCollector<R> {
    inner: Arc<Mutex<FleetOperationResult<R>>>,
}

impl<R> Clone for ResultsCollector<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R> Default for ResultsCollector<R> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FleetOperationResult::default())),
        }
    }
}

impl<R: Clone> ResultsCollector<R> {
    pub async fn record(&self, node_id: &str, result: Result<R>) {
        self.inner.lock().await.record_result(node_id, result);
    }

    pub async fn snapshot(&self) -> FleetOperationResult<R> {
        self.inner.lock().await.clone()
    }
}

/// Run `op` for every item concurrently, one task per item, and collect
/// every outcome. No task is cancelled by a sibling's failure, except that
/// expired cloud credentials abort the whole pass and are returned as the error.
pub async fn fan_out<T, R, K, F, Fut>(items: Vec<T>, key: K, op: F) -> Result<FleetOperationResult<R>>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
    K: Fn(&T) -> String,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let collector = ResultsCollector::<R>::default();
    let mut set = JoinSet::new();
    let mut task_nodes = HashMap::new();

    for item in items {
        let node_id = key(&item);
        let fut = op(item);
        let collector = collector.clone();
        let id = node_id.clone();
        let handle = set.spawn(async move {
            match fut.await {
                Err(e) if FleetError::is_expired_credentials(&e) => Some(e),
                result => {
                    collector.record(&id, result).await;
                    None
                }
            }
        });
        task_nodes.insert(handle.id(), node_id);
    }

    while let Some(joined) = set.join_next_with_id().await {
        match joined {
            Ok((_, Some(expired))) => {
                warn!(error = %expired, "Cloud credentials expired, aborting remaining nodes");
                set.abort_all();
                return Err(expired);
            }
            Ok((task, None)) => {
                debug!(node_id = ?task_nodes.get(&task), "Node task finished");
            }
            Err(e) => {
                let node_id = task_nodes
                    .get(&e.id())
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                warn!(node_id = %node_id, error = %e, "Node task panicked");
                collector
                    .record(&node_id, Err(anyhow::anyhow!("task failed: {}", e)))
                    .await;
            }
        }
    }

    Ok(collector.snapshot().await)
}
