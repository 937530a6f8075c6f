use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::{
    Broker, ChangeAggregation, MutationId, NodeChange, Schema, Timestamp, VesperError,
    VesperResult,
};

/// Tracking sink for one top-level mutation.
///
/// Connectors report changes through [`MutationContext::track_change`] while
/// the mutation runs; [`MutationContext::commit`] stamps them and publishes
/// the aggregation once.
#[derive(Debug)]
pub struct MutationContext {
    schema: Arc<Schema>,
    request_context: serde_json::Value,
    pending: Mutex<Option<ChangeAggregation>>,
}

impl MutationContext {
    pub fn new(schema: Arc<Schema>, request_context: serde_json::Value) -> Self {
        let pending = Mutex::new(Some(ChangeAggregation::new(schema.clone())));
        Self {
            schema,
            request_context,
            pending,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn request_context(&self) -> &serde_json::Value {
        &self.request_context
    }

    fn lock(&self) -> MutexGuard<'_, Option<ChangeAggregation>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn track_change(&self, change: NodeChange) -> VesperResult<()> {
        let mut pending = self.lock();
        let aggregation = pending
            .as_mut()
            .ok_or_else(|| VesperError::conflict("mutation already committed"))?;
        aggregation.append(change)
    }

    /// Number of aggregated changes waiting for the commit.
    pub fn pending(&self) -> usize {
        self.lock().as_ref().map(ChangeAggregation::len).unwrap_or(0)
    }

    /// Publishes the aggregated changes; `None` when nothing changed.
    pub async fn commit(&self, broker: &dyn Broker) -> VesperResult<Option<MutationId>> {
        let aggregation = self.lock().take();
        let mut aggregation =
            aggregation.ok_or_else(|| VesperError::conflict("mutation already committed"))?;
        if aggregation.is_empty() {
            return Ok(None);
        }
        aggregation.set_committed_at(Timestamp::now())?;
        let count = aggregation.len();
        let mutation_id = broker.publish(aggregation).await?;
        debug!("tracking: published {count} changes as mutation {mutation_id}");
        Ok(Some(mutation_id))
    }

    /// Drops the tracked changes of a rolled-back mutation.
    pub fn discard(&self) -> usize {
        self.lock().take().map(|aggregation| aggregation.len()).unwrap_or(0)
    }
}
