use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::{
    BrokerId, ChangeAggregation, Filter, FlattenedDependencyGraph, MutationContext, MutationId,
    OrderBy, Record, Selection, SubscriptionId, Timestamp, VesperResult,
};

/// A read against the store; `limit` of `None` reads everything matching.
#[derive(Clone, Debug)]
pub struct FindInput {
    pub node: String,
    pub filter: Filter,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub selection: Selection,
}

/// The storage side of the data-access layer. Mutations report every change
/// they make to the tracking sink they are given.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn find(&self, input: FindInput) -> VesperResult<Vec<Record>>;

    async fn create(
        &self,
        tracker: &MutationContext,
        node: &str,
        value: Record,
    ) -> VesperResult<Record>;

    async fn update(
        &self,
        tracker: &MutationContext,
        node: &str,
        filter: Filter,
        patch: Record,
    ) -> VesperResult<Vec<Record>>;

    async fn delete(
        &self,
        tracker: &MutationContext,
        node: &str,
        filter: Filter,
    ) -> VesperResult<Vec<Record>>;
}

/// What a subscription asks the broker for.
#[derive(Clone, Debug)]
pub struct BrokerSubscription {
    pub id: SubscriptionId,
    pub node: String,
    pub graph: FlattenedDependencyGraph,
    /// Mutations committed at or before this watermark are skipped.
    pub since: Timestamp,
}

/// The relevant changes of one committed mutation.
#[derive(Clone, Debug)]
pub struct BrokerBatch {
    pub mutation_id: MutationId,
    pub committed_at: Timestamp,
    pub changes: ChangeAggregation,
}

#[derive(Debug)]
pub struct BrokerHandle {
    pub id: SubscriptionId,
    pub batches: mpsc::Receiver<BrokerBatch>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeartbeatOutcome {
    /// Leases of this many subscriptions were renewed.
    Ran(usize),
    /// No subscription is registered, or a pass is already in flight.
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDiagnosis {
    pub id: SubscriptionId,
    pub node: String,
    pub owner: BrokerId,
    /// Last mutation the subscriber acknowledged, or skipped as irrelevant.
    pub last_visited: MutationId,
    /// Committed mutations past the cursor.
    pub backlog: u64,
    /// Age of the oldest mutation past the cursor.
    pub latency: Option<Duration>,
    pub lease_expires_at: Timestamp,
    pub stale: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BrokerEvent {
    Published {
        mutation_id: MutationId,
        change_count: usize,
    },
    HeartbeatFailed {
        message: String,
    },
    /// Reading the feed of a subscription failed; the pull loop retries.
    PullFailed {
        id: SubscriptionId,
        message: String,
    },
    Purged {
        mutations: u64,
        changes: u64,
        assignments: u64,
    },
}

/// Durable pub/sub of committed change sets.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends a committed aggregation; durable once this returns.
    async fn publish(&self, changes: ChangeAggregation) -> VesperResult<MutationId>;

    async fn subscribe(&self, subscription: BrokerSubscription) -> VesperResult<BrokerHandle>;

    async fn unsubscribe(&self, id: SubscriptionId) -> VesperResult<()>;

    /// Confirms that every batch up to `through` was consumed. The durable
    /// cursor only moves past delivered batches once they are acknowledged.
    async fn acknowledge(&self, id: SubscriptionId, through: MutationId) -> VesperResult<()>;

    async fn heartbeat(&self) -> VesperResult<HeartbeatOutcome>;

    async fn diagnose(&self) -> VesperResult<Vec<SubscriptionDiagnosis>>;

    fn events(&self) -> broadcast::Receiver<BrokerEvent>;
}
