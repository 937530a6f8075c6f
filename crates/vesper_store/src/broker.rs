use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use sea_orm::sea_query::{Alias, Expr, Func, Order, Query};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, QueryResult, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use tokio::sync::{Mutex, Notify, broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};

use crate::db::*;
use crate::migration::Migrator;
use crate::{BrokerSettings, VesperConfig};
use vesper_core::{
    Broker, BrokerBatch, BrokerEvent, BrokerHandle, BrokerId, BrokerSubscription,
    ChangeAggregation, ChangeKind, FlattenedDependencyGraph, HeartbeatOutcome, Id, MutationId,
    MutationSummary, NodeChange, Record, Schema, SubscriptionDiagnosis, SubscriptionId,
    Timestamp, VesperError, VesperResult,
};

const EVENT_CAPACITY: usize = 256;

/// Rows removed by one janitor pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PurgeReport {
    pub mutations: u64,
    pub changes: u64,
    pub assignments: u64,
}

impl PurgeReport {
    pub fn is_empty(&self) -> bool {
        self.mutations == 0 && self.changes == 0 && self.assignments == 0
    }
}

/// Durable change broker over the mutations / changes / assignments tables.
///
/// Every process sharing the database runs its own `SqlBroker`; each one
/// owns the assignments it leased and renews them from a single heartbeat
/// timer that runs while it has at least one subscription.
#[derive(Clone)]
pub struct SqlBroker {
    inner: Arc<BrokerInner>,
}

struct LocalSubscription {
    node: String,
    progress: Arc<StdMutex<FeedProgress>>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Delivery state of one local subscription. `visited` runs ahead of the
/// durable cursor while delivered batches wait for their acknowledgement.
#[derive(Debug)]
struct FeedProgress {
    visited: MutationId,
    in_flight: VecDeque<MutationId>,
}

impl FeedProgress {
    fn new(cursor: MutationId) -> Self {
        Self {
            visited: cursor,
            in_flight: VecDeque::new(),
        }
    }

    /// Highest cursor that loses nothing: just below the oldest batch still
    /// waiting for its acknowledgement.
    fn safe_cursor(&self) -> MutationId {
        match self.in_flight.front() {
            Some(first) => MutationId(first.as_i64() - 1),
            None => self.visited,
        }
    }

    fn acknowledge(&mut self, through: MutationId) -> MutationId {
        while self.in_flight.front().is_some_and(|first| *first <= through) {
            self.in_flight.pop_front();
        }
        self.safe_cursor()
    }
}

fn lock_progress(progress: &StdMutex<FeedProgress>) -> MutexGuard<'_, FeedProgress> {
    match progress.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct BrokerInner {
    conn: DatabaseConnection,
    schema: Arc<Schema>,
    id: BrokerId,
    settings: BrokerSettings,
    failpoints: HashSet<String>,
    published: Notify,
    events: broadcast::Sender<BrokerEvent>,
    subscriptions: StdMutex<HashMap<SubscriptionId, LocalSubscription>>,
    heartbeat_running: AtomicBool,
    heartbeat_passes: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

struct MutationRow {
    id: MutationId,
    request_context: serde_json::Value,
    summary: MutationSummary,
    committed_at: Timestamp,
}

impl MutationRow {
    fn read(row: &QueryResult) -> VesperResult<Self> {
        let id: i64 = row.try_get("", &col_name(VesperMutations::Id))?;
        let request_context: String =
            row.try_get("", &col_name(VesperMutations::RequestContext))?;
        let summary: String = row.try_get("", &col_name(VesperMutations::ChangesByNode))?;
        let committed_at: i64 = row.try_get("", &col_name(VesperMutations::CommittedAt))?;
        Ok(Self {
            id: MutationId(id),
            request_context: serde_json::from_str(&request_context)?,
            summary: serde_json::from_str(&summary)?,
            committed_at: Timestamp::from_i64(committed_at),
        })
    }
}

enum PullOutcome {
    Drained,
    More,
    Closed,
    Lost,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SqlBroker {
    pub async fn connect(
        config: &VesperConfig,
        base_dir: &Path,
        schema: Arc<Schema>,
    ) -> VesperResult<Self> {
        let url = config.connection_url(base_dir)?;
        let mut options = ConnectOptions::new(url);
        if let Some(pool) = &config.pool {
            if let Some(max) = pool.max_connections {
                options.max_connections(max);
            }
            if let Some(min) = pool.min_connections {
                options.min_connections(min);
            }
            if let Some(timeout_ms) = pool.connect_timeout_ms {
                options.connect_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.acquire_timeout_ms {
                options.acquire_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.idle_timeout_ms {
                options.idle_timeout(Duration::from_millis(timeout_ms));
            }
        }
        let conn = Database::connect(options).await.map_err(VesperError::from)?;
        Migrator::up(&conn, None).await.map_err(VesperError::from)?;
        let failpoints = config
            .failpoints
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect::<HashSet<_>>();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let broker = Self {
            inner: Arc::new(BrokerInner {
                conn,
                schema,
                id: BrokerId::new(),
                settings: config.broker_settings(),
                failpoints,
                published: Notify::new(),
                events,
                subscriptions: StdMutex::new(HashMap::new()),
                heartbeat_running: AtomicBool::new(false),
                heartbeat_passes: AtomicU64::new(0),
                timer: Mutex::new(None),
                janitor: Mutex::new(None),
            }),
        };
        broker.start_janitor().await;
        info!(
            "broker: {} connected to {} backend",
            broker.inner.id,
            config.backend_name()
        );
        Ok(broker)
    }

    pub async fn connect_sqlite(path: &Path, schema: Arc<Schema>) -> VesperResult<Self> {
        let config = VesperConfig::default_sqlite(path.to_string_lossy());
        Self::connect(&config, path.parent().unwrap_or_else(|| Path::new(".")), schema).await
    }

    pub fn id(&self) -> BrokerId {
        self.inner.id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    pub fn settings(&self) -> BrokerSettings {
        self.inner.settings
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.inner.conn
    }

    /// Completed heartbeat passes; skipped calls are not counted.
    pub fn heartbeat_passes(&self) -> u64 {
        self.inner.heartbeat_passes.load(Ordering::SeqCst)
    }

    pub fn local_subscriptions(&self) -> usize {
        self.inner.lock_subscriptions().len()
    }

    pub async fn last_mutation_id(&self) -> VesperResult<MutationId> {
        self.inner.last_mutation_id().await
    }

    /// Purges what the retention window no longer protects, as seen at `now`.
    pub async fn collect_garbage(&self, now: Timestamp) -> VesperResult<PurgeReport> {
        self.inner.collect_garbage(now).await
    }

    /// Stops every local subscription and the background tasks.
    pub async fn close(&self) -> VesperResult<()> {
        let ids = self.inner.local_ids();
        let mut errors = Vec::new();
        for id in ids {
            if let Err(err) = self.inner.unsubscribe(id).await {
                errors.push(err);
            }
        }
        if let Some(task) = self.inner.janitor.lock().await.take() {
            task.abort();
        }
        self.inner.stop_timer().await;
        VesperError::settle(errors)
    }

    async fn start_janitor(&self) {
        let mut slot = self.inner.janitor.lock().await;
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.settings.janitor_interval;
        *slot = Some(tokio::spawn(run_janitor(weak, period)));
    }
}

impl BrokerInner {
    fn lock_subscriptions(&self) -> MutexGuard<'_, HashMap<SubscriptionId, LocalSubscription>> {
        match self.subscriptions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn local_ids(&self) -> Vec<SubscriptionId> {
        self.lock_subscriptions().keys().copied().collect()
    }

    fn maybe_failpoint(&self, key: &str) -> VesperResult<()> {
        if self.failpoints.contains(key) {
            Err(VesperError::storage(format!("failpoint {key}")))
        } else {
            Ok(())
        }
    }

    fn lease_deadline(&self, now: Timestamp) -> Timestamp {
        now.saturating_add(self.settings.lease_duration())
    }

    async fn last_mutation_id(&self) -> VesperResult<MutationId> {
        let select = Query::select()
            .from(VesperMutations::Table)
            .expr_as(Func::max(Expr::col(VesperMutations::Id)), Alias::new("max_id"))
            .to_owned();
        let max_id = match query_one(&self.conn, &select).await? {
            Some(row) => row.try_get::<Option<i64>>("", "max_id")?.unwrap_or(0),
            None => 0,
        };
        Ok(MutationId(max_id))
    }

    async fn publish(&self, mut changes: ChangeAggregation) -> VesperResult<MutationId> {
        if changes.is_empty() {
            return Err(VesperError::invalid("cannot publish an empty aggregation"));
        }
        let committed_at = match changes.committed_at() {
            Some(committed_at) => committed_at,
            None => {
                let now = Timestamp::now();
                changes.set_committed_at(now)?;
                now
            }
        };
        let summary = serde_json::to_string(&changes.summary())?;
        let request_context = serde_json::to_string(&changes.request_context())?;
        let change_count = changes.len();

        let tx = self.conn.begin().await?;
        let next_id = next_mutation_id(&tx).await?;
        let insert = Query::insert()
            .into_table(VesperMutations::Table)
            .columns([
                VesperMutations::Id,
                VesperMutations::RequestContext,
                VesperMutations::ChangeCount,
                VesperMutations::ChangesByNode,
                VesperMutations::CommittedAt,
            ])
            .values_panic([
                next_id.into(),
                request_context.into(),
                (change_count as i64).into(),
                summary.into(),
                committed_at.as_i64().into(),
            ])
            .to_owned();
        exec(&tx, &insert).await?;
        self.maybe_failpoint("after_mutation_insert")?;

        for (sequence, change) in changes.changes().enumerate() {
            let old_value = change.old_value().map(serde_json::to_string).transpose()?;
            let new_value = change.new_value().map(serde_json::to_string).transpose()?;
            let insert = Query::insert()
                .into_table(VesperChanges::Table)
                .columns([
                    VesperChanges::MutationId,
                    VesperChanges::Sequence,
                    VesperChanges::Node,
                    VesperChanges::Kind,
                    VesperChanges::OldValue,
                    VesperChanges::NewValue,
                    VesperChanges::ExecutedAt,
                ])
                .values_panic([
                    next_id.into(),
                    (sequence as i32).into(),
                    change.node().to_string().into(),
                    change.kind().as_i16().into(),
                    old_value.into(),
                    new_value.into(),
                    change.executed_at().as_i64().into(),
                ])
                .to_owned();
            exec(&tx, &insert).await?;
        }
        tx.commit().await?;

        let mutation_id = MutationId(next_id);
        self.published.notify_waiters();
        let _ = self.events.send(BrokerEvent::Published {
            mutation_id,
            change_count,
        });
        debug!("broker: published mutation {mutation_id} with {change_count} changes");
        Ok(mutation_id)
    }

    /// Leases the assignment for `subscription` and returns its cursor.
    async fn assign(&self, subscription: &BrokerSubscription) -> VesperResult<MutationId> {
        let now = Timestamp::now();
        let key = subscription.id.0.to_uuid_string();
        let tx = self.conn.begin().await?;
        let select = Query::select()
            .from(VesperAssignments::Table)
            .columns([
                VesperAssignments::Owner,
                VesperAssignments::LastVisitedMutationId,
                VesperAssignments::LeaseExpiresAt,
            ])
            .and_where(Expr::col(VesperAssignments::SubscriptionId).eq(key.clone()))
            .to_owned();
        let cursor = match query_one(&tx, &select).await? {
            Some(row) => {
                let owner: String = row.try_get("", &col_name(VesperAssignments::Owner))?;
                let cursor: i64 =
                    row.try_get("", &col_name(VesperAssignments::LastVisitedMutationId))?;
                let lease: i64 = row.try_get("", &col_name(VesperAssignments::LeaseExpiresAt))?;
                if Timestamp::from_i64(lease) > now {
                    return Err(VesperError::conflict(format!(
                        "subscription {} is leased by broker {owner}",
                        subscription.id
                    )));
                }
                let update = Query::update()
                    .table(VesperAssignments::Table)
                    .values([
                        (VesperAssignments::Owner, self.id.0.to_uuid_string().into()),
                        (
                            VesperAssignments::LeaseExpiresAt,
                            self.lease_deadline(now).as_i64().into(),
                        ),
                    ])
                    .and_where(Expr::col(VesperAssignments::SubscriptionId).eq(key.clone()))
                    .and_where(Expr::col(VesperAssignments::LeaseExpiresAt).eq(lease))
                    .to_owned();
                if exec(&tx, &update).await? == 0 {
                    return Err(VesperError::conflict(format!(
                        "subscription {} was taken over concurrently",
                        subscription.id
                    )));
                }
                info!(
                    "broker: {} took over stale subscription {} from {owner} at #{cursor}",
                    self.id, subscription.id
                );
                MutationId(cursor)
            }
            None => {
                let select = Query::select()
                    .from(VesperMutations::Table)
                    .expr_as(Func::max(Expr::col(VesperMutations::Id)), Alias::new("max_id"))
                    .and_where(
                        Expr::col(VesperMutations::CommittedAt).lte(subscription.since.as_i64()),
                    )
                    .to_owned();
                let cursor = match query_one(&tx, &select).await? {
                    Some(row) => row.try_get::<Option<i64>>("", "max_id")?.unwrap_or(0),
                    None => 0,
                };
                let insert = Query::insert()
                    .into_table(VesperAssignments::Table)
                    .columns([
                        VesperAssignments::SubscriptionId,
                        VesperAssignments::Node,
                        VesperAssignments::Owner,
                        VesperAssignments::LastVisitedMutationId,
                        VesperAssignments::LeaseExpiresAt,
                        VesperAssignments::Since,
                        VesperAssignments::CreatedAt,
                    ])
                    .values_panic([
                        key.into(),
                        subscription.node.clone().into(),
                        self.id.0.to_uuid_string().into(),
                        cursor.into(),
                        self.lease_deadline(now).as_i64().into(),
                        subscription.since.as_i64().into(),
                        now.as_i64().into(),
                    ])
                    .to_owned();
                exec(&tx, &insert).await?;
                MutationId(cursor)
            }
        };
        tx.commit().await?;
        Ok(cursor)
    }

    /// The cursor of an assignment this broker still owns.
    async fn owned_cursor(&self, id: SubscriptionId) -> VesperResult<Option<MutationId>> {
        let select = Query::select()
            .from(VesperAssignments::Table)
            .column(VesperAssignments::LastVisitedMutationId)
            .and_where(Expr::col(VesperAssignments::SubscriptionId).eq(id.0.to_uuid_string()))
            .and_where(Expr::col(VesperAssignments::Owner).eq(self.id.0.to_uuid_string()))
            .to_owned();
        match query_one(&self.conn, &select).await? {
            Some(row) => {
                let cursor: i64 =
                    row.try_get("", &col_name(VesperAssignments::LastVisitedMutationId))?;
                Ok(Some(MutationId(cursor)))
            }
            None => Ok(None),
        }
    }

    /// Moves the cursor forward; `false` once the lease was lost.
    async fn advance_cursor(&self, id: SubscriptionId, to: MutationId) -> VesperResult<bool> {
        let update = Query::update()
            .table(VesperAssignments::Table)
            .values([(VesperAssignments::LastVisitedMutationId, to.as_i64().into())])
            .and_where(Expr::col(VesperAssignments::SubscriptionId).eq(id.0.to_uuid_string()))
            .and_where(Expr::col(VesperAssignments::Owner).eq(self.id.0.to_uuid_string()))
            .and_where(Expr::col(VesperAssignments::LastVisitedMutationId).lt(to.as_i64()))
            .to_owned();
        if exec(&self.conn, &update).await? > 0 {
            return Ok(true);
        }
        Ok(self.owned_cursor(id).await?.is_some())
    }

    async fn load_changes(
        &self,
        mutation: &MutationRow,
        graph: &FlattenedDependencyGraph,
    ) -> VesperResult<ChangeAggregation> {
        let nodes = graph.node_names().map(str::to_string).collect::<Vec<_>>();
        let select = Query::select()
            .from(VesperChanges::Table)
            .columns([
                VesperChanges::Node,
                VesperChanges::Kind,
                VesperChanges::OldValue,
                VesperChanges::NewValue,
                VesperChanges::ExecutedAt,
            ])
            .and_where(Expr::col(VesperChanges::MutationId).eq(mutation.id.as_i64()))
            .and_where(Expr::col(VesperChanges::Node).is_in(nodes))
            .order_by(VesperChanges::Sequence, Order::Asc)
            .to_owned();
        let rows = query_all(&self.conn, &select).await?;
        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let mut change = read_change(&self.schema, &row, &mutation.request_context)?;
            change.set_committed_at(mutation.committed_at)?;
            changes.push(change);
        }
        let aggregation = ChangeAggregation::create_from_iter(self.schema.clone(), changes)?;
        Ok(graph.restrict(&aggregation))
    }

    /// Sends every relevant mutation past `progress.visited`. The durable
    /// cursor only moves up to the last acknowledged batch.
    async fn pull_once(
        &self,
        subscription: &BrokerSubscription,
        progress: &StdMutex<FeedProgress>,
        sender: &mpsc::Sender<BrokerBatch>,
    ) -> VesperResult<PullOutcome> {
        let Some(durable) = self.owned_cursor(subscription.id).await? else {
            return Ok(PullOutcome::Lost);
        };
        self.maybe_failpoint("pull")?;
        let cursor = lock_progress(progress).visited;
        let select = Query::select()
            .from(VesperMutations::Table)
            .columns([
                VesperMutations::Id,
                VesperMutations::RequestContext,
                VesperMutations::ChangesByNode,
                VesperMutations::CommittedAt,
            ])
            .and_where(Expr::col(VesperMutations::Id).gt(cursor.as_i64()))
            .order_by(VesperMutations::Id, Order::Asc)
            .limit(self.settings.pull_batch_size)
            .to_owned();
        let rows = query_all(&self.conn, &select).await?;
        let full = rows.len() as u64 >= self.settings.pull_batch_size;
        for row in rows {
            let mutation = MutationRow::read(&row)?;
            let mut batch = None;
            if subscription.graph.is_affected_by_summary(&mutation.summary) {
                let changes = self.load_changes(&mutation, &subscription.graph).await?;
                if !changes.is_empty() {
                    batch = Some(BrokerBatch {
                        mutation_id: mutation.id,
                        committed_at: mutation.committed_at,
                        changes,
                    });
                }
            }
            {
                let mut progress = lock_progress(progress);
                progress.visited = mutation.id;
                if batch.is_some() {
                    progress.in_flight.push_back(mutation.id);
                }
            }
            if let Some(batch) = batch {
                if sender.send(batch).await.is_err() {
                    return Ok(PullOutcome::Closed);
                }
            }
        }
        let safe = lock_progress(progress).safe_cursor();
        if safe > durable && !self.advance_cursor(subscription.id, safe).await? {
            return Ok(PullOutcome::Lost);
        }
        Ok(if full {
            PullOutcome::More
        } else {
            PullOutcome::Drained
        })
    }

    async fn subscribe(
        self: &Arc<Self>,
        subscription: BrokerSubscription,
    ) -> VesperResult<BrokerHandle> {
        self.schema.node(&subscription.node)?;
        for node in subscription.graph.node_names() {
            self.schema.node(node)?;
        }
        if self.lock_subscriptions().contains_key(&subscription.id) {
            return Err(VesperError::conflict(format!(
                "subscription {} is already active",
                subscription.id
            )));
        }
        let cursor = self.assign(&subscription).await?;
        let (sender, batches) = mpsc::channel(self.settings.channel_capacity);
        let (stop, stopped) = watch::channel(false);
        let id = subscription.id;
        let node = subscription.node.clone();
        let progress = Arc::new(StdMutex::new(FeedProgress::new(cursor)));
        let task = tokio::spawn(run_pull_loop(
            self.clone(),
            subscription,
            progress.clone(),
            sender,
            stopped,
        ));
        self.lock_subscriptions().insert(
            id,
            LocalSubscription {
                node,
                progress,
                stop,
                task,
            },
        );
        self.start_timer().await;
        info!("broker: subscription {id} assigned at {cursor}");
        Ok(BrokerHandle { id, batches })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> VesperResult<()> {
        let local = self.lock_subscriptions().remove(&id);
        let Some(local) = local else {
            return Err(VesperError::not_found(format!("subscription {id}")));
        };
        let _ = local.stop.send(true);
        local.task.abort();
        let delete = Query::delete()
            .from_table(VesperAssignments::Table)
            .and_where(Expr::col(VesperAssignments::SubscriptionId).eq(id.0.to_uuid_string()))
            .and_where(Expr::col(VesperAssignments::Owner).eq(self.id.0.to_uuid_string()))
            .to_owned();
        let result = exec(&self.conn, &delete).await;
        self.stop_timer_if_idle().await;
        result?;
        info!("broker: subscription {id} on \"{}\" released", local.node);
        Ok(())
    }

    async fn acknowledge(&self, id: SubscriptionId, through: MutationId) -> VesperResult<()> {
        let progress = self
            .lock_subscriptions()
            .get(&id)
            .map(|local| local.progress.clone())
            .ok_or_else(|| VesperError::not_found(format!("subscription {id}")))?;
        let safe = lock_progress(&progress).acknowledge(through);
        if !self.advance_cursor(id, safe).await? {
            warn!("broker: acknowledgement of {id} through {through} came after its lease was lost");
        }
        Ok(())
    }

    async fn start_timer(self: &Arc<Self>) {
        let mut slot = self.timer.lock().await;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = self.settings.heartbeat_interval;
        *slot = Some(tokio::spawn(run_heartbeat_timer(weak, period)));
        debug!("broker: heartbeat timer started");
    }

    /// Stops the timer unless a subscription arrived meanwhile. The check
    /// runs under the timer slot, which `start_timer` also takes.
    async fn stop_timer_if_idle(&self) {
        let mut slot = self.timer.lock().await;
        if !self.lock_subscriptions().is_empty() {
            return;
        }
        if let Some(task) = slot.take() {
            task.abort();
            debug!("broker: heartbeat timer stopped");
        }
    }

    async fn stop_timer(&self) {
        if let Some(task) = self.timer.lock().await.take() {
            task.abort();
            debug!("broker: heartbeat timer stopped");
        }
    }

    async fn heartbeat(&self) -> VesperResult<HeartbeatOutcome> {
        let ids = self.local_ids();
        if ids.is_empty() {
            return Ok(HeartbeatOutcome::Skipped);
        }
        if self
            .heartbeat_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(HeartbeatOutcome::Skipped);
        }
        let _guard = RunningGuard(&self.heartbeat_running);
        self.maybe_failpoint("heartbeat")?;

        let deadline = self.lease_deadline(Timestamp::now()).as_i64();
        let owner = self.id.0.to_uuid_string();
        let mut tasks = JoinSet::new();
        for id in ids {
            let conn = self.conn.clone();
            let owner = owner.clone();
            tasks.spawn(async move {
                let update = Query::update()
                    .table(VesperAssignments::Table)
                    .values([(VesperAssignments::LeaseExpiresAt, deadline.into())])
                    .and_where(
                        Expr::col(VesperAssignments::SubscriptionId).eq(id.0.to_uuid_string()),
                    )
                    .and_where(Expr::col(VesperAssignments::Owner).eq(owner))
                    .to_owned();
                exec(&conn, &update).await.map(|rows| (id, rows > 0))
            });
        }
        let mut renewed = 0;
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((_, true))) => renewed += 1,
                Ok(Ok((id, false))) => {
                    warn!("broker: lease of subscription {id} was lost");
                }
                Ok(Err(err)) => errors.push(err),
                Err(err) => errors.push(VesperError::storage(format!("heartbeat task: {err}"))),
            }
        }
        VesperError::settle(errors)?;
        self.heartbeat_passes.fetch_add(1, Ordering::SeqCst);
        debug!("broker: renewed {renewed} leases");
        Ok(HeartbeatOutcome::Ran(renewed))
    }

    async fn diagnose(&self) -> VesperResult<Vec<SubscriptionDiagnosis>> {
        let now = Timestamp::now();
        let select = Query::select()
            .from(VesperAssignments::Table)
            .columns([
                VesperAssignments::SubscriptionId,
                VesperAssignments::Node,
                VesperAssignments::Owner,
                VesperAssignments::LastVisitedMutationId,
                VesperAssignments::LeaseExpiresAt,
            ])
            .order_by(VesperAssignments::CreatedAt, Order::Asc)
            .to_owned();
        let rows = query_all(&self.conn, &select).await?;
        let mut report = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("", &col_name(VesperAssignments::SubscriptionId))?;
            let node: String = row.try_get("", &col_name(VesperAssignments::Node))?;
            let owner: String = row.try_get("", &col_name(VesperAssignments::Owner))?;
            let cursor: i64 =
                row.try_get("", &col_name(VesperAssignments::LastVisitedMutationId))?;
            let lease: i64 = row.try_get("", &col_name(VesperAssignments::LeaseExpiresAt))?;

            let backlog_query = Query::select()
                .from(VesperMutations::Table)
                .expr_as(Func::count(Expr::col(VesperMutations::Id)), Alias::new("backlog"))
                .expr_as(
                    Func::min(Expr::col(VesperMutations::CommittedAt)),
                    Alias::new("oldest"),
                )
                .and_where(Expr::col(VesperMutations::Id).gt(cursor))
                .to_owned();
            let (backlog, oldest) = match query_one(&self.conn, &backlog_query).await? {
                Some(row) => (
                    row.try_get::<i64>("", "backlog")?,
                    row.try_get::<Option<i64>>("", "oldest")?,
                ),
                None => (0, None),
            };
            let lease_expires_at = Timestamp::from_i64(lease);
            report.push(SubscriptionDiagnosis {
                id: SubscriptionId(Id::from_uuid_str(&id)?),
                node,
                owner: BrokerId(Id::from_uuid_str(&owner)?),
                last_visited: MutationId(cursor),
                backlog: backlog.max(0) as u64,
                latency: oldest.map(|oldest| Timestamp::from_i64(oldest).elapsed_until(now)),
                lease_expires_at,
                stale: lease_expires_at <= now,
            });
        }
        Ok(report)
    }

    async fn collect_garbage(&self, now: Timestamp) -> VesperResult<PurgeReport> {
        let cutoff = now.saturating_sub(self.settings.retention).as_i64();
        let tx = self.conn.begin().await?;

        let delete = Query::delete()
            .from_table(VesperAssignments::Table)
            .and_where(Expr::col(VesperAssignments::LeaseExpiresAt).lt(cutoff))
            .to_owned();
        let assignments = exec(&tx, &delete).await?;

        let select = Query::select()
            .from(VesperAssignments::Table)
            .expr_as(
                Func::min(Expr::col(VesperAssignments::LastVisitedMutationId)),
                Alias::new("min_cursor"),
            )
            .to_owned();
        let min_cursor = match query_one(&tx, &select).await? {
            Some(row) => row.try_get::<Option<i64>>("", "min_cursor")?,
            None => None,
        };

        let mut expired = Query::select();
        expired
            .from(VesperMutations::Table)
            .column(VesperMutations::Id)
            .and_where(Expr::col(VesperMutations::CommittedAt).lt(cutoff));
        if let Some(min_cursor) = min_cursor {
            expired.and_where(Expr::col(VesperMutations::Id).lte(min_cursor));
        }
        let delete = Query::delete()
            .from_table(VesperChanges::Table)
            .and_where(Expr::col(VesperChanges::MutationId).in_subquery(expired.to_owned()))
            .to_owned();
        let changes = exec(&tx, &delete).await?;

        let mut delete = Query::delete();
        delete
            .from_table(VesperMutations::Table)
            .and_where(Expr::col(VesperMutations::CommittedAt).lt(cutoff));
        if let Some(min_cursor) = min_cursor {
            delete.and_where(Expr::col(VesperMutations::Id).lte(min_cursor));
        }
        let mutations = exec(&tx, &delete.to_owned()).await?;
        tx.commit().await?;

        let report = PurgeReport {
            mutations,
            changes,
            assignments,
        };
        if !report.is_empty() {
            info!(
                "janitor: purged {mutations} mutations, {changes} changes, {assignments} assignments"
            );
            let _ = self.events.send(BrokerEvent::Purged {
                mutations,
                changes,
                assignments,
            });
        }
        Ok(report)
    }
}

/// Ids never go back below a cursor, even once the janitor emptied the table.
async fn next_mutation_id<C: ConnectionTrait>(conn: &C) -> VesperResult<i64> {
    let select = Query::select()
        .from(VesperMutations::Table)
        .expr_as(Func::max(Expr::col(VesperMutations::Id)), Alias::new("max_id"))
        .to_owned();
    let max_id = match query_one(conn, &select).await? {
        Some(row) => row.try_get::<Option<i64>>("", "max_id")?.unwrap_or(0),
        None => 0,
    };
    let select = Query::select()
        .from(VesperAssignments::Table)
        .expr_as(
            Func::max(Expr::col(VesperAssignments::LastVisitedMutationId)),
            Alias::new("max_cursor"),
        )
        .to_owned();
    let max_cursor = match query_one(conn, &select).await? {
        Some(row) => row.try_get::<Option<i64>>("", "max_cursor")?.unwrap_or(0),
        None => 0,
    };
    Ok(max_id.max(max_cursor) + 1)
}

fn read_change(
    schema: &Schema,
    row: &QueryResult,
    request_context: &serde_json::Value,
) -> VesperResult<NodeChange> {
    let node: String = row.try_get("", &col_name(VesperChanges::Node))?;
    let kind: i16 = row.try_get("", &col_name(VesperChanges::Kind))?;
    let old_value: Option<String> = row.try_get("", &col_name(VesperChanges::OldValue))?;
    let new_value: Option<String> = row.try_get("", &col_name(VesperChanges::NewValue))?;
    let executed_at = Timestamp::from_i64(row.try_get("", &col_name(VesperChanges::ExecutedAt))?);
    let parse = |raw: Option<String>, side: &str| -> VesperResult<Record> {
        let raw = raw.ok_or_else(|| {
            VesperError::storage(format!("change row of \"{node}\" lacks its {side} value"))
        })?;
        Ok(serde_json::from_str(&raw)?)
    };
    let request_context = request_context.clone();
    match ChangeKind::from_i16(kind)? {
        ChangeKind::Creation => NodeChange::creation(
            schema,
            &node,
            parse(new_value, "new")?,
            request_context,
            executed_at,
        ),
        ChangeKind::Update => NodeChange::update(
            schema,
            &node,
            parse(old_value, "old")?,
            parse(new_value, "new")?,
            request_context,
            executed_at,
        ),
        ChangeKind::Deletion => NodeChange::deletion(
            schema,
            &node,
            parse(old_value, "old")?,
            request_context,
            executed_at,
        ),
    }
}

async fn run_pull_loop(
    inner: Arc<BrokerInner>,
    subscription: BrokerSubscription,
    progress: Arc<StdMutex<FeedProgress>>,
    sender: mpsc::Sender<BrokerBatch>,
    mut stopped: watch::Receiver<bool>,
) {
    let mut ticker = interval(inner.settings.pull_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if *stopped.borrow() || sender.is_closed() {
            break;
        }
        let outcome = tokio::select! {
            outcome = inner.pull_once(&subscription, &progress, &sender) => outcome,
            _ = stopped.changed() => break,
        };
        match outcome {
            Ok(PullOutcome::More) => continue,
            Ok(PullOutcome::Drained) => {}
            Ok(PullOutcome::Closed) => break,
            Ok(PullOutcome::Lost) => {
                warn!(
                    "broker: subscription {} was reassigned, stopping its pull loop",
                    subscription.id
                );
                break;
            }
            Err(err) => {
                let message = err.to_string();
                warn!("broker: pull for {} failed: {message}", subscription.id);
                let _ = inner.events.send(BrokerEvent::PullFailed {
                    id: subscription.id,
                    message,
                });
            }
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = inner.published.notified() => {}
            _ = stopped.changed() => break,
        }
    }
    debug!("broker: pull loop of {} finished", subscription.id);
}

async fn run_heartbeat_timer(inner: Weak<BrokerInner>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(err) = inner.heartbeat().await {
            let message = err.to_string();
            warn!("broker: heartbeat failed: {message}");
            let _ = inner.events.send(BrokerEvent::HeartbeatFailed { message });
        }
    }
}

async fn run_janitor(inner: Weak<BrokerInner>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(err) = inner.collect_garbage(Timestamp::now()).await {
            warn!("janitor: pass failed: {err}");
        }
    }
}

#[async_trait]
impl Broker for SqlBroker {
    async fn publish(&self, changes: ChangeAggregation) -> VesperResult<MutationId> {
        self.inner.publish(changes).await
    }

    async fn subscribe(&self, subscription: BrokerSubscription) -> VesperResult<BrokerHandle> {
        self.inner.subscribe(subscription).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> VesperResult<()> {
        self.inner.unsubscribe(id).await
    }

    async fn acknowledge(&self, id: SubscriptionId, through: MutationId) -> VesperResult<()> {
        self.inner.acknowledge(id, through).await
    }

    async fn heartbeat(&self) -> VesperResult<HeartbeatOutcome> {
        self.inner.heartbeat().await
    }

    async fn diagnose(&self) -> VesperResult<Vec<SubscriptionDiagnosis>> {
        self.inner.diagnose().await
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }
}
