//! Live result-set deltas for one filtered, selected view of a node.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use vesper_core::{
    Broker, BrokerBatch, BrokerSubscription, Connector, DependencyTree, DependentGraph, Filter,
    FindInput, FlattenedDependencyGraph, MutationId, NodeChange, NodeUpdate, Record, Schema,
    Selection, SubscriptionId, Timestamp, VesperError, VesperResult, canonical_record_key,
};

/// What a stream watches.
#[derive(Clone, Debug)]
pub struct ChangesSubscriptionInput {
    pub node: String,
    pub filter: Filter,
    pub selection: Selection,
    /// Shape of deletion deltas; the node's identifier when `None`.
    pub deletion_selection: Option<Selection>,
    /// Mutations committed at or before this point are not delivered.
    pub since: Option<Timestamp>,
    /// Reuses the assignment of an earlier stream once its lease went stale.
    pub id: Option<SubscriptionId>,
}

impl ChangesSubscriptionInput {
    pub fn new(node: impl Into<String>, filter: Filter, selection: Selection) -> Self {
        Self {
            node: node.into(),
            filter,
            selection,
            deletion_selection: None,
            since: None,
            id: None,
        }
    }

    pub fn deletion_selection(mut self, selection: Selection) -> Self {
        self.deletion_selection = Some(selection);
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn id(mut self, id: SubscriptionId) -> Self {
        self.id = Some(id);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ChangesSubscriptionDelta {
    /// An instance entered the result set or changed a selected value.
    Upsert(Record),
    /// An instance left the result set.
    Deletion(Record),
}

impl ChangesSubscriptionDelta {
    pub fn record(&self) -> &Record {
        match self {
            ChangesSubscriptionDelta::Upsert(record) | ChangesSubscriptionDelta::Deletion(record) => {
                record
            }
        }
    }

    pub fn is_deletion(&self) -> bool {
        matches!(self, ChangesSubscriptionDelta::Deletion(_))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Created,
    Subscribed,
    Consuming,
    /// Every pulled batch has been turned into deltas.
    Idle,
    Disposed,
}

pub(crate) struct StreamShared {
    pub(crate) id: SubscriptionId,
    broker: Arc<dyn Broker>,
    abort: watch::Sender<bool>,
    state: watch::Sender<StreamState>,
    subscribed: AtomicBool,
    disposed: AtomicBool,
}

impl StreamShared {
    pub(crate) fn abort(&self) {
        self.abort.send_replace(true);
    }

    fn set_state(&self, state: StreamState) {
        self.state.send_if_modified(|current| {
            if *current == StreamState::Disposed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    async fn dispose(&self) -> VesperResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = if self.subscribed.load(Ordering::SeqCst) {
            self.broker.unsubscribe(self.id).await
        } else {
            Ok(())
        };
        self.abort();
        self.state.send_replace(StreamState::Disposed);
        info!("stream: {} disposed", self.id);
        result
    }
}

/// Shares control of a stream with other tasks.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<StreamShared>,
}

impl StreamHandle {
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the stream is idle or disposed.
    pub async fn wait_for_idle(&self) -> VesperResult<()> {
        let mut state = self.shared.state.subscribe();
        state
            .wait_for(|state| matches!(state, StreamState::Idle | StreamState::Disposed))
            .await
            .map(|_| ())
            .map_err(|_| VesperError::Aborted)
    }

    pub async fn dispose(&self) -> VesperResult<()> {
        self.shared.dispose().await
    }
}

enum Read {
    Reread,
    Upserts,
    Deletions,
}

/// One subscription to the changes affecting a filtered, selected set of
/// instances of a node.
///
/// Every flush turns the batches pulled so far into deltas: deletions first,
/// then upserts, each ordered by identifier. Delivery is at least once: a
/// flush is acknowledged to the broker only when the caller comes back for
/// more.
pub struct ChangesSubscriptionStream {
    pub(crate) shared: Arc<StreamShared>,
    connector: Arc<dyn Connector>,
    schema: Arc<Schema>,
    node: String,
    filter: Filter,
    selection: Selection,
    deletion_selection: Selection,
    tree: DependencyTree,
    /// Paths the filter reads; only these can move an instance out.
    filter_tree: DependencyTree,
    graph: FlattenedDependencyGraph,
    since: Timestamp,
    batches: Option<mpsc::Receiver<BrokerBatch>>,
    pending: VecDeque<ChangesSubscriptionDelta>,
    consumed_through: Option<MutationId>,
    aborted: watch::Receiver<bool>,
}

impl ChangesSubscriptionStream {
    pub fn new(
        broker: Arc<dyn Broker>,
        connector: Arc<dyn Connector>,
        schema: Arc<Schema>,
        input: ChangesSubscriptionInput,
    ) -> VesperResult<Self> {
        let ChangesSubscriptionInput {
            node,
            filter,
            selection,
            deletion_selection,
            since,
            id,
        } = input;
        schema.node(&node)?;
        selection.validate(&schema, &node)?;
        let identifier = Selection::identifier(&schema, &node)?;
        let deletion_selection = deletion_selection.unwrap_or_else(|| identifier.clone());
        deletion_selection.validate(&schema, &node)?;
        if !identifier.is_subset_of(&deletion_selection) {
            return Err(VesperError::definition(format!(
                "deletion selection of \"{node}\" must include its identifier"
            )));
        }
        if !deletion_selection.is_subset_of(&selection) {
            return Err(VesperError::definition(format!(
                "deletion selection of \"{node}\" must be part of its selection"
            )));
        }
        let filter_tree = filter.dependencies(&schema, &node)?;
        let tree = DependencyTree::merged(
            &node,
            [
                filter_tree.clone(),
                selection.dependencies(&schema, &node)?,
                deletion_selection.dependencies(&schema, &node)?,
            ],
        )?;
        tree.validate(&schema)?;
        let graph = tree.flatten(&schema)?;

        let (abort, aborted) = watch::channel(false);
        let (state, _) = watch::channel(StreamState::Created);
        let shared = Arc::new(StreamShared {
            id: id.unwrap_or_default(),
            broker,
            abort,
            state,
            subscribed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        });
        Ok(Self {
            shared,
            connector,
            schema,
            node,
            filter,
            selection,
            deletion_selection,
            tree,
            filter_tree,
            graph,
            since: since.unwrap_or_else(Timestamp::now),
            batches: None,
            pending: VecDeque::new(),
            consumed_through: None,
            aborted,
        })
    }

    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.borrow()
    }

    pub fn dependency_tree(&self) -> &DependencyTree {
        &self.tree
    }

    pub fn dependency_graph(&self) -> &FlattenedDependencyGraph {
        &self.graph
    }

    /// Registers with the broker; called by the first `next` if needed.
    pub async fn subscribe(&mut self) -> VesperResult<()> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(VesperError::Aborted);
        }
        if self.batches.is_some() {
            return Ok(());
        }
        let handle = self
            .shared
            .broker
            .subscribe(BrokerSubscription {
                id: self.shared.id,
                node: self.node.clone(),
                graph: self.graph.clone(),
                since: self.since,
            })
            .await?;
        self.shared.subscribed.store(true, Ordering::SeqCst);
        self.batches = Some(handle.batches);
        self.shared.set_state(StreamState::Subscribed);
        info!("stream: {} subscribed to \"{}\"", self.shared.id, self.node);
        Ok(())
    }

    pub async fn dispose(&self) -> VesperResult<()> {
        self.shared.dispose().await
    }

    pub(crate) fn aborted_signal(&self) -> watch::Receiver<bool> {
        self.aborted.clone()
    }

    fn is_aborted(&self) -> bool {
        *self.aborted.borrow()
    }

    /// Lets the broker move past the flushes already handed out.
    async fn acknowledge_consumed(&mut self) -> VesperResult<()> {
        let Some(through) = self.consumed_through else {
            return Ok(());
        };
        match self.shared.broker.acknowledge(self.shared.id, through).await {
            Ok(()) => {}
            Err(VesperError::NotFound { .. }) if self.shared.disposed.load(Ordering::SeqCst) => {}
            Err(err) => return Err(err),
        }
        self.consumed_through = None;
        Ok(())
    }

    /// One graph over every watched path and one over the filter's paths.
    fn graphs_for(&self, batch: &BrokerBatch) -> VesperResult<(DependentGraph, DependentGraph)> {
        Ok((
            DependentGraph::build(self.schema.clone(), &self.tree, &batch.changes)?,
            DependentGraph::build(self.schema.clone(), &self.filter_tree, &batch.changes)?,
        ))
    }

    /// The next delta, or `None` once the stream ended.
    pub async fn next(&mut self) -> VesperResult<Option<ChangesSubscriptionDelta>> {
        loop {
            if self.is_aborted() {
                return Ok(None);
            }
            if let Some(delta) = self.pending.pop_front() {
                return Ok(Some(delta));
            }
            match self.next_flush().await? {
                Some(deltas) => self.pending.extend(deltas),
                None => return Ok(None),
            }
        }
    }

    /// All deltas of the next flush, never empty; `None` once the stream ended.
    pub async fn next_flush(&mut self) -> VesperResult<Option<Vec<ChangesSubscriptionDelta>>> {
        if !self.pending.is_empty() {
            return Ok(Some(self.pending.drain(..).collect()));
        }
        self.subscribe().await?;
        let mut aborted = self.aborted.clone();
        loop {
            if self.is_aborted() {
                return Ok(None);
            }
            self.acknowledge_consumed().await?;
            let Some(batches) = self.batches.as_mut() else {
                return Ok(None);
            };
            let first = tokio::select! {
                batch = batches.recv() => batch,
                _ = aborted.wait_for(|aborted| *aborted) => return Ok(None),
            };
            let Some(first) = first else {
                warn!("stream: broker feed of {} closed", self.shared.id);
                return Ok(None);
            };
            self.shared.set_state(StreamState::Consuming);
            let mut later = Vec::new();
            while let Ok(batch) = batches.try_recv() {
                later.push(batch);
            }
            let (mut graph, mut filter_graph) = self.graphs_for(&first)?;
            let mut last = first.mutation_id;
            for batch in &later {
                let (more, more_filter) = self.graphs_for(batch)?;
                graph.merge(more)?;
                filter_graph.merge(more_filter)?;
                last = batch.mutation_id;
            }
            let deltas = if graph.is_empty() {
                Vec::new()
            } else {
                tokio::select! {
                    deltas = self.resolve(&graph, &filter_graph) => deltas?,
                    _ = aborted.wait_for(|aborted| *aborted) => return Ok(None),
                }
            };
            self.consumed_through = Some(last);
            let drained = self.batches.as_ref().map_or(true, |batches| batches.is_empty());
            if drained {
                self.shared.set_state(StreamState::Idle);
            }
            debug!(
                "stream: {} flushed {} deltas up to mutation {last}",
                self.shared.id,
                deltas.len()
            );
            if !deltas.is_empty() {
                return Ok(Some(deltas));
            }
        }
    }

    fn deletion_record(&self, id: &Record, old_value: &Record) -> Record {
        self.deletion_selection
            .pick(old_value)
            .unwrap_or_else(|| id.clone())
    }

    fn touches_selection(&self, update: &NodeUpdate) -> bool {
        update
            .updates_by_component
            .keys()
            .any(|component| self.selection.fields.contains_key(component))
    }

    fn key_of(&self, record: &Record) -> VesperResult<String> {
        let id = self.schema.node(&self.node)?.identifier_of(&self.schema, record)?;
        Ok(canonical_record_key(&id))
    }

    /// Classifies the hits of `graph` into deltas, reading the store only for
    /// what the change values cannot decide. Instances reached through edges
    /// are deletion candidates only when `filter_graph`, which follows the
    /// filter's own paths, reaches them.
    async fn resolve(
        &self,
        graph: &DependentGraph,
        filter_graph: &DependentGraph,
    ) -> VesperResult<Vec<ChangesSubscriptionDelta>> {
        let mut upserts: BTreeMap<String, Record> = BTreeMap::new();
        let mut deletions: BTreeMap<String, Record> = BTreeMap::new();
        let mut rereads: BTreeMap<String, (Record, Option<Record>)> = BTreeMap::new();

        for change in graph.root_changes() {
            let key = change.stringified_id().to_string();
            match change {
                NodeChange::Deletion(deletion) => {
                    if self.filter.execute(&deletion.old_value) != Some(false) {
                        deletions.insert(key, self.deletion_record(change.id(), &deletion.old_value));
                    }
                }
                NodeChange::Creation(creation) => match self.filter.execute(&creation.new_value) {
                    Some(false) => {}
                    Some(true) => match self.selection.pick(&creation.new_value) {
                        Some(picked) => {
                            upserts.insert(key, picked);
                        }
                        None => {
                            rereads.insert(key, (change.id().clone(), None));
                        }
                    },
                    None => {
                        rereads.insert(key, (change.id().clone(), None));
                    }
                },
                NodeChange::Update(update) => {
                    let before = self.filter.execute(&update.old_value);
                    let after = self.filter.execute(&update.new_value);
                    match (before, after) {
                        (Some(false), Some(false)) => {}
                        (_, Some(false)) => {
                            deletions
                                .insert(key, self.deletion_record(change.id(), &update.old_value));
                        }
                        (Some(true), Some(true)) if !self.touches_selection(update) => {}
                        (_, Some(true)) => match self.selection.pick(&update.new_value) {
                            Some(picked) => {
                                upserts.insert(key, picked);
                            }
                            None => {
                                rereads.insert(key, (change.id().clone(), Some(update.old_value.clone())));
                            }
                        },
                        (before, None) => {
                            let old_value = (before != Some(false)).then(|| update.old_value.clone());
                            rereads.insert(key, (change.id().clone(), old_value));
                        }
                    }
                }
            }
        }

        let mut reads = JoinSet::new();
        if !rereads.is_empty() {
            let ids = Filter::identities(
                &self.schema,
                &self.node,
                rereads.values().map(|(id, _)| id),
            )?;
            self.spawn_find(
                &mut reads,
                Read::Reread,
                Filter::and([self.filter.clone(), ids]),
                self.selection.clone(),
            );
        }
        let upserts_filter = graph.upsert_filter(&self.filter)?;
        if !upserts_filter.is_false() {
            self.spawn_find(&mut reads, Read::Upserts, upserts_filter, self.selection.clone());
        }
        let deletions_filter = filter_graph.deletion_filter(&self.filter)?;
        if !deletions_filter.is_false() {
            self.spawn_find(
                &mut reads,
                Read::Deletions,
                deletions_filter,
                self.deletion_selection.clone(),
            );
        }

        let mut errors = Vec::new();
        let mut reread = Vec::new();
        let mut indirect_upserts = Vec::new();
        let mut indirect_deletions = Vec::new();
        while let Some(joined) = reads.join_next().await {
            match joined {
                Ok((Read::Reread, Ok(records))) => reread = records,
                Ok((Read::Upserts, Ok(records))) => indirect_upserts = records,
                Ok((Read::Deletions, Ok(records))) => indirect_deletions = records,
                Ok((_, Err(err))) => errors.push(err),
                Err(err) => errors.push(VesperError::storage(format!("read task: {err}"))),
            }
        }
        VesperError::settle(errors)?;

        for record in reread {
            let key = self.key_of(&record)?;
            rereads.remove(&key);
            upserts.insert(key, record);
        }
        for (key, (id, old_value)) in rereads {
            if let Some(old_value) = old_value {
                deletions.insert(key, self.deletion_record(&id, &old_value));
            }
        }
        for record in indirect_upserts {
            upserts.insert(self.key_of(&record)?, record);
        }
        for record in indirect_deletions {
            deletions.entry(self.key_of(&record)?).or_insert(record);
        }
        deletions.retain(|key, _| !upserts.contains_key(key));

        Ok(deletions
            .into_values()
            .map(ChangesSubscriptionDelta::Deletion)
            .chain(upserts.into_values().map(ChangesSubscriptionDelta::Upsert))
            .collect())
    }

    fn spawn_find(
        &self,
        reads: &mut JoinSet<(Read, VesperResult<Vec<Record>>)>,
        read: Read,
        filter: Filter,
        selection: Selection,
    ) {
        let connector = self.connector.clone();
        let input = FindInput {
            node: self.node.clone(),
            filter,
            order_by: None,
            limit: None,
            selection,
        };
        reads.spawn(async move { (read, connector.find(input).await) });
    }
}
