use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;
use tokio::time::timeout;
use vesper_store::{
    Broker, BrokerBatch, BrokerEvent, BrokerHandle, BrokerSubscription, ChangeAggregation,
    ChangeKind, Dependency, DependencyTree, LeafKind, MutationId, NodeChange, NodeDef, Schema,
    SqlBroker, SubscriptionId, Timestamp, Value, VesperConfig, VesperError, record,
};

fn schema() -> Arc<Schema> {
    Arc::new(
        Schema::builder()
            .node(
                NodeDef::new("Article")
                    .leaf("id", LeafKind::Int)
                    .leaf("title", LeafKind::String)
                    .leaf("status", LeafKind::String)
                    .unique(["id"]),
            )
            .node(
                NodeDef::new("Comment")
                    .leaf("id", LeafKind::Int)
                    .leaf("text", LeafKind::String)
                    .edge("article", "Article")
                    .unique(["id"]),
            )
            .reverse_edge("Article", "comments", "Comment", "article")
            .build()
            .expect("schema"),
    )
}

fn article(id: i64, title: &str, status: &str) -> vesper_store::Record {
    record([
        ("id", Value::Int(id)),
        ("title", title.into()),
        ("status", status.into()),
    ])
}

fn single(schema: &Arc<Schema>, change: NodeChange) -> ChangeAggregation {
    ChangeAggregation::create_from_iter(schema.clone(), [change]).expect("aggregation")
}

fn status_subscription(schema: &Schema, since: Timestamp) -> BrokerSubscription {
    let mut tree = DependencyTree::new("Article");
    tree.add(Dependency::Component("status".into()), None)
        .expect("tree");
    BrokerSubscription {
        id: SubscriptionId::new(),
        node: "Article".into(),
        graph: tree.flatten(schema).expect("flatten"),
        since,
    }
}

async fn next_batch(handle: &mut BrokerHandle) -> BrokerBatch {
    timeout(Duration::from_secs(5), handle.batches.recv())
        .await
        .expect("batch in time")
        .expect("channel open")
}

#[tokio::test]
async fn delivers_only_relevant_mutations_in_commit_order() {
    let dir = tempdir().expect("tempdir");
    let schema = schema();
    let broker = SqlBroker::connect_sqlite(&dir.path().join("vesper.sqlite"), schema.clone())
        .await
        .expect("broker");
    let mut handle = broker
        .subscribe(status_subscription(&schema, Timestamp::now()))
        .await
        .expect("subscribe");

    let created = NodeChange::creation(
        &schema,
        "Article",
        article(1, "Hello", "DRAFT"),
        json!({ "user": "ada" }),
        Timestamp::now(),
    )
    .expect("creation");
    let first = broker.publish(single(&schema, created)).await.expect("publish");

    let comment = NodeChange::creation(
        &schema,
        "Comment",
        record([
            ("id", Value::Int(9)),
            ("text", "nice".into()),
            ("article", record([("id", Value::Int(1))]).into()),
        ]),
        json!(null),
        Timestamp::now(),
    )
    .expect("comment");
    broker.publish(single(&schema, comment)).await.expect("publish");

    let retitled = NodeChange::update(
        &schema,
        "Article",
        article(1, "Hello", "DRAFT"),
        article(1, "Hello again", "DRAFT"),
        json!(null),
        Timestamp::now(),
    )
    .expect("update");
    broker.publish(single(&schema, retitled)).await.expect("publish");

    let published = NodeChange::update(
        &schema,
        "Article",
        article(1, "Hello again", "DRAFT"),
        article(1, "Hello again", "PUBLISHED"),
        json!(null),
        Timestamp::now(),
    )
    .expect("update");
    let last = broker.publish(single(&schema, published)).await.expect("publish");
    assert_eq!(last, MutationId(4));

    let batch = next_batch(&mut handle).await;
    assert_eq!(batch.mutation_id, first);
    assert_eq!(batch.changes.len(), 1);
    let change = batch.changes.changes().next().expect("change");
    assert_eq!(change.kind(), ChangeKind::Creation);
    assert_eq!(change.request_context(), &json!({ "user": "ada" }));
    assert_eq!(change.committed_at(), Some(batch.committed_at));

    let batch = next_batch(&mut handle).await;
    assert_eq!(batch.mutation_id, last);
    let change = batch.changes.changes().next().expect("change");
    assert_eq!(
        change.new_value().and_then(|value| value.get("status")),
        Some(&Value::from("PUBLISHED"))
    );

    // Delivered batches hold the cursor back until they are acknowledged.
    let report = broker.diagnose().await.expect("diagnose");
    assert!(report[0].last_visited < first);
    broker.acknowledge(handle.id, first).await.expect("ack");
    let report = broker.diagnose().await.expect("diagnose");
    assert_eq!(report[0].last_visited, MutationId(last.as_i64() - 1));
    assert_eq!(report[0].backlog, 1);

    broker.acknowledge(handle.id, last).await.expect("ack");
    let report = broker.diagnose().await.expect("diagnose");
    assert_eq!(report[0].last_visited, last);
    assert_eq!(report[0].backlog, 0);
    assert!(report[0].latency.is_none());
    assert!(!report[0].stale);
    assert_eq!(report[0].owner, broker.id());
    broker.close().await.expect("close");
}

#[tokio::test]
async fn watermark_skips_earlier_commits() {
    let dir = tempdir().expect("tempdir");
    let schema = schema();
    let broker = SqlBroker::connect_sqlite(&dir.path().join("vesper.sqlite"), schema.clone())
        .await
        .expect("broker");
    let before = NodeChange::creation(
        &schema,
        "Article",
        article(1, "Old", "DRAFT"),
        json!(null),
        Timestamp::now(),
    )
    .expect("creation");
    broker.publish(single(&schema, before)).await.expect("publish");

    let mut handle = broker
        .subscribe(status_subscription(&schema, Timestamp::now()))
        .await
        .expect("subscribe");
    let after = NodeChange::deletion(
        &schema,
        "Article",
        article(1, "Old", "DRAFT"),
        json!(null),
        Timestamp::now(),
    )
    .expect("deletion");
    let id = broker.publish(single(&schema, after)).await.expect("publish");

    let batch = next_batch(&mut handle).await;
    assert_eq!(batch.mutation_id, id);
    assert_eq!(
        batch.changes.changes().next().map(NodeChange::kind),
        Some(ChangeKind::Deletion)
    );
    broker.close().await.expect("close");
}

#[tokio::test]
async fn failpoint_rolls_back_the_whole_mutation() {
    let dir = tempdir().expect("tempdir");
    let schema = schema();
    let mut config =
        VesperConfig::default_sqlite(dir.path().join("vesper.sqlite").to_string_lossy());
    config.failpoints = Some(vec!["after_mutation_insert".to_string()]);
    let broker = SqlBroker::connect(&config, dir.path(), schema.clone())
        .await
        .expect("broker");
    let change = NodeChange::creation(
        &schema,
        "Article",
        article(1, "A", "DRAFT"),
        json!(null),
        Timestamp::now(),
    )
    .expect("creation");
    let err = broker
        .publish(single(&schema, change))
        .await
        .expect_err("failpoint");
    assert!(matches!(err, VesperError::Storage { .. }));
    assert_eq!(broker.last_mutation_id().await.expect("head"), MutationId(0));
    broker.close().await.expect("close");
}

#[tokio::test]
async fn rejects_empty_publishes_and_duplicate_subscriptions() {
    let dir = tempdir().expect("tempdir");
    let schema = schema();
    let broker = SqlBroker::connect_sqlite(&dir.path().join("vesper.sqlite"), schema.clone())
        .await
        .expect("broker");
    let empty = ChangeAggregation::new(schema.clone());
    assert!(matches!(
        broker.publish(empty).await,
        Err(VesperError::InvalidInput { .. })
    ));

    let subscription = status_subscription(&schema, Timestamp::now());
    let handle = broker
        .subscribe(subscription.clone())
        .await
        .expect("subscribe");
    assert!(matches!(
        broker.subscribe(subscription).await,
        Err(VesperError::Conflict { .. })
    ));
    assert_eq!(broker.local_subscriptions(), 1);
    broker.unsubscribe(handle.id).await.expect("unsubscribe");
    assert!(matches!(
        broker.unsubscribe(handle.id).await,
        Err(VesperError::NotFound { .. })
    ));
    assert!(broker.diagnose().await.expect("diagnose").is_empty());
    broker.close().await.expect("close");
}

#[tokio::test]
async fn failing_pulls_are_reported_as_events() {
    let dir = tempdir().expect("tempdir");
    let schema = schema();
    let mut config =
        VesperConfig::default_sqlite(dir.path().join("vesper.sqlite").to_string_lossy());
    config.failpoints = Some(vec!["pull".to_string()]);
    let broker = SqlBroker::connect(&config, dir.path(), schema.clone())
        .await
        .expect("broker");
    let mut events = broker.events();
    let handle = broker
        .subscribe(status_subscription(&schema, Timestamp::now()))
        .await
        .expect("subscribe");

    let failure = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(BrokerEvent::PullFailed { id, message }) => break (id, message),
                Ok(_) => continue,
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    })
    .await
    .expect("failure in time");
    assert_eq!(failure.0, handle.id);
    assert!(failure.1.contains("failpoint pull"));

    broker.unsubscribe(handle.id).await.expect("unsubscribe");
    broker.close().await.expect("close");
}
