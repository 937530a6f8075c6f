use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::{TempDir, tempdir};
use tokio::time::timeout;
use vesper::model::{LeafKind, NodeDef, Record, Value, record};
use vesper::{
    ChangesSubscriptionDelta, ChangesSubscriptionInput, ChangesSubscriptionStream, Connector,
    Filter, MemoryConnector, MutationContext, Schema, Selection, SqlBroker, StreamState,
    VesperError,
};

struct Fixture {
    _dir: TempDir,
    schema: Arc<Schema>,
    broker: SqlBroker,
    connector: Arc<MemoryConnector>,
}

fn schema() -> Arc<Schema> {
    Arc::new(
        Schema::builder()
            .node(
                NodeDef::new("Article")
                    .leaf("id", LeafKind::Int)
                    .leaf("title", LeafKind::String)
                    .leaf("status", LeafKind::String)
                    .leaf("views", LeafKind::Int)
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

async fn fixture() -> Fixture {
    let dir = tempdir().expect("tempdir");
    let schema = schema();
    let broker = SqlBroker::connect_sqlite(&dir.path().join("vesper.sqlite"), schema.clone())
        .await
        .expect("broker");
    let connector = Arc::new(MemoryConnector::new(schema.clone()));
    Fixture {
        _dir: dir,
        schema,
        broker,
        connector,
    }
}

impl Fixture {
    async fn stream(&self, input: ChangesSubscriptionInput) -> ChangesSubscriptionStream {
        let mut stream = ChangesSubscriptionStream::new(
            Arc::new(self.broker.clone()),
            self.connector.clone(),
            self.schema.clone(),
            input,
        )
        .expect("stream");
        stream.subscribe().await.expect("subscribe");
        stream
    }

    fn mutation(&self) -> MutationContext {
        MutationContext::new(self.schema.clone(), json!({ "user": "ada" }))
    }

    async fn create_article(&self, id: i64, title: &str, status: &str) {
        let ctx = self.mutation();
        self.connector
            .create(
                &ctx,
                "Article",
                record([
                    ("id", Value::Int(id)),
                    ("title", title.into()),
                    ("status", status.into()),
                    ("views", Value::Int(0)),
                ]),
            )
            .await
            .expect("create");
        ctx.commit(&self.broker).await.expect("commit");
    }

    async fn update_article(&self, id: i64, patch: Record) {
        let ctx = self.mutation();
        let updated = self
            .connector
            .update(&ctx, "Article", Filter::eq("id", id), patch)
            .await
            .expect("update");
        assert_eq!(updated.len(), 1);
        ctx.commit(&self.broker).await.expect("commit");
    }

    async fn create_comment(&self, id: i64, article: i64, text: &str) {
        let ctx = self.mutation();
        self.connector
            .create(
                &ctx,
                "Comment",
                record([
                    ("id", Value::Int(id)),
                    ("text", text.into()),
                    ("article", record([("id", Value::Int(article))]).into()),
                ]),
            )
            .await
            .expect("comment");
        ctx.commit(&self.broker).await.expect("commit");
    }

    async fn delete_article(&self, id: i64) {
        let ctx = self.mutation();
        self.connector
            .delete(&ctx, "Article", Filter::eq("id", id))
            .await
            .expect("delete");
        ctx.commit(&self.broker).await.expect("commit");
    }
}

async fn next_delta(stream: &mut ChangesSubscriptionStream) -> ChangesSubscriptionDelta {
    timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("delta in time")
        .expect("next")
        .expect("stream open")
}

fn published() -> Filter {
    Filter::eq("status", "PUBLISHED")
}

#[tokio::test]
async fn follows_an_article_in_and_out_of_the_result_set() {
    let fx = fixture().await;
    let mut stream = fx
        .stream(ChangesSubscriptionInput::new(
            "Article",
            published(),
            Selection::new().components(["id", "title"]),
        ))
        .await;
    assert_eq!(stream.state(), StreamState::Subscribed);

    fx.create_article(1, "Hello", "DRAFT").await;
    fx.update_article(1, record([("status", "PUBLISHED".into())]))
        .await;
    assert_eq!(
        next_delta(&mut stream).await,
        ChangesSubscriptionDelta::Upsert(record([
            ("id", Value::Int(1)),
            ("title", "Hello".into()),
        ]))
    );

    fx.update_article(1, record([("views", Value::Int(42))])).await;
    fx.delete_article(1).await;
    assert_eq!(
        next_delta(&mut stream).await,
        ChangesSubscriptionDelta::Deletion(record([("id", Value::Int(1))]))
    );

    stream.handle().wait_for_idle().await.expect("idle");
    stream.dispose().await.expect("dispose");
    fx.broker.close().await.expect("close");
}

#[tokio::test]
async fn leaving_the_filter_reports_the_deletion_selection() {
    let fx = fixture().await;
    let mut stream = fx
        .stream(
            ChangesSubscriptionInput::new(
                "Article",
                published(),
                Selection::new().components(["id", "title", "status"]),
            )
            .deletion_selection(Selection::new().components(["id", "title"])),
        )
        .await;

    fx.create_article(3, "Launch", "PUBLISHED").await;
    assert_eq!(
        next_delta(&mut stream).await,
        ChangesSubscriptionDelta::Upsert(record([
            ("id", Value::Int(3)),
            ("title", "Launch".into()),
            ("status", "PUBLISHED".into()),
        ]))
    );

    fx.update_article(3, record([("status", "ARCHIVED".into())]))
        .await;
    let delta = next_delta(&mut stream).await;
    assert!(delta.is_deletion());
    assert_eq!(
        delta.record(),
        &record([("id", Value::Int(3)), ("title", "Launch".into())])
    );

    stream.dispose().await.expect("dispose");
    fx.broker.close().await.expect("close");
}

#[tokio::test]
async fn changes_reached_through_reverse_edges_are_read_back() {
    let fx = fixture().await;
    let mut stream = fx
        .stream(ChangesSubscriptionInput::new(
            "Article",
            Filter::reverse_edge("comments", Filter::True),
            Selection::new().components(["id", "title"]),
        ))
        .await;

    fx.create_article(5, "Quiet", "PUBLISHED").await;
    fx.create_comment(50, 5, "first").await;

    assert_eq!(
        next_delta(&mut stream).await,
        ChangesSubscriptionDelta::Upsert(record([
            ("id", Value::Int(5)),
            ("title", "Quiet".into()),
        ]))
    );

    stream.dispose().await.expect("dispose");
    fx.broker.close().await.expect("close");
}

#[tokio::test]
async fn editing_a_selected_field_of_a_matching_article_upserts_it() {
    let fx = fixture().await;
    let mut stream = fx
        .stream(ChangesSubscriptionInput::new(
            "Article",
            published(),
            Selection::new().components(["id", "title"]),
        ))
        .await;

    fx.create_article(1, "Hello", "PUBLISHED").await;
    assert_eq!(
        next_delta(&mut stream).await,
        ChangesSubscriptionDelta::Upsert(record([
            ("id", Value::Int(1)),
            ("title", "Hello".into()),
        ]))
    );

    fx.update_article(1, record([("title", "Hello again".into())]))
        .await;
    assert_eq!(
        next_delta(&mut stream).await,
        ChangesSubscriptionDelta::Upsert(record([
            ("id", Value::Int(1)),
            ("title", "Hello again".into()),
        ]))
    );

    stream.dispose().await.expect("dispose");
    fx.broker.close().await.expect("close");
}

#[tokio::test]
async fn articles_that_never_match_stay_silent() {
    let fx = fixture().await;
    let mut stream = fx
        .stream(ChangesSubscriptionInput::new(
            "Article",
            published(),
            Selection::new().components(["id", "title"]),
        ))
        .await;

    fx.create_article(2, "Draft", "DRAFT").await;
    fx.update_article(2, record([("status", "ARCHIVED".into())]))
        .await;
    fx.create_article(3, "Marker", "PUBLISHED").await;

    // The archived draft produced nothing, so the marker comes first.
    assert_eq!(
        next_delta(&mut stream).await,
        ChangesSubscriptionDelta::Upsert(record([
            ("id", Value::Int(3)),
            ("title", "Marker".into()),
        ]))
    );

    stream.dispose().await.expect("dispose");
    fx.broker.close().await.expect("close");
}

#[tokio::test]
async fn selected_children_of_a_non_matching_article_cause_no_deletion() {
    let fx = fixture().await;
    let mut stream = fx
        .stream(ChangesSubscriptionInput::new(
            "Article",
            published(),
            Selection::new().component("id").reverse_edge(
                "comments",
                Selection::new().component("text"),
                None,
            ),
        ))
        .await;

    fx.create_article(1, "Draft", "DRAFT").await;
    fx.create_comment(9, 1, "early feedback").await;
    fx.create_article(2, "Marker", "PUBLISHED").await;

    let delta = next_delta(&mut stream).await;
    assert!(!delta.is_deletion(), "unexpected deletion {delta:?}");
    assert_eq!(delta.record().get("id"), Some(&Value::Int(2)));

    stream.dispose().await.expect("dispose");
    fx.broker.close().await.expect("close");
}

#[tokio::test]
async fn disposing_through_a_handle_ends_a_pending_next() {
    let fx = fixture().await;
    let mut stream = fx
        .stream(ChangesSubscriptionInput::new(
            "Article",
            published(),
            Selection::new().component("id"),
        ))
        .await;
    let handle = stream.handle();
    let waiting = tokio::spawn(async move { stream.next().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.dispose().await.expect("dispose");
    handle.dispose().await.expect("dispose again");
    let ended = timeout(Duration::from_secs(5), waiting)
        .await
        .expect("ends in time")
        .expect("join")
        .expect("next");
    assert!(ended.is_none());
    assert_eq!(handle.state(), StreamState::Disposed);
    assert_eq!(fx.broker.local_subscriptions(), 0);
    fx.broker.close().await.expect("close");
}

#[tokio::test]
async fn a_failing_consumer_aborts_only_its_stream() {
    let fx = fixture().await;
    let failing = fx
        .stream(ChangesSubscriptionInput::new(
            "Article",
            published(),
            Selection::new().component("id"),
        ))
        .await;
    let mut sibling = fx
        .stream(ChangesSubscriptionInput::new(
            "Article",
            published(),
            Selection::new().component("id"),
        ))
        .await;

    let consumer = tokio::spawn(failing.for_each(2, |delta| async move {
        match delta {
            ChangesSubscriptionDelta::Upsert(_) => Err(String::from("boom")),
            ChangesSubscriptionDelta::Deletion(_) => Ok(()),
        }
    }));

    fx.create_article(7, "Seven", "PUBLISHED").await;
    let outcome = timeout(Duration::from_secs(5), consumer)
        .await
        .expect("consumer ends")
        .expect("join");
    assert!(matches!(outcome, Err(VesperError::Delivery { .. })));

    assert_eq!(
        next_delta(&mut sibling).await,
        ChangesSubscriptionDelta::Upsert(record([("id", Value::Int(7))]))
    );
    assert_eq!(fx.broker.local_subscriptions(), 1);

    sibling.dispose().await.expect("dispose");
    fx.broker.close().await.expect("close");
}

#[tokio::test]
async fn by_batch_hands_over_whole_flushes() {
    let fx = fixture().await;
    let stream = fx
        .stream(ChangesSubscriptionInput::new(
            "Article",
            published(),
            Selection::new().component("id"),
        ))
        .await;
    let handle = stream.handle();
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let consumer = tokio::spawn(stream.by_batch(1, move |batch| {
        let seen_tx = seen_tx.clone();
        async move {
            seen_tx.send(batch).map_err(|err| err.to_string())
        }
    }));

    fx.create_article(8, "Eight", "PUBLISHED").await;
    let batch = timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("batch in time")
        .expect("batch");
    assert_eq!(
        batch,
        vec![ChangesSubscriptionDelta::Upsert(record([("id", Value::Int(8))]))]
    );

    handle.dispose().await.expect("dispose");
    timeout(Duration::from_secs(5), consumer)
        .await
        .expect("consumer ends")
        .expect("join")
        .expect("clean end");
    fx.broker.close().await.expect("close");
}
