//! HTTP API over a real listener on a random port.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use email_pipeline::api::{self, ApiState};
use email_pipeline::config::{PipelineConfig, QueueNames, QueuePolicy, TableNames};
use email_pipeline::extract::{Extraction, KeywordExtractor};
use email_pipeline::handlers::DiagnosticsLog;
use email_pipeline::pipeline::{Queues, catalog_vocabulary, load_supplier_catalog};
use email_pipeline::queue::AlarmLog;
use email_pipeline::storage::{MemoryObjectStore, ObjectStore};
use email_pipeline::store::{LibSqlStore, MatchRecord, ParsedEmailRecord, ResultStore};
use email_pipeline::{Components, Pipeline};

const RFQ_001: &[u8] = include_bytes!("../fixtures/emails/rfq-001.eml");

struct Server {
    base: String,
    client: reqwest::Client,
    store: Arc<LibSqlStore>,
    objects: Arc<MemoryObjectStore>,
    queues: Queues,
}

impl Server {
    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = self.client.get(format!("{}{path}", self.base)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn post(&self, path: &str) -> (StatusCode, Value) {
        let response = self.client.post(format!("{}{path}", self.base)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn put(&self, path: &str, body: &'static [u8]) -> (StatusCode, Value) {
        let response = self
            .client
            .put(format!("{}{path}", self.base))
            .body(body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }
}

async fn catalog_store() -> Arc<LibSqlStore> {
    let store = LibSqlStore::new_memory(TableNames::default()).await.unwrap();
    let catalog = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/suppliers.json");
    load_supplier_catalog(&store, &catalog).await.unwrap();
    Arc::new(store)
}

async fn listen(router: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(api::serve(listener, router, std::future::pending()));
    format!("http://{addr}")
}

/// API over stores with no consumers running, so records are seeded by hand.
async fn server() -> Server {
    let store = catalog_store().await;
    let objects = Arc::new(MemoryObjectStore::new("inbound-email"));
    let alarms = Arc::new(AlarmLog::new());
    let queues = Queues::new(&QueueNames::default(), QueuePolicy::default(), &alarms);
    let state = ApiState {
        store: store.clone(),
        objects: objects.clone(),
        queues: queues.with_dead_letters(),
        alarms,
        diagnostics: Arc::new(DiagnosticsLog::new()),
        ingest_prefix: "emails/".into(),
    };
    Server {
        base: listen(api::app(state)).await,
        client: reqwest::Client::new(),
        store,
        objects,
        queues,
    }
}

fn parsed(email_id: &str) -> ParsedEmailRecord {
    let extraction = Extraction {
        summary: "ball valves".into(),
        categories: vec!["valves".into()],
        ..Default::default()
    };
    ParsedEmailRecord::parsed(email_id, "inbound-email", format!("emails/{email_id}.eml"), extraction)
}

#[tokio::test]
async fn health() {
    let server = server().await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn unknown_email_is_not_found() {
    let server = server().await;
    let (status, body) = server.get("/api/emails/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = server.get("/api/emails/nope/matches").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn landed_but_unparsed_email_is_incomplete() {
    let server = server().await;
    server.objects.put("emails/pending.eml", RFQ_001).await.unwrap();

    let (status, body) = server.get("/api/emails/pending").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "processing_incomplete");
}

#[tokio::test]
async fn nested_keys_have_their_own_ids() {
    let server = server().await;
    server.objects.put("emails/alice/rfq-001.eml", RFQ_001).await.unwrap();

    let (status, body) = server.get("/api/emails/alice~rfq-001").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "processing_incomplete");

    let (status, _) = server.get("/api/emails/rfq-001").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = server.get("/api/emails/bob~rfq-001").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn matches_follow_record_status() {
    let server = server().await;
    server.store.upsert_parsed_email(&parsed("rfq-001")).await.unwrap();

    let (status, body) = server.get("/api/emails/rfq-001/matches").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "processing_incomplete");

    server
        .store
        .upsert_match(&MatchRecord {
            email_id: "rfq-001".into(),
            supplier_id: "sup-001".into(),
            supplier_name: "Rotterdam Valve Works".into(),
            confidence: 0.92,
            rank: 1,
            strategy: "fuzzy".into(),
            matched_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    server.store.mark_matched("rfq-001", 1).await.unwrap();

    let (status, body) = server.get("/api/emails/rfq-001/matches").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["emailId"], "rfq-001");
    assert_eq!(body["status"], "MATCHED");
    assert_eq!(body["matchCount"], 1);
    assert_eq!(body["matches"][0]["supplierId"], "sup-001");

    let (status, body) = server.get("/api/emails/rfq-001").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["matchCount"], 1);
    assert_eq!(body["extraction"]["categories"][0], "valves");
}

#[tokio::test]
async fn failed_email_has_empty_matches() {
    let server = server().await;
    let failed = ParsedEmailRecord::failed("junk", "inbound-email", "emails/junk.eml", "not a MIME message");
    server.store.upsert_parsed_email(&failed).await.unwrap();

    let (status, body) = server.get("/api/emails/junk/matches").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "FAILED");
    assert_eq!(body["matches"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn list_emails_filters_and_validates() {
    let server = server().await;
    server.store.upsert_parsed_email(&parsed("a")).await.unwrap();
    server.store.upsert_parsed_email(&parsed("b")).await.unwrap();
    server.store.mark_matched("b", 0).await.unwrap();

    let (status, body) = server.get("/api/emails").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);

    let (_, body) = server.get("/api/emails?status=matched").await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["emails"][0]["emailId"], "b");

    let (_, body) = server.get("/api/emails?limit=1").await;
    assert_eq!(body["count"], 1);

    let (status, body) = server.get("/api/emails?status=DONE").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = server.get("/api/emails?limit=lots").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn suppliers() {
    let server = server().await;
    let (status, body) = server.get("/api/suppliers").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 4);

    let (_, body) = server.get("/api/suppliers?activeOnly=true").await;
    assert_eq!(body["count"], 3);

    let (status, body) = server.get("/api/suppliers/sup-002").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Delta Fasteners");

    let (status, body) = server.get("/api/suppliers/sup-999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = server.get("/api/suppliers?activeOnly=maybe").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn object_upload() {
    let server = server().await;
    let (status, body) = server.put("/objects/emails/rfq-001.eml", RFQ_001).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["key"], "emails/rfq-001.eml");
    assert_eq!(body["size"], RFQ_001.len());
    assert_eq!(server.objects.get("emails/rfq-001.eml").await.unwrap(), RFQ_001);

    let (status, body) = server.put("/objects/emails/rfq-001.eml", RFQ_001).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    let (status, body) = server.put("/objects/emails/empty.eml", b"").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn ops_views() {
    let server = server().await;
    let (status, body) = server.get("/api/ops/queues").await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["queues"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|q| q["name"].as_str())
        .collect();
    assert_eq!(names.len(), 8);
    assert!(names.contains(&"parse-queue"));
    assert!(names.contains(&"parse-dead-letter-queue"));

    let (status, body) = server.get("/api/ops/alarms").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);

    let (status, body) = server.get("/api/ops/failures?limit=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn redrive_returns_dead_letters_to_their_queue() {
    let server = server().await;
    let dlq = server.queues.parse.dead_letter_queue().unwrap().clone();
    let dead = dlq.send(r#"{"detail":{"emailId":"rfq-001"}}"#).await;

    let (status, body) = server.post("/api/ops/queues/parse-queue/redrive").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue"], "parse-queue");
    assert_eq!(body["deadLetterQueue"], "parse-dead-letter-queue");
    assert_eq!(body["redriven"], 1);

    assert!(dlq.peek(10).await.is_empty());
    let requeued = server.queues.parse.peek(10).await;
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].message_id, dead.message_id);

    let (status, body) = server.post("/api/ops/queues/parse-queue/redrive").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["redriven"], 0);

    let (status, body) = server.post("/api/ops/queues/nope-queue/redrive").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = server.post("/api/ops/queues/parse-dead-letter-queue/redrive").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn upload_flows_through_to_matches() {
    let store = catalog_store().await;
    let vocabulary = catalog_vocabulary(store.as_ref()).await.unwrap();
    let (tx, notifications) = mpsc::channel(16);
    let objects = Arc::new(MemoryObjectStore::new("inbound-email").with_notifications(tx));
    let config = PipelineConfig {
        bucket: "inbound-email".into(),
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::start_with(
        config,
        Components {
            objects,
            notifications,
            store,
            extractor: Arc::new(KeywordExtractor::new(&vocabulary).unwrap()),
        },
    )
    .await
    .unwrap();
    let base = listen(api::app(pipeline.api_state())).await;
    let client = reqwest::Client::new();

    let response = client
        .put(format!("{base}/objects/emails/rfq-001.eml"))
        .body(RFQ_001)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let mut body = Value::Null;
    for _ in 0..200 {
        let response = client
            .get(format!("{base}/api/emails/rfq-001/matches"))
            .send()
            .await
            .unwrap();
        if response.status() == StatusCode::OK {
            body = response.json().await.unwrap();
            break;
        }
        assert_eq!(response.status(), StatusCode::CONFLICT);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(body["status"], "MATCHED");
    assert_eq!(body["matches"][0]["supplierId"], "sup-001");
    pipeline.shutdown().await;
}
