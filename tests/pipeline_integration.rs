//! Integration tests for the library surface.
//!
//! These tests prove that custom engine drivers and task handlers plug into
//! the real pipeline, scheduler, SQLite store, and HTTP server.

use anyhow::Result;
use async_trait::async_trait;
use report_harness::config::{Config, FilesConfig, PoolConfig};
use report_harness::connection::{
    ConnectionHandle, ConnectionManager, EngineDriver, EngineRegistry, RelationalClient,
};
use report_harness::db;
use report_harness::error::ReportError;
use report_harness::migrate;
use report_harness::models::{
    AggregateOp, ConnectionDescriptor, DataSource, FileDescriptor, ProjectionSpec,
    RelationalDescriptor, Report, RetrievalSpec, Row, RunStatus, ScheduledTask, SourceKind,
    TabularResult, TaskType,
};
use report_harness::pipeline::ReportPipeline;
use report_harness::scheduler::{HandlerRegistry, Scheduler, TaskContext, TaskHandler};
use report_harness::server::{router, AppState};
use report_harness::store::{SqliteStore, Store};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ─── Test engine ────────────────────────────────────────────────────

/// An engine whose "database" answers every query with the same three rows.
struct StaticClient {
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl RelationalClient for StaticClient {
    fn engine(&self) -> &str {
        "static"
    }

    async fn ping(&self) -> report_harness::error::Result<()> {
        Ok(())
    }

    async fn query(&self, sql: &str) -> report_harness::error::Result<TabularResult> {
        if sql.contains("broken") {
            return Err(ReportError::Retrieval("syntax error".to_string()));
        }
        let rows: Vec<Row> = [("east", 3), ("west", 4), ("east", 5)]
            .iter()
            .map(|(region, amount)| {
                let mut row = Row::new();
                row.insert("region".to_string(), json!(region));
                row.insert("amount".to_string(), json!(amount));
                row
            })
            .collect();
        Ok(TabularResult::new(
            vec!["region".to_string(), "amount".to_string()],
            rows,
        ))
    }

    async fn close(&self) -> report_harness::error::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct StaticDriver {
    builds: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl EngineDriver for StaticDriver {
    fn name(&self) -> &str {
        "static"
    }

    async fn build(
        &self,
        _descriptor: &RelationalDescriptor,
        _pool: &PoolConfig,
    ) -> report_harness::error::Result<ConnectionHandle> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StaticClient {
            closed: self.closed.clone(),
        }))
    }
}

// ─── Test handler ───────────────────────────────────────────────────

struct CountingHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for CountingHandler {
    fn task_type(&self) -> &str {
        "HEARTBEAT"
    }

    async fn run(&self, _task: &ScheduledTask, _ctx: &TaskContext) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

struct Harness {
    _tmp: TempDir,
    pipeline: Arc<ReportPipeline>,
    builds: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

fn warehouse() -> DataSource {
    DataSource {
        id: "warehouse".to_string(),
        name: "Warehouse".to_string(),
        kind: SourceKind::RelationalQuery,
        descriptor: ConnectionDescriptor::Relational(RelationalDescriptor {
            engine: "static".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            user: "reporter".to_string(),
            password: String::new(),
            database: "dw".to_string(),
            ssl: false,
        }),
        status: "active".to_string(),
        created_at: 0,
        updated_at: None,
    }
}

fn sales_file() -> DataSource {
    DataSource {
        id: "sales".to_string(),
        name: "Sales".to_string(),
        kind: SourceKind::FlatFile,
        descriptor: ConnectionDescriptor::File(FileDescriptor {
            path: "sales.csv".into(),
            sheet_name: None,
            delimiter: ',',
            has_header: true,
        }),
        status: "active".to_string(),
        created_at: 0,
        updated_at: None,
    }
}

fn amount_by_region(op: AggregateOp) -> ProjectionSpec {
    ProjectionSpec {
        selected_columns: vec!["region".to_string(), "amount".to_string()],
        aggregates: [("amount".to_string(), op)].into_iter().collect(),
        group_by: Some("region".to_string()),
    }
}

async fn setup() -> Harness {
    let tmp = TempDir::new().unwrap();
    std::fs::write(
        tmp.path().join("sales.csv"),
        "region,sales\nN,10\nS,7\nN,5\n",
    )
    .unwrap();

    let mut config = Config::with_db_path(tmp.path().join("data/rpt.sqlite"));
    config.files = FilesConfig {
        root: Some(tmp.path().to_path_buf()),
    };
    migrate::run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));

    store.save_data_source(&warehouse()).await.unwrap();
    store.save_data_source(&sales_file()).await.unwrap();
    store
        .save_report(&Report {
            id: "east-west".to_string(),
            name: "Amount by region".to_string(),
            data_source_id: "warehouse".to_string(),
            retrieval: RetrievalSpec {
                query_text: Some("SELECT region, amount FROM orders".to_string()),
                ..RetrievalSpec::default()
            },
            projection: amount_by_region(AggregateOp::Sum),
            chart_type: Some("bar".to_string()),
        })
        .await
        .unwrap();
    store
        .save_report(&Report {
            id: "sales-by-region".to_string(),
            name: "Sales by region".to_string(),
            data_source_id: "sales".to_string(),
            retrieval: RetrievalSpec::default(),
            projection: ProjectionSpec {
                selected_columns: vec!["region".to_string(), "sales".to_string()],
                aggregates: [("sales".to_string(), AggregateOp::Sum)].into_iter().collect(),
                group_by: None,
            },
            chart_type: None,
        })
        .await
        .unwrap();

    let builds = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let mut engines = EngineRegistry::new();
    engines.register(Box::new(StaticDriver {
        builds: builds.clone(),
        closed: closed.clone(),
    }));

    let pipeline = Arc::new(ReportPipeline::new(
        store,
        Arc::new(ConnectionManager::new(engines, PoolConfig::default())),
        config.files.clone(),
    ));

    Harness {
        _tmp: tmp,
        pipeline,
        builds,
        closed,
    }
}

fn task(id: &str, cron: &str, task_type: TaskType, target: Option<&str>) -> ScheduledTask {
    ScheduledTask {
        id: id.to_string(),
        name: id.to_string(),
        cron_expression: cron.to_string(),
        task_type,
        target_id: target.map(str::to_string),
        is_active: true,
    }
}

// ─── Pipeline ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_relational_report_through_custom_engine() {
    let h = setup().await;

    let result = h.pipeline.run_report("east-west").await.unwrap();
    assert_eq!(result.columns, vec!["region", "amount"]);
    assert_eq!(
        serde_json::to_value(&result.rows).unwrap(),
        json!([{ "region": "east", "amount": 8 }, { "region": "west", "amount": 4 }])
    );

    // Second run reuses the cached pool.
    h.pipeline.run_report("east-west").await.unwrap();
    assert_eq!(h.builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_editing_source_rotates_connection() {
    let h = setup().await;

    h.pipeline.run_report("east-west").await.unwrap();
    let before = h.pipeline.connections().cached_keys();
    assert_eq!(before.len(), 1);

    let stored = h.pipeline.load_source("warehouse").await.unwrap();
    h.pipeline.store().save_data_source(&stored).await.unwrap();

    h.pipeline.run_report("east-west").await.unwrap();
    let after = h.pipeline.connections().cached_keys();
    assert_eq!(after.len(), 1);
    assert_ne!(before, after);
    assert_eq!(h.builds.load(Ordering::SeqCst), 2);

    // The superseded pool closes in the background.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.closed.load(Ordering::SeqCst), 1);

    assert_eq!(h.pipeline.connections().release_all().await, 1);
    assert_eq!(h.closed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_relational_adhoc_requires_query_text() {
    let h = setup().await;

    let spec = RetrievalSpec {
        source_id: "warehouse".to_string(),
        query_text: Some("   ".to_string()),
        ..RetrievalSpec::default()
    };
    let err = h
        .pipeline
        .run_adhoc(&spec, &ProjectionSpec::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ReportError::MissingQueryText { .. }));
    assert_eq!(h.builds.load(Ordering::SeqCst), 0);
}

// ─── Scheduler ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_custom_handler_runs_on_schedule() {
    let h = setup().await;
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handlers = HandlerRegistry::with_builtins();
    handlers.register(Box::new(CountingHandler {
        calls: calls.clone(),
    }));

    h.pipeline
        .store()
        .save_task(&task("beat", "* * * * * *", TaskType::from("HEARTBEAT".to_string()), None))
        .await
        .unwrap();

    let scheduler = Scheduler::new(h.pipeline.clone(), handlers);
    assert_eq!(scheduler.init().await, 1);

    tokio::time::sleep(Duration::from_millis(2300)).await;
    assert_eq!(scheduler.shutdown().await, 1);
    assert!(calls.load(Ordering::SeqCst) >= 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn test_scheduled_report_generation_records_runs() {
    let h = setup().await;

    h.pipeline
        .store()
        .save_task(&task(
            "sales-every-second",
            "* * * * * *",
            TaskType::ReportGeneration,
            Some("sales-by-region"),
        ))
        .await
        .unwrap();

    let scheduler = Scheduler::new(h.pipeline.clone(), HandlerRegistry::with_builtins());
    scheduler.init().await;
    tokio::time::sleep(Duration::from_millis(2300)).await;
    scheduler.shutdown().await;

    let runs = h
        .pipeline
        .store()
        .list_report_runs("sales-by-region", 10)
        .await
        .unwrap();
    assert!(!runs.is_empty());
    let run = &runs[0];
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.row_count, Some(2));
    assert_eq!(run.task_id.as_deref(), Some("sales-every-second"));
}

// ─── HTTP ───────────────────────────────────────────────────────────

async fn serve(h: &Harness) -> (String, Arc<Scheduler>) {
    let scheduler = Arc::new(Scheduler::new(
        h.pipeline.clone(),
        HandlerRegistry::with_builtins(),
    ));
    let app = router(AppState {
        pipeline: h.pipeline.clone(),
        scheduler: scheduler.clone(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), scheduler)
}

#[tokio::test]
async fn test_http_health_and_reports() {
    let h = setup().await;
    let (base, _scheduler) = serve(&h).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = client
        .post(format!("{}/reports/sales-by-region/run", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["rows"],
        json!([{ "region": "N", "sales": 15 }, { "region": "S", "sales": 7 }])
    );

    let resp = client
        .post(format!("{}/reports/run", base))
        .json(&json!({
            "retrieval": { "source_id": "warehouse", "query_text": "SELECT * FROM orders" },
            "projection": {
                "selected_columns": ["region", "amount"],
                "aggregates": { "amount": "MAX" }
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["rows"],
        json!([{ "region": "east", "amount": 5 }, { "region": "west", "amount": 4 }])
    );
}

#[tokio::test]
async fn test_http_error_contract() {
    let h = setup().await;
    let (base, _scheduler) = serve(&h).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/reports/nope/run", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .post(format!("{}/reports/run", base))
        .json(&json!({ "retrieval": { "source_id": "warehouse" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "missing_query_text");

    let resp = client
        .post(format!("{}/reports/run", base))
        .json(&json!({ "retrieval": { "source_id": "warehouse", "query_text": "broken" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "retrieval_error");

    let resp = client
        .post(format!("{}/reports/run", base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_http_schedule_reload() {
    let h = setup().await;
    let (base, _scheduler) = serve(&h).await;
    let client = reqwest::Client::new();

    let store = h.pipeline.store();
    store
        .save_task(&task("hourly", "0 * * * *", TaskType::TestTask, None))
        .await
        .unwrap();
    store
        .save_task(&task("broken", "61 * * * *", TaskType::TestTask, None))
        .await
        .unwrap();

    let resp = client
        .post(format!("{}/schedules/reload", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["active"], 1);
    assert_eq!(body["jobs"][0]["task_id"], "hourly");
    assert!(body["jobs"][0]["next_fire"].is_string());

    store.delete_task("hourly").await.unwrap();
    client
        .post(format!("{}/schedules/reload", base))
        .send()
        .await
        .unwrap();

    let body: Value = client
        .get(format!("{}/schedules/active", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["active"], 0);
}
