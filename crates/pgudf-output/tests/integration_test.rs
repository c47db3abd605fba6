use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use pgudf_output::{
    ConnectProperties, Connector, FunctionName, LoadConfig, LoadOrchestrator, MemoryDriver,
    SqlParam,
};
use pgudf_page::{ColumnType, Page, PageBuilder, Schema, Value};

const TASK: &str = r"
host: db.internal
user: loader
database: warehouse
schema: staging
function: |
  BEGIN
    INSERT INTO events VALUES (id, name, created_at);
  END;
";

fn schema() -> Arc<Schema> {
    Arc::new(
        Schema::builder()
            .column("id", ColumnType::Integer64)
            .column("Name", ColumnType::Text)
            .column("created_at", ColumnType::Timestamp)
            .build()
            .unwrap(),
    )
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2015, 3, 21, hour, 0, 0).unwrap()
}

fn page(schema: &Arc<Schema>, rows: &[(i64, Option<&str>, u32)]) -> Page {
    let mut builder = PageBuilder::new(Arc::clone(schema));
    for (id, name, hour) in rows {
        builder
            .add_record([Value::from(*id), Value::from(*name), Value::from(at(*hour))])
            .unwrap();
    }
    builder.build()
}

fn orchestrator(driver: &MemoryDriver) -> LoadOrchestrator {
    let config = LoadConfig::from_yaml_str(TASK).unwrap();
    let connector = Connector::new(
        Arc::new(driver.clone()),
        config.connect_properties(),
        config.namespace().map(str::to_string),
    );
    LoadOrchestrator::new(config, schema(), connector)
}

fn transaction_time() -> DateTime<Utc> {
    Utc.timestamp_opt(1_426_896_000, 123_456_789).unwrap()
}

#[tokio::test]
async fn test_end_to_end_load_binds_in_column_order() {
    let driver = MemoryDriver::new();
    let orchestrator = orchestrator(&driver);
    let schema = schema();
    let pages = vec![
        page(&schema, &[(1, Some("alpha"), 1), (2, None, 2)]),
        page(&schema, &[(3, Some("gamma"), 3), (4, Some("delta"), 4)]),
    ];

    let report = orchestrator
        .transaction(transaction_time(), vec![pages])
        .await
        .unwrap();

    assert_eq!(report.function.as_str(), "fn_00000000550cb480075bcd15");
    assert_eq!(report.records, 4);
    assert_eq!(report.partitions.len(), 1);
    assert_eq!(report.partitions[0].pages, 2);

    let calls = driver.calls().await;
    assert_eq!(calls.len(), 4);
    assert_eq!(
        calls[1].params,
        vec![
            SqlParam::Int8(2),
            SqlParam::Null(ColumnType::Text),
            SqlParam::Timestamp(at(2).naive_utc()),
        ]
    );
    let ids: Vec<_> = calls.iter().map(|call| call.params[0].clone()).collect();
    assert_eq!(
        ids,
        vec![
            SqlParam::Int8(1),
            SqlParam::Int8(2),
            SqlParam::Int8(3),
            SqlParam::Int8(4)
        ]
    );
    assert_eq!(driver.inspect(|db| db.batch_executions()).await, 1);
}

#[tokio::test]
async fn test_function_lifecycle_statements() {
    let driver = MemoryDriver::new();
    let orchestrator = orchestrator(&driver);
    let schema = schema();
    orchestrator
        .transaction(
            transaction_time(),
            vec![vec![page(&schema, &[(1, Some("a"), 1)])]],
        )
        .await
        .unwrap();

    let statements = driver.statements().await;
    let create = statements
        .iter()
        .position(|sql| sql.starts_with("CREATE OR REPLACE FUNCTION"))
        .unwrap();
    let call = statements
        .iter()
        .position(|sql| sql.starts_with("SELECT"))
        .unwrap();
    let drop = statements
        .iter()
        .position(|sql| sql.starts_with("DROP FUNCTION IF EXISTS"))
        .unwrap();
    assert!(create < call && call < drop);

    assert!(statements[create].contains("(\"id\" bigint, \"name\" text, \"created_at\" timestamp)"));
    assert!(statements[create].contains("$$ LANGUAGE plpgsql"));
    assert_eq!(
        statements[drop],
        "DROP FUNCTION IF EXISTS \"fn_00000000550cb480075bcd15\"(bigint, text, timestamp)"
    );

    let search_paths = statements
        .iter()
        .filter(|sql| *sql == "SET search_path TO 'staging'")
        .count();
    assert_eq!(search_paths, 3);
    assert!(driver.inspect(|db| db.functions().is_empty()).await);
    assert_eq!(driver.inspect(|db| db.open_connections()).await, 0);
}

#[tokio::test]
async fn test_partitions_run_concurrently_with_one_batch_each() {
    let driver = MemoryDriver::new();
    let orchestrator = orchestrator(&driver);
    let schema = schema();
    let partitions = (0..4)
        .map(|partition| {
            let base = partition * 10;
            vec![
                page(&schema, &[(base, Some("x"), 1)]),
                page(&schema, &[(base + 1, None, 2)]),
            ]
        })
        .collect();

    let report = orchestrator
        .transaction(transaction_time(), partitions)
        .await
        .unwrap();

    let order: Vec<_> = report.partitions.iter().map(|p| p.partition).collect();
    assert_eq!(order, vec![0, 1, 2, 3]);
    assert_eq!(report.records, 8);
    assert_eq!(driver.calls().await.len(), 8);
    assert_eq!(driver.inspect(|db| db.batch_executions()).await, 4);
}

#[tokio::test]
async fn test_create_function_twice_is_idempotent() {
    let driver = MemoryDriver::new();
    let schema = schema();
    let properties = ConnectProperties::new("memory", 5432, "test", "loader", "");
    let connector = Connector::new(Arc::new(driver.clone()), properties, None);
    let mut handle = connector.connect(true).await.unwrap();

    let name = FunctionName::new(0x1122_3344_5566_7788, 0x99aa_bbcc);
    handle
        .create_function(name.as_str(), &schema, "BEGIN END;", "plpgsql")
        .await
        .unwrap();
    handle
        .create_function(name.as_str(), &schema, "BEGIN END;", "plpgsql")
        .await
        .unwrap();
    handle.close().await.unwrap();

    let functions = driver.inspect(|db| db.functions().len()).await;
    assert_eq!(functions, 1);
    let def = driver.function("fn_112233445566778899aabbcc").await.unwrap();
    assert_eq!(def.argument_names, vec!["id", "name", "created_at"]);
}

#[tokio::test]
async fn test_drop_of_never_created_function_succeeds() {
    let driver = MemoryDriver::new();
    let orchestrator = orchestrator(&driver);
    let name: FunctionName = "fn_000000000000000000000001".parse().unwrap();
    orchestrator.cleanup_function(&name).await.unwrap();
    assert_eq!(driver.inspect(|db| db.open_connections()).await, 0);
}
