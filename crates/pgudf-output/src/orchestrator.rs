//! Load lifecycle: create the function, stream partitions, drop the function.
//!
//! ```text
//! Created -> FunctionReady -> Streaming -> Finalizing -> Done
//!                  \______________\______> Aborted
//! ```
//!
//! Every partition runs on its own connection in manual-commit mode and shares
//! nothing with the others except the function name and record schema.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use pgudf_page::{Page, Schema};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::LoadConfig;
use crate::connection::{ConnectionHandle, PreparedCall};
use crate::connector::Connector;
use crate::function_name::FunctionName;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadState {
    Created,
    FunctionReady,
    Streaming,
    Finalizing,
    Done,
    Aborted,
}

/// Outcome of one committed partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    pub partition: usize,
    pub pages: usize,
    pub records: u64,
    pub elapsed: Duration,
}

/// Outcome of a whole load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub function: FunctionName,
    pub partitions: Vec<PartitionReport>,
    pub records: u64,
    pub elapsed: Duration,
}

struct LoadShared {
    function: FunctionName,
    schema: Arc<Schema>,
    connector: Connector,
}

/// Entry point of a load.
pub struct LoadOrchestrator {
    config: LoadConfig,
    schema: Arc<Schema>,
    connector: Connector,
}

impl LoadOrchestrator {
    pub fn new(config: LoadConfig, schema: Arc<Schema>, connector: Connector) -> Self {
        Self {
            config,
            schema,
            connector,
        }
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Name the load's function after `transaction_time` and create it.
    ///
    /// The name is generated here, once, and handed to every partition and to
    /// cleanup.
    pub async fn begin(&self, transaction_time: DateTime<Utc>) -> Result<LoadTransaction> {
        let function = FunctionName::from_transaction_time(transaction_time);
        let (state, _) = watch::channel(LoadState::Created);
        debug!(function = %function, "Load created");

        let created = self.create_function(&function).await;
        if let Err(err) = created {
            state.send_replace(LoadState::Aborted);
            error!(function = %function, error = %err, "Failed to create load function");
            return Err(err);
        }
        state.send_replace(LoadState::FunctionReady);
        debug!(function = %function, "Load function ready");

        Ok(LoadTransaction {
            shared: Arc::new(LoadShared {
                function,
                schema: Arc::clone(&self.schema),
                connector: self.connector.clone(),
            }),
            state,
        })
    }

    /// Run a complete load: create, stream every partition, then drop.
    ///
    /// When a partition fails the function is left in place and the failure is
    /// returned; see [`cleanup_function`](Self::cleanup_function).
    pub async fn transaction(
        &self,
        transaction_time: DateTime<Utc>,
        partitions: Vec<Vec<Page>>,
    ) -> Result<LoadReport> {
        let started = Instant::now();
        let load = self.begin(transaction_time).await?;
        let reports = match load.run(partitions).await {
            Ok(reports) => reports,
            Err(err) => {
                warn!(
                    function = %load.function(),
                    "Load failed; function {} was left in place", load.function()
                );
                return Err(err);
            }
        };
        load.cleanup().await;

        let records = reports.iter().map(|report| report.records).sum();
        Ok(LoadReport {
            function: load.function().clone(),
            partitions: reports,
            records,
            elapsed: started.elapsed(),
        })
    }

    /// Resuming an interrupted load is not possible: the function name is tied
    /// to the first transaction time.
    pub fn resume(&self) -> Result<LoadReport> {
        Err(Error::Unsupported {
            operation: "resume".to_string(),
        })
    }

    /// Drop a previously created load function, propagating failures.
    pub async fn cleanup_function(&self, function: &FunctionName) -> Result<()> {
        drop_function(&self.connector, function, &self.schema).await
    }

    async fn create_function(&self, function: &FunctionName) -> Result<()> {
        let mut handle = self.connector.connect(true).await?;
        let created = handle
            .create_function(
                function.as_str(),
                &self.schema,
                &self.config.function,
                &self.config.language,
            )
            .await;
        let closed = handle.close().await;
        created?;
        closed
    }
}

/// A load whose function exists.
pub struct LoadTransaction {
    shared: Arc<LoadShared>,
    state: watch::Sender<LoadState>,
}

impl LoadTransaction {
    pub fn function(&self) -> &FunctionName {
        &self.shared.function
    }

    pub fn state(&self) -> LoadState {
        *self.state.borrow()
    }

    /// Receiver that observes state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.state.subscribe()
    }

    pub async fn open_partition(&self, index: usize) -> Result<PartitionOutput> {
        PartitionOutput::open(Arc::clone(&self.shared), index).await
    }

    /// Stream `pages` as partition `index`, committing on success and rolling
    /// back on failure. The connection is closed either way.
    pub async fn run_partition(&self, index: usize, pages: Vec<Page>) -> Result<PartitionReport> {
        self.enter_streaming();
        let result = drive_partition(Arc::clone(&self.shared), index, pages).await;
        if result.is_err() {
            self.state.send_replace(LoadState::Aborted);
        }
        result
    }

    /// Run every partition concurrently. Returns the reports in partition
    /// order, or the failure of the lowest-numbered failed partition.
    pub async fn run(&self, partitions: Vec<Vec<Page>>) -> Result<Vec<PartitionReport>> {
        self.enter_streaming();
        let mut tasks = JoinSet::new();
        for (index, pages) in partitions.into_iter().enumerate() {
            tasks.spawn(drive_partition(Arc::clone(&self.shared), index, pages));
        }

        let mut reports = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(err)) => failures.push(err),
                Err(join_err) => failures.push(Error::transaction(format!(
                    "partition task did not complete: {join_err}"
                ))),
            }
        }

        if !failures.is_empty() {
            self.state.send_replace(LoadState::Aborted);
            failures.sort_by_key(|err| match err {
                Error::Partition { index, .. } => *index,
                _ => usize::MAX,
            });
            return Err(failures.swap_remove(0));
        }
        reports.sort_by_key(|report| report.partition);
        Ok(reports)
    }

    /// Drop the function on a fresh connection. Failures are logged only.
    pub async fn cleanup(&self) {
        self.state.send_replace(LoadState::Finalizing);
        let shared = &self.shared;
        if let Err(err) = drop_function(&shared.connector, &shared.function, &shared.schema).await
        {
            warn!(
                function = %shared.function,
                error = %err,
                "Failed to drop load function"
            );
        }
        self.state.send_replace(LoadState::Done);
        debug!(function = %shared.function, "Load done");
    }

    fn enter_streaming(&self) {
        self.state.send_if_modified(|state| {
            if *state == LoadState::FunctionReady {
                *state = LoadState::Streaming;
                true
            } else {
                false
            }
        });
    }
}

async fn drop_function(connector: &Connector, function: &FunctionName, schema: &Schema) -> Result<()> {
    let mut handle = connector.connect(true).await?;
    let dropped = handle.drop_function(function.as_str(), schema).await;
    let closed = handle.close().await;
    dropped?;
    closed
}

async fn drive_partition(
    shared: Arc<LoadShared>,
    index: usize,
    pages: Vec<Page>,
) -> Result<PartitionReport> {
    let mut output = PartitionOutput::open(shared, index)
        .await
        .map_err(|err| partition_error(index, err))?;

    let mut streamed = Ok(());
    for page in &pages {
        streamed = output.add(page);
        if streamed.is_err() {
            break;
        }
    }
    let result = match streamed {
        Ok(()) => output.finish().await,
        Err(err) => Err(err),
    };

    if let Err(err) = &result {
        warn!(partition = index, error = %err, "Partition failed, rolling back");
        if let Err(rollback_err) = output.abort().await {
            warn!(partition = index, error = %rollback_err, "Rollback failed");
        }
    }
    if let Err(close_err) = output.close().await {
        warn!(partition = index, error = %close_err, "Failed to close partition connection");
    }
    result.map_err(|err| partition_error(index, err))
}

fn partition_error(index: usize, err: Error) -> Error {
    Error::Partition {
        index,
        source: Box::new(err),
    }
}

/// Writes one partition through its own manual-commit connection.
pub struct PartitionOutput {
    index: usize,
    shared: Arc<LoadShared>,
    handle: ConnectionHandle,
    call: PreparedCall,
    pages: usize,
    records: u64,
    started: Instant,
}

impl PartitionOutput {
    async fn open(shared: Arc<LoadShared>, index: usize) -> Result<Self> {
        let handle = shared.connector.connect(false).await?;
        let call = handle.prepare_call(shared.function.as_str(), &shared.schema);
        debug!(partition = index, function = %shared.function, "Partition opened");
        Ok(Self {
            index,
            shared,
            handle,
            call,
            pages: 0,
            records: 0,
            started: Instant::now(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Records bound and not yet sent.
    pub fn queued(&self) -> usize {
        self.call.queued()
    }

    /// Bind every record of `page`.
    pub fn add(&mut self, page: &Page) -> Result<()> {
        if page.schema().column_types() != self.shared.schema.column_types() {
            return Err(Error::schema(format!(
                "page columns {:?} do not match the load schema {:?}",
                page.schema().column_types(),
                self.shared.schema.column_types()
            )));
        }
        for record in page.records() {
            self.call.bind_record(record)?;
            self.records += 1;
        }
        self.pages += 1;
        Ok(())
    }

    /// Send every queued record in one round trip, then commit.
    pub async fn finish(&mut self) -> Result<PartitionReport> {
        self.handle.execute_batch(&mut self.call).await?;
        let elapsed = self.started.elapsed();
        info!("> {:.3} seconds.", elapsed.as_secs_f64());
        self.handle.commit().await?;
        Ok(PartitionReport {
            partition: self.index,
            pages: self.pages,
            records: self.records,
            elapsed,
        })
    }

    pub async fn abort(&mut self) -> Result<()> {
        self.handle.rollback().await
    }

    pub async fn close(self) -> Result<()> {
        self.handle.close().await
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::driver::ConnectProperties;
    use crate::MemoryDriver;
    use chrono::TimeZone;
    use pgudf_page::{ColumnType, PageBuilder};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder()
                .column("id", ColumnType::Integer64)
                .column("name", ColumnType::Text)
                .build()
                .unwrap(),
        )
    }

    fn orchestrator(driver: &MemoryDriver) -> LoadOrchestrator {
        let config = LoadConfig::from_yaml_str(
            "host: memory\nuser: loader\ndatabase: test\nfunction: 'BEGIN END;'\n",
        )
        .unwrap();
        let properties = ConnectProperties::new("memory", 5432, "test", "loader", "");
        let connector = Connector::new(Arc::new(driver.clone()), properties, None);
        LoadOrchestrator::new(config, schema(), connector)
    }

    fn page(schema: &Arc<Schema>, ids: &[i64]) -> Page {
        let mut builder = PageBuilder::new(Arc::clone(schema));
        for id in ids {
            builder
                .add_record([pgudf_page::Value::from(*id), pgudf_page::Value::Null])
                .unwrap();
        }
        builder.build()
    }

    fn time() -> DateTime<Utc> {
        Utc.timestamp_opt(1_426_896_000, 0).unwrap()
    }

    #[tokio::test]
    async fn test_states_progress_to_done() {
        let driver = MemoryDriver::new();
        let orchestrator = orchestrator(&driver);
        let load = orchestrator.begin(time()).await.unwrap();
        assert_eq!(load.state(), LoadState::FunctionReady);
        assert!(driver.function(load.function().as_str()).await.is_some());

        let report = load
            .run_partition(0, vec![page(&orchestrator.schema, &[1, 2])])
            .await
            .unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(load.state(), LoadState::Streaming);

        load.cleanup().await;
        assert_eq!(load.state(), LoadState::Done);
        assert!(driver.function(load.function().as_str()).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_partition_commits_nothing() {
        let driver = MemoryDriver::new();
        let orchestrator = orchestrator(&driver);
        let report = orchestrator
            .transaction(time(), vec![Vec::new()])
            .await
            .unwrap();
        assert_eq!(report.records, 0);
        assert_eq!(driver.inspect(|db| db.batch_executions()).await, 0);
    }

    #[tokio::test]
    async fn test_resume_is_unsupported() {
        let driver = MemoryDriver::new();
        let err = orchestrator(&driver).resume().unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
        assert_eq!(err.to_string(), "resume is not supported by the pgudf output");
    }

    #[tokio::test]
    async fn test_create_failure_aborts_before_any_partition() {
        let driver = MemoryDriver::new();
        driver.fail_statements_containing("CREATE").await;
        let orchestrator = orchestrator(&driver);
        let err = orchestrator
            .transaction(time(), vec![vec![page(&orchestrator.schema, &[1])]])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sql { .. }));
        assert_eq!(driver.inspect(|db| db.connect_attempts()).await, 1);
        assert_eq!(driver.inspect(|db| db.open_connections()).await, 0);
    }
}
