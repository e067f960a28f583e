//! Per-job orchestration: build/verify the target table, purge stale rows,
//! fetch every page, insert. One job at a time, one request at a time.
use crate::config::{self, Config, DateMode, FeedMode};
use crate::executor::{AnyExecutor, SqlError, SqlExecutor};
use crate::feed::{self, FeedClient, FeedTransport};
use crate::model::{JobOutcome, TableCheck};
use crate::pager::{self, FeedFormat, LinkFollowingPager, PageStep, WindowedPager};
use crate::schema::{SchemaCatalog, SchemaError};
use crate::statements;
use crate::windows;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

/// Source entity name: the request path prefix before its first `?`.
pub fn source_entity(request: &str) -> Option<&str> {
    let prefix = request.split('?').next().unwrap_or("").trim();
    if prefix.is_empty() {
        None
    } else {
        Some(prefix)
    }
}

/// Compare a live table's columns against the catalog and rebuild the table
/// from scratch on drift. Never adds a column in place.
pub async fn reconcile_table(
    sql: &dyn SqlExecutor,
    table: &str,
    entity_name: &str,
    catalog: &SchemaCatalog,
) -> Result<TableCheck> {
    let live: HashSet<String> = sql
        .query_strings(&statements::live_columns(table))
        .await?
        .into_iter()
        .collect();
    let entity = catalog.get(entity_name)?;
    let missing: Vec<&str> = entity
        .column_fields()
        .map(|f| f.name.as_str())
        .filter(|name| !live.contains(*name))
        .collect();

    if missing.is_empty() {
        return Ok(TableCheck::Unchanged);
    }

    warn!(table, ?missing, "schema drift detected; rebuilding table");
    sql.execute(&statements::drop_table(table)).await?;
    for stmt in statements::create_table(table, entity_name, catalog, &[])? {
        sql.execute(&stmt).await?;
    }
    Ok(TableCheck::Rebuilt)
}

/// One job file's worth of work against injected collaborators.
pub struct SyncRun<'a> {
    cfg: &'a Config,
    transport: &'a dyn FeedTransport,
    sql: &'a dyn SqlExecutor,
    retry_pause: Duration,
}

impl<'a> SyncRun<'a> {
    pub fn new(cfg: &'a Config, transport: &'a dyn FeedTransport, sql: &'a dyn SqlExecutor) -> Self {
        Self {
            cfg,
            transport,
            sql,
            retry_pause: pager::RETRY_PAUSE,
        }
    }

    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    /// Process every configured table. A connectivity failure aborts the
    /// file; any other job failure is logged and the loop moves on.
    pub async fn run(&self) -> Result<()> {
        let base = self.cfg.global_config.normalized_base_url();

        let catalog = match self.cfg.global_config.feed_mode {
            FeedMode::Windowed => {
                let catalog = feed::fetch_metadata(self.transport, &base).await?;
                info!(
                    entities = catalog.len(),
                    tables = self.cfg.tables.len(),
                    "feed metadata loaded"
                );
                Some(catalog)
            }
            FeedMode::LinkFollowing => None,
        };

        for (table, job) in &self.cfg.tables {
            let result = match &catalog {
                Some(catalog) => self.run_windowed_job(table, job, catalog, &base).await,
                None => self.run_link_job(table, job, &base).await,
            };
            match result {
                Ok(JobOutcome::Completed {
                    windows,
                    statements,
                }) => {
                    info!(table, windows, statements, "table sync complete");
                }
                Ok(JobOutcome::Skipped(reason)) => {
                    info!(table, reason, "table sync skipped");
                }
                Err(err) if is_connectivity(&err) => {
                    return Err(err).with_context(|| format!("syncing table '{table}'"));
                }
                Err(err) => {
                    error!(table, ?err, "table sync failed");
                }
            }
        }
        Ok(())
    }

    /// Execute a statement under the "log and skip" failure policy.
    /// Returns whether the statement took effect; connectivity failures
    /// propagate.
    async fn exec_allow_failure(&self, statement: &str) -> Result<bool> {
        match self.sql.execute(statement).await {
            Ok(()) => Ok(true),
            Err(SqlError::Statement(err)) => {
                error!(%err, "statement failed; skipping");
                Ok(false)
            }
            Err(err @ SqlError::Connectivity(_)) => Err(err.into()),
        }
    }

    async fn run_windowed_job(
        &self,
        table: &str,
        job: &config::TableJob,
        catalog: &SchemaCatalog,
        base: &str,
    ) -> Result<JobOutcome> {
        let Some(entity) = source_entity(&job.data_request) else {
            return Ok(JobOutcome::Skipped(format!(
                "no source entity in request '{}'",
                job.data_request
            )));
        };
        info!(table, entity, "starting table sync");

        let create = match statements::create_table(table, entity, catalog, &job.indexes) {
            Ok(create) => create,
            Err(SchemaError::NotFound(name)) => {
                return Ok(JobOutcome::Skipped(format!(
                    "entity '{name}' not present in feed metadata"
                )));
            }
            Err(err) => return Err(err.into()),
        };
        for stmt in &create {
            self.exec_allow_failure(stmt).await?;
        }

        let check = reconcile_table(self.sql, table, entity, catalog).await?;

        // A rebuilt table is empty: fall back to the full request and
        // disable incremental fetching for this run.
        let request = if check == TableCheck::Rebuilt {
            job.full_data_request.as_deref().unwrap_or(&job.data_request)
        } else {
            &job.data_request
        };
        let url = format!("{base}{request}");

        let today = chrono::Local::now().date_naive().format("%Y-%m-%d").to_string();
        let forced_full = check == TableCheck::Rebuilt || job.date_field.is_none();

        let (urls, purge) = if forced_full {
            (vec![url], statements::truncate(table))
        } else {
            let date_field = job.date_field.as_deref().unwrap_or_default();
            match job.date_mode {
                DateMode::Period => {
                    let from = job.date_from.as_deref().unwrap_or(&today);
                    let to = job.date_to.as_deref().unwrap_or(&today);
                    let plan = windows::plan(from, to, &job.date_inc)?;
                    let urls = plan.iter().map(|w| pager::window_url(&url, w)).collect();
                    (urls, statements::delete_between(table, date_field, from, to))
                }
                DateMode::Full => {
                    let from = job.date_from_full.as_deref().unwrap_or(&today);
                    let to = job.date_to_full.as_deref().unwrap_or(&today);
                    let plan = windows::plan(from, to, &job.date_inc)?;
                    let urls = plan.iter().map(|w| pager::window_url(&url, w)).collect();
                    (urls, statements::truncate(table))
                }
            }
        };

        self.exec_allow_failure(&purge).await?;
        info!(table, requests = urls.len(), "requests to be sent");

        let format = if self.cfg.global_config.json_allowed {
            FeedFormat::Json
        } else {
            FeedFormat::Markup
        };
        let window_pager =
            WindowedPager::new(self.transport, format).with_retry_pause(self.retry_pause);

        let mut windows_done = 0usize;
        let mut statements_sent = 0usize;
        for (n, window_url) in urls.iter().enumerate() {
            info!(table, current = n + 1, total = urls.len(), "sending window request");
            let Some(records) = window_pager.fetch(window_url).await else {
                continue;
            };
            windows_done += 1;
            let inserts = statements::insert_statements(table, &records);
            info!(table, statements = inserts.len(), "statements to be sent");
            for stmt in &inserts {
                if self.exec_allow_failure(stmt).await? {
                    statements_sent += 1;
                }
            }
        }

        Ok(JobOutcome::Completed {
            windows: windows_done,
            statements: statements_sent,
        })
    }

    async fn run_link_job(
        &self,
        table: &str,
        job: &config::TableJob,
        base: &str,
    ) -> Result<JobOutcome> {
        if source_entity(&job.data_request).is_none() {
            return Ok(JobOutcome::Skipped(format!(
                "no source entity in request '{}'",
                job.data_request
            )));
        }
        info!(table, "starting table sync");

        let url = format!("{base}{}", job.data_request);
        let mut link_pager = LinkFollowingPager::new(self.transport, table, &url);

        let mut pages = 0usize;
        let mut statements_sent = 0usize;
        loop {
            match link_pager.step().await {
                PageStep::Page { records, inferred } => {
                    if let Some(entity) = &inferred {
                        self.exec_allow_failure(&statements::rebuild_table(table, entity))
                            .await?;
                    }
                    pages += 1;
                    let inserts = statements::insert_statements(table, &records);
                    for stmt in &inserts {
                        if self.exec_allow_failure(stmt).await? {
                            statements_sent += 1;
                        }
                    }
                }
                PageStep::Retry => tokio::time::sleep(self.retry_pause).await,
                PageStep::Finished => break,
            }
        }

        Ok(JobOutcome::Completed {
            windows: pages,
            statements: statements_sent,
        })
    }
}

fn is_connectivity(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<SqlError>(), Some(SqlError::Connectivity(_)))
}

/// Load one YAML job file and run it against the real collaborators.
pub async fn run_job_file(path: &Path) -> Result<()> {
    info!(path = %path.display(), "starting job file");
    let cfg = config::load(path).with_context(|| format!("loading {}", path.display()))?;
    let g = &cfg.global_config;
    let client = FeedClient::new(g.api_login.clone(), g.api_pwd.clone(), g.request_timeout);
    let executor = AnyExecutor::new(g.database_url());
    SyncRun::new(&cfg, &client, &executor).run().await?;
    info!(path = %path.display(), "job file done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExecutor {
        executed: Mutex<Vec<String>>,
        column_sets: Mutex<VecDeque<Vec<String>>>,
    }

    impl RecordingExecutor {
        fn with_columns(column_sets: Vec<Vec<String>>) -> Self {
            Self {
                executed: Mutex::new(Vec::new()),
                column_sets: Mutex::new(VecDeque::from(column_sets)),
            }
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SqlExecutor for RecordingExecutor {
        async fn execute(&self, statement: &str) -> Result<(), SqlError> {
            self.executed.lock().unwrap().push(statement.to_string());
            Ok(())
        }

        async fn query_strings(&self, _statement: &str) -> Result<Vec<String>, SqlError> {
            Ok(self.column_sets.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    const METADATA: &str = r#"<edmx:Edmx xmlns:edmx="http://schemas.microsoft.com/ado/2007/06/edmx">
  <edmx:DataServices>
    <Schema xmlns="http://schemas.microsoft.com/ado/2009/11/edm" Namespace="StandardODATA">
      <EntityType Name="Document_Order">
        <Property Name="Ref_Key" Type="Edm.String"/>
        <Property Name="Date" Type="Edm.DateTimeOffset"/>
        <Property Name="Goods" Type="Collection(StandardODATA.Document_Order_Goods_RowType)"/>
      </EntityType>
      <EntityType Name="Document_Order_Goods">
        <Property Name="LineNumber" Type="Edm.Int32"/>
      </EntityType>
    </Schema>
  </edmx:DataServices>
</edmx:Edmx>"#;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::parse(METADATA).unwrap()
    }

    #[test]
    fn source_entity_resolution() {
        assert_eq!(source_entity("Document_Order?$filter=x"), Some("Document_Order"));
        assert_eq!(source_entity("Document_Order"), Some("Document_Order"));
        assert_eq!(source_entity("?$filter=x"), None);
        assert_eq!(source_entity(""), None);
    }

    #[tokio::test]
    async fn reconcile_equal_columns_is_unchanged() {
        let exec = RecordingExecutor::with_columns(vec![vec![
            "Ref_Key".to_string(),
            "Date".to_string(),
        ]]);
        let check = reconcile_table(&exec, "orders", "Document_Order", &catalog())
            .await
            .unwrap();
        assert_eq!(check, TableCheck::Unchanged);
        // Nothing executed: reconciliation only queried the column list.
        assert!(exec.executed().is_empty());
    }

    #[tokio::test]
    async fn reconcile_subset_rebuilds() {
        let exec = RecordingExecutor::with_columns(vec![vec!["Ref_Key".to_string()]]);
        let check = reconcile_table(&exec, "orders", "Document_Order", &catalog())
            .await
            .unwrap();
        assert_eq!(check, TableCheck::Rebuilt);
        let executed = exec.executed();
        assert_eq!(executed[0], "DROP TABLE [dbo].[orders]");
        assert!(executed[1].contains("CREATE TABLE [dbo].[orders]"));
        assert!(executed[2].contains("CREATE TABLE [dbo].[orders_Goods]"));
    }

    #[tokio::test]
    async fn reconcile_ignores_collection_fields() {
        // Live table lacks "Goods" because nested collections never become
        // columns; that alone must not trigger a rebuild.
        let exec = RecordingExecutor::with_columns(vec![vec![
            "Ref_Key".to_string(),
            "Date".to_string(),
            "Extra_Legacy".to_string(),
        ]]);
        let check = reconcile_table(&exec, "orders", "Document_Order", &catalog())
            .await
            .unwrap();
        assert_eq!(check, TableCheck::Unchanged);
    }

    #[tokio::test]
    async fn reconcile_missing_entity_is_error() {
        let exec = RecordingExecutor::with_columns(vec![vec![]]);
        let err = reconcile_table(&exec, "x", "Nope", &catalog()).await.unwrap_err();
        assert!(err.downcast_ref::<SchemaError>().is_some());
    }
}
