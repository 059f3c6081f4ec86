use crate::store::Store;
use crate::types::{
    EnvId, Environment, GroupId, LogLevel, RunId, StepExecution, StepId, StepLog, TestCase,
    TestGroup, TestId, TestResult, VariableChange, Workflow, WorkflowId, WorkflowRun,
};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition, TableHandle};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const WORKFLOWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");
const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_runs");
const STEP_EXECUTIONS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("workflow_step_executions");
const STEP_LOGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_step_logs");
const VARIABLE_CHANGES_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("workflow_variable_changes");
const TEST_CASES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("test_cases");
const TEST_GROUPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("test_groups");
const TEST_RESULTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("test_results");
const ENVIRONMENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("environments");

const ALL_TABLES: &[TableDefinition<&str, &[u8]>] = &[
    WORKFLOWS_TABLE,
    RUNS_TABLE,
    STEP_EXECUTIONS_TABLE,
    STEP_LOGS_TABLE,
    VARIABLE_CHANGES_TABLE,
    TEST_CASES_TABLE,
    TEST_GROUPS_TABLE,
    TEST_RESULTS_TABLE,
    ENVIRONMENTS_TABLE,
];

/// Store implementation backed by a single redb database. Records are
/// stored as JSON values; append-only tables use `run_id/seq` composite
/// keys so key order is append order.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    seq: Arc<AtomicU64>,
}

impl RedbStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Open every table once so later read transactions never see a
        // missing table
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        for table in ALL_TABLES {
            write_txn
                .open_table(*table)
                .with_context(|| format!("Failed to open table {}", table.name()))?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        // Seed the append counter past every suffix already on disk.
        // Test results key by test id, which outlives the process, so a
        // counter restarting at zero would overwrite earlier rows.
        let mut next_seq = 0u64;
        let read_txn = db.begin_read().context("Failed to begin read")?;
        for table in [STEP_LOGS_TABLE, VARIABLE_CHANGES_TABLE, TEST_RESULTS_TABLE] {
            let table = read_txn.open_table(table).context("Failed to open table")?;
            for item in table.iter().context("Failed to iterate table")? {
                let (key, _value) = item.context("Failed to read item")?;
                if let Some(seq) = key
                    .value()
                    .rsplit('/')
                    .next()
                    .and_then(|suffix| suffix.parse::<u64>().ok())
                {
                    next_seq = next_seq.max(seq + 1);
                }
            }
        }

        Ok(Self {
            db: Arc::new(db),
            seq: Arc::new(AtomicU64::new(next_seq)),
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn put<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        record: &T,
    ) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(table).context("Failed to open table")?;
            let value = serde_json::to_vec(record).context("Failed to serialize record")?;
            table
                .insert(key, value.as_slice())
                .context("Failed to insert record")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        match table.get(key).context("Failed to get record")? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Full scan in key order
    fn scan<T: DeserializeOwned>(&self, table: TableDefinition<&str, &[u8]>) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        let mut records = Vec::new();
        for item in table.iter().context("Failed to iterate table")? {
            let (_key, value) = item.context("Failed to read item")?;
            let record = serde_json::from_slice(value.value())
                .context("Failed to deserialize record")?;
            records.push(record);
        }
        Ok(records)
    }
}

fn paginate<T>(items: Vec<T>, limit: usize, offset: usize) -> (Vec<T>, usize) {
    let total = items.len();
    let page = items.into_iter().skip(offset).take(limit).collect();
    (page, total)
}

#[async_trait::async_trait]
impl Store for RedbStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        self.put(RUNS_TABLE, &run.run_id.to_string(), run)
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<()> {
        self.put(RUNS_TABLE, &run.run_id.to_string(), run)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>> {
        self.get(RUNS_TABLE, &run_id.to_string())
    }

    async fn list_runs(
        &self,
        workflow_id: &WorkflowId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<WorkflowRun>, usize)> {
        let mut runs: Vec<WorkflowRun> = self
            .scan(RUNS_TABLE)?
            .into_iter()
            .filter(|run: &WorkflowRun| &run.workflow_id == workflow_id)
            .collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(paginate(runs, limit, offset))
    }

    async fn create_step_execution(&self, exec: &StepExecution) -> Result<()> {
        let key = format!("{}/{}", exec.run_id, exec.step_id);
        self.put(STEP_EXECUTIONS_TABLE, &key, exec)
    }

    async fn update_step_execution(&self, exec: &StepExecution) -> Result<()> {
        let key = format!("{}/{}", exec.run_id, exec.step_id);
        self.put(STEP_EXECUTIONS_TABLE, &key, exec)
    }

    async fn list_step_executions(&self, run_id: &RunId) -> Result<Vec<StepExecution>> {
        let mut execs: Vec<StepExecution> = self
            .scan(STEP_EXECUTIONS_TABLE)?
            .into_iter()
            .filter(|exec: &StepExecution| &exec.run_id == run_id)
            .collect();
        execs.sort_by_key(|exec| exec.start_time);
        Ok(execs)
    }

    async fn get_step_execution(
        &self,
        run_id: &RunId,
        step_id: &StepId,
    ) -> Result<Option<StepExecution>> {
        let key = format!("{}/{}", run_id, step_id);
        self.get(STEP_EXECUTIONS_TABLE, &key)
    }

    async fn append_step_log(&self, log: &StepLog) -> Result<()> {
        let key = format!("{}/{:012}", log.run_id, self.next_seq());
        self.put(STEP_LOGS_TABLE, &key, log)
    }

    async fn list_step_logs(
        &self,
        run_id: &RunId,
        step_id: Option<&StepId>,
        level: Option<LogLevel>,
    ) -> Result<Vec<StepLog>> {
        let logs = self
            .scan(STEP_LOGS_TABLE)?
            .into_iter()
            .filter(|log: &StepLog| {
                &log.run_id == run_id
                    && step_id.map(|s| &log.step_id == s).unwrap_or(true)
                    && level.map(|l| log.level == l).unwrap_or(true)
            })
            .collect();
        Ok(logs)
    }

    async fn append_variable_change(&self, change: &VariableChange) -> Result<()> {
        let key = format!("{}/{:012}", change.run_id, self.next_seq());
        self.put(VARIABLE_CHANGES_TABLE, &key, change)
    }

    async fn list_variable_changes(
        &self,
        run_id: &RunId,
        var_name: Option<&str>,
    ) -> Result<Vec<VariableChange>> {
        let changes = self
            .scan(VARIABLE_CHANGES_TABLE)?
            .into_iter()
            .filter(|change: &VariableChange| {
                &change.run_id == run_id
                    && var_name.map(|v| change.var_name == v).unwrap_or(true)
            })
            .collect();
        Ok(changes)
    }

    async fn put_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.put(WORKFLOWS_TABLE, &workflow.workflow_id.0, workflow)
    }

    async fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<Workflow>> {
        let workflow: Option<Workflow> = self.get(WORKFLOWS_TABLE, &workflow_id.0)?;
        Ok(workflow.filter(|w| w.deleted_at.is_none()))
    }

    async fn list_workflows(
        &self,
        is_test_case: Option<bool>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Workflow>, usize)> {
        let mut workflows: Vec<Workflow> = self
            .scan(WORKFLOWS_TABLE)?
            .into_iter()
            .filter(|w: &Workflow| {
                w.deleted_at.is_none()
                    && is_test_case.map(|flag| w.is_test_case == flag).unwrap_or(true)
            })
            .collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(workflows, limit, offset))
    }

    async fn delete_workflow(&self, workflow_id: &WorkflowId) -> Result<bool> {
        let workflow: Option<Workflow> = self.get(WORKFLOWS_TABLE, &workflow_id.0)?;
        match workflow {
            Some(mut workflow) if workflow.deleted_at.is_none() => {
                workflow.deleted_at = Some(chrono::Utc::now());
                self.put(WORKFLOWS_TABLE, &workflow_id.0, &workflow)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn put_test_case(&self, test_case: &TestCase) -> Result<()> {
        self.put(TEST_CASES_TABLE, &test_case.test_id.0, test_case)
    }

    async fn get_test_case(&self, test_id: &TestId) -> Result<Option<TestCase>> {
        let test_case: Option<TestCase> = self.get(TEST_CASES_TABLE, &test_id.0)?;
        Ok(test_case.filter(|tc| tc.deleted_at.is_none()))
    }

    async fn list_test_cases(
        &self,
        group_id: Option<&GroupId>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<TestCase>, usize)> {
        let mut test_cases: Vec<TestCase> = self
            .scan(TEST_CASES_TABLE)?
            .into_iter()
            .filter(|tc: &TestCase| {
                tc.deleted_at.is_none() && group_id.map(|g| &tc.group_id == g).unwrap_or(true)
            })
            .collect();
        test_cases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(test_cases, limit, offset))
    }

    async fn delete_test_case(&self, test_id: &TestId) -> Result<bool> {
        let test_case: Option<TestCase> = self.get(TEST_CASES_TABLE, &test_id.0)?;
        match test_case {
            Some(mut test_case) if test_case.deleted_at.is_none() => {
                test_case.deleted_at = Some(chrono::Utc::now());
                self.put(TEST_CASES_TABLE, &test_id.0, &test_case)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn put_test_group(&self, group: &TestGroup) -> Result<()> {
        self.put(TEST_GROUPS_TABLE, &group.group_id.0, group)
    }

    async fn get_test_group(&self, group_id: &GroupId) -> Result<Option<TestGroup>> {
        self.get(TEST_GROUPS_TABLE, &group_id.0)
    }

    async fn list_test_groups(&self) -> Result<Vec<TestGroup>> {
        let mut groups: Vec<TestGroup> = self.scan(TEST_GROUPS_TABLE)?;
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn delete_test_group(&self, group_id: &GroupId) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let removed = {
            let mut table = write_txn
                .open_table(TEST_GROUPS_TABLE)
                .context("Failed to open table")?;
            let existed = table
                .remove(group_id.0.as_str())
                .context("Failed to delete group")?
                .is_some();
            existed
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(removed)
    }

    async fn append_test_result(&self, result: &TestResult) -> Result<()> {
        let key = format!("{}/{:012}", result.test_id, self.next_seq());
        self.put(TEST_RESULTS_TABLE, &key, result)
    }

    async fn list_test_results(
        &self,
        test_id: &TestId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<TestResult>, usize)> {
        let mut results: Vec<TestResult> = self
            .scan(TEST_RESULTS_TABLE)?
            .into_iter()
            .filter(|result: &TestResult| &result.test_id == test_id)
            .collect();
        results.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(paginate(results, limit, offset))
    }

    async fn put_environment(&self, env: &Environment) -> Result<()> {
        self.put(ENVIRONMENTS_TABLE, &env.env_id.0, env)
    }

    async fn get_environment(&self, env_id: &EnvId) -> Result<Option<Environment>> {
        let env: Option<Environment> = self.get(ENVIRONMENTS_TABLE, &env_id.0)?;
        Ok(env.filter(|e| e.deleted_at.is_none()))
    }

    async fn list_environments(&self) -> Result<Vec<Environment>> {
        let mut envs: Vec<Environment> = self
            .scan(ENVIRONMENTS_TABLE)?
            .into_iter()
            .filter(|e: &Environment| e.deleted_at.is_none())
            .collect();
        envs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(envs)
    }

    async fn delete_environment(&self, env_id: &EnvId) -> Result<bool> {
        let env: Option<Environment> = self.get(ENVIRONMENTS_TABLE, &env_id.0)?;
        match env {
            Some(mut env) if env.deleted_at.is_none() => {
                env.deleted_at = Some(chrono::Utc::now());
                env.is_active = false;
                self.put(ENVIRONMENTS_TABLE, &env_id.0, &env)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_active_environment(&self) -> Result<Option<Environment>> {
        let active = self
            .scan(ENVIRONMENTS_TABLE)?
            .into_iter()
            .find(|e: &Environment| e.deleted_at.is_none() && e.is_active);
        Ok(active)
    }

    async fn set_active_environment(&self, env_id: &EnvId) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(ENVIRONMENTS_TABLE)
                .context("Failed to open table")?;

            let mut envs: Vec<Environment> = Vec::new();
            for item in table.iter().context("Failed to iterate environments")? {
                let (_key, value) = item.context("Failed to read item")?;
                let env: Environment = serde_json::from_slice(value.value())
                    .context("Failed to deserialize environment")?;
                envs.push(env);
            }

            if !envs
                .iter()
                .any(|e| &e.env_id == env_id && e.deleted_at.is_none())
            {
                // Dropping the uncommitted transaction aborts it
                return Ok(false);
            }

            let now = chrono::Utc::now();
            for mut env in envs {
                let was_active = env.is_active;
                env.is_active = &env.env_id == env_id && env.deleted_at.is_none();
                if env.is_active != was_active {
                    env.updated_at = now;
                }
                let value =
                    serde_json::to_vec(&env).context("Failed to serialize environment")?;
                table
                    .insert(env.env_id.0.as_str(), value.as_slice())
                    .context("Failed to update environment")?;
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunStatus, TestStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, RedbStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = RedbStore::new(temp_dir.path().join("testflow.redb")).unwrap();
        (temp_dir, store)
    }

    fn test_env(id: &str, active: bool) -> Environment {
        Environment {
            env_id: EnvId::new(id),
            name: id.to_string(),
            description: None,
            is_active: active,
            variables: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_run_round_trip() {
        let (_dir, store) = test_store();

        let run = WorkflowRun {
            run_id: RunId::new(),
            workflow_id: WorkflowId::new("wf-1"),
            status: RunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            context: None,
            error: None,
        };
        store.create_run(&run).await.unwrap();

        let loaded = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.status, RunStatus::Running);

        let (runs, total) = store
            .list_runs(&WorkflowId::new("wf-1"), 20, 0)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_run_pagination() {
        let (_dir, store) = test_store();
        let workflow_id = WorkflowId::new("wf-1");

        for _ in 0..5 {
            let run = WorkflowRun {
                run_id: RunId::new(),
                workflow_id: workflow_id.clone(),
                status: RunStatus::Success,
                start_time: Utc::now(),
                end_time: None,
                duration: None,
                context: None,
                error: None,
            };
            store.create_run(&run).await.unwrap();
        }

        let (page, total) = store.list_runs(&workflow_id, 2, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);

        let (tail, _) = store.list_runs(&workflow_id, 20, 4).await.unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn test_step_log_filters() {
        let (_dir, store) = test_store();
        let run_id = RunId::new();

        for (step, level) in [
            ("a", LogLevel::Info),
            ("a", LogLevel::Warn),
            ("b", LogLevel::Info),
        ] {
            store
                .append_step_log(&StepLog {
                    run_id,
                    step_id: StepId::new(step),
                    level,
                    message: format!("{step} {level}"),
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }

        let all = store.list_step_logs(&run_id, None, None).await.unwrap();
        assert_eq!(all.len(), 3);

        let step_a = store
            .list_step_logs(&run_id, Some(&StepId::new("a")), None)
            .await
            .unwrap();
        assert_eq!(step_a.len(), 2);

        let warns = store
            .list_step_logs(&run_id, None, Some(LogLevel::Warn))
            .await
            .unwrap();
        assert_eq!(warns.len(), 1);
        assert_eq!(warns[0].message, "a warn");
    }

    #[tokio::test]
    async fn test_soft_delete_hides_workflow() {
        let (_dir, store) = test_store();
        let workflow_id = WorkflowId::new("wf-1");

        store
            .put_workflow(&Workflow {
                workflow_id: workflow_id.clone(),
                name: "wf".to_string(),
                version: None,
                description: None,
                definition: serde_json::json!({"steps": {}}),
                is_test_case: false,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                deleted_at: None,
            })
            .await
            .unwrap();

        assert!(store.get_workflow(&workflow_id).await.unwrap().is_some());
        assert!(store.delete_workflow(&workflow_id).await.unwrap());
        assert!(store.get_workflow(&workflow_id).await.unwrap().is_none());
        // Deleting twice reports not-found
        assert!(!store.delete_workflow(&workflow_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_active_environment_is_exclusive() {
        let (_dir, store) = test_store();

        store.put_environment(&test_env("dev", false)).await.unwrap();
        store.put_environment(&test_env("prod", false)).await.unwrap();

        assert!(store
            .set_active_environment(&EnvId::new("dev"))
            .await
            .unwrap());
        let active = store.get_active_environment().await.unwrap().unwrap();
        assert_eq!(active.env_id, EnvId::new("dev"));

        // Activating another environment deactivates the first
        assert!(store
            .set_active_environment(&EnvId::new("prod"))
            .await
            .unwrap());
        let envs = store.list_environments().await.unwrap();
        let active: Vec<_> = envs.iter().filter(|e| e.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].env_id, EnvId::new("prod"));
    }

    fn test_result(test_id: &TestId, error: Option<&str>) -> TestResult {
        TestResult {
            test_id: test_id.clone(),
            run_id: None,
            status: if error.is_some() {
                TestStatus::Failed
            } else {
                TestStatus::Passed
            },
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration: 1,
            error: error.map(str::to_string),
            failures: Vec::new(),
            response: None,
        }
    }

    #[tokio::test]
    async fn test_appends_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("testflow.redb");
        let test_id = TestId::new("t-1");

        {
            let store = RedbStore::new(path.clone()).unwrap();
            store
                .append_test_result(&test_result(&test_id, Some("first")))
                .await
                .unwrap();
            store
                .append_test_result(&test_result(&test_id, None))
                .await
                .unwrap();
        }

        // A fresh process must not reuse keys under the same test id
        let store = RedbStore::new(path).unwrap();
        store
            .append_test_result(&test_result(&test_id, None))
            .await
            .unwrap();

        let (results, total) = store.list_test_results(&test_id, 20, 0).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(results.len(), 3);
        assert!(results.iter().any(|r| r.error.as_deref() == Some("first")));
    }

    #[tokio::test]
    async fn test_set_active_environment_missing_target() {
        let (_dir, store) = test_store();
        store.put_environment(&test_env("dev", true)).await.unwrap();

        assert!(!store
            .set_active_environment(&EnvId::new("ghost"))
            .await
            .unwrap());
        // The existing activation is untouched
        let active = store.get_active_environment().await.unwrap().unwrap();
        assert_eq!(active.env_id, EnvId::new("dev"));
    }
}
