use anyhow::{Context, Result, anyhow};
use ci_insights_core::{
    config::DbConfig,
    models::{
        BranchType, CommitParentsChangesEntry, CommitParentsEntry, FullJobInfo, InProgressJobInfo,
        JobRunInfo, TestRun,
    },
};
use moka::future::Cache;
use sqlx::{
    Executor, Pool, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool,
    migrate::MigrateDatabase, sqlite::SqliteRow,
};

#[derive(Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
    job_types: Cache<JobTypeKey, ()>,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct JobTypeKey {
    project_id: u64,
    job_id: String,
}

// Maximum number of bind parameters in a single query (SQLite limit)
const BIND_LIMIT: usize = 32766;

const TEST_RUN_COLUMNS: usize = 14;
const COMMIT_PARENT_COLUMNS: usize = 8;
const CHANGE_COLUMNS: usize = 7;

/// Tables holding the changes-since-last-run entries of a stored job.
#[derive(Debug, Clone, Copy)]
enum ChangesTable {
    JobRun,
    InProgressJob,
}

impl ChangesTable {
    fn insert_prefix(self) -> &'static str {
        match self {
            Self::JobRun => {
                "INSERT INTO job_run_changes (job_run_id, parent_commit_sha, depth, author_name, \
                 author_email, message_preview, branch_type) "
            }
            Self::InProgressJob => {
                "INSERT INTO in_progress_job_changes (job_run_id, parent_commit_sha, depth, \
                 author_name, author_email, message_preview, branch_type) "
            }
        }
    }
}

impl Database {
    pub async fn new(config: &DbConfig) -> Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            tracing::info!(url = %config.url, "Creating database");
            Sqlite::create_database(&config.url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool =
            SqlitePool::connect(&config.url).await.context("Failed to connect to database")?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool, running pending migrations first.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        let job_types = Cache::<JobTypeKey, ()>::builder().max_capacity(100_000).build();
        Ok(Self { pool, job_types })
    }

    pub async fn close(&self) { self.pool.close().await }

    pub async fn job_run_exists(&self, job_run_id: u64) -> Result<bool> {
        let exists: i64 =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM job_runs WHERE job_run_id = ?)")
                .bind(job_run_id as i64)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists != 0)
    }

    /// Insert a finished job run with its changes-since-last-run entries.
    ///
    /// Returns `false` when a row for the job run already existed.
    pub async fn insert_job_run(&self, job: &FullJobInfo) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let run = &job.run;
        let inserted = sqlx::query(
            r#"
            INSERT INTO job_runs (
                job_run_id, job_id, project_id, pipeline_id, branch_name, agent_name, agent_os,
                job_url, state, duration_ms, started_at, ended_at, triggered_by, pipeline_source,
                commit_sha, commit_message, commit_author, total_tests, success_tests,
                failed_tests, skipped_tests, custom_status_message, has_code_quality_report
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (job_run_id) DO NOTHING
            "#,
        )
        .bind(run.job_run_id as i64)
        .bind(&run.job_id)
        .bind(run.project_id as i64)
        .bind(run.pipeline_id as i64)
        .bind(&run.branch_name)
        .bind(&run.agent_name)
        .bind(&run.agent_os)
        .bind(&run.job_url)
        .bind(job.state.as_str())
        .bind(job.duration_ms as i64)
        .bind(job.started_at)
        .bind(job.ended_at)
        .bind(&job.triggered_by)
        .bind(&job.pipeline_source)
        .bind(&job.commit_sha)
        .bind(&job.commit_message)
        .bind(&job.commit_author)
        .bind(job.counters.total)
        .bind(job.counters.success)
        .bind(job.counters.failed)
        .bind(job.counters.skipped)
        .bind(&job.custom_status_message)
        .bind(job.has_code_quality_report)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;
        if inserted {
            Self::insert_changes(
                &mut tx,
                ChangesTable::JobRun,
                run.job_run_id,
                &job.changes_since_last_run,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Store the test runs of a job run, replacing any rows from an earlier attempt.
    pub async fn insert_test_runs(&self, run: &JobRunInfo, test_runs: &[TestRun]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM test_runs WHERE job_run_id = ?")
            .bind(run.job_run_id as i64)
            .execute(&mut *tx)
            .await?;
        for chunk in test_runs.chunks(BIND_LIMIT / TEST_RUN_COLUMNS) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "INSERT INTO test_runs (job_run_id, project_id, job_id, pipeline_id, branch_name, \
                 agent_name, agent_os, test_id, result, duration_ms, start_time, failure_message, \
                 failure_output, system_output) ",
            );
            builder.push_values(chunk, |mut b, test| {
                b.push_bind(run.job_run_id as i64)
                    .push_bind(run.project_id as i64)
                    .push_bind(&run.job_id)
                    .push_bind(run.pipeline_id as i64)
                    .push_bind(&run.branch_name)
                    .push_bind(&run.agent_name)
                    .push_bind(&run.agent_os)
                    .push_bind(&test.test_id)
                    .push_bind(test.result.as_str())
                    .push_bind(test.duration_ms as i64)
                    .push_bind(test.start_time)
                    .push_bind(&test.failure_message)
                    .push_bind(&test.failure_output)
                    .push_bind(&test.system_output);
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Whether the ancestry of a commit has been stored (its depth 0 row exists).
    pub async fn commit_parents_exist(&self, project_id: u64, commit_sha: &str) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM commit_parents
                WHERE project_id = ? AND commit_sha = ? AND depth = 0
            )
            "#,
        )
        .bind(project_id as i64)
        .bind(commit_sha)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    pub async fn insert_commit_parents(&self, entries: &[CommitParentsEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in entries.chunks(BIND_LIMIT / COMMIT_PARENT_COLUMNS) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "INSERT INTO commit_parents (project_id, commit_sha, parent_commit_sha, depth, \
                 author_name, author_email, message_preview, branch_type) ",
            );
            builder.push_values(chunk, |mut b, entry| {
                b.push_bind(entry.project_id as i64)
                    .push_bind(&entry.commit_sha)
                    .push_bind(&entry.parent_commit_sha)
                    .push_bind(entry.depth)
                    .push_bind(&entry.author_name)
                    .push_bind(&entry.author_email)
                    .push_bind(&entry.message_preview)
                    .push_bind(entry.branch_type.as_str());
            });
            builder.push(" ON CONFLICT (project_id, commit_sha, parent_commit_sha) DO NOTHING");
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn in_progress_job_exists(&self, job_run_id: u64) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM in_progress_jobs WHERE job_run_id = ?)",
        )
        .bind(job_run_id as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    /// Returns `false` when a snapshot for the job run already existed.
    pub async fn insert_in_progress_job(&self, job: &InProgressJobInfo) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let run = &job.run;
        let inserted = sqlx::query(
            r#"
            INSERT INTO in_progress_jobs (
                job_run_id, job_id, project_id, pipeline_id, branch_name, agent_name, agent_os,
                job_url, started_at, triggered_by, pipeline_source, commit_sha, commit_message,
                commit_author
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (job_run_id) DO NOTHING
            "#,
        )
        .bind(run.job_run_id as i64)
        .bind(&run.job_id)
        .bind(run.project_id as i64)
        .bind(run.pipeline_id as i64)
        .bind(&run.branch_name)
        .bind(&run.agent_name)
        .bind(&run.agent_os)
        .bind(&run.job_url)
        .bind(job.started_at)
        .bind(&job.triggered_by)
        .bind(&job.pipeline_source)
        .bind(&job.commit_sha)
        .bind(&job.commit_message)
        .bind(&job.commit_author)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;
        if inserted {
            Self::insert_changes(
                &mut tx,
                ChangesTable::InProgressJob,
                run.job_run_id,
                &job.changes_since_last_run,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn insert_changes(
        conn: &mut SqliteConnection,
        table: ChangesTable,
        job_run_id: u64,
        changes: &[CommitParentsChangesEntry],
    ) -> Result<()> {
        for chunk in changes.chunks(BIND_LIMIT / CHANGE_COLUMNS) {
            let mut builder = QueryBuilder::<Sqlite>::new(table.insert_prefix());
            builder.push_values(chunk, |mut b, change| {
                b.push_bind(job_run_id as i64)
                    .push_bind(&change.parent_commit_sha)
                    .push_bind(change.depth)
                    .push_bind(&change.author_name)
                    .push_bind(&change.author_email)
                    .push_bind(&change.message_preview)
                    .push_bind(change.branch_type.as_str());
            });
            builder.push(" ON CONFLICT (job_run_id, parent_commit_sha) DO NOTHING");
            conn.execute(builder.build()).await?;
        }
        Ok(())
    }

    /// Ancestors of `commit_sha` that landed since the previous run of `job_id` on `ref_name`.
    ///
    /// The previous run is the nearest ancestor (depth >= 1) that a stored run of the job
    /// on the same branch built; every closer ancestor, including the commit itself, is a
    /// change. Without such a run there is nothing to compare against and the result is
    /// empty.
    pub async fn get_commit_changes(
        &self,
        project_id: u64,
        commit_sha: &str,
        job_id: &str,
        ref_name: &str,
    ) -> Result<Vec<CommitParentsChangesEntry>> {
        let project_id = project_id as i64;
        let rows = sqlx::query(
            r#"
            SELECT parent_commit_sha, depth, author_name, author_email, message_preview,
                   branch_type
            FROM commit_parents
            WHERE project_id = ? AND commit_sha = ?
              AND depth < COALESCE((
                  SELECT MIN(cp.depth)
                  FROM commit_parents cp
                  JOIN job_runs jr
                    ON jr.project_id = cp.project_id AND jr.commit_sha = cp.parent_commit_sha
                  WHERE cp.project_id = ? AND cp.commit_sha = ? AND cp.depth >= 1
                    AND jr.job_id = ? AND jr.branch_name = ?
              ), 0)
            ORDER BY depth
            "#,
        )
        .bind(project_id)
        .bind(commit_sha)
        .bind(project_id)
        .bind(commit_sha)
        .bind(job_id)
        .bind(ref_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query commit changes")?;
        rows.iter().map(change_from_row).collect()
    }

    /// Whether a successful run of `job_id` has ever been stored for the project.
    ///
    /// Positive answers are cached; a job type never stops existing.
    pub async fn has_job_type(&self, project_id: u64, job_id: &str) -> Result<bool> {
        let key = JobTypeKey { project_id, job_id: job_id.to_string() };
        if self.job_types.contains_key(&key) {
            return Ok(true);
        }
        let exists: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM job_runs
                WHERE project_id = ? AND job_id = ? AND state = 'success'
            )
            "#,
        )
        .bind(project_id as i64)
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        let exists = exists != 0;
        if exists {
            self.job_types.insert(key, ()).await;
        }
        Ok(exists)
    }
}

fn change_from_row(row: &SqliteRow) -> Result<CommitParentsChangesEntry> {
    let branch_type: String = row.try_get("branch_type")?;
    Ok(CommitParentsChangesEntry {
        parent_commit_sha: row.try_get("parent_commit_sha")?,
        depth: row.try_get("depth")?,
        author_name: row.try_get("author_name")?,
        author_email: row.try_get("author_email")?,
        message_preview: row.try_get("message_preview")?,
        branch_type: branch_type
            .parse::<BranchType>()
            .map_err(|()| anyhow!("Unknown branch type {}", branch_type))?,
    })
}

#[cfg(test)]
mod tests {
    use ci_insights_core::models::{JobStatus, TestCount, TestResult};
    use sqlx::sqlite::SqlitePoolOptions;
    use time::OffsetDateTime;

    use super::*;

    async fn memory_db() -> Database {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        Database::with_pool(pool).await.unwrap()
    }

    fn run_info(job_run_id: u64, job_id: &str) -> JobRunInfo {
        JobRunInfo {
            job_id: job_id.to_string(),
            project_id: 1,
            pipeline_id: 10,
            job_run_id,
            branch_name: "main".to_string(),
            agent_name: "runner-1".to_string(),
            agent_os: "linux".to_string(),
            job_url: format!("https://gitlab.example.com/g/p/-/jobs/{job_run_id}"),
        }
    }

    fn job(job_run_id: u64, commit_sha: &str, state: JobStatus) -> FullJobInfo {
        FullJobInfo {
            run: run_info(job_run_id, "unit-tests"),
            state,
            duration_ms: 1500,
            started_at: Some(OffsetDateTime::UNIX_EPOCH),
            ended_at: None,
            triggered_by: Some("dev".to_string()),
            pipeline_source: Some("push".to_string()),
            commit_sha: commit_sha.to_string(),
            commit_message: Some("Fix".to_string()),
            commit_author: Some("Dev".to_string()),
            counters: TestCount { total: 2, success: 1, failed: 1, skipped: 0 },
            custom_status_message: None,
            has_code_quality_report: false,
            changes_since_last_run: vec![],
        }
    }

    /// Linear history `c0 <- c1 <- ... <- c{n-1}` seen from `c0`.
    fn linear_parents(n: u32) -> Vec<CommitParentsEntry> {
        (0..n)
            .map(|depth| CommitParentsEntry {
                project_id: 1,
                commit_sha: "c0".to_string(),
                parent_commit_sha: format!("c{depth}"),
                depth,
                author_name: "Dev".to_string(),
                author_email: "dev@example.com".to_string(),
                message_preview: format!("Commit {depth}"),
                branch_type: BranchType::Main,
            })
            .collect()
    }

    fn test_run(test_id: &str, result: TestResult) -> TestRun {
        TestRun {
            test_id: test_id.to_string(),
            result,
            duration_ms: 12,
            start_time: OffsetDateTime::UNIX_EPOCH,
            failure_message: None,
            failure_output: None,
            system_output: None,
        }
    }

    #[tokio::test]
    async fn test_insert_job_run_is_idempotent() {
        let db = memory_db().await;
        assert!(!db.job_run_exists(100).await.unwrap());
        let mut info = job(100, "c0", JobStatus::Success);
        info.changes_since_last_run = linear_parents(2).into_iter().map(Into::into).collect();
        assert!(db.insert_job_run(&info).await.unwrap());
        assert!(db.job_run_exists(100).await.unwrap());
        assert!(!db.insert_job_run(&info).await.unwrap());

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_runs")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
        let changes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_run_changes")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(changes, 2);
    }

    #[tokio::test]
    async fn test_insert_test_runs_replaces_previous_attempt() {
        let db = memory_db().await;
        let run = run_info(7, "unit-tests");
        let runs: Vec<_> = (0..5000)
            .map(|i| test_run(&format!("suite: case{i}"), TestResult::Success))
            .collect();
        db.insert_test_runs(&run, &runs).await.unwrap();
        db.insert_test_runs(&run, &runs[..3]).await.unwrap();
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM test_runs WHERE job_run_id = 7")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(rows, 3);
    }

    #[tokio::test]
    async fn test_commit_parents_exist() {
        let db = memory_db().await;
        assert!(!db.commit_parents_exist(1, "c0").await.unwrap());
        db.insert_commit_parents(&linear_parents(3)).await.unwrap();
        assert!(db.commit_parents_exist(1, "c0").await.unwrap());
        // Only depth 0 marks a resolved commit
        assert!(!db.commit_parents_exist(1, "c1").await.unwrap());
        assert!(!db.commit_parents_exist(2, "c0").await.unwrap());
        db.insert_commit_parents(&linear_parents(3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_changes_since_previous_run() {
        let db = memory_db().await;
        db.insert_commit_parents(&linear_parents(6)).await.unwrap();
        assert!(db.get_commit_changes(1, "c0", "unit-tests", "main").await.unwrap().is_empty());

        db.insert_job_run(&job(1, "c4", JobStatus::Success)).await.unwrap();
        db.insert_job_run(&job(2, "c2", JobStatus::Failed)).await.unwrap();
        let changes = db.get_commit_changes(1, "c0", "unit-tests", "main").await.unwrap();
        let shas: Vec<_> = changes.iter().map(|c| c.parent_commit_sha.as_str()).collect();
        assert_eq!(shas, ["c0", "c1"]);
        assert_eq!(changes[1].depth, 1);
        assert_eq!(changes[1].branch_type, BranchType::Main);

        // Other jobs and branches do not count as a previous run
        assert!(db.get_commit_changes(1, "c0", "lint", "main").await.unwrap().is_empty());
        assert!(db.get_commit_changes(1, "c0", "unit-tests", "dev").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_progress_job() {
        let db = memory_db().await;
        let info = InProgressJobInfo {
            run: run_info(55, "unit-tests"),
            started_at: None,
            triggered_by: None,
            pipeline_source: Some("web".to_string()),
            commit_sha: "c0".to_string(),
            commit_message: None,
            commit_author: None,
            changes_since_last_run: linear_parents(1).into_iter().map(Into::into).collect(),
        };
        assert!(!db.in_progress_job_exists(55).await.unwrap());
        assert!(db.insert_in_progress_job(&info).await.unwrap());
        assert!(db.in_progress_job_exists(55).await.unwrap());
        assert!(!db.insert_in_progress_job(&info).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_job_type() {
        let db = memory_db().await;
        db.insert_job_run(&job(1, "c0", JobStatus::Failed)).await.unwrap();
        assert!(!db.has_job_type(1, "unit-tests").await.unwrap());
        db.insert_job_run(&job(2, "c1", JobStatus::Success)).await.unwrap();
        assert!(db.has_job_type(1, "unit-tests").await.unwrap());
        assert!(db.has_job_type(1, "unit-tests").await.unwrap());
        assert!(!db.has_job_type(2, "unit-tests").await.unwrap());
    }
}
