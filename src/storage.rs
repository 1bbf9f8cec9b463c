use crate::models::{ExecStatus, Execution, Run, RunStatus, Signal};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("execution already recorded for run {run_id} call {call_index}")]
    ExecutionExists { run_id: i64, call_index: i64 },
    #[error("run {run_id} not found")]
    RunNotFound { run_id: i64 },
    #[error("invalid status `{value}` in database")]
    InvalidStatus { value: String },
    #[error("stored signal is not valid json: {source}")]
    SignalColumn {
        #[source]
        source: serde_json::Error,
    },
}

fn sql_error(source: rusqlite::Error) -> StorageError {
    StorageError::Sql { source }
}

/// The durable execution log and run store. One SQLite file; every
/// operation is its own short transaction, so a crash between operations
/// never leaves a record half-written.
#[derive(Debug, Clone)]
pub struct Storage {
    db_path: PathBuf,
}

impl Storage {
    pub fn open(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StorageError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let storage = Self {
            db_path: db_path.to_path_buf(),
        };
        storage.migrate()?;
        Ok(storage)
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        Connection::open(&self.db_path).map_err(|source| StorageError::Open {
            path: self.db_path.display().to_string(),
            source,
        })
    }

    fn migrate(&self) -> Result<(), StorageError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_at INTEGER NOT NULL,
                    completed_at INTEGER,
                    initial_prompt TEXT NOT NULL,
                    spec_name TEXT NOT NULL,
                    spec_path TEXT NOT NULL DEFAULT '',
                    workspace_path TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    current_agent TEXT NOT NULL DEFAULT '',
                    error TEXT NOT NULL DEFAULT '',
                    waiting_reason TEXT NOT NULL DEFAULT '',
                    waiting_session_id TEXT NOT NULL DEFAULT ''
                );

                CREATE TABLE IF NOT EXISTS executions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id),
                    agent_name TEXT NOT NULL,
                    session_id TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    exit_code INTEGER,
                    started_at INTEGER,
                    completed_at INTEGER,
                    output_signal TEXT,
                    sequence_num INTEGER NOT NULL,
                    call_index INTEGER NOT NULL,
                    prompt TEXT NOT NULL DEFAULT '',
                    pid INTEGER,
                    UNIQUE(run_id, call_index),
                    UNIQUE(run_id, sequence_num)
                );

                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_executions_run ON executions(run_id);
                ",
            )
            .map_err(sql_error)
    }

    // Run operations

    pub fn create_run(&self, run: &Run) -> Result<i64, StorageError> {
        let connection = self.connect()?;
        connection
            .execute(
                "INSERT INTO runs (created_at, completed_at, initial_prompt, spec_name,
                     spec_path, workspace_path, status, current_agent, error,
                     waiting_reason, waiting_session_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    run.created_at,
                    run.completed_at,
                    run.initial_prompt,
                    run.spec_name,
                    run.spec_path,
                    run.workspace_path,
                    run.status.as_str(),
                    run.current_agent,
                    run.error,
                    run.waiting_reason,
                    run.waiting_session_id,
                ],
            )
            .map_err(sql_error)?;
        Ok(connection.last_insert_rowid())
    }

    pub fn get_run(&self, run_id: i64) -> Result<Run, StorageError> {
        let connection = self.connect()?;
        let raw = connection
            .query_row(
                "SELECT id, created_at, completed_at, initial_prompt, spec_name, spec_path,
                        workspace_path, status, current_agent, error, waiting_reason,
                        waiting_session_id
                 FROM runs WHERE id = ?1",
                params![run_id],
                raw_run_from_row,
            )
            .optional()
            .map_err(sql_error)?;
        match raw {
            Some(raw) => raw.into_run(),
            None => Err(StorageError::RunNotFound { run_id }),
        }
    }

    pub fn update_run(&self, run: &Run) -> Result<(), StorageError> {
        let connection = self.connect()?;
        connection
            .execute(
                "UPDATE runs SET completed_at = ?1, workspace_path = ?2, status = ?3,
                        current_agent = ?4, error = ?5, waiting_reason = ?6,
                        waiting_session_id = ?7
                 WHERE id = ?8",
                params![
                    run.completed_at,
                    run.workspace_path,
                    run.status.as_str(),
                    run.current_agent,
                    run.error,
                    run.waiting_reason,
                    run.waiting_session_id,
                    run.id,
                ],
            )
            .map_err(sql_error)?;
        Ok(())
    }

    pub fn list_runs(&self, limit: i64) -> Result<Vec<Run>, StorageError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "SELECT id, created_at, completed_at, initial_prompt, spec_name, spec_path,
                        workspace_path, status, current_agent, error, waiting_reason,
                        waiting_session_id
                 FROM runs ORDER BY created_at DESC, id DESC LIMIT ?1",
            )
            .map_err(sql_error)?;
        let rows = statement
            .query_map(params![limit], raw_run_from_row)
            .map_err(sql_error)?;
        let mut runs = Vec::new();
        for raw in rows {
            runs.push(raw.map_err(sql_error)?.into_run()?);
        }
        Ok(runs)
    }

    pub fn delete_run(&self, run_id: i64) -> Result<(), StorageError> {
        let mut connection = self.connect()?;
        let tx = connection.transaction().map_err(sql_error)?;
        tx.execute("DELETE FROM executions WHERE run_id = ?1", params![run_id])
            .map_err(sql_error)?;
        tx.execute("DELETE FROM runs WHERE id = ?1", params![run_id])
            .map_err(sql_error)?;
        tx.commit().map_err(sql_error)
    }

    // Execution log operations

    /// Append a new record. Fails with `ExecutionExists` when a record for
    /// `(run_id, call_index)` is already present; callers must look the
    /// index up first.
    pub fn create_execution(&self, exec: &Execution) -> Result<i64, StorageError> {
        let connection = self.connect()?;
        let signal_json = signal_to_column(exec.output_signal.as_ref())?;
        let result = connection.execute(
            "INSERT INTO executions (run_id, agent_name, session_id, status, exit_code,
                 started_at, completed_at, output_signal, sequence_num, call_index,
                 prompt, pid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                exec.run_id,
                exec.agent_name,
                exec.session_id,
                exec.status.as_str(),
                exec.exit_code,
                exec.started_at,
                exec.completed_at,
                signal_json,
                exec.sequence_num,
                exec.call_index,
                exec.prompt,
                exec.pid,
            ],
        );
        match result {
            Ok(_) => Ok(connection.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::ExecutionExists {
                    run_id: exec.run_id,
                    call_index: exec.call_index,
                })
            }
            Err(source) => Err(sql_error(source)),
        }
    }

    pub fn execution_by_call_index(
        &self,
        run_id: i64,
        call_index: i64,
    ) -> Result<Option<Execution>, StorageError> {
        let connection = self.connect()?;
        let raw = connection
            .query_row(
                &format!("{EXECUTION_SELECT} WHERE run_id = ?1 AND call_index = ?2"),
                params![run_id, call_index],
                raw_execution_from_row,
            )
            .optional()
            .map_err(sql_error)?;
        raw.map(RawExecution::into_execution).transpose()
    }

    pub fn executions_for_run(&self, run_id: i64) -> Result<Vec<Execution>, StorageError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(&format!(
                "{EXECUTION_SELECT} WHERE run_id = ?1 ORDER BY sequence_num"
            ))
            .map_err(sql_error)?;
        let rows = statement
            .query_map(params![run_id], raw_execution_from_row)
            .map_err(sql_error)?;
        let mut execs = Vec::new();
        for raw in rows {
            execs.push(raw.map_err(sql_error)?.into_execution()?);
        }
        Ok(execs)
    }

    pub fn running_execution_for_run(
        &self,
        run_id: i64,
    ) -> Result<Option<Execution>, StorageError> {
        let connection = self.connect()?;
        let raw = connection
            .query_row(
                &format!(
                    "{EXECUTION_SELECT} WHERE run_id = ?1 AND status IN ('running', 'waiting_human')
                     ORDER BY sequence_num DESC LIMIT 1"
                ),
                params![run_id],
                raw_execution_from_row,
            )
            .optional()
            .map_err(sql_error)?;
        raw.map(RawExecution::into_execution).transpose()
    }

    pub fn next_sequence_num(&self, run_id: i64) -> Result<i64, StorageError> {
        let connection = self.connect()?;
        connection
            .query_row(
                "SELECT COALESCE(MAX(sequence_num), 0) + 1 FROM executions WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .map_err(sql_error)
    }

    pub fn update_execution(&self, exec: &Execution) -> Result<(), StorageError> {
        let connection = self.connect()?;
        let signal_json = signal_to_column(exec.output_signal.as_ref())?;
        connection
            .execute(
                "UPDATE executions SET agent_name = ?1, session_id = ?2, status = ?3,
                        exit_code = ?4, started_at = ?5, completed_at = ?6,
                        output_signal = ?7, prompt = ?8, pid = ?9
                 WHERE id = ?10",
                params![
                    exec.agent_name,
                    exec.session_id,
                    exec.status.as_str(),
                    exec.exit_code,
                    exec.started_at,
                    exec.completed_at,
                    signal_json,
                    exec.prompt,
                    exec.pid,
                    exec.id,
                ],
            )
            .map_err(sql_error)?;
        Ok(())
    }

    /// Persisted before any long blocking work so an operator can kill the
    /// agent even after the engine host process dies.
    pub fn update_execution_pid(&self, exec_id: i64, pid: i64) -> Result<(), StorageError> {
        let connection = self.connect()?;
        connection
            .execute(
                "UPDATE executions SET pid = ?1 WHERE id = ?2",
                params![pid, exec_id],
            )
            .map_err(sql_error)?;
        Ok(())
    }

    /// Atomically store the signal and flip the record to `complete`. Once
    /// this returns, any later `execution_by_call_index` sees the same
    /// stored signal.
    pub fn finalize_execution(
        &self,
        exec: &mut Execution,
        signal: Signal,
        exit_code: Option<i64>,
        session_id: &str,
        completed_at: i64,
    ) -> Result<(), StorageError> {
        exec.status = ExecStatus::Complete;
        exec.output_signal = Some(signal);
        exec.exit_code = exit_code;
        if !session_id.is_empty() {
            exec.session_id = session_id.to_string();
        }
        exec.completed_at = Some(completed_at);
        self.update_execution(exec)
    }

    pub fn mark_execution_waiting(
        &self,
        exec: &mut Execution,
        session_id: &str,
    ) -> Result<(), StorageError> {
        exec.status = ExecStatus::WaitingHuman;
        if !session_id.is_empty() {
            exec.session_id = session_id.to_string();
        }
        self.update_execution(exec)
    }

    pub fn mark_execution_failed(
        &self,
        exec: &mut Execution,
        completed_at: i64,
    ) -> Result<(), StorageError> {
        exec.status = ExecStatus::Failed;
        exec.completed_at = Some(completed_at);
        self.update_execution(exec)
    }

    /// Drop every record past `call_index`. Only used when divergence is
    /// detected between the script and the cached log tail.
    pub fn invalidate_executions_after(
        &self,
        run_id: i64,
        call_index: i64,
    ) -> Result<usize, StorageError> {
        let connection = self.connect()?;
        connection
            .execute(
                "DELETE FROM executions WHERE run_id = ?1 AND call_index > ?2",
                params![run_id, call_index],
            )
            .map_err(sql_error)
    }
}

const EXECUTION_SELECT: &str = "SELECT id, run_id, agent_name, session_id, status, exit_code,
        started_at, completed_at, output_signal, sequence_num, call_index, prompt, pid
 FROM executions";

struct RawRun {
    id: i64,
    created_at: i64,
    completed_at: Option<i64>,
    initial_prompt: String,
    spec_name: String,
    spec_path: String,
    workspace_path: String,
    status: String,
    current_agent: String,
    error: String,
    waiting_reason: String,
    waiting_session_id: String,
}

fn raw_run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        created_at: row.get(1)?,
        completed_at: row.get(2)?,
        initial_prompt: row.get(3)?,
        spec_name: row.get(4)?,
        spec_path: row.get(5)?,
        workspace_path: row.get(6)?,
        status: row.get(7)?,
        current_agent: row.get(8)?,
        error: row.get(9)?,
        waiting_reason: row.get(10)?,
        waiting_session_id: row.get(11)?,
    })
}

impl RawRun {
    fn into_run(self) -> Result<Run, StorageError> {
        let status =
            RunStatus::parse(&self.status).ok_or(StorageError::InvalidStatus { value: self.status })?;
        Ok(Run {
            id: self.id,
            created_at: self.created_at,
            completed_at: self.completed_at,
            initial_prompt: self.initial_prompt,
            spec_name: self.spec_name,
            spec_path: self.spec_path,
            workspace_path: self.workspace_path,
            status,
            current_agent: self.current_agent,
            error: self.error,
            waiting_reason: self.waiting_reason,
            waiting_session_id: self.waiting_session_id,
        })
    }
}

struct RawExecution {
    id: i64,
    run_id: i64,
    agent_name: String,
    session_id: String,
    status: String,
    exit_code: Option<i64>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    output_signal: Option<String>,
    sequence_num: i64,
    call_index: i64,
    prompt: String,
    pid: Option<i64>,
}

fn raw_execution_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawExecution> {
    Ok(RawExecution {
        id: row.get(0)?,
        run_id: row.get(1)?,
        agent_name: row.get(2)?,
        session_id: row.get(3)?,
        status: row.get(4)?,
        exit_code: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        output_signal: row.get(8)?,
        sequence_num: row.get(9)?,
        call_index: row.get(10)?,
        prompt: row.get(11)?,
        pid: row.get(12)?,
    })
}

impl RawExecution {
    fn into_execution(self) -> Result<Execution, StorageError> {
        let status =
            ExecStatus::parse(&self.status).ok_or(StorageError::InvalidStatus { value: self.status })?;
        let output_signal = match self.output_signal {
            Some(raw) => Some(
                serde_json::from_str(&raw).map_err(|source| StorageError::SignalColumn { source })?,
            ),
            None => None,
        };
        Ok(Execution {
            id: self.id,
            run_id: self.run_id,
            agent_name: self.agent_name,
            session_id: self.session_id,
            status,
            exit_code: self.exit_code,
            started_at: self.started_at,
            completed_at: self.completed_at,
            output_signal,
            sequence_num: self.sequence_num,
            call_index: self.call_index,
            prompt: self.prompt,
            pid: self.pid,
        })
    }
}

fn signal_to_column(signal: Option<&Signal>) -> Result<Option<String>, StorageError> {
    signal
        .map(|signal| {
            serde_json::to_string(signal).map_err(|source| StorageError::SignalColumn { source })
        })
        .transpose()
}
