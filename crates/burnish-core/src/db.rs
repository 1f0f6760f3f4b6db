use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    Category, Project, Run, RunStatus, RunStep, RunType, StepKind, StepStatus, Ticket,
    TicketMetadata, TicketStatus,
};

const SCHEMA_SQL: &str = include_str!("../schema.sql");

/// Typed repository over `state.sqlite`. The connection is guarded by a
/// `std::sync::Mutex`; callers never hold it across an await point.
pub struct Store {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn now_str() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn json_vec(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let created_at_str: String = row.get(3)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        root_path: row.get(2)?,
        created_at: parse_ts(&created_at_str),
    })
}

fn row_to_ticket(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ticket> {
    let category: String = row.get(3)?;
    let status: String = row.get(4)?;
    let allowed: String = row.get(5)?;
    let forbidden: String = row.get(6)?;
    let verification: String = row.get(7)?;
    let metadata: String = row.get(8)?;
    let created_at_str: String = row.get(9)?;
    Ok(Ticket {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(10)?,
        category: Category::parse(&category).unwrap_or(Category::Fix),
        status: TicketStatus::parse(&status).unwrap_or(TicketStatus::Blocked),
        allowed_paths: json_vec(&allowed),
        forbidden_paths: json_vec(&forbidden),
        verification_commands: json_vec(&verification),
        metadata: serde_json::from_str::<TicketMetadata>(&metadata).unwrap_or_default(),
        created_at: parse_ts(&created_at_str),
    })
}

const TICKET_COLS: &str = "id, project_id, title, category, status, allowed_paths, \
     forbidden_paths, verification_commands, metadata, created_at, description";

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let run_type: String = row.get(2)?;
    let status: String = row.get(4)?;
    let created_at_str: String = row.get(8)?;
    let finished_at_str: Option<String> = row.get(9)?;
    Ok(Run {
        id: row.get(0)?,
        project_id: row.get(1)?,
        run_type: if run_type == "session" {
            RunType::Session
        } else {
            RunType::Worker
        },
        ticket_id: row.get(3)?,
        status: match status.as_str() {
            "success" => RunStatus::Success,
            "failure" => RunStatus::Failure,
            _ => RunStatus::Running,
        },
        branch: row.get(5)?,
        pr_url: row.get(6)?,
        error: row.get(7)?,
        created_at: parse_ts(&created_at_str),
        finished_at: finished_at_str.map(|s| parse_ts(&s)),
    })
}

const RUN_COLS: &str =
    "id, project_id, run_type, ticket_id, status, branch, pr_url, error, created_at, finished_at";

fn row_to_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunStep> {
    let kind: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(RunStep {
        id: row.get(0)?,
        run_id: row.get(1)?,
        ordinal: row.get(2)?,
        name: row.get(3)?,
        kind: match kind.as_str() {
            "git" => StepKind::Git,
            "command" => StepKind::Command,
            _ => StepKind::Internal,
        },
        status: match status.as_str() {
            "running" => StepStatus::Running,
            "success" => StepStatus::Success,
            "failed" => StepStatus::Failed,
            "skipped" => StepStatus::Skipped,
            _ => StepStatus::Queued,
        },
        duration_ms: row.get(6)?,
        error: row.get(7)?,
    })
}

// ── Store impl ────────────────────────────────────────────────────────────

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────────

    /// Find-or-create the project row for a repository root.
    pub fn upsert_project(&self, name: &str, root_path: &str) -> Result<Project> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let existing = conn
            .query_row(
                "SELECT id, name, root_path, created_at FROM projects WHERE root_path = ?1",
                params![root_path],
                row_to_project,
            )
            .optional()
            .context("upsert_project select")?;
        if let Some(p) = existing {
            return Ok(p);
        }
        conn.execute(
            "INSERT INTO projects (name, root_path, created_at) VALUES (?1, ?2, ?3)",
            params![name, root_path, now_str()],
        )
        .context("upsert_project insert")?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            "SELECT id, name, root_path, created_at FROM projects WHERE id = ?1",
            params![id],
            row_to_project,
        )
        .context("upsert_project reselect")
    }

    // ── Tickets ───────────────────────────────────────────────────────────

    pub fn insert_ticket(&self, ticket: &Ticket) -> Result<i64> {
        if ticket.allowed_paths.is_empty() {
            bail!("ticket {:?} has no allowed_paths", ticket.title);
        }
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO tickets (project_id, title, description, category, status, \
             allowed_paths, forbidden_paths, verification_commands, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                ticket.project_id,
                ticket.title,
                ticket.description,
                ticket.category.as_str(),
                ticket.status.as_str(),
                serde_json::to_string(&ticket.allowed_paths)?,
                serde_json::to_string(&ticket.forbidden_paths)?,
                serde_json::to_string(&ticket.verification_commands)?,
                serde_json::to_string(&ticket.metadata)?,
                now_str(),
            ],
        )
        .context("insert_ticket")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_ticket(&self, id: i64) -> Result<Option<Ticket>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {TICKET_COLS} FROM tickets WHERE id = ?1"),
            params![id],
            row_to_ticket,
        )
        .optional()
        .context("get_ticket")
    }

    pub fn update_ticket_status(&self, id: i64, status: TicketStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tickets SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )
        .context("update_ticket_status")?;
        Ok(())
    }

    /// Widen a ticket's scope after the agent reports `scope_expanded`.
    pub fn update_ticket_scope(
        &self,
        id: i64,
        allowed_paths: &[String],
        forbidden_paths: &[String],
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tickets SET allowed_paths = ?1, forbidden_paths = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(allowed_paths)?,
                serde_json::to_string(forbidden_paths)?,
                id
            ],
        )
        .context("update_ticket_scope")?;
        Ok(())
    }

    pub fn list_tickets_by_status(&self, status: TicketStatus) -> Result<Vec<Ticket>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TICKET_COLS} FROM tickets WHERE status = ?1 ORDER BY id ASC"
        ))?;
        let tickets = stmt
            .query_map(params![status.as_str()], row_to_ticket)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_tickets_by_status")?;
        Ok(tickets)
    }

    /// Titles of tickets that could still collide with a new proposal.
    pub fn open_ticket_titles(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT title FROM tickets WHERE status IN ('ready', 'in_progress', 'leased') \
             ORDER BY id ASC",
        )?;
        let titles = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("open_ticket_titles")?;
        Ok(titles)
    }

    /// Reset tickets stranded by a crashed session back to ready.
    pub fn reset_stale_tickets(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE tickets SET status = 'ready' \
                 WHERE status IN ('in_progress', 'leased') \
                 AND id NOT IN (SELECT ticket_id FROM runs \
                                WHERE ticket_id IS NOT NULL AND status = 'running')",
                [],
            )
            .context("reset_stale_tickets")?;
        Ok(n)
    }

    pub fn count_tickets(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM tickets GROUP BY status ORDER BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("count_tickets")?;
        Ok(counts)
    }

    // ── Runs ──────────────────────────────────────────────────────────────

    /// Insert a run. Enforces the invariant of at most one active run per
    /// ticket.
    pub fn insert_run(
        &self,
        project_id: i64,
        run_type: RunType,
        ticket_id: Option<i64>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tid) = ticket_id {
            let active: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM runs WHERE ticket_id = ?1 AND status = 'running'",
                    params![tid],
                    |row| row.get(0),
                )
                .context("insert_run active check")?;
            if active > 0 {
                bail!("ticket #{tid} already has an active run");
            }
        }
        conn.execute(
            "INSERT INTO runs (project_id, run_type, ticket_id, status, created_at) \
             VALUES (?1, ?2, ?3, 'running', ?4)",
            params![project_id, run_type.as_str(), ticket_id, now_str()],
        )
        .context("insert_run")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {RUN_COLS} FROM runs WHERE id = ?1"),
            params![id],
            row_to_run,
        )
        .optional()
        .context("get_run")
    }

    pub fn set_run_branch(&self, id: i64, branch: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE runs SET branch = ?1 WHERE id = ?2",
            params![branch, id],
        )
        .context("set_run_branch")?;
        Ok(())
    }

    pub fn set_run_pr_url(&self, id: i64, pr_url: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE runs SET pr_url = ?1 WHERE id = ?2",
            params![pr_url, id],
        )
        .context("set_run_pr_url")?;
        Ok(())
    }

    pub fn finish_run(&self, id: i64, status: RunStatus, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE runs SET status = ?1, error = ?2, finished_at = ?3 WHERE id = ?4",
            params![status.as_str(), error, now_str(), id],
        )
        .context("finish_run")?;
        Ok(())
    }

    pub fn runs_for_ticket(&self, ticket_id: i64) -> Result<Vec<Run>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLS} FROM runs WHERE ticket_id = ?1 ORDER BY id ASC"
        ))?;
        let runs = stmt
            .query_map(params![ticket_id], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("runs_for_ticket")?;
        Ok(runs)
    }

    // ── Run steps ─────────────────────────────────────────────────────────

    pub fn add_step(&self, run_id: i64, ordinal: i64, name: &str, kind: StepKind) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO run_steps (run_id, ordinal, name, kind, status) \
             VALUES (?1, ?2, ?3, ?4, 'running')",
            params![run_id, ordinal, name, kind.as_str()],
        )
        .context("add_step")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_step(
        &self,
        id: i64,
        status: StepStatus,
        duration_ms: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE run_steps SET status = ?1, duration_ms = ?2, error = ?3 WHERE id = ?4",
            params![status.as_str(), duration_ms, error, id],
        )
        .context("finish_step")?;
        Ok(())
    }

    pub fn list_steps(&self, run_id: i64) -> Result<Vec<RunStep>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, run_id, ordinal, name, kind, status, duration_ms, error \
             FROM run_steps WHERE run_id = ?1 ORDER BY ordinal ASC",
        )?;
        let steps = stmt
            .query_map(params![run_id], row_to_step)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_steps")?;
        Ok(steps)
    }
}
