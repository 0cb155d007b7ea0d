use rusqlite::params;

use crate::error::{Result, StorageError};
use crate::source::SqliteSource;
use crate::types::DelayedTask;

impl SqliteSource {
    /// Persist a delayed task. Task ids are caller-chosen; inserting an id
    /// that already exists is an idempotent no-op and returns `false`.
    pub fn schedule_task(&self, task: &DelayedTask) -> Result<bool> {
        self.check_writable()?;
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO delayed_tasks (id, fire_at, function, kwargs, is_done)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    task.id,
                    task.fire_at,
                    task.function,
                    task.kwargs.to_string(),
                    task.is_done,
                ],
            )?;
            Ok(n > 0)
        })
    }

    pub fn get_task(&self, id: &str) -> Result<DelayedTask> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, fire_at, function, kwargs, is_done FROM delayed_tasks WHERE id = ?1",
                [id],
                row_to_task,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StorageError::NotFound(format!("delayed task {id}"))
                }
                other => other.into(),
            })
        })
    }

    /// Undone tasks whose fire time has arrived, oldest first.
    pub fn due_tasks(&self, now: i64) -> Result<Vec<DelayedTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, fire_at, function, kwargs, is_done FROM delayed_tasks
                 WHERE is_done = 0 AND fire_at <= ?1 ORDER BY fire_at",
            )?;
            let rows = stmt.query_map([now], row_to_task)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// Terminal flip. Used both for claim-after-success and for cancellation.
    pub fn set_task_done(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            let n = conn.execute("UPDATE delayed_tasks SET is_done = 1 WHERE id = ?1", [id])?;
            if n == 0 {
                return Err(StorageError::NotFound(format!("delayed task {id}")));
            }
            Ok(())
        })
    }

    pub fn pending_task_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM delayed_tasks WHERE is_done = 0",
                [],
                |r| r.get(0),
            )?)
        })
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<DelayedTask> {
    let kwargs_str: String = row.get(3)?;
    Ok(DelayedTask {
        id: row.get(0)?,
        fire_at: row.get(1)?,
        function: row.get(2)?,
        kwargs: serde_json::from_str(&kwargs_str).unwrap_or(serde_json::Value::Null),
        is_done: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::open_migrated;

    fn task(id: &str, fire_at: i64) -> DelayedTask {
        DelayedTask {
            id: id.to_string(),
            fire_at,
            function: "notify".to_string(),
            kwargs: serde_json::json!({ "chat": -100, "text": "hi" }),
            is_done: false,
        }
    }

    #[test]
    fn duplicate_id_is_noop() {
        let (_dir, src) = open_migrated();
        assert!(src.schedule_task(&task("rem-1", 100)).unwrap());
        // Second insert with the same id changes nothing, even with a new fire time.
        assert!(!src.schedule_task(&task("rem-1", 999)).unwrap());
        assert_eq!(src.get_task("rem-1").unwrap().fire_at, 100);
        assert_eq!(src.pending_task_count().unwrap(), 1);
    }

    #[test]
    fn due_tasks_respect_fire_time() {
        let (_dir, src) = open_migrated();
        src.schedule_task(&task("early", 100)).unwrap();
        src.schedule_task(&task("late", 200)).unwrap();

        let due = src.due_tasks(150).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "early");
        assert_eq!(due[0].kwargs["text"], "hi");

        src.set_task_done("early").unwrap();
        assert!(src.due_tasks(150).unwrap().is_empty());
    }

    #[test]
    fn done_is_terminal_for_queries() {
        let (_dir, src) = open_migrated();
        src.schedule_task(&task("x", 100)).unwrap();
        src.set_task_done("x").unwrap();
        assert!(src.due_tasks(1_000_000).unwrap().is_empty());
        assert!(src.get_task("x").unwrap().is_done);
    }
}
