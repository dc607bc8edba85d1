//! `tasks` projection: one `task_view` row per live or orphaned task plus
//! its visible tags in `task_tags`.
//!
//! # Invariants
//! - `task_tags` always holds `manual_tags ∪ inherited_tags` of its row.
//! - `version` is the sequence number of the last applied task event.
//! - Deleted tasks have no rows.

use super::{
    tags_from_json, tags_to_json, DomainEvent, Projection, ProjectionResult, StoreTarget,
};
use crate::aggregate::task::TaskEvent;
use crate::model::tags::{tag_key, TagSet};
use crate::store::StoredEvent;
use log::debug;
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension};

pub const TASK_VIEW_TABLE: &str = "task_view";
pub const TASK_TAGS_TABLE: &str = "task_tags";

pub struct TaskProjection;

impl Projection for TaskProjection {
    fn name(&self) -> &'static str {
        "tasks"
    }

    fn tables(&self) -> &'static [&'static str] {
        &[TASK_VIEW_TABLE, TASK_TAGS_TABLE]
    }

    fn create_tables(&self, conn: &Connection, target: StoreTarget) -> ProjectionResult<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {view} (
                task_id TEXT PRIMARY KEY NOT NULL,
                text TEXT NOT NULL,
                category_id TEXT,
                source_document_id TEXT,
                source_stable_id TEXT,
                source_line_number INTEGER,
                is_orphaned INTEGER NOT NULL DEFAULT 0,
                completed INTEGER NOT NULL DEFAULT 0,
                completed_at INTEGER,
                manual_tags TEXT NOT NULL DEFAULT '[]',
                inherited_tags TEXT NOT NULL DEFAULT '[]',
                last_seen_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                version INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {tags} (
                task_id TEXT NOT NULL,
                tag_key TEXT NOT NULL,
                tag TEXT NOT NULL,
                is_manual INTEGER NOT NULL,
                PRIMARY KEY (task_id, tag_key)
            );",
            view = target.table(TASK_VIEW_TABLE),
            tags = target.table(TASK_TAGS_TABLE),
        ))?;
        Ok(())
    }

    fn create_indexes(&self, conn: &Connection) -> ProjectionResult<()> {
        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_task_view_category
                ON task_view(category_id);
            CREATE INDEX IF NOT EXISTS idx_task_view_source
                ON task_view(source_document_id, is_orphaned);
            CREATE INDEX IF NOT EXISTS idx_task_tags_key
                ON task_tags(tag_key);",
        )?;
        Ok(())
    }

    fn apply(
        &self,
        conn: &Connection,
        target: StoreTarget,
        stored: &StoredEvent,
        event: &DomainEvent,
    ) -> ProjectionResult<()> {
        let DomainEvent::Task { task_id, event } = event else {
            return Ok(());
        };
        let writer = TaskViewWriter {
            conn,
            view: target.table(TASK_VIEW_TABLE),
            tags: target.table(TASK_TAGS_TABLE),
            task_id: task_id.to_string(),
            version: stored.sequence_number as i64,
            at: stored.occurred_at,
        };

        match event {
            TaskEvent::Created {
                text,
                category_id,
                source,
                inherited_tags,
                created_at,
                ..
            } => writer.insert(
                text,
                category_id.map(|id| id.to_string()),
                source.as_ref(),
                inherited_tags,
                *created_at,
            ),
            TaskEvent::Renamed { text } => writer.update("text = ?", &[text]),
            TaskEvent::Completed { completed_at } => {
                writer.update("completed = 1, completed_at = ?", &[completed_at])
            }
            TaskEvent::Reopened => writer.update("completed = 0, completed_at = NULL", &[]),
            TaskEvent::Moved {
                category_id,
                inherited_tags,
            } => {
                let category_id = category_id.map(|id| id.to_string());
                writer.update("category_id = ?", &[&category_id])?;
                writer.replace_tags(None, Some(inherited_tags))
            }
            TaskEvent::ManualTagsSet { tags } => writer.replace_tags(Some(tags), None),
            TaskEvent::InheritedTagsRefreshed { tags } => writer.replace_tags(None, Some(tags)),
            TaskEvent::Orphaned { .. } => writer.update("is_orphaned = 1", &[]),
            TaskEvent::LastSeen { seen_at } => writer.update("last_seen_at = ?", &[seen_at]),
            TaskEvent::Deleted { .. } => writer.delete(),
        }
    }
}

struct TaskViewWriter<'a> {
    conn: &'a Connection,
    view: String,
    tags: String,
    task_id: String,
    version: i64,
    at: i64,
}

impl TaskViewWriter<'_> {
    fn insert(
        &self,
        text: &str,
        category_id: Option<String>,
        source: Option<&crate::aggregate::task::TaskSource>,
        inherited_tags: &TagSet,
        created_at: i64,
    ) -> ProjectionResult<()> {
        let manual_tags = TagSet::new();
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (
                    task_id, text, category_id,
                    source_document_id, source_stable_id, source_line_number,
                    is_orphaned, completed, completed_at,
                    manual_tags, inherited_tags,
                    last_seen_at, created_at, updated_at, version
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, NULL, ?7, ?8, ?9, ?10, ?11, ?12);",
                self.view
            ),
            params![
                self.task_id.as_str(),
                text,
                category_id,
                source.map(|source| source.document_id.to_string()),
                source.map(|source| source.stable_id.as_str()),
                source.map(|source| source.line_number),
                tags_to_json(&manual_tags)?,
                tags_to_json(inherited_tags)?,
                source.map(|_| created_at),
                created_at,
                self.at,
                self.version,
            ],
        )?;
        self.write_tag_rows(&manual_tags, inherited_tags)
    }

    /// Runs `SET {assignments}` on the row and bumps version metadata.
    fn update(&self, assignments: &str, values: &[&dyn ToSql]) -> ProjectionResult<()> {
        let sql = format!(
            "UPDATE {} SET {assignments}, version = ?, updated_at = ? WHERE task_id = ?;",
            self.view
        );
        let mut bound: Vec<&dyn ToSql> = values.to_vec();
        bound.push(&self.version);
        bound.push(&self.at);
        bound.push(&self.task_id);
        let changed = self.conn.execute(&sql, bound.as_slice())?;
        if changed == 0 {
            debug!(
                "event=projection_apply module=projection status=missing_row projection=tasks task_id={}",
                self.task_id
            );
        }
        Ok(())
    }

    fn replace_tags(
        &self,
        manual: Option<&TagSet>,
        inherited: Option<&TagSet>,
    ) -> ProjectionResult<()> {
        let current: Option<(String, String)> = self
            .conn
            .query_row(
                &format!(
                    "SELECT manual_tags, inherited_tags FROM {} WHERE task_id = ?1;",
                    self.view
                ),
                [self.task_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((current_manual, current_inherited)) = current else {
            debug!(
                "event=projection_apply module=projection status=missing_row projection=tasks task_id={}",
                self.task_id
            );
            return Ok(());
        };

        let manual = match manual {
            Some(tags) => tags.clone(),
            None => tags_from_json(&current_manual, "task_view.manual_tags")?,
        };
        let inherited = match inherited {
            Some(tags) => tags.clone(),
            None => tags_from_json(&current_inherited, "task_view.inherited_tags")?,
        };

        let manual_json = tags_to_json(&manual)?;
        let inherited_json = tags_to_json(&inherited)?;
        self.update(
            "manual_tags = ?, inherited_tags = ?",
            &[&manual_json, &inherited_json],
        )?;
        self.write_tag_rows(&manual, &inherited)
    }

    fn write_tag_rows(&self, manual: &TagSet, inherited: &TagSet) -> ProjectionResult<()> {
        self.conn.execute(
            &format!("DELETE FROM {} WHERE task_id = ?1;", self.tags),
            [self.task_id.as_str()],
        )?;
        let mut stmt = self.conn.prepare(&format!(
            "INSERT INTO {} (task_id, tag_key, tag, is_manual) VALUES (?1, ?2, ?3, ?4);",
            self.tags
        ))?;
        for tag in manual.union(inherited).iter() {
            stmt.execute(params![
                self.task_id.as_str(),
                tag_key(tag),
                tag,
                manual.contains(tag) as i64
            ])?;
        }
        Ok(())
    }

    fn delete(&self) -> ProjectionResult<()> {
        self.conn.execute(
            &format!("DELETE FROM {} WHERE task_id = ?1;", self.tags),
            [self.task_id.as_str()],
        )?;
        self.conn.execute(
            &format!("DELETE FROM {} WHERE task_id = ?1;", self.view),
            [self.task_id.as_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::TaskProjection;
    use crate::aggregate::task::TaskEvent;
    use crate::db::open_db_in_memory;
    use crate::model::tags::TagSet;
    use crate::projection::{DomainEvent, Projection, StoreTarget};
    use crate::store::StoredEvent;
    use uuid::Uuid;

    fn stored(sequence_number: u64) -> StoredEvent {
        StoredEvent {
            stream_id: String::new(),
            aggregate_type: "task".to_string(),
            sequence_number,
            event_type: String::new(),
            payload: String::new(),
            occurred_at: 100 + sequence_number as i64,
            global_position: sequence_number,
        }
    }

    #[test]
    fn tag_rows_follow_manual_and_inherited_sets() {
        let conn = open_db_in_memory().unwrap();
        let projection = TaskProjection;
        projection.create_tables(&conn, StoreTarget::Live).unwrap();
        let task_id = Uuid::new_v4();

        let events = [
            TaskEvent::Created {
                task_id,
                text: "call Alice".to_string(),
                category_id: None,
                source: None,
                inherited_tags: TagSet::from_tags(["work"]),
                created_at: 100,
            },
            TaskEvent::ManualTagsSet {
                tags: TagSet::from_tags(["Work", "today"]),
            },
        ];
        for (index, event) in events.into_iter().enumerate() {
            projection
                .apply(
                    &conn,
                    StoreTarget::Live,
                    &stored(index as u64 + 1),
                    &DomainEvent::Task { task_id, event },
                )
                .unwrap();
        }

        let mut stmt = conn
            .prepare("SELECT tag, is_manual FROM task_tags WHERE task_id = ?1 ORDER BY tag_key;")
            .unwrap();
        let rows: Vec<(String, i64)> = stmt
            .query_map([task_id.to_string()], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            rows,
            vec![("today".to_string(), 1), ("Work".to_string(), 1)]
        );

        let version: i64 = conn
            .query_row("SELECT version FROM task_view;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }
}
