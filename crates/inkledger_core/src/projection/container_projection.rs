//! `containers` projection: the category hierarchy and registered documents.
//!
//! # Invariants
//! - Deleted categories and removed documents have no rows.
//! - `parent_id` is copied as-is; cycle prevention happens on the command side.

use super::{tags_to_json, DomainEvent, Projection, ProjectionResult, StoreTarget};
use crate::aggregate::category::CategoryEvent;
use crate::aggregate::document::DocumentEvent;
use crate::model::tags::TagSet;
use crate::model::CategoryId;
use crate::store::StoredEvent;
use log::debug;
use rusqlite::types::ToSql;
use rusqlite::{params, Connection};

pub const CATEGORY_VIEW_TABLE: &str = "category_view";
pub const DOCUMENT_VIEW_TABLE: &str = "document_view";

pub struct ContainerProjection;

impl Projection for ContainerProjection {
    fn name(&self) -> &'static str {
        "containers"
    }

    fn tables(&self) -> &'static [&'static str] {
        &[CATEGORY_VIEW_TABLE, DOCUMENT_VIEW_TABLE]
    }

    fn create_tables(&self, conn: &Connection, target: StoreTarget) -> ProjectionResult<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {categories} (
                category_id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                parent_id TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                inherit_to_children INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL,
                version INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {documents} (
                document_id TEXT PRIMARY KEY NOT NULL,
                file_path TEXT NOT NULL,
                category_id TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                updated_at INTEGER NOT NULL,
                version INTEGER NOT NULL
            );",
            categories = target.table(CATEGORY_VIEW_TABLE),
            documents = target.table(DOCUMENT_VIEW_TABLE),
        ))?;
        Ok(())
    }

    fn create_indexes(&self, conn: &Connection) -> ProjectionResult<()> {
        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_category_view_parent
                ON category_view(parent_id);
            CREATE INDEX IF NOT EXISTS idx_document_view_path
                ON document_view(file_path);
            CREATE INDEX IF NOT EXISTS idx_document_view_category
                ON document_view(category_id);",
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
        let version = stored.sequence_number as i64;
        let at = stored.occurred_at;
        match event {
            DomainEvent::Category { category_id, event } => {
                let table = target.table(CATEGORY_VIEW_TABLE);
                let id = category_id.to_string();
                match event {
                    CategoryEvent::Created {
                        name,
                        parent_id,
                        tags,
                        inherit_to_children,
                        ..
                    } => {
                        conn.execute(
                            &format!(
                                "INSERT OR REPLACE INTO {table}
                                    (category_id, name, parent_id, tags, inherit_to_children, updated_at, version)
                                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);"
                            ),
                            params![
                                id,
                                name,
                                parent_id.map(|parent| parent.to_string()),
                                tags_to_json(tags)?,
                                *inherit_to_children as i64,
                                at,
                                version,
                            ],
                        )?;
                        Ok(())
                    }
                    CategoryEvent::Renamed { name } => {
                        update_row(
                            conn,
                            &table,
                            "category_id",
                            &id,
                            "name = ?",
                            &[name],
                            version,
                            at,
                        )
                    }
                    CategoryEvent::Moved { parent_id } => {
                        let parent_id = parent_id.map(|parent| parent.to_string());
                        update_row(
                            conn,
                            &table,
                            "category_id",
                            &id,
                            "parent_id = ?",
                            &[&parent_id],
                            version,
                            at,
                        )
                    }
                    CategoryEvent::TagsSet { tags } => {
                        let tags = tags_to_json(tags)?;
                        update_row(
                            conn,
                            &table,
                            "category_id",
                            &id,
                            "tags = ?",
                            &[&tags],
                            version,
                            at,
                        )
                    }
                    CategoryEvent::InheritanceSet {
                        inherit_to_children,
                    } => {
                        let flag = *inherit_to_children as i64;
                        update_row(
                            conn,
                            &table,
                            "category_id",
                            &id,
                            "inherit_to_children = ?",
                            &[&flag],
                            version,
                            at,
                        )
                    }
                    CategoryEvent::Deleted => {
                        conn.execute(
                            &format!("DELETE FROM {table} WHERE category_id = ?1;"),
                            [id.as_str()],
                        )?;
                        Ok(())
                    }
                }
            }
            DomainEvent::Document { document_id, event } => {
                let table = target.table(DOCUMENT_VIEW_TABLE);
                let id = document_id.to_string();
                match event {
                    DocumentEvent::Registered {
                        file_path,
                        category_id,
                        ..
                    } => {
                        let row = DocumentRow {
                            file_path,
                            category_id: *category_id,
                            tags: &TagSet::new(),
                        };
                        insert_document_row(conn, &table, &id, row, version, at)
                    }
                    DocumentEvent::Restored {
                        file_path,
                        category_id,
                        tags,
                    } => {
                        let row = DocumentRow {
                            file_path,
                            category_id: *category_id,
                            tags,
                        };
                        insert_document_row(conn, &table, &id, row, version, at)
                    }
                    DocumentEvent::Relocated { file_path } => update_row(
                        conn,
                        &table,
                        "document_id",
                        &id,
                        "file_path = ?",
                        &[file_path],
                        version,
                        at,
                    ),
                    DocumentEvent::Moved { category_id } => {
                        let category_id = category_id.map(|category| category.to_string());
                        update_row(
                            conn,
                            &table,
                            "document_id",
                            &id,
                            "category_id = ?",
                            &[&category_id],
                            version,
                            at,
                        )
                    }
                    DocumentEvent::TagsSet { tags } => {
                        let tags = tags_to_json(tags)?;
                        update_row(
                            conn,
                            &table,
                            "document_id",
                            &id,
                            "tags = ?",
                            &[&tags],
                            version,
                            at,
                        )
                    }
                    DocumentEvent::Removed => {
                        conn.execute(
                            &format!("DELETE FROM {table} WHERE document_id = ?1;"),
                            [id.as_str()],
                        )?;
                        Ok(())
                    }
                }
            }
            DomainEvent::Task { .. } => Ok(()),
        }
    }
}

struct DocumentRow<'a> {
    file_path: &'a str,
    category_id: Option<CategoryId>,
    tags: &'a TagSet,
}

fn insert_document_row(
    conn: &Connection,
    table: &str,
    id: &str,
    row: DocumentRow<'_>,
    version: i64,
    at: i64,
) -> ProjectionResult<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {table}
                (document_id, file_path, category_id, tags, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);"
        ),
        params![
            id,
            row.file_path,
            row.category_id.map(|category| category.to_string()),
            tags_to_json(row.tags)?,
            at,
            version,
        ],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn update_row(
    conn: &Connection,
    table: &str,
    key_column: &str,
    key: &str,
    assignments: &str,
    values: &[&dyn ToSql],
    version: i64,
    at: i64,
) -> ProjectionResult<()> {
    let sql = format!(
        "UPDATE {table} SET {assignments}, version = ?, updated_at = ? WHERE {key_column} = ?;"
    );
    let mut bound: Vec<&dyn ToSql> = values.to_vec();
    bound.push(&version);
    bound.push(&at);
    bound.push(&key);
    if conn.execute(&sql, bound.as_slice())? == 0 {
        debug!(
            "event=projection_apply module=projection status=missing_row projection=containers table={} key={}",
            table, key
        );
    }
    Ok(())
}
