//! Read-only queries over projection tables.
//!
//! # Responsibility
//! - Map view rows into typed views.
//! - Serve the hierarchy to tag inheritance and to command-side checks.
//!
//! # Invariants
//! - Queries never write.
//! - Recursive walks are bounded by `max_depth` so a corrupt parent chain
//!   cannot loop.

use super::{parse_uuid, tags_from_json, ProjectionError, ProjectionResult};
use crate::model::tags::{tag_key, TagSet};
use crate::model::{CategoryId, DocumentId, TaskId, DEFAULT_MAX_HIERARCHY_DEPTH};
use crate::tags::{CategoryNode, DocumentNode, HierarchySource};
use rusqlite::{params, Connection, OptionalExtension, Params, Row};

const TASK_SELECT_SQL: &str = "SELECT
    t.task_id,
    t.text,
    t.category_id,
    t.source_document_id,
    t.source_stable_id,
    t.source_line_number,
    t.is_orphaned,
    t.completed,
    t.completed_at,
    t.manual_tags,
    t.inherited_tags,
    t.last_seen_at,
    t.created_at,
    t.updated_at,
    t.version
FROM task_view t";

const CATEGORY_SELECT_SQL: &str = "SELECT
    category_id,
    name,
    parent_id,
    tags,
    inherit_to_children,
    version
FROM category_view";

const DOCUMENT_SELECT_SQL: &str = "SELECT
    document_id,
    file_path,
    category_id,
    tags,
    version
FROM document_view";

/// One row of `task_view`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskView {
    pub task_id: TaskId,
    pub text: String,
    pub category_id: Option<CategoryId>,
    pub source_document_id: Option<DocumentId>,
    pub source_stable_id: Option<String>,
    pub source_line_number: Option<u32>,
    pub is_orphaned: bool,
    pub completed: bool,
    pub completed_at: Option<i64>,
    pub manual_tags: TagSet,
    pub inherited_tags: TagSet,
    pub last_seen_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: u64,
}

impl TaskView {
    pub fn visible_tags(&self) -> TagSet {
        self.manual_tags.union(&self.inherited_tags)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryView {
    pub category_id: CategoryId,
    pub name: String,
    pub parent_id: Option<CategoryId>,
    pub tags: TagSet,
    pub inherit_to_children: bool,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentView {
    pub document_id: DocumentId,
    pub file_path: String,
    pub category_id: Option<CategoryId>,
    pub tags: TagSet,
    pub version: u64,
}

/// Queries over the live projection tables of one connection.
pub struct ProjectionQueries<'conn> {
    conn: &'conn Connection,
    max_depth: usize,
}

impl<'conn> ProjectionQueries<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self::with_max_depth(conn, DEFAULT_MAX_HIERARCHY_DEPTH)
    }

    pub fn with_max_depth(conn: &'conn Connection, max_depth: usize) -> Self {
        Self {
            conn,
            max_depth: max_depth.max(1),
        }
    }

    pub fn task(&self, task_id: TaskId) -> ProjectionResult<Option<TaskView>> {
        let row = self
            .conn
            .query_row(
                &format!("{TASK_SELECT_SQL} WHERE t.task_id = ?1;"),
                [task_id.to_string()],
                |row| Ok(parse_task_row(row)),
            )
            .optional()?;
        row.transpose()
    }

    /// Tasks filed directly under `category_id`.
    pub fn tasks_in_category(&self, category_id: CategoryId) -> ProjectionResult<Vec<TaskView>> {
        self.query_tasks(
            &format!(
                "{TASK_SELECT_SQL} WHERE t.category_id = ?1 ORDER BY t.created_at, t.task_id;"
            ),
            [category_id.to_string()],
        )
    }

    /// Tasks whose visible tags contain `tag`, case-insensitively.
    pub fn tasks_with_tag(&self, tag: &str) -> ProjectionResult<Vec<TaskView>> {
        self.query_tasks(
            &format!(
                "{TASK_SELECT_SQL}
                 INNER JOIN task_tags tags ON tags.task_id = t.task_id
                 WHERE tags.tag_key = ?1
                 ORDER BY t.created_at, t.task_id;"
            ),
            [tag_key(tag)],
        )
    }

    /// Tasks filed under `category_id` or any of its descendants.
    pub fn tasks_in_subtree(&self, category_id: CategoryId) -> ProjectionResult<Vec<TaskView>> {
        self.query_tasks(
            &format!(
                "WITH RECURSIVE subtree(category_id, depth) AS (
                    SELECT category_id, 0
                    FROM category_view
                    WHERE category_id = ?1
                    UNION
                    SELECT child.category_id, parent.depth + 1
                    FROM category_view child
                    INNER JOIN subtree parent ON child.parent_id = parent.category_id
                    WHERE parent.depth < ?2
                )
                {TASK_SELECT_SQL}
                WHERE t.category_id IN (SELECT category_id FROM subtree)
                ORDER BY t.created_at, t.task_id;"
            ),
            params![category_id.to_string(), self.max_depth as i64],
        )
    }

    /// Non-orphaned tasks derived from `document_id`, by line.
    pub fn live_tasks_for_document(
        &self,
        document_id: DocumentId,
    ) -> ProjectionResult<Vec<TaskView>> {
        self.document_tasks(document_id, false)
    }

    pub fn orphaned_tasks_for_document(
        &self,
        document_id: DocumentId,
    ) -> ProjectionResult<Vec<TaskView>> {
        self.document_tasks(document_id, true)
    }

    fn document_tasks(
        &self,
        document_id: DocumentId,
        orphaned: bool,
    ) -> ProjectionResult<Vec<TaskView>> {
        self.query_tasks(
            &format!(
                "{TASK_SELECT_SQL}
                 WHERE t.source_document_id = ?1
                   AND t.is_orphaned = ?2
                 ORDER BY t.source_line_number, t.source_stable_id;"
            ),
            params![document_id.to_string(), orphaned as i64],
        )
    }

    fn query_tasks<P: Params>(&self, sql: &str, params: P) -> ProjectionResult<Vec<TaskView>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(parse_task_row(row)?);
        }
        Ok(tasks)
    }

    pub fn category(&self, category_id: CategoryId) -> ProjectionResult<Option<CategoryView>> {
        let row = self
            .conn
            .query_row(
                &format!("{CATEGORY_SELECT_SQL} WHERE category_id = ?1;"),
                [category_id.to_string()],
                |row| Ok(parse_category_row(row)),
            )
            .optional()?;
        row.transpose()
    }

    /// Direct children of `parent_id`; `None` lists root categories.
    pub fn child_categories(
        &self,
        parent_id: Option<CategoryId>,
    ) -> ProjectionResult<Vec<CategoryView>> {
        match parent_id {
            Some(parent_id) => self.query_categories(
                &format!("{CATEGORY_SELECT_SQL} WHERE parent_id = ?1 ORDER BY name, category_id;"),
                [parent_id.to_string()],
            ),
            None => self.query_categories(
                &format!(
                    "{CATEGORY_SELECT_SQL} WHERE parent_id IS NULL ORDER BY name, category_id;"
                ),
                [],
            ),
        }
    }

    /// Every category below `category_id`, excluding itself.
    pub fn descendant_categories(
        &self,
        category_id: CategoryId,
    ) -> ProjectionResult<Vec<CategoryView>> {
        self.query_categories(
            &format!(
                "WITH RECURSIVE subtree(category_id, depth) AS (
                    SELECT category_id, 0
                    FROM category_view
                    WHERE category_id = ?1
                    UNION
                    SELECT child.category_id, parent.depth + 1
                    FROM category_view child
                    INNER JOIN subtree parent ON child.parent_id = parent.category_id
                    WHERE parent.depth < ?2
                )
                {CATEGORY_SELECT_SQL}
                WHERE category_id IN (SELECT category_id FROM subtree WHERE depth > 0)
                ORDER BY name, category_id;"
            ),
            params![category_id.to_string(), self.max_depth as i64],
        )
    }

    /// Slash-joined names from the root down to `category_id`.
    pub fn category_path(&self, category_id: CategoryId) -> ProjectionResult<Option<String>> {
        let mut stmt = self.conn.prepare(
            "WITH RECURSIVE ancestors(category_id, name, parent_id, depth) AS (
                SELECT category_id, name, parent_id, 0
                FROM category_view
                WHERE category_id = ?1
                UNION ALL
                SELECT c.category_id, c.name, c.parent_id, a.depth + 1
                FROM category_view c
                INNER JOIN ancestors a ON c.category_id = a.parent_id
                WHERE a.depth < ?2
            )
            SELECT name FROM ancestors ORDER BY depth DESC;",
        )?;
        let names = stmt
            .query_map(
                params![category_id.to_string(), self.max_depth as i64],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        if names.is_empty() {
            return Ok(None);
        }
        Ok(Some(names.join("/")))
    }

    /// Resolves a slash-separated path of names starting at a root category.
    pub fn category_by_path(&self, path: &str) -> ProjectionResult<Option<CategoryView>> {
        let segments = split_path(path);
        if segments.is_empty() {
            return Ok(None);
        }

        let mut current: Option<CategoryView> = None;
        for segment in segments {
            let parent_id = current.as_ref().map(|category| category.category_id);
            let next = self
                .child_categories(parent_id)?
                .into_iter()
                .find(|child| child.name == segment);
            match next {
                Some(child) => current = Some(child),
                None => return Ok(None),
            }
        }
        Ok(current)
    }

    /// Category for a file, matching the longest suffix of its parent
    /// directory against category paths.
    ///
    /// `Notes/Projects/A/meeting.rtf` tries `Notes/Projects/A`, then
    /// `Projects/A`, then `A`.
    pub fn category_for_file_path(
        &self,
        file_path: &str,
    ) -> ProjectionResult<Option<CategoryView>> {
        let mut segments = split_path(file_path);
        segments.pop();
        for start in 0..segments.len() {
            let suffix = segments[start..].join("/");
            if let Some(category) = self.category_by_path(&suffix)? {
                return Ok(Some(category));
            }
        }
        Ok(None)
    }

    fn query_categories<P: Params>(
        &self,
        sql: &str,
        params: P,
    ) -> ProjectionResult<Vec<CategoryView>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut categories = Vec::new();
        while let Some(row) = rows.next()? {
            categories.push(parse_category_row(row)?);
        }
        Ok(categories)
    }

    pub fn document(&self, document_id: DocumentId) -> ProjectionResult<Option<DocumentView>> {
        let row = self
            .conn
            .query_row(
                &format!("{DOCUMENT_SELECT_SQL} WHERE document_id = ?1;"),
                [document_id.to_string()],
                |row| Ok(parse_document_row(row)),
            )
            .optional()?;
        row.transpose()
    }

    pub fn document_by_path(&self, file_path: &str) -> ProjectionResult<Option<DocumentView>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "{DOCUMENT_SELECT_SQL} WHERE file_path = ?1 ORDER BY document_id LIMIT 1;"
                ),
                [file_path.trim()],
                |row| Ok(parse_document_row(row)),
            )
            .optional()?;
        row.transpose()
    }

    /// Documents filed directly under `category_id`.
    pub fn documents_in_category(
        &self,
        category_id: CategoryId,
    ) -> ProjectionResult<Vec<DocumentView>> {
        let mut stmt = self.conn.prepare(&format!(
            "{DOCUMENT_SELECT_SQL} WHERE category_id = ?1 ORDER BY file_path, document_id;"
        ))?;
        let mut rows = stmt.query([category_id.to_string()])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            documents.push(parse_document_row(row)?);
        }
        Ok(documents)
    }
}

impl HierarchySource for ProjectionQueries<'_> {
    type Error = ProjectionError;

    fn category_node(&self, id: CategoryId) -> ProjectionResult<Option<CategoryNode>> {
        Ok(self.category(id)?.map(|category| CategoryNode {
            id: category.category_id,
            parent_id: category.parent_id,
            tags: category.tags,
            inherit_to_children: category.inherit_to_children,
        }))
    }

    fn document_node(&self, id: DocumentId) -> ProjectionResult<Option<DocumentNode>> {
        Ok(self.document(id)?.map(|document| DocumentNode {
            id: document.document_id,
            category_id: document.category_id,
            tags: document.tags,
        }))
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect()
}

fn parse_optional_uuid(
    value: Option<String>,
    column: &str,
) -> ProjectionResult<Option<uuid::Uuid>> {
    value.map(|text| parse_uuid(&text, column)).transpose()
}

fn parse_task_row(row: &Row<'_>) -> ProjectionResult<TaskView> {
    let task_id: String = row.get(0)?;
    let manual_tags: String = row.get(9)?;
    let inherited_tags: String = row.get(10)?;
    let version: i64 = row.get(14)?;
    Ok(TaskView {
        task_id: parse_uuid(&task_id, "task_view.task_id")?,
        text: row.get(1)?,
        category_id: parse_optional_uuid(row.get(2)?, "task_view.category_id")?,
        source_document_id: parse_optional_uuid(row.get(3)?, "task_view.source_document_id")?,
        source_stable_id: row.get(4)?,
        source_line_number: row.get(5)?,
        is_orphaned: row.get::<_, i64>(6)? != 0,
        completed: row.get::<_, i64>(7)? != 0,
        completed_at: row.get(8)?,
        manual_tags: tags_from_json(&manual_tags, "task_view.manual_tags")?,
        inherited_tags: tags_from_json(&inherited_tags, "task_view.inherited_tags")?,
        last_seen_at: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        version: version.max(0) as u64,
    })
}

fn parse_category_row(row: &Row<'_>) -> ProjectionResult<CategoryView> {
    let category_id: String = row.get(0)?;
    let tags: String = row.get(3)?;
    let version: i64 = row.get(5)?;
    Ok(CategoryView {
        category_id: parse_uuid(&category_id, "category_view.category_id")?,
        name: row.get(1)?,
        parent_id: parse_optional_uuid(row.get(2)?, "category_view.parent_id")?,
        tags: tags_from_json(&tags, "category_view.tags")?,
        inherit_to_children: row.get::<_, i64>(4)? != 0,
        version: version.max(0) as u64,
    })
}

fn parse_document_row(row: &Row<'_>) -> ProjectionResult<DocumentView> {
    let document_id: String = row.get(0)?;
    let tags: String = row.get(3)?;
    let version: i64 = row.get(4)?;
    Ok(DocumentView {
        document_id: parse_uuid(&document_id, "document_view.document_id")?,
        file_path: row.get(1)?,
        category_id: parse_optional_uuid(row.get(2)?, "document_view.category_id")?,
        tags: tags_from_json(&tags, "document_view.tags")?,
        version: version.max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::split_path;

    #[test]
    fn split_path_accepts_both_separators() {
        assert_eq!(
            split_path("Notes\\Projects/A/ meeting.rtf"),
            vec!["Notes", "Projects", "A", "meeting.rtf"]
        );
    }
}
