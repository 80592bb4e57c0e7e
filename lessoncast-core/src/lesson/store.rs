use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::sqlite::configure_connection;

use super::models::{Lesson, LessonVideoReference, RenditionState};
use super::{LessonError, LessonResult};

const LESSON_SCHEMA: &str = include_str!("../../../sql/lessons.sql");

#[derive(Debug, Clone)]
pub struct SqliteLessonStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteLessonStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteLessonStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> LessonResult<SqliteLessonStore> {
        let path = self.path.ok_or(LessonError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteLessonStore { path, flags })
    }
}

/// Lesson records backed by a SQLite file. Each call opens its own
/// connection, so clones are cheap and can be shared across tasks.
#[derive(Debug, Clone)]
pub struct SqliteLessonStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteLessonStore {
    pub fn builder() -> SqliteLessonStoreBuilder {
        SqliteLessonStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> LessonResult<Self> {
        SqliteLessonStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> LessonResult<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            LessonError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| LessonError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> LessonResult<()> {
        let conn = self.open()?;
        conn.execute_batch(LESSON_SCHEMA)?;
        Ok(())
    }

    pub fn insert_lesson(&self, lesson: &Lesson) -> LessonResult<Lesson> {
        if self.fetch_by_id(&lesson.lesson_id)?.is_some() {
            return Err(LessonError::AlreadyExists {
                lesson_id: lesson.lesson_id.clone(),
            });
        }
        let mut stored = lesson.clone();
        let now = Utc::now();
        stored.created_at.get_or_insert(now);
        stored.updated_at = Some(now);
        self.upsert_lesson(&stored)?;
        Ok(stored)
    }

    pub fn upsert_lesson(&self, lesson: &Lesson) -> LessonResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO lessons (
                lesson_id, subject_id, teacher_id, title, description, video_url, video_id,
                source_file, rendition_state, duration_s, views_count, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, COALESCE(?12, CURRENT_TIMESTAMP), ?13
            )
            ON CONFLICT(lesson_id) DO UPDATE SET
                subject_id = excluded.subject_id,
                teacher_id = excluded.teacher_id,
                title = excluded.title,
                description = excluded.description,
                video_url = excluded.video_url,
                video_id = excluded.video_id,
                source_file = excluded.source_file,
                rendition_state = excluded.rendition_state,
                duration_s = excluded.duration_s,
                views_count = excluded.views_count,
                updated_at = excluded.updated_at",
            params![
                &lesson.lesson_id,
                &lesson.subject_id,
                &lesson.teacher_id,
                &lesson.title,
                &lesson.description,
                &lesson.video_url,
                &lesson.video_id,
                &lesson.source_file,
                lesson.rendition_state.as_str(),
                lesson.duration_s,
                lesson.views_count,
                lesson.created_at.map(|dt| dt.naive_utc()),
                lesson.updated_at.map(|dt| dt.naive_utc()),
            ],
        )?;
        Ok(())
    }

    pub fn fetch_by_id(&self, lesson_id: &str) -> LessonResult<Option<Lesson>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM lessons WHERE lesson_id = ?1")?;
        let lesson = stmt
            .query_row([lesson_id], |row| Lesson::from_row(row))
            .optional()?;
        Ok(lesson)
    }

    pub fn fetch_by_video_id(&self, video_id: &str) -> LessonResult<Option<Lesson>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM lessons WHERE video_id = ?1")?;
        let lesson = stmt
            .query_row([video_id], |row| Lesson::from_row(row))
            .optional()?;
        Ok(lesson)
    }

    pub fn list(&self, limit: usize) -> LessonResult<Vec<Lesson>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM lessons
             ORDER BY created_at DESC, lesson_id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| Lesson::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Lessons whose video reference does not yet point at a rendition:
    /// neither routed under `media_prefix` nor ending in the manifest
    /// extension.
    pub fn list_pending_migration(&self, media_prefix: &str) -> LessonResult<Vec<Lesson>> {
        let conn = self.open()?;
        let routed = format!("%{}/%", escape_like(media_prefix.trim_end_matches('/')));
        let mut stmt = conn.prepare(
            "SELECT * FROM lessons
             WHERE video_url <> ''
               AND video_url NOT LIKE ?1 ESCAPE '\\'
               AND video_url NOT LIKE '%.m3u8'
             ORDER BY created_at ASC, lesson_id ASC",
        )?;
        let rows = stmt
            .query_map([routed], |row| Lesson::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_video_reference(
        &self,
        lesson_id: &str,
        reference: &LessonVideoReference,
        state: RenditionState,
    ) -> LessonResult<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE lessons
             SET video_url = ?2, video_id = ?3, rendition_state = ?4, updated_at = ?5
             WHERE lesson_id = ?1",
            params![
                lesson_id,
                &reference.video_url,
                &reference.video_id,
                state.as_str(),
                Utc::now().naive_utc(),
            ],
        )?;
        if changed == 0 {
            return Err(LessonError::NotFound {
                lesson_id: lesson_id.to_string(),
            });
        }
        Ok(())
    }

    /// Records `candidate` as the lesson's asset id unless one is already set,
    /// returning whichever id the lesson ends up with.
    pub fn assign_video_id(&self, lesson_id: &str, candidate: &str) -> LessonResult<String> {
        let conn = self.open()?;
        let assigned = conn
            .query_row(
                "UPDATE lessons
                 SET video_id = COALESCE(video_id, ?2), updated_at = ?3
                 WHERE lesson_id = ?1
                 RETURNING video_id",
                params![lesson_id, candidate, Utc::now().naive_utc()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        assigned.ok_or_else(|| LessonError::NotFound {
            lesson_id: lesson_id.to_string(),
        })
    }

    /// Swaps an unusable asset id for `candidate`, but only while the lesson
    /// still holds `expected`. Returns the id stored afterwards, which is a
    /// concurrent caller's replacement when that caller got there first.
    pub fn replace_video_id(
        &self,
        lesson_id: &str,
        expected: &str,
        candidate: &str,
    ) -> LessonResult<Option<String>> {
        let conn = self.open()?;
        let current = conn
            .query_row(
                "UPDATE lessons
                 SET video_id = CASE WHEN video_id = ?2 THEN ?3 ELSE video_id END,
                     updated_at = ?4
                 WHERE lesson_id = ?1
                 RETURNING video_id",
                params![lesson_id, expected, candidate, Utc::now().naive_utc()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        current.ok_or_else(|| LessonError::NotFound {
            lesson_id: lesson_id.to_string(),
        })
    }

    pub fn set_rendition_state(&self, lesson_id: &str, state: RenditionState) -> LessonResult<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE lessons SET rendition_state = ?2, updated_at = ?3 WHERE lesson_id = ?1",
            params![lesson_id, state.as_str(), Utc::now().naive_utc()],
        )?;
        if changed == 0 {
            return Err(LessonError::NotFound {
                lesson_id: lesson_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn increment_views(&self, lesson_id: &str) -> LessonResult<i64> {
        let conn = self.open()?;
        let views = conn
            .query_row(
                "UPDATE lessons SET views_count = views_count + 1
                 WHERE lesson_id = ?1
                 RETURNING views_count",
                [lesson_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        views.ok_or_else(|| LessonError::NotFound {
            lesson_id: lesson_id.to_string(),
        })
    }

    pub fn count_by_state(&self) -> LessonResult<HashMap<String, usize>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT rendition_state, COUNT(*) FROM lessons GROUP BY rendition_state")?;
        let mut map = HashMap::new();
        for row in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (state, count) = row?;
            map.insert(state, count as usize);
        }
        Ok(map)
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
