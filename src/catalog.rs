//! Relational catalog for TubeShare: users, videos, comments and the two
//! engagement fact tables.
//!
//! The schema is SQLite-flavoured and opened through `libsql`. Every unit of
//! work gets its own connection from [`Catalog::connect`], so concurrent
//! requests never share a transaction. The `likes`/`views` columns on
//! `videos` are denormalized counters owned by [`crate::engagement`]; nothing
//! in this module writes them.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use libsql::{Builder, Connection, Database, Row, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Column list shared by every query that materializes a [`Video`]. Callers
/// alias the table as `v`.
pub(crate) const VIDEO_COLUMNS: &str = "v.id, v.title, v.description, v.tags, v.video_key, \
     v.thumbnail_key, v.views, v.likes, v.author_id, v.created_at";
const VIDEO_COLUMN_COUNT: usize = 10;

/// Column list for a [`User`], aliased as `u`.
const USER_COLUMNS: &str = "u.id, u.name, u.image, u.created_at";

const UNNAMED_USER: &str = "Unnamed user";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub image: Option<String>,
    pub created_at: String,
}

/// A catalog entry. `video_key` and `thumbnail_key` name blobs in the
/// `videos` and `thumbnails` buckets respectively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: String,
    pub title: String,
    pub description: String,
    pub tags: String,
    pub video_key: String,
    pub thumbnail_key: String,
    pub views: i64,
    pub likes: i64,
    pub author_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoWithAuthor {
    #[serde(flatten)]
    pub video: Video,
    pub author: User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentWithAuthor {
    pub id: String,
    pub message: String,
    pub video_id: String,
    pub author_id: String,
    pub created_at: String,
    pub author: User,
}

/// Single video page payload: the video, its uploader and its comments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetail {
    #[serde(flatten)]
    pub video: Video,
    pub author: User,
    pub comments: Vec<CommentWithAuthor>,
}

#[derive(Debug, Clone)]
pub struct NewVideo {
    pub title: String,
    pub description: String,
    pub tags: String,
    pub video_key: String,
    pub thumbnail_key: String,
    pub author_id: String,
}

/// Blob keys released by a deleted video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedVideo {
    pub video_key: String,
    pub thumbnail_key: String,
}

/// How a write failed against the store's own constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Violation {
    Unique,
    ForeignKey,
    Busy,
}

/// Classifies a store error. SQLite reports constraint and locking failures
/// through the error message, which is stable across libsql versions.
pub(crate) fn violation(err: &libsql::Error) -> Option<Violation> {
    let message = err.to_string();
    if message.contains("UNIQUE constraint failed") {
        Some(Violation::Unique)
    } else if message.contains("FOREIGN KEY constraint failed") {
        Some(Violation::ForeignKey)
    } else if message.contains("is locked") || message.contains("SQLITE_BUSY") {
        Some(Violation::Busy)
    } else {
        None
    }
}

pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys=ON;
        PRAGMA busy_timeout=5000;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            image TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            tags TEXT NOT NULL DEFAULT '',
            video_key TEXT NOT NULL,
            thumbnail_key TEXT NOT NULL,
            views INTEGER NOT NULL DEFAULT 0 CHECK (views >= 0),
            likes INTEGER NOT NULL DEFAULT 0 CHECK (likes >= 0),
            author_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS liked_videos (
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            video_id TEXT NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL,
            PRIMARY KEY (user_id, video_id)
        );

        CREATE TABLE IF NOT EXISTS watched_videos (
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            video_id TEXT NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
            watched_at TEXT NOT NULL,
            PRIMARY KEY (user_id, video_id)
        );

        CREATE TABLE IF NOT EXISTS comments (
            id TEXT PRIMARY KEY,
            message TEXT NOT NULL,
            video_id TEXT NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
            author_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_videos_author ON videos(author_id);
        CREATE INDEX IF NOT EXISTS idx_liked_videos_video ON liked_videos(video_id);
        CREATE INDEX IF NOT EXISTS idx_watched_videos_video ON watched_videos(video_id);
        CREATE INDEX IF NOT EXISTS idx_comments_video ON comments(video_id);
        "#,
    )
    .await?;
    Ok(())
}

/// Handle to the catalog database. Cheap to clone.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
}

impl Catalog {
    /// Opens (and if necessary creates) the database and provisions the
    /// schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening catalog DB {}", path.display()))?;
        let catalog = Self { db: Arc::new(db) };

        let conn = catalog.connect().await?;
        ensure_schema(&conn)
            .await
            .context("provisioning catalog schema")?;
        Ok(catalog)
    }

    /// Opens a fresh connection with foreign keys enforced.
    pub async fn connect(&self) -> Result<Connection> {
        let conn = self.db.connect().context("connecting to catalog DB")?;
        configure_connection(&conn).await?;
        Ok(conn)
    }

    /// Creates the user on first sight. Existing users are left untouched.
    pub async fn ensure_user(&self, id: &str, name: Option<&str>, image: Option<&str>) -> Result<()> {
        let conn = self.connect().await?;
        let name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(UNNAMED_USER);
        conn.execute(
            r#"
            INSERT INTO users (id, name, image, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![id, name, image, now_timestamp()],
        )
        .await
        .context("creating user")?;
        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users u WHERE u.id = ?1"),
                [id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_user(&row, 0)?)),
            None => Ok(None),
        }
    }

    pub async fn create_video(&self, new: NewVideo) -> Result<Video> {
        let conn = self.connect().await?;
        let video = Video {
            id: Uuid::new_v4().to_string(),
            title: new.title,
            description: new.description,
            tags: new.tags,
            video_key: new.video_key,
            thumbnail_key: new.thumbnail_key,
            views: 0,
            likes: 0,
            author_id: new.author_id,
            created_at: now_timestamp(),
        };
        conn.execute(
            r#"
            INSERT INTO videos (
                id, title, description, tags, video_key, thumbnail_key,
                views, likes, author_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, ?8)
            "#,
            params![
                video.id.as_str(),
                video.title.as_str(),
                video.description.as_str(),
                video.tags.as_str(),
                video.video_key.as_str(),
                video.thumbnail_key.as_str(),
                video.author_id.as_str(),
                video.created_at.as_str(),
            ],
        )
        .await
        .context("inserting video")?;
        Ok(video)
    }

    pub async fn get_video(&self, id: &str) -> Result<Option<Video>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {VIDEO_COLUMNS} FROM videos v WHERE v.id = ?1"),
                [id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row, 0)?)),
            None => Ok(None),
        }
    }

    /// Most viewed first, then most liked, then oldest upload.
    pub async fn list_videos(&self, limit: Option<u32>) -> Result<Vec<Video>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    r#"
                    SELECT {VIDEO_COLUMNS}
                    FROM videos v
                    ORDER BY v.views DESC, v.likes DESC, v.created_at ASC, v.rowid ASC
                    LIMIT ?1
                    "#
                ),
                params![sql_limit(limit)],
            )
            .await?;
        collect_videos(&mut rows).await
    }

    /// Matches the whole query against title and description, and each word
    /// of the query against the tag list. Case-insensitive.
    pub async fn search_videos(&self, query: &str, limit: Option<u32>) -> Result<Vec<Video>> {
        let query = query.trim().to_lowercase();
        let words: Vec<&str> = query.split_whitespace().collect();
        let words_json = serde_json::to_string(&words).context("encoding search words")?;

        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    r#"
                    SELECT {VIDEO_COLUMNS}
                    FROM videos v
                    WHERE instr(lower(v.title), ?1) > 0
                       OR instr(lower(v.description), ?1) > 0
                       OR EXISTS (
                            SELECT 1 FROM json_each(?2) AS word
                            WHERE instr(lower(v.tags), word.value) > 0
                       )
                    ORDER BY v.views DESC, v.likes DESC, v.created_at ASC, v.rowid ASC
                    LIMIT ?3
                    "#
                ),
                params![query.as_str(), words_json, sql_limit(limit)],
            )
            .await?;
        collect_videos(&mut rows).await
    }

    /// A channel page: the author's uploads, newest first.
    pub async fn videos_by_author(&self, author_id: &str) -> Result<Vec<VideoWithAuthor>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    r#"
                    SELECT {VIDEO_COLUMNS}, {USER_COLUMNS}
                    FROM videos v
                    JOIN users u ON u.id = v.author_id
                    WHERE v.author_id = ?1
                    ORDER BY v.created_at DESC, v.rowid DESC
                    "#
                ),
                [author_id],
            )
            .await?;

        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(VideoWithAuthor {
                video: row_to_video(&row, 0)?,
                author: row_to_user(&row, VIDEO_COLUMN_COUNT)?,
            });
        }
        Ok(videos)
    }

    pub async fn video_detail(&self, id: &str) -> Result<Option<VideoDetail>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    r#"
                    SELECT {VIDEO_COLUMNS}, {USER_COLUMNS}
                    FROM videos v
                    JOIN users u ON u.id = v.author_id
                    WHERE v.id = ?1
                    "#
                ),
                [id],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let video = row_to_video(&row, 0)?;
        let author = row_to_user(&row, VIDEO_COLUMN_COUNT)?;
        drop(rows);

        let mut rows = conn
            .query(
                &format!(
                    r#"
                    SELECT c.id, c.message, c.video_id, c.author_id, c.created_at, {USER_COLUMNS}
                    FROM comments c
                    JOIN users u ON u.id = c.author_id
                    WHERE c.video_id = ?1
                    ORDER BY c.created_at DESC, c.rowid DESC
                    "#
                ),
                [id],
            )
            .await?;
        let mut comments = Vec::new();
        while let Some(row) = rows.next().await? {
            comments.push(CommentWithAuthor {
                id: row.get(0)?,
                message: row.get(1)?,
                video_id: row.get(2)?,
                author_id: row.get(3)?,
                created_at: row.get(4)?,
                author: row_to_user(&row, 5)?,
            });
        }

        Ok(Some(VideoDetail {
            video,
            author,
            comments,
        }))
    }

    /// Edits the author's own video. Someone else's video looks missing.
    pub async fn update_video(
        &self,
        id: &str,
        author_id: &str,
        title: &str,
        description: &str,
        tags: &str,
    ) -> AppResult<()> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                r#"
                UPDATE videos
                SET title = ?3, description = ?4, tags = ?5
                WHERE id = ?1 AND author_id = ?2
                "#,
                params![id, author_id, title, description, tags],
            )
            .await
            .context("updating video")?;
        if changed == 0 {
            return Err(AppError::not_found("video not found"));
        }
        Ok(())
    }

    /// Removes the author's own video. Likes, views and comments cascade with
    /// it; the caller is responsible for the returned blobs.
    pub async fn delete_video(&self, id: &str, author_id: &str) -> AppResult<DeletedVideo> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r#"
                DELETE FROM videos
                WHERE id = ?1 AND author_id = ?2
                RETURNING video_key, thumbnail_key
                "#,
                params![id, author_id],
            )
            .await
            .context("deleting video")?;
        let row = rows
            .next()
            .await
            .context("deleting video")?
            .ok_or_else(|| AppError::not_found("video not found"))?;
        Ok(DeletedVideo {
            video_key: row.get(0).context("reading deleted video key")?,
            thumbnail_key: row.get(1).context("reading deleted thumbnail key")?,
        })
    }

    pub async fn add_comment(&self, video_id: &str, author_id: &str, message: &str) -> AppResult<String> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4().to_string();
        let inserted = conn
            .execute(
                r#"
                INSERT INTO comments (id, message, video_id, author_id, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![id.as_str(), message, video_id, author_id, now_timestamp()],
            )
            .await;
        match inserted {
            Ok(_) => Ok(id),
            Err(err) if violation(&err) == Some(Violation::ForeignKey) => {
                Err(AppError::not_found("video not found"))
            }
            Err(err) => Err(anyhow::Error::from(err).context("inserting comment").into()),
        }
    }
}

/// SQLite treats a negative LIMIT as "no limit".
fn sql_limit(limit: Option<u32>) -> i64 {
    limit.map(i64::from).unwrap_or(-1)
}

async fn collect_videos(rows: &mut libsql::Rows) -> Result<Vec<Video>> {
    let mut videos = Vec::new();
    while let Some(row) = rows.next().await? {
        videos.push(row_to_video(&row, 0)?);
    }
    Ok(videos)
}

/// Converts a row into a [`Video`], reading `VIDEO_COLUMNS` starting at
/// column `offset`.
pub(crate) fn row_to_video(row: &Row, offset: usize) -> Result<Video> {
    let at = |index: usize| (offset + index) as i32;
    Ok(Video {
        id: row.get(at(0))?,
        title: row.get(at(1))?,
        description: row.get(at(2))?,
        tags: row.get(at(3))?,
        video_key: row.get(at(4))?,
        thumbnail_key: row.get(at(5))?,
        views: row.get(at(6))?,
        likes: row.get(at(7))?,
        author_id: row.get(at(8))?,
        created_at: row.get(at(9))?,
    })
}

fn row_to_user(row: &Row, offset: usize) -> Result<User> {
    let at = |index: usize| (offset + index) as i32;
    Ok(User {
        id: row.get(at(0))?,
        name: row.get(at(1))?,
        image: row.get(at(2))?,
        created_at: row.get(at(3))?,
    })
}
