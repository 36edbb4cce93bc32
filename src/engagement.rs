//! Like and watched bookkeeping.
//!
//! Each (user, video) pair has at most one row in `liked_videos` and at most
//! one in `watched_videos`; the composite primary keys enforce that. The
//! `likes`/`views` counters on `videos` mirror the row counts and are only ever
//! moved by one in the same transaction that writes the fact row, so the two
//! can never drift apart.
//!
//! Concurrent writers on the same pair are resolved by the store: the first
//! commit wins and the loser's transaction fails with a constraint or busy
//! error. That surfaces as [`AppError::Conflict`], which callers may retry.

use libsql::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::{Catalog, VIDEO_COLUMNS, Video, Violation, now_timestamp, row_to_video, violation};
use crate::error::{AppError, AppResult};

/// Like state of a (user, video) pair after a toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeState {
    Liked,
    NotLiked,
}

impl LikeState {
    pub fn is_liked(self) -> bool {
        matches!(self, Self::Liked)
    }
}

/// Result of marking a video as watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// First watch: fact row written and `views` incremented.
    Recorded,
    /// Fact row already existed; nothing changed.
    AlreadyWatched,
}

/// One entry of a user's watch history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedVideo {
    pub user_id: String,
    pub video_id: String,
    pub watched_at: String,
    pub video: Video,
}

#[derive(Clone, Copy)]
enum Fact {
    Liked,
    Watched,
}

impl Fact {
    fn exists_sql(self) -> &'static str {
        match self {
            Self::Liked => "SELECT 1 FROM liked_videos WHERE user_id = ?1 AND video_id = ?2",
            Self::Watched => "SELECT 1 FROM watched_videos WHERE user_id = ?1 AND video_id = ?2",
        }
    }
}

#[derive(Clone, Copy)]
enum Counter {
    Likes,
    Views,
}

impl Counter {
    fn update_sql(self) -> &'static str {
        match self {
            Self::Likes => "UPDATE videos SET likes = likes + ?2 WHERE id = ?1",
            Self::Views => "UPDATE videos SET views = views + ?2 WHERE id = ?1",
        }
    }
}

#[derive(Clone)]
pub struct Engagement {
    catalog: Catalog,
}

impl Engagement {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    pub async fn is_liked(&self, user_id: &str, video_id: &str) -> AppResult<bool> {
        let conn = self.catalog.connect().await?;
        fact_exists(&conn, Fact::Liked, user_id, video_id).await
    }

    pub async fn is_watched(&self, user_id: &str, video_id: &str) -> AppResult<bool> {
        let conn = self.catalog.connect().await?;
        fact_exists(&conn, Fact::Watched, user_id, video_id).await
    }

    /// Flips the like state of the pair and moves `videos.likes` by one in the
    /// same transaction.
    pub async fn toggle_like(&self, user_id: &str, video_id: &str) -> AppResult<LikeState> {
        let conn = self.catalog.connect().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|err| store_error(err, "starting like toggle"))?;

        match toggle_like_in(&tx, user_id, video_id).await {
            Ok(state) => {
                tx.commit()
                    .await
                    .map_err(|err| store_error(err, "committing like toggle"))?;
                debug!(user_id, video_id, liked = state.is_liked(), "like toggled");
                Ok(state)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rolling back like toggle failed");
                }
                Err(err)
            }
        }
    }

    /// Records the first watch of a video by a user. Later calls are no-ops.
    pub async fn mark_watched(&self, user_id: &str, video_id: &str) -> AppResult<WatchOutcome> {
        let conn = self.catalog.connect().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|err| store_error(err, "starting watch marking"))?;

        match mark_watched_in(&tx, user_id, video_id).await {
            Ok(outcome) => {
                tx.commit()
                    .await
                    .map_err(|err| store_error(err, "committing watch marking"))?;
                debug!(user_id, video_id, ?outcome, "watch marked");
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rolling back watch marking failed");
                }
                Err(err)
            }
        }
    }

    /// The user's watched videos, most recently watched first.
    pub async fn watch_history(&self, user_id: &str) -> AppResult<Vec<WatchedVideo>> {
        let conn = self.catalog.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    r#"
                    SELECT w.user_id, w.video_id, w.watched_at, {VIDEO_COLUMNS}
                    FROM watched_videos w
                    JOIN videos v ON v.id = w.video_id
                    WHERE w.user_id = ?1
                    ORDER BY w.watched_at DESC, w.rowid DESC
                    "#
                ),
                [user_id],
            )
            .await
            .map_err(|err| store_error(err, "loading watch history"))?;

        let mut history = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|err| store_error(err, "loading watch history"))?
        {
            history.push(WatchedVideo {
                user_id: row
                    .get(0)
                    .map_err(|err| store_error(err, "reading watch history"))?,
                video_id: row
                    .get(1)
                    .map_err(|err| store_error(err, "reading watch history"))?,
                watched_at: row
                    .get(2)
                    .map_err(|err| store_error(err, "reading watch history"))?,
                video: row_to_video(&row, 3)?,
            });
        }
        Ok(history)
    }
}

async fn toggle_like_in(conn: &Connection, user_id: &str, video_id: &str) -> AppResult<LikeState> {
    ensure_video_exists(conn, video_id).await?;

    if fact_exists(conn, Fact::Liked, user_id, video_id).await? {
        let removed = conn
            .execute(
                "DELETE FROM liked_videos WHERE user_id = ?1 AND video_id = ?2",
                params![user_id, video_id],
            )
            .await
            .map_err(|err| store_error(err, "removing like"))?;
        if removed == 0 {
            return Err(lost_race());
        }
        adjust_counter(conn, Counter::Likes, video_id, -1).await?;
        Ok(LikeState::NotLiked)
    } else {
        conn.execute(
            "INSERT INTO liked_videos (user_id, video_id, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, video_id, now_timestamp()],
        )
        .await
        .map_err(|err| store_error(err, "adding like"))?;
        adjust_counter(conn, Counter::Likes, video_id, 1).await?;
        Ok(LikeState::Liked)
    }
}

async fn mark_watched_in(
    conn: &Connection,
    user_id: &str,
    video_id: &str,
) -> AppResult<WatchOutcome> {
    ensure_video_exists(conn, video_id).await?;

    if fact_exists(conn, Fact::Watched, user_id, video_id).await? {
        return Ok(WatchOutcome::AlreadyWatched);
    }

    conn.execute(
        "INSERT INTO watched_videos (user_id, video_id, watched_at) VALUES (?1, ?2, ?3)",
        params![user_id, video_id, now_timestamp()],
    )
    .await
    .map_err(|err| store_error(err, "recording watch"))?;
    adjust_counter(conn, Counter::Views, video_id, 1).await?;
    Ok(WatchOutcome::Recorded)
}

async fn ensure_video_exists(conn: &Connection, video_id: &str) -> AppResult<()> {
    let mut rows = conn
        .query("SELECT 1 FROM videos WHERE id = ?1", [video_id])
        .await
        .map_err(|err| store_error(err, "looking up video"))?;
    match rows
        .next()
        .await
        .map_err(|err| store_error(err, "looking up video"))?
    {
        Some(_) => Ok(()),
        None => Err(AppError::not_found("video not found")),
    }
}

async fn fact_exists(conn: &Connection, fact: Fact, user_id: &str, video_id: &str) -> AppResult<bool> {
    let mut rows = conn
        .query(fact.exists_sql(), params![user_id, video_id])
        .await
        .map_err(|err| store_error(err, "checking engagement"))?;
    let found = rows
        .next()
        .await
        .map_err(|err| store_error(err, "checking engagement"))?;
    Ok(found.is_some())
}

/// Moves a counter by `delta` atomically in the store. The row must exist.
async fn adjust_counter(conn: &Connection, counter: Counter, video_id: &str, delta: i64) -> AppResult<()> {
    let changed = conn
        .execute(counter.update_sql(), params![video_id, delta])
        .await
        .map_err(|err| store_error(err, "updating counter"))?;
    if changed == 0 {
        return Err(AppError::not_found("video not found"));
    }
    Ok(())
}

fn lost_race() -> AppError {
    AppError::conflict("video engagement changed concurrently; retry the request")
}

fn store_error(err: libsql::Error, action: &str) -> AppError {
    match violation(&err) {
        Some(Violation::Unique | Violation::Busy) => {
            debug!(error = %err, action, "engagement write lost a race");
            lost_race()
        }
        Some(Violation::ForeignKey) => AppError::not_found("video or user not found"),
        None => AppError::internal(format!("{action}: {err}")),
    }
}
