use std::{fs, path::Path, str::FromStr};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};

use shared::{
    domain::{CorrelationId, GroupId, MessageId, MessageKind, SendTarget, UserId},
    protocol::MessagePayload,
};

/// Backing store for everything the synchronization engine treats as
/// external: message rows, block relations, group rosters, contacts, and
/// last-seen stamps. The engine consumes it, never reaches into it.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
    pub sender_id: UserId,
    pub target: SendTarget,
    pub body: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
    pub pinned: bool,
    pub forwarded: bool,
    pub reply_to_id: Option<MessageId>,
    pub starred_by: Vec<UserId>,
}

impl StoredMessage {
    pub fn into_payload(self) -> MessagePayload {
        MessagePayload {
            server_id: self.message_id,
            correlation_id: self.correlation_id,
            sender_id: self.sender_id,
            target: self.target,
            body: self.body,
            kind: self.kind,
            created_at: self.created_at,
            delivered_at: self.delivered_at,
            read_at: self.read_at,
            edited_at: self.edited_at,
            pinned: self.pinned,
            starred_by: self.starred_by,
            reply_to_id: self.reply_to_id,
            forwarded: self.forwarded,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub target: SendTarget,
    pub body: String,
    pub kind: MessageKind,
    pub correlation_id: CorrelationId,
    pub reply_to_id: Option<MessageId>,
    pub forwarded: bool,
}

#[derive(Debug, Clone)]
pub struct StoredGroup {
    pub group_id: GroupId,
    pub name: String,
    pub owner_id: UserId,
    pub deleted: bool,
    pub member_ids: Vec<UserId>,
}

impl Store {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn user_exists(&self, user_id: UserId) -> Result<bool> {
        Ok(self.username_for_user(user_id).await?.is_some())
    }

    /// Persist a send. Re-inserting the same `(sender, correlation_id)` pair
    /// returns the already-stored row instead of creating a duplicate, so
    /// at-least-once send retries stay idempotent.
    pub async fn insert_message(&self, new: &NewMessage) -> Result<StoredMessage> {
        let (target_user_id, target_group_id) = match new.target {
            SendTarget::User { user_id } => (Some(user_id.0), None),
            SendTarget::Group { group_id } => (None, Some(group_id.0)),
        };
        let rec = sqlx::query(
            "INSERT INTO messages
                (correlation_id, sender_id, target_user_id, target_group_id,
                 body, kind, created_at, forwarded, reply_to_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(sender_id, correlation_id)
                 DO UPDATE SET correlation_id = excluded.correlation_id
             RETURNING id",
        )
        .bind(new.correlation_id.to_string())
        .bind(new.sender_id.0)
        .bind(target_user_id)
        .bind(target_group_id)
        .bind(&new.body)
        .bind(kind_to_str(new.kind))
        .bind(Utc::now())
        .bind(new.forwarded)
        .bind(new.reply_to_id.map(|id| id.0))
        .fetch_one(&self.pool)
        .await?;
        let message_id = MessageId(rec.get::<i64, _>(0));
        self.load_message(message_id)
            .await?
            .context("inserted message row vanished")
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut message = row_to_message(&row)?;
        message.starred_by = self.stars_for(message_id).await?;
        Ok(Some(message))
    }

    /// Stamp `delivered_at` exactly once; later calls are no-ops so the
    /// timestamp never moves.
    pub async fn mark_delivered(
        &self,
        message_id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET delivered_at = ?
             WHERE id = ? AND delivered_at IS NULL",
        )
        .bind(at)
        .bind(message_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stamp `read_at` on every direct message from `other` to `reader`
    /// created at or before `upto` that is not read yet. Rows already read
    /// keep their earlier stamp; reading implies delivery.
    pub async fn mark_read_direct(
        &self,
        reader: UserId,
        other: UserId,
        upto: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages
             SET read_at = ?1, delivered_at = COALESCE(delivered_at, ?1)
             WHERE sender_id = ?2 AND target_user_id = ?3
               AND created_at <= ?4 AND read_at IS NULL",
        )
        .bind(at)
        .bind(other.0)
        .bind(reader.0)
        .bind(upto)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        body: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE messages SET body = ?, edited_at = ? WHERE id = ?")
            .bind(body)
            .bind(at)
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_pinned(&self, message_id: MessageId, pinned: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE messages SET pinned = ? WHERE id = ?")
            .bind(pinned)
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn star_message(
        &self,
        message_id: MessageId,
        user_id: UserId,
        starred: bool,
    ) -> Result<()> {
        if starred {
            sqlx::query(
                "INSERT INTO message_stars (message_id, user_id) VALUES (?, ?)
                 ON CONFLICT(message_id, user_id) DO NOTHING",
            )
            .bind(message_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("DELETE FROM message_stars WHERE message_id = ? AND user_id = ?")
                .bind(message_id.0)
                .bind(user_id.0)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn stars_for(&self, message_id: MessageId) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT user_id FROM message_stars WHERE message_id = ?")
            .bind(message_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    pub async fn history_direct(
        &self,
        me: UserId,
        peer: UserId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE ((sender_id = ?1 AND target_user_id = ?2)
                 OR (sender_id = ?2 AND target_user_id = ?1))
               AND (?3 IS NULL OR id < ?3)
             ORDER BY id DESC LIMIT ?4",
        )
        .bind(me.0)
        .bind(peer.0)
        .bind(before.map(|id| id.0))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        self.rows_to_messages(rows).await
    }

    pub async fn history_group(
        &self,
        group_id: GroupId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE target_group_id = ?1 AND (?2 IS NULL OR id < ?2)
             ORDER BY id DESC LIMIT ?3",
        )
        .bind(group_id.0)
        .bind(before.map(|id| id.0))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        self.rows_to_messages(rows).await
    }

    async fn rows_to_messages(&self, rows: Vec<SqliteRow>) -> Result<Vec<StoredMessage>> {
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let mut message = row_to_message(row)?;
            message.starred_by = self.stars_for(message.message_id).await?;
            messages.push(message);
        }
        Ok(messages)
    }

    pub async fn is_blocked(&self, a: UserId, b: UserId) -> Result<bool> {
        let blocked: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                 SELECT 1 FROM blocks
                 WHERE (blocker_id = ?1 AND blocked_id = ?2)
                    OR (blocker_id = ?2 AND blocked_id = ?1)
             )",
        )
        .bind(a.0)
        .bind(b.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(blocked)
    }

    pub async fn add_block(&self, blocker: UserId, blocked: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO blocks (blocker_id, blocked_id) VALUES (?, ?)
             ON CONFLICT(blocker_id, blocked_id) DO NOTHING",
        )
        .bind(blocker.0)
        .bind(blocked.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_block(&self, blocker: UserId, blocked: UserId) -> Result<()> {
        sqlx::query("DELETE FROM blocks WHERE blocker_id = ? AND blocked_id = ?")
            .bind(blocker.0)
            .bind(blocked.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_group(
        &self,
        name: &str,
        owner_id: UserId,
        member_ids: &[UserId],
    ) -> Result<GroupId> {
        let rec = sqlx::query("INSERT INTO groups (name, owner_id) VALUES (?, ?) RETURNING id")
            .bind(name)
            .bind(owner_id.0)
            .fetch_one(&self.pool)
            .await?;
        let group_id = GroupId(rec.get::<i64, _>(0));
        self.add_group_member(group_id, owner_id).await?;
        for member in member_ids {
            self.add_group_member(group_id, *member).await?;
        }
        Ok(group_id)
    }

    pub async fn add_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_members (group_id, user_id) VALUES (?, ?)
             ON CONFLICT(group_id, user_id) DO NOTHING",
        )
        .bind(group_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_group(&self, group_id: GroupId) -> Result<bool> {
        let result = sqlx::query("UPDATE groups SET deleted = 1 WHERE id = ? AND deleted = 0")
            .bind(group_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn group_members(&self, group_id: GroupId) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT user_id FROM group_members WHERE group_id = ?")
            .bind(group_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    pub async fn group_summary(&self, group_id: GroupId) -> Result<Option<StoredGroup>> {
        let row = sqlx::query("SELECT name, owner_id, deleted FROM groups WHERE id = ?")
            .bind(group_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StoredGroup {
            group_id,
            name: row.get::<String, _>(0),
            owner_id: UserId(row.get::<i64, _>(1)),
            deleted: row.get::<bool, _>(2),
            member_ids: self.group_members(group_id).await?,
        }))
    }

    /// Record a symmetric contact relationship; presence broadcasts follow
    /// these rows.
    pub async fn add_contact(&self, a: UserId, b: UserId) -> Result<()> {
        for (user, peer) in [(a, b), (b, a)] {
            sqlx::query(
                "INSERT INTO contacts (user_id, peer_id) VALUES (?, ?)
                 ON CONFLICT(user_id, peer_id) DO NOTHING",
            )
            .bind(user.0)
            .bind(peer.0)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn contacts_of(&self, user_id: UserId) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT peer_id FROM contacts WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    pub async fn update_last_seen(&self, user_id: UserId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET last_seen = ? WHERE id = ?")
            .bind(at)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn last_seen(&self, user_id: UserId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_seen FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<DateTime<Utc>>, _>(0)))
    }
}

fn kind_to_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Media => "media",
        MessageKind::Sticker => "sticker",
    }
}

fn kind_from_str(raw: &str) -> Result<MessageKind> {
    match raw {
        "text" => Ok(MessageKind::Text),
        "media" => Ok(MessageKind::Media),
        "sticker" => Ok(MessageKind::Sticker),
        other => anyhow::bail!("unknown message kind '{other}'"),
    }
}

fn row_to_message(row: &SqliteRow) -> Result<StoredMessage> {
    let correlation_raw: String = row.try_get("correlation_id")?;
    let correlation_id = CorrelationId(
        correlation_raw
            .parse()
            .with_context(|| format!("malformed correlation id '{correlation_raw}'"))?,
    );
    let target = match row.try_get::<Option<i64>, _>("target_user_id")? {
        Some(user_id) => SendTarget::User {
            user_id: UserId(user_id),
        },
        None => SendTarget::Group {
            group_id: GroupId(
                row.try_get::<Option<i64>, _>("target_group_id")?
                    .context("message row has neither user nor group target")?,
            ),
        },
    };
    Ok(StoredMessage {
        message_id: MessageId(row.try_get("id")?),
        correlation_id,
        sender_id: UserId(row.try_get("sender_id")?),
        target,
        body: row.try_get("body")?,
        kind: kind_from_str(&row.try_get::<String, _>("kind")?)?,
        created_at: row.try_get("created_at")?,
        delivered_at: row.try_get("delivered_at")?,
        read_at: row.try_get("read_at")?,
        edited_at: row.try_get("edited_at")?,
        pinned: row.try_get("pinned")?,
        forwarded: row.try_get("forwarded")?,
        reply_to_id: row
            .try_get::<Option<i64>, _>("reply_to_id")?
            .map(MessageId),
        starred_by: Vec::new(),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for '{database_url}'")
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
