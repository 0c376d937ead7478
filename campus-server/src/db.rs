//! SQLite persistence layer.
//!
//! Stores accounts, sessions, categories, posts with their comments and
//! likes, direct conversations and messages, notifications, and the AI chat
//! task queue. Uses WAL mode for concurrent reads during writes.
//!
//! Timestamps are stored as integer milliseconds since the Unix epoch.
//! Ordering within a table uses `rowid`, which follows insertion order even
//! when two documents share a millisecond.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row, Transaction};
use std::path::Path;

use campus_sdk::models::{
    Category, Comment, Conversation, Message, NewCategory, NewPost, Notification, NotificationKind,
    Post, UpdatePost, UpdateProfileRequest, UserProfile, AI_ASSISTANT_UID,
};

use crate::ids;

/// Prefix for encrypted-at-rest message content.
const EAR_PREFIX: &str = "EAR1:";

/// Longest conversation preview kept in `conversations.last_message`.
const PREVIEW_CHARS: usize = 100;

/// Categories created on first open.
const DEFAULT_CATEGORIES: &[(&str, &str, &str)] = &[
    ("housing", "Housing", "Finding rooms, leases, roommates"),
    ("visa", "Visa & Immigration", "Visas, permits, and paperwork"),
    ("academics", "Academics", "Courses, professors, study tips"),
    ("jobs", "Jobs & Internships", "Part-time work, internships, careers"),
    ("life", "Daily Life", "Banking, phones, transport, healthcare"),
    ("food", "Food", "Groceries, restaurants, home cooking"),
    ("events", "Events & Meetups", "Gatherings and community events"),
];

fn ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Canonical participant key for a direct conversation: both uids, sorted,
/// joined by a comma. The same pair always maps to the same key.
pub fn canonical_participant_key(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{first},{second}")
}

/// A user row including the password hash (never serialized to clients).
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub profile: UserProfile,
    pub password_hash: Option<String>,
}

/// Filters for post listing. `before` is a post id cursor.
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub category: Option<String>,
    pub author: Option<String>,
    pub before: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiTaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AiTaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AiTaskStatus::Pending => "pending",
            AiTaskStatus::Processing => "processing",
            AiTaskStatus::Completed => "completed",
            AiTaskStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "processing" => AiTaskStatus::Processing,
            "completed" => AiTaskStatus::Completed,
            "failed" => AiTaskStatus::Failed,
            _ => AiTaskStatus::Pending,
        }
    }
}

/// A queued request for the AI assistant to answer a conversation.
#[derive(Debug, Clone)]
pub struct AiTask {
    pub id: String,
    pub conversation_id: String,
    pub trigger_message_id: Option<String>,
    pub status: AiTaskStatus,
    pub attempts: i64,
    pub error: Option<String>,
    pub reply_message_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AiTaskCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
    /// AES-256-GCM key for message bodies and previews. None = plaintext.
    encryption_key: Option<[u8; 32]>,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let db = Self { conn: Connection::open(path)?, encryption_key: None };
        db.init()?;
        Ok(db)
    }

    /// Open a database that encrypts message content at rest.
    pub fn open_encrypted<P: AsRef<Path>>(path: P, key: [u8; 32]) -> SqlResult<Self> {
        let db = Self { conn: Connection::open(path)?, encryption_key: Some(key) };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing and ephemeral runs).
    pub fn open_memory() -> SqlResult<Self> {
        let db = Self { conn: Connection::open_in_memory()?, encryption_key: None };
        db.init()?;
        Ok(db)
    }

    /// Run `f` as one transaction: every write it makes lands, or none do.
    pub fn atomically<R>(&self, f: impl FnOnce(&Db) -> SqlResult<R>) -> SqlResult<R> {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    /// Start a transaction for a multi-statement write, or join the one
    /// already open from [`Db::atomically`].
    fn begin(&self) -> SqlResult<Option<Transaction<'_>>> {
        if self.conn.is_autocommit() {
            self.conn.unchecked_transaction().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Run raw SQL against the connection.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> SqlResult<()> {
        self.conn.execute_batch(sql)
    }

    /// Enable or replace the at-rest key on an open handle.
    pub fn set_encryption_key(&mut self, key: Option<[u8; 32]>) {
        self.encryption_key = key;
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                uid           TEXT PRIMARY KEY,
                email         TEXT UNIQUE,
                password_hash TEXT,
                display_name  TEXT NOT NULL,
                bio           TEXT,
                university    TEXT,
                country       TEXT,
                created_at    INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token_hash TEXT PRIMARY KEY,
                uid        TEXT NOT NULL REFERENCES users(uid) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS categories (
                id          TEXT PRIMARY KEY,
                slug        TEXT NOT NULL UNIQUE,
                name        TEXT NOT NULL,
                description TEXT,
                position    INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS posts (
                id              TEXT PRIMARY KEY,
                title           TEXT NOT NULL,
                content         TEXT NOT NULL,
                category_id     TEXT REFERENCES categories(id) ON DELETE SET NULL,
                author_id       TEXT NOT NULL REFERENCES users(uid),
                image_urls_json TEXT NOT NULL DEFAULT '[]',
                tags_json       TEXT NOT NULL DEFAULT '[]',
                like_count      INTEGER NOT NULL DEFAULT 0,
                comment_count   INTEGER NOT NULL DEFAULT 0,
                view_count      INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_posts_category ON posts(category_id);
            CREATE INDEX IF NOT EXISTS idx_posts_author ON posts(author_id);

            CREATE TABLE IF NOT EXISTS comments (
                id         TEXT PRIMARY KEY,
                post_id    TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
                author_id  TEXT NOT NULL,
                content    TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_comments_post ON comments(post_id);

            CREATE TABLE IF NOT EXISTS likes (
                post_id    TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
                uid        TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (post_id, uid)
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id              TEXT PRIMARY KEY,
                participant_key TEXT NOT NULL UNIQUE,
                last_message    TEXT,
                last_message_at INTEGER,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversation_participants (
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                uid             TEXT NOT NULL,
                unread_count    INTEGER NOT NULL DEFAULT 0,
                last_read_at    INTEGER,
                PRIMARY KEY (conversation_id, uid)
            );

            CREATE INDEX IF NOT EXISTS idx_participants_uid ON conversation_participants(uid);

            CREATE TABLE IF NOT EXISTS messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender_id       TEXT NOT NULL,
                content         TEXT NOT NULL,
                image_url       TEXT,
                created_at      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);

            CREATE TABLE IF NOT EXISTS notifications (
                id           TEXT PRIMARY KEY,
                recipient_id TEXT NOT NULL,
                kind         TEXT NOT NULL,
                actor_id     TEXT,
                target_id    TEXT,
                text         TEXT NOT NULL,
                read         INTEGER NOT NULL DEFAULT 0,
                created_at   INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications(recipient_id);

            CREATE TABLE IF NOT EXISTS ai_tasks (
                id                 TEXT PRIMARY KEY,
                conversation_id    TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                trigger_message_id TEXT,
                status             TEXT NOT NULL DEFAULT 'pending',
                attempts           INTEGER NOT NULL DEFAULT 0,
                error              TEXT,
                reply_message_id   TEXT,
                created_at         INTEGER NOT NULL,
                updated_at         INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ai_tasks_status ON ai_tasks(status);
            ",
        )?;

        // Columns added after the first schema. ALTER TABLE ADD COLUMN fails
        // with "duplicate column name" once applied; that error is ignored.
        let migrations = [
            "ALTER TABLE users ADD COLUMN avatar_url TEXT",
            "ALTER TABLE users ADD COLUMN is_ai INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE posts ADD COLUMN ai_generated INTEGER NOT NULL DEFAULT 0",
        ];
        for sql in &migrations {
            let _ = self.conn.execute(sql, []);
        }

        self.seed_categories()?;
        self.ensure_ai_user()?;
        Ok(())
    }

    fn seed_categories(&self) -> SqlResult<()> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM categories", [], |r| r.get(0))?;
        if count > 0 {
            return Ok(());
        }
        for (pos, (slug, name, desc)) in DEFAULT_CATEGORIES.iter().enumerate() {
            self.conn.execute(
                "INSERT INTO categories (id, slug, name, description, position) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ids::generate(), slug, name, desc, pos as i64],
            )?;
        }
        Ok(())
    }

    // ── At-rest encryption ─────────────────────────────────────────────

    fn seal(&self, plaintext: &str) -> String {
        use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
        use base64::Engine;

        let Some(key) = self.encryption_key.as_ref() else {
            return plaintext.to_string();
        };
        let cipher = Aes256Gcm::new(key.into());
        let nonce_bytes: [u8; 12] = rand::random();
        match cipher.encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes()) {
            Ok(ct) => {
                let mut combined = nonce_bytes.to_vec();
                combined.extend_from_slice(&ct);
                format!("{EAR_PREFIX}{}", base64::engine::general_purpose::STANDARD.encode(combined))
            }
            Err(_) => {
                tracing::warn!("At-rest encryption failed; storing plaintext");
                plaintext.to_string()
            }
        }
    }

    fn open_sealed(&self, stored: String) -> String {
        use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
        use base64::Engine;

        let (Some(key), Some(b64)) = (self.encryption_key.as_ref(), stored.strip_prefix(EAR_PREFIX)) else {
            return stored;
        };
        let Ok(combined) = base64::engine::general_purpose::STANDARD.decode(b64) else {
            return stored;
        };
        if combined.len() <= 12 {
            return stored;
        }
        let (nonce, ct) = combined.split_at(12);
        match Aes256Gcm::new(key.into()).decrypt(Nonce::from_slice(nonce), ct) {
            Ok(pt) => String::from_utf8_lossy(&pt).into_owned(),
            Err(_) => stored,
        }
    }

    // ── Users ──────────────────────────────────────────────────────────

    /// Create an account. Fails with a constraint violation if the email is taken.
    pub fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        display_name: &str,
    ) -> SqlResult<UserProfile> {
        let uid = ids::generate();
        self.conn.execute(
            "INSERT INTO users (uid, email, password_hash, display_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![uid, email.to_lowercase(), password_hash, display_name, ids::now_ms() as i64],
        )?;
        self.get_user(&uid)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    /// Insert the AI assistant account if it does not exist yet.
    pub fn ensure_ai_user(&self) -> SqlResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO users (uid, display_name, bio, is_ai, created_at)
             VALUES (?1, 'Campus AI', 'Ask me anything about studying and living abroad.', 1, ?2)",
            params![AI_ASSISTANT_UID, ids::now_ms() as i64],
        )?;
        Ok(())
    }

    pub fn get_user(&self, uid: &str) -> SqlResult<Option<UserProfile>> {
        self.conn
            .query_row(
                "SELECT uid, email, display_name, bio, university, country, avatar_url, is_ai, created_at
                 FROM users WHERE uid = ?1",
                params![uid],
                user_from_row,
            )
            .optional()
    }

    pub fn get_user_by_email(&self, email: &str) -> SqlResult<Option<UserRecord>> {
        self.conn
            .query_row(
                "SELECT uid, email, display_name, bio, university, country, avatar_url, is_ai, created_at, password_hash
                 FROM users WHERE email = ?1",
                params![email.to_lowercase()],
                |row| {
                    Ok(UserRecord {
                        profile: user_from_row(row)?,
                        password_hash: row.get(9)?,
                    })
                },
            )
            .optional()
    }

    /// Apply a partial profile update. Empty strings clear optional fields.
    pub fn update_profile(&self, uid: &str, update: &UpdateProfileRequest) -> SqlResult<Option<UserProfile>> {
        fn clear_empty(v: &Option<String>) -> Option<Option<&str>> {
            v.as_deref().map(|s| if s.trim().is_empty() { None } else { Some(s.trim()) })
        }

        let tx = self.conn.unchecked_transaction()?;
        if let Some(name) = update.display_name.as_deref() {
            tx.execute("UPDATE users SET display_name = ?2 WHERE uid = ?1", params![uid, name.trim()])?;
        }
        let optional_fields = [
            ("bio", &update.bio),
            ("university", &update.university),
            ("country", &update.country),
            ("avatar_url", &update.avatar_url),
        ];
        for (column, value) in optional_fields {
            if let Some(v) = clear_empty(value) {
                tx.execute(&format!("UPDATE users SET {column} = ?2 WHERE uid = ?1"), params![uid, v])?;
            }
        }
        tx.commit()?;
        self.get_user(uid)
    }

    // ── Sessions ───────────────────────────────────────────────────────

    pub fn create_session(&self, token_hash: &str, uid: &str, now: i64, expires_at: i64) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO sessions (token_hash, uid, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![token_hash, uid, now, expires_at],
        )?;
        Ok(())
    }

    /// Resolve a session token hash to its user, ignoring expired sessions.
    pub fn session_user(&self, token_hash: &str, now: i64) -> SqlResult<Option<UserProfile>> {
        self.conn
            .query_row(
                "SELECT u.uid, u.email, u.display_name, u.bio, u.university, u.country, u.avatar_url, u.is_ai, u.created_at
                 FROM sessions s JOIN users u ON u.uid = s.uid
                 WHERE s.token_hash = ?1 AND s.expires_at > ?2",
                params![token_hash, now],
                user_from_row,
            )
            .optional()
    }

    pub fn delete_session(&self, token_hash: &str) -> SqlResult<bool> {
        let n = self.conn.execute("DELETE FROM sessions WHERE token_hash = ?1", params![token_hash])?;
        Ok(n > 0)
    }

    pub fn purge_expired_sessions(&self, now: i64) -> SqlResult<usize> {
        self.conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now])
    }

    // ── Categories ─────────────────────────────────────────────────────

    pub fn list_categories(&self) -> SqlResult<Vec<Category>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.slug, c.name, c.description,
                    (SELECT COUNT(*) FROM posts p WHERE p.category_id = c.id)
             FROM categories c ORDER BY c.position ASC, c.rowid ASC",
        )?;
        let rows = stmt.query_map([], category_from_row)?;
        rows.collect()
    }

    /// Look a category up by id or slug.
    pub fn get_category(&self, id_or_slug: &str) -> SqlResult<Option<Category>> {
        self.conn
            .query_row(
                "SELECT c.id, c.slug, c.name, c.description,
                        (SELECT COUNT(*) FROM posts p WHERE p.category_id = c.id)
                 FROM categories c WHERE c.id = ?1 OR c.slug = ?1",
                params![id_or_slug],
                category_from_row,
            )
            .optional()
    }

    pub fn create_category(&self, new: &NewCategory) -> SqlResult<Category> {
        let id = ids::generate();
        self.conn.execute(
            "INSERT INTO categories (id, slug, name, description, position)
             VALUES (?1, ?2, ?3, ?4, (SELECT COALESCE(MAX(position), -1) + 1 FROM categories))",
            params![id, new.slug.to_lowercase(), new.name, new.description],
        )?;
        self.get_category(&id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    // ── Posts ──────────────────────────────────────────────────────────

    pub fn create_post(&self, author_id: &str, new: &NewPost, ai_generated: bool) -> SqlResult<Post> {
        let id = ids::generate();
        self.conn.execute(
            "INSERT INTO posts (id, title, content, category_id, author_id, image_urls_json, tags_json, ai_generated, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                new.title.trim(),
                new.content,
                new.category_id,
                author_id,
                to_json_list(&new.image_urls),
                to_json_list(&new.tags),
                ai_generated,
                ids::now_ms() as i64,
            ],
        )?;
        self.get_post(&id, Some(author_id))?.ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    pub fn get_post(&self, id: &str, viewer: Option<&str>) -> SqlResult<Option<Post>> {
        let sql = format!("{POST_SELECT} WHERE p.id = ?2");
        self.conn.query_row(&sql, params![viewer, id], post_from_row).optional()
    }

    /// Newest-first page of posts. `limit` is clamped to 1..=100.
    pub fn list_posts(&self, filter: &PostFilter, viewer: Option<&str>) -> SqlResult<Vec<Post>> {
        let sql = format!(
            "{POST_SELECT}
             WHERE (?2 IS NULL OR c.id = ?2 OR c.slug = ?2)
               AND (?3 IS NULL OR p.author_id = ?3)
               AND (?4 IS NULL OR p.rowid < (SELECT rowid FROM posts WHERE id = ?4))
             ORDER BY p.rowid DESC
             LIMIT ?5"
        );
        let limit = filter.limit.clamp(1, 100) as i64;
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![viewer, filter.category, filter.author, filter.before, limit],
            post_from_row,
        )?;
        rows.collect()
    }

    pub fn update_post(&self, id: &str, update: &UpdatePost) -> SqlResult<Option<Post>> {
        let tx = self.conn.unchecked_transaction()?;
        if let Some(title) = update.title.as_deref() {
            tx.execute("UPDATE posts SET title = ?2 WHERE id = ?1", params![id, title.trim()])?;
        }
        if let Some(content) = update.content.as_deref() {
            tx.execute("UPDATE posts SET content = ?2 WHERE id = ?1", params![id, content])?;
        }
        if let Some(category) = update.category_id.as_deref() {
            let category = if category.is_empty() { None } else { Some(category) };
            tx.execute("UPDATE posts SET category_id = ?2 WHERE id = ?1", params![id, category])?;
        }
        if let Some(urls) = update.image_urls.as_ref() {
            tx.execute("UPDATE posts SET image_urls_json = ?2 WHERE id = ?1", params![id, to_json_list(urls)])?;
        }
        if let Some(tags) = update.tags.as_ref() {
            tx.execute("UPDATE posts SET tags_json = ?2 WHERE id = ?1", params![id, to_json_list(tags)])?;
        }
        tx.execute("UPDATE posts SET updated_at = ?2 WHERE id = ?1", params![id, ids::now_ms() as i64])?;
        tx.commit()?;
        self.get_post(id, None)
    }

    /// Delete a post; comments and likes cascade.
    pub fn delete_post(&self, id: &str) -> SqlResult<bool> {
        let n = self.conn.execute("DELETE FROM posts WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn increment_views(&self, id: &str) -> SqlResult<()> {
        self.conn.execute("UPDATE posts SET view_count = view_count + 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ── Comments ───────────────────────────────────────────────────────

    /// Add a comment. Returns None if the post does not exist.
    pub fn add_comment(&self, post_id: &str, author_id: &str, content: &str) -> SqlResult<Option<Comment>> {
        let tx = self.conn.unchecked_transaction()?;
        let updated = tx.execute(
            "UPDATE posts SET comment_count = comment_count + 1 WHERE id = ?1",
            params![post_id],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        let id = ids::generate();
        tx.execute(
            "INSERT INTO comments (id, post_id, author_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, post_id, author_id, content, ids::now_ms() as i64],
        )?;
        tx.commit()?;
        self.get_comment(&id)
    }

    pub fn get_comment(&self, id: &str) -> SqlResult<Option<Comment>> {
        self.conn
            .query_row(
                "SELECT cm.id, cm.post_id, cm.author_id, u.display_name, cm.content, cm.created_at
                 FROM comments cm LEFT JOIN users u ON u.uid = cm.author_id
                 WHERE cm.id = ?1",
                params![id],
                comment_from_row,
            )
            .optional()
    }

    /// Comments on a post, oldest first.
    pub fn list_comments(&self, post_id: &str, limit: usize) -> SqlResult<Vec<Comment>> {
        let mut stmt = self.conn.prepare(
            "SELECT cm.id, cm.post_id, cm.author_id, u.display_name, cm.content, cm.created_at
             FROM comments cm LEFT JOIN users u ON u.uid = cm.author_id
             WHERE cm.post_id = ?1
             ORDER BY cm.rowid ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![post_id, limit as i64], comment_from_row)?;
        rows.collect()
    }

    pub fn delete_comment(&self, id: &str) -> SqlResult<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let post_id: Option<String> = tx
            .query_row("SELECT post_id FROM comments WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        let Some(post_id) = post_id else {
            return Ok(false);
        };
        tx.execute("DELETE FROM comments WHERE id = ?1", params![id])?;
        tx.execute(
            "UPDATE posts SET comment_count = MAX(comment_count - 1, 0) WHERE id = ?1",
            params![post_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // ── Likes ──────────────────────────────────────────────────────────

    /// Like a post. Idempotent. Returns `(newly_liked, like_count)`, or None
    /// if the post does not exist.
    pub fn like_post(&self, post_id: &str, uid: &str) -> SqlResult<Option<(bool, i64)>> {
        let tx = self.conn.unchecked_transaction()?;
        if !post_exists(&tx, post_id)? {
            return Ok(None);
        }
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO likes (post_id, uid, created_at) VALUES (?1, ?2, ?3)",
            params![post_id, uid, ids::now_ms() as i64],
        )?;
        if inserted > 0 {
            tx.execute("UPDATE posts SET like_count = like_count + 1 WHERE id = ?1", params![post_id])?;
        }
        let count: i64 = tx.query_row("SELECT like_count FROM posts WHERE id = ?1", params![post_id], |r| r.get(0))?;
        tx.commit()?;
        Ok(Some((inserted > 0, count)))
    }

    /// Remove a like. Idempotent. Returns `(removed, like_count)`, or None
    /// if the post does not exist.
    pub fn unlike_post(&self, post_id: &str, uid: &str) -> SqlResult<Option<(bool, i64)>> {
        let tx = self.conn.unchecked_transaction()?;
        if !post_exists(&tx, post_id)? {
            return Ok(None);
        }
        let removed = tx.execute("DELETE FROM likes WHERE post_id = ?1 AND uid = ?2", params![post_id, uid])?;
        if removed > 0 {
            tx.execute(
                "UPDATE posts SET like_count = MAX(like_count - 1, 0) WHERE id = ?1",
                params![post_id],
            )?;
        }
        let count: i64 = tx.query_row("SELECT like_count FROM posts WHERE id = ?1", params![post_id], |r| r.get(0))?;
        tx.commit()?;
        Ok(Some((removed > 0, count)))
    }

    pub fn has_liked(&self, post_id: &str, uid: &str) -> SqlResult<bool> {
        self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM likes WHERE post_id = ?1 AND uid = ?2)",
            params![post_id, uid],
            |r| r.get(0),
        )
    }

    // ── Conversations ──────────────────────────────────────────────────

    /// Return the direct conversation between `a` and `b`, creating it if
    /// needed. The returned view is from `a`'s side. The bool is true when
    /// the conversation was created by this call.
    pub fn find_or_create_direct(&self, a: &str, b: &str) -> SqlResult<(Conversation, bool)> {
        let key = canonical_participant_key(a, b);
        let tx = self.conn.unchecked_transaction()?;
        let existing: Option<String> = tx
            .query_row("SELECT id FROM conversations WHERE participant_key = ?1", params![key], |r| r.get(0))
            .optional()?;
        let (id, created) = match existing {
            Some(id) => (id, false),
            None => {
                let id = ids::generate();
                tx.execute(
                    "INSERT INTO conversations (id, participant_key, created_at) VALUES (?1, ?2, ?3)",
                    params![id, key, ids::now_ms() as i64],
                )?;
                for uid in [a, b] {
                    tx.execute(
                        "INSERT OR IGNORE INTO conversation_participants (conversation_id, uid) VALUES (?1, ?2)",
                        params![id, uid],
                    )?;
                }
                (id, true)
            }
        };
        tx.commit()?;
        let conv = self.get_conversation(&id, a)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        Ok((conv, created))
    }

    /// A conversation as seen by `viewer` (unread count is the viewer's).
    pub fn get_conversation(&self, id: &str, viewer: &str) -> SqlResult<Option<Conversation>> {
        let sql = format!("{CONVERSATION_SELECT} WHERE c.id = ?2");
        let row = self.conn.query_row(&sql, params![viewer, id], raw_conversation).optional()?;
        Ok(row.map(|raw| self.finish_conversation(raw)))
    }

    /// Conversations `uid` takes part in, most recently active first.
    pub fn list_conversations(&self, uid: &str, limit: usize) -> SqlResult<Vec<Conversation>> {
        let sql = format!(
            "{CONVERSATION_SELECT}
             WHERE cp.uid IS NOT NULL
             ORDER BY COALESCE(c.last_message_at, c.created_at) DESC, c.rowid DESC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![uid, limit as i64], raw_conversation)?;
        rows.map(|r| r.map(|raw| self.finish_conversation(raw))).collect()
    }

    fn finish_conversation(&self, mut raw: Conversation) -> Conversation {
        raw.last_message = raw.last_message.take().map(|m| self.open_sealed(m));
        raw
    }

    pub fn is_participant(&self, conversation_id: &str, uid: &str) -> SqlResult<bool> {
        self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND uid = ?2)",
            params![conversation_id, uid],
            |r| r.get(0),
        )
    }

    pub fn participants(&self, conversation_id: &str) -> SqlResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT uid FROM conversation_participants WHERE conversation_id = ?1 ORDER BY uid",
        )?;
        let rows = stmt.query_map(params![conversation_id], |r| r.get(0))?;
        rows.collect()
    }

    // ── Messages ───────────────────────────────────────────────────────

    /// Store a message, refresh the conversation preview, and bump the
    /// unread counter of every participant except the sender.
    pub fn insert_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        image_url: Option<&str>,
    ) -> SqlResult<Message> {
        let id = ids::generate();
        let now = ids::now_ms() as i64;
        let preview: String = if content.trim().is_empty() && image_url.is_some() {
            "[image]".to_string()
        } else {
            content.chars().take(PREVIEW_CHARS).collect()
        };

        let tx = self.begin()?;
        self.conn.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, content, image_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, conversation_id, sender_id, self.seal(content), image_url, now],
        )?;
        self.conn.execute(
            "UPDATE conversations SET last_message = ?2, last_message_at = ?3 WHERE id = ?1",
            params![conversation_id, self.seal(&preview), now],
        )?;
        self.conn.execute(
            "UPDATE conversation_participants SET unread_count = unread_count + 1
             WHERE conversation_id = ?1 AND uid != ?2",
            params![conversation_id, sender_id],
        )?;
        if let Some(tx) = tx {
            tx.commit()?;
        }

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            image_url: image_url.map(|s| s.to_string()),
            created_at: ts(now),
        })
    }

    /// The `limit` most recent messages before the `before` cursor, returned
    /// oldest first.
    pub fn list_messages(&self, conversation_id: &str, limit: usize, before: Option<&str>) -> SqlResult<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, conversation_id, sender_id, content, image_url, created_at FROM (
                SELECT rowid AS rid, * FROM messages
                WHERE conversation_id = ?1
                  AND (?2 IS NULL OR rowid < (SELECT rowid FROM messages WHERE id = ?2))
                ORDER BY rowid DESC
                LIMIT ?3
             ) ORDER BY rid ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id, before, limit as i64], |row| {
            Ok(Message {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                sender_id: row.get(2)?,
                content: row.get(3)?,
                image_url: row.get(4)?,
                created_at: ts(row.get(5)?),
            })
        })?;
        rows.map(|r| {
            r.map(|mut m| {
                m.content = self.open_sealed(std::mem::take(&mut m.content));
                m
            })
        })
        .collect()
    }

    pub fn mark_read(&self, conversation_id: &str, uid: &str) -> SqlResult<bool> {
        let n = self.conn.execute(
            "UPDATE conversation_participants SET unread_count = 0, last_read_at = ?3
             WHERE conversation_id = ?1 AND uid = ?2",
            params![conversation_id, uid, ids::now_ms() as i64],
        )?;
        Ok(n > 0)
    }

    // ── Notifications ──────────────────────────────────────────────────

    /// Record a notification. Returns None (and stores nothing) when the
    /// actor is the recipient.
    pub fn create_notification(
        &self,
        recipient_id: &str,
        kind: NotificationKind,
        actor_id: Option<&str>,
        target_id: Option<&str>,
        text: &str,
    ) -> SqlResult<Option<Notification>> {
        if actor_id == Some(recipient_id) {
            return Ok(None);
        }
        let id = ids::generate();
        let now = ids::now_ms() as i64;
        self.conn.execute(
            "INSERT INTO notifications (id, recipient_id, kind, actor_id, target_id, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, recipient_id, kind.as_str(), actor_id, target_id, text, now],
        )?;
        Ok(Some(Notification {
            id,
            recipient_id: recipient_id.to_string(),
            kind,
            actor_id: actor_id.map(|s| s.to_string()),
            target_id: target_id.map(|s| s.to_string()),
            text: text.to_string(),
            read: false,
            created_at: ts(now),
        }))
    }

    /// Newest-first notifications for a user.
    pub fn list_notifications(&self, uid: &str, unread_only: bool, limit: usize) -> SqlResult<Vec<Notification>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, recipient_id, kind, actor_id, target_id, text, read, created_at
             FROM notifications
             WHERE recipient_id = ?1 AND (?2 = 0 OR read = 0)
             ORDER BY rowid DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![uid, unread_only, limit as i64], |row| {
            let kind: String = row.get(2)?;
            Ok(Notification {
                id: row.get(0)?,
                recipient_id: row.get(1)?,
                kind: NotificationKind::parse(&kind).unwrap_or(NotificationKind::Message),
                actor_id: row.get(3)?,
                target_id: row.get(4)?,
                text: row.get(5)?,
                read: row.get(6)?,
                created_at: ts(row.get(7)?),
            })
        })?;
        rows.collect()
    }

    pub fn mark_notification_read(&self, id: &str, uid: &str) -> SqlResult<bool> {
        let n = self.conn.execute(
            "UPDATE notifications SET read = 1 WHERE id = ?1 AND recipient_id = ?2",
            params![id, uid],
        )?;
        Ok(n > 0)
    }

    pub fn mark_all_notifications_read(&self, uid: &str) -> SqlResult<usize> {
        self.conn.execute(
            "UPDATE notifications SET read = 1 WHERE recipient_id = ?1 AND read = 0",
            params![uid],
        )
    }

    // ── AI task queue ──────────────────────────────────────────────────

    pub fn enqueue_ai_task(&self, conversation_id: &str, trigger_message_id: Option<&str>) -> SqlResult<AiTask> {
        let id = ids::generate();
        let now = ids::now_ms() as i64;
        self.conn.execute(
            "INSERT INTO ai_tasks (id, conversation_id, trigger_message_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
            params![id, conversation_id, trigger_message_id, now],
        )?;
        Ok(AiTask {
            id,
            conversation_id: conversation_id.to_string(),
            trigger_message_id: trigger_message_id.map(|s| s.to_string()),
            status: AiTaskStatus::Pending,
            attempts: 0,
            error: None,
            reply_message_id: None,
            created_at: now,
        })
    }

    /// Move up to `limit` pending tasks to `processing`, oldest first, and
    /// return them. A task is only ever claimed once.
    pub fn claim_pending_ai_tasks(&self, limit: usize) -> SqlResult<Vec<AiTask>> {
        let tx = self.conn.unchecked_transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM ai_tasks WHERE status = 'pending' ORDER BY rowid ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |r| r.get(0))?;
            rows.collect::<SqlResult<_>>()?
        };
        let claimed = claim_ids(&tx, &ids)?;
        tx.commit()?;
        Ok(claimed)
    }

    /// Claim every pending task of one conversation (used when a reply is
    /// requested directly, so the scheduler does not answer it again).
    pub fn claim_conversation_ai_tasks(&self, conversation_id: &str) -> SqlResult<Vec<AiTask>> {
        let tx = self.conn.unchecked_transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM ai_tasks WHERE status = 'pending' AND conversation_id = ?1 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map(params![conversation_id], |r| r.get(0))?;
            rows.collect::<SqlResult<_>>()?
        };
        let claimed = claim_ids(&tx, &ids)?;
        tx.commit()?;
        Ok(claimed)
    }

    pub fn complete_ai_task(&self, id: &str, reply_message_id: &str) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE ai_tasks SET status = 'completed', reply_message_id = ?2, error = NULL, updated_at = ?3
             WHERE id = ?1",
            params![id, reply_message_id, ids::now_ms() as i64],
        )?;
        Ok(())
    }

    pub fn fail_ai_task(&self, id: &str, error: &str) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE ai_tasks SET status = 'failed', error = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, error, ids::now_ms() as i64],
        )?;
        Ok(())
    }

    /// Put tasks left in `processing` (e.g. by a crash) back in the queue.
    pub fn requeue_processing_ai_tasks(&self) -> SqlResult<usize> {
        self.conn.execute(
            "UPDATE ai_tasks SET status = 'pending', updated_at = ?1 WHERE status = 'processing'",
            params![ids::now_ms() as i64],
        )
    }

    pub fn ai_task_counts(&self) -> SqlResult<AiTaskCounts> {
        let mut counts = AiTaskCounts::default();
        let mut stmt = self.conn.prepare("SELECT status, COUNT(*) FROM ai_tasks GROUP BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, n) = row?;
            match AiTaskStatus::parse(&status) {
                AiTaskStatus::Pending => counts.pending = n,
                AiTaskStatus::Processing => counts.processing = n,
                AiTaskStatus::Completed => counts.completed = n,
                AiTaskStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}

// ── Row helpers ────────────────────────────────────────────────────────

/// Post columns; `?1` is the viewer uid (NULL for anonymous reads).
const POST_SELECT: &str = "SELECT p.id, p.title, p.content, p.category_id, p.author_id, u.display_name,
        p.image_urls_json, p.tags_json, p.like_count, p.comment_count, p.view_count,
        p.ai_generated, p.created_at, p.updated_at,
        CASE WHEN ?1 IS NULL THEN NULL
             ELSE EXISTS(SELECT 1 FROM likes l WHERE l.post_id = p.id AND l.uid = ?1) END
    FROM posts p
    LEFT JOIN users u ON u.uid = p.author_id
    LEFT JOIN categories c ON c.id = p.category_id";

/// Conversation columns; `?1` is the viewer uid.
const CONVERSATION_SELECT: &str = "SELECT c.id, c.participant_key, c.last_message, c.last_message_at,
        COALESCE(cp.unread_count, 0), c.created_at
    FROM conversations c
    LEFT JOIN conversation_participants cp ON cp.conversation_id = c.id AND cp.uid = ?1";

fn to_json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn from_json_list(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

fn post_exists(conn: &Connection, post_id: &str) -> SqlResult<bool> {
    conn.query_row("SELECT EXISTS(SELECT 1 FROM posts WHERE id = ?1)", params![post_id], |r| r.get(0))
}

fn claim_ids(conn: &Connection, ids: &[String]) -> SqlResult<Vec<AiTask>> {
    let now = crate::ids::now_ms() as i64;
    let mut claimed = Vec::with_capacity(ids.len());
    for id in ids {
        let n = conn.execute(
            "UPDATE ai_tasks SET status = 'processing', attempts = attempts + 1, updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now],
        )?;
        if n == 0 {
            continue;
        }
        let task = conn.query_row(
            "SELECT id, conversation_id, trigger_message_id, status, attempts, error, reply_message_id, created_at
             FROM ai_tasks WHERE id = ?1",
            params![id],
            ai_task_from_row,
        )?;
        claimed.push(task);
    }
    Ok(claimed)
}

fn user_from_row(row: &Row<'_>) -> SqlResult<UserProfile> {
    Ok(UserProfile {
        uid: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        bio: row.get(3)?,
        university: row.get(4)?,
        country: row.get(5)?,
        avatar_url: row.get(6)?,
        is_ai: row.get::<_, Option<bool>>(7)?.unwrap_or(false),
        created_at: ts(row.get(8)?),
    })
}

fn category_from_row(row: &Row<'_>) -> SqlResult<Category> {
    Ok(Category {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        post_count: row.get(4)?,
    })
}

fn post_from_row(row: &Row<'_>) -> SqlResult<Post> {
    let image_urls: String = row.get(6)?;
    let tags: String = row.get(7)?;
    Ok(Post {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        category_id: row.get(3)?,
        author_id: row.get(4)?,
        author_name: row.get(5)?,
        image_urls: from_json_list(&image_urls),
        tags: from_json_list(&tags),
        like_count: row.get(8)?,
        comment_count: row.get(9)?,
        view_count: row.get(10)?,
        ai_generated: row.get::<_, Option<bool>>(11)?.unwrap_or(false),
        created_at: ts(row.get(12)?),
        updated_at: row.get::<_, Option<i64>>(13)?.map(ts),
        liked_by_me: row.get(14)?,
    })
}

fn comment_from_row(row: &Row<'_>) -> SqlResult<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        post_id: row.get(1)?,
        author_id: row.get(2)?,
        author_name: row.get(3)?,
        content: row.get(4)?,
        created_at: ts(row.get(5)?),
    })
}

/// Conversation with `last_message` still sealed.
fn raw_conversation(row: &Row<'_>) -> SqlResult<Conversation> {
    let key: String = row.get(1)?;
    Ok(Conversation {
        id: row.get(0)?,
        participants: key.split(',').map(|s| s.to_string()).collect(),
        last_message: row.get(2)?,
        last_message_at: row.get::<_, Option<i64>>(3)?.map(ts),
        unread_count: row.get(4)?,
        created_at: ts(row.get(5)?),
    })
}

fn ai_task_from_row(row: &Row<'_>) -> SqlResult<AiTask> {
    let status: String = row.get(3)?;
    Ok(AiTask {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        trigger_message_id: row.get(2)?,
        status: AiTaskStatus::parse(&status),
        attempts: row.get(4)?,
        error: row.get(5)?,
        reply_message_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_users() -> (Db, String, String) {
        let db = Db::open_memory().unwrap();
        let alice = db.create_user("alice@uni.edu", "hash-a", "Alice").unwrap();
        let bob = db.create_user("Bob@Uni.edu", "hash-b", "Bob").unwrap();
        (db, alice.uid, bob.uid)
    }

    fn new_post(title: &str, category: Option<&str>) -> NewPost {
        NewPost {
            title: title.to_string(),
            content: format!("{title} body"),
            category_id: category.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn seeds_categories_and_ai_user_once() {
        let db = Db::open_memory().unwrap();
        let cats = db.list_categories().unwrap();
        assert_eq!(cats.len(), DEFAULT_CATEGORIES.len());
        assert_eq!(cats[0].slug, "housing");
        db.init().unwrap();
        assert_eq!(db.list_categories().unwrap().len(), DEFAULT_CATEGORIES.len());

        let ai = db.get_user(AI_ASSISTANT_UID).unwrap().unwrap();
        assert!(ai.is_ai);
        assert!(ai.email.is_none());
    }

    #[test]
    fn email_is_unique_and_case_insensitive() {
        let (db, _, bob) = db_with_users();
        let rec = db.get_user_by_email("BOB@uni.edu").unwrap().unwrap();
        assert_eq!(rec.profile.uid, bob);
        assert_eq!(rec.password_hash.as_deref(), Some("hash-b"));
        assert!(db.create_user("alice@UNI.edu", "x", "Other").is_err());
    }

    #[test]
    fn profile_update_and_clear() {
        let (db, alice, _) = db_with_users();
        let upd = UpdateProfileRequest {
            bio: Some("MSc student".into()),
            country: Some("Korea".into()),
            ..Default::default()
        };
        let p = db.update_profile(&alice, &upd).unwrap().unwrap();
        assert_eq!(p.bio.as_deref(), Some("MSc student"));
        assert_eq!(p.display_name, "Alice");

        let clear = UpdateProfileRequest { bio: Some("".into()), ..Default::default() };
        let p = db.update_profile(&alice, &clear).unwrap().unwrap();
        assert!(p.bio.is_none());
        assert_eq!(p.country.as_deref(), Some("Korea"));
    }

    #[test]
    fn sessions_expire() {
        let (db, alice, _) = db_with_users();
        db.create_session("h1", &alice, 1_000, 2_000).unwrap();
        assert_eq!(db.session_user("h1", 1_500).unwrap().unwrap().uid, alice);
        assert!(db.session_user("h1", 2_000).unwrap().is_none());
        assert!(db.session_user("nope", 1_500).unwrap().is_none());
        assert_eq!(db.purge_expired_sessions(2_500).unwrap(), 1);
        assert!(!db.delete_session("h1").unwrap());
    }

    #[test]
    fn posts_paginate_newest_first() {
        let (db, alice, bob) = db_with_users();
        let housing = db.get_category("housing").unwrap().unwrap();
        let p1 = db.create_post(&alice, &new_post("one", Some(&housing.id)), false).unwrap();
        let p2 = db.create_post(&bob, &new_post("two", None), false).unwrap();
        let p3 = db.create_post(&alice, &new_post("three", Some(&housing.id)), false).unwrap();

        let all = db.list_posts(&PostFilter { limit: 10, ..Default::default() }, None).unwrap();
        let titles: Vec<_> = all.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, ["three", "two", "one"]);
        assert_eq!(all[0].author_name.as_deref(), Some("Alice"));
        assert!(all[0].liked_by_me.is_none());

        let page = db
            .list_posts(&PostFilter { before: Some(p3.id.clone()), limit: 1, ..Default::default() }, None)
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, p2.id);

        let by_slug = db
            .list_posts(&PostFilter { category: Some("housing".into()), limit: 10, ..Default::default() }, None)
            .unwrap();
        assert_eq!(by_slug.len(), 2);
        let by_author = db
            .list_posts(&PostFilter { author: Some(bob.clone()), limit: 10, ..Default::default() }, None)
            .unwrap();
        assert_eq!(by_author.len(), 1);

        assert_eq!(db.get_category("housing").unwrap().unwrap().post_count, 2);
        assert!(db.get_post(&p1.id, None).unwrap().is_some());
    }

    #[test]
    fn update_post_fields() {
        let (db, alice, _) = db_with_users();
        let post = db.create_post(&alice, &new_post("draft", None), false).unwrap();
        assert!(post.updated_at.is_none());
        let upd = UpdatePost {
            title: Some("final".into()),
            tags: Some(vec!["visa".into(), "f1".into()]),
            ..Default::default()
        };
        let post = db.update_post(&post.id, &upd).unwrap().unwrap();
        assert_eq!(post.title, "final");
        assert_eq!(post.content, "draft body");
        assert_eq!(post.tags, ["visa", "f1"]);
        assert!(post.updated_at.is_some());
    }

    #[test]
    fn likes_are_idempotent() {
        let (db, alice, bob) = db_with_users();
        let post = db.create_post(&alice, &new_post("p", None), false).unwrap();
        assert_eq!(db.like_post(&post.id, &bob).unwrap(), Some((true, 1)));
        assert_eq!(db.like_post(&post.id, &bob).unwrap(), Some((false, 1)));
        assert_eq!(db.like_post(&post.id, &alice).unwrap(), Some((true, 2)));
        assert!(db.has_liked(&post.id, &bob).unwrap());
        assert_eq!(db.get_post(&post.id, Some(&bob)).unwrap().unwrap().liked_by_me, Some(true));

        assert_eq!(db.unlike_post(&post.id, &bob).unwrap(), Some((true, 1)));
        assert_eq!(db.unlike_post(&post.id, &bob).unwrap(), Some((false, 1)));
        assert_eq!(db.get_post(&post.id, Some(&bob)).unwrap().unwrap().liked_by_me, Some(false));
        assert_eq!(db.like_post("missing", &bob).unwrap(), None);
    }

    #[test]
    fn comments_maintain_count_and_cascade() {
        let (db, alice, bob) = db_with_users();
        let post = db.create_post(&alice, &new_post("p", None), false).unwrap();
        let c1 = db.add_comment(&post.id, &bob, "first").unwrap().unwrap();
        db.add_comment(&post.id, &alice, "second").unwrap().unwrap();
        assert!(db.add_comment("missing", &bob, "x").unwrap().is_none());

        let comments = db.list_comments(&post.id, 50).unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].content, "first");
        assert_eq!(comments[0].author_name.as_deref(), Some("Bob"));
        assert_eq!(db.get_post(&post.id, None).unwrap().unwrap().comment_count, 2);

        assert!(db.delete_comment(&c1.id).unwrap());
        assert!(!db.delete_comment(&c1.id).unwrap());
        assert_eq!(db.get_post(&post.id, None).unwrap().unwrap().comment_count, 1);

        db.like_post(&post.id, &bob).unwrap();
        assert!(db.delete_post(&post.id).unwrap());
        assert!(db.list_comments(&post.id, 50).unwrap().is_empty());
        assert!(!db.has_liked(&post.id, &bob).unwrap());
    }

    #[test]
    fn canonical_key_ignores_order() {
        assert_eq!(canonical_participant_key("b", "a"), "a,b");
        assert_eq!(canonical_participant_key("a", "b"), "a,b");
    }

    #[test]
    fn direct_conversation_found_from_either_side() {
        let (db, alice, bob) = db_with_users();
        let (c1, created) = db.find_or_create_direct(&alice, &bob).unwrap();
        assert!(created);
        let (c2, created) = db.find_or_create_direct(&bob, &alice).unwrap();
        assert!(!created);
        assert_eq!(c1.id, c2.id);
        assert_eq!(c1.participants.len(), 2);
        assert!(db.is_participant(&c1.id, &alice).unwrap());
        assert!(!db.is_participant(&c1.id, AI_ASSISTANT_UID).unwrap());
    }

    #[test]
    fn messages_track_unread_and_preview() {
        let (db, alice, bob) = db_with_users();
        let (conv, _) = db.find_or_create_direct(&alice, &bob).unwrap();
        db.insert_message(&conv.id, &alice, "hi bob", None).unwrap();
        db.insert_message(&conv.id, &alice, "", Some("http://x/img.png")).unwrap();

        let bob_view = db.get_conversation(&conv.id, &bob).unwrap().unwrap();
        assert_eq!(bob_view.unread_count, 2);
        assert_eq!(bob_view.last_message.as_deref(), Some("[image]"));
        assert_eq!(db.get_conversation(&conv.id, &alice).unwrap().unwrap().unread_count, 0);

        assert!(db.mark_read(&conv.id, &bob).unwrap());
        assert_eq!(db.get_conversation(&conv.id, &bob).unwrap().unwrap().unread_count, 0);

        let listed = db.list_conversations(&bob, 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(db.list_conversations(AI_ASSISTANT_UID, 10).unwrap().is_empty());
    }

    #[test]
    fn atomically_rolls_back_every_write() {
        let (db, alice, bob) = db_with_users();
        let (conv, _) = db.find_or_create_direct(&alice, &bob).unwrap();

        let result = db.atomically(|db| {
            db.insert_message(&conv.id, &alice, "lost", None)?;
            db.create_notification(&bob, NotificationKind::Message, Some(&alice), Some(&conv.id), "Alice: lost")?;
            db.enqueue_ai_task("no-such-conversation", None)
        });
        assert!(result.is_err());
        assert!(db.list_messages(&conv.id, 10, None).unwrap().is_empty());
        assert!(db.list_notifications(&bob, false, 10).unwrap().is_empty());
        let bob_view = db.get_conversation(&conv.id, &bob).unwrap().unwrap();
        assert_eq!(bob_view.unread_count, 0);
        assert!(bob_view.last_message.is_none());

        let msg = db
            .atomically(|db| {
                let msg = db.insert_message(&conv.id, &alice, "kept", None)?;
                db.enqueue_ai_task(&conv.id, Some(&msg.id))?;
                Ok(msg)
            })
            .unwrap();
        assert_eq!(db.list_messages(&conv.id, 10, None).unwrap()[0].id, msg.id);
        assert_eq!(db.ai_task_counts().unwrap().pending, 1);
    }

    #[test]
    fn message_window_is_oldest_first() {
        let (db, alice, bob) = db_with_users();
        let (conv, _) = db.find_or_create_direct(&alice, &bob).unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(db.insert_message(&conv.id, &alice, &format!("m{i}"), None).unwrap().id);
        }
        let last_two = db.list_messages(&conv.id, 2, None).unwrap();
        let texts: Vec<_> = last_two.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, ["m3", "m4"]);

        let before = db.list_messages(&conv.id, 2, Some(&ids[3])).unwrap();
        let texts: Vec<_> = before.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, ["m1", "m2"]);
    }

    #[test]
    fn messages_encrypted_at_rest() {
        let mut db = Db::open_memory().unwrap();
        db.set_encryption_key(Some([7u8; 32]));
        let a = db.create_user("a@x.io", "h", "A").unwrap().uid;
        let b = db.create_user("b@x.io", "h", "B").unwrap().uid;
        let (conv, _) = db.find_or_create_direct(&a, &b).unwrap();
        db.insert_message(&conv.id, &a, "secret plans", None).unwrap();

        let raw: String = db
            .conn
            .query_row("SELECT content FROM messages", [], |r| r.get(0))
            .unwrap();
        assert!(raw.starts_with(EAR_PREFIX));
        assert!(!raw.contains("secret"));

        let msgs = db.list_messages(&conv.id, 10, None).unwrap();
        assert_eq!(msgs[0].content, "secret plans");
        let view = db.get_conversation(&conv.id, &b).unwrap().unwrap();
        assert_eq!(view.last_message.as_deref(), Some("secret plans"));

        // Legacy plaintext rows stay readable once a key is configured.
        db.conn.execute("UPDATE messages SET content = 'legacy'", []).unwrap();
        assert_eq!(db.list_messages(&conv.id, 10, None).unwrap()[0].content, "legacy");
    }

    #[test]
    fn encrypted_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("campus.db");
        let conv_id = {
            let db = Db::open_encrypted(&path, [9u8; 32]).unwrap();
            let a = db.create_user("a@x.io", "h", "A").unwrap().uid;
            let (conv, _) = db.find_or_create_direct(&a, AI_ASSISTANT_UID).unwrap();
            db.insert_message(&conv.id, &a, "visa appointment at 9", None).unwrap();
            conv.id
        };

        let db = Db::open_encrypted(&path, [9u8; 32]).unwrap();
        assert_eq!(db.list_messages(&conv_id, 10, None).unwrap()[0].content, "visa appointment at 9");
        let plain = Db::open(&path).unwrap();
        assert!(plain.list_messages(&conv_id, 10, None).unwrap()[0].content.starts_with(EAR_PREFIX));
    }

    #[test]
    fn notifications_skip_self_and_mark_read() {
        let (db, alice, bob) = db_with_users();
        assert!(db
            .create_notification(&alice, NotificationKind::Like, Some(&alice), None, "self")
            .unwrap()
            .is_none());
        let n1 = db
            .create_notification(&alice, NotificationKind::Like, Some(&bob), Some("p1"), "Bob liked your post")
            .unwrap()
            .unwrap();
        db.create_notification(&alice, NotificationKind::Comment, Some(&bob), Some("p1"), "Bob commented")
            .unwrap();

        let all = db.list_notifications(&alice, false, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, NotificationKind::Comment);

        assert!(db.mark_notification_read(&n1.id, &alice).unwrap());
        assert!(!db.mark_notification_read(&n1.id, &bob).unwrap());
        assert_eq!(db.list_notifications(&alice, true, 10).unwrap().len(), 1);
        assert_eq!(db.mark_all_notifications_read(&alice).unwrap(), 1);
        assert!(db.list_notifications(&alice, true, 10).unwrap().is_empty());
    }

    #[test]
    fn ai_tasks_claimed_once() {
        let (db, alice, _) = db_with_users();
        let (conv, _) = db.find_or_create_direct(&alice, AI_ASSISTANT_UID).unwrap();
        let t1 = db.enqueue_ai_task(&conv.id, None).unwrap();
        let t2 = db.enqueue_ai_task(&conv.id, None).unwrap();

        let first = db.claim_pending_ai_tasks(1).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, t1.id);
        assert_eq!(first[0].status, AiTaskStatus::Processing);
        assert_eq!(first[0].attempts, 1);

        let rest = db.claim_pending_ai_tasks(10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, t2.id);
        assert!(db.claim_pending_ai_tasks(10).unwrap().is_empty());

        db.complete_ai_task(&t1.id, "msg-1").unwrap();
        db.fail_ai_task(&t2.id, "provider down").unwrap();
        let counts = db.ai_task_counts().unwrap();
        assert_eq!(counts, AiTaskCounts { pending: 0, processing: 0, completed: 1, failed: 1 });
        let error: Option<String> = db
            .conn
            .query_row("SELECT error FROM ai_tasks WHERE id = ?1", params![t2.id], |r| r.get(0))
            .unwrap();
        assert_eq!(error.as_deref(), Some("provider down"));
    }

    #[test]
    fn conversation_claim_and_requeue() {
        let (db, alice, bob) = db_with_users();
        let (ai_conv, _) = db.find_or_create_direct(&alice, AI_ASSISTANT_UID).unwrap();
        let (other, _) = db.find_or_create_direct(&bob, AI_ASSISTANT_UID).unwrap();
        db.enqueue_ai_task(&ai_conv.id, None).unwrap();
        db.enqueue_ai_task(&other.id, None).unwrap();

        let claimed = db.claim_conversation_ai_tasks(&ai_conv.id).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(db.ai_task_counts().unwrap().pending, 1);

        assert_eq!(db.requeue_processing_ai_tasks().unwrap(), 1);
        assert_eq!(db.ai_task_counts().unwrap().pending, 2);
    }
}
