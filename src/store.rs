//! SQLite record store for users, chat history, and file metadata.

use rusqlite::{Connection, OptionalExtension, params};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Errors from the record store.
#[derive(Debug)]
pub enum StoreError {
    /// Failed to open the database file.
    Open { path: PathBuf, source: rusqlite::Error },
    /// Insert hit an existing row with the same key.
    Duplicate,
    /// Any other SQLite failure.
    Sqlite(rusqlite::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { path, source } => {
                write!(f, "failed to open database '{}': {}", path.display(), source)
            }
            Self::Duplicate => write!(f, "record already exists"),
            Self::Sqlite(e) => write!(f, "database error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } => Some(source),
            Self::Duplicate => None,
            Self::Sqlite(e) => Some(e),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

/// A registered user. One row per chat id.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub chat_id: i64,
    pub first_name: String,
    pub username: Option<String>,
    /// Set by the contact handler after the user shares their contact.
    pub phone_number: Option<String>,
}

/// One text exchange: what the user sent and what the bot answered.
#[derive(Debug, Clone)]
pub struct ChatHistoryEntry {
    pub chat_id: i64,
    pub user_message: String,
    pub bot_response: String,
    pub timestamp: String,
}

/// Metadata for a downloaded attachment.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub chat_id: i64,
    pub file_path: String,
    pub description: String,
    pub timestamp: String,
}

/// Current time formatted for TEXT timestamp columns.
pub fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Record store over a single SQLite database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Open { path: path.to_path_buf(), source: e })?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("failed to create in-memory database");
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema().expect("failed to initialize schema");
        store
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS users (
                chat_id INTEGER PRIMARY KEY,
                first_name TEXT NOT NULL,
                username TEXT,
                phone_number TEXT
            );

            CREATE TABLE IF NOT EXISTS chats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                user_message TEXT NOT NULL,
                bot_response TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                file_path TEXT NOT NULL,
                description TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chats_chat_id ON chats(chat_id);
            CREATE INDEX IF NOT EXISTS idx_files_chat_id ON files(chat_id);
        "#)?;
        Ok(())
    }

    /// Point lookup by chat id.
    pub fn find_user(&self, chat_id: i64) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                "SELECT chat_id, first_name, username, phone_number FROM users WHERE chat_id = ?1",
                params![chat_id],
                |row| {
                    Ok(User {
                        chat_id: row.get(0)?,
                        first_name: row.get(1)?,
                        username: row.get(2)?,
                        phone_number: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// Insert a new user. The primary key is the sole arbiter of registration:
    /// a second insert for the same chat id returns `StoreError::Duplicate`.
    pub fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO users (chat_id, first_name, username, phone_number) VALUES (?1, ?2, ?3, ?4)",
            params![user.chat_id, user.first_name, user.username, user.phone_number],
        );
        match result {
            Ok(_) => Ok(()),
            // Only a key collision means "already registered"; other
            // constraint failures stay ordinary store errors
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(StoreError::Duplicate)
            }
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    /// Set a user's phone number. Silent no-op when no row matches.
    pub fn update_user_phone(&self, chat_id: i64, phone_number: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE users SET phone_number = ?2 WHERE chat_id = ?1",
            params![chat_id, phone_number],
        )?;
        if updated == 0 {
            debug!("phone update for unregistered chat {chat_id}, ignoring");
        }
        Ok(())
    }

    /// Append one text exchange to the chat history log.
    pub fn append_chat_history(&self, entry: &ChatHistoryEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO chats (chat_id, user_message, bot_response, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![entry.chat_id, entry.user_message, entry.bot_response, entry.timestamp],
        )?;
        Ok(())
    }

    /// Append metadata for one downloaded attachment.
    pub fn append_file_record(&self, record: &FileRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO files (chat_id, file_path, description, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![record.chat_id, record.file_path, record.description, record.timestamp],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn user_count(&self) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    #[cfg(test)]
    pub fn chat_history_count(&self) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM chats", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    #[cfg(test)]
    pub fn file_record_count(&self) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    #[cfg(test)]
    pub fn file_paths(&self) -> Vec<String> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT file_path FROM files ORDER BY id").unwrap();
        let rows = stmt.query_map([], |row| row.get(0)).unwrap();
        rows.filter_map(Result::ok).collect()
    }

    #[cfg(test)]
    pub fn execute_batch(&self, sql: &str) {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql).expect("failed to execute test SQL");
    }
}
