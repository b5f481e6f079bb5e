//! SQLite-backed credential store.
//!
//! Holds credential records and their refresh history. Token columns are
//! sealed with AES-256-GCM; everything else is stored in the clear.

use super::encryption::TokenCipher;
use super::{
    CredentialRecord, CredentialUpdate, NewCredential, RefreshLog, RefreshLogEntry,
    RefreshStatus,
};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const RECORD_COLUMNS: &str = "id, name, description, enabled, \
     refresh_url, refresh_method, refresh_headers, refresh_body_template, \
     access_token_path, refresh_token_path, expires_in_path, custom_variables, \
     access_token, access_token_nonce, refresh_token, refresh_token_nonce, \
     token_expires_at, refresh_before_seconds, \
     created_at, updated_at, last_refresh_at, last_refresh_status";

const LOG_COLUMNS: &str = "id, credential_id, refresh_at, status, error_message, \
     old_token_preview, new_token_preview, \
     old_refresh_token_preview, new_refresh_token_preview, response_body";

/// Credential and refresh-log storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     name TEXT NOT NULL UNIQUE,
///     ...
///     access_token TEXT,            -- Encrypted (NULL when never fetched)
///     access_token_nonce TEXT,
///     refresh_token TEXT,           -- Encrypted
///     refresh_token_nonce TEXT,
///     token_expires_at TEXT,        -- RFC 3339 (NULL = never expires)
///     ...
/// );
/// CREATE TABLE refresh_logs (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     credential_id INTEGER NOT NULL REFERENCES credentials(id) ON DELETE CASCADE,
///     ...
/// );
/// ```
///
/// # Thread Safety
/// The connection sits behind a mutex, so every operation is one atomic
/// read or write. No transaction spans a whole refresh attempt.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`:memory:` for tests)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher =
            TokenCipher::from_base64_key(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                refresh_url TEXT NOT NULL,
                refresh_method TEXT NOT NULL DEFAULT 'POST',
                refresh_headers TEXT NOT NULL DEFAULT '{}',
                refresh_body_template TEXT NOT NULL DEFAULT '',
                access_token_path TEXT NOT NULL,
                refresh_token_path TEXT NOT NULL,
                expires_in_path TEXT,
                custom_variables TEXT NOT NULL DEFAULT '',
                access_token TEXT,
                access_token_nonce TEXT,
                refresh_token TEXT,
                refresh_token_nonce TEXT,
                token_expires_at TEXT,
                refresh_before_seconds INTEGER NOT NULL DEFAULT 300,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_refresh_at TEXT,
                last_refresh_status TEXT
            );

            CREATE TABLE IF NOT EXISTS refresh_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                credential_id INTEGER NOT NULL
                    REFERENCES credentials(id) ON DELETE CASCADE,
                refresh_at TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                old_token_preview TEXT NOT NULL DEFAULT '',
                new_token_preview TEXT NOT NULL DEFAULT '',
                old_refresh_token_preview TEXT NOT NULL DEFAULT '',
                new_refresh_token_preview TEXT NOT NULL DEFAULT '',
                response_body TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_refresh_logs_credential
                ON refresh_logs(credential_id);
            "#,
        )
        .context("Failed to create schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Credential store connection lock poisoned"))
    }

    /// Inserts a new, enabled credential and returns the stored record.
    pub fn create(&self, new: NewCredential) -> Result<CredentialRecord> {
        let config = new.config.normalized();
        let headers = serde_json::to_string(&config.refresh_headers)
            .context("Failed to serialize refresh headers")?;
        let (refresh_token, refresh_token_nonce) = self.seal_optional(&new.refresh_token)?;
        let now = Utc::now().to_rfc3339();

        let id = {
            let conn = self.conn()?;
            conn.execute(
                r#"
                INSERT INTO credentials (
                    name, description, enabled,
                    refresh_url, refresh_method, refresh_headers, refresh_body_template,
                    access_token_path, refresh_token_path, expires_in_path,
                    custom_variables, refresh_token, refresh_token_nonce,
                    refresh_before_seconds, created_at, updated_at
                )
                VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
                "#,
                params![
                    config.name,
                    config.description,
                    config.refresh_url,
                    config.refresh_method,
                    headers,
                    config.refresh_body_template,
                    config.access_token_path,
                    config.refresh_token_path,
                    config.expires_in_path,
                    config.custom_variables,
                    refresh_token,
                    refresh_token_nonce,
                    config.refresh_before_seconds,
                    now,
                ],
            )
            .context("Failed to create credential")?;
            conn.last_insert_rowid()
        };

        self.get(id)?
            .ok_or_else(|| anyhow!("Credential {} vanished after insert", id))
    }

    /// Retrieves one credential, decrypting its tokens.
    pub fn get(&self, id: i64) -> Result<Option<CredentialRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM credentials WHERE id = ?1",
                RECORD_COLUMNS
            ))
            .context("Failed to prepare query")?;
        let mut rows = stmt.query(params![id]).context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(self.row_to_record(row)?)),
            None => Ok(None),
        }
    }

    /// Lists every credential, newest first.
    pub fn list_all(&self) -> Result<Vec<CredentialRecord>> {
        self.query_records(&format!(
            "SELECT {} FROM credentials ORDER BY created_at DESC, id DESC",
            RECORD_COLUMNS
        ))
    }

    /// Lists credentials the scheduler should consider.
    pub fn list_enabled(&self) -> Result<Vec<CredentialRecord>> {
        self.query_records(&format!(
            "SELECT {} FROM credentials WHERE enabled = 1 ORDER BY id",
            RECORD_COLUMNS
        ))
    }

    fn query_records(&self, sql: &str) -> Result<Vec<CredentialRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).context("Failed to prepare query")?;
        let mut rows = stmt.query([]).context("Failed to execute query")?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().context("Failed to read row")? {
            records.push(self.row_to_record(row)?);
        }
        Ok(records)
    }

    /// Replaces a credential's configuration.
    ///
    /// Token state is left alone unless the update carries a new refresh
    /// token. Returns `Ok(None)` if the credential does not exist.
    pub fn update_config(
        &self,
        id: i64,
        update: CredentialUpdate,
    ) -> Result<Option<CredentialRecord>> {
        let config = update.config.normalized();
        let headers = serde_json::to_string(&config.refresh_headers)
            .context("Failed to serialize refresh headers")?;
        let seeded_refresh = match update.refresh_token.as_deref() {
            Some(token) if !token.is_empty() => Some(self.cipher.seal(token)?),
            _ => None,
        };
        let now = Utc::now().to_rfc3339();

        let updated = {
            let mut conn = self.conn()?;
            let tx = conn.transaction().context("Failed to begin transaction")?;

            let updated = tx
                .execute(
                    r#"
                    UPDATE credentials SET
                        name = ?2, description = ?3, enabled = COALESCE(?4, enabled),
                        refresh_url = ?5, refresh_method = ?6,
                        refresh_headers = ?7, refresh_body_template = ?8,
                        access_token_path = ?9, refresh_token_path = ?10,
                        expires_in_path = ?11, custom_variables = ?12,
                        refresh_before_seconds = ?13, updated_at = ?14
                    WHERE id = ?1
                    "#,
                    params![
                        id,
                        config.name,
                        config.description,
                        update.enabled,
                        config.refresh_url,
                        config.refresh_method,
                        headers,
                        config.refresh_body_template,
                        config.access_token_path,
                        config.refresh_token_path,
                        config.expires_in_path,
                        config.custom_variables,
                        config.refresh_before_seconds,
                        now,
                    ],
                )
                .context("Failed to update credential")?;

            if updated > 0 {
                if let Some(sealed) = &seeded_refresh {
                    tx.execute(
                        "UPDATE credentials SET refresh_token = ?2, refresh_token_nonce = ?3 WHERE id = ?1",
                        params![id, sealed.ciphertext, sealed.nonce],
                    )
                    .context("Failed to replace refresh token")?;
                }
            }

            tx.commit().context("Failed to commit credential update")?;
            updated
        };

        if updated == 0 {
            return Ok(None);
        }
        self.get(id)
    }

    /// Records a successful refresh: new tokens, new expiry, outcome and time.
    pub fn update_tokens(
        &self,
        id: i64,
        access_token: &str,
        refresh_token: &str,
        expires_at: Option<DateTime<Utc>>,
        status: RefreshStatus,
    ) -> Result<()> {
        let (access, access_nonce) = self.seal_optional(access_token)?;
        let (refresh, refresh_nonce) = self.seal_optional(refresh_token)?;
        let now = Utc::now().to_rfc3339();

        let updated = self
            .conn()?
            .execute(
                r#"
                UPDATE credentials SET
                    access_token = ?2, access_token_nonce = ?3,
                    refresh_token = ?4, refresh_token_nonce = ?5,
                    token_expires_at = ?6,
                    last_refresh_at = ?7, last_refresh_status = ?8,
                    updated_at = ?7
                WHERE id = ?1
                "#,
                params![
                    id,
                    access,
                    access_nonce,
                    refresh,
                    refresh_nonce,
                    expires_at.map(|dt| dt.to_rfc3339()),
                    now,
                    status.as_str(),
                ],
            )
            .context("Failed to update credential tokens")?;

        if updated == 0 {
            bail!("Credential {} not found", id);
        }
        Ok(())
    }

    /// Records the outcome of an attempt without touching tokens.
    pub fn update_status(&self, id: i64, status: RefreshStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn()?
            .execute(
                r#"
                UPDATE credentials SET
                    last_refresh_at = ?2, last_refresh_status = ?3, updated_at = ?2
                WHERE id = ?1
                "#,
                params![id, now, status.as_str()],
            )
            .context("Failed to update refresh status")?;

        if updated == 0 {
            bail!("Credential {} not found", id);
        }
        Ok(())
    }

    /// Flips the enabled flag. Returns the new value, or `None` if not found.
    pub fn toggle(&self, id: i64) -> Result<Option<bool>> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE credentials SET enabled = NOT enabled, updated_at = ?2 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )
            .context("Failed to toggle credential")?;

        if updated == 0 {
            return Ok(None);
        }

        let enabled: bool = conn
            .query_row(
                "SELECT enabled FROM credentials WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to read enabled flag")?;
        Ok(Some(enabled))
    }

    /// Deletes a credential and, by cascade, its refresh history.
    ///
    /// # Returns
    /// * `Ok(true)` - Credential deleted
    /// * `Ok(false)` - No such credential
    pub fn delete(&self, id: i64) -> Result<bool> {
        let rows_affected = self
            .conn()?
            .execute("DELETE FROM credentials WHERE id = ?1", params![id])
            .context("Failed to delete credential")?;
        Ok(rows_affected > 0)
    }

    /// Appends one refresh attempt to the log. Returns the new log id.
    pub fn append_log(&self, entry: &RefreshLogEntry) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO refresh_logs (
                credential_id, refresh_at, status, error_message,
                old_token_preview, new_token_preview,
                old_refresh_token_preview, new_refresh_token_preview,
                response_body
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                entry.credential_id,
                Utc::now().to_rfc3339(),
                entry.status.as_str(),
                entry.error_message,
                entry.old_token_preview,
                entry.new_token_preview,
                entry.old_refresh_token_preview,
                entry.new_refresh_token_preview,
                entry.response_body,
            ],
        )
        .context("Failed to append refresh log")?;
        Ok(conn.last_insert_rowid())
    }

    /// Returns up to `limit` log records for a credential, newest first.
    pub fn list_logs(&self, credential_id: i64, limit: usize) -> Result<Vec<RefreshLog>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM refresh_logs WHERE credential_id = ?1 ORDER BY id DESC LIMIT ?2",
                LOG_COLUMNS
            ))
            .context("Failed to prepare query")?;
        let mut rows = stmt
            .query(params![credential_id, limit as i64])
            .context("Failed to execute query")?;

        let mut logs = Vec::new();
        while let Some(row) = rows.next().context("Failed to read row")? {
            logs.push(row_to_log(row)?);
        }
        Ok(logs)
    }

    fn seal_optional(&self, token: &str) -> Result<(Option<String>, Option<String>)> {
        if token.is_empty() {
            return Ok((None, None));
        }
        let sealed = self.cipher.seal(token).context("Failed to encrypt token")?;
        Ok((Some(sealed.ciphertext), Some(sealed.nonce)))
    }

    fn open_optional(&self, ciphertext: Option<String>, nonce: Option<String>) -> Result<String> {
        match (ciphertext, nonce) {
            (Some(ciphertext), Some(nonce)) => self
                .cipher
                .open(&ciphertext, &nonce)
                .context("Failed to decrypt token"),
            _ => Ok(String::new()),
        }
    }

    fn row_to_record(&self, row: &Row<'_>) -> Result<CredentialRecord> {
        let headers_json: String = row.get(6)?;
        let refresh_headers: BTreeMap<String, String> =
            serde_json::from_str(&headers_json).context("Failed to parse stored headers")?;

        let current_access_token = self.open_optional(row.get(12)?, row.get(13)?)?;
        let current_refresh_token = self.open_optional(row.get(14)?, row.get(15)?)?;

        let last_refresh_status: Option<String> = row.get(21)?;

        Ok(CredentialRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            enabled: row.get(3)?,
            refresh_url: row.get(4)?,
            refresh_method: row.get(5)?,
            refresh_headers,
            refresh_body_template: row.get(7)?,
            access_token_path: row.get(8)?,
            refresh_token_path: row.get(9)?,
            expires_in_path: row.get(10)?,
            custom_variables: row.get(11)?,
            current_access_token,
            current_refresh_token,
            token_expires_at: parse_optional_timestamp(row.get(16)?)?,
            refresh_before_seconds: row.get(17)?,
            created_at: parse_timestamp(&row.get::<_, String>(18)?)?,
            updated_at: parse_timestamp(&row.get::<_, String>(19)?)?,
            last_refresh_at: parse_optional_timestamp(row.get(20)?)?,
            last_refresh_status: last_refresh_status
                .as_deref()
                .and_then(RefreshStatus::parse),
        })
    }
}

/// True if the error chain bottoms out in a SQLite constraint violation,
/// e.g. a duplicate credential name.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    })
}

fn row_to_log(row: &Row<'_>) -> Result<RefreshLog> {
    let status: String = row.get(3)?;
    Ok(RefreshLog {
        id: row.get(0)?,
        credential_id: row.get(1)?,
        refresh_at: parse_timestamp(&row.get::<_, String>(2)?)?,
        status: RefreshStatus::parse(&status)
            .ok_or_else(|| anyhow!("Unknown refresh status '{}'", status))?,
        error_message: row.get(4)?,
        old_token_preview: row.get(5)?,
        new_token_preview: row.get(6)?,
        old_refresh_token_preview: row.get(7)?,
        new_refresh_token_preview: row.get(8)?,
        response_body: row.get(9)?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp '{}'", s))
}

fn parse_optional_timestamp(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_timestamp).transpose()
}
