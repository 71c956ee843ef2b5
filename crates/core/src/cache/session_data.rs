//! Session metadata and unavailability ledger CRUD.

use super::connection::CacheDb;
use crate::Error;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

/// Persisted metadata for one session key.
///
/// Written once per completed network flow that is allowed to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SessionData {
    pub session_key: String,
    /// ETag-equivalent validation tag.
    pub etag: String,
    /// Template identity tag.
    pub template_tag: String,
    /// SHA-256 hex of the full document.
    pub html_hash: String,
    /// Byte length of the full document.
    pub html_size: u64,
    pub csp: Option<String>,
    pub csp_report_only: Option<String>,
    pub updated_at: String,
}

impl SessionData {
    /// True when both validation tags are present.
    pub fn has_tags(&self) -> bool {
        !self.etag.is_empty() && !self.template_tag.is_empty()
    }
}

impl CacheDb {
    /// Insert or replace the metadata row for a session key.
    pub async fn upsert_session_data(&self, data: &SessionData) -> Result<(), Error> {
        let data = data.clone();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO session_data (
                    session_key, etag, template_tag, html_hash, html_size, csp, csp_report_only, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(session_key) DO UPDATE SET
                    etag = excluded.etag,
                    template_tag = excluded.template_tag,
                    html_hash = excluded.html_hash,
                    html_size = excluded.html_size,
                    csp = excluded.csp,
                    csp_report_only = excluded.csp_report_only,
                    updated_at = excluded.updated_at",
                    params![
                        &data.session_key,
                        &data.etag,
                        &data.template_tag,
                        &data.html_hash,
                        data.html_size as i64,
                        &data.csp,
                        &data.csp_report_only,
                        &data.updated_at,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Get the metadata row for a session key, if any.
    pub async fn get_session_data(&self, session_key: &str) -> Result<Option<SessionData>, Error> {
        let key = session_key.to_string();
        self.conn
            .call(move |conn| -> Result<Option<SessionData>, Error> {
                let result = conn.query_row(
                    "SELECT session_key, etag, template_tag, html_hash, html_size, csp, csp_report_only, updated_at
                     FROM session_data WHERE session_key = ?1",
                    params![key],
                    |row| {
                        Ok(SessionData {
                            session_key: row.get(0)?,
                            etag: row.get(1)?,
                            template_tag: row.get(2)?,
                            html_hash: row.get(3)?,
                            html_size: row.get::<_, i64>(4)?.max(0) as u64,
                            csp: row.get(5)?,
                            csp_report_only: row.get(6)?,
                            updated_at: row.get(7)?,
                        })
                    },
                );

                match result {
                    Ok(d) => Ok(Some(d)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Delete the metadata row for a session key.
    ///
    /// Returns true if a row was removed.
    pub async fn remove_session_data(&self, session_key: &str) -> Result<bool, Error> {
        let key = session_key.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let count = conn.execute("DELETE FROM session_data WHERE session_key = ?1", params![key])?;
                Ok(count > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Record that `session_key` must skip the network until `until_ms` (unix millis).
    pub async fn set_unavailable_until(&self, session_key: &str, until_ms: i64) -> Result<(), Error> {
        let key = session_key.to_string();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO unavailable_windows (session_key, until_ms) VALUES (?1, ?2)
                     ON CONFLICT(session_key) DO UPDATE SET until_ms = excluded.until_ms",
                    params![key, until_ms],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Cooldown deadline for a key, in unix millis. Zero when none is recorded.
    pub async fn unavailable_until(&self, session_key: &str) -> Result<i64, Error> {
        let key = session_key.to_string();
        self.conn
            .call(move |conn| -> Result<i64, Error> {
                let result = conn.query_row(
                    "SELECT until_ms FROM unavailable_windows WHERE session_key = ?1",
                    params![key],
                    |row| row.get(0),
                );
                match result {
                    Ok(v) => Ok(v),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Delete every metadata row and cooldown window.
    ///
    /// Returns the number of metadata rows deleted.
    pub async fn clear_all(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let count = conn.execute("DELETE FROM session_data", [])?;
                conn.execute("DELETE FROM unavailable_windows", [])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }
}
