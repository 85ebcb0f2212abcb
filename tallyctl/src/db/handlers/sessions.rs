//! Durable session store backed by the `websessions` table.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    auth::session::SessionStore,
    db::{
        errors::{DbError, Result},
        models::sessions::SessionDBResponse,
    },
    types::{SessionToken, UserId, abbrev_token},
};

#[derive(Debug, FromRow)]
struct SessionRow {
    session_id: String,
    user_id: UserId,
    browser: String,
    created_at: DateTime<Utc>,
    username: String,
    language: String,
    email: Option<String>,
    uuid: String,
    user_role: String,
}

fn parse_uuid(value: &str, column: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| DbError::Other(anyhow::anyhow!("corrupt {column} '{value}': {e}")))
}

impl TryFrom<SessionRow> for SessionDBResponse {
    type Error = DbError;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Self {
            token: parse_uuid(&row.session_id, "websessions.session_id")?,
            uuid: parse_uuid(&row.uuid, "users.uuid")?,
            user_id: row.user_id,
            browser: row.browser,
            created_at: row.created_at,
            username: row.username,
            language: row.language,
            email: row.email,
            role: row.user_role,
        })
    }
}

/// Sessions persisted in SQLite. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Sessions {
    pool: SqlitePool,
}

impl Sessions {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionStore for Sessions {
    #[instrument(skip(self, token, created_at), fields(token = %abbrev_token(&token)), err)]
    async fn create_session(&self, token: SessionToken, user_id: UserId, browser: &str, created_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT INTO websessions (session_id, user_id, browser, created_at) VALUES (?, ?, ?, ?)")
            .bind(token.to_string())
            .bind(user_id)
            .bind(browser)
            .bind(created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, token), fields(token = %abbrev_token(&token)), err)]
    async fn get_session(&self, token: SessionToken) -> Result<Option<SessionDBResponse>> {
        sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT s.session_id, s.user_id, s.browser, s.created_at,
                   u.username, u.language, u.email, u.uuid, u.user_role
            FROM websessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.session_id = ?
            "#,
        )
        .bind(token.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(SessionDBResponse::try_from)
        .transpose()
    }

    #[instrument(skip(self, token), fields(token = %abbrev_token(&token)), err)]
    async fn delete_session(&self, token: SessionToken) -> Result<()> {
        sqlx::query("DELETE FROM websessions WHERE session_id = ?")
            .bind(token.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_sessions_for_user(&self, user_id: UserId) -> Result<Vec<SessionToken>> {
        let deleted: Vec<String> = sqlx::query_scalar("DELETE FROM websessions WHERE user_id = ? RETURNING session_id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        deleted.iter().map(|token| parse_uuid(token, "websessions.session_id")).collect()
    }
}
