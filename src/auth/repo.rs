use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{NewUser, User};

const USER_COLUMNS: &str = "id, name, email, password_hash, image, gender, refresh_token, api_key, created_at, updated_at";

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("email already registered")]
    DuplicateEmail,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Credential store. Every write is a single-row operation; callers rely on
/// per-row atomicity and nothing else.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn create(&self, user: NewUser) -> Result<User, RepoError>;

    /// Overwrite (or clear) the stored refresh token. Returns false if the user is gone.
    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> anyhow::Result<bool>;

    /// Replace the stored refresh token only if it still equals `current`.
    async fn rotate_refresh_token(&self, id: Uuid, current: &str, next: &str) -> anyhow::Result<bool>;

    async fn set_api_key(&self, id: Uuid, api_key: &str) -> anyhow::Result<bool>;
    async fn delete(&self, id: Uuid) -> anyhow::Result<bool>;
    async fn ping(&self) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .context("find user by id")?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
            .bind(email)
            .fetch_optional(&self.db)
            .await
            .context("find user by email")?;
        Ok(user)
    }

    async fn create(&self, user: NewUser) -> Result<User, RepoError> {
        let result = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (id, name, email, password_hash, image, gender)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.image)
        .bind(&user.gender)
        .fetch_one(&self.db)
        .await;

        match result {
            Ok(user) => Ok(user),
            Err(e) if is_unique_violation(&e) => Err(RepoError::DuplicateEmail),
            Err(e) => Err(anyhow::Error::new(e).context("insert user").into()),
        }
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> anyhow::Result<bool> {
        let res = sqlx::query("UPDATE users SET refresh_token = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(token)
            .execute(&self.db)
            .await
            .context("set refresh token")?;
        Ok(res.rows_affected() == 1)
    }

    async fn rotate_refresh_token(&self, id: Uuid, current: &str, next: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET refresh_token = $3, updated_at = now()
             WHERE id = $1 AND refresh_token = $2
            "#,
        )
        .bind(id)
        .bind(current)
        .bind(next)
        .execute(&self.db)
        .await
        .context("rotate refresh token")?;
        Ok(res.rows_affected() == 1)
    }

    async fn set_api_key(&self, id: Uuid, api_key: &str) -> anyhow::Result<bool> {
        let res = sqlx::query("UPDATE users SET api_key = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(api_key)
            .execute(&self.db)
            .await
            .context("set api key")?;
        Ok(res.rows_affected() == 1)
    }

    async fn delete(&self, id: Uuid) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .context("delete user")?;
        Ok(res.rows_affected() == 1)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.db)
            .await
            .context("ping users database")?;
        Ok(())
    }
}

/// In-process store for tests and `USER_STORE=memory`.
#[derive(Clone, Default)]
pub struct MemoryUserStore {
    users: Arc<DashMap<Uuid, User>>,
    by_email: Arc<DashMap<String, Uuid>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, id: Uuid, f: F) -> bool
    where
        F: FnOnce(&mut User) -> bool,
    {
        match self.users.get_mut(&id) {
            Some(mut user) => {
                let changed = f(user.value_mut());
                if changed {
                    user.updated_at = OffsetDateTime::now_utc();
                }
                changed
            }
            None => false,
        }
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let Some(id) = self.by_email.get(email).map(|id| *id) else {
            return Ok(None);
        };
        self.find_by_id(id).await
    }

    async fn create(&self, new: NewUser) -> Result<User, RepoError> {
        match self.by_email.entry(new.email.clone()) {
            Entry::Occupied(_) => Err(RepoError::DuplicateEmail),
            Entry::Vacant(slot) => {
                let now = OffsetDateTime::now_utc();
                let user = User {
                    id: Uuid::new_v4(),
                    name: new.name,
                    email: new.email,
                    password_hash: new.password_hash,
                    image: Some(new.image),
                    gender: new.gender,
                    refresh_token: None,
                    api_key: None,
                    created_at: now,
                    updated_at: now,
                };
                self.users.insert(user.id, user.clone());
                slot.insert(user.id);
                Ok(user)
            }
        }
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> anyhow::Result<bool> {
        Ok(self.update(id, |user| {
            user.refresh_token = token.map(str::to_string);
            true
        }))
    }

    async fn rotate_refresh_token(&self, id: Uuid, current: &str, next: &str) -> anyhow::Result<bool> {
        Ok(self.update(id, |user| {
            if user.refresh_token.as_deref() != Some(current) {
                return false;
            }
            user.refresh_token = Some(next.to_string());
            true
        }))
    }

    async fn set_api_key(&self, id: Uuid, api_key: &str) -> anyhow::Result<bool> {
        Ok(self.update(id, |user| {
            user.api_key = Some(api_key.to_string());
            true
        }))
    }

    async fn delete(&self, id: Uuid) -> anyhow::Result<bool> {
        match self.users.remove(&id) {
            Some((_, user)) => {
                self.by_email.remove(&user.email);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
