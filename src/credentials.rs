use crate::catalog::Catalog;
use crate::error::{AppError, AppResult};
use crate::models::User;
use anyhow::Context;
use std::sync::Arc;
use tokio::task;

pub struct CredentialStore {
    catalog: Arc<Catalog>,
    cost: u32,
    /// Verified against when the email is unknown, so both failure paths
    /// cost one bcrypt verification at the same cost factor.
    dummy_hash: String,
}

impl CredentialStore {
    pub fn new(catalog: Arc<Catalog>, cost: u32) -> anyhow::Result<Self> {
        let dummy_hash = bcrypt::hash("no-such-user", cost).context("Failed to prepare dummy hash")?;
        Ok(Self {
            catalog,
            cost,
            dummy_hash,
        })
    }

    /// Creates an account and returns its user id.
    pub async fn register(&self, email: &str, password: &str) -> AppResult<String> {
        let email = normalize_email(email);
        if !is_reasonable_email(&email) {
            return Err(AppError::bad_request("A valid email is required"));
        }
        if password.is_empty() {
            return Err(AppError::bad_request("Password cannot be empty"));
        }

        if self.catalog.user_by_email(&email).await?.is_some() {
            return Err(AppError::Conflict("Email already registered".to_string()));
        }

        let password = password.to_owned();
        let cost = self.cost;
        let password_hash = task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .context("Password hashing worker failed")?
            .context("Failed to hash password")?;

        let user = User::new(email, password_hash);
        // The unique index still decides races between concurrent registrations.
        if !self.catalog.create_user(&user).await? {
            return Err(AppError::Conflict("Email already registered".to_string()));
        }

        tracing::info!(user_id = %user.id, "user registered");
        Ok(user.id)
    }

    /// Checks a login attempt. Unknown email and wrong password fail the same way.
    pub async fn verify(&self, email: &str, password: &str) -> AppResult<String> {
        let email = normalize_email(email);
        let user = self.catalog.user_by_email(&email).await?;

        let (user_id, hash) = match user {
            Some(user) => (Some(user.id), user.password_hash),
            None => (None, self.dummy_hash.clone()),
        };

        let password = password.to_owned();
        let matches = task::spawn_blocking(move || bcrypt::verify(password, &hash).unwrap_or(false))
            .await
            .context("Password verification worker failed")?;

        match user_id {
            Some(id) if matches => {
                tracing::debug!(user_id = %id, "credentials verified");
                Ok(id)
            }
            _ => Err(AppError::InvalidCredentials),
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn is_reasonable_email(email: &str) -> bool {
    if email.len() < 3 || email.len() > 254 {
        return false;
    }
    let mut parts = email.split('@');
    let local = parts.next().unwrap_or_default();
    let domain = parts.next().unwrap_or_default();
    parts.next().is_none()
        && !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
