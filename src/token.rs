use crate::error::{AppError, AppResult};
use chrono::{Duration, Utc};
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated user id.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and checks HS256 session tokens with a fixed lifetime.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &str, ttl: std::time::Duration) -> anyhow::Result<Self> {
        let ttl = Duration::from_std(ttl)?;
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        })
    }

    pub fn issue(&self, user_id: &str) -> AppResult<String> {
        let now = Utc::now();
        self.sign(user_id, now.timestamp(), (now + self.ttl).timestamp())
    }

    fn sign(&self, user_id: &str, iat: i64, exp: i64) -> AppResult<String> {
        let claims = Claims {
            sub: user_id.to_owned(),
            iat,
            exp,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AppError::Storage(anyhow::anyhow!("Failed to sign token: {e}")))
    }

    /// Returns the user id carried by a valid token.
    pub fn verify(&self, token: &str) -> AppResult<String> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::Unauthenticated);
        }

        match jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation) {
            Ok(data) => Ok(data.claims.sub),
            Err(e) => match e.kind() {
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => Err(AppError::Unauthenticated),
                _ => Err(AppError::InvalidToken),
            },
        }
    }
}
