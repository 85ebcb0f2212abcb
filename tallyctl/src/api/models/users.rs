//! Account creation payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    api::models::auth::validate_credentials,
    db::models::users::{UserCreateDBRequest, UserDBResponse},
    errors::Error,
};

const MAX_EMAIL_LENGTH: usize = 254;
const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, Deserialize)]
pub struct UserCreate {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Interface language, `en` when absent
    #[serde(default)]
    pub language: Option<String>,
}

impl UserCreate {
    pub fn validate(&self) -> Result<(), Error> {
        validate_credentials(&self.username, &self.password)?;

        if let Some(email) = &self.email {
            let well_formed = email
                .split_once('@')
                .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.'));
            if !well_formed || email.len() > MAX_EMAIL_LENGTH {
                return Err(Error::BadRequest {
                    message: "Email address is not valid".to_string(),
                });
            }
        }

        if let Some(language) = &self.language
            && !(2..=10).contains(&language.len())
        {
            return Err(Error::BadRequest {
                message: "Language must be between 2 and 10 characters".to_string(),
            });
        }
        Ok(())
    }

    pub fn into_db_request(self, password_hash: String, role: &str) -> UserCreateDBRequest {
        UserCreateDBRequest {
            username: self.username,
            email: self.email,
            password_hash: Some(password_hash),
            role: role.to_string(),
            language: self.language.unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub uuid: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub role: String,
    pub language: String,
}

impl From<&UserDBResponse> for UserResponse {
    fn from(user: &UserDBResponse) -> Self {
        Self {
            uuid: user.uuid,
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
            language: user.language.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HasUsersResponse {
    pub has_users: bool,
}
