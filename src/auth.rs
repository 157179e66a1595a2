use std::{fmt, str::FromStr};

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::AppError;

/// Set by the upstream identity gateway.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Driver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Driver => "driver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "driver" => Ok(Role::Driver),
            _ => Err(AppError::Unauthorized),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct CurrentUser(pub AuthenticatedUser);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        let id = header(USER_ID_HEADER).ok_or(AppError::Unauthorized)?;
        let role = header(USER_ROLE_HEADER)
            .ok_or(AppError::Unauthorized)?
            .parse()?;
        Ok(Self(AuthenticatedUser {
            id: id.to_string(),
            role,
        }))
    }
}

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn require_client(&self) -> Result<&AuthenticatedUser, AppError> {
        self.require(Role::Client)
    }

    pub fn require_driver(&self) -> Result<&AuthenticatedUser, AppError> {
        self.require(Role::Driver)
    }

    fn require(&self, role: Role) -> Result<&AuthenticatedUser, AppError> {
        if self.0.role == role {
            Ok(&self.0)
        } else {
            Err(AppError::Forbidden)
        }
    }
}
