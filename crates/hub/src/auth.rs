//! Bearer-token authentication and role-based farm visibility.

use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::Farm;
use crate::error::ApiError;
use crate::web::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sees and acts on own farms only.
    Farmer,
    Staff,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Farmer => "farmer",
            Self::Staff => "staff",
            Self::Admin => "admin",
        }
    }

    /// Staff and admins may operate on every farm.
    pub fn is_operator(&self) -> bool {
        matches!(self, Self::Staff | Self::Admin)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "farmer" => Ok(Self::Farmer),
            "staff" => Ok(Self::Staff),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("unknown role '{s}'")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller behind a request's `Authorization: Bearer <token>` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
    pub role: Role,
}

impl AuthUser {
    pub fn can_access(&self, farm: &Farm) -> bool {
        self.role.is_operator() || farm.owner == self.username
    }

    pub fn ensure_access(&self, farm: &Farm) -> Result<(), ApiError> {
        if self.can_access(farm) {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }

    pub fn ensure_operator(&self) -> Result<(), ApiError> {
        if self.role.is_operator() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

/// Extract the token from an `Authorization` header value.
pub(crate) fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .ok_or(ApiError::Unauthorized)?;

        let user = state
            .db
            .user_by_token(token)
            .await?
            .ok_or(ApiError::Unauthorized)?;

        Ok(Self {
            username: user.username,
            role: user.role,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
