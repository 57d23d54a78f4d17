use thiserror::Error;

use crate::resolver::AccessDenied;

/// Errors a handler may surface to the caller. Enrichment failures never end
/// up here; they are folded into a less detailed response.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(#[from] AccessDenied),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("select a workspace first")]
    NoWorkspace,
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn not_found(what: &str) -> Self {
        Self::NotFound(format!("{what} not found"))
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidRequest(_) => "bad_params",
            Self::NoWorkspace => "no_workspace",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(e.into())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
