use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::FacilityConfig;
use crate::resolver::Requester;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Verified claims forwarded by the host. Absent for unauthenticated
    /// calls such as `health`.
    #[serde(default)]
    pub requester: Option<Requester>,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub config: FacilityConfig,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            config: FacilityConfig::default(),
        }
    }
}
