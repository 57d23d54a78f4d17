use crate::config::FacilityConfig;
use crate::db;
use crate::error::{ServiceError, ServiceResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};

fn handle_health(state: &mut AppState, _req: &Request) -> ServiceResult<serde_json::Value> {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
    }))
}

/// Opens (or creates) the workspace database and loads its settings.
pub fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path)?;
    // A broken setting must not keep the workspace from opening.
    let config = FacilityConfig::load(&conn).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "ignoring invalid facility settings");
        FacilityConfig::default()
    });
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    state.config = config;
    tracing::info!(workspace = %path.to_string_lossy(), "workspace opened");
    Ok(())
}

fn handle_workspace_select(
    state: &mut AppState,
    req: &Request,
) -> ServiceResult<serde_json::Value> {
    let path = PathBuf::from(required_str(&req.params, "path")?);
    open_workspace(state, &path)
        .map_err(|e| ServiceError::Internal(e.context("failed to open workspace")))?;
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "health" => handle_health(state, req),
        "workspace.select" => handle_workspace_select(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
