use crate::config::{parse_offset, FacilityConfig, KEY_UTC_OFFSET_MINUTES};
use crate::db;
use crate::error::{ServiceError, ServiceResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{conn, require_admin, requester};
use crate::ipc::types::{AppState, Request};

fn handle_settings_get(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    requester(req)?;
    conn(state)?;
    Ok(state.config.to_json())
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    require_admin(req)?;
    let conn = conn(state)?;
    let mut next: FacilityConfig = state.config;

    let Some(obj) = req.params.as_object() else {
        return Err(ServiceError::bad_params("params must be an object"));
    };
    for (key, value) in obj {
        match key.as_str() {
            KEY_UTC_OFFSET_MINUTES => {
                next.utc_offset_minutes =
                    parse_offset(value).map_err(|e| ServiceError::bad_params(e.to_string()))?;
            }
            other => {
                return Err(ServiceError::bad_params(format!("unknown setting: {other}")));
            }
        }
    }
    if next != state.config {
        let value = serde_json::json!(next.utc_offset_minutes);
        db::settings_set_json(conn, KEY_UTC_OFFSET_MINUTES, &value)?;
        tracing::info!(utc_offset_minutes = next.utc_offset_minutes, "facility settings updated");
    }

    state.config = next;
    Ok(next.to_json())
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "settings.get" => handle_settings_get(state, req),
        "settings.update" => handle_settings_update(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
