use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::ipc::types::{AppState, Request};
use crate::resolver::{AccessDenied, Requester, Timestamp};
use crate::store::parse_ts;

pub fn conn(state: &AppState) -> ServiceResult<&Connection> {
    state.db.as_ref().ok_or(ServiceError::NoWorkspace)
}

pub fn requester(req: &Request) -> ServiceResult<&Requester> {
    req.requester
        .as_ref()
        .ok_or(ServiceError::Forbidden(AccessDenied::Unauthenticated))
}

pub fn require_admin(req: &Request) -> ServiceResult<&Requester> {
    let r = requester(req)?;
    if !r.is_admin() {
        return Err(AccessDenied::AdminOnly.into());
    }
    Ok(r)
}

/// Any staff member (or an administrator without a staff profile).
pub fn require_staff(req: &Request) -> ServiceResult<&Requester> {
    let r = requester(req)?;
    if r.staff_id.is_none() && !r.is_admin() {
        return Err(AccessDenied::Unauthenticated.into());
    }
    Ok(r)
}

pub fn required_str(params: &serde_json::Value, key: &str) -> ServiceResult<String> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ServiceError::bad_params(format!("missing {key}")))?;
    if s.is_empty() {
        return Err(ServiceError::bad_params(format!("{key} must not be empty")));
    }
    Ok(s)
}

/// Ids are UUIDs; anything else is rejected before touching the database.
pub fn required_id(params: &serde_json::Value, key: &str) -> ServiceResult<String> {
    let raw = required_str(params, key)?;
    check_id(key, raw)
}

pub fn optional_id(params: &serde_json::Value, key: &str) -> ServiceResult<Option<String>> {
    match optional_str(params, key)? {
        Some(raw) => Ok(Some(check_id(key, raw)?)),
        None => Ok(None),
    }
}

fn check_id(key: &str, raw: String) -> ServiceResult<String> {
    Uuid::parse_str(&raw)
        .map(|u| u.to_string())
        .map_err(|_| ServiceError::bad_params(format!("{key} is not a valid id: {raw}")))
}

/// Missing, null and blank all read as `None`.
pub fn optional_str(params: &serde_json::Value, key: &str) -> ServiceResult<Option<String>> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| ServiceError::bad_params(format!("{key} must be a string")))?
                .trim();
            Ok((!s.is_empty()).then(|| s.to_string()))
        }
    }
}

/// Patch semantics: absent → `None` (leave as is), null or blank →
/// `Some(None)` (clear), string → `Some(Some(..))`.
pub fn patch_str(params: &serde_json::Value, key: &str) -> ServiceResult<Option<Option<String>>> {
    if params.get(key).is_none() {
        return Ok(None);
    }
    optional_str(params, key).map(Some)
}

pub fn optional_bool(params: &serde_json::Value, key: &str) -> ServiceResult<Option<bool>> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| ServiceError::bad_params(format!("{key} must be a boolean"))),
    }
}

pub fn optional_date(params: &serde_json::Value, key: &str) -> ServiceResult<Option<NaiveDate>> {
    match optional_str(params, key)? {
        Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| ServiceError::bad_params(format!("{key} must be YYYY-MM-DD"))),
        None => Ok(None),
    }
}

/// `params.at` when given (RFC3339), otherwise the current time.
pub fn at_or_now(params: &serde_json::Value) -> ServiceResult<Timestamp> {
    match optional_str(params, "at")? {
        Some(s) => parse_ts(&s)
            .map_err(|_| ServiceError::bad_params("at must be an RFC3339 timestamp")),
        None => Ok(Utc::now()),
    }
}
