use crate::error::{ServiceError, ServiceResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{at_or_now, conn, require_staff, required_id};
use crate::ipc::types::{AppState, Request};
use crate::resolver::format_timestamp;
use crate::store::Store;
use serde_json::json;

fn require_student(store: &Store<'_>, student_id: &str) -> ServiceResult<()> {
    match store.find_student(student_id)? {
        Some(_) => Ok(()),
        None => Err(ServiceError::not_found("student")),
    }
}

fn handle_check_in(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    require_staff(req)?;
    let store = Store::new(conn(state)?);
    let student_id = required_id(&req.params, "studentId")?;
    let at = at_or_now(&req.params)?;
    require_student(&store, &student_id)?;

    let record = store.check_in(&student_id, &at, state.config.local_day(&at))?;
    tracing::info!(student_id = %student_id, "checked in");
    Ok(json!({
        "attendanceId": record.id,
        "studentId": record.student_id,
        "checkIn": format_timestamp(&record.check_in),
    }))
}

fn handle_check_out(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    require_staff(req)?;
    let store = Store::new(conn(state)?);
    let student_id = required_id(&req.params, "studentId")?;
    let at = at_or_now(&req.params)?;
    require_student(&store, &student_id)?;

    let record = store.check_out(&student_id, &at)?;
    tracing::info!(student_id = %student_id, "checked out");
    Ok(json!({
        "attendanceId": record.id,
        "studentId": record.student_id,
        "checkIn": format_timestamp(&record.check_in),
        "checkOut": record.check_out.as_ref().map(format_timestamp),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "attendance.checkIn" => handle_check_in(state, req),
        "attendance.checkOut" => handle_check_out(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
