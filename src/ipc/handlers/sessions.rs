use crate::error::{ServiceError, ServiceResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{at_or_now, conn, optional_id, require_staff, required_id};
use crate::ipc::types::{AppState, Request};
use crate::resolver::{format_timestamp, AccessDenied, Requester};
use crate::store::Store;
use serde_json::json;

/// A session linked to a group makes its supervisors count as supervisors of
/// that group while it runs, so only the group's long-term staff may start
/// one or be listed on it.
fn authorize_session(
    store: &Store<'_>,
    requester: &Requester,
    group_id: &str,
    supervisor_ids: &[String],
) -> ServiceResult<()> {
    if requester.is_admin() {
        return Ok(());
    }
    let Some(staff_id) = requester.staff_id.as_deref() else {
        return Err(AccessDenied::Unauthenticated.into());
    };
    let listed = supervisor_ids.iter().map(String::as_str);
    for sid in std::iter::once(staff_id).chain(listed) {
        if !store.supervises_long_term(sid, group_id)? {
            return Err(AccessDenied::NotSessionSupervisor.into());
        }
    }
    Ok(())
}

fn handle_active_groups_start(
    state: &mut AppState,
    req: &Request,
) -> ServiceResult<serde_json::Value> {
    let requester = require_staff(req)?;
    let store = Store::new(conn(state)?);
    let group_id = optional_id(&req.params, "groupId")?;
    let room_id = optional_id(&req.params, "roomId")?;
    let at = at_or_now(&req.params)?;

    let mut supervisor_ids = Vec::new();
    if let Some(items) = req.params.get("supervisorIds") {
        let Some(items) = items.as_array() else {
            return Err(ServiceError::bad_params("supervisorIds must be an array"));
        };
        for item in items {
            let wrapped = json!({ "staffId": item });
            supervisor_ids.push(required_id(&wrapped, "staffId")?);
        }
    }
    // Whoever starts the session supervises it unless told otherwise.
    if supervisor_ids.is_empty() {
        if let Some(sid) = requester.staff_id.as_deref() {
            supervisor_ids.push(sid.to_string());
        }
    }

    if let Some(gid) = group_id.as_deref() {
        authorize_session(&store, requester, gid, &supervisor_ids)?;
    }

    let session =
        store.start_active_group(group_id.as_deref(), room_id.as_deref(), &supervisor_ids, &at)?;
    tracing::info!(active_group_id = %session.id, "active group started");
    Ok(json!({
        "activeGroupId": session.id,
        "groupId": session.group_id,
        "roomId": session.room_id,
        "startedAt": format_timestamp(&session.started_at),
        "supervisorIds": supervisor_ids,
    }))
}

fn handle_active_groups_end(
    state: &mut AppState,
    req: &Request,
) -> ServiceResult<serde_json::Value> {
    require_staff(req)?;
    let store = Store::new(conn(state)?);
    let active_group_id = required_id(&req.params, "activeGroupId")?;
    let at = at_or_now(&req.params)?;

    let closed = store.end_active_group(&active_group_id, &at)?;
    tracing::info!(
        active_group_id = %active_group_id,
        closed_visits = closed,
        "active group ended"
    );
    Ok(json!({
        "activeGroupId": active_group_id,
        "endedAt": format_timestamp(&at),
        "closedVisits": closed,
    }))
}

fn handle_visits_start(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    require_staff(req)?;
    let store = Store::new(conn(state)?);
    let student_id = required_id(&req.params, "studentId")?;
    let active_group_id = required_id(&req.params, "activeGroupId")?;
    let at = at_or_now(&req.params)?;

    if store.find_student(&student_id)?.is_none() {
        return Err(ServiceError::not_found("student"));
    }
    let day = state.config.local_day(&at);
    let visit = store.start_visit(&student_id, &active_group_id, &at, day)?;
    Ok(json!({
        "visitId": visit.id,
        "studentId": visit.student_id,
        "activeGroupId": visit.active_group_id,
        "enteredAt": format_timestamp(&visit.entered_at),
    }))
}

fn handle_visits_end(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    require_staff(req)?;
    let store = Store::new(conn(state)?);
    let student_id = required_id(&req.params, "studentId")?;
    let at = at_or_now(&req.params)?;

    let visit = store.end_visit(&student_id, &at)?;
    Ok(json!({
        "visitId": visit.id,
        "studentId": visit.student_id,
        "exitedAt": visit.exited_at.as_ref().map(format_timestamp),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "activeGroups.start" => handle_active_groups_start(state, req),
        "activeGroups.end" => handle_active_groups_end(state, req),
        "visits.start" => handle_visits_start(state, req),
        "visits.end" => handle_visits_end(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
