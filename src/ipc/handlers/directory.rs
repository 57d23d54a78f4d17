use crate::error::{ServiceError, ServiceResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{
    conn, optional_id, optional_str, require_admin, required_id, required_str, requester,
};
use crate::ipc::types::{AppState, Request};
use crate::resolver::SupervisorRole;
use crate::store::Store;
use serde_json::json;

fn handle_rooms_create(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    require_admin(req)?;
    let store = Store::new(conn(state)?);
    let name = required_str(&req.params, "name")?;
    let room = store.create_room(&name)?;
    Ok(json!({ "roomId": room.id, "name": room.name }))
}

fn handle_rooms_list(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    requester(req)?;
    let store = Store::new(conn(state)?);
    let rooms: Vec<_> = store
        .list_rooms()?
        .into_iter()
        .map(|r| json!({ "id": r.id, "name": r.name }))
        .collect();
    Ok(json!({ "rooms": rooms }))
}

fn handle_staff_create(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    require_admin(req)?;
    let store = Store::new(conn(state)?);
    let first_name = required_str(&req.params, "firstName")?;
    let last_name = required_str(&req.params, "lastName")?;
    let email = optional_str(&req.params, "email")?;
    let staff_id = store.create_staff(&first_name, &last_name, email.as_deref())?;
    Ok(json!({ "staffId": staff_id }))
}

fn handle_groups_create(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    require_admin(req)?;
    let store = Store::new(conn(state)?);
    let name = required_str(&req.params, "name")?;
    let room_id = optional_id(&req.params, "roomId")?;
    let representative_id = optional_id(&req.params, "representativeId")?;
    let group = store.create_group(&name, room_id.as_deref(), representative_id.as_deref())?;
    Ok(json!({ "groupId": group.id, "name": group.name }))
}

fn handle_groups_list(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    requester(req)?;
    let store = Store::new(conn(state)?);
    let groups: Vec<_> = store
        .list_groups()?
        .into_iter()
        .map(|(g, student_count)| {
            json!({
                "id": g.id,
                "name": g.name,
                "roomId": g.room_id,
                "representativeId": g.representative_id,
                "studentCount": student_count,
            })
        })
        .collect();
    Ok(json!({ "groups": groups }))
}

fn handle_groups_supervisors_set(
    state: &mut AppState,
    req: &Request,
) -> ServiceResult<serde_json::Value> {
    require_admin(req)?;
    let store = Store::new(conn(state)?);
    let group_id = required_id(&req.params, "groupId")?;
    let Some(items) = req.params.get("supervisors").and_then(|v| v.as_array()) else {
        return Err(ServiceError::bad_params("missing supervisors"));
    };

    let mut supervisors = Vec::with_capacity(items.len());
    for item in items {
        let staff_id = required_id(item, "staffId")?;
        let role_raw = optional_str(item, "role")?.unwrap_or_else(|| "teacher".to_string());
        let role = match SupervisorRole::parse(&role_raw) {
            Some(SupervisorRole::Representative) | None => {
                return Err(ServiceError::bad_params(format!(
                    "role must be teacher or specialist, got {role_raw}"
                )))
            }
            Some(r) => r,
        };
        supervisors.push((staff_id, role));
    }

    store.set_group_supervisors(&group_id, &supervisors)?;
    Ok(json!({ "groupId": group_id, "count": supervisors.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "rooms.create" => handle_rooms_create(state, req),
        "rooms.list" => handle_rooms_list(state, req),
        "staff.create" => handle_staff_create(state, req),
        "groups.create" => handle_groups_create(state, req),
        "groups.list" => handle_groups_list(state, req),
        "groups.supervisors.set" => handle_groups_supervisors_set(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
