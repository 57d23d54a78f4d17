use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::config::FacilityConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{
    conn, optional_bool, optional_date, optional_id, patch_str, required_id, required_str,
    requester,
};
use crate::ipc::types::{AppState, Request};
use crate::resolver::access::{self, authorize_create, authorize_mutation};
use crate::resolver::location::resolve_location;
use crate::resolver::projection::project;
use crate::resolver::{
    format_timestamp, AccessDenied, Person, Requester, Student, StudentRecord, StudentView,
    Timestamp,
};
use crate::store::{Store, StudentWrite};

/// Grant → presence → projection for one already-fetched student.
fn build_view(
    store: &Store<'_>,
    config: &FacilityConfig,
    requester: &Requester,
    record: &StudentRecord,
    now: &Timestamp,
) -> StudentView {
    let grant = access::resolve(requester, &record.student, store);
    let presence = resolve_location(&record.student.id, &grant, store, config.local_day(now));
    let supervisors = match record.student.group_id.as_deref() {
        Some(gid) if !grant.full_access => store.group_supervisors(gid).unwrap_or_else(|e| {
            tracing::warn!(group_id = gid, error = %e, "supervisor lookup failed");
            Vec::new()
        }),
        _ => Vec::new(),
    };
    project(record, &grant, &presence, &supervisors)
}

fn view_json(view: &StudentView) -> ServiceResult<serde_json::Value> {
    serde_json::to_value(view).map_err(|e| ServiceError::Internal(e.into()))
}

fn handle_students_get(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    let requester = requester(req)?;
    let store = Store::new(conn(state)?);
    let student_id = required_id(&req.params, "studentId")?;
    let record = store.student_record(&student_id)?;
    let view = build_view(&store, &state.config, requester, &record, &Utc::now());
    view_json(&view)
}

fn handle_students_list(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    let requester = requester(req)?;
    let store = Store::new(conn(state)?);
    let group_id = optional_id(&req.params, "groupId")?;
    let now = Utc::now();

    let mut students = Vec::new();
    for id in store.list_student_ids(group_id.as_deref())? {
        let record = match store.student_record(&id) {
            Ok(r) => r,
            // Deleted between the id scan and the fetch.
            Err(ServiceError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        let view = build_view(&store, &state.config, requester, &record, &now);
        students.push(view_json(&view)?);
    }
    Ok(json!({ "students": students }))
}

fn handle_students_location(
    state: &mut AppState,
    req: &Request,
) -> ServiceResult<serde_json::Value> {
    let requester = requester(req)?;
    let store = Store::new(conn(state)?);
    let student_id = required_id(&req.params, "studentId")?;
    let record = store.student_record(&student_id)?;

    let now = Utc::now();
    let grant = access::resolve(requester, &record.student, &store);
    let presence = resolve_location(&student_id, &grant, &store, state.config.local_day(&now));

    let mut out = json!({
        "student_id": student_id,
        "current_location": presence.location,
    });
    if let Some(room) = &presence.room {
        out["current_room"] = json!(room.name);
    }
    if let Some(since) = &presence.since {
        out["location_since"] = json!(format_timestamp(since));
    }
    Ok(out)
}

fn apply(field: &mut Option<String>, patch: Option<Option<String>>) {
    if let Some(v) = patch {
        *field = v;
    }
}

fn apply_required(
    field: &mut String,
    patch: Option<Option<String>>,
    key: &str,
) -> ServiceResult<()> {
    match patch {
        Some(Some(v)) => {
            *field = v;
            Ok(())
        }
        Some(None) => Err(ServiceError::bad_params(format!("{key} must not be empty"))),
        None => Ok(()),
    }
}

/// Shared by create and update: every optional free-text field.
fn apply_free_text(
    student: &mut Student,
    person: &mut Person,
    params: &serde_json::Value,
) -> ServiceResult<()> {
    apply(&mut person.tag_id, patch_str(params, "tagId")?);
    apply(&mut student.guardian_name, patch_str(params, "guardianName")?);
    apply(&mut student.guardian_email, patch_str(params, "guardianEmail")?);
    apply(&mut student.guardian_phone, patch_str(params, "guardianPhone")?);
    apply(&mut student.guardian_contact, patch_str(params, "guardianContact")?);
    apply(&mut student.extra_info, patch_str(params, "extraInfo")?);
    apply(&mut student.health_info, patch_str(params, "healthInfo")?);
    apply(&mut student.supervisor_notes, patch_str(params, "supervisorNotes")?);
    apply(&mut student.pickup_status, patch_str(params, "pickupStatus")?);
    Ok(())
}

/// `sick_since` follows the flag: set on the transition to sick, cleared
/// when the student is well again.
fn apply_sick(student: &mut Student, sick: Option<bool>, now: &Timestamp) {
    let Some(sick) = sick else { return };
    if sick && !student.sick {
        student.sick_since = Some(*now);
    } else if !sick {
        student.sick_since = None;
    }
    student.sick = sick;
}

fn handle_students_create(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    let requester = requester(req)?;
    let store = Store::new(conn(state)?);
    let params = &req.params;

    let group_id = optional_id(params, "groupId")?;
    authorize_create(requester, group_id.as_deref(), &store)?;

    let now = Utc::now();
    let mut person = Person {
        id: Uuid::new_v4().to_string(),
        first_name: required_str(params, "firstName")?,
        last_name: required_str(params, "lastName")?,
        birthday: optional_date(params, "birthday")?,
        tag_id: None,
    };
    let mut student = Student {
        id: Uuid::new_v4().to_string(),
        person_id: person.id.clone(),
        group_id,
        school_class: required_str(params, "schoolClass")?,
        bus: optional_bool(params, "bus")?.unwrap_or(false),
        ..Student::default()
    };
    apply_free_text(&mut student, &mut person, params)?;
    apply_sick(&mut student, optional_bool(params, "sick")?, &now);

    let student_id = student.id.clone();
    store.insert_student(&StudentWrite { student, person }, &now)?;
    tracing::info!(student_id = %student_id, "student created");
    let record = store.student_record(&student_id)?;
    let view = build_view(&store, &state.config, requester, &record, &now);
    view_json(&view)
}

fn handle_students_update(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    let requester = requester(req)?;
    let store = Store::new(conn(state)?);
    let params = &req.params;
    let student_id = required_id(params, "studentId")?;
    let record = store.student_record(&student_id)?;

    let grant = access::resolve(requester, &record.student, &store);
    authorize_mutation(&grant, &record.student)?;

    let mut student = record.student.clone();
    let mut person = record.person.clone();

    if params.get("groupId").is_some() {
        let next = optional_id(params, "groupId")?;
        if next != student.group_id {
            match next.as_deref() {
                Some(gid) => authorize_create(requester, Some(gid), &store)?,
                // Only administrators manage groupless students.
                None if !requester.is_admin() => {
                    return Err(AccessDenied::AdministratorRequired.into())
                }
                None => {}
            }
            student.group_id = next;
        }
    }

    let now = Utc::now();
    apply_required(&mut person.first_name, patch_str(params, "firstName")?, "firstName")?;
    apply_required(&mut person.last_name, patch_str(params, "lastName")?, "lastName")?;
    apply_required(&mut student.school_class, patch_str(params, "schoolClass")?, "schoolClass")?;
    if params.get("birthday").is_some() {
        person.birthday = optional_date(params, "birthday")?;
    }
    if let Some(bus) = optional_bool(params, "bus")? {
        student.bus = bus;
    }
    apply_free_text(&mut student, &mut person, params)?;
    apply_sick(&mut student, optional_bool(params, "sick")?, &now);

    store.update_student(&StudentWrite { student, person }, &now)?;
    tracing::info!(student_id = %student_id, "student updated");
    let record = store.student_record(&student_id)?;
    let view = build_view(&store, &state.config, requester, &record, &now);
    view_json(&view)
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> ServiceResult<serde_json::Value> {
    let requester = requester(req)?;
    let store = Store::new(conn(state)?);
    let student_id = required_id(&req.params, "studentId")?;
    let record = store.student_record(&student_id)?;

    let grant = access::resolve(requester, &record.student, &store);
    authorize_mutation(&grant, &record.student)?;

    store.delete_student(&record.student)?;
    tracing::info!(student_id = %student_id, "student deleted");
    Ok(json!({ "studentId": student_id, "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.get" => handle_students_get(state, req),
        "students.list" => handle_students_list(state, req),
        "students.location" => handle_students_location(state, req),
        "students.create" => handle_students_create(state, req),
        "students.update" => handle_students_update(state, req),
        "students.delete" => handle_students_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
