use serde::Serialize;

use super::{
    format_timestamp, AccessGrant, Location, PresenceResult, StudentRecord, Supervisor,
};

/// What a requester gets to see of one student. Every optional key is
/// omitted when unset, in both access tiers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentView {
    pub id: String,
    pub person_id: String,
    pub first_name: String,
    pub last_name: String,
    pub school_class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub bus: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pickup_status: Option<String>,
    pub current_location: Location,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_room: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_since: Option<String>,

    // Full access only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardian_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardian_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardian_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardian_contact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sick: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sick_since: Option<String>,

    // Limited access only: who to ask instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_supervisors: Option<Vec<SupervisorView>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorView {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub role: &'static str,
}

impl From<&Supervisor> for SupervisorView {
    fn from(s: &Supervisor) -> Self {
        Self {
            id: s.staff_id.clone(),
            first_name: s.first_name.clone(),
            last_name: s.last_name.clone(),
            email: non_blank(&s.email),
            role: s.role.as_str(),
        }
    }
}

fn non_blank(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `supervisors` are the staff of the student's group; ignored for
/// full-access requesters.
pub fn project(
    record: &StudentRecord,
    grant: &AccessGrant,
    presence: &PresenceResult,
    supervisors: &[Supervisor],
) -> StudentView {
    let student = &record.student;
    let person = &record.person;
    let full = grant.full_access;

    let mut view = StudentView {
        id: student.id.clone(),
        person_id: person.id.clone(),
        first_name: person.first_name.clone(),
        last_name: person.last_name.clone(),
        school_class: student.school_class.clone(),
        group_id: student.group_id.clone(),
        group_name: record.group.as_ref().map(|g| g.name.clone()),
        bus: student.bus,
        pickup_status: non_blank(&student.pickup_status),
        current_location: presence.location.clone(),
        current_room: None,
        location_since: None,
        tag_id: None,
        guardian_name: None,
        guardian_email: None,
        guardian_phone: None,
        guardian_contact: None,
        extra_info: None,
        health_info: None,
        supervisor_notes: None,
        sick: None,
        sick_since: None,
        group_supervisors: None,
    };

    if full {
        view.current_room = presence.room.as_ref().map(|r| r.name.clone());
        view.location_since = presence.since.as_ref().map(format_timestamp);
        view.tag_id = non_blank(&person.tag_id);
        view.guardian_name = non_blank(&student.guardian_name);
        view.guardian_email = non_blank(&student.guardian_email);
        view.guardian_phone = non_blank(&student.guardian_phone);
        view.guardian_contact = non_blank(&student.guardian_contact);
        view.extra_info = non_blank(&student.extra_info);
        view.health_info = non_blank(&student.health_info);
        view.supervisor_notes = non_blank(&student.supervisor_notes);
        view.sick = Some(student.sick);
        view.sick_since = student.sick_since.as_ref().map(format_timestamp);
    } else {
        let list = if student.group_id.is_some() {
            supervisors.iter().map(SupervisorView::from).collect()
        } else {
            Vec::new()
        };
        view.group_supervisors = Some(list);
    }

    view
}

#[cfg(test)]
mod tests {
    use super::super::access::AccessReason;
    use super::super::{Group, Person, Room, Student, SupervisorRole};
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    fn record(group: bool) -> StudentRecord {
        StudentRecord {
            student: Student {
                id: "s1".to_string(),
                person_id: "p1".to_string(),
                group_id: group.then(|| "g1".to_string()),
                school_class: "3b".to_string(),
                guardian_email: Some("parent@example.org".to_string()),
                guardian_phone: Some("  ".to_string()),
                health_info: Some("Nussallergie".to_string()),
                pickup_status: Some("Abholung 15:00".to_string()),
                bus: true,
                sick: false,
                ..Student::default()
            },
            person: Person {
                id: "p1".to_string(),
                first_name: "Mia".to_string(),
                last_name: "Schulz".to_string(),
                birthday: None,
                tag_id: Some("04:A2:19".to_string()),
            },
            group: group.then(|| Group {
                id: "g1".to_string(),
                name: "Sonnenblumen".to_string(),
                room_id: None,
                representative_id: None,
            }),
        }
    }

    fn grant(full: bool) -> AccessGrant {
        AccessGrant {
            full_access: full,
            reason: if full {
                AccessReason::GroupSupervisor
            } else {
                AccessReason::NotSupervisor
            },
            supervised_groups: BTreeSet::new(),
        }
    }

    fn in_room(full: bool) -> PresenceResult {
        PresenceResult {
            location: Location::InRoom("Room 101".to_string()),
            since: full.then(|| Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()),
            room: full.then(|| Room {
                id: "r1".to_string(),
                name: "Room 101".to_string(),
            }),
        }
    }

    fn supervisors() -> Vec<Supervisor> {
        vec![Supervisor {
            staff_id: "t1".to_string(),
            first_name: "Jonas".to_string(),
            last_name: "Keller".to_string(),
            email: None,
            role: SupervisorRole::Teacher,
        }]
    }

    #[test]
    fn full_access_sees_sensitive_fields() {
        let view = project(&record(true), &grant(true), &in_room(true), &supervisors());
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["current_location"], "Anwesend - Room 101");
        assert_eq!(json["current_room"], "Room 101");
        assert_eq!(json["location_since"], "2026-10-16T09:00:00Z");
        assert_eq!(json["tag_id"], "04:A2:19");
        assert_eq!(json["guardian_email"], "parent@example.org");
        assert_eq!(json["health_info"], "Nussallergie");
        assert_eq!(json["sick"], false);
        assert!(json.get("guardian_phone").is_none());
        assert!(json.get("sick_since").is_none());
        assert!(json.get("group_supervisors").is_none());
    }

    #[test]
    fn limited_access_gets_supervisors_instead() {
        let view = project(&record(true), &grant(false), &in_room(false), &supervisors());
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["current_location"], "Anwesend - Room 101");
        assert_eq!(json["group_name"], "Sonnenblumen");
        assert_eq!(json["bus"], true);
        assert_eq!(json["pickup_status"], "Abholung 15:00");
        for key in [
            "current_room",
            "location_since",
            "tag_id",
            "guardian_email",
            "health_info",
            "sick",
        ] {
            assert!(json.get(key).is_none(), "{key} leaked to limited view");
        }
        let sups = json["group_supervisors"].as_array().unwrap();
        assert_eq!(sups.len(), 1);
        assert_eq!(sups[0]["role"], "teacher");
        assert!(sups[0].get("email").is_none());
    }

    #[test]
    fn limited_access_to_groupless_student_has_empty_supervisors() {
        let presence = PresenceResult {
            location: Location::Present,
            since: None,
            room: None,
        };
        let view = project(&record(false), &grant(false), &presence, &supervisors());
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["current_location"], "Anwesend");
        assert!(json.get("group_id").is_none());
        assert_eq!(json["group_supervisors"], serde_json::json!([]));
    }
}
