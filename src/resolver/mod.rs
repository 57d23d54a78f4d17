//! Access-scoped presence resolution.
//!
//! Everything in here is pure and synchronous: the caller hands over the
//! already-fetched student record plus read-only lookup handles, and gets back
//! immutable values. Nothing is cached between calls.
//!
//! This module only depends on `super::` paths and external crates so the
//! integration tests can pull it in with `#[path]`.

pub mod access;
pub mod location;
pub mod projection;

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

pub use access::{AccessDenied, AccessGrant, AccessReason, Requester};
pub use location::{Location, PresenceResult};
pub use projection::{StudentView, SupervisorView};

pub type Timestamp = DateTime<Utc>;

/// RFC3339, UTC, second precision. This is the only timestamp format that
/// leaves the process.
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Person {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub birthday: Option<NaiveDate>,
    pub tag_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Student {
    pub id: String,
    pub person_id: String,
    pub group_id: Option<String>,
    pub school_class: String,
    pub guardian_name: Option<String>,
    pub guardian_email: Option<String>,
    pub guardian_phone: Option<String>,
    pub guardian_contact: Option<String>,
    pub extra_info: Option<String>,
    pub health_info: Option<String>,
    pub supervisor_notes: Option<String>,
    pub pickup_status: Option<String>,
    pub bus: bool,
    pub sick: bool,
    pub sick_since: Option<Timestamp>,
}

/// Educational group. `room_id` is the group's default room, not where the
/// students are right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub room_id: Option<String>,
    pub representative_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SupervisorRole {
    Teacher,
    Specialist,
    Representative,
}

impl SupervisorRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Teacher => "teacher",
            Self::Specialist => "specialist",
            Self::Representative => "representative",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "teacher" => Some(Self::Teacher),
            "specialist" => Some(Self::Specialist),
            "representative" => Some(Self::Representative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supervisor {
    pub staff_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub role: SupervisorRole,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub check_in: Timestamp,
    pub check_out: Option<Timestamp>,
}

impl AttendanceRecord {
    pub fn is_open(&self) -> bool {
        self.check_out.is_none()
    }
}

/// A live group session: a cohort currently occupying a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveGroup {
    pub id: String,
    pub group_id: Option<String>,
    pub room_id: Option<String>,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Visit {
    pub id: String,
    pub student_id: String,
    pub active_group_id: String,
    pub entered_at: Timestamp,
    pub exited_at: Option<Timestamp>,
}

/// The subject of a student request, fetched up front. `group` is `None`
/// both when the student has no group and when the group lookup failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentRecord {
    pub student: Student,
    pub person: Person,
    pub group: Option<Group>,
}

/// Which groups a staff member currently supervises.
pub trait SupervisionDirectory {
    fn supervised_group_ids(&self, staff_id: &str) -> anyhow::Result<BTreeSet<String>>;
}

/// Read side of the attendance and visit ledgers.
pub trait PresenceLedger {
    /// Most recent attendance record whose check-in falls on `day`
    /// (facility-local date).
    fn latest_attendance(
        &self,
        student_id: &str,
        day: NaiveDate,
    ) -> anyhow::Result<Option<AttendanceRecord>>;
    fn open_visit(&self, student_id: &str) -> anyhow::Result<Option<Visit>>;
    fn active_group(&self, active_group_id: &str) -> anyhow::Result<Option<ActiveGroup>>;
    fn room(&self, room_id: &str) -> anyhow::Result<Option<Room>>;
}
