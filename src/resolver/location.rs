use std::fmt;

use chrono::NaiveDate;
use serde::{Serialize, Serializer};

use super::{AccessGrant, PresenceLedger, Room, Timestamp};

const LABEL_ABSENT: &str = "Abwesend";
const LABEL_PRESENT: &str = "Anwesend";
const LABEL_IN_TRANSIT: &str = "Unterwegs";

/// Where a student is right now. The German labels are the wire contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Absent,
    /// Checked in, room not disclosed to this requester.
    Present,
    /// Checked in but not attached to any live session.
    InTransit,
    InRoom(String),
}

impl Location {
    pub fn label(&self) -> String {
        match self {
            Self::Absent => LABEL_ABSENT.to_string(),
            Self::Present => LABEL_PRESENT.to_string(),
            Self::InTransit => LABEL_IN_TRANSIT.to_string(),
            Self::InRoom(name) => format!("{LABEL_PRESENT} - {name}"),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for Location {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceResult {
    pub location: Location,
    /// Only ever set for full-access requesters.
    pub since: Option<Timestamp>,
    /// Only ever set for full-access requesters in a resolved room.
    pub room: Option<Room>,
}

impl PresenceResult {
    fn bare(location: Location) -> Self {
        Self {
            location,
            since: None,
            room: None,
        }
    }
}

/// Derive the student's location for `day`.
///
/// Every lookup failure folds into the next less specific state; this never
/// fails.
pub fn resolve_location(
    student_id: &str,
    grant: &AccessGrant,
    ledger: &dyn PresenceLedger,
    day: NaiveDate,
) -> PresenceResult {
    let attendance = match ledger.latest_attendance(student_id, day) {
        Ok(Some(record)) => record,
        Ok(None) => return PresenceResult::bare(Location::Absent),
        Err(e) => {
            tracing::warn!(student_id, error = %e, "attendance lookup failed");
            return PresenceResult::bare(Location::Absent);
        }
    };

    if let Some(checked_out) = attendance.check_out {
        return PresenceResult {
            location: Location::Absent,
            since: grant.full_access.then_some(checked_out),
            room: None,
        };
    }

    let untracked = if grant.full_access {
        Location::InTransit
    } else {
        Location::Present
    };

    let visit = match ledger.open_visit(student_id) {
        Ok(Some(v)) => v,
        Ok(None) => return PresenceResult::bare(untracked),
        Err(e) => {
            tracing::warn!(student_id, error = %e, "visit lookup failed");
            return PresenceResult::bare(untracked);
        }
    };

    let Some(room) = room_of_session(ledger, &visit.active_group_id) else {
        return PresenceResult::bare(untracked);
    };

    let location = Location::InRoom(room.name.clone());
    if grant.full_access {
        PresenceResult {
            location,
            since: Some(visit.entered_at),
            room: Some(room),
        }
    } else {
        PresenceResult::bare(location)
    }
}

fn room_of_session(ledger: &dyn PresenceLedger, active_group_id: &str) -> Option<Room> {
    let session = match ledger.active_group(active_group_id) {
        Ok(Some(s)) if s.ended_at.is_none() => s,
        Ok(_) => return None,
        Err(e) => {
            tracing::warn!(active_group_id, error = %e, "active group lookup failed");
            return None;
        }
    };
    let room_id = session.room_id.as_deref()?;
    match ledger.room(room_id) {
        Ok(Some(room)) if !room.name.trim().is_empty() => Some(room),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(room_id, error = %e, "room lookup failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::access::AccessReason;
    use super::super::{ActiveGroup, AttendanceRecord, Visit};
    use super::*;
    use anyhow::anyhow;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct FakeLedger {
        attendance: Option<AttendanceRecord>,
        visit: Option<Visit>,
        session: Option<ActiveGroup>,
        room: Option<Room>,
        fail_attendance: bool,
        fail_visit: bool,
        fail_room: bool,
    }

    impl PresenceLedger for FakeLedger {
        fn latest_attendance(
            &self,
            _student_id: &str,
            _day: NaiveDate,
        ) -> anyhow::Result<Option<AttendanceRecord>> {
            if self.fail_attendance {
                return Err(anyhow!("attendance store down"));
            }
            Ok(self.attendance.clone())
        }

        fn open_visit(&self, _student_id: &str) -> anyhow::Result<Option<Visit>> {
            if self.fail_visit {
                return Err(anyhow!("visit store down"));
            }
            Ok(self.visit.clone())
        }

        fn active_group(&self, id: &str) -> anyhow::Result<Option<ActiveGroup>> {
            Ok(self.session.clone().filter(|s| s.id == id))
        }

        fn room(&self, id: &str) -> anyhow::Result<Option<Room>> {
            if self.fail_room {
                return Err(anyhow!("room store down"));
            }
            Ok(self.room.clone().filter(|r| r.id == id))
        }
    }

    fn at(h: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 10, 16, h, 0, 0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
    }

    fn grant(full: bool) -> AccessGrant {
        AccessGrant {
            full_access: full,
            reason: if full {
                AccessReason::Administrator
            } else {
                AccessReason::NotSupervisor
            },
            supervised_groups: BTreeSet::new(),
        }
    }

    fn checked_in(check_out: Option<Timestamp>) -> AttendanceRecord {
        AttendanceRecord {
            id: "a1".to_string(),
            student_id: "s1".to_string(),
            check_in: at(8),
            check_out,
        }
    }

    fn in_room(name: &str) -> FakeLedger {
        FakeLedger {
            attendance: Some(checked_in(None)),
            visit: Some(Visit {
                id: "v1".to_string(),
                student_id: "s1".to_string(),
                active_group_id: "ag1".to_string(),
                entered_at: at(9),
                exited_at: None,
            }),
            session: Some(ActiveGroup {
                id: "ag1".to_string(),
                group_id: Some("g1".to_string()),
                room_id: Some("r1".to_string()),
                started_at: at(9),
                ended_at: None,
            }),
            room: Some(Room {
                id: "r1".to_string(),
                name: name.to_string(),
            }),
            ..FakeLedger::default()
        }
    }

    #[test]
    fn no_attendance_is_absent_for_everyone() {
        let ledger = FakeLedger::default();
        for full in [true, false] {
            let r = resolve_location("s1", &grant(full), &ledger, day());
            assert_eq!(r.location, Location::Absent);
            assert_eq!(r.since, None);
        }
    }

    #[test]
    fn checked_out_shows_since_only_with_full_access() {
        let ledger = FakeLedger {
            attendance: Some(checked_in(Some(at(14)))),
            ..FakeLedger::default()
        };
        let full = resolve_location("s1", &grant(true), &ledger, day());
        assert_eq!(full.location.label(), "Abwesend");
        assert_eq!(full.since, Some(at(14)));

        let limited = resolve_location("s1", &grant(false), &ledger, day());
        assert_eq!(limited.location, Location::Absent);
        assert_eq!(limited.since, None);
    }

    #[test]
    fn checked_in_without_visit_depends_on_access() {
        let ledger = FakeLedger {
            attendance: Some(checked_in(None)),
            ..FakeLedger::default()
        };
        assert_eq!(
            resolve_location("s1", &grant(true), &ledger, day()).location,
            Location::InTransit
        );
        assert_eq!(
            resolve_location("s1", &grant(false), &ledger, day()).location,
            Location::Present
        );
    }

    #[test]
    fn room_label_is_shared_but_since_is_not() {
        let ledger = in_room("Room 101");
        let full = resolve_location("s1", &grant(true), &ledger, day());
        assert_eq!(full.location.label(), "Anwesend - Room 101");
        assert_eq!(full.since, Some(at(9)));
        assert_eq!(full.room.as_ref().map(|r| r.id.as_str()), Some("r1"));

        let limited = resolve_location("s1", &grant(false), &ledger, day());
        assert_eq!(limited.location.label(), "Anwesend - Room 101");
        assert_eq!(limited.since, None);
        assert_eq!(limited.room, None);
    }

    #[test]
    fn room_name_is_interpolated_verbatim() {
        let ledger = in_room("Kunst & Werken (Süd)");
        let r = resolve_location("s1", &grant(false), &ledger, day());
        assert_eq!(r.location.label(), "Anwesend - Kunst & Werken (Süd)");
    }

    #[test]
    fn unresolvable_room_falls_back_to_untracked() {
        let mut ledger = in_room("   ");
        assert_eq!(
            resolve_location("s1", &grant(true), &ledger, day()).location,
            Location::InTransit
        );

        ledger = in_room("Room 101");
        ledger.room = None;
        assert_eq!(
            resolve_location("s1", &grant(false), &ledger, day()).location,
            Location::Present
        );

        ledger = in_room("Room 101");
        if let Some(s) = ledger.session.as_mut() {
            s.ended_at = Some(at(10));
        }
        assert_eq!(
            resolve_location("s1", &grant(true), &ledger, day()).location,
            Location::InTransit
        );
    }

    #[test]
    fn open_visit_after_checkout_is_ignored() {
        let mut ledger = in_room("Room 101");
        ledger.attendance = Some(checked_in(Some(at(12))));
        let r = resolve_location("s1", &grant(true), &ledger, day());
        assert_eq!(r.location, Location::Absent);
        assert_eq!(r.since, Some(at(12)));
    }

    #[test]
    fn lookup_failures_degrade() {
        let ledger = FakeLedger {
            fail_attendance: true,
            ..in_room("Room 101")
        };
        assert_eq!(
            resolve_location("s1", &grant(true), &ledger, day()).location,
            Location::Absent
        );

        let ledger = FakeLedger {
            fail_visit: true,
            ..in_room("Room 101")
        };
        assert_eq!(
            resolve_location("s1", &grant(true), &ledger, day()).location,
            Location::InTransit
        );

        let ledger = FakeLedger {
            fail_room: true,
            ..in_room("Room 101")
        };
        assert_eq!(
            resolve_location("s1", &grant(false), &ledger, day()).location,
            Location::Present
        );
    }

    #[test]
    fn resolving_twice_is_identical() {
        let ledger = in_room("Room 101");
        let a = resolve_location("s1", &grant(true), &ledger, day());
        let b = resolve_location("s1", &grant(true), &ledger, day());
        assert_eq!(a, b);
    }
}
