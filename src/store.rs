use anyhow::{anyhow, Context};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::resolver::{
    format_timestamp, ActiveGroup, AttendanceRecord, Group, Person, PresenceLedger, Room,
    Student, StudentRecord, Supervisor, SupervisionDirectory, SupervisorRole, Timestamp, Visit,
};

/// SQLite-backed view of the ledgers and directories the resolver reads.
/// Borrowed per request; holds no state of its own.
pub struct Store<'a> {
    conn: &'a Connection,
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Timestamp>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        parse_ts(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
    })
    .transpose()
}

pub fn parse_ts(raw: &str) -> Result<Timestamp, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw.trim()).map(|d| d.with_timezone(&Utc))
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

const STUDENT_COLUMNS: &str = "s.id, s.person_id, s.group_id, s.school_class,
    s.guardian_name, s.guardian_email, s.guardian_phone, s.guardian_contact,
    s.extra_info, s.health_info, s.supervisor_notes, s.pickup_status,
    s.bus, s.sick, s.sick_since,
    p.first_name, p.last_name, p.birthday, p.tag_id";

fn student_and_person(row: &Row<'_>) -> rusqlite::Result<(Student, Person)> {
    let student = Student {
        id: row.get(0)?,
        person_id: row.get(1)?,
        group_id: row.get(2)?,
        school_class: row.get(3)?,
        guardian_name: row.get(4)?,
        guardian_email: row.get(5)?,
        guardian_phone: row.get(6)?,
        guardian_contact: row.get(7)?,
        extra_info: row.get(8)?,
        health_info: row.get(9)?,
        supervisor_notes: row.get(10)?,
        pickup_status: row.get(11)?,
        bus: row.get::<_, i64>(12)? != 0,
        sick: row.get::<_, i64>(13)? != 0,
        sick_since: opt_ts_at(row, 14)?,
    };
    let birthday: Option<String> = row.get(17)?;
    let person = Person {
        id: student.person_id.clone(),
        first_name: row.get(15)?,
        last_name: row.get(16)?,
        birthday: birthday.and_then(|b| NaiveDate::parse_from_str(&b, "%Y-%m-%d").ok()),
        tag_id: row.get(18)?,
    };
    Ok((student, person))
}

fn group_row(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        room_id: row.get(2)?,
        representative_id: row.get(3)?,
    })
}

fn attendance_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        check_in: ts_at(row, 2)?,
        check_out: opt_ts_at(row, 3)?,
    })
}

fn visit_row(row: &Row<'_>) -> rusqlite::Result<Visit> {
    Ok(Visit {
        id: row.get(0)?,
        student_id: row.get(1)?,
        active_group_id: row.get(2)?,
        entered_at: ts_at(row, 3)?,
        exited_at: opt_ts_at(row, 4)?,
    })
}

/// Writable student fields. `person` carries name, birthday and tag.
#[derive(Debug, Clone)]
pub struct StudentWrite {
    pub student: Student,
    pub person: Person,
}

impl<'a> Store<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    // ---- students ----------------------------------------------------------

    pub fn find_student(&self, student_id: &str) -> anyhow::Result<Option<(Student, Person)>> {
        let sql = format!(
            "SELECT {STUDENT_COLUMNS}
             FROM students s
             JOIN persons p ON p.id = s.person_id
             WHERE s.id = ?"
        );
        let found = self
            .conn
            .query_row(&sql, [student_id], student_and_person)
            .optional()
            .context("student lookup failed")?;
        Ok(found)
    }

    pub fn find_group(&self, group_id: &str) -> anyhow::Result<Option<Group>> {
        let found = self
            .conn
            .query_row(
                "SELECT id, name, room_id, representative_id FROM edu_groups WHERE id = ?",
                [group_id],
                group_row,
            )
            .optional()?;
        Ok(found)
    }

    /// Root fetch for student requests. Only the student itself may fail the
    /// request; a missing or unreadable group just leaves `group` empty.
    pub fn student_record(&self, student_id: &str) -> ServiceResult<StudentRecord> {
        let Some((student, person)) = self.find_student(student_id)? else {
            return Err(ServiceError::not_found("student"));
        };
        let group = match student.group_id.as_deref() {
            Some(gid) => self.find_group(gid).unwrap_or_else(|e| {
                tracing::warn!(group_id = gid, error = %e, "group lookup failed");
                None
            }),
            None => None,
        };
        Ok(StudentRecord {
            student,
            person,
            group,
        })
    }

    pub fn list_student_ids(&self, group_id: Option<&str>) -> anyhow::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id
             FROM students s
             JOIN persons p ON p.id = s.person_id
             WHERE (?1 IS NULL OR s.group_id = ?1)
             ORDER BY p.last_name, p.first_name, s.id",
        )?;
        let ids = stmt
            .query_map([group_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn insert_student(&self, w: &StudentWrite, now: &Timestamp) -> ServiceResult<()> {
        if let Some(gid) = w.student.group_id.as_deref() {
            self.require_group(gid)?;
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO persons(id, first_name, last_name, birthday, tag_id)
             VALUES(?, ?, ?, ?, ?)",
            (
                &w.person.id,
                &w.person.first_name,
                &w.person.last_name,
                w.person.birthday.map(day_key),
                &w.person.tag_id,
            ),
        )
        .map_err(|e| unique_violation(e, "tag_id is already assigned"))?;
        write_student(&tx, &w.student, now, true)?;
        tx.commit()?;
        Ok(())
    }

    pub fn update_student(&self, w: &StudentWrite, now: &Timestamp) -> ServiceResult<()> {
        if let Some(gid) = w.student.group_id.as_deref() {
            self.require_group(gid)?;
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE persons SET first_name = ?, last_name = ?, birthday = ?, tag_id = ?
             WHERE id = ?",
            (
                &w.person.first_name,
                &w.person.last_name,
                w.person.birthday.map(day_key),
                &w.person.tag_id,
                &w.person.id,
            ),
        )
        .map_err(|e| unique_violation(e, "tag_id is already assigned"))?;
        write_student(&tx, &w.student, now, false)?;
        tx.commit()?;
        Ok(())
    }

    /// Removes the student with its ledgers and person.
    pub fn delete_student(&self, student: &Student) -> ServiceResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM visits WHERE student_id = ?", [&student.id])?;
        tx.execute("DELETE FROM attendance WHERE student_id = ?", [&student.id])?;
        tx.execute("DELETE FROM students WHERE id = ?", [&student.id])?;
        tx.execute("DELETE FROM persons WHERE id = ?", [&student.person_id])?;
        tx.commit()?;
        Ok(())
    }

    // ---- directory ---------------------------------------------------------

    fn require_group(&self, group_id: &str) -> ServiceResult<()> {
        match self.find_group(group_id)? {
            Some(_) => Ok(()),
            None => Err(ServiceError::not_found("group")),
        }
    }

    fn require_room(&self, room_id: &str) -> ServiceResult<()> {
        match self.room(room_id)? {
            Some(_) => Ok(()),
            None => Err(ServiceError::not_found("room")),
        }
    }

    fn require_staff(&self, staff_id: &str) -> ServiceResult<()> {
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM staff WHERE id = ?", [staff_id], |r| r.get(0))
            .optional()?;
        match exists {
            Some(_) => Ok(()),
            None => Err(ServiceError::NotFound(format!("staff {staff_id} not found"))),
        }
    }

    pub fn create_room(&self, name: &str) -> ServiceResult<Room> {
        let room = Room {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
        };
        self.conn.execute(
            "INSERT INTO rooms(id, name) VALUES(?, ?)",
            (&room.id, &room.name),
        )?;
        Ok(room)
    }

    pub fn list_rooms(&self) -> anyhow::Result<Vec<Room>> {
        let mut stmt = self.conn.prepare("SELECT id, name FROM rooms ORDER BY name, id")?;
        let rooms = stmt
            .query_map([], |r| {
                Ok(Room {
                    id: r.get(0)?,
                    name: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rooms)
    }

    /// Returns the new staff id.
    pub fn create_staff(
        &self,
        first_name: &str,
        last_name: &str,
        email: Option<&str>,
    ) -> ServiceResult<String> {
        let person_id = Uuid::new_v4().to_string();
        let staff_id = Uuid::new_v4().to_string();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO persons(id, first_name, last_name) VALUES(?, ?, ?)",
            (&person_id, first_name, last_name),
        )?;
        tx.execute(
            "INSERT INTO staff(id, person_id, email) VALUES(?, ?, ?)",
            (&staff_id, &person_id, email),
        )?;
        tx.commit()?;
        Ok(staff_id)
    }

    pub fn create_group(
        &self,
        name: &str,
        room_id: Option<&str>,
        representative_id: Option<&str>,
    ) -> ServiceResult<Group> {
        if let Some(rid) = room_id {
            self.require_room(rid)?;
        }
        if let Some(sid) = representative_id {
            self.require_staff(sid)?;
        }
        let group = Group {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            room_id: room_id.map(str::to_string),
            representative_id: representative_id.map(str::to_string),
        };
        self.conn.execute(
            "INSERT INTO edu_groups(id, name, room_id, representative_id) VALUES(?, ?, ?, ?)",
            (&group.id, &group.name, &group.room_id, &group.representative_id),
        )?;
        Ok(group)
    }

    pub fn list_groups(&self) -> anyhow::Result<Vec<(Group, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT g.id, g.name, g.room_id, g.representative_id,
               (SELECT COUNT(*) FROM students s WHERE s.group_id = g.id) AS student_count
             FROM edu_groups g
             ORDER BY g.name, g.id",
        )?;
        let groups = stmt
            .query_map([], |r| Ok((group_row(r)?, r.get::<_, i64>(4)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    /// Replaces the long-term supervisors of a group.
    pub fn set_group_supervisors(
        &self,
        group_id: &str,
        supervisors: &[(String, SupervisorRole)],
    ) -> ServiceResult<()> {
        self.require_group(group_id)?;
        for (staff_id, _) in supervisors {
            self.require_staff(staff_id)?;
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM group_supervisors WHERE group_id = ?", [group_id])?;
        for (staff_id, role) in supervisors {
            tx.execute(
                "INSERT OR REPLACE INTO group_supervisors(group_id, staff_id, role)
                 VALUES(?, ?, ?)",
                (group_id, staff_id, role.as_str()),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Long-term supervision only (assignment or representative). Live
    /// sessions do not count here.
    pub fn supervises_long_term(&self, staff_id: &str, group_id: &str) -> anyhow::Result<bool> {
        let found: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM group_supervisors WHERE group_id = ?1 AND staff_id = ?2)
                 OR EXISTS(SELECT 1 FROM edu_groups WHERE id = ?1 AND representative_id = ?2)",
            (group_id, staff_id),
            |r| r.get(0),
        )?;
        Ok(found)
    }

    /// Staff of a group, representative included, ordered by name.
    pub fn group_supervisors(&self, group_id: &str) -> anyhow::Result<Vec<Supervisor>> {
        let mut stmt = self.conn.prepare(
            "SELECT st.id, p.first_name, p.last_name, st.email, gs.role
             FROM group_supervisors gs
             JOIN staff st ON st.id = gs.staff_id
             JOIN persons p ON p.id = st.person_id
             WHERE gs.group_id = ?1
             UNION
             SELECT st.id, p.first_name, p.last_name, st.email, 'representative'
             FROM edu_groups g
             JOIN staff st ON st.id = g.representative_id
             JOIN persons p ON p.id = st.person_id
             WHERE g.id = ?1
               AND st.id NOT IN (SELECT staff_id FROM group_supervisors WHERE group_id = ?1)
             ORDER BY 3, 2, 1",
        )?;
        let rows = stmt
            .query_map([group_id], |r| {
                let role: String = r.get(4)?;
                Ok(Supervisor {
                    staff_id: r.get(0)?,
                    first_name: r.get(1)?,
                    last_name: r.get(2)?,
                    email: r.get(3)?,
                    role: SupervisorRole::parse(&role).unwrap_or(SupervisorRole::Teacher),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- attendance --------------------------------------------------------

    fn open_attendance_any_day(
        &self,
        student_id: &str,
    ) -> anyhow::Result<Option<AttendanceRecord>> {
        let found = self
            .conn
            .query_row(
                "SELECT id, student_id, check_in, check_out
                 FROM attendance
                 WHERE student_id = ? AND check_out IS NULL
                 ORDER BY check_in DESC, rowid DESC
                 LIMIT 1",
                [student_id],
                attendance_row,
            )
            .optional()?;
        Ok(found)
    }

    pub fn check_in(
        &self,
        student_id: &str,
        at: &Timestamp,
        day: NaiveDate,
    ) -> ServiceResult<AttendanceRecord> {
        if self.open_attendance_any_day(student_id)?.is_some() {
            return Err(ServiceError::bad_params("student is already checked in"));
        }
        let record = AttendanceRecord {
            id: Uuid::new_v4().to_string(),
            student_id: student_id.to_string(),
            check_in: *at,
            check_out: None,
        };
        self.conn.execute(
            "INSERT INTO attendance(id, student_id, day, check_in) VALUES(?, ?, ?, ?)",
            (&record.id, student_id, day_key(day), format_timestamp(at)),
        )?;
        Ok(record)
    }

    /// Closes the open attendance record and any open visit.
    pub fn check_out(&self, student_id: &str, at: &Timestamp) -> ServiceResult<AttendanceRecord> {
        let Some(mut record) = self.open_attendance_any_day(student_id)? else {
            return Err(ServiceError::bad_params("student is not checked in"));
        };
        if *at < record.check_in {
            return Err(ServiceError::bad_params("check-out precedes check-in"));
        }
        if let Some(visit) = self.open_visit(student_id)? {
            if *at < visit.entered_at {
                return Err(ServiceError::bad_params("check-out precedes the open visit"));
            }
        }
        let stamp = format_timestamp(at);
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE attendance SET check_out = ? WHERE id = ?",
            (&stamp, &record.id),
        )?;
        tx.execute(
            "UPDATE visits SET exited_at = ? WHERE student_id = ? AND exited_at IS NULL",
            (&stamp, student_id),
        )?;
        tx.commit()?;
        record.check_out = Some(*at);
        Ok(record)
    }

    // ---- live sessions and visits ----------------------------------------

    pub fn start_active_group(
        &self,
        group_id: Option<&str>,
        room_id: Option<&str>,
        supervisor_ids: &[String],
        at: &Timestamp,
    ) -> ServiceResult<ActiveGroup> {
        if let Some(gid) = group_id {
            self.require_group(gid)?;
        }
        if let Some(rid) = room_id {
            self.require_room(rid)?;
        }
        for sid in supervisor_ids {
            self.require_staff(sid)?;
        }
        let session = ActiveGroup {
            id: Uuid::new_v4().to_string(),
            group_id: group_id.map(str::to_string),
            room_id: room_id.map(str::to_string),
            started_at: *at,
            ended_at: None,
        };
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO active_groups(id, group_id, room_id, started_at) VALUES(?, ?, ?, ?)",
            (
                &session.id,
                &session.group_id,
                &session.room_id,
                format_timestamp(at),
            ),
        )?;
        for sid in supervisor_ids {
            tx.execute(
                "INSERT OR IGNORE INTO active_group_supervisors(active_group_id, staff_id)
                 VALUES(?, ?)",
                (&session.id, sid),
            )?;
        }
        tx.commit()?;
        Ok(session)
    }

    /// Ends a live session and closes its open visits. Returns how many
    /// visits were closed.
    pub fn end_active_group(&self, active_group_id: &str, at: &Timestamp) -> ServiceResult<usize> {
        match self.active_group(active_group_id)? {
            Some(s) if s.ended_at.is_some() => {
                return Err(ServiceError::bad_params("active group has already ended"))
            }
            Some(s) if *at < s.started_at => {
                return Err(ServiceError::bad_params("end precedes the session start"))
            }
            Some(_) => {}
            None => return Err(ServiceError::not_found("active group")),
        }
        let stamp = format_timestamp(at);
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE active_groups SET ended_at = ? WHERE id = ?",
            (&stamp, active_group_id),
        )?;
        let closed = tx.execute(
            "UPDATE visits SET exited_at = ? WHERE active_group_id = ? AND exited_at IS NULL",
            (&stamp, active_group_id),
        )?;
        tx.commit()?;
        Ok(closed)
    }

    /// Attaches a checked-in student to a live session, closing whatever
    /// visit was open before.
    pub fn start_visit(
        &self,
        student_id: &str,
        active_group_id: &str,
        at: &Timestamp,
        day: NaiveDate,
    ) -> ServiceResult<Visit> {
        match self.latest_attendance(student_id, day)? {
            Some(a) if !a.is_open() => {
                return Err(ServiceError::bad_params("student is not checked in"))
            }
            Some(a) if *at < a.check_in => {
                return Err(ServiceError::bad_params("visit precedes check-in"))
            }
            Some(_) => {}
            None => return Err(ServiceError::bad_params("student is not checked in")),
        }
        match self.active_group(active_group_id)? {
            Some(s) if s.ended_at.is_some() => {
                return Err(ServiceError::bad_params("active group has already ended"))
            }
            Some(s) if *at < s.started_at => {
                return Err(ServiceError::bad_params("visit precedes the session start"))
            }
            Some(_) => {}
            None => return Err(ServiceError::not_found("active group")),
        }
        if let Some(current) = self.open_visit(student_id)? {
            if *at < current.entered_at {
                return Err(ServiceError::bad_params("visit precedes the current visit"));
            }
        }
        let visit = Visit {
            id: Uuid::new_v4().to_string(),
            student_id: student_id.to_string(),
            active_group_id: active_group_id.to_string(),
            entered_at: *at,
            exited_at: None,
        };
        let stamp = format_timestamp(at);
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE visits SET exited_at = ? WHERE student_id = ? AND exited_at IS NULL",
            (&stamp, student_id),
        )?;
        tx.execute(
            "INSERT INTO visits(id, student_id, active_group_id, entered_at) VALUES(?, ?, ?, ?)",
            (&visit.id, student_id, active_group_id, &stamp),
        )?;
        tx.commit()?;
        Ok(visit)
    }

    pub fn end_visit(&self, student_id: &str, at: &Timestamp) -> ServiceResult<Visit> {
        let Some(mut visit) = self.open_visit(student_id)? else {
            return Err(ServiceError::bad_params("student has no open visit"));
        };
        if *at < visit.entered_at {
            return Err(ServiceError::bad_params("exit precedes entry"));
        }
        self.conn.execute(
            "UPDATE visits SET exited_at = ? WHERE id = ?",
            (format_timestamp(at), &visit.id),
        )?;
        visit.exited_at = Some(*at);
        Ok(visit)
    }
}

fn write_student(
    conn: &Connection,
    s: &Student,
    now: &Timestamp,
    insert: bool,
) -> rusqlite::Result<usize> {
    let sql = if insert {
        "INSERT INTO students(
           group_id, school_class, guardian_name, guardian_email, guardian_phone,
           guardian_contact, extra_info, health_info, supervisor_notes, pickup_status,
           bus, sick, sick_since, updated_at, id, person_id)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
    } else {
        "UPDATE students SET
           group_id = ?1, school_class = ?2, guardian_name = ?3, guardian_email = ?4,
           guardian_phone = ?5, guardian_contact = ?6, extra_info = ?7, health_info = ?8,
           supervisor_notes = ?9, pickup_status = ?10, bus = ?11, sick = ?12,
           sick_since = ?13, updated_at = ?14
         WHERE id = ?15 AND person_id = ?16"
    };
    conn.execute(
        sql,
        rusqlite::params![
            s.group_id,
            s.school_class,
            s.guardian_name,
            s.guardian_email,
            s.guardian_phone,
            s.guardian_contact,
            s.extra_info,
            s.health_info,
            s.supervisor_notes,
            s.pickup_status,
            s.bus as i64,
            s.sick as i64,
            s.sick_since.as_ref().map(format_timestamp),
            format_timestamp(now),
            s.id,
            s.person_id,
        ],
    )
}

fn unique_violation(e: rusqlite::Error, message: &str) -> ServiceError {
    match e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            ServiceError::bad_params(message)
        }
        other => other.into(),
    }
}

impl SupervisionDirectory for Store<'_> {
    fn supervised_group_ids(&self, staff_id: &str) -> anyhow::Result<BTreeSet<String>> {
        let has_profile: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM staff WHERE id = ?", [staff_id], |r| r.get(0))
            .optional()?;
        if has_profile.is_none() {
            return Err(anyhow!("no staff profile for {staff_id}"));
        }
        let mut stmt = self.conn.prepare(
            "SELECT group_id FROM group_supervisors WHERE staff_id = ?1
             UNION
             SELECT id FROM edu_groups WHERE representative_id = ?1
             UNION
             SELECT ag.group_id
             FROM active_groups ag
             JOIN active_group_supervisors ags ON ags.active_group_id = ag.id
             WHERE ags.staff_id = ?1 AND ag.ended_at IS NULL AND ag.group_id IS NOT NULL",
        )?;
        let groups = stmt
            .query_map([staff_id], |r| r.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(groups)
    }
}

impl PresenceLedger for Store<'_> {
    fn latest_attendance(
        &self,
        student_id: &str,
        day: NaiveDate,
    ) -> anyhow::Result<Option<AttendanceRecord>> {
        let found = self
            .conn
            .query_row(
                "SELECT id, student_id, check_in, check_out
                 FROM attendance
                 WHERE student_id = ? AND day = ?
                 ORDER BY check_in DESC, rowid DESC
                 LIMIT 1",
                (student_id, day_key(day)),
                attendance_row,
            )
            .optional()?;
        Ok(found)
    }

    fn open_visit(&self, student_id: &str) -> anyhow::Result<Option<Visit>> {
        let found = self
            .conn
            .query_row(
                "SELECT id, student_id, active_group_id, entered_at, exited_at
                 FROM visits
                 WHERE student_id = ? AND exited_at IS NULL
                 ORDER BY entered_at DESC, rowid DESC
                 LIMIT 1",
                [student_id],
                visit_row,
            )
            .optional()?;
        Ok(found)
    }

    fn active_group(&self, active_group_id: &str) -> anyhow::Result<Option<ActiveGroup>> {
        let found = self
            .conn
            .query_row(
                "SELECT id, group_id, room_id, started_at, ended_at
                 FROM active_groups WHERE id = ?",
                [active_group_id],
                |r| {
                    Ok(ActiveGroup {
                        id: r.get(0)?,
                        group_id: r.get(1)?,
                        room_id: r.get(2)?,
                        started_at: ts_at(r, 3)?,
                        ended_at: opt_ts_at(r, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    fn room(&self, room_id: &str) -> anyhow::Result<Option<Room>> {
        let found = self
            .conn
            .query_row("SELECT id, name FROM rooms WHERE id = ?", [room_id], |r| {
                Ok(Room {
                    id: r.get(0)?,
                    name: r.get(1)?,
                })
            })
            .optional()?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 10, 16, h, 0, 0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
    }

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::create_schema(&conn).unwrap();
        conn
    }

    fn add_student(store: &Store<'_>, group_id: Option<&str>) -> String {
        let person = Person {
            id: Uuid::new_v4().to_string(),
            first_name: "Mia".to_string(),
            last_name: "Schulz".to_string(),
            birthday: NaiveDate::from_ymd_opt(2018, 3, 1),
            tag_id: None,
        };
        let student = Student {
            id: Uuid::new_v4().to_string(),
            person_id: person.id.clone(),
            group_id: group_id.map(str::to_string),
            school_class: "2a".to_string(),
            ..Student::default()
        };
        let id = student.id.clone();
        store
            .insert_student(&StudentWrite { student, person }, &at(7))
            .unwrap();
        id
    }

    #[test]
    fn student_record_round_trips_person_fields() {
        let conn = conn();
        let store = Store::new(&conn);
        let id = add_student(&store, None);
        let record = store.student_record(&id).unwrap();
        assert_eq!(record.person.first_name, "Mia");
        assert_eq!(record.person.birthday, NaiveDate::from_ymd_opt(2018, 3, 1));
        assert!(record.group.is_none());
        assert!(matches!(
            store.student_record("missing"),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_check_in_is_rejected_and_check_out_closes_visit() {
        let conn = conn();
        let store = Store::new(&conn);
        let room = store.create_room("Room 101").unwrap();
        let student = add_student(&store, None);

        store.check_in(&student, &at(8), day()).unwrap();
        assert!(matches!(
            store.check_in(&student, &at(9), day()),
            Err(ServiceError::InvalidRequest(_))
        ));

        let session = store
            .start_active_group(None, Some(&room.id), &[], &at(9))
            .unwrap();
        store.start_visit(&student, &session.id, &at(9), day()).unwrap();
        assert!(store.open_visit(&student).unwrap().is_some());

        assert!(matches!(
            store.check_out(&student, &at(7)),
            Err(ServiceError::InvalidRequest(_))
        ));
        let record = store.check_out(&student, &at(14)).unwrap();
        assert_eq!(record.check_out, Some(at(14)));
        assert!(store.open_visit(&student).unwrap().is_none());
        let latest = store.latest_attendance(&student, day()).unwrap().unwrap();
        assert_eq!(latest.check_out, Some(at(14)));
    }

    #[test]
    fn new_visit_closes_the_previous_one() {
        let conn = conn();
        let store = Store::new(&conn);
        let student = add_student(&store, None);
        store.check_in(&student, &at(8), day()).unwrap();

        let first = store.start_active_group(None, None, &[], &at(8)).unwrap();
        let second = store.start_active_group(None, None, &[], &at(8)).unwrap();
        store.start_visit(&student, &first.id, &at(9), day()).unwrap();
        store.start_visit(&student, &second.id, &at(10), day()).unwrap();

        let open = store.open_visit(&student).unwrap().unwrap();
        assert_eq!(open.active_group_id, second.id);
        assert_eq!(store.end_active_group(&first.id, &at(11)).unwrap(), 0);
        assert_eq!(store.end_active_group(&second.id, &at(11)).unwrap(), 1);
        assert!(store.end_active_group(&second.id, &at(12)).is_err());
    }

    #[test]
    fn supervision_covers_long_term_representative_and_live_sessions() {
        let conn = conn();
        let store = Store::new(&conn);
        let teacher = store.create_staff("Jonas", "Keller", None).unwrap();
        let rep = store.create_staff("Lea", "Brandt", Some("brandt@hort.example")).unwrap();
        let igel = store.create_group("Igel", None, Some(&rep)).unwrap();
        let fuechse = store.create_group("Füchse", None, None).unwrap();
        let baeren = store.create_group("Bären", None, None).unwrap();
        store
            .set_group_supervisors(&igel.id, &[(teacher.clone(), SupervisorRole::Specialist)])
            .unwrap();
        let session = store
            .start_active_group(Some(&fuechse.id), None, &[teacher.clone()], &at(9))
            .unwrap();

        let groups = store.supervised_group_ids(&teacher).unwrap();
        assert!(groups.contains(&igel.id));
        assert!(groups.contains(&fuechse.id));
        assert!(!groups.contains(&baeren.id));
        assert!(store.supervised_group_ids(&rep).unwrap().contains(&igel.id));

        store.end_active_group(&session.id, &at(12)).unwrap();
        assert!(!store.supervised_group_ids(&teacher).unwrap().contains(&fuechse.id));
        assert!(store.supervised_group_ids("nobody").is_err());

        let sups = store.group_supervisors(&igel.id).unwrap();
        assert_eq!(sups.len(), 2);
        let rep_row = sups.iter().find(|s| s.staff_id == rep).unwrap();
        assert_eq!(rep_row.role, SupervisorRole::Representative);
        assert_eq!(rep_row.email.as_deref(), Some("brandt@hort.example"));
    }

    #[test]
    fn tag_ids_are_unique_and_delete_removes_ledgers() {
        let conn = conn();
        let store = Store::new(&conn);
        let a = add_student(&store, None);
        let b = add_student(&store, None);

        let mut first = store.student_record(&a).unwrap();
        first.person.tag_id = Some("04:A2".to_string());
        store
            .update_student(&StudentWrite { student: first.student, person: first.person }, &at(8))
            .unwrap();
        let mut second = store.student_record(&b).unwrap();
        second.person.tag_id = Some("04:A2".to_string());
        assert!(matches!(
            store.update_student(
                &StudentWrite { student: second.student, person: second.person },
                &at(8)
            ),
            Err(ServiceError::InvalidRequest(_))
        ));

        store.check_in(&a, &at(8), day()).unwrap();
        let record = store.student_record(&a).unwrap();
        store.delete_student(&record.student).unwrap();
        assert!(store.find_student(&a).unwrap().is_none());
        assert!(store.latest_attendance(&a, day()).unwrap().is_none());
    }

    #[test]
    fn stamps_never_run_backwards() {
        let conn = conn();
        let store = Store::new(&conn);
        let student = add_student(&store, None);
        store.check_in(&student, &at(10), day()).unwrap();
        let early = store.start_active_group(None, None, &[], &at(8)).unwrap();
        let late = store.start_active_group(None, None, &[], &at(12)).unwrap();

        let rejected = |r: ServiceResult<_>| matches!(r, Err(ServiceError::InvalidRequest(_)));
        assert!(rejected(store.start_visit(&student, &early.id, &at(9), day()).map(|_| ())));
        assert!(rejected(store.start_visit(&student, &late.id, &at(11), day()).map(|_| ())));

        store.start_visit(&student, &early.id, &at(11), day()).unwrap();
        assert!(rejected(store.start_visit(&student, &early.id, &at(10), day()).map(|_| ())));
        assert!(rejected(store.end_visit(&student, &at(10)).map(|_| ())));
        assert!(rejected(store.check_out(&student, &at(10)).map(|_| ())));
        assert!(rejected(store.end_active_group(&late.id, &at(11)).map(|_| ())));

        // Nothing above touched the ledgers.
        let open = store.open_visit(&student).unwrap().unwrap();
        assert_eq!(open.entered_at, at(11));
        assert!(open.exited_at.is_none());
        assert!(store.latest_attendance(&student, day()).unwrap().unwrap().is_open());

        let record = store.check_out(&student, &at(11)).unwrap();
        assert_eq!(record.check_out, Some(at(11)));
    }

    #[test]
    fn long_term_supervision_ignores_live_sessions() {
        let conn = conn();
        let store = Store::new(&conn);
        let teacher = store.create_staff("Jonas", "Keller", None).unwrap();
        let rep = store.create_staff("Lea", "Brandt", None).unwrap();
        let guest = store.create_staff("Tom", "Wagner", None).unwrap();
        let igel = store.create_group("Igel", None, Some(&rep)).unwrap();
        store
            .set_group_supervisors(&igel.id, &[(teacher.clone(), SupervisorRole::Teacher)])
            .unwrap();
        store
            .start_active_group(Some(&igel.id), None, &[guest.clone()], &at(9))
            .unwrap();

        assert!(store.supervises_long_term(&teacher, &igel.id).unwrap());
        assert!(store.supervises_long_term(&rep, &igel.id).unwrap());
        assert!(!store.supervises_long_term(&guest, &igel.id).unwrap());
        assert!(store.supervised_group_ids(&guest).unwrap().contains(&igel.id));
    }
}
