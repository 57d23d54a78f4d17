use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "hort.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    Ok(conn)
}

pub(crate) fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS persons(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            birthday TEXT,
            tag_id TEXT UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff(
            id TEXT PRIMARY KEY,
            person_id TEXT NOT NULL UNIQUE,
            email TEXT,
            FOREIGN KEY(person_id) REFERENCES persons(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rooms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS edu_groups(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            room_id TEXT,
            representative_id TEXT,
            FOREIGN KEY(room_id) REFERENCES rooms(id),
            FOREIGN KEY(representative_id) REFERENCES staff(id)
        )",
        [],
    )?;

    // role: teacher | specialist. The representative lives on groups.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_supervisors(
            group_id TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            role TEXT NOT NULL,
            PRIMARY KEY(group_id, staff_id),
            FOREIGN KEY(group_id) REFERENCES edu_groups(id),
            FOREIGN KEY(staff_id) REFERENCES staff(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_group_supervisors_staff ON group_supervisors(staff_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            person_id TEXT NOT NULL UNIQUE,
            group_id TEXT,
            school_class TEXT NOT NULL,
            guardian_name TEXT,
            guardian_email TEXT,
            guardian_phone TEXT,
            guardian_contact TEXT,
            extra_info TEXT,
            health_info TEXT,
            supervisor_notes TEXT,
            pickup_status TEXT,
            bus INTEGER NOT NULL DEFAULT 0,
            sick INTEGER NOT NULL DEFAULT 0,
            sick_since TEXT,
            updated_at TEXT,
            FOREIGN KEY(person_id) REFERENCES persons(id),
            FOREIGN KEY(group_id) REFERENCES edu_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_group ON students(group_id)",
        [],
    )?;

    // day is the facility-local date of check_in.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            day TEXT NOT NULL,
            check_in TEXT NOT NULL,
            check_out TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student_day ON attendance(student_id, day)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS active_groups(
            id TEXT PRIMARY KEY,
            group_id TEXT,
            room_id TEXT,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            FOREIGN KEY(group_id) REFERENCES edu_groups(id),
            FOREIGN KEY(room_id) REFERENCES rooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS active_group_supervisors(
            active_group_id TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            PRIMARY KEY(active_group_id, staff_id),
            FOREIGN KEY(active_group_id) REFERENCES active_groups(id),
            FOREIGN KEY(staff_id) REFERENCES staff(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_active_group_supervisors_staff
         ON active_group_supervisors(staff_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS visits(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            active_group_id TEXT NOT NULL,
            entered_at TEXT NOT NULL,
            exited_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(active_group_id) REFERENCES active_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_visits_student ON visits(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_visits_active_group ON visits(active_group_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("setting {key} is not valid JSON"))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
