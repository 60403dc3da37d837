use chrono::{DateTime, Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

use crate::scan::{AttendanceLedger, IdentityLookup, InsertOutcome};

#[derive(Debug, Clone)]
pub struct StudentIdentity {
    pub id: String,
    pub name: String,
    pub unique_id: String,
    pub code_path: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique id already registered: {0}")]
    DuplicateUniqueId(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

// Specifically a UNIQUE violation; other constraint failures (e.g. a
// foreign key on a deleted student) are real errors.
fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

pub fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

pub fn create_student(
    conn: &Connection,
    name: &str,
    unique_id: &str,
) -> Result<StudentIdentity, StoreError> {
    let id = Uuid::new_v4().to_string();
    let created_at = Local::now().to_rfc3339();
    let inserted = conn.execute(
        "INSERT INTO students(id, name, unique_id, code_path, created_at)
         VALUES(?, ?, ?, NULL, ?)",
        (&id, name, unique_id, &created_at),
    );
    match inserted {
        Ok(_) => Ok(StudentIdentity {
            id,
            name: name.to_string(),
            unique_id: unique_id.to_string(),
            code_path: None,
        }),
        Err(e) if is_unique_violation(&e) => {
            Err(StoreError::DuplicateUniqueId(unique_id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn set_code_path(conn: &Connection, student_id: &str, path: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE students SET code_path = ? WHERE id = ?",
        (path, student_id),
    )?;
    Ok(())
}

pub fn find_student_by_unique_id(
    conn: &Connection,
    unique_id: &str,
) -> Result<Option<StudentIdentity>, StoreError> {
    conn.query_row(
        "SELECT id, name, unique_id, code_path FROM students WHERE unique_id = ?",
        [unique_id],
        |r| {
            Ok(StudentIdentity {
                id: r.get(0)?,
                name: r.get(1)?,
                unique_id: r.get(2)?,
                code_path: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(StoreError::from)
}

pub fn list_students(conn: &Connection) -> Result<Vec<StudentIdentity>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, unique_id, code_path FROM students ORDER BY name, unique_id",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(StudentIdentity {
                id: r.get(0)?,
                name: r.get(1)?,
                unique_id: r.get(2)?,
                code_path: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Returns true if a student row was removed. Attendance rows cascade.
pub fn delete_student_by_unique_id(
    conn: &Connection,
    unique_id: &str,
) -> Result<bool, StoreError> {
    let n = conn.execute("DELETE FROM students WHERE unique_id = ?", [unique_id])?;
    Ok(n > 0)
}

pub fn exists_present_on(
    conn: &Connection,
    student_id: &str,
    day: NaiveDate,
) -> Result<bool, StoreError> {
    conn.query_row(
        "SELECT 1 FROM attendance WHERE student_id = ? AND day = ? AND status = 'present'",
        (student_id, day_key(day)),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(StoreError::from)
}

pub fn insert_present_on(
    conn: &Connection,
    student_id: &str,
    day: NaiveDate,
    marked_at: DateTime<Local>,
) -> Result<InsertOutcome, StoreError> {
    let id = Uuid::new_v4().to_string();
    let inserted = conn.execute(
        "INSERT INTO attendance(id, student_id, day, marked_at, status)
         VALUES(?, ?, ?, ?, 'present')",
        (&id, student_id, day_key(day), marked_at.to_rfc3339()),
    );
    match inserted {
        Ok(_) => Ok(InsertOutcome::Inserted),
        // Another session won the race for this (student, day); the row
        // exists, which is all the caller needs.
        Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::AlreadyPresent),
        Err(e) => Err(e.into()),
    }
}

/// All (student_id, day) pairs with a present row in the inclusive range.
pub fn present_pairs_between(
    conn: &Connection,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<HashSet<(String, String)>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT student_id, day FROM attendance
         WHERE day >= ? AND day <= ? AND status = 'present'",
    )?;
    let rows = stmt
        .query_map((day_key(from), day_key(to)), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(rows)
}

/// Sqlite-backed identity lookup for the scan session.
pub struct SqliteIdentities<'a>(pub &'a Connection);

impl IdentityLookup for SqliteIdentities<'_> {
    fn find_by_unique_id(&self, unique_id: &str) -> Result<Option<StudentIdentity>, StoreError> {
        find_student_by_unique_id(self.0, unique_id)
    }
}

/// Sqlite-backed attendance ledger for the scan session.
pub struct SqliteLedger<'a>(pub &'a Connection);

impl AttendanceLedger for SqliteLedger<'_> {
    fn exists_present(&self, student_id: &str, day: NaiveDate) -> Result<bool, StoreError> {
        exists_present_on(self.0, student_id, day)
    }

    fn insert_present(
        &self,
        student_id: &str,
        day: NaiveDate,
        marked_at: DateTime<Local>,
    ) -> Result<InsertOutcome, StoreError> {
        insert_present_on(self.0, student_id, day, marked_at)
    }
}
