use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("attendance.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            unique_id TEXT NOT NULL UNIQUE,
            code_path TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_unique_id ON students(unique_id)",
        [],
    )?;

    // The (student_id, day) UNIQUE constraint is the authoritative
    // de-duplication boundary; concurrent sessions racing on the same
    // student resolve here, not in session memory.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            day TEXT NOT NULL,
            marked_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'present',
            UNIQUE(student_id, day),
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE
        )",
        [],
    )?;

    // Older workspaces stored attendance rows without a status column.
    ensure_attendance_status(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_day ON attendance(day)",
        [],
    )?;

    Ok(conn)
}

fn ensure_attendance_status(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "attendance", "status")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE attendance ADD COLUMN status TEXT NOT NULL DEFAULT 'present'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
