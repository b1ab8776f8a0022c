use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("examhall.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            department_id TEXT,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            semester TEXT,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_department ON subjects(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL,
            department_id TEXT,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sheets(
            id TEXT PRIMARY KEY,
            sheet_name TEXT NOT NULL,
            file_path TEXT NOT NULL,
            department_id TEXT,
            subject_id TEXT NOT NULL,
            year TEXT NOT NULL,
            batch TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT,
            maximum_internal_mark INTEGER NOT NULL DEFAULT 50,
            attendance_marked INTEGER NOT NULL DEFAULT 0,
            duplicates_generated INTEGER NOT NULL DEFAULT 0,
            external_marks_added INTEGER NOT NULL DEFAULT 0,
            is_downloaded INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(department_id) REFERENCES departments(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sheets_subject ON sheets(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sheets_department ON sheets(department_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sheets_file_path ON sheets(file_path)",
        [],
    )?;

    // Early workspaces predate the visibility window and internal-mark cap.
    ensure_sheets_window_dates(&conn)?;
    ensure_sheets_maximum_internal_mark(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS examiner_details(
            id TEXT PRIMARY KEY,
            sheet_id TEXT NOT NULL,
            bundle_number INTEGER NOT NULL,
            internal_name TEXT NOT NULL,
            internal_designation TEXT NOT NULL,
            internal_department TEXT NOT NULL,
            internal_college TEXT NOT NULL,
            chief_name TEXT,
            chief_designation TEXT,
            chief_department TEXT,
            chief_college TEXT,
            FOREIGN KEY(sheet_id) REFERENCES sheets(id),
            UNIQUE(sheet_id, bundle_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_examiner_details_sheet ON examiner_details(sheet_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_sheets_window_dates(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "sheets", "start_date")? {
        conn.execute("ALTER TABLE sheets ADD COLUMN start_date TEXT", [])?;
    }
    if !table_has_column(conn, "sheets", "end_date")? {
        conn.execute("ALTER TABLE sheets ADD COLUMN end_date TEXT", [])?;
    }
    Ok(())
}

fn ensure_sheets_maximum_internal_mark(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "sheets", "maximum_internal_mark")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE sheets ADD COLUMN maximum_internal_mark INTEGER NOT NULL DEFAULT 50",
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
