use chrono::NaiveDate;

use crate::codec::Row;
use crate::derive::is_present;

/// Role claim carried on each request. Authentication itself lives outside
/// the daemon; this only decides who may drive which stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    SubAdmin,
    Coe,
    Staff,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "subadmin" | "sub-admin" | "sub_admin" => Some(Role::SubAdmin),
            "coe" | "ceo" => Some(Role::Coe),
            "staff" => Some(Role::Staff),
            _ => None,
        }
    }

    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }
}

/// The pipeline stages a sheet advances through after upload. Flags are
/// cumulative, not mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Attendance,
    Duplicates,
    ExternalMarks,
    Archive,
}

/// Capability table: which role may drive which stage. Admin can drive all
/// of them, including rewrites of already-advanced stages (the recognized
/// re-opening escape hatch).
pub fn can_edit(role: Role, stage: Stage) -> bool {
    match stage {
        Stage::Attendance | Stage::Duplicates => matches!(role, Role::Admin | Role::SubAdmin),
        Stage::ExternalMarks => matches!(role, Role::Admin | Role::Staff),
        Stage::Archive => matches!(role, Role::Admin | Role::Coe),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SheetFlags {
    pub attendance_marked: bool,
    pub duplicates_generated: bool,
    pub external_marks_added: bool,
    pub is_downloaded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCheck {
    Visible,
    NotYetAvailable,
    NoLongerAvailable,
}

impl WindowCheck {
    pub fn reason(self) -> &'static str {
        match self {
            WindowCheck::Visible => "visible",
            WindowCheck::NotYetAvailable => "sheet is not yet available",
            WindowCheck::NoLongerAvailable => "sheet is no longer available",
        }
    }
}

/// Date-window gate for non-admin reads. The end date is inclusive through
/// 23:59:59 of that day, which date-only comparison gives us for free. A
/// missing bound leaves that side open.
pub fn check_window(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    today: NaiveDate,
) -> WindowCheck {
    if let Some(s) = start {
        if today < s {
            return WindowCheck::NotYetAvailable;
        }
    }
    if let Some(e) = end {
        if today > e {
            return WindowCheck::NoLongerAvailable;
        }
    }
    WindowCheck::Visible
}

/// external_marks_added may flip only once every present row carries at
/// least one non-empty numbered mark. Partial fills keep the flag false so
/// entry can resume across sessions.
pub fn external_marks_complete(
    rows: &[Row],
    mark_columns: &[String],
    attendance_key: Option<&str>,
) -> bool {
    if mark_columns.is_empty() {
        return false;
    }
    let mut present_seen = false;
    for row in rows {
        if attendance_key.is_some() && !is_present(row, attendance_key) {
            continue;
        }
        present_seen = true;
        let filled = mark_columns
            .iter()
            .any(|k| row.get(k).map(|c| !c.is_empty()).unwrap_or(false));
        if !filled {
            return false;
        }
    }
    present_seen
}
