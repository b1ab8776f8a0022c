use std::collections::HashMap;
use std::fmt;

use crate::codec::{Cell, Row};

/// Semantic columns the portal understands. Everything else rides along as a
/// passthrough column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    RegisterNumber,
    RollNumber,
    SubjectCode,
    InternalMark,
    Attendance,
    DuplicateNumber,
    Total,
}

impl Field {
    pub fn canonical_name(self) -> &'static str {
        match self {
            Field::RegisterNumber => "Register Number",
            Field::RollNumber => "Roll Number",
            Field::SubjectCode => "Subject Code",
            Field::InternalMark => "Internal Mark",
            Field::Attendance => "Attendance",
            Field::DuplicateNumber => "Duplicate Number",
            Field::Total => "Total",
        }
    }
}

pub const RESULT_COLUMN: &str = "Result";
pub const EXTERNAL_MARKS_PLACEHOLDER: &str = "External Marks";
pub const MARK_COLUMN_COUNT: usize = 15;

/// Alias table, v1. Keys are normalized header text (lower-cased, whitespace
/// stripped). Kept as data so new aliases are one-line additions.
const ALIASES: &[(&str, Field)] = &[
    ("registernumber", Field::RegisterNumber),
    ("registerno", Field::RegisterNumber),
    ("regno", Field::RegisterNumber),
    ("register", Field::RegisterNumber),
    ("rollnumber", Field::RollNumber),
    ("rollno", Field::RollNumber),
    ("roll", Field::RollNumber),
    ("subjectcode", Field::SubjectCode),
    ("subcode", Field::SubjectCode),
    ("subject", Field::SubjectCode),
    ("internalmark", Field::InternalMark),
    ("internalmarks", Field::InternalMark),
    ("internal", Field::InternalMark),
    ("attendance", Field::Attendance),
    ("attendence", Field::Attendance),
    ("duplicatenumber", Field::DuplicateNumber),
    ("duplicateno", Field::DuplicateNumber),
    ("dummynumber", Field::DuplicateNumber),
    ("dummyno", Field::DuplicateNumber),
    ("total", Field::Total),
    ("totalmarks", Field::Total),
    ("grandtotal", Field::Total),
];

/// Grouping headers some colleges leave in their templates. They label the
/// numbered mark columns and must not survive as data columns. An incoming
/// "Result" column is suppressed too: Result is always recomputed.
const SUPPRESSED: &[&str] = &["2marks", "5marks", "10marks", "externalmarks", "result"];

/// Normalized form used only for matching, never for output.
pub fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

/// Subject codes compare as upper-case alphanumerics: "CS-101" == "cs101".
pub fn normalize_subject_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase()
}

#[derive(Debug)]
pub struct MissingColumns(pub Vec<&'static str>);

impl fmt::Display for MissingColumns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "required columns missing: {}", self.0.join(", "))
    }
}

impl std::error::Error for MissingColumns {}

#[derive(Debug, Clone)]
pub struct Reconciled {
    /// Canonical field -> original header text as uploaded.
    by_field: HashMap<Field, String>,
    /// Numbered mark columns present in the upload, ascending ("1".."15").
    pub mark_columns: Vec<String>,
    /// Unrecognized headers in original order, suppressed ones removed.
    pub passthrough: Vec<String>,
}

impl Reconciled {
    pub fn original_header(&self, field: Field) -> Option<&str> {
        self.by_field.get(&field).map(|s| s.as_str())
    }

    pub fn has(&self, field: Field) -> bool {
        self.by_field.contains_key(&field)
    }

    /// Canonical output order: fixed semantic columns, the mark columns (or a
    /// single placeholder when a selection UI wants them collapsed), Total and
    /// the synthetic Result column, then passthrough columns.
    pub fn header_order(&self, collapse_marks: bool) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for field in [
            Field::RegisterNumber,
            Field::RollNumber,
            Field::SubjectCode,
            Field::InternalMark,
            Field::Attendance,
            Field::DuplicateNumber,
        ] {
            if self.has(field) {
                order.push(field.canonical_name().to_string());
            }
        }
        if collapse_marks {
            if !self.mark_columns.is_empty() {
                order.push(EXTERNAL_MARKS_PLACEHOLDER.to_string());
            }
        } else {
            order.extend(self.mark_columns.iter().cloned());
        }
        order.push(Field::Total.canonical_name().to_string());
        order.push(RESULT_COLUMN.to_string());
        order.extend(self.passthrough.iter().cloned());
        order
    }

    /// Rewrites a decoded row's keys onto canonical names. Mark and
    /// passthrough columns keep their original headers.
    pub fn remap_row(&self, row: &Row) -> Row {
        let mut out: Row = HashMap::new();
        for (field, original) in &self.by_field {
            if let Some(cell) = row.get(original) {
                out.insert(field.canonical_name().to_string(), cell.clone());
            }
        }
        for key in self.mark_columns.iter().chain(self.passthrough.iter()) {
            if let Some(cell) = row.get(key) {
                out.insert(key.clone(), cell.clone());
            }
        }
        out
    }

    /// Attendance column name in canonical rows, if one was uploaded.
    pub fn attendance_key(&self) -> Option<&'static str> {
        self.has(Field::Attendance)
            .then(|| Field::Attendance.canonical_name())
    }
}

/// Identifies semantic columns in an uploaded header set. Fails when any of
/// register number, subject code or internal mark is absent; the error names
/// every missing column so the operator can fix the template in one pass.
pub fn reconcile(headers: &[String]) -> Result<Reconciled, MissingColumns> {
    let alias_map: HashMap<&str, Field> = ALIASES.iter().cloned().collect();

    let mut by_field: HashMap<Field, String> = HashMap::new();
    let mut mark_numbers: Vec<(usize, String)> = Vec::new();
    let mut passthrough: Vec<String> = Vec::new();

    for header in headers {
        let norm = normalize_header(header);
        if let Some(field) = alias_map.get(norm.as_str()) {
            // First occurrence wins; later duplicates ride along untouched.
            if !by_field.contains_key(field) {
                by_field.insert(*field, header.clone());
                continue;
            }
        }
        if let Ok(n) = norm.parse::<usize>() {
            if (1..=MARK_COLUMN_COUNT).contains(&n) {
                mark_numbers.push((n, header.clone()));
                continue;
            }
        }
        if SUPPRESSED.contains(&norm.as_str()) {
            continue;
        }
        passthrough.push(header.clone());
    }

    let mut missing: Vec<&'static str> = Vec::new();
    for required in [Field::RegisterNumber, Field::SubjectCode, Field::InternalMark] {
        if !by_field.contains_key(&required) {
            missing.push(required.canonical_name());
        }
    }
    if !missing.is_empty() {
        return Err(MissingColumns(missing));
    }

    mark_numbers.sort_by_key(|(n, _)| *n);
    let mark_columns = mark_numbers.into_iter().map(|(_, h)| h).collect();

    Ok(Reconciled {
        by_field,
        mark_columns,
        passthrough,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Matched,
    Mismatched,
}

/// A row belongs to the active upload when its subject-code cell, normalized,
/// equals the target subject code. Rows with a blank subject code mismatch.
pub fn classify(row: &Row, subject_code_header: &str, target_code: &str) -> Classification {
    let cell = row.get(subject_code_header).cloned().unwrap_or(Cell::Empty);
    let code = normalize_subject_code(&cell.as_text());
    if !code.is_empty() && code == normalize_subject_code(target_code) {
        Classification::Matched
    } else {
        Classification::Mismatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn header_matching_is_case_and_whitespace_insensitive() {
        for spelling in ["Register Number", "register  number", "REGISTERNUMBER"] {
            let r = reconcile(&headers(&[spelling, "Subject Code", "Internal Mark"]))
                .expect("reconcile");
            assert_eq!(r.original_header(Field::RegisterNumber), Some(spelling));
        }
    }

    #[test]
    fn missing_required_columns_are_all_named() {
        let err = reconcile(&headers(&["Attendance", "1", "2"])).unwrap_err();
        assert_eq!(
            err.0,
            vec!["Register Number", "Subject Code", "Internal Mark"]
        );
    }

    #[test]
    fn mark_columns_collect_in_ascending_numeric_order() {
        let r = reconcile(&headers(&[
            "Register Number",
            "Subject Code",
            "Internal Mark",
            "10",
            "2",
            "1",
            "16",
        ]))
        .expect("reconcile");
        assert_eq!(r.mark_columns, vec!["1", "2", "10"]);
        // 16 is out of range and rides along as passthrough.
        assert_eq!(r.passthrough, vec!["16"]);
    }

    #[test]
    fn canonical_order_places_marks_before_total_and_result() {
        let r = reconcile(&headers(&[
            "Total",
            "2 Marks",
            "Register Number",
            "Attendance",
            "Subject Code",
            "Internal Mark",
            "1",
            "2",
            "Remarks",
        ]))
        .expect("reconcile");
        assert_eq!(
            r.header_order(false),
            vec![
                "Register Number",
                "Subject Code",
                "Internal Mark",
                "Attendance",
                "1",
                "2",
                "Total",
                "Result",
                "Remarks"
            ]
        );
        assert_eq!(
            r.header_order(true),
            vec![
                "Register Number",
                "Subject Code",
                "Internal Mark",
                "Attendance",
                "External Marks",
                "Total",
                "Result",
                "Remarks"
            ]
        );
    }

    #[test]
    fn classification_ignores_punctuation_and_case() {
        let r = reconcile(&headers(&["Register Number", "Sub Code", "Internal Mark"]))
            .expect("reconcile");
        let header = r.original_header(Field::SubjectCode).unwrap().to_string();

        let mut row: Row = HashMap::new();
        row.insert(header.clone(), Cell::Text("CS-101".to_string()));
        assert_eq!(classify(&row, &header, "CS101"), Classification::Matched);

        row.insert(header.clone(), Cell::Text("cs101".to_string()));
        assert_eq!(classify(&row, &header, "CS101"), Classification::Matched);

        row.insert(header.clone(), Cell::Text("CS102".to_string()));
        assert_eq!(classify(&row, &header, "CS101"), Classification::Mismatched);

        row.insert(header.clone(), Cell::Empty);
        assert_eq!(classify(&row, &header, "CS101"), Classification::Mismatched);
    }

    #[test]
    fn remap_renames_matched_columns_only() {
        let r = reconcile(&headers(&["Reg No", "Sub Code", "Internal", "1", "Remarks"]))
            .expect("reconcile");
        let mut row: Row = HashMap::new();
        row.insert("Reg No".to_string(), Cell::Number(920001.0));
        row.insert("Sub Code".to_string(), Cell::Text("CS101".to_string()));
        row.insert("Internal".to_string(), Cell::Number(40.0));
        row.insert("1".to_string(), Cell::Number(5.0));
        row.insert("Remarks".to_string(), Cell::Text("ok".to_string()));

        let out = r.remap_row(&row);
        assert_eq!(out.get("Register Number"), Some(&Cell::Number(920001.0)));
        assert_eq!(out.get("Internal Mark"), Some(&Cell::Number(40.0)));
        assert_eq!(out.get("1"), Some(&Cell::Number(5.0)));
        assert_eq!(out.get("Remarks"), Some(&Cell::Text("ok".to_string())));
        assert!(!out.contains_key("Reg No"));
    }
}
