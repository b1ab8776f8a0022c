use crate::codec::{Cell, Row};
use crate::reconcile::{Field, Reconciled, RESULT_COLUMN};

pub const PASS_MARK: f64 = 50.0;

/// Round-half-up to the nearest integer, the convention mark statements
/// are printed with. Marks are never negative, so this matches `f64::round`
/// in practice; the intent stays explicit.
pub fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedMarks {
    pub external_total: f64,
    pub external_max_mark: i64,
    pub converted_external_total: i64,
    pub total_marks: i64,
    pub result: String,
}

fn numeric(row: &Row, key: &str) -> f64 {
    row.get(key).and_then(Cell::as_f64).unwrap_or(0.0)
}

pub fn is_absent(row: &Row, attendance_key: Option<&str>) -> bool {
    attendance_key
        .and_then(|k| row.get(k))
        .map(|c| c.as_text().trim().eq_ignore_ascii_case("absent"))
        .unwrap_or(false)
}

pub fn is_present(row: &Row, attendance_key: Option<&str>) -> bool {
    attendance_key
        .and_then(|k| row.get(k))
        .map(|c| c.as_text().trim().eq_ignore_ascii_case("present"))
        .unwrap_or(false)
}

/// Computes the mark statement columns for one row. Pure: same row and
/// configuration always produce the same output, nothing is cached.
///
/// The raw external marks sum on a scale of 100 and are converted down to the
/// external component's share (100 minus the sheet's maximum internal mark).
pub fn derive_marks(
    row: &Row,
    reconciled: &Reconciled,
    maximum_internal_mark: i64,
) -> DerivedMarks {
    let external_total: f64 = reconciled
        .mark_columns
        .iter()
        .map(|k| numeric(row, k))
        .sum();
    let external_max_mark = 100 - maximum_internal_mark;
    let converted_external_total =
        round_half_up(external_total / 100.0 * external_max_mark as f64);
    let internal = numeric(row, Field::InternalMark.canonical_name());
    let total_marks = round_half_up(internal + converted_external_total as f64);

    let result = if is_absent(row, reconciled.attendance_key()) {
        "AAA".to_string()
    } else if external_total >= PASS_MARK && total_marks as f64 >= PASS_MARK {
        "Pass".to_string()
    } else {
        "Fail".to_string()
    };

    DerivedMarks {
        external_total,
        external_max_mark,
        converted_external_total,
        total_marks,
        result,
    }
}

/// Materializes Total and Result onto a canonical row for export/display.
/// Derived values are never the source of truth; they are recomputed from the
/// raw columns on every call.
pub fn apply_derived(row: &Row, reconciled: &Reconciled, maximum_internal_mark: i64) -> Row {
    let derived = derive_marks(row, reconciled, maximum_internal_mark);
    let mut out = row.clone();
    out.insert(
        Field::Total.canonical_name().to_string(),
        Cell::Number(derived.total_marks as f64),
    );
    out.insert(RESULT_COLUMN.to_string(), Cell::Text(derived.result));
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFilter {
    All,
    Pass,
    Fail,
    Absent,
    Above50,
}

impl RowFilter {
    pub fn parse(s: &str) -> Option<RowFilter> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Some(RowFilter::All),
            "pass" => Some(RowFilter::Pass),
            "fail" => Some(RowFilter::Fail),
            "absent" => Some(RowFilter::Absent),
            "above50" | "above_50" | "marks>50" => Some(RowFilter::Above50),
            _ => None,
        }
    }

    pub fn keeps(self, derived: &DerivedMarks) -> bool {
        match self {
            RowFilter::All => true,
            RowFilter::Pass => derived.result == "Pass",
            RowFilter::Fail => derived.result == "Fail",
            RowFilter::Absent => derived.result == "AAA",
            RowFilter::Above50 => derived.total_marks as f64 > PASS_MARK,
        }
    }
}

/// Subsets rows by their derived result before export.
pub fn filter_rows(
    rows: &[Row],
    reconciled: &Reconciled,
    maximum_internal_mark: i64,
    filter: RowFilter,
) -> Vec<Row> {
    rows.iter()
        .filter(|row| filter.keeps(&derive_marks(row, reconciled, maximum_internal_mark)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::reconcile;
    use std::collections::HashMap;

    fn fixture_reconciled() -> Reconciled {
        let headers: Vec<String> = {
            let mut h = vec![
                "Register Number".to_string(),
                "Subject Code".to_string(),
                "Internal Mark".to_string(),
                "Attendance".to_string(),
            ];
            h.extend((1..=15).map(|n| n.to_string()));
            h
        };
        reconcile(&headers).expect("reconcile")
    }

    fn row_with_marks(internal: f64, attendance: &str, marks: &[(usize, f64)]) -> Row {
        let mut row: Row = HashMap::new();
        row.insert("Register Number".to_string(), Cell::Number(920001.0));
        row.insert("Subject Code".to_string(), Cell::Text("CS101".to_string()));
        row.insert("Internal Mark".to_string(), Cell::Number(internal));
        row.insert(
            "Attendance".to_string(),
            Cell::Text(attendance.to_string()),
        );
        for (col, v) in marks {
            row.insert(col.to_string(), Cell::Number(*v));
        }
        row
    }

    #[test]
    fn worked_example_from_the_mark_scheme() {
        // 15 columns summing to 75, internal 40, max internal 50.
        let row = row_with_marks(40.0, "Present", &[(1, 40.0), (2, 20.0), (3, 15.0)]);
        let d = derive_marks(&row, &fixture_reconciled(), 50);
        assert_eq!(d.external_total, 75.0);
        assert_eq!(d.external_max_mark, 50);
        assert_eq!(d.converted_external_total, 38);
        assert_eq!(d.total_marks, 78);
        assert_eq!(d.result, "Pass");
    }

    #[test]
    fn absent_rows_always_yield_aaa() {
        let row = row_with_marks(48.0, "Absent", &[(1, 90.0)]);
        let d = derive_marks(&row, &fixture_reconciled(), 50);
        assert_eq!(d.result, "AAA");
    }

    #[test]
    fn low_external_total_fails_even_with_high_internal() {
        let row = row_with_marks(50.0, "Present", &[(1, 49.0)]);
        let d = derive_marks(&row, &fixture_reconciled(), 50);
        assert_eq!(d.external_total, 49.0);
        assert_eq!(d.result, "Fail");
    }

    #[test]
    fn missing_marks_and_internal_count_as_zero() {
        let mut row: Row = HashMap::new();
        row.insert("Register Number".to_string(), Cell::Number(1.0));
        row.insert("Subject Code".to_string(), Cell::Text("CS101".to_string()));
        row.insert("Internal Mark".to_string(), Cell::Empty);
        let d = derive_marks(&row, &fixture_reconciled(), 50);
        assert_eq!(d.external_total, 0.0);
        assert_eq!(d.total_marks, 0);
        assert_eq!(d.result, "Fail");
    }

    #[test]
    fn rounding_is_half_up() {
        assert_eq!(round_half_up(37.5), 38);
        assert_eq!(round_half_up(37.49), 37);
        assert_eq!(round_half_up(0.0), 0);
    }

    #[test]
    fn above50_filter_is_strictly_greater_than() {
        let rec = fixture_reconciled();
        let exactly_50 = row_with_marks(25.0, "Present", &[(1, 50.0)]);
        let d = derive_marks(&exactly_50, &rec, 50);
        assert_eq!(d.total_marks, 50);
        assert!(!RowFilter::Above50.keeps(&d));
        assert!(RowFilter::Pass.keeps(&d));

        let just_over = row_with_marks(26.0, "Present", &[(1, 50.0)]);
        assert!(RowFilter::Above50.keeps(&derive_marks(&just_over, &rec, 50)));
    }
}
