use crate::codec::{Cell, Row};
use crate::derive::is_present;
use crate::reconcile::normalize_subject_code;

/// Scripts are handed to external examiners in fixed packets of 20.
pub const BUNDLE_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct Bundle {
    /// `{subject code prefix}-{NN}`, NN 2-digit and 1-based.
    pub name: String,
    pub number: usize,
    pub rows: Vec<Row>,
}

fn duplicate_number(row: &Row, key: &str) -> f64 {
    row.get(key).and_then(Cell::as_f64).unwrap_or(0.0)
}

pub fn bundle_name(subject_code: &str, number: usize) -> String {
    let normalized = normalize_subject_code(subject_code);
    let prefix: String = normalized.chars().take(6).collect();
    format!("{}-{:02}", prefix, number)
}

/// Partitions present rows into grading bundles ordered by duplicate number.
///
/// Rows without an attendance column all qualify; missing or non-numeric
/// duplicate numbers sort as 0. The sort is stable, so rows sharing a
/// duplicate number keep their original sheet order. Recomputing from the
/// same row set always yields the same partition, which is what lets the
/// staff and COE views agree without shared state.
pub fn partition(
    rows: &[Row],
    duplicate_number_key: &str,
    attendance_key: Option<&str>,
    subject_code: &str,
) -> Vec<Bundle> {
    let mut present: Vec<&Row> = rows
        .iter()
        .filter(|row| attendance_key.is_none() || is_present(row, attendance_key))
        .collect();
    present.sort_by(|a, b| {
        duplicate_number(a, duplicate_number_key)
            .partial_cmp(&duplicate_number(b, duplicate_number_key))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    present
        .chunks(BUNDLE_SIZE)
        .enumerate()
        .map(|(i, chunk)| Bundle {
            name: bundle_name(subject_code, i + 1),
            number: i + 1,
            rows: chunk.iter().map(|r| (*r).clone()).collect(),
        })
        .collect()
}
