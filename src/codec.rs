use std::collections::HashMap;
use std::io::Cursor;

use anyhow::{anyhow, Context};
use calamine::{Data, Reader, Xlsx};
use rust_xlsxwriter::{Format, FormatAlign, Workbook};

/// One spreadsheet cell. Calamine hands back richer variants (bools, dates,
/// errors); everything the portal cares about collapses to text or number.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            Cell::Number(_) => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            Cell::Text(s) => s.trim().parse::<f64>().ok(),
            Cell::Empty => None,
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            Cell::Text(s) => s.clone(),
            Cell::Number(n) => format_number(*n),
            Cell::Empty => String::new(),
        }
    }
}

impl From<&Data> for Cell {
    fn from(d: &Data) -> Self {
        match d {
            Data::Empty => Cell::Empty,
            Data::String(s) => {
                if s.trim().is_empty() {
                    Cell::Empty
                } else {
                    Cell::Text(s.clone())
                }
            }
            Data::Float(f) => Cell::Number(*f),
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Bool(b) => Cell::Text(if *b { "TRUE" } else { "FALSE" }.to_string()),
            Data::DateTime(dt) => Cell::Number(dt.as_f64()),
            Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
            Data::Error(e) => Cell::Text(format!("{:?}", e)),
        }
    }
}

/// Register numbers and the like are integers; render them without the
/// trailing `.0` that a float column would otherwise produce.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

pub type Row = HashMap<String, Cell>;

/// Decoded worksheet: header order from the first row, then one map per
/// data row keyed by header text.
#[derive(Debug, Clone)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

/// Parses the first worksheet of an .xlsx workbook held in memory. The first
/// row is the header row; blank header cells are skipped, fully blank data
/// rows are dropped. Merged cells arrive from calamine as a value in the
/// top-left cell with blanks elsewhere, so cosmetic grouping headers do not
/// disturb decoding.
pub fn decode(bytes: &[u8]) -> anyhow::Result<Table> {
    let mut workbook: Xlsx<_> =
        Xlsx::new(Cursor::new(bytes.to_vec())).context("workbook is not a readable .xlsx file")?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow!("workbook contains no sheet"))?
        .context("worksheet could not be read")?;

    let mut rows_iter = range.rows().peekable();
    let mut header_row = rows_iter
        .next()
        .ok_or_else(|| anyhow!("worksheet has no header row"))?;

    // A grouped export carries a one-cell merged banner above the real header
    // row. Skip it when the next row is clearly the wider one.
    let filled = |r: &[Data]| r.iter().filter(|c| !Cell::from(*c).is_empty()).count();
    if filled(header_row) <= 1 {
        if let Some(next) = rows_iter.peek() {
            if filled(*next) > filled(header_row) {
                header_row = rows_iter.next().unwrap_or(header_row);
            }
        }
    }

    // (column index, header text) for every non-blank header cell.
    let mut columns: Vec<(usize, String)> = Vec::new();
    for (idx, cell) in header_row.iter().enumerate() {
        let text = Cell::from(cell).as_text();
        let text = text.trim().to_string();
        if !text.is_empty() {
            columns.push((idx, text));
        }
    }
    if columns.is_empty() {
        return Err(anyhow!("worksheet header row is empty"));
    }

    let headers: Vec<String> = columns.iter().map(|(_, h)| h.clone()).collect();
    let mut rows: Vec<Row> = Vec::new();
    for data_row in rows_iter {
        let mut row: Row = HashMap::new();
        let mut any_value = false;
        for (idx, header) in &columns {
            let cell = data_row.get(*idx).map(Cell::from).unwrap_or(Cell::Empty);
            if !cell.is_empty() {
                any_value = true;
            }
            row.insert(header.clone(), cell);
        }
        if any_value {
            rows.push(row);
        }
    }

    Ok(Table { headers, rows })
}

/// Serializes rows back to a single-sheet workbook. Column order follows
/// `header_order` exactly, not row key order; keys a row lacks write as
/// blanks. An empty row set is legal and yields a header-only sheet.
pub fn encode(rows: &[Row], header_order: &[String]) -> anyhow::Result<Vec<u8>> {
    encode_inner(rows, header_order, None)
}

/// Like `encode`, but adds a merged banner cell above a contiguous span of
/// columns (used to label the numbered mark columns). The banner occupies an
/// extra leading row and is cosmetic only.
pub fn encode_grouped(
    rows: &[Row],
    header_order: &[String],
    group: (&str, usize, usize),
) -> anyhow::Result<Vec<u8>> {
    encode_inner(rows, header_order, Some(group))
}

fn encode_inner(
    rows: &[Row],
    header_order: &[String],
    group: Option<(&str, usize, usize)>,
) -> anyhow::Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();

    let header_row: u32 = if group.is_some() { 1 } else { 0 };
    if let Some((label, first_col, last_col)) = group {
        if last_col > first_col {
            let format = Format::new().set_bold().set_align(FormatAlign::Center);
            worksheet
                .merge_range(0, first_col as u16, 0, last_col as u16, label, &format)
                .context("failed to write group banner")?;
        }
    }

    for (col, header) in header_order.iter().enumerate() {
        worksheet
            .write_string(header_row, col as u16, header)
            .context("failed to write header cell")?;
    }

    for (r, row) in rows.iter().enumerate() {
        let out_row = header_row + 1 + r as u32;
        for (col, header) in header_order.iter().enumerate() {
            match row.get(header) {
                Some(Cell::Number(n)) => {
                    worksheet
                        .write_number(out_row, col as u16, *n)
                        .context("failed to write number cell")?;
                }
                Some(Cell::Text(s)) => {
                    worksheet
                        .write_string(out_row, col as u16, s)
                        .context("failed to write text cell")?;
                }
                Some(Cell::Empty) | None => {}
            }
        }
    }

    workbook
        .save_to_buffer()
        .context("failed to serialize workbook")
}
