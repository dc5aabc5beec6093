use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Reader};
use csv::ReaderBuilder;
use std::{fs::File, path::Path};

/// A single ledger cell after loading.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            Cell::Number(_) => false,
        }
    }

    /// Text form of the cell. Integral numbers render without a fractional part.
    pub fn to_text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Number(f) => number_to_text(*f),
        }
    }

    /// Numeric form of the cell; blanks and unparseable text are `0.0`.
    pub fn to_amount(&self) -> f64 {
        match self {
            Cell::Empty => 0.0,
            Cell::Text(s) => parse_amount(s),
            Cell::Number(f) if f.is_finite() => *f,
            Cell::Number(_) => 0.0,
        }
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        if s.is_empty() { Cell::Empty } else { Cell::Text(s.to_string()) }
    }
}

impl From<f64> for Cell {
    fn from(f: f64) -> Self { Cell::Number(f) }
}

fn number_to_text(f: f64) -> String {
    if f.is_finite() && f.fract().abs() < f64::EPSILON && f.abs() < i64::MAX as f64 {
        return format!("{}", f as i64);
    }
    f.to_string()
}

/// An in-memory sheet: a header row plus data rows, columns addressed
/// positionally from sheet column `A`.
#[derive(Debug, Clone, Default)]
pub struct LedgerTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    /// Absolute 0-based sheet row holding the headers.
    pub header_row: u32,
}

impl LedgerTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { headers, rows, header_row: 0 }
    }

    pub fn width(&self) -> usize { self.headers.len() }

    pub fn len(&self) -> usize { self.rows.len() }

    pub fn is_empty(&self) -> bool { self.rows.is_empty() }

    /// Cell at `row`/`col`; short rows read as empty.
    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        const EMPTY: &Cell = &Cell::Empty;
        self.rows.get(row).and_then(|r| r.get(col)).unwrap_or(EMPTY)
    }
}

fn normalize_header(h: &str) -> String { h.trim().to_string() }

fn xlsx_to_cell<T: calamine::DataType>(cell: &T) -> Cell {
    // Only render dates for cells flagged as datetime, never plain amounts.
    if cell.is_datetime() || cell.is_datetime_iso() {
        if let Some(dt) = cell.as_date() { return Cell::Text(dt.format("%Y-%m-%d").to_string()); }
    }
    if cell.is_string() {
        if let Some(s) = cell.get_string() { return Cell::from(s); }
    }
    if cell.is_int() {
        if let Some(i) = cell.get_int() { return Cell::Number(i as f64); }
    }
    if cell.is_float() {
        if let Some(f) = cell.get_float() { return Cell::Number(f); }
    }
    if let Some(b) = cell.get_bool() { return Cell::Text(b.to_string()); }
    Cell::Empty
}

fn load_excel(path: &Path, sheet_name: Option<&str>) -> Result<LedgerTable> {
    let mut wb = open_workbook_auto(path).with_context(|| format!("打开 Excel 失败: {}", path.display()))?;
    let sheet_names = wb.sheet_names().to_owned();
    let name = match sheet_name {
        Some(n) => sheet_names
            .iter()
            .find(|s| s.as_str() == n)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("工作表不存在: {n}"))?,
        None => sheet_names
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Excel 无可读工作表"))?,
    };
    let range = wb
        .worksheet_range(&name)
        .with_context(|| format!("读取工作表失败: {name}"))?;

    let (Some((first_row, _)), Some((last_row, last_col))) = (range.start(), range.end()) else {
        anyhow::bail!("工作表为空: {name}");
    };

    // Absolute addressing: column 0 is sheet column A even when the used
    // range starts further right.
    let width = last_col as usize + 1;
    let read_row = |r: u32| -> Vec<Cell> {
        (0..=last_col)
            .map(|c| range.get_value((r, c)).map(xlsx_to_cell).unwrap_or(Cell::Empty))
            .collect()
    };

    let headers: Vec<String> = read_row(first_row)
        .iter()
        .map(|c| normalize_header(&c.to_text()))
        .collect();

    // Empty rows are kept so results line up with their sheet rows.
    let rows: Vec<Vec<Cell>> = (first_row + 1..=last_row).map(read_row).collect();
    log::debug!("{}: 工作表 {name}, {} 列, {} 行", path.display(), width, rows.len());
    Ok(LedgerTable { headers, rows, header_row: first_row })
}

fn load_csv(path: &Path) -> Result<LedgerTable> {
    let file = File::open(path).with_context(|| format!("打开 CSV 失败: {}", path.display()))?;
    let mut rdr = ReaderBuilder::new().flexible(true).has_headers(true).from_reader(file);
    let headers = rdr.headers()?.iter().map(normalize_header).collect::<Vec<_>>();
    let mut rows: Vec<Vec<Cell>> = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        let mut row: Vec<Cell> = rec.iter().map(|v| Cell::from(v.trim())).collect();
        row.resize(headers.len().max(row.len()), Cell::Empty);
        rows.push(row);
    }
    Ok(LedgerTable { headers, rows, header_row: 0 })
}

pub fn is_csv(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
}

/// Load one sheet of a ledger file. `sheet_name` is ignored for CSV.
pub fn load_ledger(path: &Path, sheet_name: Option<&str>) -> Result<LedgerTable> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "xlsx" | "xlsm" | "xls" => load_excel(path, sheet_name),
        "csv" => load_csv(path),
        _ => {
            if path.is_file() {
                // Try Excel first
                load_excel(path, sheet_name).or_else(|_| load_csv(path))
            } else {
                Err(anyhow::anyhow!("不支持的文件类型: {}", path.display()))
            }
        }
    }
}

pub fn parse_amount(s: &str) -> f64 {
    let mut t = s.trim().replace(',', "");
    let has_paren = (t.starts_with('(') && t.ends_with(')'))
        || (t.starts_with('（') && t.ends_with('）'));
    if has_paren {
        t = t
            .trim_matches(|c: char| c == '(' || c == ')' || c == '（' || c == '）')
            .to_string();
    }
    t = t
        .trim_start_matches(|c: char| c == '¥' || c == '￥' || c == '$')
        .to_string();
    let v = t.trim().parse::<f64>().unwrap_or(0.0);
    if !v.is_finite() { return 0.0; }
    if has_paren { -v } else { v }
}
