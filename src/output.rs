use crate::journal::{is_csv, Cell, LedgerTable};
use crate::package::{self, ColumnEdit};
use anyhow::{bail, Context, Result};
use calamine::{open_workbook_auto, Data, Dimensions, Reader, SheetVisible, Sheets};
use rust_xlsxwriter::{Format, FormatAlign, Workbook, Worksheet};
use std::{
    ffi::OsStr,
    io::{Read, Seek},
    path::{Path, PathBuf},
};

/// Header written above the result column.
pub const RESULT_HEADER: &str = "对方科目";

/// Marker appended to the file stem of derived outputs.
pub const OUTPUT_SUFFIX: &str = "_处理后";

const MAX_COLS: usize = 16_384;
const MAX_CELL_CHARS: usize = 32_767;

fn truncate_chars(s: &str, max_chars: usize) -> String { s.chars().take(max_chars).collect() }

fn truncate_to_bytes(s: &str, max_bytes: usize) -> String {
    let mut out = String::new();
    let mut used = 0usize;
    for ch in s.chars() {
        let b = ch.len_utf8();
        if used + b > max_bytes { break; }
        out.push(ch);
        used += b;
    }
    out
}

// Excel 单元格字符串上限 32767 个字符；再保证字节安全
fn cell_safe(s: &str) -> String {
    let mut safe = truncate_chars(s, MAX_CELL_CHARS);
    if safe.len() > MAX_CELL_CHARS { safe = truncate_to_bytes(&safe, MAX_CELL_CHARS); }
    safe
}

/// `<dir>/<stem>_处理后<ext>`. Legacy `.xls` (and anything that is not
/// `.xlsx`/`.xlsm`/`.csv`) becomes `.xlsx`.
pub fn output_path_for(input: &Path, save_dir: Option<&Path>) -> PathBuf {
    let dir = save_dir
        .map(Path::to_path_buf)
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let stem = input.file_stem().and_then(OsStr::to_str).unwrap_or("output");
    let ext = input
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let ext = match ext.as_str() {
        "xlsx" | "xlsm" | "csv" => ext.as_str(),
        _ => "xlsx",
    };
    dir.join(format!("{stem}{OUTPUT_SUFFIX}.{ext}"))
}

/// [`output_path_for`] with the extension settled by content: an xlsx/xlsm
/// package is written as `.xlsm` exactly when it carries a VBA project, so
/// the extension always matches the workbook's content type.
pub fn output_path(input: &Path, save_dir: Option<&Path>) -> Result<PathBuf> {
    let path = output_path_for(input, save_dir);
    if is_csv(input) || !package::is_package(input) {
        return Ok(path);
    }
    let ext = if package::has_vba_project(input)? { "xlsm" } else { "xlsx" };
    Ok(path.with_extension(ext))
}

fn is_xlsm(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|e| e.eq_ignore_ascii_case("xlsm"))
}

/// Write `results` into a copy of `src` at 0-based column `target`.
///
/// Results go beside the table's data rows, the header on the table's header row.
pub fn write_output(
    src: &Path,
    dst: &Path,
    sheet_name: Option<&str>,
    table: &LedgerTable,
    target: usize,
    results: &[String],
) -> Result<()> {
    if results.len() != table.len() {
        bail!("结果行数 {} 与数据行数 {} 不一致", results.len(), table.len());
    }
    if target >= MAX_COLS {
        bail!("目标列超出 Excel 最大列数: {}", target + 1);
    }
    if is_csv(src) {
        write_csv(dst, table, target, results)
    } else if package::is_package(src) {
        let values: Vec<String> = results.iter().map(|s| cell_safe(s)).collect();
        let edit = ColumnEdit {
            sheet: sheet_name,
            col: target as u32,
            header_row: table.header_row,
            header: RESULT_HEADER,
            values: &values,
        };
        package::write_column(src, dst, &edit, is_xlsm(dst))
    } else {
        rebuild_workbook(src, dst, sheet_name, table.header_row, target, results)
    }
}

fn write_csv(dst: &Path, table: &LedgerTable, target: usize, results: &[String]) -> Result<()> {
    let mut w = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(dst)
        .with_context(|| format!("创建 CSV 失败: {}", dst.display()))?;
    let width = table.width().max(target + 1);

    let mut header = table.headers.clone();
    header.resize(width, String::new());
    header[target] = RESULT_HEADER.to_string();
    w.write_record(&header)?;

    for (row, result) in table.rows.iter().zip(results) {
        let mut rec: Vec<String> = row.iter().map(Cell::to_text).collect();
        rec.resize(width.max(rec.len()), String::new());
        rec[target] = result.clone();
        w.write_record(&rec)?;
    }
    w.flush()?;
    Ok(())
}

struct Formats {
    header: Format,
    merged: Format,
    date: Format,
    datetime: Format,
}

impl Formats {
    fn new() -> Self {
        Self {
            header: Format::new()
                .set_bold()
                .set_align(FormatAlign::Center)
                .set_align(FormatAlign::VerticalCenter),
            merged: Format::new(),
            date: Format::new().set_num_format("yyyy-mm-dd"),
            datetime: Format::new().set_num_format("yyyy-mm-dd hh:mm:ss"),
        }
    }
}

/// Legacy `.xls` has no package to edit, so the workbook is rebuilt from what
/// calamine reads: values, formulas, dates, error cells, merged ranges and
/// sheet visibility. Cell styles and VBA stay behind.
fn rebuild_workbook(
    src: &Path,
    dst: &Path,
    sheet_name: Option<&str>,
    header_row: u32,
    target: usize,
    results: &[String],
) -> Result<()> {
    let mut source = open_workbook_auto(src).with_context(|| format!("打开 Excel 失败: {}", src.display()))?;
    let mut wb = rebuild(&mut source, sheet_name, header_row, target, results)?;
    let mut tmp = package::temp_beside(dst)?;
    wb.save_to_writer(&mut tmp)
        .with_context(|| format!("保存 Excel 失败: {}", dst.display()))?;
    tmp.persist(dst)
        .map_err(|e| e.error)
        .with_context(|| format!("保存 Excel 失败: {}", dst.display()))?;
    Ok(())
}

fn rebuild<RS: Read + Seek>(
    source: &mut Sheets<RS>,
    sheet_name: Option<&str>,
    header_row: u32,
    target: usize,
    results: &[String],
) -> Result<Workbook> {
    let sheet_names = source.sheet_names().to_owned();
    let target_sheet = match sheet_name {
        Some(n) => n.to_string(),
        None => sheet_names
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Excel 无可读工作表"))?,
    };
    if !sheet_names.contains(&target_sheet) {
        bail!("工作表不存在: {target_sheet}");
    }
    let hidden: Vec<(String, SheetVisible)> = source
        .sheets_metadata()
        .iter()
        .filter(|s| s.visible != SheetVisible::Visible)
        .map(|s| (s.name.clone(), s.visible))
        .collect();

    let mut wb = Workbook::new();
    let formats = Formats::new();
    let col = target as u16;
    for name in &sheet_names {
        let merges = merged_ranges(source, name);
        let ws = wb.add_worksheet();
        ws.set_name(name)?;
        copy_sheet(source, name, &merges, ws, &formats)?;
        match hidden.iter().find(|(n, _)| n == name).map(|(_, v)| *v) {
            Some(SheetVisible::VeryHidden) => { ws.set_very_hidden(true); }
            Some(SheetVisible::Hidden) => { ws.set_hidden(true); }
            _ => {}
        }
        if *name == target_sheet {
            ws.write_string_with_format(header_row, col, RESULT_HEADER, &formats.header)?;
            for (i, value) in results.iter().enumerate() {
                let row = header_row + 1 + i as u32;
                ws.write_string(row, col, cell_safe(value))?;
            }
        }
    }
    Ok(wb)
}

fn merged_ranges<RS: Read + Seek>(source: &mut Sheets<RS>, name: &str) -> Vec<Dimensions> {
    match source {
        Sheets::Xls(xls) => xls.worksheet_merge_cells(name).unwrap_or_default(),
        Sheets::Xlsx(xlsx) => xlsx
            .worksheet_merge_cells(name)
            .and_then(|r| r.ok())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn copy_sheet<RS: Read + Seek>(
    source: &mut Sheets<RS>,
    name: &str,
    merges: &[Dimensions],
    ws: &mut Worksheet,
    formats: &Formats,
) -> Result<()> {
    // Merge first; values written afterwards land in the top-left cells.
    for m in merges.iter().filter(|m| m.start != m.end) {
        ws.merge_range(m.start.0, m.start.1 as u16, m.end.0, m.end.1 as u16, "", &formats.merged)?;
    }

    let range = source
        .worksheet_range(name)
        .with_context(|| format!("读取工作表失败: {name}"))?;
    if let Some((r0, c0)) = range.start() {
        for (r, c, cell) in range.used_cells() {
            let row = r0 + r as u32;
            let col = (c0 as usize + c) as u16;
            match cell {
                Data::Int(i) => { ws.write_number(row, col, *i as f64)?; }
                Data::Float(f) => { ws.write_number(row, col, *f)?; }
                Data::String(s) => { ws.write_string(row, col, cell_safe(s))?; }
                Data::Bool(b) => { ws.write_boolean(row, col, *b)?; }
                Data::DateTime(dt) => {
                    let serial = dt.as_f64();
                    let fmt = if serial.fract() == 0.0 { &formats.date } else { &formats.datetime };
                    ws.write_number_with_format(row, col, serial, fmt)?;
                }
                Data::DateTimeIso(s) | Data::DurationIso(s) => { ws.write_string(row, col, s)?; }
                // #DIV/0!, #N/A ... as their display text
                Data::Error(e) => { ws.write_string(row, col, e.to_string())?; }
                Data::Empty => {}
            }
        }
    }

    // Formulas replace the cached values written above.
    match source.worksheet_formula(name) {
        Ok(formulas) => {
            if let Some((r0, c0)) = formulas.start() {
                for (r, c, formula) in formulas.used_cells() {
                    if formula.is_empty() { continue; }
                    ws.write_formula(r0 + r as u32, (c0 as usize + c) as u16, formula.as_str())?;
                }
            }
        }
        Err(e) => log::debug!("工作表 {name} 公式读取跳过: {e}"),
    }
    Ok(())
}
