//! In-place edits of an xlsx/xlsm package. One worksheet gains a column of
//! inline-string cells; every other part is copied through byte for byte,
//! so styles, merged ranges, column widths, sheet state and macros survive.

use crate::column::{excel_column_to_num, num_to_excel_column};
use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::{
    collections::{btree_map, BTreeMap, HashMap},
    fs::File,
    io::{Read, Seek, Write},
    iter::Peekable,
    path::Path,
};
use tempfile::NamedTempFile;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

pub const VBA_PART: &str = "xl/vbaProject.bin";
const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS: &str = "xl/_rels/workbook.xml.rels";
const STYLES_PART: &str = "xl/styles.xml";
const CONTENT_TYPES: &str = "[Content_Types].xml";
const CALC_CHAIN: &str = "xl/calcChain.xml";

const MAIN_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml";
const MAIN_XLSM: &str = "application/vnd.ms-excel.sheet.macroEnabled.main+xml";

/// A column of text cells to place on one worksheet.
#[derive(Debug, Clone)]
pub struct ColumnEdit<'a> {
    /// Sheet by name; the workbook's first sheet when `None`.
    pub sheet: Option<&'a str>,
    /// 0-based column.
    pub col: u32,
    /// 0-based row of `header`; `values` start on the row below.
    pub header_row: u32,
    pub header: &'a str,
    pub values: &'a [String],
}

/// True when `path` starts with a zip local-file signature.
pub fn is_package(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .is_ok_and(|_| magic == *b"PK\x03\x04")
}

pub fn has_vba_project(path: &Path) -> Result<bool> {
    let file = File::open(path).with_context(|| format!("打开文件失败: {}", path.display()))?;
    let archive = ZipArchive::new(file).with_context(|| format!("读取压缩包失败: {}", path.display()))?;
    Ok(archive.index_for_name(VBA_PART).is_some())
}

fn read_part<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<String> {
    let mut part = archive
        .by_name(name)
        .with_context(|| format!("压缩包中缺少 {name}"))?;
    let mut content = String::new();
    part.read_to_string(&mut content)
        .with_context(|| format!("读取 {name} 失败"))?;
    Ok(content)
}

fn attr(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

/// Copy of `e` without the attributes named in `skip`.
fn strip_attrs(e: &BytesStart, skip: &[&[u8]]) -> BytesStart<'static> {
    let mut out = BytesStart::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for a in e.attributes().flatten() {
        if !skip.contains(&a.key.as_ref()) {
            out.push_attribute(a);
        }
    }
    out
}

fn local(name: &[u8]) -> String {
    let name = String::from_utf8_lossy(name);
    match name.split_once(':') {
        Some((_, l)) => l.to_string(),
        None => name.into_owned(),
    }
}

/// Namespace prefix of a qualified name, colon included.
fn prefix(name: &[u8]) -> String {
    let name = String::from_utf8_lossy(name);
    name.split_once(':').map(|(p, _)| format!("{p}:")).unwrap_or_default()
}

/// `F12` -> (11, 5), both 0-based.
fn parse_cell_ref(r: &str) -> Option<(u32, u32)> {
    let split = r.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = r.split_at(split);
    let col = excel_column_to_num(&letters.replace('$', ""))?;
    let row: u32 = digits.parse().ok()?;
    Some((row.checked_sub(1)?, u32::try_from(col - 1).ok()?))
}

fn cell_ref(row: u32, col: u32) -> String {
    format!("{}{}", num_to_excel_column(col as usize + 1).unwrap_or_default(), row + 1)
}

/// Zip path of a worksheet, found through workbook.xml and its rels.
fn worksheet_part(workbook_xml: &str, rels_xml: &str, sheet: Option<&str>) -> Result<String> {
    let mut reader = Reader::from_str(workbook_xml);
    let mut rid = None;
    loop {
        match reader.read_event()? {
            Event::Empty(e) | Event::Start(e) if e.local_name().as_ref() == b"sheet" => {
                let name = e
                    .attributes()
                    .flatten()
                    .find(|a| a.key.as_ref() == b"name")
                    .and_then(|a| a.decode_and_unescape_value(reader.decoder()).ok().map(|v| v.into_owned()));
                if sheet.is_none() || name.as_deref() == sheet {
                    rid = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.local_name().as_ref() == b"id")
                        .map(|a| String::from_utf8_lossy(&a.value).into_owned());
                    break;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    let rid = rid.ok_or_else(|| anyhow!("工作表不存在: {}", sheet.unwrap_or("<第一个>")))?;

    let mut reader = Reader::from_str(rels_xml);
    loop {
        match reader.read_event()? {
            Event::Empty(e) | Event::Start(e) if e.local_name().as_ref() == b"Relationship" => {
                if attr(&e, b"Id").as_deref() == Some(rid.as_str()) {
                    let target = attr(&e, b"Target").ok_or_else(|| anyhow!("关系 {rid} 缺少 Target"))?;
                    return Ok(match target.strip_prefix('/') {
                        Some(abs) => abs.to_string(),
                        None => format!("xl/{target}"),
                    });
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    bail!("工作簿关系中找不到 {rid}")
}

fn count_plus_one(e: &BytesStart) -> BytesStart<'static> {
    let mut tag = strip_attrs(e, &[b"count"]);
    if let Some(n) = attr(e, b"count").and_then(|c| c.parse::<u32>().ok()) {
        tag.push_attribute(("count", (n + 1).to_string().as_str()));
    }
    tag
}

/// Append a bold font and a bold, centered `cellXfs` entry to styles.xml.
///
/// Returns the new stylesheet and the index of the added format. The bold
/// font copies the stylesheet's default font. When there is no `fonts` or
/// `cellXfs` list to extend, the stylesheet comes back unchanged with `None`.
fn add_header_style(xml: &str) -> Result<(Vec<u8>, Option<u32>)> {
    let mut reader = Reader::from_str(xml);
    let mut w = Writer::new(Vec::with_capacity(xml.len() + 256));

    let mut open: Vec<String> = Vec::new();
    let mut font_count = 0u32;
    let mut xf_count = 0u32;
    let mut default_font: Option<Vec<Event<'static>>> = None;
    // Depth of the default <font> while its children are being copied.
    let mut copying: Option<usize> = None;
    let mut bold_font = None;
    let mut header_xf = None;

    loop {
        let event = reader.read_event()?;
        match &event {
            Event::Start(e) | Event::Empty(e) => {
                let closed = matches!(event, Event::Empty(_));
                let name = local(e.name().as_ref());
                let parent = open.last().map(String::as_str);
                if copying.is_some() {
                    if let Some(buf) = default_font.as_mut() {
                        buf.push(event.clone().into_owned());
                    }
                } else if parent == Some("fonts") && name == "font" {
                    font_count += 1;
                    if default_font.is_none() {
                        default_font = Some(Vec::new());
                        if !closed {
                            copying = Some(open.len() + 1);
                        }
                    }
                } else if parent == Some("cellXfs") && name == "xf" {
                    xf_count += 1;
                }

                if !closed && matches!(name.as_str(), "fonts" | "cellXfs") {
                    w.write_event(Event::Start(count_plus_one(e)))?;
                } else {
                    w.write_event(event.borrow())?;
                }
                if !closed {
                    open.push(name);
                }
            }
            Event::End(e) => {
                let name = open.pop().unwrap_or_default();
                if let Some(depth) = copying {
                    if open.len() + 1 == depth {
                        copying = None;
                    } else if let Some(buf) = default_font.as_mut() {
                        buf.push(event.clone().into_owned());
                    }
                }
                let p = prefix(e.name().as_ref());
                if name == "fonts" {
                    let font = format!("{p}font");
                    w.write_event(Event::Start(BytesStart::new(font.as_str())))?;
                    w.write_event(Event::Empty(BytesStart::new(format!("{p}b"))))?;
                    for ev in default_font.iter().flatten() {
                        let is_bold = match ev {
                            Event::Start(s) | Event::Empty(s) => s.local_name().as_ref() == b"b",
                            Event::End(s) => s.local_name().as_ref() == b"b",
                            _ => false,
                        };
                        if !is_bold {
                            w.write_event(ev.borrow())?;
                        }
                    }
                    w.write_event(Event::End(BytesEnd::new(font)))?;
                    bold_font = Some(font_count);
                }
                if name == "cellXfs" {
                    if let Some(font_id) = bold_font {
                        let font_id = font_id.to_string();
                        let mut xf = BytesStart::new(format!("{p}xf"));
                        xf.push_attribute(("numFmtId", "0"));
                        xf.push_attribute(("fontId", font_id.as_str()));
                        xf.push_attribute(("fillId", "0"));
                        xf.push_attribute(("borderId", "0"));
                        xf.push_attribute(("xfId", "0"));
                        xf.push_attribute(("applyFont", "1"));
                        xf.push_attribute(("applyAlignment", "1"));
                        w.write_event(Event::Start(xf))?;
                        let mut align = BytesStart::new(format!("{p}alignment"));
                        align.push_attribute(("horizontal", "center"));
                        align.push_attribute(("vertical", "center"));
                        w.write_event(Event::Empty(align))?;
                        w.write_event(Event::End(BytesEnd::new(format!("{p}xf"))))?;
                        header_xf = Some(xf_count);
                    }
                }
                w.write_event(event.borrow())?;
            }
            Event::Eof => break,
            _ => {
                if copying.is_some() {
                    if let Some(buf) = default_font.as_mut() {
                        buf.push(event.clone().into_owned());
                    }
                }
                w.write_event(event.borrow())?;
            }
        }
    }

    match header_xf {
        Some(ix) => Ok((w.into_inner(), Some(ix))),
        None => Ok((xml.as_bytes().to_vec(), None)),
    }
}

/// The workbook's main content type follows `macro_enabled` so it always
/// agrees with the output extension. The calc chain override is dropped.
fn rewrite_content_types(xml: &str, macro_enabled: bool) -> Result<Vec<u8>> {
    let main = if macro_enabled { MAIN_XLSM } else { MAIN_XLSX };
    let calc_chain = format!("/{CALC_CHAIN}");
    let workbook = format!("/{WORKBOOK_PART}");
    let mut reader = Reader::from_str(xml);
    let mut w = Writer::new(Vec::with_capacity(xml.len()));
    loop {
        match reader.read_event()? {
            Event::Empty(e) if e.local_name().as_ref() == b"Override" => {
                let part = attr(&e, b"PartName").unwrap_or_default();
                if part == calc_chain {
                    continue;
                }
                if part == workbook {
                    let mut tag = strip_attrs(&e, &[b"ContentType"]);
                    tag.push_attribute(("ContentType", main));
                    w.write_event(Event::Empty(tag))?;
                } else {
                    w.write_event(Event::Empty(e))?;
                }
            }
            Event::Eof => break,
            event => w.write_event(event)?,
        }
    }
    Ok(w.into_inner())
}

/// Excel rebuilds the calc chain on load; a stale one makes it repair the file.
fn drop_calc_chain_rel(xml: &str) -> Result<Vec<u8>> {
    let mut reader = Reader::from_str(xml);
    let mut w = Writer::new(Vec::with_capacity(xml.len()));
    loop {
        match reader.read_event()? {
            Event::Empty(e)
                if e.local_name().as_ref() == b"Relationship"
                    && attr(&e, b"Target").is_some_and(|t| t.ends_with("calcChain.xml")) => {}
            Event::Eof => break,
            event => w.write_event(event)?,
        }
    }
    Ok(w.into_inner())
}

fn has_element(xml: &str, name: &[u8]) -> Result<bool> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == name => return Ok(true),
            Event::Eof => return Ok(false),
            _ => {}
        }
    }
}

/// Grow a `<dimension ref>` to cover rows `first..=last` of column `col`.
fn widen_dimension(current: &str, first: u32, last: u32, col: u32) -> String {
    let (mut r0, mut c0, mut r1, mut c1) = (first, col, last, col);
    let mut corners = current.split(':').filter_map(parse_cell_ref);
    if let Some(a) = corners.next() {
        let b = corners.next().unwrap_or(a);
        r0 = r0.min(a.0).min(b.0);
        c0 = c0.min(a.1).min(b.1);
        r1 = r1.max(a.0).max(b.0);
        c1 = c1.max(a.1).max(b.1);
    }
    format!("{}:{}", cell_ref(r0, c0), cell_ref(r1, c1))
}

#[derive(Debug)]
struct NewCell {
    text: String,
    /// Style index to force; otherwise the replaced cell's style is kept.
    style: Option<String>,
}

impl NewCell {
    fn is_blank(&self) -> bool { self.text.is_empty() && self.style.is_none() }
}

struct RowState {
    r: u32,
    cell: Option<NewCell>,
    /// Whether this row carries an edit at all.
    edited: bool,
    last_col: Option<u32>,
}

struct SheetPatcher {
    w: Writer<Vec<u8>>,
    prefix: String,
    col: u32,
    pending: Peekable<btree_map::IntoIter<u32, NewCell>>,
    rows: (u32, u32),
    unhide: bool,
    in_data: bool,
    seen_data: bool,
    row: Option<RowState>,
    last_row: u32,
    /// Depth of a subtree being dropped.
    skip: usize,
}

impl SheetPatcher {
    fn emit(&mut self, e: BytesStart<'_>, closed: bool) -> Result<()> {
        self.w.write_event(if closed { Event::Empty(e) } else { Event::Start(e) })?;
        Ok(())
    }

    fn end(&mut self, name: &str) -> Result<()> {
        self.w.write_event(Event::End(BytesEnd::new(format!("{}{name}", self.prefix))))?;
        Ok(())
    }

    fn cell(&mut self, row1: u32, cell: &NewCell, inherited: Option<String>) -> Result<()> {
        let style = cell.style.clone().or(inherited);
        if cell.text.is_empty() && style.is_none() {
            return Ok(());
        }
        let mut c = BytesStart::new(format!("{}c", self.prefix));
        c.push_attribute(("r", cell_ref(row1 - 1, self.col).as_str()));
        if let Some(s) = &style {
            c.push_attribute(("s", s.as_str()));
        }
        if cell.text.is_empty() {
            return self.emit(c, true);
        }
        c.push_attribute(("t", "inlineStr"));
        self.emit(c, false)?;
        self.emit(BytesStart::new(format!("{}is", self.prefix)), false)?;
        let mut t = BytesStart::new(format!("{}t", self.prefix));
        t.push_attribute(("xml:space", "preserve"));
        self.emit(t, false)?;
        self.w.write_event(Event::Text(BytesText::new(&cell.text)))?;
        self.end("t")?;
        self.end("is")?;
        self.end("c")
    }

    /// New rows for every pending cell above row `limit` (1-based), or all
    /// of them.
    fn flush_rows(&mut self, limit: Option<u32>) -> Result<()> {
        while let Some((r, cell)) = self.pending.next_if(|(r, _)| limit.is_none_or(|l| *r < l)) {
            if cell.is_blank() {
                continue;
            }
            let mut tag = BytesStart::new(format!("{}row", self.prefix));
            tag.push_attribute(("r", r.to_string().as_str()));
            self.emit(tag, false)?;
            self.cell(r, &cell, None)?;
            self.end("row")?;
        }
        Ok(())
    }

    fn open(&mut self, e: BytesStart<'_>, closed: bool) -> Result<()> {
        match local(e.name().as_ref()).as_str() {
            "sheetData" => {
                self.seen_data = true;
                self.prefix = prefix(e.name().as_ref());
                self.emit(e, false)?;
                self.in_data = true;
                if closed {
                    self.flush_rows(None)?;
                    self.end("sheetData")?;
                    self.in_data = false;
                }
                Ok(())
            }
            "autoFilter" if !self.in_data => {
                if !closed {
                    self.skip = 1;
                }
                Ok(())
            }
            "dimension" if closed => {
                let current = attr(&e, b"ref").unwrap_or_default();
                let mut tag = strip_attrs(&e, &[b"ref"]);
                let (first, last) = self.rows;
                tag.push_attribute(("ref", widen_dimension(&current, first, last, self.col).as_str()));
                self.emit(tag, true)
            }
            "row" if self.in_data && self.row.is_none() => self.open_row(e, closed),
            "c" if self.row.is_some() => self.open_cell(e, closed),
            _ => self.emit(e, closed),
        }
    }

    fn open_row(&mut self, e: BytesStart<'_>, closed: bool) -> Result<()> {
        let r = attr(&e, b"r").and_then(|v| v.parse().ok()).unwrap_or(self.last_row + 1);
        self.last_row = r;
        self.flush_rows(Some(r))?;
        let cell = self.pending.next_if(|(k, _)| *k == r).map(|(_, c)| c);

        let mut skip: Vec<&[u8]> = Vec::new();
        if cell.is_some() {
            skip.push(b"spans");
        }
        if self.unhide {
            skip.push(b"hidden");
        }
        let tag = strip_attrs(&e, &skip);
        match (closed, cell) {
            (true, Some(c)) if !c.is_blank() => {
                self.emit(tag, false)?;
                self.cell(r, &c, None)?;
                self.end("row")
            }
            (true, _) => self.emit(tag, true),
            (false, cell) => {
                self.emit(tag, false)?;
                let edited = cell.is_some();
                self.row = Some(RowState { r, cell, edited, last_col: None });
                Ok(())
            }
        }
    }

    fn open_cell(&mut self, e: BytesStart<'_>, closed: bool) -> Result<()> {
        let target = self.col;
        let Some(state) = self.row.as_mut() else {
            return self.emit(e, closed);
        };
        let c = attr(&e, b"r")
            .and_then(|v| parse_cell_ref(&v))
            .map(|(_, c)| c)
            .unwrap_or_else(|| state.last_col.map_or(0, |l| l + 1));
        state.last_col = Some(c);
        let (r, edited) = (state.r, state.edited);
        let new = if c >= target { state.cell.take() } else { None };

        if edited && c == target {
            if let Some(new) = new {
                self.cell(r, &new, attr(&e, b"s"))?;
            }
            if !closed {
                self.skip = 1;
            }
            return Ok(());
        }
        if let Some(new) = new {
            self.cell(r, &new, None)?;
        }
        self.emit(e, closed)
    }

    fn close(&mut self, e: BytesEnd<'_>) -> Result<()> {
        match local(e.name().as_ref()).as_str() {
            "row" if self.row.is_some() => {
                if let Some(RowState { r, cell: Some(new), .. }) = self.row.take() {
                    self.cell(r, &new, None)?;
                }
            }
            "sheetData" if self.in_data => {
                self.flush_rows(None)?;
                self.in_data = false;
            }
            _ => {}
        }
        self.w.write_event(Event::End(e))?;
        Ok(())
    }
}

/// Place `cells` (keyed by 1-based row) in 0-based column `col` of a
/// worksheet.
///
/// A cell already in that column on an edited row is replaced and keeps its
/// style. Rows keep their order. A sheet-level auto-filter is removed and the
/// rows it hid are shown again.
fn patch_sheet_xml(xml: &str, col: u32, cells: BTreeMap<u32, NewCell>) -> Result<Vec<u8>> {
    let rows = match (cells.keys().next(), cells.keys().next_back()) {
        (Some(a), Some(b)) => (a - 1, b - 1),
        _ => return Ok(xml.as_bytes().to_vec()),
    };
    let unhide = has_element(xml, b"autoFilter")?;
    let mut p = SheetPatcher {
        w: Writer::new(Vec::with_capacity(xml.len() + 64 * cells.len())),
        prefix: String::new(),
        col,
        pending: cells.into_iter().peekable(),
        rows,
        unhide,
        in_data: false,
        seen_data: false,
        row: None,
        last_row: 0,
        skip: 0,
    };

    let mut reader = Reader::from_str(xml);
    loop {
        let event = reader.read_event()?;
        if p.skip > 0 {
            match event {
                Event::Start(_) => p.skip += 1,
                Event::End(_) => p.skip -= 1,
                Event::Eof => break,
                _ => {}
            }
            continue;
        }
        match event {
            Event::Start(e) => p.open(e, false)?,
            Event::Empty(e) => p.open(e, true)?,
            Event::End(e) => p.close(e)?,
            Event::Eof => break,
            other => p.w.write_event(other)?,
        }
    }
    if !p.seen_data {
        bail!("工作表缺少 sheetData");
    }
    Ok(p.w.into_inner())
}

/// Temp file in `dst`'s directory, so the final rename stays on one filesystem.
pub(crate) fn temp_beside(dst: &Path) -> Result<NamedTempFile> {
    let dir = dst
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    NamedTempFile::new_in(dir).with_context(|| format!("创建临时文件失败: {}", dir.display()))
}

/// Copy the package at `src` to `dst` with `edit` applied.
///
/// The target worksheet, styles.xml, the content types and the workbook rels
/// are rewritten; the calc chain is left out; everything else is copied raw.
/// The output is staged in a temp file beside `dst` and renamed into place.
pub fn write_column(src: &Path, dst: &Path, edit: &ColumnEdit<'_>, macro_enabled: bool) -> Result<()> {
    let file = File::open(src).with_context(|| format!("打开 Excel 失败: {}", src.display()))?;
    let mut archive = ZipArchive::new(file).with_context(|| format!("读取 Excel 压缩包失败: {}", src.display()))?;

    let workbook_xml = read_part(&mut archive, WORKBOOK_PART)?;
    let rels_xml = read_part(&mut archive, WORKBOOK_RELS)?;
    let sheet_part = worksheet_part(&workbook_xml, &rels_xml, edit.sheet)?;

    let mut replaced: HashMap<String, Vec<u8>> = HashMap::new();
    let header_style = if archive.index_for_name(STYLES_PART).is_some() {
        let (styles, ix) = add_header_style(&read_part(&mut archive, STYLES_PART)?)?;
        replaced.insert(STYLES_PART.to_string(), styles);
        ix
    } else {
        None
    };

    let mut cells = BTreeMap::new();
    cells.insert(
        edit.header_row + 1,
        NewCell { text: edit.header.to_string(), style: header_style.map(|s| s.to_string()) },
    );
    for (i, value) in edit.values.iter().enumerate() {
        cells.insert(edit.header_row + 2 + i as u32, NewCell { text: value.clone(), style: None });
    }
    let sheet_xml = read_part(&mut archive, &sheet_part)?;
    replaced.insert(sheet_part.clone(), patch_sheet_xml(&sheet_xml, edit.col, cells)?);
    replaced.insert(
        CONTENT_TYPES.to_string(),
        rewrite_content_types(&read_part(&mut archive, CONTENT_TYPES)?, macro_enabled)?,
    );
    replaced.insert(WORKBOOK_RELS.to_string(), drop_calc_chain_rel(&rels_xml)?);

    let mut zw = ZipWriter::new(temp_beside(dst)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        let name = entry.name().to_owned();
        if name == CALC_CHAIN {
            continue;
        }
        match replaced.remove(&name) {
            Some(bytes) => {
                zw.start_file(name, options)?;
                zw.write_all(&bytes)?;
            }
            None => zw.raw_copy_file(entry)?,
        }
    }
    let tmp = zw.finish()?;
    tmp.persist(dst)
        .map_err(|e| e.error)
        .with_context(|| format!("保存 Excel 失败: {}", dst.display()))?;
    log::debug!("{}: 已写入 {sheet_part}", dst.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(bytes: Vec<u8>) -> String { String::from_utf8(bytes).unwrap() }

    fn cells(entries: &[(u32, &str)]) -> BTreeMap<u32, NewCell> {
        entries
            .iter()
            .map(|(r, t)| (*r, NewCell { text: t.to_string(), style: None }))
            .collect()
    }

    #[test]
    fn cell_references() {
        assert_eq!(parse_cell_ref("A1"), Some((0, 0)));
        assert_eq!(parse_cell_ref("AB12"), Some((11, 27)));
        assert_eq!(parse_cell_ref("$C$3"), Some((2, 2)));
        assert_eq!(parse_cell_ref("A0"), None);
        assert_eq!(parse_cell_ref("12"), None);
        assert_eq!(cell_ref(11, 27), "AB12");
        assert_eq!(widen_dimension("A1:D6", 0, 5, 5), "A1:F6");
        assert_eq!(widen_dimension("B3", 2, 9, 0), "A3:B10");
        assert_eq!(widen_dimension("", 0, 2, 2), "C1:C3");
    }

    #[test]
    fn sheet_parts_resolve_by_name() {
        let workbook = r#"<workbook xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>
            <sheet name="说明" sheetId="1" r:id="rId1"/>
            <sheet name="R&amp;D" sheetId="2" state="hidden" r:id="rId2"/></sheets></workbook>"#;
        let rels = r#"<Relationships>
            <Relationship Id="rId1" Type="worksheet" Target="worksheets/sheet1.xml"/>
            <Relationship Id="rId2" Type="worksheet" Target="/xl/worksheets/sheet2.xml"/></Relationships>"#;
        assert_eq!(worksheet_part(workbook, rels, None).unwrap(), "xl/worksheets/sheet1.xml");
        assert_eq!(worksheet_part(workbook, rels, Some("R&D")).unwrap(), "xl/worksheets/sheet2.xml");
        let err = worksheet_part(workbook, rels, Some("序时账")).unwrap_err();
        assert!(err.to_string().contains("序时账"));
    }

    #[test]
    fn cells_land_in_column_order() {
        let xml = r#"<worksheet><dimension ref="A1:D3"/><sheetData><row r="1" spans="1:4"><c r="A1" t="s"><v>0</v></c><c r="D1" t="s"><v>1</v></c></row><row r="2"><c r="A2"><v>1</v></c><c r="C2" s="3"><v>9</v></c><c r="D2"><v>5</v></c></row><row r="3"><c r="B3"><v>2</v></c></row></sheetData></worksheet>"#;
        let out = text(patch_sheet_xml(xml, 2, cells(&[(1, "对方科目"), (2, "银行存款"), (3, "")])).unwrap());
        assert!(out.contains(r#"<dimension ref="A1:D3"/>"#));
        // header goes between A1 and D1, the row loses its stale spans
        assert!(out.contains(
            r#"<row r="1"><c r="A1" t="s"><v>0</v></c><c r="C1" t="inlineStr"><is><t xml:space="preserve">对方科目</t></is></c><c r="D1""#
        ));
        // replaced cell keeps its style
        assert!(out.contains(r#"<c r="C2" s="3" t="inlineStr"><is><t xml:space="preserve">银行存款</t></is></c><c r="D2">"#));
        assert!(!out.contains("<v>9</v>"));
        // blank result adds nothing
        assert!(out.contains(r#"<row r="3"><c r="B3"><v>2</v></c></row>"#));
    }

    #[test]
    fn missing_rows_are_created_in_order() {
        let xml = r#"<worksheet><dimension ref="A3:B3"/><sheetData><row r="3"><c r="A3"><v>1</v></c></row></sheetData><mergeCells count="1"><mergeCell ref="A3:B3"/></mergeCells></worksheet>"#;
        let out = text(patch_sheet_xml(xml, 4, cells(&[(2, "对方科目"), (3, "x"), (4, "y&z")])).unwrap());
        assert!(out.contains(r#"<dimension ref="A2:E4"/>"#));
        let r2 = out.find(r#"<row r="2"><c r="E2""#).unwrap();
        let r3 = out.find(r#"<row r="3"><c r="A3"><v>1</v></c><c r="E3""#).unwrap();
        let r4 = out.find(r#"<row r="4"><c r="E4" t="inlineStr"><is><t xml:space="preserve">y&amp;z</t>"#).unwrap();
        assert!(r2 < r3 && r3 < r4);
        assert!(out.contains(r#"<mergeCells count="1"><mergeCell ref="A3:B3"/></mergeCells>"#));
    }

    #[test]
    fn auto_filter_is_cleared() {
        let xml = r#"<worksheet><sheetData><row r="1"><c r="A1"><v>1</v></c></row><row r="2" hidden="1"><c r="A2"><v>2</v></c></row></sheetData><autoFilter ref="A1:A2"><filterColumn colId="0"/></autoFilter></worksheet>"#;
        let out = text(patch_sheet_xml(xml, 1, cells(&[(1, "h")])).unwrap());
        assert!(!out.contains("autoFilter"));
        assert!(!out.contains("hidden"));
        assert!(out.contains(r#"<row r="2"><c r="A2"><v>2</v></c></row>"#));
    }

    #[test]
    fn empty_sheet_data_gets_rows() {
        let xml = r#"<x:worksheet xmlns:x="urn:x"><x:sheetData/></x:worksheet>"#;
        let out = text(patch_sheet_xml(xml, 0, cells(&[(1, "h")])).unwrap());
        assert!(out.contains(r#"<x:sheetData><x:row r="1"><x:c r="A1" t="inlineStr"><x:is><x:t xml:space="preserve">h</x:t></x:is></x:c></x:row></x:sheetData>"#));
        assert!(patch_sheet_xml("<chartsheet/>", 0, cells(&[(1, "h")])).is_err());
    }

    #[test]
    fn header_style_extends_the_stylesheet() {
        let xml = r#"<styleSheet><fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts><cellXfs count="2"><xf numFmtId="0" fontId="0"/><xf numFmtId="4" fontId="0"/></cellXfs><dxfs count="1"><dxf><font><i/></font></dxf></dxfs></styleSheet>"#;
        let (out, ix) = add_header_style(xml).unwrap();
        let out = text(out);
        assert_eq!(ix, Some(2));
        assert!(out.contains(r#"<fonts count="2"><font><sz val="11"/><name val="Calibri"/></font><font><b/><sz val="11"/><name val="Calibri"/></font></fonts>"#));
        assert!(out.contains(r#"<cellXfs count="3">"#));
        assert!(out.contains(r#"<xf numFmtId="0" fontId="1" fillId="0" borderId="0" xfId="0" applyFont="1" applyAlignment="1"><alignment horizontal="center" vertical="center"/></xf></cellXfs>"#));
        assert!(out.contains("<dxf><font><i/></font></dxf>"));

        let (same, none) = add_header_style("<styleSheet/>").unwrap();
        assert_eq!(none, None);
        assert_eq!(text(same), "<styleSheet/>");
    }

    #[test]
    fn content_types_follow_the_extension() {
        let xml = r#"<Types><Default Extension="bin" ContentType="application/vnd.ms-office.vbaProject"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.ms-excel.sheet.macroEnabled.main+xml"/><Override PartName="/xl/calcChain.xml" ContentType="calc"/></Types>"#;
        let plain = text(rewrite_content_types(xml, false).unwrap());
        assert!(plain.contains(MAIN_XLSX));
        assert!(!plain.contains(MAIN_XLSM));
        assert!(!plain.contains("calcChain"));
        let macro_book = text(rewrite_content_types(&plain, true).unwrap());
        assert!(macro_book.contains(MAIN_XLSM));

        let rels = r#"<Relationships><Relationship Id="rId1" Target="worksheets/sheet1.xml"/><Relationship Id="rId9" Target="calcChain.xml"/></Relationships>"#;
        let rels = text(drop_calc_chain_rel(rels).unwrap());
        assert!(rels.contains("rId1") && !rels.contains("rId9"));
    }
}
