//! Forward-only streaming worksheet reader.
//!
//! [`SheetStreamReader`] reads a worksheet's `<sheetData>` row-by-row via
//! `quick_xml::Reader` event parsing, discarding each row immediately after
//! it's emitted: memory is O(maxCellsPerRow), not O(rowCount). Shared
//! strings and styles are bounded parts and are decoded eagerly up front
//! (random access into the shared string table and style-driven datetime
//! detection both need them), reusing [`crate::reader`]'s decoders.

use std::io::{BufRead, BufReader, Cursor, Read, Seek};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use zip::ZipArchive;

use xl_xml::shared_strings::Sst;
use xl_xml::styles::StyleSheet;
use xl_xml::worksheet::InlineString;

use crate::address::{ARef, CellRange};
use crate::cell::CellValue;
use crate::error::ReadError;
use crate::reader::{decode_raw_value, decode_shared_strings, decode_stylesheet, SharedStringItem};
use crate::style::CellStyle;

/// One row emitted by [`SheetStreamReader`]: a 1-based row index and its
/// cells keyed by 1-based column index.
#[derive(Debug, Clone, Default)]
pub struct RowData {
    pub row: u32,
    pub cells: std::collections::BTreeMap<u32, CellValue>,
}

/// Bounds a stream to the rows/columns inside a range; rows entirely
/// outside the bound are skipped, columns outside it are dropped from the
/// emitted row.
#[derive(Debug, Clone, Copy)]
pub struct RangeBound {
    pub min_row: u32,
    pub max_row: u32,
    pub min_col: u32,
    pub max_col: u32,
}

impl From<CellRange> for RangeBound {
    fn from(range: CellRange) -> Self {
        RangeBound {
            min_row: range.start.row.display(),
            max_row: range.end.row.display(),
            min_col: range.start.col.index() + 1,
            max_col: range.end.col.index() + 1,
        }
    }
}

/// Open a streaming reader over `sheet_name`'s worksheet part inside
/// `archive`. Loads `xl/sharedStrings.xml` and `xl/styles.xml` eagerly.
pub fn open_sheet_stream_by_name<'a, R: Read + Seek>(
    archive: &'a mut ZipArchive<R>,
    sheet_name: &str,
    range: Option<RangeBound>,
) -> Result<SheetStreamReader<BufReader<zip::read::ZipFile<'a>>>, ReadError> {
    let part = resolve_sheet_part(archive, SheetSelector::Name(sheet_name))?;
    open_sheet_stream_at(archive, &part, range)
}

/// Like [`open_sheet_stream_by_name`], selecting the sheet by its 0-based
/// position in workbook order instead of by name.
pub fn open_sheet_stream_by_index<'a, R: Read + Seek>(
    archive: &'a mut ZipArchive<R>,
    sheet_index: usize,
    range: Option<RangeBound>,
) -> Result<SheetStreamReader<BufReader<zip::read::ZipFile<'a>>>, ReadError> {
    let part = resolve_sheet_part(archive, SheetSelector::Index(sheet_index))?;
    open_sheet_stream_at(archive, &part, range)
}

enum SheetSelector<'a> {
    Name(&'a str),
    Index(usize),
}

fn resolve_sheet_part<R: Read + Seek>(archive: &mut ZipArchive<R>, selector: SheetSelector<'_>) -> Result<String, ReadError> {
    let workbook_xml: xl_xml::workbook::WorkbookXml = crate::reader::read_xml_part(archive, "xl/workbook.xml")?;
    let workbook_rels: xl_xml::relationships::Relationships =
        crate::reader::read_xml_part(archive, "xl/_rels/workbook.xml.rels")?;

    let entry = match selector {
        SheetSelector::Name(name) => workbook_xml
            .sheets
            .sheets
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ReadError::MissingPart(format!("sheet '{name}'")))?,
        SheetSelector::Index(idx) => workbook_xml
            .sheets
            .sheets
            .get(idx)
            .ok_or_else(|| ReadError::MissingPart(format!("sheet index {idx}")))?,
    };
    let rel = workbook_rels
        .relationships
        .iter()
        .find(|r| r.id == entry.r_id)
        .ok_or_else(|| ReadError::MissingPart(format!("relationship {}", entry.r_id)))?;
    Ok(crate::reader::resolve_relationship_target("xl/workbook.xml", &rel.target))
}

fn open_sheet_stream_at<'a, R: Read + Seek>(
    archive: &'a mut ZipArchive<R>,
    part_path: &str,
    range: Option<RangeBound>,
) -> Result<SheetStreamReader<BufReader<zip::read::ZipFile<'a>>>, ReadError> {
    let shared_strings = read_xml_part_opt::<Sst, R>(archive, "xl/sharedStrings.xml")?
        .map(|sst| decode_shared_strings(&sst))
        .unwrap_or_default();
    let styles = read_xml_part_opt::<StyleSheet, R>(archive, "xl/styles.xml")?
        .map(|s| decode_stylesheet(&s))
        .unwrap_or_default();

    let file = archive
        .by_name(part_path)
        .map_err(|_| ReadError::MissingPart(part_path.to_string()))?;
    Ok(SheetStreamReader::new(BufReader::new(file), shared_strings, styles, range))
}

fn read_xml_part_opt<T: serde::de::DeserializeOwned, R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<T>, ReadError> {
    if archive.by_name(name).is_err() {
        return Ok(None);
    }
    crate::reader::read_xml_part(archive, name).map(Some)
}

/// Forward-only streaming reader for one worksheet's `<sheetData>`.
pub struct SheetStreamReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    shared_strings: Vec<SharedStringItem>,
    styles: Vec<CellStyle>,
    range: Option<RangeBound>,
    done: bool,
}

impl<R: BufRead> SheetStreamReader<R> {
    pub fn new(source: R, shared_strings: Vec<SharedStringItem>, styles: Vec<CellStyle>, range: Option<RangeBound>) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().trim_text(false);
        Self {
            reader,
            buf: Vec::with_capacity(4096),
            shared_strings,
            styles,
            range,
            done: false,
        }
    }

    /// Read the next row, skipping rows outside the configured range bound
    /// and dropping the reader's internal buffer as soon as each row is
    /// emitted. Returns `None` once `<sheetData>` is exhausted.
    pub fn next_row(&mut self) -> Result<Option<RowData>, ReadError> {
        if self.done {
            return Ok(None);
        }

        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf).map_err(xml_err)? {
                Event::Start(e) if local_name_is(&e, b"row") => {
                    let row_num = row_number(&e)?;
                    if let Some(range) = self.range {
                        if row_num < range.min_row {
                            self.skip_row_body()?;
                            continue;
                        }
                        if row_num > range.max_row {
                            self.done = true;
                            return Ok(None);
                        }
                    }
                    return Ok(Some(self.read_row_body(row_num)?));
                }
                Event::Empty(e) if local_name_is(&e, b"row") => {
                    let row_num = row_number(&e)?;
                    if let Some(range) = self.range {
                        if row_num < range.min_row {
                            continue;
                        }
                        if row_num > range.max_row {
                            self.done = true;
                            return Ok(None);
                        }
                    }
                    return Ok(Some(RowData { row: row_num, cells: Default::default() }));
                }
                Event::End(e) if local_name_is(&e, b"sheetData") => {
                    self.done = true;
                    return Ok(None);
                }
                Event::Eof => {
                    self.done = true;
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    fn skip_row_body(&mut self) -> Result<(), ReadError> {
        let mut depth = 1u32;
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf).map_err(xml_err)? {
                Event::Start(e) if local_name_is(&e, b"row") => depth += 1,
                Event::End(e) if local_name_is(&e, b"row") => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                Event::Eof => return Ok(()),
                _ => {}
            }
        }
    }

    fn read_row_body(&mut self, row_num: u32) -> Result<RowData, ReadError> {
        let mut cells = std::collections::BTreeMap::new();
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf).map_err(xml_err)? {
                Event::Start(e) if local_name_is(&e, b"c") => {
                    let (col, t, s) = cell_attrs(&e)?;
                    let value = self.read_cell_body(t.as_deref(), s)?;
                    self.insert_if_in_range(&mut cells, col, value);
                }
                Event::Empty(e) if local_name_is(&e, b"c") => {
                    let (col, t, s) = cell_attrs(&e)?;
                    let style = self.style_for(s);
                    let value = decode_raw_value(t.as_deref(), None, None, &style, &self.shared_strings)
                        .map_err(|_| malformed("bad cell value"))?;
                    self.insert_if_in_range(&mut cells, col, value);
                }
                Event::End(e) if local_name_is(&e, b"row") => break,
                Event::Eof => {
                    self.done = true;
                    break;
                }
                _ => {}
            }
        }
        Ok(RowData { row: row_num, cells })
    }

    fn read_cell_body(&mut self, t: Option<&str>, style_id: Option<u32>) -> Result<CellValue, ReadError> {
        let mut value_text: Option<String> = None;
        let mut formula_text: Option<String> = None;
        let mut inline_text: Option<String> = None;
        let mut in_is = false;

        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf).map_err(xml_err)? {
                Event::Start(e) => {
                    let local = e.local_name();
                    if local.as_ref() == b"v" {
                        value_text = Some(self.read_text_until(b"v")?);
                    } else if local.as_ref() == b"f" {
                        formula_text = Some(self.read_text_until(b"f")?);
                    } else if local.as_ref() == b"is" {
                        in_is = true;
                    } else if local.as_ref() == b"t" && in_is {
                        let t = self.read_text_until(b"t")?;
                        *inline_text.get_or_insert_with(String::new) += &t;
                    }
                }
                Event::End(e) => {
                    let local = e.local_name();
                    if local.as_ref() == b"c" {
                        break;
                    }
                    if local.as_ref() == b"is" {
                        in_is = false;
                    }
                }
                Event::Eof => {
                    self.done = true;
                    break;
                }
                _ => {}
            }
        }

        let style = self.style_for(style_id);
        let is = inline_text.map(|t| InlineString { t: Some(t) });
        let raw = decode_raw_value(t, value_text.as_deref(), is.as_ref(), &style, &self.shared_strings)?;
        Ok(match formula_text {
            Some(expr) => CellValue::formula(expr, (!raw.is_empty()).then_some(raw)),
            None => raw,
        })
    }

    fn read_text_until(&mut self, end_tag: &[u8]) -> Result<String, ReadError> {
        let mut text = String::new();
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf).map_err(xml_err)? {
                Event::Text(e) => {
                    let decoded = e.unescape().map_err(xml_err)?;
                    text.push_str(&decoded);
                }
                Event::End(e) if e.local_name().as_ref() == end_tag => break,
                Event::Eof => {
                    self.done = true;
                    break;
                }
                _ => {}
            }
        }
        Ok(text)
    }

    fn style_for(&self, style_id: Option<u32>) -> CellStyle {
        style_id
            .and_then(|id| self.styles.get(id as usize))
            .cloned()
            .unwrap_or_default()
    }

    fn insert_if_in_range(&self, cells: &mut std::collections::BTreeMap<u32, CellValue>, col: Option<u32>, value: CellValue) {
        let Some(col) = col else { return };
        if let Some(range) = self.range {
            if col < range.min_col || col > range.max_col {
                return;
            }
        }
        cells.insert(col, value);
    }
}

fn row_number(e: &BytesStart<'_>) -> Result<u32, ReadError> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == b"r" {
            let s = std::str::from_utf8(&attr.value).map_err(|_| malformed("row r attribute is not utf-8"))?;
            return s.parse().map_err(|_| malformed("invalid row number"));
        }
    }
    Err(malformed("row element missing r attribute"))
}

fn cell_attrs(e: &BytesStart<'_>) -> Result<(Option<u32>, Option<String>, Option<u32>), ReadError> {
    let mut r = None;
    let mut t = None;
    let mut s = None;
    for attr in e.attributes().flatten() {
        let value = std::str::from_utf8(&attr.value).unwrap_or_default();
        match attr.key.as_ref() {
            b"r" => r = ARef::parse_a1(value).ok(),
            b"t" => t = Some(value.to_string()),
            b"s" => s = value.parse().ok(),
            _ => {}
        }
    }
    Ok((r.map(|a| a.col.index() + 1), t, s))
}

fn local_name_is(e: &BytesStart<'_>, name: &[u8]) -> bool {
    e.local_name().as_ref() == name
}

fn xml_err(e: quick_xml::Error) -> ReadError {
    ReadError::MalformedXml {
        part: "worksheet".to_string(),
        location: e.to_string(),
    }
}

fn malformed(msg: &str) -> ReadError {
    ReadError::MalformedXml {
        part: "worksheet".to_string(),
        location: msg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worksheet_xml(sheet_data: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
<sheetData>
{sheet_data}
</sheetData>
</worksheet>"#
        )
    }

    fn read_all(xml: &str) -> Vec<RowData> {
        let cursor = Cursor::new(xml.as_bytes().to_vec());
        let mut reader = SheetStreamReader::new(cursor, Vec::new(), Vec::new(), None);
        let mut rows = Vec::new();
        while let Some(row) = reader.next_row().unwrap() {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn reads_sparse_rows_in_order() {
        let xml = worksheet_xml(
            r#"
<row r="1"><c r="A1"><v>1</v></c></row>
<row r="5"><c r="C5"><v>5</v></c></row>
"#,
        );
        let rows = read_all(&xml);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row, 1);
        assert_eq!(rows[1].row, 5);
        assert_eq!(rows[1].cells[&3], CellValue::Number(5.into()));
    }

    #[test]
    fn resolves_shared_strings() {
        let sst: Sst = quick_xml::de::from_str(
            r#"<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="1" uniqueCount="1"><si><t>Hi</t></si></sst>"#,
        )
        .unwrap();
        let shared = decode_shared_strings(&sst);
        let xml = worksheet_xml(r#"<row r="1"><c r="A1" t="s"><v>0</v></c></row>"#);
        let cursor = Cursor::new(xml.as_bytes().to_vec());
        let mut reader = SheetStreamReader::new(cursor, shared, Vec::new(), None);
        let row = reader.next_row().unwrap().unwrap();
        assert_eq!(row.cells[&1], CellValue::from("Hi"));
    }

    #[test]
    fn range_bound_drops_rows_and_columns_outside_it() {
        let xml = worksheet_xml(
            r#"
<row r="1"><c r="A1"><v>1</v></c><c r="C1"><v>3</v></c></row>
<row r="10"><c r="A10"><v>10</v></c></row>
"#,
        );
        let cursor = Cursor::new(xml.as_bytes().to_vec());
        let bound = RangeBound {
            min_row: 1,
            max_row: 1,
            min_col: 1,
            max_col: 1,
        };
        let mut reader = SheetStreamReader::new(cursor, Vec::new(), Vec::new(), Some(bound));
        let row = reader.next_row().unwrap().unwrap();
        assert_eq!(row.cells.len(), 1);
        assert!(row.cells.contains_key(&1));
        assert!(reader.next_row().unwrap().is_none());
    }

    #[test]
    fn empty_rows_are_still_emitted() {
        let xml = worksheet_xml(r#"<row r="1"></row><row r="2"><c r="A2"><v>1</v></c></row>"#);
        let rows = read_all(&xml);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].cells.is_empty());
    }

    #[test]
    fn self_closing_cells_are_empty() {
        let xml = worksheet_xml(r#"<row r="1"><c r="A1"/><c r="B1"><v>1</v></c></row>"#);
        let rows = read_all(&xml);
        assert_eq!(rows[0].cells[&1], CellValue::Empty);
        assert_eq!(rows[0].cells[&2], CellValue::Number(1.into()));
    }
}
