//! Streaming worksheet writer.
//!
//! [`StreamWriter`] emits `<row>`/`<c>` XML text directly to a sink as each
//! row arrives, the way [`crate::transform`] splices cell text rather than
//! building a `WorksheetXml` tree: memory is O(1) in row count. Two
//! dimension strategies mirror spec.md's hinted/auto-detect split: hinted
//! writes straight through, auto-detect spools rows to a temp file while
//! tracking bounds, then splices the computed `<dimension>` on `finish()`.
//!
//! Styles referenced by streamed cells are assumed already registered in
//! the target `styles.xml`; this writer does not infer or allocate styles.

use std::io::{Seek, Write};

use quick_xml::escape::escape;

use crate::address::{ARef, CellRange, Column, Row};
use crate::cell::CellValue;
use crate::error::WriteError;
use crate::sheet::ColumnProps;
use crate::writer::error_literal;

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;
const NAMESPACE: &str = xl_xml::namespaces::SPREADSHEET_ML;
const MAX_OUTLINE_LEVEL: u8 = 7;

/// Row-level overrides for a streamed row.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamRowOptions {
    pub height: Option<f64>,
    pub hidden: bool,
    pub outline_level: u8,
}

/// How `<dimension>` is determined for a streamed worksheet.
enum Dimension<T> {
    /// Caller supplies the final `<dimension>` range up front; everything
    /// streams straight to the sink.
    Hinted { range: CellRange, sink: T },
    /// Rows are spooled to a temp file while row/column bounds are
    /// tracked; `finish()` writes the header with the computed dimension,
    /// then copies the spooled rows into the real sink.
    AutoDetect {
        spool: tempfile::NamedTempFile,
        bounds: Option<(u32, u32, u32, u32)>, // (min_row, max_row, min_col, max_col)
        sink: T,
    },
}

/// Streams one worksheet's XML to a sink, row by row, in ascending row
/// order.
pub struct StreamWriter<W: Write> {
    sheet_name: String,
    dimension: Dimension<W>,
    cols: Vec<(Column, Column, ColumnProps)>,
    merge_cells: Vec<CellRange>,
    last_row: Option<u32>,
    header_written: bool,
    finished: bool,
}

impl<W: Write> StreamWriter<W> {
    /// Start a hinted writer: `range` is written as the worksheet's
    /// `<dimension>` immediately.
    pub fn hinted(sheet_name: impl Into<String>, range: CellRange, sink: W) -> Self {
        Self {
            sheet_name: sheet_name.into(),
            dimension: Dimension::Hinted { range, sink },
            cols: Vec::new(),
            merge_cells: Vec::new(),
            last_row: None,
            header_written: false,
            finished: false,
        }
    }

    /// Start an auto-detecting writer: rows are spooled to a temp file
    /// while their bounds are tracked; `finish()` computes `<dimension>`
    /// from what was actually written.
    pub fn auto_detect(sheet_name: impl Into<String>, sink: W) -> Result<Self, WriteError> {
        let spool = tempfile::NamedTempFile::new()?;
        Ok(Self {
            sheet_name: sheet_name.into(),
            dimension: Dimension::AutoDetect {
                spool,
                bounds: None,
                sink,
            },
            cols: Vec::new(),
            merge_cells: Vec::new(),
            last_row: None,
            header_written: false,
            finished: false,
        })
    }

    pub fn sheet_name(&self) -> &str {
        &self.sheet_name
    }

    /// Register a `<cols>` run (1-based, inclusive). Must be called before
    /// the first [`Self::write_row`].
    pub fn set_cols(&mut self, min: Column, max: Column, props: ColumnProps) -> Result<(), WriteError> {
        if self.header_written {
            return Err(WriteError::AlreadyFinished);
        }
        self.cols.push((min, max, props));
        Ok(())
    }

    /// Register a merge range, emitted in `<mergeCells>` on [`Self::finish`].
    pub fn add_merge(&mut self, range: CellRange) {
        self.merge_cells.push(range);
    }

    /// Write one row. `row` is the 1-based row number and must be strictly
    /// greater than the previous row written. `cells` are `(1-based column,
    /// style id, value)` triples in any order; they're sorted before
    /// emission.
    pub fn write_row(&mut self, row: u32, cells: &[(u32, Option<u32>, CellValue)]) -> Result<(), WriteError> {
        self.write_row_with_options(row, cells, StreamRowOptions::default())
    }

    pub fn write_row_with_options(
        &mut self,
        row: u32,
        cells: &[(u32, Option<u32>, CellValue)],
        options: StreamRowOptions,
    ) -> Result<(), WriteError> {
        if self.finished {
            return Err(WriteError::AlreadyFinished);
        }
        if let Some(prev) = self.last_row {
            if row <= prev {
                return Err(WriteError::RowsOutOfOrder { previous: prev, next: row });
            }
        }
        self.last_row = Some(row);
        let options = StreamRowOptions {
            outline_level: options.outline_level.min(MAX_OUTLINE_LEVEL),
            ..options
        };

        let mut sorted: Vec<&(u32, Option<u32>, CellValue)> = cells.iter().collect();
        sorted.sort_by_key(|(col, ..)| *col);

        let (min_col, max_col) = sorted
            .first()
            .map(|(c, ..)| *c)
            .zip(sorted.last().map(|(c, ..)| *c))
            .unwrap_or((row, row));

        let row_xml = render_row(row, &sorted, options);

        match &mut self.dimension {
            Dimension::Hinted { sink, .. } => {
                self.ensure_header_hinted()?;
                sink.write_all(row_xml.as_bytes())?;
            }
            Dimension::AutoDetect { spool, bounds, .. } => {
                spool.write_all(row_xml.as_bytes())?;
                let entry = bounds.get_or_insert((row, row, min_col, max_col));
                entry.0 = entry.0.min(row);
                entry.1 = entry.1.max(row);
                if !sorted.is_empty() {
                    entry.2 = entry.2.min(min_col);
                    entry.3 = entry.3.max(max_col);
                }
            }
        }
        Ok(())
    }

    fn ensure_header_hinted(&mut self) -> Result<(), WriteError> {
        if self.header_written {
            return Ok(());
        }
        self.header_written = true;
        if let Dimension::Hinted { range, sink } = &mut self.dimension {
            sink.write_all(render_header(&range.print_a1(), &self.cols).as_bytes())?;
        }
        Ok(())
    }

    /// Finish the worksheet: write any remaining header/body/tail, and for
    /// auto-detect writers, splice the computed dimension and copy the
    /// spooled rows into the sink. Returns the sink.
    pub fn finish(mut self) -> Result<W, WriteError> {
        if self.finished {
            return Err(WriteError::AlreadyFinished);
        }
        self.finished = true;

        let cols = std::mem::take(&mut self.cols);
        let merges = std::mem::take(&mut self.merge_cells);
        let header_written = self.header_written;

        match self.dimension {
            Dimension::Hinted { range, mut sink } => {
                if !header_written {
                    sink.write_all(render_header(&range.print_a1(), &cols).as_bytes())?;
                }
                sink.write_all(b"</sheetData>")?;
                sink.write_all(render_tail(&merges).as_bytes())?;
                Ok(sink)
            }
            Dimension::AutoDetect { mut spool, bounds, mut sink } => {
                let dimension_ref = match bounds {
                    Some((min_row, max_row, min_col, max_col)) => {
                        let start = aref_at(min_col, min_row);
                        let end = aref_at(max_col, max_row);
                        CellRange::new(start, end).print_a1()
                    }
                    None => "A1".to_string(),
                };
                sink.write_all(render_header(&dimension_ref, &cols).as_bytes())?;
                spool.rewind()?;
                std::io::copy(&mut spool, &mut sink)?;
                sink.write_all(b"</sheetData>")?;
                sink.write_all(render_tail(&merges).as_bytes())?;
                Ok(sink)
            }
        }
    }
}

fn cell_ref(col: u32, row: u32) -> String {
    let letters = Column::new(col.saturating_sub(1)).map(|c| c.to_letters()).unwrap_or_default();
    format!("{letters}{row}")
}

fn aref_at(col: u32, row: u32) -> ARef {
    let column = Column::new(col.saturating_sub(1)).unwrap_or(Column::new(0).expect("0 is in range"));
    let row = Row::new(row.saturating_sub(1)).unwrap_or(Row::new(0).expect("0 is in range"));
    ARef::new(column, row, crate::address::AnchorMode::Relative)
}

fn render_header(dimension_ref: &str, cols: &[(Column, Column, ColumnProps)]) -> String {
    let mut s = String::with_capacity(256);
    s.push_str(XML_DECLARATION);
    s.push('\n');
    s.push_str(&format!(r#"<worksheet xmlns="{NAMESPACE}">"#));
    s.push_str(&format!(r#"<dimension ref="{dimension_ref}"/>"#));
    if !cols.is_empty() {
        s.push_str("<cols>");
        for (min, max, props) in cols {
            let entry = crate::writer::col_entry(min.index(), max.index(), *props);
            if entry.width.is_none() && entry.hidden != Some(true) {
                continue;
            }
            s.push_str(&format!("<col min=\"{}\" max=\"{}\"", entry.min, entry.max));
            if let Some(w) = entry.width {
                s.push_str(&format!(" width=\"{w}\""));
            }
            if entry.custom_width == Some(true) {
                s.push_str(" customWidth=\"1\"");
            }
            if entry.hidden == Some(true) {
                s.push_str(" hidden=\"1\"");
            }
            if let Some(ol) = entry.outline_level {
                s.push_str(&format!(" outlineLevel=\"{ol}\""));
            }
            s.push_str("/>");
        }
        s.push_str("</cols>");
    }
    s.push_str("<sheetData>");
    s
}

fn render_tail(merges: &[CellRange]) -> String {
    let mut s = String::new();
    if !merges.is_empty() {
        s.push_str(&format!("<mergeCells count=\"{}\">", merges.len()));
        for m in merges {
            s.push_str(&format!("<mergeCell ref=\"{}\"/>", m.print_a1()));
        }
        s.push_str("</mergeCells>");
    }
    s.push_str("</worksheet>");
    s
}

fn render_row(row: u32, cells: &[&(u32, Option<u32>, CellValue)], options: StreamRowOptions) -> String {
    let mut s = format!("<row r=\"{row}\"");
    if let Some(h) = options.height {
        s.push_str(&format!(" ht=\"{h}\" customHeight=\"1\""));
    }
    if options.hidden {
        s.push_str(" hidden=\"1\"");
    }
    if options.outline_level != 0 {
        s.push_str(&format!(" outlineLevel=\"{}\"", options.outline_level));
    }
    s.push('>');
    for (col, style, value) in cells {
        s.push_str(&render_cell(&cell_ref(*col, row), *style, value));
    }
    s.push_str("</row>");
    s
}

fn render_cell(r: &str, style: Option<u32>, value: &CellValue) -> String {
    let mut tag = format!("<c r=\"{r}\"");
    if let Some(s) = style {
        tag.push_str(&format!(" s=\"{s}\""));
    }
    match value {
        CellValue::Empty => {
            tag.push_str("/>");
        }
        CellValue::Number(n) => {
            tag.push_str(&format!("><v>{n}</v></c>"));
        }
        CellValue::Bool(b) => {
            tag.push_str(&format!(" t=\"{}\"><v>{}</v></c>", xl_xml::worksheet::cell_types::BOOLEAN, if *b { 1 } else { 0 }));
        }
        CellValue::Error(kind) => {
            tag.push_str(&format!(
                " t=\"{}\"><v>{}</v></c>",
                xl_xml::worksheet::cell_types::ERROR,
                error_literal(*kind)
            ));
        }
        CellValue::DateTime(dt) => {
            tag.push_str(&format!("><v>{}</v></c>", crate::cell::datetime_to_serial(*dt)));
        }
        CellValue::Text(text) => {
            tag.push_str(&format!(
                " t=\"{}\"><is><t xml:space=\"preserve\">{}</t></is></c>",
                xl_xml::worksheet::cell_types::INLINE_STRING,
                escape(text)
            ));
        }
        CellValue::RichText(runs) => {
            let text: String = runs.iter().map(|r| r.text.as_str()).collect();
            tag.push_str(&format!(
                " t=\"{}\"><is><t xml:space=\"preserve\">{}</t></is></c>",
                xl_xml::worksheet::cell_types::INLINE_STRING,
                escape(&text)
            ));
        }
        CellValue::Formula { expr, cached } => {
            let (t_attr, v) = match cached.as_deref() {
                Some(CellValue::Text(text)) => (Some(xl_xml::worksheet::cell_types::FORMULA_STRING), Some(text.clone())),
                Some(CellValue::Number(n)) => (None, Some(n.to_string())),
                Some(CellValue::Bool(b)) => (
                    Some(xl_xml::worksheet::cell_types::BOOLEAN),
                    Some(if *b { "1".to_string() } else { "0".to_string() }),
                ),
                Some(CellValue::Error(k)) => (Some(xl_xml::worksheet::cell_types::ERROR), Some(error_literal(*k))),
                Some(CellValue::DateTime(dt)) => (None, Some(crate::cell::datetime_to_serial(*dt).to_string())),
                _ => (None, None),
            };
            if let Some(t) = t_attr {
                tag.push_str(&format!(" t=\"{t}\">"));
            } else {
                tag.push('>');
            }
            tag.push_str(&format!("<f>{}</f>", escape(expr)));
            if let Some(v) = v {
                tag.push_str(&format!("<v>{}</v>", escape(&v)));
            }
            tag.push_str("</c>");
        }
    }
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hinted_writer_streams_rows_directly() {
        let mut sw = StreamWriter::hinted("Sheet1", CellRange::parse_a1("A1:B2").unwrap(), Vec::new());
        sw.write_row(1, &[(1, None, CellValue::from("Name")), (2, None, CellValue::from("Age"))])
            .unwrap();
        sw.write_row(2, &[(1, None, CellValue::from("Alice")), (2, None, CellValue::Number(30.into()))])
            .unwrap();
        let xml = sw.finish().unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.contains(r#"<dimension ref="A1:B2"/>"#));
        assert!(text.contains(r#"<row r="1">"#));
        assert!(text.contains("Alice"));
    }

    #[test]
    fn out_of_order_rows_are_rejected() {
        let mut sw = StreamWriter::hinted("Sheet1", CellRange::parse_a1("A1:A2").unwrap(), Vec::new());
        sw.write_row(2, &[(1, None, CellValue::from("x"))]).unwrap();
        let err = sw.write_row(1, &[(1, None, CellValue::from("y"))]).unwrap_err();
        assert!(matches!(err, WriteError::RowsOutOfOrder { previous: 2, next: 1 }));
    }

    #[test]
    fn auto_detect_computes_dimension_from_written_rows() {
        let mut sw = StreamWriter::auto_detect("Sheet1", Vec::new()).unwrap();
        sw.write_row(3, &[(2, None, CellValue::Number(1.into()))]).unwrap();
        sw.write_row(5, &[(4, None, CellValue::Number(2.into()))]).unwrap();
        let xml = sw.finish().unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.contains(r#"<dimension ref="B3:D5"/>"#));
        assert!(text.contains(r#"<row r="3">"#));
        assert!(text.contains(r#"<row r="5">"#));
    }

    #[test]
    fn cols_are_emitted_before_sheet_data() {
        let mut sw = StreamWriter::hinted("Sheet1", CellRange::parse_a1("A1:A1").unwrap(), Vec::new());
        sw.set_cols(
            Column::new(0).unwrap(),
            Column::new(0).unwrap(),
            ColumnProps {
                width: Some(25.0),
                hidden: false,
                outline_level: 0,
            },
        )
        .unwrap();
        sw.write_row(1, &[(1, None, CellValue::from("x"))]).unwrap();
        let xml = sw.finish().unwrap();
        let text = String::from_utf8(xml).unwrap();
        let cols_pos = text.find("<cols>").unwrap();
        let sheet_data_pos = text.find("<sheetData>").unwrap();
        assert!(cols_pos < sheet_data_pos);
    }

    #[test]
    fn merge_cells_are_written_after_sheet_data() {
        let mut sw = StreamWriter::hinted("Sheet1", CellRange::parse_a1("A1:B2").unwrap(), Vec::new());
        sw.add_merge(CellRange::parse_a1("A1:B1").unwrap());
        sw.write_row(1, &[(1, None, CellValue::from("x"))]).unwrap();
        let xml = sw.finish().unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.contains(r#"<mergeCell ref="A1:B1"/>"#));
    }
}
