//! Reads an `.xlsx` ZIP package into an in-memory [`Workbook`].
//!
//! Mirrors [`writer`](crate::writer)'s part layout in reverse: the parts
//! writer.rs always emits are parsed eagerly into [`Workbook`]/[`Sheet`]
//! values, and every part this module doesn't model (charts, drawings,
//! pivot caches, VBA, ...) is preserved byte-for-byte in the part manifest.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::Arc;

use quick_xml::de::from_str as from_xml_str;
use rust_decimal::Decimal;
use zip::ZipArchive;

use xl_xml::comments::Comments;
use xl_xml::content_types::ContentTypes;
use xl_xml::relationships::{rel_types, Relationships};
use xl_xml::shared_strings::Sst;
use xl_xml::styles::{
    self, Border as XmlBorder, BorderSide as XmlBorderSide, Color as XmlColor, Fill as XmlFill, Font as XmlFont,
    StyleSheet, Xf,
};
use xl_xml::table::TableXml;
use xl_xml::theme;
use xl_xml::workbook::WorkbookXml;
use xl_xml::worksheet::{cell_types, Cell as XmlCell, InlineString, WorksheetXml};

use crate::address::{ARef, CellRange, Column, Row as AddrRow};
use crate::cell::{Cell, CellValue, Comment, ErrorKind, RichRun};
use crate::error::ReadError;
use crate::sheet::{ColumnProps, RowProps, Sheet, Table, Visibility};
use crate::style::{
    builtin_num_fmts, Align, Border, BorderLineStyle, BorderSide, CellStyle, Color, Fill, Font, HorizontalAlign,
    NumFmt, PatternType, StyleApplyMode, VerticalAlign,
};
use crate::workbook::{DefinedName, ManifestPart, ThemeColors, Workbook};
use crate::writer::CompressionKind;

/// Read an in-memory `.xlsx` buffer into a [`Workbook`].
pub fn read_from_buffer(bytes: &[u8]) -> Result<Workbook, ReadError> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = ZipArchive::new(cursor).map_err(|e| ReadError::InvalidZip(e.to_string()))?;
    from_archive(&mut archive)
}

/// Read an `.xlsx` file at `path` into a [`Workbook`].
pub fn read_from_path(path: impl AsRef<Path>) -> Result<Workbook, ReadError> {
    let file = std::fs::File::open(path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| ReadError::InvalidZip(e.to_string()))?;
    from_archive(&mut archive)
}

/// A decoded shared-string table entry: plain text or a run of rich text.
#[derive(Debug, Clone)]
pub(crate) enum SharedStringItem {
    Text(String),
    Rich(Vec<RichRun>),
}

fn from_archive<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<Workbook, ReadError> {
    let content_types: ContentTypes = read_xml_part(archive, "[Content_Types].xml")?;
    let workbook_xml: WorkbookXml = read_xml_part(archive, "xl/workbook.xml")?;
    let workbook_rels: Relationships = read_xml_part(archive, "xl/_rels/workbook.xml.rels")?;
    let stylesheet: StyleSheet = read_xml_part(archive, "xl/styles.xml")?;
    let styles = decode_stylesheet(&stylesheet);

    let shared_strings = read_xml_part::<Sst, _>(archive, "xl/sharedStrings.xml")
        .ok()
        .map(|sst| decode_shared_strings(&sst))
        .unwrap_or_default();

    let theme_colors = read_bytes_part(archive, "xl/theme/theme1.xml")
        .ok()
        .map(|bytes| decode_theme(&bytes))
        .unwrap_or_default();

    let mut known_parts: HashSet<String> = [
        "[Content_Types].xml",
        "_rels/.rels",
        "xl/workbook.xml",
        "xl/_rels/workbook.xml.rels",
        "xl/styles.xml",
        "xl/sharedStrings.xml",
        "xl/theme/theme1.xml",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    let mut workbook = Workbook::new();

    for entry in &workbook_xml.sheets.sheets {
        let rel = workbook_rels
            .relationships
            .iter()
            .find(|r| r.id == entry.r_id)
            .ok_or_else(|| ReadError::MissingPart(format!("relationship {}", entry.r_id)))?;
        let sheet_path = resolve_relationship_target("xl/workbook.xml", &rel.target);
        known_parts.insert(sheet_path.clone());

        let worksheet_xml: WorksheetXml = read_xml_part(archive, &sheet_path)?;
        let sheet_rels_path = relationship_part_path(&sheet_path);
        let sheet_rels: Relationships =
            read_xml_part(archive, &sheet_rels_path).unwrap_or_else(|_| empty_relationships());
        if !sheet_rels.relationships.is_empty() {
            known_parts.insert(sheet_rels_path);
        }

        let mut sheet = build_sheet(&entry.name, &worksheet_xml, &styles, &shared_strings, &sheet_rels)?;

        for rel in &sheet_rels.relationships {
            let target = resolve_relationship_target(&sheet_path, &rel.target);
            if rel.rel_type == rel_types::COMMENTS {
                known_parts.insert(target.clone());
                if let Ok(comments) = read_xml_part::<Comments, _>(archive, &target) {
                    sheet = apply_comments(sheet, &comments)?;
                }
            } else if rel.rel_type == rel_types::TABLE {
                known_parts.insert(target.clone());
                if let Ok(table_xml) = read_xml_part::<TableXml, _>(archive, &target) {
                    sheet = sheet.with_table(decode_table(&table_xml)?);
                }
            }
        }

        sheet = sheet.with_visibility(decode_visibility(entry.state.as_deref()));

        workbook = workbook.append_sheet(sheet)?;
    }

    if let Some(defined_names) = &workbook_xml.defined_names {
        for dn in &defined_names.defined_names {
            let scope = dn
                .local_sheet_id
                .and_then(|idx| workbook_xml.sheets.sheets.get(idx as usize))
                .map(|entry| entry.name.clone());
            workbook = workbook.with_defined_name(DefinedName {
                name: dn.name.clone(),
                scope,
                formula: dn.value.clone(),
            });
        }
    }

    if let Some(active) = workbook_xml
        .book_views
        .as_ref()
        .and_then(|views| views.workbook_views.first())
        .and_then(|view| view.active_tab)
    {
        if (active as usize) < workbook.sheets().len() {
            workbook = workbook.set_active_sheet_index(active as usize)?;
        }
    }

    workbook = workbook.with_theme(theme_colors);

    let manifest = collect_manifest_parts(archive, &content_types, &known_parts)?;
    workbook = workbook.with_part_manifest(manifest);

    Ok(workbook)
}

fn empty_relationships() -> Relationships {
    Relationships {
        xmlns: xl_xml::namespaces::PACKAGE_RELATIONSHIPS.to_string(),
        relationships: Vec::new(),
    }
}

fn build_sheet(
    name: &str,
    worksheet: &WorksheetXml,
    styles: &[CellStyle],
    shared_strings: &[SharedStringItem],
    sheet_rels: &Relationships,
) -> Result<Sheet, ReadError> {
    let mut sheet = Sheet::new(name.to_string());

    if let Some(cols) = &worksheet.cols {
        for col in &cols.cols {
            let props = ColumnProps {
                width: col.width,
                hidden: col.hidden.unwrap_or(false),
                outline_level: col.outline_level.unwrap_or(0),
            };
            for idx in col.min.saturating_sub(1)..col.max {
                sheet = sheet.with_col_props(Column::new(idx)?, props);
            }
        }
    }

    for row in &worksheet.sheet_data.rows {
        let row_props = RowProps {
            height: row.ht,
            hidden: row.hidden.unwrap_or(false),
            outline_level: row.outline_level.unwrap_or(0),
        };
        if row_props != RowProps::default() {
            sheet = sheet.with_row_props(AddrRow::new(row.r - 1)?, row_props);
        }

        for c in &row.cells {
            let aref = ARef::parse_a1(&c.r)?;
            let style_id = c.s.unwrap_or(0);
            let style = styles.get(style_id as usize).cloned().unwrap_or_default();
            if style_id != 0 {
                sheet = sheet.style_range(CellRange::single(aref), style.clone(), StyleApplyMode::Replace);
            }
            let value = decode_cell_value(c, &style, shared_strings)?;
            if !value.is_empty() {
                sheet = sheet.put_value(aref, value);
            }
        }
    }

    if let Some(merge_cells) = &worksheet.merge_cells {
        for mc in &merge_cells.merge_cells {
            let range = parse_a1_range_or_cell(&mc.reference)?;
            sheet = sheet.merge(range)?;
        }
    }

    if let Some(hyperlinks) = &worksheet.hyperlinks {
        let targets: HashMap<&str, &str> = sheet_rels
            .relationships
            .iter()
            .filter(|r| r.rel_type == rel_types::HYPERLINK)
            .map(|r| (r.id.as_str(), r.target.as_str()))
            .collect();
        for hl in &hyperlinks.hyperlinks {
            let range = parse_a1_range_or_cell(&hl.reference)?;
            let url = hl
                .r_id
                .as_deref()
                .and_then(|id| targets.get(id).copied())
                .map(str::to_string)
                .or_else(|| hl.location.clone());
            let Some(url) = url else { continue };
            for aref in range.iter_row_major() {
                let existing = sheet.get(aref).cloned().unwrap_or_default();
                sheet = sheet.put(
                    aref,
                    Cell {
                        hyperlink: Some(url.clone()),
                        ..existing
                    },
                );
            }
        }
    }

    Ok(sheet)
}

fn parse_a1_range_or_cell(s: &str) -> Result<CellRange, ReadError> {
    if s.contains(':') {
        Ok(CellRange::parse_a1(s)?)
    } else {
        Ok(CellRange::single(ARef::parse_a1(s)?))
    }
}

fn apply_comments(sheet: Sheet, comments: &Comments) -> Result<Sheet, ReadError> {
    let mut sheet = sheet;
    for c in &comments.comment_list.comments {
        let aref = ARef::parse_a1(&c.r#ref)?;
        let author = comments.authors.authors.get(c.author_id as usize).cloned();
        let body = c
            .text
            .runs
            .iter()
            .map(|r| RichRun::plain(r.t.clone()))
            .collect();
        let existing = sheet.get(aref).cloned().unwrap_or_default();
        sheet = sheet.put(
            aref,
            Cell {
                comment: Some(Comment { body, author }),
                ..existing
            },
        );
    }
    Ok(sheet)
}

fn decode_table(table: &TableXml) -> Result<Table, ReadError> {
    Ok(Table {
        name: table.name.clone(),
        range: parse_a1_range_or_cell(&table.reference)?,
        header_row: table.header_row_count.map(|c| c > 0).unwrap_or(true),
        columns: table.table_columns.columns.iter().map(|c| c.name.clone()).collect(),
    })
}

pub(crate) fn decode_visibility(state: Option<&str>) -> Visibility {
    match state {
        Some("hidden") => Visibility::Hidden,
        Some("veryHidden") => Visibility::VeryHidden,
        _ => Visibility::Normal,
    }
}

fn decode_cell_value(
    c: &XmlCell,
    style: &CellStyle,
    shared_strings: &[SharedStringItem],
) -> Result<CellValue, ReadError> {
    let raw = decode_raw_value(c.t.as_deref(), c.v.as_deref(), c.is.as_ref(), style, shared_strings)?;
    match &c.f {
        Some(formula) => {
            let cached = (!raw.is_empty()).then_some(raw);
            Ok(CellValue::formula(formula.value.clone().unwrap_or_default(), cached))
        }
        None => Ok(raw),
    }
}

pub(crate) fn decode_raw_value(
    t: Option<&str>,
    v: Option<&str>,
    is: Option<&InlineString>,
    style: &CellStyle,
    shared_strings: &[SharedStringItem],
) -> Result<CellValue, ReadError> {
    match t {
        Some(cell_types::SHARED_STRING) => {
            let idx: usize = v
                .ok_or_else(|| malformed("shared string cell is missing its index"))?
                .parse()
                .map_err(|_| malformed("shared string index is not a number"))?;
            Ok(match shared_strings.get(idx) {
                Some(SharedStringItem::Text(s)) => CellValue::Text(s.clone()),
                Some(SharedStringItem::Rich(runs)) => CellValue::RichText(runs.clone()),
                None => CellValue::Empty,
            })
        }
        Some(cell_types::INLINE_STRING) => Ok(CellValue::from(is.and_then(|i| i.t.clone()).unwrap_or_default())),
        Some(cell_types::BOOLEAN) => Ok(CellValue::Bool(v == Some("1"))),
        Some(cell_types::ERROR) => Ok(CellValue::Error(v.and_then(|s| s.parse().ok()).unwrap_or(ErrorKind::Value))),
        Some(cell_types::FORMULA_STRING) => Ok(CellValue::Text(v.unwrap_or_default().to_string())),
        _ => match v {
            None => Ok(CellValue::Empty),
            Some(raw) => {
                let n: Decimal = raw.parse().map_err(|_| malformed("numeric cell value is not a decimal"))?;
                Ok(if num_fmt_is_datetime(&style.num_fmt) {
                    crate::cell::serial_to_datetime(n)
                        .map(CellValue::DateTime)
                        .unwrap_or(CellValue::Number(n))
                } else {
                    CellValue::Number(n)
                })
            }
        },
    }
}

pub(crate) fn num_fmt_is_datetime(fmt: &NumFmt) -> bool {
    match fmt {
        NumFmt::DateMdy
        | NumFmt::DateDmy
        | NumFmt::DateDm
        | NumFmt::DateMy
        | NumFmt::TimeHmAmPm
        | NumFmt::TimeHmsAmPm
        | NumFmt::TimeHm
        | NumFmt::TimeHms
        | NumFmt::DateTime => true,
        NumFmt::Custom(code) => {
            let lower = code.to_ascii_lowercase();
            !lower.contains('@') && lower.chars().any(|c| matches!(c, 'y' | 'd' | 'h' | 's'))
                || lower.contains('m') && (lower.contains('d') || lower.contains('h'))
        }
        _ => false,
    }
}

fn malformed(msg: &str) -> ReadError {
    ReadError::MalformedXml {
        part: "worksheet cell".to_string(),
        location: msg.to_string(),
    }
}

/// Decode one global `xl/styles.xml` into a flat table indexed by cellXfs id,
/// the inverse of [`crate::writer`]'s per-sheet-registry merge.
pub(crate) fn decode_stylesheet(sheet: &StyleSheet) -> Vec<CellStyle> {
    let fonts: Vec<Font> = sheet.fonts.fonts.iter().map(decode_font).collect();
    let fills: Vec<Fill> = sheet.fills.fills.iter().map(decode_fill).collect();
    let borders: Vec<Border> = sheet.borders.borders.iter().map(decode_border).collect();
    let num_fmts: HashMap<u32, String> = sheet
        .num_fmts
        .as_ref()
        .map(|nf| nf.num_fmts.iter().map(|n| (n.num_fmt_id, n.format_code.clone())).collect())
        .unwrap_or_default();

    sheet
        .cell_xfs
        .xfs
        .iter()
        .map(|xf| decode_xf(xf, &fonts, &fills, &borders, &num_fmts))
        .collect()
}

pub(crate) fn decode_xf(xf: &Xf, fonts: &[Font], fills: &[Fill], borders: &[Border], num_fmts: &HashMap<u32, String>) -> CellStyle {
    CellStyle {
        font: xf.font_id.and_then(|id| fonts.get(id as usize)).cloned().unwrap_or_default(),
        fill: xf.fill_id.and_then(|id| fills.get(id as usize)).copied().unwrap_or_default(),
        border: xf.border_id.and_then(|id| borders.get(id as usize)).copied().unwrap_or_default(),
        num_fmt: decode_num_fmt(xf.num_fmt_id.unwrap_or(0), num_fmts),
        align: xf.alignment.as_ref().map(decode_alignment).unwrap_or_default(),
    }
}

pub(crate) fn decode_num_fmt(id: u32, custom: &HashMap<u32, String>) -> NumFmt {
    use builtin_num_fmts::*;
    match id {
        GENERAL => NumFmt::General,
        INTEGER => NumFmt::Integer,
        DECIMAL_2 => NumFmt::Decimal2,
        THOUSANDS => NumFmt::Thousands,
        THOUSANDS_DECIMAL => NumFmt::ThousandsDecimal2,
        PERCENT => NumFmt::Percent,
        PERCENT_DECIMAL => NumFmt::PercentDecimal2,
        SCIENTIFIC => NumFmt::Scientific,
        DATE_MDY => NumFmt::DateMdy,
        DATE_DMY => NumFmt::DateDmy,
        DATE_DM => NumFmt::DateDm,
        DATE_MY => NumFmt::DateMy,
        TIME_HM_AP => NumFmt::TimeHmAmPm,
        TIME_HMS_AP => NumFmt::TimeHmsAmPm,
        TIME_HM => NumFmt::TimeHm,
        TIME_HMS => NumFmt::TimeHms,
        DATETIME => NumFmt::DateTime,
        TEXT => NumFmt::Text,
        other => match custom.get(&other) {
            Some(code) => NumFmt::Custom(code.clone()),
            None => NumFmt::General,
        },
    }
}

pub(crate) fn decode_font(font: &XmlFont) -> Font {
    Font {
        name: font.name.as_ref().map(|n| n.val.clone()).unwrap_or_else(|| "Calibri".to_string()),
        size: font.sz.as_ref().map(|s| s.val).unwrap_or(11.0),
        bold: font.b.as_ref().map(|b| b.val.unwrap_or(true)).unwrap_or(false),
        italic: font.i.as_ref().map(|b| b.val.unwrap_or(true)).unwrap_or(false),
        underline: font.u.is_some(),
        color: font.color.as_ref().map(decode_color),
    }
}

pub(crate) fn decode_fill(fill: &XmlFill) -> Fill {
    let Some(pf) = &fill.pattern_fill else {
        return Fill::None;
    };
    match pf.pattern_type.as_deref() {
        None | Some("none") => Fill::None,
        Some("solid") => pf
            .fg_color
            .as_ref()
            .map(|c| Fill::Solid(decode_color(c)))
            .unwrap_or(Fill::None),
        Some(other) => Fill::Pattern {
            fg: pf.fg_color.as_ref().map(decode_color).unwrap_or(Color::Rgb(0)),
            bg: pf.bg_color.as_ref().map(decode_color).unwrap_or(Color::Rgb(0)),
            pattern_type: decode_pattern_type(other),
        },
    }
}

pub(crate) fn decode_pattern_type(s: &str) -> PatternType {
    match s {
        "darkGray" => PatternType::DarkGray,
        "lightGray" => PatternType::LightGray,
        "darkHorizontal" => PatternType::DarkHorizontal,
        "darkVertical" => PatternType::DarkVertical,
        _ => PatternType::Gray125,
    }
}

pub(crate) fn decode_border(border: &XmlBorder) -> Border {
    Border {
        top: border.top.as_ref().map(decode_border_side).unwrap_or_default(),
        bottom: border.bottom.as_ref().map(decode_border_side).unwrap_or_default(),
        left: border.left.as_ref().map(decode_border_side).unwrap_or_default(),
        right: border.right.as_ref().map(decode_border_side).unwrap_or_default(),
    }
}

pub(crate) fn decode_border_side(side: &XmlBorderSide) -> BorderSide {
    BorderSide {
        style: side.style.as_deref().map(decode_border_line_style).unwrap_or_default(),
        color: side.color.as_ref().map(decode_color),
    }
}

pub(crate) fn decode_border_line_style(s: &str) -> BorderLineStyle {
    match s {
        "thin" => BorderLineStyle::Thin,
        "medium" => BorderLineStyle::Medium,
        "thick" => BorderLineStyle::Thick,
        "dashed" => BorderLineStyle::Dashed,
        "dotted" => BorderLineStyle::Dotted,
        "double" => BorderLineStyle::Double,
        _ => BorderLineStyle::None,
    }
}

pub(crate) fn decode_color(color: &XmlColor) -> Color {
    if let Some(rgb) = &color.rgb {
        return Color::Rgb(u32::from_str_radix(rgb, 16).unwrap_or(0xFF000000));
    }
    if let Some(theme) = color.theme {
        return Color::Theme {
            slot: theme,
            tint: color.tint.unwrap_or(0.0),
        };
    }
    Color::Rgb(0xFF000000)
}

pub(crate) fn decode_alignment(a: &styles::Alignment) -> Align {
    Align {
        horizontal: a.horizontal.as_deref().map(decode_horizontal_align).unwrap_or_default(),
        vertical: a.vertical.as_deref().map(decode_vertical_align).unwrap_or_default(),
        wrap: a.wrap_text.unwrap_or(false),
        indent: a.indent.unwrap_or(0),
    }
}

pub(crate) fn decode_horizontal_align(s: &str) -> HorizontalAlign {
    match s {
        "left" => HorizontalAlign::Left,
        "center" => HorizontalAlign::Center,
        "right" => HorizontalAlign::Right,
        "justify" => HorizontalAlign::Justify,
        "fill" => HorizontalAlign::Fill,
        "centerContinuous" => HorizontalAlign::CenterContinuous,
        _ => HorizontalAlign::General,
    }
}

pub(crate) fn decode_vertical_align(s: &str) -> VerticalAlign {
    match s {
        "top" => VerticalAlign::Top,
        "center" => VerticalAlign::Middle,
        "justify" => VerticalAlign::Justify,
        "distributed" => VerticalAlign::Distributed,
        _ => VerticalAlign::Bottom,
    }
}

pub(crate) fn decode_shared_strings(sst: &Sst) -> Vec<SharedStringItem> {
    sst.items
        .iter()
        .map(|si| {
            if !si.r.is_empty() {
                SharedStringItem::Rich(
                    si.r.iter()
                        .map(|r| RichRun {
                            font: r.r_pr.as_ref().and_then(|p| p.r_font.as_ref()).map(|f| f.val.clone()),
                            text: r.t.value.clone(),
                        })
                        .collect(),
                )
            } else {
                SharedStringItem::Text(si.t.as_ref().map(|t| t.value.clone()).unwrap_or_default())
            }
        })
        .collect()
}

fn decode_theme(bytes: &[u8]) -> ThemeColors {
    let parsed = theme::parse_theme_colors(bytes);
    let slots = parsed
        .colors
        .iter()
        .map(|hex| u32::from_str_radix(hex, 16).unwrap_or(0xFF000000))
        .collect();
    ThemeColors { slots }
}

/// Resolve a relationship `target` found in `source_part`'s `.rels` file to
/// a package-absolute part path. Leading-`/` targets are already absolute;
/// everything else is relative to `source_part`'s directory.
pub(crate) fn resolve_relationship_target(source_part: &str, target: &str) -> String {
    if let Some(stripped) = target.strip_prefix('/') {
        return stripped.to_string();
    }
    let dir = match source_part.rfind('/') {
        Some(idx) => &source_part[..idx],
        None => "",
    };
    let combined = if dir.is_empty() {
        target.to_string()
    } else {
        format!("{dir}/{target}")
    };
    normalize_path(&combined)
}

pub(crate) fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// The `.rels` sibling path for a given part, e.g. `xl/worksheets/sheet1.xml`
/// -> `xl/worksheets/_rels/sheet1.xml.rels`.
pub(crate) fn relationship_part_path(part_path: &str) -> String {
    match part_path.rfind('/') {
        Some(idx) => format!("{}/_rels/{}.rels", &part_path[..idx], &part_path[idx + 1..]),
        None => format!("_rels/{part_path}.rels"),
    }
}

pub(crate) fn read_bytes_part<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>, ReadError> {
    let mut file = archive.by_name(name).map_err(|_| ReadError::MissingPart(name.to_string()))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

pub(crate) fn read_string_part<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<String, ReadError> {
    let bytes = read_bytes_part(archive, name)?;
    String::from_utf8(bytes).map_err(|e| ReadError::MalformedXml {
        part: name.to_string(),
        location: e.to_string(),
    })
}

pub(crate) fn read_xml_part<T: serde::de::DeserializeOwned, R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<T, ReadError> {
    let xml = read_string_part(archive, name)?;
    from_xml_str(&xml).map_err(|e| ReadError::MalformedXml {
        part: name.to_string(),
        location: e.to_string(),
    })
}

/// Capture every ZIP entry not already claimed by [`from_archive`] so it
/// round-trips byte-exact through [`crate::writer`].
fn collect_manifest_parts<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    content_types: &ContentTypes,
    known_parts: &HashSet<String>,
) -> Result<Vec<ManifestPart>, ReadError> {
    let mut parts = Vec::new();
    for i in 0..archive.len() {
        let captured = {
            let mut entry = archive.by_index(i).map_err(|e| ReadError::InvalidZip(e.to_string()))?;
            if entry.is_dir() {
                None
            } else {
                let path = entry.name().to_string();
                if known_parts.contains(&path) {
                    None
                } else {
                    let mut bytes = Vec::new();
                    entry.read_to_end(&mut bytes)?;
                    let compression = match entry.compression() {
                        zip::CompressionMethod::Stored => CompressionKind::Stored,
                        _ => CompressionKind::Deflated,
                    };
                    Some((path, bytes, compression))
                }
            }
        };
        let Some((path, bytes, compression)) = captured else {
            continue;
        };
        let content_type = resolve_content_type(content_types, &path);
        parts.push(ManifestPart {
            path,
            content_type,
            bytes: Arc::new(bytes),
            compression,
        });
    }
    Ok(parts)
}

fn resolve_content_type(content_types: &ContentTypes, path: &str) -> String {
    let absolute = format!("/{path}");
    if let Some(over) = content_types.overrides.iter().find(|o| o.part_name == absolute) {
        return over.content_type.clone();
    }
    let ext = path.rsplit('.').next().unwrap_or("");
    content_types
        .defaults
        .iter()
        .find(|d| d.extension.eq_ignore_ascii_case(ext))
        .map(|d| d.content_type.clone())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AnchorMode;
    use crate::writer::write_to_buffer;

    fn aref(a1: &str) -> ARef {
        ARef::parse_a1(a1).unwrap()
    }

    #[test]
    fn round_trips_simple_workbook_through_write_and_read() {
        let sheet = Sheet::new("Sheet1")
            .put_value(aref("A1"), CellValue::from("hello"))
            .put_value(aref("B1"), CellValue::from(42i64))
            .put_value(aref("C1"), CellValue::from(true));
        let wb = Workbook::new().append_sheet(sheet).unwrap();
        let bytes = write_to_buffer(&wb).unwrap();

        let read_back = read_from_buffer(&bytes).unwrap();
        assert_eq!(read_back.sheets().len(), 1);
        let sheet = &read_back.sheets()[0];
        assert_eq!(sheet.name(), "Sheet1");
        assert_eq!(sheet.cell_value(aref("A1")), CellValue::Text("hello".to_string()));
        assert_eq!(sheet.cell_value(aref("B1")), CellValue::Number(Decimal::from(42)));
        assert_eq!(sheet.cell_value(aref("C1")), CellValue::Bool(true));
    }

    #[test]
    fn round_trips_styled_cell() {
        let style = CellStyle {
            font: Font {
                bold: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let sheet = Sheet::new("Sheet1").style_range(CellRange::single(aref("A1")), style, StyleApplyMode::Replace);
        let sheet = sheet.put_value(aref("A1"), CellValue::from("bold"));
        let wb = Workbook::new().append_sheet(sheet).unwrap();
        let bytes = write_to_buffer(&wb).unwrap();

        let read_back = read_from_buffer(&bytes).unwrap();
        let cell = read_back.sheets()[0].get(aref("A1")).unwrap();
        let style_id = cell.style_id.unwrap();
        let style = read_back.sheets()[0].style_registry().get(style_id).unwrap();
        assert!(style.font.bold);
    }

    #[test]
    fn round_trips_formula_with_cached_value() {
        let sheet = Sheet::new("Sheet1").put_value(
            aref("A1"),
            CellValue::formula("1+1", Some(CellValue::Number(Decimal::from(2)))),
        );
        let wb = Workbook::new().append_sheet(sheet).unwrap();
        let bytes = write_to_buffer(&wb).unwrap();

        let read_back = read_from_buffer(&bytes).unwrap();
        match read_back.sheets()[0].cell_value(aref("A1")) {
            CellValue::Formula { expr, cached } => {
                assert_eq!(expr, "1+1");
                assert_eq!(cached.as_deref(), Some(&CellValue::Number(Decimal::from(2))));
            }
            other => panic!("expected a formula cell, got {other:?}"),
        }
    }

    #[test]
    fn round_trips_error_cell() {
        let sheet = Sheet::new("Sheet1").put_value(aref("A1"), CellValue::Error(ErrorKind::Div0));
        let wb = Workbook::new().append_sheet(sheet).unwrap();
        let bytes = write_to_buffer(&wb).unwrap();

        let read_back = read_from_buffer(&bytes).unwrap();
        assert_eq!(read_back.sheets()[0].cell_value(aref("A1")), CellValue::Error(ErrorKind::Div0));
    }

    #[test]
    fn round_trips_merged_range() {
        let sheet = Sheet::new("Sheet1")
            .merge(CellRange::new(aref("A1"), aref("B2")))
            .unwrap();
        let wb = Workbook::new().append_sheet(sheet).unwrap();
        let bytes = write_to_buffer(&wb).unwrap();

        let read_back = read_from_buffer(&bytes).unwrap();
        assert_eq!(read_back.sheets()[0].merges().len(), 1);
        assert_eq!(read_back.sheets()[0].merges()[0].print_a1(), "A1:B2");
    }

    #[test]
    fn decode_num_fmt_resolves_builtin_dates() {
        let custom = HashMap::new();
        assert_eq!(decode_num_fmt(14, &custom), NumFmt::DateMdy);
        assert_eq!(decode_num_fmt(0, &custom), NumFmt::General);
    }

    #[test]
    fn decode_num_fmt_resolves_custom_codes() {
        let mut custom = HashMap::new();
        custom.insert(164, "#,##0.0000".to_string());
        assert_eq!(decode_num_fmt(164, &custom), NumFmt::Custom("#,##0.0000".to_string()));
    }

    #[test]
    fn relationship_target_resolves_relative_paths() {
        assert_eq!(
            resolve_relationship_target("xl/worksheets/sheet1.xml", "../drawings/drawing1.xml"),
            "xl/drawings/drawing1.xml"
        );
        assert_eq!(
            resolve_relationship_target("xl/workbook.xml", "worksheets/sheet1.xml"),
            "xl/worksheets/sheet1.xml"
        );
        assert_eq!(resolve_relationship_target("xl/workbook.xml", "/xl/styles.xml"), "xl/styles.xml");
    }

    #[test]
    fn relationship_part_path_builds_rels_sibling() {
        assert_eq!(
            relationship_part_path("xl/worksheets/sheet1.xml"),
            "xl/worksheets/_rels/sheet1.xml.rels"
        );
        assert_eq!(relationship_part_path("xl/workbook.xml"), "xl/_rels/workbook.xml.rels");
    }

    #[test]
    fn anchor_mode_is_ignored_on_parsed_refs() {
        let a = aref("$A$1");
        assert_eq!(a.anchor, AnchorMode::Absolute);
    }
}
