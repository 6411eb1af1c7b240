//! SAX -> StAX worksheet patch transformer.
//!
//! Applies a batch of cell/column/row/merge patches to one worksheet inside
//! an existing `.xlsx` package without rebuilding the workbook: the source
//! ZIP is streamed forward, untouched parts and untouched cells are copied
//! byte-for-byte, and only the target worksheet (plus `xl/styles.xml`, if a
//! style patch needs a new entry) is rewritten. Style merging reuses
//! [`crate::style_patcher`]; everything else streams through
//! [`quick_xml::Reader`] the way [`crate::metadata`]'s light scan does.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use xl_xml::styles::StyleSheet;
use xl_xml::worksheet::cell_types;

use crate::address::{ARef, CellRange, Column, Row};
use crate::cell::CellValue;
use crate::error::{ReadError, TransformError, WriteError};
use crate::sheet::{ColumnProps, RowProps};
use crate::style::{CellStyle, StyleApplyMode};
use crate::utils::{EARLY_ABORT_MIN_PART_SIZE, EARLY_ABORT_ROW_THRESHOLD};
use crate::writer::{col_entry, error_literal, serialize_xml, CompressionKind};

/// One change to apply to a single cell.
#[derive(Debug, Clone)]
pub enum CellPatch {
    /// Apply a style, leaving the cell's current value untouched.
    SetStyle { style: CellStyle, mode: StyleApplyMode },
    /// Replace the cell's value. `preserve_style` keeps the cell's current
    /// style id when true, or resets it to the default style when false.
    SetValue {
        value: CellValue,
        preserve_style: bool,
    },
    /// Replace both the value and the style in one patch.
    SetStyleAndValue {
        style: CellStyle,
        mode: StyleApplyMode,
        value: CellValue,
    },
}

impl CellPatch {
    fn style(&self) -> Option<(&CellStyle, StyleApplyMode)> {
        match self {
            CellPatch::SetStyle { style, mode } | CellPatch::SetStyleAndValue { style, mode, .. } => {
                Some((style, *mode))
            }
            CellPatch::SetValue { .. } => None,
        }
    }

    fn value(&self) -> Option<&CellValue> {
        match self {
            CellPatch::SetValue { value, .. } | CellPatch::SetStyleAndValue { value, .. } => Some(value),
            CellPatch::SetStyle { .. } => None,
        }
    }

    fn preserve_style(&self) -> bool {
        matches!(
            self,
            CellPatch::SetValue {
                preserve_style: true,
                ..
            }
        )
    }
}

/// A batch of changes for one worksheet, applied atomically by
/// [`apply_patches_to_buffer`]/[`apply_patches_to_path`].
#[derive(Debug, Clone, Default)]
pub struct WorksheetPatchSet {
    pub cells: HashMap<ARef, CellPatch>,
    /// `Some` replaces the worksheet's whole `<cols>` block (as run-length
    /// `(first, last, props)` triples); `None` leaves it untouched.
    pub cols: Option<Vec<(Column, Column, ColumnProps)>>,
    pub row_props: HashMap<Row, RowProps>,
    pub merge_additions: Vec<CellRange>,
    pub merge_removals: Vec<CellRange>,
}

impl WorksheetPatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn touches_cols_or_merges(&self) -> bool {
        self.cols.is_some() || !self.merge_additions.is_empty() || !self.merge_removals.is_empty()
    }
}

/// Apply `patches` to `sheet_name` inside an in-memory `.xlsx` buffer,
/// returning the patched package.
pub fn apply_patches_to_buffer(
    bytes: &[u8],
    sheet_name: &str,
    patches: &WorksheetPatchSet,
) -> Result<Vec<u8>, TransformError> {
    let cursor = Cursor::new(bytes);
    let mut archive = ZipArchive::new(cursor).map_err(|e| ReadError::InvalidZip(e.to_string()))?;
    transform_archive(&mut archive, sheet_name, patches)
}

/// Apply `patches` to `sheet_name` inside the `.xlsx` file at `path`,
/// replacing it atomically (write to a sibling temp file, then rename).
pub fn apply_patches_to_path(
    path: impl AsRef<Path>,
    sheet_name: &str,
    patches: &WorksheetPatchSet,
) -> Result<(), TransformError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let patched = apply_patches_to_buffer(&bytes, sheet_name, patches)?;

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, &patched)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn transform_archive<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    sheet_name: &str,
    patches: &WorksheetPatchSet,
) -> Result<Vec<u8>, TransformError> {
    let workbook_xml: xl_xml::workbook::WorkbookXml = crate::reader::read_xml_part(archive, "xl/workbook.xml")?;
    let workbook_rels: xl_xml::relationships::Relationships =
        crate::reader::read_xml_part(archive, "xl/_rels/workbook.xml.rels")?;

    let entry = workbook_xml
        .sheets
        .sheets
        .iter()
        .find(|s| s.name == sheet_name)
        .ok_or_else(|| ReadError::MissingPart(format!("sheet '{sheet_name}'")))?;
    let rel = workbook_rels
        .relationships
        .iter()
        .find(|r| r.id == entry.r_id)
        .ok_or_else(|| ReadError::MissingPart(format!("relationship {}", entry.r_id)))?;
    let sheet_part = crate::reader::resolve_relationship_target("xl/workbook.xml", &rel.target);

    let worksheet_bytes = crate::reader::read_bytes_part(archive, &sheet_part)?;

    let (style_map, new_stylesheet_xml) = resolve_style_patches(archive, &worksheet_bytes, patches)?;
    let patched_worksheet = transcode_worksheet(&worksheet_bytes, patches, &style_map)?;

    rewrite_zip(archive, &sheet_part, &patched_worksheet, new_stylesheet_xml.as_deref())
}

/// Resolve every patched cell's final style id: for style patches, merge
/// into `xl/styles.xml` via [`crate::style_patcher`]; for plain value
/// patches, either keep the cell's existing style id or clear it.
fn resolve_style_patches<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    worksheet_bytes: &[u8],
    patches: &WorksheetPatchSet,
) -> Result<(HashMap<ARef, Option<u32>>, Option<String>), TransformError> {
    let wanted: std::collections::HashSet<ARef> = patches.cells.keys().copied().collect();
    let existing_style_ids = scan_existing_styles(worksheet_bytes, &wanted)?;

    let mut final_styles: HashMap<ARef, Option<u32>> = HashMap::new();
    let mut stylesheet: Option<StyleSheet> = None;
    let mut changed = false;

    for (aref, patch) in &patches.cells {
        let existing_id = existing_style_ids.get(aref).copied().flatten();
        match patch.style() {
            Some((style, mode)) => {
                if stylesheet.is_none() {
                    stylesheet = Some(crate::reader::read_xml_part(archive, "xl/styles.xml")?);
                }
                let sheet = stylesheet.take().expect("just populated");
                let base = if mode == StyleApplyMode::Merge { existing_id } else { None };
                let (patched, id) = crate::style_patcher::patch_style(&sheet, base, style, mode);
                final_styles.insert(*aref, Some(id));
                stylesheet = Some(patched);
                changed = true;
            }
            None => {
                let kept = if patch.preserve_style() { existing_id } else { None };
                final_styles.insert(*aref, kept);
            }
        }
    }

    let new_stylesheet_xml = if changed {
        Some(serialize_xml(&stylesheet.expect("set whenever changed"))?)
    } else {
        None
    };
    Ok((final_styles, new_stylesheet_xml))
}

/// A single pass over the worksheet recording the `s=` attribute already on
/// every patched cell, so merge-mode style patches and style-preserving
/// value patches have a base to work from.
fn scan_existing_styles(
    bytes: &[u8],
    wanted: &std::collections::HashSet<ARef>,
) -> Result<HashMap<ARef, Option<u32>>, TransformError> {
    let mut reader = Reader::from_reader(Cursor::new(bytes));
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut found = HashMap::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if local_name_is(&e, b"c") => {
                let attrs = parse_cell_tag_attrs(&e);
                if let Ok(aref) = ARef::parse_a1(&attrs.r) {
                    if wanted.contains(&aref) {
                        found.insert(aref, attrs.s);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_err(e)),
        }
        buf.clear();
    }
    Ok(found)
}

/// Rewrite the worksheet part: replace `<cols>` (if patched), splice cell
/// and row patches into `<sheetData>`, and regenerate `<mergeCells>`.
fn transcode_worksheet(
    bytes: &[u8],
    patches: &WorksheetPatchSet,
    style_map: &HashMap<ARef, Option<u32>>,
) -> Result<Vec<u8>, TransformError> {
    let mut patches_by_row: BTreeMap<u32, Vec<ARef>> = BTreeMap::new();
    for aref in patches.cells.keys() {
        patches_by_row.entry(aref.row.display()).or_default().push(*aref);
    }
    for refs in patches_by_row.values_mut() {
        refs.sort_by_key(|a| a.col.index());
    }
    let max_patched_row = patches_by_row.keys().copied().max();

    let early_abort_eligible = !patches.touches_cols_or_merges()
        && bytes.len() as u64 > EARLY_ABORT_MIN_PART_SIZE
        && max_patched_row.map(|r| r < EARLY_ABORT_ROW_THRESHOLD).unwrap_or(true);

    let (head, sheet_data_end) = transcode_prefix_and_sheet_data(
        bytes,
        patches,
        style_map,
        &patches_by_row,
        early_abort_eligible,
        max_patched_row,
    )?;

    if sheet_data_end >= bytes.len() {
        return Ok(head);
    }

    let tail = &bytes[sheet_data_end..];
    let tail_out = if patches.merge_additions.is_empty() && patches.merge_removals.is_empty() {
        tail.to_vec()
    } else {
        rewrite_merge_cells(tail, patches)?
    };

    let mut out = head;
    out.extend_from_slice(&tail_out);
    Ok(out)
}

/// Copy everything up through `</sheetData>` (or splice the remainder in
/// directly, on the early-abort path), returning the produced bytes and the
/// offset in the original buffer where the caller's own copy should resume
/// (`bytes.len()` if the early-abort path already consumed the rest).
fn transcode_prefix_and_sheet_data(
    bytes: &[u8],
    patches: &WorksheetPatchSet,
    style_map: &HashMap<ARef, Option<u32>>,
    patches_by_row: &BTreeMap<u32, Vec<ARef>>,
    early_abort_eligible: bool,
    max_patched_row: Option<u32>,
) -> Result<(Vec<u8>, usize), TransformError> {
    let mut out = Vec::with_capacity(bytes.len() + 512);
    let mut reader = Reader::from_reader(Cursor::new(bytes));
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut last_pos: usize = 0;
    let mut pending_new_rows: VecDeque<u32> = patches_by_row.keys().copied().collect();

    loop {
        let pos_before = reader.buffer_position() as usize;
        let event = reader.read_event_into(&mut buf).map_err(xml_err)?;
        match event {
            Event::Start(e) if local_name_is(&e, b"cols") && patches.cols.is_some() => {
                out.extend_from_slice(&bytes[last_pos..pos_before]);
                let (_, after) = skip_to_end(&mut reader, &mut buf, b"cols")?;
                last_pos = after;
            }
            Event::Empty(e) if local_name_is(&e, b"cols") && patches.cols.is_some() => {
                out.extend_from_slice(&bytes[last_pos..pos_before]);
                last_pos = reader.buffer_position() as usize;
            }
            Event::Start(e) if local_name_is(&e, b"sheetData") => {
                out.extend_from_slice(&bytes[last_pos..pos_before]);
                if let Some(cols) = &patches.cols {
                    out.extend_from_slice(render_cols_block(cols).as_bytes());
                }
                let tag_end = reader.buffer_position() as usize;
                out.extend_from_slice(&bytes[pos_before..tag_end]);
                last_pos = tag_end;

                let (abort_now, end_pos) = process_rows(
                    &mut reader,
                    &mut buf,
                    bytes,
                    &mut out,
                    &mut last_pos,
                    patches,
                    style_map,
                    patches_by_row,
                    &mut pending_new_rows,
                    early_abort_eligible,
                    max_patched_row,
                )?;
                if abort_now {
                    return Ok((out, bytes.len()));
                }
                return Ok((out, end_pos));
            }
            Event::Empty(e) if local_name_is(&e, b"sheetData") => {
                out.extend_from_slice(&bytes[last_pos..pos_before]);
                if let Some(cols) = &patches.cols {
                    out.extend_from_slice(render_cols_block(cols).as_bytes());
                }
                if pending_new_rows.is_empty() {
                    let tag_end = reader.buffer_position() as usize;
                    out.extend_from_slice(&bytes[pos_before..tag_end]);
                    last_pos = tag_end;
                } else {
                    out.extend_from_slice(b"<sheetData>");
                    while let Some(row_num) = pending_new_rows.pop_front() {
                        emit_synthesized_row(&mut out, row_num, &patches_by_row[&row_num], patches, style_map);
                    }
                    out.extend_from_slice(b"</sheetData>");
                    last_pos = reader.buffer_position() as usize;
                }
                return Ok((out, last_pos));
            }
            Event::Eof => {
                out.extend_from_slice(&bytes[last_pos..]);
                return Ok((out, bytes.len()));
            }
            _ => {}
        }
        buf.clear();
    }
}

#[allow(clippy::too_many_arguments)]
fn process_rows(
    reader: &mut Reader<Cursor<&[u8]>>,
    buf: &mut Vec<u8>,
    bytes: &[u8],
    out: &mut Vec<u8>,
    last_pos: &mut usize,
    patches: &WorksheetPatchSet,
    style_map: &HashMap<ARef, Option<u32>>,
    patches_by_row: &BTreeMap<u32, Vec<ARef>>,
    pending_new_rows: &mut VecDeque<u32>,
    early_abort_eligible: bool,
    max_patched_row: Option<u32>,
) -> Result<(bool, usize), TransformError> {
    loop {
        let pos_before = reader.buffer_position() as usize;
        let event = reader.read_event_into(buf).map_err(xml_err)?;
        match event {
            Event::End(e) if local_name_is(&e, b"sheetData") => {
                out.extend_from_slice(&bytes[*last_pos..pos_before]);
                while let Some(row_num) = pending_new_rows.pop_front() {
                    emit_synthesized_row(out, row_num, &patches_by_row[&row_num], patches, style_map);
                }
                let tag_end = reader.buffer_position() as usize;
                out.extend_from_slice(&bytes[pos_before..tag_end]);
                *last_pos = tag_end;
                return Ok((false, tag_end));
            }
            Event::Start(e) if local_name_is(&e, b"row") => {
                let attrs = parse_row_attrs(&e);
                out.extend_from_slice(&bytes[*last_pos..pos_before]);
                flush_new_rows_before(out, pending_new_rows, attrs.r, patches_by_row, patches, style_map);

                let content_start = reader.buffer_position() as usize;
                let (children_end, after_end) = skip_to_end(reader, buf, b"row")?;
                let row_patches = patches_by_row.get(&attrs.r);
                emit_row(
                    out,
                    bytes,
                    pos_before,
                    content_start,
                    children_end,
                    after_end,
                    &attrs,
                    row_patches,
                    patches,
                    style_map,
                )?;
                *last_pos = after_end;

                if early_abort_eligible && pending_new_rows.is_empty() && attrs.r >= max_patched_row.unwrap_or(0) {
                    out.extend_from_slice(&bytes[after_end..]);
                    return Ok((true, bytes.len()));
                }
            }
            Event::Empty(e) if local_name_is(&e, b"row") => {
                let attrs = parse_row_attrs(&e);
                out.extend_from_slice(&bytes[*last_pos..pos_before]);
                flush_new_rows_before(out, pending_new_rows, attrs.r, patches_by_row, patches, style_map);

                let tag_end = reader.buffer_position() as usize;
                let row_patches = patches_by_row.get(&attrs.r);
                emit_row(
                    out,
                    bytes,
                    pos_before,
                    tag_end,
                    tag_end,
                    tag_end,
                    &attrs,
                    row_patches,
                    patches,
                    style_map,
                )?;
                *last_pos = tag_end;

                if early_abort_eligible && pending_new_rows.is_empty() && attrs.r >= max_patched_row.unwrap_or(0) {
                    out.extend_from_slice(&bytes[tag_end..]);
                    return Ok((true, bytes.len()));
                }
            }
            Event::Eof => return Err(malformed("unexpected end of worksheet inside <sheetData>")),
            _ => {}
        }
        buf.clear();
    }
}

fn flush_new_rows_before(
    out: &mut Vec<u8>,
    pending: &mut VecDeque<u32>,
    before_row: u32,
    patches_by_row: &BTreeMap<u32, Vec<ARef>>,
    patches: &WorksheetPatchSet,
    style_map: &HashMap<ARef, Option<u32>>,
) {
    while let Some(&row_num) = pending.front() {
        if row_num >= before_row {
            break;
        }
        pending.pop_front();
        emit_synthesized_row(out, row_num, &patches_by_row[&row_num], patches, style_map);
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_row(
    out: &mut Vec<u8>,
    bytes: &[u8],
    tag_start: usize,
    content_start: usize,
    children_end: usize,
    after_end: usize,
    attrs: &RowAttrs,
    row_patches: Option<&Vec<ARef>>,
    patches: &WorksheetPatchSet,
    style_map: &HashMap<ARef, Option<u32>>,
) -> Result<(), TransformError> {
    let row_override = Row::new(attrs.r.saturating_sub(1))
        .ok()
        .and_then(|r| patches.row_props.get(&r))
        .copied();

    if row_patches.is_none() && row_override.is_none() {
        out.extend_from_slice(&bytes[tag_start..after_end]);
        return Ok(());
    }

    let effective = row_override.unwrap_or(RowProps {
        height: attrs.ht,
        hidden: attrs.hidden,
        outline_level: attrs.outline_level,
    });
    out.extend_from_slice(open_row_tag(attrs.r, attrs.spans.as_deref(), effective).as_bytes());

    if content_start == children_end {
        if let Some(refs) = row_patches {
            for aref in refs {
                out.extend_from_slice(render_synthesized_cell(*aref, patches, style_map).as_bytes());
            }
        }
    } else {
        splice_cells(out, &bytes[content_start..children_end], row_patches, patches, style_map)?;
    }
    out.extend_from_slice(b"</row>");
    Ok(())
}

fn emit_synthesized_row(
    out: &mut Vec<u8>,
    row_num: u32,
    refs: &[ARef],
    patches: &WorksheetPatchSet,
    style_map: &HashMap<ARef, Option<u32>>,
) {
    let props = Row::new(row_num.saturating_sub(1))
        .ok()
        .and_then(|r| patches.row_props.get(&r))
        .copied()
        .unwrap_or_default();
    out.extend_from_slice(open_row_tag(row_num, None, props).as_bytes());
    for aref in refs {
        out.extend_from_slice(render_synthesized_cell(*aref, patches, style_map).as_bytes());
    }
    out.extend_from_slice(b"</row>");
}

fn open_row_tag(r: u32, spans: Option<&str>, props: RowProps) -> String {
    let mut tag = format!("<row r=\"{r}\"");
    if let Some(spans) = spans {
        tag.push_str(&format!(" spans=\"{spans}\""));
    }
    if let Some(h) = props.height {
        tag.push_str(&format!(" ht=\"{h}\" customHeight=\"1\""));
    }
    if props.hidden {
        tag.push_str(" hidden=\"1\"");
    }
    if props.outline_level != 0 {
        tag.push_str(&format!(" outlineLevel=\"{}\"", props.outline_level));
    }
    tag.push('>');
    tag
}

/// Merge the row's existing `<c>` elements with any patched cells, in
/// strictly increasing column order. Untouched cells are copied verbatim;
/// patched existing cells are rewritten; patched cells absent from the
/// source row are synthesized in place.
fn splice_cells(
    out: &mut Vec<u8>,
    cell_bytes: &[u8],
    row_patches: Option<&Vec<ARef>>,
    patches: &WorksheetPatchSet,
    style_map: &HashMap<ARef, Option<u32>>,
) -> Result<(), TransformError> {
    let mut remaining: BTreeMap<u32, ARef> = row_patches
        .map(|refs| refs.iter().map(|a| (a.col.index(), *a)).collect())
        .unwrap_or_default();

    let mut reader = Reader::from_reader(Cursor::new(cell_bytes));
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    loop {
        let pos_before = reader.buffer_position() as usize;
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) if local_name_is(&e, b"c") => {
                let attrs = parse_cell_tag_attrs(&e);
                let aref = ARef::parse_a1(&attrs.r).ok();
                if let Some(col) = aref.map(|a| a.col.index()) {
                    emit_new_cells_before(out, &mut remaining, col, patches, style_map);
                }
                let content_start = reader.buffer_position() as usize;
                let (children_end, after_end) = skip_to_end(&mut reader, &mut buf, b"c")?;
                emit_existing_or_patched_cell(
                    out,
                    cell_bytes,
                    pos_before,
                    content_start,
                    after_end,
                    &attrs,
                    aref,
                    &mut remaining,
                    patches,
                    style_map,
                );
                let _ = children_end;
            }
            Event::Empty(e) if local_name_is(&e, b"c") => {
                let attrs = parse_cell_tag_attrs(&e);
                let aref = ARef::parse_a1(&attrs.r).ok();
                if let Some(col) = aref.map(|a| a.col.index()) {
                    emit_new_cells_before(out, &mut remaining, col, patches, style_map);
                }
                let tag_end = reader.buffer_position() as usize;
                emit_existing_or_patched_cell(
                    out, cell_bytes, pos_before, tag_end, tag_end, &attrs, aref, &mut remaining, patches, style_map,
                );
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    for (_, aref) in remaining {
        out.extend_from_slice(render_synthesized_cell(aref, patches, style_map).as_bytes());
    }
    Ok(())
}

fn emit_new_cells_before(
    out: &mut Vec<u8>,
    remaining: &mut BTreeMap<u32, ARef>,
    before_col: u32,
    patches: &WorksheetPatchSet,
    style_map: &HashMap<ARef, Option<u32>>,
) {
    let cols: Vec<u32> = remaining.range(..before_col).map(|(c, _)| *c).collect();
    for c in cols {
        if let Some(aref) = remaining.remove(&c) {
            out.extend_from_slice(render_synthesized_cell(aref, patches, style_map).as_bytes());
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_existing_or_patched_cell(
    out: &mut Vec<u8>,
    bytes: &[u8],
    tag_start: usize,
    content_start: usize,
    after_end: usize,
    attrs: &CellTagAttrs,
    aref: Option<ARef>,
    remaining: &mut BTreeMap<u32, ARef>,
    patches: &WorksheetPatchSet,
    style_map: &HashMap<ARef, Option<u32>>,
) {
    let patch = aref.and_then(|a| {
        remaining.remove(&a.col.index());
        patches.cells.get(&a)
    });

    match (aref, patch) {
        (Some(a), Some(CellPatch::SetStyle { .. })) => {
            let style = style_map.get(&a).copied().flatten();
            let self_close = content_start == after_end;
            out.extend_from_slice(build_cell_open_tag(attrs, style, self_close).as_bytes());
            if !self_close {
                out.extend_from_slice(&bytes[content_start..after_end]);
            }
        }
        (Some(a), Some(patch)) => {
            let style = style_map.get(&a).copied().flatten();
            let value = patch.value().expect("value or style+value patch");
            out.extend_from_slice(render_patch_cell(&attrs.r, style, value).as_bytes());
        }
        _ => {
            out.extend_from_slice(&bytes[tag_start..after_end]);
        }
    }
}

fn render_synthesized_cell(aref: ARef, patches: &WorksheetPatchSet, style_map: &HashMap<ARef, Option<u32>>) -> String {
    let patch = &patches.cells[&aref];
    let style = style_map.get(&aref).copied().flatten();
    let r = aref.print_a1();
    render_patch_cell(&r, style, patch.value().unwrap_or(&CellValue::Empty))
}

fn render_patch_cell(r: &str, style: Option<u32>, value: &CellValue) -> String {
    let mut tag = format!("<c r=\"{r}\"");
    if let Some(s) = style {
        tag.push_str(&format!(" s=\"{s}\""));
    }
    if matches!(value, CellValue::Empty) {
        tag.push_str("/>");
        return tag;
    }

    match value {
        CellValue::Empty => unreachable!("handled above"),
        CellValue::Number(n) => {
            tag.push('>');
            tag.push_str(&format!("<v>{n}</v></c>"));
        }
        CellValue::Bool(b) => {
            tag.push_str(&format!(" t=\"{}\"><v>{}</v></c>", cell_types::BOOLEAN, if *b { 1 } else { 0 }));
        }
        CellValue::Error(kind) => {
            tag.push_str(&format!(" t=\"{}\"><v>{}</v></c>", cell_types::ERROR, error_literal(*kind)));
        }
        CellValue::DateTime(dt) => {
            tag.push_str(&format!("><v>{}</v></c>", crate::cell::datetime_to_serial(*dt)));
        }
        CellValue::Text(text) => {
            tag.push_str(&format!(
                " t=\"{}\"><is><t xml:space=\"preserve\">{}</t></is></c>",
                cell_types::INLINE_STRING,
                escape(text)
            ));
        }
        CellValue::RichText(runs) => {
            let text: String = runs.iter().map(|r| r.text.as_str()).collect();
            tag.push_str(&format!(
                " t=\"{}\"><is><t xml:space=\"preserve\">{}</t></is></c>",
                cell_types::INLINE_STRING,
                escape(&text)
            ));
        }
        CellValue::Formula { expr, cached } => {
            let (t_attr, v) = match cached.as_deref() {
                Some(CellValue::Text(text)) => (Some(cell_types::FORMULA_STRING), Some(text.clone())),
                Some(CellValue::Number(n)) => (None, Some(n.to_string())),
                Some(CellValue::Bool(b)) => (Some(cell_types::BOOLEAN), Some(if *b { "1".to_string() } else { "0".to_string() })),
                Some(CellValue::Error(k)) => (Some(cell_types::ERROR), Some(error_literal(*k))),
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

struct CellTagAttrs {
    r: String,
    s: Option<u32>,
    t: Option<String>,
}

fn parse_cell_tag_attrs(e: &BytesStart<'_>) -> CellTagAttrs {
    let mut r = String::new();
    let mut s = None;
    let mut t = None;
    for attr in e.attributes().flatten() {
        let value = std::str::from_utf8(&attr.value).unwrap_or_default().to_string();
        match attr.key.as_ref() {
            b"r" => r = value,
            b"s" => s = value.parse().ok(),
            b"t" => t = Some(value),
            _ => {}
        }
    }
    CellTagAttrs { r, s, t }
}

fn build_cell_open_tag(attrs: &CellTagAttrs, style: Option<u32>, self_close: bool) -> String {
    let mut tag = format!("<c r=\"{}\"", attrs.r);
    if let Some(s) = style {
        tag.push_str(&format!(" s=\"{s}\""));
    }
    if let Some(t) = &attrs.t {
        tag.push_str(&format!(" t=\"{t}\""));
    }
    tag.push_str(if self_close { "/>" } else { ">" });
    tag
}

struct RowAttrs {
    r: u32,
    spans: Option<String>,
    ht: Option<f64>,
    hidden: bool,
    outline_level: u8,
}

fn parse_row_attrs(e: &BytesStart<'_>) -> RowAttrs {
    let mut r = 0u32;
    let mut spans = None;
    let mut ht = None;
    let mut hidden = false;
    let mut outline_level = 0u8;
    for attr in e.attributes().flatten() {
        let value = std::str::from_utf8(&attr.value).unwrap_or_default();
        match attr.key.as_ref() {
            b"r" => r = value.parse().unwrap_or(0),
            b"spans" => spans = Some(value.to_string()),
            b"ht" => ht = value.parse().ok(),
            b"hidden" => hidden = value == "1" || value == "true",
            b"outlineLevel" => outline_level = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    RowAttrs {
        r,
        spans,
        ht,
        hidden,
        outline_level,
    }
}

fn render_cols_block(cols: &[(Column, Column, ColumnProps)]) -> String {
    let entries: Vec<_> = cols
        .iter()
        .map(|(min, max, props)| col_entry(min.index(), max.index(), *props))
        .filter(|c| c.width.is_some() || c.hidden == Some(true))
        .collect();
    if entries.is_empty() {
        return String::new();
    }
    let mut s = String::from("<cols>");
    for c in &entries {
        s.push_str(&format!("<col min=\"{}\" max=\"{}\"", c.min, c.max));
        if let Some(w) = c.width {
            s.push_str(&format!(" width=\"{w}\""));
        }
        if c.custom_width == Some(true) {
            s.push_str(" customWidth=\"1\"");
        }
        if c.hidden == Some(true) {
            s.push_str(" hidden=\"1\"");
        }
        if let Some(ol) = c.outline_level {
            s.push_str(&format!(" outlineLevel=\"{ol}\""));
        }
        s.push_str("/>");
    }
    s.push_str("</cols>");
    s
}

/// Advance `reader` past the matching close tag for an already-consumed
/// start tag named `tag` (neither `row`'s nor `cols`'s children ever nest a
/// same-named element, so the first matching end tag is always the match).
/// Returns `(children_end, after_end)`: the offset right before the close
/// tag, and right after it.
fn skip_to_end(
    reader: &mut Reader<Cursor<&[u8]>>,
    buf: &mut Vec<u8>,
    tag: &[u8],
) -> Result<(usize, usize), TransformError> {
    loop {
        let pos_before = reader.buffer_position() as usize;
        match reader.read_event_into(buf).map_err(xml_err)? {
            Event::End(e) if e.local_name().as_ref() == tag => {
                let after = reader.buffer_position() as usize;
                return Ok((pos_before, after));
            }
            Event::Eof => {
                return Err(malformed(&format!(
                    "unexpected end of worksheet inside <{}>",
                    String::from_utf8_lossy(tag)
                )))
            }
            _ => {}
        }
        buf.clear();
    }
}

/// Remove the original `<mergeCells>` block (if any) from `tail` and emit a
/// replacement reflecting `merge_additions`/`merge_removals`.
fn rewrite_merge_cells(tail: &[u8], patches: &WorksheetPatchSet) -> Result<Vec<u8>, TransformError> {
    let mut reader = Reader::from_reader(Cursor::new(tail));
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut existing: Vec<CellRange> = Vec::new();
    let mut span: Option<(usize, usize)> = None;

    loop {
        let pos_before = reader.buffer_position() as usize;
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            Event::Start(e) if local_name_is(&e, b"mergeCells") => {
                let (_, after) = skip_to_end(&mut reader, &mut buf, b"mergeCells")?;
                existing = parse_merge_refs(&tail[pos_before..after]);
                span = Some((pos_before, after));
                break;
            }
            Event::Empty(e) if local_name_is(&e, b"mergeCells") => {
                let after = reader.buffer_position() as usize;
                span = Some((pos_before, after));
                break;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let mut final_merges: Vec<CellRange> = existing
        .into_iter()
        .filter(|m| !patches.merge_removals.iter().any(|r| r == m))
        .collect();
    for add in &patches.merge_additions {
        if !final_merges.contains(add) {
            final_merges.push(*add);
        }
    }

    let new_block = if final_merges.is_empty() {
        String::new()
    } else {
        let mut s = format!("<mergeCells count=\"{}\">", final_merges.len());
        for m in &final_merges {
            s.push_str(&format!("<mergeCell ref=\"{}\"/>", m.print_a1()));
        }
        s.push_str("</mergeCells>");
        s
    };

    let mut out = Vec::with_capacity(tail.len());
    match span {
        Some((start, end)) => {
            out.extend_from_slice(&tail[..start]);
            out.extend_from_slice(new_block.as_bytes());
            out.extend_from_slice(&tail[end..]);
        }
        None => {
            out.extend_from_slice(new_block.as_bytes());
            out.extend_from_slice(tail);
        }
    }
    Ok(out)
}

fn parse_merge_refs(block: &[u8]) -> Vec<CellRange> {
    let mut reader = Reader::from_reader(Cursor::new(block));
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut refs = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) if local_name_is(&e, b"mergeCell") => {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"ref" {
                        if let Ok(s) = std::str::from_utf8(&attr.value) {
                            if let Ok(range) = CellRange::parse_a1(s) {
                                refs.push(range);
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    refs
}

/// Copy the source ZIP entry-for-entry, substituting the patched worksheet
/// part and (if a style patch produced one) the patched `xl/styles.xml`.
fn rewrite_zip<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    sheet_part: &str,
    new_worksheet: &[u8],
    new_styles: Option<&str>,
) -> Result<Vec<u8>, TransformError> {
    let mut out = Vec::new();
    {
        let mut zip = ZipWriter::new(Cursor::new(&mut out));
        for i in 0..archive.len() {
            let mut source = archive.by_index(i).map_err(|e| ReadError::InvalidZip(e.to_string()))?;
            if source.is_dir() {
                continue;
            }
            let name = source.name().to_string();
            let compression = match source.compression() {
                zip::CompressionMethod::Stored => CompressionKind::Stored,
                _ => CompressionKind::Deflated,
            };
            let options = SimpleFileOptions::default().compression_method(compression.to_zip_method());
            zip.start_file(&name, options)
                .map_err(|e| WriteError::IoFailure(std::io::Error::other(e)))?;

            if name == sheet_part {
                zip.write_all(new_worksheet)?;
            } else if name == "xl/styles.xml" {
                if let Some(styles) = new_styles {
                    zip.write_all(styles.as_bytes())?;
                } else {
                    std::io::copy(&mut source, &mut zip)?;
                }
            } else {
                std::io::copy(&mut source, &mut zip)?;
            }
        }
        zip.finish().map_err(|e| WriteError::IoFailure(std::io::Error::other(e)))?;
    }
    Ok(out)
}

fn local_name_is(e: &BytesStart<'_>, name: &[u8]) -> bool {
    e.local_name().as_ref() == name
}

fn xml_err(e: quick_xml::Error) -> TransformError {
    ReadError::MalformedXml {
        part: "worksheet".to_string(),
        location: e.to_string(),
    }
    .into()
}

fn malformed(msg: &str) -> TransformError {
    ReadError::MalformedXml {
        part: "worksheet".to_string(),
        location: msg.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ARef;
    use crate::sheet::Sheet;
    use crate::style::Font;
    use crate::workbook::Workbook;
    use crate::writer::write_to_buffer;

    fn fixture() -> Vec<u8> {
        let sheet = Sheet::new("Sheet1")
            .put_value(ARef::parse_a1("A1").unwrap(), CellValue::from("hello"))
            .put_value(ARef::parse_a1("B1").unwrap(), CellValue::Number(1.into()));
        let wb = Workbook::new().append_sheet(sheet).unwrap();
        write_to_buffer(&wb).unwrap()
    }

    #[test]
    fn set_value_on_existing_cell_round_trips() {
        let bytes = fixture();
        let mut patches = WorksheetPatchSet::new();
        patches.cells.insert(
            ARef::parse_a1("A1").unwrap(),
            CellPatch::SetValue {
                value: CellValue::from("patched"),
                preserve_style: true,
            },
        );

        let out = apply_patches_to_buffer(&bytes, "Sheet1", &patches).unwrap();
        let wb = crate::reader::read_from_buffer(&out).unwrap();
        let sheet = wb.sheet("Sheet1").unwrap();
        assert_eq!(sheet.cell_value(ARef::parse_a1("A1").unwrap()), CellValue::from("patched"));
        assert_eq!(sheet.cell_value(ARef::parse_a1("B1").unwrap()), CellValue::Number(1.into()));
    }

    #[test]
    fn synthesizes_a_cell_in_a_row_with_no_source_entry() {
        let bytes = fixture();
        let mut patches = WorksheetPatchSet::new();
        patches.cells.insert(
            ARef::parse_a1("C5").unwrap(),
            CellPatch::SetValue {
                value: CellValue::Number(42.into()),
                preserve_style: false,
            },
        );

        let out = apply_patches_to_buffer(&bytes, "Sheet1", &patches).unwrap();
        let wb = crate::reader::read_from_buffer(&out).unwrap();
        let sheet = wb.sheet("Sheet1").unwrap();
        assert_eq!(sheet.cell_value(ARef::parse_a1("C5").unwrap()), CellValue::Number(42.into()));
        assert_eq!(sheet.cell_value(ARef::parse_a1("A1").unwrap()), CellValue::from("hello"));
    }

    #[test]
    fn set_style_only_preserves_existing_value() {
        let bytes = fixture();
        let mut patches = WorksheetPatchSet::new();
        patches.cells.insert(
            ARef::parse_a1("A1").unwrap(),
            CellPatch::SetStyle {
                style: CellStyle {
                    font: Font {
                        bold: true,
                        ..Default::default()
                    },
                    ..Default::default()
                },
                mode: StyleApplyMode::Replace,
            },
        );

        let out = apply_patches_to_buffer(&bytes, "Sheet1", &patches).unwrap();
        let wb = crate::reader::read_from_buffer(&out).unwrap();
        let sheet = wb.sheet("Sheet1").unwrap();
        assert_eq!(sheet.cell_value(ARef::parse_a1("A1").unwrap()), CellValue::from("hello"));
        let style_id = sheet.get(ARef::parse_a1("A1").unwrap()).unwrap().style_id.unwrap();
        assert!(sheet.style_registry().get(style_id).unwrap().font.bold);
    }

    #[test]
    fn merge_additions_and_removals_apply() {
        let sheet = Sheet::new("Sheet1").put_value(ARef::parse_a1("A1").unwrap(), CellValue::from("x"));
        let sheet = sheet.merge(CellRange::parse_a1("A1:B1").unwrap()).unwrap();
        let wb = Workbook::new().append_sheet(sheet).unwrap();
        let bytes = write_to_buffer(&wb).unwrap();

        let mut patches = WorksheetPatchSet::new();
        patches.merge_removals.push(CellRange::parse_a1("A1:B1").unwrap());
        patches.merge_additions.push(CellRange::parse_a1("C1:D1").unwrap());

        let out = apply_patches_to_buffer(&bytes, "Sheet1", &patches).unwrap();
        let wb = crate::reader::read_from_buffer(&out).unwrap();
        let sheet = wb.sheet("Sheet1").unwrap();
        assert_eq!(sheet.merges(), &[CellRange::parse_a1("C1:D1").unwrap()]);
    }

    #[test]
    fn cols_replacement_applies() {
        let bytes = fixture();
        let mut patches = WorksheetPatchSet::new();
        patches.cols = Some(vec![(
            Column::new(0).unwrap(),
            Column::new(0).unwrap(),
            ColumnProps {
                width: Some(30.0),
                hidden: false,
                outline_level: 0,
            },
        )]);

        let out = apply_patches_to_buffer(&bytes, "Sheet1", &patches).unwrap();
        let wb = crate::reader::read_from_buffer(&out).unwrap();
        let sheet = wb.sheet("Sheet1").unwrap();
        assert_eq!(sheet.col_props(Column::new(0).unwrap()).width, Some(30.0));
    }

    #[test]
    fn row_props_override_applies_to_existing_row() {
        let bytes = fixture();
        let mut patches = WorksheetPatchSet::new();
        patches.row_props.insert(
            Row::new(0).unwrap(),
            RowProps {
                height: Some(40.0),
                hidden: false,
                outline_level: 0,
            },
        );

        let out = apply_patches_to_buffer(&bytes, "Sheet1", &patches).unwrap();
        let wb = crate::reader::read_from_buffer(&out).unwrap();
        let sheet = wb.sheet("Sheet1").unwrap();
        assert_eq!(sheet.row_props(Row::new(0).unwrap()).height, Some(40.0));
    }
}
