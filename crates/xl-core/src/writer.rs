//! Serializes an in-memory [`Workbook`](crate::workbook::Workbook) into an
//! `.xlsx` ZIP package.
//!
//! Part order, compression, and shared-string policy are all pinned so the
//! same workbook value always produces the same bytes: `[Content_Types].xml`,
//! `_rels/.rels`, `xl/workbook.xml`, `xl/_rels/workbook.xml.rels`, each
//! worksheet, `xl/styles.xml`, `xl/sharedStrings.xml` (only if referenced),
//! the theme, `docProps/*`, and finally any untouched [`ManifestPart`]s
//! streamed through unchanged.

use std::collections::HashMap;
use std::io::{Seek, Write};

use quick_xml::se::to_string as to_xml_string;
use serde::Serialize;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use xl_xml::content_types::{mime_types, ContentTypeDefault, ContentTypeOverride, ContentTypes};
use xl_xml::relationships::{self, rel_types, Relationship, Relationships};
use xl_xml::shared_strings::{Si, Sst, T};
use xl_xml::styles::{
    self, Border as XmlBorder, BorderSide as XmlBorderSide, Borders, CellStyleXfs, CellXfs, Color as XmlColor,
    Fill as XmlFill, Fills, Font as XmlFont, FontFamily, FontName, FontScheme, FontSize, Fonts, NumFmt as XmlNumFmt,
    NumFmts, PatternFill, StyleSheet, Underline, Xf,
};
use xl_xml::workbook::{
    BookViews, CalcPr, DefinedName as XmlDefinedName, DefinedNames, Sheets, SheetEntry, WorkbookPr, WorkbookView,
    WorkbookXml,
};
use xl_xml::worksheet::{
    cell_types, Cell as XmlCell, CellFormula, Col, Cols, Dimension, Hyperlink, Hyperlinks, MergeCell, MergeCells,
    Row as XmlRow, SheetData, WorksheetXml,
};

use crate::address::{ARef, Column, Row as AddrRow};
use crate::cell::{Cell, CellValue, ErrorKind};
use crate::error::WriteError;
use crate::sheet::{Sheet, Visibility};
use crate::style::{
    Align, Border, BorderLineStyle, BorderSide, CellStyle, Color as StyleColor, Fill, Font, HorizontalAlign, NumFmt,
    PatternType, VerticalAlign,
};
use crate::utils::CUSTOM_NUM_FMT_BASE;
use crate::workbook::Workbook;

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;

/// How a ZIP entry was (or should be) compressed. Carried on
/// [`ManifestPart`](crate::workbook::ManifestPart) so untouched parts
/// round-trip with their original compression method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    Stored,
    Deflated,
}

impl CompressionKind {
    pub(crate) fn to_zip_method(self) -> CompressionMethod {
        match self {
            Self::Stored => CompressionMethod::Stored,
            Self::Deflated => CompressionMethod::Deflated,
        }
    }
}

/// Serialize `workbook` to a new in-memory `.xlsx` buffer.
pub fn write_to_buffer(workbook: &Workbook) -> Result<Vec<u8>, WriteError> {
    let mut buf = Vec::new();
    {
        let cursor = std::io::Cursor::new(&mut buf);
        let mut zip = ZipWriter::new(cursor);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        write_zip_contents(workbook, &mut zip, options)?;
        zip.finish().map_err(|e| WriteError::IoFailure(std::io::Error::other(e)))?;
    }
    Ok(buf)
}

/// Serialize `workbook` directly to a file.
pub fn write_to_path(workbook: &Workbook, path: impl AsRef<std::path::Path>) -> Result<(), WriteError> {
    let file = std::fs::File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    write_zip_contents(workbook, &mut zip, options)?;
    zip.finish().map_err(|e| WriteError::IoFailure(std::io::Error::other(e)))?;
    Ok(())
}

/// A style merged from every sheet's local registry into one global table,
/// plus a per-sheet lookup from local style id to global style id.
struct MergedStyles {
    sheet: StyleSheet,
    /// `remap[sheet_index][local_style_id] -> global xf index`.
    remap: Vec<HashMap<u32, u32>>,
}

/// A deduplicated shared string table built from every referenced text/rich
/// text value across all sheets.
struct SharedStrings {
    items: Vec<Si>,
    index: HashMap<String, u32>,
    /// Total (non-unique) reference count, for `sst`'s `count` attribute.
    total_refs: u32,
}

impl SharedStrings {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            total_refs: 0,
        }
    }

    fn intern(&mut self, text: &str) -> u32 {
        self.total_refs += 1;
        if let Some(&id) = self.index.get(text) {
            return id;
        }
        let id = self.items.len() as u32;
        self.items.push(Si {
            t: Some(T {
                xml_space: preserve_space(text),
                value: text.to_string(),
            }),
            r: Vec::new(),
        });
        self.index.insert(text.to_string(), id);
        id
    }
}

fn preserve_space(text: &str) -> Option<String> {
    let needs_preserve = text.starts_with(' ') || text.ends_with(' ') || text.contains('\t') || text.contains('\n');
    needs_preserve.then(|| "preserve".to_string())
}

fn write_zip_contents<W: Write + Seek>(
    workbook: &Workbook,
    zip: &mut ZipWriter<W>,
    options: SimpleFileOptions,
) -> Result<(), WriteError> {
    let merged_styles = merge_style_registries(workbook);
    let mut sst = SharedStrings::new();

    let rendered_sheets: Vec<(WorksheetXml, Vec<(String, Hyperlink)>)> = workbook
        .sheets()
        .iter()
        .enumerate()
        .map(|(idx, sheet)| render_worksheet(sheet, idx, &merged_styles, &mut sst))
        .collect();

    let uses_shared_strings = !sst.items.is_empty();

    let content_types = build_content_types(workbook, uses_shared_strings);
    write_xml_part(zip, "[Content_Types].xml", &content_types, options)?;

    write_xml_part(zip, "_rels/.rels", &relationships::package_rels(), options)?;

    let workbook_xml = build_workbook_xml(workbook);
    write_xml_part(zip, "xl/workbook.xml", &workbook_xml, options)?;

    let workbook_rels = build_workbook_rels(workbook.sheets().len(), uses_shared_strings);
    write_xml_part(zip, "xl/_rels/workbook.xml.rels", &workbook_rels, options)?;

    for (idx, (worksheet, _hyperlinks)) in rendered_sheets.iter().enumerate() {
        let name = format!("xl/worksheets/sheet{}.xml", idx + 1);
        write_xml_part(zip, &name, worksheet, options)?;
    }

    write_xml_part(zip, "xl/styles.xml", &merged_styles.sheet, options)?;

    if uses_shared_strings {
        let sst_xml = Sst {
            xmlns: xl_xml::namespaces::SPREADSHEET_ML.to_string(),
            count: Some(sst.total_refs),
            unique_count: Some(sst.items.len() as u32),
            items: sst.items,
        };
        write_xml_part(zip, "xl/sharedStrings.xml", &sst_xml, options)?;
    }

    write_theme(zip, workbook, options)?;

    for part in workbook.part_manifest() {
        let part_options = SimpleFileOptions::default().compression_method(part.compression.to_zip_method());
        zip.start_file(part.path.trim_start_matches('/'), part_options)
            .map_err(|e| WriteError::IoFailure(std::io::Error::other(e)))?;
        zip.write_all(&part.bytes)?;
    }

    Ok(())
}

fn write_theme<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    workbook: &Workbook,
    options: SimpleFileOptions,
) -> Result<(), WriteError> {
    if workbook
        .part_manifest()
        .iter()
        .any(|p| p.path.trim_start_matches('/') == "xl/theme/theme1.xml")
    {
        // The manifest already carries a preserved theme1.xml; don't double-write it.
        return Ok(());
    }
    zip.start_file("xl/theme/theme1.xml", options)
        .map_err(|e| WriteError::IoFailure(std::io::Error::other(e)))?;
    zip.write_all(default_theme_xml().as_bytes())?;
    Ok(())
}

/// A minimal Office-default theme, sufficient to round-trip the indexed
/// theme color slots in [`ThemeColors::default`](crate::workbook::ThemeColors::default).
fn default_theme_xml() -> String {
    format!(
        "{XML_DECLARATION}\n\
<a:theme xmlns:a=\"{ns}\" name=\"Office Theme\">\
<a:themeElements>\
<a:clrScheme name=\"Office\">\
<a:dk1><a:sysClr val=\"windowText\" lastClr=\"000000\"/></a:dk1>\
<a:lt1><a:sysClr val=\"window\" lastClr=\"FFFFFF\"/></a:lt1>\
<a:dk2><a:srgbClr val=\"1F497D\"/></a:dk2>\
<a:lt2><a:srgbClr val=\"EEECE1\"/></a:lt2>\
<a:accent1><a:srgbClr val=\"4F81BD\"/></a:accent1>\
<a:accent2><a:srgbClr val=\"C0504D\"/></a:accent2>\
<a:accent3><a:srgbClr val=\"9BBB59\"/></a:accent3>\
<a:accent4><a:srgbClr val=\"8064A2\"/></a:accent4>\
<a:accent5><a:srgbClr val=\"4BACC6\"/></a:accent5>\
<a:accent6><a:srgbClr val=\"F79646\"/></a:accent6>\
<a:hlink><a:srgbClr val=\"0000FF\"/></a:hlink>\
<a:folHlink><a:srgbClr val=\"800080\"/></a:folHlink>\
</a:clrScheme>\
</a:themeElements>\
</a:theme>",
        ns = xl_xml::namespaces::DRAWING_ML,
    )
}

fn build_content_types(workbook: &Workbook, uses_shared_strings: bool) -> ContentTypes {
    let mut overrides = vec![
        ContentTypeOverride {
            part_name: "/xl/workbook.xml".to_string(),
            content_type: mime_types::WORKBOOK.to_string(),
        },
        ContentTypeOverride {
            part_name: "/xl/styles.xml".to_string(),
            content_type: mime_types::STYLES.to_string(),
        },
        ContentTypeOverride {
            part_name: "/xl/theme/theme1.xml".to_string(),
            content_type: mime_types::THEME.to_string(),
        },
    ];
    for idx in 0..workbook.sheets().len() {
        overrides.push(ContentTypeOverride {
            part_name: format!("/xl/worksheets/sheet{}.xml", idx + 1),
            content_type: mime_types::WORKSHEET.to_string(),
        });
    }
    if uses_shared_strings {
        overrides.push(ContentTypeOverride {
            part_name: "/xl/sharedStrings.xml".to_string(),
            content_type: mime_types::SHARED_STRINGS.to_string(),
        });
    }
    for part in workbook.part_manifest() {
        overrides.push(ContentTypeOverride {
            part_name: format!("/{}", part.path.trim_start_matches('/')),
            content_type: part.content_type.clone(),
        });
    }
    ContentTypes {
        xmlns: xl_xml::namespaces::CONTENT_TYPES.to_string(),
        defaults: vec![
            ContentTypeDefault {
                extension: "rels".to_string(),
                content_type: mime_types::RELS.to_string(),
            },
            ContentTypeDefault {
                extension: "xml".to_string(),
                content_type: mime_types::XML.to_string(),
            },
        ],
        overrides,
    }
}

fn build_workbook_xml(workbook: &Workbook) -> WorkbookXml {
    let sheets = workbook
        .sheets()
        .iter()
        .enumerate()
        .map(|(idx, sheet)| SheetEntry {
            name: sheet.name().to_string(),
            sheet_id: (idx + 1) as u32,
            state: match sheet.visibility() {
                Visibility::Normal => None,
                Visibility::Hidden => Some("hidden".to_string()),
                Visibility::VeryHidden => Some("veryHidden".to_string()),
            },
            r_id: format!("rId{}", idx + 1),
        })
        .collect();

    let defined_names = workbook.defined_names();
    let defined_names = (!defined_names.is_empty()).then(|| DefinedNames {
        defined_names: defined_names
            .iter()
            .map(|dn| XmlDefinedName {
                name: dn.name.clone(),
                local_sheet_id: dn
                    .scope
                    .as_deref()
                    .and_then(|s| workbook.sheet_index(s).ok())
                    .map(|i| i as u32),
                hidden: None,
                value: dn.formula.clone(),
            })
            .collect(),
    });

    WorkbookXml {
        xmlns: xl_xml::namespaces::SPREADSHEET_ML.to_string(),
        xmlns_r: xl_xml::namespaces::RELATIONSHIPS.to_string(),
        file_version: None,
        workbook_pr: Some(WorkbookPr {
            date1904: Some(false),
            filter_privacy: None,
            default_theme_version: None,
        }),
        book_views: Some(BookViews {
            workbook_views: vec![WorkbookView {
                x_window: Some(0),
                y_window: Some(0),
                window_width: Some(28800),
                window_height: Some(12210),
                active_tab: Some(workbook.active_sheet_index() as u32),
            }],
        }),
        sheets: Sheets { sheets },
        defined_names,
        calc_pr: Some(CalcPr {
            calc_id: None,
            calc_mode: None,
            full_calc_on_load: Some(true),
        }),
    }
}

fn build_workbook_rels(sheet_count: usize, uses_shared_strings: bool) -> Relationships {
    let mut relationships = Vec::with_capacity(sheet_count + 3);
    let mut next_id = 1u32;
    for idx in 0..sheet_count {
        relationships.push(Relationship {
            id: format!("rId{next_id}"),
            rel_type: rel_types::WORKSHEET.to_string(),
            target: format!("worksheets/sheet{}.xml", idx + 1),
            target_mode: None,
        });
        next_id += 1;
    }
    relationships.push(Relationship {
        id: format!("rId{next_id}"),
        rel_type: rel_types::STYLES.to_string(),
        target: "styles.xml".to_string(),
        target_mode: None,
    });
    next_id += 1;
    if uses_shared_strings {
        relationships.push(Relationship {
            id: format!("rId{next_id}"),
            rel_type: rel_types::SHARED_STRINGS.to_string(),
            target: "sharedStrings.xml".to_string(),
            target_mode: None,
        });
        next_id += 1;
    }
    relationships.push(Relationship {
        id: format!("rId{next_id}"),
        rel_type: rel_types::THEME.to_string(),
        target: "theme/theme1.xml".to_string(),
        target_mode: None,
    });
    Relationships {
        xmlns: xl_xml::namespaces::PACKAGE_RELATIONSHIPS.to_string(),
        relationships,
    }
}

/// Merge every sheet's per-sheet [`StyleRegistry`](crate::style::StyleRegistry)
/// into one global `xl/styles.xml`, deduplicating structurally identical
/// [`CellStyle`]s and recording how each sheet's local ids map onto the
/// merged cellXfs table.
fn merge_style_registries(workbook: &Workbook) -> MergedStyles {
    let mut fonts: Vec<Font> = Vec::new();
    let mut font_index: HashMap<Font, u32> = HashMap::new();
    let mut fills: Vec<Fill> = vec![Fill::None, Fill::default_gray125()];
    let mut fill_index: HashMap<Fill, u32> = HashMap::new();
    let mut borders: Vec<Border> = Vec::new();
    let mut border_index: HashMap<Border, u32> = HashMap::new();
    let mut num_fmts: Vec<(u32, String)> = Vec::new();
    let mut num_fmt_index: HashMap<String, u32> = HashMap::new();
    let mut next_custom_fmt_id = CUSTOM_NUM_FMT_BASE;
    let mut xfs: Vec<Xf> = Vec::new();
    let mut xf_index: HashMap<CellStyle, u32> = HashMap::new();

    for (idx, fill) in fills.iter().enumerate() {
        fill_index.insert(*fill, idx as u32);
    }

    let mut remap = Vec::with_capacity(workbook.sheets().len());

    for sheet in workbook.sheets() {
        let mut sheet_remap = HashMap::new();
        for (local_id, style) in sheet.style_registry().iter() {
            let font_id = *font_index.entry(style.font.clone()).or_insert_with(|| {
                let id = fonts.len() as u32;
                fonts.push(style.font.clone());
                id
            });
            let fill_id = *fill_index.entry(style.fill).or_insert_with(|| {
                let id = fills.len() as u32;
                fills.push(style.fill);
                id
            });
            let border_id = *border_index.entry(style.border).or_insert_with(|| {
                let id = borders.len() as u32;
                borders.push(style.border);
                id
            });
            let num_fmt_id = match style.num_fmt.builtin_id() {
                Some(id) => id,
                None => {
                    let code = style.num_fmt.format_code().to_string();
                    *num_fmt_index.entry(code.clone()).or_insert_with(|| {
                        let id = next_custom_fmt_id;
                        next_custom_fmt_id += 1;
                        num_fmts.push((id, code));
                        id
                    })
                }
            };

            let global_id = *xf_index.entry(style.clone()).or_insert_with(|| {
                let id = xfs.len() as u32;
                xfs.push(Xf {
                    num_fmt_id: Some(num_fmt_id),
                    font_id: Some(font_id),
                    fill_id: Some(fill_id),
                    border_id: Some(border_id),
                    xf_id: Some(0),
                    apply_number_format: Some(num_fmt_id != 0),
                    apply_font: Some(font_id != 0),
                    apply_fill: Some(fill_id != 0),
                    apply_border: Some(border_id != 0),
                    apply_alignment: Some(style.align != Align::default()),
                    alignment: render_alignment(style.align),
                    protection: None,
                });
                id
            });
            sheet_remap.insert(local_id, global_id);
        }
        remap.push(sheet_remap);
    }

    if fonts.is_empty() {
        fonts.push(Font::default());
    }
    if borders.is_empty() {
        borders.push(Border::default());
    }
    if xfs.is_empty() {
        xfs.push(Xf {
            num_fmt_id: Some(0),
            font_id: Some(0),
            fill_id: Some(0),
            border_id: Some(0),
            xf_id: Some(0),
            apply_number_format: None,
            apply_font: None,
            apply_fill: None,
            apply_border: None,
            apply_alignment: None,
            alignment: None,
            protection: None,
        });
    }

    let style_sheet = StyleSheet {
        xmlns: xl_xml::namespaces::SPREADSHEET_ML.to_string(),
        num_fmts: (!num_fmts.is_empty()).then(|| NumFmts {
            count: Some(num_fmts.len() as u32),
            num_fmts: num_fmts
                .into_iter()
                .map(|(id, code)| XmlNumFmt {
                    num_fmt_id: id,
                    format_code: code,
                })
                .collect(),
        }),
        fonts: Fonts {
            count: Some(fonts.len() as u32),
            fonts: fonts.iter().map(render_font).collect(),
        },
        fills: Fills {
            count: Some(fills.len() as u32),
            fills: fills.iter().map(|&f| render_fill(f)).collect(),
        },
        borders: Borders {
            count: Some(borders.len() as u32),
            borders: borders.iter().map(|&b| render_border(b)).collect(),
        },
        cell_style_xfs: Some(CellStyleXfs {
            count: Some(1),
            xfs: vec![Xf {
                num_fmt_id: Some(0),
                font_id: Some(0),
                fill_id: Some(0),
                border_id: Some(0),
                xf_id: None,
                apply_number_format: None,
                apply_font: None,
                apply_fill: None,
                apply_border: None,
                apply_alignment: None,
                alignment: None,
                protection: None,
            }],
        }),
        cell_xfs: CellXfs {
            count: Some(xfs.len() as u32),
            xfs,
        },
        cell_styles: None,
        dxfs: None,
        table_styles: None,
    };

    MergedStyles {
        sheet: style_sheet,
        remap,
    }
}

impl Fill {
    fn default_gray125() -> Self {
        Fill::Pattern {
            fg: StyleColor::Rgb(0),
            bg: StyleColor::Rgb(0),
            pattern_type: PatternType::Gray125,
        }
    }
}

pub(crate) fn render_font(font: &Font) -> XmlFont {
    XmlFont {
        b: font.bold.then(|| styles::BoolVal { val: Some(true) }),
        i: font.italic.then(|| styles::BoolVal { val: Some(true) }),
        strike: None,
        u: font.underline.then(|| Underline {
            val: Some("single".to_string()),
        }),
        sz: Some(FontSize { val: font.size }),
        color: font.color.map(render_color),
        name: Some(FontName { val: font.name.clone() }),
        family: Some(FontFamily { val: 2 }),
        scheme: None,
    }
}

pub(crate) fn render_fill(fill: Fill) -> XmlFill {
    match fill {
        Fill::None => XmlFill {
            pattern_fill: Some(PatternFill {
                pattern_type: Some("none".to_string()),
                fg_color: None,
                bg_color: None,
            }),
            gradient_fill: None,
        },
        Fill::Solid(color) => XmlFill {
            pattern_fill: Some(PatternFill {
                pattern_type: Some("solid".to_string()),
                fg_color: Some(render_color(color)),
                bg_color: None,
            }),
            gradient_fill: None,
        },
        Fill::Pattern { fg, bg, pattern_type } => XmlFill {
            pattern_fill: Some(PatternFill {
                pattern_type: Some(render_pattern_type(pattern_type)),
                fg_color: Some(render_color(fg)),
                bg_color: Some(render_color(bg)),
            }),
            gradient_fill: None,
        },
    }
}

pub(crate) fn render_pattern_type(pattern_type: PatternType) -> String {
    match pattern_type {
        PatternType::Gray125 => "gray125",
        PatternType::DarkGray => "darkGray",
        PatternType::LightGray => "lightGray",
        PatternType::DarkHorizontal => "darkHorizontal",
        PatternType::DarkVertical => "darkVertical",
    }
    .to_string()
}

pub(crate) fn render_border(border: Border) -> XmlBorder {
    XmlBorder {
        diagonal_up: None,
        diagonal_down: None,
        left: render_border_side(border.left),
        right: render_border_side(border.right),
        top: render_border_side(border.top),
        bottom: render_border_side(border.bottom),
        diagonal: None,
    }
}

pub(crate) fn render_border_side(side: BorderSide) -> Option<XmlBorderSide> {
    if side.style == BorderLineStyle::None {
        return None;
    }
    Some(XmlBorderSide {
        style: Some(render_border_line_style(side.style)),
        color: side.color.map(render_color),
    })
}

pub(crate) fn render_border_line_style(style: BorderLineStyle) -> String {
    match style {
        BorderLineStyle::None => "none",
        BorderLineStyle::Thin => "thin",
        BorderLineStyle::Medium => "medium",
        BorderLineStyle::Thick => "thick",
        BorderLineStyle::Dashed => "dashed",
        BorderLineStyle::Dotted => "dotted",
        BorderLineStyle::Double => "double",
    }
    .to_string()
}

pub(crate) fn render_color(color: StyleColor) -> XmlColor {
    match color {
        StyleColor::Rgb(argb) => XmlColor {
            auto: None,
            indexed: None,
            rgb: Some(format!("{argb:08X}")),
            theme: None,
            tint: None,
        },
        StyleColor::Theme { slot, tint } => XmlColor {
            auto: None,
            indexed: None,
            rgb: None,
            theme: Some(slot),
            tint: Some(tint),
        },
    }
}

pub(crate) fn render_alignment(align: Align) -> Option<styles::Alignment> {
    if align == Align::default() {
        return None;
    }
    Some(styles::Alignment {
        horizontal: (align.horizontal != HorizontalAlign::General).then(|| render_horizontal_align(align.horizontal)),
        vertical: (align.vertical != VerticalAlign::default()).then(|| render_vertical_align(align.vertical)),
        wrap_text: align.wrap.then_some(true),
        text_rotation: None,
        indent: (align.indent != 0).then_some(align.indent),
        shrink_to_fit: None,
    })
}

pub(crate) fn render_horizontal_align(align: HorizontalAlign) -> String {
    match align {
        HorizontalAlign::General => "general",
        HorizontalAlign::Left => "left",
        HorizontalAlign::Center => "center",
        HorizontalAlign::Right => "right",
        HorizontalAlign::Justify => "justify",
        HorizontalAlign::Fill => "fill",
        HorizontalAlign::CenterContinuous => "centerContinuous",
    }
    .to_string()
}

pub(crate) fn render_vertical_align(align: VerticalAlign) -> String {
    match align {
        VerticalAlign::Bottom => "bottom",
        VerticalAlign::Top => "top",
        VerticalAlign::Middle => "center",
        VerticalAlign::Justify => "justify",
        VerticalAlign::Distributed => "distributed",
    }
    .to_string()
}

/// Render one sheet to its `WorksheetXml`, interning shared strings and
/// remapping style ids against the merged global style table.
fn render_worksheet(
    sheet: &Sheet,
    sheet_idx: usize,
    merged_styles: &MergedStyles,
    sst: &mut SharedStrings,
) -> (WorksheetXml, Vec<(String, Hyperlink)>) {
    let remap = &merged_styles.remap[sheet_idx];
    let mut rows_by_index: std::collections::BTreeMap<u32, Vec<XmlCell>> = std::collections::BTreeMap::new();
    let mut hyperlinks = Vec::new();

    for (aref, cell) in sheet.iter_cells() {
        let xml_cell = render_cell(aref, cell, remap, sst);
        rows_by_index.entry(aref.row.index()).or_default().push(xml_cell);
        if let Some(url) = &cell.hyperlink {
            let rid = format!("rId{}", hyperlinks.len() + 1);
            hyperlinks.push((
                url.clone(),
                Hyperlink {
                    reference: aref.print_a1(),
                    r_id: Some(rid),
                    location: None,
                    display: None,
                },
            ));
        }
    }

    let rows = rows_by_index
        .into_iter()
        .map(|(row_idx, mut cells)| {
            cells.sort_by(|a, b| a.r.cmp(&b.r));
            let props = sheet.row_props(AddrRow::new(row_idx).expect("stored row index is in range"));
            XmlRow {
                r: row_idx + 1,
                spans: None,
                s: None,
                custom_format: None,
                ht: props.height,
                hidden: props.hidden.then_some(true),
                custom_height: props.height.is_some().then_some(true),
                outline_level: (props.outline_level != 0).then_some(props.outline_level),
                cells,
            }
        })
        .collect();

    let dimension = sheet.used_range().map(|range| Dimension {
        reference: range.print_a1(),
    });

    let cols = render_cols(sheet);

    let merge_cells = (!sheet.merges().is_empty()).then(|| MergeCells {
        count: Some(sheet.merges().len() as u32),
        merge_cells: sheet
            .merges()
            .iter()
            .map(|range| MergeCell {
                reference: range.print_a1(),
            })
            .collect(),
    });

    let hyperlinks_xml = (!hyperlinks.is_empty()).then(|| Hyperlinks {
        hyperlinks: hyperlinks.iter().map(|(_, link)| link.clone()).collect(),
    });

    let worksheet = WorksheetXml {
        xmlns: xl_xml::namespaces::SPREADSHEET_ML.to_string(),
        xmlns_r: xl_xml::namespaces::RELATIONSHIPS.to_string(),
        dimension,
        sheet_views: None,
        sheet_format_pr: None,
        cols,
        sheet_data: SheetData { rows },
        merge_cells,
        hyperlinks: hyperlinks_xml,
        page_margins: None,
        page_setup: None,
        drawing: None,
        table_parts: None,
    };

    (worksheet, hyperlinks)
}

fn render_cols(sheet: &Sheet) -> Option<Cols> {
    let max_col = sheet.used_range()?.end.col.index();
    let mut cols = Vec::new();
    let mut run_start: Option<(u32, crate::sheet::ColumnProps)> = None;

    for idx in 0..=max_col {
        let col = Column::new(idx).expect("index within used range is valid");
        let props = sheet.col_props(col);
        match &run_start {
            Some((_, current)) if *current == props => {}
            Some((start, current)) => {
                cols.push(col_entry(*start, idx - 1, *current));
                run_start = Some((idx, props));
            }
            None => run_start = Some((idx, props)),
        }
    }
    if let Some((start, props)) = run_start {
        cols.push(col_entry(start, max_col, props));
    }

    let cols: Vec<Col> = cols.into_iter().filter(|c| c.width.is_some() || c.hidden == Some(true)).collect();
    (!cols.is_empty()).then(|| Cols { cols })
}

pub(crate) fn col_entry(min: u32, max: u32, props: crate::sheet::ColumnProps) -> Col {
    Col {
        min: min + 1,
        max: max + 1,
        width: props.width,
        style: None,
        hidden: props.hidden.then_some(true),
        custom_width: props.width.is_some().then_some(true),
        outline_level: (props.outline_level != 0).then_some(props.outline_level),
    }
}

fn render_cell(
    aref: ARef,
    cell: &Cell,
    remap: &HashMap<u32, u32>,
    sst: &mut SharedStrings,
) -> XmlCell {
    let s = cell.style_id.and_then(|id| remap.get(&id).copied());

    let (t, v, f, _is) = match &cell.value {
        CellValue::Empty => (None, None, None, None),
        CellValue::Text(text) => {
            let id = sst.intern(text);
            (Some(cell_types::SHARED_STRING.to_string()), Some(id.to_string()), None, None)
        }
        CellValue::RichText(runs) => {
            let text: String = runs.iter().map(|r| r.text.as_str()).collect();
            let id = sst.intern(&text);
            (Some(cell_types::SHARED_STRING.to_string()), Some(id.to_string()), None, None)
        }
        CellValue::Number(n) => (None, Some(n.to_string()), None, None),
        CellValue::Bool(b) => (
            Some(cell_types::BOOLEAN.to_string()),
            Some(if *b { "1".to_string() } else { "0".to_string() }),
            None,
            None,
        ),
        CellValue::Error(kind) => (Some(cell_types::ERROR.to_string()), Some(error_literal(*kind)), None, None),
        CellValue::DateTime(dt) => (
            None,
            Some(crate::cell::datetime_to_serial(*dt).to_string()),
            None,
            None,
        ),
        CellValue::Formula { expr, cached } => {
            let formula = Some(CellFormula {
                t: None,
                reference: None,
                si: None,
                value: Some(expr.clone()),
            });
            match cached.as_deref() {
                Some(CellValue::Text(text)) => (
                    Some(cell_types::FORMULA_STRING.to_string()),
                    Some(text.clone()),
                    formula,
                    None,
                ),
                Some(CellValue::Number(n)) => (None, Some(n.to_string()), formula, None),
                Some(CellValue::Bool(b)) => (
                    Some(cell_types::BOOLEAN.to_string()),
                    Some(if *b { "1".to_string() } else { "0".to_string() }),
                    formula,
                    None,
                ),
                Some(CellValue::Error(kind)) => {
                    (Some(cell_types::ERROR.to_string()), Some(error_literal(*kind)), formula, None)
                }
                Some(CellValue::DateTime(dt)) => (
                    None,
                    Some(crate::cell::datetime_to_serial(*dt).to_string()),
                    formula,
                    None,
                ),
                _ => (None, None, formula, None),
            }
        }
    };

    XmlCell {
        r: aref.print_a1(),
        s,
        t,
        v,
        f,
        is: None,
    }
}

pub(crate) fn error_literal(kind: ErrorKind) -> String {
    kind.as_str().to_string()
}

fn write_xml_part<T: Serialize, W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    name: &str,
    value: &T,
    options: SimpleFileOptions,
) -> Result<(), WriteError> {
    let xml = serialize_xml(value)?;
    zip.start_file(name, options)
        .map_err(|e| WriteError::IoFailure(std::io::Error::other(e)))?;
    zip.write_all(xml.as_bytes())?;
    Ok(())
}

pub(crate) fn serialize_xml<T: Serialize>(value: &T) -> Result<String, WriteError> {
    let body = to_xml_string(value).map_err(|e| WriteError::IoFailure(std::io::Error::other(e)))?;
    Ok(format!("{XML_DECLARATION}\n{body}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AnchorMode;
    use crate::style::StyleApplyMode;
    use rust_decimal::Decimal;

    fn aref(a1: &str) -> ARef {
        ARef::parse_a1(a1).unwrap()
    }

    fn single_sheet_workbook() -> Workbook {
        let sheet = Sheet::new("Sheet1")
            .put_value(aref("A1"), CellValue::from("hello"))
            .put_value(aref("B1"), CellValue::from(42i64))
            .put_value(aref("C1"), CellValue::from(true));
        Workbook::new().append_sheet(sheet).unwrap()
    }

    #[test]
    fn write_to_buffer_produces_valid_zip() {
        let wb = single_sheet_workbook();
        let bytes = write_to_buffer(&wb).unwrap();
        let cursor = std::io::Cursor::new(bytes);
        let archive = zip::ZipArchive::new(cursor).unwrap();
        assert!(archive.file_names().any(|n| n == "xl/workbook.xml"));
        assert!(archive.file_names().any(|n| n == "xl/worksheets/sheet1.xml"));
        assert!(archive.file_names().any(|n| n == "xl/styles.xml"));
        assert!(archive.file_names().any(|n| n == "[Content_Types].xml"));
    }

    #[test]
    fn text_values_emit_shared_strings_part() {
        let wb = single_sheet_workbook();
        let bytes = write_to_buffer(&wb).unwrap();
        let cursor = std::io::Cursor::new(bytes);
        let archive = zip::ZipArchive::new(cursor).unwrap();
        assert!(archive.file_names().any(|n| n == "xl/sharedStrings.xml"));
    }

    #[test]
    fn all_numeric_sheet_skips_shared_strings() {
        let sheet = Sheet::new("Sheet1").put_value(aref("A1"), CellValue::Number(Decimal::from(7)));
        let wb = Workbook::new().append_sheet(sheet).unwrap();
        let bytes = write_to_buffer(&wb).unwrap();
        let cursor = std::io::Cursor::new(bytes);
        let archive = zip::ZipArchive::new(cursor).unwrap();
        assert!(!archive.file_names().any(|n| n == "xl/sharedStrings.xml"));
    }

    #[test]
    fn per_sheet_styles_merge_without_collision() {
        let bold = CellStyle {
            font: Font {
                bold: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let italic = CellStyle {
            font: Font {
                italic: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let sheet_a = Sheet::new("A").style_range(
            crate::address::CellRange::single(aref("A1")),
            bold,
            StyleApplyMode::Replace,
        );
        let sheet_b = Sheet::new("B").style_range(
            crate::address::CellRange::single(aref("A1")),
            italic,
            StyleApplyMode::Replace,
        );
        let wb = Workbook::new().append_sheet(sheet_a).unwrap().append_sheet(sheet_b).unwrap();
        let merged = merge_style_registries(&wb);
        // Two distinct global styles (default + bold + italic) beyond id 0.
        assert!(merged.sheet.cell_xfs.xfs.len() >= 3);
        let a_id = merged.remap[0][&1];
        let b_id = merged.remap[1][&1];
        assert_ne!(a_id, b_id);
    }

    #[test]
    fn worksheet_dimension_covers_used_range() {
        let wb = single_sheet_workbook();
        let merged = merge_style_registries(&wb);
        let mut sst = SharedStrings::new();
        let (worksheet, _) = render_worksheet(&wb.sheets()[0], 0, &merged, &mut sst);
        assert_eq!(worksheet.dimension.unwrap().reference, "A1:C1");
        assert_eq!(worksheet.sheet_data.rows.len(), 1);
        assert_eq!(worksheet.sheet_data.rows[0].cells.len(), 3);
    }

    #[test]
    fn error_cell_renders_literal() {
        let sheet = Sheet::new("Sheet1").put_value(aref("A1"), CellValue::Error(ErrorKind::Div0));
        let wb = Workbook::new().append_sheet(sheet).unwrap();
        let merged = merge_style_registries(&wb);
        let mut sst = SharedStrings::new();
        let (worksheet, _) = render_worksheet(&wb.sheets()[0], 0, &merged, &mut sst);
        let cell = &worksheet.sheet_data.rows[0].cells[0];
        assert_eq!(cell.t.as_deref(), Some("e"));
        assert_eq!(cell.v.as_deref(), Some("#DIV/0!"));
    }

    #[test]
    fn formula_cell_carries_cached_number_and_source() {
        let sheet = Sheet::new("Sheet1").put_value(
            aref("A1"),
            CellValue::formula("1+1", Some(CellValue::Number(Decimal::from(2)))),
        );
        let wb = Workbook::new().append_sheet(sheet).unwrap();
        let merged = merge_style_registries(&wb);
        let mut sst = SharedStrings::new();
        let (worksheet, _) = render_worksheet(&wb.sheets()[0], 0, &merged, &mut sst);
        let cell = &worksheet.sheet_data.rows[0].cells[0];
        assert_eq!(cell.v.as_deref(), Some("2"));
        assert_eq!(cell.f.as_ref().unwrap().value.as_deref(), Some("1+1"));
    }
}
