//! Find-or-add style patching over a full-buffered `styles.xml` tree.
//!
//! Used by [`crate::transform`] to add or merge a single overlay style
//! into an existing stylesheet without rebuilding it from scratch, the
//! way [`crate::writer`]'s per-write merge does for a whole workbook.

use xl_xml::styles::{Borders, CellXfs, Fills, Fonts, NumFmt as XmlNumFmt, NumFmts, StyleSheet, Xf};

use crate::reader::{decode_border, decode_fill, decode_font};
use crate::style::{Border, CellStyle, Fill, Font, StyleApplyMode};
use crate::utils::CUSTOM_NUM_FMT_BASE;
use crate::writer::{render_alignment, render_border, render_fill, render_font};

/// Add `overlay` (applied via `mode` on top of `base_style_id`'s current
/// style, or taken as-is if `base_style_id` is `None`) into `sheet`,
/// reusing existing fonts/fills/borders/numFmts/cellXfs by structural
/// equality. Returns the patched stylesheet and the resulting cellXfs id.
pub fn patch_style(
    sheet: &StyleSheet,
    base_style_id: Option<u32>,
    overlay: &CellStyle,
    mode: StyleApplyMode,
) -> (StyleSheet, u32) {
    let existing = crate::reader::decode_stylesheet(sheet);
    let base = base_style_id
        .and_then(|id| existing.get(id as usize))
        .cloned()
        .unwrap_or_default();
    let resolved = match mode {
        StyleApplyMode::Replace => overlay.clone(),
        StyleApplyMode::Merge => crate::style::merge_overlay(&base, overlay),
    };

    if let Some(id) = existing.iter().position(|s| *s == resolved) {
        return (sheet.clone(), id as u32);
    }

    let mut fonts: Vec<Font> = sheet.fonts.fonts.iter().map(decode_font).collect();
    let mut fills: Vec<Fill> = sheet.fills.fills.iter().map(decode_fill).collect();
    let mut borders: Vec<Border> = sheet.borders.borders.iter().map(decode_border).collect();
    let mut num_fmts: Vec<(u32, String)> = sheet
        .num_fmts
        .as_ref()
        .map(|nf| nf.num_fmts.iter().map(|n| (n.num_fmt_id, n.format_code.clone())).collect())
        .unwrap_or_default();
    let font_id = find_or_push(&mut fonts, &resolved.font);
    let fill_id = find_or_push(&mut fills, &resolved.fill);
    let border_id = find_or_push(&mut borders, &resolved.border);

    let num_fmt_id = match resolved.num_fmt.builtin_id() {
        Some(id) => id,
        None => {
            let code = resolved.num_fmt.format_code().to_string();
            match num_fmts.iter().find(|(_, c)| *c == code) {
                Some((id, _)) => *id,
                None => {
                    let next_id = num_fmts
                        .iter()
                        .map(|(id, _)| *id + 1)
                        .max()
                        .unwrap_or(CUSTOM_NUM_FMT_BASE)
                        .max(CUSTOM_NUM_FMT_BASE);
                    num_fmts.push((next_id, code));
                    next_id
                }
            }
        }
    };

    let mut xfs = sheet.cell_xfs.xfs.clone();
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
        apply_alignment: Some(resolved.align != Default::default()),
        alignment: render_alignment(resolved.align),
        protection: None,
    });
    let new_id = (xfs.len() - 1) as u32;

    let patched = StyleSheet {
        xmlns: sheet.xmlns.clone(),
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
            fills: fills.iter().map(|f| render_fill(*f)).collect(),
        },
        borders: Borders {
            count: Some(borders.len() as u32),
            borders: borders.iter().map(|b| render_border(*b)).collect(),
        },
        cell_style_xfs: sheet.cell_style_xfs.clone(),
        cell_xfs: CellXfs {
            count: Some(xfs.len() as u32),
            xfs,
        },
        cell_styles: sheet.cell_styles.clone(),
        dxfs: sheet.dxfs.clone(),
        table_styles: sheet.table_styles.clone(),
    };

    (patched, new_id)
}

fn find_or_push<T: PartialEq + Clone>(items: &mut Vec<T>, value: &T) -> u32 {
    match items.iter().position(|v| v == value) {
        Some(id) => id as u32,
        None => {
            items.push(value.clone());
            (items.len() - 1) as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::style::Font;
    use xl_xml::styles::{Border as XmlBorder, CellStyleXfs, CellXfs as XmlCellXfs, Fill as XmlFill, Font as XmlFont};

    fn empty_sheet() -> StyleSheet {
        StyleSheet {
            xmlns: xl_xml::namespaces::SPREADSHEET_ML.to_string(),
            num_fmts: None,
            fonts: Fonts {
                count: Some(1),
                fonts: vec![XmlFont {
                    b: None,
                    i: None,
                    strike: None,
                    u: None,
                    sz: None,
                    color: None,
                    name: None,
                    family: None,
                    scheme: None,
                }],
            },
            fills: Fills {
                count: Some(2),
                fills: vec![
                    XmlFill {
                        pattern_fill: None,
                        gradient_fill: None,
                    },
                    XmlFill {
                        pattern_fill: None,
                        gradient_fill: None,
                    },
                ],
            },
            borders: Borders {
                count: Some(1),
                borders: vec![XmlBorder {
                    diagonal_up: None,
                    diagonal_down: None,
                    left: None,
                    right: None,
                    top: None,
                    bottom: None,
                    diagonal: None,
                }],
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
            cell_xfs: XmlCellXfs {
                count: Some(1),
                xfs: vec![Xf {
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
                }],
            },
            cell_styles: None,
            dxfs: None,
            table_styles: None,
        }
    }

    #[test]
    fn adds_a_new_bold_style_and_reuses_it() {
        let sheet = empty_sheet();
        let bold = CellStyle {
            font: Font {
                bold: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let (patched, id) = patch_style(&sheet, None, &bold, StyleApplyMode::Replace);
        assert_eq!(id, 1);
        assert_eq!(patched.fonts.fonts.len(), 2);

        let (patched2, id2) = patch_style(&patched, None, &bold, StyleApplyMode::Replace);
        assert_eq!(id2, 1);
        assert_eq!(patched2.cell_xfs.xfs.len(), 2);
    }

    #[test]
    fn merge_mode_combines_base_and_overlay() {
        let sheet = empty_sheet();
        let bold = CellStyle {
            font: Font {
                bold: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let (patched, bold_id) = patch_style(&sheet, None, &bold, StyleApplyMode::Replace);

        let italic_overlay = CellStyle {
            font: Font {
                italic: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let (patched2, merged_id) = patch_style(&patched, Some(bold_id), &italic_overlay, StyleApplyMode::Merge);
        let merged = crate::reader::decode_stylesheet(&patched2);
        let style = &merged[merged_id as usize];
        assert!(style.font.bold);
        assert!(style.font.italic);
    }

    #[test]
    fn custom_num_fmt_gets_an_id_at_or_above_the_base() {
        let sheet = empty_sheet();
        let overlay = CellStyle {
            num_fmt: crate::style::NumFmt::Custom("#,##0.000".to_string()),
            ..Default::default()
        };
        let (patched, _id) = patch_style(&sheet, None, &overlay, StyleApplyMode::Replace);
        let fmt = patched.num_fmts.unwrap().num_fmts[0].clone();
        assert!(fmt.num_fmt_id >= CUSTOM_NUM_FMT_BASE);
        assert_eq!(fmt.format_code, "#,##0.000");
    }
}
