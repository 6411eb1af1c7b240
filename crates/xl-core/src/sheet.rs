//! The immutable [`Sheet`] value: a sparse cell map plus column/row
//! properties, merges, tables, and visibility state.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::address::{ARef, CellRange, Column, Row};
use crate::cell::{Cell, CellValue};
use crate::error::WorkbookError;
use crate::style::{CellStyle, StyleApplyMode, StyleRegistry};

/// Column display properties, keyed by [`Column`] in [`Sheet::cols`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ColumnProps {
    pub width: Option<f64>,
    pub hidden: bool,
    pub outline_level: u8,
}

/// Row display properties, keyed by [`Row`] in [`Sheet::rows`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RowProps {
    pub height: Option<f64>,
    pub hidden: bool,
    pub outline_level: u8,
}

/// A named table occupying a rectangular range within the sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub range: CellRange,
    pub header_row: bool,
    pub columns: Vec<String>,
}

/// Sheet visibility, as stored in `workbook.xml`'s `<sheet state="...">`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Normal,
    Hidden,
    VeryHidden,
}

/// An immutable worksheet value. Every "mutation" method returns a new
/// `Sheet`; unchanged substructures are shared via `Arc` rather than
/// deep-copied.
#[derive(Debug, Clone)]
pub struct Sheet {
    name: Arc<str>,
    cells: Arc<BTreeMap<(u32, u32), Cell>>,
    styles: Arc<StyleRegistry>,
    merges: Arc<Vec<CellRange>>,
    cols: Arc<BTreeMap<u32, ColumnProps>>,
    rows: Arc<BTreeMap<u32, RowProps>>,
    tables: Arc<Vec<Table>>,
    visibility: Visibility,
}

impl Sheet {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            cells: Arc::new(BTreeMap::new()),
            styles: Arc::new(StyleRegistry::new()),
            merges: Arc::new(Vec::new()),
            cols: Arc::new(BTreeMap::new()),
            rows: Arc::new(BTreeMap::new()),
            tables: Arc::new(Vec::new()),
            visibility: Visibility::Normal,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn with_visibility(&self, visibility: Visibility) -> Self {
        let mut next = self.clone();
        next.visibility = visibility;
        next
    }

    /// Return a copy of this sheet under a new name, sharing all cell,
    /// style, and metadata storage.
    pub fn renamed(&self, new_name: impl Into<Arc<str>>) -> Self {
        let mut next = self.clone();
        next.name = new_name.into();
        next
    }

    fn key(aref: ARef) -> (u32, u32) {
        (aref.row.index(), aref.col.index())
    }

    pub fn get(&self, aref: ARef) -> Option<&Cell> {
        self.cells.get(&Self::key(aref))
    }

    pub fn cell_value(&self, aref: ARef) -> CellValue {
        self.get(aref).map(|c| c.value.clone()).unwrap_or(CellValue::Empty)
    }

    pub fn style_registry(&self) -> &StyleRegistry {
        &self.styles
    }

    pub fn merges(&self) -> &[CellRange] {
        &self.merges
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn col_props(&self, col: Column) -> ColumnProps {
        self.cols.get(&col.index()).copied().unwrap_or_default()
    }

    pub fn row_props(&self, row: Row) -> RowProps {
        self.rows.get(&row.index()).copied().unwrap_or_default()
    }

    /// Iterate non-empty cells in row-major order.
    pub fn iter_cells(&self) -> impl Iterator<Item = (ARef, &Cell)> + '_ {
        self.cells.iter().map(|(&(row, col), cell)| {
            (
                ARef::new(
                    Column::new(col).expect("stored key is in range"),
                    Row::new(row).expect("stored key is in range"),
                    crate::address::AnchorMode::Relative,
                ),
                cell,
            )
        })
    }

    /// The minimum bounding rectangle of all non-empty cells, if any.
    pub fn used_range(&self) -> Option<CellRange> {
        let mut iter = self.cells.keys();
        let (&(first_row, first_col)) = iter.next().as_ref()?;
        let (mut min_r, mut max_r, mut min_c, mut max_c) = (first_row, first_row, first_col, first_col);
        for &(r, c) in iter {
            min_r = min_r.min(r);
            max_r = max_r.max(r);
            min_c = min_c.min(c);
            max_c = max_c.max(c);
        }
        Some(CellRange::new(
            ARef::new(
                Column::new(min_c).ok()?,
                Row::new(min_r).ok()?,
                crate::address::AnchorMode::Relative,
            ),
            ARef::new(
                Column::new(max_c).ok()?,
                Row::new(max_r).ok()?,
                crate::address::AnchorMode::Relative,
            ),
        ))
    }

    /// Replace the cell at `aref`. Setting `CellValue::Empty` (with no
    /// style, comment, or hyperlink) removes the entry entirely.
    pub fn put(&self, aref: ARef, cell: Cell) -> Self {
        let mut next = self.clone();
        let cells = Arc::make_mut(&mut next.cells);
        if cell.is_empty() {
            cells.remove(&Self::key(aref));
        } else {
            cells.insert(Self::key(aref), cell);
        }
        next
    }

    /// Apply `put` for a value with no style/comment/hyperlink changes.
    pub fn put_value(&self, aref: ARef, value: CellValue) -> Self {
        let existing = self.get(aref).cloned().unwrap_or_default();
        self.put(
            aref,
            Cell {
                value,
                ..existing
            },
        )
    }

    /// Apply a batch of `(ref, cell)` updates in order.
    pub fn put_all(&self, updates: impl IntoIterator<Item = (ARef, Cell)>) -> Self {
        let mut next = self.clone();
        {
            let cells = Arc::make_mut(&mut next.cells);
            for (aref, cell) in updates {
                if cell.is_empty() {
                    cells.remove(&Self::key(aref));
                } else {
                    cells.insert(Self::key(aref), cell);
                }
            }
        }
        next
    }

    /// Register `style` and apply it to every cell in `range`, either
    /// replacing the existing style outright or merging component-wise.
    pub fn style_range(&self, range: CellRange, style: CellStyle, mode: StyleApplyMode) -> Self {
        let mut next = self.clone();
        let new_style_registry = Arc::make_mut(&mut next.styles);
        let cells = Arc::make_mut(&mut next.cells);

        for aref in range.iter_row_major() {
            let key = Self::key(aref);
            let existing = cells.entry(key).or_default();
            let resolved_style = match mode {
                StyleApplyMode::Replace => style.clone(),
                StyleApplyMode::Merge => {
                    let base = existing
                        .style_id
                        .and_then(|id| new_style_registry.get(id))
                        .cloned()
                        .unwrap_or_default();
                    crate::style::merge_overlay(&base, &style)
                }
            };
            existing.style_id = Some(new_style_registry.add(resolved_style));
        }
        next
    }

    /// Add a merged range. Fails if it intersects an existing merge.
    pub fn merge(&self, range: CellRange) -> Result<Self, WorkbookError> {
        if self.merges.iter().any(|m| m.intersects(&range)) {
            return Err(WorkbookError::OverlappingMerge(range.print_a1()));
        }
        let mut next = self.clone();
        Arc::make_mut(&mut next.merges).push(range);
        Ok(next)
    }

    /// Remove an exact merged range. A no-op if `range` isn't currently
    /// merged.
    pub fn unmerge(&self, range: CellRange) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.merges).retain(|m| *m != range);
        next
    }

    pub fn with_col_props(&self, col: Column, props: ColumnProps) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.cols).insert(col.index(), props);
        next
    }

    pub fn with_row_props(&self, row: Row, props: RowProps) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.rows).insert(row.index(), props);
        next
    }

    pub fn with_table(&self, table: Table) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.tables).push(table);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AnchorMode;

    fn aref(a1: &str) -> ARef {
        ARef::parse_a1(a1).unwrap()
    }

    #[test]
    fn put_and_get_roundtrip() {
        let sheet = Sheet::new("Sheet1");
        let sheet2 = sheet.put_value(aref("A1"), CellValue::from("hello"));
        assert_eq!(sheet2.cell_value(aref("A1")), CellValue::from("hello"));
        assert_eq!(sheet.cell_value(aref("A1")), CellValue::Empty);
    }

    #[test]
    fn put_empty_removes_cell() {
        let sheet = Sheet::new("Sheet1").put_value(aref("A1"), CellValue::from("x"));
        let cleared = sheet.put_value(aref("A1"), CellValue::Empty);
        assert!(cleared.get(aref("A1")).is_none());
    }

    #[test]
    fn structural_sharing_of_untouched_rows() {
        let sheet = Sheet::new("Sheet1").put_value(aref("A1"), CellValue::from("x"));
        let sheet2 = sheet.put_value(aref("B2"), CellValue::from("y"));
        // The original map is untouched: same Arc pointer survives on `sheet`.
        assert_eq!(sheet.cell_value(aref("B2")), CellValue::Empty);
        assert_eq!(sheet2.cell_value(aref("A1")), CellValue::from("x"));
    }

    #[test]
    fn merge_rejects_overlap() {
        let sheet = Sheet::new("Sheet1")
            .merge(CellRange::parse_a1("A1:B2").unwrap())
            .unwrap();
        let result = sheet.merge(CellRange::parse_a1("B2:C3").unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn unmerge_is_noop_for_unknown_range() {
        let sheet = Sheet::new("Sheet1");
        let sheet2 = sheet.unmerge(CellRange::parse_a1("A1:B2").unwrap());
        assert!(sheet2.merges().is_empty());
    }

    #[test]
    fn style_range_replace_then_merge() {
        let sheet = Sheet::new("Sheet1");
        let bold = CellStyle {
            font: crate::style::Font {
                bold: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let sheet = sheet.style_range(
            CellRange::single(aref("A1")),
            bold.clone(),
            StyleApplyMode::Replace,
        );
        let id = sheet.get(aref("A1")).unwrap().style_id.unwrap();
        assert_eq!(sheet.style_registry().get(id), Some(&bold));

        let italic_overlay = CellStyle {
            font: crate::style::Font {
                italic: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let merged_sheet =
            sheet.style_range(CellRange::single(aref("A1")), italic_overlay, StyleApplyMode::Merge);
        let merged_id = merged_sheet.get(aref("A1")).unwrap().style_id.unwrap();
        let merged_style = merged_sheet.style_registry().get(merged_id).unwrap();
        assert!(merged_style.font.bold);
        assert!(merged_style.font.italic);
    }

    #[test]
    fn used_range_covers_all_non_empty_cells() {
        let sheet = Sheet::new("Sheet1")
            .put_value(aref("B2"), CellValue::from("x"))
            .put_value(aref("D5"), CellValue::from("y"));
        let range = sheet.used_range().unwrap();
        assert_eq!(range.print_a1(), "B2:D5");
    }

    #[test]
    fn visibility_default_normal() {
        let sheet = Sheet::new("Sheet1");
        assert_eq!(sheet.visibility(), Visibility::Normal);
        let hidden = sheet.with_visibility(Visibility::Hidden);
        assert_eq!(hidden.visibility(), Visibility::Hidden);
        assert_eq!(sheet.visibility(), Visibility::Normal);
    }

    #[test]
    fn anchor_mode_unused_import_guard() {
        let _ = AnchorMode::Relative;
    }
}
