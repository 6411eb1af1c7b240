//! The immutable [`Workbook`] value: an ordered sequence of uniquely-named
//! sheets, a defined-names list, the resolved theme, and a manifest of
//! untouched ZIP parts preserved for verbatim round-trip.

use std::sync::Arc;

use crate::error::WorkbookError;
use crate::sheet::Sheet;
use crate::style::Color;

/// A workbook- or sheet-scoped named range or formula.
#[derive(Debug, Clone, PartialEq)]
pub struct DefinedName {
    pub name: String,
    /// `Some(sheet_name)` for a sheet-scoped name, `None` for workbook scope.
    pub scope: Option<String>,
    pub formula: String,
}

/// Resolved theme colors (`xl/theme/theme1.xml`), used to resolve
/// [`Color::Theme`] references. Indexed by the standard OOXML theme color
/// slots: 0=dk1, 1=lt1, 2=dk2, 3=lt2, 4..=9=accent1..6, 10=hlink, 11=folHlink.
#[derive(Debug, Clone, PartialEq)]
pub struct ThemeColors {
    pub slots: Vec<u32>,
}

impl Default for ThemeColors {
    fn default() -> Self {
        // Office default theme palette (ARGB).
        Self {
            slots: vec![
                0xFF000000, 0xFFFFFFFF, 0xFF1F497D, 0xFFEEECE1, 0xFF4F81BD, 0xFFC0504D,
                0xFF9BBB59, 0xFF8064A2, 0xFF4BACC6, 0xFFF79646, 0xFF0000FF, 0xFF800080,
            ],
        }
    }
}

impl ThemeColors {
    /// Resolve a [`Color`] to its concrete ARGB value, applying tint for
    /// theme-relative colors. `Rgb` colors pass through unchanged.
    pub fn resolve(&self, color: Color) -> u32 {
        match color {
            Color::Rgb(argb) => argb,
            Color::Theme { slot, tint } => {
                let base = self.slots.get(slot as usize).copied().unwrap_or(0xFF000000);
                apply_tint(base, tint)
            }
        }
    }
}

/// Apply an Excel-style tint (-1.0 darken .. 1.0 lighten) to an ARGB color.
fn apply_tint(argb: u32, tint: f64) -> u32 {
    let a = (argb >> 24) & 0xFF;
    let channel = |shift: u32| -> u32 {
        let c = ((argb >> shift) & 0xFF) as f64 / 255.0;
        let adjusted = if tint < 0.0 {
            c * (1.0 + tint)
        } else {
            c * (1.0 - tint) + tint
        };
        (adjusted.clamp(0.0, 1.0) * 255.0).round() as u32
    };
    (a << 24) | (channel(16) << 16) | (channel(8) << 8) | channel(0)
}

/// A ZIP part that was not modeled and is preserved byte-exact across a
/// read-modify-write cycle (charts, drawings, pivot caches, VBA, ...).
#[derive(Debug, Clone)]
pub struct ManifestPart {
    pub path: String,
    pub content_type: String,
    pub bytes: Arc<Vec<u8>>,
    pub compression: crate::writer::CompressionKind,
}

/// An immutable workbook: an ordered sequence of uniquely-named sheets plus
/// workbook-scoped metadata. Every transform returns a new value.
#[derive(Debug, Clone, Default)]
pub struct Workbook {
    sheets: Arc<Vec<Sheet>>,
    active_sheet: usize,
    defined_names: Arc<Vec<DefinedName>>,
    theme: Arc<ThemeColors>,
    part_manifest: Arc<Vec<ManifestPart>>,
}

impl Workbook {
    pub fn new() -> Self {
        Self {
            sheets: Arc::new(Vec::new()),
            active_sheet: 0,
            defined_names: Arc::new(Vec::new()),
            theme: Arc::new(ThemeColors::default()),
            part_manifest: Arc::new(Vec::new()),
        }
    }

    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    pub fn theme(&self) -> &ThemeColors {
        &self.theme
    }

    pub fn with_theme(&self, theme: ThemeColors) -> Self {
        let mut next = self.clone();
        next.theme = Arc::new(theme);
        next
    }

    pub fn part_manifest(&self) -> &[ManifestPart] {
        &self.part_manifest
    }

    pub fn with_part_manifest(&self, parts: Vec<ManifestPart>) -> Self {
        let mut next = self.clone();
        next.part_manifest = Arc::new(parts);
        next
    }

    pub fn defined_names(&self) -> &[DefinedName] {
        &self.defined_names
    }

    pub fn active_sheet_index(&self) -> usize {
        self.active_sheet
    }

    pub fn set_active_sheet_index(&self, index: usize) -> Result<Self, WorkbookError> {
        if index >= self.sheets.len() {
            return Err(WorkbookError::InvalidWorkbook(format!(
                "sheet index {index} out of range"
            )));
        }
        let mut next = self.clone();
        next.active_sheet = index;
        Ok(next)
    }

    pub fn sheet_index(&self, name: &str) -> Result<usize, WorkbookError> {
        self.sheets
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| WorkbookError::SheetNotFound(name.to_string()))
    }

    pub fn sheet(&self, name: &str) -> Result<&Sheet, WorkbookError> {
        let idx = self.sheet_index(name)?;
        Ok(&self.sheets[idx])
    }

    fn check_unique(&self, name: &str) -> Result<(), WorkbookError> {
        if self.sheets.iter().any(|s| s.name() == name) {
            return Err(WorkbookError::DuplicateSheet(name.to_string()));
        }
        Ok(())
    }

    /// Append a sheet at the end.
    pub fn append_sheet(&self, sheet: Sheet) -> Result<Self, WorkbookError> {
        self.check_unique(sheet.name())?;
        let mut next = self.clone();
        Arc::make_mut(&mut next.sheets).push(sheet);
        Ok(next)
    }

    /// Insert a sheet at position `index`, shifting later sheets right.
    pub fn insert_sheet(&self, index: usize, sheet: Sheet) -> Result<Self, WorkbookError> {
        self.check_unique(sheet.name())?;
        if index > self.sheets.len() {
            return Err(WorkbookError::InvalidWorkbook(format!(
                "insert index {index} out of range"
            )));
        }
        let mut next = self.clone();
        Arc::make_mut(&mut next.sheets).insert(index, sheet);
        Ok(next)
    }

    /// Remove a sheet by name.
    pub fn remove_sheet(&self, name: &str) -> Result<Self, WorkbookError> {
        let idx = self.sheet_index(name)?;
        let mut next = self.clone();
        Arc::make_mut(&mut next.sheets).remove(idx);
        if next.active_sheet >= next.sheets.len() && !next.sheets.is_empty() {
            next.active_sheet = next.sheets.len() - 1;
        }
        Ok(next)
    }

    /// Rename a sheet, checking that the new name is unique.
    pub fn rename_sheet(&self, old_name: &str, new_name: impl Into<String>) -> Result<Self, WorkbookError> {
        let new_name = new_name.into();
        let idx = self.sheet_index(old_name)?;
        if old_name != new_name {
            self.check_unique(&new_name)?;
        }
        let mut next = self.clone();
        let sheets = Arc::make_mut(&mut next.sheets);
        sheets[idx] = sheets[idx].renamed(new_name);
        Ok(next)
    }

    /// Reorder sheets according to `order`, a permutation of the current
    /// sheet names.
    pub fn reorder_sheets(&self, order: &[String]) -> Result<Self, WorkbookError> {
        if order.len() != self.sheets.len() {
            return Err(WorkbookError::InvalidWorkbook(
                "reorder vector length does not match sheet count".to_string(),
            ));
        }
        let mut reordered = Vec::with_capacity(order.len());
        for name in order {
            reordered.push(self.sheet(name)?.clone());
        }
        let mut seen = std::collections::HashSet::new();
        for name in order {
            if !seen.insert(name) {
                return Err(WorkbookError::InvalidWorkbook(format!(
                    "reorder vector is not a permutation: '{name}' repeats"
                )));
            }
        }
        let mut next = self.clone();
        next.sheets = Arc::new(reordered);
        Ok(next)
    }

    /// Apply `f` to the named sheet and replace it with the result.
    pub fn update(&self, name: &str, f: impl FnOnce(&Sheet) -> Sheet) -> Result<Self, WorkbookError> {
        let idx = self.sheet_index(name)?;
        let mut next = self.clone();
        let sheets = Arc::make_mut(&mut next.sheets);
        sheets[idx] = f(&sheets[idx]);
        Ok(next)
    }

    pub fn with_defined_name(&self, defined_name: DefinedName) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.defined_names).push(defined_name);
        next
    }

    pub fn without_defined_name(&self, name: &str, scope: Option<&str>) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.defined_names)
            .retain(|dn| !(dn.name == name && dn.scope.as_deref() == scope));
        next
    }
}
