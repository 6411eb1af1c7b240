//! Excel limit constants and default values.
//!
//! These constants mirror the hard limits enforced by Microsoft Excel 2007+
//! (OOXML / `.xlsx` format). [`Column`](crate::address::Column) and
//! [`Row`](crate::address::Row) are 0-based, so the maxima below are
//! expressed as the highest valid index, not a count.

/// Highest valid 0-based column index (`XFD`, i.e. 16384 columns).
pub const MAX_COLUMN_INDEX: u32 = 16_383;

/// Highest valid 0-based row index (1048576 rows).
pub const MAX_ROW_INDEX: u32 = 1_048_575;

/// Maximum number of cell styles that can be stored in a workbook.
pub const MAX_CELL_STYLES: usize = 65_430;

/// Maximum column width in character-width units.
pub const MAX_COLUMN_WIDTH: f64 = 255.0;

/// Maximum row height in points.
pub const MAX_ROW_HEIGHT: f64 = 409.0;

/// Maximum font size in points.
pub const MAX_FONT_SIZE: f64 = 409.0;

/// Maximum length (in UTF-16 code units) of a sheet name.
pub const MAX_SHEET_NAME_LENGTH: usize = 31;

/// Maximum number of characters that a single cell can contain.
pub const MAX_CELL_CHARS: usize = 32_767;

/// Characters that are not allowed in Excel sheet names.
pub const SHEET_NAME_INVALID_CHARS: &[char] = &[':', '\\', '/', '?', '*', '[', ']'];

/// Default column width used when no explicit width is set (character-width units).
pub const DEFAULT_COL_WIDTH: f64 = 9.140625;

/// Default row height in points.
pub const DEFAULT_ROW_HEIGHT: f64 = 15.0;

/// First id assigned to a custom (non-builtin) number format.
pub const CUSTOM_NUM_FMT_BASE: u32 = 164;

/// Significant digits retained by inexact decimal division before rounding.
pub const DECIMAL_SIGNIFICANT_DIGITS: u32 = 15;

/// Row count threshold under which the SAX->StAX transformer's early-abort
/// byte-splice optimization is attempted.
pub const EARLY_ABORT_ROW_THRESHOLD: u32 = 10_000;

/// Worksheet part size, in bytes, above which early-abort is worth trying.
pub const EARLY_ABORT_MIN_PART_SIZE: u64 = 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_match_ooxml() {
        assert_eq!(MAX_COLUMN_INDEX, 16_383);
        assert_eq!(MAX_ROW_INDEX, 1_048_575);
        assert_eq!(MAX_CELL_STYLES, 65_430);
        assert_eq!(MAX_SHEET_NAME_LENGTH, 31);
        assert_eq!(MAX_CELL_CHARS, 32_767);
        assert_eq!(CUSTOM_NUM_FMT_BASE, 164);
    }

    #[test]
    fn sheet_name_invalid_chars_complete() {
        assert_eq!(SHEET_NAME_INVALID_CHARS.len(), 7);
        for c in [':', '\\', '/', '?', '*', '[', ']'] {
            assert!(SHEET_NAME_INVALID_CHARS.contains(&c));
        }
    }
}
