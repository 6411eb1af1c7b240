//! xl: library surface over `xl-core`'s immutable OOXML spreadsheet engine.
//!
//! Re-exports the pieces a caller needs to read, transform, stream, and
//! evaluate `.xlsx` workbooks without depending on `xl-core` directly.

pub use xl_core::address::{AnchorMode, ARef, CellRange, Column, Row};
pub use xl_core::cell::{Cell, CellValue, Comment, ErrorKind, RichRun};
pub use xl_core::error::{
    AddressingError, EvalError, ParseError, ReadError, TransformError, WorkbookError, WriteError,
};
pub use xl_core::evaluator;
pub use xl_core::formula::{self, Expr};
pub use xl_core::reader::{read_from_buffer, read_from_path};
pub use xl_core::sheet::{ColumnProps, RowProps, Sheet};
pub use xl_core::stream::{StreamRowOptions, StreamWriter};
pub use xl_core::stream_reader::{
    open_sheet_stream_by_index, open_sheet_stream_by_name, RangeBound, RowData,
};
pub use xl_core::style::{CellStyle, StyleApplyMode};
pub use xl_core::transform::{apply_patches_to_buffer, apply_patches_to_path, CellPatch, WorksheetPatchSet};
pub use xl_core::workbook::{DefinedName, ManifestPart, ThemeColors, Workbook};
pub use xl_core::writer::{write_to_buffer, write_to_path};
