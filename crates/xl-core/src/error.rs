//! Error types for the XL core engine.
//!
//! Each stage of the pipeline (addressing, workbook transforms, reading,
//! writing, formula parsing, formula evaluation, streaming transforms) has
//! its own closed error enum. [`TransformError`] wraps all of them for
//! callers that drive the SAX->StAX transformer, which can fail at any
//! stage of the pipeline.

use thiserror::Error;

/// Failures constructing or parsing an address (`Column`, `Row`, `ARef`,
/// `CellRange`, `SheetName`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressingError {
    #[error("invalid column index: {0}")]
    InvalidColumn(u32),

    #[error("invalid row index: {0}")]
    InvalidRow(u32),

    #[error("invalid cell reference: {0}")]
    InvalidRef(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid sheet name: {0}")]
    InvalidSheetName(String),
}

/// Failures manipulating a [`Workbook`](crate::workbook::Workbook) value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkbookError {
    #[error("sheet '{0}' does not exist")]
    SheetNotFound(String),

    #[error("sheet '{0}' already exists")]
    DuplicateSheet(String),

    #[error("merge range overlaps an existing merge: {0}")]
    OverlappingMerge(String),

    #[error("invalid workbook: {0}")]
    InvalidWorkbook(String),

    #[error(transparent)]
    Addressing(#[from] AddressingError),
}

/// Failures reading an `.xlsx` package.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("invalid ZIP archive: {0}")]
    InvalidZip(String),

    #[error("missing required part: {0}")]
    MissingPart(String),

    #[error("malformed XML in {part} at {location}")]
    MalformedXml { part: String, location: String },

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error(transparent)]
    Addressing(#[from] AddressingError),

    #[error(transparent)]
    Workbook(#[from] WorkbookError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures writing an `.xlsx` package.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    IoFailure(#[from] std::io::Error),

    #[error("style id {0} has no registered entry")]
    InvalidStyleReference(u32),

    #[error("rows must be written in ascending order: row {next} follows row {previous}")]
    RowsOutOfOrder { previous: u32, next: u32 },

    #[error("stream writer has already been finished")]
    AlreadyFinished,
}

/// Failures parsing formula text into an AST.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected character at {pos}: {ctx}")]
    UnexpectedChar { pos: usize, ctx: String },

    #[error("unbalanced parentheses")]
    UnbalancedParen,

    #[error("unknown function '{name}'{}", suggestion.as_ref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default())]
    UnknownFunction {
        name: String,
        suggestion: Option<String>,
    },

    #[error("expected {what} at position {pos}")]
    TokenExpected { what: String, pos: usize },

    #[error("cell reference out of range at position {pos}")]
    RefOutOfRange { pos: usize },
}

impl ParseError {
    /// Render a caret-pointed context window around the failing position,
    /// e.g. `=A1 + $\n      ^`.
    pub fn render_context(&self, source: &str) -> String {
        let pos = match self {
            ParseError::UnexpectedChar { pos, .. }
            | ParseError::TokenExpected { pos, .. }
            | ParseError::RefOutOfRange { pos } => *pos,
            ParseError::UnbalancedParen | ParseError::UnknownFunction { .. } => source.len(),
        };
        let pos = pos.min(source.len());
        let caret_line = format!("{}{}", " ".repeat(pos), "^");
        format!("{source}\n{caret_line}")
    }
}

/// Failures evaluating a parsed formula.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("division by zero: {num} / {denom}")]
    DivByZero { num: String, denom: String },

    #[error("reference error at {loc}: {reason}")]
    RefError { loc: String, reason: String },

    #[error("type mismatch in {op}: unexpected {kind}")]
    TypeMismatch { op: String, kind: String },

    #[error("{func} expects {expected} argument(s), got {actual}")]
    InvalidArgCount {
        func: String,
        expected: String,
        actual: usize,
    },

    #[error("circular reference: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("name not found: {0}")]
    NameNotFound(String),

    #[error("function not implemented: {0}")]
    NotImplemented(String),

    #[error("propagated error: {0:?}")]
    Propagated(crate::cell::ErrorKind),

    #[error("array formula spill range overlaps an occupied cell")]
    SpillOverlap,
}

/// Umbrella error for the SAX->StAX transformer, which can fail at any
/// stage: reading the source package, parsing styles, or writing the
/// patched output.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error(transparent)]
    Addressing(#[from] AddressingError),

    #[error(transparent)]
    Workbook(#[from] WorkbookError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addressing_error_messages() {
        assert_eq!(
            AddressingError::InvalidColumn(99999).to_string(),
            "invalid column index: 99999"
        );
        assert_eq!(
            AddressingError::InvalidSheetName("a/b".into()).to_string(),
            "invalid sheet name: a/b"
        );
    }

    #[test]
    fn workbook_error_from_addressing() {
        let e: WorkbookError = AddressingError::InvalidRow(0).into();
        assert!(matches!(e, WorkbookError::Addressing(_)));
    }

    #[test]
    fn transform_error_wraps_everything() {
        let e: TransformError = EvalError::SpillOverlap.into();
        assert!(matches!(e, TransformError::Eval(EvalError::SpillOverlap)));
        let e: TransformError = ParseError::UnbalancedParen.into();
        assert!(matches!(e, TransformError::Parse(_)));
    }

    #[test]
    fn unknown_function_suggestion_message() {
        let e = ParseError::UnknownFunction {
            name: "SUME".into(),
            suggestion: Some("SUM".into()),
        };
        assert_eq!(
            e.to_string(),
            "unknown function 'SUME' (did you mean 'SUM'?)"
        );
    }

    #[test]
    fn render_context_places_caret() {
        let e = ParseError::UnexpectedChar {
            pos: 3,
            ctx: "bad char".into(),
        };
        let rendered = e.render_context("=A1$");
        assert_eq!(rendered, "=A1$\n   ^");
    }
}
