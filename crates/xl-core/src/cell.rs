//! Cell values, error kinds, rich text runs, and comments.

use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use rust_decimal::Decimal;

/// Excel's built-in error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Div0,
    NA,
    Name,
    Null,
    Num,
    Ref,
    Value,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Div0 => "#DIV/0!",
            Self::NA => "#N/A",
            Self::Name => "#NAME?",
            Self::Null => "#NULL!",
            Self::Num => "#NUM!",
            Self::Ref => "#REF!",
            Self::Value => "#VALUE!",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "#DIV/0!" => Ok(Self::Div0),
            "#N/A" => Ok(Self::NA),
            "#NAME?" => Ok(Self::Name),
            "#NULL!" => Ok(Self::Null),
            "#NUM!" => Ok(Self::Num),
            "#REF!" => Ok(Self::Ref),
            "#VALUE!" => Ok(Self::Value),
            _ => Err(()),
        }
    }
}

/// One run of rich text: an optional font name (resolved against the
/// sheet's style registry) and its literal text.
#[derive(Debug, Clone, PartialEq)]
pub struct RichRun {
    pub font: Option<String>,
    pub text: String,
}

impl RichRun {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            font: None,
            text: text.into(),
        }
    }
}

/// A cell comment: rich text body plus an optional author name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Comment {
    pub body: Vec<RichRun>,
    pub author: Option<String>,
}

impl Comment {
    pub fn plain_text(text: impl Into<String>, author: Option<String>) -> Self {
        Self {
            body: vec![RichRun::plain(text)],
            author,
        }
    }
}

/// Excel epoch for serial date conversion. Day arithmetic from this date
/// intentionally reproduces the 1900 leap-year bug for serials >= 61,
/// matching common producers (Excel, Google Sheets, LibreOffice).
fn excel_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).expect("valid calendar date")
}

/// Convert a calendar date-time to its Excel serial value.
pub fn datetime_to_serial(dt: NaiveDateTime) -> Decimal {
    let days = (dt.date() - excel_epoch()).num_days();
    let secs_of_day =
        dt.time().hour() as i64 * 3600 + dt.time().minute() as i64 * 60 + dt.time().second() as i64;
    let frac = Decimal::new(secs_of_day, 0) / Decimal::new(86_400, 0);
    Decimal::new(days, 0) + frac
}

/// Convert an Excel serial value back to a calendar date-time.
pub fn serial_to_datetime(serial: Decimal) -> Option<NaiveDateTime> {
    let days = serial.trunc().to_string().parse::<i64>().ok()?;
    let frac = serial - Decimal::new(days, 0);
    let frac_f64: f64 = frac.try_into().ok()?;
    let seconds = (frac_f64 * 86_400.0).round() as i64;
    let date = excel_epoch().checked_add_signed(Duration::days(days))?;
    let dt = date.and_hms_opt(0, 0, 0)?;
    dt.checked_add_signed(Duration::seconds(seconds))
}

/// The tagged union of everything a cell can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(Decimal),
    Bool(bool),
    Error(ErrorKind),
    DateTime(NaiveDateTime),
    RichText(Vec<RichRun>),
    /// A formula's source text plus its last computed value, if any.
    Formula {
        expr: String,
        cached: Option<Box<CellValue>>,
    },
}

impl Default for CellValue {
    fn default() -> Self {
        Self::Empty
    }
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn formula(expr: impl Into<String>, cached: Option<CellValue>) -> Self {
        Self::Formula {
            expr: expr.into(),
            cached: cached.map(Box::new),
        }
    }

    /// Ordering rank for mixed-type comparisons: number < text < bool.
    /// Errors and unresolved formulas rank outside the normal ordering.
    pub fn kind_rank(&self) -> u8 {
        match self {
            Self::Number(_) | Self::DateTime(_) | Self::Empty => 0,
            Self::Text(_) | Self::RichText(_) => 1,
            Self::Bool(_) => 2,
            Self::Error(_) => 3,
            Self::Formula { cached, .. } => cached.as_deref().map(CellValue::kind_rank).unwrap_or(0),
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        if s.trim().is_empty() {
            Self::Empty
        } else {
            Self::Text(s.to_string())
        }
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::from(s.as_str())
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        Self::Number(Decimal::from(n))
    }
}

impl From<i32> for CellValue {
    fn from(n: i32) -> Self {
        Self::Number(Decimal::from(n))
    }
}

impl From<Decimal> for CellValue {
    fn from(n: Decimal) -> Self {
        Self::Number(n)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        Decimal::try_from(n)
            .map(Self::Number)
            .unwrap_or(Self::Error(ErrorKind::Num))
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, ""),
            Self::Text(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Self::Error(e) => write!(f, "{e}"),
            Self::DateTime(dt) => write!(f, "{dt}"),
            Self::RichText(runs) => {
                for run in runs {
                    write!(f, "{}", run.text)?;
                }
                Ok(())
            }
            Self::Formula { expr, cached } => match cached {
                Some(v) => write!(f, "{v}"),
                None => write!(f, "={expr}"),
            },
        }
    }
}

/// A cell: its value plus the bits that anchor it to rendering and
/// annotation state. Identity (sheet + location) lives outside this type.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cell {
    pub value: CellValue,
    pub style_id: Option<u32>,
    pub comment: Option<Comment>,
    pub hyperlink: Option<String>,
}

impl Cell {
    pub fn new(value: CellValue) -> Self {
        Self {
            value,
            style_id: None,
            comment: None,
            hyperlink: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
            && self.style_id.is_none()
            && self.comment.is_none()
            && self.hyperlink.is_none()
    }

    pub fn with_style(mut self, style_id: u32) -> Self {
        self.style_id = Some(style_id);
        self
    }
}

impl From<CellValue> for Cell {
    fn from(value: CellValue) -> Self {
        Cell::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_roundtrip() {
        for kind in [
            ErrorKind::Div0,
            ErrorKind::NA,
            ErrorKind::Name,
            ErrorKind::Null,
            ErrorKind::Num,
            ErrorKind::Ref,
            ErrorKind::Value,
        ] {
            let text = kind.to_string();
            assert_eq!(text.parse::<ErrorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn primitive_widening() {
        assert_eq!(CellValue::from(""), CellValue::Empty);
        assert_eq!(CellValue::from("   "), CellValue::Empty);
        assert_eq!(CellValue::from("hi"), CellValue::Text("hi".into()));
        assert_eq!(CellValue::from(true), CellValue::Bool(true));
        assert_eq!(CellValue::from(42i64), CellValue::Number(Decimal::from(42)));
    }

    #[test]
    fn serial_roundtrip_modern_date() {
        let dt = NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let serial = datetime_to_serial(dt);
        let back = serial_to_datetime(serial).unwrap();
        assert_eq!(back.date(), dt.date());
    }

    #[test]
    fn kind_rank_orders_number_text_bool() {
        assert!(
            CellValue::Number(Decimal::ZERO).kind_rank() < CellValue::Text("a".into()).kind_rank()
        );
        assert!(CellValue::Text("a".into()).kind_rank() < CellValue::Bool(true).kind_rank());
    }
}
