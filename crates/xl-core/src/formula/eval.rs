//! Formula evaluation: walks an [`Expr`] tree against a cell provider,
//! producing a [`CellValue`]. Mirrors Excel's short-circuit semantics —
//! an error encountered anywhere in a logical or conditional's operands
//! propagates before any boolean coercion happens.

use std::borrow::Cow;
use std::collections::HashSet;

use chrono::{Local, NaiveDateTime};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::address::{ARef, CellRange};
use crate::cell::{datetime_to_serial, serial_to_datetime, CellValue, ErrorKind};
use crate::error::EvalError;
use crate::utils::DECIMAL_SIGNIFICANT_DIGITS;

use super::ast::Expr;
use super::functions;

const MAX_EVAL_DEPTH: usize = 256;

/// Supplies the cell values a formula reads. Implemented by the sheet/
/// workbook evaluator and by test doubles.
pub trait CellProvider {
    fn cell_value(&self, sheet: &str, aref: ARef) -> CellValue;
    fn current_sheet(&self) -> &str;
}

/// Source of "now", injectable so [`Expr::Today`]/[`Expr::Now`] are
/// deterministic in tests. Defaults to the system's local clock.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Evaluates an [`Expr`] tree against a [`CellProvider`], tracking the
/// in-progress resolution stack so self-referential formulas surface as
/// [`EvalError::CycleDetected`] instead of recursing forever.
pub struct Evaluator<'a> {
    provider: &'a dyn CellProvider,
    clock: &'a dyn Clock,
    resolving: HashSet<(String, ARef)>,
    depth: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(provider: &'a dyn CellProvider, clock: &'a dyn Clock) -> Self {
        Self {
            provider,
            clock,
            resolving: HashSet::new(),
            depth: 0,
        }
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<CellValue, EvalError> {
        self.depth += 1;
        if self.depth > MAX_EVAL_DEPTH {
            self.depth -= 1;
            return Err(EvalError::RefError {
                loc: self.provider.current_sheet().to_string(),
                reason: "formula nesting too deep".to_string(),
            });
        }
        let result = self.eval_inner(expr);
        self.depth -= 1;
        result
    }

    fn eval_inner(&mut self, expr: &Expr) -> Result<CellValue, EvalError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),

            Expr::Ref(aref) => self.resolve(self.provider.current_sheet().to_string(), *aref),
            Expr::QualifiedRef(sheet, aref) => self.resolve(sheet.clone(), *aref),

            Expr::RangeRef(range) => {
                let sheet = self.provider.current_sheet().to_string();
                self.single_cell_of_range(sheet, range)
            }
            Expr::QualifiedRangeRef(sheet, range) => self.single_cell_of_range(sheet.clone(), range),

            Expr::Neg(a) => {
                let n = self.eval_number(a)?;
                Ok(CellValue::Number(-n))
            }

            Expr::Add(a, b) => self.binary_numeric(a, b, "+", |x, y| Ok(x + y)),
            Expr::Sub(a, b) => self.binary_numeric(a, b, "-", |x, y| Ok(x - y)),
            Expr::Mul(a, b) => self.binary_numeric(a, b, "*", |x, y| Ok(x * y)),
            Expr::Div(a, b) => {
                let x = self.eval_number(a)?;
                let y = self.eval_number(b)?;
                if y.is_zero() {
                    return Err(EvalError::DivByZero {
                        num: x.to_string(),
                        denom: y.to_string(),
                    });
                }
                Ok(CellValue::Number(round_to_significant_digits(x / y)))
            }
            Expr::Pow(a, b) => {
                let x = self.eval_number(a)?;
                let y = self.eval_number(b)?;
                pow_decimal(x, y)
            }

            Expr::Eq(a, b) => self.compare(a, b, |o| o == std::cmp::Ordering::Equal),
            Expr::Neq(a, b) => self.compare(a, b, |o| o != std::cmp::Ordering::Equal),
            Expr::Lt(a, b) => self.compare(a, b, |o| o == std::cmp::Ordering::Less),
            Expr::Le(a, b) => self.compare(a, b, |o| o != std::cmp::Ordering::Greater),
            Expr::Gt(a, b) => self.compare(a, b, |o| o == std::cmp::Ordering::Greater),
            Expr::Ge(a, b) => self.compare(a, b, |o| o != std::cmp::Ordering::Less),

            Expr::And(items) => {
                let mut acc = true;
                for item in items {
                    if !acc {
                        break;
                    }
                    let v = self.eval(item)?;
                    acc &= coerce_to_bool(&v)?;
                }
                Ok(CellValue::Bool(acc))
            }
            Expr::Or(items) => {
                let mut acc = false;
                for item in items {
                    if acc {
                        break;
                    }
                    let v = self.eval(item)?;
                    acc |= coerce_to_bool(&v)?;
                }
                Ok(CellValue::Bool(acc))
            }
            Expr::Not(a) => {
                let v = self.eval(a)?;
                Ok(CellValue::Bool(!coerce_to_bool(&v)?))
            }

            // A bare argument list is only ever evaluated through an
            // aggregate's flattening helper; reaching it directly is a
            // malformed tree.
            Expr::List(_) => Err(EvalError::TypeMismatch {
                op: "eval".to_string(),
                kind: "argument list".to_string(),
            }),

            Expr::Concatenate(items) => {
                let mut out = String::new();
                for item in items {
                    let v = self.eval(item)?;
                    out.push_str(&coerce_to_string(&v));
                }
                Ok(CellValue::Text(out))
            }
            Expr::Left(a, count) => self.text_slice(a, count, true),
            Expr::Right(a, count) => self.text_slice(a, count, false),
            Expr::Mid(a, start, len) => {
                let s = coerce_to_string(&self.eval(a)?);
                let start = self.eval_number(start)?.to_string().parse::<i64>().unwrap_or(1);
                let len = self.eval_number(len)?.to_string().parse::<i64>().unwrap_or(0);
                if start < 1 || len < 0 {
                    return Ok(CellValue::Error(ErrorKind::Value));
                }
                let result: String = s
                    .chars()
                    .skip((start - 1) as usize)
                    .take(len as usize)
                    .collect();
                Ok(CellValue::Text(result))
            }
            Expr::Len(a) => {
                let s = coerce_to_string(&self.eval(a)?);
                Ok(CellValue::Number(Decimal::from(s.chars().count())))
            }
            Expr::Upper(a) => Ok(CellValue::Text(coerce_to_string(&self.eval(a)?).to_uppercase())),
            Expr::Lower(a) => Ok(CellValue::Text(coerce_to_string(&self.eval(a)?).to_lowercase())),

            Expr::If(cond, then_branch, else_branch) => {
                let c = self.eval(cond)?;
                if coerce_to_bool(&c)? {
                    self.eval(then_branch)
                } else {
                    self.eval(else_branch)
                }
            }

            Expr::Sum(args) => {
                let nums = self.collect_numbers(args)?;
                Ok(CellValue::Number(nums.into_iter().sum()))
            }
            Expr::Count(args) => {
                let values = self.flatten(args)?;
                let n = values
                    .iter()
                    .filter(|v| matches!(v, CellValue::Number(_) | CellValue::DateTime(_)))
                    .count();
                Ok(CellValue::Number(Decimal::from(n)))
            }
            Expr::CountA(args) => {
                let values = self.flatten(args)?;
                let n = values.iter().filter(|v| !v.is_empty()).count();
                Ok(CellValue::Number(Decimal::from(n)))
            }
            Expr::Average(args) => {
                let nums = self.collect_numbers(args)?;
                if nums.is_empty() {
                    return Err(EvalError::DivByZero {
                        num: "0".to_string(),
                        denom: "0".to_string(),
                    });
                }
                let sum: Decimal = nums.iter().sum();
                Ok(CellValue::Number(sum / Decimal::from(nums.len())))
            }
            Expr::Min(args) => {
                let nums = self.collect_numbers(args)?;
                let min = nums
                    .into_iter()
                    .reduce(|a, b| if b < a { b } else { a })
                    .unwrap_or(Decimal::ZERO);
                Ok(CellValue::Number(min))
            }
            Expr::Max(args) => {
                let nums = self.collect_numbers(args)?;
                let max = nums
                    .into_iter()
                    .reduce(|a, b| if b > a { b } else { a })
                    .unwrap_or(Decimal::ZERO);
                Ok(CellValue::Number(max))
            }

            Expr::Today => {
                let today = self.clock.now().date();
                Ok(CellValue::DateTime(
                    today.and_hms_opt(0, 0, 0).expect("midnight is valid"),
                ))
            }
            Expr::Now => Ok(CellValue::DateTime(self.clock.now())),
            Expr::Date(y, m, d) => {
                let year = self.eval_number(y)?.to_string().parse::<i32>().unwrap_or(1900);
                let month = self.eval_number(m)?.to_string().parse::<u32>().unwrap_or(1);
                let day = self.eval_number(d)?.to_string().parse::<u32>().unwrap_or(1);
                match chrono::NaiveDate::from_ymd_opt(year, month, day) {
                    Some(date) => {
                        Ok(CellValue::DateTime(date.and_hms_opt(0, 0, 0).expect("midnight is valid")))
                    }
                    None => Ok(CellValue::Error(ErrorKind::Num)),
                }
            }
            Expr::Year(a) => self.date_part(a, |dt| dt.date().format("%Y").to_string().parse().unwrap_or(0)),
            Expr::Month(a) => self.date_part(a, |dt| dt.date().format("%m").to_string().parse().unwrap_or(0)),
            Expr::Day(a) => self.date_part(a, |dt| dt.date().format("%d").to_string().parse().unwrap_or(0)),

            Expr::Call(name, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_call_arg(arg)?);
                }
                functions::call(name, &values)
            }
        }
    }

    fn eval_call_arg(&mut self, expr: &Expr) -> Result<CellValue, EvalError> {
        self.eval(expr)
    }

    fn resolve(&mut self, sheet: String, aref: ARef) -> Result<CellValue, EvalError> {
        let key = (sheet.clone(), aref);
        if !self.resolving.insert(key.clone()) {
            return Err(EvalError::CycleDetected {
                path: vec![format!("{sheet}!{}", aref.print_a1())],
            });
        }
        let value = self.provider.cell_value(&sheet, aref);
        let result = match &value {
            CellValue::Formula { expr, cached } => match cached {
                Some(v) => Ok((**v).clone()),
                None => {
                    let ast = super::parser::parse_formula(expr)?;
                    self.eval(&ast)
                }
            },
            other => Ok(other.clone()),
        };
        self.resolving.remove(&key);
        result
    }

    /// A range used where a scalar is expected (outside an aggregate)
    /// collapses to its top-left cell, matching Excel's implicit
    /// intersection for non-array contexts.
    fn single_cell_of_range(&mut self, sheet: String, range: &CellRange) -> Result<CellValue, EvalError> {
        self.resolve(sheet, range.start)
    }

    fn eval_number(&mut self, expr: &Expr) -> Result<Decimal, EvalError> {
        let v = self.eval(expr)?;
        coerce_to_number(&v)
    }

    fn binary_numeric(
        &mut self,
        a: &Expr,
        b: &Expr,
        op: &str,
        f: impl Fn(Decimal, Decimal) -> Result<Decimal, EvalError>,
    ) -> Result<CellValue, EvalError> {
        let x = self.eval_number(a)?;
        let y = self.eval_number(b)?;
        f(x, y).map(CellValue::Number).map_err(|e| match e {
            EvalError::TypeMismatch { kind, .. } => EvalError::TypeMismatch {
                op: op.to_string(),
                kind,
            },
            other => other,
        })
    }

    fn compare(
        &mut self,
        a: &Expr,
        b: &Expr,
        accept: impl Fn(std::cmp::Ordering) -> bool,
    ) -> Result<CellValue, EvalError> {
        let x = self.eval(a)?;
        let y = self.eval(b)?;
        Ok(CellValue::Bool(accept(compare_values(&x, &y))))
    }

    fn text_slice(
        &mut self,
        a: &Expr,
        count: &Option<Box<Expr>>,
        from_left: bool,
    ) -> Result<CellValue, EvalError> {
        let s = coerce_to_string(&self.eval(a)?);
        let n = match count {
            Some(c) => {
                let d = self.eval_number(c)?;
                d.to_string().parse::<i64>().unwrap_or(1).max(0) as usize
            }
            None => 1,
        };
        let chars: Vec<char> = s.chars().collect();
        let result: String = if from_left {
            chars.into_iter().take(n).collect()
        } else {
            let start = chars.len().saturating_sub(n);
            chars[start..].iter().collect()
        };
        Ok(CellValue::Text(result))
    }

    fn date_part(&mut self, expr: &Expr, extract: impl Fn(NaiveDateTime) -> i64) -> Result<CellValue, EvalError> {
        let v = self.eval(expr)?;
        let dt = coerce_to_datetime(&v)?;
        Ok(CellValue::Number(Decimal::from(extract(dt))))
    }

    /// Evaluate `args` (an [`Expr::List`] or a bare scalar/range) to a flat
    /// list of [`CellValue`]s, expanding ranges cell by cell.
    fn flatten(&mut self, args: &Expr) -> Result<Vec<CellValue>, EvalError> {
        match args {
            Expr::List(items) => {
                let mut out = Vec::new();
                for item in items {
                    out.extend(self.flatten(item)?);
                }
                Ok(out)
            }
            Expr::RangeRef(range) => {
                let sheet = self.provider.current_sheet().to_string();
                self.expand_range(sheet, range)
            }
            Expr::QualifiedRangeRef(sheet, range) => self.expand_range(sheet.clone(), range),
            other => Ok(vec![self.eval(other)?]),
        }
    }

    fn expand_range(&mut self, sheet: String, range: &CellRange) -> Result<Vec<CellValue>, EvalError> {
        let mut out = Vec::with_capacity(range.cell_count() as usize);
        for aref in range.iter_row_major() {
            out.push(self.resolve(sheet.clone(), aref)?);
        }
        Ok(out)
    }

    /// Like [`Self::flatten`], but drops non-numeric entries (empty cells,
    /// text, bools) the way `SUM`/`AVERAGE`/`MIN`/`MAX` silently ignore
    /// them when scanning a range, while still propagating errors.
    fn collect_numbers(&mut self, args: &Expr) -> Result<Vec<Decimal>, EvalError> {
        let values = self.flatten(args)?;
        let mut out = Vec::with_capacity(values.len());
        for v in values {
            match v {
                CellValue::Number(n) => out.push(n),
                CellValue::DateTime(dt) => out.push(datetime_to_serial(dt)),
                CellValue::Error(e) => return Err(EvalError::Propagated(e)),
                CellValue::Empty | CellValue::Text(_) | CellValue::Bool(_) | CellValue::RichText(_) => {}
                CellValue::Formula { .. } => {}
            }
        }
        Ok(out)
    }
}

/// Round a non-terminating division result to `DECIMAL_SIGNIFICANT_DIGITS`
/// significant digits, round-half-to-even, matching Excel's display
/// precision rather than `Decimal`'s own (up to 28 digit) division scale.
fn round_to_significant_digits(value: Decimal) -> Decimal {
    if value.is_zero() {
        return value;
    }
    let abs = value.abs();
    let magnitude = if abs >= Decimal::ONE {
        abs.trunc().to_string().len() as i64
    } else {
        let s = abs.to_string();
        let frac = s.split('.').nth(1).unwrap_or("");
        let leading_zeros = frac.chars().take_while(|c| *c == '0').count() as i64;
        -leading_zeros
    };
    let dp = (DECIMAL_SIGNIFICANT_DIGITS as i64 - magnitude).clamp(0, 28) as u32;
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointNearestEven)
}

fn pow_decimal(base: Decimal, exp: Decimal) -> Result<CellValue, EvalError> {
    if exp == exp.trunc() && exp >= Decimal::ZERO && exp <= Decimal::from(64) {
        let n: u64 = exp.to_string().parse().unwrap_or(0);
        let mut acc = Decimal::ONE;
        for _ in 0..n {
            acc *= base;
        }
        return Ok(CellValue::Number(acc));
    }
    let base_f: f64 = base.try_into().map_err(|_| EvalError::TypeMismatch {
        op: "^".to_string(),
        kind: "non-numeric base".to_string(),
    })?;
    let exp_f: f64 = exp.try_into().map_err(|_| EvalError::TypeMismatch {
        op: "^".to_string(),
        kind: "non-numeric exponent".to_string(),
    })?;
    let result = base_f.powf(exp_f);
    if !result.is_finite() {
        return Ok(CellValue::Error(ErrorKind::Num));
    }
    Decimal::try_from(result)
        .map(CellValue::Number)
        .map_err(|_| EvalError::TypeMismatch {
            op: "^".to_string(),
            kind: "overflow".to_string(),
        })
}

/// Coerce a value to a number, as required by arithmetic operators and
/// numeric functions. Text parses if it looks like a number; booleans
/// widen to 0/1; anything else is a type mismatch.
pub fn coerce_to_number(value: &CellValue) -> Result<Decimal, EvalError> {
    match value {
        CellValue::Number(n) => Ok(*n),
        CellValue::DateTime(dt) => Ok(datetime_to_serial(*dt)),
        CellValue::Bool(b) => Ok(if *b { Decimal::ONE } else { Decimal::ZERO }),
        CellValue::Empty => Ok(Decimal::ZERO),
        CellValue::Text(s) => s.trim().parse::<Decimal>().map_err(|_| EvalError::TypeMismatch {
            op: "coerce_to_number".to_string(),
            kind: format!("text '{s}'"),
        }),
        CellValue::Error(e) => Err(EvalError::Propagated(*e)),
        CellValue::RichText(runs) => {
            let s: String = runs.iter().map(|r| r.text.as_str()).collect();
            s.trim().parse::<Decimal>().map_err(|_| EvalError::TypeMismatch {
                op: "coerce_to_number".to_string(),
                kind: format!("text '{s}'"),
            })
        }
        CellValue::Formula { cached: Some(v), .. } => coerce_to_number(v),
        CellValue::Formula { cached: None, .. } => Err(EvalError::TypeMismatch {
            op: "coerce_to_number".to_string(),
            kind: "unevaluated formula".to_string(),
        }),
    }
}

pub fn coerce_to_string(value: &CellValue) -> String {
    value.to_string()
}

/// Coerce a value to a boolean, as required by `IF`/`AND`/`OR`/`NOT`.
/// Errors short-circuit here rather than coercing to a truth value.
pub fn coerce_to_bool(value: &CellValue) -> Result<bool, EvalError> {
    match value {
        CellValue::Bool(b) => Ok(*b),
        CellValue::Number(n) => Ok(!n.is_zero()),
        CellValue::Empty => Ok(false),
        CellValue::Text(s) => match s.to_ascii_uppercase().as_str() {
            "TRUE" => Ok(true),
            "FALSE" => Ok(false),
            _ => Err(EvalError::TypeMismatch {
                op: "coerce_to_bool".to_string(),
                kind: format!("text '{s}'"),
            }),
        },
        CellValue::Error(e) => Err(EvalError::Propagated(*e)),
        CellValue::DateTime(_) => Ok(true),
        CellValue::RichText(_) => Err(EvalError::TypeMismatch {
            op: "coerce_to_bool".to_string(),
            kind: "rich text".to_string(),
        }),
        CellValue::Formula { cached: Some(v), .. } => coerce_to_bool(v),
        CellValue::Formula { cached: None, .. } => Err(EvalError::TypeMismatch {
            op: "coerce_to_bool".to_string(),
            kind: "unevaluated formula".to_string(),
        }),
    }
}

fn coerce_to_datetime(value: &CellValue) -> Result<NaiveDateTime, EvalError> {
    match value {
        CellValue::DateTime(dt) => Ok(*dt),
        CellValue::Number(n) => serial_to_datetime(*n).ok_or_else(|| EvalError::TypeMismatch {
            op: "coerce_to_datetime".to_string(),
            kind: format!("serial {n}"),
        }),
        CellValue::Error(e) => Err(EvalError::Propagated(*e)),
        other => Err(EvalError::TypeMismatch {
            op: "coerce_to_datetime".to_string(),
            kind: format!("{other:?}"),
        }),
    }
}

/// An empty cell compares as `0` in a numeric context and `""` against
/// text, rather than as its own kind.
fn normalize_empty_for_compare<'a>(value: &'a CellValue, other: &CellValue) -> Cow<'a, CellValue> {
    match value {
        CellValue::Empty => Cow::Owned(match other {
            CellValue::Text(_) | CellValue::RichText(_) => CellValue::Text(String::new()),
            _ => CellValue::Number(Decimal::ZERO),
        }),
        _ => Cow::Borrowed(value),
    }
}

/// Mixed-type ordering used by comparison operators: [`CellValue::kind_rank`]
/// separates kinds, then values of the same kind compare directly.
pub fn compare_values(a: &CellValue, b: &CellValue) -> std::cmp::Ordering {
    let a = normalize_empty_for_compare(a, b);
    let b = normalize_empty_for_compare(b, &a);
    let (ra, rb) = (a.kind_rank(), b.kind_rank());
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a.as_ref(), b.as_ref()) {
        (CellValue::Number(x), CellValue::Number(y)) => x.cmp(y),
        (CellValue::DateTime(x), CellValue::DateTime(y)) => x.cmp(y),
        (CellValue::Number(x), CellValue::DateTime(y)) => x.cmp(&datetime_to_serial(*y)),
        (CellValue::DateTime(x), CellValue::Number(y)) => datetime_to_serial(*x).cmp(y),
        (CellValue::Text(x), CellValue::Text(y)) => x.to_ascii_lowercase().cmp(&y.to_ascii_lowercase()),
        (CellValue::Bool(x), CellValue::Bool(y)) => x.cmp(y),
        _ => std::cmp::Ordering::Equal,
    }
}
