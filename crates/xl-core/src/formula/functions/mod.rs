//! Extension functions reachable only through [`Expr::Call`].
//!
//! Every function named directly in the grammar (`SUM`, `IF`, `LEFT`, ...)
//! gets its own [`Expr`](super::ast::Expr) variant and is evaluated
//! directly by [`super::eval::Evaluator`]. This module covers everything
//! else: common functions worth supporting without growing the AST for
//! each one, dispatched by name over already-evaluated arguments.

use rust_decimal::Decimal;

use crate::cell::CellValue;
use crate::error::EvalError;

use super::eval::{coerce_to_number, coerce_to_string};

/// Resolve and invoke `name` against pre-evaluated `args`. Unknown names
/// surface as [`EvalError::NotImplemented`] rather than a parse failure,
/// since [`Expr::Call`](super::ast::Expr::Call) accepts any identifier.
pub fn call(name: &str, args: &[CellValue]) -> Result<CellValue, EvalError> {
    match name.to_ascii_uppercase().as_str() {
        "ABS" => {
            check_arg_count(name, args, 1, 1)?;
            Ok(CellValue::Number(coerce_to_number(&args[0])?.abs()))
        }
        "ROUND" => {
            check_arg_count(name, args, 2, 2)?;
            let n = coerce_to_number(&args[0])?;
            let digits: i32 = coerce_to_number(&args[1])?
                .to_string()
                .parse()
                .unwrap_or(0);
            Ok(CellValue::Number(round_to(n, digits)))
        }
        "TRUNC" => {
            check_arg_count(name, args, 1, 2)?;
            let n = coerce_to_number(&args[0])?;
            let digits: i32 = if args.len() > 1 {
                coerce_to_number(&args[1])?.to_string().parse().unwrap_or(0)
            } else {
                0
            };
            Ok(CellValue::Number(truncate_to(n, digits)))
        }
        "MOD" => {
            check_arg_count(name, args, 2, 2)?;
            let a = coerce_to_number(&args[0])?;
            let b = coerce_to_number(&args[1])?;
            if b.is_zero() {
                return Err(EvalError::DivByZero {
                    num: a.to_string(),
                    denom: b.to_string(),
                });
            }
            // Result takes the divisor's sign, per Excel's MOD.
            let result = a - (a / b).floor() * b;
            Ok(CellValue::Number(result))
        }
        "POWER" => {
            check_arg_count(name, args, 2, 2)?;
            let base = coerce_to_number(&args[0])?;
            let exp = coerce_to_number(&args[1])?;
            pow(base, exp)
        }
        "SQRT" => {
            check_arg_count(name, args, 1, 1)?;
            let n = coerce_to_number(&args[0])?;
            if n.is_sign_negative() {
                return Ok(CellValue::Error(crate::cell::ErrorKind::Num));
            }
            let f: f64 = n.try_into().map_err(|_| EvalError::TypeMismatch {
                op: "SQRT".to_string(),
                kind: "non-numeric".to_string(),
            })?;
            Decimal::try_from(f.sqrt())
                .map(CellValue::Number)
                .map_err(|_| EvalError::TypeMismatch {
                    op: "SQRT".to_string(),
                    kind: "irrational result".to_string(),
                })
        }
        "TRIM" => {
            check_arg_count(name, args, 1, 1)?;
            let s = coerce_to_string(&args[0]);
            Ok(CellValue::Text(s.split_whitespace().collect::<Vec<_>>().join(" ")))
        }
        "EXACT" => {
            check_arg_count(name, args, 2, 2)?;
            Ok(CellValue::Bool(
                coerce_to_string(&args[0]) == coerce_to_string(&args[1]),
            ))
        }
        "VALUE" => {
            check_arg_count(name, args, 1, 1)?;
            match coerce_to_number(&args[0]) {
                Ok(n) => Ok(CellValue::Number(n)),
                Err(_) => Ok(CellValue::Error(crate::cell::ErrorKind::Value)),
            }
        }
        "ISBLANK" => {
            check_arg_count(name, args, 1, 1)?;
            Ok(CellValue::Bool(matches!(args[0], CellValue::Empty)))
        }
        "ISNUMBER" => {
            check_arg_count(name, args, 1, 1)?;
            Ok(CellValue::Bool(matches!(
                args[0],
                CellValue::Number(_) | CellValue::DateTime(_)
            )))
        }
        "ISTEXT" => {
            check_arg_count(name, args, 1, 1)?;
            Ok(CellValue::Bool(matches!(args[0], CellValue::Text(_))))
        }
        "ISERROR" => {
            check_arg_count(name, args, 1, 1)?;
            Ok(CellValue::Bool(matches!(args[0], CellValue::Error(_))))
        }
        other => Err(EvalError::NotImplemented(other.to_string())),
    }
}

/// Verify `args` has between `min` and `max` entries (inclusive).
fn check_arg_count(name: &str, args: &[CellValue], min: usize, max: usize) -> Result<(), EvalError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min}..{max}")
        };
        return Err(EvalError::InvalidArgCount {
            func: name.to_string(),
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

fn round_to(n: Decimal, digits: i32) -> Decimal {
    if digits >= 0 {
        n.round_dp(digits as u32)
    } else {
        let factor = Decimal::from(10i64.pow((-digits) as u32));
        (n / factor).round() * factor
    }
}

fn truncate_to(n: Decimal, digits: i32) -> Decimal {
    if digits >= 0 {
        n.trunc_with_scale(digits as u32)
    } else {
        let factor = Decimal::from(10i64.pow((-digits) as u32));
        (n / factor).trunc() * factor
    }
}

fn pow(base: Decimal, exp: Decimal) -> Result<CellValue, EvalError> {
    if exp == exp.trunc() && exp >= Decimal::ZERO && exp <= Decimal::from(64) {
        let n: u64 = exp.to_string().parse().unwrap_or(0);
        let mut acc = Decimal::ONE;
        for _ in 0..n {
            acc *= base;
        }
        return Ok(CellValue::Number(acc));
    }
    let base_f: f64 = base.try_into().map_err(|_| EvalError::TypeMismatch {
        op: "POWER".to_string(),
        kind: "non-numeric base".to_string(),
    })?;
    let exp_f: f64 = exp.try_into().map_err(|_| EvalError::TypeMismatch {
        op: "POWER".to_string(),
        kind: "non-numeric exponent".to_string(),
    })?;
    Decimal::try_from(base_f.powf(exp_f))
        .map(CellValue::Number)
        .map_err(|_| EvalError::TypeMismatch {
            op: "POWER".to_string(),
            kind: "overflow".to_string(),
        })
}
