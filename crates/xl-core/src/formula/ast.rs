//! AST types for parsed formulas.
//!
//! Operator precedence (lowest to highest): comparison, `+`/`-`,
//! `*`/`/`, `^` (right-associative), unary `-`, postfix `%`, primary.

use rust_decimal::Decimal;

use crate::address::{ARef, CellRange};
use crate::cell::CellValue;

/// A parsed formula expression. No `Paren` node: parenthesization is a
/// printer concern, not a semantic one — the parser resolves precedence
/// directly into tree shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(CellValue),
    Ref(ARef),
    QualifiedRef(String, ARef),
    RangeRef(CellRange),
    QualifiedRangeRef(String, CellRange),

    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),

    Eq(Box<Expr>, Box<Expr>),
    Neq(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Le(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Ge(Box<Expr>, Box<Expr>),

    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),

    /// A bare argument list, used only to bundle an aggregate function's
    /// arguments (`SUM(A1, B1:B10, 5)`) before evaluation flattens it.
    /// Not a logical operator, unlike [`Expr::And`]/[`Expr::Or`].
    List(Vec<Expr>),

    Concatenate(Vec<Expr>),
    Left(Box<Expr>, Option<Box<Expr>>),
    Right(Box<Expr>, Option<Box<Expr>>),
    Mid(Box<Expr>, Box<Expr>, Box<Expr>),
    Len(Box<Expr>),
    Upper(Box<Expr>),
    Lower(Box<Expr>),

    If(Box<Expr>, Box<Expr>, Box<Expr>),

    Sum(Box<Expr>),
    Count(Box<Expr>),
    Average(Box<Expr>),
    Min(Box<Expr>),
    Max(Box<Expr>),
    CountA(Box<Expr>),

    Today,
    Now,
    Date(Box<Expr>, Box<Expr>, Box<Expr>),
    Year(Box<Expr>),
    Month(Box<Expr>),
    Day(Box<Expr>),

    /// Any function name not covered above, for forward compatibility and
    /// extension (e.g. VLOOKUP, INDEX, MATCH) without growing the AST.
    Call(String, Vec<Expr>),
}

impl Expr {
    pub fn number(n: i64) -> Self {
        Self::Literal(CellValue::Number(Decimal::from(n)))
    }

    pub fn text(s: impl Into<String>) -> Self {
        Self::Literal(CellValue::Text(s.into()))
    }

    pub fn boolean(b: bool) -> Self {
        Self::Literal(CellValue::Bool(b))
    }
}

/// Binary operator precedence tiers, used by both the parser (to decide
/// how far to descend) and the printer (to decide where parens are
/// required).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    Comparison,
    Additive,
    Multiplicative,
    Power,
    Unary,
    Postfix,
    Primary,
}
