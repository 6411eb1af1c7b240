//! AST-level shifting: translate every relative reference in a formula by
//! `(delta_col, delta_row)`, e.g. when a row is inserted or a formula is
//! copy-pasted to a new location. Absolute axes are preserved byte-exact;
//! a relative axis that would move out of the addressable grid becomes a
//! `#REF!` error literal at that node, matching Excel's own behavior.

use crate::cell::{CellValue, ErrorKind};

use super::ast::Expr;

pub fn shift(expr: &Expr, delta_col: i64, delta_row: i64) -> Expr {
    match expr {
        Expr::Literal(_) | Expr::Today | Expr::Now => expr.clone(),

        Expr::Ref(aref) => match aref.shift(delta_col, delta_row) {
            Some(shifted) => Expr::Ref(shifted),
            None => ref_error(),
        },
        Expr::QualifiedRef(sheet, aref) => match aref.shift(delta_col, delta_row) {
            Some(shifted) => Expr::QualifiedRef(sheet.clone(), shifted),
            None => ref_error(),
        },
        Expr::RangeRef(range) => match range.shift(delta_col, delta_row) {
            Some(shifted) => Expr::RangeRef(shifted),
            None => ref_error(),
        },
        Expr::QualifiedRangeRef(sheet, range) => match range.shift(delta_col, delta_row) {
            Some(shifted) => Expr::QualifiedRangeRef(sheet.clone(), shifted),
            None => ref_error(),
        },

        Expr::Neg(a) => Expr::Neg(b(shift(a, delta_col, delta_row))),
        Expr::Not(a) => Expr::Not(b(shift(a, delta_col, delta_row))),
        Expr::Len(a) => Expr::Len(b(shift(a, delta_col, delta_row))),
        Expr::Upper(a) => Expr::Upper(b(shift(a, delta_col, delta_row))),
        Expr::Lower(a) => Expr::Lower(b(shift(a, delta_col, delta_row))),
        Expr::Year(a) => Expr::Year(b(shift(a, delta_col, delta_row))),
        Expr::Month(a) => Expr::Month(b(shift(a, delta_col, delta_row))),
        Expr::Day(a) => Expr::Day(b(shift(a, delta_col, delta_row))),
        Expr::Sum(a) => Expr::Sum(b(shift(a, delta_col, delta_row))),
        Expr::Count(a) => Expr::Count(b(shift(a, delta_col, delta_row))),
        Expr::Average(a) => Expr::Average(b(shift(a, delta_col, delta_row))),
        Expr::Min(a) => Expr::Min(b(shift(a, delta_col, delta_row))),
        Expr::Max(a) => Expr::Max(b(shift(a, delta_col, delta_row))),
        Expr::CountA(a) => Expr::CountA(b(shift(a, delta_col, delta_row))),

        Expr::Add(a, c) => Expr::Add(b(shift(a, delta_col, delta_row)), b(shift(c, delta_col, delta_row))),
        Expr::Sub(a, c) => Expr::Sub(b(shift(a, delta_col, delta_row)), b(shift(c, delta_col, delta_row))),
        Expr::Mul(a, c) => Expr::Mul(b(shift(a, delta_col, delta_row)), b(shift(c, delta_col, delta_row))),
        Expr::Div(a, c) => Expr::Div(b(shift(a, delta_col, delta_row)), b(shift(c, delta_col, delta_row))),
        Expr::Pow(a, c) => Expr::Pow(b(shift(a, delta_col, delta_row)), b(shift(c, delta_col, delta_row))),
        Expr::Eq(a, c) => Expr::Eq(b(shift(a, delta_col, delta_row)), b(shift(c, delta_col, delta_row))),
        Expr::Neq(a, c) => Expr::Neq(b(shift(a, delta_col, delta_row)), b(shift(c, delta_col, delta_row))),
        Expr::Lt(a, c) => Expr::Lt(b(shift(a, delta_col, delta_row)), b(shift(c, delta_col, delta_row))),
        Expr::Le(a, c) => Expr::Le(b(shift(a, delta_col, delta_row)), b(shift(c, delta_col, delta_row))),
        Expr::Gt(a, c) => Expr::Gt(b(shift(a, delta_col, delta_row)), b(shift(c, delta_col, delta_row))),
        Expr::Ge(a, c) => Expr::Ge(b(shift(a, delta_col, delta_row)), b(shift(c, delta_col, delta_row))),

        Expr::And(items) => Expr::And(shift_list(items, delta_col, delta_row)),
        Expr::Or(items) => Expr::Or(shift_list(items, delta_col, delta_row)),
        Expr::List(items) => Expr::List(shift_list(items, delta_col, delta_row)),
        Expr::Concatenate(items) => Expr::Concatenate(shift_list(items, delta_col, delta_row)),

        Expr::Left(a, count) => Expr::Left(
            b(shift(a, delta_col, delta_row)),
            count.as_ref().map(|c| b(shift(c, delta_col, delta_row))),
        ),
        Expr::Right(a, count) => Expr::Right(
            b(shift(a, delta_col, delta_row)),
            count.as_ref().map(|c| b(shift(c, delta_col, delta_row))),
        ),
        Expr::Mid(a, c, d) => Expr::Mid(
            b(shift(a, delta_col, delta_row)),
            b(shift(c, delta_col, delta_row)),
            b(shift(d, delta_col, delta_row)),
        ),
        Expr::If(cond, t, f) => Expr::If(
            b(shift(cond, delta_col, delta_row)),
            b(shift(t, delta_col, delta_row)),
            b(shift(f, delta_col, delta_row)),
        ),
        Expr::Date(y, m, d) => Expr::Date(
            b(shift(y, delta_col, delta_row)),
            b(shift(m, delta_col, delta_row)),
            b(shift(d, delta_col, delta_row)),
        ),
        Expr::Call(name, args) => Expr::Call(name.clone(), shift_list(args, delta_col, delta_row)),
    }
}

fn shift_list(items: &[Expr], delta_col: i64, delta_row: i64) -> Vec<Expr> {
    items.iter().map(|e| shift(e, delta_col, delta_row)).collect()
}

fn b(expr: Expr) -> Box<Expr> {
    Box::new(expr)
}

fn ref_error() -> Expr {
    Expr::Literal(CellValue::Error(ErrorKind::Ref))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parser::parse_formula;
    use crate::formula::printer::print;

    #[test]
    fn relative_ref_shifts() {
        let expr = parse_formula("A1").unwrap();
        let shifted = shift(&expr, 1, 2);
        assert_eq!(print(&shifted), "B3");
    }

    #[test]
    fn absolute_axis_is_preserved() {
        let expr = parse_formula("$A$1").unwrap();
        let shifted = shift(&expr, 5, 5);
        assert_eq!(print(&shifted), "$A$1");
    }

    #[test]
    fn mixed_anchor_shifts_only_relative_axis() {
        let expr = parse_formula("$A1").unwrap();
        let shifted = shift(&expr, 3, 3);
        assert_eq!(print(&shifted), "$A4");
    }

    #[test]
    fn out_of_range_shift_becomes_ref_error() {
        let expr = parse_formula("A1").unwrap();
        let shifted = shift(&expr, -1, 0);
        assert_eq!(shifted, Expr::Literal(CellValue::Error(ErrorKind::Ref)));
    }

    #[test]
    fn range_shift_moves_both_corners() {
        let expr = parse_formula("A1:B2").unwrap();
        let shifted = shift(&expr, 1, 1);
        assert_eq!(print(&shifted), "B2:C3");
    }

    #[test]
    fn qualified_ref_preserves_sheet() {
        let expr = parse_formula("Sheet1!A1").unwrap();
        let shifted = shift(&expr, 1, 0);
        assert_eq!(print(&shifted), "Sheet1!B1");
    }

    #[test]
    fn shift_descends_into_function_args() {
        let expr = parse_formula("SUM(A1:A10)").unwrap();
        let shifted = shift(&expr, 0, 1);
        assert_eq!(print(&shifted), "SUM(A2:A11)");
    }
}
