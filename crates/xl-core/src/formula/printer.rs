//! Canonical formula printer: `parse . print . parse == parse`, with
//! minimal parenthesization derived from operator precedence.

use crate::cell::CellValue;

use super::ast::Expr;

/// Render `expr` back to formula text, without a leading `=`.
pub fn print(expr: &Expr) -> String {
    print_prec(expr, 0)
}

/// `min_prec` is the precedence tier the parent requires of this
/// sub-expression; parens are emitted only when the child's own tier is
/// lower (looser-binding) than what the parent needs.
fn print_prec(expr: &Expr, min_prec: u8) -> String {
    let (text, prec) = render(expr);
    if prec < min_prec {
        format!("({text})")
    } else {
        text
    }
}

/// Returns the rendered text and this node's precedence tier (higher
/// binds tighter), mirroring the parser's ladder: comparison(0) <
/// additive(1) < multiplicative(2) < power(3) < unary(4) < primary(5).
fn render(expr: &Expr) -> (String, u8) {
    match expr {
        Expr::Literal(v) => (print_literal(v), 5),
        Expr::Ref(aref) => (aref.print_a1(), 5),
        Expr::QualifiedRef(sheet, aref) => (format!("{}!{}", quote_sheet(sheet), aref.print_a1()), 5),
        Expr::RangeRef(range) => (range.print_a1(), 5),
        Expr::QualifiedRangeRef(sheet, range) => {
            (format!("{}!{}", quote_sheet(sheet), range.print_a1()), 5)
        }

        Expr::Neg(inner) => (format!("-{}", print_prec(inner, 4)), 4),

        Expr::Add(a, b) => (format!("{}+{}", print_prec(a, 1), print_prec(b, 2)), 1),
        Expr::Sub(a, b) => (format!("{}-{}", print_prec(a, 1), print_prec(b, 2)), 1),
        Expr::Mul(a, b) => (format!("{}*{}", print_prec(a, 2), print_prec(b, 3)), 2),
        Expr::Div(a, b) => (format!("{}/{}", print_prec(a, 2), print_prec(b, 3)), 2),
        // Right-associative: the right operand may be at the same tier
        // without parens, the left operand may not.
        Expr::Pow(a, b) => (format!("{}^{}", print_prec(a, 4), print_prec(b, 3)), 3),

        Expr::Eq(a, b) => (format!("{}={}", print_prec(a, 0), print_prec(b, 1)), 0),
        Expr::Neq(a, b) => (format!("{}<>{}", print_prec(a, 0), print_prec(b, 1)), 0),
        Expr::Lt(a, b) => (format!("{}<{}", print_prec(a, 0), print_prec(b, 1)), 0),
        Expr::Le(a, b) => (format!("{}<={}", print_prec(a, 0), print_prec(b, 1)), 0),
        Expr::Gt(a, b) => (format!("{}>{}", print_prec(a, 0), print_prec(b, 1)), 0),
        Expr::Ge(a, b) => (format!("{}>={}", print_prec(a, 0), print_prec(b, 1)), 0),

        Expr::And(items) => (format!("AND({})", print_args(items)), 5),
        Expr::Or(items) => (format!("OR({})", print_args(items)), 5),
        Expr::Not(inner) => (format!("NOT({})", print(inner)), 5),
        Expr::List(items) => (print_args(items), 5),

        Expr::Concatenate(items) => (join_with(items, "&"), 1),
        Expr::Left(a, b) => (format!("LEFT({}{})", print(a), opt_arg(b)), 5),
        Expr::Right(a, b) => (format!("RIGHT({}{})", print(a), opt_arg(b)), 5),
        Expr::Mid(a, b, c) => (format!("MID({},{},{})", print(a), print(b), print(c)), 5),
        Expr::Len(a) => (format!("LEN({})", print(a)), 5),
        Expr::Upper(a) => (format!("UPPER({})", print(a)), 5),
        Expr::Lower(a) => (format!("LOWER({})", print(a)), 5),

        Expr::If(c, t, f) => (format!("IF({},{},{})", print(c), print(t), print(f)), 5),

        Expr::Sum(inner) => (format!("SUM({})", print(inner)), 5),
        Expr::Count(inner) => (format!("COUNT({})", print(inner)), 5),
        Expr::Average(inner) => (format!("AVERAGE({})", print(inner)), 5),
        Expr::Min(inner) => (format!("MIN({})", print(inner)), 5),
        Expr::Max(inner) => (format!("MAX({})", print(inner)), 5),
        Expr::CountA(inner) => (format!("COUNTA({})", print(inner)), 5),

        Expr::Today => ("TODAY()".to_string(), 5),
        Expr::Now => ("NOW()".to_string(), 5),
        Expr::Date(y, m, d) => (format!("DATE({},{},{})", print(y), print(m), print(d)), 5),
        Expr::Year(a) => (format!("YEAR({})", print(a)), 5),
        Expr::Month(a) => (format!("MONTH({})", print(a)), 5),
        Expr::Day(a) => (format!("DAY({})", print(a)), 5),

        Expr::Call(name, args) => (format!("{name}({})", print_args(args)), 5),
    }
}

fn opt_arg(arg: &Option<Box<Expr>>) -> String {
    match arg {
        Some(a) => format!(",{}", print(a)),
        None => String::new(),
    }
}

fn print_args(items: &[Expr]) -> String {
    items.iter().map(print).collect::<Vec<_>>().join(",")
}

fn join_with(items: &[Expr], sep: &str) -> String {
    items
        .iter()
        .map(|e| print_prec(e, 2))
        .collect::<Vec<_>>()
        .join(sep)
}

fn quote_sheet(sheet: &str) -> String {
    let needs_quotes = sheet.chars().any(|c| !c.is_ascii_alphanumeric() && c != '_');
    if needs_quotes {
        format!("'{}'", sheet.replace('\'', "''"))
    } else {
        sheet.to_string()
    }
}

fn print_literal(value: &CellValue) -> String {
    match value {
        CellValue::Number(n) => n.to_string(),
        CellValue::Text(s) => format!("\"{}\"", s.replace('"', "\"\"")),
        CellValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        CellValue::Error(e) => e.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse_formula;
    use super::*;

    fn roundtrip(src: &str) -> String {
        print(&parse_formula(src).unwrap())
    }

    #[test]
    fn printer_is_idempotent_under_reparse() {
        for src in [
            "1+2*3",
            "(1+2)*3",
            "2^3^2",
            "A1+B1",
            "SUM(A1:A10)+AVERAGE(B1:B10)",
            "IF(A1>0,\"pos\",\"non-pos\")",
        ] {
            let printed_once = roundtrip(src);
            let reparsed = parse_formula(&printed_once).unwrap();
            let printed_twice = print(&reparsed);
            assert_eq!(printed_once, printed_twice, "not idempotent for {src}");
        }
    }

    #[test]
    fn minimal_parens_for_left_associative_power() {
        // a^(b^c) requires no parens on the right, but (a^b)^c does on the left.
        let expr = parse_formula("(2^3)^2").unwrap();
        assert_eq!(print(&expr), "(2^3)^2");
        let expr = parse_formula("2^(3^2)").unwrap();
        assert_eq!(print(&expr), "2^3^2");
    }

    #[test]
    fn string_literal_escapes_quotes() {
        let expr = parse_formula("\"a\"\"b\"").unwrap();
        assert_eq!(print(&expr), "\"a\"\"b\"");
    }
}
