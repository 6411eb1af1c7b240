//! The high-level sheet evaluator: ad-hoc expressions, single formula
//! cells, whole-workbook dependency-ordered evaluation, range-scoped
//! evaluation, and array-formula spill. Built on top of
//! [`crate::formula::eval::Evaluator`] (single-expression evaluation
//! against a [`CellProvider`]) and [`crate::depgraph::DependencyGraph`]
//! (cycle detection and topological ordering).

use std::collections::BTreeMap;

use crate::address::{ARef, CellRange, Column, Row};
use crate::cell::{CellValue, ErrorKind};
use crate::depgraph::{DependencyGraph, Loc};
use crate::error::{EvalError, ParseError};
use crate::formula::ast::Expr;
use crate::formula::eval::{CellProvider, Clock, Evaluator, SystemClock};
use crate::formula::parser::{parse_formula, Parser};
use crate::sheet::Sheet;
use crate::workbook::Workbook;

/// Ad-hoc cell value overrides layered over a workbook during evaluation:
/// `evaluate_formula`'s inputs win over whatever the workbook actually
/// stores, without needing a mutated copy of the workbook.
#[derive(Debug, Clone, Default)]
pub struct Overrides(BTreeMap<(String, ARef), CellValue>);

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sheet: impl Into<String>, aref: ARef, value: CellValue) -> Self {
        self.0.insert((sheet.into(), aref), value);
        self
    }

    fn get(&self, sheet: &str, aref: ARef) -> Option<&CellValue> {
        self.0.get(&(sheet.to_string(), aref))
    }
}

struct WorkbookProvider<'a> {
    workbook: &'a Workbook,
    current_sheet: &'a str,
    overrides: &'a Overrides,
}

impl CellProvider for WorkbookProvider<'_> {
    fn cell_value(&self, sheet: &str, aref: ARef) -> CellValue {
        if let Some(v) = self.overrides.get(sheet, aref) {
            return v.clone();
        }
        self.workbook
            .sheet(sheet)
            .map(|s| s.cell_value(aref))
            .unwrap_or(CellValue::Empty)
    }

    fn current_sheet(&self) -> &str {
        self.current_sheet
    }
}

/// A provider that prefers already-computed values (for formula cells
/// visited earlier in topological order) and falls back to the workbook's
/// stored literal for everything else.
struct ComputedProvider<'a> {
    workbook: &'a Workbook,
    computed: &'a BTreeMap<Loc, CellValue>,
    current_sheet: &'a str,
}

impl CellProvider for ComputedProvider<'_> {
    fn cell_value(&self, sheet: &str, aref: ARef) -> CellValue {
        if let Some(v) = self.computed.get(&Loc::new(sheet, aref)) {
            return v.clone();
        }
        self.workbook
            .sheet(sheet)
            .map(|s| s.cell_value(aref))
            .unwrap_or(CellValue::Empty)
    }

    fn current_sheet(&self) -> &str {
        self.current_sheet
    }
}

/// Maps an evaluation failure to the `CellValue::Error` Excel would show,
/// the same way a propagated error collapses to its `ErrorKind` at top
/// level (spec: any `CellValue::Error` short-circuits with `Propagated`,
/// mapped back at the top). Parse-time and name failures become `#NAME?`;
/// spill conflicts and circular references don't have a dedicated
/// `ErrorKind` slot, so they land on the closest existing code.
pub fn error_kind_for(err: &EvalError) -> ErrorKind {
    match err {
        EvalError::DivByZero { .. } => ErrorKind::Div0,
        EvalError::RefError { .. } => ErrorKind::Ref,
        EvalError::TypeMismatch { .. } => ErrorKind::Value,
        EvalError::InvalidArgCount { .. } => ErrorKind::Value,
        EvalError::CycleDetected { .. } => ErrorKind::Ref,
        EvalError::Parse(ParseError::UnknownFunction { .. }) => ErrorKind::Name,
        EvalError::Parse(_) => ErrorKind::Value,
        EvalError::NameNotFound(_) => ErrorKind::Name,
        EvalError::NotImplemented(_) => ErrorKind::Name,
        EvalError::Propagated(kind) => *kind,
        EvalError::SpillOverlap => ErrorKind::Ref,
    }
}

/// Parse and evaluate an ad-hoc formula string. Without a `workbook`, only
/// overrides and literals are visible (every reference resolves empty).
pub fn evaluate_formula(
    text: &str,
    workbook: Option<&Workbook>,
    sheet: &str,
    overrides: &Overrides,
    clock: Option<&dyn Clock>,
) -> Result<CellValue, EvalError> {
    let expr = parse_formula(text)?;
    let empty = Workbook::new();
    let wb = workbook.unwrap_or(&empty);
    let provider = WorkbookProvider {
        workbook: wb,
        current_sheet: sheet,
        overrides,
    };
    let system = SystemClock;
    let clock = clock.unwrap_or(&system);
    Evaluator::new(&provider, clock).eval(&expr)
}

/// Evaluate the formula stored at `aref`. Non-formula cells evaluate to
/// their own literal value.
pub fn evaluate_cell(
    workbook: &Workbook,
    sheet: &str,
    aref: ARef,
    overrides: &Overrides,
    clock: Option<&dyn Clock>,
) -> Result<CellValue, EvalError> {
    let value = workbook
        .sheet(sheet)
        .map_err(|e| EvalError::RefError {
            loc: sheet.to_string(),
            reason: e.to_string(),
        })?
        .cell_value(aref);
    match value {
        CellValue::Formula { expr, .. } => {
            let parsed = parse_formula(&expr)?;
            let provider = WorkbookProvider {
                workbook,
                current_sheet: sheet,
                overrides,
            };
            let system = SystemClock;
            let clock = clock.unwrap_or(&system);
            Evaluator::new(&provider, clock).eval(&parsed)
        }
        other => Ok(other),
    }
}

/// Evaluate every formula cell in `order`, in that order, against a
/// provider that sees earlier results in the same pass. Per-cell
/// evaluation failures become `CellValue::Error` rather than aborting the
/// whole pass.
fn evaluate_locs_in_order(
    workbook: &Workbook,
    order: impl IntoIterator<Item = Loc>,
    clock: &dyn Clock,
) -> Result<BTreeMap<Loc, CellValue>, EvalError> {
    let mut computed = BTreeMap::new();
    for loc in order {
        let Ok(sheet) = workbook.sheet(&loc.sheet) else {
            continue;
        };
        let Some(cell) = sheet.get(loc.aref) else {
            continue;
        };
        let CellValue::Formula { expr, .. } = &cell.value else {
            continue;
        };
        let value = parse_formula(expr)
            .map_err(EvalError::from)
            .and_then(|parsed| {
                let provider = ComputedProvider {
                    workbook,
                    computed: &computed,
                    current_sheet: &loc.sheet,
                };
                Evaluator::new(&provider, clock).eval(&parsed)
            })
            .unwrap_or_else(|e| CellValue::Error(error_kind_for(&e)));
        computed.insert(loc, value);
    }
    Ok(computed)
}

/// Build the dependency graph for the whole workbook, detect cycles, and
/// evaluate every formula cell in topological order. A cycle anywhere
/// fails the whole call; any other per-cell failure surfaces as
/// `CellValue::Error` in the returned map.
pub fn evaluate_with_dependency_check(
    workbook: &Workbook,
    clock: Option<&dyn Clock>,
) -> Result<BTreeMap<Loc, CellValue>, EvalError> {
    let parser = Parser;
    let graph = DependencyGraph::from_workbook(workbook, &parser);
    let order = graph.topological_sort()?;
    let system = SystemClock;
    let clock = clock.unwrap_or(&system);
    evaluate_locs_in_order(workbook, order, clock)
}

/// Optimization over [`evaluate_with_dependency_check`]: restrict
/// evaluation to the formulas inside `range` plus their transitive
/// precedents, instead of the whole workbook.
pub fn evaluate_for_range(
    workbook: &Workbook,
    sheet: &str,
    range: CellRange,
    clock: Option<&dyn Clock>,
) -> Result<BTreeMap<Loc, CellValue>, EvalError> {
    let parser = Parser;
    let graph = DependencyGraph::from_workbook(workbook, &parser);
    let order = graph.topological_sort()?;
    let seeds: Vec<Loc> = range.iter_row_major().map(|aref| Loc::new(sheet, aref)).collect();
    let mut scope = graph.transitive_dependencies(&seeds);
    scope.extend(seeds);
    let system = SystemClock;
    let clock = clock.unwrap_or(&system);
    evaluate_locs_in_order(workbook, order.into_iter().filter(|l| scope.contains(l)), clock)
}

/// Evaluate a spilling array formula (currently just `TRANSPOSE(range)`)
/// anchored at `origin`. Returns the spill range and a copy of the sheet
/// with the spilled values materialized. Fails with
/// [`EvalError::SpillOverlap`] if any target cell other than `origin`
/// already holds a value.
pub fn evaluate_array_formula(
    text: &str,
    origin: ARef,
    workbook: &Workbook,
    sheet_name: &str,
    clock: Option<&dyn Clock>,
) -> Result<(CellRange, Sheet), EvalError> {
    let expr = parse_formula(text)?;
    let Expr::Call(name, args) = &expr else {
        return Err(EvalError::NotImplemented(
            "only function-call formulas can spill".to_string(),
        ));
    };
    if name != "TRANSPOSE" {
        return Err(EvalError::NotImplemented(format!("{name} does not spill")));
    }
    let [arg] = args.as_slice() else {
        return Err(EvalError::InvalidArgCount {
            func: "TRANSPOSE".to_string(),
            expected: "1".to_string(),
            actual: args.len(),
        });
    };
    let source_range = match arg {
        Expr::RangeRef(r) => *r,
        Expr::QualifiedRangeRef(_, r) => *r,
        Expr::Ref(a) => CellRange::single(*a),
        Expr::QualifiedRef(_, a) => CellRange::single(*a),
        _ => {
            return Err(EvalError::TypeMismatch {
                op: "TRANSPOSE".to_string(),
                kind: "expected a cell or range reference".to_string(),
            })
        }
    };

    let sheet = workbook.sheet(sheet_name).map_err(|e| EvalError::RefError {
        loc: sheet_name.to_string(),
        reason: e.to_string(),
    })?;

    let width = source_range.width();
    let height = source_range.height();
    let spill_end = shifted(origin, width.saturating_sub(1), height.saturating_sub(1))?;
    let spill_range = CellRange::new(origin, spill_end);

    for target in spill_range.iter_row_major() {
        if target != origin && sheet.get(target).is_some_and(|c| !c.value.is_empty()) {
            return Err(EvalError::SpillOverlap);
        }
    }

    let overrides = Overrides::new();
    let provider = WorkbookProvider {
        workbook,
        current_sheet: sheet_name,
        overrides: &overrides,
    };
    let system = SystemClock;
    let clock = clock.unwrap_or(&system);
    let mut evaluator = Evaluator::new(&provider, clock);

    let mut values = Vec::with_capacity((width * height) as usize);
    for src in source_range.iter_row_major() {
        values.push(evaluator.eval(&Expr::QualifiedRef(sheet_name.to_string(), src))?);
    }

    let mut updated = sheet.clone();
    for (i, src) in source_range.iter_row_major().enumerate() {
        let row_offset = src.row.index() - source_range.start.row.index();
        let col_offset = src.col.index() - source_range.start.col.index();
        // transpose: a source (row_offset, col_offset) lands at target
        // (col_offset, row_offset) relative to the spill origin.
        let target = shifted(origin, col_offset, row_offset)?;
        updated = updated.put_value(target, values[i].clone());
    }

    Ok((spill_range, updated))
}

fn shifted(origin: ARef, rows: u32, cols: u32) -> Result<ARef, EvalError> {
    let col = Column::new(origin.col.index() + cols).map_err(|e| EvalError::RefError {
        loc: origin.print_a1(),
        reason: e.to_string(),
    })?;
    let row = Row::new(origin.row.index() + rows).map_err(|e| EvalError::RefError {
        loc: origin.print_a1(),
        reason: e.to_string(),
    })?;
    Ok(ARef::new(col, row, origin.anchor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a1(s: &str) -> ARef {
        ARef::parse_a1(s).unwrap()
    }

    #[test]
    fn evaluate_formula_without_workbook_uses_literals_only() {
        let result = evaluate_formula("=1+2*3", None, "Sheet1", &Overrides::new(), None).unwrap();
        assert_eq!(result, CellValue::Number(7.into()));
    }

    #[test]
    fn evaluate_formula_honors_overrides() {
        let overrides = Overrides::new().with("Sheet1", a1("A1"), CellValue::Number(10.into()));
        let result = evaluate_formula("=A1*2", None, "Sheet1", &overrides, None).unwrap();
        assert_eq!(result, CellValue::Number(20.into()));
    }

    #[test]
    fn evaluate_cell_reads_stored_formula() {
        let wb = Workbook::new()
            .append_sheet(
                Sheet::new("Sheet1")
                    .put_value(a1("A1"), CellValue::Number(5.into()))
                    .put_value(a1("B1"), CellValue::formula("=A1+1", None)),
            )
            .unwrap();
        let result = evaluate_cell(&wb, "Sheet1", a1("B1"), &Overrides::new(), None).unwrap();
        assert_eq!(result, CellValue::Number(6.into()));
    }

    #[test]
    fn dependency_check_evaluates_chained_formulas_in_order() {
        let wb = Workbook::new()
            .append_sheet(
                Sheet::new("Sheet1")
                    .put_value(a1("A1"), CellValue::Number(2.into()))
                    .put_value(a1("A2"), CellValue::formula("=A1*2", None))
                    .put_value(a1("A3"), CellValue::formula("=A2+1", None)),
            )
            .unwrap();
        let computed = evaluate_with_dependency_check(&wb, None).unwrap();
        assert_eq!(computed.get(&Loc::new("Sheet1", a1("A2"))), Some(&CellValue::Number(4.into())));
        assert_eq!(computed.get(&Loc::new("Sheet1", a1("A3"))), Some(&CellValue::Number(5.into())));
    }

    #[test]
    fn dependency_check_fails_fast_on_a_cycle() {
        let wb = Workbook::new()
            .append_sheet(
                Sheet::new("Sheet1")
                    .put_value(a1("A1"), CellValue::formula("=A2", None))
                    .put_value(a1("A2"), CellValue::formula("=A1", None)),
            )
            .unwrap();
        let err = evaluate_with_dependency_check(&wb, None).unwrap_err();
        assert!(matches!(err, EvalError::CycleDetected { .. }));
    }

    #[test]
    fn transpose_spills_a_range_into_a_new_sheet() {
        let wb = Workbook::new()
            .append_sheet(
                Sheet::new("Sheet1")
                    .put_value(a1("A1"), CellValue::Number(1.into()))
                    .put_value(a1("B1"), CellValue::Number(2.into())),
            )
            .unwrap();
        let (spill, updated) = evaluate_array_formula(
            "=TRANSPOSE(A1:B1)",
            a1("A3"),
            &wb,
            "Sheet1",
            None,
        )
        .unwrap();
        assert_eq!(spill, CellRange::new(a1("A3"), a1("A4")));
        assert_eq!(updated.cell_value(a1("A3")), CellValue::Number(1.into()));
        assert_eq!(updated.cell_value(a1("A4")), CellValue::Number(2.into()));
    }

    #[test]
    fn transpose_rejects_spill_into_an_occupied_cell() {
        let wb = Workbook::new()
            .append_sheet(
                Sheet::new("Sheet1")
                    .put_value(a1("A1"), CellValue::Number(1.into()))
                    .put_value(a1("B1"), CellValue::Number(2.into()))
                    .put_value(a1("A4"), CellValue::Text("occupied".to_string())),
            )
            .unwrap();
        let err = evaluate_array_formula("=TRANSPOSE(A1:B1)", a1("A3"), &wb, "Sheet1", None).unwrap_err();
        assert!(matches!(err, EvalError::SpillOverlap));
    }
}
