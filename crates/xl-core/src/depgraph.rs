//! Cell dependency graph: precedent/dependent indices, Tarjan cycle
//! detection, and Kahn topological sort.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::address::{ARef, CellRange, SheetName};
use crate::error::EvalError;
use crate::formula::ast::Expr;
use crate::sheet::Sheet;

/// A cell location, qualified by sheet so cross-sheet edges are unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Loc {
    pub sheet: String,
    pub aref: ARef,
}

impl Loc {
    pub fn new(sheet: impl Into<String>, aref: ARef) -> Self {
        Self {
            sheet: sheet.into(),
            aref,
        }
    }

    pub fn display(&self) -> String {
        format!("{}!{}", self.sheet, self.aref.print_a1())
    }
}

/// Extract every single-cell and range reference inside `expr`, expanding
/// ranges into individual locations. `bound` clips range references (e.g.
/// full-column `A:A`) to the sheet's used range so extraction stays
/// bounded; when a range falls entirely outside `bound`, it contributes no
/// locations.
pub fn extract_refs(expr: &Expr, default_sheet: &str, bound: Option<&CellRange>) -> Vec<Loc> {
    let mut out = Vec::new();
    collect_refs(expr, default_sheet, bound, &mut out);
    out
}

fn collect_refs(expr: &Expr, default_sheet: &str, bound: Option<&CellRange>, out: &mut Vec<Loc>) {
    match expr {
        Expr::Ref(aref) => out.push(Loc::new(default_sheet, *aref)),
        Expr::QualifiedRef(sheet, aref) => out.push(Loc::new(sheet.as_str(), *aref)),
        Expr::RangeRef(range) => push_range(range, default_sheet, bound, out),
        Expr::QualifiedRangeRef(sheet, range) => push_range(range, sheet.as_str(), bound, out),
        Expr::Literal(_) => {}
        Expr::Neg(a) | Expr::Not(a) => collect_refs(a, default_sheet, bound, out),
        Expr::Add(a, b)
        | Expr::Sub(a, b)
        | Expr::Mul(a, b)
        | Expr::Div(a, b)
        | Expr::Pow(a, b)
        | Expr::Eq(a, b)
        | Expr::Neq(a, b)
        | Expr::Lt(a, b)
        | Expr::Le(a, b)
        | Expr::Gt(a, b)
        | Expr::Ge(a, b) => {
            collect_refs(a, default_sheet, bound, out);
            collect_refs(b, default_sheet, bound, out);
        }
        Expr::And(items) | Expr::Or(items) | Expr::Concatenate(items) | Expr::List(items) => {
            for item in items {
                collect_refs(item, default_sheet, bound, out);
            }
        }
        Expr::If(c, t, f) => {
            collect_refs(c, default_sheet, bound, out);
            collect_refs(t, default_sheet, bound, out);
            collect_refs(f, default_sheet, bound, out);
        }
        Expr::Left(a, b) | Expr::Right(a, b) => {
            collect_refs(a, default_sheet, bound, out);
            if let Some(b) = b {
                collect_refs(b, default_sheet, bound, out);
            }
        }
        Expr::Mid(a, b, c) => {
            collect_refs(a, default_sheet, bound, out);
            collect_refs(b, default_sheet, bound, out);
            collect_refs(c, default_sheet, bound, out);
        }
        Expr::Len(a) | Expr::Upper(a) | Expr::Year(a) | Expr::Month(a) | Expr::Day(a) => {
            collect_refs(a, default_sheet, bound, out)
        }
        Expr::Lower(a) => collect_refs(a, default_sheet, bound, out),
        Expr::Sum(r) | Expr::Count(r) | Expr::Average(r) | Expr::Min(r) | Expr::Max(r) | Expr::CountA(r) => {
            collect_refs(r, default_sheet, bound, out)
        }
        Expr::Today | Expr::Now => {}
        Expr::Date(y, m, d) => {
            collect_refs(y, default_sheet, bound, out);
            collect_refs(m, default_sheet, bound, out);
            collect_refs(d, default_sheet, bound, out);
        }
        Expr::Call(_, args) => {
            for a in args {
                collect_refs(a, default_sheet, bound, out);
            }
        }
    }
}

fn push_range(range: &CellRange, sheet: &str, bound: Option<&CellRange>, out: &mut Vec<Loc>) {
    let clipped = match bound {
        Some(b) if range.intersects(b) => CellRange::new(
            ARef::new(
                range.start.col.max(b.start.col),
                range.start.row.max(b.start.row),
                crate::address::AnchorMode::Relative,
            ),
            ARef::new(
                range.end.col.min(b.end.col),
                range.end.row.min(b.end.row),
                crate::address::AnchorMode::Relative,
            ),
        ),
        Some(_) => return,
        None => *range,
    };
    out.extend(clipped.iter_row_major().map(|aref| Loc::new(sheet, aref)));
}

/// Forward (precedent) and reverse (dependent) edge maps for a sheet or
/// workbook's formula cells.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    forward: HashMap<Loc, Vec<Loc>>,
    reverse: Option<HashMap<Loc, Vec<Loc>>>,
    /// Insertion order of nodes, used as the deterministic topo-sort
    /// tiebreak.
    order: Vec<Loc>,
}

impl DependencyGraph {
    pub fn from_sheet(sheet: &Sheet, sheet_name: &str, parser: &crate::formula::parser::Parser) -> Self {
        let mut graph = Self::default();
        let bound = sheet.used_range();
        for (aref, cell) in sheet.iter_cells() {
            if let crate::cell::CellValue::Formula { expr, .. } = &cell.value {
                if let Ok(ast) = parser.parse(expr) {
                    let loc = Loc::new(sheet_name, aref);
                    let refs = extract_refs(&ast, sheet_name, bound.as_ref());
                    graph.insert_node(loc, refs);
                }
            }
        }
        graph
    }

    pub fn from_workbook(
        workbook: &crate::workbook::Workbook,
        parser: &crate::formula::parser::Parser,
    ) -> Self {
        let mut graph = Self::default();
        for sheet in workbook.sheets() {
            let bound = sheet.used_range();
            for (aref, cell) in sheet.iter_cells() {
                if let crate::cell::CellValue::Formula { expr, .. } = &cell.value {
                    if let Ok(ast) = parser.parse(expr) {
                        let loc = Loc::new(sheet.name(), aref);
                        let refs = extract_refs(&ast, sheet.name(), bound.as_ref());
                        graph.insert_node(loc, refs);
                    }
                }
            }
        }
        graph
    }

    fn insert_node(&mut self, loc: Loc, precedents: Vec<Loc>) {
        if !self.forward.contains_key(&loc) {
            self.order.push(loc.clone());
        }
        self.forward.entry(loc).or_default().extend(precedents);
        self.reverse = None;
    }

    /// Direct references of `loc`.
    pub fn precedents(&self, loc: &Loc) -> &[Loc] {
        self.forward.get(loc).map(Vec::as_slice).unwrap_or(&[])
    }

    fn reverse_index(&mut self) -> &HashMap<Loc, Vec<Loc>> {
        if self.reverse.is_none() {
            let mut rev: HashMap<Loc, Vec<Loc>> = HashMap::new();
            for (loc, precedents) in &self.forward {
                for p in precedents {
                    rev.entry(p.clone()).or_default().push(loc.clone());
                }
            }
            self.reverse = Some(rev);
        }
        self.reverse.as_ref().unwrap()
    }

    /// Locations with an edge to `loc`. The reverse index is materialized
    /// once and cached.
    pub fn dependents(&mut self, loc: &Loc) -> Vec<Loc> {
        self.reverse_index().get(loc).cloned().unwrap_or_default()
    }

    /// BFS over the forward index from every location in `locs`, with
    /// memoized visitation.
    pub fn transitive_dependencies(&self, locs: &[Loc]) -> BTreeSet<Loc> {
        let mut visited: HashSet<Loc> = HashSet::new();
        let mut queue: VecDeque<Loc> = locs.iter().cloned().collect();
        while let Some(loc) = queue.pop_front() {
            if !visited.insert(loc.clone()) {
                continue;
            }
            for p in self.precedents(&loc) {
                if !visited.contains(p) {
                    queue.push_back(p.clone());
                }
            }
        }
        visited.into_iter().collect()
    }

    /// Tarjan's strongly-connected-components algorithm, implemented with
    /// explicit iteration (no recursion) to avoid stack overflow on deep
    /// graphs. Returns the first cycle found, as a node path ending back at
    /// its start, in deterministic node-ordering.
    pub fn detect_cycles(&self) -> Option<Vec<Loc>> {
        let mut index_of: HashMap<Loc, usize> = HashMap::new();
        let mut lowlink: HashMap<Loc, usize> = HashMap::new();
        let mut on_stack: HashSet<Loc> = HashSet::new();
        let mut stack: Vec<Loc> = Vec::new();
        let mut next_index = 0usize;

        // Work list for the iterative DFS: (node, next precedent index to visit).
        for start in &self.order {
            if index_of.contains_key(start) {
                continue;
            }
            let mut work: Vec<(Loc, usize)> = vec![(start.clone(), 0)];
            index_of.insert(start.clone(), next_index);
            lowlink.insert(start.clone(), next_index);
            next_index += 1;
            stack.push(start.clone());
            on_stack.insert(start.clone());

            while let Some((node, mut i)) = work.pop() {
                let precedents = self.precedents(&node).to_vec();
                let mut recursed = false;
                while i < precedents.len() {
                    let next = &precedents[i];
                    i += 1;
                    if !index_of.contains_key(next) {
                        index_of.insert(next.clone(), next_index);
                        lowlink.insert(next.clone(), next_index);
                        next_index += 1;
                        stack.push(next.clone());
                        on_stack.insert(next.clone());
                        work.push((node.clone(), i));
                        work.push((next.clone(), 0));
                        recursed = true;
                        break;
                    } else if on_stack.contains(next) {
                        let nl = lowlink[next];
                        let cur = lowlink[&node];
                        lowlink.insert(node.clone(), cur.min(nl));
                    }
                }
                if recursed {
                    continue;
                }

                if let Some(&(ref parent, _)) = work.last() {
                    let child_low = lowlink[&node];
                    let parent_low = lowlink[parent];
                    lowlink.insert(parent.clone(), parent_low.min(child_low));
                }

                if lowlink[&node] == index_of[&node] {
                    let mut component = Vec::new();
                    loop {
                        let member = stack.pop().expect("component member on stack");
                        on_stack.remove(&member);
                        let is_root = member == node;
                        component.push(member);
                        if is_root {
                            break;
                        }
                    }
                    if component.len() > 1 || self.precedents(&component[0]).contains(&component[0]) {
                        let mut cycle = component;
                        cycle.sort();
                        let start_node = cycle[0].clone();
                        let mut path = vec![start_node.clone()];
                        let mut current = start_node.clone();
                        let remaining: HashSet<Loc> = cycle.into_iter().collect();
                        loop {
                            let next = self
                                .precedents(&current)
                                .iter()
                                .find(|p| remaining.contains(p))
                                .cloned();
                            match next {
                                Some(n) if n == start_node => {
                                    path.push(n);
                                    break;
                                }
                                Some(n) => {
                                    path.push(n.clone());
                                    current = n;
                                }
                                None => break,
                            }
                        }
                        return Some(path);
                    }
                }
            }
        }
        None
    }

    /// Kahn's algorithm. Ties among ready nodes are broken by insertion
    /// order. Fails with the path of a cycle if the graph isn't a DAG.
    pub fn topological_sort(&self) -> Result<Vec<Loc>, EvalError> {
        let mut in_degree: HashMap<Loc, usize> = HashMap::new();
        for node in &self.order {
            in_degree.entry(node.clone()).or_insert(0);
        }
        for precedents in self.forward.values() {
            for p in precedents {
                // edge precedent -> dependent: the dependent cannot be
                // resolved before its precedent is.
                in_degree.entry(p.clone()).or_insert(0);
            }
        }
        // Build dependent edges: node depends on its precedents, so the
        // edge for topological purposes runs precedent -> node.
        let mut dependents_of: HashMap<Loc, Vec<Loc>> = HashMap::new();
        let mut indegree_of_node: HashMap<Loc, usize> = HashMap::new();
        for node in in_degree.keys() {
            indegree_of_node.insert(node.clone(), 0);
        }
        for (node, precedents) in &self.forward {
            indegree_of_node.insert(node.clone(), precedents.len());
            for p in precedents {
                dependents_of.entry(p.clone()).or_default().push(node.clone());
            }
        }

        let order_rank: HashMap<&Loc, usize> =
            self.order.iter().enumerate().map(|(i, l)| (l, i)).collect();

        let mut ready: Vec<Loc> = indegree_of_node
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(loc, _)| loc.clone())
            .collect();
        ready.sort_by_key(|l| order_rank.get(l).copied().unwrap_or(usize::MAX));

        let mut result = Vec::with_capacity(indegree_of_node.len());
        let mut queue: VecDeque<Loc> = ready.into();

        while let Some(node) = queue.pop_front() {
            result.push(node.clone());
            let mut newly_ready = Vec::new();
            if let Some(deps) = dependents_of.get(&node) {
                for dep in deps {
                    if let Some(deg) = indegree_of_node.get_mut(dep) {
                        *deg -= 1;
                        if *deg == 0 {
                            newly_ready.push(dep.clone());
                        }
                    }
                }
            }
            newly_ready.sort_by_key(|l| order_rank.get(l).copied().unwrap_or(usize::MAX));
            let mut merged: Vec<Loc> = queue.iter().cloned().collect();
            merged.extend(newly_ready);
            merged.sort_by_key(|l| order_rank.get(l).copied().unwrap_or(usize::MAX));
            queue = merged.into();
        }

        if result.len() != indegree_of_node.len() {
            let cycle = self.detect_cycles().unwrap_or_default();
            return Err(EvalError::CycleDetected {
                path: cycle.iter().map(Loc::display).collect(),
            });
        }

        Ok(result)
    }
}
