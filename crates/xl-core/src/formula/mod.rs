//! Formula parser, canonical printer, AST shifting, and evaluation engine.
//!
//! Parses formula strings into an [`ast::Expr`] tree, prints that tree back
//! to canonical formula text, shifts it for row/column insertion and
//! copy-paste, and evaluates it against cell data supplied by a
//! [`eval::CellProvider`].

pub mod ast;
pub mod eval;
pub mod functions;
pub mod parser;
pub mod printer;
pub mod shift;

pub use ast::Expr;
pub use eval::{CellProvider, Clock, Evaluator, SystemClock};
pub use parser::{parse_formula, Parser};
pub use printer::print;
pub use shift::shift;
