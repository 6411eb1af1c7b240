use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;

use clap::{Parser as ClapParser, Subcommand, ValueEnum};
use rust_decimal::Decimal;

use xl::{
    apply_patches_to_buffer, evaluator, open_sheet_stream_by_index, open_sheet_stream_by_name,
    read_from_path, write_to_path, ARef, CellPatch, CellRange, CellValue, RangeBound, RowData,
    Sheet, Workbook, WorksheetPatchSet,
};

#[derive(ClapParser)]
#[command(
    name = "xl",
    version,
    about = "Excel (.xlsx) file toolkit",
    long_about = "A command-line tool for reading, transforming, streaming, and evaluating Excel (.xlsx) files."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show workbook information (sheets, active sheet, defined names).
    Info { file: PathBuf },
    /// List all sheet names in the workbook.
    Sheets { file: PathBuf },
    /// Read and display a sheet's used range.
    Read {
        file: PathBuf,
        #[arg(short, long)]
        sheet: Option<String>,
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
    /// Get a single cell's value.
    Get {
        file: PathBuf,
        sheet: String,
        cell: String,
    },
    /// Set a cell's value and write the result to a new file.
    Set {
        file: PathBuf,
        sheet: String,
        cell: String,
        value: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Convert a sheet's used range to another format.
    Convert {
        file: PathBuf,
        #[arg(short, long)]
        format: ConvertFormat,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long)]
        sheet: Option<String>,
    },
    /// Stream a sheet row by row without loading the whole workbook.
    StreamRead {
        file: PathBuf,
        #[arg(short, long)]
        sheet: Option<String>,
        /// 0-based sheet index, used when `--sheet` is omitted.
        #[arg(short, long)]
        index: Option<usize>,
        /// Restrict to an A1 range, e.g. "B2:D50".
        #[arg(short, long)]
        range: Option<String>,
    },
    /// Apply a JSON cell-value patch file to a sheet without rewriting
    /// parts the patch doesn't touch.
    Patch {
        file: PathBuf,
        sheet: String,
        patch: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Evaluate a formula: ad-hoc text, a stored cell, or the whole
    /// workbook in dependency order.
    Eval {
        /// Ad-hoc formula text (e.g. "=1+2*3"). Omit when using --cell or
        /// --check.
        formula: Option<String>,
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(short, long)]
        sheet: Option<String>,
        /// Evaluate the formula already stored at this cell instead of
        /// `formula`.
        #[arg(short, long)]
        cell: Option<String>,
        /// Evaluate every formula in the workbook in dependency order.
        #[arg(long)]
        check: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Csv,
}

#[derive(Clone, ValueEnum)]
enum ConvertFormat {
    Csv,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Info { file } => cmd_info(&file),
        Commands::Sheets { file } => cmd_sheets(&file),
        Commands::Read { file, sheet, format } => cmd_read(&file, sheet.as_deref(), &format),
        Commands::Get { file, sheet, cell } => cmd_get(&file, &sheet, &cell),
        Commands::Set {
            file,
            sheet,
            cell,
            value,
            output,
        } => cmd_set(&file, &sheet, &cell, &value, &output),
        Commands::Convert {
            file,
            format,
            output,
            sheet,
        } => cmd_convert(&file, sheet.as_deref(), &format, &output),
        Commands::StreamRead {
            file,
            sheet,
            index,
            range,
        } => cmd_stream_read(&file, sheet.as_deref(), index, range.as_deref()),
        Commands::Patch {
            file,
            sheet,
            patch,
            output,
        } => cmd_patch(&file, &sheet, &patch, &output),
        Commands::Eval {
            formula,
            file,
            sheet,
            cell,
            check,
        } => cmd_eval(formula.as_deref(), file.as_deref(), sheet.as_deref(), cell.as_deref(), check),
    }
}

fn sheet_name_or_active<'a>(wb: &'a Workbook, sheet: Option<&'a str>) -> Result<&'a str, Box<dyn std::error::Error>> {
    match sheet {
        Some(s) => Ok(s),
        None => Ok(wb
            .sheets()
            .get(wb.active_sheet_index())
            .map(|s| s.name())
            .ok_or("workbook has no sheets")?),
    }
}

fn cmd_info(file: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let wb = read_from_path(file)?;
    let active = wb
        .sheets()
        .get(wb.active_sheet_index())
        .map(|s| s.name())
        .unwrap_or("");

    println!("File: {}", file.display());
    println!("Sheets: {}", wb.sheets().len());
    for (i, sheet) in wb.sheets().iter().enumerate() {
        let marker = if sheet.name() == active { " (active)" } else { "" };
        println!("  {}: {}{}", i + 1, sheet.name(), marker);
    }
    if !wb.defined_names().is_empty() {
        println!("Defined names: {}", wb.defined_names().len());
        for dn in wb.defined_names() {
            match &dn.scope {
                Some(scope) => println!("  {}!{} = {}", scope, dn.name, dn.formula),
                None => println!("  {} = {}", dn.name, dn.formula),
            }
        }
    }
    Ok(())
}

fn cmd_sheets(file: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let wb = read_from_path(file)?;
    for sheet in wb.sheets() {
        println!("{}", sheet.name());
    }
    Ok(())
}

/// Gather a sheet's non-empty cells into `row -> (col -> value)`, both
/// 1-based, for dense grid rendering.
fn collect_rows(sheet: &Sheet) -> BTreeMap<u32, BTreeMap<u32, CellValue>> {
    let mut rows: BTreeMap<u32, BTreeMap<u32, CellValue>> = BTreeMap::new();
    for (aref, cell) in sheet.iter_cells() {
        if cell.value.is_empty() {
            continue;
        }
        rows.entry(aref.row.display())
            .or_default()
            .insert(aref.col.index() + 1, cell.value.clone());
    }
    rows
}

fn render_grid(rows: &BTreeMap<u32, BTreeMap<u32, CellValue>>, separator: &str, escape_csv: bool) -> String {
    let max_col = rows.values().flat_map(|r| r.keys()).copied().max().unwrap_or(0);
    let mut out = String::new();
    for cells in rows.values() {
        let mut line = String::new();
        for col in 1..=max_col {
            if col > 1 {
                line.push_str(separator);
            }
            if let Some(v) = cells.get(&col) {
                let text = v.to_string();
                line.push_str(&if escape_csv { csv_escape(&text) } else { text });
            }
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn cmd_read(file: &PathBuf, sheet: Option<&str>, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let wb = read_from_path(file)?;
    let sheet_name = sheet_name_or_active(&wb, sheet)?;
    let sheet = wb.sheet(sheet_name)?;
    let rows = collect_rows(sheet);
    let (separator, csv) = match format {
        OutputFormat::Table => ("\t", false),
        OutputFormat::Csv => (",", true),
    };
    print!("{}", render_grid(&rows, separator, csv));
    Ok(())
}

fn cmd_get(file: &PathBuf, sheet: &str, cell: &str) -> Result<(), Box<dyn std::error::Error>> {
    let wb = read_from_path(file)?;
    let aref = ARef::parse_a1(cell)?;
    let value = wb.sheet(sheet)?.cell_value(aref);
    let display = value.to_string();
    if !display.is_empty() {
        println!("{display}");
    }
    Ok(())
}

fn cmd_set(
    file: &PathBuf,
    sheet: &str,
    cell: &str,
    value: &str,
    output: &PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let wb = read_from_path(file)?;
    let aref = ARef::parse_a1(cell)?;
    let cell_value = parse_cell_input(value);
    let next = wb.update(sheet, |s| s.put_value(aref, cell_value))?;
    write_to_path(&next, output)?;
    Ok(())
}

fn cmd_convert(
    file: &PathBuf,
    sheet: Option<&str>,
    format: &ConvertFormat,
    output: &PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let wb = read_from_path(file)?;
    let sheet_name = sheet_name_or_active(&wb, sheet)?;
    let rows = collect_rows(wb.sheet(sheet_name)?);
    match format {
        ConvertFormat::Csv => {
            let mut f = std::fs::File::create(output)?;
            write!(f, "{}", render_grid(&rows, ",", true))?;
        }
    }
    Ok(())
}

fn cmd_stream_read(
    file: &PathBuf,
    sheet: Option<&str>,
    index: Option<usize>,
    range: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = std::fs::read(file)?;
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;
    let bound = range.map(CellRange::parse_a1).transpose()?.map(RangeBound::from);

    let print_row = |row: RowData| {
        let mut line = format!("{}:", row.row);
        for (col, value) in &row.cells {
            line.push_str(&format!(" {col}={value}"));
        }
        println!("{line}");
    };

    let mut reader = match sheet {
        Some(name) => open_sheet_stream_by_name(&mut archive, name, bound)?,
        None => open_sheet_stream_by_index(&mut archive, index.unwrap_or(0), bound)?,
    };
    while let Some(row) = reader.next_row()? {
        print_row(row);
    }
    Ok(())
}

/// A minimal patch file: `{"cells": {"A1": "text", "B2": 42, "C3": true}}`.
/// Every entry becomes a [`CellPatch::SetValue`] that keeps the cell's
/// existing style.
fn cmd_patch(file: &PathBuf, sheet: &str, patch: &PathBuf, output: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let patch_json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(patch)?)?;
    let cells_obj = patch_json
        .get("cells")
        .and_then(|v| v.as_object())
        .ok_or("patch file must have a top-level \"cells\" object")?;

    let mut set = WorksheetPatchSet::new();
    for (cell_ref, value) in cells_obj {
        let aref = ARef::parse_a1(cell_ref)?;
        let cell_value = json_to_cell_value(value);
        set.cells.insert(
            aref,
            CellPatch::SetValue {
                value: cell_value,
                preserve_style: true,
            },
        );
    }

    let bytes = std::fs::read(file)?;
    let patched = apply_patches_to_buffer(&bytes, sheet, &set)?;
    std::fs::write(output, patched)?;
    Ok(())
}

fn json_to_cell_value(v: &serde_json::Value) -> CellValue {
    match v {
        serde_json::Value::Null => CellValue::Empty,
        serde_json::Value::Bool(b) => CellValue::Bool(*b),
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
            .map(CellValue::Number)
            .unwrap_or(CellValue::Empty),
        serde_json::Value::String(s) => CellValue::from(s.as_str()),
        other => CellValue::from(other.to_string()),
    }
}

fn cmd_eval(
    formula: Option<&str>,
    file: Option<&PathBuf>,
    sheet: Option<&str>,
    cell: Option<&str>,
    check: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if check {
        let file = file.ok_or("--check requires --file")?;
        let wb = read_from_path(file)?;
        let computed = evaluator::evaluate_with_dependency_check(&wb, None)?;
        for (loc, value) in computed {
            println!("{} = {}", loc.display(), value);
        }
        return Ok(());
    }

    if let Some(cell_ref) = cell {
        let file = file.ok_or("--cell requires --file")?;
        let wb = read_from_path(file)?;
        let sheet_name = sheet_name_or_active(&wb, sheet)?;
        let aref = ARef::parse_a1(cell_ref)?;
        let value = evaluator::evaluate_cell(&wb, sheet_name, aref, &evaluator::Overrides::new(), None)?;
        println!("{value}");
        return Ok(());
    }

    let text = formula.ok_or("provide a formula, --cell, or --check")?;
    let wb = file.map(read_from_path).transpose()?;
    let sheet_name = match (&wb, sheet) {
        (Some(wb), s) => sheet_name_or_active(wb, s)?.to_string(),
        (None, Some(s)) => s.to_string(),
        (None, None) => "Sheet1".to_string(),
    };
    let value = evaluator::evaluate_formula(text, wb.as_ref(), &sheet_name, &evaluator::Overrides::new(), None)?;
    println!("{value}");
    Ok(())
}

/// Parse a user-provided string into a [`CellValue`]. Recognizes booleans
/// and exact decimal numbers; everything else is text.
fn parse_cell_input(input: &str) -> CellValue {
    match input.to_uppercase().as_str() {
        "TRUE" => return CellValue::Bool(true),
        "FALSE" => return CellValue::Bool(false),
        _ => {}
    }
    if let Ok(n) = Decimal::from_str(input) {
        return CellValue::Number(n);
    }
    CellValue::from(input)
}
