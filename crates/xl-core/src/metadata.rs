//! Light metadata reader: workbook shape without worksheet bodies.
//!
//! Scans `xl/workbook.xml` and `xl/_rels/workbook.xml.rels` fully, then
//! reads only the header prefix of each worksheet part up to and
//! including its `<dimension>` element before moving on. Never
//! materializes `<sheetData>`.

use std::io::{BufReader, Read, Seek};
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use zip::ZipArchive;

use crate::address::CellRange;
use crate::error::ReadError;
use crate::sheet::Visibility;
use crate::workbook::DefinedName;

/// Everything [`read_metadata`] can learn about one sheet without
/// reading its row data.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetMetadata {
    pub name: String,
    pub sheet_id: u32,
    pub visibility: Visibility,
    pub part_path: String,
    pub dimension: Option<CellRange>,
}

/// Workbook-level shape: sheet headers, defined names, active tab.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkbookMetadata {
    pub sheets: Vec<SheetMetadata>,
    pub defined_names: Vec<DefinedName>,
    pub active_sheet_index: Option<usize>,
}

/// Read workbook metadata from an in-memory `.xlsx` buffer.
pub fn read_metadata_from_buffer(bytes: &[u8]) -> Result<WorkbookMetadata, ReadError> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = ZipArchive::new(cursor).map_err(|e| ReadError::InvalidZip(e.to_string()))?;
    read_metadata(&mut archive)
}

/// Read workbook metadata from an `.xlsx` file at `path`.
pub fn read_metadata_from_path(path: impl AsRef<Path>) -> Result<WorkbookMetadata, ReadError> {
    let file = std::fs::File::open(path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| ReadError::InvalidZip(e.to_string()))?;
    read_metadata(&mut archive)
}

fn read_metadata<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<WorkbookMetadata, ReadError> {
    let workbook_xml: xl_xml::workbook::WorkbookXml = crate::reader::read_xml_part(archive, "xl/workbook.xml")?;
    let workbook_rels: xl_xml::relationships::Relationships =
        crate::reader::read_xml_part(archive, "xl/_rels/workbook.xml.rels")?;

    let mut sheets = Vec::with_capacity(workbook_xml.sheets.sheets.len());
    for entry in &workbook_xml.sheets.sheets {
        let rel = workbook_rels
            .relationships
            .iter()
            .find(|r| r.id == entry.r_id)
            .ok_or_else(|| ReadError::MissingPart(format!("relationship {}", entry.r_id)))?;
        let part_path = crate::reader::resolve_relationship_target("xl/workbook.xml", &rel.target);
        let dimension = scan_dimension(archive, &part_path)?;

        sheets.push(SheetMetadata {
            name: entry.name.clone(),
            sheet_id: entry.sheet_id,
            visibility: crate::reader::decode_visibility(entry.state.as_deref()),
            part_path,
            dimension,
        });
    }

    let defined_names = workbook_xml
        .defined_names
        .as_ref()
        .map(|dns| {
            dns.defined_names
                .iter()
                .map(|dn| DefinedName {
                    name: dn.name.clone(),
                    scope: dn
                        .local_sheet_id
                        .and_then(|idx| workbook_xml.sheets.sheets.get(idx as usize))
                        .map(|entry| entry.name.clone()),
                    formula: dn.value.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    let active_sheet_index = workbook_xml
        .book_views
        .as_ref()
        .and_then(|views| views.workbook_views.first())
        .and_then(|view| view.active_tab)
        .map(|n| n as usize);

    Ok(WorkbookMetadata {
        sheets,
        defined_names,
        active_sheet_index,
    })
}

/// Read just far enough into a worksheet part to find its `<dimension>`
/// element, then stop. Returns `None` if the part has no dimension
/// before `<sheetData>` starts (or before the part ends).
fn scan_dimension<R: Read + Seek>(archive: &mut ZipArchive<R>, part_path: &str) -> Result<Option<CellRange>, ReadError> {
    let file = archive
        .by_name(part_path)
        .map_err(|_| ReadError::MissingPart(part_path.to_string()))?;
    let mut reader = Reader::from_reader(BufReader::new(file));
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) if local_name_is(&e, b"dimension") => {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"ref" {
                        let value = std::str::from_utf8(&attr.value).unwrap_or("").to_string();
                        return Ok(parse_dimension(&value));
                    }
                }
                return Ok(None);
            }
            Ok(Event::Start(e)) if local_name_is(&e, b"sheetData") => return Ok(None),
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(e) => {
                return Err(ReadError::MalformedXml {
                    part: part_path.to_string(),
                    location: e.to_string(),
                })
            }
        }
        buf.clear();
    }
}

fn local_name_is(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> bool {
    e.local_name().as_ref() == name
}

fn parse_dimension(s: &str) -> Option<CellRange> {
    if s.contains(':') {
        CellRange::parse_a1(s).ok()
    } else {
        crate::address::ARef::parse_a1(s).ok().map(CellRange::single)
    }
}
