//! Format dispatch and the non-OCR text extractors.
//!
//! The document extension decides the path: plain text, CSV, spreadsheets,
//! office documents, HTML and PDF text layers are read directly; images go
//! straight to OCR; PDFs whose text layer is too thin fall back to the
//! page-parallel OCR orchestration.

use anyhow::{Context, Result};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use lol_html::{doc_text, element, rewrite_str, RewriteStrSettings};
use quick_xml::events::Event;
use std::io::{Cursor, Read};
use zip::ZipArchive;

use crate::ocr::IMAGE_EXTENSIONS;
use crate::pdf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    Csv,
    Spreadsheet,
    Docx,
    Pptx,
    Html,
    Pdf,
    Image,
}

impl DocumentKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            ".txt" | ".text" => Some(Self::PlainText),
            ".csv" => Some(Self::Csv),
            ".xlsx" | ".xlsm" | ".xlsb" | ".xls" | ".ods" => Some(Self::Spreadsheet),
            ".docx" => Some(Self::Docx),
            ".pptx" => Some(Self::Pptx),
            ".html" | ".htm" => Some(Self::Html),
            ".pdf" => Some(Self::Pdf),
            e if IMAGE_EXTENSIONS.contains(&e) => Some(Self::Image),
            _ => None,
        }
    }

    /// Method tag reported for a direct (non-OCR) extraction.
    pub fn method(&self) -> &'static str {
        match self {
            Self::PlainText => "text_to_text",
            Self::Csv => "csv_to_text",
            Self::Spreadsheet => "xls_to_text",
            Self::Docx => "docx_to_text",
            Self::Pptx => "pptx_to_text",
            Self::Html => "html_to_text",
            Self::Pdf => "pdf_to_text",
            Self::Image => "image_to_text",
        }
    }
}

/// Extract text without OCR. Images have no direct path.
pub fn extract_direct(kind: DocumentKind, data: &[u8]) -> Result<String> {
    match kind {
        DocumentKind::PlainText => Ok(String::from_utf8_lossy(data).trim().to_string()),
        DocumentKind::Csv => csv_to_text(data),
        DocumentKind::Spreadsheet => spreadsheet_to_text(data),
        DocumentKind::Docx => docx_to_text(data),
        DocumentKind::Pptx => pptx_to_text(data),
        DocumentKind::Html => html_to_text(data),
        DocumentKind::Pdf => pdf::text_layer(data),
        DocumentKind::Image => anyhow::bail!("Images can only be extracted with OCR"),
    }
}

/// Rows on separate lines, cells separated by tabs.
fn csv_to_text(data: &[u8]) -> Result<String> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_reader(data);

    let mut lines = Vec::new();
    for result in reader.records() {
        let record = result.context("Failed to read CSV record")?;
        lines.push(record.iter().collect::<Vec<_>>().join("\t"));
    }
    Ok(lines.join("\n"))
}

/// Each sheet: its name, a rule line, then ` | `-joined rows.
fn spreadsheet_to_text(data: &[u8]) -> Result<String> {
    let mut workbook =
        open_workbook_auto_from_rs(Cursor::new(data)).context("Failed to open workbook")?;

    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
    let mut lines = Vec::new();

    for name in &sheet_names {
        let range = match workbook.worksheet_range(name) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Skipping sheet '{}': {}", name, e);
                continue;
            }
        };

        lines.push(name.clone());
        lines.push("-------------------------------------------".to_string());
        for row in range.rows() {
            let cells: Vec<String> = row.iter().map(|c| cell_to_string(c).trim().to_string()).collect();
            lines.push(cells.join(" | "));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n").trim().to_string())
}

/// Body paragraphs (table cell paragraphs included) separated by blank lines.
fn docx_to_text(data: &[u8]) -> Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(data)).context("Failed to open DOCX")?;
    let xml = zip_entry(&mut archive, "word/document.xml")?;
    Ok(xml_blocks(&xml, b"p")?.join("\n\n").trim().to_string())
}

/// Every text run of every slide, slides in order, separated by blank lines.
fn pptx_to_text(data: &[u8]) -> Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(data)).context("Failed to open PPTX")?;

    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = name
                .strip_prefix("ppt/slides/slide")?
                .strip_suffix(".xml")?
                .parse()
                .ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    slides.sort();

    let mut runs = Vec::new();
    for (_, name) in &slides {
        let xml = zip_entry(&mut archive, name)?;
        runs.extend(
            xml_blocks(&xml, b"t")?
                .into_iter()
                .map(|run| run.trim().to_string())
                .filter(|run| !run.is_empty()),
        );
    }
    Ok(runs.join("\n\n"))
}

fn zip_entry<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<String> {
    let mut entry = archive
        .by_name(name)
        .with_context(|| format!("Archive has no {}", name))?;
    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .with_context(|| format!("Failed to read {}", name))?;
    Ok(xml)
}

/// Text of the `*:t` elements, one entry per closed `block` element.
fn xml_blocks(xml: &str, block: &[u8]) -> Result<Vec<String>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event().context("Malformed XML")? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => in_text = true,
            Event::Text(t) if in_text => {
                current.push_str(&t.unescape().context("Malformed XML text")?);
            }
            Event::Empty(e) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                name if name == block => blocks.push(String::new()),
                _ => {}
            },
            Event::End(e) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                }
                if name.as_ref() == block {
                    blocks.push(std::mem::take(&mut current));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(blocks)
}

/// Visible text nodes, one per line. Script and style content is dropped.
fn html_to_text(data: &[u8]) -> Result<String> {
    let html = String::from_utf8_lossy(data);
    let visible = rewrite_str(
        &html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("script", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("style", |el| {
                    el.remove();
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|e| anyhow::anyhow!("Failed to parse HTML: {}", e))?;

    let mut nodes = Vec::new();
    let mut current = String::new();
    rewrite_str(
        &visible,
        RewriteStrSettings {
            document_content_handlers: vec![doc_text!(|t| {
                current.push_str(t.as_str());
                if t.last_in_text_node() {
                    let node = html_escape::decode_html_entities(current.trim()).into_owned();
                    if !node.is_empty() {
                        nodes.push(node);
                    }
                    current.clear();
                }
                Ok(())
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|e| anyhow::anyhow!("Failed to parse HTML: {}", e))?;

    Ok(nodes.join("\n"))
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            // Avoid trailing ".0" for whole numbers
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                format!("{}", *f as i64)
            } else {
                format!("{}", f)
            }
        }
        Data::Bool(b) => (if *b { "True" } else { "False" }).to_string(),
        Data::DateTime(dt) => excel_serial_to_string(dt.as_f64()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERR:{:?}", e),
    }
}

/// Excel serial (days since 1899-12-30) as `YYYY-MM-DD`, with the time only when non-zero.
fn excel_serial_to_string(serial: f64) -> String {
    let days = serial.floor() as i64;
    let secs = ((serial - days as f64) * 86400.0).round() as i64;
    let (y, m, d) = civil_from_days(days - 25569);

    if secs == 0 || secs == 86400 {
        format!("{:04}-{:02}-{:02}", y, m, d)
    } else {
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            y,
            m,
            d,
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )
    }
}

/// Proleptic Gregorian date from days since 1970-01-01.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::test_support::sample_pdf;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn office_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn slide(text: &str) -> String {
        format!(
            r#"<p:sld xmlns:p="p" xmlns:a="a"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>"#,
            text
        )
    }

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(DocumentKind::from_extension(".pdf"), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::from_extension(".tif"), Some(DocumentKind::Image));
        assert_eq!(DocumentKind::from_extension(".ods"), Some(DocumentKind::Spreadsheet));
        assert_eq!(DocumentKind::from_extension(".txt"), Some(DocumentKind::PlainText));
        assert_eq!(DocumentKind::from_extension(".htm"), Some(DocumentKind::Html));
        assert_eq!(DocumentKind::from_extension(".docx"), Some(DocumentKind::Docx));
        assert_eq!(DocumentKind::from_extension(".pptx"), Some(DocumentKind::Pptx));
        assert_eq!(DocumentKind::from_extension(".doc"), None);
        assert_eq!(DocumentKind::from_extension(".exe"), None);
        assert_eq!(DocumentKind::from_extension(""), None);
    }

    #[test]
    fn test_plain_text_is_trimmed_and_lossy() {
        let text = extract_direct(DocumentKind::PlainText, b"  hi \xff there \n").unwrap();
        assert_eq!(text, "hi \u{fffd} there");
    }

    #[test]
    fn test_csv_rows_tab_separated() {
        let text = extract_direct(DocumentKind::Csv, b"name,age\nAlice,30\nBob\n").unwrap();
        assert_eq!(text, "name\tage\nAlice\t30\nBob");
    }

    #[test]
    fn test_pdf_text_layer() {
        let pdf = sample_pdf(&["Quarterly report"]);
        let text = extract_direct(DocumentKind::Pdf, &pdf).unwrap();
        assert!(text.contains("Quarterly report"));
    }

    #[test]
    fn test_docx_paragraphs_and_table_cells() {
        let document = r#"<w:document xmlns:w="w"><w:body><w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t xml:space="preserve"> world</w:t></w:r></w:p><w:p/><w:tbl><w:tr><w:tc><w:p><w:r><w:t>A &amp; B</w:t></w:r><w:r><w:tab/><w:t>C</w:t></w:r></w:p></w:tc></w:tr></w:tbl></w:body></w:document>"#;
        let docx = office_zip(&[("word/document.xml", document)]);

        let text = extract_direct(DocumentKind::Docx, &docx).unwrap();
        assert_eq!(text, "Hello world\n\n\n\nA & B\tC");
    }

    #[test]
    fn test_docx_without_body_is_error() {
        let docx = office_zip(&[("word/styles.xml", "<w:styles/>")]);
        assert!(extract_direct(DocumentKind::Docx, &docx).is_err());
        assert!(extract_direct(DocumentKind::Docx, b"not a zip").is_err());
    }

    #[test]
    fn test_pptx_slides_in_numeric_order() {
        let pptx = office_zip(&[
            ("ppt/slides/slide10.xml", slide("Tenth").as_str()),
            ("ppt/slides/slide2.xml", slide("Second").as_str()),
            ("ppt/slides/_rels/slide1.xml.rels", "<Relationships/>"),
            ("ppt/slides/slide1.xml", slide("Title").as_str()),
        ]);

        let text = extract_direct(DocumentKind::Pptx, &pptx).unwrap();
        assert_eq!(text, "Title\n\nSecond\n\nTenth");
    }

    #[test]
    fn test_html_visible_text_nodes() {
        let html = b"<html><head><title>Doc</title><style>p{color:red}</style><script>var x = 1;</script></head><body><p>Fish &amp; chips</p><p>  </p><div>Total <b>12</b></div></body></html>";
        let text = extract_direct(DocumentKind::Html, html).unwrap();
        assert_eq!(text, "Doc\nFish & chips\nTotal\n12");
    }

    #[test]
    fn test_image_has_no_direct_path() {
        assert!(extract_direct(DocumentKind::Image, b"").is_err());
    }

    #[test]
    fn test_garbage_spreadsheet_is_error() {
        assert!(extract_direct(DocumentKind::Spreadsheet, b"not a workbook").is_err());
    }

    #[test]
    fn test_cell_to_string() {
        assert_eq!(cell_to_string(&Data::Float(3.0)), "3");
        assert_eq!(cell_to_string(&Data::Float(2.5)), "2.5");
        assert_eq!(cell_to_string(&Data::Bool(true)), "True");
        assert_eq!(cell_to_string(&Data::Empty), "");
    }

    #[test]
    fn test_excel_serial_to_string() {
        assert_eq!(excel_serial_to_string(45292.0), "2024-01-01");
        assert_eq!(excel_serial_to_string(45292.5), "2024-01-01 12:00:00");
        assert_eq!(excel_serial_to_string(25569.0), "1970-01-01");
    }
}
