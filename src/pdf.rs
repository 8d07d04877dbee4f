//! PDF helpers: page counting, single-page slicing and text-layer extraction.

use anyhow::{Context, Result};
use lopdf::Document;

fn load(data: &[u8]) -> Result<Document> {
    Document::load_mem(data).map_err(|e| anyhow::anyhow!("Failed to load PDF: {}", e))
}

/// Number of pages in the document.
pub fn page_count(data: &[u8]) -> Result<u32> {
    let doc = load(data)?;
    let count = doc.get_pages().len() as u32;
    if count == 0 {
        anyhow::bail!("PDF has no pages");
    }
    Ok(count)
}

/// A parsed document that single pages can be cut from repeatedly.
pub struct PageSource {
    doc: Document,
    total: u32,
}

impl PageSource {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let doc = load(data)?;
        let total = doc.get_pages().len() as u32;
        Ok(Self { doc, total })
    }

    pub fn page_count(&self) -> u32 {
        self.total
    }

    /// A standalone PDF holding only page `page` (1-based).
    pub fn extract(&self, page: u32) -> Result<Vec<u8>> {
        if page == 0 || page > self.total {
            anyhow::bail!(
                "Page {} out of range (document has {} pages)",
                page,
                self.total
            );
        }

        let mut doc = self.doc.clone();
        let others: Vec<u32> = (1..=self.total).filter(|&p| p != page).collect();
        if !others.is_empty() {
            doc.delete_pages(&others);
        }
        doc.prune_objects();
        doc.renumber_objects();

        let mut out = Vec::new();
        doc.save_to(&mut out)
            .with_context(|| format!("Failed to save page {}", page))?;
        Ok(out)
    }
}

/// A standalone PDF holding only page `page` (1-based) of the source.
pub fn extract_page(data: &[u8], page: u32) -> Result<Vec<u8>> {
    PageSource::parse(data)?.extract(page)
}

/// Text layer of the whole document, pages in order.
pub fn text_layer(data: &[u8]) -> Result<String> {
    let doc = load(data)?;
    let mut text = String::new();

    for (page_num, _) in doc.get_pages() {
        match doc.extract_text(&[page_num]) {
            Ok(content) => {
                text.push_str(&content);
                text.push('\n');
            }
            Err(e) => tracing::debug!("No text layer on page {}: {}", page_num, e),
        }
    }

    Ok(text.trim().to_string())
}
