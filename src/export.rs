//! Exporter interface. PDF/HTML rendering happens outside the core; the
//! search endpoint only hands a page of results to whatever implementation
//! is configured and streams the bytes back.

use crate::model::Logbook;
use crate::storage::SearchHit;

/// A rendered export.
pub struct Export {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// How many entries ended up in the document.
    pub entry_count: usize,
}

/// Renders a page of search results to a downloadable document.
pub trait Exporter: Send + Sync {
    fn export(
        &self,
        logbook: Option<&Logbook>,
        entries: &[SearchHit],
    ) -> Result<Export, Box<dyn std::error::Error + Send + Sync>>;
}
