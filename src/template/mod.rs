//! The templating capability consumed by the pipeline.
//!
//! The pipeline never looks inside a template: it asks an engine which documents a source
//! statically references, loads sources under their [`DocumentId`], and renders documents
//! against a [`RenderScope`].

use crate::{assets::AssetTags, document::DocumentId, error::PagewrightError};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod handlebars;

pub use self::handlebars::HandlebarsEngine;

pub trait TemplateEngine: Send {
    /// Documents statically referenced (included, extended) by `source`.
    fn references(&self, source: &str) -> Result<Vec<DocumentId>, PagewrightError>;

    /// Parse `source` and make it available as `id`, replacing any previous version.
    fn load(&mut self, id: &DocumentId, source: &str) -> Result<(), PagewrightError>;

    fn unload(&mut self, id: &DocumentId);

    fn render(&self, id: &DocumentId, scope: &RenderScope) -> Result<String, PagewrightError>;
}

/// Everything a document can reach while it renders.
#[derive(Clone)]
pub struct RenderScope {
    pub document: DocumentId,
    pub assets: AssetTags,
    /// Start of the build, exposed to documents as `now`.
    pub started: SystemTime,
}

impl RenderScope {
    pub fn new(assets: AssetTags, started: SystemTime) -> Self {
        RenderScope {
            document: assets.document().clone(),
            assets,
            started,
        }
    }

    pub fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    /// Build start in whole seconds since the Unix epoch.
    pub fn now(&self) -> u64 {
        self.started
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}
