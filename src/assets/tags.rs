use crate::{
    assets::{
        AssetAttrs, AssetKind, AssetRegistry, AssetRequest, AttrValue, Placement, Precompiler,
        Requested, PENDING_MARKER,
    },
    config::BuildMode,
    document::DocumentId,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Registry handle shared between the pipeline and the asset helpers of the document being
/// rendered.
pub type SharedRegistry = Arc<Mutex<AssetRegistry>>;

/// One `script(...)`/`style(...)`-style declaration as written in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetTag {
    pub kind: AssetKind,
    /// The path as written by the document author.
    pub source: String,
    pub placement: Placement,
    /// Only emitted in debug mode.
    pub debug_only: bool,
    pub attrs: AssetAttrs,
}

impl AssetTag {
    pub fn new(kind: AssetKind, source: impl Into<String>) -> Self {
        AssetTag {
            kind,
            source: source.into(),
            placement: Placement::Body,
            debug_only: false,
            attrs: AssetAttrs::new(),
        }
    }

    pub fn in_head(mut self, head: bool) -> Self {
        self.placement = Placement::from_head_flag(head);
        self
    }

    pub fn debug_only(mut self, debug_only: bool) -> Self {
        self.debug_only = debug_only;
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key, value);
        self
    }
}

/// The asset declaration surface handed to a template engine while it renders one document.
#[derive(Clone)]
pub struct AssetTags {
    registry: SharedRegistry,
    document: DocumentId,
    mode: BuildMode,
    precompiler: Option<Arc<Precompiler>>,
}

impl AssetTags {
    pub fn new(registry: SharedRegistry, document: DocumentId, mode: BuildMode) -> Self {
        AssetTags {
            registry,
            document,
            mode,
            precompiler: None,
        }
    }

    pub fn with_precompiler(mut self, precompiler: Arc<Precompiler>) -> Self {
        self.precompiler = Some(precompiler);
        self
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    /// Markup to substitute for `tag` in the current render.
    ///
    /// Debug builds link the source file directly. Otherwise the tag is recorded in the
    /// registry and yields [`PENDING_MARKER`] until its bundle is known; the first declaration
    /// of a resolved bundle key emits links to all of the document's bundles for that key, later
    /// ones emit nothing.
    pub fn declare(&self, tag: &AssetTag) -> String {
        if self.mode == BuildMode::Debug {
            let mut attrs = tag.attrs.clone();
            attrs.set_default("type", AttrValue::Text(tag.kind.mime().to_string()));
            return tag.kind.markup(&tag.source, &attrs);
        }
        if tag.debug_only {
            return String::new();
        }

        let request = AssetRequest::new(tag.kind, &tag.source);
        let outcome = self
            .registry
            .lock()
            .request(&self.document, request.clone(), tag.placement);
        match outcome {
            Requested::AlreadyEmitted => String::new(),
            Requested::Resolved(urls) => {
                let base = tag.kind.category().base_kind();
                let attrs =
                    AssetAttrs::new().with("type", AttrValue::Text(base.mime().to_string()));
                urls.iter()
                    .map(|url| base.markup(url, &attrs))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Requested::Pending => {
                if let Some(precompiler) = self.precompiler.as_ref() {
                    if request.kind.is_precompiled() {
                        if let Err(e) = precompiler.ensure_on_demand(request.kind, &request.source) {
                            tracing::error!(
                                "Pre-compiling {} for {} failed: {}",
                                request.source,
                                self.document,
                                e
                            );
                        }
                    }
                }
                PENDING_MARKER.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::RenderPhase;
    use test_log::test;

    fn tags(mode: BuildMode) -> (SharedRegistry, AssetTags) {
        let registry: SharedRegistry = Arc::new(Mutex::new(AssetRegistry::new()));
        let tags = AssetTags::new(registry.clone(), DocumentId::new("index.html"), mode);
        (registry, tags)
    }

    #[test]
    fn test_debug_mode_links_source_directly() {
        let (registry, tags) = tags(BuildMode::Debug);
        registry.lock().compiled_mut().insert("js/app.js", "/compiled/x_min.js");
        let tag = AssetTag::new(AssetKind::Script, "/js/app.js").attr("defer", AttrValue::Flag(true));
        assert_eq!(
            tags.declare(&tag),
            r#"<script src="/js/app.js" defer type="text/javascript"></script>"#
        );
        let less = AssetTag::new(AssetKind::Less, "css/site.less").debug_only(true);
        assert_eq!(
            tags.declare(&less),
            r#"<link rel="stylesheet/less" href="css/site.less" type="text/less">"#
        );
        assert!(registry.lock().requests_by_key().is_empty());
    }

    #[test]
    fn test_production_two_passes() {
        let (registry, tags) = tags(BuildMode::Production);
        let app = AssetTag::new(AssetKind::Script, "js/app.js");
        let lib = AssetTag::new(AssetKind::Coffee, "js/lib.coffee");
        assert_eq!(tags.declare(&app), PENDING_MARKER);
        assert_eq!(tags.declare(&lib), PENDING_MARKER);
        assert_eq!(
            tags.declare(&AssetTag::new(AssetKind::Script, "js/dev.js").debug_only(true)),
            ""
        );

        {
            let mut registry = registry.lock();
            registry.compiled_mut().insert("js/app.js", "/compiled/maincompiled-t_min.js");
            registry.compiled_mut().insert("js/lib.coffee", "/compiled/maincompiled-t_min.js");
            registry.set_phase(RenderPhase::Emit);
            registry.begin_document(tags.document());
        }
        assert_eq!(
            tags.declare(&app),
            r#"<script src="/compiled/maincompiled-t_min.js" type="text/javascript"></script>"#
        );
        assert_eq!(tags.declare(&lib), "");
    }
}
