use crate::{
    assets::{AssetKind, BundleKey, Category, Placement},
    document::DocumentId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Which render pass is in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RenderPhase {
    /// Pass 1: record requests, emit placeholders.
    #[default]
    Collect,
    /// Pass 2: emit bundle links for resolved requests.
    Emit,
}

/// One declared asset. `source` is relative to the source root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetRequest {
    pub kind: AssetKind,
    pub source: String,
}

impl AssetRequest {
    pub fn new(kind: AssetKind, source: impl AsRef<str>) -> Self {
        AssetRequest {
            kind,
            source: source.as_ref().trim_start_matches('/').to_string(),
        }
    }
}

/// Outcome of [`AssetRegistry::request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requested {
    /// Nothing usable can be emitted yet.
    Pending,
    /// First call for this key in pass 2: the bundle URLs to link, in order.
    Resolved(Vec<String>),
    /// The document already emitted the links for this key during this render.
    AlreadyEmitted,
}

/// Original asset source path -> URL of the bundle that contains it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledIndex(BTreeMap<String, String>);

impl CompiledIndex {
    pub fn insert(&mut self, source: impl Into<String>, url: impl Into<String>) {
        self.0.insert(source.into(), url.into());
    }

    pub fn get(&self, source: &str) -> Option<&str> {
        self.0.get(source).map(String::as_str)
    }

    pub fn contains(&self, source: &str) -> bool {
        self.0.contains_key(source)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Drop `source` and every other entry pointing at the same bundle. Returns the dropped
    /// sources.
    pub fn invalidate_bundle_of(&mut self, source: &str) -> Vec<String> {
        let Some(url) = self.0.get(source).cloned() else {
            return Vec::new();
        };
        let members: Vec<String> = self
            .0
            .iter()
            .filter(|(_, member_url)| **member_url == url)
            .map(|(member, _)| member.clone())
            .collect();
        for member in members.iter() {
            self.0.remove(member);
        }
        members
    }
}

#[derive(Debug, Clone, Default)]
struct DocumentAssets {
    requests: BTreeMap<BundleKey, Vec<AssetRequest>>,
    emitted: BTreeSet<BundleKey>,
}

impl DocumentAssets {
    fn record(&mut self, key: BundleKey, request: AssetRequest) {
        let list = self.requests.entry(key).or_default();
        if !list.contains(&request) {
            list.push(request);
        }
    }
}

/// Per-document asset requests plus the [`CompiledIndex`] they resolve against.
///
/// The registry is owned by one [`RebuildPipeline`](crate::pipeline::RebuildPipeline); asset
/// helpers only reach it through the [`AssetTags`](crate::assets::AssetTags) handle of the
/// document being rendered.
#[derive(Debug, Clone, Default)]
pub struct AssetRegistry {
    phase: RenderPhase,
    documents: BTreeMap<DocumentId, DocumentAssets>,
    compiled: CompiledIndex,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RenderPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: RenderPhase) {
        self.phase = phase;
    }

    /// Forget all requests and compiled paths. Used at the start of every cold build.
    pub fn reset(&mut self) {
        self.phase = RenderPhase::Collect;
        self.documents.clear();
        self.compiled.clear();
    }

    /// Prepare `document` for a render in the current phase. A collect render starts from an
    /// empty request list; an emit render keeps the requests but may emit every key again.
    pub fn begin_document(&mut self, document: &DocumentId) {
        let entry = self.documents.entry(document.clone()).or_default();
        if self.phase == RenderPhase::Collect {
            entry.requests.clear();
        }
        entry.emitted.clear();
    }

    /// Drop everything known about `document`, e.g. after it was deleted.
    pub fn forget_document(&mut self, document: &DocumentId) {
        self.documents.remove(document);
    }

    /// Record that `document` needs `request` at `placement`.
    pub fn request(
        &mut self,
        document: &DocumentId,
        request: AssetRequest,
        placement: Placement,
    ) -> Requested {
        let key = BundleKey::new(request.kind.category(), placement);
        let phase = self.phase;
        let entry = self.documents.entry(document.clone()).or_default();
        if phase == RenderPhase::Emit && entry.emitted.contains(&key) {
            return Requested::AlreadyEmitted;
        }
        entry.record(key, request);
        if phase == RenderPhase::Collect {
            return Requested::Pending;
        }
        match self.resolved(document, key.category, key.placement) {
            Some(urls) => {
                if let Some(entry) = self.documents.get_mut(document) {
                    entry.emitted.insert(key);
                }
                Requested::Resolved(urls)
            }
            None => Requested::Pending,
        }
    }

    /// Ordered, de-duplicated bundle URLs for every request of `document` under the key, or
    /// `None` while any of them is not compiled yet.
    pub fn resolved(
        &self,
        document: &DocumentId,
        category: Category,
        placement: Placement,
    ) -> Option<Vec<String>> {
        let requests = self
            .documents
            .get(document)?
            .requests
            .get(&BundleKey::new(category, placement))?;
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for request in requests.iter() {
            let url = self.compiled.get(&request.source)?;
            if seen.insert(url) {
                urls.push(url.to_string());
            }
        }
        Some(urls)
    }

    /// Whether any recorded request has no compiled path yet.
    pub fn has_unresolved(&self) -> bool {
        self.documents.values().any(|assets| {
            assets
                .requests
                .values()
                .flatten()
                .any(|request| !self.compiled.contains(&request.source))
        })
    }

    /// Every recorded request grouped by key, de-duplicated across documents in first-seen
    /// order (documents are visited in identity order).
    pub fn requests_by_key(&self) -> BTreeMap<BundleKey, Vec<AssetRequest>> {
        let mut grouped: BTreeMap<BundleKey, Vec<AssetRequest>> = BTreeMap::new();
        for assets in self.documents.values() {
            for (key, requests) in assets.requests.iter() {
                let list = grouped.entry(*key).or_default();
                for request in requests.iter() {
                    if !list.contains(request) {
                        list.push(request.clone());
                    }
                }
            }
        }
        grouped
    }

    /// Documents with at least one request for `source`.
    pub fn documents_requesting(&self, source: &str) -> BTreeSet<DocumentId> {
        self.documents
            .iter()
            .filter(|(_, assets)| {
                assets
                    .requests
                    .values()
                    .flatten()
                    .any(|request| request.source == source)
            })
            .map(|(document, _)| document.clone())
            .collect()
    }

    /// Invalidate the bundle containing `source` and return every document that requested one
    /// of its members. Returns nothing when `source` is not part of a compiled bundle.
    pub fn invalidate_asset(&mut self, source: &str) -> BTreeSet<DocumentId> {
        let source = source.trim_start_matches('/');
        let mut affected = BTreeSet::new();
        for member in self.compiled.invalidate_bundle_of(source) {
            affected.extend(self.documents_requesting(&member));
        }
        affected
    }

    pub fn compiled(&self) -> &CompiledIndex {
        &self.compiled
    }

    pub fn compiled_mut(&mut self) -> &mut CompiledIndex {
        &mut self.compiled
    }
}
