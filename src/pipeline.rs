//! Cold and incremental builds.
//!
//! A [`RebuildPipeline`] owns the dependency graph, the asset registry and the destination tree.
//! Every build walks the same states:
//!
//! ```text
//! Idle -> Scanning -> RenderPass1 -> Aggregating -> RenderPass2 -> Idle
//!                                        |
//!                                        +-> Aborted -> Idle
//! ```
//!
//! Debug builds link source assets directly and go from `Scanning` straight to `RenderPass2`.
//! Failures scoped to one document or one bundle are recorded in the [`BuildReport`]; only a
//! destination tree that cannot be created or scanned fails the whole build.

use crate::{
    assets::{
        aggregator::remove_stale_bundles, AssetAggregator, AssetRegistry, AssetTags, BundleOutput,
        Precompiler, RenderPhase, SharedRegistry, PENDING_MARKER,
    },
    config::BuildOptions,
    document::{is_document, scan_tree, DocumentId},
    error::PagewrightError,
    graph::DependencyGraph,
    oracle,
    output::{copy_if_stale, remove_if_exists, write_atomic},
    shell::{ShellRunner, SystemShell},
    template::{HandlebarsEngine, RenderScope, TemplateEngine},
    watch::{BatchHandler, ChangeBatch, ChangeKind},
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PipelineState {
    #[default]
    Idle,
    Scanning,
    RenderPass1,
    Aggregating,
    RenderPass2,
    Aborted,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildKind {
    #[default]
    Cold,
    Incremental,
}

/// What one build did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    pub kind: BuildKind,
    /// Documents the build considered affected, private ones included.
    pub affected: BTreeSet<DocumentId>,
    /// Documents whose output was written.
    pub rendered: Vec<DocumentId>,
    /// Documents whose source disappeared and whose output was deleted.
    pub removed: Vec<DocumentId>,
    /// Per-document parse, render and write failures.
    pub failures: Vec<PagewrightError>,
    pub bundles: Vec<BundleOutput>,
    /// Set when aggregation failed and the emit pass was skipped.
    pub aggregation_error: Option<PagewrightError>,
    /// Plain files copied into the destination tree.
    pub copied: usize,
}

impl BuildReport {
    fn new(kind: BuildKind) -> Self {
        BuildReport {
            kind,
            ..Default::default()
        }
    }

    pub fn aborted(&self) -> bool {
        self.aggregation_error.is_some()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.aborted()
    }
}

pub struct RebuildPipeline {
    options: BuildOptions,
    engine: Box<dyn TemplateEngine>,
    graph: DependencyGraph,
    registry: SharedRegistry,
    precompiler: Arc<Precompiler>,
    aggregator: AssetAggregator,
    documents: BTreeSet<DocumentId>,
    state: PipelineState,
    started: SystemTime,
}

impl RebuildPipeline {
    pub fn new(
        options: BuildOptions,
        engine: Box<dyn TemplateEngine>,
        shell: Arc<dyn ShellRunner>,
    ) -> Self {
        let precompiler = Arc::new(Precompiler::new(&options, shell));
        let aggregator = AssetAggregator::new(&options, precompiler.clone());
        RebuildPipeline {
            options,
            engine,
            graph: DependencyGraph::new(),
            registry: Arc::new(Mutex::new(AssetRegistry::new())),
            precompiler,
            aggregator,
            documents: BTreeSet::new(),
            state: PipelineState::Idle,
            started: SystemTime::now(),
        }
    }

    /// A pipeline rendering with handlebars and running commands through the system shell.
    pub fn with_defaults(options: BuildOptions) -> Self {
        Self::new(
            options,
            Box::new(HandlebarsEngine::new()),
            Arc::new(SystemShell),
        )
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn documents(&self) -> &BTreeSet<DocumentId> {
        &self.documents
    }

    /// Scan the whole source tree, rebuild the graph and render everything that is out of date.
    pub fn cold_build(&mut self) -> Result<BuildReport, PagewrightError> {
        let mut report = BuildReport::new(BuildKind::Cold);
        self.started = SystemTime::now();
        self.transition(PipelineState::Scanning);
        if let Err(e) = self.prepare_output() {
            self.transition(PipelineState::Idle);
            return Err(e);
        }
        self.registry.lock().reset();

        let skip = [self.options.dest.clone(), self.options.compile_dir.clone()];
        let scan = match scan_tree(
            &self.options.source,
            self.options.document_extensions(),
            &skip,
        ) {
            Ok(scan) => scan,
            Err(e) => {
                self.transition(PipelineState::Idle);
                return Err(e);
            }
        };
        tracing::info!(
            "Found {} documents and {} other files under {:?}",
            scan.documents.len(),
            scan.files.len(),
            self.options.source
        );

        let mut sources = BTreeMap::new();
        for id in scan.documents.iter() {
            match fs::read_to_string(self.source_path(id)) {
                Ok(text) => {
                    if let Err(e) = self.engine.load(id, &text) {
                        tracing::error!("{}", e);
                        report.failures.push(e);
                        self.engine.unload(id);
                    }
                    sources.insert(id.clone(), text);
                }
                Err(e) => {
                    let e = PagewrightError::render_failure(id, e);
                    tracing::error!("{}", e);
                    report.failures.push(e);
                }
            }
        }
        let engine = &self.engine;
        self.graph.load_all(sources.keys(), |id| match sources.get(id) {
            Some(text) => engine.references(text),
            None => Ok(Vec::new()),
        });
        self.documents = sources.into_keys().collect();

        for file in scan.files.iter() {
            let target = self.options.dest.join(file);
            match copy_if_stale(&self.options.source.join(file), &target, self.options.full) {
                Ok(true) => report.copied += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Could not copy {:?}: {}", file, e);
                    report.failures.push(e);
                }
            }
        }

        report.affected = if self.options.full || !self.options.is_debug() {
            self.documents.clone()
        } else {
            self.out_of_date()
        };

        self.render(&mut report);

        // Pages that failed to re-render still link to the previous bundles.
        if !self.options.is_debug() && report.is_clean() {
            let written: BTreeSet<PathBuf> =
                report.bundles.iter().map(|bundle| bundle.path.clone()).collect();
            match remove_stale_bundles(&self.options.compile_dir, &written) {
                Ok(0) => {}
                Ok(n) => tracing::info!("Removed {} old bundle(s)", n),
                Err(e) => tracing::warn!("Could not remove old bundles: {}", e),
            }
        }
        self.finish(&report);
        Ok(report)
    }

    /// Apply one batch of filesystem changes.
    pub fn rebuild(&mut self, batch: &ChangeBatch) -> Result<BuildReport, PagewrightError> {
        let mut report = BuildReport::new(BuildKind::Incremental);
        self.started = SystemTime::now();
        self.transition(PipelineState::Scanning);
        if let Err(e) = self.prepare_output() {
            self.transition(PipelineState::Idle);
            return Err(e);
        }

        for (path, kind) in batch.iter() {
            let Some(relative) = self.relative_source_path(path) else {
                tracing::debug!("Ignoring change outside of the source tree: {:?}", path);
                continue;
            };
            if is_document(&relative, self.options.document_extensions()) {
                let id = DocumentId::from_relative_path(&relative);
                let exists = self.options.source.join(&relative).is_file();
                if *kind == ChangeKind::Removed || !exists {
                    self.remove_document(&id, &mut report);
                } else {
                    self.update_document(&id, &mut report);
                }
            } else {
                self.update_file(&relative, *kind, &mut report);
            }
        }

        for id in report.removed.iter() {
            report.affected.remove(id);
        }
        self.render(&mut report);
        self.finish(&report);
        Ok(report)
    }

    fn prepare_output(&self) -> Result<(), PagewrightError> {
        fs::create_dir_all(&self.options.dest).map_err(|e| {
            PagewrightError::Io(format!(
                "Cannot create output directory {:?}: {}",
                self.options.dest, e
            ))
        })
    }

    /// Re-read one document and fold its new references into the graph.
    fn update_document(&mut self, id: &DocumentId, report: &mut BuildReport) {
        let text = match fs::read_to_string(self.source_path(id)) {
            Ok(text) => text,
            Err(e) => {
                let e = PagewrightError::render_failure(id, e);
                tracing::error!("{}", e);
                report.failures.push(e);
                return;
            }
        };
        // A template that no longer parses must not keep rendering from its previous text.
        if let Err(e) = self.engine.load(id, &text) {
            tracing::error!("{}", e);
            report.failures.push(e);
            self.engine.unload(id);
        }
        let engine = &self.engine;
        self.graph.recompute_one(id, |_| engine.references(&text));
        self.documents.insert(id.clone());
        report.affected.insert(id.clone());
        report.affected.extend(self.graph.affected_by(id));
        tracing::debug!("{} changed", id);
    }

    /// A removed document drops its own references and output; documents that still include
    /// it are rebuilt (and will report the missing include).
    fn remove_document(&mut self, id: &DocumentId, report: &mut BuildReport) {
        if !self.documents.remove(id) {
            return;
        }
        report.affected.extend(self.graph.affected_by(id));
        self.graph.recompute_one(id, |_| Ok(Vec::new()));
        self.engine.unload(id);
        self.registry.lock().forget_document(id);
        if !id.is_private() {
            if let Err(e) = remove_if_exists(&self.output_path(id)) {
                tracing::warn!("Could not delete output of {}: {}", id, e);
            }
        }
        tracing::info!("{} removed", id);
        report.removed.push(id.clone());
    }

    fn update_file(&mut self, relative: &Path, kind: ChangeKind, report: &mut BuildReport) {
        let source = self.options.source.join(relative);
        let target = self.options.dest.join(relative);
        let result = match kind {
            ChangeKind::Changed if source.is_file() => copy_if_stale(&source, &target, true),
            _ if target.is_dir() => Ok(false),
            _ => remove_if_exists(&target),
        };
        match result {
            Ok(true) => report.copied += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::error!("Could not mirror {:?}: {}", relative, e);
                report.failures.push(e);
            }
        }

        if !self.options.is_debug() {
            let asset = crate::document::os_path_to_string(relative);
            let requesters = self.registry.lock().invalidate_asset(&asset);
            if !requesters.is_empty() {
                tracing::info!(
                    "{} changed; rebuilding its bundle for {} document(s)",
                    asset,
                    requesters.len()
                );
                report.affected.extend(requesters);
            }
        }
    }

    /// Documents whose output is older than their own source, and everything they affect.
    /// A private document counts as changed when any of its dependents' output is older.
    fn out_of_date(&self) -> BTreeSet<DocumentId> {
        let mut stale = BTreeSet::new();
        for id in self.documents.iter() {
            let source = self.source_path(id);
            let is_stale = if id.is_private() {
                self.graph
                    .affected_by(id)
                    .iter()
                    .filter(|dependent| !dependent.is_private())
                    .any(|dependent| oracle::is_stale(&source, &self.output_path(dependent)))
            } else {
                oracle::is_stale(&source, &self.output_path(id))
            };
            if is_stale {
                stale.insert(id.clone());
            }
        }
        let mut affected = stale.clone();
        for id in stale.iter() {
            affected.extend(self.graph.affected_by(id));
        }
        affected
    }

    /// Run the render passes for `report.affected`.
    fn render(&mut self, report: &mut BuildReport) {
        let targets: Vec<DocumentId> = report
            .affected
            .iter()
            .filter(|id| self.documents.contains(*id) && !id.is_private())
            .cloned()
            .collect();

        if !self.options.is_debug() {
            self.transition(PipelineState::RenderPass1);
            self.registry.lock().set_phase(RenderPhase::Collect);
            for id in targets.iter() {
                self.registry.lock().begin_document(id);
                if let Err(e) = self.engine.render(id, &self.scope(id)) {
                    tracing::error!("{}", e);
                    report.failures.push(e);
                }
            }

            self.transition(PipelineState::Aggregating);
            if let Err(e) = self.aggregate(report) {
                self.transition(PipelineState::Aborted);
                tracing::error!("{}; skipping output of this build", e);
                report.aggregation_error = Some(e);
                return;
            }
            self.registry.lock().set_phase(RenderPhase::Emit);
        }

        self.transition(PipelineState::RenderPass2);
        for id in targets.iter() {
            self.registry.lock().begin_document(id);
            let rendered = self
                .engine
                .render(id, &self.scope(id))
                .and_then(|html| {
                    if html.contains(PENDING_MARKER) {
                        tracing::warn!("{} still contains unresolved asset declarations", id);
                    }
                    write_atomic(&self.output_path(id), html.as_bytes())
                });
            match rendered {
                Ok(()) => {
                    tracing::debug!("Wrote {}", id);
                    report.rendered.push(id.clone());
                }
                Err(e) => {
                    tracing::error!("{}", e);
                    report.failures.push(e);
                }
            }
        }
        self.registry.lock().set_phase(RenderPhase::Collect);
    }

    fn aggregate(&mut self, report: &mut BuildReport) -> Result<(), PagewrightError> {
        let mut registry = self.registry.lock();
        if !registry.has_unresolved() {
            tracing::debug!("All asset requests are resolved; nothing to aggregate");
            return Ok(());
        }
        let aggregation = self.aggregator.aggregate(&mut registry)?;
        report.bundles.extend(aggregation.bundles.iter().cloned());
        match aggregation.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn finish(&mut self, report: &BuildReport) {
        self.transition(PipelineState::Idle);
        let status = if report.aborted() {
            "aborted"
        } else if report.failures.is_empty() {
            "done"
        } else {
            "done with errors"
        };
        tracing::info!(
            "{:?} build {}: {} affected, {} written, {} removed, {} bundle(s), {} file(s) copied, {} failure(s)",
            report.kind,
            status,
            report.affected.len(),
            report.rendered.len(),
            report.removed.len(),
            report.bundles.len(),
            report.copied,
            report.failures.len()
        );
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::debug!("Pipeline {} -> {}", self.state, next);
        self.state = next;
    }

    fn scope(&self, id: &DocumentId) -> RenderScope {
        let tags = AssetTags::new(self.registry.clone(), id.clone(), self.options.mode)
            .with_precompiler(self.precompiler.clone());
        RenderScope::new(tags, self.started)
    }

    fn source_path(&self, id: &DocumentId) -> PathBuf {
        self.options.source.join(id.to_path())
    }

    fn output_path(&self, id: &DocumentId) -> PathBuf {
        self.options.dest.join(id.to_path())
    }

    /// `path` relative to the source root, or `None` for paths outside of it or inside the
    /// destination tree.
    fn relative_source_path(&self, path: &Path) -> Option<PathBuf> {
        if path.is_absolute()
            && (path.starts_with(&self.options.dest) || path.starts_with(&self.options.compile_dir))
        {
            return None;
        }
        if path.is_relative() {
            return Some(path.to_path_buf());
        }
        path.strip_prefix(&self.options.source)
            .ok()
            .map(Path::to_path_buf)
    }
}

impl BatchHandler for RebuildPipeline {
    fn on_batch(&mut self, batch: ChangeBatch) {
        tracing::info!("Rebuilding after {} change(s)", batch.len());
        match self.rebuild(&batch) {
            Ok(report) => {
                if let Some(e) = report.aggregation_error.as_ref() {
                    tracing::error!("Bundling failed, output not updated: {}", e);
                }
            }
            Err(e) => tracing::error!("Rebuild failed: {}", e),
        }
    }
}
