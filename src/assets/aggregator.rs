use crate::{
    assets::{AssetRegistry, AssetRequest, BundleKey, Category, Precompiler},
    config::{BuildOptions, CommandConfig},
    document::is_document,
    error::PagewrightError,
    output::{copy_if_stale, remove_if_exists, write_atomic},
    shell::run_checked,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

/// Marks bundle file names; everything in the compile dir carrying it is a disposable bundle.
pub const TOKEN_SUFFIX: &str = "_min";

/// A bundle written during an aggregation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleOutput {
    pub key: BundleKey,
    /// Configured (undecorated) bundle name, e.g. `maincompiled.js`.
    pub name: String,
    pub path: PathBuf,
    pub url: String,
    /// Original source paths of the members, in bundle order.
    pub members: Vec<String>,
}

/// A bundle that could not be produced. Nothing was written for it.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleFailure {
    pub key: BundleKey,
    pub name: String,
    pub error: PagewrightError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationReport {
    pub bundles: Vec<BundleOutput>,
    pub failures: Vec<BundleFailure>,
    /// Static files copied next to the style bundles.
    pub mirrored: usize,
}

impl AggregationReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapse the failures into one [`PagewrightError::Aggregation`].
    pub fn error(&self) -> Option<PagewrightError> {
        if self.failures.is_empty() {
            return None;
        }
        let message = self
            .failures
            .iter()
            .map(|f| format!("{} ({}): {}", f.name, f.key, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        Some(PagewrightError::Aggregation(message))
    }
}

/// Turns the requests collected in an [`AssetRegistry`] into minified bundles.
pub struct AssetAggregator {
    source_root: PathBuf,
    compile_dir: PathBuf,
    url_prefix: String,
    assignments: BTreeMap<String, String>,
    commands: CommandConfig,
    document_extensions: Vec<String>,
    precompiler: Arc<Precompiler>,
}

impl AssetAggregator {
    pub fn new(options: &BuildOptions, precompiler: Arc<Precompiler>) -> Self {
        AssetAggregator {
            source_root: options.source.clone(),
            compile_dir: options.compile_dir.clone(),
            url_prefix: options.compiled_url_prefix(),
            assignments: options.project.bundle_assignments(),
            commands: options.project.commands.clone(),
            document_extensions: options.document_extensions().to_vec(),
            precompiler,
        }
    }

    pub fn compile_dir(&self) -> &Path {
        &self.compile_dir
    }

    /// Bundle every key that has an uncompiled request and record the results in the
    /// registry's compiled index.
    ///
    /// Failures are isolated per bundle and returned in the report; only an unusable compile
    /// dir is an error.
    pub fn aggregate(
        &self,
        registry: &mut AssetRegistry,
    ) -> Result<AggregationReport, PagewrightError> {
        fs::create_dir_all(&self.compile_dir)?;
        let mut report = AggregationReport::default();
        let mut style_dirs = BTreeSet::new();

        for (key, requests) in registry.requests_by_key() {
            if requests
                .iter()
                .all(|request| registry.compiled().contains(&request.source))
            {
                tracing::debug!("Bundles for {} are up to date", key);
                continue;
            }
            let token = cache_bust_token();
            for (name, members) in self.partition(key.category, requests) {
                if members
                    .iter()
                    .all(|member| registry.compiled().contains(&member.source))
                {
                    continue;
                }
                match self.write_bundle(key, &name, &members, &token) {
                    Ok(bundle) => {
                        for member in bundle.members.iter() {
                            registry.compiled_mut().insert(member.clone(), bundle.url.clone());
                        }
                        if key.category == Category::Style {
                            style_dirs.extend(members.iter().map(|m| self.source_dir_of(m)));
                        }
                        report.bundles.push(bundle);
                    }
                    Err(error) => {
                        tracing::error!("Could not build bundle {} for {}: {}", name, key, error);
                        report.failures.push(BundleFailure { key, name, error });
                    }
                }
            }
        }

        for dir in style_dirs.iter() {
            report.mirrored += self.mirror_static_dir(dir);
        }
        Ok(report)
    }

    /// Split one key's requests into named bundles, keeping first-seen order.
    fn partition(
        &self,
        category: Category,
        requests: Vec<AssetRequest>,
    ) -> Vec<(String, Vec<AssetRequest>)> {
        let mut bundles: Vec<(String, Vec<AssetRequest>)> = Vec::new();
        for request in requests {
            let name = self
                .assignments
                .get(&request.source)
                .cloned()
                .unwrap_or_else(|| category.default_bundle_name());
            match bundles.iter_mut().find(|(existing, _)| *existing == name) {
                Some((_, members)) => members.push(request),
                None => bundles.push((name, vec![request])),
            }
        }
        bundles
    }

    fn write_bundle(
        &self,
        key: BundleKey,
        name: &str,
        members: &[AssetRequest],
        token: &str,
    ) -> Result<BundleOutput, PagewrightError> {
        let mut paths = Vec::with_capacity(members.len());
        for member in members.iter() {
            if member.kind.is_precompiled() {
                paths.push(self.precompiler.ensure(member.kind, &member.source)?);
            } else {
                paths.push(self.precompiler.member_path(member));
            }
        }

        let minified = self.minify(key.category, &paths)?;
        let file_name = decorate(name, token);
        let path = self.compile_dir.join(&file_name);
        write_atomic(&path, &minified)?;
        tracing::info!("Compiled {:?} from {} file(s)", path, members.len());

        Ok(BundleOutput {
            key,
            name: name.to_string(),
            path,
            url: format!("{}/{}", self.url_prefix, file_name),
            members: members.iter().map(|m| m.source.clone()).collect(),
        })
    }

    /// Run the category's minifier over the members. A single member is handed over as is;
    /// several are concatenated into a temporary file first.
    fn minify(&self, category: Category, members: &[PathBuf]) -> Result<Vec<u8>, PagewrightError> {
        let template = self.commands.for_kind(category.base_kind());
        let mut combined = None;
        let input = match members {
            [single] => single.clone(),
            _ => {
                let separator: &[u8] = match category {
                    Category::Script => b"\n;\n",
                    Category::Style => b"\n",
                };
                let mut temp = tempfile::Builder::new()
                    .prefix("pagewright")
                    .suffix(&format!(".{}", category.extension()))
                    .tempfile()?;
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        temp.write_all(separator)?;
                    }
                    temp.write_all(&fs::read(member)?)?;
                }
                temp.flush()?;
                let path = temp.path().to_path_buf();
                combined = Some(temp);
                path
            }
        };

        let stdin = if template.takes_input_path() {
            None
        } else {
            Some(fs::read(&input)?)
        };
        let command = template.expand(Some(&input), None);
        let minified = run_checked(self.precompiler.shell(), &command, stdin.as_deref());
        drop(combined);
        minified
    }

    fn source_dir_of(&self, request: &AssetRequest) -> PathBuf {
        match Path::new(&request.source).parent() {
            Some(dir) => self.source_root.join(dir),
            None => self.source_root.clone(),
        }
    }

    /// Copy the non-document files under `dir` into the compile dir so that relative
    /// references from a style bundle keep resolving.
    fn mirror_static_dir(&self, dir: &Path) -> usize {
        fn is_hidden(entry: &DirEntry) -> bool {
            entry
                .file_name()
                .to_str()
                .map(|s| s.starts_with('.'))
                .unwrap_or(false)
        }

        let mut copied = 0;
        let walker = WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| {
                e.path() == dir || (!is_hidden(e) && !e.path().starts_with(&self.compile_dir))
            });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry under {:?}: {}", dir, e);
                    continue;
                }
            };
            if !entry.file_type().is_file()
                || is_document(entry.path(), &self.document_extensions)
            {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let target = self.compile_dir.join(relative);
            match copy_if_stale(entry.path(), &target, false) {
                Ok(true) => copied += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Could not mirror {:?}: {}", entry.path(), e),
            }
        }
        copied
    }
}

/// A fresh token for bundle file names.
pub fn cache_bust_token() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}{}", &id[..10], TOKEN_SUFFIX)
}

/// `maincompiled.js` + token -> `maincompiled-<token>.js`.
pub fn decorate(name: &str, token: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{token}.{ext}"),
        _ => format!("{name}-{token}"),
    }
}

/// Delete bundle files left over from earlier passes, sparing the ones in `keep`. Returns how
/// many were removed.
pub fn remove_stale_bundles(
    compile_dir: &Path,
    keep: &BTreeSet<PathBuf>,
) -> Result<usize, PagewrightError> {
    if !compile_dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(compile_dir)? {
        let entry = entry?;
        let is_bundle = entry.file_name().to_string_lossy().contains(TOKEN_SUFFIX);
        if !is_bundle || keep.contains(&entry.path()) || !entry.file_type()?.is_file() {
            continue;
        }
        if remove_if_exists(&entry.path())? {
            tracing::debug!("Removed old bundle {:?}", entry.path());
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assets::{AssetKind, Placement, RenderPhase},
        document::DocumentId,
        shell::CommandTemplate,
        tests::helpers::ScriptedShell,
    };
    use tempfile::TempDir;
    use test_log::test;

    struct Fixture {
        dir: TempDir,
        options: BuildOptions,
        shell: Arc<ScriptedShell>,
    }

    impl Fixture {
        fn new(shell: ScriptedShell) -> Self {
            let dir = TempDir::new().unwrap();
            let mut options = BuildOptions::new(dir.path().join("src"), dir.path().join("out"));
            // Stdin-only commands: the scripted shell echoes stdin back as the "minified" output.
            options.project.commands.script = CommandTemplate::new("minjs");
            options.project.commands.style = CommandTemplate::new("mincss");
            options.project.commands.less = CommandTemplate::new("lessc {input}");
            Fixture {
                dir,
                options,
                shell: Arc::new(shell),
            }
        }

        fn write(&self, relative: &str, contents: &str) {
            let path = self.options.source.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }

        fn aggregator(&self) -> AssetAggregator {
            let precompiler = Arc::new(Precompiler::new(&self.options, self.shell.clone()));
            AssetAggregator::new(&self.options, precompiler)
        }
    }

    fn request(registry: &mut AssetRegistry, doc: &str, kind: AssetKind, source: &str) {
        registry.request(
            &DocumentId::new(doc),
            AssetRequest::new(kind, source),
            Placement::Body,
        );
    }

    #[test]
    fn test_shared_asset_is_bundled_once() {
        let fixture = Fixture::new(ScriptedShell::default());
        fixture.write("js/app.js", "var app;");
        let mut registry = AssetRegistry::new();
        request(&mut registry, "a.html", AssetKind::Script, "js/app.js");
        request(&mut registry, "b.html", AssetKind::Script, "/js/app.js");

        let report = fixture.aggregator().aggregate(&mut registry).unwrap();
        assert!(report.is_success());
        assert_eq!(report.bundles.len(), 1);
        let bundle = &report.bundles[0];
        assert_eq!(bundle.members, vec!["js/app.js".to_string()]);
        assert_eq!(fs::read_to_string(&bundle.path).unwrap(), "var app;");
        assert!(bundle.url.starts_with("/compiled/maincompiled-"));
        assert!(bundle.url.ends_with("_min.js"));

        registry.set_phase(RenderPhase::Emit);
        for doc in ["a.html", "b.html"] {
            assert_eq!(
                registry.resolved(&DocumentId::new(doc), Category::Script, Placement::Body),
                Some(vec![bundle.url.clone()])
            );
        }
        assert!(!registry.has_unresolved());
    }

    #[test]
    fn test_members_are_concatenated_and_partitioned_by_map() {
        let mut fixture = Fixture::new(ScriptedShell::default());
        fixture
            .options
            .project
            .map
            .insert("vendor.js".to_string(), vec!["/js/lib.js".to_string()]);
        fixture.write("js/lib.js", "lib()");
        fixture.write("js/one.js", "one()");
        fixture.write("js/two.js", "two()");
        let mut registry = AssetRegistry::new();
        request(&mut registry, "a.html", AssetKind::Script, "js/one.js");
        request(&mut registry, "a.html", AssetKind::Script, "js/lib.js");
        request(&mut registry, "a.html", AssetKind::Script, "js/two.js");

        let report = fixture.aggregator().aggregate(&mut registry).unwrap();
        assert_eq!(report.bundles.len(), 2);
        let main = &report.bundles[0];
        assert_eq!(main.name, "maincompiled.js");
        assert_eq!(fs::read_to_string(&main.path).unwrap(), "one()\n;\ntwo()");
        let vendor = &report.bundles[1];
        assert_eq!(vendor.name, "vendor.js");
        assert_eq!(vendor.members, vec!["js/lib.js".to_string()]);

        let urls = registry
            .resolved(&DocumentId::new("a.html"), Category::Script, Placement::Body)
            .unwrap();
        assert_eq!(urls, vec![main.url.clone(), vendor.url.clone()]);
    }

    #[test]
    fn test_precompile_failure_is_isolated_to_its_bundle() {
        let fixture = Fixture::new(ScriptedShell::default().fail("lessc", 1, "bad less"));
        fixture.write("css/site.less", "@x: {");
        fixture.write("js/app.js", "app()");
        let mut registry = AssetRegistry::new();
        request(&mut registry, "a.html", AssetKind::Less, "css/site.less");
        request(&mut registry, "a.html", AssetKind::Script, "js/app.js");

        let aggregator = fixture.aggregator();
        let report = aggregator.aggregate(&mut registry).unwrap();
        assert_eq!(report.bundles.len(), 1);
        assert_eq!(report.bundles[0].key.category, Category::Script);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key.category, Category::Style);
        assert!(matches!(report.error(), Some(PagewrightError::Aggregation(_))));

        let css_bundles = fs::read_dir(aggregator.compile_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".css"))
            .count();
        assert_eq!(css_bundles, 0);
        assert!(registry.has_unresolved());
    }

    #[test]
    fn test_style_dirs_are_mirrored() {
        let fixture = Fixture::new(ScriptedShell::default());
        fixture.write("css/site.css", "body{background:url(img/bg.png)}");
        fixture.write("css/img/bg.png", "png");
        fixture.write("css/.hidden", "x");
        fixture.write("css/snippet.html", "<p>");
        let mut registry = AssetRegistry::new();
        request(&mut registry, "a.html", AssetKind::Style, "css/site.css");

        let aggregator = fixture.aggregator();
        let report = aggregator.aggregate(&mut registry).unwrap();
        let compiled = aggregator.compile_dir();
        assert_eq!(fs::read_to_string(compiled.join("img/bg.png")).unwrap(), "png");
        assert!(!compiled.join(".hidden").exists());
        assert!(!compiled.join("snippet.html").exists());
        assert_eq!(report.mirrored, 2);

        // Nothing left to do on a second pass.
        let again = aggregator.aggregate(&mut registry).unwrap();
        assert!(again.bundles.is_empty());
    }

    #[test]
    fn test_remove_stale_bundles() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("maincompiled-abc_min.js"), "").unwrap();
        fs::write(dir.path().join("maincompiled-def_min.js"), "").unwrap();
        fs::write(dir.path().join("keep.png"), "").unwrap();
        let fresh: BTreeSet<PathBuf> = [dir.path().join("maincompiled-def_min.js")].into();
        assert_eq!(remove_stale_bundles(dir.path(), &fresh).unwrap(), 1);
        assert!(!dir.path().join("maincompiled-abc_min.js").exists());
        assert!(dir.path().join("maincompiled-def_min.js").exists());
        assert!(dir.path().join("keep.png").exists());
        assert_eq!(
            remove_stale_bundles(&dir.path().join("missing"), &BTreeSet::new()).unwrap(),
            0
        );
    }

    #[test]
    fn test_decorate_and_token() {
        assert_eq!(decorate("maincompiled.js", "t_min"), "maincompiled-t_min.js");
        assert_eq!(decorate("bundle", "t_min"), "bundle-t_min");
        let token = cache_bust_token();
        assert_eq!(token.len(), 10 + TOKEN_SUFFIX.len());
        assert_ne!(token, cache_bust_token());
    }
}
