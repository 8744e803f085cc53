use crate::{assets::AssetKind, error::PagewrightError, shell::CommandTemplate};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::read_to_string,
    path::{Path, PathBuf},
    time::Duration,
};

/// Default name of the project configuration file, looked up relative to the working directory.
pub const CONFIG_FILE_NAME: &str = "pagewright.toml";

/// When a pre-compiled asset (less, coffee) is translated into its base language.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrecompileMode {
    /// Translate as soon as a document declares the asset, while collecting requests.
    #[default]
    OnDemand,
    /// Translate every pending asset right before bundling.
    Batch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub script: CommandTemplate,
    pub style: CommandTemplate,
    pub less: CommandTemplate,
    pub coffee: CommandTemplate,
}

impl Default for CommandConfig {
    fn default() -> Self {
        CommandConfig {
            script: CommandTemplate::new("uglifyjs {input}"),
            style: CommandTemplate::new("uglifycss {input}"),
            less: CommandTemplate::new("lessc {input}"),
            coffee: CommandTemplate::new("coffee --join {output} -c {input}"),
        }
    }
}

impl CommandConfig {
    /// The minifier (for base kinds) or translator (for pre-compiled kinds) of `kind`.
    pub fn for_kind(&self, kind: AssetKind) -> &CommandTemplate {
        match kind {
            AssetKind::Script => &self.script,
            AssetKind::Style => &self.style,
            AssetKind::Less => &self.less,
            AssetKind::Coffee => &self.coffee,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecompileConfig {
    pub less: PrecompileMode,
    pub coffee: PrecompileMode,
}

impl PrecompileConfig {
    pub fn mode(&self, kind: AssetKind) -> Option<PrecompileMode> {
        match kind {
            AssetKind::Less => Some(self.less),
            AssetKind::Coffee => Some(self.coffee),
            AssetKind::Script | AssetKind::Style => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// File extensions (without the dot) that identify template documents.
    pub extensions: Vec<String>,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        DocumentConfig {
            extensions: vec!["html".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub quiet_period_ms: u64,
    /// Glob patterns, matched against source-relative paths, whose events are ignored.
    pub exclude: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            quiet_period_ms: 100,
            exclude: Vec::new(),
        }
    }
}

impl WatchConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn exclude_set(&self) -> Result<GlobSet, PagewrightError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in self.exclude.iter() {
            builder.add(Glob::new(pattern)?);
        }
        Ok(builder.build()?)
    }
}

/// Project settings read from `pagewright.toml` (or a YAML file with the same shape).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Bundle file name -> asset paths aggregated into it. Assets not listed here go to the
    /// default bundle of their category.
    pub map: BTreeMap<String, Vec<String>>,
    pub commands: CommandConfig,
    pub precompile: PrecompileConfig,
    pub documents: DocumentConfig,
    pub watch: WatchConfig,
}

impl ProjectConfig {
    /// Read a configuration file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PagewrightError> {
        let path = path.as_ref();
        tracing::debug!("Attempting to read configuration from: {:?}", path);
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(ProjectConfig::default());
        }
        let content = read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yml") | Some("yaml") => Self::from_yaml(&content),
            _ => Self::from_toml(&content),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, PagewrightError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_yaml(content: &str) -> Result<Self, PagewrightError> {
        if content.trim().is_empty() {
            return Ok(ProjectConfig::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Invert [`ProjectConfig::map`] into asset path -> bundle name.
    pub fn bundle_assignments(&self) -> BTreeMap<String, String> {
        let mut assignments = BTreeMap::new();
        for (bundle, assets) in self.map.iter() {
            for asset in assets.iter() {
                let asset = asset.trim_start_matches('/').to_string();
                if let Some(previous) = assignments.insert(asset.clone(), bundle.clone()) {
                    tracing::warn!(
                        "Asset {} is mapped to both {} and {}; using {}",
                        asset,
                        previous,
                        bundle,
                        bundle
                    );
                }
            }
        }
        assignments
    }
}

/// Whether pages link to every source asset directly or to aggregated bundles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildMode {
    #[default]
    Debug,
    Production,
}

/// Runtime options of one pipeline instance.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    pub source: PathBuf,
    pub dest: PathBuf,
    /// Where bundles are written. Defaults to `<dest>/compiled`.
    pub compile_dir: PathBuf,
    pub mode: BuildMode,
    /// Ignore timestamps and rebuild everything on a cold build.
    pub full: bool,
    pub project: ProjectConfig,
}

impl BuildOptions {
    pub fn new(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        let dest = dest.into();
        BuildOptions {
            source: source.into(),
            compile_dir: dest.join("compiled"),
            dest,
            mode: BuildMode::Debug,
            full: false,
            project: ProjectConfig::default(),
        }
    }

    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_full(mut self, full: bool) -> Self {
        self.full = full;
        self
    }

    pub fn with_compile_dir(mut self, compile_dir: impl Into<PathBuf>) -> Self {
        self.compile_dir = compile_dir.into();
        self
    }

    pub fn with_project(mut self, project: ProjectConfig) -> Self {
        self.project = project;
        self
    }

    pub fn is_debug(&self) -> bool {
        self.mode == BuildMode::Debug
    }

    pub fn document_extensions(&self) -> &[String] {
        &self.project.documents.extensions
    }

    /// URL prefix under which bundles are served, derived from the compile dir's position
    /// inside the destination tree (`/compiled` by default).
    pub fn compiled_url_prefix(&self) -> String {
        match self.compile_dir.strip_prefix(&self.dest) {
            Ok(relative) => {
                let relative = crate::document::os_path_to_string(relative);
                if relative.is_empty() {
                    String::new()
                } else {
                    format!("/{relative}")
                }
            }
            Err(_) => {
                tracing::warn!(
                    "Compile dir {:?} is outside of destination {:?}; bundle links use its file path",
                    self.compile_dir,
                    self.dest
                );
                self.compile_dir.to_string_lossy().trim_end_matches('/').to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_log::test;

    #[test]
    fn test_defaults() {
        let config = ProjectConfig::default();
        assert_eq!(config.documents.extensions, vec!["html".to_string()]);
        assert_eq!(config.watch.quiet_period(), Duration::from_millis(100));
        assert_eq!(config.precompile.mode(AssetKind::Less), Some(PrecompileMode::OnDemand));
        assert_eq!(config.precompile.mode(AssetKind::Script), None);
        assert!(config.commands.for_kind(AssetKind::Coffee).writes_output_path());
    }

    #[test]
    fn test_toml_config() {
        let config = ProjectConfig::from_toml(
            r#"
[map]
"vendor.js" = ["/js/jquery.js", "js/underscore.js"]

[commands]
script = "cat"

[precompile]
coffee = "batch"

[watch]
quiet_period_ms = 250
exclude = ["*.swp"]
"#,
        )
        .unwrap();
        let assignments = config.bundle_assignments();
        assert_eq!(assignments.get("js/jquery.js").map(String::as_str), Some("vendor.js"));
        assert_eq!(assignments.get("js/underscore.js").map(String::as_str), Some("vendor.js"));
        assert_eq!(config.commands.script, CommandTemplate::new("cat"));
        assert_eq!(config.commands.style, CommandConfig::default().style);
        assert_eq!(config.precompile.coffee, PrecompileMode::Batch);
        assert_eq!(config.watch.quiet_period(), Duration::from_millis(250));
        assert!(config.watch.exclude_set().unwrap().is_match("notes.swp"));
    }

    #[test]
    fn test_yaml_config_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let yaml = dir.path().join("config.yml");
        std::fs::write(&yaml, "map:\n  site.css:\n    - css/a.css\n    - css/b.css\n").unwrap();
        let config = ProjectConfig::load(&yaml).unwrap();
        assert_eq!(config.map.get("site.css").map(Vec::len), Some(2));

        let missing = ProjectConfig::load(dir.path().join("nope.toml")).unwrap();
        assert_eq!(missing, ProjectConfig::default());
    }

    #[test]
    fn test_compiled_url_prefix() {
        let options = BuildOptions::new("/src", "/site");
        assert_eq!(options.compiled_url_prefix(), "/compiled");
        let options = options.with_compile_dir("/site/static/bundles");
        assert_eq!(options.compiled_url_prefix(), "/static/bundles");
    }
}
