//! Translation of derived asset languages (less, coffee) into their base category.
//!
//! Each translated file is cached under the pre-compile cache directory, content-addressed by
//! a hash of its source path, and only regenerated when the source is newer.

use crate::{
    assets::{AssetKind, AssetRequest},
    config::{BuildOptions, CommandConfig, PrecompileConfig, PrecompileMode},
    error::PagewrightError,
    oracle,
    output::write_atomic,
    shell::{run_checked, ShellRunner},
};
use sha2::{Digest, Sha256};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Name of the cache directory inside the compile dir.
pub const CACHE_DIR_NAME: &str = ".precompiled";

pub struct Precompiler {
    source_root: PathBuf,
    cache_dir: PathBuf,
    commands: CommandConfig,
    modes: PrecompileConfig,
    shell: Arc<dyn ShellRunner>,
}

impl Precompiler {
    pub fn new(options: &BuildOptions, shell: Arc<dyn ShellRunner>) -> Self {
        Precompiler {
            source_root: options.source.clone(),
            cache_dir: options.compile_dir.join(CACHE_DIR_NAME),
            commands: options.project.commands.clone(),
            modes: options.project.precompile.clone(),
            shell,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn shell(&self) -> &dyn ShellRunner {
        self.shell.as_ref()
    }

    pub fn mode(&self, kind: AssetKind) -> Option<PrecompileMode> {
        self.modes.mode(kind)
    }

    /// Location of the translated file for `source`:
    /// `<cache>/<source dir>/compiled-<hash>.<ext>`.
    pub fn intermediate_path(&self, kind: AssetKind, source: &str) -> PathBuf {
        let source = source.trim_start_matches('/');
        let digest = hex::encode(Sha256::digest(source.as_bytes()));
        let file_name = format!("compiled-{}.{}", &digest[..16], kind.category().extension());
        let mut path = self.cache_dir.clone();
        if let Some((dir, _)) = source.rsplit_once('/') {
            path.extend(dir.split('/'));
        }
        path.join(file_name)
    }

    /// The file whose contents go into a bundle for `request`.
    pub fn member_path(&self, request: &AssetRequest) -> PathBuf {
        if request.kind.is_precompiled() {
            self.intermediate_path(request.kind, &request.source)
        } else {
            self.source_root.join(&request.source)
        }
    }

    /// Translate `source` now, unless its cached translation is up to date.
    pub fn ensure(&self, kind: AssetKind, source: &str) -> Result<PathBuf, PagewrightError> {
        let target = self.intermediate_path(kind, source);
        if !kind.is_precompiled() {
            return Err(PagewrightError::Custom(format!(
                "{kind} assets are not pre-compiled ({source})"
            )));
        }
        let input = self.source_root.join(source.trim_start_matches('/'));
        if !input.is_file() {
            return Err(PagewrightError::NotFound(format!(
                "{kind} source {input:?} does not exist"
            )));
        }
        if !oracle::is_stale(&input, &target) {
            tracing::debug!("{:?} is up to date", target);
            return Ok(target);
        }

        tracing::info!("Pre-compiling {:?} -> {:?}", input, target);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let template = self.commands.for_kind(kind);
        let stdin = if template.takes_input_path() {
            None
        } else {
            Some(fs::read(&input)?)
        };
        if template.writes_output_path() {
            let command = template.expand(Some(&input), Some(&target));
            run_checked(self.shell(), &command, stdin.as_deref())?;
        } else {
            let command = template.expand(Some(&input), None);
            let translated = run_checked(self.shell(), &command, stdin.as_deref())?;
            write_atomic(&target, &translated)?;
        }
        Ok(target)
    }

    /// Translate `source` if its kind is configured for on-demand pre-compilation.
    pub fn ensure_on_demand(
        &self,
        kind: AssetKind,
        source: &str,
    ) -> Result<Option<PathBuf>, PagewrightError> {
        match self.mode(kind) {
            Some(PrecompileMode::OnDemand) => self.ensure(kind, source).map(Some),
            _ => Ok(None),
        }
    }
}
