//! # pagewright
//!
//! An incremental static site builder. Pagewright renders a tree of template documents into an
//! output tree, tracks which documents include which, and rebuilds only what a change affects.
//!
//! ## Overview
//!
//! A source tree holds three kinds of files:
//!
//! - **Documents** (by default `*.html`, see `documents.extensions`) are templates rendered
//!   into the output tree under the same relative path.
//! - **Private documents** are documents whose file name starts with `_`. They are layouts and
//!   partials: included by other documents, never written themselves.
//! - **Everything else** (scripts, stylesheets, images) is copied verbatim.
//!
//! ## Architecture
//!
//! - **[`document`]**: Document identities and the source tree scan
//! - **[`graph`]**: Include relationships between documents (`DependencyGraph`)
//! - **[`oracle`]**: Timestamp based staleness checks
//! - **[`template`]**: The `TemplateEngine` seam and its `handlebars` implementation
//! - **[`assets`]**: Asset declarations, the two-pass registry, precompilation and bundling
//! - **[`pipeline`]**: Cold and incremental builds (`RebuildPipeline`)
//! - **[`watch`]**: The debounce scheduler feeding the pipeline from filesystem events
//!
//! ## Build modes
//!
//! In debug mode every asset declaration renders a direct link to its source. In production mode
//! documents are rendered twice: the first pass collects asset declarations, the registered
//! assets are concatenated and minified into cache-busted bundles, and the second pass links the
//! bundles.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pagewright::{
//!     config::{BuildMode, BuildOptions, ProjectConfig},
//!     pipeline::RebuildPipeline,
//! };
//!
//! fn main() -> Result<(), pagewright::PagewrightError> {
//!     let project = ProjectConfig::load("site/pagewright.toml")?;
//!     let options = BuildOptions::new("site", "public")
//!         .with_mode(BuildMode::Production)
//!         .with_project(project);
//!     let mut pipeline = RebuildPipeline::with_defaults(options);
//!     let report = pipeline.cold_build()?;
//!     println!("{} rendered, {} failed", report.rendered.len(), report.failures.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - **`service`**: The `notify` based watcher ([`watch::WatchService`])
//! - **`bin`**: The `pagewright` command line tool

pub mod assets;
pub mod config;
pub mod document;
pub mod error;
pub mod graph;
pub mod oracle;
pub mod output;
pub mod pipeline;
pub mod shell;
pub mod template;
#[cfg(test)]
mod tests;
pub mod watch;

pub use error::*;
