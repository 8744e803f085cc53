//! Asset declaration, collection and bundling.
//!
//! Documents declare the scripts and stylesheets they need through tag helpers while they are
//! rendered. Rendering happens in two passes:
//!
//! 1. **Collect**: every affected document is rendered and its output discarded. Each declared
//!    asset is recorded in the [`AssetRegistry`](registry::AssetRegistry) under the document and
//!    its [`BundleKey`]; the helper returns a placeholder.
//! 2. **Emit**: after the [`AssetAggregator`](aggregator::AssetAggregator) has written the bundles
//!    and filled the [`CompiledIndex`](registry::CompiledIndex), documents are rendered again and
//!    the first helper call per bundle key emits the links to every bundle the document needs.
//!
//! In debug mode neither the registry nor the aggregator is involved: helpers link the original
//! source files directly.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

pub mod aggregator;
pub mod precompile;
pub mod registry;
pub mod tags;

pub use aggregator::{AggregationReport, AssetAggregator, BundleFailure, BundleOutput};
pub use precompile::Precompiler;
pub use registry::{AssetRegistry, AssetRequest, CompiledIndex, RenderPhase, Requested};
pub use tags::{AssetTag, AssetTags, SharedRegistry};

/// Marker returned by asset helpers while requests are still being collected.
pub const PENDING_MARKER: &str = "<!-- pagewright:pending-asset -->";

/// What a document can declare. `Less` and `Coffee` are pre-compiled into a base kind before
/// they are bundled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Script,
    Style,
    Less,
    Coffee,
}

impl AssetKind {
    pub const ALL: [AssetKind; 4] = [
        AssetKind::Script,
        AssetKind::Style,
        AssetKind::Less,
        AssetKind::Coffee,
    ];

    /// The bundle category this kind ends up in.
    pub fn category(self) -> Category {
        match self {
            AssetKind::Script | AssetKind::Coffee => Category::Script,
            AssetKind::Style | AssetKind::Less => Category::Style,
        }
    }

    pub fn is_precompiled(self) -> bool {
        matches!(self, AssetKind::Less | AssetKind::Coffee)
    }

    pub fn mime(self) -> &'static str {
        match self {
            AssetKind::Script => "text/javascript",
            AssetKind::Style => "text/css",
            AssetKind::Less => "text/less",
            AssetKind::Coffee => "text/coffeescript",
        }
    }

    /// Name of the template helper that declares this kind.
    pub fn helper_name(self) -> &'static str {
        match self {
            AssetKind::Script => "script",
            AssetKind::Style => "style",
            AssetKind::Less => "less",
            AssetKind::Coffee => "coffee",
        }
    }

    /// Render a link to `url` as this kind's HTML tag.
    pub fn markup(self, url: &str, attrs: &AssetAttrs) -> String {
        let url = escape_attr(url);
        match self {
            AssetKind::Script | AssetKind::Coffee => {
                format!("<script src=\"{url}\"{attrs}></script>")
            }
            AssetKind::Style => format!("<link rel=\"stylesheet\" href=\"{url}\"{attrs}>"),
            AssetKind::Less => format!("<link rel=\"stylesheet/less\" href=\"{url}\"{attrs}>"),
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.helper_name())
    }
}

/// Bundle category: what a bundle file contains once everything is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Script,
    Style,
}

impl Category {
    pub fn extension(self) -> &'static str {
        match self {
            Category::Script => "js",
            Category::Style => "css",
        }
    }

    /// The non pre-compiled kind whose minifier and markup the category uses.
    pub fn base_kind(self) -> AssetKind {
        match self {
            Category::Script => AssetKind::Script,
            Category::Style => AssetKind::Style,
        }
    }

    pub fn default_bundle_name(self) -> String {
        format!("maincompiled.{}", self.extension())
    }
}

/// Where in the page a declared asset belongs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Placement {
    Head,
    #[default]
    Body,
}

impl Placement {
    pub fn from_head_flag(head: bool) -> Self {
        if head {
            Placement::Head
        } else {
            Placement::Body
        }
    }
}

/// Requests sharing a key are aggregated together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BundleKey {
    pub category: Category,
    pub placement: Placement,
}

impl BundleKey {
    pub fn new(category: Category, placement: Placement) -> Self {
        BundleKey {
            category,
            placement,
        }
    }
}

impl fmt::Display for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.category, self.placement)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrValue {
    Text(String),
    Flag(bool),
}

/// Extra HTML attributes of a declared asset, rendered in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAttrs(pub BTreeMap<String, AttrValue>);

impl AssetAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: AttrValue) {
        self.0.insert(key.into(), value);
    }

    /// Set `key` only if the caller did not provide it.
    pub fn set_default(&mut self, key: &str, value: AttrValue) {
        self.0.entry(key.to_string()).or_insert(value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AssetAttrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.0.iter() {
            match value {
                AttrValue::Text(text) => write!(f, " {}=\"{}\"", key, escape_attr(text))?,
                AttrValue::Flag(true) => write!(f, " {key}")?,
                AttrValue::Flag(false) => {}
            }
        }
        Ok(())
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_categories() {
        assert_eq!(AssetKind::Less.category(), Category::Style);
        assert_eq!(AssetKind::Coffee.category(), Category::Script);
        assert!(AssetKind::Coffee.is_precompiled());
        assert!(!AssetKind::Style.is_precompiled());
        assert_eq!(Category::Script.default_bundle_name(), "maincompiled.js");
    }

    #[test]
    fn test_markup() {
        let attrs = AssetAttrs::new()
            .with("type", AttrValue::Text("text/javascript".into()))
            .with("async", AttrValue::Flag(true))
            .with("defer", AttrValue::Flag(false));
        assert_eq!(
            AssetKind::Script.markup("/js/app.js", &attrs),
            r#"<script src="/js/app.js" async type="text/javascript"></script>"#
        );
        assert_eq!(
            AssetKind::Less.markup("css/site.less", &AssetAttrs::new()),
            r#"<link rel="stylesheet/less" href="css/site.less">"#
        );
        let quoted = AssetAttrs::new().with("title", AttrValue::Text("a \"b\"".into()));
        assert_eq!(
            AssetKind::Style.markup("x.css", &quoted),
            r#"<link rel="stylesheet" href="x.css" title="a &quot;b&quot;">"#
        );
    }
}
