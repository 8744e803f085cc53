//! [`TemplateEngine`] backed by the `handlebars` crate.
//!
//! Every document is registered as a template under its identity, so documents include each
//! other with `{{> _layout.html}}` or `{{#> _base.html}}...{{/_base.html}}`. Documents declare
//! assets with the `script`, `style`, `less` and `coffee` helpers:
//!
//! ```text
//! {{style "css/site.less" head=true}}
//! {{script "js/app.js" async=true}}
//! {{script "js/debug-panel.js" debug=true}}
//! ```
//!
//! `env "NAME"` prints an environment variable and `now` the build time in Unix seconds.

use crate::{
    assets::{AssetKind, AssetTag, AttrValue},
    document::DocumentId,
    error::PagewrightError,
    template::{RenderScope, TemplateEngine},
};
use ::handlebars::{
    no_escape, Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
    RenderError, RenderErrorReason,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;

/// `{{> name}}`, `{{#> name}}`, with optional whitespace control and quoting. Dynamic partials
/// (`{{> (lookup ...)}}`) cannot be resolved statically and are not matched.
static PARTIAL_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\{\{~?#?>\s*(?:"([^"]+)"|'([^']+)'|\[([^\]]+)\]|([^\s()}~"'\[]+))"#,
    )
    .expect("partial reference pattern is valid")
});

type ScopeSlot = Arc<Mutex<Option<RenderScope>>>;

pub struct HandlebarsEngine {
    registry: Handlebars<'static>,
    scope: ScopeSlot,
}

impl Default for HandlebarsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlebarsEngine {
    pub fn new() -> Self {
        let scope: ScopeSlot = Arc::new(Mutex::new(None));
        let mut registry = Handlebars::new();
        registry.register_escape_fn(no_escape);
        for kind in AssetKind::ALL {
            registry.register_helper(
                kind.helper_name(),
                Box::new(AssetHelper {
                    kind,
                    scope: scope.clone(),
                }),
            );
        }
        registry.register_helper("env", Box::new(EnvHelper(scope.clone())));
        registry.register_helper("now", Box::new(NowHelper(scope.clone())));
        HandlebarsEngine { registry, scope }
    }
}

impl TemplateEngine for HandlebarsEngine {
    fn references(&self, source: &str) -> Result<Vec<DocumentId>, PagewrightError> {
        let mut found: Vec<DocumentId> = Vec::new();
        for captures in PARTIAL_REFERENCE.captures_iter(source) {
            let Some(name) = (1..=4).find_map(|i| captures.get(i)) else {
                continue;
            };
            let id = DocumentId::new(name.as_str());
            if !found.contains(&id) {
                found.push(id);
            }
        }
        Ok(found)
    }

    fn load(&mut self, id: &DocumentId, source: &str) -> Result<(), PagewrightError> {
        self.registry
            .register_template_string(id.as_str(), source)
            .map_err(|e| PagewrightError::parse_failure(id, e))
    }

    fn unload(&mut self, id: &DocumentId) {
        self.registry.unregister_template(id.as_str());
    }

    fn render(&self, id: &DocumentId, scope: &RenderScope) -> Result<String, PagewrightError> {
        let data = json!({
            "document": id.as_str(),
            "now": scope.now(),
        });
        *self.scope.lock() = Some(scope.clone());
        let rendered = self.registry.render(id.as_str(), &data);
        *self.scope.lock() = None;
        rendered.map_err(|e| PagewrightError::render_failure(id, e))
    }
}

fn current_scope(slot: &ScopeSlot) -> Result<RenderScope, RenderError> {
    slot.lock().clone().ok_or_else(|| {
        RenderErrorReason::Other("helper called outside of a document render".to_string()).into()
    })
}

struct AssetHelper {
    kind: AssetKind,
    scope: ScopeSlot,
}

impl HelperDef for AssetHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let source = h
            .param(0)
            .and_then(|p| p.value().as_str())
            .ok_or(RenderErrorReason::ParamNotFoundForIndex(
                self.kind.helper_name(),
                0,
            ))?;
        let mut tag = AssetTag::new(self.kind, source);
        for (key, value) in h.hash().iter() {
            let value = value.value();
            match *key {
                "head" => tag = tag.in_head(is_truthy(value)),
                "debug" => tag = tag.debug_only(is_truthy(value)),
                _ => tag = tag.attr(*key, attr_value(value)),
            }
        }
        let scope = current_scope(&self.scope)?;
        out.write(&scope.assets.declare(&tag))?;
        Ok(())
    }
}

struct EnvHelper(ScopeSlot);

impl HelperDef for EnvHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let key = h
            .param(0)
            .and_then(|p| p.value().as_str())
            .ok_or(RenderErrorReason::ParamNotFoundForIndex("env", 0))?;
        let scope = current_scope(&self.0)?;
        out.write(&scope.env_var(key).unwrap_or_default())?;
        Ok(())
    }
}

struct NowHelper(ScopeSlot);

impl HelperDef for NowHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        _: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let scope = current_scope(&self.0)?;
        out.write(&scope.now().to_string())?;
        Ok(())
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn attr_value(value: &Value) -> AttrValue {
    match value {
        Value::Bool(b) => AttrValue::Flag(*b),
        Value::String(s) => AttrValue::Text(s.clone()),
        Value::Null => AttrValue::Flag(false),
        other => AttrValue::Text(other.to_string()),
    }
}
