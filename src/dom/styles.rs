//! Inline style proxies, the CSS `url()` filter and the virtual stylesheet
//! handed to CSS-in-JS runtimes.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::OnceLock;

use anyhow::Result;
use fancy_regex::Regex;
use rquickjs::{Ctx, Object, Value};
use url::Url;

use super::host::{HostNodeId, RuleKey, SharedDocument};
use super::policy::FilterPolicy;
use crate::js::builder::{build_from_definition, wrap_with_guard, GuardOp, GuardTarget, ObjectDefinition, ProxyHandler};
use crate::js::marshal::{HostValue, Marshaller};
use crate::log::{ViolationKind, ViolationLog};

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)url\(\s*['"]?([^"')]+)["']?\s*\)"#).unwrap_or_else(|err| {
            unreachable!("url() pattern is a valid regex: {err}")
        })
    })
}

/// Every `url(...)` argument in a CSS value, trimmed and unquoted.
pub fn parse_urls(value: &str) -> Vec<String> {
    url_pattern()
        .captures_iter(value)
        .filter_map(|captures| captures.ok())
        .filter_map(|captures| captures.get(1))
        .map(|found| found.as_str().trim().to_string())
        .collect()
}

/// Byte offsets of `{`, `}` and `;` that sit outside strings, comments and
/// parentheses.
fn structural_chars(css: &str) -> Vec<(usize, char)> {
    let mut found = Vec::new();
    let mut chars = css.char_indices().peekable();
    let mut quote: Option<char> = None;
    let mut parens = 0usize;

    while let Some((index, ch)) = chars.next() {
        if let Some(open) = quote {
            if ch == '\\' {
                chars.next();
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let mut previous = ' ';
                for (_, inner) in chars.by_ref() {
                    if previous == '*' && inner == '/' {
                        break;
                    }
                    previous = inner;
                }
            }
            '(' => parens += 1,
            ')' => parens = parens.saturating_sub(1),
            '{' | '}' | ';' if parens == 0 => found.push((index, ch)),
            _ => {}
        }
    }
    found
}

/// Split a stylesheet chunk into its top-level rules and statements.
pub fn split_rules(css: &str) -> Vec<String> {
    let mut rules = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (index, ch) in structural_chars(css) {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    rules.push(css[start..=index].trim().to_string());
                    start = index + 1;
                }
            }
            ';' if depth == 0 => {
                rules.push(css[start..=index].trim().to_string());
                start = index + 1;
            }
            _ => {}
        }
    }
    let rest = css[start..].trim();
    if !rest.is_empty() {
        rules.push(rest.to_string());
    }
    rules.retain(|rule| !rule.is_empty() && rule != ";");
    rules
}

/// Strips declarations whose `url(...)` values fail the URL policy.
#[derive(Debug, Clone)]
pub struct CssFilter {
    policy: FilterPolicy,
    violations: ViolationLog,
}

impl CssFilter {
    pub fn new(policy: FilterPolicy, violations: ViolationLog) -> Self {
        Self { policy, violations }
    }

    /// True when every `url()` in `value` parses and is allowed. Unparseable
    /// URLs count as disallowed.
    pub fn check_value(&self, value: &str) -> bool {
        let urls = parse_urls(value);
        let rejected: Vec<&String> = urls
            .iter()
            .filter(|raw| match Url::parse(raw) {
                Ok(url) => !self.policy.is_allowed_url(&url),
                Err(_) => true,
            })
            .collect();
        if rejected.is_empty() {
            return true;
        }
        self.violations.record(
            ViolationKind::Css,
            format!(
                "CSS value contains a disallowed url(): {}",
                rejected
                    .iter()
                    .map(|raw| raw.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        );
        false
    }

    /// Remove offending declarations, leaving their rules and siblings intact.
    pub fn filter(&self, css: &str) -> String {
        let mut out = String::with_capacity(css.len());
        let mut start = 0;
        for (index, ch) in structural_chars(css) {
            match ch {
                '{' => out.push_str(&css[start..=index]),
                ';' => self.keep_if_allowed(&css[start..=index], &mut out),
                _ => {
                    self.keep_if_allowed(&css[start..index], &mut out);
                    out.push('}');
                }
            }
            start = index + 1;
        }
        self.keep_if_allowed(&css[start..], &mut out);
        out
    }

    fn keep_if_allowed(&self, segment: &str, out: &mut String) {
        if self.check_value(segment) {
            out.push_str(segment);
        }
    }
}

/// Inline style of one host element as seen through the style proxy.
pub struct StyleTarget {
    document: SharedDocument,
    node: HostNodeId,
}

impl StyleTarget {
    pub fn new(document: SharedDocument, node: HostNodeId) -> Self {
        Self { document, node }
    }
}

impl GuardTarget for StyleTarget {
    fn get_own_string(&self, property: &str) -> Option<String> {
        let document = self.document.borrow();
        let style = document.style(self.node).ok()?;
        style.get(property).map(str::to_string)
    }

    fn set_own_string(&self, property: &str, value: &str) -> bool {
        self.document
            .borrow_mut()
            .set_style_property(self.node, property, value)
            .unwrap_or(false)
    }
}

/// Guarded proxy over an element's inline style. Writes must pass the CSS
/// URL filter.
pub fn create_style_proxy<'js>(
    ctx: &Ctx<'js>,
    marshaller: &Marshaller,
    filter: CssFilter,
    document: SharedDocument,
    node: HostNodeId,
) -> rquickjs::Result<Value<'js>> {
    let handler = ProxyHandler::guard(move |op| match op {
        GuardOp::Get { .. } => true,
        GuardOp::Set { value, .. } => filter.check_value(value),
    });
    wrap_with_guard(
        ctx,
        marshaller,
        Rc::new(StyleTarget::new(document, node)),
        handler,
    )
}

#[derive(Debug, Default)]
struct StyleSheetState {
    names: HashMap<String, HashSet<String>>,
    rules: HashMap<String, Vec<RuleKey>>,
    instances: HashMap<String, u32>,
}

/// Bookkeeping behind `createSandboxStyleSheet()`: rules inserted per owner
/// id into a shadow-scoped `<style>` element.
pub struct VirtualStyleSheet {
    document: SharedDocument,
    style_node: HostNodeId,
    filter: CssFilter,
    state: RefCell<StyleSheetState>,
}

impl VirtualStyleSheet {
    pub fn new(document: SharedDocument, style_node: HostNodeId, filter: CssFilter) -> Self {
        Self {
            document,
            style_node,
            filter,
            state: RefCell::new(StyleSheetState::default()),
        }
    }

    pub fn has_name_for_id(&self, id: &str, name: &str) -> bool {
        self.state
            .borrow()
            .names
            .get(id)
            .is_some_and(|names| names.contains(name))
    }

    /// Filter each chunk and insert its surviving rules. Returns how many
    /// rules were inserted.
    pub fn insert_rules(&self, id: &str, name: &str, chunks: &[String]) -> Result<usize> {
        let mut state = self.state.borrow_mut();
        state
            .names
            .entry(id.to_string())
            .or_default()
            .insert(name.to_string());

        let mut inserted = Vec::new();
        {
            let mut document = self.document.borrow_mut();
            for chunk in chunks {
                let filtered = self.filter.filter(chunk);
                for rule in split_rules(&filtered) {
                    inserted.push(document.insert_rule(self.style_node, &rule)?);
                }
            }
        }

        let count = inserted.len();
        state
            .rules
            .entry(id.to_string())
            .or_default()
            .extend(inserted);
        Ok(count)
    }

    pub fn allocate_gs_instance(&self, id: &str) -> u32 {
        let mut state = self.state.borrow_mut();
        let counter = state.instances.entry(id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Delete every rule recorded for `id` and forget its names and counter.
    pub fn clear_rules(&self, id: &str) -> Result<usize> {
        let keys = {
            let mut state = self.state.borrow_mut();
            state.names.remove(id);
            state.instances.remove(id);
            state.rules.remove(id).unwrap_or_default()
        };
        let mut document = self.document.borrow_mut();
        let mut deleted = 0;
        for key in keys {
            if document.delete_rule(self.style_node, key)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub fn rule_count(&self, id: &str) -> usize {
        self.state.borrow().rules.get(id).map_or(0, Vec::len)
    }
}

fn string_arg(marshaller: &Marshaller, args: &[Value<'_>], index: usize) -> String {
    match args.get(index).map(|value| marshaller.dump(value)) {
        Some(HostValue::String(value)) => value,
        Some(HostValue::Undefined) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// The interpreter-facing stylesheet object.
pub fn stylesheet_object<'js>(
    ctx: &Ctx<'js>,
    marshaller: &Marshaller,
    sheet: Rc<VirtualStyleSheet>,
) -> rquickjs::Result<Object<'js>> {
    let has_name = Rc::clone(&sheet);
    let insert = Rc::clone(&sheet);
    let allocate = Rc::clone(&sheet);
    let clear = sheet;
    let (m1, m2, m3, m4) = (
        marshaller.clone(),
        marshaller.clone(),
        marshaller.clone(),
        marshaller.clone(),
    );

    let definition = ObjectDefinition::new()
        .native("hasNameForId", move |ctx, _this, args| {
            let found = has_name.has_name_for_id(&string_arg(&m1, &args, 0), &string_arg(&m1, &args, 1));
            Ok(Value::new_bool(ctx, found))
        })
        .native("insertRules", move |ctx, _this, args| {
            let id = string_arg(&m2, &args, 0);
            let name = string_arg(&m2, &args, 1);
            let chunks = match args.get(2).map(|value| m2.dump(value)) {
                Some(HostValue::Array(items)) => items.iter().map(|item| item.to_string()).collect(),
                Some(HostValue::String(css)) => vec![css],
                _ => Vec::new(),
            };
            if let Err(err) = insert.insert_rules(&id, &name, &chunks) {
                tracing::error!(target: "sandbox::bridge", "insertRules failed: {err:#}");
            }
            Ok(Value::new_undefined(ctx))
        })
        .native("allocateGSInstance", move |ctx, _this, args| {
            let counter = allocate.allocate_gs_instance(&string_arg(&m3, &args, 0));
            Ok(Value::new_number(ctx, counter as f64))
        })
        .native("clearRules", move |ctx, _this, args| {
            if let Err(err) = clear.clear_rules(&string_arg(&m4, &args, 0)) {
                tracing::error!(target: "sandbox::bridge", "clearRules failed: {err:#}");
            }
            Ok(Value::new_undefined(ctx))
        });

    build_from_definition(ctx, marshaller, definition, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::host::{HostDocument, Namespace};

    fn filter(log: &ViolationLog) -> CssFilter {
        CssFilter::new(FilterPolicy::default(), log.clone())
    }

    #[test]
    fn finds_quoted_and_bare_urls() {
        let urls = parse_urls(r#"url("a.png"), url( 'b.png' ) , url(data:image/png;base64,AA)"#);
        assert_eq!(urls, vec!["a.png", "b.png", "data:image/png;base64,AA"]);
    }

    #[test]
    fn strips_only_the_offending_declaration() {
        let log = ViolationLog::new();
        let css = "h1 { color: red; background: url(https://evil.example/x.png); margin: 0 }";
        assert_eq!(filter(&log).filter(css), "h1 { color: red; margin: 0 }");
        assert_eq!(log.count_of(ViolationKind::Css), 1);
    }

    #[test]
    fn url_function_name_is_case_insensitive() {
        let log = ViolationLog::new();
        let css = ".a { color: red; background: URL(https://evil.example/x.png) } \
                   .b { cursor: Url('https://evil.example/c.cur'); }";
        let out = filter(&log).filter(css);
        assert!(!out.contains("evil.example"), "{out}");
        assert!(out.contains(".a { color: red;"), "{out}");
        assert!(!filter(&log).check_value("uRl(https://evil.example/y.png)"));
        assert_eq!(log.count_of(ViolationKind::Css), 3);
    }

    #[test]
    fn keeps_allowed_data_urls() {
        let log = ViolationLog::new();
        let css = "div { background: url(data:image/gif;base64,AAAA); }";
        assert_eq!(filter(&log).filter(css), css);
        assert_eq!(log.count(), 0);
    }

    #[test]
    fn nested_blocks_are_filtered() {
        let log = ViolationLog::new();
        let css = "@media (min-width: 10px) { a { cursor: url(x.cur); color: blue; } }";
        assert_eq!(
            filter(&log).filter(css),
            "@media (min-width: 10px) { a { color: blue; } }"
        );
    }

    #[test]
    fn splits_top_level_rules() {
        let rules = split_rules("a { color: red; } @media print { b { color: blue; } } c{}");
        assert_eq!(
            rules,
            vec![
                "a { color: red; }",
                "@media print { b { color: blue; } }",
                "c{}"
            ]
        );
    }

    fn sheet() -> (SharedDocument, HostNodeId, VirtualStyleSheet) {
        let document = HostDocument::shared();
        let style = document.borrow_mut().create_element("style", Namespace::Html);
        let sheet = VirtualStyleSheet::new(
            Rc::clone(&document),
            style,
            filter(&ViolationLog::new()),
        );
        (document, style, sheet)
    }

    #[test]
    fn clear_rules_forgets_everything_for_id() {
        let (document, style, sheet) = sheet();
        sheet
            .insert_rules("sc-a", "x1", &["a { color: red; } b { color: blue; }".to_string()])
            .unwrap();
        sheet
            .insert_rules("sc-b", "y1", &["i { color: green; }".to_string()])
            .unwrap();
        assert!(sheet.has_name_for_id("sc-a", "x1"));
        assert_eq!(sheet.allocate_gs_instance("sc-a"), 1);
        assert_eq!(sheet.allocate_gs_instance("sc-a"), 2);
        assert_eq!(document.borrow().sheet(style).map(|s| s.len()), Some(3));

        assert_eq!(sheet.clear_rules("sc-a").unwrap(), 2);
        assert!(!sheet.has_name_for_id("sc-a", "x1"));
        assert_eq!(sheet.rule_count("sc-a"), 0);
        assert_eq!(sheet.allocate_gs_instance("sc-a"), 1);
        let remaining: Vec<String> = document
            .borrow()
            .sheet(style)
            .map(|s| s.rules().map(str::to_string).collect())
            .unwrap_or_default();
        assert_eq!(remaining, vec!["i { color: green; }"]);
    }
}
