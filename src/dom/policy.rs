use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use url::Url;

use super::host::Namespace;

const DEFAULT_ALLOWED_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "blockquote", "div", "section", "dd", "dl", "dt", "hr", "ol", "p",
    "pre", "ul", "li", "abbr", "b", "br", "cite", "code", "em", "i", "kbd", "q", "s", "strong",
    "sub", "sup", "span", "time", "u", "var", "del", "ins", "caption", "col", "table", "tbody",
    "td", "tfoot", "th", "thead", "tr", "datalist", "input", "button", "label", "meter",
    "progress", "select", "option", "textarea", "details", "summary", "dialog", "svg", "path",
];

const DEFAULT_ALLOWED_ATTRIBUTES: &[&str] = &[
    "value",
    "defaultSelected",
    "class",
    "alt",
    "cite",
    "colspan",
    "controls",
    "datetime",
    "default",
    "disabled",
    "dir",
    "height",
    "href",
    "id",
    "kind",
    "label",
    "lang",
    "loading",
    "loop",
    "rel",
    "role",
    "rowspan",
    "scope",
    "sizes",
    "span",
    "start",
    "target",
    "title",
    "type",
    "width",
    "minlength",
    "maxlength",
    "min",
    "max",
    "step",
    "placeholder",
    "spellcheck",
    "readonly",
    "name",
    "autocorrect",
    "tabindex",
    "data-column-id",
    "data-sort-id",
    "data-tag",
    // svg
    "d",
    "viewBox",
    "aria-hidden",
    "focusable",
    "fill",
    "xmlns",
];

const DEFAULT_ALLOWED_INPUT_TYPES: &[&str] = &[
    "button", "checkbox", "color", "email", "hidden", "number", "password", "radio", "range",
    "text", "time", "url", "week",
];

const DEFAULT_URL_SCHEMES: &[&str] = &["data"];
const DEFAULT_URL_MEDIA_SUBTYPES: &[&str] = &["gif", "png", "jpeg"];

const DEFAULT_PROPERTY_ATTRIBUTES: &[(&str, &str)] = &[
    ("class", "className"),
    ("rowspan", "rowSpan"),
    ("datetime", "dateTime"),
    ("colspan", "colSpan"),
];

/// The element an attribute check is made against.
#[derive(Debug, Clone, Copy)]
pub struct ElementInfo<'a> {
    pub tag: &'a str,
    pub namespace: Namespace,
}

/// Allow-lists backing the default predicates. Deserialisable so a sandbox
/// config file can replace any of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowLists {
    pub tags: Vec<String>,
    pub attributes: Vec<String>,
    pub input_types: Vec<String>,
    pub url_schemes: Vec<String>,
    pub url_media_subtypes: Vec<String>,
    pub property_attributes: HashMap<String, String>,
}

impl Default for AllowLists {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|item| item.to_string()).collect();
        Self {
            tags: owned(DEFAULT_ALLOWED_TAGS),
            attributes: owned(DEFAULT_ALLOWED_ATTRIBUTES),
            input_types: owned(DEFAULT_ALLOWED_INPUT_TYPES),
            url_schemes: owned(DEFAULT_URL_SCHEMES),
            url_media_subtypes: owned(DEFAULT_URL_MEDIA_SUBTYPES),
            property_attributes: DEFAULT_PROPERTY_ATTRIBUTES
                .iter()
                .map(|(attr, prop)| (attr.to_string(), prop.to_string()))
                .collect(),
        }
    }
}

type TagFilter = Rc<dyn Fn(&str) -> bool>;
type AttributeFilter = Rc<dyn Fn(&ElementInfo<'_>, &str) -> bool>;
type InputTypeFilter = Rc<dyn Fn(&str) -> bool>;
type UrlFilter = Rc<dyn Fn(&Url) -> bool>;

/// Allow-list predicates gating every DOM and CSS operation the bridge
/// performs. Cheap to clone; each sandbox owns its own copy.
#[derive(Clone)]
pub struct FilterPolicy {
    tag: TagFilter,
    attribute: AttributeFilter,
    input_type: InputTypeFilter,
    url: UrlFilter,
    property_attributes: Rc<HashMap<String, String>>,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self::from_allow_lists(AllowLists::default())
    }
}

impl fmt::Debug for FilterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterPolicy")
            .field("property_attributes", &self.property_attributes)
            .finish_non_exhaustive()
    }
}

impl FilterPolicy {
    pub fn from_allow_lists(lists: AllowLists) -> Self {
        let tags: HashSet<String> = lists.tags.into_iter().collect();
        let attributes: HashSet<String> = lists.attributes.into_iter().collect();
        let input_types: HashSet<String> = lists.input_types.into_iter().collect();
        let schemes: HashSet<String> = lists
            .url_schemes
            .into_iter()
            .map(|scheme| scheme.trim_end_matches(':').to_ascii_lowercase())
            .collect();
        let subtypes: HashSet<String> = lists
            .url_media_subtypes
            .into_iter()
            .map(|subtype| subtype.to_ascii_lowercase())
            .collect();

        Self {
            tag: Rc::new(move |tag| tags.contains(tag)),
            attribute: Rc::new(move |_element, name| attributes.contains(name)),
            input_type: Rc::new(move |kind| input_types.contains(kind)),
            url: Rc::new(move |url| url_allowed(url, &schemes, &subtypes)),
            property_attributes: Rc::new(lists.property_attributes),
        }
    }

    pub fn with_tag_filter(mut self, filter: impl Fn(&str) -> bool + 'static) -> Self {
        self.tag = Rc::new(filter);
        self
    }

    pub fn with_attribute_filter(
        mut self,
        filter: impl Fn(&ElementInfo<'_>, &str) -> bool + 'static,
    ) -> Self {
        self.attribute = Rc::new(filter);
        self
    }

    pub fn with_input_type_filter(mut self, filter: impl Fn(&str) -> bool + 'static) -> Self {
        self.input_type = Rc::new(filter);
        self
    }

    pub fn with_url_filter(mut self, filter: impl Fn(&Url) -> bool + 'static) -> Self {
        self.url = Rc::new(filter);
        self
    }

    pub fn is_tag_allowed(&self, tag: &str) -> bool {
        (self.tag)(tag)
    }

    /// Checks the attribute name only; the element is passed through for
    /// custom filters that want to be element-aware.
    pub fn is_attribute_allowed(&self, element: &ElementInfo<'_>, name: &str) -> bool {
        (self.attribute)(element, name)
    }

    pub fn is_input_type_allowed(&self, kind: &str) -> bool {
        (self.input_type)(kind)
    }

    pub fn is_allowed_url(&self, url: &Url) -> bool {
        (self.url)(url)
    }

    /// DOM property to write instead of the attribute, e.g. `class` → `className`.
    pub fn property_equivalent(&self, attribute: &str) -> Option<&str> {
        self.property_attributes.get(attribute).map(String::as_str)
    }
}

fn url_allowed(url: &Url, schemes: &HashSet<String>, subtypes: &HashSet<String>) -> bool {
    if !schemes.contains(url.scheme()) {
        return false;
    }
    match data_url_media_type(url) {
        Some((kind, subtype)) => kind == "image" && subtypes.contains(&subtype),
        None => false,
    }
}

/// Splits the media type of a `data:` URL into `(type, subtype)`, lowercased.
/// Parameters such as `;base64` or `;charset=...` are ignored.
pub fn data_url_media_type(url: &Url) -> Option<(String, String)> {
    if url.scheme() != "data" {
        return None;
    }
    let path = url.path();
    let header = path.split_once(',').map(|(header, _)| header)?;
    let essence = header.split(';').next()?.trim();
    let (kind, subtype) = essence.split_once('/')?;
    let kind = kind.trim().to_ascii_lowercase();
    let subtype = subtype.trim().to_ascii_lowercase();
    if kind.is_empty() || subtype.is_empty() {
        return None;
    }
    Some((kind, subtype))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(tag: &str) -> ElementInfo<'_> {
        ElementInfo {
            tag,
            namespace: Namespace::Html,
        }
    }

    #[test]
    fn default_tags() {
        let policy = FilterPolicy::default();
        assert!(policy.is_tag_allowed("div"));
        assert!(policy.is_tag_allowed("svg"));
        assert!(!policy.is_tag_allowed("script"));
        assert!(!policy.is_tag_allowed("iframe"));
        assert!(!policy.is_tag_allowed("a"));
    }

    #[test]
    fn attributes_ignore_element_kind() {
        let policy = FilterPolicy::default();
        assert!(policy.is_attribute_allowed(&element("div"), "href"));
        assert!(policy.is_attribute_allowed(&element("path"), "d"));
        assert!(!policy.is_attribute_allowed(&element("div"), "onclick"));
        assert!(!policy.is_attribute_allowed(&element("div"), "style"));
        assert!(!policy.is_attribute_allowed(&element("div"), "src"));
    }

    #[test]
    fn input_types() {
        let policy = FilterPolicy::default();
        assert!(policy.is_input_type_allowed("checkbox"));
        assert!(!policy.is_input_type_allowed("file"));
        assert!(!policy.is_input_type_allowed("submit"));
        assert!(!policy.is_input_type_allowed("image"));
    }

    #[test]
    fn data_urls() {
        let policy = FilterPolicy::default();
        let allowed = Url::parse("data:image/gif;base64,AAAA").unwrap();
        let png = Url::parse("data:image/PNG,AAAA").unwrap();
        let remote = Url::parse("https://evil.example/x.png").unwrap();
        let svg = Url::parse("data:image/svg+xml;base64,AAAA").unwrap();
        let html = Url::parse("data:text/gif,AAAA").unwrap();

        assert!(policy.is_allowed_url(&allowed));
        assert!(policy.is_allowed_url(&png));
        assert!(!policy.is_allowed_url(&remote));
        assert!(!policy.is_allowed_url(&svg));
        assert!(!policy.is_allowed_url(&html));
    }

    #[test]
    fn media_type_parsing() {
        let url = Url::parse("data:image/jpeg;charset=utf-8;base64,AAAA").unwrap();
        assert_eq!(
            data_url_media_type(&url),
            Some(("image".to_string(), "jpeg".to_string()))
        );
        let missing = Url::parse("data:,hello").unwrap();
        assert_eq!(data_url_media_type(&missing), None);
    }

    #[test]
    fn overrides_replace_single_predicate() {
        let policy = FilterPolicy::default().with_tag_filter(|tag| tag == "a");
        assert!(policy.is_tag_allowed("a"));
        assert!(!policy.is_tag_allowed("div"));
        assert!(policy.is_input_type_allowed("text"));
    }

    #[test]
    fn property_equivalents() {
        let policy = FilterPolicy::default();
        assert_eq!(policy.property_equivalent("class"), Some("className"));
        assert_eq!(policy.property_equivalent("colspan"), Some("colSpan"));
        assert_eq!(policy.property_equivalent("title"), None);
    }
}
