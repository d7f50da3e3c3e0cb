//! Document handle abstraction and the declarative effect adapter.
//!
//! Passes never mutate the page directly. They return a list of
//! [`DomEffect`]s and [`apply_effects`] writes them through a
//! [`DocumentHandle`], checking before every write so that applying the same
//! effect twice leaves the document unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{PerfError, PerfResult};

/// Prefix of the boolean root attributes that record applied passes.
pub const MARKER_PREFIX: &str = "data-perf-";

/// Attribute used to remember a stylesheet's media while it is deferred.
pub const DEFERRED_MEDIA_ATTR: &str = "data-deferred-media";

/// Root attribute name for a pass id.
pub fn marker_attribute(pass_id: &str) -> String {
    format!("{MARKER_PREFIX}{pass_id}")
}

/// A node in the document head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeadNode {
    Style {
        id: String,
        css: String,
    },
    Link {
        rel: String,
        href: String,
        #[serde(default)]
        attrs: BTreeMap<String, String>,
    },
    Meta {
        name: String,
        content: String,
    },
}

impl HeadNode {
    pub fn stylesheet(href: &str) -> Self {
        Self::Link {
            rel: "stylesheet".to_string(),
            href: href.to_string(),
            attrs: BTreeMap::new(),
        }
    }
}

/// An `<img>` element in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageElement {
    pub src: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl ImageElement {
    pub fn new(src: &str) -> Self {
        Self {
            src: src.to_string(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// Event target a listener can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerTarget {
    Window,
    Document,
}

/// A registered event listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerRegistration {
    pub target: ListenerTarget,
    pub event_type: String,
    pub passive: bool,
}

/// The page as seen by the optimizer.
///
/// Implementations wrap whatever actually owns the DOM. [`Document`] is the
/// in-memory implementation used by tests and the CLI.
pub trait DocumentHandle {
    fn root_attribute(&self, name: &str) -> Option<String>;
    fn set_root_attribute(&mut self, name: &str, value: &str) -> PerfResult<()>;
    fn head(&self) -> Vec<HeadNode>;
    fn append_head(&mut self, node: HeadNode) -> PerfResult<()>;
    /// Set an attribute on the `<link>` with the given href. Returns `false` if no such link exists.
    fn set_link_attribute(&mut self, href: &str, name: &str, value: &str) -> PerfResult<bool>;
    fn images(&self) -> Vec<ImageElement>;
    fn set_image_attribute(&mut self, index: usize, name: &str, value: &str) -> PerfResult<()>;
    fn listeners(&self) -> Vec<ListenerRegistration>;
    fn add_listener(&mut self, registration: ListenerRegistration) -> PerfResult<()>;
}

/// Whether the idempotency marker for `pass_id` is present.
pub fn is_marked(doc: &dyn DocumentHandle, pass_id: &str) -> bool {
    doc.root_attribute(&marker_attribute(pass_id)).is_some()
}

/// Set the idempotency marker for `pass_id`. Markers are never removed.
pub fn mark(doc: &mut dyn DocumentHandle, pass_id: &str) -> PerfResult<()> {
    let name = marker_attribute(pass_id);
    if doc.root_attribute(&name).is_some() {
        return Ok(());
    }
    doc.set_root_attribute(&name, "true")
}

/// Register a listener as passive unless the same target/type is already registered.
///
/// Every scroll/touch/wheel registration goes through here instead of
/// patching `addEventListener` globally.
pub fn add_passive_listener(
    doc: &mut dyn DocumentHandle,
    target: ListenerTarget,
    event_type: &str,
) -> PerfResult<bool> {
    let exists = doc
        .listeners()
        .iter()
        .any(|l| l.target == target && l.event_type == event_type);
    if exists {
        return Ok(false);
    }
    doc.add_listener(ListenerRegistration {
        target,
        event_type: event_type.to_string(),
        passive: true,
    })?;
    Ok(true)
}

/// A single required change to the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum DomEffect {
    /// Append a `<style>` with this id unless one already exists.
    InjectStyle { id: String, css: String },
    /// Append a `<link>` unless one with the same rel and href exists.
    AddLink {
        rel: String,
        href: String,
        attrs: BTreeMap<String, String>,
    },
    /// Switch a stylesheet to `media="print"` until it has loaded, remembering its real media.
    DeferStylesheet { href: String },
    /// Set an attribute on the n-th image unless the author already set it.
    SetImageAttribute {
        index: usize,
        name: String,
        value: String,
    },
    /// Set a root attribute if it differs.
    SetRootAttribute { name: String, value: String },
    /// Register a passive listener.
    AddPassiveListener {
        target: ListenerTarget,
        event_type: String,
    },
}

impl DomEffect {
    pub fn style(id: &str, css: &str) -> Self {
        Self::InjectStyle {
            id: id.to_string(),
            css: css.to_string(),
        }
    }

    pub fn link(rel: &str, href: &str) -> Self {
        Self::AddLink {
            rel: rel.to_string(),
            href: href.to_string(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn root_attr(name: &str, value: &str) -> Self {
        Self::SetRootAttribute {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    pub fn image_attr(index: usize, name: &str, value: &str) -> Self {
        Self::SetImageAttribute {
            index,
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// Apply effects in order. Returns how many actually changed the document.
pub fn apply_effects(doc: &mut dyn DocumentHandle, effects: &[DomEffect]) -> PerfResult<usize> {
    let mut changed = 0;
    for effect in effects {
        if apply_effect(doc, effect)? {
            changed += 1;
        }
    }
    Ok(changed)
}

fn apply_effect(doc: &mut dyn DocumentHandle, effect: &DomEffect) -> PerfResult<bool> {
    match effect {
        DomEffect::InjectStyle { id, css } => {
            let exists = doc
                .head()
                .iter()
                .any(|n| matches!(n, HeadNode::Style { id: existing, .. } if existing == id));
            if exists {
                return Ok(false);
            }
            doc.append_head(HeadNode::Style {
                id: id.clone(),
                css: css.clone(),
            })?;
            Ok(true)
        }
        DomEffect::AddLink { rel, href, attrs } => {
            let exists = doc.head().iter().any(|n| {
                matches!(n, HeadNode::Link { rel: r, href: h, .. } if r == rel && h == href)
            });
            if exists {
                return Ok(false);
            }
            doc.append_head(HeadNode::Link {
                rel: rel.clone(),
                href: href.clone(),
                attrs: attrs.clone(),
            })?;
            Ok(true)
        }
        DomEffect::DeferStylesheet { href } => {
            let link = doc.head().into_iter().find_map(|n| match n {
                HeadNode::Link { rel, href: h, attrs } if rel == "stylesheet" && &h == href => {
                    Some(attrs)
                }
                _ => None,
            });
            let attrs = link.ok_or_else(|| {
                PerfError::Document(format!("no stylesheet link with href {href}"))
            })?;
            if attrs.contains_key(DEFERRED_MEDIA_ATTR) {
                return Ok(false);
            }
            let media = attrs.get("media").cloned().unwrap_or_else(|| "all".to_string());
            doc.set_link_attribute(href, DEFERRED_MEDIA_ATTR, &media)?;
            doc.set_link_attribute(href, "media", "print")?;
            Ok(true)
        }
        DomEffect::SetImageAttribute { index, name, value } => {
            let images = doc.images();
            let image = images.get(*index).ok_or_else(|| {
                PerfError::Document(format!(
                    "image index {index} out of range ({} images)",
                    images.len()
                ))
            })?;
            if image.attrs.contains_key(name) {
                return Ok(false);
            }
            doc.set_image_attribute(*index, name, value)?;
            Ok(true)
        }
        DomEffect::SetRootAttribute { name, value } => {
            if doc.root_attribute(name).as_deref() == Some(value.as_str()) {
                return Ok(false);
            }
            doc.set_root_attribute(name, value)?;
            Ok(true)
        }
        DomEffect::AddPassiveListener { target, event_type } => {
            add_passive_listener(doc, *target, event_type)
        }
    }
}

/// In-memory document: root attributes, head nodes, images and listeners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub root_attributes: BTreeMap<String, String>,
    pub head: Vec<HeadNode>,
    pub images: Vec<ImageElement>,
    pub listeners: Vec<ListenerRegistration>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stylesheet(mut self, href: &str) -> Self {
        self.head.push(HeadNode::stylesheet(href));
        self
    }

    pub fn with_image(mut self, src: &str) -> Self {
        self.images.push(ImageElement::new(src));
        self
    }

    /// Root attributes that are idempotency markers.
    pub fn markers(&self) -> Vec<&str> {
        self.root_attributes
            .keys()
            .filter_map(|k| k.strip_prefix(MARKER_PREFIX))
            .collect()
    }
}

impl DocumentHandle for Document {
    fn root_attribute(&self, name: &str) -> Option<String> {
        self.root_attributes.get(name).cloned()
    }

    fn set_root_attribute(&mut self, name: &str, value: &str) -> PerfResult<()> {
        self.root_attributes
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn head(&self) -> Vec<HeadNode> {
        self.head.clone()
    }

    fn append_head(&mut self, node: HeadNode) -> PerfResult<()> {
        self.head.push(node);
        Ok(())
    }

    fn set_link_attribute(&mut self, href: &str, name: &str, value: &str) -> PerfResult<bool> {
        for node in &mut self.head {
            if let HeadNode::Link { href: h, attrs, .. } = node {
                if h == href {
                    attrs.insert(name.to_string(), value.to_string());
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn images(&self) -> Vec<ImageElement> {
        self.images.clone()
    }

    fn set_image_attribute(&mut self, index: usize, name: &str, value: &str) -> PerfResult<()> {
        let image = self
            .images
            .get_mut(index)
            .ok_or_else(|| PerfError::Document(format!("image index {index} out of range")))?;
        image.attrs.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn listeners(&self) -> Vec<ListenerRegistration> {
        self.listeners.clone()
    }

    fn add_listener(&mut self, registration: ListenerRegistration) -> PerfResult<()> {
        self.listeners.push(registration);
        Ok(())
    }
}
