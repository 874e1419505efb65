//! DOM tree and view-layer helpers.
//!
//! This module provides a live element tree for the page document, a small
//! CSS selector engine and the [`DomAccessor`] helpers features use to wait
//! for elements, inject stylesheets and create nodes.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tronclass_enhancer::browser::{DomAccessor, Page, StaticTransport};
//!
//! let page = Page::new("https://lms.example.edu/user/index", Arc::new(StaticTransport::new())).unwrap();
//! let dom = page.dom();
//!
//! let button = dom.create_element("button", &["next-btn", "primary"]);
//! page.document().body().append_child(&button);
//!
//! assert!(dom.query("body .next-btn").is_some());
//! let style = dom.create_style("footer { display: none; }");
//! style.remove();
//! ```

use crate::browser::event::{Event, EventTarget, EventTargetProto, TargetKind};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Errors raised by DOM helpers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomError {
    /// No element matched before the timeout elapsed.
    #[error("Timed out after {timeout_ms}ms waiting for {selector}")]
    Timeout {
        /// Selector waited for.
        selector: String,
        /// Timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The selector could not be parsed.
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),
}

struct ElementInner {
    tag: String,
    attributes: RwLock<BTreeMap<String, String>>,
    style: RwLock<BTreeMap<String, String>>,
    text: RwLock<String>,
    properties: RwLock<HashMap<String, Value>>,
    children: RwLock<Vec<Element>>,
    parent: RwLock<Weak<ElementInner>>,
    target: EventTarget,
}

/// A DOM element. Cheap to clone; clones refer to the same node.
#[derive(Clone)]
pub struct Element {
    inner: Arc<ElementInner>,
}

impl Element {
    /// Creates a detached element.
    pub fn new(tag: &str, proto: Arc<EventTargetProto>) -> Self {
        let tag = tag.to_ascii_lowercase();
        Self {
            inner: Arc::new(ElementInner {
                target: EventTarget::new(TargetKind::Element, tag.clone(), proto),
                tag,
                attributes: RwLock::new(BTreeMap::new()),
                style: RwLock::new(BTreeMap::new()),
                text: RwLock::new(String::new()),
                properties: RwLock::new(HashMap::new()),
                children: RwLock::new(Vec::new()),
                parent: RwLock::new(Weak::new()),
            }),
        }
    }

    /// Tag name, lower-case.
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// The element as an event target.
    pub fn target(&self) -> &EventTarget {
        &self.inner.target
    }

    /// Reference identity comparison.
    pub fn ptr_eq(&self, other: &Element) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// `id` attribute.
    pub fn id(&self) -> Option<String> {
        self.attribute("id")
    }

    /// Reads an attribute.
    pub fn attribute(&self, name: &str) -> Option<String> {
        self.inner.attributes.read().get(name).cloned()
    }

    /// Sets an attribute.
    pub fn set_attribute(&self, name: &str, value: impl Into<String>) {
        self.inner
            .attributes
            .write()
            .insert(name.to_string(), value.into());
    }

    /// Removes an attribute.
    pub fn remove_attribute(&self, name: &str) {
        self.inner.attributes.write().remove(name);
    }

    /// Class list.
    pub fn classes(&self) -> Vec<String> {
        self.attribute("class")
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Whether the class list contains `class`.
    pub fn has_class(&self, class: &str) -> bool {
        self.classes().iter().any(|c| c == class)
    }

    /// Adds a class.
    pub fn add_class(&self, class: &str) {
        let mut classes = self.classes();
        if !classes.iter().any(|c| c == class) {
            classes.push(class.to_string());
            self.set_attribute("class", classes.join(" "));
        }
    }

    /// Removes a class.
    pub fn remove_class(&self, class: &str) {
        let classes: Vec<String> = self.classes().into_iter().filter(|c| c != class).collect();
        self.set_attribute("class", classes.join(" "));
    }

    /// Reads an inline style property.
    pub fn style(&self, property: &str) -> Option<String> {
        self.inner.style.read().get(property).cloned()
    }

    /// Sets an inline style property.
    pub fn set_style(&self, property: &str, value: impl Into<String>) {
        self.inner
            .style
            .write()
            .insert(property.to_string(), value.into());
    }

    /// Removes an inline style property, returning its old value.
    pub fn remove_style(&self, property: &str) -> Option<String> {
        self.inner.style.write().remove(property)
    }

    /// `textContent` of this node only.
    pub fn text(&self) -> String {
        self.inner.text.read().clone()
    }

    /// Sets `textContent`.
    pub fn set_text(&self, text: impl Into<String>) {
        *self.inner.text.write() = text.into();
    }

    /// Reads an IDL property such as `playbackRate` or `currentTime`.
    pub fn property(&self, name: &str) -> Option<Value> {
        self.inner.properties.read().get(name).cloned()
    }

    /// Numeric IDL property.
    pub fn property_f64(&self, name: &str) -> Option<f64> {
        self.property(name).and_then(|v| v.as_f64())
    }

    /// Writes an IDL property.
    pub fn set_property(&self, name: &str, value: Value) {
        self.inner
            .properties
            .write()
            .insert(name.to_string(), value);
    }

    /// Appends a child, moving it out of its previous parent.
    pub fn append_child(&self, child: &Element) {
        child.remove();
        *child.inner.parent.write() = Arc::downgrade(&self.inner);
        child.inner.target.set_parent(Some(&self.inner.target));
        self.inner.children.write().push(child.clone());
    }

    /// Detaches the element from its parent.
    pub fn remove(&self) {
        let parent = self.inner.parent.read().upgrade();
        if let Some(parent) = parent {
            parent
                .children
                .write()
                .retain(|c| !Arc::ptr_eq(&c.inner, &self.inner));
        }
        *self.inner.parent.write() = Weak::new();
        self.inner.target.set_parent(None);
    }

    /// Parent element.
    pub fn parent(&self) -> Option<Element> {
        self.inner
            .parent
            .read()
            .upgrade()
            .map(|inner| Element { inner })
    }

    /// Whether the element has a parent.
    pub fn is_attached(&self) -> bool {
        self.inner.parent.read().strong_count() > 0
    }

    /// Direct children.
    pub fn children(&self) -> Vec<Element> {
        self.inner.children.read().clone()
    }

    /// `element.click()`
    pub fn click(&self) {
        self.inner.target.dispatch_event(&Event::new("click"));
    }

    /// Dispatches an event at this element.
    pub fn dispatch(&self, event: &Event) -> bool {
        self.inner.target.dispatch_event(event)
    }

    /// Whether the element matches a selector.
    pub fn matches(&self, selector: &str) -> Result<bool, DomError> {
        let selector = Selector::parse(selector)?;
        Ok(selector.matches(self))
    }

    /// First descendant matching the selector, in document order.
    pub fn query_selector(&self, selector: &str) -> Result<Option<Element>, DomError> {
        let selector = Selector::parse(selector)?;
        let mut found = None;
        self.walk(&mut |el| {
            if found.is_none() && selector.matches(el) {
                found = Some(el.clone());
            }
        });
        Ok(found)
    }

    /// All descendants matching the selector, in document order.
    pub fn query_selector_all(&self, selector: &str) -> Result<Vec<Element>, DomError> {
        let selector = Selector::parse(selector)?;
        let mut found = Vec::new();
        self.walk(&mut |el| {
            if selector.matches(el) {
                found.push(el.clone());
            }
        });
        Ok(found)
    }

    fn walk(&self, visit: &mut dyn FnMut(&Element)) {
        for child in self.children() {
            visit(&child);
            child.walk(visit);
        }
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("tag", &self.inner.tag)
            .field("attributes", &*self.inner.attributes.read())
            .field("children", &self.inner.children.read().len())
            .finish()
    }
}

#[derive(Debug, Default, PartialEq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attributes: Vec<(String, Option<String>)>,
}

impl Compound {
    fn parse(input: &str) -> Result<Self, DomError> {
        let invalid = || DomError::InvalidSelector(input.to_string());
        let mut compound = Compound::default();
        let mut rest = input;

        let tag_end = rest.find(['#', '.', '[']).unwrap_or(rest.len());
        if tag_end > 0 {
            let tag = &rest[..tag_end];
            if tag != "*" {
                compound.tag = Some(tag.to_ascii_lowercase());
            }
        }
        rest = &rest[tag_end..];

        while let Some(first) = rest.chars().next() {
            match first {
                '#' | '.' => {
                    let body = &rest[1..];
                    let end = body.find(['#', '.', '[']).unwrap_or(body.len());
                    if end == 0 {
                        return Err(invalid());
                    }
                    let name = body[..end].to_string();
                    if first == '#' {
                        compound.id = Some(name);
                    } else {
                        compound.classes.push(name);
                    }
                    rest = &body[end..];
                }
                '[' => {
                    let end = rest.find(']').ok_or_else(invalid)?;
                    let inner = &rest[1..end];
                    let attribute = match inner.split_once('=') {
                        Some((name, value)) => (
                            name.trim().to_string(),
                            Some(value.trim().trim_matches(['"', '\'']).to_string()),
                        ),
                        None => (inner.trim().to_string(), None),
                    };
                    if attribute.0.is_empty() {
                        return Err(invalid());
                    }
                    compound.attributes.push(attribute);
                    rest = &rest[end + 1..];
                }
                _ => return Err(invalid()),
            }
        }

        Ok(compound)
    }

    fn matches(&self, element: &Element) -> bool {
        if let Some(tag) = &self.tag {
            if element.tag() != tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if element.id().as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.iter().all(|c| element.has_class(c)) {
            return false;
        }
        self.attributes.iter().all(|(name, value)| match value {
            Some(value) => element.attribute(name).as_deref() == Some(value.as_str()),
            None => element.attribute(name).is_some(),
        })
    }
}

/// Compound selectors joined by descendant combinators, optionally grouped with `,`.
#[derive(Debug)]
struct Selector {
    alternatives: Vec<Vec<Compound>>,
}

impl Selector {
    fn parse(input: &str) -> Result<Self, DomError> {
        let alternatives = input
            .split(',')
            .map(|group| {
                let parts: Vec<Compound> = group
                    .split_whitespace()
                    .map(Compound::parse)
                    .collect::<Result<_, _>>()?;
                if parts.is_empty() {
                    return Err(DomError::InvalidSelector(input.to_string()));
                }
                Ok(parts)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { alternatives })
    }

    fn matches(&self, element: &Element) -> bool {
        self.alternatives
            .iter()
            .any(|chain| Self::matches_chain(chain, element))
    }

    fn matches_chain(chain: &[Compound], element: &Element) -> bool {
        let Some((last, ancestors)) = chain.split_last() else {
            return false;
        };
        if !last.matches(element) {
            return false;
        }
        let mut remaining = ancestors;
        let mut current = element.parent();
        while let Some((wanted, rest)) = remaining.split_last() {
            match current {
                Some(candidate) => {
                    if wanted.matches(&candidate) {
                        remaining = rest;
                    }
                    current = candidate.parent();
                }
                None => return false,
            }
        }
        true
    }
}

/// The page document: `<html>` with `<head>` and `<body>`.
pub struct Document {
    target: EventTarget,
    html: Element,
    head: Element,
    body: Element,
    proto: Arc<EventTargetProto>,
}

impl Document {
    pub(crate) fn new(target: EventTarget, proto: Arc<EventTargetProto>) -> Self {
        let html = Element::new("html", proto.clone());
        let head = Element::new("head", proto.clone());
        let body = Element::new("body", proto.clone());
        html.target().set_parent(Some(&target));
        html.append_child(&head);
        html.append_child(&body);
        Self {
            target,
            html,
            head,
            body,
            proto,
        }
    }

    /// The document as an event target.
    pub fn target(&self) -> &EventTarget {
        &self.target
    }

    /// `document.documentElement`
    pub fn document_element(&self) -> &Element {
        &self.html
    }

    /// `document.head`
    pub fn head(&self) -> &Element {
        &self.head
    }

    /// `document.body`
    pub fn body(&self) -> &Element {
        &self.body
    }

    /// `document.createElement(tag)`
    pub fn create_element(&self, tag: &str) -> Element {
        Element::new(tag, self.proto.clone())
    }

    /// `document.querySelector`, including `<html>` itself.
    pub fn query_selector(&self, selector: &str) -> Result<Option<Element>, DomError> {
        if self.html.matches(selector)? {
            return Ok(Some(self.html.clone()));
        }
        self.html.query_selector(selector)
    }

    /// `document.querySelectorAll`, including `<html>` itself.
    pub fn query_selector_all(&self, selector: &str) -> Result<Vec<Element>, DomError> {
        let mut all = Vec::new();
        if self.html.matches(selector)? {
            all.push(self.html.clone());
        }
        all.extend(self.html.query_selector_all(selector)?);
        Ok(all)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document").field("html", &self.html).finish()
    }
}

/// Handle of an injected `<style>` element.
#[derive(Debug, Clone)]
pub struct StyleHandle {
    element: Element,
}

impl StyleHandle {
    /// The `<style>` element.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// CSS text.
    pub fn css(&self) -> String {
        self.element.text()
    }

    /// Whether the stylesheet is still in the document.
    pub fn is_attached(&self) -> bool {
        self.element.is_attached()
    }

    /// Removes the stylesheet.
    pub fn remove(&self) {
        self.element.remove();
    }
}

/// View-layer helpers used by features.
///
/// Implementations carry no decision logic; features only rely on the
/// promise/handle contracts.
#[async_trait]
pub trait DomAccessor: Send + Sync {
    /// Finds the first element matching a selector.
    ///
    /// # Arguments
    ///
    /// * `selector` - CSS selector string
    ///
    /// # Returns
    ///
    /// The first matching element, or None if not found or the selector is invalid.
    fn query(&self, selector: &str) -> Option<Element>;

    /// Finds all elements matching a selector.
    fn query_all(&self, selector: &str) -> Vec<Element>;

    /// Waits for an element to appear in the DOM.
    ///
    /// # Arguments
    ///
    /// * `selector` - CSS selector for the element
    /// * `timeout_ms` - Maximum time to wait in milliseconds
    ///
    /// # Returns
    ///
    /// The element if found within the timeout, or [`DomError::Timeout`].
    async fn wait_for_element(&self, selector: &str, timeout_ms: u64) -> Result<Element, DomError>;

    /// Injects a stylesheet into `<head>`.
    fn create_style(&self, css: &str) -> StyleHandle;

    /// Creates a detached element with the given classes.
    fn create_element(&self, tag: &str, classes: &[&str]) -> Element;
}

/// [`DomAccessor`] over a page document, polling for waits.
pub struct PageDom {
    document: Arc<Document>,
    poll_interval: Duration,
}

impl PageDom {
    /// Creates helpers for a document.
    pub fn new(document: Arc<Document>) -> Self {
        Self {
            document,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Sets the polling interval of [`DomAccessor::wait_for_element`].
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl DomAccessor for PageDom {
    fn query(&self, selector: &str) -> Option<Element> {
        self.document.query_selector(selector).ok().flatten()
    }

    fn query_all(&self, selector: &str) -> Vec<Element> {
        self.document
            .query_selector_all(selector)
            .unwrap_or_default()
    }

    async fn wait_for_element(&self, selector: &str, timeout_ms: u64) -> Result<Element, DomError> {
        // Surface syntax errors instead of waiting them out.
        Selector::parse(selector)?;

        let poll = async {
            loop {
                if let Some(element) = self.query(selector) {
                    return element;
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), poll).await {
            Ok(element) => {
                trace!("Found {}", selector);
                Ok(element)
            }
            Err(_) => {
                debug!("Timed out waiting for {} after {}ms", selector, timeout_ms);
                Err(DomError::Timeout {
                    selector: selector.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    fn create_style(&self, css: &str) -> StyleHandle {
        let element = self.document.create_element("style");
        element.set_text(css);
        self.document.head().append_child(&element);
        StyleHandle { element }
    }

    fn create_element(&self, tag: &str, classes: &[&str]) -> Element {
        let element = self.document.create_element(tag);
        for class in classes {
            element.add_class(class);
        }
        element
    }
}

impl fmt::Debug for PageDom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageDom")
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}
