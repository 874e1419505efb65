//! Location and session history of the page.

use crate::browser::event::{Event, EventTarget};
use crate::browser::network::NetworkError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Route of the page as seen by features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    /// Path, always starting with `/`.
    pub pathname: String,
    /// Query string without the leading `?`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Fragment without the leading `#`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl RouteInfo {
    fn from_url(url: &Url) -> Self {
        Self {
            pathname: url.path().to_string(),
            query: url.query().map(str::to_string),
            hash: url.fragment().map(str::to_string),
        }
    }
}

/// `window.location`. Cheap to clone; clones share the same URL.
#[derive(Debug, Clone)]
pub struct Location {
    url: Arc<RwLock<Url>>,
}

impl Location {
    /// Parses an absolute URL.
    pub fn new(url: &str) -> Result<Self, NetworkError> {
        let url = Url::parse(url).map_err(|e| NetworkError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            url: Arc::new(RwLock::new(url)),
        })
    }

    /// `location.href`
    pub fn href(&self) -> String {
        self.url.read().to_string()
    }

    /// `location.pathname`
    pub fn pathname(&self) -> String {
        self.url.read().path().to_string()
    }

    /// `location.origin`
    pub fn origin(&self) -> String {
        self.url.read().origin().ascii_serialization()
    }

    /// Current route.
    pub fn route(&self) -> RouteInfo {
        RouteInfo::from_url(&self.url.read())
    }

    /// Resolves a possibly relative URL against the current location.
    pub fn resolve(&self, input: &str) -> Result<Url, NetworkError> {
        self.url.read().join(input).map_err(|e| NetworkError::InvalidUrl {
            url: input.to_string(),
            reason: e.to_string(),
        })
    }

    fn url(&self) -> Url {
        self.url.read().clone()
    }

    fn replace(&self, url: Url) {
        *self.url.write() = url;
    }
}

struct HistoryEntries {
    entries: Vec<Url>,
    index: usize,
}

/// `window.history` plus the hash navigation of `location`.
pub struct History {
    location: Location,
    window: EventTarget,
    state: Mutex<HistoryEntries>,
}

impl History {
    pub(crate) fn new(location: Location, window: EventTarget) -> Self {
        let initial = location.url();
        Self {
            location,
            window,
            state: Mutex::new(HistoryEntries {
                entries: vec![initial],
                index: 0,
            }),
        }
    }

    /// `history.pushState(null, "", path)`. Fires nothing.
    pub fn push_state(&self, path: &str) -> Result<(), NetworkError> {
        let url = self.same_origin(path)?;
        {
            let mut state = self.state.lock();
            let keep = state.index + 1;
            state.entries.truncate(keep);
            state.entries.push(url.clone());
            state.index = keep;
        }
        self.location.replace(url);
        Ok(())
    }

    /// `history.replaceState(null, "", path)`. Fires nothing.
    pub fn replace_state(&self, path: &str) -> Result<(), NetworkError> {
        let url = self.same_origin(path)?;
        {
            let mut state = self.state.lock();
            let index = state.index;
            state.entries[index] = url.clone();
        }
        self.location.replace(url);
        Ok(())
    }

    /// Router-style navigation: pushes an entry and notifies with `popstate`.
    pub fn navigate(&self, path: &str) -> Result<(), NetworkError> {
        self.push_state(path)?;
        debug!("Navigated to {}", self.location.pathname());
        self.window.dispatch_event(&Event::non_bubbling("popstate"));
        Ok(())
    }

    /// `history.back()`. Returns `false` at the first entry.
    pub fn back(&self) -> bool {
        self.traverse(-1)
    }

    /// `history.forward()`. Returns `false` at the last entry.
    pub fn forward(&self) -> bool {
        self.traverse(1)
    }

    /// Assigns `location.hash`, firing `hashchange` when it changes.
    pub fn set_hash(&self, hash: &str) {
        let mut url = self.location.url();
        let fragment = hash.trim_start_matches('#');
        if url.fragment() == Some(fragment) {
            return;
        }
        url.set_fragment(Some(fragment));
        {
            let mut state = self.state.lock();
            let keep = state.index + 1;
            state.entries.truncate(keep);
            state.entries.push(url.clone());
            state.index = keep;
        }
        self.location.replace(url);
        self.window.dispatch_event(&Event::non_bubbling("hashchange"));
    }

    /// Number of session history entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the history is empty (never, a page always has one entry).
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    fn traverse(&self, delta: isize) -> bool {
        let target = {
            let mut state = self.state.lock();
            let next = state.index as isize + delta;
            if next < 0 || next as usize >= state.entries.len() {
                return false;
            }
            state.index = next as usize;
            state.entries[state.index].clone()
        };
        self.location.replace(target);
        self.window.dispatch_event(&Event::non_bubbling("popstate"));
        true
    }

    fn same_origin(&self, path: &str) -> Result<Url, NetworkError> {
        let url = self.location.resolve(path)?;
        if url.origin().ascii_serialization() != self.location.origin() {
            return Err(NetworkError::InvalidUrl {
                url: path.to_string(),
                reason: "history entries must stay on the page origin".to_string(),
            });
        }
        Ok(url)
    }
}

impl std::fmt::Debug for History {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("History")
            .field("len", &state.entries.len())
            .field("index", &state.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::event::{EventTargetProto, Listener, ListenerOptions, TargetKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn history() -> (History, Location, Arc<AtomicUsize>) {
        let location = Location::new("https://lms.example.edu/user/index").unwrap();
        let window = EventTarget::new(TargetKind::Window, "window", Arc::new(EventTargetProto::new()));
        let pops = Arc::new(AtomicUsize::new(0));
        let counter = pops.clone();
        window.add_event_listener(
            "popstate",
            Listener::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            ListenerOptions::default(),
        );
        (History::new(location.clone(), window), location, pops)
    }

    #[test]
    fn test_push_state_is_silent() {
        let (history, location, pops) = history();
        history.push_state("/course/12/content").unwrap();
        assert_eq!(location.pathname(), "/course/12/content");
        assert_eq!(pops.load(Ordering::SeqCst), 0);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_back_and_forward_fire_popstate() {
        let (history, location, pops) = history();
        history.push_state("/course/12/content").unwrap();
        assert!(history.back());
        assert_eq!(location.pathname(), "/user/index");
        assert!(!history.back());
        assert!(history.forward());
        assert_eq!(location.pathname(), "/course/12/content");
        assert_eq!(pops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cross_origin_push_is_rejected() {
        let (history, _, _) = history();
        assert!(history.push_state("https://evil.example.com/").is_err());
    }

    #[test]
    fn test_route_info() {
        let location = Location::new("https://lms.example.edu/course/3/learning-activity?x=1#/full-screen/9").unwrap();
        let route = location.route();
        assert_eq!(route.pathname, "/course/3/learning-activity");
        assert_eq!(route.query.as_deref(), Some("x=1"));
        assert_eq!(route.hash.as_deref(), Some("/full-screen/9"));
    }
}
