//! Request classification.
//!
//! Paths under the mount prefix (`/<upstream-host>/...`) are pinned
//! repository paths: `?go-get=1` records and renders a discovery entry,
//! anything else is proxied.  Outside the prefix `?go-get=1` lists the whole
//! cache and every other request falls through to the static site.

use crate::path::PathTriple;
use crate::server::head::is_discovery;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Smart-HTTP request for a pinned repository.
    Proxy(PathTriple),
    /// Discovery request for a pinned repository.
    Discover(PathTriple),
    /// Discovery request outside the mount prefix.
    ListCache,
    /// Under the mount prefix but not a pinned path.
    NotFound,
    /// Everything else: health, metrics and static content.
    Site,
}

pub fn route(path: &str, query: Option<&str>, mount_prefix: &str) -> Route {
    let discovery = is_discovery(query);

    let Some(pinned) = strip_mount(path, mount_prefix) else {
        return if discovery { Route::ListCache } else { Route::Site };
    };

    match PathTriple::parse(pinned) {
        Some(triple) if discovery => Route::Discover(triple),
        Some(triple) => Route::Proxy(triple),
        None => Route::NotFound,
    }
}

/// `path` with `mount_prefix` removed, if it lies below it.
fn strip_mount<'a>(path: &'a str, mount_prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(mount_prefix)?;
    rest.starts_with('/').then_some(rest)
}
