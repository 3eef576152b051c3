//! URL resolution

use super::{ResolvedVideo, UrlResolver};
use crate::error::{Error, Result};
use std::path::Path;
use url::Url;

/// Uses the URL itself as the handle
///
/// The name comes from a `v=` query parameter when present (video-site watch
/// links), otherwise from the file stem of the last path segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectUrlResolver;

impl DirectUrlResolver {
    pub fn new() -> Self {
        Self
    }
}

impl UrlResolver for DirectUrlResolver {
    fn resolve(&self, url: &str) -> Result<ResolvedVideo> {
        let parsed = Url::parse(url).map_err(|e| Error::Resolve(format!("{url}: {e}")))?;

        let from_query = parsed
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned())
            .filter(|v| !v.is_empty());

        let from_path = || {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
                .and_then(|segment| Path::new(segment).file_stem())
                .map(|stem| stem.to_string_lossy().into_owned())
        };

        let name = from_query
            .or_else(from_path)
            .ok_or_else(|| Error::Resolve(format!("cannot derive a name from {url}")))?;

        Ok(ResolvedVideo {
            handle: url.to_string(),
            name,
        })
    }
}
