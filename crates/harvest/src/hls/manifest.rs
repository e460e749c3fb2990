// Line-oriented view of an HLS manifest. Only the handful of directives the
// acquisition engine acts on are recognised; everything else is ignored.

use url::Url;

use crate::HarvestError;

pub const COMMENT_MARKER: char = '#';
pub const MANIFEST_SUFFIX: &str = ".m3u8";
pub const VOD_TAG: &str = "#EXT-X-PLAYLIST-TYPE:VOD";
pub const END_LIST_TAG: &str = "#EXT-X-ENDLIST";
pub const KEY_TAG: &str = "#EXT-X-KEY";

/// A fetched manifest. Never mutated; live polling fetches a fresh one.
#[derive(Debug, Clone)]
pub struct Manifest {
    text: String,
    url: Url,
    base_url: Url,
}

impl Manifest {
    pub fn new(url: Url, text: impl Into<String>) -> Result<Self, HarvestError> {
        let base_url = base_url_of(&url)?;
        Ok(Self {
            text: text.into(),
            url,
            base_url,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Directory of the manifest, used to resolve relative URIs.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn is_master(&self) -> bool {
        is_master(&self.text)
    }

    pub fn is_live(&self) -> bool {
        is_live(&self.text)
    }

    pub fn has_end_marker(&self) -> bool {
        has_end_marker(&self.text)
    }

    pub fn declares_key(&self) -> bool {
        declares_key(&self.text)
    }

    /// Variant playlist URIs in listing order, resolved against the base URL.
    pub fn variant_urls(&self) -> Vec<Url> {
        uri_lines(&self.text)
            .filter(|line| is_manifest_reference(line))
            .filter_map(|line| resolve_uri(&self.base_url, line).ok())
            .collect()
    }

    /// Segment URIs in listing order, resolved against the base URL.
    pub fn segment_urls(&self) -> Vec<Url> {
        segment_urls(&self.base_url, &self.text)
    }
}

/// `url` with its last path segment removed.
pub fn base_url_of(url: &Url) -> Result<Url, HarvestError> {
    url.join(".")
        .map_err(|e| HarvestError::invalid_url(url.as_str(), format!("no base URL: {e}")))
}

/// Non-empty lines that are not directives.
fn uri_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(COMMENT_MARKER))
}

/// Whether a URI line points at another manifest. The query string is ignored
/// so signed variant URLs are still recognised.
pub fn is_manifest_reference(line: &str) -> bool {
    let path = line.split(['?', '#']).next().unwrap_or(line);
    path.to_ascii_lowercase().ends_with(MANIFEST_SUFFIX)
}

pub fn is_master(text: &str) -> bool {
    uri_lines(text).any(is_manifest_reference)
}

pub fn is_live(text: &str) -> bool {
    !text.lines().any(|line| line.trim() == VOD_TAG)
}

pub fn has_end_marker(text: &str) -> bool {
    text.lines().any(|line| line.trim() == END_LIST_TAG)
}

pub fn declares_key(text: &str) -> bool {
    text.lines().any(|line| {
        line.trim_start()
            .strip_prefix(KEY_TAG)
            .is_some_and(|rest| rest.starts_with(':'))
    })
}

pub fn resolve_uri(base: &Url, uri: &str) -> Result<Url, HarvestError> {
    base.join(uri).map_err(|e| {
        HarvestError::invalid_url(uri, format!("cannot resolve against {base}: {e}"))
    })
}

/// Absolute segment URLs of a media playlist, in listing order. Lines that
/// cannot be resolved are skipped.
pub fn segment_urls(base: &Url, text: &str) -> Vec<Url> {
    uri_lines(text)
        .filter(|line| !is_manifest_reference(line))
        .filter_map(|line| match resolve_uri(base, line) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(line, error = %e, "Skipping unresolvable segment line");
                None
            }
        })
        .collect()
}
