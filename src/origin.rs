//! Origin selection and output naming.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;

use crate::config::MirrorRule;
use crate::error::{Error, Result};

static PATH_EXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.([A-Za-z0-9]{1,5})$").expect("valid regex"));

/// Extension used when neither the content type nor the URL names one.
pub const DEFAULT_EXTENSION: &str = "mp4";

/// Parses a stored or supplied URL, accepting only absolute http(s) URLs.
///
/// # Errors
///
/// Returns [`Error::InvalidState`] if the URL is unusable.
pub fn parse_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| Error::InvalidState(format!("bad URL {url:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(Error::InvalidState(format!("unsupported URL {url:?}"))),
    }
}

/// The two interchangeable locations an asset is fetched from.
///
/// Even segments go to origin A, odd segments to origin B. When no mirror
/// rule matches the URL's host both origins are the same URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPair {
    a: String,
    b: String,
}

impl OriginPair {
    /// Derives the pair for `url` from the configured mirror rules.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the URL cannot be parsed or the
    /// mirror host is not a valid host name.
    pub fn resolve(url: &str, mirrors: &[MirrorRule]) -> Result<Self> {
        let parsed = parse_url(url)?;
        let host = parsed.host_str().unwrap_or_default();

        let counterpart = mirrors.iter().find_map(|rule| {
            if rule.primary.eq_ignore_ascii_case(host) {
                Some(rule.alternate.as_str())
            } else if rule.alternate.eq_ignore_ascii_case(host) {
                Some(rule.primary.as_str())
            } else {
                None
            }
        });

        let b = match counterpart {
            Some(other) => {
                let mut mirrored = parsed.clone();
                mirrored
                    .set_host(Some(other))
                    .map_err(|e| Error::InvalidState(format!("bad mirror host {other:?}: {e}")))?;
                mirrored.to_string()
            }
            None => url.to_string(),
        };

        Ok(Self {
            a: url.to_string(),
            b,
        })
    }

    /// URL to fetch segment `index` from.
    #[must_use]
    pub fn for_segment(&self, index: u64) -> &str {
        if index % 2 == 0 {
            self.a.as_str()
        } else {
            self.b.as_str()
        }
    }

    /// Origin A.
    #[must_use]
    pub fn a(&self) -> &str {
        &self.a
    }

    /// Origin B.
    #[must_use]
    pub fn b(&self) -> &str {
        &self.b
    }
}

/// Maps a `Content-Type` to a file extension.
fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    Some(match mime.as_str() {
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/x-m4v" => "m4v",
        "video/webm" => "webm",
        "video/x-matroska" => "mkv",
        "video/mp2t" => "ts",
        "audio/mpeg" => "mp3",
        "audio/mp4" | "audio/x-m4a" => "m4a",
        "audio/aac" => "aac",
        _ => return None,
    })
}

/// Picks the suffix for an asset's assembled file.
///
/// A recognised content type wins, then the URL path's extension, then
/// [`DEFAULT_EXTENSION`].
#[must_use]
pub fn resolve_extension(url: &str, content_type: Option<&str>) -> String {
    if let Some(ext) = content_type.and_then(extension_for_content_type) {
        return ext.to_string();
    }
    Url::parse(url)
        .ok()
        .and_then(|u| {
            let last = u.path_segments()?.next_back()?.to_string();
            PATH_EXT_RE
                .captures(&last)
                .map(|c| c[1].to_ascii_lowercase())
        })
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}
