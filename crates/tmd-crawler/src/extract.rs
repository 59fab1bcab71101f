use async_trait::async_trait;
use url::Url;

use crate::error::ExtractError;

/// Site specific navigation and extraction of one timeline item.
#[async_trait]
pub trait Extractor<P: ?Sized + Sync>: Send + Sync {
    async fn extract(&self, page: &P, item_url: &str) -> Result<Extraction, ExtractError>;
}

/// What an extractor found on an item page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub item_id: String,
    pub item_timestamp: Option<String>,
    pub image_urls: Vec<String>,
}

impl Extraction {
    /// Builds an extraction out of loosely shaped page data: image urls
    /// that are not absolute http(s) urls are dropped, duplicates are
    /// removed keeping the first occurrence, and a blank timestamp becomes
    /// `None`.
    pub fn new<I, S>(item_id: impl Into<String>, timestamp: Option<&str>, image_urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut urls: Vec<String> = Vec::new();
        for raw in image_urls {
            let raw = raw.as_ref().trim();
            match Url::parse(raw) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {
                    let url = url.to_string();
                    if !urls.contains(&url) {
                        urls.push(url);
                    }
                }
                _ => log::debug!("Dropping malformed image url {raw:?}"),
            }
        }
        Self {
            item_id: item_id.into(),
            item_timestamp: timestamp
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            image_urls: urls,
        }
    }
}

/// Extracts the numeric id from a status url such as
/// `https://x.com/someone/status/1234567890?s=20`.
pub fn parse_item_id(item_url: &str) -> Option<String> {
    let url = Url::parse(item_url).ok()?;
    let mut segments = url.path_segments()?;
    segments.find(|s| *s == "status" || *s == "statuses")?;
    let id = segments.next()?;
    (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then(|| id.to_string())
}

/// File extension of an image url, from its `format` query parameter or
/// its path, `jpg` when neither says.
pub fn image_extension(image_url: &str) -> String {
    let Ok(url) = Url::parse(image_url) else {
        return "jpg".into();
    };
    if let Some((_, format)) = url.query_pairs().find(|(k, _)| k == "format") {
        if is_extension(&format) {
            return format.to_lowercase();
        }
    }
    url.path_segments()
        .and_then(|mut s| s.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| is_extension(ext))
        .map(str::to_lowercase)
        .unwrap_or_else(|| "jpg".into())
}

fn is_extension(s: &str) -> bool {
    !s.is_empty() && s.len() <= 5 && s.bytes().all(|b| b.is_ascii_alphanumeric())
}
