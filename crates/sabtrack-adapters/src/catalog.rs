use std::sync::Arc;

use async_trait::async_trait;
use sabtrack_core::MediaType;
use sabtrack_storage::{HttpFetcher, JsonRequest};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::{AdapterError, CatalogSource};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogImage {
    #[serde(rename = "coverType")]
    pub cover_type: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "remoteUrl")]
    pub remote_url: Option<String>,
}

/// One movie or series as listed by a Radarr/Sonarr-style catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogEntry {
    pub title: String,
    /// Catalogs report `0` for an unknown year.
    #[serde(deserialize_with = "known_year")]
    pub year: Option<i32>,
    pub images: Vec<CatalogImage>,
}

fn known_year<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i32>, D::Error> {
    Ok(Option::<i32>::deserialize(deserializer)?.filter(|year| *year > 0))
}

impl CatalogEntry {
    /// The poster image URL, preferring the absolute remote copy.
    ///
    /// Relative local URLs are joined onto `base_url`.
    pub fn poster_url(&self, base_url: &str) -> Option<String> {
        let poster = self.images.iter().find(|img| {
            img.cover_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("poster"))
        })?;

        fn pick(raw: &Option<String>) -> Option<&str> {
            raw.as_deref().map(str::trim).filter(|s| !s.is_empty())
        }
        if let Some(remote) = pick(&poster.remote_url) {
            return Some(remote.to_string());
        }
        let local = pick(&poster.url)?;
        if local.starts_with("http://") || local.starts_with("https://") {
            Some(local.to_string())
        } else {
            Some(format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                local.trim_start_matches('/')
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArrCatalogConfig {
    pub name: String,
    pub kind: MediaType,
    pub url: String,
    pub api_key: String,
    pub category: String,
}

#[derive(Debug, Clone)]
pub struct ArrCatalog {
    config: ArrCatalogConfig,
    http: Arc<HttpFetcher>,
}

impl ArrCatalog {
    pub fn new(mut config: ArrCatalogConfig, http: Arc<HttpFetcher>) -> Self {
        config.url = config.url.trim_end_matches('/').to_string();
        Self { config, http }
    }

    fn listing_path(&self) -> &'static str {
        match self.config.kind {
            MediaType::Movie => "/api/v3/movie",
            MediaType::Tv => "/api/v3/series",
        }
    }
}

#[async_trait]
impl CatalogSource for ArrCatalog {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn media_type(&self) -> MediaType {
        self.config.kind
    }

    fn category(&self) -> &str {
        &self.config.category
    }

    fn base_url(&self) -> &str {
        &self.config.url
    }

    async fn list_entries(&self) -> Result<Vec<CatalogEntry>, AdapterError> {
        let url = format!("{}{}", self.config.url, self.listing_path());
        let request =
            JsonRequest::get(&self.config.name, &url).header("X-Api-Key", &self.config.api_key);
        let entries: Vec<CatalogEntry> = self.http.fetch_json(request).await?;
        debug!(
            target: "sabtrack::poster",
            catalog = %self.config.name,
            entries = entries.len(),
            "catalog listing fetched"
        );
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(images: serde_json::Value) -> CatalogEntry {
        serde_json::from_value(json!({ "title": "Heat", "year": 1995, "images": images })).unwrap()
    }

    #[test]
    fn remote_poster_url_wins() {
        let e = entry(json!([
            {"coverType": "fanart", "remoteUrl": "https://img/fanart.jpg"},
            {"coverType": "poster", "url": "/MediaCover/1/poster.jpg", "remoteUrl": "https://img/poster.jpg"}
        ]));
        assert_eq!(e.poster_url("http://radarr:7878").as_deref(), Some("https://img/poster.jpg"));
    }

    #[test]
    fn relative_poster_url_is_joined_to_base() {
        let e = entry(json!([{"coverType": "Poster", "url": "/MediaCover/1/poster.jpg"}]));
        assert_eq!(
            e.poster_url("http://radarr:7878/").as_deref(),
            Some("http://radarr:7878/MediaCover/1/poster.jpg")
        );
    }

    #[test]
    fn zero_or_missing_year_is_unknown() {
        let zero: CatalogEntry = serde_json::from_value(json!({ "title": "Heat", "year": 0 })).unwrap();
        assert_eq!(zero.year, None);
        let missing: CatalogEntry = serde_json::from_value(json!({ "title": "Heat" })).unwrap();
        assert_eq!(missing.year, None);
        assert_eq!(entry(json!([])).year, Some(1995));
    }

    #[test]
    fn entry_without_poster_has_no_url() {
        let e = entry(json!([{"coverType": "banner", "remoteUrl": "https://img/banner.jpg"}]));
        assert_eq!(e.poster_url("http://radarr:7878"), None);
        assert_eq!(entry(json!([])).poster_url("http://radarr:7878"), None);
    }

    #[test]
    fn catalog_entries_tolerate_missing_fields() {
        let e: CatalogEntry = serde_json::from_value(json!({"title": "Dune", "tmdbId": 1})).unwrap();
        assert_eq!(e.year, None);
        assert!(e.images.is_empty());
    }
}
