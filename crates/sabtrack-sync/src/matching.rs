//! Title canonicalization, match scoring, and category routing to catalogs.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use sabtrack_adapters::{parse_release, CatalogEntry, CatalogSource};
use sabtrack_core::MediaMatch;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::debug;

/// Minimum score for an automatic match.
pub const ACCEPTANCE_THRESHOLD: u8 = 60;

const STOP_WORDS: &[&str] = &["the", "a", "an", "of", "and", "or", "in", "to", "for"];

fn bracketed() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\([^)]*\)|\[[^\]]*\]|\{[^}]*\}").expect("bracket pattern is valid")
    })
}

fn canonical_word(word: &str) -> &str {
    match word {
        "dr" => "doctor",
        "mr" => "mister",
        "mrs" => "missus",
        "st" => "saint",
        "i" => "1",
        "ii" => "2",
        "iii" => "3",
        "iv" => "4",
        "v" => "5",
        "vi" => "6",
        "vii" => "7",
        "viii" => "8",
        "ix" => "9",
        "x" => "10",
        other => other,
    }
}

/// Canonical comparison form of a title.
///
/// Bracketed groups (`(1995)`, `[1080p]`) are dropped, `._-` become spaces,
/// everything else that is not alphanumeric is removed, then abbreviations and
/// roman numerals I-X are rewritten word by word. `clean(clean(x)) == clean(x)`.
pub fn clean(title: &str) -> String {
    let without_groups = bracketed().replace_all(title, " ");
    let spaced: String = without_groups
        .chars()
        .map(|c| if matches!(c, '.' | '_' | '-') { ' ' } else { c })
        .collect::<String>()
        .to_lowercase();
    let stripped: String = spaced
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    stripped
        .split_whitespace()
        .map(canonical_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn content_words(cleaned: &str) -> BTreeSet<&str> {
    cleaned
        .split_whitespace()
        .filter(|w| !STOP_WORDS.contains(w))
        .collect()
}

/// Confidence in `0..=100` that a download title names a catalog entry.
pub fn score(
    download_title: &str,
    catalog_title: &str,
    download_year: Option<i32>,
    catalog_year: Option<i32>,
) -> u8 {
    if download_title.trim().is_empty() || catalog_title.trim().is_empty() {
        return 0;
    }
    let ours = clean(download_title);
    let theirs = clean(catalog_title);
    if ours.is_empty() || theirs.is_empty() {
        return 0;
    }

    let mut total: i32 = if ours == theirs {
        100
    } else {
        let ours_words = content_words(&ours);
        let theirs_words = content_words(&theirs);
        if ours_words.is_empty() || theirs_words.is_empty() {
            return 0;
        }
        let shared = ours_words.intersection(&theirs_words).count();
        let ratio = shared as f64 / ours_words.len().max(theirs_words.len()) as f64;
        if ratio < 0.5 {
            return 0;
        }
        let mut base = (ratio * 70.0).floor() as i32;
        if theirs_words.is_subset(&ours_words) {
            base += 20;
        }
        base
    };

    let known = |year: Option<i32>| year.filter(|y| *y > 0);
    if let (Some(a), Some(b)) = (known(download_year), known(catalog_year)) {
        total += match (a - b).abs() {
            0 => 30,
            1 => 10,
            _ => -50,
        };
    }

    total.clamp(0, 100) as u8
}

#[derive(Debug, Clone, Error)]
#[error("catalog {catalog} unavailable: {detail}")]
pub struct CatalogUnavailable {
    pub catalog: String,
    pub detail: String,
}

/// Catalog listings fetched during one enrichment tick, failures included.
#[derive(Debug, Default)]
pub struct EntryCache {
    listings: HashMap<String, Result<Arc<Vec<CatalogEntry>>, String>>,
}

impl EntryCache {
    async fn entries(
        &mut self,
        catalog: &dyn CatalogSource,
    ) -> Result<Arc<Vec<CatalogEntry>>, CatalogUnavailable> {
        if !self.listings.contains_key(catalog.name()) {
            let fetched = catalog
                .list_entries()
                .await
                .map(Arc::new)
                .map_err(|err| err.to_string());
            self.listings.insert(catalog.name().to_string(), fetched);
        }
        match self.listings.get(catalog.name()) {
            Some(Ok(entries)) => Ok(Arc::clone(entries)),
            Some(Err(detail)) => Err(CatalogUnavailable {
                catalog: catalog.name().to_string(),
                detail: detail.clone(),
            }),
            None => Ok(Arc::new(Vec::new())),
        }
    }
}

/// Routes a release to the catalog bound to its category.
#[derive(Clone, Default)]
pub struct CatalogRouter {
    catalogs: Vec<Arc<dyn CatalogSource>>,
}

impl std::fmt::Debug for CatalogRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.catalogs.iter().map(|c| (c.name(), c.category())))
            .finish()
    }
}

impl CatalogRouter {
    pub fn new(catalogs: Vec<Arc<dyn CatalogSource>>) -> Self {
        Self { catalogs }
    }

    pub fn catalog_for(&self, category: Option<&str>) -> Option<&Arc<dyn CatalogSource>> {
        let category = category.map(str::trim).filter(|c| !c.is_empty())?;
        self.catalogs.iter().find(|c| c.category() == category)
    }

    /// Find media metadata for `release_name`.
    ///
    /// A release without a category, or whose category no catalog claims, is
    /// never matched.
    pub async fn route(
        &self,
        cache: &mut EntryCache,
        release_name: &str,
        category: Option<&str>,
    ) -> Result<Option<MediaMatch>, CatalogUnavailable> {
        let Some(catalog) = self.catalog_for(category) else {
            debug!(target: "sabtrack::category", release = release_name, ?category, "no catalog for category");
            return Ok(None);
        };
        debug!(target: "sabtrack::category", release = release_name, catalog = catalog.name(), "routing release");

        let entries = cache.entries(catalog.as_ref()).await?;
        Ok(best_match(catalog.as_ref(), release_name, &entries))
    }
}

/// Highest-scoring entry at or above the acceptance threshold.
///
/// Equal scores are split by Jaro-Winkler similarity of the cleaned titles.
pub fn best_match(
    catalog: &dyn CatalogSource,
    release_name: &str,
    entries: &[CatalogEntry],
) -> Option<MediaMatch> {
    let release = parse_release(release_name);
    let wanted = clean(&release.title);

    let mut best: Option<(u8, f64, &CatalogEntry)> = None;
    for entry in entries {
        let points = score(&release.title, &entry.title, release.year, entry.year);
        if points < ACCEPTANCE_THRESHOLD {
            continue;
        }
        let similarity = jaro_winkler(&wanted, &clean(&entry.title));
        debug!(
            target: "sabtrack::matching",
            release = %release.title,
            candidate = %entry.title,
            score = points,
            similarity,
            "candidate cleared threshold"
        );
        let better = match best {
            None => true,
            Some((top, top_similarity, _)) => {
                points > top || (points == top && similarity > top_similarity)
            }
        };
        if better {
            best = Some((points, similarity, entry));
        }
    }

    let (points, _, entry) = best?;
    debug!(
        target: "sabtrack::matching",
        release = %release.title,
        matched = %entry.title,
        score = points,
        catalog = catalog.name(),
        "release matched"
    );
    Some(MediaMatch {
        media_type: catalog.media_type(),
        media_title: entry.title.clone(),
        poster_url: entry.poster_url(catalog.base_url()),
        year: entry.year,
        catalog_instance: catalog.name().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sabtrack_adapters::{AdapterError, CatalogImage};
    use sabtrack_core::MediaType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticCatalog {
        name: &'static str,
        category: &'static str,
        kind: MediaType,
        entries: Vec<CatalogEntry>,
        calls: AtomicUsize,
        broken: bool,
    }

    impl StaticCatalog {
        fn movies(entries: Vec<CatalogEntry>) -> Self {
            Self {
                name: "radarr",
                category: "movies",
                kind: MediaType::Movie,
                entries,
                calls: AtomicUsize::new(0),
                broken: false,
            }
        }
    }

    #[async_trait]
    impl CatalogSource for StaticCatalog {
        fn name(&self) -> &str {
            self.name
        }
        fn media_type(&self) -> MediaType {
            self.kind
        }
        fn category(&self) -> &str {
            self.category
        }
        fn base_url(&self) -> &str {
            "http://radarr:7878"
        }
        async fn list_entries(&self) -> Result<Vec<CatalogEntry>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                return Err(AdapterError::Malformed {
                    what: "catalog",
                    detail: "connection refused".into(),
                });
            }
            Ok(self.entries.clone())
        }
    }

    fn entry(title: &str, year: i32) -> CatalogEntry {
        CatalogEntry {
            title: title.to_string(),
            year: Some(year),
            images: vec![CatalogImage {
                cover_type: Some("poster".into()),
                url: Some(format!("/MediaCover/{year}/poster.jpg")),
                remote_url: None,
            }],
        }
    }

    #[test]
    fn clean_drops_bracket_groups_and_is_idempotent() {
        let once = clean("Se7en (1995) [1080p]");
        assert_eq!(once, "se7en");
        assert_eq!(clean(&once), once);

        for raw in ["Dr. Strangelove", "Rocky.IV", "St_Elmo's-Fire", "Mr. & Mrs. Smith", "  X  "] {
            let c = clean(raw);
            assert_eq!(clean(&c), c, "{raw}");
        }
    }

    #[test]
    fn clean_expands_abbreviations_and_numerals() {
        assert_eq!(clean("Dr. Strangelove"), "doctor strangelove");
        assert_eq!(clean("Rocky.IV"), "rocky 4");
        assert_eq!(clean("Mr. & Mrs. Smith"), "mister missus smith");
        assert_eq!(clean("Star_Wars-Episode.VIII"), "star wars episode 8");
        assert_eq!(clean("Vivid"), "vivid");
    }

    #[test]
    fn stop_words_and_year_clear_threshold() {
        assert!(score("the matrix", "matrix", Some(1999), Some(1999)) >= ACCEPTANCE_THRESHOLD);
        assert!(score("the matrix", "matrix reloaded", Some(1999), Some(2003)) < ACCEPTANCE_THRESHOLD);
    }

    #[test]
    fn score_components() {
        assert_eq!(score("", "matrix", None, None), 0);
        assert_eq!(score("Heat", "Heat", None, None), 100);
        assert_eq!(score("Heat", "Heat", Some(1995), Some(1996)), 100);
        assert_eq!(score("Heat", "Heat", Some(1995), Some(2010)), 50);
        assert_eq!(score("the", "a", None, None), 0);
        assert_eq!(score("blue planet", "red desert", None, None), 0);
        // two of three words shared: floor(2/3 * 70) = 46, no containment bonus
        assert_eq!(score("blade runner final", "blade runner 2049", None, None), 46);
        // catalog words contained: floor(2/3 * 70) + 20 = 66
        assert_eq!(score("blade runner final", "blade runner", None, None), 66);
        assert_eq!(score("blade runner final cut", "blade runner", None, None), 55);
    }

    #[test]
    fn non_positive_year_counts_as_unknown() {
        assert_eq!(score("Heat", "Heat", Some(1995), Some(0)), 100);
        assert_eq!(score("Heat", "Heat", Some(0), Some(1995)), 100);
        assert_eq!(score("the matrix", "matrix", Some(1999), Some(-1)), score("the matrix", "matrix", Some(1999), None));
    }

    #[tokio::test]
    async fn router_requires_a_bound_category() {
        let catalog = Arc::new(StaticCatalog::movies(vec![entry("The Matrix", 1999)]));
        let router = CatalogRouter::new(vec![catalog.clone() as Arc<dyn CatalogSource>]);
        let mut cache = EntryCache::default();

        assert_eq!(router.route(&mut cache, "The.Matrix.1999.1080p", None).await.unwrap(), None);
        assert_eq!(router.route(&mut cache, "The.Matrix.1999.1080p", Some("tv")).await.unwrap(), None);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 0);

        let found = router
            .route(&mut cache, "The.Matrix.1999.1080p.BluRay", Some("movies"))
            .await
            .unwrap()
            .expect("match");
        assert_eq!(found.media_title, "The Matrix");
        assert_eq!(found.media_type, MediaType::Movie);
        assert_eq!(found.catalog_instance, "radarr");
        assert_eq!(found.poster_url.as_deref(), Some("http://radarr:7878/MediaCover/1999/poster.jpg"));
    }

    #[tokio::test]
    async fn router_prefers_the_right_year_and_caches_listings() {
        let catalog = Arc::new(StaticCatalog::movies(vec![
            entry("Heat", 1986),
            entry("Heat", 1995),
            entry("The Heat", 2013),
        ]));
        let router = CatalogRouter::new(vec![catalog.clone() as Arc<dyn CatalogSource>]);
        let mut cache = EntryCache::default();

        let found = router
            .route(&mut cache, "Heat.1995.REMUX.2160p", Some("movies"))
            .await
            .unwrap()
            .expect("match");
        assert_eq!(found.year, Some(1995));

        let missing = router
            .route(&mut cache, "Completely.Different.2001", Some("movies"))
            .await
            .unwrap();
        assert_eq!(missing, None);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_catalog_is_reported_once_per_tick() {
        let mut broken = StaticCatalog::movies(vec![]);
        broken.broken = true;
        let catalog = Arc::new(broken);
        let router = CatalogRouter::new(vec![catalog.clone() as Arc<dyn CatalogSource>]);
        let mut cache = EntryCache::default();

        assert!(router.route(&mut cache, "Heat.1995", Some("movies")).await.is_err());
        assert!(router.route(&mut cache, "Ronin.1998", Some("movies")).await.is_err());
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }
}
