use std::path::PathBuf;

use sabtrack_adapters::{
    observed_ids, read_json_file, CatalogEntry, FixtureQueueSource, QueueSource,
};
use sabtrack_core::DownloadStatus;

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[tokio::test]
async fn recorded_queue_classifies_by_position() {
    let source = FixtureQueueSource::new(fixtures_root().join("sabnzbd"));
    let queue = source.fetch_queue().await.expect("queue fixture parses");

    assert_eq!(queue.rejected, 1);
    assert_eq!(queue.speed_mbps, 12.5);
    let summary: Vec<_> = queue
        .items
        .iter()
        .map(|i| (i.id.as_str(), i.status, i.queue_position))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("SABnzbd_nzo_matrix", DownloadStatus::Downloading, Some(1)),
            ("SABnzbd_nzo_show", DownloadStatus::Queued, Some(2)),
            ("SABnzbd_nzo_paused", DownloadStatus::Paused, Some(3)),
        ]
    );

    let matrix = &queue.items[0];
    assert_eq!(matrix.speed_mbps, 12.5);
    assert_eq!(matrix.progress_percent, 42.0);
    assert_eq!(matrix.category.as_deref(), Some("movies"));

    let show = &queue.items[1];
    assert_eq!(show.season, Some(1));
    assert_eq!(show.episode, Some(12));
    assert_eq!(show.priority.as_deref(), Some("1"));
    assert_eq!(show.speed_mbps, 0.0);
}

#[tokio::test]
async fn recorded_history_separates_post_processing() {
    let source = FixtureQueueSource::new(fixtures_root().join("sabnzbd"));
    let history = source.fetch_history(100).await.expect("history fixture parses");

    let busy: Vec<_> = history
        .post_processing
        .iter()
        .map(|job| (job.id.as_str(), job.phase.as_str()))
        .collect();
    assert_eq!(busy, vec![("SABnzbd_nzo_unpacking", "Extracting")]);
    let terminal: Vec<_> = history
        .items
        .iter()
        .map(|i| (i.id.as_str(), i.status))
        .collect();
    assert_eq!(
        terminal,
        vec![
            ("SABnzbd_nzo_se7en", DownloadStatus::Completed),
            ("SABnzbd_nzo_broken", DownloadStatus::Failed),
            ("SABnzbd_nzo_old", DownloadStatus::Completed),
        ]
    );
    assert_eq!(history.items[2].category, None);
    assert_eq!(
        history.items[1].failure_reason.as_deref(),
        Some("Aborted, cannot be completed")
    );

    let truncated = source.fetch_history(1).await.unwrap();
    assert_eq!(truncated.items.len(), 1);
}

#[tokio::test]
async fn observed_ids_cover_queue_history_and_post_processing() {
    let source = FixtureQueueSource::new(fixtures_root().join("sabnzbd"));
    let queue = source.fetch_queue().await.unwrap();
    let history = source.fetch_history(100).await.unwrap();

    let mut ids: Vec<_> = observed_ids(&queue.items, &history).collect();
    ids.sort_unstable();
    assert_eq!(ids.len(), 7);
    assert!(ids.contains(&"SABnzbd_nzo_unpacking"));
}

#[test]
fn recorded_catalog_listings_resolve_posters() {
    let movies: Vec<CatalogEntry> =
        read_json_file(fixtures_root().join("radarr/movies.json")).unwrap();
    assert_eq!(movies.len(), 3);
    assert_eq!(
        movies[1].poster_url("http://radarr:7878").as_deref(),
        Some("http://radarr:7878/MediaCover/2/poster.jpg")
    );
    assert_eq!(movies[2].poster_url("http://radarr:7878"), None);

    let series: Vec<CatalogEntry> =
        read_json_file(fixtures_root().join("sonarr/series.json")).unwrap();
    assert_eq!(
        series[0].poster_url("http://sonarr:8989").as_deref(),
        Some("https://artworks.thetvdb.com/banners/someshow.jpg")
    );
}
