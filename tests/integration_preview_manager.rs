#![cfg(feature = "integration-test-api")]

use std::sync::Arc;
use std::time::Duration;

use scrub_preview_core::session::{DecodingSession, ReadyState};
use scrub_preview_core::test_support::{FakeBackend, FakeSession};
use scrub_preview_core::{PreviewConfig, PreviewManager, StreamKind};

const SOURCE: &str = "http://media/lecture.mp4";

fn ready_primary() -> Arc<FakeSession> {
    let primary = FakeSession::new(1920, 1080);
    primary.set_ready_state(ReadyState::HaveEnoughData);
    primary
}

fn no_prefetch() -> PreviewConfig {
    PreviewConfig {
        prefetch_ahead: Some(0),
        ..PreviewConfig::default()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

#[tokio::test(start_paused = true)]
async fn playback_fills_the_cache_and_scrubbing_reuses_it() {
    let backend = FakeBackend::new();
    let primary = ready_primary();
    let manager = PreviewManager::with_config(
        &backend,
        primary.clone(),
        Some(SOURCE),
        StreamKind::Native,
        false,
        no_prefetch(),
    )
    .expect("manager");

    for time in [1.0, 5.0, 9.0] {
        primary.play_to(time);
        settle().await;
    }
    assert_eq!(manager.cached_count(), 3);
    assert_eq!(manager.highest_cached_index(), Some(2));

    for index in 0..3 {
        let preview = manager
            .retrieve_preview_for_segment(index)
            .await
            .expect("cached preview");
        assert_eq!(preview.width(), 200);
        assert_eq!(preview.height(), 112);
        assert!(manager.registry().resolve(preview.url()).is_some());
    }
    assert!(backend.headless().seek_log().is_empty());
    assert_eq!(primary.frames_read(), 3);
}

#[tokio::test(start_paused = true)]
async fn seeking_far_away_captures_the_new_position() {
    let backend = FakeBackend::new();
    let primary = ready_primary();
    let manager = PreviewManager::with_config(
        &backend,
        primary.clone(),
        Some(SOURCE),
        StreamKind::Native,
        false,
        no_prefetch(),
    )
    .expect("manager");

    primary.play_to(1.0);
    settle().await;
    primary.user_seek(40.0);
    primary.play_to(40.5);
    settle().await;

    assert!(manager.cached_preview(0).is_some());
    assert!(manager.cached_preview(10).is_some());
    assert_eq!(manager.highest_cached_index(), Some(10));
}

#[tokio::test(start_paused = true)]
async fn background_jobs_fill_the_gaps_ahead_of_playback() {
    let backend = FakeBackend::new();
    let primary = ready_primary();
    let manager = PreviewManager::with_config(
        &backend,
        primary.clone(),
        Some(SOURCE),
        StreamKind::Native,
        false,
        PreviewConfig {
            prefetch_ahead: Some(4),
            ..PreviewConfig::default()
        },
    )
    .expect("manager");

    assert!(manager.retrieve_preview_for_segment(0).await.is_some());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(manager.cached_count(), 5);

    // Already cached by prefetch; playing over it must not capture again.
    primary.play_to(9.0);
    settle().await;
    assert_eq!(primary.frames_read(), 0);
    assert_eq!(manager.stats().completed, 5);
}

#[tokio::test(start_paused = true)]
async fn hls_sources_go_through_the_stream_factory() {
    let backend = FakeBackend::with_stream_factory();
    let url = "http://media/live/master.m3u8";
    let manager = PreviewManager::with_config(
        &backend,
        ready_primary(),
        Some(url),
        StreamKind::from_kind_and_url(None, url),
        false,
        no_prefetch(),
    )
    .expect("manager");

    let log = backend.stream_log().expect("factory");
    assert_eq!((log.created, log.attached), (1, 1));
    assert_eq!(log.loaded, vec![url.to_string()]);
    assert!(backend.headless().is_prepared());
    assert!(manager.retrieve_preview_for_segment(2).await.is_some());

    assert!(
        manager
            .change_media_source("http://media/live/other.m3u8")
            .expect("change")
    );
    let log = backend.stream_log().expect("factory");
    assert_eq!((log.created, log.destroyed), (2, 1));

    manager.cleanup();
    let log = backend.stream_log().expect("factory");
    assert_eq!(log.destroyed, log.created);
    assert_eq!(backend.headless().ready_state(), ReadyState::HaveNothing);
}

#[tokio::test(start_paused = true)]
async fn hls_without_support_soft_fails_previews() {
    let backend = FakeBackend::new();
    let manager = PreviewManager::with_config(
        &backend,
        ready_primary(),
        Some("http://media/master.m3u8"),
        StreamKind::Hls,
        false,
        no_prefetch(),
    )
    .expect("manager");

    assert!(backend.headless().loaded_sources().is_empty());
    assert!(manager.retrieve_preview_for_segment(1).await.is_none());
    let stats = manager.stats();
    assert_eq!(stats.soft_failures, 1);
    assert_eq!(stats.hard_failures, 0);
    assert_eq!(manager.cached_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_manager_stops_live_capture() {
    let backend = FakeBackend::new();
    let primary = ready_primary();
    let manager = PreviewManager::new(&backend, primary.clone(), Some(SOURCE), StreamKind::Native, false)
        .expect("manager");
    let registry = Arc::clone(manager.registry());

    primary.play_to(2.0);
    settle().await;
    assert_eq!(registry.len(), manager.cached_count());
    drop(manager);
    assert!(registry.is_empty());

    let frames = primary.frames_read();
    primary.play_to(30.0);
    settle().await;
    assert_eq!(primary.frames_read(), frames);
}
