//! Scenarios for non-HTTP sources: inline `data:` manifests and `file:`
//! playlists republished by atomic rename.

mod common;

use std::time::Duration;

use base64::Engine as _;
use common::media_playlist;
use hls_fetch::{create_reader, PlaylistError, PlaylistReader, PlaylistSnapshot, ReaderOptions};
use url::Url;

async fn collect(
    mut reader: PlaylistReader,
) -> (Vec<PlaylistSnapshot>, Option<PlaylistError>) {
    let mut snapshots = Vec::new();
    let mut failure = None;
    while let Some(item) = reader.next().await {
        match item {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    (snapshots, failure)
}

#[tokio::test]
async fn data_url_delivers_once_then_refuses_updates() {
    let manifest = media_playlist(0, 3, 2, false);
    let encoded = base64::engine::general_purpose::STANDARD.encode(&manifest);
    let url = Url::parse(&format!(
        "data:application/vnd.apple.mpegurl;base64,{encoded}"
    ))
    .unwrap();

    let mut reader = create_reader(url, ReaderOptions::default()).unwrap();

    let first = reader.next().await.unwrap().unwrap();
    assert!(first.index.is_live());
    assert_eq!(first.last_msn(true), Some(2));

    let err = reader.next().await.unwrap().unwrap_err();
    assert!(err.to_string().contains("data: uri cannot be updated"));
    assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn file_playlist_follows_atomic_renames() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("index.m3u8");
    std::fs::write(&target, media_playlist(0, 3, 2, false)).unwrap();
    let url = Url::from_file_path(&target).unwrap();

    let reader = create_reader(url, ReaderOptions::default()).unwrap();

    // Republish the playlist every 50ms the way encoders do: write a staging
    // file, then rename it over the watched one.
    let publish_dir = dir.path().to_path_buf();
    let writer = tokio::spawn(async move {
        for msn in 1..=5u64 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let staged = publish_dir.join("next.m3u8");
            std::fs::write(&staged, media_playlist(msn, 3, 2, msn == 5)).unwrap();
            std::fs::rename(&staged, publish_dir.join("index.m3u8")).unwrap();
        }
    });

    let (snapshots, failure) = collect(reader).await;
    writer.await.unwrap();

    assert!(failure.is_none());
    assert_eq!(snapshots.len(), 6);
    let sequences: Vec<u64> = snapshots
        .iter()
        .map(|s| s.index.as_media().unwrap().media_sequence)
        .collect();
    assert!(
        sequences.windows(2).all(|w| w[0] < w[1]),
        "media sequences should strictly increase: {sequences:?}"
    );
    assert!(!snapshots.last().unwrap().index.is_live());
}

#[tokio::test]
async fn file_vod_closes_after_one_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("vod.m3u8");
    std::fs::write(&target, media_playlist(0, 4, 2, true)).unwrap();
    let url = Url::from_file_path(&target).unwrap();

    let reader = create_reader(url, ReaderOptions::default()).unwrap();
    let (snapshots, failure) = collect(reader).await;
    assert!(failure.is_none());
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].last_msn(true), Some(3));
}
