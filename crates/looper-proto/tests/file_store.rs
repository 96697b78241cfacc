//! PersistenceStore over real files: what one session writes, the next reads.

use looper_proto::kv::{FileKvStore, KvStore};
use looper_proto::records::{LoopConfigDraft, RecentItemDraft};
use looper_proto::store::{PersistenceStore, KEY_LOOP_CONFIGS, KEY_PLAYLISTS, KEY_WORKING_PLAYLIST};

fn loop_draft(media: &str, start: f64, end: f64) -> LoopConfigDraft {
    LoopConfigDraft {
        media_ref: Some(media.into()),
        start_time: Some(start),
        end_time: Some(end),
        target_loop_count: Some(4),
        playback_rate: Some(0.75),
        title: Some("Solo".into()),
        ..Default::default()
    }
}

#[test]
fn collections_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let (config_id, playlist_id) = {
        let mut store = PersistenceStore::new(FileKvStore::new(dir.path()));
        let config = store
            .save_loop_config(loop_draft("dQw4w9WgXcQ", 12.0, 30.5))
            .unwrap();
        store
            .save_recent(RecentItemDraft {
                media_ref: Some("dQw4w9WgXcQ".into()),
                ..Default::default()
            })
            .unwrap();
        let playlist = store
            .save_playlist("Practice", std::slice::from_ref(&config))
            .unwrap();
        store
            .save_working_playlist(std::slice::from_ref(&config))
            .unwrap();
        (config.id, playlist.id)
    };

    let store = PersistenceStore::new(FileKvStore::new(dir.path()));
    let configs = store.load_loop_configs();
    assert_eq!(configs.dropped, 0);
    assert_eq!(configs.records.len(), 1);
    assert_eq!(configs.records[0].id, config_id);
    assert_eq!(configs.records[0].playback_rate, 0.75);
    assert_eq!(configs.records[0].start_time, 12.0);

    assert_eq!(store.load_recent().records.len(), 1);

    let playlist = store.find_playlist(&playlist_id).unwrap();
    assert_eq!(playlist.name, "Practice");
    assert_eq!(playlist.entries[0].id, config_id);

    assert_eq!(store.load_working_playlist().records.len(), 1);
}

#[test]
fn corrupt_files_are_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let mut kv = FileKvStore::new(dir.path());
    kv.set(KEY_LOOP_CONFIGS, "not json at all").unwrap();
    kv.set(
        KEY_PLAYLISTS,
        r#"[{"id":"p1","name":"ok","entries":[{"mediaRef":"dQw4w9WgXcQ","startTime":0,"endTime":3,"targetLoopCount":1},{"mediaRef":"nope"}]},{"id":"p2","name":"  "}]"#,
    )
    .unwrap();
    kv.set(KEY_WORKING_PLAYLIST, "[1, 2, 3]").unwrap();

    let store = PersistenceStore::new(kv);

    let configs = store.load_loop_configs();
    assert!(configs.reset);
    assert!(configs.records.is_empty());

    let playlists = store.load_playlists();
    assert_eq!(playlists.records.len(), 1);
    assert_eq!(playlists.records[0].entries.len(), 1);
    // one bad entry + one nameless playlist
    assert_eq!(playlists.dropped, 2);

    let working = store.load_working_playlist();
    assert_eq!(working.dropped, 3);
}

#[test]
fn missing_directory_reads_empty_and_is_created_on_write() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("not").join("yet");
    let mut store = PersistenceStore::new(FileKvStore::new(&nested));
    assert!(store.load_recent().records.is_empty());
    assert!(store.load_default().is_none());

    store
        .save_loop_config(loop_draft("aaaaaaaaaaa", 0.0, 1.0))
        .unwrap();
    assert!(nested.join("loopConfigs.json").exists());
}
