//! End-to-end tests for the persistent message store: save/commit/delete
//! flows, paged redelivery queries, restart recovery and segment reclaim.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use brokkr_core::{Header, MessageEntity};
use brokkr_storage::{FileStore, OpBody, OpKind, OpRecord, StoreConfig, StoreError};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn test_config(dir: &tempfile::TempDir) -> StoreConfig {
    init_tracing();
    StoreConfig {
        dir: dir.path().to_path_buf(),
        flush_interval: Duration::from_millis(5),
        check_period: Duration::from_millis(50),
        ..Default::default()
    }
}

fn entity(message_id: &str, next_deliver_time: i64) -> MessageEntity {
    let mut entity = MessageEntity::new(
        message_id,
        Header { topic: "trade".to_string(), ..Default::default() },
        Bytes::from(format!("payload-of-{}", message_id).into_bytes()),
    );
    entity.next_deliver_time = next_deliver_time;
    entity
}

async fn wait_for_flush() {
    tokio::time::sleep(Duration::from_millis(60)).await;
}

fn data_file_count(dir: &tempfile::TempDir) -> usize {
    std::fs::read_dir(dir.path().join("snapshot"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".data"))
        .count()
}

#[tokio::test]
async fn test_save_query_commit_roundtrip() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = FileStore::new(test_config(&dir)).unwrap();
    store.start().await.unwrap();

    let mut saved = entity("m0", 100);
    saved.fail_groups = vec!["group-a".to_string()];
    assert!(store.save(&saved));
    wait_for_flush().await;

    let fetched = store.query("m0").unwrap();
    assert_eq!(fetched.message_id, "m0");
    assert_eq!(fetched.header.topic, "trade");
    assert_eq!(fetched.body, Bytes::from_static(b"payload-of-m0"));
    assert_eq!(fetched.next_deliver_time, 100);
    assert_eq!(fetched.fail_groups, vec!["group-a".to_string()]);
    assert!(!fetched.commit);

    assert!(store.commit("m0"));
    assert!(store.query("m0").unwrap().commit);

    store.stop().await;
}

#[tokio::test]
async fn test_commit_unknown_id_returns_false() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = FileStore::new(test_config(&dir)).unwrap();
    store.start().await.unwrap();

    assert!(!store.commit("missing"));
    // update/delete/expired are idempotent no-ops on unknown ids
    assert!(store.update_entity(&entity("missing", 0)));
    assert!(store.delete("missing"));
    assert!(store.expired("missing"));

    store.stop().await;
}

#[tokio::test]
async fn test_update_entity_overwrites_delivery_state() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = FileStore::new(test_config(&dir)).unwrap();
    store.start().await.unwrap();

    assert!(store.save(&entity("m1", 100)));
    wait_for_flush().await;

    let mut changed = entity("m1", 900);
    changed.deliver_count = 3;
    changed.succ_groups = vec!["done".to_string()];
    assert!(store.update_entity(&changed));

    let fetched = store.query("m1").unwrap();
    assert_eq!(fetched.next_deliver_time, 900);
    assert_eq!(fetched.deliver_count, 3);
    assert_eq!(fetched.succ_groups, vec!["done".to_string()]);
    // update does not touch the commit flag
    assert!(!fetched.commit);

    store.stop().await;
}

#[tokio::test]
async fn test_delete_and_rollback_remove_entries() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = FileStore::new(test_config(&dir)).unwrap();
    store.start().await.unwrap();

    assert!(store.save(&entity("m1", 100)));
    assert!(store.save(&entity("m2", 100)));
    wait_for_flush().await;
    assert_eq!(store.monitor().message_count, 2);

    assert!(store.delete("m1"));
    assert!(store.rollback("m2"));
    assert_eq!(store.monitor().message_count, 0);
    assert!(matches!(store.query("m1"), Err(StoreError::NotFound(_))));

    store.stop().await;
}

#[tokio::test]
async fn test_concurrent_saves_to_same_shard() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(FileStore::new(test_config(&dir)).unwrap());
    store.start().await.unwrap();

    // both ids end in '0' and serialize on the same shard lock
    let first = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || store.save(&entity("task-a0", 100)))
    };
    let second = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || store.save(&entity("task-b0", 100)))
    };
    assert!(first.await.unwrap());
    assert!(second.await.unwrap());

    wait_for_flush().await;
    assert_eq!(store.monitor().message_count, 2);
    assert!(store.query("task-a0").is_ok());
    assert!(store.query("task-b0").is_ok());

    store.stop().await;
}

#[tokio::test]
async fn test_shard_capacity_overflow_rejects_save() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.max_capacity = 32; // 2 entries per shard
    let store = FileStore::new(config).unwrap();
    store.start().await.unwrap();

    assert!(store.save(&entity("a0", 100)));
    assert!(store.save(&entity("b0", 100)));
    assert!(!store.save(&entity("c0", 100)));
    // other shards still accept writes
    assert!(store.save(&entity("a1", 100)));

    store.stop().await;
}

#[tokio::test]
async fn test_page_query_oldest_first_with_deadline() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = FileStore::new(test_config(&dir)).unwrap();
    store.start().await.unwrap();

    // 25 entries in shard 0 with next_deliver_time 100, 200, .. 2500
    for i in 1..=25i64 {
        assert!(store.save(&entity(&format!("m{:02}0", i), i * 100)));
    }

    let (has_more, page) = store.page_query_entity("0", "server-a", 2000, 0, 10);
    assert!(has_more);
    assert_eq!(page.len(), 10);
    let times: Vec<i64> = page.iter().map(|e| e.next_deliver_time).collect();
    assert_eq!(times, (1..=10).map(|i| i * 100).collect::<Vec<_>>());

    // exactly `limit` matches below the deadline leaves nothing beyond the page
    let (has_more, page) = store.page_query_entity("0", "server-a", 1000, 0, 10);
    assert!(!has_more);
    assert_eq!(page.len(), 10);
    assert!(page.iter().all(|e| e.next_deliver_time <= 1000));

    // paging past the first window
    let (has_more, page) = store.page_query_entity("0", "server-a", 2000, 10, 10);
    assert!(!has_more);
    assert_eq!(page.len(), 10);
    assert_eq!(page[0].next_deliver_time, 1100);

    // nothing due yet
    let (has_more, page) = store.page_query_entity("0", "server-a", 50, 0, 10);
    assert!(!has_more);
    assert!(page.is_empty());

    store.stop().await;
}

#[tokio::test]
async fn test_restart_preserves_live_messages() {
    let dir = tempfile::TempDir::new().unwrap();
    let before;
    {
        let store = FileStore::new(test_config(&dir)).unwrap();
        store.start().await.unwrap();
        assert!(store.save(&entity("keep-1", 100)));
        assert!(store.save(&entity("keep-2", 200)));
        assert!(store.save(&entity("gone-3", 300)));
        wait_for_flush().await;
        assert!(store.commit("keep-1"));
        assert!(store.delete("gone-3"));
        before = (store.query("keep-1").unwrap(), store.query("keep-2").unwrap());
        store.stop().await;
    }

    let store = FileStore::new(test_config(&dir)).unwrap();
    store.start().await.unwrap();
    assert_eq!(store.monitor().message_count, 2);
    assert_eq!(store.query("keep-1").unwrap(), before.0);
    assert_eq!(store.query("keep-2").unwrap(), before.1);
    assert!(store.query("keep-1").unwrap().commit);
    assert!(matches!(store.query("gone-3"), Err(StoreError::NotFound(_))));

    store.stop().await;
}

#[tokio::test]
async fn test_expired_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let store = FileStore::new(test_config(&dir)).unwrap();
        store.start().await.unwrap();
        assert!(store.save(&entity("old-1", 100)));
        wait_for_flush().await;
        assert!(store.expired("old-1"));
        store.stop().await;
    }

    let store = FileStore::new(test_config(&dir)).unwrap();
    store.start().await.unwrap();
    assert_eq!(store.monitor().message_count, 0);
    assert!(matches!(store.query("old-1"), Err(StoreError::NotFound(_))));

    store.stop().await;
}

#[tokio::test]
async fn test_orphan_oplog_entry_after_lost_flush() {
    let dir = tempfile::TempDir::new().unwrap();

    // crash state: the `C` record reached the oplog but the chunk flush was
    // lost, so the data file is empty
    let snapshot = dir.path().join("snapshot");
    std::fs::create_dir_all(&snapshot).unwrap();
    let body = OpBody {
        id: 0,
        message_id: "m1".to_string(),
        next_deliver_time: 100,
        ..Default::default()
    };
    let record = OpRecord::new(OpKind::Create, "m1", 0, Some(body));
    let mut line = serde_json::to_vec(&record).unwrap();
    line.push(b'\n');
    std::fs::write(snapshot.join("segment-0.log"), line).unwrap();
    std::fs::write(snapshot.join("segment-0.data"), b"").unwrap();

    let store = FileStore::new(test_config(&dir)).unwrap();
    store.start().await.unwrap();

    // the index entry replayed from the oplog, but the chunk is gone
    assert_eq!(store.monitor().message_count, 1);
    assert!(matches!(store.query("m1"), Err(StoreError::NoChunk { .. })));

    // the broker can still discard the lost message
    assert!(store.delete("m1"));
    assert_eq!(store.monitor().message_count, 0);

    store.stop().await;
}

#[tokio::test]
async fn test_emptied_segments_are_reclaimed() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.max_segment_size = 300; // roll every couple of chunks
    config.segcache_size = 20; // keep every segment cached so the sweep sees them all
    let store = FileStore::new(config).unwrap();
    store.start().await.unwrap();

    for i in 0..12 {
        assert!(store.save(&entity(&format!("evict-{:x}", i), 100)));
        // let the flusher push each chunk out so the roll threshold is seen
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(data_file_count(&dir) > 1);

    for i in 0..12 {
        assert!(store.delete(&format!("evict-{:x}", i)));
    }

    // two evictor periods are enough to reclaim every emptied segment
    tokio::time::sleep(Duration::from_millis(300)).await;
    // only the active segment may remain
    assert_eq!(data_file_count(&dir), 1);
    assert_eq!(store.monitor().message_count, 0);

    store.stop().await;
}

#[tokio::test]
async fn test_monitor_and_recover_num() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = FileStore::new(test_config(&dir)).unwrap();
    store.start().await.unwrap();

    assert_eq!(store.recover_num(), 16);
    assert!(store.save(&entity("m1", 100)));
    let monitor = store.monitor();
    assert_eq!(monitor.message_count, 1);
    assert_eq!(monitor.to_string(), "message-length:1");

    store.stop().await;
}

#[tokio::test]
async fn test_async_aliases_match_sync_behavior() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = FileStore::new(test_config(&dir)).unwrap();
    store.start().await.unwrap();

    assert!(store.save(&entity("m7", 100)));
    wait_for_flush().await;

    assert!(store.async_commit("m7"));
    assert!(store.query("m7").unwrap().commit);

    let mut changed = entity("m7", 500);
    changed.deliver_count = 1;
    assert!(store.async_update(&changed));
    assert_eq!(store.query("m7").unwrap().next_deliver_time, 500);

    assert!(store.async_delete("m7"));
    assert!(matches!(store.query("m7"), Err(StoreError::NotFound(_))));

    store.stop().await;
}
