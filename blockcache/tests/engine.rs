mod common;

use blockcache::{BlockState, Config, Engine, Error, HandleId, OpenOptions, ZERO_BLOCK_ID};
use common::{RecordingStore, engine, pattern, test_config};
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn read_all(engine: &Engine, h: HandleId) -> Vec<u8> {
    let size = engine.file_size(h).unwrap() as usize;
    let mut out = vec![0u8; size];
    let n = engine.read(h, 0, &mut out).await.unwrap();
    assert_eq!(n, size);
    out
}

#[tokio::test]
async fn test_read_after_write_survives_reopen() {
    let store = RecordingStore::new();
    let engine = engine(&store, test_config(8));

    let mut model = vec![0u8; 0];
    let writes: [(usize, usize, u8); 4] = [(0, 5, 1), (3, 12, 2), (30, 9, 3), (14, 1, 4)];
    let h = engine.open("p1").await.unwrap();
    for (offset, len, seed) in writes {
        let data = pattern(len, seed);
        assert_eq!(engine.write(h, offset as u64, &data).await.unwrap(), len);
        if model.len() < offset + len {
            model.resize(offset + len, 0);
        }
        model[offset..offset + len].copy_from_slice(&data);

        let mut back = vec![0u8; len];
        engine.read(h, offset as u64, &mut back).await.unwrap();
        assert_eq!(back, data);
    }
    assert_eq!(read_all(&engine, h).await, model);
    engine.close(h).await.unwrap();
    assert_eq!(store.inner.contents("p1").unwrap(), model);

    let h = engine.open("p1").await.unwrap();
    assert_eq!(engine.file_size(h).unwrap(), model.len() as u64);
    assert_eq!(read_all(&engine, h).await, model);
    engine.close(h).await.unwrap();
}

#[tokio::test]
async fn test_scenario_a_read_spanning_blocks() {
    let store = RecordingStore::new();
    let data = pattern(20, 7);
    store.inner.put_blocks("a", &data, 8);
    let engine = engine(&store, test_config(8));

    let h = engine.open("a").await.unwrap();
    let blocks = engine.block_info(h).await.unwrap();
    assert_eq!(blocks.len(), 3);
    assert!(blocks.iter().all(|b| b.state == BlockState::Committed));

    let mut buf = [0u8; 8];
    assert_eq!(engine.read(h, 10, &mut buf).await.unwrap(), 8);
    assert_eq!(&buf[..], &data[10..18]);

    assert_eq!(engine.read(h, 18, &mut buf).await.unwrap(), 2);
    assert_eq!(&buf[..2], &data[18..20]);
    assert_eq!(engine.read(h, 20, &mut buf).await.unwrap(), 0);
    assert_eq!(engine.read(h, 99, &mut buf).await.unwrap(), 0);
    engine.close(h).await.unwrap();
}

#[tokio::test]
async fn test_scenario_b_sparse_write_and_hole_idempotence() {
    let store = RecordingStore::new();
    let engine = engine(&store, test_config(8));

    let h = engine.open("b").await.unwrap();
    engine.write(h, 20, b"tail").await.unwrap();
    assert_eq!(engine.file_size(h).unwrap(), 24);

    let blocks = engine.block_info(h).await.unwrap();
    assert_eq!(blocks.len(), 3);
    for hole in &blocks[..2] {
        assert!(hole.hole);
        assert!(!hole.buffered);
        assert_eq!(hole.state, BlockState::Local);
    }
    assert!(!blocks[2].hole);
    assert!(blocks[2].buffered);
    assert_eq!(blocks[2].state, BlockState::Local);

    let mut head = [9u8; 20];
    engine.read(h, 0, &mut head).await.unwrap();
    assert_eq!(head, [0u8; 20]);
    assert_eq!(engine.pool().in_use(), 1);

    engine.flush(h).await.unwrap();
    let staged = store.staged();
    assert_eq!(staged.len(), 2);
    assert_eq!(staged.iter().filter(|id| *id == ZERO_BLOCK_ID).count(), 1);
    let data_id = staged.iter().find(|id| *id != ZERO_BLOCK_ID).unwrap().clone();
    assert_eq!(
        store.commits(),
        vec![vec![ZERO_BLOCK_ID.to_string(), ZERO_BLOCK_ID.to_string(), data_id]]
    );
    let mut expected = vec![0u8; 20];
    expected.extend_from_slice(b"tail");
    assert_eq!(store.inner.contents("b").unwrap(), expected);
    assert!(
        engine
            .block_info(h)
            .await
            .unwrap()
            .iter()
            .all(|b| b.state == BlockState::Committed)
    );

    // Flushing again, clean or dirty, never restages the zero block.
    engine.flush(h).await.unwrap();
    engine.write(h, 22, b"!!").await.unwrap();
    engine.flush(h).await.unwrap();
    let staged = store.staged();
    assert_eq!(staged.iter().filter(|id| *id == ZERO_BLOCK_ID).count(), 1);
    assert_eq!(store.commits().len(), 2);
    expected[22..24].copy_from_slice(b"!!");
    assert_eq!(store.inner.contents("b").unwrap(), expected);
    engine.close(h).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_c_concurrent_reads_share_one_download() {
    let store = RecordingStore::new();
    let data = pattern(32, 3);
    store.inner.put_blocks("c", &data, 8);
    store.delay_reads(Duration::from_millis(50));
    let engine = Arc::new(engine(&store, test_config(8)));
    let h = engine.open("c").await.unwrap();

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8];
                engine.read(h, 0, &mut buf).await?;
                Ok::<_, Error>(buf)
            })
        })
        .collect();
    for reader in readers {
        assert_eq!(reader.await.unwrap().unwrap(), &data[..8]);
    }
    assert_eq!(store.reads_at(0), 1);
    engine.close(h).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_d_slow_background_download_is_replaced() {
    let store = RecordingStore::new();
    let data = pattern(32, 11);
    store.inner.put_blocks("d", &data, 8);
    store.slow_first_read_at(8, Duration::from_secs(5));
    let config = Config {
        sync_wait_ms: 100,
        ..test_config(8)
    };
    let engine = engine(&store, config);
    let h = engine.open("d").await.unwrap();

    // Block 0 misses and prefetches block 1 in the background.
    let mut buf = [0u8; 8];
    engine.read(h, 0, &mut buf).await.unwrap();
    assert_eq!(&buf[..], &data[..8]);

    let started = Instant::now();
    engine.read(h, 8, &mut buf).await.unwrap();
    assert_eq!(&buf[..], &data[8..16]);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(store.reads_at(8), 2);
    engine.close(h).await.unwrap();
    assert_eq!(engine.pool().in_use(), 0);
}

#[tokio::test]
async fn test_buffer_accounting_matches_buffered_blocks() {
    let store = RecordingStore::new();
    store.inner.put_blocks("acct", &pattern(40, 5), 8);
    let config = Config {
        read_ahead: 0,
        ..test_config(8)
    };
    let engine = engine(&store, config);

    let h = engine.open("acct").await.unwrap();
    let mut buf = [0u8; 4];
    engine.read(h, 2, &mut buf).await.unwrap();
    engine.read(h, 26, &mut buf).await.unwrap();
    engine.write(h, 60, b"xyz").await.unwrap();

    let buffered = engine
        .block_info(h)
        .await
        .unwrap()
        .iter()
        .filter(|b| b.buffered)
        .count();
    // Blocks 0 and 3 were read; writing past EOF restaged block 4 and
    // buffered block 7.
    assert_eq!(buffered, 4);
    assert_eq!(engine.pool().in_use(), buffered);

    engine.close(h).await.unwrap();
    assert_eq!(engine.pool().in_use(), 0);
    assert_eq!(engine.pool().free_count(), buffered);
    assert_eq!(engine.open_files(), 0);
}

#[tokio::test]
async fn test_state_transitions_follow_writes() {
    let store = RecordingStore::new();
    store.inner.put_blocks("p2", &pattern(16, 1), 8);
    let config = Config {
        local_watermark: 0,
        ..test_config(8)
    };
    let engine = engine(&store, config);
    let h = engine.open("p2").await.unwrap();
    let states = |infos: Vec<blockcache::BlockInfo>| -> Vec<BlockState> {
        infos.into_iter().map(|b| b.state).collect()
    };

    engine.write(h, 1, b"a").await.unwrap();
    assert_eq!(
        states(engine.block_info(h).await.unwrap()),
        vec![BlockState::Local, BlockState::Committed]
    );

    // Background write-back stages the block without committing it.
    engine.run_maintenance().await;
    assert_eq!(
        states(engine.block_info(h).await.unwrap()),
        vec![BlockState::Uncommitted, BlockState::Committed]
    );
    assert_eq!(store.staged().len(), 1);
    assert!(store.commits().is_empty());

    // A write after staging makes the staged bytes stale.
    engine.write(h, 2, b"b").await.unwrap();
    assert_eq!(
        states(engine.block_info(h).await.unwrap()),
        vec![BlockState::Local, BlockState::Committed]
    );

    engine.flush(h).await.unwrap();
    assert_eq!(
        states(engine.block_info(h).await.unwrap()),
        vec![BlockState::Committed, BlockState::Committed]
    );
    let mut expected = pattern(16, 1);
    expected[1] = b'a';
    expected[2] = b'b';
    assert_eq!(store.inner.contents("p2").unwrap(), expected);
    engine.close(h).await.unwrap();
}

#[tokio::test]
async fn test_invalid_block_list_opens_read_only() {
    let store = RecordingStore::new();
    let data = pattern(20, 9);
    store.inner.put_blob("legacy", &data);
    let engine = engine(&store, test_config(8));

    let h = engine.open("legacy").await.unwrap();
    let blocks = engine.block_info(h).await.unwrap();
    assert_eq!(blocks.len(), 3);
    assert!(blocks.iter().all(|b| b.remote_id == " "));
    assert_eq!(read_all(&engine, h).await, data);

    let err = engine.write(h, 0, b"x").await.unwrap_err();
    assert!(matches!(err, Error::ReadOnly(_)));
    assert_eq!(err.errno(), libc::EROFS);
    assert!(matches!(
        engine.truncate(h, 4).await,
        Err(Error::ReadOnly(_))
    ));
    engine.close(h).await.unwrap();
    assert!(store.commits().is_empty());
}

#[tokio::test]
async fn test_mismatched_block_sizes_fall_back() {
    let store = RecordingStore::new();
    let data = pattern(12, 2);
    store.inner.put_committed(
        "odd",
        vec![
            (blockcache::block::new_block_id(), data[..4].to_vec()),
            (blockcache::block::new_block_id(), data[4..].to_vec()),
        ],
    );
    let engine = engine(&store, test_config(8));
    let h = engine.open("odd").await.unwrap();
    assert_eq!(read_all(&engine, h).await, data);
    assert!(engine.write(h, 0, b"x").await.is_err());
    engine.close(h).await.unwrap();
}

#[tokio::test]
async fn test_write_past_block_limit_is_rejected() {
    let store = RecordingStore::new();
    let config = Config {
        max_blocks: 4,
        ..test_config(8)
    };
    let engine = engine(&store, config);
    let h = engine.open("full").await.unwrap();

    engine.write(h, 28, b"ok!!").await.unwrap();
    let err = engine.write(h, 30, b"spill").await.unwrap_err();
    assert_eq!(err, Error::NoSpace { index: 4, max: 4 });
    assert_eq!(err.errno(), libc::ENOSPC);
    assert_eq!(engine.file_size(h).unwrap(), 32);
    assert_eq!(engine.block_info(h).await.unwrap().len(), 4);
    engine.close(h).await.unwrap();
}

#[tokio::test]
async fn test_pool_exhaustion_is_reported() {
    let store = RecordingStore::new();
    let config = Config {
        mem_size: 16,
        acquire_timeout_ms: 50,
        read_ahead: 0,
        ..test_config(8)
    };
    let engine = engine(&store, config);
    let h = engine.open("tight").await.unwrap();
    engine.write(h, 0, &pattern(16, 1)).await.unwrap();
    let err = engine.write(h, 16, b"more").await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted(_)));
    assert_eq!(err.errno(), libc::ENOMEM);
    engine.close(h).await.unwrap();
    assert_eq!(store.inner.contents("tight").unwrap(), pattern(16, 1));
}

#[tokio::test]
async fn test_growing_reclaims_clean_buffers_of_the_same_file() {
    let store = RecordingStore::new();
    let data = pattern(32, 4);
    store.inner.put_blocks("grow", &data, 8);
    let config = Config {
        mem_size: 32,
        acquire_timeout_ms: 200,
        read_ahead: 0,
        ..test_config(8)
    };
    let engine = engine(&store, config);
    let h = engine.open("grow").await.unwrap();

    assert_eq!(read_all(&engine, h).await, data);
    assert_eq!(engine.pool().in_use(), 4);

    engine.write(h, 32, b"x").await.unwrap();
    engine.truncate(h, 48).await.unwrap();
    assert!(engine.pool().in_use() <= 4);

    let mut expected = data.clone();
    expected.push(b'x');
    expected.resize(48, 0);
    assert_eq!(read_all(&engine, h).await, expected);
    engine.close(h).await.unwrap();
    assert_eq!(store.inner.contents("grow").unwrap(), expected);
}

#[tokio::test]
async fn test_failed_download_surfaces_and_next_read_retries() {
    let store = RecordingStore::new();
    let data = pattern(32, 6);
    store.inner.put_blocks("flaky", &data, 8);
    let config = Config {
        read_ahead: 1,
        ..test_config(8)
    };
    let engine = engine(&store, config);
    let h = engine.open("flaky").await.unwrap();

    store.fail_reads_at(&[0, 8]);
    let mut buf = [0u8; 8];
    let err = engine.read(h, 0, &mut buf).await.unwrap_err();
    assert!(matches!(err, Error::Remote(_)));
    assert_eq!(err.errno(), libc::EIO);
    assert!(!engine.block_info(h).await.unwrap()[0].buffered);

    // Block 1 keeps failing, but only as a prefetch.
    store.fail_reads_at(&[8]);
    assert_eq!(engine.read(h, 0, &mut buf).await.unwrap(), 8);
    assert_eq!(&buf[..], &data[..8]);
    assert_eq!(store.reads_at(0), 2);
    assert!(engine.block_info(h).await.unwrap()[0].buffered);

    store.fail_reads_at(&[]);
    assert_eq!(engine.read(h, 8, &mut buf).await.unwrap(), 8);
    assert_eq!(&buf[..], &data[8..16]);
    engine.close(h).await.unwrap();
    assert_eq!(engine.pool().in_use(), 0);
}

#[tokio::test]
async fn test_failed_flush_commits_nothing_and_can_retry() {
    let store = RecordingStore::new();
    let engine = engine(&store, test_config(8));
    let data = pattern(24, 4);
    let h = engine.open("retry").await.unwrap();
    engine.write(h, 0, &data).await.unwrap();

    store.fail_stage_after(Some(1));
    assert!(matches!(engine.flush(h).await, Err(Error::Remote(_))));
    assert!(store.commits().is_empty());
    assert!(!engine.is_synced(h).unwrap());

    store.fail_stage_after(None);
    store.fail_commit(true);
    assert!(engine.flush(h).await.is_err());
    assert!(!engine.is_synced(h).unwrap());
    assert!(
        engine
            .block_info(h)
            .await
            .unwrap()
            .iter()
            .all(|b| b.state == BlockState::Uncommitted)
    );

    store.fail_commit(false);
    engine.flush(h).await.unwrap();
    assert!(engine.is_synced(h).unwrap());
    assert_eq!(store.inner.contents("retry").unwrap(), data);
    engine.close(h).await.unwrap();
}

#[tokio::test]
async fn test_close_returns_flush_error_and_releases_handle() {
    let store = RecordingStore::new();
    let engine = engine(&store, test_config(8));
    let h = engine.open("lost").await.unwrap();
    engine.write(h, 0, b"data").await.unwrap();
    store.fail_commit(true);

    assert!(engine.close(h).await.is_err());
    assert_eq!(engine.open_files(), 0);
    assert_eq!(engine.pool().in_use(), 0);
    assert_eq!(engine.flush(h).await, Err(Error::BadHandle(h.0)));
}

#[tokio::test]
async fn test_truncate_shrink_then_grow() {
    let store = RecordingStore::new();
    let data = pattern(20, 6);
    store.inner.put_blocks("t", &data, 8);
    let engine = engine(&store, test_config(8));
    let h = engine.open("t").await.unwrap();

    engine.truncate(h, 10).await.unwrap();
    assert_eq!(engine.file_size(h).unwrap(), 10);
    assert_eq!(engine.block_info(h).await.unwrap().len(), 2);
    assert_eq!(read_all(&engine, h).await, &data[..10]);

    engine.truncate(h, 30).await.unwrap();
    let blocks = engine.block_info(h).await.unwrap();
    assert_eq!(blocks.len(), 4);
    assert!(blocks[2].hole);
    assert!(!blocks[3].hole);
    let mut expected = data[..10].to_vec();
    expected.resize(30, 0);
    assert_eq!(read_all(&engine, h).await, expected);

    engine.close(h).await.unwrap();
    assert_eq!(store.inner.contents("t").unwrap(), expected);
}

#[tokio::test]
async fn test_truncate_path_on_closed_file() {
    let store = RecordingStore::new();
    let data = pattern(20, 8);
    store.inner.put_blocks("tp", &data, 8);
    let engine = engine(&store, test_config(8));

    engine.truncate_path("tp", 5).await.unwrap();
    assert_eq!(store.inner.contents("tp").unwrap(), &data[..5]);
    assert_eq!(engine.open_files(), 0);

    let err = engine.truncate_path("missing", 5).await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
}

#[tokio::test]
async fn test_open_truncate_discards_content() {
    let store = RecordingStore::new();
    store.inner.put_blocks("ot", &pattern(20, 8), 8);
    let engine = engine(&store, test_config(8));
    let h = engine
        .open_with(
            "ot",
            OpenOptions {
                create: true,
                truncate: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(engine.file_size(h).unwrap(), 0);
    engine.write(h, 0, b"new").await.unwrap();
    engine.close(h).await.unwrap();
    assert_eq!(store.inner.contents("ot").unwrap(), b"new");
}

#[tokio::test]
async fn test_stat_prefers_open_size() {
    let store = RecordingStore::new();
    let engine = engine(&store, test_config(8));
    let h = engine.open("s").await.unwrap();
    engine.write(h, 0, &pattern(10, 1)).await.unwrap();
    assert_eq!(engine.stat("s").await.unwrap().size, 10);
    engine.close(h).await.unwrap();
    assert_eq!(engine.stat("s").await.unwrap().size, 10);
    assert_eq!(
        engine.stat("nope").await.unwrap_err().errno(),
        libc::ENOENT
    );
}

#[tokio::test]
async fn test_handles_and_errors() {
    let store = RecordingStore::new();
    let engine = engine(&store, test_config(8));

    let err = engine
        .open_with(
            "absent",
            OpenOptions {
                create: false,
                truncate: false,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
    assert_eq!(engine.open_files(), 0);

    let mut buf = [0u8; 4];
    let err = engine.read(HandleId(999), 0, &mut buf).await.unwrap_err();
    assert_eq!(err, Error::BadHandle(999));
    assert_eq!(err.errno(), libc::EBADF);

    let a = engine.open("shared").await.unwrap();
    let b = engine.open("shared").await.unwrap();
    engine.write(a, 0, b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    engine.read(b, 0, &mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    engine.close(a).await.unwrap();
    assert_eq!(engine.open_files(), 1);
    engine.close(b).await.unwrap();
    assert_eq!(engine.open_files(), 0);
    assert_eq!(engine.pool().in_use(), 0);
}

#[tokio::test]
async fn test_idle_committed_buffers_are_reclaimed() {
    let store = RecordingStore::new();
    let data = pattern(16, 2);
    store.inner.put_blocks("idle", &data, 8);
    let config = Config {
        idle_evict_ms: 0,
        read_ahead: 0,
        ..test_config(8)
    };
    let engine = engine(&store, config);
    let h = engine.open("idle").await.unwrap();
    assert_eq!(read_all(&engine, h).await, data);
    assert_eq!(engine.pool().in_use(), 2);

    engine.run_maintenance().await;
    assert_eq!(engine.pool().in_use(), 0);
    assert!(engine.block_info(h).await.unwrap().iter().all(|b| !b.buffered));

    assert_eq!(read_all(&engine, h).await, data);
    assert_eq!(store.reads_at(0), 2);
    engine.close(h).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_extending_writers() {
    let store = RecordingStore::new();
    let engine = Arc::new(engine(&store, test_config(8)));
    let h = engine.open("par").await.unwrap();

    let writers: Vec<_> = (0..6u8)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let data = pattern(8, i);
                engine.write(h, i as u64 * 8, &data).await
            })
        })
        .collect();
    for writer in writers {
        assert_eq!(writer.await.unwrap().unwrap(), 8);
    }
    let expected: Vec<u8> = (0..6u8).flat_map(|i| pattern(8, i)).collect();
    assert_eq!(read_all(&engine, h).await, expected);
    engine.close(h).await.unwrap();
    assert_eq!(store.inner.contents("par").unwrap(), expected);
}

#[tokio::test]
async fn test_shutdown_rejects_new_work() {
    let store = RecordingStore::new();
    let engine = engine(&store, test_config(8));
    engine.shutdown().await;
    assert_eq!(engine.open("late").await, Err(Error::Shutdown));
}
