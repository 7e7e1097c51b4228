use blockcache::{Config, Engine, LocalFsStore, OpenOptions};
use std::sync::Arc;

fn config() -> Config {
    Config {
        block_size: 4096,
        mem_size: 4096 * 32,
        workers: 2,
        ..Config::default()
    }
}

#[tokio::test]
async fn test_data_survives_a_new_engine() {
    let dir = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();

    let writer = Engine::new(config(), Arc::new(LocalFsStore::new(dir.path()))).unwrap();
    let h = writer.open("nested/file").await.unwrap();
    writer.write(h, 5000, &data).await.unwrap();
    writer.close(h).await.unwrap();
    writer.shutdown().await;

    let reader = Engine::new(config(), Arc::new(LocalFsStore::new(dir.path()))).unwrap();
    let attr = reader.stat("nested/file").await.unwrap();
    assert_eq!(attr.size, 15_000);

    let h = reader
        .open_with(
            "nested/file",
            OpenOptions {
                create: false,
                truncate: false,
            },
        )
        .await
        .unwrap();
    let mut out = vec![7u8; 15_000];
    assert_eq!(reader.read(h, 0, &mut out).await.unwrap(), 15_000);
    assert!(out[..5000].iter().all(|b| *b == 0));
    assert_eq!(&out[5000..], &data[..]);

    reader.truncate(h, 6000).await.unwrap();
    reader.close(h).await.unwrap();
    assert_eq!(reader.stat("nested/file").await.unwrap().size, 6000);
    reader.shutdown().await;
}
