use anyhow::Result;

use crate::gateway::ids::{ClientIds, ID_BLOCK};

#[tokio::test]
async fn ids_are_not_reused_after_reopening() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join("gateway.ids");

    let mut ids = ClientIds::open(&path).await?;
    let first: Vec<u32> = vec![ids.next_id().await?, ids.next_id().await?, ids.next_id().await?];
    assert_eq!(first, vec![1, 2, 3], "expected sequential ids from 1, got {:?}", first);
    drop(ids);

    let mut ids = ClientIds::open(&path).await?;
    let next = ids.next_id().await?;
    assert_eq!(next, 1 + ID_BLOCK, "expected the reserved block to be skipped, got {}", next);
    Ok(())
}

#[tokio::test]
async fn ids_cross_block_boundaries() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join("gateway.ids");

    let mut ids = ClientIds::open(&path).await?;
    let mut last = 0;
    for _ in 0..(ID_BLOCK + 2) {
        let id = ids.next_id().await?;
        assert!(id > last, "expected increasing ids, got {} after {}", id, last);
        last = id;
    }
    drop(ids);

    let mut ids = ClientIds::open(&path).await?;
    let next = ids.next_id().await?;
    assert!(next > last, "expected {} to be past every id handed out, last {}", next, last);
    Ok(())
}

#[tokio::test]
async fn corrupt_counter_is_rejected() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join("gateway.ids");
    tokio::fs::write(&path, b"bad").await?;
    assert!(ClientIds::open(&path).await.is_err(), "expected a corrupt counter file to be rejected");
    Ok(())
}
