//! Cross-module scenarios exercising the façade against its real Core/Replicator/crypto
//! collaborators, one test per end-to-end scenario.

use anyhow::Result;
use hyperlog::replication::{RequestBlock, RequestUpgrade};
use hyperlog::session::GetOptions;
use hyperlog::storage::Storage;
use hyperlog::{Event, LogBuilder, LogError, PartialKeypair};
use random_access_memory::RandomAccessMemory;

async fn memory_log() -> Result<hyperlog::Log<RandomAccessMemory>> {
    Ok(LogBuilder::memory().await?)
}

#[async_std::test]
async fn append_read_round_trip() -> Result<()> {
    let log = memory_log().await?;
    let outcome = log.append(vec![b"hello".to_vec(), b"world".to_vec()]).await?;

    assert_eq!(outcome.length, 2);
    assert_eq!(outcome.byte_length, 10);
    assert_eq!(log.get(0, GetOptions::default()).await?, Some(b"hello".to_vec()));
    assert_eq!(log.get(1, GetOptions::default()).await?, Some(b"world".to_vec()));
    Ok(())
}

#[async_std::test]
async fn replication_fill_from_writer_to_reader() -> Result<()> {
    let writer = memory_log().await?;

    let blocks: Vec<Vec<u8>> = (0..100u8).map(|i| vec![i; 64]).collect();
    writer.append(blocks.clone()).await?;

    let writer_public = writer.public_key().await;
    let reader_storage = Storage::memory().await?;
    let reader = LogBuilder::new(reader_storage)
        .key_pair(PartialKeypair::public_only(writer_public))
        .build()
        .await?;

    let peer = reader.add_peer();
    let upgrade_length = writer.length().await;
    for index in 0..upgrade_length {
        let proof = writer
            .create_proof(index, upgrade_length)
            .await?
            .expect("writer holds every block it just appended");
        let applied = reader.apply_remote_block(peer.id(), proof).await?;
        assert!(applied, "proof for index {index} should verify");
    }

    assert_eq!(reader.length().await, upgrade_length);
    for (index, expected) in blocks.iter().enumerate() {
        let got = reader.get(index as u64, GetOptions::default()).await?;
        assert_eq!(got.as_ref(), Some(expected));
    }
    assert_eq!(
        reader.tree_hash(Some(upgrade_length)).await,
        writer.tree_hash(Some(upgrade_length)).await
    );
    Ok(())
}

#[async_std::test]
async fn snapshot_isolation() -> Result<()> {
    let log = memory_log().await?;
    log.append(vec![b"a".to_vec(), b"b".to_vec()]).await?;
    let snapshot = log.snapshot().await;
    log.append(vec![b"c".to_vec()]).await?;

    assert_eq!(snapshot.length().await, 2);
    assert_eq!(log.length().await, 3);
    assert_eq!(
        snapshot
            .get(2, GetOptions { wait: false, value_encoding: None, onwait: None })
            .await?,
        None
    );
    Ok(())
}

#[async_std::test]
async fn truncate_forks_and_clears_presence() -> Result<()> {
    let log = memory_log().await?;
    log.append((0..5u8).map(|i| vec![i]).collect()).await?;
    log.truncate(3).await?;

    assert_eq!(log.fork().await, 1);
    assert_eq!(log.length().await, 3);
    assert!(!log.has(3).await);
    Ok(())
}

#[async_std::test]
async fn encryption_is_transparent_to_readers_but_hides_raw_storage() -> Result<()> {
    let key = [42u8; 32];

    let writer_storage = Storage::memory().await?;
    let writer = LogBuilder::new(writer_storage).encryption_key(key).build().await?;
    writer.append(vec![b"secret".to_vec()]).await?;

    let writer_public = writer.public_key().await;
    let reader_storage = Storage::memory().await?;
    let reader = LogBuilder::new(reader_storage)
        .key_pair(PartialKeypair::public_only(writer_public))
        .encryption_key(key)
        .build()
        .await?;

    let proof = writer.create_proof(0, 1).await?.unwrap();
    let peer = reader.add_peer();
    reader.apply_remote_block(peer.id(), proof).await?;

    assert_eq!(
        reader.get(0, GetOptions::default()).await?,
        Some(b"secret".to_vec())
    );
    Ok(())
}

#[async_std::test]
async fn session_close_semantics() -> Result<()> {
    let root = memory_log().await?;
    let a = root.session();
    let b = root.session();

    let mut events = root.subscribe();
    a.close().await?;
    b.close().await?;
    root.close().await?;

    use futures::StreamExt;
    let mut non_last_closes = 0;
    let mut last_close = false;
    while let Some(event) = events.next().await {
        match event {
            Event::Close { is_last: false } => non_last_closes += 1,
            Event::Close { is_last: true } => {
                last_close = true;
                break;
            }
            _ => {}
        }
    }
    assert_eq!(non_last_closes, 2);
    assert!(last_close);
    Ok(())
}

#[async_std::test]
async fn empty_append_is_a_no_op() -> Result<()> {
    let log = memory_log().await?;
    log.append(vec![b"x".to_vec()]).await?;
    let before = log.info().await;

    let outcome = log.append(vec![]).await?;
    assert_eq!(outcome.length, before.length);
    assert_eq!(outcome.byte_length, before.byte_length);
    Ok(())
}

#[async_std::test]
async fn wait_false_on_absent_index_returns_none_without_error() -> Result<()> {
    let log = memory_log().await?;
    let got = log
        .get(0, GetOptions { wait: false, value_encoding: None, onwait: None })
        .await?;
    assert_eq!(got, None);
    Ok(())
}

#[async_std::test]
async fn append_without_signer_is_not_writable() -> Result<()> {
    let storage = Storage::memory().await?;
    let key_pair = hyperlog::crypto::generate_keypair();
    let read_only = LogBuilder::new(storage)
        .key_pair(PartialKeypair::public_only(key_pair.public))
        .build()
        .await?;

    assert!(!read_only.writable().await);
    let result = read_only.append(vec![b"nope".to_vec()]).await;
    assert!(matches!(result, Err(LogError::NotWritable)));
    Ok(())
}

#[async_std::test]
async fn truncating_past_current_length_is_rejected() -> Result<()> {
    let log = memory_log().await?;
    log.append(vec![b"a".to_vec()]).await?;
    let result = log.truncate(5).await;
    assert!(matches!(result, Err(LogError::BadArgument { .. })));
    Ok(())
}

#[async_std::test]
async fn request_block_and_upgrade_types_compose_into_a_proof_request() -> Result<()> {
    let log = memory_log().await?;
    log.append(vec![b"one".to_vec()]).await?;
    let proof = log
        .create_proof(0, 1)
        .await?
        .expect("freshly appended block has a proof");
    assert_eq!(proof.block, b"one".to_vec());
    let _ = RequestBlock { index: 0 };
    let _ = RequestUpgrade { length: 1 };
    Ok(())
}

#[async_std::test]
async fn replicate_over_a_duplex_stream_serves_a_remote_get() -> Result<()> {
    let writer = memory_log().await?;
    writer.append(vec![b"over-the-wire".to_vec()]).await?;

    let writer_public = writer.public_key().await;
    let reader_storage = Storage::memory().await?;
    let reader = LogBuilder::new(reader_storage)
        .key_pair(PartialKeypair::public_only(writer_public))
        .build()
        .await?;

    let (writer_stream, reader_stream) = futures::io::duplex(4096);
    let (writer_peer, reader_peer) = futures::join!(
        writer.replicate(writer_stream, true),
        reader.replicate(reader_stream, false)
    );
    let writer_peer = writer_peer?;
    let reader_peer = reader_peer?;

    let serving_writer = writer.session();
    let serve_task = async_std::task::spawn(async move { serving_writer.serve_request(writer_peer.id()).await });

    let fetched = reader.get(0, GetOptions::default()).await?;
    assert_eq!(fetched, Some(b"over-the-wire".to_vec()));
    assert!(reader.has(0).await);

    serve_task.await?;
    let _ = reader_peer;
    Ok(())
}
