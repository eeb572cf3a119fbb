//! Replaying recorded sessions through the public facade.

mod common;

use anyhow::{Context, Result, ensure};
use futures::StreamExt;
use relaytap::capture::Direction;
use relaytap::capture::format::{ContainerHeader, write_frame};
use relaytap::protocol::codec;
use relaytap::{Connection, Packet, RelayError, Relaytap, packet_stream};
use std::sync::Arc;
use std::time::Duration;

const SPAWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn recorded_download_replays_to_the_same_session() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("download.pcap2");
    let packs = vec![common::pack("alpha", 2500), common::pack("beta", 10)];

    let mut frames = common::login(&common::game_data(31), &packs, 1000)?;
    for i in 0..50u8 {
        let direction = if i % 3 == 0 { Direction::ToServer } else { Direction::ToClient };
        frames.push((direction, common::opaque(0x100 + u16::from(i), &[i; 16])));
    }
    common::write_session(&path, &frames, &[])?;

    let connection = Relaytap::replay(&path).await?;
    connection.do_spawn_timeout(SPAWN_TIMEOUT).await.context("replay did not spawn")?;

    assert_eq!(connection.game_data(), common::game_data(31));
    assert_eq!(connection.identity_data(), common::identity());
    assert_eq!(connection.resource_packs(), packs);
    ensure!(connection.pack_cache().is_complete("alpha", "1.0.0"));

    let connection: Arc<dyn Connection> = Arc::new(connection);
    let ids: Vec<u16> = packet_stream(connection).map(|p| p.id()).collect().await;
    let expected: Vec<u16> = (0..50u16).map(|i| 0x100 + i).collect();
    assert_eq!(ids, expected);
    Ok(())
}

#[tokio::test]
async fn mismatched_spawn_confirmation_delivers_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("mismatch.pcap2");

    let mut frames = common::login(&common::game_data(7), &[], 1000)?;
    let last = frames.last_mut().context("empty login")?;
    ensure!(matches!(last.1, Packet::SetLocalPlayerAsInitialised { entity_runtime_id: 7 }));
    last.1 = Packet::SetLocalPlayerAsInitialised { entity_runtime_id: 8 };
    frames.push((Direction::ToClient, common::opaque(0x90, b"after spawn")));
    common::write_session(&path, &frames, &[])?;

    let connection = Relaytap::replay(&path).await?;
    match connection.do_spawn_timeout(SPAWN_TIMEOUT).await {
        Err(RelayError::ProtocolInvariantViolation { details }) => {
            assert!(details.contains('7') && details.contains('8'), "{}", details);
        }
        other => panic!("expected an invariant violation, got {:?}", other),
    }
    assert!(matches!(connection.read_packet().await, Err(RelayError::ConnectionClosed)));
    Ok(())
}

#[tokio::test]
async fn log_ending_before_spawn_closes_the_wait() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("short.pcap2");

    let frames = common::login(&common::game_data(4), &[], 1000)?;
    let until_start_game: Vec<_> = frames
        .into_iter()
        .take_while(|(_, packet)| !matches!(packet, Packet::StartGame(_)))
        .collect();
    common::write_session(&path, &until_start_game, &[])?;

    let connection = Relaytap::replay(&path).await?;
    let result = connection.do_spawn_timeout(SPAWN_TIMEOUT).await;
    assert!(matches!(result, Err(RelayError::ConnectionClosed)), "{:?}", result);
    assert!(!connection.spawn_signal().is_spawned());
    Ok(())
}

#[tokio::test]
async fn unfinished_capture_without_directory_still_replays() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("killed.pcap2");

    // A relay killed mid-session leaves only the header and the frames.
    let mut bytes = ContainerHeader::current().to_bytes().to_vec();
    let mut frames = common::login(&common::game_data(12), &[common::pack("gamma", 300)], 128)?;
    frames.push((Direction::ToClient, common::opaque(0x90, b"tail")));
    for (i, (direction, packet)) in frames.iter().enumerate() {
        write_frame(&mut bytes, *direction, i as i64, &codec::encode_frame(packet))?;
    }
    std::fs::write(&path, bytes)?;

    let connection = Relaytap::replay(&path).await?;
    connection.do_spawn_timeout(SPAWN_TIMEOUT).await?;
    assert_eq!(connection.resource_packs(), vec![common::pack("gamma", 300)]);
    assert_eq!(connection.read_packet().await?, common::opaque(0x90, b"tail"));
    assert!(matches!(connection.read_packet().await, Err(RelayError::ConnectionClosed)));
    Ok(())
}

#[tokio::test]
async fn close_unblocks_a_pending_spawn_wait() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("pending.pcap2");

    // Login cut short mid-download: the decode loop ends, so the waiter is released
    // either by the end of the log or by close, whichever comes first.
    let frames = common::login(&common::game_data(2), &[common::pack("delta", 4000)], 100)?;
    common::write_session(&path, &frames[..6], &[])?;

    let connection = Arc::new(Relaytap::replay(&path).await?);
    let waiter = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.do_spawn().await })
    };
    connection.close().await?;
    connection.close().await?;

    let result = tokio::time::timeout(SPAWN_TIMEOUT, waiter).await??;
    assert!(matches!(result, Err(RelayError::ConnectionClosed)), "{:?}", result);
    ensure!(connection.is_closed());
    Ok(())
}
