//! Failure-path tests: resets, backlog overflow, dead peers, and raw
//! protocol violations injected straight onto the transport.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

use braid::wire::{Flags, FrameType, GoAwayCode, Header, HEADER_LEN};
use braid::{Config, Error, Session};

fn quiet_config() -> Config {
    Config {
        enable_keep_alive: false,
        ..Config::default()
    }
}

fn pair_with(client_config: Config, server_config: Config) -> (Session, Session) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let client = Session::client(client_io, client_config).expect("client session");
    let server = Session::server(server_io, server_config).expect("server session");
    (client, server)
}

/// A server session whose peer is this bare pipe, for writing raw frames.
fn server_with_raw_peer(config: Config) -> (Session, DuplexStream) {
    let (server_io, raw) = tokio::io::duplex(64 * 1024);
    let server = Session::server(server_io, config).expect("server session");
    (server, raw)
}

async fn wait_closed(session: &Session) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !session.is_closed() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(session.is_closed(), "session should have died");
}

async fn write_header(raw: &mut DuplexStream, header: Header) {
    let mut buf = BytesMut::new();
    header.encode_into(&mut buf);
    raw.write_all(&buf).await.expect("raw write");
}

async fn read_header(raw: &mut DuplexStream) -> Header {
    let mut buf = [0u8; HEADER_LEN];
    raw.read_exact(&mut buf).await.expect("raw read");
    Header::decode(&buf).expect("reply header")
}

#[tokio::test]
async fn test_local_reset_aborts_both_ends() {
    let (client, server) = pair_with(Config::default(), Config::default());

    let stream = client.open().expect("open");
    stream.write(b"x").await.expect("write");
    let accepted = timeout(Duration::from_secs(1), server.accept_stream())
        .await
        .expect("accept timed out")
        .expect("accept");

    stream.reset().expect("reset");

    let err = stream.write(b"y").await.err().expect("write after reset");
    assert!(matches!(err, Error::StreamReset), "got {err:?}");

    // The peer sees the reset too; any data racing ahead of it is
    // allowed through first.
    let mut buf = [0u8; 4];
    let err = loop {
        match timeout(Duration::from_secs(1), accepted.read(&mut buf))
            .await
            .expect("read did not wake")
        {
            Ok(_) => continue,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, Error::StreamReset), "got {err:?}");

    // The session outlives the stream.
    assert!(!client.is_closed());
    client.ping().await.expect("ping after reset");
}

#[tokio::test]
async fn test_backlog_overflow_resets_excess_streams() {
    let config = Config {
        accept_backlog: 1,
        ..quiet_config()
    };
    let (client, server) = pair_with(config.clone(), config);

    let first = client.open().expect("open");
    first.write(b"1").await.expect("write");
    let second = client.open().expect("open");
    second.write(b"2").await.expect("write");

    // The second stream overflows the single-slot backlog and is reset.
    let mut buf = [0u8; 1];
    let err = timeout(Duration::from_secs(2), second.read(&mut buf))
        .await
        .expect("read did not wake")
        .err()
        .expect("overflow stream should be reset");
    assert!(matches!(err, Error::StreamReset), "got {err:?}");

    // The queued stream is untouched.
    let accepted = timeout(Duration::from_secs(1), server.accept_stream())
        .await
        .expect("accept timed out")
        .expect("accept");
    assert_eq!(accepted.stream_id(), 1);
}

#[tokio::test]
async fn test_keep_alive_kills_session_against_dead_peer() {
    let (client_io, raw) = tokio::io::duplex(64 * 1024);
    let config = Config {
        keep_alive_interval: Duration::from_millis(10),
        ping_timeout: Duration::from_millis(50),
        ..Config::default()
    };
    let session = Session::client(client_io, config).expect("session");
    // Hold the peer end open but never answer anything.
    let _raw = raw;

    wait_closed(&session).await;
    let err = session.ping().await.err().expect("ping after death");
    assert!(matches!(err, Error::KeepAliveTimeout), "got {err:?}");
}

#[tokio::test]
async fn test_unacknowledged_open_kills_session() {
    let (client_io, raw) = tokio::io::duplex(64 * 1024);
    let config = Config {
        stream_open_timeout: Duration::from_millis(50),
        ..quiet_config()
    };
    let session = Session::client(client_io, config).expect("session");
    let stream = session.open().expect("open");
    stream.write(b"hello").await.expect("write");
    let _raw = raw;

    wait_closed(&session).await;
    let err = stream.write(b"more").await.err().expect("write after death");
    assert!(matches!(err, Error::Timeout), "got {err:?}");
}

#[tokio::test]
async fn test_bad_version_is_fatal_and_reported() {
    let (session, mut raw) = server_with_raw_peer(quiet_config());

    let mut bad = [0u8; HEADER_LEN];
    bad[0] = 9; // version
    bad[1] = 2; // ping
    raw.write_all(&bad).await.expect("raw write");

    // The session announces the protocol error before dying.
    let reply = read_header(&mut raw).await;
    assert_eq!(reply.frame_type, FrameType::GoAway);
    assert_eq!(reply.length, GoAwayCode::ProtocolError as u32);

    wait_closed(&session).await;
    let err = session.open().err().expect("open after death");
    assert!(matches!(err, Error::SessionShutdown), "got {err:?}");
}

#[tokio::test]
async fn test_unknown_stream_is_reset_statelessly() {
    let (session, mut raw) = server_with_raw_peer(quiet_config());

    // A window update for a stream that was never opened.
    write_header(&mut raw, Header::window_update(9, Flags::NONE, 4096)).await;

    let reply = read_header(&mut raw).await;
    assert_eq!(reply.frame_type, FrameType::WindowUpdate);
    assert!(reply.flags.contains(Flags::RST));
    assert_eq!(reply.stream_id, 9);

    // A stateless reject leaves the session healthy.
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_wrong_parity_syn_is_fatal() {
    let (session, mut raw) = server_with_raw_peer(quiet_config());

    // A client must open odd ids; id 8 is a violation.
    write_header(&mut raw, Header::data(8, Flags::SYN, 0)).await;

    let reply = read_header(&mut raw).await;
    assert_eq!(reply.frame_type, FrameType::GoAway);
    assert_eq!(reply.length, GoAwayCode::ProtocolError as u32);
    wait_closed(&session).await;
}

#[tokio::test]
async fn test_duplicate_syn_is_fatal() {
    let (session, mut raw) = server_with_raw_peer(quiet_config());

    write_header(&mut raw, Header::data(1, Flags::SYN, 0)).await;
    write_header(&mut raw, Header::data(1, Flags::SYN, 0)).await;

    let reply = read_header(&mut raw).await;
    assert_eq!(reply.frame_type, FrameType::GoAway);
    assert_eq!(reply.length, GoAwayCode::ProtocolError as u32);
    wait_closed(&session).await;
}

#[tokio::test]
async fn test_oversized_data_frame_is_fatal() {
    let (session, mut raw) = server_with_raw_peer(quiet_config());

    let window = Config::default().max_stream_window_size;
    write_header(&mut raw, Header::data(1, Flags::SYN, window + 1)).await;

    let reply = read_header(&mut raw).await;
    assert_eq!(reply.frame_type, FrameType::GoAway);
    assert_eq!(reply.length, GoAwayCode::ProtocolError as u32);
    wait_closed(&session).await;
}
