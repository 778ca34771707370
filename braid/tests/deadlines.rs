//! Read and write deadline behavior.

use std::time::Duration;

use tokio::time::{timeout, Instant};

use braid::{Config, Error, Session, Stream};

fn pair() -> (Session, Session) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let client = Session::client(client_io, Config::default()).expect("client session");
    let server = Session::server(server_io, Config::default()).expect("server session");
    (client, server)
}

/// Opens a stream, pushes one byte through it so the peer registers it,
/// and returns both ends.
async fn connected_pair(client: &Session, server: &Session) -> (Stream, Stream) {
    let stream = client.open().expect("open");
    stream.write(b"!").await.expect("write");
    let accepted = timeout(Duration::from_secs(1), server.accept_stream())
        .await
        .expect("accept timed out")
        .expect("accept");
    let mut buf = [0u8; 1];
    let n = accepted.read(&mut buf).await.expect("read");
    assert_eq!(&buf[..n], b"!");
    (stream, accepted)
}

#[tokio::test]
async fn test_read_deadline_expires() {
    let (client, server) = pair();
    let (stream, _accepted) = connected_pair(&client, &server).await;

    stream.set_read_deadline(Some(Instant::now() + Duration::from_millis(5)));

    let mut buf = [0u8; 4];
    let err = stream.read(&mut buf).await.err().expect("read should time out");
    assert!(matches!(err, Error::Timeout), "got {err:?}");

    // Past the deadline every read fails immediately.
    let err = stream.read(&mut buf).await.err().expect("still timed out");
    assert!(matches!(err, Error::Timeout), "got {err:?}");
}

#[tokio::test]
async fn test_cleared_deadline_allows_retry() {
    let (client, server) = pair();
    let (stream, accepted) = connected_pair(&client, &server).await;

    stream.set_read_deadline(Some(Instant::now() + Duration::from_millis(5)));
    let mut buf = [0u8; 4];
    let err = stream.read(&mut buf).await.err().expect("read should time out");
    assert!(matches!(err, Error::Timeout), "got {err:?}");

    stream.set_read_deadline(None);
    accepted.write(b"pong").await.expect("write");
    let n = timeout(Duration::from_secs(1), stream.read(&mut buf))
        .await
        .expect("read did not wake")
        .expect("read");
    assert_eq!(&buf[..n], b"pong");
}

#[tokio::test]
async fn test_blocked_reader_parks_until_deadline() {
    let (client, server) = pair();
    let (stream, _accepted) = connected_pair(&client, &server).await;

    stream.set_read_deadline(Some(Instant::now() + Duration::from_millis(40)));

    let started = Instant::now();
    let mut buf = [0u8; 4];
    let err = stream.read(&mut buf).await.err().expect("read should time out");
    assert!(matches!(err, Error::Timeout), "got {err:?}");
    // The reader really waited for the deadline instead of failing early.
    assert!(started.elapsed() >= Duration::from_millis(35));
}

#[tokio::test]
async fn test_write_deadline_fires_on_window_exhaustion() {
    let (client, server) = pair();
    let stream = client.open().expect("open");
    stream.write(b"!").await.expect("write");
    // Accept but never read, so no credit ever comes back.
    let _accepted = timeout(Duration::from_secs(1), server.accept_stream())
        .await
        .expect("accept timed out")
        .expect("accept");

    stream.set_write_deadline(Some(Instant::now() + Duration::from_millis(50)));

    let window = Config::default().max_stream_window_size as usize;
    let chunk = [0u8; 512];
    let mut timed_out = false;
    for i in 0..window / 512 + 2 {
        match stream.write(&chunk).await {
            Ok(n) => assert_eq!(n, 512),
            Err(Error::Timeout) => {
                assert!(
                    i <= window / 512,
                    "window should be exhausted within {} writes, took {i}",
                    window / 512
                );
                timed_out = true;
                break;
            }
            Err(other) => panic!("unexpected write error: {other:?}"),
        }
    }
    assert!(timed_out, "write never hit the deadline");
}
