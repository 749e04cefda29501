//! End-to-end tests over a real Unix-domain socket: framing, dispatch,
//! batching, deferred responses, and daemon lifecycle.

use partake_proto::{
    decode_response_message, encode_frame, encode_request_message, FrameDecoder, Policy, Request,
    RequestBody, RequestMessage, Response, ResponseBody, ResponseMessage, Status, Token,
};
use partaked::daemon::{Daemon, DaemonConfig, QuitHandle};
use partaked::segment::{SegmentConfig, SegmentMethod};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::LocalSet;

struct TestDaemon {
    _dir: tempfile::TempDir,
    socket_path: PathBuf,
    quit: QuitHandle,
    server: tokio::task::JoinHandle<()>,
}

fn config_for(dir: &Path) -> DaemonConfig {
    DaemonConfig {
        socket_path: dir.join("partaked.sock"),
        segment: SegmentConfig {
            method: SegmentMethod::File {
                path: dir.join("segment"),
                force: false,
            },
            size: 1 << 20,
        },
        granularity_log2: Some(9),
        voucher_ttl: Duration::from_secs(10),
        force: false,
    }
}

fn start_daemon() -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path());
    let daemon = Daemon::bind(&config).unwrap();
    let quit = daemon.quit_handle();
    let socket_path = config.socket_path.clone();
    let server = tokio::task::spawn_local(daemon.run());
    TestDaemon {
        _dir: dir,
        socket_path,
        quit,
        server,
    }
}

impl TestDaemon {
    async fn stop(self) {
        self.quit.quit();
        self.server.await.unwrap();
    }
}

/// Minimal wire-level client.
struct Client {
    stream: UnixStream,
    decoder: FrameDecoder,
    bytes_received: usize,
}

impl Client {
    async fn connect(path: &Path) -> Self {
        Self {
            stream: UnixStream::connect(path).await.unwrap(),
            decoder: FrameDecoder::new(),
            bytes_received: 0,
        }
    }

    async fn send(&mut self, requests: Vec<Request>) {
        let payload = encode_request_message(&RequestMessage { requests }).unwrap();
        let frame = encode_frame(&payload).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn request(&mut self, seqno: u64, body: RequestBody) {
        self.send(vec![Request { seqno, body }]).await;
    }

    /// Reads the next response message. Panics on EOF.
    async fn recv(&mut self) -> ResponseMessage {
        loop {
            if let Some(payload) = self.decoder.next_frame().unwrap() {
                return decode_response_message(payload).unwrap();
            }
            let n = self.stream.read(self.decoder.read_buf()).await.unwrap();
            assert!(n > 0, "unexpected end of stream");
            self.decoder.advance(n);
            self.bytes_received += n;
        }
    }

    async fn recv_one(&mut self) -> Response {
        let mut msg = self.recv().await;
        assert_eq!(msg.responses.len(), 1);
        msg.responses.pop().unwrap()
    }

    /// Expects the server to close the stream.
    async fn expect_eof(&mut self) {
        loop {
            let n = self.stream.read(self.decoder.read_buf()).await.unwrap();
            if n == 0 {
                return;
            }
            self.decoder.advance(n);
        }
    }
}

async fn roundtrip(client: &mut Client, seqno: u64, body: RequestBody) -> Response {
    client.request(seqno, body).await;
    client.recv_one().await
}

fn local_test<F>(test: F)
where
    F: std::future::Future,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    LocalSet::new().block_on(&runtime, async {
        test.await;
    });
}

#[test]
fn ping_round_trip_with_aligned_frames() {
    // S6: a Ping with seqno 42 comes back as an OK ping response with
    // seqno 42, in a frame whose total size is a multiple of 8.
    local_test(async {
        let daemon = start_daemon();
        let mut client = Client::connect(&daemon.socket_path).await;

        let response = roundtrip(&mut client, 42, RequestBody::Ping).await;
        assert_eq!(response.seqno, 42);
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.body, ResponseBody::Ping);
        assert_eq!(client.bytes_received % 8, 0);

        daemon.stop().await;
    });
}

#[test]
fn hello_and_get_segment() {
    local_test(async {
        let daemon = start_daemon();
        let mut client = Client::connect(&daemon.socket_path).await;

        let response = roundtrip(
            &mut client,
            1,
            RequestBody::Hello {
                name: "e2e-test".into(),
                pid: std::process::id(),
            },
        )
        .await;
        assert_eq!(response.status, Status::Ok);
        assert!(matches!(response.body, ResponseBody::Hello { .. }));

        let response = roundtrip(&mut client, 2, RequestBody::GetSegment { segment: 0 }).await;
        match response.body {
            ResponseBody::GetSegment { spec } => assert_eq!(spec.size, 1 << 20),
            other => panic!("unexpected body: {other:?}"),
        }

        let response = roundtrip(&mut client, 3, RequestBody::GetSegment { segment: 1 }).await;
        assert_eq!(response.status, Status::NoSuchSegment);
        assert_eq!(response.body, ResponseBody::None);

        daemon.stop().await;
    });
}

#[test]
fn batched_requests_get_one_batched_response() {
    local_test(async {
        let daemon = start_daemon();
        let mut client = Client::connect(&daemon.socket_path).await;

        client
            .send(vec![
                Request {
                    seqno: 10,
                    body: RequestBody::Ping,
                },
                Request {
                    seqno: 11,
                    body: RequestBody::Alloc {
                        size: 4096,
                        policy: Policy::Default,
                    },
                },
                Request {
                    seqno: 12,
                    body: RequestBody::GetSegment { segment: 9 },
                },
            ])
            .await;

        let msg = client.recv().await;
        assert_eq!(msg.responses.len(), 3);
        assert_eq!(msg.responses[0].seqno, 10);
        assert_eq!(msg.responses[1].seqno, 11);
        assert!(matches!(
            msg.responses[1].body,
            ResponseBody::Alloc { mapping } if mapping.size == 4096
        ));
        assert_eq!(msg.responses[2].status, Status::NoSuchSegment);

        daemon.stop().await;
    });
}

#[test]
fn share_open_flow_between_two_clients() {
    // S1 over the wire.
    local_test(async {
        let daemon = start_daemon();
        let mut producer = Client::connect(&daemon.socket_path).await;
        let mut consumer = Client::connect(&daemon.socket_path).await;

        let response = roundtrip(
            &mut producer,
            1,
            RequestBody::Alloc {
                size: 1024,
                policy: Policy::Default,
            },
        )
        .await;
        let mapping = match response.body {
            ResponseBody::Alloc { mapping } => mapping,
            other => panic!("unexpected body: {other:?}"),
        };

        // Not shared yet: a no-wait open is busy, even for the producer.
        let response = roundtrip(
            &mut producer,
            2,
            RequestBody::Open {
                key: mapping.key,
                policy: Policy::Default,
                wait: false,
            },
        )
        .await;
        assert_eq!(response.status, Status::ObjectBusy);

        let response = roundtrip(&mut producer, 3, RequestBody::Share { key: mapping.key }).await;
        assert_eq!(response.status, Status::Ok);

        let response = roundtrip(
            &mut consumer,
            4,
            RequestBody::Open {
                key: mapping.key,
                policy: Policy::Default,
                wait: false,
            },
        )
        .await;
        assert_eq!(response.status, Status::Ok);
        match response.body {
            ResponseBody::Open { mapping: opened } => assert_eq!(opened, mapping),
            other => panic!("unexpected body: {other:?}"),
        }

        daemon.stop().await;
    });
}

#[test]
fn deferred_open_resumes_when_producer_shares() {
    local_test(async {
        let daemon = start_daemon();
        let mut producer = Client::connect(&daemon.socket_path).await;
        let mut consumer = Client::connect(&daemon.socket_path).await;

        let response = roundtrip(
            &mut producer,
            1,
            RequestBody::Alloc {
                size: 1024,
                policy: Policy::Default,
            },
        )
        .await;
        let key = match response.body {
            ResponseBody::Alloc { mapping } => mapping.key,
            other => panic!("unexpected body: {other:?}"),
        };

        // The consumer's open-and-wait produces no response yet.
        consumer
            .request(
                2,
                RequestBody::Open {
                    key,
                    policy: Policy::Default,
                    wait: true,
                },
            )
            .await;
        let no_response =
            tokio::time::timeout(Duration::from_millis(100), consumer.recv()).await;
        assert!(no_response.is_err(), "open should have been suspended");

        // A ping on the same session completes while the open stays
        // suspended: responses are ordered by completion.
        let response = roundtrip(&mut consumer, 3, RequestBody::Ping).await;
        assert_eq!(response.seqno, 3);

        let response = roundtrip(&mut producer, 4, RequestBody::Share { key }).await;
        assert_eq!(response.status, Status::Ok);

        let response = consumer.recv_one().await;
        assert_eq!(response.seqno, 2);
        assert_eq!(response.status, Status::Ok);
        assert!(matches!(response.body, ResponseBody::Open { .. }));

        daemon.stop().await;
    });
}

#[test]
fn quit_request_ends_the_stream_after_responding() {
    local_test(async {
        let daemon = start_daemon();
        let mut client = Client::connect(&daemon.socket_path).await;

        client.request(5, RequestBody::Quit).await;
        let response = client.recv_one().await;
        assert_eq!((response.seqno, response.status), (5, Status::Ok));
        assert_eq!(response.body, ResponseBody::Quit);
        client.expect_eof().await;

        // The daemon itself is still running and accepts new clients.
        let mut second = Client::connect(&daemon.socket_path).await;
        let response = roundtrip(&mut second, 6, RequestBody::Ping).await;
        assert_eq!(response.status, Status::Ok);

        daemon.stop().await;
    });
}

#[test]
fn disconnect_releases_objects_for_other_clients() {
    local_test(async {
        let daemon = start_daemon();
        let mut producer = Client::connect(&daemon.socket_path).await;
        let mut consumer = Client::connect(&daemon.socket_path).await;

        let response = roundtrip(
            &mut producer,
            1,
            RequestBody::Alloc {
                size: 1024,
                policy: Policy::Default,
            },
        )
        .await;
        let key = match response.body {
            ResponseBody::Alloc { mapping } => mapping.key,
            other => panic!("unexpected body: {other:?}"),
        };

        consumer
            .request(
                2,
                RequestBody::Open {
                    key,
                    policy: Policy::Default,
                    wait: true,
                },
            )
            .await;
        // Give the daemon a chance to register the suspension.
        let registered =
            tokio::time::timeout(Duration::from_millis(100), consumer.recv()).await;
        assert!(registered.is_err());

        // Producer vanishes without closing; the consumer's wait fails.
        drop(producer);
        let response = consumer.recv_one().await;
        assert_eq!(response.seqno, 2);
        assert_eq!(response.status, Status::NoSuchObject);

        daemon.stop().await;
    });
}

#[test]
fn malformed_message_terminates_only_that_session() {
    local_test(async {
        let daemon = start_daemon();
        let mut bad = Client::connect(&daemon.socket_path).await;

        // A syntactically valid frame whose payload is not a decodable
        // request message.
        let frame = encode_frame(&[0xff; 24]).unwrap();
        bad.stream.write_all(&frame).await.unwrap();
        bad.expect_eof().await;

        let mut good = Client::connect(&daemon.socket_path).await;
        let response = roundtrip(&mut good, 1, RequestBody::Ping).await;
        assert_eq!(response.status, Status::Ok);

        daemon.stop().await;
    });
}

#[test]
fn overlong_frame_terminates_the_session() {
    local_test(async {
        let daemon = start_daemon();
        let mut bad = Client::connect(&daemon.socket_path).await;

        // Announce a frame beyond the 32768-byte cap.
        bad.stream
            .write_all(&40000u32.to_le_bytes())
            .await
            .unwrap();
        bad.expect_eof().await;

        daemon.stop().await;
    });
}

#[test]
fn eof_mid_frame_is_detected_and_daemon_survives() {
    local_test(async {
        let daemon = start_daemon();
        let mut bad = Client::connect(&daemon.socket_path).await;

        // Half a length prefix, then hang up.
        bad.stream.write_all(&[16, 0]).await.unwrap();
        bad.stream.shutdown().await.unwrap();
        bad.expect_eof().await;

        let mut good = Client::connect(&daemon.socket_path).await;
        let response = roundtrip(&mut good, 1, RequestBody::Ping).await;
        assert_eq!(response.status, Status::Ok);

        daemon.stop().await;
    });
}

#[test]
fn unknown_token_open_over_the_wire() {
    local_test(async {
        let daemon = start_daemon();
        let mut client = Client::connect(&daemon.socket_path).await;
        let response = roundtrip(
            &mut client,
            9,
            RequestBody::Open {
                key: Token::new(0xdead),
                policy: Policy::Default,
                wait: false,
            },
        )
        .await;
        assert_eq!(response.status, Status::NoSuchObject);
        daemon.stop().await;
    });
}

#[test]
fn daemon_quit_removes_the_socket() {
    local_test(async {
        let daemon = start_daemon();
        let path = daemon.socket_path.clone();
        assert!(path.exists());
        daemon.stop().await;
        assert!(!path.exists());
    });
}
