//! End-to-end RPC over a live Unix-domain socket.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use esdm::conditioning::HashAlgorithm;
use esdm::drng::{DrngManager, ManagerConfig};
use esdm::rpc::{
    FrameHeader, RandomBytesRequest, RandomBytesResponse, RpcServer, ServerConfig, SocketKind,
    StatusCode, StatusResponse, Writer, HEADER_SIZE,
};
use esdm::sources::{MockSource, SourceRegistry};

struct TestDaemon {
    server: Arc<RpcServer>,
    socket: std::path::PathBuf,
    worker: Option<thread::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut sources = SourceRegistry::new();
        sources.register(Box::new(MockSource::with_budget(512, u32::MAX / 2)));
        let manager = Arc::new(DrngManager::new(
            ManagerConfig {
                nodes: 1,
                hash: HashAlgorithm::Sha512,
                ..ManagerConfig::default()
            },
            sources,
        ));

        let config = ServerConfig {
            priv_path: dir.path().join("priv.socket"),
            unpriv_path: dir.path().join("unpriv.socket"),
            read_timeout: Duration::from_millis(500),
            backlog: 255,
        };
        let socket = config.unpriv_path.clone();

        let server = Arc::new(RpcServer::new(manager, config));
        let listener = server
            .bind_listener(SocketKind::Unprivileged)
            .expect("bind unprivileged socket");

        let worker = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.serve(listener, SocketKind::Unprivileged))
        };

        Self {
            server,
            socket,
            worker: Some(worker),
            _dir: dir,
        }
    }

    fn connect(&self) -> UnixStream {
        let stream = UnixStream::connect(&self.socket).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("client timeout");
        stream
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.server.request_exit();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn send_request(stream: &mut UnixStream, method_index: u32, request_id: u32, body: &[u8]) {
    let header = FrameHeader::request(method_index, body.len() as u32, request_id);
    stream.write_all(&header.encode()).expect("send header");
    stream.write_all(body).expect("send body");
}

fn read_response(stream: &mut UnixStream) -> (FrameHeader, Vec<u8>) {
    let mut header_bytes = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_bytes).expect("response header");
    let header = FrameHeader::decode(&header_bytes);

    let mut body = vec![0u8; header.message_length as usize];
    stream.read_exact(&mut body).expect("response body");
    (header, body)
}

fn random_bytes_body(len: u32) -> Vec<u8> {
    let mut buf = [0u8; 64];
    let mut w = Writer::new(&mut buf);
    RandomBytesRequest { len }.encode(&mut w).expect("encode");
    let n = w.len();
    buf[..n].to_vec()
}

#[test]
fn basic_read_returns_distinct_bytes() {
    let daemon = TestDaemon::start();
    let mut client = daemon.connect();

    send_request(&mut client, 0, 0xDEAD_BEEF, &random_bytes_body(32));
    let (header, body) = read_response(&mut client);

    assert_eq!(header.status, StatusCode::Success as u32);
    assert_eq!(header.method_index, 0);
    assert_eq!(header.request_id, 0xDEAD_BEEF);

    let first = RandomBytesResponse::decode(&body).expect("decode");
    assert_eq!(first.ret, 0);
    assert_eq!(first.data.len(), 32);
    let first = first.data.to_vec();

    // An identical request must yield different output.
    send_request(&mut client, 0, 0xDEAD_BEEF, &random_bytes_body(32));
    let (_, body) = read_response(&mut client);
    let second = RandomBytesResponse::decode(&body).expect("decode");

    assert_ne!(first, second.data);
}

#[test]
fn full_read_then_status_reports_operational() {
    let daemon = TestDaemon::start();
    let mut client = daemon.connect();

    send_request(&mut client, 1, 1, &random_bytes_body(16));
    let (header, body) = read_response(&mut client);
    assert_eq!(header.status, StatusCode::Success as u32);
    let resp = RandomBytesResponse::decode(&body).expect("decode");
    assert_eq!(resp.data.len(), 16);

    send_request(&mut client, 4, 2, &[]);
    let (_, body) = read_response(&mut client);
    let status = StatusResponse::decode(&body).expect("decode");

    assert!(status.operational);
    assert!(status.fully_seeded);
    assert_eq!(status.poolsize_aux_bits, 512);
}

#[test]
fn privileged_method_fails_on_unprivileged_socket() {
    let daemon = TestDaemon::start();
    let mut client = daemon.connect();

    send_request(&mut client, 4, 10, &[]);
    let (_, body) = read_response(&mut client);
    let before = StatusResponse::decode(&body).expect("decode").avail_entropy_aux_bits;

    // pool_insert_aux is absent from the unprivileged method table.
    let mut buf = [0u8; 256];
    let mut w = Writer::new(&mut buf);
    esdm::rpc::PoolInsertRequest { data: &[0u8; 64], entropy_bits: 256 }
        .encode(&mut w)
        .expect("encode");
    let n = w.len();
    let insert_body = buf[..n].to_vec();

    send_request(&mut client, 12, 11, &insert_body);
    let (header, body) = read_response(&mut client);
    assert_eq!(header.status, StatusCode::ServiceFailed as u32);
    assert_eq!(header.request_id, 11);
    assert!(body.is_empty());

    send_request(&mut client, 4, 12, &[]);
    let (_, body) = read_response(&mut client);
    let after = StatusResponse::decode(&body).expect("decode").avail_entropy_aux_bits;
    assert_eq!(before, after);
}

#[test]
fn half_sent_header_gets_connection_closed_but_service_survives() {
    let daemon = TestDaemon::start();

    let mut stalled = daemon.connect();
    stalled.write_all(&[0u8; 8]).expect("partial header");

    // The server closes the stalled connection after its read timeout.
    thread::sleep(Duration::from_millis(800));
    let mut probe = [0u8; 1];
    match stalled.read(&mut probe) {
        Ok(0) => {}
        Ok(_) => panic!("unexpected data on stalled connection"),
        Err(err) => panic!("expected EOF, got {err}"),
    }

    // A fresh connection is serviced normally.
    let mut client = daemon.connect();
    send_request(&mut client, 0, 99, &random_bytes_body(8));
    let (header, body) = read_response(&mut client);
    assert_eq!(header.status, StatusCode::Success as u32);
    assert_eq!(header.request_id, 99);
    let resp = RandomBytesResponse::decode(&body).expect("decode");
    assert_eq!(resp.data.len(), 8);
}

#[test]
fn concurrent_clients_are_served() {
    let daemon = TestDaemon::start();

    let workers: Vec<_> = (0..4u32)
        .map(|id| {
            let mut client = daemon.connect();
            thread::spawn(move || {
                send_request(&mut client, 0, id, &random_bytes_body(64));
                let (header, body) = read_response(&mut client);
                assert_eq!(header.request_id, id);
                RandomBytesResponse::decode(&body).expect("decode").data.to_vec()
            })
        })
        .collect();

    let outputs: Vec<Vec<u8>> = workers
        .into_iter()
        .map(|w| w.join().expect("client thread"))
        .collect();

    for (i, a) in outputs.iter().enumerate() {
        assert_eq!(a.len(), 64);
        for b in &outputs[i + 1..] {
            assert_ne!(a, b);
        }
    }
}

#[test]
fn socket_file_has_expected_type() {
    let daemon = TestDaemon::start();
    let metadata = std::fs::metadata(Path::new(&daemon.socket)).expect("socket metadata");
    assert!(std::os::unix::fs::FileTypeExt::is_socket(&metadata.file_type()));
}
