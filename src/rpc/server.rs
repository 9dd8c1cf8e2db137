//! Threaded Unix-domain RPC server.
//!
//! One listener per socket plus one handler thread per accepted
//! connection. Each handler owns a fixed request buffer and a fixed
//! response slab; both are wiped between requests and on every exit
//! path, and no heap allocation happens while a request is in flight.
//!
//! The read loop is bounded by a per-read timeout: an attacker opening
//! connections and going silent would otherwise pin handler buffers
//! indefinitely.

use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use zeroize::Zeroize;

use crate::drng::DrngManager;

use super::service::{RpcService, SocketKind};
use super::wire::{FrameHeader, StatusCode, HEADER_SIZE, MAX_MSG_SIZE};

const REQUEST_BUF_LEN: usize = HEADER_SIZE + MAX_MSG_SIZE;
const RESPONSE_SLAB_LEN: usize = MAX_MSG_SIZE + 128;

/// Socket paths and connection limits.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Privileged socket path, mode 0600.
    pub priv_path: PathBuf,
    /// Unprivileged socket path, mode 0666.
    pub unpriv_path: PathBuf,
    /// Per-read inactivity timeout on connections.
    pub read_timeout: Duration,
    /// Listen backlog.
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            priv_path: PathBuf::from("/var/run/esdm-rpc-priv.socket"),
            unpriv_path: PathBuf::from("/var/run/esdm-rpc-unpriv.socket"),
            read_timeout: Duration::from_secs(2),
            backlog: 255,
        }
    }
}

/// Connection-terminating conditions.
#[derive(Debug, Error)]
enum ConnectionError {
    #[error("read timed out")]
    Timeout,
    #[error("peer closed the connection")]
    Closed,
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ConnectionError::Timeout,
            _ => ConnectionError::Io(err),
        }
    }
}

enum ServeOutcome {
    /// Request handled, response written.
    Done,
    /// Protocol failure answered with `SERVICE_FAILED`.
    Failed,
}

#[repr(align(8))]
struct Aligned<const N: usize>([u8; N]);

struct InitGate {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl InitGate {
    fn new() -> Self {
        Self {
            ready: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        *ready = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        while !*ready {
            ready = self
                .cond
                .wait(ready)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// The two-socket RPC server.
pub struct RpcServer {
    manager: Arc<DrngManager>,
    config: ServerConfig,
    init_gate: Arc<InitGate>,
}

impl RpcServer {
    /// Creates a server over the given manager.
    pub fn new(manager: Arc<DrngManager>, config: ServerConfig) -> Self {
        Self {
            manager,
            config,
            init_gate: Arc::new(InitGate::new()),
        }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the DRNG manager behind the server.
    pub fn manager(&self) -> &Arc<DrngManager> {
        &self.manager
    }

    fn socket_path(&self, kind: SocketKind) -> &Path {
        match kind {
            SocketKind::Privileged => &self.config.priv_path,
            SocketKind::Unprivileged => &self.config.unpriv_path,
        }
    }

    /// Creates, binds and permissions one listening socket.
    ///
    /// A stale socket nobody listens on is removed first; any other file
    /// in the way is a startup error.
    pub fn bind_listener(&self, kind: SocketKind) -> io::Result<UnixListener> {
        let path = self.socket_path(kind);
        remove_stale_socket(path)?;

        let listener = bind_unix_listener(path, self.config.backlog)?;

        let mode = match kind {
            SocketKind::Privileged => 0o600,
            SocketKind::Unprivileged => 0o666,
        };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;

        tracing::info!(path = %path.display(), mode = format_args!("{mode:o}"), "RPC socket listening");
        Ok(listener)
    }

    /// Signals that the main process has dropped privileges; the
    /// unprivileged worker starts accepting once this fires.
    pub fn signal_privileges_dropped(&self) {
        self.init_gate.signal();
    }

    /// Spawns the unprivileged worker thread.
    ///
    /// The worker binds its socket immediately but only accepts
    /// connections after [`Self::signal_privileges_dropped`]. A bind
    /// failure takes the whole service down.
    pub fn spawn_unprivileged(&self) -> io::Result<thread::JoinHandle<()>> {
        let listener = self.bind_listener(SocketKind::Unprivileged)?;
        let manager = Arc::clone(&self.manager);
        let gate = Arc::clone(&self.init_gate);
        let read_timeout = self.config.read_timeout;

        thread::Builder::new()
            .name("esdm-rpc-unpriv".into())
            .spawn(move || {
                gate.wait();
                tracing::debug!("Unprivileged RPC worker active");
                accept_loop(listener, manager, SocketKind::Unprivileged, read_timeout);
            })
    }

    /// Runs the privileged accept loop in the calling thread until
    /// shutdown is requested.
    pub fn serve_privileged(&self, listener: UnixListener) {
        accept_loop(
            listener,
            Arc::clone(&self.manager),
            SocketKind::Privileged,
            self.config.read_timeout,
        );
    }

    /// Runs an accept loop for an already-bound listener.
    ///
    /// Used by tests to serve on throwaway paths.
    pub fn serve(&self, listener: UnixListener, kind: SocketKind) {
        accept_loop(
            listener,
            Arc::clone(&self.manager),
            kind,
            self.config.read_timeout,
        );
    }

    /// Requests shutdown: accept loops drain, handlers finish their
    /// in-flight request, blocked callers are woken.
    pub fn request_exit(&self) {
        self.manager.shutdown();
        self.init_gate.signal();
    }

    /// Removes both socket paths; called by the cleanup process.
    pub fn cleanup_sockets(config: &ServerConfig) {
        for path in [&config.priv_path, &config.unpriv_path] {
            match fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "RPC socket removed"),
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "RPC socket removal failed")
                }
            }
        }
    }
}

/// Probes a socket path and unlinks it when nobody is listening.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }

    match UnixStream::connect(path) {
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} is already being served", path.display()),
        )),
        Err(_) => {
            tracing::info!(path = %path.display(), "Removing stale socket");
            fs::remove_file(path)
        }
    }
}

/// Binds a Unix stream listener with an explicit backlog.
#[allow(unsafe_code)]
fn bind_unix_listener(path: &Path, backlog: i32) -> io::Result<UnixListener> {
    let bytes = path.as_os_str().as_bytes();

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path too long",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    if unsafe { libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    if unsafe { libc::listen(fd, backlog) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(unsafe { UnixListener::from_raw_fd(fd) })
}

/// Queries the peer uid of a connection.
///
/// A failed query counts as unprivileged.
#[allow(unsafe_code)]
fn peer_uid(stream: &UnixStream) -> Option<u32> {
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    (ret == 0).then_some(cred.uid)
}

fn accept_loop(
    listener: UnixListener,
    manager: Arc<DrngManager>,
    kind: SocketKind,
    read_timeout: Duration,
) {
    let service = Arc::new(RpcService::new(Arc::clone(&manager), kind));

    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!(%err, "Cannot make listener non-blocking");
        manager.state().request_exit();
        return;
    }

    while !manager.state().exiting() {
        match listener.accept() {
            Ok((stream, _)) => {
                tracing::debug!(?kind, "Processing new incoming connection");
                let service = Arc::clone(&service);
                let spawned = thread::Builder::new()
                    .name("esdm-rpc-handler".into())
                    .spawn(move || handle_connection(stream, service, read_timeout));
                if let Err(err) = spawned {
                    // Out of threads or memory; drop the connection and
                    // keep serving the peers we already have.
                    tracing::error!(%err, "Spawning connection handler failed");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                tracing::warn!(%err, "Accepting incoming connection failed");
            }
        }
    }

    tracing::debug!(?kind, "Accept loop terminated");
}

fn handle_connection(mut stream: UnixStream, service: Arc<RpcService>, read_timeout: Duration) {
    if let Err(err) = stream.set_read_timeout(Some(read_timeout)) {
        tracing::warn!(%err, "Cannot arm read timeout; dropping connection");
        return;
    }

    let mut request = Aligned([0u8; REQUEST_BUF_LEN]);
    let mut response = Aligned([0u8; RESPONSE_SLAB_LEN]);
    let mut failures = 0u32;

    // Reuse the connection for successive requests until the first
    // terminating condition.
    while !service.manager().state().exiting() {
        match serve_request(&mut stream, &service, &mut request.0, &mut response.0) {
            Ok(ServeOutcome::Done) => failures = 0,
            Ok(ServeOutcome::Failed) => {
                failures += 1;
                if failures > 1 {
                    tracing::debug!("Closing connection after repeated protocol failures");
                    break;
                }
            }
            Err(ConnectionError::Closed) => break,
            Err(ConnectionError::Timeout) => {
                tracing::debug!("Connection read timed out");
                break;
            }
            Err(ConnectionError::Io(err)) => {
                tracing::debug!(%err, "Connection error");
                break;
            }
        }
    }

    request.0.zeroize();
    response.0.zeroize();
}

/// Serves one request from the connection.
///
/// Both buffers are wiped before returning, on success and on every
/// error path.
fn serve_request(
    stream: &mut UnixStream,
    service: &RpcService,
    request: &mut [u8],
    response: &mut [u8],
) -> Result<ServeOutcome, ConnectionError> {
    let outcome = read_and_dispatch(stream, service, request, response);
    request.zeroize();
    response.zeroize();
    outcome
}

fn read_and_dispatch(
    stream: &mut UnixStream,
    service: &RpcService,
    request: &mut [u8],
    response: &mut [u8],
) -> Result<ServeOutcome, ConnectionError> {
    read_exact(stream, &mut request[..HEADER_SIZE])?;
    let header = FrameHeader::decode(&request[..HEADER_SIZE]);

    // Clamp the length a client can make us read.
    let body_len = (header.message_length as usize).min(MAX_MSG_SIZE);
    read_exact(stream, &mut request[HEADER_SIZE..HEADER_SIZE + body_len])?;

    tracing::trace!(
        method_index = header.method_index,
        message_length = body_len,
        request_id = header.request_id,
        "Server received request"
    );

    let privileged = peer_uid(stream) == Some(0);
    let body = &request[HEADER_SIZE..HEADER_SIZE + body_len];

    match service.dispatch(header.method_index, body, privileged, response) {
        Ok(len) => {
            let reply = FrameHeader::response(
                StatusCode::Success,
                header.method_index,
                len as u32,
                header.request_id,
            );
            stream.write_all(&reply.encode())?;
            stream.write_all(&response[..len])?;
            Ok(ServeOutcome::Done)
        }
        Err(err) => {
            tracing::debug!(%err, method_index = header.method_index, "Request failed");
            let reply = FrameHeader::response(
                StatusCode::ServiceFailed,
                header.method_index,
                0,
                header.request_id,
            );
            stream.write_all(&reply.encode())?;
            Ok(ServeOutcome::Failed)
        }
    }
}

fn read_exact(stream: &mut UnixStream, buf: &mut [u8]) -> Result<(), ConnectionError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(ConnectionError::Closed),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditioning::HashAlgorithm;
    use crate::drng::ManagerConfig;
    use crate::rpc::proto::{RandomBytesRequest, RandomBytesResponse, Writer};
    use crate::sources::{MockSource, SourceRegistry};

    fn test_service(kind: SocketKind) -> RpcService {
        let mut sources = SourceRegistry::new();
        sources.register(Box::new(MockSource::with_budget(512, u32::MAX / 2)));
        let manager = Arc::new(DrngManager::new(
            ManagerConfig {
                nodes: 1,
                hash: HashAlgorithm::Sha256,
                ..ManagerConfig::default()
            },
            sources,
        ));
        RpcService::new(manager, kind)
    }

    fn encode_frame(method_index: u32, request_id: u32, body: &[u8]) -> Vec<u8> {
        let header = FrameHeader::request(method_index, body.len() as u32, request_id);
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(body);
        frame
    }

    fn random_bytes_body(len: u32) -> Vec<u8> {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        RandomBytesRequest { len }.encode(&mut w).expect("encode");
        let n = w.len();
        buf[..n].to_vec()
    }

    #[test]
    fn test_serve_request_echoes_request_id() {
        let service = test_service(SocketKind::Unprivileged);
        let (mut client, mut server) = UnixStream::pair().expect("socketpair");
        server
            .set_read_timeout(Some(Duration::from_millis(500)))
            .expect("timeout");

        let frame = encode_frame(0, 0xDEAD_BEEF, &random_bytes_body(32));
        client.write_all(&frame).expect("send");

        let mut request = [0u8; REQUEST_BUF_LEN];
        let mut response = [0u8; RESPONSE_SLAB_LEN];
        let outcome = serve_request(&mut server, &service, &mut request, &mut response);
        assert!(matches!(outcome, Ok(ServeOutcome::Done)));

        let mut header_bytes = [0u8; HEADER_SIZE];
        client.read_exact(&mut header_bytes).expect("response header");
        let header = FrameHeader::decode(&header_bytes);
        assert_eq!(header.status, StatusCode::Success as u32);
        assert_eq!(header.method_index, 0);
        assert_eq!(header.request_id, 0xDEAD_BEEF);

        let mut body = vec![0u8; header.message_length as usize];
        client.read_exact(&mut body).expect("response body");
        let resp = RandomBytesResponse::decode(&body).expect("decode");
        assert_eq!(resp.ret, 0);
        assert_eq!(resp.data.len(), 32);
    }

    #[test]
    fn test_buffers_wiped_after_request() {
        let service = test_service(SocketKind::Unprivileged);
        let (mut client, mut server) = UnixStream::pair().expect("socketpair");
        server
            .set_read_timeout(Some(Duration::from_millis(500)))
            .expect("timeout");

        // A recognizable body pattern that must not survive the request.
        let mut body = random_bytes_body(16);
        body.extend_from_slice(&[0xEE; 32]); // unknown trailing field bytes are fine
        let frame = encode_frame(99, 7, &body); // unknown method also wipes

        client.write_all(&frame).expect("send");

        let mut request = [0u8; REQUEST_BUF_LEN];
        let mut response = [0u8; RESPONSE_SLAB_LEN];
        let _ = serve_request(&mut server, &service, &mut request, &mut response);

        assert!(request.iter().all(|&b| b == 0), "request buffer not wiped");
        assert!(response.iter().all(|&b| b == 0), "response slab not wiped");
    }

    #[test]
    fn test_unknown_method_answers_service_failed() {
        let service = test_service(SocketKind::Unprivileged);
        let (mut client, mut server) = UnixStream::pair().expect("socketpair");
        server
            .set_read_timeout(Some(Duration::from_millis(500)))
            .expect("timeout");

        let frame = encode_frame(99, 42, &[]);
        client.write_all(&frame).expect("send");

        let mut request = [0u8; REQUEST_BUF_LEN];
        let mut response = [0u8; RESPONSE_SLAB_LEN];
        let outcome = serve_request(&mut server, &service, &mut request, &mut response);
        assert!(matches!(outcome, Ok(ServeOutcome::Failed)));

        let mut header_bytes = [0u8; HEADER_SIZE];
        client.read_exact(&mut header_bytes).expect("response header");
        let header = FrameHeader::decode(&header_bytes);
        assert_eq!(header.status, StatusCode::ServiceFailed as u32);
        assert_eq!(header.method_index, 99);
        assert_eq!(header.message_length, 0);
        assert_eq!(header.request_id, 42);
    }

    #[test]
    fn test_partial_header_times_out() {
        let service = test_service(SocketKind::Unprivileged);
        let (mut client, mut server) = UnixStream::pair().expect("socketpair");
        server
            .set_read_timeout(Some(Duration::from_millis(200)))
            .expect("timeout");

        // First 8 bytes of a header, then silence.
        client.write_all(&[0u8; 8]).expect("send");

        let mut request = [0u8; REQUEST_BUF_LEN];
        let mut response = [0u8; RESPONSE_SLAB_LEN];
        let outcome = serve_request(&mut server, &service, &mut request, &mut response);
        assert!(matches!(outcome, Err(ConnectionError::Timeout)));
    }

    #[test]
    fn test_oversized_length_is_clamped() {
        let service = test_service(SocketKind::Unprivileged);
        let (mut client, mut server) = UnixStream::pair().expect("socketpair");
        server
            .set_read_timeout(Some(Duration::from_millis(500)))
            .expect("timeout");

        // Header claims more than the cap; only the clamped body follows.
        let header = FrameHeader::request(4, u32::MAX, 1);
        client.write_all(&header.encode()).expect("send header");
        let body = vec![0u8; MAX_MSG_SIZE];
        client.write_all(&body).expect("send body");

        let mut request = [0u8; REQUEST_BUF_LEN];
        let mut response = [0u8; RESPONSE_SLAB_LEN];
        let outcome = serve_request(&mut server, &service, &mut request, &mut response);
        assert!(matches!(outcome, Ok(ServeOutcome::Done)));
    }

    #[test]
    fn test_connection_reuse_for_sequential_requests() {
        let service = Arc::new(test_service(SocketKind::Unprivileged));
        let (mut client, server) = UnixStream::pair().expect("socketpair");

        let handler = {
            let service = Arc::clone(&service);
            thread::spawn(move || handle_connection(server, service, Duration::from_millis(500)))
        };

        let mut responses = Vec::new();
        for id in 0..3u32 {
            let frame = encode_frame(0, id, &random_bytes_body(16));
            client.write_all(&frame).expect("send");

            let mut header_bytes = [0u8; HEADER_SIZE];
            client.read_exact(&mut header_bytes).expect("header");
            let header = FrameHeader::decode(&header_bytes);
            assert_eq!(header.request_id, id);

            let mut body = vec![0u8; header.message_length as usize];
            client.read_exact(&mut body).expect("body");
            let resp = RandomBytesResponse::decode(&body).expect("decode");
            responses.push(resp.data.to_vec());
        }

        assert_ne!(responses[0], responses[1]);
        assert_ne!(responses[1], responses[2]);

        drop(client);
        handler.join().expect("handler");
    }

    #[test]
    fn test_stale_socket_is_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stale.socket");

        // A socket nobody listens on anymore.
        drop(UnixListener::bind(&path).expect("bind"));
        assert!(path.exists());

        remove_stale_socket(&path).expect("stale removal");
        assert!(!path.exists());
    }

    #[test]
    fn test_non_socket_file_blocks_startup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("not-a-socket");
        fs::write(&path, b"junk").expect("write");

        let err = remove_stale_socket(&path).expect_err("must fail");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(path.exists());
    }

    #[test]
    fn test_live_socket_is_left_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("live.socket");
        let _listener = UnixListener::bind(&path).expect("bind");

        let err = remove_stale_socket(&path).expect_err("must fail");
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert!(path.exists());
    }

    #[test]
    fn test_bind_listener_applies_backlog_and_accepts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bound.socket");

        let listener = bind_unix_listener(&path, 255).expect("bind");
        let client = UnixStream::connect(&path).expect("connect");
        let (server, _) = listener.accept().expect("accept");

        assert_eq!(peer_uid(&server), peer_uid(&client));
        assert!(peer_uid(&server).is_some());
    }
}
