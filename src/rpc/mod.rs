//! Unix-domain RPC surface.
//!
//! Every message starts with a fixed little-endian header followed by a
//! protobuf-wire-format body. Two sockets serve the same method table:
//! the privileged control plane and the unprivileged data plane. The
//! request path never allocates: decoding borrows from the connection's
//! request buffer and responses are built in a per-connection slab.

mod proto;
mod server;
mod service;
mod wire;

pub use proto::{
    BoolResponse, IntResponse, PoolInsertRequest, ProtoError, RandomBytesRequest,
    RandomBytesResponse, Reader, StatusResponse, U32Request, U32Response, VersionResponse, Writer,
};
pub use server::{RpcServer, ServerConfig};
pub use service::{DispatchError, Method, RpcService, SocketKind, MAX_DATA};
pub use wire::{FrameHeader, StatusCode, HEADER_SIZE, MAX_MSG_SIZE};
