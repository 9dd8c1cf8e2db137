//! RPC method table and dispatch.
//!
//! Both sockets share one method numbering; the privileged methods only
//! exist in the privileged socket's table and additionally require the
//! peer to be root. Method-level errors travel in the response `ret`
//! field; dispatch-level errors surface as `SERVICE_FAILED` frames.

use std::sync::Arc;

use thiserror::Error;

use crate::drng::{DrngManager, EsdmError};

use super::proto::{
    BoolResponse, IntResponse, PoolInsertRequest, ProtoError, RandomBytesRequest, StatusResponse,
    U32Request, U32Response, VersionResponse, Writer,
};
use super::wire::MAX_MSG_SIZE;

/// Maximum random-byte payload per response, leaving room for the
/// message framing inside the body cap.
pub const MAX_DATA: usize = MAX_MSG_SIZE - 32;

const RET_OK: i32 = 0;
const RET_EINTR: i32 = -4;
const RET_EAGAIN: i32 = -11;
const RET_EINVAL: i32 = -22;

/// Which socket a service instance is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Root-only control plane.
    Privileged,
    /// World-accessible data plane.
    Unprivileged,
}

/// The RPC method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Method {
    /// Best-effort random bytes.
    GetRandomBytes = 0,
    /// Random bytes from a fully seeded DRNG.
    GetRandomBytesFull = 1,
    /// Random bytes from a minimally seeded DRNG.
    GetRandomBytesMin = 2,
    /// Prediction-resistant random bytes.
    GetRandomBytesPr = 3,
    /// Service status snapshot.
    Status = 4,
    /// Daemon version.
    Version = 5,
    /// Current fully-seeded flag.
    IsFullySeeded = 6,
    /// Entropy available across sources and pool.
    AvailEntropy = 7,
    /// Entropy credited to the aux pool.
    AvailEntropyAux = 8,
    /// Aux pool width.
    AvailPoolsizeAux = 9,
    /// Write-wakeup threshold.
    GetWriteWakeupBits = 10,
    /// Maximum reseed interval.
    GetReseedMaxTime = 11,
    /// Insert entropy into the aux pool (privileged).
    PoolInsertAux = 12,
    /// Set the write-wakeup threshold (privileged).
    SetWriteWakeupBits = 13,
    /// Set the maximum reseed interval (privileged).
    SetReseedMaxTime = 14,
    /// Force a reseed of all DRNGs (privileged).
    DrngForceReseed = 15,
}

impl Method {
    /// Looks a method up by its wire ordinal.
    pub fn from_index(index: u32) -> Option<Self> {
        use Method::*;
        Some(match index {
            0 => GetRandomBytes,
            1 => GetRandomBytesFull,
            2 => GetRandomBytesMin,
            3 => GetRandomBytesPr,
            4 => Status,
            5 => Version,
            6 => IsFullySeeded,
            7 => AvailEntropy,
            8 => AvailEntropyAux,
            9 => AvailPoolsizeAux,
            10 => GetWriteWakeupBits,
            11 => GetReseedMaxTime,
            12 => PoolInsertAux,
            13 => SetWriteWakeupBits,
            14 => SetReseedMaxTime,
            15 => DrngForceReseed,
            _ => return None,
        })
    }

    /// Returns true for control-plane methods.
    pub fn requires_privilege(self) -> bool {
        matches!(
            self,
            Method::PoolInsertAux
                | Method::SetWriteWakeupBits
                | Method::SetReseedMaxTime
                | Method::DrngForceReseed
        )
    }

    /// Method name for logs.
    pub fn name(self) -> &'static str {
        match self {
            Method::GetRandomBytes => "get_random_bytes",
            Method::GetRandomBytesFull => "get_random_bytes_full",
            Method::GetRandomBytesMin => "get_random_bytes_min",
            Method::GetRandomBytesPr => "get_random_bytes_pr",
            Method::Status => "status",
            Method::Version => "version",
            Method::IsFullySeeded => "is_fully_seeded",
            Method::AvailEntropy => "avail_entropy",
            Method::AvailEntropyAux => "avail_entropy_aux",
            Method::AvailPoolsizeAux => "avail_poolsize_aux",
            Method::GetWriteWakeupBits => "get_write_wakeup_bits",
            Method::GetReseedMaxTime => "get_reseed_max_time",
            Method::PoolInsertAux => "pool_insert_aux",
            Method::SetWriteWakeupBits => "set_write_wakeup_bits",
            Method::SetReseedMaxTime => "set_reseed_max_time",
            Method::DrngForceReseed => "drng_force_reseed",
        }
    }
}

/// Dispatch-level failures, all reported as `SERVICE_FAILED` frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The method ordinal is not in this socket's table.
    #[error("unknown method index")]
    UnknownMethod,
    /// A privileged method was called without privilege.
    #[error("insufficient privilege")]
    NotPermitted,
    /// The request body could not be decoded.
    #[error("malformed request: {0}")]
    Decode(ProtoError),
    /// The response did not fit the output slab.
    #[error("response encoding failed: {0}")]
    Encode(ProtoError),
}

impl From<ProtoError> for DispatchError {
    fn from(err: ProtoError) -> Self {
        DispatchError::Encode(err)
    }
}

fn ret_code(err: &EsdmError) -> i32 {
    match err {
        EsdmError::TryAgain => RET_EAGAIN,
        EsdmError::Oversized { .. } => RET_EINVAL,
        EsdmError::ShuttingDown => RET_EINTR,
    }
}

/// One socket's view of the RPC service.
pub struct RpcService {
    manager: Arc<DrngManager>,
    kind: SocketKind,
}

impl RpcService {
    /// Creates a service bound to one socket kind.
    pub fn new(manager: Arc<DrngManager>, kind: SocketKind) -> Self {
        Self { manager, kind }
    }

    /// Returns the socket kind this service is bound to.
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Returns the DRNG manager behind the service.
    pub fn manager(&self) -> &Arc<DrngManager> {
        &self.manager
    }

    /// Decodes the request, invokes the method and encodes the response
    /// into `out`. Returns the response body length.
    pub fn dispatch(
        &self,
        method_index: u32,
        body: &[u8],
        peer_privileged: bool,
        out: &mut [u8],
    ) -> Result<usize, DispatchError> {
        let method = Method::from_index(method_index).ok_or(DispatchError::UnknownMethod)?;

        if method.requires_privilege() {
            if self.kind != SocketKind::Privileged {
                return Err(DispatchError::UnknownMethod);
            }
            if !peer_privileged {
                tracing::warn!(method = method.name(), "Privileged method denied");
                return Err(DispatchError::NotPermitted);
            }
        }

        tracing::trace!(method = method.name(), body_len = body.len(), "Dispatching");

        let mut w = Writer::new(out);
        match method {
            Method::GetRandomBytes => {
                self.random_bytes(body, &mut w, |m, buf| m.get_random_bytes(buf))?
            }
            Method::GetRandomBytesFull => {
                self.random_bytes(body, &mut w, |m, buf| m.get_random_bytes_full(buf))?
            }
            Method::GetRandomBytesMin => {
                self.random_bytes(body, &mut w, |m, buf| m.get_random_bytes_min(buf))?
            }
            Method::GetRandomBytesPr => {
                self.random_bytes(body, &mut w, |m, buf| m.get_random_bytes_pr(buf))?
            }
            Method::Status => {
                let s = self.manager.status();
                StatusResponse {
                    ret: RET_OK,
                    operational: s.operational,
                    fully_seeded: s.fully_seeded,
                    min_seeded: s.min_seeded,
                    sp80090c: s.sp80090c,
                    avail_entropy_bits: s.avail_entropy_bits,
                    avail_entropy_aux_bits: s.avail_entropy_aux_bits,
                    poolsize_aux_bits: s.poolsize_aux_bits,
                    generation: s.generation,
                    write_wakeup_bits: s.write_wakeup_bits,
                    reseed_max_secs: s.reseed_max_secs,
                }
                .encode(&mut w)?
            }
            Method::Version => VersionResponse {
                ret: RET_OK,
                version: crate::VERSION,
            }
            .encode(&mut w)?,
            Method::IsFullySeeded => BoolResponse {
                ret: RET_OK,
                value: self.manager.state().is_fully_seeded(),
            }
            .encode(&mut w)?,
            Method::AvailEntropy => U32Response {
                ret: RET_OK,
                value: self.manager.avail_entropy_bits(),
            }
            .encode(&mut w)?,
            Method::AvailEntropyAux => U32Response {
                ret: RET_OK,
                value: self.manager.pool().available_entropy(),
            }
            .encode(&mut w)?,
            Method::AvailPoolsizeAux => U32Response {
                ret: RET_OK,
                value: self.manager.pool().poolsize(),
            }
            .encode(&mut w)?,
            Method::GetWriteWakeupBits => U32Response {
                ret: RET_OK,
                value: self.manager.state().write_wakeup_bits(),
            }
            .encode(&mut w)?,
            Method::GetReseedMaxTime => U32Response {
                ret: RET_OK,
                value: self.manager.state().reseed_max_secs(),
            }
            .encode(&mut w)?,
            Method::PoolInsertAux => {
                let req = PoolInsertRequest::decode(body).map_err(DispatchError::Decode)?;
                self.manager.pool().insert(req.data, req.entropy_bits);
                IntResponse { ret: RET_OK }.encode(&mut w)?
            }
            Method::SetWriteWakeupBits => {
                let req = U32Request::decode(body).map_err(DispatchError::Decode)?;
                self.manager.state().set_write_wakeup_bits(req.value);
                IntResponse { ret: RET_OK }.encode(&mut w)?
            }
            Method::SetReseedMaxTime => {
                let req = U32Request::decode(body).map_err(DispatchError::Decode)?;
                let ret = if req.value == 0 {
                    RET_EINVAL
                } else {
                    self.manager.state().set_reseed_max_secs(req.value);
                    RET_OK
                };
                IntResponse { ret }.encode(&mut w)?
            }
            Method::DrngForceReseed => {
                self.manager.force_reseed();
                IntResponse { ret: RET_OK }.encode(&mut w)?
            }
        }

        Ok(w.len())
    }

    fn random_bytes<F>(
        &self,
        body: &[u8],
        w: &mut Writer<'_>,
        generate: F,
    ) -> Result<(), DispatchError>
    where
        F: FnOnce(&DrngManager, &mut [u8]) -> Result<usize, EsdmError>,
    {
        let req = RandomBytesRequest::decode(body).map_err(DispatchError::Decode)?;
        let n = (req.len as usize).min(MAX_DATA);

        let mut ret = RET_OK;
        w.put_bytes_with(2, n, |dest| match generate(&self.manager, dest) {
            Ok(written) => written,
            Err(err) => {
                ret = ret_code(&err);
                0
            }
        })?;
        w.put_int(1, i64::from(ret))?;
        Ok(())
    }
}
