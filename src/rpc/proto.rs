//! Protobuf-wire-format message codec.
//!
//! The RPC bodies are packed protobuf-compatible messages: varint and
//! length-delimited fields with the standard tag encoding. The decoder
//! borrows all byte and string fields from the request buffer and the
//! encoder is a bump writer over the connection's response slab, so
//! neither direction touches the heap.

use thiserror::Error;

const WIRE_VARINT: u32 = 0;
const WIRE_FIXED64: u32 = 1;
const WIRE_LEN: u32 = 2;
const WIRE_FIXED32: u32 = 5;

/// Codec errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    /// The output buffer cannot hold the message.
    #[error("message buffer exhausted")]
    Overflow,
    /// The input ended inside a field.
    #[error("truncated message")]
    Truncated,
    /// A varint ran past 64 bits.
    #[error("varint exceeds 64 bits")]
    InvalidVarint,
    /// A field used a wire type the codec does not understand.
    #[error("unsupported wire type {0}")]
    InvalidWireType(u32),
    /// A known field carried the wrong wire type.
    #[error("malformed field")]
    Malformed,
    /// A string field held invalid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
}

fn varint_len(mut v: u64) -> usize {
    let mut len = 1;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

fn encode_varint(buf: &mut [u8], mut v: u64) -> usize {
    let mut i = 0;
    while v >= 0x80 {
        buf[i] = (v as u8) | 0x80;
        v >>= 7;
        i += 1;
    }
    buf[i] = v as u8;
    i + 1
}

/// Bump writer building a message in a caller-provided slab.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    /// Creates a writer over an output slab.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the bytes written so far.
    pub fn len(&self) -> usize {
        self.pos
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    fn put_varint(&mut self, v: u64) -> Result<(), ProtoError> {
        if self.pos + varint_len(v) > self.buf.len() {
            return Err(ProtoError::Overflow);
        }
        self.pos += encode_varint(&mut self.buf[self.pos..], v);
        Ok(())
    }

    fn put_tag(&mut self, field: u32, wire_type: u32) -> Result<(), ProtoError> {
        self.put_varint(u64::from(field) << 3 | u64::from(wire_type))
    }

    /// Writes an unsigned varint field; zero is omitted per proto3.
    pub fn put_uint(&mut self, field: u32, v: u64) -> Result<(), ProtoError> {
        if v == 0 {
            return Ok(());
        }
        self.put_tag(field, WIRE_VARINT)?;
        self.put_varint(v)
    }

    /// Writes a signed varint field with int32/int64 semantics.
    pub fn put_int(&mut self, field: u32, v: i64) -> Result<(), ProtoError> {
        self.put_uint(field, v as u64)
    }

    /// Writes a bool field; false is omitted per proto3.
    pub fn put_bool(&mut self, field: u32, v: bool) -> Result<(), ProtoError> {
        self.put_uint(field, u64::from(v))
    }

    /// Writes a bytes field; empty is omitted per proto3.
    pub fn put_bytes(&mut self, field: u32, data: &[u8]) -> Result<(), ProtoError> {
        if data.is_empty() {
            return Ok(());
        }
        self.put_tag(field, WIRE_LEN)?;
        self.put_varint(data.len() as u64)?;
        if self.pos + data.len() > self.buf.len() {
            return Err(ProtoError::Overflow);
        }
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(())
    }

    /// Writes a string field; empty is omitted per proto3.
    pub fn put_str(&mut self, field: u32, s: &str) -> Result<(), ProtoError> {
        self.put_bytes(field, s.as_bytes())
    }

    /// Writes a bytes field whose content is produced in place.
    ///
    /// Reserves up to `cap` bytes, lets `fill` produce into the slab and
    /// commits the actual length. Returns the bytes produced; when the
    /// producer yields nothing the field is omitted entirely.
    pub fn put_bytes_with<F>(&mut self, field: u32, cap: usize, fill: F) -> Result<usize, ProtoError>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let tag_start = self.pos;
        self.put_tag(field, WIRE_LEN)?;

        let len_width = varint_len(cap as u64);
        let data_start = self.pos + len_width;
        if data_start + cap > self.buf.len() {
            self.pos = tag_start;
            return Err(ProtoError::Overflow);
        }

        let written = fill(&mut self.buf[data_start..data_start + cap]).min(cap);
        if written == 0 {
            self.pos = tag_start;
            return Ok(0);
        }

        let need = varint_len(written as u64);
        if need != len_width {
            self.buf.copy_within(data_start..data_start + written, self.pos + need);
        }
        encode_varint(&mut self.buf[self.pos..], written as u64);
        self.pos = self.pos + need + written;
        Ok(written)
    }
}

/// A decoded field value borrowing from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    /// Varint-encoded scalar.
    Varint(u64),
    /// Length-delimited payload.
    Bytes(&'a [u8]),
}

impl<'a> FieldValue<'a> {
    fn as_u64(self) -> Result<u64, ProtoError> {
        match self {
            FieldValue::Varint(v) => Ok(v),
            FieldValue::Bytes(_) => Err(ProtoError::Malformed),
        }
    }

    fn as_u32(self) -> Result<u32, ProtoError> {
        self.as_u64().map(|v| v as u32)
    }

    fn as_i32(self) -> Result<i32, ProtoError> {
        self.as_u64().map(|v| v as i64 as i32)
    }

    fn as_bool(self) -> Result<bool, ProtoError> {
        self.as_u64().map(|v| v != 0)
    }

    fn as_bytes(self) -> Result<&'a [u8], ProtoError> {
        match self {
            FieldValue::Bytes(b) => Ok(b),
            FieldValue::Varint(_) => Err(ProtoError::Malformed),
        }
    }

    fn as_str(self) -> Result<&'a str, ProtoError> {
        std::str::from_utf8(self.as_bytes()?).map_err(|_| ProtoError::InvalidUtf8)
    }
}

/// Borrowing field reader over a message body.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader over a message body.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_varint(&mut self) -> Result<u64, ProtoError> {
        let mut value = 0u64;
        for shift in 0..10 {
            let byte = *self.buf.get(self.pos).ok_or(ProtoError::Truncated)?;
            self.pos += 1;
            value |= u64::from(byte & 0x7F) << (shift * 7);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtoError::InvalidVarint)
    }

    /// Returns the next field, skipping fixed-width fields the service
    /// never defines.
    pub fn next_field(&mut self) -> Result<Option<(u32, FieldValue<'a>)>, ProtoError> {
        loop {
            if self.pos >= self.buf.len() {
                return Ok(None);
            }

            let tag = self.read_varint()?;
            let field = (tag >> 3) as u32;
            let wire_type = (tag & 0x7) as u32;

            match wire_type {
                WIRE_VARINT => return Ok(Some((field, FieldValue::Varint(self.read_varint()?)))),
                WIRE_LEN => {
                    let len = self.read_varint()? as usize;
                    if self.pos + len > self.buf.len() {
                        return Err(ProtoError::Truncated);
                    }
                    let bytes = &self.buf[self.pos..self.pos + len];
                    self.pos += len;
                    return Ok(Some((field, FieldValue::Bytes(bytes))));
                }
                WIRE_FIXED64 => {
                    if self.pos + 8 > self.buf.len() {
                        return Err(ProtoError::Truncated);
                    }
                    self.pos += 8;
                }
                WIRE_FIXED32 => {
                    if self.pos + 4 > self.buf.len() {
                        return Err(ProtoError::Truncated);
                    }
                    self.pos += 4;
                }
                other => return Err(ProtoError::InvalidWireType(other)),
            }
        }
    }
}

/// Request for any of the `get_random_bytes*` methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RandomBytesRequest {
    /// Bytes requested.
    pub len: u32,
}

impl RandomBytesRequest {
    /// Decodes the request from a message body.
    pub fn decode(body: &[u8]) -> Result<Self, ProtoError> {
        let mut msg = Self::default();
        let mut reader = Reader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            if field == 1 {
                msg.len = value.as_u32()?;
            }
        }
        Ok(msg)
    }

    /// Encodes the request.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), ProtoError> {
        w.put_uint(1, u64::from(self.len))
    }
}

/// Response to the `get_random_bytes*` methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RandomBytesResponse<'a> {
    /// 0 on success, negative error code otherwise.
    pub ret: i32,
    /// The generated bytes; may be shorter than requested.
    pub data: &'a [u8],
}

impl<'a> RandomBytesResponse<'a> {
    /// Decodes the response from a message body.
    pub fn decode(body: &'a [u8]) -> Result<Self, ProtoError> {
        let mut msg = Self::default();
        let mut reader = Reader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.ret = value.as_i32()?,
                2 => msg.data = value.as_bytes()?,
                _ => {}
            }
        }
        Ok(msg)
    }

    /// Encodes the response.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), ProtoError> {
        w.put_int(1, i64::from(self.ret))?;
        w.put_bytes(2, self.data)
    }
}

/// Request for `pool_insert_aux`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolInsertRequest<'a> {
    /// Data to fold into the aux pool.
    pub data: &'a [u8],
    /// Entropy credited for the data.
    pub entropy_bits: u32,
}

impl<'a> PoolInsertRequest<'a> {
    /// Decodes the request from a message body.
    pub fn decode(body: &'a [u8]) -> Result<Self, ProtoError> {
        let mut msg = Self::default();
        let mut reader = Reader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.data = value.as_bytes()?,
                2 => msg.entropy_bits = value.as_u32()?,
                _ => {}
            }
        }
        Ok(msg)
    }

    /// Encodes the request.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), ProtoError> {
        w.put_bytes(1, self.data)?;
        w.put_uint(2, u64::from(self.entropy_bits))
    }
}

/// Request carrying one unsigned 32-bit value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct U32Request {
    /// The value.
    pub value: u32,
}

impl U32Request {
    /// Decodes the request from a message body.
    pub fn decode(body: &[u8]) -> Result<Self, ProtoError> {
        let mut msg = Self::default();
        let mut reader = Reader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            if field == 1 {
                msg.value = value.as_u32()?;
            }
        }
        Ok(msg)
    }

    /// Encodes the request.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), ProtoError> {
        w.put_uint(1, u64::from(self.value))
    }
}

/// Response carrying one unsigned 32-bit value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct U32Response {
    /// 0 on success, negative error code otherwise.
    pub ret: i32,
    /// The value.
    pub value: u32,
}

impl U32Response {
    /// Decodes the response from a message body.
    pub fn decode(body: &[u8]) -> Result<Self, ProtoError> {
        let mut msg = Self::default();
        let mut reader = Reader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.ret = value.as_i32()?,
                2 => msg.value = value.as_u32()?,
                _ => {}
            }
        }
        Ok(msg)
    }

    /// Encodes the response.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), ProtoError> {
        w.put_int(1, i64::from(self.ret))?;
        w.put_uint(2, u64::from(self.value))
    }
}

/// Response carrying only a return code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntResponse {
    /// 0 on success, negative error code otherwise.
    pub ret: i32,
}

impl IntResponse {
    /// Decodes the response from a message body.
    pub fn decode(body: &[u8]) -> Result<Self, ProtoError> {
        let mut msg = Self::default();
        let mut reader = Reader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            if field == 1 {
                msg.ret = value.as_i32()?;
            }
        }
        Ok(msg)
    }

    /// Encodes the response.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), ProtoError> {
        w.put_int(1, i64::from(self.ret))
    }
}

/// Response carrying one boolean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoolResponse {
    /// 0 on success, negative error code otherwise.
    pub ret: i32,
    /// The value.
    pub value: bool,
}

impl BoolResponse {
    /// Decodes the response from a message body.
    pub fn decode(body: &[u8]) -> Result<Self, ProtoError> {
        let mut msg = Self::default();
        let mut reader = Reader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.ret = value.as_i32()?,
                2 => msg.value = value.as_bool()?,
                _ => {}
            }
        }
        Ok(msg)
    }

    /// Encodes the response.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), ProtoError> {
        w.put_int(1, i64::from(self.ret))?;
        w.put_bool(2, self.value)
    }
}

/// Response to the `version` method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionResponse<'a> {
    /// 0 on success, negative error code otherwise.
    pub ret: i32,
    /// Daemon version string.
    pub version: &'a str,
}

impl<'a> VersionResponse<'a> {
    /// Decodes the response from a message body.
    pub fn decode(body: &'a [u8]) -> Result<Self, ProtoError> {
        let mut msg = Self::default();
        let mut reader = Reader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.ret = value.as_i32()?,
                2 => msg.version = value.as_str()?,
                _ => {}
            }
        }
        Ok(msg)
    }

    /// Encodes the response.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), ProtoError> {
        w.put_int(1, i64::from(self.ret))?;
        w.put_str(2, self.version)
    }
}

/// Response to the `status` method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusResponse {
    /// 0 on success, negative error code otherwise.
    pub ret: i32,
    /// At least one DRNG has been fully seeded since startup.
    pub operational: bool,
    /// A DRNG currently holds a full seed.
    pub fully_seeded: bool,
    /// A DRNG has reached the minimum seed level.
    pub min_seeded: bool,
    /// SP800-90C mode is active.
    pub sp80090c: bool,
    /// Entropy available across sources and pool, in bits.
    pub avail_entropy_bits: u32,
    /// Entropy credited to the aux pool, in bits.
    pub avail_entropy_aux_bits: u32,
    /// Aux pool width in bits.
    pub poolsize_aux_bits: u32,
    /// Highest DRNG reseed generation.
    pub generation: u64,
    /// Write-wakeup threshold in bits.
    pub write_wakeup_bits: u32,
    /// Maximum reseed interval in seconds.
    pub reseed_max_secs: u32,
}

impl StatusResponse {
    /// Decodes the response from a message body.
    pub fn decode(body: &[u8]) -> Result<Self, ProtoError> {
        let mut msg = Self::default();
        let mut reader = Reader::new(body);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => msg.ret = value.as_i32()?,
                2 => msg.operational = value.as_bool()?,
                3 => msg.fully_seeded = value.as_bool()?,
                4 => msg.min_seeded = value.as_bool()?,
                5 => msg.sp80090c = value.as_bool()?,
                6 => msg.avail_entropy_bits = value.as_u32()?,
                7 => msg.avail_entropy_aux_bits = value.as_u32()?,
                8 => msg.poolsize_aux_bits = value.as_u32()?,
                9 => msg.generation = value.as_u64()?,
                10 => msg.write_wakeup_bits = value.as_u32()?,
                11 => msg.reseed_max_secs = value.as_u32()?,
                _ => {}
            }
        }
        Ok(msg)
    }

    /// Encodes the response.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), ProtoError> {
        w.put_int(1, i64::from(self.ret))?;
        w.put_bool(2, self.operational)?;
        w.put_bool(3, self.fully_seeded)?;
        w.put_bool(4, self.min_seeded)?;
        w.put_bool(5, self.sp80090c)?;
        w.put_uint(6, u64::from(self.avail_entropy_bits))?;
        w.put_uint(7, u64::from(self.avail_entropy_aux_bits))?;
        w.put_uint(8, u64::from(self.poolsize_aux_bits))?;
        w.put_uint(9, self.generation)?;
        w.put_uint(10, u64::from(self.write_wakeup_bits))?;
        w.put_uint(11, u64::from(self.reseed_max_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode_to_vec(encode: impl FnOnce(&mut Writer<'_>) -> Result<(), ProtoError>) -> Vec<u8> {
        let mut buf = [0u8; 4096];
        let mut w = Writer::new(&mut buf);
        encode(&mut w).expect("encode");
        let n = w.len();
        buf[..n].to_vec()
    }

    #[test]
    fn test_varint_boundaries() {
        for v in [0u64, 1, 127, 128, 16383, 16384, u64::from(u32::MAX), u64::MAX] {
            let mut buf = [0u8; 10];
            let len = encode_varint(&mut buf, v);
            assert_eq!(len, varint_len(v));

            let mut reader = Reader::new(&buf[..len]);
            assert_eq!(reader.read_varint().expect("varint"), v);
        }
    }

    #[test]
    fn test_random_bytes_request_roundtrip() {
        let msg = RandomBytesRequest { len: 32 };
        let wire = encode_to_vec(|w| msg.encode(w));
        assert_eq!(RandomBytesRequest::decode(&wire).expect("decode"), msg);
    }

    #[test]
    fn test_random_bytes_response_roundtrip() {
        let msg = RandomBytesResponse { ret: 0, data: &[1, 2, 3, 4] };
        let wire = encode_to_vec(|w| msg.encode(w));
        assert_eq!(RandomBytesResponse::decode(&wire).expect("decode"), msg);
    }

    #[test]
    fn test_negative_ret_roundtrip() {
        let msg = IntResponse { ret: -11 };
        let wire = encode_to_vec(|w| msg.encode(w));
        assert_eq!(IntResponse::decode(&wire).expect("decode"), msg);
    }

    #[test]
    fn test_pool_insert_roundtrip() {
        let msg = PoolInsertRequest { data: &[0u8; 64], entropy_bits: 256 };
        let wire = encode_to_vec(|w| msg.encode(w));
        assert_eq!(PoolInsertRequest::decode(&wire).expect("decode"), msg);
    }

    #[test]
    fn test_version_roundtrip() {
        let msg = VersionResponse { ret: 0, version: "1.2.3" };
        let wire = encode_to_vec(|w| msg.encode(w));
        assert_eq!(VersionResponse::decode(&wire).expect("decode"), msg);
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        w.put_uint(1, 32).expect("encode");
        w.put_uint(99, 7).expect("encode");
        w.put_bytes(98, b"ignored").expect("encode");
        let len = w.len();

        let msg = RandomBytesRequest::decode(&buf[..len]).expect("decode");
        assert_eq!(msg.len, 32);
    }

    #[test]
    fn test_truncated_message_rejected() {
        let msg = RandomBytesResponse { ret: 0, data: &[9u8; 16] };
        let wire = encode_to_vec(|w| msg.encode(w));

        assert_eq!(
            RandomBytesResponse::decode(&wire[..wire.len() - 1]),
            Err(ProtoError::Truncated)
        );
    }

    #[test]
    fn test_writer_overflow() {
        let mut buf = [0u8; 4];
        let mut w = Writer::new(&mut buf);
        assert_eq!(w.put_bytes(1, &[0u8; 16]), Err(ProtoError::Overflow));
    }

    #[test]
    fn test_put_bytes_with_fills_in_place() {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        let written = w
            .put_bytes_with(2, 16, |dest| {
                dest[..4].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
                4
            })
            .expect("encode");
        assert_eq!(written, 4);
        let len = w.len();

        let msg = RandomBytesResponse::decode(&buf[..len]).expect("decode");
        assert_eq!(msg.data, &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_put_bytes_with_empty_output_omits_field() {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        let written = w.put_bytes_with(2, 16, |_| 0).expect("encode");
        assert_eq!(written, 0);
        assert_eq!(w.len(), 0);
    }

    #[test]
    fn test_put_bytes_with_shrinking_length_prefix() {
        // Capacity needs a 2-byte length varint, the actual output only 1.
        let mut buf = [0u8; 600];
        let mut w = Writer::new(&mut buf);
        let written = w
            .put_bytes_with(2, 300, |dest| {
                dest[..10].iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
                10
            })
            .expect("encode");
        assert_eq!(written, 10);
        let len = w.len();

        let msg = RandomBytesResponse::decode(&buf[..len]).expect("decode");
        assert_eq!(msg.data.len(), 10);
        assert_eq!(msg.data[9], 9);
    }

    proptest! {
        #[test]
        fn prop_status_roundtrip(
            ret in -100i32..1,
            operational: bool,
            fully_seeded: bool,
            min_seeded: bool,
            sp80090c: bool,
            avail_entropy_bits: u32,
            avail_entropy_aux_bits: u32,
            poolsize_aux_bits: u32,
            generation: u64,
            write_wakeup_bits: u32,
            reseed_max_secs: u32,
        ) {
            let msg = StatusResponse {
                ret,
                operational,
                fully_seeded,
                min_seeded,
                sp80090c,
                avail_entropy_bits,
                avail_entropy_aux_bits,
                poolsize_aux_bits,
                generation,
                write_wakeup_bits,
                reseed_max_secs,
            };
            let wire = encode_to_vec(|w| msg.encode(w));
            prop_assert_eq!(StatusResponse::decode(&wire).expect("decode"), msg);
        }

        #[test]
        fn prop_random_bytes_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let msg = RandomBytesResponse { ret: 0, data: &data };
            let wire = encode_to_vec(|w| msg.encode(w));
            prop_assert_eq!(RandomBytesResponse::decode(&wire).expect("decode").data, &data[..]);
        }
    }
}
