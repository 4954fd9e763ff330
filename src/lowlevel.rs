use crate::error::{protocol_error, FastcgiError, Result};
use crate::s11n::*;

use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Buf, Bytes, BytesMut};
use enum_primitive::FromPrimitive;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Clone, Debug, PartialEq)]
pub struct FastcgiRecord {
    pub request_id: u16,
    pub body: FastcgiRecordBody,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FastcgiRecordBody {
    BeginRequest(BeginRequest),
    AbortRequest,
    EndRequest(EndRequest),
    Params(NameValues),
    Stdin(Bytes),
    Stdout(Bytes),
    Stderr(Bytes),
    Data(Bytes),
    GetValues(NameValues),
    GetValuesResult(NameValues),
    UnknownType(u8),
    /// A record whose type code this implementation does not know.
    Unrecognized { record_type: u8, content: Bytes },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequest {
    pub fn new(role: Role, keep_connection: bool) -> BeginRequest {
        BeginRequest {
            role: role as u16,
            flags: if keep_connection { FCGI_KEEP_CONN } else { 0 },
        }
    }

    /// `None` for role codes FastCGI does not define.
    pub fn role(&self) -> Option<Role> {
        Role::from_u16(self.role)
    }

    pub fn keep_connection(&self) -> bool {
        self.flags & FCGI_KEEP_CONN != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

/// Ordered name/value multimap, as carried by Params and GetValues(Result) records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NameValues {
    pairs: Vec<(Bytes, Bytes)>,
}

impl NameValues {
    pub fn new() -> NameValues {
        NameValues::default()
    }

    pub fn push<N: Into<Bytes>, V: Into<Bytes>>(&mut self, name: N, value: V) {
        self.pairs.push((name.into(), value.into()));
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &[u8]) -> Option<&Bytes> {
        self.pairs.iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &[u8]) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Bytes, Bytes)> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl<N: Into<Bytes>, V: Into<Bytes>> FromIterator<(N, V)> for NameValues {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> NameValues {
        NameValues {
            pairs: iter.into_iter().map(|(n, v)| (n.into(), v.into())).collect(),
        }
    }
}

impl FastcgiRecord {
    /// Appends the encoded record to `out`. See [`render_record`].
    pub fn render(&self, out: &mut BytesMut) -> Result<usize> {
        render_record(out, self.body.record_type(), self.request_id,
                      |buf| self.body.write_payload(buf))
    }
}

impl FastcgiRecordBody {
    pub fn record_type(&self) -> u8 {
        let record_type = match *self {
            FastcgiRecordBody::BeginRequest(_) => RecordType::BeginRequest,
            FastcgiRecordBody::AbortRequest => RecordType::AbortRequest,
            FastcgiRecordBody::EndRequest(_) => RecordType::EndRequest,
            FastcgiRecordBody::Params(_) => RecordType::Params,
            FastcgiRecordBody::Stdin(_) => RecordType::Stdin,
            FastcgiRecordBody::Stdout(_) => RecordType::Stdout,
            FastcgiRecordBody::Stderr(_) => RecordType::Stderr,
            FastcgiRecordBody::Data(_) => RecordType::Data,
            FastcgiRecordBody::GetValues(_) => RecordType::GetValues,
            FastcgiRecordBody::GetValuesResult(_) => RecordType::GetValuesResult,
            FastcgiRecordBody::UnknownType(_) => RecordType::UnknownType,
            FastcgiRecordBody::Unrecognized { record_type, .. } => return record_type,
        };
        record_type as u8
    }

    fn write_payload(&self, buf: &mut BytesMut) -> Result<()> {
        match *self {
            FastcgiRecordBody::BeginRequest(ref begin) => {
                let mut raw = [0u8; 8];
                NetworkEndian::write_u16(&mut raw[0..2], begin.role);
                raw[2] = begin.flags;
                buf.extend_from_slice(&raw);
            },
            FastcgiRecordBody::AbortRequest => (),
            FastcgiRecordBody::EndRequest(ref end) => {
                let mut raw = [0u8; 8];
                NetworkEndian::write_u32(&mut raw[0..4], end.app_status);
                raw[4] = end.protocol_status as u8;
                buf.extend_from_slice(&raw);
            },
            FastcgiRecordBody::Params(ref pairs)
                | FastcgiRecordBody::GetValues(ref pairs)
                | FastcgiRecordBody::GetValuesResult(ref pairs) => {
                write_name_values(buf, pairs)?;
            },
            FastcgiRecordBody::Stdin(ref content)
                | FastcgiRecordBody::Stdout(ref content)
                | FastcgiRecordBody::Stderr(ref content)
                | FastcgiRecordBody::Data(ref content)
                | FastcgiRecordBody::Unrecognized { ref content, .. } => {
                buf.extend_from_slice(content);
            },
            FastcgiRecordBody::UnknownType(record_type) => {
                buf.extend_from_slice(&[record_type, 0, 0, 0, 0, 0, 0, 0]);
            },
        }
        Ok(())
    }
}

/// Reads one FastCGI name/value length: one byte below 0x80, otherwise four
/// bytes big-endian with the high bit as long-form marker.
fn read_len(buf: &mut Bytes) -> Result<usize> {
    let first_byte = match buf.first() {
        Some(b) => *b,
        None => return Err(protocol_error("truncated name-value length")),
    };
    if first_byte & 0x80 == 0 {
        buf.advance(1);
        Ok(first_byte as usize)
    } else {
        if buf.len() < 4 {
            return Err(protocol_error("truncated long-form name-value length"));
        }
        let len = NetworkEndian::read_u32(&buf[..4]) & 0x7fff_ffff;
        buf.advance(4);
        Ok(len as usize)
    }
}

fn write_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    if len < 0x80 {
        buf.extend_from_slice(&[len as u8]);
    } else if len <= 0x7fff_ffff {
        let mut bytes = [0u8; 4];
        NetworkEndian::write_u32(&mut bytes, len as u32 | 0x8000_0000);
        buf.extend_from_slice(&bytes);
    } else {
        return Err(FastcgiError::PayloadTooLarge(len));
    }
    Ok(())
}

pub(crate) fn read_name_values(mut buf: Bytes) -> Result<NameValues> {
    let mut pairs = NameValues::new();
    while !buf.is_empty() {
        let name_len = read_len(&mut buf)?;
        let value_len = read_len(&mut buf)?;
        if buf.len() < name_len + value_len {
            let msg = format!("name-value pair of {}+{} bytes overruns its record ({} left)",
                              name_len, value_len, buf.len());
            return Err(protocol_error(msg));
        }
        let name = buf.split_to(name_len);
        let value = buf.split_to(value_len);
        trace!("param ({}, {})",
               String::from_utf8_lossy(&name),
               String::from_utf8_lossy(&value));
        pairs.push(name, value);
    }
    Ok(pairs)
}

pub(crate) fn write_name_values(buf: &mut BytesMut, pairs: &NameValues) -> Result<()> {
    for (name, value) in pairs.iter() {
        write_len(buf, name.len())?;
        write_len(buf, value.len())?;
        buf.extend_from_slice(name);
        buf.extend_from_slice(value);
    }
    Ok(())
}

/// Renders one complete record into `out` and returns the number of bytes written.
///
/// The header is written with zero content and padding lengths, `render`
/// produces the payload, and the two length fields are patched in once the
/// payload size is known. If `render` fails or the payload exceeds
/// `MAX_PAYLOAD`, `out` is truncated back to where the record started.
pub fn render_record<F>(out: &mut BytesMut, record_type: u8, request_id: u16, render: F)
    -> Result<usize>
    where F: FnOnce(&mut BytesMut) -> Result<()>
{
    let start = out.len();
    let header = FastcgiRecordHeader {
        version: FASTCGI_VERSION,
        record_type,
        request_id,
        content_length: 0,
        padding_length: 0,
        reserved: 0,
    };
    header.write(out);

    let payload_start = out.len();
    if let Err(e) = render(out) {
        out.truncate(start);
        return Err(e);
    }

    let content_length = out.len() - payload_start;
    if content_length > MAX_PAYLOAD {
        error!("payload too large: {} bytes in record type {}, discarding record",
               content_length, record_type);
        out.truncate(start);
        return Err(FastcgiError::PayloadTooLarge(content_length));
    }

    let padding_length = padding_len(content_length);
    out.extend_from_slice(&[PADDING_VALUE; 8][..padding_length]);

    NetworkEndian::write_u16(&mut out[start + 4..start + 6], content_length as u16);
    out[start + 6] = padding_length as u8;

    trace!("rendered record type {} id {}: {} content + {} padding bytes",
           record_type, request_id, content_length, padding_length);
    Ok(out.len() - start)
}

fn read_begin_request_body(content: &Bytes) -> Result<BeginRequest> {
    if content.len() < 8 {
        let msg = format!("BeginRequest body is {} bytes, expected 8", content.len());
        return Err(protocol_error(msg));
    }
    Ok(BeginRequest {
        role: NetworkEndian::read_u16(&content[0..2]),
        flags: content[2],
    })
}

fn read_end_request_body(content: &Bytes) -> Option<EndRequest> {
    if content.len() < 8 {
        return None;
    }
    Some(EndRequest {
        app_status: NetworkEndian::read_u32(&content[0..4]),
        protocol_status: ProtocolStatus::from_u8(content[4])?,
    })
}

fn check_request_id(record_type: RecordType, request_id: u16) -> Result<()> {
    if record_type.is_management() {
        if request_id != NULL_REQUEST_ID {
            let msg = format!("request id {} with management record {:?}",
                              request_id, record_type);
            return Err(protocol_error(msg));
        }
    } else if request_id == NULL_REQUEST_ID {
        return Err(protocol_error(format!("request id zero with record {:?}", record_type)));
    }
    Ok(())
}

fn unrecognized(record_type: u8, content: Bytes) -> FastcgiRecordBody {
    debug!("malformed record type {} with {} bytes of content", record_type, content.len());
    FastcgiRecordBody::Unrecognized { record_type, content }
}

/// Record-level codec: one `FastcgiRecord` per frame, in both directions.
#[derive(Debug, Default)]
pub struct FastcgiLowlevelCodec;

impl Decoder for FastcgiLowlevelCodec {
    type Item = FastcgiRecord;
    type Error = FastcgiError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<FastcgiRecord>> {
        if buf.len() < HEADER_LEN {
            trace!("insufficient buffer for header: {} bytes", buf.len());
            return Ok(None);
        }

        let header = FastcgiRecordHeader::parse(&buf[..HEADER_LEN]);

        if header.version != FASTCGI_VERSION {
            return Err(protocol_error(format!("unexpected FCGI version {}", header.version)));
        }

        let record_type = RecordType::from_u8(header.record_type);
        if let Some(record_type) = record_type {
            check_request_id(record_type, header.request_id)?;
        }

        let record_len = header.record_len();
        if buf.len() < record_len {
            trace!("insufficient buffer for record: have {}, need {}", buf.len(), record_len);
            buf.reserve(record_len - buf.len());
            return Ok(None);
        }

        // Consume from the buffer now.
        buf.advance(HEADER_LEN);
        let content = buf.split_to(header.content_length as usize).freeze();
        buf.advance(header.padding_length as usize);

        let request_id = header.request_id;
        trace!("request id: {}; record type: {:?}, {} bytes of content",
               request_id, record_type, content.len());

        let record_type = match record_type {
            Some(record_type) => record_type,
            None => {
                debug!("unrecognized record type {}", header.record_type);
                return Ok(Some(FastcgiRecord {
                    request_id,
                    body: FastcgiRecordBody::Unrecognized {
                        record_type: header.record_type,
                        content,
                    },
                }));
            },
        };

        let body = match record_type {
            RecordType::BeginRequest => {
                FastcgiRecordBody::BeginRequest(read_begin_request_body(&content)?)
            },
            RecordType::AbortRequest => {
                if !content.is_empty() {
                    warn!("ignoring {} bytes of AbortRequest content", content.len());
                }
                FastcgiRecordBody::AbortRequest
            },
            RecordType::Params => FastcgiRecordBody::Params(read_name_values(content)?),
            RecordType::Stdin => FastcgiRecordBody::Stdin(content),
            RecordType::Stdout => FastcgiRecordBody::Stdout(content),
            RecordType::Stderr => FastcgiRecordBody::Stderr(content),
            RecordType::Data => FastcgiRecordBody::Data(content),
            RecordType::GetValues => FastcgiRecordBody::GetValues(read_name_values(content)?),
            // Only an application sends these; malformed ones decode as unrecognized.
            RecordType::EndRequest => match read_end_request_body(&content) {
                Some(end) => FastcgiRecordBody::EndRequest(end),
                None => unrecognized(header.record_type, content),
            },
            RecordType::GetValuesResult => match read_name_values(content.clone()) {
                Ok(values) => FastcgiRecordBody::GetValuesResult(values),
                Err(_) => unrecognized(header.record_type, content),
            },
            RecordType::UnknownType => match content.first().copied() {
                Some(t) => FastcgiRecordBody::UnknownType(t),
                None => unrecognized(header.record_type, content),
            },
        };

        Ok(Some(FastcgiRecord { request_id, body }))
    }
}

impl Encoder<FastcgiRecord> for FastcgiLowlevelCodec {
    type Error = FastcgiError;

    fn encode(&mut self, record: FastcgiRecord, buf: &mut BytesMut) -> Result<()> {
        record.render(buf).map(|_| ())
    }
}
