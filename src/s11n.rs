//! s11n == serialization. Constants and header layout that make up FastCGI records.

use byteorder::{ByteOrder, NetworkEndian};
use bytes::BytesMut;

pub const FASTCGI_VERSION: u8 = 1;

/// Size of the fixed record header.
pub const HEADER_LEN: usize = 8;

/// Largest payload this implementation will render into a single record.
pub const MAX_PAYLOAD: usize = 0x8000;

/// Filler written into padding bytes. Not protocol-significant.
pub const PADDING_VALUE: u8 = 0x5a;

/// The request id reserved for management records.
pub const NULL_REQUEST_ID: u16 = 0;

/// Set in `BeginRequest.flags` when the peer wants the connection kept open.
pub const FCGI_KEEP_CONN: u8 = 1;

// Variables for the RecordType::GetValues and GetValuesResult records.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

enum_from_primitive! {
    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum RecordType {
        BeginRequest = 1,
        AbortRequest = 2,
        EndRequest = 3,
        Params = 4,
        Stdin = 5,
        Stdout = 6,
        Stderr = 7,
        Data = 8,
        GetValues = 9,
        GetValuesResult = 10,
        UnknownType = 11,
    }
}

impl RecordType {
    /// Management records travel on request id 0 and belong to no request.
    pub fn is_management(self) -> bool {
        matches!(self,
            RecordType::GetValues | RecordType::GetValuesResult | RecordType::UnknownType)
    }
}

enum_from_primitive! {
    #[repr(u16)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Role {
        Responder = 1,
        Authorizer = 2,
        Filter = 3,
    }
}

enum_from_primitive! {
    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ProtocolStatus {
        RequestComplete = 0,
        CantMultiplexConnections = 1,
        Overloaded = 2,
        UnknownRole = 3,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FastcgiRecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
    pub reserved: u8,
}

impl FastcgiRecordHeader {
    /// Reads a header from the first `HEADER_LEN` bytes of `buf`.
    pub fn parse(buf: &[u8]) -> FastcgiRecordHeader {
        assert!(buf.len() >= HEADER_LEN);
        FastcgiRecordHeader {
            version: buf[0],
            record_type: buf[1],
            request_id: NetworkEndian::read_u16(&buf[2..4]),
            content_length: NetworkEndian::read_u16(&buf[4..6]),
            padding_length: buf[6],
            reserved: buf[7],
        }
    }

    pub fn write(&self, buf: &mut BytesMut) {
        let mut raw = [0u8; HEADER_LEN];
        raw[0] = self.version;
        raw[1] = self.record_type;
        NetworkEndian::write_u16(&mut raw[2..4], self.request_id);
        NetworkEndian::write_u16(&mut raw[4..6], self.content_length);
        raw[6] = self.padding_length;
        raw[7] = self.reserved;
        buf.extend_from_slice(&raw);
    }

    /// Header, content and padding together.
    pub fn record_len(&self) -> usize {
        HEADER_LEN + self.content_length as usize + self.padding_length as usize
    }
}

/// Number of filler bytes that bring `content_len` up to a multiple of 8.
pub fn padding_len(content_len: usize) -> usize {
    (8 - content_len % 8) % 8
}
