#[macro_use] extern crate enum_primitive;
#[macro_use] extern crate log;

mod error;
mod hi;
mod lowlevel;
mod s11n;

pub use error::{FastcgiError, Result};
pub use hi::connection::{Connection, Interrupter, RequestContext};
pub use hi::handler::{error_response, redirect, FastcgiHooks, FastcgiRequestHandler, Lifecycle};
pub use hi::info::{Method, RequestInfo, Scheme};
pub use hi::request::{FastcgiRequest, Phase};
pub use hi::response::{AddMode, HeaderAdded, HeaderTable};
pub use hi::server::{serve_connection, FastcgiConfig, FastcgiServer, Stats,
                     DEFAULT_HOST, DEFAULT_MAX_CONNS, DEFAULT_MAX_REQS, DEFAULT_PORT};
pub use lowlevel::{render_record, FastcgiLowlevelCodec, FastcgiRecord, FastcgiRecordBody,
                   BeginRequest, EndRequest, NameValues};
pub use s11n::{padding_len, FastcgiRecordHeader, RecordType, Role, ProtocolStatus,
               FASTCGI_VERSION, FCGI_KEEP_CONN, FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS,
               HEADER_LEN, MAX_PAYLOAD, NULL_REQUEST_ID, PADDING_VALUE};
