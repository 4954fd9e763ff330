#![allow(dead_code)]

use tokio_fastcgi_mux::*;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static LOGGER: Once = Once::new();

pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Web-server side of a FastCGI connection.
pub struct Client<S> {
    reader: FramedRead<ReadHalf<S>, FastcgiLowlevelCodec>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite> Client<S> {
    pub fn new(stream: S) -> Client<S> {
        let (reader, writer) = split(stream);
        Client {
            reader: FramedRead::new(reader, FastcgiLowlevelCodec),
            writer,
        }
    }

    pub async fn send(&mut self, request_id: u16, body: FastcgiRecordBody) {
        let mut buf = BytesMut::new();
        FastcgiRecord { request_id, body }.render(&mut buf).unwrap();
        self.send_raw(&buf).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn begin(&mut self, request_id: u16, keep_conn: bool) {
        let begin = BeginRequest::new(Role::Responder, keep_conn);
        self.send(request_id, FastcgiRecordBody::BeginRequest(begin)).await;
    }

    pub async fn params(&mut self, request_id: u16, pairs: &[(&'static str, &'static str)]) {
        let pairs: NameValues = pairs.iter().cloned().collect();
        self.send(request_id, FastcgiRecordBody::Params(pairs)).await;
    }

    pub async fn stdin(&mut self, request_id: u16, content: &'static [u8]) {
        self.send(request_id, FastcgiRecordBody::Stdin(Bytes::from_static(content))).await;
    }

    /// Closes the write direction so the server sees EOF.
    pub async fn close(&mut self) {
        self.writer.shutdown().await.unwrap();
    }

    pub async fn recv(&mut self) -> FastcgiRecord {
        timeout(Duration::from_secs(5), self.reader.next()).await
            .expect("timed out waiting for a record")
            .expect("connection closed")
            .expect("undecodable record")
    }

    /// True if nothing arrives from the server within `wait`.
    pub async fn quiet(&mut self, wait: Duration) -> bool {
        timeout(wait, self.reader.next()).await.is_err()
    }

    /// True once the server has closed its side.
    pub async fn closed(&mut self) -> bool {
        timeout(Duration::from_secs(5), self.reader.next()).await
            .expect("timed out waiting for close")
            .is_none()
    }

    /// Collects Stdout up to and including the request's EndRequest.
    pub async fn response(&mut self, request_id: u16) -> (Vec<u8>, EndRequest) {
        let mut stdout = Vec::new();
        loop {
            let record = self.recv().await;
            assert_eq!(request_id, record.request_id, "unexpected {:?}", record);
            match record.body {
                FastcgiRecordBody::Stdout(content) => stdout.extend_from_slice(&content),
                FastcgiRecordBody::EndRequest(end) => return (stdout, end),
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}

pub fn end_request(protocol_status: ProtocolStatus, app_status: u32) -> FastcgiRecordBody {
    FastcgiRecordBody::EndRequest(EndRequest { app_status, protocol_status })
}

/// Shared, ordered log of what the hooks saw.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push<S: Into<String>>(&self, event: S) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}
