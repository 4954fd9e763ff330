use crate::error::{ignore_completed, protocol_error, FastcgiError, Result};
use crate::hi::handler::FastcgiHooks;
use crate::hi::request::{FastcgiRequest, Phase};
use crate::hi::response::{AddMode, HeaderAdded};
use crate::hi::server::FastcgiConfig;
use crate::lowlevel::*;
use crate::s11n::*;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

/// Wakes a connection's task out of whatever it is waiting on.
///
/// An interrupt that arrives while the task is busy is remembered and
/// delivered at its next suspension point.
#[derive(Clone, Debug, Default)]
pub struct Interrupter(Arc<Notify>);

impl Interrupter {
    pub fn new() -> Interrupter {
        Interrupter::default()
    }

    pub fn interrupt(&self) {
        self.0.notify_one();
    }

    pub(crate) async fn interrupted(&self) {
        self.0.notified().await
    }
}

/// Writes out and clears the output buffer.
pub(crate) async fn flush_output<W>(io: &mut W, out: &mut BytesMut, interrupter: &Interrupter)
    -> Result<()>
    where W: AsyncWrite + Unpin + ?Sized
{
    if out.is_empty() {
        return Ok(());
    }
    trace!("flushing {} bytes", out.len());
    tokio::select! {
        res = async {
            io.write_all(&out[..]).await?;
            io.flush().await
        } => res?,
        _ = interrupter.interrupted() => return Err(FastcgiError::Interrupted),
    }
    out.clear();
    Ok(())
}

fn render_end_request(out: &mut BytesMut, request_id: u16, protocol_status: ProtocolStatus,
                      app_status: u32) -> Result<usize>
{
    FastcgiRecord {
        request_id,
        body: FastcgiRecordBody::EndRequest(EndRequest { app_status, protocol_status }),
    }.render(out)
}

fn render_stream(out: &mut BytesMut, record_type: RecordType, request_id: u16, content: &[u8])
    -> Result<usize>
{
    let mut written = 0;
    for chunk in content.chunks(MAX_PAYLOAD) {
        written += render_record(out, record_type as u8, request_id, |buf| {
            buf.extend_from_slice(chunk);
            Ok(())
        })?;
    }
    Ok(written)
}

/// A request together with the output path of the connection carrying it.
///
/// Hooks get one of these for the duration of a single call. Output is
/// rendered into the connection's shared buffer and reaches the peer on
/// `flush_out`, `finalize`, or the next flush made for any request on the
/// same connection.
pub struct RequestContext<'c> {
    request: &'c mut FastcgiRequest,
    out: &'c mut BytesMut,
    io: &'c mut (dyn AsyncWrite + Send + Unpin),
    interrupter: &'c Interrupter,
}

impl<'c> RequestContext<'c> {
    pub(crate) fn new(request: &'c mut FastcgiRequest,
                      out: &'c mut BytesMut,
                      io: &'c mut (dyn AsyncWrite + Send + Unpin),
                      interrupter: &'c Interrupter) -> RequestContext<'c>
    {
        RequestContext { request, out, io, interrupter }
    }

    pub fn request(&self) -> &FastcgiRequest {
        &*self.request
    }

    pub fn request_mut(&mut self) -> &mut FastcgiRequest {
        &mut *self.request
    }

    pub fn id(&self) -> u16 {
        self.request.id()
    }

    fn check_open(&self) -> Result<()> {
        if self.request.is_complete() {
            return Err(FastcgiError::RequestCompleted);
        }
        Ok(())
    }

    pub fn add_header<N, V>(&mut self, mode: AddMode, name: N, value: Option<V>)
        -> Result<HeaderAdded>
        where N: Into<String>, V: Into<String>
    {
        self.request.add_header(mode, name, value)
    }

    pub fn add_header_time<N: Into<String>>(&mut self, mode: AddMode, name: N, time: SystemTime)
        -> Result<HeaderAdded>
    {
        self.request.add_header_time(mode, name, time)
    }

    pub fn set_status(&mut self, code: u16, text: &str) -> Result<()> {
        self.request.set_status(code, text)
    }

    /// Renders the header table and the blank line that ends it as Stdout records.
    pub fn headers_end(&mut self) -> Result<()> {
        self.check_open()?;
        let phase = self.request.phase();
        if phase > Phase::HeadersAllowed {
            return Err(FastcgiError::RequestState(phase));
        }
        let id = self.request.id();
        for block in self.request.headers().render_blocks() {
            render_stream(&mut *self.out, RecordType::Stdout, id, &block)?;
        }
        self.request.advance_phase(Phase::HeadersEnd);
        self.request.advance_phase(Phase::BodyAllowed);
        debug!("request {}: headers sent", id);
        Ok(())
    }

    /// Renders one Stdout record whose payload `render` writes.
    pub fn render_stdout<F>(&mut self, render: F) -> Result<usize>
        where F: FnOnce(&mut BytesMut) -> Result<()>
    {
        self.check_open()?;
        render_record(&mut *self.out, RecordType::Stdout as u8, self.request.id(), render)
    }

    pub fn render_stderr<F>(&mut self, render: F) -> Result<usize>
        where F: FnOnce(&mut BytesMut) -> Result<()>
    {
        self.check_open()?;
        self.request.stderr_used = true;
        render_record(&mut *self.out, RecordType::Stderr as u8, self.request.id(), render)
    }

    /// Writes `content` as Stdout, split over as many records as needed.
    /// Empty content writes nothing; the end of the stream is sent by `finalize`.
    pub fn write_stdout(&mut self, content: &[u8]) -> Result<usize> {
        self.check_open()?;
        render_stream(&mut *self.out, RecordType::Stdout, self.request.id(), content)
    }

    pub fn write_stderr(&mut self, content: &[u8]) -> Result<usize> {
        self.check_open()?;
        if !content.is_empty() {
            self.request.stderr_used = true;
        }
        render_stream(&mut *self.out, RecordType::Stderr, self.request.id(), content)
    }

    /// Queues Stdout content that `finalize` writes before ending the request.
    pub fn queue_stdout<B: Into<Bytes>>(&mut self, content: B) -> Result<()> {
        self.check_open()?;
        self.request.stdout.push_back(content.into());
        Ok(())
    }

    pub async fn flush_out(&mut self) -> Result<()> {
        self.check_open()?;
        flush_output(&mut *self.io, &mut *self.out, self.interrupter).await
    }

    /// Ends the request: queued Stdout, the empty Stdout (and Stderr, if used)
    /// closing the streams, then EndRequest(REQUEST_COMPLETE). A second call
    /// returns `RequestCompleted` and sends nothing.
    pub async fn finalize(&mut self) -> Result<()> {
        if self.request.is_complete() {
            self.request.stdout.clear();
            return Err(FastcgiError::RequestCompleted);
        }
        let id = self.request.id();
        while let Some(content) = self.request.stdout.pop_front() {
            render_stream(&mut *self.out, RecordType::Stdout, id, &content)?;
        }
        render_record(&mut *self.out, RecordType::Stdout as u8, id, |_| Ok(()))?;
        if self.request.stderr_used {
            render_record(&mut *self.out, RecordType::Stderr as u8, id, |_| Ok(()))?;
        }
        render_end_request(&mut *self.out, id, ProtocolStatus::RequestComplete, 0)?;
        self.request.complete = true;
        debug!("request {}: finalized", id);
        flush_output(&mut *self.io, &mut *self.out, self.interrupter).await
    }

    /// Ends the request at once with `app_status`, discarding queued Stdout.
    pub(crate) async fn abort(&mut self, app_status: u32) -> Result<()> {
        if self.request.is_complete() {
            return Err(FastcgiError::RequestCompleted);
        }
        let id = self.request.id();
        self.request.stdout.clear();
        render_end_request(&mut *self.out, id, ProtocolStatus::RequestComplete, app_status)?;
        self.request.complete = true;
        debug!("request {}: aborted with app status {}", id, app_status);
        flush_output(&mut *self.io, &mut *self.out, self.interrupter).await
    }

    /// Turns a hook result into the request's fate: non-fatal errors abort
    /// the request with the error's code, fatal ones are returned.
    async fn settle(&mut self, res: Result<()>) -> Result<()> {
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("request {}: {}; aborting with app status {}", self.id(), e, e.code());
                ignore_completed(self.abort(e.code()).await)
            },
        }
    }

    /// Interrupts the task serving this request's connection.
    pub fn send_interrupt(&self) {
        self.interrupter.interrupt();
    }

    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }
}

enum StreamRecord {
    Params(NameValues),
    Stdin(Bytes),
    Data(Bytes),
}

/// Runs the FastCGI protocol on one transport until it closes.
pub struct Connection<T, H> {
    io: T,
    input: BytesMut,
    output: BytesMut,
    codec: FastcgiLowlevelCodec,
    requests: BTreeMap<u16, FastcgiRequest>,
    config: Arc<FastcgiConfig<H>>,
    interrupter: Interrupter,
    shutdown: CancellationToken,
    close_requested: bool,
}

impl<T, H> Connection<T, H>
    where T: AsyncRead + AsyncWrite + Send + Unpin,
          H: FastcgiHooks,
{
    pub fn new(io: T, config: Arc<FastcgiConfig<H>>) -> Connection<T, H> {
        Connection::with_shutdown(io, config, CancellationToken::new())
    }

    /// Like `new`, but stops reading once `shutdown` is cancelled.
    pub fn with_shutdown(io: T, config: Arc<FastcgiConfig<H>>, shutdown: CancellationToken)
        -> Connection<T, H>
    {
        Connection {
            io,
            input: BytesMut::with_capacity(HEADER_LEN + MAX_PAYLOAD),
            output: BytesMut::with_capacity(HEADER_LEN + MAX_PAYLOAD),
            codec: FastcgiLowlevelCodec,
            requests: BTreeMap::new(),
            config,
            interrupter: Interrupter::new(),
            shutdown,
            close_requested: false,
        }
    }

    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    /// Serves records until the peer closes the connection, shutdown is
    /// requested, or an unrecoverable error occurs. Live requests are
    /// released before this returns.
    pub async fn run(mut self) -> Result<()> {
        let res = self.serve().await;
        match res {
            Ok(()) => {
                if self.close_requested {
                    if let Err(e) = self.io.shutdown().await {
                        debug!("shutdown after last request failed: {}", e);
                    }
                }
            },
            Err(ref e) => {
                warn!("connection failed: {}", e);
                self.recover();
            },
        }
        self.teardown();
        res
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let record = match self.read_record().await? {
                Some(record) => record,
                None => return Ok(()),
            };
            self.dispatch(record).await?;
            if self.close_requested && self.requests.is_empty() {
                debug!("last request done without FCGI_KEEP_CONN, closing");
                return Ok(());
            }
        }
    }

    async fn read_record(&mut self) -> Result<Option<FastcgiRecord>> {
        loop {
            if let Some(record) = self.codec.decode(&mut self.input)? {
                return Ok(Some(record));
            }
            let nread = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("shutdown requested");
                    return Ok(None);
                },
                _ = self.interrupter.interrupted() => return Err(FastcgiError::Interrupted),
                res = self.io.read_buf(&mut self.input) => res?,
            };
            if nread == 0 {
                if self.input.is_empty() {
                    debug!("peer closed connection");
                    return Ok(None);
                }
                let msg = format!("connection closed inside a record ({} bytes buffered)",
                                  self.input.len());
                return Err(protocol_error(msg));
            }
        }
    }

    async fn dispatch(&mut self, record: FastcgiRecord) -> Result<()> {
        let request_id = record.request_id;
        match record.body {
            FastcgiRecordBody::BeginRequest(begin) => {
                self.on_begin_request(request_id, begin).await
            },
            FastcgiRecordBody::AbortRequest => self.on_abort_request(request_id).await,
            FastcgiRecordBody::Params(pairs) => {
                self.on_stream(request_id, StreamRecord::Params(pairs)).await
            },
            FastcgiRecordBody::Stdin(content) => {
                self.on_stream(request_id, StreamRecord::Stdin(content)).await
            },
            FastcgiRecordBody::Data(content) => {
                self.on_stream(request_id, StreamRecord::Data(content)).await
            },
            FastcgiRecordBody::GetValues(names) => self.on_get_values(names).await,
            other => {
                warn!("unexpected record type {} for request {}", other.record_type(), request_id);
                self.on_unknown(other.record_type()).await
            },
        }
    }

    async fn flush(&mut self) -> Result<()> {
        flush_output(&mut self.io, &mut self.output, &self.interrupter).await
    }

    async fn send_end_request(&mut self, request_id: u16, protocol_status: ProtocolStatus)
        -> Result<()>
    {
        render_end_request(&mut self.output, request_id, protocol_status, 0)?;
        self.flush().await
    }

    async fn on_begin_request(&mut self, request_id: u16, begin: BeginRequest) -> Result<()> {
        if begin.role() != Some(Role::Responder) {
            warn!("request {}: unsupported role {}", request_id, begin.role);
            return self.send_end_request(request_id, ProtocolStatus::UnknownRole).await;
        }
        if self.requests.contains_key(&request_id) {
            warn!("request {}: duplicate BeginRequest", request_id);
            return self.send_end_request(request_id, ProtocolStatus::RequestComplete).await;
        }
        let max_reqs = self.config.max_reqs();
        if max_reqs > 0 && self.requests.len() >= max_reqs {
            warn!("request {}: {} requests already live, rejecting", request_id, max_reqs);
            return self.send_end_request(request_id, ProtocolStatus::Overloaded).await;
        }

        debug!("request {}: begin (keep_conn={})", request_id, begin.keep_connection());
        let config = self.config.clone();
        let mut request = FastcgiRequest::new(request_id, begin);
        let res = {
            let mut ctx = RequestContext::new(
                &mut request, &mut self.output, &mut self.io, &self.interrupter);
            let res = config.hooks().begin_request(&mut ctx, &begin).await;
            ctx.settle(res).await
        };

        if res.is_err() || request.is_complete() {
            self.release(request);
        } else {
            self.requests.insert(request_id, request);
        }
        res
    }

    async fn on_abort_request(&mut self, request_id: u16) -> Result<()> {
        let request = match self.requests.get_mut(&request_id) {
            Some(request) => request,
            None => {
                warn!("AbortRequest for unknown request {}", request_id);
                return self.send_end_request(request_id, ProtocolStatus::RequestComplete).await;
            },
        };
        debug!("request {}: aborted by peer", request_id);
        let mut ctx = RequestContext::new(
            request, &mut self.output, &mut self.io, &self.interrupter);
        ignore_completed(ctx.abort(0).await)?;
        self.remove(request_id);
        Ok(())
    }

    async fn on_stream(&mut self, request_id: u16, record: StreamRecord) -> Result<()> {
        let config = self.config.clone();
        let request = match self.requests.get_mut(&request_id) {
            Some(request) => request,
            None => {
                warn!("stream record for unknown request {}", request_id);
                return self.send_end_request(request_id, ProtocolStatus::RequestComplete).await;
            },
        };
        let mut ctx = RequestContext::new(
            request, &mut self.output, &mut self.io, &self.interrupter);
        let hooks = config.hooks();
        let res = match record {
            StreamRecord::Params(pairs) => {
                trace!("request {}: {} params", request_id, pairs.len());
                ctx.request.params.push_back(pairs.clone());
                hooks.params(&mut ctx, &pairs).await
            },
            StreamRecord::Stdin(content) => {
                trace!("request {}: {} bytes of stdin", request_id, content.len());
                ctx.request.stdin.push_back(content.clone());
                hooks.stdin(&mut ctx, &content).await
            },
            StreamRecord::Data(content) => {
                trace!("request {}: {} bytes of data", request_id, content.len());
                ctx.request.data.push_back(content.clone());
                hooks.data(&mut ctx, &content).await
            },
        };
        let res = ctx.settle(res).await;
        let complete = ctx.request.is_complete();
        if complete {
            self.remove(request_id);
        }
        res
    }

    async fn on_get_values(&mut self, names: NameValues) -> Result<()> {
        let mut values = NameValues::new();
        for (name, _) in names.iter() {
            if values.contains(name) {
                continue;
            }
            let value = if name == FCGI_MAX_CONNS.as_bytes() {
                self.config.max_conns().to_string()
            } else if name == FCGI_MAX_REQS.as_bytes() {
                self.config.max_reqs().to_string()
            } else if name == FCGI_MPXS_CONNS.as_bytes() {
                "1".to_owned()
            } else {
                debug!("GetValues: ignoring {:?}", String::from_utf8_lossy(name));
                continue;
            };
            values.push(name.clone(), value);
        }
        FastcgiRecord {
            request_id: NULL_REQUEST_ID,
            body: FastcgiRecordBody::GetValuesResult(values),
        }.render(&mut self.output)?;
        self.flush().await
    }

    async fn on_unknown(&mut self, record_type: u8) -> Result<()> {
        FastcgiRecord {
            request_id: NULL_REQUEST_ID,
            body: FastcgiRecordBody::UnknownType(record_type),
        }.render(&mut self.output)?;
        self.flush().await
    }

    fn remove(&mut self, request_id: u16) {
        if let Some(request) = self.requests.remove(&request_id) {
            self.release(request);
        }
    }

    fn release(&mut self, mut request: FastcgiRequest) {
        trace!("request {}: released", request.id());
        if !request.keep_connection() {
            self.close_requested = true;
        }
        self.config.hooks().end_request(&mut request);
    }

    /// Drops whatever was buffered and marks every live request complete.
    fn recover(&mut self) {
        self.input.clear();
        self.output.clear();
        for request in self.requests.values_mut() {
            request.complete = true;
        }
    }

    fn teardown(&mut self) {
        let requests = std::mem::take(&mut self.requests);
        if !requests.is_empty() {
            debug!("releasing {} live requests", requests.len());
        }
        for (_, mut request) in requests {
            request.complete = true;
            self.config.hooks().end_request(&mut request);
        }
    }
}
