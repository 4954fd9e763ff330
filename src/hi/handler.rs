use crate::error::{FastcgiError, Result};
use crate::hi::connection::RequestContext;
use crate::hi::request::{FastcgiRequest, Phase};
use crate::hi::response::AddMode;
use crate::lowlevel::{BeginRequest, NameValues};

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::FutureExt;

/// Low-level hook surface driven by the connection for every record.
///
/// The parse hooks receive each record as it arrives. Returning a non-fatal
/// error aborts the request with `FastcgiError::code()` as its app status and
/// leaves the connection healthy. `end_request` runs once when the request
/// leaves the connection, however it ended.
pub trait FastcgiHooks: Send + Sync + 'static {
    fn begin_request<'a>(&'a self, _ctx: &'a mut RequestContext<'_>, _begin: &'a BeginRequest)
        -> BoxFuture<'a, Result<()>>
    {
        future::ok(()).boxed()
    }

    /// An empty `pairs` marks the end of the params stream.
    fn params<'a>(&'a self, _ctx: &'a mut RequestContext<'_>, _pairs: &'a NameValues)
        -> BoxFuture<'a, Result<()>>
    {
        future::ok(()).boxed()
    }

    /// Empty `content` marks the end of stdin.
    fn stdin<'a>(&'a self, _ctx: &'a mut RequestContext<'_>, _content: &'a Bytes)
        -> BoxFuture<'a, Result<()>>
    {
        future::ok(()).boxed()
    }

    fn data<'a>(&'a self, _ctx: &'a mut RequestContext<'_>, _content: &'a Bytes)
        -> BoxFuture<'a, Result<()>>
    {
        future::ok(()).boxed()
    }

    fn end_request(&self, _request: &mut FastcgiRequest) {}
}

/// Request-level callbacks, run by [`Lifecycle`] at the matching protocol phase.
pub trait FastcgiRequestHandler: Send + Sync + 'static {
    fn begin_request<'a>(&'a self, _ctx: &'a mut RequestContext<'_>)
        -> BoxFuture<'a, Result<()>>
    {
        future::ok(()).boxed()
    }

    /// All params have arrived and `ctx.request().info()` is filled in.
    fn params_complete<'a>(&'a self, _ctx: &'a mut RequestContext<'_>)
        -> BoxFuture<'a, Result<()>>
    {
        future::ok(()).boxed()
    }

    fn stdin<'a>(&'a self, _ctx: &'a mut RequestContext<'_>, _content: &'a Bytes)
        -> BoxFuture<'a, Result<()>>
    {
        future::ok(()).boxed()
    }

    fn stdin_end<'a>(&'a self, _ctx: &'a mut RequestContext<'_>)
        -> BoxFuture<'a, Result<()>>
    {
        future::ok(()).boxed()
    }

    fn data<'a>(&'a self, _ctx: &'a mut RequestContext<'_>, _content: &'a Bytes)
        -> BoxFuture<'a, Result<()>>
    {
        future::ok(()).boxed()
    }

    fn end_request(&self, _request: &mut FastcgiRequest) {}
}

/// Adapts a [`FastcgiRequestHandler`] to the record-level [`FastcgiHooks`],
/// tracking the request phase along the way.
pub struct Lifecycle<R> {
    handler: R,
}

impl<R: FastcgiRequestHandler> Lifecycle<R> {
    pub fn new(handler: R) -> Lifecycle<R> {
        Lifecycle { handler }
    }

    pub fn handler(&self) -> &R {
        &self.handler
    }
}

fn user_result(res: Result<()>, failure: FastcgiError) -> Result<()> {
    match res {
        Ok(()) | Err(FastcgiError::RequestCompleted) => Ok(()),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            debug!("handler failed: {}", e);
            Err(failure)
        },
    }
}

impl<R: FastcgiRequestHandler> FastcgiHooks for Lifecycle<R> {
    fn begin_request<'a>(&'a self, ctx: &'a mut RequestContext<'_>, _begin: &'a BeginRequest)
        -> BoxFuture<'a, Result<()>>
    {
        async move {
            let res = self.handler.begin_request(ctx).await;
            user_result(res, FastcgiError::UserBeginRequest)
        }.boxed()
    }

    fn params<'a>(&'a self, ctx: &'a mut RequestContext<'_>, pairs: &'a NameValues)
        -> BoxFuture<'a, Result<()>>
    {
        async move {
            if !pairs.is_empty() {
                return Ok(());
            }
            let request = ctx.request_mut();
            if !request.advance_phase(Phase::ParamsDone) {
                warn!("request {}: params ended twice", request.id());
                return Ok(());
            }
            request.fill_info();
            debug!("request {}: {} {:?}", request.id(), request.info().method,
                   request.info().script_name);
            let res = self.handler.params_complete(ctx).await;
            ctx.request_mut().advance_phase(Phase::HeadersAllowed);
            user_result(res, FastcgiError::UserParams)
        }.boxed()
    }

    fn stdin<'a>(&'a self, ctx: &'a mut RequestContext<'_>, content: &'a Bytes)
        -> BoxFuture<'a, Result<()>>
    {
        async move {
            let res = if content.is_empty() {
                self.handler.stdin_end(ctx).await
            } else {
                self.handler.stdin(ctx, content).await
            };
            user_result(res, FastcgiError::UserStdin)
        }.boxed()
    }

    fn data<'a>(&'a self, ctx: &'a mut RequestContext<'_>, content: &'a Bytes)
        -> BoxFuture<'a, Result<()>>
    {
        async move {
            match self.handler.data(ctx, content).await {
                Err(FastcgiError::RequestCompleted) => Ok(()),
                res => res,
            }
        }.boxed()
    }

    fn end_request(&self, request: &mut FastcgiRequest) {
        self.handler.end_request(request)
    }
}

fn swallow_state(res: Result<()>) -> Result<()> {
    match res {
        Err(FastcgiError::RequestState(phase)) => {
            warn!("response after headers were sent (phase {:?}), ignoring", phase);
            Ok(())
        },
        Err(FastcgiError::RequestCompleted) => Ok(()),
        other => other,
    }
}

/// Sends an empty response with the given status and ends the request.
pub async fn error_response(ctx: &mut RequestContext<'_>, status: u16, text: &str) -> Result<()> {
    let res = async {
        ctx.add_header(AddMode::Override, "Content-Length", Some("0"))?;
        ctx.set_status(status, text)?;
        ctx.headers_end()?;
        ctx.finalize().await
    }.await;
    swallow_state(res)
}

/// Like [`error_response`], with a `Location` header.
pub async fn redirect(ctx: &mut RequestContext<'_>, status: u16, text: &str, location: &str)
    -> Result<()>
{
    let res = async {
        ctx.add_header(AddMode::Override, "Content-Length", Some("0"))?;
        ctx.add_header(AddMode::Override, "Location", Some(location))?;
        ctx.set_status(status, text)?;
        ctx.headers_end()?;
        ctx.finalize().await
    }.await;
    swallow_state(res)
}
