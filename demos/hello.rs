use tokio_fastcgi_mux::*;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};

struct HelloHandler {
    request_count: AtomicUsize,
}

impl HelloHandler {
    pub fn new() -> HelloHandler {
        HelloHandler {
            request_count: AtomicUsize::new(1),
        }
    }
}

/// Per-request body size, kept in the request's user data.
struct Received(usize);

impl FastcgiRequestHandler for HelloHandler {
    fn params_complete<'a>(&'a self, ctx: &'a mut RequestContext<'_>) -> BoxFuture<'a, Result<()>> {
        async move {
            ctx.request_mut().set_user_data(Received(0));
            if ctx.request().info().method == Method::Delete {
                return error_response(ctx, 405, "Method Not Allowed").await;
            }
            if ctx.request().info().script_name.as_deref() == Some("/old") {
                return redirect(ctx, 301, "Moved Permanently", "/hello").await;
            }
            Ok(())
        }.boxed()
    }

    fn stdin<'a>(&'a self, ctx: &'a mut RequestContext<'_>, content: &'a Bytes)
        -> BoxFuture<'a, Result<()>>
    {
        async move {
            if let Some(received) = ctx.request_mut().user_data_mut::<Received>() {
                received.0 += content.len();
            }
            Ok(())
        }.boxed()
    }

    fn stdin_end<'a>(&'a self, ctx: &'a mut RequestContext<'_>) -> BoxFuture<'a, Result<()>> {
        async move {
            let count = self.request_count.fetch_add(1, Ordering::SeqCst);
            let received = ctx.request().user_data::<Received>().map_or(0, |r| r.0);
            let body = format!("Hello from {:?} ({} {}): request {}, {} bytes received\n",
                               ctx.request().param_str("REQUEST_URI").unwrap_or("?"),
                               ctx.request().info().method,
                               ctx.request().info().path_info.as_deref().unwrap_or("/"),
                               count, received);

            ctx.add_header(AddMode::Override, "Content-Type", Some("text/plain"))?;
            ctx.add_header(AddMode::Override, "Content-Length", Some(body.len().to_string()))?;
            ctx.add_header_time(AddMode::IfNotExists, "Date", std::time::SystemTime::now())?;
            ctx.set_status(200, "OK")?;
            ctx.headers_end()?;
            ctx.write_stdout(body.as_bytes())?;
            ctx.finalize().await
        }.boxed()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let port = env::args().nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(9000);

    let config = FastcgiConfig::new(Lifecycle::new(HelloHandler::new()))
        .with_port(port)
        .with_max_conns(128);
    let server = FastcgiServer::bind(config).await?;
    println!("listening on {}", server.local_addr()?);

    server.serve_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("failed to wait for ctrl-c: {}", e);
        }
    }).await
}
