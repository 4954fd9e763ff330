mod common;

use common::*;
use tokio_fastcgi_mux::*;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

use std::time::Duration;

struct Echo;

impl FastcgiRequestHandler for Echo {
    fn stdin_end<'a>(&'a self, ctx: &'a mut RequestContext<'_>) -> BoxFuture<'a, Result<()>> {
        async move {
            let query = ctx.request().info().query_term("name").unwrap_or("nobody").to_owned();
            ctx.add_header(AddMode::Override, "Content-Type", Some("text/plain"))?;
            ctx.headers_end()?;
            ctx.write_stdout(format!("hi {}", query).as_bytes())?;
            ctx.finalize().await
        }.boxed()
    }
}

async fn send_request(client: &mut Client<TcpStream>, request_id: u16, keep_conn: bool,
                      query: &'static str)
{
    client.begin(request_id, keep_conn).await;
    client.params(request_id, &[("REQUEST_METHOD", "GET"), ("QUERY_STRING", query)]).await;
    client.params(request_id, &[]).await;
    client.stdin(request_id, b"").await;
}

async fn ask(addr: std::net::SocketAddr, request_id: u16, query: &'static str) -> Vec<u8> {
    let mut client = Client::new(TcpStream::connect(addr).await.unwrap());
    send_request(&mut client, request_id, false, query).await;
    let (stdout, end) = client.response(request_id).await;
    assert_eq!(ProtocolStatus::RequestComplete, end.protocol_status);
    assert!(client.closed().await);
    stdout
}

#[tokio::test]
async fn serves_tcp_connections_until_shutdown() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = FastcgiServer::from_listener(listener,
        FastcgiConfig::new(Lifecycle::new(Echo)).with_max_conns(2));
    let addr = server.local_addr().unwrap();
    let stats = server.stats();

    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.serve_until(async {
        let _ = stopped.await;
    }));

    let (a, b, c) = tokio::join!(
        ask(addr, 1, "name=alice"),
        ask(addr, 2, "name=b%C3%B6b"),
        ask(addr, 3, ""),
    );
    assert_eq!(&b"Content-Type: text/plain\r\n\r\nhi alice"[..], &a[..]);
    assert!(b.ends_with("hi böb".as_bytes()));
    assert!(c.ends_with(b"hi nobody"));
    assert_eq!(3, stats.accepted());

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn bind_uses_configured_address() {
    init_logging();
    let config = FastcgiConfig::new(Lifecycle::new(Echo)).with_host("127.0.0.1").with_port(0);
    assert_eq!(DEFAULT_MAX_REQS, config.max_reqs());
    let server = FastcgiServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    assert!(addr.ip().is_loopback());
    assert_ne!(0, addr.port());
    assert_eq!(0, server.stats().active());

    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.serve_until(async {
        let _ = stopped.await;
    }));
    assert!(ask(addr, 1, "name=x").await.ends_with(b"hi x"));
    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn max_conns_holds_back_extra_connections() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = FastcgiServer::from_listener(listener,
        FastcgiConfig::new(Lifecycle::new(Echo)).with_max_conns(1));
    let addr = server.local_addr().unwrap();
    let stats = server.stats();

    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.serve_until(async {
        let _ = stopped.await;
    }));

    let mut first = Client::new(TcpStream::connect(addr).await.unwrap());
    send_request(&mut first, 1, true, "name=first").await;
    let (stdout, _) = first.response(1).await;
    assert!(stdout.ends_with(b"hi first"));
    assert_eq!(1, stats.active());

    // The only slot belongs to the first connection, which stays open.
    let mut second = Client::new(TcpStream::connect(addr).await.unwrap());
    send_request(&mut second, 1, false, "name=second").await;
    assert!(second.quiet(Duration::from_millis(300)).await);
    assert_eq!(1, stats.accepted());
    assert_eq!(1, stats.active());

    first.close().await;
    assert!(first.closed().await);
    let (stdout, end) = second.response(1).await;
    assert_eq!(ProtocolStatus::RequestComplete, end.protocol_status);
    assert!(stdout.ends_with(b"hi second"));
    assert!(second.closed().await);
    assert_eq!(2, stats.accepted());

    timeout(Duration::from_secs(5), async {
        while stats.active() != 0 {
            sleep(Duration::from_millis(10)).await;
        }
    }).await.expect("connections never drained");

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
}
