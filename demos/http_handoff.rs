//! HTTP server that hands its listening socket to a successor on SIGUSR2 and drains on SIGQUIT.
//!
//! Every response names the pid of the generation that served it.

use std::{io, net::SocketAddr, path::PathBuf, process::exit, time::Duration};

use clap::{Parser, ValueEnum};
use exuvia::{
    tokio_exuvia::{Incoming, SignalKind, StopOnShutdown, TokioExuviaBuilder},
    SockInfo, Strategy,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UnixStream},
};

const MAX_REQUEST_HEAD: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HandoffStrategy {
    /// Pass the listening descriptor to the successor
    Inherit,
    /// Bind a second socket with SO_REUSEPORT next to the ancestor's
    DualBind,
}

impl From<HandoffStrategy> for Strategy {
    fn from(strategy: HandoffStrategy) -> Self {
        match strategy {
            HandoffStrategy::Inherit => Strategy::Inherit,
            HandoffStrategy::DualBind => Strategy::DualBind,
        }
    }
}

#[derive(Parser)]
#[command(name = "http_handoff")]
#[command(about = "HTTP server surviving binary upgrades without dropping connections")]
struct Args {
    /// TCP address to serve on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Serve on a unix socket instead of TCP
    #[arg(long, conflicts_with = "listen")]
    unix: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = HandoffStrategy::Inherit)]
    strategy: HandoffStrategy,

    /// Delay between notifying the ancestor and accepting connections
    #[arg(long, default_value_t = 1000)]
    grace_ms: u64,

    /// Upper bound on waiting for in-flight requests at shutdown
    #[arg(long, default_value_t = 30)]
    drain_secs: u64,

    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Leave the ancestor running once this generation is ready
    #[arg(long)]
    no_notify: bool,
}

async fn handle<S>(mut stream: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        if head.len() >= MAX_REQUEST_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        head.extend_from_slice(&buf[..read]);
    }

    let pid = std::process::id();
    let head = String::from_utf8_lossy(&head);
    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or("-");
    let path = request_line.next().unwrap_or("-");
    log::info!("New request! From: {pid}, path: {path}, method: {method}");

    let body = format!("served-by pid={pid}\n");
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = TokioExuviaBuilder::new(args.strategy.into(), SignalKind::user_defined2())?;
    builder.stop_on_signal(SignalKind::quit())?;
    builder.stop_on_signal(SignalKind::terminate())?;
    builder.stop_on_signal(SignalKind::interrupt())?;
    builder.grace_period(Duration::from_millis(args.grace_ms));
    builder.drain_timeout(Duration::from_secs(args.drain_secs));
    builder.notify_ancestor(!args.no_notify);
    if let Some(pid_file) = &args.pid_file {
        builder.set_pid_file(pid_file);
    }

    let sock_info = match args.unix {
        Some(path) => SockInfo::Unix(path),
        None => SockInfo::Tcp(args.listen),
    };
    let incoming = builder.listen(StopOnShutdown::Yes, &sock_info)?;

    let (exuvia, monitor) = builder.ready().await?;
    match incoming {
        Incoming::Tcp(incoming) => {
            tokio::spawn(exuvia.server(handle::<TcpStream>).serve(incoming));
        }
        Incoming::Unix(incoming) => {
            tokio::spawn(exuvia.server(handle::<UnixStream>).serve(incoming));
        }
    }

    let reason = monitor.await?;
    log::info!("Generation {} exiting: {reason:?}", std::process::id());
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Args::parse()).await {
        log::error!("{e}");
        exit(1);
    }
}
