use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::http_head::join_host_port;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Connects to `host:port` or fails with `Error::Dial` once `timeout` elapses.
pub async fn dial_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let target = join_host_port(host, port);
    let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(Error::dial(target, e)),
        Err(_) => return Err(Error::dial(target, format!("timed out after {:?}", timeout))),
    };

    tune_socket(&stream);
    tracing::debug!(%target, "tcp connection established");
    Ok(stream)
}

/// Long-lived tunnels: no Nagle delay, and keepalive so dead peers get reaped.
fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!("could not enable keepalive: {}", e);
    }
}
