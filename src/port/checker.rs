use anyhow::{bail, Result};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use crate::process;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn loopbacks(port: u16) -> [SocketAddr; 2] {
    [
        SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        SocketAddr::from((Ipv6Addr::LOCALHOST, port)),
    ]
}

/// Check whether a port can be bound on loopback.
///
/// Dev servers bind either IPv4 or IPv6, so the port is free only if
/// neither family is taken. A host without IPv6 only checks IPv4.
pub fn is_available(port: u16) -> bool {
    let [v4, v6] = loopbacks(port);
    if TcpListener::bind(v4).is_err() {
        return false;
    }
    match TcpListener::bind(v6) {
        Ok(_) => true,
        Err(e) => e.kind() != ErrorKind::AddrInUse,
    }
}

/// Check whether something accepts connections on the port (IPv4, then IPv6).
pub fn is_listening(port: u16) -> bool {
    loopbacks(port)
        .iter()
        .any(|addr| TcpStream::connect_timeout(addr, CONNECT_TIMEOUT).is_ok())
}

/// First bindable port in `[min, max]`.
pub fn find_available(min: u16, max: u16) -> Option<u16> {
    (min..=max).find(|port| is_available(*port))
}

/// Wait until something is listening on the port.
pub async fn wait_for_port(port: u16, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if tokio::task::spawn_blocking(move || is_listening(port))
            .await
            .unwrap_or(false)
        {
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    bail!("timeout waiting for port {} to start listening", port)
}

/// Wait until the port can be bound again.
pub async fn wait_for_port_free(port: u16, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if is_available(port) {
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    bail!("timeout waiting for port {} to become free", port)
}

/// Pid of the process listening on the port, via `lsof`.
pub async fn listener_pid(port: u16) -> Option<u32> {
    let target = format!("-iTCP:{}", port);
    let stdout = process::capture_stdout(
        "lsof",
        [target.as_str(), "-sTCP:LISTEN", "-t"],
        None,
        process::DEFAULT_COMMAND_TIMEOUT,
    )
    .await?;
    stdout
        .lines()
        .find_map(|line| line.trim().parse::<u32>().ok())
}
