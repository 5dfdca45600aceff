//! `knockd knock` — the client transmitter.
//!
//! Derives the current port sequence from the shared secret and fires four
//! UDP datagrams at the server, one zero byte each. Only the destination
//! ports carry information; delivery is fire-and-forget.

use anyhow::{Context, Result};
use std::net::{ToSocketAddrs, UdpSocket};
use std::path::Path;
use std::time::Duration;

use knock_engine::{clock, load_secret_file, otp};

pub fn run(host: &str, secret_path: &Path, max_jitter_ms: u64) -> Result<()> {
    let secret = load_secret_file(secret_path)?;
    let ports = otp::ports_at(&secret, clock::unix_now())?;

    let mut target = (host, 0u16)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve host '{host}'"))?
        .next()
        .with_context(|| format!("host '{host}' resolved to no addresses"))?;

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind UDP socket")?;

    println!("transmitting knock sequence to {host}: {ports:?}");
    for port in ports {
        target.set_port(port);
        socket
            .send_to(&[0u8], target)
            .with_context(|| format!("failed to send knock to {target}"))?;
        std::thread::sleep(Duration::from_millis(max_jitter_ms));
    }

    Ok(())
}
