//! Kernel-filtered UDP knock ingress.
//!
//! Opens a cooked `AF_PACKET` socket on the configured interface and attaches
//! a classic BPF program so that only IPv4/UDP frames ever cross into user
//! space — truncated to their headers, so knock payloads stay in the kernel.
//! No port restriction is applied: the state machine needs to see wrong-port
//! packets to reset progress, otherwise a sequential sweep walks the sequence
//! unpunished.
//!
//! Each accepted frame is reduced to a [`KnockEvent`] and pushed into a
//! bounded channel with `try_send`. A full channel drops the event; the
//! transport is lossy UDP to begin with.

use std::mem::size_of;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, trace};

use crate::metrics::IngressMetrics;

/// Destination-port observation extracted from one UDP datagram. Everything
/// else about the packet — payload, source port, lengths — is irrelevant to
/// knock recognition and is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnockEvent {
    pub src_ip: Ipv4Addr,
    pub dst_port: u16,
}

/// Capacity of the ingress ring buffer.
pub const RING_CAPACITY: usize = 4096;

// Maximum IPv4 header (60) + UDP header (8). The BPF accept verdict truncates
// delivered frames to this length, so payload bytes never leave the kernel.
const SNAP_LEN: usize = 68;

pub struct PacketIngress {
    socket: Socket,
    tx: Sender<KnockEvent>,
    metrics: Arc<IngressMetrics>,
    shutdown: Arc<AtomicBool>,
}

impl PacketIngress {
    /// Bind to `interface` and install the kernel filter.
    pub fn new(
        interface: &str,
        tx: Sender<KnockEvent>,
        metrics: Arc<IngressMetrics>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let socket = open_capture_socket(interface)
            .with_context(|| format!("failed to open capture socket on '{interface}'"))?;

        // Poll the shutdown flag between reads.
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;

        Ok(Self {
            socket,
            tx,
            metrics,
            shutdown,
        })
    }

    /// Receive loop. Returns when shutdown is requested or the socket fails
    /// terminally; single malformed frames are counted and skipped.
    pub fn run(&mut self) -> Result<()> {
        info!("packet ingress started");
        let mut buf = [0u8; SNAP_LEN];

        while !self.shutdown.load(Relaxed) {
            let buf_uninit: &mut [std::mem::MaybeUninit<u8>] = unsafe {
                std::slice::from_raw_parts_mut(buf.as_mut_ptr() as _, buf.len())
            };
            let n = match self.socket.recv(buf_uninit) {
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e).context("packet socket read failed"),
            };
            if n == 0 {
                continue;
            }

            self.metrics.frames_received.fetch_add(1, Relaxed);
            match parse_knock(&buf[..n]) {
                Some(event) => {
                    if self.tx.try_send(event).is_ok() {
                        self.metrics.events_queued.fetch_add(1, Relaxed);
                    } else {
                        self.metrics.events_dropped.fetch_add(1, Relaxed);
                    }
                }
                None => {
                    self.metrics.frames_skipped.fetch_add(1, Relaxed);
                    trace!(len = n, "skipped unparsable frame");
                }
            }
        }

        info!("packet ingress stopped");
        Ok(())
    }
}

/// Extract `(src_ip, dst_port)` from a cooked-mode frame (starts at the IPv4
/// header). The kernel filter already rejected non-UDP; this re-checks
/// cheaply rather than trusting the filter attach raced no packets.
fn parse_knock(frame: &[u8]) -> Option<KnockEvent> {
    if frame.len() < 20 || frame[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(frame[0] & 0x0f) * 4;
    if ihl < 20 || frame.len() < ihl + 8 {
        return None;
    }
    if frame[9] != libc::IPPROTO_UDP as u8 {
        return None;
    }
    // Non-first fragments carry no UDP header.
    if u16::from_be_bytes([frame[6], frame[7]]) & 0x1fff != 0 {
        return None;
    }

    let src_ip = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
    let dst_port = u16::from_be_bytes([frame[ihl + 2], frame[ihl + 3]]);
    Some(KnockEvent { src_ip, dst_port })
}

/// Open a cooked packet socket bound to `interface`, with the UDP-only
/// classic BPF program attached.
#[cfg(target_os = "linux")]
fn open_capture_socket(interface: &str) -> Result<Socket> {
    use std::os::unix::io::AsRawFd;

    let proto_be = (libc::ETH_P_IP as u16).to_be();
    let socket = Socket::new(
        Domain::PACKET,
        Type::DGRAM,
        Some(Protocol::from(i32::from(proto_be))),
    )?;
    let fd = socket.as_raw_fd();

    let ifindex = interface_index(interface)?;
    unsafe {
        let mut addr: libc::sockaddr_ll = std::mem::zeroed();
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = proto_be;
        addr.sll_ifindex = ifindex as i32;
        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        );
        if rc != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to bind packet socket to '{interface}'"));
        }
    }

    attach_udp_filter(fd)?;
    Ok(socket)
}

#[cfg(not(target_os = "linux"))]
fn open_capture_socket(interface: &str) -> Result<Socket> {
    let _ = interface;
    anyhow::bail!("packet ingress requires Linux (AF_PACKET + BPF)");
}

#[cfg(target_os = "linux")]
fn interface_index(interface: &str) -> Result<libc::c_uint> {
    let name = std::ffi::CString::new(interface)
        .with_context(|| format!("invalid interface name '{interface}'"))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{interface}' not found");
    }
    Ok(index)
}

/// Attach the classic BPF program: accept IPv4 protocol 17 truncated to
/// `SNAP_LEN`, drop everything else in kernel.
///
/// Cooked sockets present the frame starting at the network header, so the
/// protocol byte sits at absolute offset 9.
#[cfg(target_os = "linux")]
fn attach_udp_filter(fd: libc::c_int) -> Result<()> {
    // Opcodes: BPF_LD|BPF_B|BPF_ABS, BPF_JMP|BPF_JEQ|BPF_K, BPF_RET|BPF_K.
    let mut prog = [
        libc::sock_filter { code: 0x30, jt: 0, jf: 0, k: 9 },
        libc::sock_filter { code: 0x15, jt: 0, jf: 1, k: libc::IPPROTO_UDP as u32 },
        libc::sock_filter { code: 0x06, jt: 0, jf: 0, k: SNAP_LEN as u32 },
        libc::sock_filter { code: 0x06, jt: 0, jf: 0, k: 0 },
    ];
    let fprog = libc::sock_fprog {
        len: prog.len() as libc::c_ushort,
        filter: prog.as_mut_ptr(),
    };

    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &fprog as *const libc::sock_fprog as *const libc::c_void,
            size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("failed to attach BPF filter");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal cooked-mode IPv4/UDP frame.
    fn udp_frame(src: [u8; 4], dst_port: u16, opts_words: u8) -> Vec<u8> {
        let ihl = 5 + opts_words;
        let mut frame = vec![0u8; usize::from(ihl) * 4 + 8];
        frame[0] = 0x40 | ihl; // version 4
        frame[9] = 17; // UDP
        frame[12..16].copy_from_slice(&src);
        let off = usize::from(ihl) * 4;
        frame[off + 2..off + 4].copy_from_slice(&dst_port.to_be_bytes());
        frame
    }

    #[test]
    fn test_parse_basic_udp() {
        let frame = udp_frame([10, 0, 0, 7], 25344, 0);
        let event = parse_knock(&frame).unwrap();
        assert_eq!(event.src_ip, Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(event.dst_port, 25344);
    }

    #[test]
    fn test_parse_with_ip_options() {
        let frame = udp_frame([192, 168, 1, 2], 443, 2);
        let event = parse_knock(&frame).unwrap();
        assert_eq!(event.src_ip, Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(event.dst_port, 443);
    }

    #[test]
    fn test_parse_rejects_non_udp() {
        let mut frame = udp_frame([10, 0, 0, 7], 80, 0);
        frame[9] = 6; // TCP
        assert!(parse_knock(&frame).is_none());
    }

    #[test]
    fn test_parse_rejects_non_ipv4() {
        let mut frame = udp_frame([10, 0, 0, 7], 80, 0);
        frame[0] = 0x60; // version 6
        assert!(parse_knock(&frame).is_none());
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let frame = udp_frame([10, 0, 0, 7], 80, 0);
        assert!(parse_knock(&frame[..24]).is_none());
        assert!(parse_knock(&[]).is_none());
    }

    #[test]
    fn test_parse_rejects_later_fragments() {
        let mut frame = udp_frame([10, 0, 0, 7], 80, 0);
        frame[7] = 0x01; // fragment offset 1
        assert!(parse_knock(&frame).is_none());
    }

    #[test]
    fn test_parse_rejects_bad_ihl() {
        let mut frame = udp_frame([10, 0, 0, 7], 80, 0);
        frame[0] = 0x44; // IHL 4 words — below the IPv4 minimum
        assert!(parse_knock(&frame).is_none());
    }
}
