//! HIM Connection Engine: the per-subchannel TCP/UDP tunnel state machine
//! (spec.md §3 "HIM State", §4.8).
//!
//! There is no teacher analogue for socket handling -- `pbs-tape` never
//! talks to the network -- so the socket plumbing here is original,
//! reusing `nix` (already in the dependency stack for
//! [`crate::media::scsi`]'s ioctls) for the bind-before-connect sequence
//! the original `get_socket()` needs, and wrapping the resulting file
//! descriptor in a `std::net` type once it settles into its final shape.
//! Struct-holds-state style and explicit `Result` propagation follow
//! `pbs-tape/src/sg_tape.rs`.

use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Write};
use std::net::{SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    accept, bind, connect as nix_connect, getsockname, listen, setsockopt, socket, sockopt,
    AddressFamily, SockFlag, SockType, SockaddrIn,
};

use super::config::{parse_config_string, ConfigProtocol};
use super::header::{
    flag_bits, tcp_flags, ConfigReply, HimHeader, IpHeader, TcpHeader, TcpMssOption, UdpHeader,
    HIM_HEADER_LEN, IPPROTO_TCP, IPPROTO_UDP, IP_HEADER_LEN, IP_TTL_MAX, IP_TTL_NOMINAL,
    IP_VERSION_IHL, MSS_VALUE, TCP_DATA_OFFSET_NO_OPTIONS, TCP_DATA_OFFSET_WITH_MSS,
    TCP_HEADER_LEN, UDP_HEADER_LEN,
};
use crate::unitstatus::UnitStatus;

/// Bound on the event queue (spec.md §3, §8 universal invariant).
pub const EVENT_QUEUE_CAP: usize = 16;
/// `listen()` backlog used for passive sockets, mirroring the original's
/// `QLEN`.
const LISTEN_BACKLOG: i32 = 5;
/// Poll timeout used both by the engine's inline readability check on
/// READ and by the background poller (spec.md §4.8, §4.9).
const POLL_TIMEOUT: Duration = Duration::from_millis(10);
const MAX_PAYLOAD: usize = 1460;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HimProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HimConnState {
    Shutdown,
    Initialized,
    Connected,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HimEvent {
    Config,
    Mss,
    Ack,
    Fin,
    Finished,
}

/// The socket backing one HIM subchannel, across its various lifetimes:
/// not yet connected (bound but waiting on the guest's destination),
/// connected/established, listening (passive TCP), or a UDP datagram
/// socket (which needs no connect step).
enum HimSocket {
    PendingTcp(RawFd),
    Tcp(TcpStream),
    Listener(TcpListener),
    Udp(UdpSocket),
}

impl HimSocket {
    fn raw_fd(&self) -> RawFd {
        match self {
            HimSocket::PendingTcp(fd) => *fd,
            HimSocket::Tcp(s) => s.as_raw_fd(),
            HimSocket::Listener(s) => s.as_raw_fd(),
            HimSocket::Udp(s) => s.as_raw_fd(),
        }
    }
}

/// The IP/TCP header template the engine builds once at configuration
/// time and mutates (sequence, ack, id, buffer number) for every outbound
/// frame (spec.md §3 "Mirror IP/TCP/UDP header").
#[derive(Debug, Clone, Copy, Default)]
struct TemplateHeader {
    him: HimHeader,
    ip: IpHeader,
    tcp: TcpHeader,
}

/// Per-subchannel HIM device state (spec.md §3 "HIM State").
pub struct HimState {
    sock: Option<HimSocket>,
    pub protocol: HimProtocol,
    pub state: HimConnState,
    pub passive: bool,
    pub server: bool,
    /// Shared with the background poller: the poller only ever reads
    /// these two flags (spec.md §5 "Shared resources").
    pub rnr: Arc<AtomicBool>,
    pub watch_sock: Arc<AtomicBool>,
    pub tn3270: bool,

    template: TemplateHeader,
    config_reply_bytes: Option<Vec<u8>>,
    peer: SocketAddrV4,

    event_queue: VecDeque<HimEvent>,
    max_q: usize,
    pub attn_rc: Arc<Mutex<[u32; 4]>>,

    /// Set when `connect`/`write`/`sendto` fails; Design Notes §9's
    /// resolution of the HIM write-error Open Question surfaces this as
    /// unit-check with a data-check sense byte rather than the
    /// original's silent log-only failure.
    pub write_error: bool,

    /// Design Notes §9's named replacement for the original's reused
    /// "unused" control-block bit.
    pub halt_requested: Arc<AtomicBool>,
}

/// Sense byte convention private to HIM (the tape sense table in
/// [`crate::sense`] does not apply here): bit 0 of a single status byte
/// marks "data check", per the write-error Open Question's resolution.
pub const SENSE_DATA_CHECK: u8 = 0x01;

impl HimState {
    pub fn new(halt_requested: Arc<AtomicBool>) -> Self {
        HimState {
            sock: None,
            protocol: HimProtocol::Tcp,
            state: HimConnState::Shutdown,
            passive: false,
            server: false,
            rnr: Arc::new(AtomicBool::new(false)),
            watch_sock: Arc::new(AtomicBool::new(false)),
            tn3270: false,
            template: TemplateHeader::default(),
            config_reply_bytes: None,
            peer: SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0),
            event_queue: VecDeque::new(),
            max_q: 0,
            attn_rc: Arc::new(Mutex::new([0; 4])),
            write_error: false,
            halt_requested,
        }
    }

    /// Tear the control block down to its shutdown state (spec.md §3
    /// invariant: `state == SHUTDOWN` iff no socket is owned).
    fn reset(&mut self) {
        let halt_requested = self.halt_requested.clone();
        if let Some(sock) = self.sock.take() {
            let _ = match sock {
                HimSocket::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
                HimSocket::PendingTcp(fd) => {
                    unsafe { drop(std::fs::File::from_raw_fd(fd)) };
                    Ok(())
                }
                _ => Ok(()),
            };
        }
        debug!(
            "HIM subchannel closing: max_q={}, attn_rc={:?}",
            self.max_q,
            self.attn_rc.lock().unwrap()
        );
        *self = HimState::new(halt_requested);
    }

    fn push_event(&mut self, ev: HimEvent) {
        if self.event_queue.len() >= EVENT_QUEUE_CAP {
            warn!("HIM event queue full, dropping {ev:?}");
            return;
        }
        self.event_queue.push_back(ev);
        self.max_q = self.max_q.max(self.event_queue.len());
    }

    /// Whether the poller should be (re)started after this operation
    /// (spec.md §4.8 "Every successful READ path that leaves the state
    /// non-SHUTDOWN and no poller running spawns one", and the explicit
    /// RNR-clear restart).
    pub fn needs_poller(&self) -> bool {
        self.state != HimConnState::Shutdown && !self.watch_sock.load(Ordering::Acquire)
    }

    pub fn socket_fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(HimSocket::raw_fd)
    }

    /// Process a guest WRITE (spec.md §4.8). Returns the unit status the
    /// CCW should complete with; residual is always 0 for WRITE, matching
    /// the original.
    pub fn handle_write(&mut self, iobuf: &[u8]) -> UnitStatus {
        let mut status = UnitStatus::ce_de();
        let mut cur = Cursor::new(iobuf);
        let him = match HimHeader::read_from(&mut cur) {
            Ok(h) => h,
            Err(_) => return status,
        };

        if him.has(flag_bits::FINISHED) {
            self.push_event(HimEvent::Finished);
            return status;
        }

        if self.state == HimConnState::Connected && him.has(flag_bits::RNR) {
            debug!("HIM: RNR flag on, pausing poller");
            self.watch_sock.store(false, Ordering::Release);
            self.rnr.store(true, Ordering::Release);
            status |= UnitStatus::UX;
            return status;
        }

        if self.rnr.load(Ordering::Acquire) && !him.has(flag_bits::RNR) {
            debug!("HIM: RNR flag off, poller will restart");
            self.rnr.store(false, Ordering::Release);
            return status;
        }

        if him.has(flag_bits::INIT) {
            self.handle_init_write(iobuf, him);
            status |= UnitStatus::ATTN;
            return status;
        }

        match self.protocol {
            HimProtocol::Udp => self.handle_udp_write(iobuf, him),
            HimProtocol::Tcp => {
                if self.state == HimConnState::Initialized {
                    self.handle_tcp_connect(&iobuf[HIM_HEADER_LEN..]);
                    status |= UnitStatus::ATTN;
                } else if u16::from(him.buffer_length) > 4 {
                    self.handle_tcp_payload(iobuf, him);
                }
            }
        }
        status
    }

    /// `SHUTDOWN`, init-flagged WRITE: parse the EBCDIC configuration
    /// string, build the outbound header template, allocate the socket,
    /// queue the config reply (spec.md §4.8 first bullet).
    fn handle_init_write(&mut self, iobuf: &[u8], him: HimHeader) {
        let cs_len = u16::from(him.buffer_length) as usize;
        let config_bytes = &iobuf[HIM_HEADER_LEN..HIM_HEADER_LEN + cs_len.min(iobuf.len() - HIM_HEADER_LEN)];

        let parsed = match parse_config_string(config_bytes) {
            Ok(p) if self.state == HimConnState::Shutdown => p,
            _ => {
                self.reset();
                self.config_reply_bytes = Some(ConfigReply::failed().encode());
                self.push_event(HimEvent::Config);
                return;
            }
        };

        self.protocol = match parsed.protocol {
            ConfigProtocol::Tcp => HimProtocol::Tcp,
            ConfigProtocol::Udp => HimProtocol::Udp,
        };
        self.passive = parsed.passive;
        self.server = parsed.server;
        self.tn3270 = him.has(flag_bits::TN3270);

        let our_ip = local_ipv4_address();

        let mut template = TemplateHeader {
            him: HimHeader {
                flags: 0,
                buffer_number: 1,
                buffer_length: 40,
            },
            ip: IpHeader {
                version_ihl: IP_VERSION_IHL,
                tos: 0,
                total_length: 40,
                id: 1,
                flags_frag_offset: 0,
                ttl: IP_TTL_NOMINAL,
                protocol: if self.protocol == HimProtocol::Udp { IPPROTO_UDP } else { IPPROTO_TCP },
                checksum: 0,
                src: [0; 4],
                dst: our_ip.octets(),
            },
            tcp: TcpHeader {
                src_port: 0,
                dst_port: 0,
                seq: 1,
                ack: 0,
                data_offset_reserved: TCP_DATA_OFFSET_NO_OPTIONS,
                flags: tcp_flags::ACK,
                window: 6 * 4096,
                checksum: 0,
                urgent_ptr: 0,
            },
        };

        if let Some(local) = parsed.local_socket {
            let dest_ip = if local.ip == [0, 0, 0, 0] { our_ip.octets() } else { local.ip };
            template.ip.dst = dest_ip;
            template.tcp.dst_port = local.port;
        }
        if let Some(foreign) = parsed.foreign_socket {
            template.ip.src = foreign.ip;
            template.tcp.src_port = foreign.port;
        }
        self.template = template;

        let mut local_port = u16::from(self.template.tcp.dst_port);
        if !self.server && (!self.passive || local_port == 0) {
            match open_socket(self.protocol, local_port, self.passive) {
                Ok((sock, bound_addr)) => {
                    local_port = bound_addr.port();
                    self.template.tcp.dst_port = local_port;
                    self.sock = Some(sock);
                }
                Err(e) => {
                    warn!("HIM: get_socket failed: {e}");
                    self.reset();
                    self.config_reply_bytes = Some(ConfigReply::failed().encode());
                    self.push_event(HimEvent::Config);
                    return;
                }
            }
        }

        let reply = ConfigReply {
            him_header: HimHeader {
                flags: flag_bits::INIT,
                buffer_number: 1,
                buffer_length: 18,
            },
            ok: true,
            family: 1, // AF_LOCAL, matching the original's hard-coded family byte
            protocol: if self.protocol == HimProtocol::Udp { IPPROTO_UDP } else { IPPROTO_TCP },
            local_port,
            local_ip: self.template.ip.dst,
            remote_port: 0,
            remote_ip: [0; 4],
        };
        self.config_reply_bytes = Some(reply.encode());
        self.state = HimConnState::Initialized;
        self.push_event(HimEvent::Config);
    }

    /// `INITIALIZED`, first TCP WRITE: connect to the destination the
    /// guest embedded in the packet (spec.md §4.8 second bullet).
    fn handle_tcp_connect(&mut self, ip_and_tcp: &[u8]) {
        let mut cur = Cursor::new(ip_and_tcp);
        let ip = match IpHeader::read_from(&mut cur) {
            Ok(ip) => ip,
            Err(_) => return,
        };
        let tcp = match TcpHeader::read_from(&mut cur) {
            Ok(tcp) => tcp,
            Err(_) => return,
        };

        self.template.ip.src = ip.dst;
        self.peer = SocketAddrV4::new(ip.dst.into(), u16::from(tcp.dst_port));
        self.template.tcp.src_port = tcp.dst_port;

        if let Some(HimSocket::PendingTcp(fd)) = self.sock.take() {
            let octets = self.peer.ip().octets();
            let addr = SockaddrIn::new(octets[0], octets[1], octets[2], octets[3], self.peer.port());
            match nix_connect(fd, &addr) {
                Ok(()) => {
                    let stream = unsafe { TcpStream::from_raw_fd(fd) };
                    self.sock = Some(HimSocket::Tcp(stream));
                }
                Err(e) => {
                    debug!("HIM: connect failed: {e}");
                    self.write_error = true;
                    self.sock = Some(HimSocket::PendingTcp(fd));
                }
            }
        }
        self.state = HimConnState::Connected;
        self.push_event(HimEvent::Mss);
    }

    /// `CONNECTED` TCP WRITE carrying a payload, possibly with `FIN`
    /// (spec.md §4.8 fourth/fifth bullets).
    fn handle_tcp_payload(&mut self, iobuf: &[u8], him: HimHeader) {
        let ip_hl_words = 5u32;
        let tcp_off_words = u32::from(self.template.tcp.data_offset_reserved >> 4).max(5);
        let offset = ((ip_hl_words + tcp_off_words) * 4 + 4) as usize;
        let buflen = u16::from(him.buffer_length) as usize;
        let write_len = buflen.saturating_sub(offset).wrapping_add(4);

        {
            let ack = u32::from(self.template.tcp.ack).wrapping_add(write_len as u32);
            self.template.tcp.ack = ack;
        }

        if write_len > 0 && offset < iobuf.len() && self.state == HimConnState::Connected {
            let payload = &iobuf[offset..iobuf.len().min(offset + write_len)];
            let wrote = self.write_payload(payload);
            match wrote {
                Ok(_) => {
                    let window = u16::from(self.template.tcp.window) as u32;
                    let ack_seq = u32::from(self.template.tcp.ack);
                    if window > 0 && (window - (ack_seq % window)) < (write_len as u32 + 4096) {
                        self.push_event(HimEvent::Ack);
                    }
                }
                Err(e) => {
                    debug!("HIM: write failed: {e}");
                    self.write_error = true;
                }
            }
        }

        let tcp_flags_byte = iobuf
            .get(HIM_HEADER_LEN + (ip_hl_words as usize) * 4 + 13)
            .copied()
            .unwrap_or(0);
        if tcp_flags_byte & tcp_flags::FIN != 0 {
            if self.state == HimConnState::Connected {
                self.push_event(HimEvent::Fin);
                self.state = HimConnState::Closing;
            }
            self.push_event(HimEvent::Finished);
        }
    }

    fn write_payload(&mut self, payload: &[u8]) -> io::Result<usize> {
        match self.sock.as_mut() {
            Some(HimSocket::Tcp(s)) => s.write(payload),
            _ => Err(io::Error::new(io::ErrorKind::NotConnected, "HIM socket not connected")),
        }
    }

    /// `CONNECTED`, UDP WRITE (spec.md §4.8 sixth bullet).
    fn handle_udp_write(&mut self, iobuf: &[u8], him: HimHeader) {
        if u16::from(him.buffer_length) <= 4 {
            return;
        }
        let mut cur = Cursor::new(&iobuf[HIM_HEADER_LEN..]);
        let ip = match IpHeader::read_from(&mut cur) {
            Ok(ip) => ip,
            Err(_) => return,
        };
        let udp = match UdpHeader::read_from(&mut cur) {
            Ok(udp) => udp,
            Err(_) => return,
        };
        let dest = SocketAddrV4::new(ip.dst.into(), u16::from(udp.dst_port));
        self.peer = dest;
        let write_len = (u16::from(him.buffer_length) as usize).saturating_sub(28);
        let payload_off = HIM_HEADER_LEN + IP_HEADER_LEN + UDP_HEADER_LEN;
        let payload = &iobuf[payload_off..iobuf.len().min(payload_off + write_len)];
        match self.sock.as_ref() {
            Some(HimSocket::Udp(s)) => {
                if let Err(e) = s.send_to(payload, dest) {
                    debug!("HIM: sendto failed: {e}");
                    self.write_error = true;
                }
            }
            _ => self.write_error = true,
        }
    }

    /// Process a guest READ (spec.md §4.8, final bullets). Returns the
    /// encoded frame, the unit status, and the byte count actually used
    /// (so the caller can compute residual against the CCW's `count`).
    pub fn handle_read(&mut self, count: u16) -> (Vec<u8>, UnitStatus, usize) {
        let mut status = UnitStatus::ce_de();

        if let Some(event) = self.event_queue.pop_front() {
            let bytes = self.encode_event_frame(event);
            let len = bytes.len();
            return (bytes, status, len);
        }

        if self.state == HimConnState::Closing {
            status |= UnitStatus::UX;
            return (Vec::new(), status, 0);
        }

        let fd = match self.socket_fd() {
            Some(fd) => fd,
            None => {
                status |= UnitStatus::UX;
                return (Vec::new(), status, 0);
            }
        };
        if !poll_readable(fd) {
            status |= UnitStatus::UX;
            return (Vec::new(), status, 0);
        }

        if self.protocol == HimProtocol::Udp {
            let bytes = self.read_udp_frame(count);
            return (bytes.clone(), status, bytes.len());
        }

        if self.passive && self.state == HimConnState::Initialized {
            let bytes = self.accept_and_mss();
            return (bytes.clone(), status, bytes.len());
        }

        if self.state == HimConnState::Connected {
            let (bytes, err_status) = self.read_tcp_payload();
            status |= err_status;
            return (bytes.clone(), status, bytes.len());
        }

        status |= UnitStatus::UX;
        (Vec::new(), status, 0)
    }

    fn encode_event_frame(&mut self, event: HimEvent) -> Vec<u8> {
        match event {
            HimEvent::Config => self.config_reply_bytes.take().unwrap_or_else(|| ConfigReply::failed().encode()),
            HimEvent::Mss => self.build_mss_frame(),
            HimEvent::Ack => self.build_ack_frame(),
            HimEvent::Fin => {
                let bytes = self.build_fin_frame();
                if self.state == HimConnState::Connected {
                    self.state = HimConnState::Closing;
                }
                bytes
            }
            HimEvent::Finished => self.build_finished_frame(),
        }
    }

    fn bump_template(&mut self) {
        self.template.him.buffer_number = self.template.him.buffer_number.wrapping_add(1);
        self.template.ip.id = u16::from(self.template.ip.id).wrapping_add(1);
    }

    /// Mirrors the session's `tn3270` flag onto every outbound HIM header
    /// so a tn3270-tunneled session's frames stay tagged end to end
    /// (spec.md §3 `tn3270`, recovered per SPEC_FULL.md §4.8).
    fn him_flags(&self) -> u8 {
        if self.tn3270 {
            flag_bits::TN3270
        } else {
            0
        }
    }

    fn encode_tcp_template(&self, flags: u8, buffer_length: u16, total_length: u16) -> Vec<u8> {
        let mut out = Vec::new();
        let mut him = self.template.him;
        him.flags = self.him_flags();
        him.buffer_length = buffer_length;
        him.write_to(&mut out).expect("in-memory write");
        let mut ip = self.template.ip;
        ip.total_length = total_length;
        ip.write_to(&mut out).expect("in-memory write");
        let mut tcp = self.template.tcp;
        tcp.flags = flags;
        tcp.write_to(&mut out).expect("in-memory write");
        out
    }

    /// `MSS` event: SYN+MSS-option frame, TTL=max (spec.md §4.8 queue
    /// handling for `MSS`).
    fn build_mss_frame(&mut self) -> Vec<u8> {
        self.bump_template();
        let mut out = Vec::new();
        let mut him = self.template.him;
        him.flags = self.him_flags();
        him.buffer_length = (TCP_HEADER_LEN + 4) as u16;
        him.write_to(&mut out).expect("in-memory write");
        let mut ip = self.template.ip;
        ip.ttl = IP_TTL_MAX;
        ip.total_length = (TCP_HEADER_LEN + 4) as u16;
        ip.write_to(&mut out).expect("in-memory write");
        let mut tcp = self.template.tcp;
        tcp.data_offset_reserved = TCP_DATA_OFFSET_WITH_MSS;
        tcp.flags |= tcp_flags::SYN;
        tcp.write_to(&mut out).expect("in-memory write");
        TcpMssOption::standard().write_to(&mut out).expect("in-memory write");
        debug_assert_eq!(out.len(), HIM_HEADER_LEN + IP_HEADER_LEN + TCP_HEADER_LEN + 4);
        out
    }

    /// `ACK` event: plain 44-byte ack (spec.md §4.8 queue handling for
    /// `ACK`).
    fn build_ack_frame(&mut self) -> Vec<u8> {
        self.bump_template();
        self.encode_tcp_template(tcp_flags::ACK, TCP_HEADER_LEN as u16, TCP_HEADER_LEN as u16)
    }

    /// `FIN` event: ack frame with `FIN` set.
    fn build_fin_frame(&mut self) -> Vec<u8> {
        self.bump_template();
        self.encode_tcp_template(tcp_flags::ACK | tcp_flags::FIN, TCP_HEADER_LEN as u16, TCP_HEADER_LEN as u16)
    }

    /// `FINISHED` event: 4-byte header only, then tear the control block
    /// down (spec.md §4.8 last bullet, §3 lifecycle).
    fn build_finished_frame(&mut self) -> Vec<u8> {
        self.bump_template();
        let mut him = self.template.him;
        him.flags = self.him_flags() | flag_bits::FINISHED;
        him.buffer_length = 0;
        let mut out = Vec::new();
        him.write_to(&mut out).expect("in-memory write");
        self.reset();
        out
    }

    fn read_udp_frame(&mut self, _count: u16) -> Vec<u8> {
        self.bump_template();
        let mut buf = [0u8; MAX_PAYLOAD];
        let (n, from) = match self.sock.as_ref() {
            Some(HimSocket::Udp(s)) => match s.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) => {
                    debug!("HIM: recvfrom failed: {e}");
                    (0, std::net::SocketAddr::V4(self.peer))
                }
            },
            _ => (0, std::net::SocketAddr::V4(self.peer)),
        };
        let from_v4 = match from {
            std::net::SocketAddr::V4(v4) => v4,
            _ => self.peer,
        };

        let mut out = Vec::new();
        let mut him = self.template.him;
        him.flags = self.him_flags();
        him.buffer_length = (n + 28) as u16;
        him.write_to(&mut out).expect("in-memory write");
        let mut ip = self.template.ip;
        ip.total_length = (n + 28) as u16;
        ip.protocol = IPPROTO_UDP;
        ip.src = (*from_v4.ip()).octets();
        ip.write_to(&mut out).expect("in-memory write");
        let udp = UdpHeader {
            src_port: from_v4.port(),
            dst_port: self.template.tcp.dst_port,
            length: (n + 8) as u16,
            checksum: 0,
        };
        udp.write_to(&mut out).expect("in-memory write");
        out.extend_from_slice(&buf[..n]);
        out
    }

    /// `INITIALIZED` passive READ: accept the pending connection, reply
    /// with the MSS frame (spec.md §4.8 third bullet).
    fn accept_and_mss(&mut self) -> Vec<u8> {
        let accepted = match self.sock.take() {
            Some(HimSocket::Listener(listener)) => accept(listener.as_raw_fd())
                .map_err(io::Error::from)
                .map(|fd| unsafe { TcpStream::from_raw_fd(fd) }),
            other => {
                self.sock = other;
                Err(io::Error::new(io::ErrorKind::NotConnected, "no listening socket"))
            }
        };
        match accepted {
            Ok(stream) => {
                if let Ok(peer) = stream.peer_addr() {
                    if let std::net::SocketAddr::V4(v4) = peer {
                        self.template.ip.src = (*v4.ip()).octets();
                        self.template.tcp.src_port = v4.port();
                        self.peer = v4;
                    }
                }
                self.sock = Some(HimSocket::Tcp(stream));
                self.state = HimConnState::Connected;
            }
            Err(e) => {
                debug!("HIM: accept failed: {e}");
                self.write_error = true;
            }
        }
        self.build_mss_frame()
    }

    /// `CONNECTED` READ with no queued event and data available: read up
    /// to 1460 bytes and frame it, or transition on EOF/error (spec.md
    /// §4.8 penultimate bullet).
    fn read_tcp_payload(&mut self) -> (Vec<u8>, UnitStatus) {
        self.bump_template();
        let mut buf = [0u8; MAX_PAYLOAD];
        let result = match self.sock.as_mut() {
            Some(HimSocket::Tcp(s)) => s.read(&mut buf),
            _ => Err(io::Error::new(io::ErrorKind::NotConnected, "HIM socket not connected")),
        };

        match result {
            Ok(0) => {
                self.state = HimConnState::Closing;
                let bytes = self.encode_tcp_template(tcp_flags::ACK | tcp_flags::FIN, TCP_HEADER_LEN as u16, TCP_HEADER_LEN as u16);
                (bytes, UnitStatus::default())
            }
            Ok(n) => {
                {
                    let seq = u32::from(self.template.tcp.seq).wrapping_add(n as u32);
                    self.template.tcp.seq = seq;
                }
                let mut out = self.encode_tcp_template(
                    tcp_flags::ACK | tcp_flags::PUSH,
                    (n + 40) as u16,
                    (n + 40) as u16,
                );
                out.extend_from_slice(&buf[..n]);
                (out, UnitStatus::default())
            }
            Err(e) => {
                debug!("HIM: read failed: {e}");
                let bytes = self.encode_tcp_template(tcp_flags::ACK | tcp_flags::RST, TCP_HEADER_LEN as u16, TCP_HEADER_LEN as u16);
                (bytes, UnitStatus::UC)
            }
        }
    }
}

/// The host's own IPv4 address (spec.md §4.8 "Resolve the host's own
/// IP"). Falls back to loopback when none of the host's interfaces can
/// be resolved, matching the original's tolerant `debug_pf` failure path
/// rather than aborting configuration.
fn local_ipv4_address() -> std::net::Ipv4Addr {
    match std::net::UdpSocket::bind("0.0.0.0:0").and_then(|s| {
        s.connect("8.8.8.8:80")?;
        s.local_addr()
    }) {
        Ok(std::net::SocketAddr::V4(v4)) => *v4.ip(),
        _ => std::net::Ipv4Addr::LOCALHOST,
    }
}

/// `get_socket()`: allocate and bind a socket for TCP or UDP (spec.md
/// §4.8 "Allocate and bind a socket"). Passive TCP sockets are placed in
/// listen immediately.
fn open_socket(protocol: HimProtocol, port: u16, passive: bool) -> nix::Result<(HimSocket, SocketAddrV4)> {
    let socktype = if protocol == HimProtocol::Udp { SockType::Datagram } else { SockType::Stream };
    let fd = socket(AddressFamily::Inet, socktype, SockFlag::empty(), None)?;
    setsockopt(fd, sockopt::ReuseAddr, &true)?;

    let bind_addr = SockaddrIn::new(0, 0, 0, 0, port);
    bind(fd, &bind_addr)?;

    let bound: SockaddrIn = getsockname(fd)?;
    let local = SocketAddrV4::new(bound.ip(), bound.port());

    let sock = match socktype {
        SockType::Datagram => HimSocket::Udp(unsafe { UdpSocket::from_raw_fd(fd) }),
        SockType::Stream if passive => {
            listen(fd, LISTEN_BACKLOG as usize)?;
            HimSocket::Listener(unsafe { TcpListener::from_raw_fd(fd) })
        }
        _ => HimSocket::PendingTcp(fd),
    };
    Ok((sock, local))
}

fn poll_readable(fd: RawFd) -> bool {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    matches!(poll(&mut fds, POLL_TIMEOUT.as_millis() as i32), Ok(n) if n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_state() -> HimState {
        HimState::new(Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn finished_write_enqueues_single_finished_event() {
        let mut st = new_state();
        st.state = HimConnState::Closing;
        let mut buf = Vec::new();
        HimHeader {
            flags: flag_bits::FINISHED,
            buffer_number: 1,
            buffer_length: 0,
        }
        .write_to(&mut buf)
        .unwrap();
        st.handle_write(&buf);
        assert_eq!(st.event_queue.len(), 1);
        assert_eq!(st.event_queue[0], HimEvent::Finished);
    }

    #[test]
    fn rnr_set_then_cleared_round_trips_flag() {
        let mut st = new_state();
        st.state = HimConnState::Connected;
        let mut buf = Vec::new();
        HimHeader {
            flags: flag_bits::RNR,
            buffer_number: 1,
            buffer_length: 0,
        }
        .write_to(&mut buf)
        .unwrap();
        let status = st.handle_write(&buf);
        assert!(status.contains(UnitStatus::UX));
        assert!(st.rnr.load(Ordering::Acquire));
        assert!(!st.watch_sock.load(Ordering::Acquire));

        let mut clear_buf = Vec::new();
        HimHeader {
            flags: 0,
            buffer_number: 1,
            buffer_length: 0,
        }
        .write_to(&mut clear_buf)
        .unwrap();
        st.handle_write(&clear_buf);
        assert!(!st.rnr.load(Ordering::Acquire));
    }

    #[test]
    fn event_queue_never_exceeds_cap() {
        let mut st = new_state();
        for _ in 0..(EVENT_QUEUE_CAP + 4) {
            st.push_event(HimEvent::Ack);
        }
        assert_eq!(st.event_queue.len(), EVENT_QUEUE_CAP);
    }

    #[test]
    fn fin_then_finished_leaves_closing_state() {
        let mut st = new_state();
        st.state = HimConnState::Connected;
        st.protocol = HimProtocol::Tcp;
        st.push_event(HimEvent::Fin);
        st.push_event(HimEvent::Finished);
        assert_eq!(st.event_queue.len(), 2);

        let finished = st.encode_event_frame(HimEvent::Fin);
        assert_eq!(st.state, HimConnState::Closing);
        assert_eq!(finished.len(), HIM_HEADER_LEN + IP_HEADER_LEN + TCP_HEADER_LEN);
    }

    #[test]
    fn finished_frame_resets_control_block() {
        let mut st = new_state();
        st.state = HimConnState::Closing;
        let bytes = st.build_finished_frame();
        assert_eq!(bytes.len(), HIM_HEADER_LEN);
        assert_eq!(st.state, HimConnState::Shutdown);
        assert_eq!(st.event_queue.len(), 0);
    }

    #[test]
    fn tn3270_init_flag_is_mirrored_onto_outbound_frames() {
        use super::super::config::encode_ebcdic;

        let mut st = new_state();
        let config = encode_ebcdic(
            "type=internet protocol=tcp active local_socket=(0,0.0.0.0) \
             foreign_socket=(23,10.0.0.1)",
        );
        let mut buf = Vec::new();
        HimHeader {
            flags: flag_bits::INIT | flag_bits::TN3270,
            buffer_number: 1,
            buffer_length: config.len() as u16,
        }
        .write_to(&mut buf)
        .unwrap();
        buf.extend_from_slice(&config);

        st.handle_write(&buf);
        assert!(st.tn3270);

        let ack = st.build_ack_frame();
        let mut cur = Cursor::new(&ack[..]);
        let him = HimHeader::read_from(&mut cur).unwrap();
        assert!(him.has(flag_bits::TN3270));
    }
}
