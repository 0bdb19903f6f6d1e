//! HIM packet header, IP header, TCP/UDP headers and the config-reply
//! layout -- the on-the-wire contract with the guest (spec.md §3, §6).
//!
//! Design Notes §9 calls for explicit serializers rather than aliasing a
//! host-endian memory layout over the wire bytes. Grounded on
//! `pbs-tape/src/sg_tape.rs`'s `#[repr(C, packed)]` + `#[derive(Endian)]`
//! + `proxmox_io::{ReadExt, WriteExt}` idiom for packed wire structs
//! (`ReadPositionLongPage`, `DataCompressionModePage`): every multi-byte
//! field here is explicitly big-endian on the wire via the same
//! `read_be_value`/`write_be_value` pair, rather than a raw pointer cast.

use std::io::{Read, Write};

use endian_trait::Endian;
use proxmox_io::{ReadExt, WriteExt};

/// Bits carried in the HIM header's flag byte (spec.md §3). Bit numbering
/// is this crate's own choice (Design Notes §9: the original's in-memory
/// bitfield order is an artifact of host endianness, not a wire contract
/// worth preserving).
pub mod flag_bits {
    pub const TN3270: u8 = 0b0000_1000;
    pub const INIT: u8 = 0b0001_0000;
    pub const FINISHED: u8 = 0b0010_0000;
    pub const RNR: u8 = 0b0100_0000;
    pub const URGENT: u8 = 0b1000_0000;
}

/// TCP flag bits (spec.md §6).
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PUSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

/// The 4-byte HIM header preceding every subchannel READ/WRITE buffer
/// (spec.md §3).
#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone, Default)]
pub struct HimHeader {
    pub flags: u8,
    pub buffer_number: u8,
    pub buffer_length: u16,
}

pub const HIM_HEADER_LEN: usize = 4;

impl HimHeader {
    pub fn has(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self, std::io::Error> {
        unsafe { r.read_be_value() }
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), std::io::Error> {
        unsafe { w.write_be_value(*self)? };
        Ok(())
    }
}

/// Minimal IPv4 header, populated per spec.md §6: version 4, IHL 5, a
/// nominal TTL of 58, monotonically increasing `id`.
#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone, Default)]
pub struct IpHeader {
    pub version_ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub id: u16,
    pub flags_frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

pub const IP_HEADER_LEN: usize = 20;
pub const IP_VERSION_IHL: u8 = 0x45; // version 4, IHL 5 (no options)
pub const IP_TTL_NOMINAL: u8 = 58;
pub const IP_TTL_MAX: u8 = 255;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

impl IpHeader {
    pub fn read_from(r: &mut impl Read) -> Result<Self, std::io::Error> {
        unsafe { r.read_be_value() }
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), std::io::Error> {
        unsafe { w.write_be_value(*self)? };
        Ok(())
    }
}

/// TCP header, data offset 5 for ordinary frames, 6 on the MSS-option SYN
/// frame (spec.md §6). The one-slot MSS option is carried separately by
/// [`TcpOption`] since it is absent from most frames.
#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone, Default)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset_reserved: u8,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

pub const TCP_HEADER_LEN: usize = 20;
pub const TCP_DATA_OFFSET_NO_OPTIONS: u8 = 5 << 4;
pub const TCP_DATA_OFFSET_WITH_MSS: u8 = 6 << 4;

impl TcpHeader {
    pub fn read_from(r: &mut impl Read) -> Result<Self, std::io::Error> {
        unsafe { r.read_be_value() }
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), std::io::Error> {
        unsafe { w.write_be_value(*self)? };
        Ok(())
    }
}

/// The TCP maximum-segment-size option, present only on the MSS-carrying
/// SYN frame (spec.md §3, §6: "48 bytes when the TCP MSS option is
/// present").
#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone, Default)]
pub struct TcpMssOption {
    pub kind: u8,
    pub len: u8,
    pub mss: u16,
}

pub const TCP_OPT_MAXSEG: u8 = 2;
pub const TCP_OPT_MAXSEG_LEN: u8 = 4;
pub const MSS_VALUE: u16 = 1460;

impl TcpMssOption {
    pub fn standard() -> Self {
        TcpMssOption {
            kind: TCP_OPT_MAXSEG,
            len: TCP_OPT_MAXSEG_LEN,
            mss: MSS_VALUE,
        }
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), std::io::Error> {
        unsafe { w.write_be_value(*self)? };
        Ok(())
    }
}

/// UDP header (spec.md §3: "32 bytes for UDP").
#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone, Default)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

pub const UDP_HEADER_LEN: usize = 8;

impl UdpHeader {
    pub fn read_from(r: &mut impl Read) -> Result<Self, std::io::Error> {
        unsafe { r.read_be_value() }
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), std::io::Error> {
        unsafe { w.write_be_value(*self)? };
        Ok(())
    }
}

/// EBCDIC "Ok" / "Failed" config-reply status bytes, taken verbatim from
/// the original `him.c`'s hard-coded byte arrays.
pub const CONFIG_OK: [u8; 2] = [0xd6, 0x92];
pub const CONFIG_FAILED: [u8; 6] = [0xc6, 0x81, 0x89, 0x93, 0x85, 0x84];

/// The reply a subchannel's first guest WRITE (carrying the `init` flag)
/// provokes on the following READ (spec.md §3 "Config reply").
#[derive(Debug, Clone)]
pub struct ConfigReply {
    pub him_header: HimHeader,
    /// EBCDIC "Ok" (2 bytes) or "Failed" (left-padded to 2 bytes is wrong
    /// per spec -- "Failed" is 6 bytes, so the payload length differs:
    /// a failed reply carries only the header + the 6-byte status.
    pub ok: bool,
    pub family: u8,
    pub protocol: u8,
    pub local_port: u16,
    pub local_ip: [u8; 4],
    pub remote_port: u16,
    pub remote_ip: [u8; 4],
}

impl ConfigReply {
    pub fn failed() -> Self {
        ConfigReply {
            him_header: HimHeader {
                flags: flag_bits::INIT,
                buffer_number: 1,
                buffer_length: CONFIG_FAILED.len() as u16,
            },
            ok: false,
            family: 0,
            protocol: 0,
            local_port: 0,
            local_ip: [0; 4],
            remote_port: 0,
            remote_ip: [0; 4],
        }
    }

    /// Serialize into the wire bytes a subsequent READ should return
    /// (spec.md §3).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.him_header.write_to(&mut out).expect("in-memory write");
        if self.ok {
            out.extend_from_slice(&CONFIG_OK);
            out.push(self.family);
            out.push(self.protocol);
            out.extend_from_slice(&self.local_port.to_be_bytes());
            out.extend_from_slice(&self.local_ip);
            out.extend_from_slice(&[0, 0]); // two unused bytes
            out.extend_from_slice(&self.remote_port.to_be_bytes());
            out.extend_from_slice(&self.remote_ip);
        } else {
            out.extend_from_slice(&CONFIG_FAILED);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn him_header_roundtrip() {
        let h = HimHeader {
            flags: flag_bits::INIT | flag_bits::URGENT,
            buffer_number: 3,
            buffer_length: 0x1234,
        };
        let mut buf = Vec::new();
        h.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HIM_HEADER_LEN);
        // buffer_length is big-endian on the wire.
        assert_eq!(&buf[2..4], &[0x12, 0x34]);

        let mut cur = Cursor::new(buf);
        let back = HimHeader::read_from(&mut cur).unwrap();
        assert_eq!({ back.buffer_length }, 0x1234);
        assert!(back.has(flag_bits::INIT));
        assert!(back.has(flag_bits::URGENT));
        assert!(!back.has(flag_bits::RNR));
    }

    #[test]
    fn ip_header_is_20_bytes_on_the_wire() {
        let ip = IpHeader {
            version_ihl: IP_VERSION_IHL,
            ttl: IP_TTL_NOMINAL,
            protocol: IPPROTO_TCP,
            id: 1,
            ..Default::default()
        };
        let mut buf = Vec::new();
        ip.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), IP_HEADER_LEN);
        assert_eq!(buf[0], IP_VERSION_IHL);
    }

    #[test]
    fn tcp_header_is_20_bytes_plain_44_with_ip_plus_him() {
        let tcp = TcpHeader {
            data_offset_reserved: TCP_DATA_OFFSET_NO_OPTIONS,
            flags: tcp_flags::ACK,
            window: 24 * 1024,
            ..Default::default()
        };
        let mut buf = Vec::new();
        tcp.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), TCP_HEADER_LEN);
        assert_eq!(HIM_HEADER_LEN + IP_HEADER_LEN + TCP_HEADER_LEN, 44);
    }

    #[test]
    fn udp_total_is_32_bytes() {
        assert_eq!(HIM_HEADER_LEN + IP_HEADER_LEN + UDP_HEADER_LEN, 32);
    }

    #[test]
    fn mss_option_brings_tcp_frame_to_48() {
        assert_eq!(HIM_HEADER_LEN + IP_HEADER_LEN + TCP_HEADER_LEN + 4, 48);
    }

    #[test]
    fn config_reply_ok_matches_original_ebcdic_bytes() {
        let reply = ConfigReply {
            him_header: HimHeader {
                flags: flag_bits::INIT,
                buffer_number: 1,
                buffer_length: 18,
            },
            ok: true,
            family: 1,
            protocol: IPPROTO_TCP,
            local_port: 23,
            local_ip: [10, 0, 0, 1],
            remote_port: 0,
            remote_ip: [0, 0, 0, 0],
        };
        let bytes = reply.encode();
        assert_eq!(&bytes[4..6], &CONFIG_OK);
    }

    #[test]
    fn config_reply_failed_carries_six_byte_ebcdic_status() {
        let bytes = ConfigReply::failed().encode();
        assert_eq!(&bytes[4..10], &CONFIG_FAILED);
    }
}
