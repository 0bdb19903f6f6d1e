//! HIM configuration-string parser: the EBCDIC-encoded grammar the guest
//! sends on a subchannel's first init WRITE (spec.md §4.8, §6).
//!
//! Grounded on `pbs-tape/src/linux_list_drives.rs`'s small hand-rolled
//! line-parsing style. The EBCDIC conversion table itself has no teacher
//! analogue -- PBS never talks to an EBCDIC host -- so it is an original
//! addition (CP037, verified against the original `him.c`'s hard-coded
//! `Ok`/`Failed` byte literals, see [`crate::him::header::CONFIG_OK`]).

use crate::error::HimConfigError;

/// CP037 EBCDIC -> ASCII decode table, assigned code points only (the
/// remainder pass through unchanged -- this module only ever needs to
/// decode the printable subset the guest's configuration-string grammar
/// uses: letters, digits, and `= ( ) , . _`).
const E2A: [(u8, u8); 76] = [
    (0x40, b' '),
    (0x4B, b'.'),
    (0x4D, b'('),
    (0x4E, b'+'),
    (0x50, b'&'),
    (0x5A, b'!'),
    (0x5B, b'$'),
    (0x5C, b'*'),
    (0x5D, b')'),
    (0x5E, b';'),
    (0x60, b'-'),
    (0x61, b'/'),
    (0x6B, b','),
    (0x6C, b'%'),
    (0x6D, b'_'),
    (0x6E, b'>'),
    (0x6F, b'?'),
    (0x7A, b':'),
    (0x7B, b'#'),
    (0x7C, b'@'),
    (0x7D, b'\''),
    (0x7E, b'='),
    (0x7F, b'"'),
    (0x81, b'a'),
    (0x82, b'b'),
    (0x83, b'c'),
    (0x84, b'd'),
    (0x85, b'e'),
    (0x86, b'f'),
    (0x87, b'g'),
    (0x88, b'h'),
    (0x89, b'i'),
    (0x91, b'j'),
    (0x92, b'k'),
    (0x93, b'l'),
    (0x94, b'm'),
    (0x95, b'n'),
    (0x96, b'o'),
    (0x97, b'p'),
    (0x98, b'q'),
    (0x99, b'r'),
    (0xA1, b'~'),
    (0xA2, b's'),
    (0xA3, b't'),
    (0xA4, b'u'),
    (0xA5, b'v'),
    (0xA6, b'w'),
    (0xA7, b'x'),
    (0xA8, b'y'),
    (0xA9, b'z'),
    (0xC0, b'{'),
    (0xC1, b'A'),
    (0xC2, b'B'),
    (0xC3, b'C'),
    (0xC4, b'D'),
    (0xC5, b'E'),
    (0xC6, b'F'),
    (0xC7, b'G'),
    (0xC8, b'H'),
    (0xC9, b'I'),
    (0xD0, b'}'),
    (0xD1, b'J'),
    (0xD2, b'K'),
    (0xD3, b'L'),
    (0xD4, b'M'),
    (0xD5, b'N'),
    (0xD6, b'O'),
    (0xD7, b'P'),
    (0xD8, b'Q'),
    (0xD9, b'R'),
    (0xE0, b'\\'),
    (0xE2, b'S'),
    (0xE3, b'T'),
    (0xE4, b'U'),
    (0xE5, b'V'),
    (0xE6, b'W'),
    (0xE7, b'X'),
    (0xE8, b'Y'),
];

/// Decode one EBCDIC byte to ASCII; bytes outside the table pass through
/// unchanged (only matters for digits, which are `0xF0..=0xF9` and handled
/// separately below since they are contiguous).
pub fn ebcdic_byte_to_ascii(b: u8) -> u8 {
    if (0xF0..=0xF9).contains(&b) {
        return b'0' + (b - 0xF0);
    }
    for &(e, a) in E2A.iter() {
        if e == b {
            return a;
        }
    }
    b
}

/// Encode one ASCII byte to EBCDIC; the inverse of [`ebcdic_byte_to_ascii`]
/// over the same table, plus the digit range.
pub fn ascii_byte_to_ebcdic(b: u8) -> u8 {
    if b.is_ascii_digit() {
        return 0xF0 + (b - b'0');
    }
    for &(e, a) in E2A.iter() {
        if a == b {
            return e;
        }
    }
    b
}

pub fn decode_ebcdic(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| ebcdic_byte_to_ascii(b) as char).collect()
}

pub fn encode_ebcdic(s: &str) -> Vec<u8> {
    s.bytes().map(ascii_byte_to_ebcdic).collect()
}

/// Transport protocol named by the configuration string (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigProtocol {
    Tcp,
    Udp,
}

/// A parsed `(port,a.b.c.d)` socket token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketSpec {
    pub port: u16,
    pub ip: [u8; 4],
}

/// Parsed form of the guest's configuration string (spec.md §3, §4.8,
/// §6): `type=… protocol={tcp|udp} {active|passive}
/// local_socket=(port,a.b.c.d) foreign_socket=(…) [server]`.
#[derive(Debug, Clone)]
pub struct ParsedConfig {
    pub protocol: ConfigProtocol,
    pub passive: bool,
    pub server: bool,
    pub local_socket: Option<SocketSpec>,
    pub foreign_socket: Option<SocketSpec>,
}

impl Default for ParsedConfig {
    fn default() -> Self {
        ParsedConfig {
            protocol: ConfigProtocol::Tcp,
            passive: false,
            server: false,
            local_socket: None,
            foreign_socket: None,
        }
    }
}

fn parse_socket_spec(rhs: &str) -> Result<SocketSpec, HimConfigError> {
    let inner = rhs
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| HimConfigError::Malformed(format!("expected (port,a.b.c.d): {rhs:?}")))?;
    let mut parts = inner.split(',');
    let port: u16 = parts
        .next()
        .ok_or_else(|| HimConfigError::Malformed("missing port".into()))?
        .trim()
        .parse()
        .map_err(|_| HimConfigError::Malformed(format!("bad port in {rhs:?}")))?;
    let mut ip = [0u8; 4];
    for slot in ip.iter_mut() {
        *slot = parts
            .next()
            .ok_or_else(|| HimConfigError::Malformed(format!("incomplete IP address in {rhs:?}")))?
            .trim()
            .parse()
            .map_err(|_| HimConfigError::Malformed(format!("bad IP octet in {rhs:?}")))?;
    }
    Ok(SocketSpec { port, ip })
}

/// Parse an EBCDIC-encoded configuration string (spec.md §4.8). The
/// string is decoded to ASCII and lower-cased before tokenizing, matching
/// the original's `tolower(guest_to_host(...))` pass.
pub fn parse_config_string(ebcdic: &[u8]) -> Result<ParsedConfig, HimConfigError> {
    let ascii = decode_ebcdic(ebcdic).to_ascii_lowercase();
    let mut cfg = ParsedConfig::default();

    let mut tokens = ascii.split(|c: char| c.is_whitespace()).filter(|s| !s.is_empty());
    while let Some(tok) = tokens.next() {
        let (lhs, inline_rhs) = match tok.split_once('=') {
            Some((l, r)) if !r.is_empty() => (l, Some(r)),
            _ => (tok, None),
        };
        match lhs {
            "type" => {
                if inline_rhs.is_none() {
                    tokens.next();
                }
            }
            "protocol" => {
                let rhs = inline_rhs.map(str::to_string).or_else(|| tokens.next().map(str::to_string));
                let rhs = rhs.ok_or_else(|| HimConfigError::Malformed("protocol= requires a value".into()))?;
                cfg.protocol = if rhs == "udp" { ConfigProtocol::Udp } else { ConfigProtocol::Tcp };
            }
            "active" => cfg.passive = false,
            "passive" => cfg.passive = true,
            "server" => cfg.server = true,
            "local_socket" | "foreign_socket" => {
                let rhs = inline_rhs.map(str::to_string).or_else(|| tokens.next().map(str::to_string));
                let rhs = rhs.ok_or_else(|| HimConfigError::Malformed(format!("{lhs}= requires a value")))?;
                let spec = parse_socket_spec(&rhs)?;
                if lhs == "local_socket" {
                    cfg.local_socket = Some(spec);
                } else {
                    cfg.foreign_socket = Some(spec);
                }
            }
            other => return Err(HimConfigError::UnknownToken(other.to_string())),
        }
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ebcdic_ok_roundtrips() {
        assert_eq!(decode_ebcdic(&crate::him::header::CONFIG_OK), "Ok");
        assert_eq!(encode_ebcdic("Ok"), crate::him::header::CONFIG_OK);
    }

    #[test]
    fn ebcdic_failed_roundtrips() {
        assert_eq!(decode_ebcdic(&crate::him::header::CONFIG_FAILED), "Failed");
        assert_eq!(encode_ebcdic("Failed"), crate::him::header::CONFIG_FAILED);
    }

    #[test]
    fn scenario_happy_path_tcp_config_string() {
        let ascii = "type=internet protocol=tcp active local_socket=(0,0.0.0.0) \
                     foreign_socket=(23,10.0.0.1)";
        let ebcdic = encode_ebcdic(ascii);
        let cfg = parse_config_string(&ebcdic).unwrap();
        assert_eq!(cfg.protocol, ConfigProtocol::Tcp);
        assert!(!cfg.passive);
        assert!(!cfg.server);
        assert_eq!(cfg.local_socket.unwrap().port, 0);
        let foreign = cfg.foreign_socket.unwrap();
        assert_eq!(foreign.port, 23);
        assert_eq!(foreign.ip, [10, 0, 0, 1]);
    }

    #[test]
    fn passive_udp_server_config() {
        let ascii = "type=internet protocol=udp passive server local_socket=(161,0.0.0.0)";
        let cfg = parse_config_string(&encode_ebcdic(ascii)).unwrap();
        assert_eq!(cfg.protocol, ConfigProtocol::Udp);
        assert!(cfg.passive);
        assert!(cfg.server);
    }

    #[test]
    fn unknown_token_is_rejected() {
        let ascii = "type=internet bogus=1";
        assert!(parse_config_string(&encode_ebcdic(ascii)).is_err());
    }
}
