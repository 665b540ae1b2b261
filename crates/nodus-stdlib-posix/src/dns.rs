//! DNS module
//!
//! `lookup` goes through the system resolver (`getaddrinfo` via std).
//! `reverse` consults `/etc/hosts` first and then sends a PTR query over UDP to
//! the first `nameserver` in `/etc/resolv.conf`.

use nodus_engine::{Event, LoopError, LoopHandle, Logger, Logging};
use nodus_sdk::{CallbackRef, ErrorValue, Value};

use std::fmt;
use std::io;
use std::net::{IpAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Error code for names that did not resolve
pub const ENOTFOUND: &str = "ENOTFOUND";

const HOSTS_FILE: &str = "/etc/hosts";
const RESOLV_CONF: &str = "/etc/resolv.conf";
const FALLBACK_RESOLVER: &str = "8.8.8.8";
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Address family filter for `lookup`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// First address of either family
    Any,
    /// IPv4 only
    V4,
    /// IPv6 only
    V6,
}

impl Family {
    /// Map the script's `family` option (0, 4 or 6)
    pub fn from_number(family: u32) -> Option<Self> {
        match family {
            0 => Some(Family::Any),
            4 => Some(Family::V4),
            6 => Some(Family::V6),
            _ => None,
        }
    }

    fn accepts(self, addr: &IpAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

fn family_number(addr: &IpAddr) -> u32 {
    if addr.is_ipv4() {
        4
    } else {
        6
    }
}

/// Resolve `host` to its first address of `family`
pub fn resolve(host: &str, family: Family) -> io::Result<IpAddr> {
    (host, 0u16)
        .to_socket_addrs()?
        .map(|sa| sa.ip())
        .find(|ip| family.accepts(ip))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} has no matching address", host)))
}

/// Host names for `addr`: `/etc/hosts` first, then a PTR query
pub fn reverse_names(addr: IpAddr) -> io::Result<Vec<String>> {
    if let Ok(contents) = std::fs::read_to_string(HOSTS_FILE) {
        let names = hosts_names(&contents, addr);
        if !names.is_empty() {
            return Ok(names);
        }
    }
    let response = wire::query(&system_resolver(), &wire::ptr_name(addr), wire::TYPE_PTR)?;
    wire::ptr_answers(&response)
}

/// Names listed for `addr` in hosts-file `contents`
pub fn hosts_names(contents: &str, addr: IpAddr) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let ip: IpAddr = fields.next()?.parse().ok()?;
            (ip == addr).then(|| fields.map(str::to_string).collect::<Vec<_>>())
        })
        .flatten()
        .collect()
}

/// First `nameserver` in resolv.conf, or a public fallback
fn system_resolver() -> String {
    std::fs::read_to_string(RESOLV_CONF)
        .ok()
        .and_then(|contents| {
            contents.lines().find_map(|line| {
                let mut fields = line.split_whitespace();
                match (fields.next(), fields.next()) {
                    (Some("nameserver"), Some(addr)) => Some(addr.to_string()),
                    _ => None,
                }
            })
        })
        .unwrap_or_else(|| FALLBACK_RESOLVER.to_string())
}

// ============================================================================
// Dns
// ============================================================================

/// DNS functions bound to one loop
#[derive(Clone)]
pub struct Dns {
    handle: LoopHandle,
    log: Logger,
}

impl Dns {
    /// Create the dns functions for the loop behind `handle`
    pub fn new(handle: LoopHandle, logging: &Logging) -> Self {
        Self {
            handle,
            log: logging.get("dns"),
        }
    }

    /// `dns.lookup(host, family, cb)` answers `cb(null, address, family)`
    pub fn lookup(&self, host: impl Into<String>, family: Family, callback: CallbackRef) -> Result<(), LoopError> {
        let host = host.into();
        let handle = self.handle.clone();
        let log = self.log.clone();
        self.handle.submit(move || {
            let event = match resolve(&host, family) {
                Ok(addr) => {
                    log.trace(format_args!("{} -> {}", host, addr));
                    let args = vec![
                        Value::Null,
                        Value::from(addr.to_string()),
                        Value::from(family_number(&addr)),
                    ];
                    Event::new("dns.address", callback, args)
                }
                Err(e) => {
                    log.debug(format_args!("lookup {} failed: {}", host, e));
                    let error = ErrorValue::new(ENOTFOUND, format!("getaddrinfo ENOTFOUND {}", host))
                        .with_syscall("getaddrinfo");
                    Event::new("dns.address.error", callback, vec![Value::Error(error)])
                }
            };
            handle.post(event);
        })?;
        Ok(())
    }

    /// `dns.reverse(address, cb)` answers `cb(null, [hostnames])`
    pub fn reverse(&self, address: impl Into<String>, callback: CallbackRef) -> Result<(), LoopError> {
        let address = address.into();
        let handle = self.handle.clone();
        let log = self.log.clone();
        self.handle.submit(move || {
            let result = address
                .parse::<IpAddr>()
                .map_err(|_| ErrorValue::new("EINVAL", format!("invalid IP address: {}", address)))
                .and_then(|addr| match reverse_names(addr) {
                    Ok(names) if !names.is_empty() => Ok(names),
                    Ok(_) => Err(ErrorValue::new(ENOTFOUND, format!("getHostByAddr ENOTFOUND {}", address))),
                    Err(e) => {
                        log.debug(format_args!("reverse {} failed: {}", address, e));
                        Err(ErrorValue::from_io(&e, "getHostByAddr"))
                    }
                });
            let event = match result {
                Ok(names) => Event::new("dns.host", callback, vec![Value::Null, Value::from(names)]),
                Err(error) => Event::new(
                    "dns.host.error",
                    callback,
                    vec![Value::Error(error.with_syscall("getHostByAddr"))],
                ),
            };
            handle.post(event);
        })?;
        Ok(())
    }
}

impl fmt::Debug for Dns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dns").field("loop", &self.handle.instance()).finish()
    }
}

// ============================================================================
// Wire format
// ============================================================================

mod wire {
    use super::*;

    pub(super) const TYPE_PTR: u16 = 12;
    const CLASS_IN: u16 = 1;
    const HEADER_LEN: usize = 12;
    const MAX_POINTER_HOPS: usize = 16;

    fn malformed(what: &str) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, format!("malformed DNS response: {}", what))
    }

    /// `in-addr.arpa` / `ip6.arpa` name for `addr`
    pub(super) fn ptr_name(addr: IpAddr) -> String {
        match addr {
            IpAddr::V4(v4) => {
                let [a, b, c, d] = v4.octets();
                format!("{}.{}.{}.{}.in-addr.arpa", d, c, b, a)
            }
            IpAddr::V6(v6) => {
                let mut name = String::with_capacity(72);
                for byte in v6.octets().iter().rev() {
                    name.push_str(&format!("{:x}.{:x}.", byte & 0x0f, byte >> 4));
                }
                name.push_str("ip6.arpa");
                name
            }
        }
    }

    fn transaction_id() -> u16 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        (nanos ^ (nanos >> 16)) as u16
    }

    /// Recursive query for `name`/`qtype`
    pub(super) fn encode_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + name.len() + 6);
        packet.extend_from_slice(&id.to_be_bytes());
        packet.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
        for count in [1u16, 0, 0, 0] {
            packet.extend_from_slice(&count.to_be_bytes());
        }
        for label in name.split('.').filter(|l| !l.is_empty()) {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0);
        packet.extend_from_slice(&qtype.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
        packet
    }

    pub(super) fn query(resolver: &str, name: &str, qtype: u16) -> io::Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(QUERY_TIMEOUT))?;
        socket.set_write_timeout(Some(QUERY_TIMEOUT))?;
        socket.send_to(&encode_query(transaction_id(), name, qtype), (resolver, 53))?;

        let mut buf = vec![0u8; 4096];
        let len = socket.recv(&mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    struct Reader<'a> {
        data: &'a [u8],
        pos: usize,
    }

    impl<'a> Reader<'a> {
        fn u8(&mut self) -> io::Result<u8> {
            let b = *self.data.get(self.pos).ok_or_else(|| malformed("truncated"))?;
            self.pos += 1;
            Ok(b)
        }

        fn u16(&mut self) -> io::Result<u16> {
            Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
        }

        fn skip(&mut self, n: usize) -> io::Result<()> {
            if self.pos + n > self.data.len() {
                return Err(malformed("truncated"));
            }
            self.pos += n;
            Ok(())
        }

        /// Read a possibly compressed name; the cursor ends after the first
        /// pointer or the terminating zero label
        fn name(&mut self) -> io::Result<String> {
            let mut labels: Vec<String> = Vec::new();
            let mut pos = self.pos;
            let mut resume = None;
            let mut hops = 0;
            loop {
                let len = *self.data.get(pos).ok_or_else(|| malformed("name"))? as usize;
                if len == 0 {
                    pos += 1;
                    break;
                }
                if len & 0xc0 == 0xc0 {
                    let low = *self.data.get(pos + 1).ok_or_else(|| malformed("pointer"))? as usize;
                    hops += 1;
                    if hops > MAX_POINTER_HOPS {
                        return Err(malformed("pointer loop"));
                    }
                    resume.get_or_insert(pos + 2);
                    pos = ((len & 0x3f) << 8) | low;
                    continue;
                }
                let label = self
                    .data
                    .get(pos + 1..pos + 1 + len)
                    .ok_or_else(|| malformed("label"))?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + len;
            }
            self.pos = resume.unwrap_or(pos);
            Ok(labels.join("."))
        }
    }

    /// PTR target names in the answer section of `response`
    pub(super) fn ptr_answers(response: &[u8]) -> io::Result<Vec<String>> {
        if response.len() < HEADER_LEN {
            return Err(malformed("short header"));
        }
        let mut reader = Reader { data: response, pos: 4 };
        let questions = reader.u16()?;
        let answers = reader.u16()?;
        reader.pos = HEADER_LEN;

        for _ in 0..questions {
            reader.name()?;
            reader.skip(4)?;
        }

        let mut names = Vec::new();
        for _ in 0..answers {
            reader.name()?;
            let rtype = reader.u16()?;
            reader.skip(6)?; // class + ttl
            let rdlength = reader.u16()? as usize;
            let end = reader.pos + rdlength;
            if rtype == TYPE_PTR {
                names.push(reader.name()?);
            }
            if end > response.len() {
                return Err(malformed("rdata"));
            }
            reader.pos = end;
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_ptr_names() {
        assert_eq!(
            wire::ptr_name(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))),
            "10.2.0.192.in-addr.arpa"
        );
        let v6 = wire::ptr_name(IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert!(v6.starts_with("1.0.0.0."));
        assert!(v6.ends_with(".0.ip6.arpa"));
        assert_eq!(v6.split('.').count(), 34);
    }

    #[test]
    fn test_ptr_answer_with_compression() {
        let name = "10.2.0.192.in-addr.arpa";
        let mut packet = wire::encode_query(0x1234, name, wire::TYPE_PTR);
        // Turn the query into a response with one answer
        packet[2] = 0x81;
        packet[7] = 1;
        packet.extend_from_slice(&[0xc0, 0x0c]); // name -> question
        packet.extend_from_slice(&wire::TYPE_PTR.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&300u32.to_be_bytes());
        let rdata: Vec<u8> = [&[4u8][..], b"host", &[7], b"example", &[0]].concat();
        packet.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        packet.extend_from_slice(&rdata);

        assert_eq!(wire::ptr_answers(&packet).unwrap(), vec!["host.example"]);
    }

    #[test]
    fn test_truncated_response_is_error() {
        assert!(wire::ptr_answers(&[0u8; 5]).is_err());
        let mut packet = wire::encode_query(1, "a.b", wire::TYPE_PTR);
        packet[7] = 1;
        assert!(wire::ptr_answers(&packet).is_err());
    }

    #[test]
    fn test_hosts_names() {
        let hosts = "# comment\n127.0.0.1 localhost loopback # trailing\n::1 localhost6\n10.0.0.1 other\n";
        assert_eq!(
            hosts_names(hosts, "127.0.0.1".parse().unwrap()),
            vec!["localhost", "loopback"]
        );
        assert_eq!(hosts_names(hosts, "::1".parse().unwrap()), vec!["localhost6"]);
        assert!(hosts_names(hosts, "10.9.9.9".parse().unwrap()).is_empty());
    }

    #[test]
    fn test_family() {
        assert_eq!(Family::from_number(0), Some(Family::Any));
        assert_eq!(Family::from_number(6), Some(Family::V6));
        assert_eq!(Family::from_number(5), None);
        assert!(!Family::V4.accepts(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }
}
