use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use bytes::{BufMut, BytesMut};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::{ProxyError, Result};

/// SOCKS 地址类型
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Maximum serialized size of a SOCKS address: ATYP + len + domain + port.
pub const MAX_ADDR_LEN: usize = 1 + 1 + 255 + 2;

/// 代理目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// 解析 "host:port" 字符串
    ///
    /// An IPv4 or IPv6 host maps to the matching ATYP on the wire;
    /// everything else is carried as a length-prefixed domain.
    pub fn parse_host_port(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(addr));
        }
        let (host, port_str) = s.rsplit_once(':').ok_or(ProxyError::BadAddress)?;
        let port: u16 = port_str.parse().map_err(|_| ProxyError::BadAddress)?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Address::Ip(SocketAddr::new(ip, port)));
        }
        if host.is_empty() || host.len() > 255 {
            return Err(ProxyError::BadAddress);
        }
        Ok(Address::Domain(host.to_string(), port))
    }

    /// 编码为 SOCKS 地址格式
    /// [ATYP: 1B] [ADDR: 变长] [PORT: 2B big-endian]
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Domain(domain, _) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
        buf.put_u16(self.port());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MAX_ADDR_LEN);
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Serialized wire length: 1 + body + 2.
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// 从字节流前缀解析 SOCKS 地址，返回 (地址, 消耗字节数)
    pub fn split_from(b: &[u8]) -> Result<(Self, usize)> {
        if b.is_empty() {
            return Err(ProxyError::BadAddress);
        }
        match b[0] {
            ATYP_IPV4 => {
                let need = 1 + 4 + 2;
                if b.len() < need {
                    return Err(ProxyError::BadAddress);
                }
                let ip = Ipv4Addr::new(b[1], b[2], b[3], b[4]);
                let port = u16::from_be_bytes([b[5], b[6]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)), need))
            }
            ATYP_IPV6 => {
                let need = 1 + 16 + 2;
                if b.len() < need {
                    return Err(ProxyError::BadAddress);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&b[1..17]);
                let port = u16::from_be_bytes([b[17], b[18]]);
                Ok((
                    Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    need,
                ))
            }
            ATYP_DOMAIN => {
                if b.len() < 2 {
                    return Err(ProxyError::BadAddress);
                }
                let len = b[1] as usize;
                if len == 0 {
                    return Err(ProxyError::BadAddress);
                }
                let need = 1 + 1 + len + 2;
                if b.len() < need {
                    return Err(ProxyError::BadAddress);
                }
                let domain = std::str::from_utf8(&b[2..2 + len])
                    .map_err(|_| ProxyError::BadAddress)?
                    .to_string();
                let port = u16::from_be_bytes([b[2 + len], b[3 + len]]);
                Ok((Address::Domain(domain, port), need))
            }
            _ => Err(ProxyError::BadAddress),
        }
    }

    /// Read just enough bytes from `r` to get a valid address.
    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = r.read_u8().await?;
        match atyp {
            ATYP_IPV4 => {
                let mut b = [0u8; 4 + 2];
                r.read_exact(&mut b).await?;
                let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                let port = u16::from_be_bytes([b[4], b[5]]);
                Ok(Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            ATYP_IPV6 => {
                let mut b = [0u8; 16 + 2];
                r.read_exact(&mut b).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&b[..16]);
                let port = u16::from_be_bytes([b[16], b[17]]);
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            ATYP_DOMAIN => {
                let len = r.read_u8().await? as usize;
                if len == 0 {
                    return Err(ProxyError::BadAddress);
                }
                let mut b = vec![0u8; len + 2];
                r.read_exact(&mut b).await?;
                let domain = std::str::from_utf8(&b[..len])
                    .map_err(|_| ProxyError::BadAddress)?
                    .to_string();
                let port = u16::from_be_bytes([b[len], b[len + 1]]);
                Ok(Address::Domain(domain, port))
            }
            _ => Err(ProxyError::BadAddress),
        }
    }

    /// DNS 解析为 SocketAddr
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(domain, port) => {
                let addr_str = format!("{}:{}", domain, port);
                let resolved = tokio::task::spawn_blocking(move || addr_str.to_socket_addrs())
                    .await
                    .map_err(|e| ProxyError::Io(std::io::Error::other(e)))??
                    .next()
                    .ok_or(ProxyError::BadAddress)?;
                Ok(resolved)
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Address::parse_host_port(&s)
            .map_err(|_| serde::de::Error::custom(format!("invalid address: {}", s)))
    }
}
