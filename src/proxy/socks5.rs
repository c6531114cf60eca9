//! SOCKS5 protocol (RFC 1928) with username/password auth (RFC 1929).
//!
//! Record types mirror the wire packets; the [`Socks5Server`] drives the
//! server side of the handshake up to the point where a target address is
//! known. Replying to the client happens after the dial, so the reply can
//! carry the real outcome.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::common::addr::Address;
use crate::common::error::{ProxyError, Result};

/// SOCKS 协议版本
pub const VER: u8 = 0x05;
/// Username/password sub-negotiation version
pub const USERPASS_VER: u8 = 0x01;

pub const METHOD_NONE: u8 = 0x00;
pub const METHOD_USERPASS: u8 = 0x02;
pub const METHOD_UNSUPPORTED: u8 = 0xFF;

pub const USERPASS_SUCCESS: u8 = 0x00;
pub const USERPASS_FAILURE: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_SERVER_FAILURE: u8 = 0x01;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// The negotiation request packet
#[derive(Debug)]
pub struct NegotiationRequest {
    pub ver: u8,
    pub methods: Vec<u8>,
}

impl NegotiationRequest {
    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 2];
        r.read_exact(&mut head).await?;
        if head[0] != VER {
            return Err(ProxyError::BadVersion(head[0]));
        }
        if head[1] == 0 {
            return Err(ProxyError::BadRequest);
        }
        let mut methods = vec![0u8; head[1] as usize];
        r.read_exact(&mut methods).await?;
        Ok(Self {
            ver: head[0],
            methods,
        })
    }
}

/// The negotiation reply packet
#[derive(Debug)]
pub struct NegotiationReply {
    pub ver: u8,
    pub method: u8,
}

impl NegotiationReply {
    pub fn new(method: u8) -> Self {
        Self { ver: VER, method }
    }

    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&[self.ver, self.method]).await?;
        Ok(())
    }
}

/// The username/password sub-negotiation request packet
#[derive(Debug)]
pub struct UserPassRequest {
    pub ver: u8,
    pub uname: Vec<u8>,
    pub passwd: Vec<u8>,
}

impl UserPassRequest {
    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 2];
        r.read_exact(&mut head).await?;
        if head[0] != USERPASS_VER {
            return Err(ProxyError::BadRequest);
        }
        let ulen = head[1] as usize;
        if ulen == 0 {
            return Err(ProxyError::BadRequest);
        }
        let mut uname = vec![0u8; ulen];
        r.read_exact(&mut uname).await?;

        let plen = r.read_u8().await? as usize;
        if plen == 0 {
            return Err(ProxyError::BadRequest);
        }
        let mut passwd = vec![0u8; plen];
        r.read_exact(&mut passwd).await?;

        Ok(Self {
            ver: head[0],
            uname,
            passwd,
        })
    }
}

/// The username/password sub-negotiation reply packet
#[derive(Debug)]
pub struct UserPassReply {
    pub ver: u8,
    pub status: u8,
}

impl UserPassReply {
    pub fn new(status: u8) -> Self {
        Self {
            ver: USERPASS_VER,
            status,
        }
    }

    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&[self.ver, self.status]).await?;
        Ok(())
    }
}

/// The request packet
#[derive(Debug)]
pub struct Request {
    pub ver: u8,
    pub cmd: u8,
    pub addr: Address,
}

impl Request {
    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 3];
        r.read_exact(&mut head).await?;
        if head[0] != VER {
            return Err(ProxyError::BadVersion(head[0]));
        }
        // head[2] is RSV
        let addr = Address::read_from(r).await?;
        Ok(Self {
            ver: head[0],
            cmd: head[1],
            addr,
        })
    }
}

/// The reply packet: [VER, REP, RSV, ATYP, BND.ADDR, BND.PORT]
#[derive(Debug)]
pub struct Reply {
    pub rep: u8,
    pub bnd: Address,
}

impl Reply {
    pub fn success(bnd: SocketAddr) -> Self {
        Self {
            rep: REP_SUCCESS,
            bnd: Address::Ip(bnd),
        }
    }

    /// Error reply with a zeroed IPv4 bind address.
    pub fn error(rep: u8) -> Self {
        Self {
            rep,
            bnd: Address::Ip(SocketAddr::new(
                std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                0,
            )),
        }
    }

    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = bytes::BytesMut::with_capacity(4 + 18);
        buf.extend_from_slice(&[VER, self.rep, 0x00]);
        self.bnd.encode(&mut buf);
        w.write_all(&buf).await?;
        Ok(())
    }
}

/// Map a dial failure onto the closest SOCKS reply code.
pub fn rep_for_dial_error(e: &ProxyError) -> u8 {
    match e {
        ProxyError::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
            std::io::ErrorKind::HostUnreachable => REP_HOST_UNREACHABLE,
            std::io::ErrorKind::NetworkUnreachable => REP_NETWORK_UNREACHABLE,
            std::io::ErrorKind::TimedOut => REP_TTL_EXPIRED,
            _ => REP_HOST_UNREACHABLE,
        },
        ProxyError::Timeout => REP_TTL_EXPIRED,
        ProxyError::BadAddress => REP_ADDRESS_NOT_SUPPORTED,
        _ => REP_SERVER_FAILURE,
    }
}

/// The UDP datagram packet: [RSV(2), FRAG, ATYP, DST.ADDR, DST.PORT, DATA]
#[derive(Debug, PartialEq)]
pub struct Datagram {
    pub frag: u8,
    pub addr: Address,
    pub data: Vec<u8>,
}

impl Datagram {
    pub fn parse(b: &[u8]) -> Result<Self> {
        if b.len() < 4 {
            return Err(ProxyError::BadRequest);
        }
        let frag = b[2];
        let (addr, consumed) = Address::split_from(&b[3..]).map_err(|_| ProxyError::BadRequest)?;
        if 3 + consumed >= b.len() {
            return Err(ProxyError::BadRequest);
        }
        Ok(Self {
            frag,
            addr,
            data: b[3 + consumed..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = bytes::BytesMut::with_capacity(4 + self.addr.serialized_len() + self.data.len());
        buf.extend_from_slice(&[0x00, 0x00, self.frag]);
        self.addr.encode(&mut buf);
        buf.extend_from_slice(&self.data);
        buf.to_vec()
    }
}

/// Server side of the SOCKS5 handshake.
pub struct Socks5Server {
    auth: Option<(String, String)>,
    udp_enabled: bool,
}

impl Socks5Server {
    pub fn new(auth: Option<(String, String)>, udp_enabled: bool) -> Self {
        Self { auth, udp_enabled }
    }

    fn method(&self) -> u8 {
        if self.auth.is_some() {
            METHOD_USERPASS
        } else {
            METHOD_NONE
        }
    }

    pub fn udp_enabled(&self) -> bool {
        self.udp_enabled
    }

    /// 方法协商，必要时执行用户名/密码子协商
    pub async fn negotiate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let req = NegotiationRequest::read_from(stream).await?;
        let method = self.method();

        if !req.methods.contains(&method) {
            NegotiationReply::new(METHOD_UNSUPPORTED)
                .write_to(stream)
                .await?;
            return Err(ProxyError::BadRequest);
        }
        NegotiationReply::new(method).write_to(stream).await?;

        if let Some((user, pass)) = self.auth.as_ref().filter(|_| method == METHOD_USERPASS) {
            let upr = UserPassRequest::read_from(stream).await?;
            if upr.uname != user.as_bytes() || upr.passwd != pass.as_bytes() {
                UserPassReply::new(USERPASS_FAILURE)
                    .write_to(stream)
                    .await?;
                return Err(ProxyError::AuthFailed);
            }
            UserPassReply::new(USERPASS_SUCCESS)
                .write_to(stream)
                .await?;
        }
        Ok(())
    }

    /// Read the request and gate the command. Unsupported commands are
    /// replied to here; CONNECT (and UDP-ASSOCIATE when enabled) pass
    /// through unanswered — the reply follows the dial.
    pub async fn read_request<S>(&self, stream: &mut S) -> Result<Request>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let req = Request::read_from(stream).await?;
        debug!(cmd = req.cmd, target = %req.addr, "SOCKS5 request");

        let supported = req.cmd == CMD_CONNECT || (req.cmd == CMD_UDP_ASSOCIATE && self.udp_enabled);
        if !supported {
            Reply::error(REP_COMMAND_NOT_SUPPORTED)
                .write_to(stream)
                .await?;
            return Err(ProxyError::CommandNotSupported(req.cmd));
        }
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn negotiate_no_auth() {
        let srv = Socks5Server::new(None, false);
        let (mut client, mut server) = duplex(1024);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        srv.negotiate(&mut server).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn negotiate_rejects_wrong_version_before_reply() {
        let srv = Socks5Server::new(None, false);
        let (mut client, mut server) = duplex(1024);

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let err = srv.negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::BadVersion(0x04)));

        // nothing was written back
        drop(server);
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn negotiate_zero_methods_is_bad_request() {
        let srv = Socks5Server::new(None, false);
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[0x05, 0x00]).await.unwrap();
        assert!(matches!(
            srv.negotiate(&mut server).await,
            Err(ProxyError::BadRequest)
        ));
    }

    #[tokio::test]
    async fn negotiate_no_acceptable_method_replies_ff() {
        // server requires user/pass, client only offers none
        let srv = Socks5Server::new(Some(("u".into(), "p".into())), false);
        let (mut client, mut server) = duplex(1024);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let err = srv.negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest));

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn negotiate_userpass_success() {
        let srv = Socks5Server::new(Some(("user01".into(), "pass01".into())), false);
        let (mut client, mut server) = duplex(1024);

        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
        // RFC 1929: [ver=1, ulen, uname, plen, passwd]
        client.write_all(&[0x01, 0x06]).await.unwrap();
        client.write_all(b"user01").await.unwrap();
        client.write_all(&[0x06]).await.unwrap();
        client.write_all(b"pass01").await.unwrap();

        srv.negotiate(&mut server).await.unwrap();

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn negotiate_userpass_failure() {
        let srv = Socks5Server::new(Some(("user01".into(), "pass01".into())), false);
        let (mut client, mut server) = duplex(1024);

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        client.write_all(&[0x01, 0x06]).await.unwrap();
        client.write_all(b"user01").await.unwrap();
        client.write_all(&[0x05]).await.unwrap();
        client.write_all(b"wrong").await.unwrap();

        let err = srv.negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::AuthFailed));

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02, 0x01, 0x01]);
    }

    #[tokio::test]
    async fn userpass_empty_fields_are_bad_request() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[0x01, 0x00]).await.unwrap();
        assert!(matches!(
            UserPassRequest::read_from(&mut server).await,
            Err(ProxyError::BadRequest)
        ));

        let (mut client2, mut server2) = duplex(1024);
        client2.write_all(&[0x01, 0x01, b'u', 0x00]).await.unwrap();
        assert!(matches!(
            UserPassRequest::read_from(&mut server2).await,
            Err(ProxyError::BadRequest)
        ));
        drop(client);
    }

    #[tokio::test]
    async fn request_connect_ipv4() {
        let srv = Socks5Server::new(None, false);
        let (mut client, mut server) = duplex(1024);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let req = srv.read_request(&mut server).await.unwrap();
        assert_eq!(req.cmd, CMD_CONNECT);
        assert_eq!(req.addr, Address::Ip("127.0.0.1:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn request_connect_domain() {
        let srv = Socks5Server::new(None, false);
        let (mut client, mut server) = duplex(1024);

        let mut bytes = vec![0x05, 0x01, 0x00, 0x03, 0x0B];
        bytes.extend_from_slice(b"example.com");
        bytes.extend_from_slice(&[0x01, 0xBB]);
        client.write_all(&bytes).await.unwrap();

        let req = srv.read_request(&mut server).await.unwrap();
        assert_eq!(req.addr, Address::Domain("example.com".to_string(), 443));
    }

    #[tokio::test]
    async fn request_bind_gets_command_not_supported() {
        let srv = Socks5Server::new(None, false);
        let (mut client, mut server) = duplex(1024);

        client
            .write_all(&[0x05, CMD_BIND, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let err = srv.read_request(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::CommandNotSupported(CMD_BIND)));

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(
            reply,
            [0x05, REP_COMMAND_NOT_SUPPORTED, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn request_udp_associate_gated_by_flag() {
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(&[0x05, CMD_UDP_ASSOCIATE, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let off = Socks5Server::new(None, false);
        assert!(matches!(
            off.read_request(&mut server).await,
            Err(ProxyError::CommandNotSupported(CMD_UDP_ASSOCIATE))
        ));

        let (mut client2, mut server2) = duplex(1024);
        client2
            .write_all(&[0x05, CMD_UDP_ASSOCIATE, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let on = Socks5Server::new(None, true);
        let req = on.read_request(&mut server2).await.unwrap();
        assert_eq!(req.cmd, CMD_UDP_ASSOCIATE);
        drop(client);
    }

    #[tokio::test]
    async fn reply_success_wire_format() {
        let (mut client, mut server) = duplex(1024);
        Reply::success("10.0.0.2:4096".parse().unwrap())
            .write_to(&mut server)
            .await
            .unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0x00, 0x00, 0x01, 10, 0, 0, 2, 0x10, 0x00]);
    }

    #[test]
    fn rep_mapping() {
        let refused = ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "x",
        ));
        assert_eq!(rep_for_dial_error(&refused), REP_CONNECTION_REFUSED);
        assert_eq!(rep_for_dial_error(&ProxyError::Timeout), REP_TTL_EXPIRED);
        assert_eq!(
            rep_for_dial_error(&ProxyError::BadAddress),
            REP_ADDRESS_NOT_SUPPORTED
        );
    }

    #[test]
    fn datagram_roundtrip() {
        let d = Datagram {
            frag: 0,
            addr: Address::Domain("example.com".to_string(), 53),
            data: b"payload".to_vec(),
        };
        let bytes = d.to_bytes();
        assert_eq!(Datagram::parse(&bytes).unwrap(), d);
    }

    #[test]
    fn datagram_rejects_empty_data() {
        let d = Datagram {
            frag: 0,
            addr: Address::Ip("1.2.3.4:53".parse().unwrap()),
            data: Vec::new(),
        };
        assert!(matches!(
            Datagram::parse(&d.to_bytes()),
            Err(ProxyError::BadRequest)
        ));
    }
}
