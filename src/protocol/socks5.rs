//! SOCKS5 client handshake (RFC 1928, RFC 1929).
//!
//! Only what is needed to prove a proxy is reachable and usable: method
//! negotiation, username/password auth, CONNECT and UDP ASSOCIATE.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};

pub const SOCKS5_VERSION: u8 = 0x05;
pub const AUTH_METHOD_NONE: u8 = 0x00;
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Human-readable text for a reply code.
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Destination of a SOCKS5 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn domain(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        match host.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(host, port),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(v4)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&v4.ip().octets());
                buf.extend_from_slice(&v4.port().to_be_bytes());
            }
            TargetAddr::Ip(SocketAddr::V6(v6)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&v6.ip().octets());
                buf.extend_from_slice(&v6.port().to_be_bytes());
            }
            TargetAddr::Domain(host, port) => {
                let len = u8::try_from(host.len())
                    .map_err(|_| Error::config(format!("Domain too long: {host}")))?;
                buf.push(ATYP_DOMAIN);
                buf.push(len);
                buf.extend_from_slice(host.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        Ok(())
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Outcome of a UDP ASSOCIATE probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpAssociate {
    /// Relay address the proxy bound for us.
    Supported(Option<SocketAddr>),
    /// Refused; carries the reason.
    Unsupported(String),
}

/// Negotiate a method and authenticate. Returns the method the proxy chose.
pub async fn handshake<S>(stream: &mut S, credentials: Option<(&str, &str)>) -> Result<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS5_VERSION, 2, AUTH_METHOD_PASSWORD, AUTH_METHOD_NONE]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
    };
    stream.write_all(greeting).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(Error::protocol(format!(
            "Not a SOCKS5 proxy (version byte {:#04x})",
            reply[0]
        )));
    }

    match (reply[1], credentials) {
        (AUTH_METHOD_NONE, _) => {
            debug!("SOCKS5 proxy accepted no-auth");
            Ok(AUTH_METHOD_NONE)
        }
        (AUTH_METHOD_PASSWORD, Some((user, pass))) => {
            authenticate(stream, user, pass).await?;
            Ok(AUTH_METHOD_PASSWORD)
        }
        (AUTH_METHOD_PASSWORD, None) | (AUTH_METHOD_NO_ACCEPTABLE, None) => Err(
            Error::validation("Proxy requires authentication but no credentials were given"),
        ),
        (AUTH_METHOD_NO_ACCEPTABLE, Some(_)) => Err(Error::validation(
            "Proxy rejected all offered authentication methods",
        )),
        (other, _) => Err(Error::protocol(format!(
            "Proxy selected unsupported auth method {other:#04x}"
        ))),
    }
}

async fn authenticate<S>(stream: &mut S, user: &str, pass: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ulen = u8::try_from(user.len()).map_err(|_| Error::config("Username too long"))?;
    let plen = u8::try_from(pass.len()).map_err(|_| Error::config("Password too long"))?;

    let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
    msg.push(AUTH_PASSWORD_VERSION);
    msg.push(ulen);
    msg.extend_from_slice(user.as_bytes());
    msg.push(plen);
    msg.extend_from_slice(pass.as_bytes());
    stream.write_all(&msg).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(Error::validation(
            "Proxy authentication failed: username or password rejected",
        ));
    }
    debug!("SOCKS5 authentication succeeded");
    Ok(())
}

/// Issue CONNECT. The stream then carries the tunnelled connection.
pub async fn connect<S>(stream: &mut S, target: &TargetAddr) -> Result<Option<SocketAddr>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_request(stream, CMD_CONNECT, target).await?;
    let (code, bound) = read_reply(stream).await?;
    if code != REPLY_SUCCEEDED {
        return Err(Error::validation(format!(
            "Proxy could not reach {target}: {}",
            reply_message(code)
        )));
    }
    Ok(bound)
}

/// Issue UDP ASSOCIATE. Refusal is a normal outcome, not an error.
pub async fn udp_associate<S>(stream: &mut S) -> Result<UdpAssociate>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let any = TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    send_request(stream, CMD_UDP_ASSOCIATE, &any).await?;
    let (code, bound) = read_reply(stream).await?;
    if code == REPLY_SUCCEEDED {
        Ok(UdpAssociate::Supported(bound))
    } else {
        Ok(UdpAssociate::Unsupported(reply_message(code).to_string()))
    }
}

async fn send_request<S>(stream: &mut S, cmd: u8, target: &TargetAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut req = vec![SOCKS5_VERSION, cmd, 0x00];
    target.encode(&mut req)?;
    stream.write_all(&req).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a reply: VER REP RSV ATYP BND.ADDR BND.PORT.
async fn read_reply<S>(stream: &mut S) -> Result<(u8, Option<SocketAddr>)>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::protocol(format!(
            "Invalid SOCKS5 reply version {:#04x}",
            head[0]
        )));
    }

    let bound = match head[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 6];
            stream.read_exact(&mut addr).await?;
            let ip = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
            Some(SocketAddr::new(ip.into(), u16::from_be_bytes([addr[4], addr[5]])))
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 18];
            stream.read_exact(&mut addr).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addr[..16]);
            let ip = Ipv6Addr::from(octets);
            Some(SocketAddr::new(ip.into(), u16::from_be_bytes([addr[16], addr[17]])))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await?;
            None
        }
        // Some proxies send a bare header on failure.
        _ if head[1] != REPLY_SUCCEEDED => None,
        other => {
            return Err(Error::protocol(format!(
                "Invalid address type in reply: {other:#04x}"
            )))
        }
    };
    Ok((head[1], bound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_no_auth_connect() {
        let (mut client, mut server) = duplex(256);
        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            server.write_all(&[5, 0]).await.unwrap();

            let mut head = [0u8; 5];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[5, CMD_CONNECT, 0, ATYP_DOMAIN]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            server.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..head[4] as usize], b"www.google.com");
            server
                .write_all(&[5, 0, 0, ATYP_IPV4, 10, 0, 0, 1, 0x1F, 0x90])
                .await
                .unwrap();
        });

        assert_eq!(handshake(&mut client, None).await.unwrap(), AUTH_METHOD_NONE);
        let bound = connect(&mut client, &TargetAddr::domain("www.google.com", 80))
            .await
            .unwrap();
        assert_eq!(bound, Some("10.0.0.1:8080".parse().unwrap()));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_password_rejected() {
        let (mut client, mut server) = duplex(256);
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[5, AUTH_METHOD_PASSWORD]).await.unwrap();
            let mut buf = [0u8; 64];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(&[1, 1]).await.unwrap();
        });

        let err = handshake(&mut client, Some(("alice", "wrong"))).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_auth_required_without_credentials() {
        let (mut client, mut server) = duplex(64);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[5, AUTH_METHOD_NO_ACCEPTABLE]).await.unwrap();
        });
        let err = handshake(&mut client, None).await.unwrap_err();
        assert!(err.to_string().contains("requires authentication"));
    }

    #[tokio::test]
    async fn test_udp_associate_unsupported() {
        let (mut client, mut server) = duplex(64);
        tokio::spawn(async move {
            let mut req = [0u8; 10];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(req[1], CMD_UDP_ASSOCIATE);
            server
                .write_all(&[5, REPLY_COMMAND_NOT_SUPPORTED, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        let outcome = udp_associate(&mut client).await.unwrap();
        assert_eq!(
            outcome,
            UdpAssociate::Unsupported("command not supported".to_string())
        );
    }

    #[tokio::test]
    async fn test_not_socks() {
        let (mut client, mut server) = duplex(64);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(b"HTTP/1.1 400 Bad Request\r\n").await.unwrap();
        });
        let err = handshake(&mut client, None).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
