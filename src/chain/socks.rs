//! Server side of the SOCKS4/4a and SOCKS5 CONNECT handshakes.
//!
//! Only the no-authentication CONNECT command is supported: the listener is
//! bound to loopback and serves the local protocol client.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ChainmailError, Result};
use crate::model::proxy::SocksVersion;

const SOCKS4: u8 = 0x04;
const SOCKS5: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

const V4_GRANTED: u8 = 0x5A;
const V4_REJECTED: u8 = 0x5B;

const V5_NO_AUTH: u8 = 0x00;
const V5_NO_ACCEPTABLE: u8 = 0xFF;
const V5_SUCCEEDED: u8 = 0x00;
const V5_HOST_UNREACHABLE: u8 = 0x04;
const V5_COMMAND_UNSUPPORTED: u8 = 0x07;
const V5_ATYP_UNSUPPORTED: u8 = 0x08;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Longest user id / hostname accepted in a SOCKS4 request.
const MAX_V4_FIELD: usize = 255;

/// Destination requested by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
}

impl ConnectRequest {
    pub fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn protocol(msg: impl Into<String>) -> ChainmailError {
    ChainmailError::Protocol(msg.into())
}

/// Read a client greeting and CONNECT request for `version`.
///
/// On a malformed or unsupported request the matching rejection is written
/// before the error is returned.
pub async fn accept<S>(stream: &mut S, version: SocksVersion) -> Result<ConnectRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V4 => accept_v4(stream).await,
        SocksVersion::V5 => accept_v5(stream).await,
    }
}

/// Answer a previously accepted CONNECT request.
pub async fn reply<S>(stream: &mut S, version: SocksVersion, granted: bool) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let frame: &[u8] = match (version, granted) {
        (SocksVersion::V4, true) => &[0x00, V4_GRANTED, 0, 0, 0, 0, 0, 0],
        (SocksVersion::V4, false) => &[0x00, V4_REJECTED, 0, 0, 0, 0, 0, 0],
        (SocksVersion::V5, true) => &[SOCKS5, V5_SUCCEEDED, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0],
        (SocksVersion::V5, false) => {
            &[SOCKS5, V5_HOST_UNREACHABLE, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
        }
    };
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

async fn accept_v4<S>(stream: &mut S) -> Result<ConnectRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 8];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS4 {
        return Err(protocol(format!("expected SOCKS4, got version {}", head[0])));
    }
    if head[1] != CMD_CONNECT {
        reply(stream, SocksVersion::V4, false).await?;
        return Err(protocol(format!("unsupported SOCKS4 command {}", head[1])));
    }
    let port = u16::from_be_bytes([head[2], head[3]]);
    let ip = Ipv4Addr::new(head[4], head[5], head[6], head[7]);

    // User id is ignored.
    read_nul_terminated(stream).await?;

    // 4a: 0.0.0.x with x != 0 means a hostname follows.
    let octets = ip.octets();
    let host = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
        let name = read_nul_terminated(stream).await?;
        if name.is_empty() {
            reply(stream, SocksVersion::V4, false).await?;
            return Err(protocol("empty SOCKS4a hostname"));
        }
        String::from_utf8_lossy(&name).into_owned()
    } else {
        ip.to_string()
    };
    Ok(ConnectRequest { host, port })
}

async fn read_nul_terminated<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            return Ok(out);
        }
        if out.len() == MAX_V4_FIELD {
            return Err(protocol("SOCKS4 field too long"));
        }
        out.push(byte);
    }
}

async fn accept_v5<S>(stream: &mut S) -> Result<ConnectRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS5 {
        return Err(protocol(format!("expected SOCKS5, got version {}", greeting[0])));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&V5_NO_AUTH) {
        stream.write_all(&[SOCKS5, V5_NO_ACCEPTABLE]).await?;
        return Err(protocol("no acceptable SOCKS5 auth method"));
    }
    stream.write_all(&[SOCKS5, V5_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS5 {
        return Err(protocol("invalid SOCKS5 request version"));
    }
    if request[1] != CMD_CONNECT {
        reject_v5(stream, V5_COMMAND_UNSUPPORTED).await?;
        return Err(protocol(format!("unsupported SOCKS5 command {}", request[1])));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        other => {
            reject_v5(stream, V5_ATYP_UNSUPPORTED).await?;
            return Err(protocol(format!("unsupported SOCKS5 address type {other}")));
        }
    };
    let port = stream.read_u16().await?;
    Ok(ConnectRequest { host, port })
}

async fn reject_v5<S>(stream: &mut S, code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS5, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}
