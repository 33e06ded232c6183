//! The raw console tunnel: TLS to the host, HTTP CONNECT, then RFB.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::types::{BackendError, TunnelStream};

/// Plain connect(2) takes far too long against a host that is down.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const HEADER_LINE_MAX: usize = 256;

/// Split a console location like
/// `https://192.168.0.1/console?ref=OpaqueRef:...` into host and the
/// path-and-query part.
pub fn parse_console_url(url: &str) -> Result<(String, String), BackendError> {
    let rest = url
        .strip_prefix("https://")
        .ok_or_else(|| BackendError::tunnel("Failed to parse console location"))?;
    let slash = rest
        .find('/')
        .ok_or_else(|| BackendError::tunnel("Failed to parse console location"))?;
    let host = &rest[..slash];
    let path = &rest[slash + 1..];
    if host.is_empty() || path.is_empty() {
        return Err(BackendError::tunnel("Failed to parse console location"));
    }
    Ok((host.to_string(), path.to_string()))
}

/// Open the console stream: TLS to port 443 of the console host, then an
/// HTTP CONNECT carrying the API session id.  On success the returned
/// stream is positioned at the server's RFB banner.
pub async fn open_console_tunnel(
    console_url: &str,
    session_id: &str,
) -> Result<TunnelStream, BackendError> {
    let (host, path) = parse_console_url(console_url)?;

    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), 443)))
        .await
        .map_err(|_| BackendError::tunnel(format!("{}: connect timed out", host)))?
        .map_err(|e| BackendError::tunnel(format!("{}: {}", host, e)))?;
    tcp.set_nodelay(true).ok();

    // The appliances present self-signed certificates.
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| BackendError::tunnel(e.to_string()))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    let mut tls = connector
        .connect(&host, tcp)
        .await
        .map_err(|e| BackendError::tunnel(format!("TLS connect: {}", e)))?;

    http_connect(&mut tls, &path, session_id).await?;

    log::debug!("Connected to console");
    Ok(Box::new(tls))
}

/// Issue the CONNECT request and consume the response headers, leaving
/// the stream positioned at the first RFB byte.
pub async fn http_connect<S>(
    stream: &mut S,
    path: &str,
    session_id: &str,
) -> Result<(), BackendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("CONNECT /{}&session_id={} HTTP/1.0\r\n\r\n", path, session_id);
    stream.write_all(request.as_bytes()).await?;

    let status = read_header_line(stream).await?;
    if status != "HTTP/1.1 200 OK" {
        return Err(BackendError::tunnel(format!("Failure code: {}", status)));
    }

    loop {
        if read_header_line(stream).await?.is_empty() {
            return Ok(());
        }
    }
}

/// Read one CRLF-terminated header line, a byte at a time.
///
/// One byte per read is not optimal, but there are only a handful of
/// header lines and it avoids overshooting into the RFB handshake.
async fn read_header_line<S>(stream: &mut S) -> Result<String, BackendError>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let b = stream
            .read_u8()
            .await
            .map_err(|_| BackendError::tunnel("Failed to read/parse header"))?;
        match b {
            b'\r' => {}
            b'\n' => {
                return String::from_utf8(line)
                    .map_err(|_| BackendError::tunnel("Failed to read/parse header"));
            }
            _ => {
                if line.len() >= HEADER_LINE_MAX {
                    return Err(BackendError::tunnel("Failed to read/parse header"));
                }
                line.push(b);
            }
        }
    }
}
