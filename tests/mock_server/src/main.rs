//! Echo backend for gateway integration tests
//!
//! Environment variables:
//! - PORT: Port to listen on (required)
//! - MOCK_NAME: Name reported in the X-Mock-Name header (default: mock)
//! - STARTUP_DELAY_MS: Delay before binding the port (default: 0)
//!
//! Plain requests are answered with the request path as the body. Requests
//! with `Upgrade: websocket` are accepted on any path and text frames are
//! echoed back.

use base64::Engine;
use sha1::{Digest, Sha1};
use std::env;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// WebSocket magic GUID for handshake
const WS_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[tokio::main]
async fn main() {
    let port: u16 = env::var("PORT")
        .expect("PORT environment variable required")
        .parse()
        .expect("PORT must be a valid port number");

    let name = env::var("MOCK_NAME").unwrap_or_else(|_| "mock".to_string());

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(0);

    if startup_delay > 0 {
        eprintln!("Mock server {}: sleeping for {}ms before starting", name, startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind");

    // Captured by the gateway and re-emitted with its prefix
    println!("Mock server {}: listening on port {}", name, port);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let name = name.clone();
                tokio::spawn(async move {
                    handle_connection(stream, &name).await;
                });
            }
            Err(e) => {
                eprintln!("Mock server {}: accept error: {}", name, e);
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, name: &str) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

    let header_end = loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        buf.extend_from_slice(&temp[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 8192 {
            return;
        }
    };

    let request_str = match std::str::from_utf8(&buf[..header_end]) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut lines = request_str.lines();
    let request_line = match lines.next() {
        Some(l) => l,
        None => return,
    };

    let parts: Vec<&str> = request_line.split(' ').collect();
    let target = parts.get(1).copied().unwrap_or("/");
    let path = target.split('?').next().unwrap_or("/");

    let headers: Vec<(String, String)> = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|h| h.split_once(':'))
        .map(|(n, v)| (n.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let header = |wanted: &str| {
        headers
            .iter()
            .find(|(n, _)| n == wanted)
            .map(|(_, v)| v.as_str())
    };

    let is_websocket = header("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if is_websocket {
        if let Some(key) = header("sec-websocket-key") {
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\
                 X-Mock-Name: {}\r\n\
                 \r\n",
                compute_ws_accept(key),
                name
            );
            if stream.write_all(response.as_bytes()).await.is_err() {
                return;
            }
            handle_websocket(stream).await;
        }
        return;
    }

    let (status, body) = match path {
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            ("200 OK", path.to_string())
        }
        p if p.ends_with("/error") => ("500 Internal Server Error", path.to_string()),
        _ => ("200 OK", path.to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         X-Mock-Name: {}\r\n\
         X-Seen-Host: {}\r\n\
         \r\n\
         {}",
        status,
        body.len(),
        name,
        header("host").unwrap_or(""),
        body
    );

    let _ = stream.write_all(response.as_bytes()).await;
}

/// Compute the Sec-WebSocket-Accept header value
fn compute_ws_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_MAGIC_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Echo text frames until the client closes
async fn handle_websocket(mut stream: TcpStream) {
    loop {
        let mut header = [0u8; 2];
        if stream.read_exact(&mut header).await.is_err() {
            break;
        }

        let opcode = header[0] & 0x0F;
        let masked = (header[1] & 0x80) != 0;
        let mut payload_len = (header[1] & 0x7F) as u64;

        if payload_len == 126 {
            let mut ext = [0u8; 2];
            if stream.read_exact(&mut ext).await.is_err() {
                break;
            }
            payload_len = u16::from_be_bytes(ext) as u64;
        } else if payload_len == 127 {
            let mut ext = [0u8; 8];
            if stream.read_exact(&mut ext).await.is_err() {
                break;
            }
            payload_len = u64::from_be_bytes(ext);
        }

        let mask = if masked {
            let mut m = [0u8; 4];
            if stream.read_exact(&mut m).await.is_err() {
                break;
            }
            Some(m)
        } else {
            None
        };

        let mut payload = vec![0u8; payload_len as usize];
        if !payload.is_empty() && stream.read_exact(&mut payload).await.is_err() {
            break;
        }

        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        match opcode {
            0x1 => {
                let mut response = vec![0x81];
                if payload.len() < 126 {
                    response.push(payload.len() as u8);
                } else if payload.len() < 65536 {
                    response.push(126);
                    response.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                } else {
                    response.push(127);
                    response.extend_from_slice(&(payload.len() as u64).to_be_bytes());
                }
                response.extend_from_slice(&payload);

                if stream.write_all(&response).await.is_err() {
                    break;
                }
            }
            0x8 => {
                let _ = stream.write_all(&[0x88, 0x00]).await;
                break;
            }
            _ => {}
        }
    }
}
