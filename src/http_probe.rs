use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use url::Url;

const MIN_PROBE_TIMEOUT_MS: u64 = 50;
const TCP_PROBE_TIMEOUT_MAX_MS: u64 = 1_000;

/// Result of one readiness probe against a local HTTP backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub http_status: Option<u16>,
    pub tcp_reachable: bool,
}

impl ProbeResult {
    pub fn is_serving(&self) -> bool {
        matches!(self.http_status, Some(code) if (200..400).contains(&code))
    }
}

fn resolve_addrs(url: &Url) -> Option<Vec<SocketAddr>> {
    let host = url.host_str()?;
    let port = url.port_or_known_default().unwrap_or(80);
    (host, port)
        .to_socket_addrs()
        .ok()
        .map(|addrs| addrs.collect())
}

pub fn ping(base_url: &Url, timeout_ms: u64) -> bool {
    let timeout = Duration::from_millis(timeout_ms.max(MIN_PROBE_TIMEOUT_MS));
    resolve_addrs(base_url).is_some_and(|addrs| {
        addrs
            .iter()
            .any(|address| TcpStream::connect_timeout(address, timeout).is_ok())
    })
}

pub fn request_status_code(base_url: &Url, path: &str, timeout_ms: u64) -> Option<u16> {
    let request_url = base_url.join(path).ok()?;
    if request_url.scheme() != "http" {
        return None;
    }
    let host = request_url.host_str()?.to_string();
    let timeout = Duration::from_millis(timeout_ms.max(MIN_PROBE_TIMEOUT_MS));
    let mut stream = resolve_addrs(&request_url)?
        .into_iter()
        .find_map(|address| TcpStream::connect_timeout(&address, timeout).ok())?;
    let _ = stream.set_read_timeout(Some(timeout));
    let _ = stream.set_write_timeout(Some(timeout));

    let mut request_target = request_url.path().to_string();
    if let Some(query) = request_url.query() {
        request_target.push('?');
        request_target.push_str(query);
    }
    if request_target.is_empty() {
        request_target = "/".to_string();
    }

    let request = format!(
        "GET {request_target} HTTP/1.1\r\n\
Host: {host}\r\n\
Accept: text/html,application/json\r\n\
Accept-Encoding: identity\r\n\
Connection: close\r\n\
\r\n"
    );
    stream.write_all(request.as_bytes()).ok()?;
    let raw = read_http_response_bytes(&mut stream)?;
    parse_http_status_code(&raw)
}

pub fn probe(base_url: &Url, path: &str, probe_timeout_ms: u64) -> ProbeResult {
    let http_status = request_status_code(base_url, path, probe_timeout_ms);
    let tcp_reachable =
        http_status.is_some() || ping(base_url, probe_timeout_ms.min(TCP_PROBE_TIMEOUT_MAX_MS));
    ProbeResult {
        http_status,
        tcp_reachable,
    }
}

fn is_complete_http_response(raw: &[u8]) -> bool {
    let Some(header_end) = raw.windows(4).position(|window| window == b"\r\n\r\n") else {
        return false;
    };
    let headers = &raw[..header_end + 4];
    let body = &raw[header_end + 4..];
    let header_text = String::from_utf8_lossy(headers).to_ascii_lowercase();

    if header_text.contains("transfer-encoding: chunked") {
        return body.windows(5).any(|window| window == b"0\r\n\r\n");
    }

    if let Some(content_length) = header_text
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
    {
        return body.len() >= content_length;
    }

    false
}

fn read_http_response_bytes<R: Read>(reader: &mut R) -> Option<Vec<u8>> {
    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => {
                response.extend_from_slice(&chunk[..read]);
                // The status line is all a readiness probe needs.
                if is_complete_http_response(&response) || response.len() >= 64 * 1024 {
                    break;
                }
            }
            Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if response.is_empty() {
                    return None;
                }
                break;
            }
            Err(_) => return None,
        }
    }

    if response.is_empty() {
        None
    } else {
        Some(response)
    }
}

pub fn parse_http_status_code(raw: &[u8]) -> Option<u16> {
    let header_end = raw.windows(4).position(|window| window == b"\r\n\r\n")?;
    let header_text = String::from_utf8_lossy(&raw[..header_end]);
    header_text
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Cursor, Error},
        net::TcpListener,
        thread,
    };

    #[test]
    fn parse_http_status_code_extracts_status_line() {
        let raw = b"HTTP/1.1 302 Found\r\nLocation: /en/setup_wizard/\r\n\r\n";
        assert_eq!(parse_http_status_code(raw), Some(302));
        assert_eq!(parse_http_status_code(b"HTTP/1.1 200 OK\r\n"), None);
    }

    #[test]
    fn is_complete_http_response_respects_content_length() {
        let full = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
        assert!(is_complete_http_response(full));

        let partial = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nO";
        assert!(!is_complete_http_response(partial));
    }

    #[test]
    fn read_http_response_bytes_keeps_partial_data_on_timeout() {
        let mut reader = TimeoutAfterPayloadReader {
            payload: Cursor::new(
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: keep-alive\r\n\r\n".to_vec(),
            ),
            timed_out: false,
        };

        let raw = read_http_response_bytes(&mut reader).expect("response should be preserved");
        assert!(raw.starts_with(b"HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn serving_means_2xx_or_3xx() {
        let serving = |code| ProbeResult {
            http_status: Some(code),
            tcp_reachable: true,
        };
        assert!(serving(200).is_serving());
        assert!(serving(302).is_serving());
        assert!(!serving(503).is_serving());
        assert!(!ProbeResult {
            http_status: None,
            tcp_reachable: true
        }
        .is_serving());
    }

    #[test]
    fn probe_reads_status_from_a_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buffer = [0u8; 1024];
            let read = stream.read(&mut buffer).expect("read request");
            let request = String::from_utf8_lossy(&buffer[..read]).to_string();
            stream
                .write_all(b"HTTP/1.1 302 Found\r\nContent-Length: 0\r\n\r\n")
                .expect("write response");
            request
        });

        let base = Url::parse(&format!("http://127.0.0.1:{port}")).expect("url");
        let result = probe(&base, "/app/api/initialize", 2_000);
        let request = server.join().expect("join server");

        assert_eq!(result.http_status, Some(302));
        assert!(result.is_serving());
        assert!(request.starts_with("GET /app/api/initialize HTTP/1.1\r\n"));
    }

    struct TimeoutAfterPayloadReader {
        payload: Cursor<Vec<u8>>,
        timed_out: bool,
    }

    impl Read for TimeoutAfterPayloadReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let bytes = self.payload.read(buf)?;
            if bytes > 0 {
                return Ok(bytes);
            }
            if self.timed_out {
                return Ok(0);
            }
            self.timed_out = true;
            Err(Error::new(ErrorKind::TimedOut, "simulated read timeout"))
        }
    }
}
