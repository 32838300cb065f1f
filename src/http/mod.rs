//! HTTP/1.0 and HTTP/1.1 framing
//!
//! A single [`HttpParser`] reads and writes both requests and responses:
//! the first line decides which one it is. Reading is incremental; feed it
//! whatever bytes have arrived and it reports complete/incomplete. Bodies
//! are framed by `Content-Length`, by chunked transfer encoding, or by
//! nothing at all (streaming callers set `header_only`).
//!
//! The send path can stream: [`HttpParser::start_response`] switches to
//! chunked encoding on HTTP/1.1 and falls back to a connection-delimited
//! HTTP/1.0 response otherwise, and [`HttpParser::chunkify`] frames each
//! body part accordingly.

use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;

use crate::net::{Buffer, Socket};

/// Incremental HTTP request/response parser and builder.
#[derive(Debug, Default)]
pub struct HttpParser {
    pub method: String,
    pub url: String,
    pub protocol: String,
    /// Accumulated body bytes.
    pub body: BytesMut,
    /// Declared Content-Length, when present.
    pub length: usize,
    /// Stop after the headers even when a body length is known.
    pub header_only: bool,
    seen_headers: bool,
    seen_req: bool,
    get_chunks: bool,
    doing_chunk: usize,
    headers: BTreeMap<String, String>,
    vars: BTreeMap<String, String>,
    /// Bytes received but not yet parsed; survives [`clean`](Self::clean)
    /// so pipelined messages keep flowing.
    pending: BytesMut,
}

impl HttpParser {
    pub fn new() -> Self {
        let mut parser = Self::default();
        parser.clean();
        parser
    }

    /// Reset all message state, keeping unparsed input.
    pub fn clean(&mut self) {
        self.seen_headers = false;
        self.seen_req = false;
        self.get_chunks = false;
        self.doing_chunk = 0;
        self.method = "GET".to_string();
        self.url = "/".to_string();
        self.protocol = "HTTP/1.1".to_string();
        self.body.clear();
        self.length = 0;
        self.headers.clear();
        self.vars.clear();
    }

    /// True while a chunked body is still being assembled.
    pub fn get_chunks(&self) -> bool {
        self.get_chunks
    }

    /// The URL without its query string.
    pub fn get_url(&self) -> &str {
        match self.url.find('?') {
            Some(idx) => &self.url[..idx],
            None => &self.url,
        }
    }

    pub fn get_header(&self, name: &str) -> &str {
        self.headers.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn set_header(&mut self, name: &str, value: impl ToString) {
        let name = name.trim().to_string();
        let value = value.to_string().trim().to_string();
        self.headers.insert(name, value);
    }

    pub fn get_var(&self, name: &str) -> &str {
        self.vars.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn set_var(&mut self, name: &str, value: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.vars.insert(name.to_string(), value.trim().to_string());
    }

    /// Set the body and the matching Content-Length header.
    pub fn set_body(&mut self, body: &[u8]) {
        self.body.clear();
        self.body.extend_from_slice(body);
        self.set_header("Content-Length", body.len());
    }

    /// Feed bytes from a receive buffer. Returns true when a complete
    /// request or response has been read.
    pub fn read_from(&mut self, buffer: &mut Buffer) -> bool {
        while buffer.size() > 0 {
            let front = buffer.get();
            self.pending.extend_from_slice(front);
            front.clear();
        }
        self.parse()
    }

    /// Feed a byte slice directly.
    pub fn read_bytes(&mut self, data: &[u8]) -> bool {
        self.pending.extend_from_slice(data);
        self.parse()
    }

    fn parse(&mut self) -> bool {
        while !self.pending.is_empty() {
            if !self.seen_headers {
                let Some(newline) = self.pending.iter().position(|&b| b == b'\n') else {
                    return false;
                };
                let raw = self.pending.split_to(newline + 1);
                let line: String = String::from_utf8_lossy(&raw)
                    .chars()
                    .filter(|&c| c != '\r' && c != '\n')
                    .collect();
                if !self.seen_req {
                    self.parse_first_line(&line);
                    continue;
                }
                if line.is_empty() {
                    self.seen_headers = true;
                    self.body.clear();
                    if !self.get_header("Content-Length").is_empty() {
                        self.length = self
                            .get_header("Content-Length")
                            .trim()
                            .parse()
                            .unwrap_or(0);
                        self.body.reserve(self.length);
                    }
                    if self.get_header("Transfer-Encoding") == "chunked" {
                        self.get_chunks = true;
                        self.doing_chunk = 0;
                    }
                } else if let Some(colon) = line.find(':') {
                    let (name, value) = line.split_at(colon);
                    self.set_header(name, &value[1..]);
                }
                continue;
            }

            if self.length > 0 {
                if self.header_only {
                    return true;
                }
                let missing = self.length - self.body.len();
                let take = missing.min(self.pending.len());
                self.body.extend_from_slice(&self.pending.split_to(take));
                if self.body.len() == self.length {
                    let post = String::from_utf8_lossy(&self.body).into_owned();
                    self.parse_vars(&post);
                    return true;
                }
                return false;
            }

            if self.get_chunks {
                if self.header_only {
                    return true;
                }
                if self.doing_chunk > 0 {
                    let take = self.doing_chunk.min(self.pending.len());
                    self.body.extend_from_slice(&self.pending.split_to(take));
                    self.doing_chunk -= take;
                    continue;
                }
                let Some(newline) = self.pending.iter().position(|&b| b == b'\n') else {
                    return false;
                };
                let raw = self.pending.split_to(newline + 1);
                let line: String = String::from_utf8_lossy(&raw)
                    .chars()
                    .filter(|&c| c != '\r' && c != '\n')
                    .collect();
                if !line.is_empty() {
                    let mut chunk_len: usize = 0;
                    for c in line.chars() {
                        chunk_len = (chunk_len << 4) | unhex(c) as usize;
                    }
                    if chunk_len == 0 {
                        self.get_chunks = false;
                        return true;
                    }
                    self.doing_chunk = chunk_len;
                }
                continue;
            }

            // no declared framing: the body is whatever follows the headers
            return true;
        }
        if self.seen_headers
            && (self.header_only || (self.length == 0 && !self.get_chunks))
        {
            return true;
        }
        false
    }

    fn parse_first_line(&mut self, line: &str) {
        self.seen_req = true;
        let Some((first, rest)) = line.split_once(' ') else {
            self.seen_req = false;
            return;
        };
        let Some((second, third)) = rest.split_once(' ') else {
            self.seen_req = false;
            return;
        };
        if line.starts_with("HTTP") {
            // response line: protocol, status code, message
            self.protocol = first.to_string();
            self.url = second.to_string();
            self.method = third.to_string();
        } else {
            self.method = first.to_string();
            self.url = second.to_string();
            self.protocol = third.to_string();
        }
        if let Some(idx) = self.url.find('?') {
            let query = self.url[idx + 1..].to_string();
            self.parse_vars(&query);
        }
    }

    /// Parse GET or POST style `a=1&b=2` variable data.
    fn parse_vars(&mut self, data: &str) {
        for part in data.split('&') {
            if part.is_empty() {
                continue;
            }
            let (name, value) = match part.split_once('=') {
                Some((n, v)) => (n, v),
                None => (part, ""),
            };
            let name = url_decode(name);
            let value = url_decode(value);
            self.set_var(&name, &value);
        }
    }

    fn valid_protocol(&self) -> &str {
        if self.protocol.len() >= 5 && self.protocol.starts_with("HTTP") {
            &self.protocol
        } else {
            "HTTP/1.0"
        }
    }

    /// Materialise a full request as one contiguous buffer.
    pub fn build_request(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(128 + self.body.len());
        out.put_slice(self.method.as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.url.as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.valid_protocol().as_bytes());
        out.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            if !name.is_empty() && !value.is_empty() {
                out.put_slice(name.as_bytes());
                out.put_slice(b": ");
                out.put_slice(value.as_bytes());
                out.put_slice(b"\r\n");
            }
        }
        out.put_slice(b"\r\n");
        out.put_slice(&self.body);
        out
    }

    /// Materialise a full response as one contiguous buffer.
    pub fn build_response(&self, code: &str, message: &str) -> BytesMut {
        let mut out = BytesMut::with_capacity(128 + self.body.len());
        out.put_slice(self.valid_protocol().as_bytes());
        out.put_u8(b' ');
        out.put_slice(code.as_bytes());
        out.put_u8(b' ');
        out.put_slice(message.as_bytes());
        out.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            if name.is_empty() || value.is_empty() {
                continue;
            }
            // empty bodies stream later; announcing zero length would lie
            if name == "Content-Length" && value == "0" {
                continue;
            }
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.put_slice(&self.body);
        out
    }

    /// Stream a request over a socket, header by header.
    pub async fn send_request(&self, socket: &mut Socket) {
        let line = format!("{} {} {}\r\n", self.method, self.url, self.valid_protocol());
        socket.send_now(line.as_bytes()).await;
        for (name, value) in &self.headers {
            if !name.is_empty() && !value.is_empty() {
                socket.send_now(format!("{}: {}\r\n", name, value).as_bytes()).await;
            }
        }
        socket.send_now(b"\r\n").await;
        socket.send_now(&self.body).await;
    }

    /// Stream a response over a socket, header by header.
    pub async fn send_response(&self, code: &str, message: &str, socket: &mut Socket) {
        let line = format!("{} {} {}\r\n", self.valid_protocol(), code, message);
        socket.send_now(line.as_bytes()).await;
        for (name, value) in &self.headers {
            if name.is_empty() || value.is_empty() {
                continue;
            }
            if name == "Content-Length" && value == "0" {
                continue;
            }
            socket.send_now(format!("{}: {}\r\n", name, value).as_bytes()).await;
        }
        socket.send_now(b"\r\n").await;
        socket.send_now(&self.body).await;
    }

    /// Begin a streamed response matched to the request's protocol:
    /// chunked on HTTP/1.1, connection-delimited on HTTP/1.0.
    pub async fn start_response(
        &mut self,
        code: &str,
        message: &str,
        request: &HttpParser,
        socket: &mut Socket,
    ) {
        self.protocol = request.protocol.clone();
        self.body.clear();
        if self.protocol == "HTTP/1.1" {
            self.set_header("Transfer-Encoding", "chunked");
        } else {
            self.set_body(b"");
        }
        self.send_response(code, message, socket).await;
    }

    /// Send one body part in the framing chosen by
    /// [`start_response`](Self::start_response). A zero-length part
    /// terminates the stream.
    pub async fn chunkify(&self, data: &[u8], socket: &mut Socket) {
        if self.protocol == "HTTP/1.1" {
            socket.send_now(format!("{:x}\r\n", data.len()).as_bytes()).await;
            socket.send_now(data).await;
            socket.send_now(b"\r\n").await;
            if data.is_empty() {
                // chunked encoding ends with an extra empty line
                socket.send_now(b"\r\n").await;
            }
        } else {
            socket.send_now(data).await;
            if data.is_empty() {
                socket.close();
            }
        }
    }

    /// After this parser has read a request's headers from `from`, forward
    /// the response headers and then pump the body from `from` to `to`
    /// until it completes or either peer disconnects.
    pub async fn proxy(&mut self, from: &mut Socket, to: &mut Socket) {
        self.send_response("200", "OK", to).await;
        if self.get_chunks {
            let mut proxying_chunk: usize = 0;
            while to.connected() && from.connected() {
                if from.received().size() == 0 && !from.spool() {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    continue;
                }
                if proxying_chunk > 0 {
                    while proxying_chunk > 0 && from.received().size() > 0 {
                        let front = from.received().get();
                        let take = front.len().min(proxying_chunk);
                        let chunk = front.split_to(take);
                        to.send_now(&chunk).await;
                        proxying_chunk -= take;
                    }
                    continue;
                }
                // accumulate until a full size line is present, then parse
                if !from.received().rejoin_until_newline() {
                    continue;
                }
                let line = from.received().get().split();
                to.send_now(&line).await;
                let text: String = String::from_utf8_lossy(&line)
                    .chars()
                    .filter(|&c| c != '\r' && c != '\n')
                    .collect();
                if text.is_empty() {
                    continue;
                }
                let mut chunk_len: usize = 0;
                for c in text.chars() {
                    chunk_len = (chunk_len << 4) | unhex(c) as usize;
                }
                if chunk_len == 0 {
                    self.get_chunks = false;
                    to.send_now(b"\r\n").await;
                    return;
                }
                proxying_chunk = chunk_len;
            }
        } else {
            let mut remaining = self.length;
            while remaining > 0 && to.connected() && from.connected() {
                if from.received().size() == 0 && !from.spool() {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    continue;
                }
                let front = from.received().get();
                let take = front.len().min(remaining);
                let part = front.split_to(take);
                to.send_now(&part).await;
                remaining -= take;
            }
        }
    }
}

fn unhex(c: char) -> u8 {
    match c {
        '0'..='9' => c as u8 - b'0',
        'A'..='F' => c as u8 - b'A' + 10,
        'a'..='f' => c as u8 - b'a' + 10,
        _ => 0,
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Decode `%HH` escapes and `+` as space.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let mut value = 0u8;
                if i + 1 < bytes.len() {
                    value = unhex(bytes[i + 1] as char) << 4;
                }
                if i + 2 < bytes.len() {
                    value += unhex(bytes[i + 2] as char);
                }
                out.push(value);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Escape everything outside the unreserved set.
pub fn url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        match b {
            b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'~' | b'!' | b'*' | b'(' | b')'
            | b'\'' => out.push(b as char),
            _ => {
                out.push('%');
                out.push(HEX_DIGITS[(b >> 4) as usize] as char);
                out.push(HEX_DIGITS[(b & 0x0F) as usize] as char);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_get_with_query() {
        let mut parser = HttpParser::new();
        let done = parser.read_bytes(b"GET /x?a=1&b=%20 HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(done);
        assert_eq!(parser.method, "GET");
        assert_eq!(parser.url, "/x?a=1&b=%20");
        assert_eq!(parser.get_url(), "/x");
        assert_eq!(parser.get_header("Host"), "h");
        assert_eq!(parser.get_var("a"), "1");
        assert_eq!(parser.get_var("b"), " ");
    }

    #[test]
    fn test_bare_lf_tolerated() {
        let mut parser = HttpParser::new();
        assert!(parser.read_bytes(b"GET / HTTP/1.0\nHost: h\n\n"));
        assert_eq!(parser.protocol, "HTTP/1.0");
        assert_eq!(parser.get_header("Host"), "h");
    }

    #[test]
    fn test_content_length_body_and_post_vars() {
        let mut parser = HttpParser::new();
        let done = parser.read_bytes(
            b"POST /submit HTTP/1.1\r\nContent-Length: 11\r\n\r\nname=va+lue",
        );
        assert!(done);
        assert_eq!(parser.body.as_ref(), b"name=va+lue");
        assert_eq!(parser.get_var("name"), "va lue");
    }

    #[test]
    fn test_body_arrives_in_pieces() {
        let mut parser = HttpParser::new();
        assert!(!parser.read_bytes(b"POST / HTTP/1.1\r\nContent-Length: 6\r\n\r\nab"));
        assert!(!parser.read_bytes(b"cd"));
        assert!(parser.read_bytes(b"ef"));
        assert_eq!(parser.body.as_ref(), b"abcdef");
    }

    #[test]
    fn test_chunked_response() {
        let mut parser = HttpParser::new();
        let done = parser.read_bytes(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );
        assert!(done);
        assert_eq!(parser.protocol, "HTTP/1.1");
        assert_eq!(parser.url, "200");
        assert_eq!(parser.body.as_ref(), b"hello");
        assert!(!parser.get_chunks());
    }

    #[test]
    fn test_chunked_any_split_boundary() {
        let wire: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n";
        for split in 1..wire.len() {
            let mut parser = HttpParser::new();
            let first = parser.read_bytes(&wire[..split]);
            let done = parser.read_bytes(&wire[split..]);
            assert!(first || done, "split at {}", split);
            assert_eq!(parser.body.as_ref(), b"hello world", "split at {}", split);
        }
    }

    #[test]
    fn test_header_only_mode() {
        let mut parser = HttpParser::new();
        parser.header_only = true;
        let done =
            parser.read_bytes(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\npartial");
        assert!(done);
        assert!(parser.body.is_empty());
        assert_eq!(parser.length, 100);
    }

    #[test]
    fn test_malformed_first_line_ignored() {
        let mut parser = HttpParser::new();
        assert!(parser.read_bytes(b"garbage\r\nGET /ok HTTP/1.1\r\n\r\n"));
        assert_eq!(parser.url, "/ok");
    }

    #[test]
    fn test_pipelined_requests() {
        let mut parser = HttpParser::new();
        assert!(parser.read_bytes(b"GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\n\r\n"));
        assert_eq!(parser.url, "/one");
        parser.clean();
        assert!(parser.read_bytes(b""));
        assert_eq!(parser.url, "/two");
    }

    #[test]
    fn test_build_request() {
        let mut parser = HttpParser::new();
        parser.method = "POST".into();
        parser.url = "/api".into();
        parser.set_header("Host", "example.org");
        parser.set_body(b"payload");
        let wire = parser.build_request();
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("POST /api HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.org\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\npayload"));
    }

    #[test]
    fn test_build_response_skips_zero_length() {
        let mut parser = HttpParser::new();
        parser.set_header("Content-Length", "0");
        parser.set_header("Server", "streamcore");
        let wire = parser.build_response("404", "Not Found");
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.contains("Server: streamcore\r\n"));
    }

    #[test]
    fn test_invalid_protocol_downgraded() {
        let mut parser = HttpParser::new();
        parser.protocol = "ICY".into();
        let wire = parser.build_response("200", "OK");
        assert!(String::from_utf8_lossy(&wire).starts_with("HTTP/1.0"));
    }

    #[test]
    fn test_url_codec_roundtrip() {
        for input in ["plain", "with space", "a=1&b=2", "tilde~bang!", "100%"] {
            assert_eq!(url_decode(&url_encode(input)), input);
        }
        assert_eq!(url_encode("a b"), "a%20b");
        assert_eq!(url_decode("a+b"), "a b");
    }

    #[test]
    fn test_url_decode_all_bytes() {
        // every byte value survives an encode/decode cycle
        let all: String = (1u8..=127).map(|b| b as char).collect();
        assert_eq!(url_decode(&url_encode(&all)), all);
    }

    #[tokio::test]
    async fn test_start_response_chunked_1_1() {
        let (mut server, mut client) = Socket::pair().unwrap();
        let mut request = HttpParser::new();
        request.read_bytes(b"GET / HTTP/1.1\r\n\r\n");

        let mut response = HttpParser::new();
        response.start_response("200", "OK", &request, &mut server).await;
        response.chunkify(b"hello", &mut server).await;
        response.chunkify(b"", &mut server).await;

        let mut parser = HttpParser::new();
        let mut done = false;
        for _ in 0..200 {
            client.spool();
            if parser.read_from(client.received()) {
                done = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert!(done);
        assert_eq!(parser.body.as_ref(), b"hello");
        assert_eq!(parser.get_header("Transfer-Encoding"), "chunked");
    }

    #[tokio::test]
    async fn test_chunkify_1_0_closes_on_end() {
        let (mut server, mut client) = Socket::pair().unwrap();
        let mut request = HttpParser::new();
        request.read_bytes(b"GET / HTTP/1.0\r\n\r\n");

        let mut response = HttpParser::new();
        response.start_response("200", "OK", &request, &mut server).await;
        response.chunkify(b"raw bytes", &mut server).await;
        response.chunkify(b"", &mut server).await;
        assert!(!server.connected());

        let mut collected = Vec::new();
        for _ in 0..200 {
            client.spool();
            while client.received().size() > 0 {
                let front = client.received().get().split();
                collected.extend_from_slice(&front);
            }
            if !client.connected() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nraw bytes"));
    }

    #[tokio::test]
    async fn test_proxy_content_length() {
        let (mut upstream_tx, mut upstream_rx) = Socket::pair().unwrap();
        let (mut downstream_tx, mut downstream_rx) = Socket::pair().unwrap();

        // response headers arrive first, parsed header_only
        let mut parser = HttpParser::new();
        parser.header_only = true;
        upstream_tx
            .send_now(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\n")
            .await;
        for _ in 0..200 {
            upstream_rx.spool();
            if parser.read_from(upstream_rx.received()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert_eq!(parser.length, 9);

        upstream_tx.send_now(b"proxy body").await; // one extra byte past length
        parser.proxy(&mut upstream_rx, &mut downstream_tx).await;

        let mut collected = Vec::new();
        for _ in 0..200 {
            downstream_rx.spool();
            while downstream_rx.received().size() > 0 {
                let front = downstream_rx.received().get().split();
                collected.extend_from_slice(&front);
            }
            if String::from_utf8_lossy(&collected).ends_with("proxy bod") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.ends_with("\r\n\r\nproxy bod"), "got: {:?}", text);
    }

    #[tokio::test]
    async fn test_proxy_chunked() {
        let (mut upstream_tx, mut upstream_rx) = Socket::pair().unwrap();
        let (mut downstream_tx, mut downstream_rx) = Socket::pair().unwrap();

        let mut parser = HttpParser::new();
        parser.header_only = true;
        upstream_tx
            .send_now(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await;
        for _ in 0..200 {
            upstream_rx.spool();
            if parser.read_from(upstream_rx.received()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert!(parser.get_chunks());

        upstream_tx.send_now(b"5\r\nhello\r\n0\r\n").await;
        parser.proxy(&mut upstream_rx, &mut downstream_tx).await;
        assert!(!parser.get_chunks());

        let mut collected = Vec::new();
        for _ in 0..200 {
            downstream_rx.spool();
            while downstream_rx.received().size() > 0 {
                let front = downstream_rx.received().get().split();
                collected.extend_from_slice(&front);
            }
            if String::from_utf8_lossy(&collected).contains("0\r\n\r\n") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("5\r\nhello"), "got: {:?}", text);
        assert!(text.ends_with("0\r\n\r\n"), "got: {:?}", text);
    }
}
