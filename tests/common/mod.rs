//! Shared fixtures: an in-memory ZIP writer and a loopback HTTP server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use bytechain::{PipelineChain, Tick};
use flate2::Compression;
use flate2::write::DeflateEncoder;

/// Builds small ZIP archives with STORED and DEFLATE members.
#[derive(Default)]
pub struct ZipFixture {
    members: Vec<(String, Vec<u8>, bool)>,
}

impl ZipFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(mut self, name: &str, data: &[u8]) -> Self {
        self.members.push((name.to_string(), data.to_vec(), false));
        self
    }

    pub fn deflated(mut self, name: &str, data: &[u8]) -> Self {
        self.members.push((name.to_string(), data.to_vec(), true));
        self
    }

    /// `(name, contents)` in archive order.
    pub fn expected(&self) -> Vec<(String, Vec<u8>)> {
        self.members
            .iter()
            .map(|(name, data, _)| (name.clone(), data.clone()))
            .collect()
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();

        for (name, data, deflate) in &self.members {
            let crc = crc32fast::hash(data);
            let compressed = if *deflate {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data).unwrap();
                encoder.finish().unwrap()
            } else {
                data.clone()
            };
            let method: u16 = if *deflate { 8 } else { 0 };
            let offset = out.len() as u32;

            out.write_u32::<LittleEndian>(0x04034b50).unwrap();
            out.write_u16::<LittleEndian>(20).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
            out.write_u16::<LittleEndian>(method).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
            out.write_u16::<LittleEndian>(0x21).unwrap();
            out.write_u32::<LittleEndian>(crc).unwrap();
            out.write_u32::<LittleEndian>(compressed.len() as u32).unwrap();
            out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
            out.write_u16::<LittleEndian>(name.len() as u16).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&compressed);

            central.write_u32::<LittleEndian>(0x02014b50).unwrap();
            central.write_u16::<LittleEndian>(20).unwrap();
            central.write_u16::<LittleEndian>(20).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(method).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(0x21).unwrap();
            central.write_u32::<LittleEndian>(crc).unwrap();
            central.write_u32::<LittleEndian>(compressed.len() as u32).unwrap();
            central.write_u32::<LittleEndian>(data.len() as u32).unwrap();
            central.write_u16::<LittleEndian>(name.len() as u16).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap(); // extra
            central.write_u16::<LittleEndian>(0).unwrap(); // comment
            central.write_u16::<LittleEndian>(0).unwrap(); // disk
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u32::<LittleEndian>(0).unwrap();
            central.write_u32::<LittleEndian>(offset).unwrap();
            central.extend_from_slice(name.as_bytes());
        }

        let central_offset = out.len() as u32;
        let count = self.members.len() as u16;
        out.extend_from_slice(&central);
        out.write_u32::<LittleEndian>(0x06054b50).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(count).unwrap();
        out.write_u16::<LittleEndian>(count).unwrap();
        out.write_u32::<LittleEndian>(central.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(central_offset).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out
    }
}

/// Some text that compresses well but not to nothing.
pub fn sample_text(lines: usize) -> Vec<u8> {
    (0..lines)
        .map(|i| format!("<item><title>post {i}</title><link>http://example.com/?p={i}</link></item>\n"))
        .collect::<String>()
        .into_bytes()
}

/// Incompressible bytes from a fixed-seed LCG.
pub fn noise(len: usize) -> Vec<u8> {
    let mut seed = 0x2545_f491u32;
    (0..len)
        .map(|_| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (seed >> 16) as u8
        })
        .collect()
}

/// Merges consecutive chunks with the same file id.
pub fn merge(chunks: impl IntoIterator<Item = (String, Vec<u8>)>) -> Vec<(String, Vec<u8>)> {
    let mut merged: Vec<(String, Vec<u8>)> = Vec::new();
    for (file_id, data) in chunks {
        match merged.last_mut() {
            Some((last, bytes)) if *last == file_id => bytes.extend_from_slice(&data),
            _ => merged.push((file_id, data)),
        }
    }
    merged
}

/// Ticks until the chain finishes, or until it goes idle when
/// `until_idle` is set. Panics on stage failures.
pub fn drain(chain: &mut PipelineChain, until_idle: bool) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    for _ in 0..1_000_000 {
        match chain.tick().unwrap() {
            Tick::Output(chunk) => out.push((chunk.file_id, chunk.data.to_vec())),
            Tick::Failed(failure) => panic!("{failure}"),
            Tick::Pending if until_idle && chain.is_idle() => return out,
            Tick::Pending => {}
            Tick::Finished => return out,
        }
    }
    panic!("chain did not settle");
}

pub enum Route {
    Body(Vec<u8>),
    /// Waits before answering.
    Slow(Vec<u8>, Duration),
    /// Sends the head and the first half of the body, pauses, then sends
    /// the rest.
    Trickle(Vec<u8>, Duration),
    /// No `Content-Length`: the body ends when the connection closes.
    Unsized(Vec<u8>),
    /// Reads the request and holds the connection without answering.
    Silent(Duration),
    Redirect(String),
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub path: String,
    pub range: Option<u64>,
}

struct ServerState {
    routes: HashMap<String, Route>,
    honor_range: bool,
    hits: Mutex<Vec<Hit>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ServerState {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    /// Called before the first response byte is written, so the server
    /// never counts a connection the client has already released.
    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A thread-per-connection HTTP/1.1 server on 127.0.0.1.
pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl TestServer {
    pub fn start<P: Into<String>>(routes: impl IntoIterator<Item = (P, Route)>) -> Self {
        Self::with_ranges(routes, true)
    }

    /// `honor_range = false` answers every request with the full body.
    pub fn with_ranges<P: Into<String>>(
        routes: impl IntoIterator<Item = (P, Route)>,
        honor_range: bool,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState {
            routes: routes
                .into_iter()
                .map(|(path, route)| (path.into(), route))
                .collect(),
            honor_range,
            hits: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let shared = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let state = Arc::clone(&shared);
                thread::spawn(move || {
                    state.enter();
                    let _ = serve(stream, &state);
                });
            }
        });
        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Same server, addressed through `host` instead of the IP literal.
    pub fn url_with_host(&self, host: &str, path: &str) -> String {
        format!("http://{host}:{}{path}", self.addr.port())
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.state.hits.lock().unwrap().clone()
    }

    /// Most connections the server was handling at once.
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

fn serve(mut stream: TcpStream, state: &ServerState) -> io::Result<()> {
    let hit = match read_request(&mut stream) {
        Ok(hit) => hit,
        Err(error) => {
            state.leave();
            return Err(error);
        }
    };
    state.hits.lock().unwrap().push(hit.clone());

    let start = hit.range.filter(|_| state.honor_range);
    match state.routes.get(&hit.path) {
        Some(Route::Body(body)) => {
            state.leave();
            write_body(&mut stream, body, start, true)
        }
        Some(Route::Slow(body, delay)) => {
            thread::sleep(*delay);
            state.leave();
            write_body(&mut stream, body, start, true)
        }
        Some(Route::Unsized(body)) => {
            state.leave();
            write_body(&mut stream, body, start, false)
        }
        Some(Route::Silent(hold)) => {
            state.leave();
            thread::sleep(*hold);
            Ok(())
        }
        Some(Route::Trickle(body, delay)) => {
            state.leave();
            let (head, body) = body_response(body, start, true);
            let half = body.len() / 2;
            stream.write_all(head.as_bytes())?;
            stream.write_all(&body[..half])?;
            stream.flush()?;
            thread::sleep(*delay);
            stream.write_all(&body[half..])
        }
        Some(Route::Redirect(location)) => {
            state.leave();
            let head = format!(
                "HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(head.as_bytes())
        }
        Some(Route::Status(code)) => {
            state.leave();
            let head = format!(
                "HTTP/1.1 {code} Nope\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(head.as_bytes())
        }
        None => {
            state.leave();
            stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        }
    }
}

/// Head and payload for `body` from `start`. A start at or past the end is
/// answered with 416, as real servers do.
fn body_response(body: &[u8], start: Option<u64>, sized: bool) -> (String, &[u8]) {
    let length = |len: usize| {
        if sized {
            format!("Content-Length: {len}\r\n")
        } else {
            String::new()
        }
    };
    match start {
        Some(start) if start as usize >= body.len() => {
            let head = format!(
                "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                body.len()
            );
            (head, &body[..0])
        }
        Some(start) => {
            let rest = &body[start as usize..];
            let head = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {start}-{}/{}\r\n{}Connection: close\r\n\r\n",
                body.len() - 1,
                body.len(),
                length(rest.len())
            );
            (head, rest)
        }
        None => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\n{}Connection: close\r\n\r\n",
                length(body.len())
            );
            (head, body)
        }
    }
}

fn write_body(
    stream: &mut TcpStream,
    body: &[u8],
    start: Option<u64>,
    sized: bool,
) -> io::Result<()> {
    let (head, body) = body_response(body, start, sized);
    let mut response = head.into_bytes();
    response.extend_from_slice(body);
    stream.write_all(&response)
}

fn read_request(stream: &mut TcpStream) -> io::Result<Hit> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        head.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&head);
    let mut lines = text.split("\r\n");
    let path = lines
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .unwrap_or("/")
        .to_string();
    let range = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.eq_ignore_ascii_case("range") {
            return None;
        }
        value.trim().strip_prefix("bytes=")?.strip_suffix('-')?.parse().ok()
    });
    Ok(Hit { path, range })
}
