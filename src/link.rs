// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Framed TCP link underneath the rendezvous store.
//
// Every message on the wire is a 16-byte header followed by a codec frame:
//   { magic: u32, seq: u32, opcode: u16, result: i16, len: u32 }
// Requests travel client -> server with result = 0; replies echo `seq` and
// carry the outcome in `result`. A freshly connected client first sends one
// OP_CONN frame whose 8-byte payload is `(world_size << 32) | rank_id`
// (rank_id == u32::MAX asks the server to assign one).

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ErrCode, Result};

pub const LINK_MAGIC: u32 = 0x534D_4653;
pub const HEADER_LEN: usize = 16;

/// Header opcodes. Store requests and replies are OP_DATA; OP_CONN is the
/// one-shot hello a client sends right after the TCP connect.
pub const OP_DATA: u16 = 0;
pub const OP_CONN: u16 = 1;

/// Default connect/reconnect attempt budget.
pub const CONNECT_RETRY_MAX: i32 = 60;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Rank value meaning "server, please assign".
pub const RANK_AUTO_ASSIGN: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub seq: u32,
    pub opcode: u16,
    pub result: i16,
    pub len: u32,
}

impl FrameHeader {
    pub fn new(seq: u32, opcode: u16, result: i16, len: u32) -> FrameHeader {
        FrameHeader {
            magic: LINK_MAGIC,
            seq,
            opcode,
            result,
            len,
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.seq.to_le_bytes());
        out[8..10].copy_from_slice(&self.opcode.to_le_bytes());
        out[10..12].copy_from_slice(&self.result.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Result<FrameHeader> {
        let header = FrameHeader {
            magic: u32::from_le_bytes(bytes[..4].try_into().unwrap()),
            seq: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            opcode: u16::from_le_bytes(bytes[8..10].try_into().unwrap()),
            result: i16::from_le_bytes(bytes[10..12].try_into().unwrap()),
            len: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        };
        if header.magic != LINK_MAGIC {
            return Err(ErrCode::IoError);
        }
        Ok(header)
    }
}

/// One received header + payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

pub(crate) fn read_frame(stream: &mut TcpStream) -> std::io::Result<Frame> {
    let mut head = [0u8; HEADER_LEN];
    stream.read_exact(&mut head)?;
    let header = FrameHeader::from_bytes(&head)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad frame magic"))?;
    let mut payload = vec![0u8; header.len as usize];
    stream.read_exact(&mut payload)?;
    Ok(Frame { header, payload })
}

pub(crate) fn write_frame(
    stream: &mut TcpStream,
    header: FrameHeader,
    payload: &[u8],
) -> std::io::Result<()> {
    stream.write_all(&header.to_bytes())?;
    stream.write_all(payload)?;
    stream.flush()
}

pub type ResponseHandler = Arc<dyn Fn(Frame) + Send + Sync>;
pub type BrokenHandler = Arc<dyn Fn() + Send + Sync>;

/// Client side of the framed link: one writer, one background reader thread
/// dispatching replies, a broken-link fan-out when the socket dies.
pub struct TcpLink {
    writer: Mutex<TcpStream>,
    established: Arc<AtomicBool>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TcpLink {
    /// Connect with retries (1 s between attempts), send the OP_CONN hello,
    /// and start the reader thread.
    pub fn connect(
        ip: &str,
        port: u16,
        conn_rank: u64,
        retry_times: i32,
        on_response: ResponseHandler,
        on_broken: BrokenHandler,
    ) -> Result<Arc<TcpLink>> {
        let retries = if retry_times < 0 {
            CONNECT_RETRY_MAX
        } else {
            retry_times
        };
        let addr: SocketAddr = format!("{ip}:{port}")
            .parse()
            .map_err(|_| ErrCode::InvalidParam)?;

        let mut stream = None;
        for attempt in 0..=retries {
            match TcpStream::connect(addr) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!(%addr, attempt, "connect failed: {e}");
                    if attempt < retries {
                        thread::sleep(CONNECT_RETRY_DELAY);
                    }
                }
            }
        }
        let mut stream = stream.ok_or(ErrCode::IoError)?;
        stream.set_nodelay(true).ok();

        let hello = FrameHeader::new(0, OP_CONN, 0, 8);
        write_frame(&mut stream, hello, &conn_rank.to_le_bytes()).map_err(|_| ErrCode::IoError)?;

        let mut read_half = stream.try_clone().map_err(|_| ErrCode::IoError)?;
        let established = Arc::new(AtomicBool::new(true));
        let link = Arc::new(TcpLink {
            writer: Mutex::new(stream),
            established: Arc::clone(&established),
            reader: Mutex::new(None),
        });

        let reader = thread::spawn(move || loop {
            match read_frame(&mut read_half) {
                Ok(frame) => on_response(frame),
                Err(e) => {
                    debug!("link reader exits: {e}");
                    established.store(false, Ordering::Release);
                    on_broken();
                    break;
                }
            }
        });
        *link.reader.lock().unwrap() = Some(reader);

        Ok(link)
    }

    pub fn established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    /// Send one data frame. `result` is 0 for requests.
    pub fn send(&self, seq: u32, result: i16, payload: &[u8]) -> Result<()> {
        if !self.established() {
            return Err(ErrCode::IoError);
        }
        let header = FrameHeader::new(seq, OP_DATA, result, payload.len() as u32);
        let mut guard = self.writer.lock().unwrap();
        write_frame(&mut guard, header, payload).map_err(|_| ErrCode::IoError)
    }

    /// Close the socket; the reader thread notices and fires the broken
    /// handler, failing every outstanding waiter with `IoError`.
    pub fn shutdown(&self) {
        self.established.store(false, Ordering::Release);
        if let Ok(guard) = self.writer.lock() {
            guard.shutdown(Shutdown::Both).ok();
        }
        let handle = self.reader.lock().unwrap().take();
        if let Some(handle) = handle {
            if thread::current().id() != handle.thread().id() {
                handle.join().ok();
            }
        }
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        if let Ok(guard) = self.writer.lock() {
            guard.shutdown(Shutdown::Both).ok();
        }
    }
}

/// Server-held write half of an accepted link.
pub struct ServerLink {
    id: u32,
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    alive: AtomicBool,
}

impl ServerLink {
    pub(crate) fn new(id: u32, peer: SocketAddr, stream: TcpStream) -> ServerLink {
        ServerLink {
            id,
            peer,
            writer: Mutex::new(stream),
            alive: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Reply to request `seq` with a result code and payload.
    pub fn reply(&self, seq: u32, code: i16, payload: &[u8]) {
        if !self.alive() {
            return;
        }
        let header = FrameHeader::new(seq, OP_DATA, code, payload.len() as u32);
        let mut guard = self.writer.lock().unwrap();
        if let Err(e) = write_frame(&mut guard, header, payload) {
            warn!(link = self.id, "reply to {} failed: {e}", self.peer);
            self.alive.store(false, Ordering::Release);
        }
    }

    pub(crate) fn close(&self) {
        self.mark_dead();
        if let Ok(guard) = self.writer.lock() {
            guard.shutdown(Shutdown::Both).ok();
        }
    }
}
