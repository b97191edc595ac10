//! Loopback servers exercising the parallel and single-stream protocols
//! over plain TCP.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use protocol::{
    ChunkSack, ParallelAck, ParallelJoin, ParallelJoinStatus, ResumeAck, ResumeStatus, Sack,
};
use transport::{Connection, Dialer, TransportError};

/// Acknowledgement behaviour of the scripted parallel server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckScript {
    /// Never send chunk acknowledgements.
    None,
    /// Acknowledge every complete frame as it arrives.
    AckEverything,
}

struct ServerState {
    durable: Mutex<HashMap<u8, u64>>,
    conns: Mutex<HashMap<u8, Vec<TcpStream>>>,
    refuse: AtomicBool,
    ack: AckScript,
}

/// Scripted server speaking the parallel join/data/ack protocol.
pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl TestServer {
    pub fn start(ack: AckScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(ServerState {
            durable: Mutex::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            refuse: AtomicBool::new(false),
            ack,
        });

        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                if accept_state.refuse.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                let state = Arc::clone(&accept_state);
                thread::spawn(move || handle_parallel_conn(&state, stream));
            }
        });

        Self { addr, state }
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        let addr = self.addr;
        Arc::new(move || -> Result<Connection, TransportError> {
            let stream = TcpStream::connect(addr).map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
            Connection::plain(stream).map_err(TransportError::Io)
        })
    }

    pub fn bytes_received(&self, stream: u8) -> u64 {
        *self
            .state
            .durable
            .lock()
            .unwrap()
            .get(&stream)
            .unwrap_or(&0)
    }

    pub fn wait_for_bytes(&self, stream: u8, at_least: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.bytes_received(stream) < at_least {
            assert!(
                Instant::now() < deadline,
                "stream {stream} stalled at {} of {at_least} bytes",
                self.bytes_received(stream)
            );
            thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn wait_for_total_bytes(&self, stream: u8, at_least: u64) {
        self.wait_for_bytes(stream, at_least);
    }

    /// Tears down every connection currently attached to `stream`.
    pub fn drop_connections(&self, stream: u8) {
        let mut conns = self.state.conns.lock().unwrap();
        for conn in conns.remove(&stream).unwrap_or_default() {
            let _ = conn.shutdown(Shutdown::Both);
        }
    }

    /// Drops every future connection at accept time.
    pub fn refuse_further_connections(&self) {
        self.state.refuse.store(true, Ordering::SeqCst);
    }
}

fn handle_parallel_conn(state: &Arc<ServerState>, mut stream: TcpStream) {
    let Ok(join) = ParallelJoin::decode(&mut stream) else {
        return;
    };
    let index = join.stream_index;
    let last_offset = *state.durable.lock().unwrap().entry(index).or_insert(0);
    let ack = ParallelAck {
        status: ParallelJoinStatus::Ok,
        last_offset,
    };
    if ack.encode(&mut stream).is_err() {
        return;
    }
    if let Ok(clone) = stream.try_clone() {
        state.conns.lock().unwrap().entry(index).or_default().push(clone);
    }

    // Data phase: parse frames so durable offsets land on frame
    // boundaries, exactly as a real receiver would report them.
    loop {
        let mut header = [0u8; 8];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut payload = vec![0u8; len];
        if stream.read_exact(&mut payload).is_err() {
            return;
        }
        let durable = {
            let mut map = state.durable.lock().unwrap();
            let entry = map.entry(index).or_insert(0);
            *entry += (8 + len) as u64;
            *entry
        };
        if state.ack == AckScript::AckEverything {
            let sack = ChunkSack {
                stream_index: index,
                chunk_seq: u32::from_be_bytes([header[0], header[1], header[2], header[3]]),
                offset: durable,
            };
            if sack.encode(&mut stream).is_err() {
                return;
            }
        }
    }
}

/// Scripted server for the single-stream protocol: raw data with SACKs,
/// resume on reconnect, and trailer/final-ack at EOF.
pub struct SingleServer {
    addr: SocketAddr,
    state: Arc<SingleState>,
}

struct SingleState {
    /// Every durably received byte, in wire order, across connections.
    received: Mutex<Vec<u8>>,
    /// Close the connection once this many total bytes arrived (one-shot).
    drop_after: Mutex<Option<u64>>,
    /// Status byte to answer the trailer with.
    final_status: u8,
    saw_trailer: AtomicBool,
}

impl SingleServer {
    pub fn start(final_status: u8) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(SingleState {
            received: Mutex::new(Vec::new()),
            drop_after: Mutex::new(None),
            final_status,
            saw_trailer: AtomicBool::new(false),
        });

        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                let state = Arc::clone(&accept_state);
                thread::spawn(move || handle_single_conn(&state, stream));
            }
        });

        Self { addr, state }
    }

    pub fn connect(&self) -> Connection {
        Connection::plain(TcpStream::connect(self.addr).expect("connect loopback"))
            .expect("wrap connection")
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        let addr = self.addr;
        Arc::new(move || -> Result<Connection, TransportError> {
            let stream = TcpStream::connect(addr).map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
            Connection::plain(stream).map_err(TransportError::Io)
        })
    }

    /// Arms a one-shot connection drop after `total` received bytes.
    pub fn drop_after(&self, total: u64) {
        *self.state.drop_after.lock().unwrap() = Some(total);
    }

    pub fn received(&self) -> Vec<u8> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn saw_trailer(&self) -> bool {
        self.state.saw_trailer.load(Ordering::SeqCst)
    }
}

fn handle_single_conn(state: &Arc<SingleState>, mut stream: TcpStream) {
    // A reconnect opens with a resume request; the initial connection
    // carries data immediately.
    let mut first = [0u8; 4];
    let Ok(()) = stream.read_exact(&mut first) else {
        return;
    };
    let mut carry: Vec<u8> = Vec::new();
    if first == *b"RSME" {
        // Already consumed the magic; parse the remainder by hand.
        let mut version = [0u8; 1];
        if stream.read_exact(&mut version).is_err() {
            return;
        }
        for _ in 0..3 {
            let mut byte = [0u8; 1];
            loop {
                if stream.read_exact(&mut byte).is_err() {
                    return;
                }
                if byte[0] == b'\n' {
                    break;
                }
            }
        }
        let last_offset = state.received.lock().unwrap().len() as u64;
        let ack = ResumeAck {
            status: ResumeStatus::Ok,
            last_offset,
        };
        if ack.encode(&mut stream).is_err() {
            return;
        }
    } else {
        carry.extend_from_slice(&first);
    }

    if !carry.is_empty() {
        let durable = {
            let mut received = state.received.lock().unwrap();
            received.extend_from_slice(&carry);
            received.len() as u64
        };
        let _ = Sack { offset: durable }.encode(&mut stream);
    }

    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let durable = {
            let mut received = state.received.lock().unwrap();
            received.extend_from_slice(&buf[..n]);
            received.len() as u64
        };
        let _ = Sack { offset: durable }.encode(&mut stream);

        let should_drop = {
            let mut drop_after = state.drop_after.lock().unwrap();
            if drop_after.is_some_and(|limit| durable >= limit) {
                *drop_after = None;
                true
            } else {
                false
            }
        };
        if should_drop {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    }

    // EOF: the final 44 bytes are the trailer.
    let trailer = {
        let mut received = state.received.lock().unwrap();
        if received.len() < 44 {
            return;
        }
        let at = received.len() - 44;
        received.split_off(at)
    };
    if &trailer[..4] != b"DONE" {
        return;
    }
    state.saw_trailer.store(true, Ordering::SeqCst);
    let _ = stream.write_all(&[state.final_status]);
}
