// Scripted stand-in for adbd, speaking the crate's own codec over a real
// loopback socket.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tcpadb::protocol::{Command, Message, Packet, ADB_VERSION, HEADER_SIZE, MAX_PAYLOAD};
use tcpadb::sync::{SyncCommand, SyncPacket, CHUNK_SIZE, SEND2_FLAG_ZSTD};
use tcpadb::{AdbClient, AdbKeyPair, ClientConfig};

pub const TEST_KEY: &str = include_str!("../data/adbkey.pem");
pub const REMOTE_ID: u32 = 42;
pub const BANNER: &[u8] = b"device::ro.product.name=mock;ro.product.model=Mock\0";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn keypair() -> AdbKeyPair {
    AdbKeyPair::from_pem(TEST_KEY).unwrap()
}

pub struct Daemon {
    pub stream: TcpStream,
}

impl Daemon {
    pub fn read(&mut self) -> Packet {
        let mut header = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header).unwrap();
        let message = Message::from_bytes(&header).unwrap();
        let mut data = vec![0u8; message.data_length as usize];
        self.stream.read_exact(&mut data).unwrap();
        let packet = Packet { message, data };
        assert!(packet.is_valid(), "client sent an invalid header");
        assert!(packet.checksum_matches(), "client sent a bad checksum");
        packet
    }

    pub fn expect(&mut self, command: Command) -> Packet {
        let packet = self.read();
        assert_eq!(packet.command(), command, "unexpected {}", packet.message);
        packet
    }

    pub fn send(&mut self, command: Command, arg0: u32, arg1: u32, data: &[u8]) {
        self.stream
            .write_all(&Packet::encode(command, arg0, arg1, data))
            .unwrap();
    }

    /// Read CNXN and accept it without authentication
    pub fn accept_cnxn(&mut self) {
        let cnxn = self.expect(Command::Cnxn);
        assert_eq!(cnxn.message.arg0, ADB_VERSION);
        assert_eq!(cnxn.message.arg1, MAX_PAYLOAD);
        self.send(Command::Cnxn, ADB_VERSION, MAX_PAYLOAD, BANNER);
    }

    /// Nothing arrives within `wait`
    pub fn assert_silent(&mut self, wait: Duration) {
        self.stream.set_read_timeout(Some(wait)).unwrap();
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) | Err(_) => {}
            Ok(_) => panic!("client sent unexpected data"),
        }
    }
}

/// Run `script` against the first connection on a fresh loopback port.
/// The daemon's socket is handed back so it outlives the script.
pub fn spawn<F, T>(script: F) -> (u16, JoinHandle<(T, Daemon)>)
where
    F: FnOnce(&mut Daemon) -> T + Send + 'static,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut daemon = Daemon { stream };
        let result = script(&mut daemon);
        (result, daemon)
    });
    (port, handle)
}

pub fn config(port: u16) -> ClientConfig {
    ClientConfig::new("127.0.0.1", port)
        .with_timeout(Duration::from_secs(2))
        .with_chunk_retry(Duration::from_millis(10), None)
}

pub fn connect(config: ClientConfig) -> AdbClient {
    AdbClient::connect_as(config, keypair(), "tester", "testhost")
}

/// Build a STA2 reply record with the given mode
pub fn stat2_record(mode: u32) -> Vec<u8> {
    let mut record = vec![0u8; 72];
    record[0..4].copy_from_slice(&SyncCommand::Stat2.as_bytes());
    record[24..28].copy_from_slice(&mode.to_le_bytes());
    record
}

/// How the mock answers a sync session
#[derive(Default)]
pub struct SyncScript {
    /// Mode returned for the STA2 query, 0 for "does not exist"
    pub remote_mode: u32,
    /// Remote paths answered with FAIL
    pub fail_paths: Vec<String>,
    /// Chunk attempts (counted from 0 across the session) answered with a
    /// non-OKAY packet
    pub nack_attempts: Vec<usize>,
    pub nack_all: bool,
    /// Answer every SND2 announce with FAIL instead of OKAY
    pub reject_send2: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    Send,
    Send2,
}

#[derive(Debug)]
pub struct Transfer {
    pub kind: Kind,
    pub path: String,
    pub mode: u32,
    pub contents: Vec<u8>,
    pub completed: bool,
}

#[derive(Debug, Default)]
pub struct SyncLog {
    pub local_id: u32,
    pub stat_path: String,
    pub transfers: Vec<Transfer>,
    /// Every DATA chunk WRTE payload in arrival order, resends included
    pub chunk_attempts: Vec<Vec<u8>>,
    pub quit: bool,
}

fn is_quit(payload: &[u8]) -> bool {
    payload == SyncCommand::Quit.with_arg(0)
}

fn is_full_chunk(payload: &[u8]) -> bool {
    payload.len() == 8 + CHUNK_SIZE
        && payload.starts_with(&SyncCommand::Data.as_bytes())
        && payload[4..8] == (CHUNK_SIZE as u32).to_le_bytes()
}

fn sync_reply(script: &SyncScript, path: &str) -> Vec<u8> {
    if script.fail_paths.iter().any(|p| p == path) {
        SyncPacket::encode(SyncCommand::Fail, b"permission denied")
    } else {
        SyncCommand::Okay.with_arg(0).to_vec()
    }
}

/// Serve one `sync:` session: OPEN, STA2, transfers, QUIT and CLSE
pub fn serve_sync(daemon: &mut Daemon, script: &SyncScript) -> SyncLog {
    let mut log = SyncLog::default();

    let open = daemon.expect(Command::Open);
    assert_eq!(open.data, b"sync:\0");
    log.local_id = open.message.arg0;
    let local = log.local_id;
    daemon.send(Command::Okay, REMOTE_ID, local, &[]);

    let stat = daemon.expect(Command::Wrte);
    assert_eq!(stat.message.arg0, local);
    assert_eq!(stat.message.arg1, REMOTE_ID);
    let request = SyncPacket::from_bytes(&stat.data).unwrap();
    assert_eq!(request.command, SyncCommand::Stat2);
    log.stat_path = String::from_utf8(request.data).unwrap();
    daemon.send(Command::Okay, REMOTE_ID, local, &[]);
    daemon.send(Command::Wrte, REMOTE_ID, local, &stat2_record(script.remote_mode));
    daemon.expect(Command::Okay);

    let mut attempt = 0usize;
    loop {
        let packet = daemon.expect(Command::Wrte);
        let payload = packet.data;

        if is_quit(&payload) {
            daemon.send(Command::Okay, REMOTE_ID, local, &[]);
            daemon.send(Command::Clse, REMOTE_ID, local, &[]);
            let clse = daemon.expect(Command::Clse);
            assert_eq!(clse.message.arg0, local);
            assert_eq!(clse.message.arg1, REMOTE_ID);
            log.quit = true;
            return log;
        }

        let head = SyncPacket::from_bytes(&payload).unwrap();
        match head.command {
            SyncCommand::Send => {
                let info = String::from_utf8(head.data.clone()).unwrap();
                let (path, mode) = info.rsplit_once(',').unwrap();
                let rest = &payload[8 + head.data.len()..];
                let data = SyncPacket::from_bytes(rest).unwrap();
                assert_eq!(data.command, SyncCommand::Data);
                let done = &rest[8 + data.data.len()..];
                assert_eq!(done.len(), 8);
                assert_eq!(&done[..4], b"DONE");

                daemon.send(Command::Wrte, REMOTE_ID, local, &sync_reply(script, path));
                log.transfers.push(Transfer {
                    kind: Kind::Send,
                    path: path.to_string(),
                    mode: mode.parse().unwrap(),
                    contents: data.data,
                    completed: true,
                });
            }
            SyncCommand::Send2 => {
                let path = String::from_utf8(head.data.clone()).unwrap();
                let rest = &payload[8 + head.data.len()..];
                assert_eq!(rest.len(), 12);
                assert_eq!(&rest[..4], b"SND2");
                let mode = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
                let flags = u32::from_le_bytes([rest[8], rest[9], rest[10], rest[11]]);
                assert_eq!(flags, SEND2_FLAG_ZSTD);

                if script.reject_send2 {
                    let fail = SyncPacket::encode(SyncCommand::Fail, b"send2 refused");
                    daemon.send(Command::Wrte, REMOTE_ID, local, &fail);
                    log.transfers.push(Transfer {
                        kind: Kind::Send2,
                        path,
                        mode,
                        contents: Vec::new(),
                        completed: false,
                    });
                    continue;
                }
                daemon.send(Command::Okay, REMOTE_ID, local, &[]);

                let mut transfer = Transfer {
                    kind: Kind::Send2,
                    path: path.clone(),
                    mode,
                    contents: Vec::new(),
                    completed: false,
                };
                let mut compressed = Vec::new();

                loop {
                    let packet = daemon.expect(Command::Wrte);
                    let payload = packet.data;

                    if is_quit(&payload) {
                        // client gave up on the file; treat as session end
                        daemon.send(Command::Okay, REMOTE_ID, local, &[]);
                        daemon.send(Command::Clse, REMOTE_ID, local, &[]);
                        daemon.expect(Command::Clse);
                        log.transfers.push(transfer);
                        log.quit = true;
                        return log;
                    }

                    if is_full_chunk(&payload) {
                        log.chunk_attempts.push(payload.clone());
                        let nack = script.nack_all || script.nack_attempts.contains(&attempt);
                        attempt += 1;
                        if nack {
                            daemon.send(Command::Wrte, REMOTE_ID, local, b"busy");
                        } else {
                            compressed.extend_from_slice(&payload[8..]);
                            daemon.send(Command::Okay, REMOTE_ID, local, &[]);
                        }
                        continue;
                    }

                    let (tail, done) = payload.split_at(payload.len() - 8);
                    assert_eq!(&done[..4], b"DONE");
                    if compressed.is_empty() {
                        let data = SyncPacket::from_bytes(tail).unwrap();
                        assert_eq!(data.command, SyncCommand::Data);
                        assert_eq!(data.data.len() + 8, tail.len());
                        compressed.extend_from_slice(&data.data);
                    } else {
                        compressed.extend_from_slice(tail);
                    }

                    transfer.contents = zstd::decode_all(&compressed[..]).unwrap();
                    transfer.completed = true;
                    daemon.send(Command::Wrte, REMOTE_ID, local, &sync_reply(script, &path));
                    break;
                }

                log.transfers.push(transfer);
            }
            other => panic!("unexpected sync command {:?}", other),
        }
    }
}

/// Deterministic, incompressible filler
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}
