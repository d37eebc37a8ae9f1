use super::client::AdbClient;
use super::protocol::{AdbError, Command, Packet, Stream};

use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Files below this size go out as a single SEND; larger ones use SND2
pub const SMALL_FILE_LIMIT: u64 = 64 * 1024;

/// Largest DATA frame of a SND2 transfer
pub const CHUNK_SIZE: usize = 64 * 1024;

/// SND2 flag selecting zstd compression
pub const SEND2_FLAG_ZSTD: u32 = 4;

/// Sync protocol commands (for file operations)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyncCommand {
    /// Stat, v2 reply layout
    Stat2 = 0x32415453, // "STA2"
    /// Send file to device
    Send = 0x444e4553, // "SEND"
    /// Send file to device, v2 with compression
    Send2 = 0x32444e53, // "SND2"
    /// Data packet
    Data = 0x41544144, // "DATA"
    /// Done/Success
    Done = 0x454e4f44, // "DONE"
    /// Success reply
    Okay = 0x59414b4f, // "OKAY"
    /// Fail/Error
    Fail = 0x4c494146, // "FAIL"
    /// End the sync session
    Quit = 0x54495551, // "QUIT"
}

impl SyncCommand {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x32415453 => Some(SyncCommand::Stat2),
            0x444e4553 => Some(SyncCommand::Send),
            0x32444e53 => Some(SyncCommand::Send2),
            0x41544144 => Some(SyncCommand::Data),
            0x454e4f44 => Some(SyncCommand::Done),
            0x59414b4f => Some(SyncCommand::Okay),
            0x4c494146 => Some(SyncCommand::Fail),
            0x54495551 => Some(SyncCommand::Quit),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> [u8; 4] {
        (*self as u32).to_le_bytes()
    }

    /// Tag followed by a bare u32 (DONE carries the mtime, QUIT a zero)
    pub fn with_arg(&self, arg: u32) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&self.as_bytes());
        bytes[4..].copy_from_slice(&arg.to_le_bytes());
        bytes
    }
}

/// Sync packet structure: tag, u32 length, data
pub struct SyncPacket {
    pub command: SyncCommand,
    pub data: Vec<u8>,
}

impl SyncPacket {
    /// Create a new sync packet
    pub fn new(command: SyncCommand, data: Vec<u8>) -> Self {
        Self { command, data }
    }

    /// Frame `data` without building a packet first
    pub fn encode(command: SyncCommand, data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + data.len());
        bytes.extend_from_slice(&command.with_arg(data.len() as u32));
        bytes.extend_from_slice(data);
        bytes
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        Self::encode(self.command, &self.data)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdbError> {
        if bytes.len() < 8 {
            return Err(AdbError::InvalidMessage("Sync packet too short".to_string()));
        }

        let cmd_u32 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let command = SyncCommand::from_u32(cmd_u32)
            .ok_or_else(|| AdbError::InvalidMessage(format!("Unknown sync command: 0x{:08x}", cmd_u32)))?;

        let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

        if bytes.len() < 8 + length {
            return Err(AdbError::InvalidMessage("Sync packet data truncated".to_string()));
        }

        Ok(Self {
            command,
            data: bytes[8..8 + length].to_vec(),
        })
    }
}

/// Remote file statistics from a STA2 reply
///
/// Reply layout: id, error (u32 each), dev, ino (u64 each), mode, nlink,
/// uid, gid (u32 each), size, atime, mtime, ctime (u64 each).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub size: u64,
    pub mtime: u64,
}

impl FileStat {
    pub const STAT2_SIZE: usize = 72;

    /// Lenient parse: a reply too short to hold the mode leaves it 0, which
    /// is neither a file nor a directory.
    pub fn from_stat2(bytes: &[u8]) -> Self {
        let u32_at = |at: usize| {
            bytes
                .get(at..at + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0)
        };
        let u64_at = |at: usize| {
            bytes
                .get(at..at + 8)
                .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .unwrap_or(0)
        };

        Self {
            mode: u32_at(24),
            size: u64_at(40),
            mtime: u64_at(56),
        }
    }

    pub fn is_directory(&self) -> bool {
        (self.mode & 0o170000) == 0o040000
    }

    pub fn is_file(&self) -> bool {
        (self.mode & 0o170000) == 0o100000
    }
}

/// Outcome of a push
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub succeeded: u32,
    pub failed: u32,
}

/// One `sync:` stream plus the per-push counters
pub struct SyncSession<'a> {
    client: &'a mut AdbClient,
    stream: Stream,
    succeeded: u32,
    failed: u32,
}

impl<'a> SyncSession<'a> {
    /// Push `local` (file or directory) to `remote`
    pub fn push(client: &'a mut AdbClient, local: &Path, remote: &str) -> Result<PushSummary, AdbError> {
        let local_meta =
            fs::metadata(local).map_err(|_| AdbError::LocalPathNotFound(local.to_path_buf()))?;

        let stream = client.open_stream("sync:").map_err(|e| {
            log::warn!("cannot open sync channel: {}", e);
            e
        })?;

        let mut session = Self {
            client,
            stream,
            succeeded: 0,
            failed: 0,
        };

        let remote_stat = session.stat(remote);

        if remote_stat.is_file() && local_meta.is_dir() {
            log::error!("\"{}\" is not a directory", remote);
            session.quit();
            return Err(AdbError::RemoteTypeMismatch(format!(
                "cannot push directory {} onto file {}",
                local.display(),
                remote
            )));
        }

        let target = if local_meta.is_file() && remote_stat.is_directory() {
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            join_remote(remote, &name)
        } else {
            remote.to_string()
        };

        session.find_file(local, &target);
        session.quit();

        Ok(session.summary())
    }

    pub fn summary(&self) -> PushSummary {
        PushSummary {
            succeeded: self.succeeded,
            failed: self.failed,
        }
    }

    fn write(&mut self, payload: &[u8]) -> usize {
        self.client
            .send_packet(Command::Wrte, self.stream.local_id, self.stream.remote_id, payload)
    }

    /// STA2 query; the stream is acknowledged after the reply
    pub fn stat(&mut self, remote: &str) -> FileStat {
        self.write(&SyncPacket::encode(SyncCommand::Stat2, remote.as_bytes()));
        // OKAY for our WRTE, then the stat record itself
        self.client.receive();
        let reply = self.client.receive();
        self.client
            .send_packet(Command::Okay, self.stream.local_id, self.stream.remote_id, &[]);

        let stat = FileStat::from_stat2(&reply.data);
        log::debug!("stat {}: mode 0o{:o}", remote, stat.mode);
        stat
    }

    /// Walk `local` and transfer every regular file beneath it
    pub fn find_file(&mut self, local: &Path, remote: &str) {
        let mut pending: Vec<(PathBuf, String)> = vec![(local.to_path_buf(), remote.to_string())];

        while let Some((local, remote)) = pending.pop() {
            let meta = match fs::metadata(&local) {
                Ok(meta) => meta,
                Err(e) => {
                    log::warn!("skipping {}: {}", local.display(), e);
                    self.failed += 1;
                    continue;
                }
            };

            if meta.is_dir() {
                let mut names = match fs::read_dir(&local) {
                    Ok(entries) => entries
                        .filter_map(|entry| entry.ok())
                        .map(|entry| entry.file_name())
                        .collect::<Vec<_>>(),
                    Err(e) => {
                        log::warn!("cannot list {}: {}", local.display(), e);
                        self.failed += 1;
                        continue;
                    }
                };
                names.sort();
                // Reversed so the stack yields entries in name order
                for name in names.into_iter().rev() {
                    let child_remote = join_remote(&remote, &name.to_string_lossy());
                    pending.push((local.join(&name), child_remote));
                }
            } else if meta.len() < SMALL_FILE_LIMIT {
                log::debug!("SEND {} -> {} ({} bytes)", local.display(), remote, meta.len());
                self.send_small(&local, &meta, &remote);
            } else {
                log::debug!("SND2 {} -> {} ({} bytes)", local.display(), remote, meta.len());
                if let Err(e) = self.send_chunked(&local, &meta, &remote) {
                    let skipped: u32 = pending.iter().map(|(local, _)| count_files(local)).sum();
                    log::warn!("{}; abandoning {} remaining file(s)", e, skipped);
                    self.failed += skipped;
                    return;
                }
            }
        }
    }

    /// SEND, DATA and DONE in a single WRTE
    fn send_small(&mut self, local: &Path, meta: &Metadata, remote: &str) {
        let file_data = match fs::read(local) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("cannot read {}: {}", local.display(), e);
                self.failed += 1;
                return;
            }
        };

        let target_info = format!("{},{}", remote, local_mode(meta));
        let mut payload = SyncPacket::encode(SyncCommand::Send, target_info.as_bytes());
        payload.extend_from_slice(&SyncPacket::encode(SyncCommand::Data, &file_data));
        payload.extend_from_slice(&SyncCommand::Done.with_arg(unix_now()));

        self.write(&payload);
        let reply = self.client.receive();
        self.record(remote, &reply);
    }

    /// SND2 announce, zstd-compressed DATA chunks, DONE.
    ///
    /// Local failures are counted before anything is written. An `Err`
    /// means the daemon is left inside this transfer and the stream can
    /// only be quit.
    fn send_chunked(&mut self, local: &Path, meta: &Metadata, remote: &str) -> Result<(), AdbError> {
        let retry_delay = self.client.config().chunk_retry_delay();
        let max_retries = self.client.config().max_chunk_retries;
        let level = self.client.config().compression_level;

        let compressed = match compress_file(local, level) {
            Ok(compressed) => compressed,
            Err(e) => {
                log::warn!("cannot read {}: {}", local.display(), e);
                self.failed += 1;
                return Ok(());
            }
        };

        let mut announce = SyncPacket::encode(SyncCommand::Send2, remote.as_bytes());
        announce.extend_from_slice(&SyncCommand::Send2.with_arg(local_mode(meta)));
        announce.extend_from_slice(&SEND2_FLAG_ZSTD.to_le_bytes());
        self.write(&announce);

        let reply = self.client.receive();
        if !reply.is_valid() || reply.command() != Command::Okay {
            log::warn!("SND2 {} not accepted", remote);
            self.failed += 1;
            return Ok(());
        }

        let mut offset = 0;
        let mut retries = 0u32;
        while compressed.len() - offset >= CHUNK_SIZE {
            let chunk = &compressed[offset..offset + CHUNK_SIZE];
            self.write(&SyncPacket::encode(SyncCommand::Data, chunk));

            let reply = self.client.receive();
            if reply.is_valid() && reply.command() == Command::Okay {
                offset += CHUNK_SIZE;
                retries = 0;
                continue;
            }

            retries += 1;
            if max_retries.is_some_and(|max| retries > max) {
                self.failed += 1;
                return Err(AdbError::StreamError(format!(
                    "{}: chunk at {} unacknowledged after {} resends",
                    remote,
                    offset,
                    retries - 1
                )));
            }
            log::warn!("{}: chunk at {} not acknowledged, resending", remote, offset);
            std::thread::sleep(retry_delay);
        }

        let payload = tail_payload(&compressed, offset, unix_now());
        self.write(&payload);
        let reply = self.client.receive();
        self.record(remote, &reply);
        Ok(())
    }

    fn record(&mut self, remote: &str, reply: &Packet) {
        if reply.data.starts_with(&SyncCommand::Fail.as_bytes()) {
            let message = match SyncPacket::from_bytes(&reply.data) {
                Ok(packet) => String::from_utf8_lossy(&packet.data).into_owned(),
                Err(_) => String::from_utf8_lossy(&reply.data[4..]).into_owned(),
            };
            log::warn!("push {} failed: {}", remote, message);
            self.failed += 1;
        } else {
            self.succeeded += 1;
        }
    }

    /// QUIT, drain its acknowledgement, then close the stream
    pub fn quit(&mut self) {
        self.write(&SyncCommand::Quit.with_arg(0));
        self.client.receive();

        let reply = self.client.receive();
        let peer_id = if reply.is_valid() {
            reply.message.arg0
        } else {
            self.stream.remote_id
        };
        self.client
            .send_packet(Command::Clse, self.stream.local_id, peer_id, &[]);
    }
}

fn compress_file(local: &Path, level: i32) -> std::io::Result<Vec<u8>> {
    let data = fs::read(local)?;
    zstd::bulk::compress(&data, level)
}

/// Final WRTE of a SND2 transfer: whatever is left after the full chunks,
/// then DONE. Only a stream that fits in one chunk gets a DATA header.
fn tail_payload(compressed: &[u8], offset: usize, mtime: u32) -> Vec<u8> {
    let tail = &compressed[offset..];
    let mut payload = if compressed.len() < CHUNK_SIZE {
        SyncPacket::encode(SyncCommand::Data, tail)
    } else {
        tail.to_vec()
    };
    payload.extend_from_slice(&SyncCommand::Done.with_arg(mtime));
    payload
}

/// Regular files at or beneath `root`; unreadable entries count as one
fn count_files(root: &Path) -> u32 {
    let mut count = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(path) = pending.pop() {
        match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => {
                if let Ok(entries) = fs::read_dir(&path) {
                    pending.extend(entries.filter_map(|entry| entry.ok()).map(|entry| entry.path()));
                }
            }
            _ => count += 1,
        }
    }
    count
}

/// Join remote path components with `/` without doubling separators
pub fn join_remote(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

#[cfg(unix)]
fn local_mode(meta: &Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
fn local_mode(meta: &Metadata) -> u32 {
    if meta.is_dir() {
        0o040755
    } else {
        0o100644
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
