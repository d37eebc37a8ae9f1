use super::protocol::{AdbError, Command, Message, Packet, HEADER_SIZE, MAX_PAYLOAD};

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Payload is read from the socket in pieces of at most this size
const READ_CHUNK: usize = 1024;

/// TCP transport for ADB
pub struct TcpTransport {
    stream: TcpStream,
    local_id: u32,
}

impl TcpTransport {
    /// Open the TCP connection, applying `timeout` to connect and reads
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, AdbError> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| AdbError::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;
                    let local_id = socket_id(&stream);
                    log::debug!("connected to {} (local id {})", addr, local_id);
                    return Ok(Self { stream, local_id });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(AdbError::ConnectionFailed(match last_error {
            Some(e) => format!("{}:{}: {}", host, port, e),
            None => format!("{}:{}: no address resolved", host, port),
        }))
    }

    /// Correlation token used as the local stream id
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Liveness check: the peer address is still readable
    pub fn is_alive(&self) -> bool {
        self.stream.peer_addr().is_ok()
    }

    /// Best-effort write; returns the number of bytes sent, 0 when the
    /// connection is gone.
    pub fn send(&mut self, bytes: &[u8]) -> usize {
        if !self.is_alive() {
            return 0;
        }
        match self.stream.write_all(bytes) {
            Ok(()) => bytes.len(),
            Err(e) => {
                log::debug!("send failed: {}", e);
                0
            }
        }
    }

    /// Encode and send one packet
    pub fn send_packet(&mut self, command: Command, arg0: u32, arg1: u32, data: &[u8]) -> usize {
        log::trace!("-> {}", Message::new(command, arg0, arg1, data));
        self.send(&Packet::encode(command, arg0, arg1, data))
    }

    /// Receive one packet. Timeouts, resets and short reads all yield
    /// `Packet::invalid()`.
    pub fn receive(&mut self) -> Packet {
        if !self.is_alive() {
            return Packet::invalid();
        }
        match self.read_packet() {
            Ok(packet) => {
                log::trace!("<- {}", packet.message);
                if !packet.checksum_matches() {
                    log::warn!("checksum mismatch on {}", packet.message);
                }
                packet
            }
            Err(e) => {
                log::trace!("receive: no packet ({})", e);
                Packet::invalid()
            }
        }
    }

    fn read_packet(&mut self) -> Result<Packet, AdbError> {
        let mut header = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header)?;
        let message = Message::from_bytes(&header)?;
        if !message.is_valid() || message.data_length > MAX_PAYLOAD {
            return Err(AdbError::InvalidMessage(format!("garbled header: {}", message)));
        }

        let length = message.data_length as usize;
        let mut data = Vec::with_capacity(length);
        let mut buf = [0u8; READ_CHUNK];
        while data.len() < length {
            let want = (length - data.len()).min(READ_CHUNK);
            let n = self.stream.read(&mut buf[..want])?;
            if n == 0 {
                return Err(AdbError::IoError(format!(
                    "connection closed after {} of {} payload bytes",
                    data.len(),
                    length
                )));
            }
            data.extend_from_slice(&buf[..n]);
        }

        Ok(Packet { message, data })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

#[cfg(unix)]
fn socket_id(stream: &TcpStream) -> u32 {
    use std::os::unix::io::AsRawFd;
    stream.as_raw_fd() as u32
}

#[cfg(windows)]
fn socket_id(stream: &TcpStream) -> u32 {
    use std::os::windows::io::AsRawSocket;
    stream.as_raw_socket() as u32
}

#[cfg(not(any(unix, windows)))]
fn socket_id(_stream: &TcpStream) -> u32 {
    1
}
