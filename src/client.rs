use crate::auth::{local_identity, AdbKeyPair};
use crate::config::ClientConfig;
use crate::protocol::{
    AdbError, AuthType, Command, ConnectionState, Packet, Stream, ADB_VERSION, MAX_PAYLOAD,
};
use crate::sync::{PushSummary, SyncSession};
use crate::transport::TcpTransport;
use std::path::Path;

/// Main ADB client. One TCP connection, one operation at a time.
pub struct AdbClient {
    config: ClientConfig,
    transport: Option<TcpTransport>,
    keypair: AdbKeyPair,
    state: ConnectionState,
    /// Set after answering a challenge with a signature; a second challenge
    /// while it is set means the key is unknown and must be enrolled.
    signature_sent: bool,
    banner: Option<String>,
    user: String,
    host: String,
}

impl AdbClient {
    /// Create a client and run the handshake. A failed connect is not an
    /// error: the client stays `Disconnected` and retries on `state()`.
    pub fn connect(config: ClientConfig, keypair: AdbKeyPair) -> Self {
        let (user, host) = local_identity();
        Self::connect_as(config, keypair, &user, &host)
    }

    /// Like `connect`, with an explicit `user@host` for key enrollment
    pub fn connect_as(config: ClientConfig, keypair: AdbKeyPair, user: &str, host: &str) -> Self {
        let mut client = Self {
            config,
            transport: None,
            keypair,
            state: ConnectionState::Disconnected,
            signature_sent: false,
            banner: None,
            user: user.to_string(),
            host: host.to_string(),
        };
        client.authenticate();
        client
    }

    /// Connect if needed, send CNXN and process the reply stream
    fn authenticate(&mut self) {
        if self.state == ConnectionState::Disconnected {
            match TcpTransport::connect(&self.config.host, self.config.port, self.config.timeout()) {
                Ok(transport) => {
                    self.transport = Some(transport);
                    self.signature_sent = false;
                    self.banner = None;
                    self.state = ConnectionState::Unauthorized;
                }
                Err(e) => {
                    log::debug!("connect failed: {}", e);
                    return;
                }
            }
        }

        let banner = self.config.connection_banner();
        self.send_packet(Command::Cnxn, ADB_VERSION, MAX_PAYLOAD, banner.as_bytes());
        self.handle_packets();
        log::debug!("handshake finished in state {}", self.state);
    }

    /// React to an AUTH challenge: sign first, enroll the public key if
    /// challenged again.
    fn handle_auth(&mut self, token: &[u8]) {
        if !self.signature_sent || self.state == ConnectionState::Online {
            match self.keypair.sign_token(token) {
                Ok(signature) => {
                    log::debug!("answering AUTH challenge with signature");
                    self.signature_sent = true;
                    self.send_packet(Command::Auth, AuthType::Signature as u32, 0, &signature);
                }
                Err(e) => {
                    log::warn!("cannot sign AUTH token: {}", e);
                    self.send_public_key();
                }
            }
        } else {
            self.send_public_key();
        }
    }

    fn send_public_key(&mut self) {
        log::debug!("signature rejected, sending public key for {}@{}", self.user, self.host);
        self.signature_sent = false;
        let payload = self.keypair.public_key_payload(&self.user, &self.host);
        self.send_packet(Command::Auth, AuthType::RsaPublicKey as u32, 0, &payload);
    }

    /// Receive/react loop shared by the handshake and every channel.
    /// Returns the payloads collected from WRTE and OKAY packets.
    fn handle_packets(&mut self) -> Vec<u8> {
        let mut output = Vec::new();
        let local_id = self.local_id();

        loop {
            let packet = self.receive();
            if !packet.is_valid() {
                break;
            }

            match packet.command() {
                Command::Auth => self.handle_auth(&packet.data),
                Command::Cnxn => {
                    self.state = ConnectionState::Online;
                    self.banner = Some(
                        String::from_utf8_lossy(&packet.data)
                            .trim_end_matches('\0')
                            .to_string(),
                    );
                    break;
                }
                Command::Wrte | Command::Okay => {
                    output.extend_from_slice(&packet.data);
                    self.send_packet(Command::Okay, local_id, packet.message.arg0, &[]);
                }
                Command::Clse => {
                    self.send_packet(Command::Clse, local_id, packet.message.arg0, &[]);
                    break;
                }
                other => log::debug!("ignoring {}", other),
            }
        }

        output
    }

    /// Send one packet; 0 bytes and `Disconnected` when the socket is gone
    pub(crate) fn send_packet(&mut self, command: Command, arg0: u32, arg1: u32, data: &[u8]) -> usize {
        match self.transport.as_mut() {
            Some(transport) if transport.is_alive() => transport.send_packet(command, arg0, arg1, data),
            _ => {
                self.state = ConnectionState::Disconnected;
                0
            }
        }
    }

    /// Receive one packet; invalid and `Disconnected` when the socket is gone
    pub(crate) fn receive(&mut self) -> Packet {
        match self.transport.as_mut() {
            Some(transport) if transport.is_alive() => transport.receive(),
            _ => {
                self.state = ConnectionState::Disconnected;
                Packet::invalid()
            }
        }
    }

    /// Open a stream and wait for the daemon's OKAY
    pub(crate) fn open_stream(&mut self, service: &str) -> Result<Stream, AdbError> {
        let local_id = self.local_id();
        let data = format!("{}\0", service);
        if self.send_packet(Command::Open, local_id, 0, data.as_bytes()) == 0 {
            return Err(AdbError::NotConnected);
        }

        let response = self.receive();
        if response.is_valid() && response.command() == Command::Okay {
            Ok(Stream {
                local_id,
                remote_id: response.message.arg0,
            })
        } else {
            Err(AdbError::StreamError(format!(
                "'{}' refused: {}",
                service,
                if response.is_valid() {
                    response.command().to_string()
                } else {
                    "no reply".to_string()
                }
            )))
        }
    }

    /// Current connection state, re-running the handshake when disconnected
    pub fn state(&mut self) -> ConnectionState {
        if let Some(transport) = &self.transport {
            if !transport.is_alive() {
                self.state = ConnectionState::Disconnected;
            }
        }
        if self.state == ConnectionState::Disconnected {
            self.authenticate();
        }
        self.state
    }

    /// Run `command` through `shell:` and return everything it wrote
    pub fn shell(&mut self, command: &str) -> Vec<u8> {
        let data = format!("shell:{}\0", command);
        let local_id = self.local_id();
        self.send_packet(Command::Open, local_id, 0, data.as_bytes());
        self.handle_packets()
    }

    /// Push a local file or directory tree to `remote_path`
    pub fn push(&mut self, local_path: impl AsRef<Path>, remote_path: &str) -> Result<PushSummary, AdbError> {
        SyncSession::push(self, local_path.as_ref(), remote_path)
    }

    /// Device banner from the CNXN reply
    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    /// Local stream id: the socket descriptor, 0 before a connection exists
    pub fn local_id(&self) -> u32 {
        self.transport.as_ref().map(|t| t.local_id()).unwrap_or(0)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
