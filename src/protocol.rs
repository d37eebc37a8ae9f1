use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// ADB protocol version advertised in CNXN
pub const ADB_VERSION: u32 = 0x01000001;

/// Maximum data payload size advertised in CNXN
pub const MAX_PAYLOAD: u32 = 1024 * 1024;

/// Size of the fixed message header
pub const HEADER_SIZE: usize = 24;

/// Size of the AUTH token the daemon sends as a challenge
pub const TOKEN_SIZE: usize = 20;

/// ADB command constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Synchronize
    Sync,
    /// Connect
    Cnxn,
    /// Authentication
    Auth,
    /// Open stream
    Open,
    /// OK/Ready
    Okay,
    /// Close stream
    Clse,
    /// Write data
    Wrte,
    /// Upgrade to TLS
    Stls,
    /// Any value not listed above, kept verbatim
    Unknown(u32),
}

impl Command {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0x434e5953 => Command::Sync,
            0x4e584e43 => Command::Cnxn,
            0x48545541 => Command::Auth,
            0x4e45504f => Command::Open,
            0x59414b4f => Command::Okay,
            0x45534c43 => Command::Clse,
            0x45545257 => Command::Wrte,
            0x534c5453 => Command::Stls,
            other => Command::Unknown(other),
        }
    }

    pub fn value(self) -> u32 {
        match self {
            Command::Sync => 0x434e5953,
            Command::Cnxn => 0x4e584e43,
            Command::Auth => 0x48545541,
            Command::Open => 0x4e45504f,
            Command::Okay => 0x59414b4f,
            Command::Clse => 0x45534c43,
            Command::Wrte => 0x45545257,
            Command::Stls => 0x534c5453,
            Command::Unknown(value) => value,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Command::Unknown(_))
    }

    /// Expected `magic` field for this command
    pub fn magic(self) -> u32 {
        self.value() ^ 0xffffffff
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Sync => write!(f, "SYNC"),
            Command::Cnxn => write!(f, "CNXN"),
            Command::Auth => write!(f, "AUTH"),
            Command::Open => write!(f, "OPEN"),
            Command::Okay => write!(f, "OKAY"),
            Command::Clse => write!(f, "CLSE"),
            Command::Wrte => write!(f, "WRTE"),
            Command::Stls => write!(f, "STLS"),
            Command::Unknown(value) => write!(f, "0x{:08x}", value),
        }
    }
}

/// Authentication types (`arg0` of AUTH packets)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthType {
    /// Token (challenge from device)
    Token = 1,
    /// Signature (response to challenge)
    Signature = 2,
    /// RSA public key
    RsaPublicKey = 3,
}

impl AuthType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(AuthType::Token),
            2 => Some(AuthType::Signature),
            3 => Some(AuthType::RsaPublicKey),
            _ => None,
        }
    }
}

/// ADB message header (24 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_checksum: u32,
    pub magic: u32,
}

impl Message {
    /// Create a new message
    pub fn new(command: Command, arg0: u32, arg1: u32, data: &[u8]) -> Self {
        Self {
            command,
            arg0,
            arg1,
            data_length: data.len() as u32,
            data_checksum: checksum(data),
            magic: command.magic(),
        }
    }

    /// All-zero header standing in for "no message"
    pub fn empty() -> Self {
        Self {
            command: Command::Unknown(0),
            arg0: 0,
            arg1: 0,
            data_length: 0,
            data_checksum: 0,
            magic: 0,
        }
    }

    /// Serialize message to bytes (little-endian)
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let fields = [
            self.command.value(),
            self.arg0,
            self.arg1,
            self.data_length,
            self.data_checksum,
            self.magic,
        ];
        let mut bytes = [0u8; HEADER_SIZE];
        for (slot, field) in bytes.chunks_exact_mut(4).zip(fields) {
            slot.copy_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    /// Deserialize a header. Unknown commands are kept as `Command::Unknown`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdbError> {
        if bytes.len() < HEADER_SIZE {
            return Err(AdbError::InvalidMessage(format!(
                "Message too short: {} bytes",
                bytes.len()
            )));
        }

        let field = |i: usize| {
            u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };

        Ok(Self {
            command: Command::from_u32(field(0)),
            arg0: field(1),
            arg1: field(2),
            data_length: field(3),
            data_checksum: field(4),
            magic: field(5),
        })
    }

    /// Recognized command with a matching magic field
    pub fn is_valid(&self) -> bool {
        self.command.is_known() && self.magic == self.command.magic()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} arg0=0x{:08x} arg1=0x{:08x} len={}",
            self.command, self.arg0, self.arg1, self.data_length
        )
    }
}

/// Additive payload checksum used by the ADB header
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// Header plus payload as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub message: Message,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(command: Command, arg0: u32, arg1: u32, data: Vec<u8>) -> Self {
        Self {
            message: Message::new(command, arg0, arg1, &data),
            data,
        }
    }

    /// The "no message" packet returned by soft-failing reads
    pub fn invalid() -> Self {
        Self {
            message: Message::empty(),
            data: Vec::new(),
        }
    }

    /// Build the header for `payload` and append it
    pub fn encode(command: Command, arg0: u32, arg1: u32, payload: &[u8]) -> Vec<u8> {
        let message = Message::new(command, arg0, arg1, payload);
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&message.to_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Soft decoder: anything structurally unusable yields `Packet::invalid()`.
    /// Payload bytes past `data_length` are ignored.
    pub fn decode(bytes: &[u8]) -> Self {
        match Message::from_bytes(bytes) {
            Ok(message) => {
                let payload = &bytes[HEADER_SIZE..];
                let len = payload.len().min(message.data_length as usize);
                Self {
                    message,
                    data: payload[..len].to_vec(),
                }
            }
            Err(_) => Self::invalid(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.data.len());
        bytes.extend_from_slice(&self.message.to_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    pub fn is_valid(&self) -> bool {
        self.message.is_valid()
    }

    pub fn command(&self) -> Command {
        self.message.command
    }

    /// Whether the header checksum matches the payload. Mismatches are
    /// tolerated by the transport; this is informational.
    pub fn checksum_matches(&self) -> bool {
        self.message.data_length as usize == self.data.len()
            && self.message.data_checksum == checksum(&self.data)
    }
}

/// ADB connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Unauthorized,
    Online,
}

impl ConnectionState {
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnect",
            ConnectionState::Unauthorized => "unauthorized",
            ConnectionState::Online => "online",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Logical stream multiplexed over the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stream {
    pub local_id: u32,
    pub remote_id: u32,
}

/// ADB errors
#[derive(Error, Debug)]
pub enum AdbError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Local path does not exist: {}", .0.display())]
    LocalPathNotFound(PathBuf),

    #[error("Remote type mismatch: {0}")]
    RemoteTypeMismatch(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<std::io::Error> for AdbError {
    fn from(value: std::io::Error) -> Self {
        AdbError::IoError(value.to_string())
    }
}
