//! tcpadb - ADB (Android Debug Bridge) client over TCP
//!
//! Speaks the daemon protocol directly (no adb server in between): the
//! CNXN/AUTH handshake, `shell:` streams and `sync:` pushes.
//!
//! # Example
//!
//! ```no_run
//! use tcpadb::{auth::storage, AdbClient, ClientConfig};
//!
//! let key_path = storage::default_key_path().expect("no home directory");
//! let keypair = storage::load_or_generate(&key_path)?;
//!
//! let mut adb = AdbClient::connect(ClientConfig::new("192.168.1.20", 5555), keypair);
//! println!("state: {}", adb.state());
//!
//! let output = adb.shell("getprop ro.product.model");
//! println!("{}", String::from_utf8_lossy(&output));
//!
//! let summary = adb.push("./build", "/data/local/tmp")?;
//! println!("{} pushed, {} failed", summary.succeeded, summary.failed);
//! # Ok::<(), tcpadb::AdbError>(())
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod auth;
pub mod client;
pub mod config;
pub mod protocol;
pub mod sync;
pub mod transport;

// Re-export main types
pub use auth::AdbKeyPair;
pub use client::AdbClient;
pub use config::ClientConfig;
pub use protocol::{AdbError, Command, ConnectionState, Message, Packet};
pub use sync::PushSummary;
pub use transport::TcpTransport;
