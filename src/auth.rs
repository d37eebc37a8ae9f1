use crate::protocol::{AdbError, TOKEN_SIZE};
use base64::{engine::general_purpose, Engine as _};
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey},
    pkcs8::DecodePrivateKey,
    traits::PublicKeyParts,
    BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};
use sha1::Sha1;

/// ADB key pair for authentication
pub struct AdbKeyPair {
    private_key: RsaPrivateKey,
    /// Device-format public key, base64 text as found in `adbkey.pub`
    public_blob: Vec<u8>,
}

impl AdbKeyPair {
    /// Generate a new 2048-bit RSA key pair
    pub fn generate() -> Result<Self, AdbError> {
        use rsa::rand_core::OsRng;

        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| AdbError::AuthenticationFailed(format!("Failed to generate key: {}", e)))?;

        Self::from_private_key(private_key)
    }

    /// Load from PEM-encoded private key string
    pub fn from_pem(pem: &str) -> Result<Self, AdbError> {
        // Try PKCS#1 first
        let private_key = if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
            key
        } else {
            RsaPrivateKey::from_pkcs8_pem(pem)
                .map_err(|e| AdbError::AuthenticationFailed(format!("Failed to parse PEM: {}", e)))?
        };

        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, AdbError> {
        let public_blob = android_public_key(&RsaPublicKey::from(&private_key))?;
        Ok(Self {
            private_key,
            public_blob,
        })
    }

    /// Replace the derived public key with one supplied out of band.
    /// Anything after the first space (the `user@host` comment) is dropped.
    pub fn with_public_blob(mut self, blob: &[u8]) -> Self {
        let end = blob
            .iter()
            .position(|&b| b == b' ' || b == b'\n' || b == 0)
            .unwrap_or(blob.len());
        self.public_blob = blob[..end].to_vec();
        self
    }

    pub fn public_blob(&self) -> &[u8] {
        &self.public_blob
    }

    /// Sign the daemon's AUTH token. The token is used directly as a SHA-1
    /// digest, the way adbd verifies it.
    pub fn sign_token(&self, token: &[u8]) -> Result<Vec<u8>, AdbError> {
        if token.len() != TOKEN_SIZE {
            return Err(AdbError::AuthenticationFailed(format!(
                "Token must be {} bytes, got {}",
                TOKEN_SIZE,
                token.len()
            )));
        }
        self.private_key
            .sign(Pkcs1v15Sign::new::<Sha1>(), token)
            .map_err(|e| AdbError::AuthenticationFailed(format!("Failed to sign token: {}", e)))
    }

    /// Payload of an RSAPUBLICKEY AUTH packet: `<blob> <user>@<host>\0`
    pub fn public_key_payload(&self, user: &str, host: &str) -> Vec<u8> {
        let mut result = self.public_blob.clone();
        result.push(b' ');
        result.extend_from_slice(user.as_bytes());
        result.push(b'@');
        result.extend_from_slice(host.as_bytes());
        result.push(0);
        result
    }

    /// Get private key as PEM
    pub fn private_key_pem(&self) -> Result<String, AdbError> {
        let pem = self
            .private_key
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| AdbError::AuthenticationFailed(format!("Failed to encode private key: {}", e)))?;
        Ok(pem.to_string())
    }
}

/// Encode a public key in the `RSAPublicKey` layout adbd expects, then
/// base64 it:
///
/// ```text
/// u32 modulus size in words
/// u32 n0inv = -1 / n[0] mod 2^32
/// u8  modulus[size]      little-endian
/// u8  rr[size]           R^2 mod N, little-endian
/// u32 exponent
/// ```
pub fn android_public_key(key: &RsaPublicKey) -> Result<Vec<u8>, AdbError> {
    let size = key.size();
    if size % 4 != 0 {
        return Err(AdbError::AuthenticationFailed(format!(
            "Unsupported modulus size: {} bytes",
            size
        )));
    }

    let n = key.n();
    let modulus = le_padded(n, size);
    let n0 = u32::from_le_bytes([modulus[0], modulus[1], modulus[2], modulus[3]]);

    // Newton iteration for the inverse of an odd number mod 2^32
    let mut inv = n0;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(n0.wrapping_mul(inv)));
    }
    let n0inv = inv.wrapping_neg();

    let rr = (BigUint::from(1u32) << (size * 8 * 2)) % n;

    let exponent = le_padded(key.e(), 4);

    let mut raw = Vec::with_capacity(4 + 4 + size * 2 + 4);
    raw.extend_from_slice(&((size / 4) as u32).to_le_bytes());
    raw.extend_from_slice(&n0inv.to_le_bytes());
    raw.extend_from_slice(&modulus);
    raw.extend_from_slice(&le_padded(&rr, size));
    raw.extend_from_slice(&exponent[..4]);

    Ok(general_purpose::STANDARD.encode(raw).into_bytes())
}

fn le_padded(value: &BigUint, len: usize) -> Vec<u8> {
    let mut bytes = value.to_bytes_le();
    bytes.resize(len.max(bytes.len()), 0);
    bytes
}

/// `user` and `host` for the public key comment
pub fn local_identity() -> (String, String) {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    (user, host)
}

/// Helper to store and retrieve keys from the filesystem
pub mod storage {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    /// `~/.android/adbkey`, where the platform tools keep theirs
    pub fn default_key_path() -> Option<PathBuf> {
        home::home_dir().map(|home| home.join(".android").join("adbkey"))
    }

    fn public_key_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".pub");
        PathBuf::from(name)
    }

    /// Save the private key and its device-format public key next to it
    pub fn save_key(keypair: &AdbKeyPair, path: &Path) -> Result<(), AdbError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, keypair.private_key_pem()?)?;

        let (user, host) = local_identity();
        let mut public = keypair.public_blob().to_vec();
        public.extend_from_slice(format!(" {}@{}\n", user, host).as_bytes());
        fs::write(public_key_path(path), public)?;

        Ok(())
    }

    /// Load a private key; a sibling `.pub` file, when present, is used
    /// verbatim as the public key.
    pub fn load_key(path: &Path) -> Result<Option<AdbKeyPair>, AdbError> {
        let pem = match fs::read_to_string(path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let keypair = AdbKeyPair::from_pem(&pem)?;
        match fs::read(public_key_path(path)) {
            Ok(blob) => Ok(Some(keypair.with_public_blob(&blob))),
            Err(_) => Ok(Some(keypair)),
        }
    }

    /// Load the key at `path`, generating and saving a new one if missing
    pub fn load_or_generate(path: &Path) -> Result<AdbKeyPair, AdbError> {
        if let Some(keypair) = load_key(path)? {
            return Ok(keypair);
        }
        log::info!("Generating new keypair at {}", path.display());
        let keypair = AdbKeyPair::generate()?;
        save_key(&keypair, path)?;
        Ok(keypair)
    }
}
