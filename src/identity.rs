use {
    base64::{engine::general_purpose::STANDARD_NO_PAD, Engine},
    rand::Rng,
    serde::Serialize,
    std::fmt,
};

///
/// Identity of the local process within the quorum.
///
/// The identity is written as the value of every lock key this process claims,
/// so any observer of the keyspace can tell who holds a lock.
/// It also prefixes every warning emitted by the session and the lock engine.
///
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MemberId(String);

impl MemberId {
    ///
    /// Generates a fresh 128-bit random identity rendered as unpadded base64.
    ///
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let most_significant: u64 = rng.gen();
        let least_significant: u64 = rng.gen();
        Self::from_halves(most_significant, least_significant)
    }

    fn from_halves(most_significant: u64, least_significant: u64) -> Self {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&most_significant.to_be_bytes());
        buf[8..].copy_from_slice(&least_significant.to_be_bytes());
        Self(STANDARD_NO_PAD.encode(buf))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for MemberId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
