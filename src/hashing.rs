//! SHA-256 helpers shared by the deps manifest store and the process pool.

use sha2::{Digest, Sha256};

/// Hex digest over a sequence of strings, hashed in order.
pub fn sha256_hex<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let hash = hasher.finalize();
    format!("{hash:x}")
}

/// Identity of a worker launch command: SHA-256 over the exact argv.
///
/// Equal argv produce equal fingerprints; the process pool keys warm
/// workers by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandFingerprint([u8; 32]);

impl CommandFingerprint {
    pub fn of<S: AsRef<str>>(argv: &[S]) -> Self {
        let mut hasher = Sha256::new();
        for arg in argv {
            hasher.update(arg.as_ref().as_bytes());
        }
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for CommandFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}
