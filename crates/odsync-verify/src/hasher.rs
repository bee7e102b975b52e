use digest::Digest;

/// Minimal hasher interface for streaming verification.
pub trait Hasher: Send {
    /// Update the hash with new data.
    fn update(&mut self, data: &[u8]);

    /// Finalize and return the digest. Consumes self to prevent reuse.
    fn finalize(self) -> Vec<u8>;
}

/// Generic hasher wrapper for any `digest::Digest` implementation.
pub struct DigestHasher<D: Digest + Send>(D);

impl<D: Digest + Send> DigestHasher<D> {
    pub fn from_digest(digest: D) -> Self {
        Self(digest)
    }
}

impl<D: Digest + Send> Hasher for DigestHasher<D> {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self) -> Vec<u8> {
        self.0.finalize().to_vec()
    }
}

pub type Sha256Hasher = DigestHasher<sha2::Sha256>;

impl Sha256Hasher {
    pub fn new() -> Self {
        DigestHasher::from_digest(sha2::Sha256::new())
    }

    /// One-shot digest of an in-memory buffer.
    pub fn digest(data: &[u8]) -> Vec<u8> {
        sha2::Sha256::digest(data).to_vec()
    }
}

impl Default for Sha256Hasher {
    fn default() -> Self {
        Self::new()
    }
}
