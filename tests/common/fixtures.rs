// Test fixtures and data generators for integration tests

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Deterministic random data generator for reproducible tests
pub struct TestDataGenerator {
    rng: StdRng,
}

impl TestDataGenerator {
    /// Creates a new generator with a fixed seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generates random bytes of specified length
    pub fn random_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        self.rng.fill(&mut bytes[..]);
        bytes
    }
}

impl Default for TestDataGenerator {
    fn default() -> Self {
        Self::new(42)
    }
}

/// A media playlist exercising every rewrite case: a URI-carrying tag, a
/// relative segment, and an absolute foreign segment.
pub fn sample_media_playlist() -> &'static str {
    "#EXTM3U\n\
     #EXT-X-VERSION:3\n\
     #EXT-X-TARGETDURATION:4\n\
     #EXT-X-KEY:METHOD=AES-128,URI=\"key.php?id=1\"\n\
     #EXTINF:4.0,\n\
     seg0.ts\n\
     #EXTINF:4.0,\n\
     https://other.example/seg1.ts\n\
     #EXT-X-ENDLIST\n"
}

/// Common file sizes used across the integration suites.
pub mod file_sizes {
    pub const SMALL: usize = 1024;
    pub const SEGMENT: usize = 64 * 1024;
}
