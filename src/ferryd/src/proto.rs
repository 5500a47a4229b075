//! Operations served by the daemon.
use std::hash::Hasher;

use fnv::FnvHasher;

use ferry::{proc_struct, BulkDescriptor};

pub const BULK_WRITE: &str = "bulk_write";
pub const BULK_READ: &str = "bulk_read";

proc_struct! {
    /// Upload: the server pulls `data` from the caller.
    #[derive(Debug, Clone)]
    pub struct WriteIn {
        pub client: String,
        pub data: BulkDescriptor,
    }
}

proc_struct! {
    /// Download: the server pushes a pattern derived from `seed` into `data`.
    #[derive(Debug, Clone)]
    pub struct ReadIn {
        pub seed: u32,
        pub data: BulkDescriptor,
    }
}

proc_struct! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransferOut {
        pub len: u64,
        pub checksum: u64,
    }
}

pub fn checksum(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

/// Deterministic content of a download.
pub fn pattern(seed: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed) as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_depends_on_seed() {
        assert_eq!(pattern(0, 4), vec![0, 31, 62, 93]);
        assert_ne!(checksum(&pattern(1, 64)), checksum(&pattern(2, 64)));
    }

    #[test]
    fn transfer_out_roundtrip() {
        let out = TransferOut {
            len: 4096,
            checksum: 0xfeed,
        };
        let bytes = ferry::proc::encode(&out).unwrap();
        assert_eq!(bytes.len(), 16);
        let back: TransferOut = ferry::proc::decode(&bytes, None).unwrap();
        assert_eq!(back, out);
    }
}
