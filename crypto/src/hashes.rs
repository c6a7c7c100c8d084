use sha2::{Digest, Sha256};

pub const SHA256_LEN: usize = 32;

pub fn sha256(data: &[u8]) -> [u8; SHA256_LEN] {
    Sha256::digest(data).into()
}

/// Feed `data` into `hasher` preceded by its length as u32 LE.
pub fn update_length_prefixed(hasher: &mut Sha256, data: &[u8]) {
    hasher.update((data.len() as u32).to_le_bytes());
    hasher.update(data);
}

/// Digest over a sequence of length-prefixed fields.
pub fn sha256_fields(fields: &[&[u8]]) -> [u8; SHA256_LEN] {
    let mut hasher = Sha256::new();
    for field in fields {
        update_length_prefixed(&mut hasher, field);
    }
    hasher.finalize().into()
}

/// SHA-256 over a byte stream that arrives in pieces, with a running size.
#[derive(Clone, Default)]
pub struct RollingHash {
    hasher: Sha256,
    total_bytes: u64,
}

impl RollingHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.total_bytes += data.len() as u64;
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn finalize(self) -> [u8; SHA256_LEN] {
        self.hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn rolling_hash_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut rolling = RollingHash::new();
        for piece in data.chunks(777) {
            rolling.update(piece);
        }
        assert_eq!(rolling.total_bytes(), data.len() as u64);
        assert_eq!(rolling.finalize(), sha256(&data));
    }

    #[test]
    fn length_prefix_separates_fields() {
        assert_ne!(
            sha256_fields(&[b"ab", b"c"]),
            sha256_fields(&[b"a", b"bc"])
        );
    }

    proptest::proptest! {
        #[test]
        fn split_point_changes_field_digest(
            data in proptest::collection::vec(proptest::prelude::any::<u8>(), 2..64),
            split in 1usize..63,
        ) {
            let split = split.min(data.len() - 1);
            let (left, right) = data.split_at(split);
            proptest::prop_assert_ne!(sha256_fields(&[left, right]), sha256_fields(&[&data[..]]));
        }
    }
}
