use sha2::{Digest, Sha256};

pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_empty_input() {
        let digest = sha256d(b"");
        assert_eq!(
            hash256_to_hex(&digest),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn hex_is_lowercase_and_fixed_width() {
        let mut hash = ZERO_HASH;
        hash[0] = 0xab;
        hash[31] = 0x01;
        let hex = hash256_to_hex(&hash);
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("ab"));
        assert!(hex.ends_with("01"));
    }
}
