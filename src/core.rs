use std::fmt;

/// A 32-byte BLAKE3 hash identifying one node's computation.
///
/// The fingerprint covers the operator name (and version, if the operator
/// declares one) and the ordered arguments of a node, with node references
/// replaced by the fingerprint of the referenced node. Two nodes with equal
/// fingerprints are the same computation, so the fingerprint doubles as the
/// address of the node's output in the on-disk cache.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Fingerprint([u8; 32]);

impl<T> From<T> for Fingerprint
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Fingerprint(value.into())
    }
}

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental hasher for node fingerprints.
///
/// Every field is written with a one byte tag, and variable length fields are
/// prefixed with their length, so no two different argument sequences share
/// an encoding: `["ab", "c"]` and `["a", "bc"]` hash differently.
#[derive(Default)]
pub(crate) struct FingerprintHasher(blake3::Hasher);

const TAG_LITERAL: u8 = b'L';
const TAG_NODE: u8 = b'N';
const TAG_OPERATOR: u8 = b'O';
const TAG_VERSION: u8 = b'V';

impl FingerprintHasher {
    fn field(&mut self, tag: u8, bytes: &[u8]) {
        self.0.update(&[tag]);
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
    }

    pub(crate) fn literal(&mut self, value: &str) -> &mut Self {
        self.field(TAG_LITERAL, value.as_bytes());
        self
    }

    pub(crate) fn node(&mut self, fingerprint: &Fingerprint) -> &mut Self {
        self.0.update(&[TAG_NODE]);
        self.0.update(fingerprint.as_bytes());
        self
    }

    pub(crate) fn operator(&mut self, name: &str) -> &mut Self {
        self.field(TAG_OPERATOR, name.as_bytes());
        self
    }

    pub(crate) fn version(&mut self, version: &str) -> &mut Self {
        self.field(TAG_VERSION, version.as_bytes());
        self
    }

    pub(crate) fn finish(&self) -> Fingerprint {
        let bytes: [u8; 32] = self.0.finalize().into();
        Fingerprint::from(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_encoding() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x0f;
        let hex = Fingerprint::from(bytes).to_hex();

        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("ab00"));
        assert!(hex.ends_with("000f"));
    }

    #[test]
    fn test_literal_boundaries() {
        let a = FingerprintHasher::default()
            .literal("ab")
            .literal("c")
            .operator("Op")
            .finish();
        let b = FingerprintHasher::default()
            .literal("a")
            .literal("bc")
            .operator("Op")
            .finish();

        assert_ne!(a, b);
    }

    #[test]
    fn test_operator_not_confused_with_literal() {
        let a = FingerprintHasher::default().literal("Op").operator("").finish();
        let b = FingerprintHasher::default().operator("Op").finish();

        assert_ne!(a, b);
    }

    #[test]
    fn test_version_changes_hash() {
        let plain = FingerprintHasher::default().operator("Op").finish();
        let versioned = FingerprintHasher::default().operator("Op").version("2").finish();

        assert_ne!(plain, versioned);
    }
}
