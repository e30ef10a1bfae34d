use std::fmt;

use rand::Rng;

/// Azureus-style prefix for generated ids.
const PEER_ID_PREFIX: &[u8] = b"-UW0001-";

/// A 20-byte peer identity, stable for the life of a client.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generates a prefixed id using the caller's RNG, so a seeded client
    /// produces a reproducible identity.
    pub fn generate(rng: &mut impl Rng) -> Self {
        let mut id = [0u8; 20];
        id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
        rng.fill(&mut id[PEER_ID_PREFIX.len()..]);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The Azureus client code, e.g. `UW0001`, when the id uses that layout.
    pub fn client_id(&self) -> Option<&str> {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            std::str::from_utf8(&self.0[1..7]).ok()
        } else {
            None
        }
    }

    /// Clients known to number their outbound extended messages with their
    /// own IDs instead of ours. A malformed extended message from one of
    /// these is treated as a clean shutdown rather than a violation.
    pub fn uses_own_extension_ids(&self) -> bool {
        self.0.starts_with(b"-SD0100-") || self.0.starts_with(b"-XL0012-")
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client) => write!(f, "PeerId({client})"),
            None => write!(f, "PeerId({:02x?})", &self.0[..8]),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{b:02x}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generated_ids_are_prefixed_and_distinct() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = PeerId::generate(&mut rng);
        let b = PeerId::generate(&mut rng);
        assert_ne!(a, b);
        assert_eq!(a.client_id(), Some("UW0001"));
    }

    #[test]
    fn seeded_generation_is_deterministic() {
        let a = PeerId::generate(&mut StdRng::seed_from_u64(7));
        let b = PeerId::generate(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn quirk_prefixes() {
        let mut id = [b'x'; 20];
        id[..8].copy_from_slice(b"-SD0100-");
        assert!(PeerId(id).uses_own_extension_ids());
        id[..8].copy_from_slice(b"-XL0012-");
        assert!(PeerId(id).uses_own_extension_ids());
        id[..8].copy_from_slice(b"-TR4040-");
        assert!(!PeerId(id).uses_own_extension_ids());
    }
}
