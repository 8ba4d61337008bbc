mod id;

pub use id::*;

use rand::{distributions::Alphanumeric, thread_rng, Rng};

/// Characters allowed in access codes. Ambiguous ones (0/O, 1/I/L) are left
/// out since these codes are read aloud and typed by hand.
const CODE_CHARS: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

pub fn random_string(length: usize) -> String {
    let mut rng = thread_rng();

    std::iter::repeat(())
        .map(|_| rng.sample(Alphanumeric) as char)
        .take(length)
        .collect()
}

/// Generates a short human-enterable code.
pub fn random_code(length: usize) -> String {
    let mut rng = thread_rng();

    (0..length)
        .map(|_| CODE_CHARS[rng.gen_range(0..CODE_CHARS.len())] as char)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_uses_unambiguous_charset() {
        let code = random_code(64);

        assert_eq!(code.len(), 64);
        assert!(code.bytes().all(|c| CODE_CHARS.contains(&c)));
    }

    #[test]
    fn ids_are_unique() {
        struct Marker;

        let first: Id<Marker> = Id::new();
        let second: Id<Marker> = Id::new();

        assert_ne!(first, second);
    }
}
