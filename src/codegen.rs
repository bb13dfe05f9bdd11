use rand::{Rng, thread_rng};

const ALPHABET : &[u8]= b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

pub const CODE_LEN: usize = 8;

/// Short human-readable session code handed to a client on connect.
pub fn make_code(len: usize) -> String {
    let mut rng = thread_rng();

    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_uses_unambiguous_alphabet() {
        let code = make_code(CODE_LEN);

        assert_eq!(code.len(), CODE_LEN);
        assert!(code.bytes().all(|b| ALPHABET.contains(&b)));
        assert!(!code.contains('0') && !code.contains('O') && !code.contains('1'));
    }
}
