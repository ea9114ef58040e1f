// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Random protocol identifiers: Via branches, From/To tags and Call-IDs.

use rand::Rng;
use smol_str::SmolStr;

/// RFC 3261 magic cookie every compliant branch starts with.
pub const BRANCH_COOKIE: &str = "z9hG4bK";

/// Generates a Via branch: the magic cookie plus 16 random hex characters.
pub fn generate_branch() -> SmolStr {
    let mut buf = String::with_capacity(BRANCH_COOKIE.len() + 16);
    buf.push_str(BRANCH_COOKIE);
    push_hex(&mut buf, 16);
    SmolStr::new(buf)
}

/// Generates a From/To tag: 16 random hex characters.
pub fn generate_tag() -> SmolStr {
    let mut buf = String::with_capacity(16);
    push_hex(&mut buf, 16);
    SmolStr::new(buf)
}

/// Generates a Call-ID of the form `<32-hex>@<host>`.
pub fn generate_call_id(local_host: &str) -> SmolStr {
    let mut buf = String::with_capacity(33 + local_host.len());
    push_hex(&mut buf, 32);
    buf.push('@');
    buf.push_str(local_host);
    SmolStr::new(buf)
}

/// Returns true when a branch token carries the magic cookie followed by at
/// least seven characters.
pub fn is_valid_branch(branch: &str) -> bool {
    branch
        .strip_prefix(BRANCH_COOKIE)
        .map(|rest| rest.len() >= 7)
        .unwrap_or(false)
}

fn push_hex(buf: &mut String, count: usize) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    for _ in 0..count {
        buf.push(HEX[rng.gen_range(0..16)] as char);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_carries_cookie_and_hex_suffix() {
        let branch = generate_branch();
        assert!(branch.starts_with(BRANCH_COOKIE));
        let suffix = &branch[BRANCH_COOKIE.len()..];
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(is_valid_branch(&branch));
    }

    #[test]
    fn branches_are_unique_enough() {
        let a = generate_branch();
        let b = generate_branch();
        assert_ne!(a, b);
    }

    #[test]
    fn call_id_embeds_host() {
        let call_id = generate_call_id("192.0.2.1");
        let (token, host) = call_id.split_once('@').expect("separator");
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(host, "192.0.2.1");
    }

    #[test]
    fn tag_is_sixteen_hex_chars() {
        let tag = generate_tag();
        assert_eq!(tag.len(), 16);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn branch_validation_requires_cookie() {
        assert!(!is_valid_branch("badbranch"));
        assert!(!is_valid_branch("z9hG4bKabc"));
        assert!(is_valid_branch("z9hG4bK1234567"));
    }
}
