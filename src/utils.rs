//! Utility functions for minting entity identifiers

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix_and_are_unique() {
        let a = new_uuid_to_bech32("sample").unwrap();
        let b = new_uuid_to_bech32("sample").unwrap();
        assert!(a.starts_with("sample1"));
        assert_ne!(a, b);
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(new_uuid_to_bech32("").is_err());
    }
}
