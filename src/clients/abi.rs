//! Minimal Solidity ABI encoding for the handful of calls the harness makes.

use num_bigint::BigUint;
use sha3::{Digest, Keccak256};

use crate::error::HarnessError;
use crate::models::Address;

/// ABI argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(BigUint),
    Bytes(Vec<u8>),
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

/// 4-byte function selector, e.g. `balanceOf(address)` -> `70a08231`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Event topic for a canonical event signature.
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
}

fn uint_word(value: &BigUint) -> Result<[u8; 32], HarnessError> {
    let bytes = value.to_bytes_be();
    if bytes.len() > 32 {
        return Err(HarnessError::Config(format!("value {value} exceeds uint256")));
    }
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(word)
}

/// Encode `selector ++ args` with dynamic `bytes` placed in the tail.
pub fn encode_call(signature: &str, args: &[Token]) -> Result<Vec<u8>, HarnessError> {
    let mut head: Vec<u8> = Vec::with_capacity(32 * args.len());
    let mut tail: Vec<u8> = Vec::new();
    let head_len = 32 * args.len();

    for arg in args {
        match arg {
            Token::Address(address) => head.extend_from_slice(&address.to_word()),
            Token::Uint(value) => head.extend_from_slice(&uint_word(value)?),
            Token::Bytes(data) => {
                let offset = BigUint::from(head_len + tail.len());
                head.extend_from_slice(&uint_word(&offset)?);
                tail.extend_from_slice(&uint_word(&BigUint::from(data.len()))?);
                tail.extend_from_slice(data);
                let pad = (32 - data.len() % 32) % 32;
                tail.extend(std::iter::repeat(0u8).take(pad));
            }
        }
    }

    let mut out = Vec::with_capacity(4 + head.len() + tail.len());
    out.extend_from_slice(&selector(signature));
    out.extend_from_slice(&head);
    out.extend_from_slice(&tail);
    Ok(out)
}

pub fn to_hex_data(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// JSON-RPC quantity (`0x`-prefixed, no leading zeroes).
pub fn to_quantity(value: &BigUint) -> String {
    format!("0x{}", value.to_str_radix(16))
}

/// Parse a JSON-RPC quantity or a 32-byte return word. Empty data is zero.
pub fn parse_uint(hex_str: &str) -> Result<BigUint, HarnessError> {
    let digits = hex_str.trim().trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(BigUint::ZERO);
    }
    BigUint::parse_bytes(digits.as_bytes(), 16)
        .ok_or_else(|| HarnessError::Transport(format!("invalid hex quantity: {hex_str}")))
}

/// `n`-th 32-byte word of ABI-encoded data, as an unsigned integer.
pub fn word_at(data_hex: &str, index: usize) -> Result<BigUint, HarnessError> {
    let digits = data_hex.trim().trim_start_matches("0x");
    let start = index * 64;
    let end = start + 64;
    if digits.len() < end {
        return Err(HarnessError::Transport(format!(
            "log data too short for word {index}: {} hex chars",
            digits.len()
        )));
    }
    parse_uint(&digits[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_selectors() {
        assert_eq!(hex::encode(selector("balanceOf(address)")), "70a08231");
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
        assert_eq!(hex::encode(selector("approve(address,uint256)")), "095ea7b3");
        assert_eq!(hex::encode(selector("allowance(address,address)")), "dd62ed3e");
    }

    #[test]
    fn test_encode_static_call() {
        let owner = Address([0x11; 20]);
        let data = encode_call("balanceOf(address)", &[Token::Address(owner)]).unwrap();
        assert_eq!(data.len(), 4 + 32);
        assert_eq!(&data[..4], &selector("balanceOf(address)"));
        assert_eq!(&data[4 + 12..], &[0x11; 20]);
    }

    #[test]
    fn test_encode_dynamic_bytes() {
        let data = encode_call(
            "setAuthPubkeyHash(bytes,uint32)",
            &[Token::Bytes(vec![0xab; 20]), Token::Uint(BigUint::from(5u32))],
        )
        .unwrap();
        // selector + 2 head words + length word + one padded data word
        assert_eq!(data.len(), 4 + 32 * 4);
        let body = &data[4..];
        assert_eq!(body[31], 0x40);
        assert_eq!(body[63], 5);
        assert_eq!(body[95], 20);
        assert_eq!(&body[96..116], &[0xab; 20]);
        assert!(body[116..128].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_uint_overflow_rejected() {
        let too_big = BigUint::from(1u32) << 256usize;
        assert!(encode_call("f(uint256)", &[Token::Uint(too_big)]).is_err());
    }

    #[test]
    fn test_parse_words() {
        assert_eq!(parse_uint("0x").unwrap(), BigUint::ZERO);
        assert_eq!(parse_uint("0x1bc16d674ec80000").unwrap(), BigUint::from(2_000_000_000_000_000_000u64));
        let data = format!("0x{}{}", "0".repeat(64), format!("{:0>64}", "2a"));
        assert_eq!(word_at(&data, 1).unwrap(), BigUint::from(42u32));
        assert!(word_at(&data, 2).is_err());
        assert_eq!(to_quantity(&BigUint::from(255u32)), "0xff");
    }
}
