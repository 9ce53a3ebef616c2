//! Just enough Solidity ABI encoding for the calls the engine makes:
//! static words (address, uint, bytes32) plus dynamic `bytes`.

use tiny_keccak::{Hasher, Keccak};
use vesper_common::{Address, Hash32};

/// keccak256 of arbitrary data.
pub fn keccak256(data: &[u8]) -> Hash32 {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut hash = [0u8; 32];
    hasher.finalize(&mut hash);
    hash
}

/// 4-byte function selector for a canonical signature such as `"balanceOf(address)"`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(u128),
    Bytes32(Hash32),
    Bytes(Vec<u8>),
}

pub fn address_word(addr: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(addr);
    word
}

pub fn uint_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// `abi.encode(tokens...)`
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let head_len = tokens.len() * 32;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for token in tokens {
        match token {
            Token::Address(a) => head.extend_from_slice(&address_word(a)),
            Token::Uint(v) => head.extend_from_slice(&uint_word(*v)),
            Token::Bytes32(b) => head.extend_from_slice(b),
            Token::Bytes(data) => {
                head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
                tail.extend_from_slice(&uint_word(data.len() as u128));
                tail.extend_from_slice(data);
                let pad = (32 - data.len() % 32) % 32;
                tail.extend(std::iter::repeat(0u8).take(pad));
            }
        }
    }
    head.extend_from_slice(&tail);
    head
}

/// `abi.encodeWithSignature(signature, tokens...)`
pub fn encode_call(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&encode(tokens));
    data
}

/// Read the `index`-th 32-byte word of return data.
pub fn word(data: &[u8], index: usize) -> Option<&[u8]> {
    data.get(index * 32..index * 32 + 32)
}

pub fn decode_address(data: &[u8], index: usize) -> Option<Address> {
    let w = word(data, index)?;
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&w[12..]);
    Some(addr)
}

/// Decode a uint word; values wider than 128 bits saturate.
pub fn decode_uint(data: &[u8], index: usize) -> Option<u128> {
    let w = word(data, index)?;
    if w[..16].iter().any(|b| *b != 0) {
        return Some(u128::MAX);
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&w[16..]);
    Some(u128::from_be_bytes(buf))
}
