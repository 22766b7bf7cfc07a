//! Canonicalization of PEM trust-anchor bundles.
//!
//! A stored trust bundle must compare byte-equal to every logically equal
//! bundle, so downstream consumers can hash, diff, or reorder freely. The
//! normalizer strips inter-block data and per-block headers, re-encodes each
//! certificate with standard line wrapping, deduplicates, and sorts.

use std::collections::BTreeSet;

use pem::{EncodeConfig, LineEnding, Pem};
use thiserror::Error;

/// Failure to canonicalize a PEM bundle.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The input contained a PEM block whose type is not `CERTIFICATE`.
    #[error("bad block type {0:?}")]
    InvalidBlock(String),

    /// The input contained a malformed PEM block.
    #[error("malformed PEM block: {0}")]
    Malformed(#[from] pem::PemError),
}

/// Re-encode a DER certificate as a canonical PEM block: `CERTIFICATE` type,
/// no headers, 64-column base64, LF line endings, trailing newline.
pub fn encode_certificate_block(der: &[u8]) -> String {
    let block = Pem::new("CERTIFICATE", der.to_vec());
    pem::encode_config(&block, EncodeConfig::new().set_line_ending(LineEnding::LF))
}

/// Find framed PEM blocks in `input`, ignoring any bytes outside the
/// BEGIN/END framing.
fn scan_blocks(input: &str) -> Result<Vec<Pem>, NormalizeError> {
    const BEGIN: &str = "-----BEGIN ";
    const END: &str = "-----END ";
    const TERMINATOR: &str = "-----";

    let mut blocks = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find(BEGIN) {
        let framed = &rest[start..];
        let Some(end) = framed.find(END) else { break };
        let Some(term) = framed[end + END.len()..].find(TERMINATOR) else {
            break;
        };
        let block_end = end + END.len() + term + TERMINATOR.len();
        blocks.push(pem::parse(&framed[..block_end])?);
        rest = &framed[block_end..];
    }
    Ok(blocks)
}

/// Canonicalize a PEM trust-anchor bundle.
///
/// Decodes every PEM block in `input`, ignoring inter-block bytes. Any block
/// whose type is not `CERTIFICATE` fails the whole bundle. Surviving blocks
/// are re-encoded canonically (dropping headers and line-wrapping
/// variations), deduplicated by their encoded form, sorted by byte order,
/// and joined with single `\n` separators.
///
/// An input with zero blocks normalizes to the empty string; whether that is
/// acceptable is the caller's decision.
pub fn normalize(input: &str) -> Result<String, NormalizeError> {
    let mut blocks = BTreeSet::new();

    for block in scan_blocks(input)? {
        if block.tag() != "CERTIFICATE" {
            return Err(NormalizeError::InvalidBlock(block.tag().to_string()));
        }
        blocks.insert(encode_certificate_block(block.contents()));
    }

    Ok(blocks.into_iter().collect::<Vec<_>>().join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(der: &[u8]) -> String {
        encode_certificate_block(der)
    }

    #[test]
    fn empty_input_normalizes_to_empty() {
        assert_eq!(normalize("").unwrap(), "");
        assert_eq!(normalize("no pem here at all").unwrap(), "");
    }

    #[test]
    fn single_block_is_reencoded() {
        let input = block(&[1, 2, 3]);
        assert_eq!(normalize(&input).unwrap(), input);
    }

    #[test]
    fn duplicates_are_dropped() {
        let b = block(&[9, 9, 9]);
        let doubled = format!("{}\n{}", b, b);
        assert_eq!(normalize(&doubled).unwrap(), b);
    }

    #[test]
    fn order_is_deterministic() {
        let a = block(&[1]);
        let b = block(&[2]);
        let forward = normalize(&format!("{}{}", a, b)).unwrap();
        let backward = normalize(&format!("{}{}", b, a)).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn interblock_garbage_is_ignored() {
        let a = block(&[4, 5]);
        let noisy = format!("leading junk\n{}middle junk\n{}trailing", a, a);
        assert_eq!(normalize(&noisy).unwrap(), a);
    }

    #[test]
    fn headers_are_stripped() {
        let a = block(&[7, 7]);
        let with_header = a.replace(
            "-----BEGIN CERTIFICATE-----\n",
            "-----BEGIN CERTIFICATE-----\nBogus-Header: yes\n\n",
        );
        assert_eq!(normalize(&with_header).unwrap(), a);
    }

    #[test]
    fn non_certificate_block_fails() {
        let key = pem::encode_config(
            &Pem::new("PUBLIC KEY", vec![1, 2, 3]),
            EncodeConfig::new().set_line_ending(LineEnding::LF),
        );
        let err = normalize(&key).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidBlock(tag) if tag == "PUBLIC KEY"));
    }

    #[test]
    fn normalize_is_idempotent() {
        let inputs = [
            String::new(),
            block(&[1]),
            format!("{}\n{}", block(&[3]), block(&[2])),
            format!("junk{}junk{}", block(&[8]), block(&[8])),
        ];
        for input in inputs {
            let once = normalize(&input).unwrap();
            let twice = normalize(&once).unwrap();
            assert_eq!(once, twice);
        }
    }
}
