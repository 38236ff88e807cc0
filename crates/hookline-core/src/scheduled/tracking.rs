//! Tracking parameters carried on lure URLs
//!
//! Personalization fields travel inside a single opaque query parameter
//! (`um`) so they are not readable at a glance. The `rd` redirect token of
//! "Tracking only" campaigns is AES-256-CFB ciphertext with a random IV.

use super::context::ContextError;
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

/// Query parameter holding the encoded personalization fields
pub const PHISH_PARAM: &str = "um";

/// Query parameter holding the encrypted redirect target
pub const REDIRECT_PARAM: &str = "rd";

const CODEC_SEED: &[u8] = b"hookline/um/v1";
const CHECK_LEN: usize = 4;
const BLOCK: usize = 16;

/// Encode parameters into an opaque, URL-safe value
pub fn encode_phish_params(params: &BTreeMap<String, String>) -> String {
    let payload = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();

    let mut bytes = Vec::with_capacity(CHECK_LEN + payload.len());
    bytes.extend_from_slice(&checksum(payload.as_bytes()));
    bytes.extend_from_slice(payload.as_bytes());
    mask(&mut bytes[CHECK_LEN..]);

    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode a value produced by [`encode_phish_params`].
///
/// Returns `None` for anything else, so ordinary query values can be told
/// apart from encoded ones.
pub fn decode_phish_params(value: &str) -> Option<BTreeMap<String, String>> {
    let mut bytes = URL_SAFE_NO_PAD.decode(value).ok()?;
    if bytes.len() < CHECK_LEN {
        return None;
    }

    let (check, payload) = bytes.split_at_mut(CHECK_LEN);
    mask(payload);
    if check[..] != checksum(payload)[..] {
        return None;
    }

    std::str::from_utf8(payload).ok()?;
    Some(url::form_urlencoded::parse(payload).into_owned().collect())
}

/// Append the encoded parameters to a URL
pub fn add_phish_params(url: &mut Url, params: &BTreeMap<String, String>) {
    url.query_pairs_mut()
        .append_pair(PHISH_PARAM, &encode_phish_params(params));
}

/// Replace a URL's query with the given pairs, ordered by key
pub fn set_sorted_query(url: &mut Url, pairs: &BTreeMap<String, String>) {
    if pairs.is_empty() {
        url.set_query(None);
        return;
    }
    url.query_pairs_mut().clear().extend_pairs(pairs);
}

fn checksum(payload: &[u8]) -> [u8; CHECK_LEN] {
    let digest = Sha256::digest(payload);
    let mut out = [0u8; CHECK_LEN];
    out.copy_from_slice(&digest[..CHECK_LEN]);
    out
}

fn mask(bytes: &mut [u8]) {
    for (i, chunk) in bytes.chunks_mut(32).enumerate() {
        let pad = Sha256::new()
            .chain_update(CODEC_SEED)
            .chain_update((i as u32).to_be_bytes())
            .finalize();
        for (b, k) in chunk.iter_mut().zip(pad.iter()) {
            *b ^= k;
        }
    }
}

/// AES-256-CFB cipher for the `rd` redirect token
#[derive(Clone)]
pub struct RedirectCipher {
    cipher: Aes256,
}

impl RedirectCipher {
    /// Create a cipher from a 32-byte key
    pub fn new(key: &[u8]) -> Result<Self, ContextError> {
        let cipher = Aes256::new_from_slice(key).map_err(|_| {
            ContextError::Encryption(format!("redirect key must be 32 bytes, got {}", key.len()))
        })?;
        Ok(Self { cipher })
    }

    /// Encrypt a redirect URL. Output is `IV || ciphertext`, base64url
    /// without padding.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let iv: [u8; BLOCK] = rand::random();

        let mut out = Vec::with_capacity(BLOCK + plaintext.len());
        out.extend_from_slice(&iv);
        out.extend(self.cfb(&iv, plaintext.as_bytes(), true));

        URL_SAFE_NO_PAD.encode(out)
    }

    /// Recover a redirect URL from an `rd` token
    pub fn decrypt(&self, token: &str) -> Result<String, ContextError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| ContextError::Encryption(format!("invalid rd token: {}", e)))?;
        if bytes.len() < BLOCK {
            return Err(ContextError::Encryption("rd token too short".to_string()));
        }

        let (iv, body) = bytes.split_at(BLOCK);
        let mut feedback = [0u8; BLOCK];
        feedback.copy_from_slice(iv);

        String::from_utf8(self.cfb(&feedback, body, false))
            .map_err(|_| ContextError::Encryption("rd token is not valid UTF-8".to_string()))
    }

    // Full-block (128-bit segment) CFB
    fn cfb(&self, iv: &[u8; BLOCK], input: &[u8], encrypt: bool) -> Vec<u8> {
        let mut feedback = GenericArray::clone_from_slice(iv);
        let mut output = Vec::with_capacity(input.len());

        for chunk in input.chunks(BLOCK) {
            let mut keystream = feedback.clone();
            self.cipher.encrypt_block(&mut keystream);

            let block: Vec<u8> = chunk
                .iter()
                .zip(keystream.iter())
                .map(|(a, k)| a ^ k)
                .collect();

            let ciphertext = if encrypt { block.as_slice() } else { chunk };
            if ciphertext.len() == BLOCK {
                feedback.copy_from_slice(ciphertext);
            }
            output.extend_from_slice(&block);
        }

        output
    }
}

impl std::fmt::Debug for RedirectCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RedirectCipher")
    }
}
