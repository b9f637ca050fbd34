//! Security Envelope — wraps every outbound telemetry payload in a replay-
//! resistant, integrity-checked record before the uploader hands it to
//! `ureq`.
//!
//! A persisted monotonic counter is incremented and written back *before*
//! it's used (see [`next_counter`]), so a failed upload leaves a gap in the
//! counter sequence rather than ever reusing one — the cloud side treats
//! gaps as tolerable (a missed upload) but a repeated or decreasing counter
//! as a replay attempt. The counter and the (optionally AES-128-CBC
//! encrypted) payload are HMAC-SHA256 authenticated together, then packed
//! into a JSON record with a base64 payload and a hex MAC, mirroring
//! [`crate::rpc::auth`]'s `hmac_sha256::HMAC::mac`/`verify` usage but for a
//! one-shot authenticator instead of a session handshake.

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use log::error;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::store::{key, namespace, PersistentStorePort};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// An envelope-wrapped payload, ready to be serialized as the HTTP request
/// body (or parsed back out of a response body for the rare inbound case).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeRecord {
    pub counter: u32,
    /// Base64 of the transmitted payload — ciphertext if `encrypted`,
    /// plaintext otherwise.
    pub payload_b64: String,
    /// Hex-encoded HMAC-SHA256 over `counter_be(4) ++ payload`.
    pub mac_hex: String,
    pub encrypted: bool,
}

/// Symmetric keys the envelope authenticates (and optionally encrypts)
/// with. Loaded once at startup from provisioned credentials.
#[derive(Clone)]
pub struct EnvelopeKeys {
    pub hmac_key: Vec<u8>,
    /// `Some` enables AES-128-CBC encryption of the payload; `None` sends
    /// it in the clear (still authenticated).
    pub aes_key: Option<[u8; 16]>,
}

/// Increment and persist the security counter, returning the new value.
/// Writing before returning means a crash or failed upload between this
/// call and the actual POST leaves a gap, never a reused counter.
///
/// `u32::MAX` is never incremented past: a counter reaching it has
/// exhausted the replay window, so outbound traffic halts for good rather
/// than wrapping back to a value the cloud has already seen.
pub fn next_counter<S: PersistentStorePort>(store: &mut S) -> Result<u32, Error> {
    let current = store.get_u32(namespace::SECURITY, key::SECURITY_COUNTER).unwrap_or(0);
    if current == u32::MAX {
        error!("envelope: replay counter exhausted, halting outbound traffic");
        return Err(Error::CounterExhausted);
    }
    let next = current + 1;
    store.put_u32(namespace::SECURITY, key::SECURITY_COUNTER, next)?;
    Ok(next)
}

/// Seal `payload` into an [`EnvelopeRecord`] under `counter`.
pub fn seal(counter: u32, payload: &[u8], keys: &EnvelopeKeys) -> EnvelopeRecord {
    let (transmitted, encrypted) = match keys.aes_key {
        Some(aes_key) => (encrypt(&aes_key, payload), true),
        None => (payload.to_vec(), false),
    };

    let mac = authenticator(counter, &transmitted, &keys.hmac_key);

    EnvelopeRecord {
        counter,
        payload_b64: base64_encode(&transmitted),
        mac_hex: hex::encode(mac),
        encrypted,
    }
}

/// Verify and open an [`EnvelopeRecord`], rejecting replays (`record.counter
/// <= last_seen`) and tampered records before decrypting.
pub fn open(record: &EnvelopeRecord, keys: &EnvelopeKeys, last_seen: u32) -> Result<Vec<u8>, Error> {
    if record.counter <= last_seen {
        return Err(Error::EnvelopeFailure);
    }

    let transmitted = base64_decode(&record.payload_b64).ok_or(Error::EnvelopeFailure)?;
    let given = hex::decode(&record.mac_hex).map_err(|_| Error::EnvelopeFailure)?;
    let given: [u8; 32] = given.try_into().map_err(|_| Error::EnvelopeFailure)?;
    if !hmac_sha256::HMAC::verify(mac_message(record.counter, &transmitted), &keys.hmac_key, &given) {
        return Err(Error::EnvelopeFailure);
    }

    if record.encrypted {
        let aes_key = keys.aes_key.ok_or(Error::EnvelopeFailure)?;
        decrypt(&aes_key, &transmitted).ok_or(Error::EnvelopeFailure)
    } else {
        Ok(transmitted)
    }
}

fn mac_message(counter: u32, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(4 + payload.len());
    message.extend_from_slice(&counter.to_be_bytes());
    message.extend_from_slice(payload);
    message
}

fn authenticator(counter: u32, payload: &[u8], hmac_key: &[u8]) -> [u8; 32] {
    hmac_sha256::HMAC::mac(mac_message(counter, payload), hmac_key)
}

/// Fixed CBC initialization vector for the envelope's optional encryption
/// layer. Pre-shared and never transmitted — every counter's authenticator
/// already covers the transmitted ciphertext, so a constant IV doesn't open
/// up the usual all-zero/reused-IV weakness of an un-authenticated cipher.
const ENVELOPE_IV: [u8; 16] = *b"ecowatt-envelope";

fn encrypt(key: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    let key_ga = GenericArray::from_slice(key);
    let iv_ga = GenericArray::from_slice(&ENVELOPE_IV);
    Aes128CbcEnc::new(key_ga, iv_ga).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

fn decrypt(key: &[u8; 16], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let key_ga = GenericArray::from_slice(key);
    let iv_ga = GenericArray::from_slice(&ENVELOPE_IV);
    Aes128CbcDec::new(key_ga, iv_ga)
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .ok()
}

fn base64_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(data)
}

fn base64_decode(data: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.decode(data).ok()
}
