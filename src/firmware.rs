//! Firmware Update Engine — fetches a signed, encrypted firmware image in
//! chunks and flashes it to the inactive OTA slot, rolling back
//! automatically if the new image fails to boot cleanly.
//!
//! State machine: `Idle -> Checking -> Downloading -> Verifying -> Applying
//! -> Completed` (or `Error` at any step, `RolledBack` discovered at next
//! boot). Grounded on [`crate::rpc::ota::OtaManager`]'s `esp-ota`-backed
//! begin/write/finalize shape, generalized with a manifest-driven,
//! per-chunk AES-128-CBC decrypt and a SHA-256 + RSA-PSS signature check
//! before the image is ever marked bootable.

use std::time::Duration;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use log::{info, warn};
use rsa::pss::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::store::{key, namespace, PersistentStorePort};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Largest firmware image this device will ever accept.
pub const MAX_FIRMWARE_SIZE: u32 = 4 * 1024 * 1024;

/// Manifest describing the pending firmware image, as returned by the
/// `/ota/check/{device-id}` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareManifest {
    pub version: String,
    pub size: u32,
    /// Size of every chunk but (possibly) the last, in bytes — how the
    /// downloader splits `/ota/chunk/{device-id}/{index}` requests.
    pub chunk_size: u32,
    /// Total number of chunks the downloader must request, `0..chunk_count`.
    pub chunk_count: u32,
    pub sha256: [u8; 32],
    /// RSA-PSS signature over `sha256`.
    pub signature: Vec<u8>,
    /// First 12 bytes of every chunk's IV derivation input; the remaining
    /// 4 bytes are the chunk index, big-endian.
    pub manifest_iv: [u8; 12],
}

/// Pre-shared key material for this update: the AES-128 key used both to
/// derive each chunk's IV and to decrypt it, and the cloud's RSA public key
/// used to verify the manifest signature.
pub struct UpdateKeys {
    pub update_key: [u8; 16],
    pub signing_key: RsaPublicKey,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FirmwareState {
    Idle,
    Checking,
    Downloading { manifest: FirmwareManifest, bytes_written: u32 },
    Verifying { manifest: FirmwareManifest },
    Applying,
    Completed { version: String },
    Error(&'static str),
}

/// How many chunks accumulate before [`FirmwareUpdater::persist_progress`]
/// is worth calling again — balances NVS wear against how much download
/// progress a mid-update reboot would lose.
pub const CHUNK_PERSIST_INTERVAL: u32 = 4;

pub struct FirmwareUpdater {
    state: FirmwareState,
    hasher: Sha256,
    chunks_written: u32,
    #[cfg(target_os = "espidf")]
    ota_update: Option<esp_ota::OtaUpdate>,
}

impl FirmwareUpdater {
    pub fn new() -> Self {
        Self {
            state: FirmwareState::Idle,
            hasher: Sha256::new(),
            chunks_written: 0,
            #[cfg(target_os = "espidf")]
            ota_update: None,
        }
    }

    /// Rebuild an updater from whatever phase/manifest survived the last
    /// reboot. `esp_ota::OtaUpdate::begin()` erases the inactive partition,
    /// so bytes already flashed before a reboot can't be trusted — a
    /// `downloading` or `verifying` checkpoint resumes by re-opening the
    /// slot and restarting the chunk loop from zero, but skips the
    /// `/ota/check` round trip by reusing the persisted manifest instead of
    /// discarding the update entirely.
    pub fn hydrate<S: PersistentStorePort>(store: &S) -> Self {
        let mut updater = Self::new();
        let Some(phase) = store.get_json::<String>(namespace::FIRMWARE, key::FIRMWARE_STATE) else {
            return updater;
        };
        if phase != "downloading" && phase != "verifying" {
            return updater;
        }
        let Some(manifest) = store.get_json::<FirmwareManifest>(namespace::FIRMWARE, key::FIRMWARE_PENDING_MANIFEST)
        else {
            return updater;
        };
        info!("firmware: resuming update {} after reboot (chunk progress discarded, slot re-opened)", manifest.version);
        if let Err(e) = updater.enter_downloading(manifest) {
            warn!("firmware: failed to resume in-progress update: {e}");
        }
        updater
    }

    pub fn state(&self) -> &FirmwareState {
        &self.state
    }

    /// Number of chunks successfully written since the current download
    /// began — the value [`persist_progress`](Self::persist_progress) saves
    /// to `FIRMWARE_CHUNKS_RECEIVED`.
    pub fn chunks_written(&self) -> u32 {
        self.chunks_written
    }

    /// Record that a check is underway (called before the `/ota/check`
    /// request so a concurrent poll doesn't race a second check).
    pub fn begin_check(&mut self) {
        self.state = FirmwareState::Checking;
    }

    /// Accept a fetched manifest and open the inactive OTA slot. Declines
    /// (and moves to `Error`) if the declared size is out of range or a
    /// download is already underway.
    pub fn accept_manifest(&mut self, manifest: FirmwareManifest) -> Result<(), Error> {
        if !matches!(self.state, FirmwareState::Idle | FirmwareState::Checking) {
            return Err(Error::EnvelopeFailure);
        }
        if manifest.size == 0 || manifest.size > MAX_FIRMWARE_SIZE {
            self.state = FirmwareState::Error("firmware size out of range");
            return Err(Error::ConfigInvalid("firmware-size", "out of range"));
        }
        self.enter_downloading(manifest)
    }

    fn enter_downloading(&mut self, manifest: FirmwareManifest) -> Result<(), Error> {
        #[cfg(target_os = "espidf")]
        {
            let update = esp_ota::OtaUpdate::begin().map_err(|e| {
                warn!("firmware: esp-ota begin failed: {e:?}");
                self.state = FirmwareState::Error("ota partition unavailable");
                Error::Persistence
            })?;
            self.ota_update = Some(update);
        }

        self.hasher = Sha256::new();
        self.chunks_written = 0;
        info!("firmware: accepted manifest {} ({} bytes)", manifest.version, manifest.size);
        self.state = FirmwareState::Downloading { manifest, bytes_written: 0 };
        Ok(())
    }

    /// Persist the current phase, and — for the two resumable phases — the
    /// manifest and chunk progress needed to pick the download back up.
    /// Every other phase clears those two keys: `checking` and `applying`
    /// aren't resumable, and a terminal state has nothing left to resume.
    pub fn persist_progress<S: PersistentStorePort>(&self, store: &mut S) {
        let (tag, manifest) = match &self.state {
            FirmwareState::Downloading { manifest, .. } => ("downloading", Some(manifest)),
            FirmwareState::Verifying { manifest } => ("verifying", Some(manifest)),
            FirmwareState::Checking | FirmwareState::Applying => return,
            FirmwareState::Idle => ("idle", None),
            FirmwareState::Completed { .. } => ("completed", None),
            FirmwareState::Error(_) => ("error", None),
        };

        if let Err(e) = store.put_json(namespace::FIRMWARE, key::FIRMWARE_STATE, &tag.to_string()) {
            warn!("firmware: failed to persist state: {e}");
        }
        match manifest {
            Some(manifest) => {
                if let Err(e) = store.put_json(namespace::FIRMWARE, key::FIRMWARE_PENDING_MANIFEST, manifest) {
                    warn!("firmware: failed to persist manifest: {e}");
                }
                if let Err(e) = store.put_u32(namespace::FIRMWARE, key::FIRMWARE_CHUNKS_RECEIVED, self.chunks_written) {
                    warn!("firmware: failed to persist chunk progress: {e}");
                }
            }
            None => {
                let _ = store.delete(namespace::FIRMWARE, key::FIRMWARE_PENDING_MANIFEST);
                let _ = store.delete(namespace::FIRMWARE, key::FIRMWARE_CHUNKS_RECEIVED);
            }
        }
    }

    /// Decrypt and flash one chunk. `index` is the chunk's sequence number,
    /// used (with the manifest IV) to derive this chunk's unique CBC IV —
    /// chunks can be decrypted independently, in any retried order, as long
    /// as each arrives with its correct index.
    pub fn write_chunk(&mut self, index: u32, ciphertext: &[u8], keys: &UpdateKeys) -> Result<u32, Error> {
        let FirmwareState::Downloading { manifest, bytes_written } = &self.state else {
            return Err(Error::EnvelopeFailure);
        };
        let manifest = manifest.clone();
        let bytes_written = *bytes_written;

        let expected_after = bytes_written + ciphertext.len() as u32;
        if expected_after > manifest.size {
            self.state = FirmwareState::Error("chunk would overflow declared size");
            return Err(Error::BufferOverflow);
        }
        let is_last_chunk = expected_after == manifest.size;

        let iv = derive_chunk_iv(&keys.update_key, &manifest.manifest_iv, index);
        let plaintext = decrypt_chunk(&keys.update_key, &iv, ciphertext, is_last_chunk)
            .ok_or(Error::EnvelopeFailure)?;

        #[cfg(target_os = "espidf")]
        {
            if let Some(ref mut update) = self.ota_update {
                use std::io::Write as _;
                update.write_all(&plaintext).map_err(|e| {
                    warn!("firmware: flash write failed: {e:?}");
                    self.abort();
                    Error::Persistence
                })?;
            } else {
                return Err(Error::EnvelopeFailure);
            }
        }

        self.hasher.update(&plaintext);
        let new_written = bytes_written + ciphertext.len() as u32;
        self.chunks_written += 1;
        self.state = FirmwareState::Downloading { manifest, bytes_written: new_written };
        Ok(new_written)
    }

    /// Once every chunk has arrived, verify the content hash and signature
    /// before marking the new image bootable.
    pub fn finalize(&mut self, keys: &UpdateKeys) -> Result<(), Error> {
        let FirmwareState::Downloading { manifest, bytes_written } = self.state.clone() else {
            return Err(Error::EnvelopeFailure);
        };
        if bytes_written != manifest.size {
            return Err(Error::EnvelopeFailure);
        }

        self.state = FirmwareState::Verifying { manifest: manifest.clone() };

        let digest: [u8; 32] = self.hasher.finalize_reset().into();
        if digest != manifest.sha256 {
            warn!("firmware: content hash mismatch for {}", manifest.version);
            self.state = FirmwareState::Error("content hash mismatch");
            self.abort();
            return Err(Error::HashMismatch);
        }

        if !verify_signature(&keys.signing_key, &manifest.sha256, &manifest.signature) {
            warn!("firmware: signature verification failed for {}", manifest.version);
            self.state = FirmwareState::Error("signature invalid");
            self.abort();
            return Err(Error::SignatureInvalid);
        }

        self.state = FirmwareState::Applying;

        #[cfg(target_os = "espidf")]
        {
            if let Some(update) = self.ota_update.take() {
                let mut completed = update.finalize().map_err(|e| {
                    warn!("firmware: esp-ota finalize failed: {e:?}");
                    self.state = FirmwareState::Error("ota finalize failed");
                    Error::Persistence
                })?;
                completed.set_as_boot_partition().map_err(|e| {
                    warn!("firmware: set_as_boot_partition failed: {e:?}");
                    self.state = FirmwareState::Error("boot partition set failed");
                    Error::Persistence
                })?;
            } else {
                self.state = FirmwareState::Error("no ota session");
                return Err(Error::EnvelopeFailure);
            }
        }

        info!("firmware: {} verified and staged, ready to reboot", manifest.version);
        self.state = FirmwareState::Completed { version: manifest.version };
        Ok(())
    }

    /// Abandon the in-progress update and return to `Idle`.
    pub fn abort(&mut self) {
        #[cfg(target_os = "espidf")]
        {
            self.ota_update.take();
        }
        self.state = FirmwareState::Idle;
        warn!("firmware: update aborted");
    }

    /// Soft-reset into the newly flashed firmware.
    #[cfg(target_os = "espidf")]
    pub fn reboot(&self) -> ! {
        info!("firmware: rebooting into new image");
        esp_ota::restart();
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn reboot(&self) -> ! {
        panic!("firmware reboot (simulation — no real hardware reset)");
    }
}

impl Default for FirmwareUpdater {
    fn default() -> Self {
        Self::new()
    }
}

/// Confirm the currently running image is good, cancelling ESP-IDF's
/// automatic rollback-on-repeated-crash. Call once early in boot, after the
/// Task Supervisor's tasks have started cleanly.
#[cfg(target_os = "espidf")]
pub fn confirm_boot() {
    match esp_ota::mark_app_valid() {
        Ok(()) => info!("firmware: boot confirmed, rollback cancelled"),
        Err(e) => warn!("firmware: mark_app_valid failed: {e:?}"),
    }
}

#[cfg(not(target_os = "espidf"))]
pub fn confirm_boot() {
    info!("firmware: boot confirmation (simulation): skipped");
}

const STATUS_POST_TIMEOUT: Duration = Duration::from_secs(3);

/// Body posted to `/ota/status/{device-id}` at every phase transition.
#[derive(Debug, Clone, Serialize)]
pub struct OtaStatusReport<'a> {
    pub device_id: &'a str,
    pub phase: &'static str,
    pub version: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Best-effort status push — a dropped report doesn't abort the update,
/// the next phase transition (or the next check cycle) will report again.
pub fn post_status(endpoint: &str, report: &OtaStatusReport<'_>) {
    if let Err(e) = ureq::post(endpoint).timeout(STATUS_POST_TIMEOUT).send_json(report) {
        warn!("firmware: POST {endpoint} failed: {e}");
    }
}

/// Derive chunk `index`'s CBC IV: `AES-128-ECB(update_key, manifest_iv ++
/// be_bytes(index))`, a single-block encryption since the 12-byte IV
/// prefix plus the 4-byte index exactly fill one AES block.
fn derive_chunk_iv(update_key: &[u8; 16], manifest_iv: &[u8; 12], index: u32) -> [u8; 16] {
    let mut block_bytes = [0u8; 16];
    block_bytes[..12].copy_from_slice(manifest_iv);
    block_bytes[12..].copy_from_slice(&index.to_be_bytes());

    let cipher = Aes128::new(GenericArray::from_slice(update_key));
    let mut block = GenericArray::clone_from_slice(&block_bytes);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// Decrypt one chunk. Only the final chunk carries PKCS7 padding (the
/// image's true length isn't a multiple of the AES block size in general).
fn decrypt_chunk(key: &[u8; 16], iv: &[u8; 16], ciphertext: &[u8], is_last_chunk: bool) -> Option<Vec<u8>> {
    let key_ga = GenericArray::from_slice(key);
    let iv_ga = GenericArray::from_slice(iv);
    let decryptor = Aes128CbcDec::new(key_ga, iv_ga);
    if is_last_chunk {
        decryptor.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).ok()
    } else {
        decryptor.decrypt_padded_vec_mut::<cbc::cipher::block_padding::NoPadding>(ciphertext).ok()
    }
}

fn verify_signature(public_key: &RsaPublicKey, digest: &[u8; 32], signature_bytes: &[u8]) -> bool {
    let Ok(signature) = Signature::try_from(signature_bytes) else {
        return false;
    };
    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    verifying_key.verify(digest, &signature).is_ok()
}
