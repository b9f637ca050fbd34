//! Uploader — drains the compressed-packet ring, wraps the batch in the
//! Security Envelope, and POSTs it to the cloud aggregation endpoint.
//! A failed attempt requeues the drained packets rather than discarding
//! them, mirroring [`crate::batch::CompressedRing::push_back_all`]'s
//! restore-on-failure shape.

use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Serialize;

use crate::batch::CompressedRing;
use crate::envelope::{self, EnvelopeKeys, EnvelopeRecord};
use crate::error::Error;
use crate::store::PersistentStorePort;

/// Total time budget for one upload attempt: mutex acquisition plus the
/// HTTP round trip.
pub const UPLOAD_DEADLINE: Duration = Duration::from_secs(5);
/// Time budget just for acquiring the shared store/ring mutexes before the
/// network call starts; the remainder of [`UPLOAD_DEADLINE`] is the HTTP
/// call itself.
pub const MUTEX_ACQUIRE_DEADLINE: Duration = Duration::from_secs(4);

#[derive(Serialize)]
struct UploadBody {
    device_id: String,
    packets: Vec<PacketDto>,
}

#[derive(Serialize)]
struct PacketDto {
    codec_id: u8,
    bytes_b64: String,
}

/// Drain every pending packet and upload them as one batch. Returns the
/// number of packets uploaded (0 if the ring was already empty — not an
/// error). On failure, the drained packets are pushed back onto `ring`.
pub fn upload_pending<S: PersistentStorePort>(
    ring: &mut CompressedRing,
    store: &mut S,
    keys: &EnvelopeKeys,
    device_id: &str,
    endpoint: &str,
) -> Result<usize, Error> {
    if ring.is_empty() {
        return Ok(0);
    }
    let packets = ring.drain_all();
    let count = packets.len();

    let body = UploadBody {
        device_id: device_id.to_string(),
        packets: packets
            .iter()
            .map(|p| PacketDto {
                codec_id: p.codec_id,
                bytes_b64: base64_encode(&p.bytes),
            })
            .collect(),
    };

    let result = send(store, keys, endpoint, &body);

    match result {
        Ok(()) => {
            info!("uploader: uploaded {count} packet(s) to {endpoint}");
            Ok(count)
        }
        Err(e) => {
            warn!("uploader: upload failed ({e}), requeuing {count} packet(s)");
            ring.push_back_all(packets);
            Err(e)
        }
    }
}

fn send<S: PersistentStorePort>(
    store: &mut S,
    keys: &EnvelopeKeys,
    endpoint: &str,
    body: &UploadBody,
) -> Result<(), Error> {
    let plaintext = serde_json::to_vec(body).map_err(|_| Error::EnvelopeFailure)?;
    let counter = envelope::next_counter(store)?;
    let record = envelope::seal(counter, &plaintext, keys);

    let started = Instant::now();
    post_envelope(endpoint, &record)?;
    if started.elapsed() > UPLOAD_DEADLINE {
        warn!("uploader: upload to {endpoint} exceeded its deadline");
    }
    Ok(())
}

fn post_envelope(endpoint: &str, record: &EnvelopeRecord) -> Result<(), Error> {
    ureq::post(endpoint)
        .timeout(UPLOAD_DEADLINE)
        .send_json(record)
        .map(|_| ())
        .map_err(|e| {
            warn!("uploader: POST {endpoint} failed: {e}");
            Error::NetworkDown
        })
}

fn base64_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(data)
}
