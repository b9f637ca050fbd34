//! EcoWatt telemetry firmware — main entry point.
//!
//! Boots the ESP-IDF runtime, loads persisted configuration, then hands
//! every periodic subsystem to the [`ecowatt::supervisor::TaskSupervisor`]
//! as a core-pinned thread. The main thread itself just feeds the hardware
//! watchdog, polls WiFi, and watches for a deadline-driven restart request.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Adapters (outer ring)                        │
//! │  NvsAdapter   InverterUart   WifiAdapter   Esp32TimeAdapter   │
//! │  (store)      (protocol)     (connectivity) (clock)          │
//! │                                                                │
//! │  ─────────────────── Port trait boundary ──────────────────  │
//! │                                                                │
//! │  Polling Pipeline → Compression Tournament → Security         │
//! │  Envelope → Uploader          Command Executor                │
//! │  Configuration Reconciler     Firmware Update Engine           │
//! │  Power Manager                                                 │
//! │                                                                │
//! │  TaskSupervisor (core-pinned threads) · DeadlineMonitor        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use std::collections::HashMap;
use std::io::Read as _;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use ecowatt::adapters::device_id;
use ecowatt::adapters::nvs::NvsAdapter;
use ecowatt::adapters::time::Esp32TimeAdapter;
use ecowatt::adapters::uart::InverterUart;
use ecowatt::adapters::wifi::{ConnectivityPort, WifiAdapter};
use ecowatt::batch::Sample;
use ecowatt::commands::{Command, CommandExecutor};
use ecowatt::compression::tournament;
use ecowatt::compression::RegisterType;
use ecowatt::config::DeviceConfig;
use ecowatt::diagnostics;
use ecowatt::envelope::EnvelopeKeys;
use ecowatt::error::Error;
use ecowatt::events::FaultEvent;
use ecowatt::firmware::{FirmwareManifest, FirmwareState, FirmwareUpdater, OtaStatusReport, UpdateKeys};
use ecowatt::polling::{BatchAccumulator, PollOutcome, SampleQueue, SAMPLE_QUEUE_CAPACITY};
use ecowatt::power::PowerManager;
use ecowatt::reconciler;
use ecowatt::registers;
use ecowatt::store::{key, namespace, PersistentStorePort};
use ecowatt::supervisor::{network_timeout, SharedResources, TaskKind, TaskSupervisor, COMPRESSION_MUTEX_TIMEOUT, TRANSPORT_MUTEX_TIMEOUT};
use ecowatt::uploader;

/// Base URL for every cloud endpoint this firmware talks to. Overridden in
/// production builds via a provisioning record in NVS; a compile-time
/// default keeps host-side simulation runnable without that step.
const CLOUD_BASE_URL: &str = "https://ecowatt-cloud.example.com/api/v1";

type Resources = SharedResources<NvsAdapter, InverterUart>;

fn main() -> anyhow::Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  EcoWatt v{}                        ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    ecowatt::firmware::confirm_boot();

    // ── 2. Persistent store + device config ───────────────────────
    let nvs = NvsAdapter::new()?;
    let loaded: DeviceConfig = nvs.get_json(namespace::CONFIG, key::DEVICE_CONFIG).unwrap_or_default();
    let config = if loaded.validate().is_ok() {
        loaded
    } else {
        warn!("startup: persisted config failed validation, falling back to defaults");
        DeviceConfig::default()
    };

    let mac = device_id::read_mac();
    let dev_id = device_id::device_id(&mac).to_string();
    let dev_hostname = device_id::hostname(&mac);
    info!("Device ID: {} (hostname: {})", dev_id, dev_hostname);

    diagnostics::install_panic_hook(dev_id.clone());

    // ── 3. Security envelope keys ──────────────────────────────────
    // Provisioned once at manufacturing time; a missing key means the
    // device has never completed provisioning and telemetry stays queued
    // locally until it has.
    let hmac_key = nvs
        .get_json::<Vec<u8>>(namespace::SECURITY, key::SECURITY_HMAC_KEY)
        .unwrap_or_else(|| b"unprovisioned-hmac-key-change-me".to_vec());
    let aes_key = nvs.get_json::<[u8; 16]>(namespace::SECURITY, key::SECURITY_AES_KEY);
    let envelope_keys = EnvelopeKeys { hmac_key, aes_key };

    // ── 4. Connectivity ──────────────────────────────────────────────
    let mut wifi = WifiAdapter::new();
    match (
        nvs.get_json::<String>(namespace::CONFIG, key::WIFI_SSID),
        nvs.get_json::<String>(namespace::CONFIG, key::WIFI_PASSWORD),
    ) {
        (Some(ssid), Some(password)) => {
            if let Err(e) = wifi.set_credentials(&ssid, &password) {
                warn!("startup: stored WiFi credentials invalid ({e})");
            } else if let Err(e) = wifi.connect() {
                warn!("startup: initial WiFi connect failed ({e}), will retry via poll()");
            }
        }
        _ => warn!("startup: no WiFi credentials provisioned yet"),
    }

    let mut power_manager = PowerManager::load(&nvs);
    let watchdog = ecowatt::drivers::watchdog::Watchdog::new();

    // Rebuild firmware-update state before `nvs` moves into shared resources
    // below — a reboot mid-update resumes here instead of starting cold.
    let firmware_updater = FirmwareUpdater::hydrate(&nvs);

    // ── 5. Shared cross-task resources ──────────────────────────────
    let transport = InverterUart::new()?;
    let resources: Arc<Resources> = Arc::new(SharedResources::new(nvs, transport));
    let supervisor = TaskSupervisor::new();

    let register_types: HashMap<u16, RegisterType> =
        registers::addresses().iter().map(|&addr| (addr, registers::type_of(addr))).collect();

    spawn_sensor_poll(&supervisor, &resources, &config, dev_id.clone());
    spawn_compression(&supervisor, &resources, register_types);
    spawn_upload(&supervisor, &resources, envelope_keys, dev_id.clone());
    spawn_command(&supervisor, &resources, dev_id.clone());
    spawn_config_reconcile(&supervisor, &resources, dev_id.clone());
    spawn_firmware(&supervisor, &resources, dev_id.clone(), firmware_updater);

    // ── 6. Main thread: watchdog, WiFi polling, housekeeping ────────
    info!("System ready. Entering supervisory loop.");
    let mut power_report_accum_ms: u64 = 0;
    loop {
        std::thread::sleep(Duration::from_millis(500));
        watchdog.feed();
        wifi.poll();
        if wifi.take_network_restored() {
            info!("main: network restored, notifying deadline monitor");
            supervisor.on_network_restored();
        }

        power_report_accum_ms += 500;
        if power_report_accum_ms >= config.energy_report_period_ms as u64 {
            power_report_accum_ms = 0;
            let endpoint = format!("{CLOUD_BASE_URL}/power/energy/{dev_id}");
            if let Some(mut store) = resources.store.try_lock_for(network_timeout::CONFIG) {
                if let Err(e) = power_manager.report(&mut *store, &endpoint) {
                    warn!("main: power report failed: {e}");
                }
            }
        }

        if supervisor.should_restart() {
            warn!("main: deadline monitor recommends a restart, rebooting");
            reboot();
        }
    }
}

#[cfg(target_os = "espidf")]
fn reboot() -> ! {
    unsafe { esp_idf_svc::sys::esp_restart() }
}

#[cfg(not(target_os = "espidf"))]
fn reboot() -> ! {
    panic!("main: simulated restart requested by deadline monitor");
}

// ── Task wiring ───────────────────────────────────────────────────

fn spawn_sensor_poll(
    supervisor: &TaskSupervisor,
    resources: &Arc<Resources>,
    config: &DeviceConfig,
    dev_id: String,
) {
    let resources = resources.clone();
    let registers = config.registers.clone();
    let period = Duration::from_millis(config.poll_period_ms as u64);
    let mut queue = SampleQueue::new(SAMPLE_QUEUE_CAPACITY);
    let mut accumulator = BatchAccumulator::new(ecowatt::batch::DEFAULT_BATCH_CAPACITY);
    let time = Esp32TimeAdapter::new();

    supervisor.spawn_periodic(TaskKind::SensorPoll, period, move || {
        let Some(mut transport) = resources.transport.try_lock_for(TRANSPORT_MUTEX_TIMEOUT) else {
            warn!("sensor-poll: transport mutex timed out");
            return false;
        };

        let now_ms = time.uptime_us() / 1_000;
        let outcome =
            ecowatt::polling::poll_once(&mut *transport, &registers, &mut queue, now_ms, TaskKind::SensorPoll.deadline());
        drop(transport);

        let network_related = matches!(
            &outcome,
            PollOutcome::Failed { error: Error::Timeout | Error::Transport, .. }
        );

        if let PollOutcome::Failed { fault, retries, error } = outcome {
            let event = FaultEvent::from_fault_class(fault, false, retries, &dev_id, now_ms);
            ecowatt::events::emit(&format!("{CLOUD_BASE_URL}/fault/recovery"), &event);
            warn!("sensor-poll: {error}");
        }

        let samples = queue.drain_all();
        if !samples.is_empty() {
            if let Some(full) = accumulator.offer(&registers, &samples) {
                if let Some(mut pending) = resources.pending_batches.try_lock_for(Duration::from_millis(50)) {
                    pending.push_back(full);
                }
            }
        }

        network_related
    });
}

fn spawn_compression(supervisor: &TaskSupervisor, resources: &Arc<Resources>, register_types: HashMap<u16, RegisterType>) {
    let resources = resources.clone();
    supervisor.spawn_periodic(TaskKind::Compression, Duration::from_secs(1), move || {
        let Some(mut pending) = resources.pending_batches.try_lock_for(COMPRESSION_MUTEX_TIMEOUT) else {
            return false;
        };
        let Some(batch) = pending.pop_front() else {
            return false;
        };
        drop(pending);

        let samples: Vec<Sample> = batch.to_linear_array().iter().filter_map(|s| *s).collect();

        let Some(mut stats) = resources.compression.try_lock_for(COMPRESSION_MUTEX_TIMEOUT) else {
            return false;
        };
        let packet = tournament::run(&samples, &register_types, &mut stats);
        drop(stats);

        if let Some(mut ring) = resources.compressed_ring.try_lock_for(Duration::from_millis(100)) {
            ring.push(packet);
        }
        false
    });
}

fn spawn_upload(supervisor: &TaskSupervisor, resources: &Arc<Resources>, keys: EnvelopeKeys, dev_id: String) {
    let resources = resources.clone();
    let endpoint = format!("{CLOUD_BASE_URL}/aggregated/{dev_id}");
    supervisor.spawn_periodic(TaskKind::Upload, Duration::from_secs(60), move || {
        let Some(mut ring) = resources.compressed_ring.try_lock_for(network_timeout::UPLOAD) else {
            return false;
        };
        let Some(mut store) = resources.store.try_lock_for(network_timeout::UPLOAD) else {
            return false;
        };
        match uploader::upload_pending(&mut ring, &mut *store, &keys, &dev_id, &endpoint) {
            Ok(count) => {
                if count > 0 {
                    info!("upload: sent {count} packet(s)");
                }
                false
            }
            Err(e) => {
                warn!("upload: {e}");
                matches!(e, Error::NetworkDown)
            }
        }
    });
}

fn spawn_command(supervisor: &TaskSupervisor, resources: &Arc<Resources>, dev_id: String) {
    let resources = resources.clone();
    let mut executor = CommandExecutor::new();
    let poll_endpoint = format!("{CLOUD_BASE_URL}/commands/{dev_id}/poll");
    let result_endpoint = format!("{CLOUD_BASE_URL}/commands/{dev_id}/result");

    supervisor.spawn_periodic(TaskKind::Command, Duration::from_secs(15), move || {
        let command: Option<Command> =
            ureq::get(&poll_endpoint).timeout(Duration::from_secs(2)).call().ok().and_then(|r| r.into_json().ok());

        let Some(command) = command else {
            return false;
        };

        let Some(mut transport) = resources.transport.try_lock_for(network_timeout::COMMAND) else {
            return false;
        };
        let result = executor.dispatch(&mut *transport, &command, ecowatt::adapters::time::iso8601_now());
        drop(transport);

        if let Err(e) = ureq::post(&result_endpoint).timeout(Duration::from_secs(2)).send_json(&result) {
            warn!("command: failed to post result: {e}");
            return true;
        }
        false
    });
}

fn spawn_config_reconcile(supervisor: &TaskSupervisor, resources: &Arc<Resources>, dev_id: String) {
    let resources = resources.clone();
    let fetch_endpoint = format!("{CLOUD_BASE_URL}/config/{dev_id}");
    let ack_endpoint = format!("{CLOUD_BASE_URL}/config/{dev_id}/ack");
    let catalog = registers::addresses();

    supervisor.spawn_periodic(TaskKind::Config, Duration::from_secs(30), move || {
        let desired = match reconciler::fetch_desired(&fetch_endpoint) {
            Ok(d) => d,
            Err(e) => return matches!(e, Error::NetworkDown),
        };

        let Some(mut store) = resources.store.try_lock_for(network_timeout::CONFIG) else {
            return false;
        };
        let ack = reconciler::reconcile(&mut *store, desired, &catalog);
        drop(store);

        if let Err(e) = reconciler::post_ack(&ack_endpoint, &ack) {
            warn!("config: failed to post ack: {e}");
            return true;
        }
        false
    });
}

fn spawn_firmware(supervisor: &TaskSupervisor, resources: &Arc<Resources>, dev_id: String, mut updater: FirmwareUpdater) {
    let resources = resources.clone();
    let check_endpoint = format!("{CLOUD_BASE_URL}/ota/check/{dev_id}");
    let status_endpoint = format!("{CLOUD_BASE_URL}/ota/status/{dev_id}");

    let report_status = {
        let status_endpoint = status_endpoint.clone();
        let dev_id = dev_id.clone();
        move |phase: &'static str, version: Option<&str>, detail: Option<&str>| {
            ecowatt::firmware::post_status(
                &status_endpoint,
                &OtaStatusReport { device_id: &dev_id, phase, version, detail },
            );
        }
    };

    // If a download/verify was underway before the last reboot, resume it
    // directly rather than waiting for the next tick to re-check.
    if matches!(updater.state(), FirmwareState::Downloading { .. } | FirmwareState::Verifying { .. }) {
        report_status("downloading", None, Some("resumed after reboot"));
    }

    supervisor.spawn_periodic(TaskKind::Firmware, Duration::from_secs(3_600), move || {
        updater.begin_check();
        report_status("checking", None, None);
        let manifest: Option<FirmwareManifest> =
            ureq::get(&check_endpoint).timeout(Duration::from_secs(5)).call().ok().and_then(|r| r.into_json().ok());

        let Some(manifest) = manifest else {
            return false;
        };

        let Some(mut store) = resources.store.try_lock_for(network_timeout::FIRMWARE) else {
            return false;
        };
        let update_key = store.get_json::<[u8; 16]>(namespace::FIRMWARE, key::FIRMWARE_UPDATE_KEY);
        let signing_key_der = store.get_json::<Vec<u8>>(namespace::FIRMWARE, key::FIRMWARE_SIGNING_KEY);

        let (Some(update_key), Some(signing_key_der)) = (update_key, signing_key_der) else {
            warn!("firmware: no update/signing key provisioned, declining manifest");
            drop(store);
            return false;
        };
        let signing_key = match decode_signing_key(&signing_key_der) {
            Some(k) => k,
            None => {
                warn!("firmware: stored signing key is not valid DER, declining manifest");
                drop(store);
                return false;
            }
        };

        if let Err(e) = updater.accept_manifest(manifest.clone()) {
            warn!("firmware: manifest rejected: {e}");
            drop(store);
            return false;
        }
        updater.persist_progress(&mut *store);
        drop(store);
        report_status("downloading", Some(&manifest.version), None);

        let keys = UpdateKeys { update_key, signing_key };
        let chunk_base = format!("{CLOUD_BASE_URL}/ota/chunk/{dev_id}");

        for index in 0..manifest.chunk_count {
            let chunk_endpoint = format!("{chunk_base}/{index}");
            let Ok(response) = ureq::get(&chunk_endpoint).timeout(Duration::from_secs(5)).call() else {
                warn!("firmware: chunk {index} fetch failed, aborting update");
                updater.abort();
                if let Some(mut store) = resources.store.try_lock_for(network_timeout::FIRMWARE) {
                    updater.persist_progress(&mut *store);
                }
                report_status("failed", Some(&manifest.version), Some("chunk fetch failed"));
                return true;
            };
            let mut ciphertext = Vec::new();
            if response.into_reader().read_to_end(&mut ciphertext).is_err() {
                warn!("firmware: chunk {index} body read failed, aborting update");
                updater.abort();
                if let Some(mut store) = resources.store.try_lock_for(network_timeout::FIRMWARE) {
                    updater.persist_progress(&mut *store);
                }
                report_status("failed", Some(&manifest.version), Some("chunk body read failed"));
                return true;
            }
            if let Err(e) = updater.write_chunk(index, &ciphertext, &keys) {
                warn!("firmware: chunk {index} rejected: {e}");
                updater.abort();
                if let Some(mut store) = resources.store.try_lock_for(network_timeout::FIRMWARE) {
                    updater.persist_progress(&mut *store);
                }
                report_status("failed", Some(&manifest.version), Some("chunk rejected"));
                return false;
            }

            let is_last = index + 1 == manifest.chunk_count;
            if is_last || updater.chunks_written() % ecowatt::firmware::CHUNK_PERSIST_INTERVAL == 0 {
                if let Some(mut store) = resources.store.try_lock_for(network_timeout::FIRMWARE) {
                    updater.persist_progress(&mut *store);
                }
            }
        }

        report_status("verifying", Some(&manifest.version), None);
        match updater.finalize(&keys) {
            Ok(()) => {
                info!("firmware: update to {} verified", manifest.version);
                if let Some(mut store) = resources.store.try_lock_for(network_timeout::FIRMWARE) {
                    updater.persist_progress(&mut *store);
                }
                if matches!(updater.state(), FirmwareState::Completed { .. }) {
                    report_status("applied", Some(&manifest.version), None);
                    updater.reboot();
                }
                false
            }
            Err(e) => {
                warn!("firmware: finalize failed: {e}");
                if let Some(mut store) = resources.store.try_lock_for(network_timeout::FIRMWARE) {
                    updater.persist_progress(&mut *store);
                }
                report_status("failed", Some(&manifest.version), Some(&e.to_string()));
                false
            }
        }
    });
}

fn decode_signing_key(der: &[u8]) -> Option<rsa::RsaPublicKey> {
    use rsa::pkcs8::DecodePublicKey;
    rsa::RsaPublicKey::from_public_key_der(der).ok()
}
