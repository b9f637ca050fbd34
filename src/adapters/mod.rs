//! Adapters — concrete implementations of the hexagonal port traits and
//! other outward-facing hardware/network bindings.
//!
//! | Adapter      | Implements                      | Connects to          |
//! |--------------|----------------------------------|----------------------|
//! | `nvs`        | `PersistentStorePort`            | NVS / in-memory map   |
//! | `uart`       | `protocol::Transport`            | RS-485/UART inverter link |
//! | `wifi`       | `ConnectivityPort`                | ESP-IDF WiFi STA      |
//! | `time`       | monotonic clock queries           | ESP32 system timer    |
//! | `device_id`  | device identity derivation         | eFuse factory MAC     |

pub mod device_id;
pub mod nvs;
pub mod time;
pub mod uart;
pub mod wifi;
pub(super) mod utils;
