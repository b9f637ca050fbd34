//! UART transport to the inverter's register protocol carrier (RS-485/UART,
//! half-duplex, fixed baud). Implements [`crate::protocol::Transport`] so
//! the Polling Pipeline, Command Executor, and protocol unit tests all
//! exchange frames through the same trait regardless of host or hardware.
//!
//! Raw `esp_idf_svc::sys` UART driver calls, the same one-shot
//! install-then-use style as [`crate::drivers::hw_init`]'s ADC/GPIO setup,
//! rather than a higher-level HAL wrapper — there's exactly one UART port
//! in use and no need for the extra abstraction.

use log::warn;

use crate::error::Error;
use crate::protocol::Transport;

/// UART port dedicated to the inverter link.
#[cfg(target_os = "espidf")]
const UART_PORT: u32 = 1;
#[cfg(target_os = "espidf")]
const UART_TX_GPIO: i32 = 17;
#[cfg(target_os = "espidf")]
const UART_RX_GPIO: i32 = 18;
#[cfg(target_os = "espidf")]
const BAUD_RATE: u32 = 9_600;

pub struct InverterUart {
    #[cfg(target_os = "espidf")]
    port: esp_idf_svc::sys::uart_port_t,
}

impl InverterUart {
    /// Install the UART driver on [`UART_PORT`] with 8N1 framing. On
    /// non-ESP-IDF targets this is a no-op placeholder — there is no
    /// inverter simulator wired into the host build; host-side protocol
    /// tests inject their own mock `Transport` instead of this adapter.
    pub fn new() -> Result<Self, Error> {
        #[cfg(target_os = "espidf")]
        {
            use esp_idf_svc::sys::*;
            unsafe {
                let config = uart_config_t {
                    baud_rate: BAUD_RATE as i32,
                    data_bits: uart_word_length_t_UART_DATA_8_BITS,
                    parity: uart_parity_t_UART_PARITY_DISABLE,
                    stop_bits: uart_stop_bits_t_UART_STOP_BITS_1,
                    flow_ctrl: uart_hw_flowcontrol_t_UART_HW_FLOWCTRL_DISABLE,
                    ..Default::default()
                };
                if uart_param_config(UART_PORT as uart_port_t, &config) != ESP_OK {
                    return Err(Error::Transport);
                }
                if uart_set_pin(
                    UART_PORT as uart_port_t,
                    UART_TX_GPIO,
                    UART_RX_GPIO,
                    UART_PIN_NO_CHANGE,
                    UART_PIN_NO_CHANGE,
                ) != ESP_OK
                {
                    return Err(Error::Transport);
                }
                if uart_driver_install(UART_PORT as uart_port_t, 512, 512, 0, core::ptr::null_mut(), 0) != ESP_OK {
                    return Err(Error::Transport);
                }
            }
            Ok(Self { port: UART_PORT as uart_port_t })
        }

        #[cfg(not(target_os = "espidf"))]
        Ok(Self {})
    }
}

impl Default for InverterUart {
    fn default() -> Self {
        Self::new().expect("UART driver install should not fail twice in one process")
    }
}

impl Transport for InverterUart {
    type Error = Error;

    #[cfg(target_os = "espidf")]
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        let written = unsafe { esp_idf_svc::sys::uart_write_bytes(self.port, data.as_ptr().cast(), data.len()) };
        if written < 0 || written as usize != data.len() {
            return Err(Error::Transport);
        }
        Ok(())
    }

    #[cfg(not(target_os = "espidf"))]
    fn write_all(&mut self, _data: &[u8]) -> Result<(), Error> {
        warn!("uart: write on a host build with no wired inverter; dropped");
        Ok(())
    }

    #[cfg(target_os = "espidf")]
    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Error> {
        let ticks = (timeout_ms as u64 * esp_idf_svc::sys::configTICK_RATE_HZ as u64 / 1000) as u32;
        let n = unsafe { esp_idf_svc::sys::uart_read_bytes(self.port, buf.as_mut_ptr().cast(), buf.len(), ticks) };
        if n < 0 {
            return Err(Error::Transport);
        }
        Ok(n as usize)
    }

    #[cfg(not(target_os = "espidf"))]
    fn read(&mut self, _buf: &mut [u8], _timeout_ms: u32) -> Result<usize, Error> {
        Ok(0)
    }
}
