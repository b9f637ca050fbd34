//! Command Executor — polls the pending-commands endpoint, dispatches one
//! command per tick against the inverter over the Protocol Adapter, and
//! reports the outcome back to the cloud.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Error;
use crate::protocol::{self, Transport, ValidationOutcome};

/// Device register address a power-setpoint write lands on.
const POWER_SETPOINT_REGISTER: u16 = 40_001;
const DEVICE_ADDR: u8 = 0x01;
const WRITE_TIMEOUT_MS: u32 = 500;

/// A command fetched from `/commands/{device-id}/poll`.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub command_id: String,
    pub action_name: String,
    #[serde(default)]
    pub parameters: HashMap<String, f64>,
}

/// Outcome posted to `/commands/{device-id}/result`.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub command_id: String,
    pub success: bool,
    /// ISO-8601 execution timestamp, formatted by the caller (the executor
    /// itself only counts monotonic milliseconds, per
    /// [`crate::deadline`]'s clock discipline).
    pub executed_at: String,
    pub detail: String,
}

/// Running tally exposed to the diagnostics component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandStats {
    pub executed: u32,
    pub successful: u32,
    pub failed: u32,
}

impl CommandStats {
    fn record(&mut self, success: bool) {
        self.executed += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Dispatches commands against the inverter and tracks execution stats.
/// Holds no network or store state itself — those are handed in per call,
/// matching the rest of this crate's port-injection style.
pub struct CommandExecutor {
    stats: CommandStats,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self { stats: CommandStats::default() }
    }

    pub fn stats(&self) -> CommandStats {
        self.stats
    }

    /// Dispatch one command, returning the result to post back.
    /// `executed_at` is supplied by the caller (an ISO-8601 timestamp),
    /// matching this module's policy of staying clock-agnostic internally.
    pub fn dispatch<T: Transport>(
        &mut self,
        transport: &mut T,
        command: &Command,
        executed_at: String,
    ) -> CommandResult {
        let outcome = match command.action_name.as_str() {
            "write_register" => self.write_register(transport, command),
            "set_power" | "set_power_percentage" => self.set_power(transport, command),
            "get_power_stats" | "reset_power_stats" => {
                // Handled by the power-management component; the executor
                // only acknowledges the action name is known.
                Ok(())
            }
            "get_peripheral_stats" | "reset_peripheral_stats" => Ok(()),
            other => {
                warn!("commands: unknown action '{other}'");
                Err(("unknown-action".to_string(), Error::EnvelopeFailure))
            }
        };

        let (success, detail) = match outcome {
            Ok(()) => (true, "ok".to_string()),
            Err((detail, _)) => (false, detail),
        };
        self.stats.record(success);
        info!("commands: {} -> {} ({detail})", command.action_name, if success { "ok" } else { "failed" });

        CommandResult {
            command_id: command.command_id.clone(),
            success,
            executed_at,
            detail,
        }
    }

    fn write_register<T: Transport>(&self, transport: &mut T, command: &Command) -> Result<(), (String, Error)> {
        let register = command
            .parameters
            .get("register")
            .copied()
            .ok_or_else(|| ("missing-parameter-register".to_string(), Error::ProtocolMalformed))?;
        let value = command
            .parameters
            .get("value")
            .copied()
            .ok_or_else(|| ("missing-parameter-value".to_string(), Error::ProtocolMalformed))?;
        write_single(transport, register as u16, value as u16)
    }

    fn set_power<T: Transport>(&self, transport: &mut T, command: &Command) -> Result<(), (String, Error)> {
        let percent = command
            .parameters
            .get("percent")
            .or_else(|| command.parameters.get("value"))
            .copied()
            .ok_or_else(|| ("missing-parameter-percent".to_string(), Error::ProtocolMalformed))?;
        let clamped = percent.clamp(0.0, 100.0) as u16;
        write_single(transport, POWER_SETPOINT_REGISTER, clamped)
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn write_single<T: Transport>(transport: &mut T, register: u16, value: u16) -> Result<(), (String, Error)> {
    let mut request = [0u8; protocol::MAX_FRAME_LEN];
    let len = protocol::build_write_frame(DEVICE_ADDR, register, value, &mut request)
        .ok_or_else(|| ("frame-build-failed".to_string(), Error::BufferOverflow))?;

    let mut response = [0u8; protocol::MAX_FRAME_LEN];
    let (_, outcome) = protocol::exchange(transport, &request[..len], &mut response, WRITE_TIMEOUT_MS)
        .map_err(|e| ("transport-error".to_string(), e))?;

    match outcome {
        ValidationOutcome::Ok => Ok(()),
        ValidationOutcome::Exception(code) => {
            Err((format!("exception-{code:#04x}"), Error::ProtocolException(code)))
        }
        ValidationOutcome::CrcError => Err(("crc-error".to_string(), Error::ProtocolCrc)),
        ValidationOutcome::Truncated | ValidationOutcome::Malformed => {
            Err(("malformed-response".to_string(), Error::ProtocolMalformed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct MockTransport {
        responses: VecDeque<Vec<u8>>,
        written: Vec<Vec<u8>>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self { responses: VecDeque::new(), written: Vec::new() }
        }

        fn queue_ack(&mut self, request_frame_prefix: &[u8]) {
            // A write-single ack echoes the request frame verbatim.
            self.responses.push_back(request_frame_prefix.to_vec());
        }
    }

    impl Transport for MockTransport {
        type Error = ();

        fn write_all(&mut self, data: &[u8]) -> Result<(), ()> {
            self.written.push(data.to_vec());
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, ()> {
            match self.responses.pop_front() {
                Some(data) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok(len)
                }
                None => Ok(0),
            }
        }
    }

    fn command(action: &str, params: &[(&str, f64)]) -> Command {
        Command {
            command_id: "cmd-1".to_string(),
            action_name: action.to_string(),
            parameters: params.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn unknown_action_fails_without_touching_transport() {
        let mut executor = CommandExecutor::new();
        let mut transport = MockTransport::new();
        let result = executor.dispatch(&mut transport, &command("reboot-now", &[]), "t".to_string());
        assert!(!result.success);
        assert_eq!(result.detail, "unknown-action");
        assert_eq!(executor.stats().failed, 1);
    }

    #[test]
    fn set_power_clamps_percentage_and_writes() {
        let mut executor = CommandExecutor::new();
        let mut transport = MockTransport::new();

        let mut expected_frame = [0u8; protocol::MAX_FRAME_LEN];
        let len = protocol::build_write_frame(DEVICE_ADDR, POWER_SETPOINT_REGISTER, 100, &mut expected_frame).unwrap();
        transport.queue_ack(&expected_frame[..len]);

        let result = executor.dispatch(&mut transport, &command("set_power_percentage", &[("percent", 150.0)]), "t".to_string());
        assert!(result.success);
        assert_eq!(transport.written.len(), 1);
    }

    #[test]
    fn write_register_requires_both_parameters() {
        let mut executor = CommandExecutor::new();
        let mut transport = MockTransport::new();
        let result = executor.dispatch(&mut transport, &command("write_register", &[("register", 1.0)]), "t".to_string());
        assert!(!result.success);
        assert_eq!(result.detail, "missing-parameter-value");
    }

    #[test]
    fn stats_accumulate_across_dispatches() {
        let mut executor = CommandExecutor::new();
        let mut transport = MockTransport::new();
        executor.dispatch(&mut transport, &command("unknown", &[]), "t".to_string());
        executor.dispatch(&mut transport, &command("unknown", &[]), "t".to_string());
        let stats = executor.stats();
        assert_eq!(stats.executed, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.successful, 0);
    }
}
