//! Mock inverter transport shared by the integration tests below.
//!
//! Mirrors the inline `MockTransport` test doubles already used inside
//! [`ecowatt::protocol`], [`ecowatt::commands`], and [`ecowatt::polling`]'s
//! own `#[cfg(test)]` modules, generalized into one reusable fixture that
//! queues canned frames and records everything written.

use std::collections::VecDeque;

use ecowatt::error::Error;
use ecowatt::protocol::Transport;

pub struct MockTransport {
    pub responses: VecDeque<Vec<u8>>,
    pub written: Vec<Vec<u8>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self { responses: VecDeque::new(), written: Vec::new() }
    }

    pub fn queue_response(&mut self, frame: Vec<u8>) {
        self.responses.push_back(frame);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    type Error = Error;

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        self.written.push(data.to_vec());
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, Error> {
        match self.responses.pop_front() {
            Some(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            None => Err(Error::Timeout),
        }
    }
}
