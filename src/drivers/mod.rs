//! Core-pinned task spawning and the task watchdog timer.

pub mod task_pin;
pub mod watchdog;
