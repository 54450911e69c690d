//! Deterministic port assignment and loopback port probes.

mod allocator;
mod checker;

pub use allocator::{PortAllocator, PortError};
pub use checker::{
    find_available, is_available, is_listening, listener_pid, wait_for_port, wait_for_port_free,
};
