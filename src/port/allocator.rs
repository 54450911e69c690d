use std::collections::HashSet;
use thiserror::Error;

use super::checker;

/// Number of `name-N` alternates tried before scanning the whole range.
const ALTERNATE_ATTEMPTS: u32 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no available ports in range {min}-{max}")]
    Exhausted { min: u16, max: u16 },
    #[error("invalid port range {min}-{max}")]
    InvalidRange { min: u16, max: u16 },
}

/// Assigns each workspace name a stable port within `[min, max]`.
///
/// The primary port is `min + fnv1a(name) % (max - min + 1)`, so the same
/// name maps to the same port in every process that shares the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocator {
    min: u16,
    max: u16,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Result<Self, PortError> {
        if min == 0 || min > max {
            return Err(PortError::InvalidRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Deterministic port for `name`. Pure; never probes the network.
    pub fn allocate(&self, name: &str) -> u16 {
        let span = u32::from(self.max - self.min) + 1;
        let offset = fnv1a_32(name.as_bytes()) % span;
        // offset < span <= 65535, so the sum stays within max
        self.min + offset as u16
    }

    /// Port for `name` that is neither in `used` nor bound by another process.
    ///
    /// Tries the primary port, then the ports of `name-1` through
    /// `name-100`, then every port in the range in order.
    pub fn allocate_with_fallback(&self, name: &str, used: &HashSet<u16>) -> Result<u16, PortError> {
        self.allocate_with(name, used, checker::is_available)
    }

    /// Same search as [`allocate_with_fallback`](Self::allocate_with_fallback)
    /// with a caller-supplied bind probe.
    pub fn allocate_with<F>(&self, name: &str, used: &HashSet<u16>, is_free: F) -> Result<u16, PortError>
    where
        F: Fn(u16) -> bool,
    {
        let usable = |port: u16| !used.contains(&port) && is_free(port);

        let primary = self.allocate(name);
        if usable(primary) {
            return Ok(primary);
        }

        for i in 1..=ALTERNATE_ATTEMPTS {
            let alternate = self.allocate(&format!("{}-{}", name, i));
            if usable(alternate) {
                return Ok(alternate);
            }
        }

        (self.min..=self.max)
            .find(|port| usable(*port))
            .ok_or(PortError::Exhausted {
                min: self.min,
                max: self.max,
            })
    }
}

/// 32-bit FNV-1a.
fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(PRIME)
    })
}
