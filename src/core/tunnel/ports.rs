//! Ephemeral local-port allocator for tunnels. A simple free-list over
//! a configurable range; exhaustion is an error, released ports return
//! to the pool.

use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::core::error::CoreError;

pub struct PortAllocator {
    range: std::ops::RangeInclusive<u16>,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: std::ops::RangeInclusive<u16>) -> Self {
        Self {
            range,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn default_range() -> Self {
        Self::new(40000..=40999)
    }

    pub fn acquire(&self) -> Result<u16, CoreError> {
        let mut in_use = self.in_use.lock().expect("port allocator mutex poisoned");
        for port in self.range.clone() {
            if !in_use.contains(&port) {
                in_use.insert(port);
                return Ok(port);
            }
        }
        Err(CoreError::Unavailable(
            "no free ports in ephemeral range".to_string(),
        ))
    }

    pub fn release(&self, port: u16) {
        self.in_use
            .lock()
            .expect("port allocator mutex poisoned")
            .remove(&port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_distinct_ports() {
        let alloc = PortAllocator::new(5000..=5001);
        let a = alloc.acquire().unwrap();
        let b = alloc.acquire().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let alloc = PortAllocator::new(6000..=6000);
        alloc.acquire().unwrap();
        assert!(alloc.acquire().is_err());
    }

    #[test]
    fn released_port_can_be_reacquired() {
        let alloc = PortAllocator::new(7000..=7000);
        let port = alloc.acquire().unwrap();
        alloc.release(port);
        assert_eq!(alloc.acquire().unwrap(), port);
    }
}
