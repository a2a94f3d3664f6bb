//! NAT policy emulation
//!
//! Deterministic emulators for the mapping, allocation and filtering policies
//! of a NAT device. They are used to build policy-accurate fixtures for the
//! classifier and the router; production traffic never passes through them.

use crate::error::AllocationError;
use crate::nat::{AllocationPolicy, FilteringPolicy, MappingPolicy};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

/// Default public port range of an emulated NAT
pub const DEFAULT_PORT_RANGE: (u16, u16) = (1024, 65535);

/// Picks public ports according to an [`AllocationPolicy`]
#[derive(Debug, Clone)]
pub struct PortAllocator {
    policy: AllocationPolicy,
    min: u16,
    max: u16,
    next: u16,
    rng: StdRng,
}

impl PortAllocator {
    /// Create an allocator over `min..=max`
    ///
    /// `seed` drives the random policy so fixtures stay reproducible.
    #[must_use]
    pub fn new(policy: AllocationPolicy, min: u16, max: u16, seed: u64) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            policy,
            min,
            max,
            next: min,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Emulated policy
    #[must_use]
    pub fn policy(&self) -> AllocationPolicy {
        self.policy
    }

    /// Allocate a public port for `private_port`
    ///
    /// # Errors
    ///
    /// - `PortTaken` if port preservation finds the private port in use
    /// - `OutOfPorts` if every port of the range is in use
    pub fn allocate(
        &mut self,
        private_port: u16,
        taken: &HashSet<u16>,
    ) -> Result<u16, AllocationError> {
        match self.policy {
            AllocationPolicy::PortPreservation => {
                if taken.contains(&private_port) {
                    Err(AllocationError::PortTaken(private_port))
                } else {
                    Ok(private_port)
                }
            }
            AllocationPolicy::PortContiguity(delta) => {
                let port = self.next_free(self.next, taken)?;
                self.next = self.wrap(u32::from(port) + u32::from(delta.max(1)));
                Ok(port)
            }
            AllocationPolicy::Random => {
                let in_range = taken
                    .iter()
                    .filter(|p| (self.min..=self.max).contains(*p))
                    .count();
                if in_range >= self.range_size() {
                    return Err(self.out_of_ports());
                }
                loop {
                    let candidate = self.rng.gen_range(self.min..=self.max);
                    if !taken.contains(&candidate) {
                        return Ok(candidate);
                    }
                }
            }
        }
    }

    /// First free port at or after `start`, wrapping around the range
    fn next_free(&self, start: u16, taken: &HashSet<u16>) -> Result<u16, AllocationError> {
        let start = self.wrap(u32::from(start));
        (0..self.range_size() as u32)
            .map(|offset| self.wrap(u32::from(start) + offset))
            .find(|port| !taken.contains(port))
            .ok_or_else(|| self.out_of_ports())
    }

    fn wrap(&self, port: u32) -> u16 {
        let min = u32::from(self.min);
        let size = self.range_size() as u32;
        let offset = port.saturating_sub(min) % size;
        // offset < size <= 65536 - min, so the sum fits in u16
        (min + offset) as u16
    }

    fn range_size(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }

    fn out_of_ports(&self) -> AllocationError {
        AllocationError::OutOfPorts {
            min: self.min,
            max: self.max,
        }
    }
}

impl FilteringPolicy {
    /// True if an inbound datagram from `src` may pass a mapping whose
    /// outbound peers are `contacted`
    #[must_use]
    pub fn allows(&self, src: SocketAddr, contacted: &HashSet<SocketAddr>) -> bool {
        match self {
            Self::EndpointIndependent => true,
            Self::HostDependent => contacted.iter().any(|peer| peer.ip() == src.ip()),
            Self::PortDependent => contacted.contains(&src),
        }
    }
}

/// Identity of a NAT mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKey {
    /// One mapping per private endpoint
    Endpoint(SocketAddr),
    /// One mapping per private endpoint and destination IP
    Host(SocketAddr, IpAddr),
    /// One mapping per private endpoint and destination endpoint
    Port(SocketAddr, SocketAddr),
}

impl MappingPolicy {
    /// Mapping used for traffic from `private` to `dst`
    #[must_use]
    pub fn key(&self, private: SocketAddr, dst: SocketAddr) -> MappingKey {
        match self {
            Self::EndpointIndependent => MappingKey::Endpoint(private),
            Self::HostDependent => MappingKey::Host(private, dst.ip()),
            Self::PortDependent => MappingKey::Port(private, dst),
        }
    }
}

#[derive(Debug, Clone)]
struct Binding {
    private: SocketAddr,
    contacted: HashSet<SocketAddr>,
}

/// An emulated NAT device combining the three policies
#[derive(Debug, Clone)]
pub struct NatBox {
    public_ip: IpAddr,
    mapping: MappingPolicy,
    filtering: FilteringPolicy,
    allocator: PortAllocator,
    mappings: HashMap<MappingKey, u16>,
    bindings: HashMap<u16, Binding>,
}

impl NatBox {
    /// Create a NAT with the default port range
    #[must_use]
    pub fn new(
        public_ip: IpAddr,
        mapping: MappingPolicy,
        allocation: AllocationPolicy,
        filtering: FilteringPolicy,
        seed: u64,
    ) -> Self {
        let (min, max) = DEFAULT_PORT_RANGE;
        Self::with_allocator(
            public_ip,
            mapping,
            filtering,
            PortAllocator::new(allocation, min, max, seed),
        )
    }

    /// Create a NAT with a custom allocator
    #[must_use]
    pub fn with_allocator(
        public_ip: IpAddr,
        mapping: MappingPolicy,
        filtering: FilteringPolicy,
        allocator: PortAllocator,
    ) -> Self {
        Self {
            public_ip,
            mapping,
            filtering,
            allocator,
            mappings: HashMap::new(),
            bindings: HashMap::new(),
        }
    }

    /// Public IP of the device
    #[must_use]
    pub fn public_ip(&self) -> IpAddr {
        self.public_ip
    }

    /// Number of mappings currently held
    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    /// Translate an outbound datagram, creating a mapping if needed
    ///
    /// # Errors
    ///
    /// Returns `AllocationError` if a new mapping cannot get a public port.
    pub fn outbound(
        &mut self,
        private: SocketAddr,
        dst: SocketAddr,
    ) -> Result<SocketAddr, AllocationError> {
        let key = self.mapping.key(private, dst);

        let port = match self.mappings.get(&key) {
            Some(port) => *port,
            None => {
                let taken: HashSet<u16> = self.bindings.keys().copied().collect();
                let port = self.allocator.allocate(private.port(), &taken)?;
                self.mappings.insert(key, port);
                self.bindings.insert(
                    port,
                    Binding {
                        private,
                        contacted: HashSet::new(),
                    },
                );
                tracing::trace!("NAT {} mapped {} -> port {}", self.public_ip, private, port);
                port
            }
        };

        if let Some(binding) = self.bindings.get_mut(&port) {
            binding.contacted.insert(dst);
        }

        Ok(SocketAddr::new(self.public_ip, port))
    }

    /// Translate an inbound datagram, or `None` if it is filtered
    #[must_use]
    pub fn inbound(&self, public_port: u16, src: SocketAddr) -> Option<SocketAddr> {
        let binding = self.bindings.get(&public_port)?;
        if self.filtering.allows(src, &binding.contacted) {
            Some(binding.private)
        } else {
            tracing::trace!("NAT {} filtered {} -> port {}", self.public_ip, src, public_port);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_port_preservation() {
        let mut alloc = PortAllocator::new(AllocationPolicy::PortPreservation, 1024, 65535, 0);
        let mut taken = HashSet::new();

        assert_eq!(alloc.allocate(4000, &taken), Ok(4000));
        taken.insert(4000);
        assert_eq!(
            alloc.allocate(4000, &taken),
            Err(AllocationError::PortTaken(4000))
        );
    }

    #[test]
    fn test_port_contiguity_wraps() {
        let mut alloc = PortAllocator::new(AllocationPolicy::PortContiguity(1), 100, 102, 0);
        let mut taken = HashSet::new();

        for expected in [100, 101, 102] {
            let port = alloc.allocate(5000, &taken).unwrap();
            assert_eq!(port, expected);
            taken.insert(port);
        }
        assert_eq!(
            alloc.allocate(5000, &taken),
            Err(AllocationError::OutOfPorts { min: 100, max: 102 })
        );

        // Freeing the first port makes the scan wrap around to it
        taken.remove(&100);
        assert_eq!(alloc.allocate(5000, &taken), Ok(100));
    }

    #[test]
    fn test_port_contiguity_delta() {
        let mut alloc = PortAllocator::new(AllocationPolicy::PortContiguity(5), 1000, 2000, 0);
        let mut taken = HashSet::new();

        let first = alloc.allocate(1, &taken).unwrap();
        taken.insert(first);
        let second = alloc.allocate(1, &taken).unwrap();
        assert_eq!(second - first, 5);
    }

    #[test]
    fn test_random_allocation() {
        let mut alloc = PortAllocator::new(AllocationPolicy::Random, 2000, 2003, 42);
        let mut taken = HashSet::new();

        for _ in 0..4 {
            let port = alloc.allocate(1, &taken).unwrap();
            assert!((2000..=2003).contains(&port));
            assert!(taken.insert(port));
        }
        assert!(matches!(
            alloc.allocate(1, &taken),
            Err(AllocationError::OutOfPorts { .. })
        ));
    }

    #[test]
    fn test_random_allocation_is_reproducible() {
        let taken = HashSet::new();
        let mut a = PortAllocator::new(AllocationPolicy::Random, 1024, 65535, 7);
        let mut b = PortAllocator::new(AllocationPolicy::Random, 1024, 65535, 7);
        assert_eq!(a.allocate(1, &taken), b.allocate(1, &taken));
    }

    #[test]
    fn test_filtering_predicates() {
        let contacted: HashSet<SocketAddr> = [sock("1.0.0.1:3478")].into_iter().collect();

        assert!(FilteringPolicy::EndpointIndependent.allows(sock("9.9.9.9:1"), &contacted));

        assert!(FilteringPolicy::HostDependent.allows(sock("1.0.0.1:3479"), &contacted));
        assert!(!FilteringPolicy::HostDependent.allows(sock("1.0.0.2:3478"), &contacted));

        assert!(FilteringPolicy::PortDependent.allows(sock("1.0.0.1:3478"), &contacted));
        assert!(!FilteringPolicy::PortDependent.allows(sock("1.0.0.1:3479"), &contacted));
    }

    #[test]
    fn test_mapping_keys() {
        let private = sock("192.168.0.2:4000");
        let a = sock("1.0.0.1:3478");
        let b = sock("1.0.0.1:3479");

        let ei = MappingPolicy::EndpointIndependent;
        assert_eq!(ei.key(private, a), ei.key(private, b));

        let hd = MappingPolicy::HostDependent;
        assert_eq!(hd.key(private, a), hd.key(private, b));
        assert_ne!(hd.key(private, a), hd.key(private, sock("1.0.0.2:3478")));

        let pd = MappingPolicy::PortDependent;
        assert_ne!(pd.key(private, a), pd.key(private, b));
    }

    #[test]
    fn test_nat_box_round_trip() {
        let mut nat = NatBox::new(
            "203.0.113.1".parse().unwrap(),
            MappingPolicy::EndpointIndependent,
            AllocationPolicy::PortPreservation,
            FilteringPolicy::PortDependent,
            0,
        );
        let private = sock("192.168.0.2:4000");
        let server = sock("1.0.0.1:3478");

        let public = nat.outbound(private, server).unwrap();
        assert_eq!(public, sock("203.0.113.1:4000"));
        assert_eq!(nat.inbound(4000, server), Some(private));
        assert_eq!(nat.inbound(4000, sock("1.0.0.1:3479")), None);
        assert_eq!(nat.inbound(4001, server), None);
    }

    #[test]
    fn test_nat_box_port_dependent_mapping() {
        let mut nat = NatBox::with_allocator(
            "203.0.113.1".parse().unwrap(),
            MappingPolicy::PortDependent,
            FilteringPolicy::EndpointIndependent,
            PortAllocator::new(AllocationPolicy::PortContiguity(1), 30000, 30100, 0),
        );
        let private = sock("192.168.0.2:4000");

        let a = nat.outbound(private, sock("1.0.0.1:3478")).unwrap();
        let b = nat.outbound(private, sock("1.0.0.1:3479")).unwrap();
        let again = nat.outbound(private, sock("1.0.0.1:3478")).unwrap();

        assert_eq!(a.port(), 30000);
        assert_eq!(b.port(), 30001);
        assert_eq!(again, a);
        assert_eq!(nat.mapping_count(), 2);
    }

    proptest::proptest! {
        #[test]
        fn test_allocations_stay_in_range_and_unique(
            min in 1024u16..2000,
            width in 0u16..64,
            delta in 1u16..8,
            random in proptest::bool::ANY,
            seed in proptest::num::u64::ANY,
        ) {
            let max = min + width;
            let policy = if random {
                AllocationPolicy::Random
            } else {
                AllocationPolicy::PortContiguity(delta)
            };
            let mut alloc = PortAllocator::new(policy, min, max, seed);
            let mut taken = HashSet::new();

            for _ in 0..=width {
                let port = alloc.allocate(4000, &taken).unwrap();
                proptest::prop_assert!((min..=max).contains(&port));
                proptest::prop_assert!(taken.insert(port));
            }
            proptest::prop_assert!(
                matches!(alloc.allocate(4000, &taken), Err(AllocationError::OutOfPorts { .. })),
                "range is exhausted"
            );
        }
    }
}
