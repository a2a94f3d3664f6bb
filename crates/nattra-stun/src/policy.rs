//! Mapping and allocation policy classification
//!
//! Pure functions over the eight addresses observed during the address
//! measurement phase. Probes 0..3 are sent from the first local port to
//! server A primary, A secondary, B primary and B secondary; probes 4..7
//! repeat the same targets from the second local port.

use nattra_core::{AllocationPolicy, MappingPolicy};
use std::net::SocketAddr;

/// Largest `|local - observed|` port difference still considered contiguous
pub const CONTIGUITY_TOLERANCE: u16 = 50;

/// Number of address measurement probes
pub const MEASUREMENTS: usize = 8;

/// Classify the mapping policy from the four probes of the first local port
#[must_use]
pub fn determine_mapping_policy(observed: &[SocketAddr; 4]) -> MappingPolicy {
    if observed.iter().all(|a| *a == observed[0]) {
        MappingPolicy::EndpointIndependent
    } else if observed[0] == observed[1] && observed[2] == observed[3] {
        MappingPolicy::HostDependent
    } else {
        MappingPolicy::PortDependent
    }
}

/// Classify contiguity from `(local port, observed port)` pairs
///
/// Any pair further apart than [`CONTIGUITY_TOLERANCE`] means random
/// allocation; otherwise the smallest difference is the contiguity delta.
#[must_use]
pub fn determine_allocation_policy(pairs: &[(u16, u16)]) -> AllocationPolicy {
    let diffs = pairs.iter().map(|(local, observed)| local.abs_diff(*observed));

    let mut min_diff: Option<u16> = None;
    for diff in diffs {
        if diff > CONTIGUITY_TOLERANCE {
            return AllocationPolicy::Random;
        }
        min_diff = Some(min_diff.map_or(diff, |m| m.min(diff)));
    }

    match min_diff {
        Some(delta) => AllocationPolicy::PortContiguity(delta),
        None => AllocationPolicy::Random,
    }
}

/// Classify the allocation policy of a full measurement
///
/// `local_ports` are the two local ports; the pairs examined depend on the
/// mapping policy, since only distinct mappings carry new information.
#[must_use]
pub fn classify_allocation(
    local_ports: [u16; 2],
    observed: &[SocketAddr; MEASUREMENTS],
    mapping: MappingPolicy,
) -> AllocationPolicy {
    if local_ports[0] == observed[0].port() || local_ports[1] == observed[4].port() {
        return AllocationPolicy::PortPreservation;
    }

    let probes: &[usize] = match mapping {
        MappingPolicy::EndpointIndependent => &[0, 4],
        MappingPolicy::HostDependent => &[0, 2, 4, 6],
        MappingPolicy::PortDependent => &[0, 1, 2, 3, 4, 5, 6, 7],
    };

    let pairs: Vec<(u16, u16)> = probes
        .iter()
        .map(|&i| (local_ports[i / 4], observed[i].port()))
        .collect();

    determine_allocation_policy(&pairs)
}
