//! Address allocation from the user subnet
//!
//! New users get the first free host address of the subnet in ascending
//! order. The host address itself is never handed out.

use crate::core::model::NetworkConfig;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Returns the usable host addresses of the subnet in ascending order.
///
/// Network and broadcast addresses are skipped for prefixes shorter than /31;
/// /31 (point-to-point) and /32 networks use every address.
pub fn host_addresses(network: &NetworkConfig) -> impl Iterator<Item = Ipv4Addr> {
    let subnet = network.subnet();
    let first = u32::from(subnet.network());
    let last = u32::from(subnet.broadcast());
    let (start, end) = if subnet.prefix() >= 31 {
        (first, last)
    } else {
        (first + 1, last - 1)
    };
    (start..=end).map(Ipv4Addr::from)
}

/// Finds the first address not yet assigned to a user.
///
/// Returns `None` when the subnet is exhausted.
pub fn next_available_address<I>(network: &NetworkConfig, assigned: I) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = Ipv4Addr>,
{
    let taken: HashSet<Ipv4Addr> = assigned.into_iter().collect();
    let host = network.host_address();
    host_addresses(network).find(|addr| *addr != host && !taken.contains(addr))
}
