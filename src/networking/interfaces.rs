// Copyright (c) 2026 Lansend
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Local interface enumeration. Discovery consumes plain IPv4 addresses;
//! this is the only place that talks to the OS about interfaces.

use std::net::Ipv4Addr;

/// Non-loopback IPv4 addresses of interfaces that are up and
/// multicast-capable. An empty result means enumeration failed or the host
/// has no usable interface; callers fall back to the default interface.
pub fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    let mut addrs: Vec<Ipv4Addr> = netdev::get_interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && !iface.is_loopback() && iface.is_multicast())
        .flat_map(|iface| iface.ipv4.into_iter().map(|net| net.addr))
        .filter(|addr| !addr.is_loopback())
        .collect();
    addrs.sort_unstable();
    addrs.dedup();
    addrs
}
