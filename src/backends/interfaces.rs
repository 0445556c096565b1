// Host interface lookup

use std::net::IpAddr;

/// Resolves which host interface owns an address
pub trait InterfaceResolver: Send + Sync {
    /// Name of the first interface whose network contains `address`
    fn interface_for(&self, address: IpAddr) -> Option<String>;
}

/// Looks at the live interface list via pnet
pub struct HostInterfaces;

impl InterfaceResolver for HostInterfaces {
    fn interface_for(&self, address: IpAddr) -> Option<String> {
        let interfaces = pnet_datalink::interfaces();

        // First match wins, same order the kernel lists them
        let found = interfaces
            .into_iter()
            .find(|iface| iface.ips.iter().any(|net| net.contains(address)));

        match found {
            Some(iface) => {
                log::debug!("Address {} belongs to interface {}", address, iface.name);
                Some(iface.name)
            }
            None => {
                log::debug!("No interface owns address {}", address);
                None
            }
        }
    }
}
