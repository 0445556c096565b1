// Host-side backends: packet filter, interface lookup and the bridge delegate

pub mod bridge;
pub mod interfaces;
pub mod iptables;
