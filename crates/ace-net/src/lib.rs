//! # Port Allocator (C1) & VPN Health Monitor (C2)

pub mod error;
pub mod ports;
pub mod probe;
pub mod vpn_health;

pub use error::{NetError, Result};
pub use ports::{PortAllocator, PortRange, GLOBAL_POOL};
pub use probe::VpnProbe;
pub use vpn_health::{EmergencyState, ObservedVpn, VpnEvent, VpnHealthMonitor, VpnStatusView};
