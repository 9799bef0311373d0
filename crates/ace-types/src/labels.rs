//! Container label keys, bit-exact with spec §6 so reindexing at startup
//! can recover engine state from live containers.

pub const MANAGED: &str = "control-plane.managed";
pub const VPN_CONTAINER: &str = "control-plane.vpn_container";
pub const FORWARDED: &str = "control-plane.forwarded";
pub const HOST_HTTP_PORT: &str = "control-plane.host_http_port";
pub const STREAM_GROUP: &str = "control-plane.stream_group";

/// Label used internally (not part of the bit-exact reindex set) to record
/// which stream a container belongs to, when a `stream_id` label override
/// is present on the originating event.
pub const STREAM_ID: &str = "control-plane.stream_id";

pub fn managed_filter() -> (&'static str, &'static str) {
    (MANAGED, "true")
}
