/// Small helpers shared by the shell and the connection layer.
///
/// IMPORTANT:
/// - No connection state lives here.
/// - Everything in this module must stay pure and deterministic
///   (apart from reading the clock).
///

use std::time::{SystemTime, UNIX_EPOCH};

/// Builds the stream endpoint address `scheme://host:port`.
///
/// Examples:
/// - ("ws", "192.168.4.1", 81)  -> "ws://192.168.4.1:81"
/// - ("wss", "oximeter.lan", 443) -> "wss://oximeter.lan:443"
/// - ("ws", "fe80::1", 81)      -> "ws://[fe80::1]:81"
///
/// No path and no query string are appended; the sensor serves its
/// stream on the root of the port.
pub fn build_endpoint(scheme: &str, host: &str, port: u16) -> String {
    let host = host.trim();

    if host.contains(':') && !host.starts_with('[') {
        format!("{}://[{}]:{}", scheme, host, port)
    } else {
        format!("{}://{}:{}", scheme, host, port)
    }
}

/// Returns the current Unix timestamp in milliseconds.
///
/// Falls back to 0 if the system clock is set before the epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
