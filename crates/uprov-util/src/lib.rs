//! Small helpers shared by the provider crates.

use std::io;
use std::net::TcpListener;
use std::path::Path;

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}

/// Ask the OS for a currently-free TCP port.
///
/// The port is released again before returning, so a raced bind is possible;
/// callers that need the port themselves should bind to `:0` directly.
pub fn free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Stable identifier for this provider host.
///
/// Uses the `eth0` MAC address when the interface exists, otherwise a random
/// UUID (unique per process, which is all the coordinator needs).
pub fn machine_id() -> String {
    match read_mac("/sys/class/net/eth0/address") {
        Some(mac) => mac,
        None => uuid::Uuid::new_v4().to_string(),
    }
}

fn read_mac(path: impl AsRef<Path>) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let mac = raw.trim();
    if mac.is_empty() || mac == "00:00:00:00:00:00" {
        return None;
    }
    Some(mac.to_string())
}

/// Render a byte count the way progress lines expect it: `512B`, `1.5K`,
/// `10M`, `3G`. One decimal at most, trailing `.0` dropped.
pub fn human_bytes(n: u64) -> String {
    const UNITS: [(u64, char); 4] = [
        (1 << 40, 'T'),
        (1 << 30, 'G'),
        (1 << 20, 'M'),
        (1 << 10, 'K'),
    ];
    for (factor, suffix) in UNITS {
        if n >= factor {
            let value = n as f64 / factor as f64;
            return if (value - value.round()).abs() < 0.05 {
                format!("{}{suffix}", value.round() as u64)
            } else {
                format!("{value:.1}{suffix}")
            };
        }
    }
    format!("{n}B")
}

/// `human_bytes` over a rate, with the `/s` suffix attached.
pub fn human_rate(bytes_per_sec: u64) -> String {
    format!("{}/s", human_bytes(bytes_per_sec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_small_values_keep_byte_suffix() {
        assert_eq!(human_bytes(0), "0B");
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(1023), "1023B");
    }

    #[test]
    fn human_bytes_rounds_to_one_decimal() {
        assert_eq!(human_bytes(1024), "1K");
        assert_eq!(human_bytes(1536), "1.5K");
        assert_eq!(human_bytes(10 * 1024 * 1024), "10M");
        assert_eq!(human_bytes(3 << 30), "3G");
    }

    #[test]
    fn human_rate_appends_per_second() {
        assert_eq!(human_rate(2048), "2K/s");
    }

    #[test]
    fn machine_id_is_mac_or_uuid() {
        let id = machine_id();
        // Either a MAC (17 chars with colons) or a UUID (36 chars with dashes).
        assert!(id.len() == 17 || id.len() == 36, "unexpected id: {id}");
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(free_port().unwrap(), 0);
    }
}
