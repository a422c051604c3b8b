//! Identifier formats shared by every scope that needs a node-local-unique
//! id: process monitors, links, remote calls and remote spawns.
//!
//! Format: `<prefix><timestamp-base36>-<16 random hex>`. Uniqueness is
//! "overwhelming probability", not a guarantee — nothing in the system
//! depends on cross-node uniqueness beyond a single scope (see spec §3).

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn base36_encode(mut n: u128) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        let digit = (n % 36) as usize;
        buf.push(BASE36_ALPHABET[digit]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).expect("base36 alphabet is ASCII")
}

fn random_hex_16() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generates a new id of the form `<prefix><timestamp-base36>-<16 random hex>`.
pub fn generate(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis();
    format!("{prefix}{}-{}", base36_encode(millis), random_hex_16())
}

/// A process reference id, unique within the node that created it.
pub fn generate_process_id() -> String {
    generate("p")
}

/// `MonitorId` — prefix `m`.
pub fn generate_monitor_id() -> String {
    generate("m")
}

/// `LinkId` — prefix `l`.
pub fn generate_link_id() -> String {
    generate("l")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        assert!(generate_monitor_id().starts_with('m'));
        assert!(generate_link_id().starts_with('l'));
        assert!(generate_process_id().starts_with('p'));
    }

    #[test]
    fn ids_are_not_reused_in_a_tight_loop() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_monitor_id()));
        }
    }
}
