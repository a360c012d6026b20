//! Identifier generation and host identity.
//!
//! Every id in the fabric is a short random alphanumeric code:
//!
//! - mission extensions: 6 chars `[A-Za-z0-9]`
//! - message ids (endpoint correlator): 8 chars `[A-Za-z0-9]`
//! - server correlators (`_add`): 4 chars `[a-z0-9]`
//! - pipe safe-codes (MultiPipe routing): 6 chars `[A-Za-z0-9]`
//!
//! Node identity is the host MAC formatted `aa:bb:cc:dd:ee:ff`, optionally
//! suffixed with a role tag (e.g. `-FileNode-ab12`). When no hardware address
//! can be read, a random locally-administered address is generated once per
//! call — stable identity across restarts is not a goal of the fabric.

use rand::{distr::Alphanumeric, Rng};

/// Mission extension length (unique per connection per direction).
pub const MISSION_ID_LEN: usize = 6;
/// Endpoint message-id length.
pub const MESSAGE_ID_LEN: usize = 8;
/// Server correlator (`_add`) length.
pub const CORRELATOR_LEN: usize = 4;

/// Random alphanumeric code of the given length.
pub fn safe_code(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Random lowercase-alphanumeric correlator, as used for `_add` fields.
pub fn correlator() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..CORRELATOR_LEN)
        .map(|_| char::from(CHARS[rng.random_range(0..CHARS.len())]))
        .collect()
}

/// Fresh mission extension id.
pub fn mission_id() -> String {
    safe_code(MISSION_ID_LEN)
}

/// Fresh endpoint message id.
pub fn message_id() -> String {
    safe_code(MESSAGE_ID_LEN)
}

/// The host MAC address formatted `aa:bb:cc:dd:ee:ff`.
///
/// Reads the first non-loopback interface under `/sys/class/net` on Linux.
/// Falls back to a random locally-administered address when nothing can be
/// read (non-Linux hosts, containers with no interfaces).
pub fn host_mac() -> String {
    if let Some(mac) = sysfs_mac() {
        return mac;
    }
    random_mac()
}

/// `host_mac()` with a role suffix: `aa:bb:cc:dd:ee:ff-<role>-<code>`.
pub fn host_mac_tagged(role: &str) -> String {
    format!("{}-{}-{}", host_mac(), role, safe_code(4))
}

fn sysfs_mac() -> Option<String> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy() == "lo" {
            continue;
        }
        let raw = std::fs::read_to_string(entry.path().join("address")).ok()?;
        let addr = raw.trim().to_ascii_lowercase();
        if addr.len() == 17 && addr != "00:00:00:00:00:00" {
            return Some(addr);
        }
    }
    None
}

fn random_mac() -> String {
    let mut bytes = [0u8; 6];
    rand::rng().fill(&mut bytes[..]);
    // Locally administered, unicast.
    bytes[0] = (bytes[0] | 0x02) & !0x01;
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_code_length_and_alphabet() {
        for len in [4, 6, 8, 32] {
            let code = safe_code(len);
            assert_eq!(code.len(), len);
            assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn correlator_is_lowercase() {
        for _ in 0..50 {
            let c = correlator();
            assert_eq!(c.len(), CORRELATOR_LEN);
            assert!(c.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn mac_is_well_formed() {
        let mac = host_mac();
        let parts: Vec<&str> = mac.split(':').collect();
        assert_eq!(parts.len(), 6);
        for part in parts {
            assert_eq!(part.len(), 2);
            assert!(u8::from_str_radix(part, 16).is_ok());
        }
    }

    #[test]
    fn tagged_mac_carries_role() {
        let mac = host_mac_tagged("FileNode");
        assert!(mac.contains("-FileNode-"));
    }

    #[test]
    fn random_mac_is_locally_administered() {
        let mac = random_mac();
        let first = u8::from_str_radix(&mac[0..2], 16).unwrap();
        assert_eq!(first & 0x02, 0x02);
        assert_eq!(first & 0x01, 0x00);
    }
}
