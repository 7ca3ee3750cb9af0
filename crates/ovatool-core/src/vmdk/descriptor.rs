//! The embedded text descriptor (spec.md §4.7): the small key=value /
//! extent-line document a streamOptimized VMDK carries inside its own
//! extent-header region so a consumer never needs a second file.
//!
//! This module only emits; the codec never needs to *parse* a
//! descriptor back out of a file it created itself, and parsing a
//! third party's descriptor (to locate flat/sparse extents for an OVA
//! packaging tool) is the kind of "external collaborator" spec.md §1
//! explicitly puts out of scope.

use std::time::{SystemTime, UNIX_EPOCH};

/// Number of sectors the writer reserves for the descriptor region —
/// generous relative to the handful of lines actually emitted, but
/// matches what real streamOptimized producers reserve so downstream
/// consumers that assume a fixed descriptor size are happy.
pub const DESCRIPTOR_SECTORS: u64 = 20;

const TEMPLATE: &str = concat!(
    "# Disk DescriptorFile\n",
    "version=1\n",
    "encoding=\"UTF-8\"\n",
    "CID={cid}\n",
    "parentCID=ffffffff\n",
    "createType=\"streamOptimized\"\n",
    "\n",
    "# Extent description\n",
    "RW {capacity_sectors} SPARSE \"{file_name}\"\n",
    "\n",
    "# The Disk Data Base\n",
    "#DDB\n",
    "\n",
    "ddb.longContentID = \"{long_content_id}\"\n",
    "ddb.virtualHWVersion = \"4\"\n",
    "ddb.geometry.cylinders = \"{cylinders}\"\n",
    "ddb.geometry.heads = \"255\"\n",
    "ddb.geometry.sectors = \"63\"\n",
    "ddb.adapterType = \"lsilogic\"\n",
    "ddb.toolsInstallType = \"4\"\n",
    "ddb.toolsVersion = \"{tools_version}\"\n",
);

/// Builds the descriptor text for a disk of `capacity_sectors` sectors
/// embedded under `file_name`, with the given fabricated `cid`.
pub fn emit(capacity_sectors: u64, file_name: &str, cid: u32, tools_version: &str) -> Vec<u8> {
    let cylinders = (capacity_sectors.div_ceil(255 * 63)).min(65535);
    let long_content_id = format!("{:016x}{:016x}", random_u64(), random_u64());

    TEMPLATE
        .replace("{cid}", &format!("{cid:08x}"))
        .replace("{capacity_sectors}", &capacity_sectors.to_string())
        .replace("{file_name}", file_name)
        .replace("{long_content_id}", &long_content_id)
        .replace("{cylinders}", &cylinders.to_string())
        .replace("{tools_version}", tools_version)
        .into_bytes()
}

/// A 32-bit CID for change-tracking bookkeeping, drawn from a simple
/// PRNG and excluding the two reserved all-ones-ish values (spec.md
/// §4.4).
pub fn random_cid() -> u32 {
    loop {
        let candidate = (random_u64() & 0xFFFF_FFFF) as u32;
        if candidate != 0xFFFF_FFFF && candidate != 0xFFFF_FFFE {
            return candidate;
        }
    }
}

/// A small xorshift64* PRNG seeded from the system clock. Good enough
/// for a descriptor's cosmetic CID/content-id fields — this is not a
/// cryptographic identifier, just a collision-avoidance nonce, matching
/// the "simple PRNG" spec.md calls for.
fn random_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static STATE: AtomicU64 = AtomicU64::new(0);

    let mut seed = STATE.load(Ordering::Relaxed);
    if seed == 0 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E3779B97F4A7C15);
        seed = nanos | 1;
    }

    seed ^= seed << 13;
    seed ^= seed >> 7;
    seed ^= seed << 17;
    STATE.store(seed, Ordering::Relaxed);
    seed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_expected_fields() {
        let text = emit(2048, "disk-s001.vmdk", 0xDEADBEEF, "10346");
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains("CID=deadbeef"));
        assert!(text.contains("parentCID=ffffffff"));
        assert!(text.contains("createType=\"streamOptimized\""));
        assert!(text.contains("RW 2048 SPARSE \"disk-s001.vmdk\""));
        assert!(text.contains("ddb.adapterType = \"lsilogic\""));
        assert!(text.contains("ddb.toolsVersion = \"10346\""));
    }

    #[test]
    fn cylinders_are_capped() {
        let text = emit(u64::MAX / 1000, "big.vmdk", 1, "0");
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains("ddb.geometry.cylinders = \"65535\""));
    }

    #[test]
    fn random_cid_avoids_reserved_values() {
        for _ in 0..1000 {
            let cid = random_cid();
            assert_ne!(cid, 0xFFFF_FFFF);
            assert_ne!(cid, 0xFFFF_FFFE);
        }
    }
}
