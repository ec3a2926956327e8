use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Size and crc32 of one file inside a part.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileChecksum {
    pub size: u64,
    pub crc32: u32,
}

/// The checksum manifest of a part: one entry per file, keyed by file name.
///
/// This is what replicas publish to the coordination store alongside the part
/// registration, what fetch receivers validate against, and what the part
/// checker compares local data to.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PartChecksums {
    pub files: BTreeMap<String, FileChecksum>,
}

impl PartChecksums {
    pub fn add(&mut self, file: impl Into<String>, size: u64, crc32: u32) {
        self.files.insert(file.into(), FileChecksum { size, crc32 });
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }

    /// First divergence from `other`, described with enough context for the
    /// part checker to log. `None` means the manifests agree.
    pub fn first_mismatch(&self, other: &PartChecksums) -> Option<String> {
        for (name, mine) in &self.files {
            match other.files.get(name) {
                None => return Some(format!("file {name} missing from other manifest")),
                Some(theirs) if theirs != mine => {
                    return Some(format!(
                        "file {name}: size {} crc {:08x} vs size {} crc {:08x}",
                        mine.size, mine.crc32, theirs.size, theirs.crc32
                    ));
                }
                Some(_) => {}
            }
        }
        other
            .files
            .keys()
            .find(|name| !self.files.contains_key(*name))
            .map(|name| format!("unexpected file {name} in other manifest"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_reporting() {
        let mut a = PartChecksums::default();
        a.add("id.bin", 16, 0xdead_beef);
        a.add("primary.idx", 8, 0x1);

        let mut b = a.clone();
        assert_eq!(a.first_mismatch(&b), None);

        b.add("id.bin", 16, 0xfeed_face);
        assert!(a.first_mismatch(&b).unwrap().contains("id.bin"));

        let mut c = a.clone();
        c.files.remove("primary.idx");
        assert!(a.first_mismatch(&c).unwrap().contains("primary.idx"));
        assert!(c.first_mismatch(&a).unwrap().contains("primary.idx"));
    }

    #[test]
    fn json_round_trip() {
        let mut a = PartChecksums::default();
        a.add("id.bin", 16, 7);
        let json = serde_json::to_string(&a).unwrap();
        let back: PartChecksums = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
        assert_eq!(back.total_bytes(), 16);
    }
}
