#![forbid(unsafe_code)]

use bkt_error::{BktError, Result};
use bkt_types::{
    BUCKET_TREE_MAGIC, BUCKET_TREE_VERSION, NODE_HEADER_SIZE, read_le_i32, read_le_i64,
    read_le_u32, write_le_i32, write_le_i64, write_le_u32,
};
use serde::{Deserialize, Serialize};

/// Bucket tree header ("BKTR", 16 bytes at offset 0 of the node storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub entry_count: i32,
    pub reserved: i32,
}

impl Header {
    pub const SIZE: usize = NODE_HEADER_SIZE;

    /// Build a header for a freshly formatted tree.
    #[must_use]
    pub fn format(entry_count: i32) -> Self {
        Self {
            magic: BUCKET_TREE_MAGIC,
            version: BUCKET_TREE_VERSION,
            entry_count,
            reserved: 0,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self {
            magic: read_le_u32(data, 0x0)?,
            version: read_le_u32(data, 0x4)?,
            entry_count: read_le_i32(data, 0x8)?,
            reserved: read_le_i32(data, 0xC)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        // Writes into a fixed-size buffer cannot fail.
        let _ = write_le_u32(&mut out, 0x0, self.magic);
        let _ = write_le_u32(&mut out, 0x4, self.version);
        let _ = write_le_i32(&mut out, 0x8, self.entry_count);
        let _ = write_le_i32(&mut out, 0xC, self.reserved);
        out
    }

    /// Accepts iff the magic matches, the version is supported, and the
    /// entry count is non-negative.
    pub fn verify(&self) -> Result<()> {
        if self.magic != BUCKET_TREE_MAGIC {
            return Err(BktError::format(format!(
                "bad magic {:#010x}, expected {BUCKET_TREE_MAGIC:#010x}",
                self.magic
            )));
        }
        if self.version != BUCKET_TREE_VERSION {
            return Err(BktError::format(format!(
                "unsupported version {}, expected {BUCKET_TREE_VERSION}",
                self.version
            )));
        }
        if self.entry_count < 0 {
            return Err(BktError::format(format!(
                "negative entry count {}",
                self.entry_count
            )));
        }
        Ok(())
    }
}

/// Header common to index (L1/L2) and entry-set nodes (16 bytes).
///
/// For index nodes `offset` is the first virtual address the node covers;
/// for entry-set nodes it is the exclusive end of the set's range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeader {
    pub index: i32,
    pub count: i32,
    pub offset: i64,
}

impl NodeHeader {
    pub const SIZE: usize = NODE_HEADER_SIZE;

    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self {
            index: read_le_i32(data, 0x0)?,
            count: read_le_i32(data, 0x4)?,
            offset: read_le_i64(data, 0x8)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let _ = write_le_i32(&mut out, 0x0, self.index);
        let _ = write_le_i32(&mut out, 0x4, self.count);
        let _ = write_le_i64(&mut out, 0x8, self.offset);
        out
    }

    /// Structural verification for a node loaded from position `node_index`
    /// within its tier; `capacity` is the tier's per-node slot capacity.
    pub fn verify(&self, node_index: i32, capacity: i32) -> Result<()> {
        if self.index != node_index {
            return Err(BktError::format(format!(
                "node index {} does not match position {node_index}",
                self.index
            )));
        }
        if self.count < 1 || self.count > capacity {
            return Err(BktError::InvalidNodeEntryCount {
                index: self.index,
                count: self.count,
                capacity,
            });
        }
        if self.offset < 0 {
            return Err(BktError::InvalidNodeEntryOffset {
                index: self.index,
                offset: self.offset,
            });
        }
        Ok(())
    }
}

/// Descriptor of one loaded entry set: the leaf's node header plus the
/// derived half-open range `[start, end)`.
///
/// `end` is the leaf header's offset field; `start` is the leading 8 bytes
/// of the set's first entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySetInfo {
    pub index: i32,
    pub count: i32,
    pub start: i64,
    pub end: i64,
}

impl EntrySetInfo {
    #[must_use]
    pub fn from_header(header: NodeHeader, start: i64) -> Self {
        Self {
            index: header.index,
            count: header.count,
            start,
            end: header.offset,
        }
    }

    /// The range must be non-empty and non-negative.
    pub fn verify_range(&self) -> Result<()> {
        if self.start < 0 || self.end < self.start {
            return Err(BktError::InvalidNodeEntryOffset {
                index: self.index,
                offset: self.start,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, offset: i64) -> bool {
        self.start <= offset && offset < self.end
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_round_trip_and_verify() {
        let header = Header::format(42);
        let parsed = Header::parse(&header.encode()).unwrap();
        assert_eq!(parsed, header);
        parsed.verify().unwrap();
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut bytes = Header::format(1).encode();
        bytes[0] = b'X';
        let err = Header::parse(&bytes).unwrap().verify().unwrap_err();
        assert!(matches!(err, BktError::InvalidFormat { .. }));
    }

    #[test]
    fn header_rejects_bad_version() {
        let mut header = Header::format(1);
        header.version = 2;
        assert!(Header::parse(&header.encode()).unwrap().verify().is_err());
    }

    #[test]
    fn header_rejects_negative_entry_count() {
        let header = Header::format(-1);
        assert!(header.verify().is_err());
    }

    #[test]
    fn node_header_round_trip() {
        let nh = NodeHeader {
            index: 3,
            count: 17,
            offset: 0x1000,
        };
        assert_eq!(NodeHeader::parse(&nh.encode()).unwrap(), nh);
        nh.verify(3, 63).unwrap();
    }

    #[test]
    fn node_header_verify_checks_position_and_count() {
        let nh = NodeHeader {
            index: 3,
            count: 17,
            offset: 0,
        };
        assert!(matches!(
            nh.verify(2, 63),
            Err(BktError::InvalidFormat { .. })
        ));
        let nh = NodeHeader {
            index: 0,
            count: 0,
            offset: 0,
        };
        assert!(matches!(
            nh.verify(0, 63),
            Err(BktError::InvalidNodeEntryCount { .. })
        ));
        let nh = NodeHeader {
            index: 0,
            count: 64,
            offset: 0,
        };
        assert!(matches!(
            nh.verify(0, 63),
            Err(BktError::InvalidNodeEntryCount { .. })
        ));
    }

    #[test]
    fn node_header_verify_rejects_negative_offset() {
        let nh = NodeHeader {
            index: 0,
            count: 1,
            offset: -8,
        };
        assert!(matches!(
            nh.verify(0, 63),
            Err(BktError::InvalidNodeEntryOffset { .. })
        ));
    }

    #[test]
    fn entry_set_info_range() {
        let info = EntrySetInfo::from_header(
            NodeHeader {
                index: 0,
                count: 10,
                offset: 1000,
            },
            0,
        );
        info.verify_range().unwrap();
        assert!(info.contains(0));
        assert!(info.contains(999));
        assert!(!info.contains(1000));

        let inverted = EntrySetInfo {
            index: 0,
            count: 1,
            start: 500,
            end: 400,
        };
        assert!(inverted.verify_range().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn header_parse_no_panic(data in proptest::collection::vec(any::<u8>(), 0..=64)) {
            if let Ok(header) = Header::parse(&data) {
                let _ = header.verify();
            }
        }

        #[test]
        fn node_header_parse_no_panic(data in proptest::collection::vec(any::<u8>(), 0..=64)) {
            if let Ok(nh) = NodeHeader::parse(&data) {
                let _ = nh.verify(0, 63);
            }
        }
    }
}
