//! Row deletion bitmaps.

use std::io::{Cursor, Read};

use bit_vec::BitVec;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{PartIndexError, Result};

/// Rows of a part removed by lightweight deletes. A set bit means deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMask {
    bits: BitVec,
}

impl RowMask {
    pub fn new(rows: usize) -> Self {
        RowMask {
            bits: BitVec::from_elem(rows, false),
        }
    }

    pub fn rows(&self) -> usize {
        self.bits.len()
    }

    pub fn delete(&mut self, row: usize) -> Result<()> {
        if row >= self.bits.len() {
            return Err(PartIndexError::part(format!(
                "row {row} out of range for part with {} rows",
                self.bits.len()
            )));
        }
        self.bits.set(row, true);
        Ok(())
    }

    pub fn is_deleted(&self, row: usize) -> bool {
        self.bits.get(row).unwrap_or(false)
    }

    pub fn deleted_count(&self) -> usize {
        self.bits.iter().filter(|b| *b).count()
    }

    pub fn deleted_rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, deleted)| *deleted)
            .map(|(row, _)| row)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8 + self.bits.len() / 8 + 1);
        out.write_u64::<LittleEndian>(self.bits.len() as u64)?;
        out.extend_from_slice(&self.bits.to_bytes());
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let rows = cursor.read_u64::<LittleEndian>()? as usize;
        let mut payload = Vec::new();
        cursor.read_to_end(&mut payload)?;
        if payload.len() != rows.div_ceil(8) {
            return Err(PartIndexError::part("deleted rows bitmap has wrong length"));
        }
        let mut bits = BitVec::from_bytes(&payload);
        bits.truncate(rows);
        Ok(RowMask { bits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_encode_decode() {
        let mut mask = RowMask::new(10);
        mask.delete(0).unwrap();
        mask.delete(9).unwrap();

        let decoded = RowMask::decode(&mask.encode().unwrap()).unwrap();
        assert_eq!(decoded, mask);
        assert_eq!(decoded.deleted_count(), 2);
        assert_eq!(decoded.deleted_rows().collect::<Vec<_>>(), vec![0, 9]);
        assert!(!decoded.is_deleted(5));
    }

    #[test]
    fn test_delete_out_of_range() {
        let mut mask = RowMask::new(3);
        assert!(mask.delete(3).is_err());
    }
}
