//! Vector column files.
//!
//! Layout (little endian): magic `PVEC`, row count `u64`, dimension `u32`,
//! then `rows * dimension` `f32` values in row order.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{PartIndexError, Result};

const MAGIC: &[u8; 4] = b"PVEC";

/// A dense column of fixed-dimension vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorColumn {
    dimension: usize,
    values: Vec<f32>,
}

impl VectorColumn {
    pub fn new(dimension: usize) -> Self {
        VectorColumn {
            dimension,
            values: Vec::new(),
        }
    }

    pub fn from_rows(dimension: usize, rows: &[Vec<f32>]) -> Result<Self> {
        let mut column = VectorColumn::new(dimension);
        for row in rows {
            column.push(row)?;
        }
        Ok(column)
    }

    pub fn push(&mut self, row: &[f32]) -> Result<()> {
        if row.len() != self.dimension {
            return Err(PartIndexError::part(format!(
                "row has dimension {}, column expects {}",
                row.len(),
                self.dimension
            )));
        }
        self.values.extend_from_slice(row);
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn rows(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.values.len() / self.dimension
        }
    }

    pub fn row(&self, index: usize) -> &[f32] {
        let start = index * self.dimension;
        &self.values[start..start + self.dimension]
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.values.chunks_exact(self.dimension.max(1))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(16 + self.values.len() * 4);
        out.extend_from_slice(MAGIC);
        out.write_u64::<LittleEndian>(self.rows() as u64)?;
        out.write_u32::<LittleEndian>(self.dimension as u32)?;
        for value in &self.values {
            out.write_f32::<LittleEndian>(*value)?;
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(PartIndexError::part("not a vector column file"));
        }
        let rows = cursor.read_u64::<LittleEndian>()? as usize;
        let dimension = cursor.read_u32::<LittleEndian>()? as usize;

        let expected = rows
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| PartIndexError::part("vector column size overflows"))?;
        let remaining = bytes.len() - cursor.position() as usize;
        if remaining != expected {
            return Err(PartIndexError::part(format!(
                "vector column truncated: expected {expected} bytes of values, found {remaining}"
            )));
        }

        let mut values = vec![0f32; rows * dimension];
        cursor.read_f32_into::<LittleEndian>(&mut values)?;
        Ok(VectorColumn { dimension, values })
    }

    /// Append every row of `other` whose index is not in `skip`.
    pub fn extend_filtered(&mut self, other: &VectorColumn, skip: impl Fn(usize) -> bool) -> Result<()> {
        if other.dimension != self.dimension {
            return Err(PartIndexError::part(format!(
                "cannot merge columns of dimension {} and {}",
                self.dimension, other.dimension
            )));
        }
        for (i, row) in other.iter_rows().enumerate() {
            if !skip(i) {
                self.values.extend_from_slice(row);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let column = VectorColumn::from_rows(2, &[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let decoded = VectorColumn::decode(&column.encode().unwrap()).unwrap();
        assert_eq!(decoded, column);
        assert_eq!(decoded.rows(), 2);
        assert_eq!(decoded.row(1), &[3.0, 4.0]);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let column = VectorColumn::from_rows(2, &[vec![1.0, 2.0]]).unwrap();
        let mut bytes = column.encode().unwrap();
        bytes.pop();
        assert!(VectorColumn::decode(&bytes).is_err());
        assert!(VectorColumn::decode(b"nope").is_err());
    }

    #[test]
    fn test_push_checks_dimension() {
        let mut column = VectorColumn::new(3);
        assert!(column.push(&[1.0]).is_err());
    }

    #[test]
    fn test_extend_filtered() {
        let a = VectorColumn::from_rows(1, &[vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let mut merged = VectorColumn::new(1);
        merged.extend_filtered(&a, |i| i == 1).unwrap();
        assert_eq!(merged.values(), &[1.0, 3.0]);
    }
}
