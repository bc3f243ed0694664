//! Parameter snapshots.
//!
//! # `.bfld` Snapshot Format
//!
//! A snapshot stores one field's parameter arena together with the partition
//! it was written with, so a snapshot can only be loaded into a field whose
//! sub-modules own exactly the same number of values.
//!
//! ```text
//! ┌────────────┬──────────────────────┬──────────────────────┐
//! │ Header     │ Sections             │ Data                 │
//! ├────────────┼──────────────────────┼──────────────────────┤
//! │ "bfld"[4]  │ u8: module id        │ [f32; total] values  │
//! │ u8: ver    │ u64: element count   │ in section order     │
//! │ u8: count  │ … repeated `count`   │                      │
//! └────────────┴──────────────────────┴──────────────────────┘
//! ```
//!
//! All integers and floats are little-endian. Sections appear in
//! [`ModuleId::ORDER`]. Only the training-precision values are stored; the
//! inference shadow is rebuilt by the field after loading.
//!
//! # Example
//!
//! ```rust
//! use briny_field::checkpoint::{read_parameters, write_parameters};
//! use briny_field::params::ParameterLayout;
//!
//! let layout = ParameterLayout::new([4, 2, 3, 0, 0]);
//! let params: Vec<f32> = (0..9).map(|i| i as f32).collect();
//!
//! let mut bytes = Vec::new();
//! write_parameters(&mut bytes, &layout, &params).unwrap();
//! let loaded = read_parameters(bytes.as_slice(), &layout).unwrap();
//! assert_eq!(loaded, params);
//! ```

use crate::error::{FieldError, Result};
use crate::field::NerfField;
use crate::params::{ModuleId, ParameterBlock, ParameterLayout};
use briny::prelude::*;
use std::io::{Read, Write};

const BFLD_MAGIC: &[u8; 4] = b"bfld";
const BFLD_VERSION: u8 = 1;

/// A snapshot as read from the wire, before it is trusted.
struct PackedParameters {
    sections: Vec<(u8, u64)>,
    data: Vec<f32>,
}

impl Validate for PackedParameters {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.sections.len() != ModuleId::ORDER.len() {
            return Err(ValidationError);
        }
        let in_order = self
            .sections
            .iter()
            .zip(ModuleId::ORDER)
            .all(|(&(id, _), expected)| usize::from(id) == expected.index());
        let total: u64 = self.sections.iter().map(|&(_, n)| n).sum();
        if !in_order || u64::try_from(self.data.len()).ok() != Some(total) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Writes `params` as a `.bfld` snapshot partitioned by `layout`.
///
/// # Errors
/// [`FieldError::Parameters`] if `params` does not match `layout`, and
/// [`FieldError::Io`] if the writer fails.
pub fn write_parameters(mut writer: impl Write, layout: &ParameterLayout, params: &[f32]) -> Result<()> {
    if params.len() != layout.total() {
        return Err(FieldError::Parameters {
            expected: layout.total(),
            found: params.len(),
        });
    }

    writer.write_all(BFLD_MAGIC)?;
    #[allow(clippy::cast_possible_truncation)]
    writer.write_all(&[BFLD_VERSION, ModuleId::ORDER.len() as u8])?;
    for (id, range) in layout.iter() {
        writer.write_all(&[id as u8])?;
        writer.write_all(&(range.len() as u64).to_le_bytes())?;
    }
    for &value in params {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads a `.bfld` snapshot and checks every section against `layout`.
///
/// # Returns
/// The training-precision values, in arena order.
///
/// # Errors
/// [`FieldError::Checkpoint`] if the header is not a `.bfld` header or a
/// section disagrees with `layout`, [`FieldError::Validation`] if the record
/// fails validation, and [`FieldError::Io`] on a short read.
pub fn read_parameters(mut reader: impl Read, layout: &ParameterLayout) -> Result<Vec<f32>> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != BFLD_MAGIC {
        return Err(FieldError::Checkpoint("invalid magic header".into()));
    }

    let mut header = [0u8; 2];
    reader.read_exact(&mut header)?;
    let [version, count] = header;
    if version != BFLD_VERSION {
        return Err(FieldError::Checkpoint(format!("unsupported version {version}")));
    }
    if usize::from(count) != ModuleId::ORDER.len() {
        return Err(FieldError::Checkpoint(format!("expected 5 sections, found {count}")));
    }

    let mut buf8 = [0u8; 8];
    let mut sections = Vec::with_capacity(usize::from(count));
    for (expected_id, range) in layout.iter() {
        let mut id = [0u8; 1];
        reader.read_exact(&mut id)?;
        reader.read_exact(&mut buf8)?;
        let n = u64::from_le_bytes(buf8);
        if usize::from(id[0]) != expected_id.index() || u64::try_from(range.len()).ok() != Some(n) {
            return Err(FieldError::Checkpoint(format!(
                "section {} holds {n} values for module {}, expected {} for {}",
                sections.len(),
                id[0],
                range.len(),
                expected_id.name()
            )));
        }
        sections.push((id[0], n));
    }

    let mut data = Vec::with_capacity(layout.total());
    let mut buf4 = [0u8; 4];
    for _ in 0..layout.total() {
        reader.read_exact(&mut buf4)?;
        data.push(f32::from_le_bytes(buf4));
    }

    let trusted = TrustedData::new(PackedParameters { sections, data })?;
    Ok(trusted.into_inner().data)
}

impl NerfField {
    /// Writes the training-precision parameters as a `.bfld` snapshot.
    ///
    /// # Errors
    /// [`FieldError::Io`] if the writer fails.
    pub fn save_parameters(&self, writer: impl Write) -> Result<()> {
        write_parameters(writer, self.parameter_layout(), &self.parameters().params)
    }

    /// Replaces the parameters with a `.bfld` snapshot, rebuilding the
    /// inference shadow and clearing the gradients.
    ///
    /// # Errors
    /// See [`read_parameters`]. The field is unchanged on error.
    pub fn load_parameters(&mut self, reader: impl Read) -> Result<()> {
        let params = read_parameters(reader, self.parameter_layout())?;
        self.set_params(ParameterBlock::from_params(params, self.inference_precision()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(layout: &ParameterLayout) -> Vec<u8> {
        let params: Vec<f32> = (0..layout.total()).map(|i| i as f32 * 0.5).collect();
        let mut bytes = Vec::new();
        write_parameters(&mut bytes, layout, &params).unwrap();
        bytes
    }

    #[test]
    fn header_is_little_endian() {
        let layout = ParameterLayout::new([1, 0, 0, 0, 2]);
        let bytes = snapshot(&layout);
        assert_eq!(&bytes[..4], b"bfld");
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 5);
        assert_eq!(bytes[6], 0);
        assert_eq!(&bytes[7..15], &1u64.to_le_bytes());
        assert_eq!(bytes.len(), 6 + 5 * 9 + 3 * 4);
    }

    #[test]
    fn rejects_foreign_partition() {
        let bytes = snapshot(&ParameterLayout::new([4, 2, 3, 0, 0]));
        let err = read_parameters(bytes.as_slice(), &ParameterLayout::new([3, 3, 3, 0, 0])).unwrap_err();
        assert!(matches!(err, FieldError::Checkpoint(_)));
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let layout = ParameterLayout::new([4, 2, 3, 0, 0]);
        let mut bytes = snapshot(&layout);
        bytes[0] = b'x';
        assert!(matches!(
            read_parameters(bytes.as_slice(), &layout),
            Err(FieldError::Checkpoint(_))
        ));

        let bytes = snapshot(&layout);
        assert!(matches!(
            read_parameters(&bytes[..bytes.len() - 1], &layout),
            Err(FieldError::Io(_))
        ));
    }

    #[test]
    fn rejects_wrong_parameter_count_on_write() {
        let layout = ParameterLayout::new([4, 0, 0, 0, 0]);
        let err = write_parameters(Vec::new(), &layout, &[1.0]).unwrap_err();
        assert!(matches!(err, FieldError::Parameters { expected: 4, found: 1 }));
    }
}
