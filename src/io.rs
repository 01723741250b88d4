//! `.npy` persistence.
//!
//! Samples are written as `(B, C, H, W)` little-endian `f32` arrays. Operator artifacts (modal
//! basis, pupil mask) are read in whatever element type they were saved with: NumPy hands out
//! `f64` bases and `bool`, integer or float masks.

use crate::operator::PupilMask;
use crate::{Error, Result};
use ndarray::{s, Array2, Array4};
use ndarray_npy::{read_npy, write_npy, ReadNpyError, ReadableElement};
use std::path::Path;

/// Write a sample batch.
pub fn save_samples(path: impl AsRef<Path>, x: &Array4<f32>) -> Result<()> {
    let path = path.as_ref();
    write_npy(path, x)?;
    tracing::debug!(path = %path.display(), shape = ?x.shape(), "saved samples");
    Ok(())
}

/// Read a sample batch written by [`save_samples`] (or `numpy.save` of a 4-D `float32` array).
pub fn load_samples(path: impl AsRef<Path>) -> Result<Array4<f32>> {
    Ok(read_npy(path.as_ref())?)
}

/// `Ok(None)` when the file holds a different element type.
fn try_read_2d<T>(path: &Path, convert: impl Fn(T) -> f32) -> Result<Option<Array2<f32>>>
where
    T: ReadableElement + Clone,
{
    match read_npy::<_, Array2<T>>(path) {
        Ok(a) => Ok(Some(a.mapv(convert))),
        Err(ReadNpyError::WrongDescriptor(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read any 2-D float or integer array as `f32`.
fn read_2d_as_f32(path: &Path) -> Result<Array2<f32>> {
    if let Some(a) = try_read_2d::<f32>(path, |v| v)? {
        return Ok(a);
    }
    if let Some(a) = try_read_2d::<f64>(path, |v| v as f32)? {
        return Ok(a);
    }
    if let Some(a) = try_read_2d::<i64>(path, |v| v as f32)? {
        return Ok(a);
    }
    if let Some(a) = try_read_2d::<i32>(path, |v| v as f32)? {
        return Ok(a);
    }
    if let Some(a) = try_read_2d::<i16>(path, f32::from)? {
        return Ok(a);
    }
    if let Some(a) = try_read_2d::<i8>(path, f32::from)? {
        return Ok(a);
    }
    if let Some(a) = try_read_2d::<u16>(path, f32::from)? {
        return Ok(a);
    }
    // Last candidate: its error (wrong descriptor included) is the one reported.
    let a: Array2<u8> = read_npy(path)?;
    Ok(a.mapv(f32::from))
}

/// Read a modal basis `(P, K)` and keep its first `num_modes` columns.
pub fn load_modes(path: impl AsRef<Path>, num_modes: usize) -> Result<Array2<f32>> {
    let modes = read_2d_as_f32(path.as_ref())?;
    if num_modes == 0 || num_modes > modes.ncols() {
        return Err(Error::ShapeMismatch(format!(
            "requested {num_modes} modes from a basis with {} columns",
            modes.ncols()
        )));
    }
    Ok(modes.slice(s![.., ..num_modes]).to_owned())
}

/// Read a pupil mask saved as `bool` or as any float or integer array (nonzero = valid).
pub fn load_pupil_mask(path: impl AsRef<Path>) -> Result<PupilMask> {
    let path = path.as_ref();
    match read_npy::<_, Array2<bool>>(path) {
        Ok(m) => Ok(PupilMask::new(m)),
        Err(ReadNpyError::WrongDescriptor(_)) => {
            let values = read_2d_as_f32(path)?;
            Ok(PupilMask::from_numeric(&values.view()))
        }
        Err(e) => Err(e.into()),
    }
}
