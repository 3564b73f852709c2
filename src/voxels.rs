//! Voxel volume assembly from DICOM slices, and the inverse quantization
//! when rebuilding instances.
//!
//! Volumes are kept in (X, Y, Z) axis order, which is what the remote
//! protocol's `.npy` files use; slices on the wire are (rows, columns).
use camino::Utf8PathBuf;
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject};
use dicom_pixeldata::PixelDecoder;
use ndarray::{Array2, Array3, Axis};

#[derive(thiserror::Error, Debug)]
pub(crate) enum VolumeError {
    #[error(transparent)]
    Read(#[from] dicom::object::ReadError),

    #[error("could not decode pixel data: {0}")]
    Decode(#[from] dicom_pixeldata::Error),

    #[error("slice is missing {0}")]
    MissingTag(&'static str),

    #[error("empty series")]
    Empty,

    #[error("slice shapes differ within the series")]
    ShapeMismatch,
}

/// Read the given instance files into a float volume, slices sorted by
/// their Z position and values rescaled by slope/intercept.
pub(crate) fn extract_volume(paths: &[Utf8PathBuf]) -> Result<Array3<f32>, VolumeError> {
    let mut slices = Vec::with_capacity(paths.len());
    for path in paths {
        let obj = open_file(path.as_std_path())?;
        slices.push(read_slice(&obj)?);
    }
    if slices.is_empty() {
        return Err(VolumeError::Empty);
    }
    slices.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let (rows, cols) = slices[0].1.dim();
    let mut volume = Array3::<f32>::zeros((slices.len(), rows, cols));
    for (index, (_, plane)) in slices.iter().enumerate() {
        if plane.dim() != (rows, cols) {
            return Err(VolumeError::ShapeMismatch);
        }
        volume.index_axis_mut(Axis(0), index).assign(plane);
    }
    Ok(zyx_to_xyz(volume))
}

/// One decoded slice: Z position and the rescaled (rows, columns) plane.
fn read_slice(obj: &DefaultDicomObject) -> Result<(f64, Array2<f32>), VolumeError> {
    let z = obj
        .element(tags::IMAGE_POSITION_PATIENT)
        .ok()
        .and_then(|e| e.to_multi_float64().ok())
        .filter(|v| v.len() >= 3)
        .map(|v| v[2])
        .ok_or(VolumeError::MissingTag("ImagePositionPatient"))?;
    let slope = obj
        .element(tags::RESCALE_SLOPE)
        .ok()
        .and_then(|e| e.to_float64().ok())
        .unwrap_or(1.0) as f32;
    let intercept = obj
        .element(tags::RESCALE_INTERCEPT)
        .ok()
        .and_then(|e| e.to_float64().ok())
        .unwrap_or(0.0) as f32;

    let decoded = obj.decode_pixel_data()?;
    let foreign_array = decoded.to_ndarray::<f32>()?;
    // Re-home into our own `ndarray` version: `dicom-pixeldata` depends on a
    // different major version of `ndarray` than the rest of this crate.
    let dim = foreign_array.dim();
    let data: Vec<f32> = foreign_array.iter().cloned().collect();
    let array = ndarray::Array4::from_shape_vec(dim, data).map_err(|_| VolumeError::ShapeMismatch)?;
    // [frames, rows, columns, samples] -> first frame, first sample
    let plane = array
        .index_axis_move(Axis(0), 0)
        .index_axis_move(Axis(2), 0)
        .into_dimensionality::<ndarray::Ix2>()
        .map_err(|_| VolumeError::ShapeMismatch)?;
    Ok((z, plane.mapv(|v| v * slope + intercept)))
}

/// (Z, Y, X) stack to (X, Y, Z) volume.
pub(crate) fn zyx_to_xyz(volume: Array3<f32>) -> Array3<f32> {
    volume
        .permuted_axes([2, 1, 0])
        .as_standard_layout()
        .to_owned()
}

/// (X, Y, Z) volume back to a (Z, Y, X) stack.
pub(crate) fn xyz_to_zyx(volume: Array3<f32>) -> Array3<f32> {
    volume
        .permuted_axes([2, 1, 0])
        .as_standard_layout()
        .to_owned()
}

/// One rebuilt slice: 16-bit pixel bytes and the rescale slope to recover
/// the original values.
pub(crate) struct QuantizedSlice {
    pub bytes: Vec<u8>,
    pub slope: f64,
}

/// Quantize an (X, Y, Z) volume into per-slice uint16 planes, bottom slice
/// first. Each slice gets its own slope `max / (2^15 - 1)`.
pub(crate) fn quantize_slices(volume_xyz: Array3<f32>) -> Vec<QuantizedSlice> {
    let stack = xyz_to_zyx(volume_xyz);
    stack
        .axis_iter(Axis(0))
        .map(|plane| {
            let max = plane.iter().cloned().fold(0.0f32, f32::max);
            let slope = if max > 0.0 {
                max as f64 / ((1 << 15) - 1) as f64
            } else {
                1.0
            };
            let mut bytes = Vec::with_capacity(plane.len() * 2);
            for value in plane.iter() {
                let quantized = (*value as f64 / slope) as u16;
                bytes.extend_from_slice(&quantized.to_le_bytes());
            }
            QuantizedSlice {
                bytes,
                slope,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{synthetic_pet_slice, SyntheticSlice};
    use camino::Utf8PathBuf;

    #[test]
    fn test_extract_volume_from_slices_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        // write slices out of Z order with a per-file rescale slope
        let mut paths = Vec::new();
        for (sop, z, base) in [("b", 3.27, 100u16), ("a", 0.0, 0u16), ("c", 6.54, 200u16)] {
            let pixels: Vec<u16> = (0..6).map(|i| base + i).collect();
            let obj = synthetic_pet_slice(SyntheticSlice {
                sop_uid: sop,
                series_uid: "s1",
                study_uid: "st1",
                z,
                rows: 2,
                columns: 3,
                pixels,
                rescale_slope: 2.0,
            });
            let path = root.join(format!("{sop}.dcm"));
            obj.write_to_file(path.as_std_path()).unwrap();
            paths.push(path);
        }

        let volume = extract_volume(&paths).unwrap();
        // (X, Y, Z) with 3 columns, 2 rows, 3 slices
        assert_eq!(volume.dim(), (3, 2, 3));
        // slice order is by Z, not input order: z=0 has base 0
        assert_eq!(volume[[0, 0, 0]], 0.0);
        // stored value 100 at slice z=3.27, rescaled by slope 2
        assert_eq!(volume[[0, 0, 1]], 200.0);
        // row-major pixel 5 of slice z=6.54 lands at x=2, y=1
        assert_eq!(volume[[2, 1, 2]], (200 + 5) as f32 * 2.0);
    }

    #[test]
    fn test_axis_round_trip() {
        let volume = Array3::from_shape_fn((4, 3, 2), |(z, y, x)| (z * 100 + y * 10 + x) as f32);
        let xyz = zyx_to_xyz(volume.clone());
        assert_eq!(xyz.dim(), (2, 3, 4));
        assert_eq!(xyz[[1, 2, 3]], volume[[3, 2, 1]]);
        let back = xyz_to_zyx(xyz);
        assert_eq!(back, volume);
    }

    #[test]
    fn test_quantization_error_is_bounded_by_slope() {
        // a slice with values well above the 16-bit range
        let volume =
            Array3::from_shape_fn((8, 8, 3), |(x, y, z)| (x * 1000 + y * 77 + z * 13) as f32);
        let slices = quantize_slices(volume.clone());
        assert_eq!(slices.len(), 3);
        let stack = xyz_to_zyx(volume);
        for (index, slice) in slices.iter().enumerate() {
            let plane = stack.index_axis(Axis(0), index);
            for (byte_pair, original) in slice.bytes.chunks_exact(2).zip(plane.iter()) {
                let stored = u16::from_le_bytes([byte_pair[0], byte_pair[1]]);
                let recovered = stored as f64 * slice.slope;
                assert!(
                    (recovered - *original as f64).abs() <= slice.slope,
                    "|{recovered} - {original}| > {}",
                    slice.slope
                );
            }
        }
    }

    #[test]
    fn test_quantization_of_flat_slice() {
        let volume = Array3::<f32>::zeros((4, 4, 1));
        let slices = quantize_slices(volume);
        assert_eq!(slices[0].slope, 1.0);
        assert!(slices[0].bytes.iter().all(|b| *b == 0));
    }
}
