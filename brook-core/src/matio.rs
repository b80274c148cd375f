//! Readers for the decoding engine's binary matrix formats.
//!
//! Matrices are stored as `\0B` + `FM ` (f32) or `DM ` (f64) + int8/int32
//! row and column markers + the raw payload. The global statistics file
//! prefixes each matrix with a space-terminated utterance id; statistics can
//! be fetched for one utterance or summed across all of them.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use ndarray::Array2;

use crate::errors::{FeatureError, Result};

fn bad(path: &Path, reason: impl Into<String>) -> crate::errors::BrookError {
    FeatureError::BadMatrixFile {
        path: path.display().to_string(),
        reason: reason.into(),
    }
    .into()
}

fn read_exact_or<R: Read>(reader: &mut R, buf: &mut [u8], path: &Path, what: &str) -> Result<()> {
    reader
        .read_exact(buf)
        .map_err(|_| bad(path, format!("truncated while reading {what}")))
}

/// Read one `\0B`-prefixed binary matrix.
fn read_matrix_body<R: Read>(reader: &mut R, path: &Path) -> Result<Array2<f32>> {
    let mut magic = [0u8; 2];
    read_exact_or(reader, &mut magic, path, "binary marker")?;
    if &magic != b"\0B" {
        return Err(bad(path, "missing \\0B binary marker"));
    }

    let mut header = [0u8; 3];
    read_exact_or(reader, &mut header, path, "format header")?;
    let sample_size = match &header {
        b"FM " => 4,
        b"DM " => 8,
        b"CM " => return Err(bad(path, "compressed matrices are not supported")),
        other => {
            return Err(bad(
                path,
                format!("unknown format header {:?}", String::from_utf8_lossy(other)),
            ))
        }
    };

    let mut dims = [0u8; 10];
    read_exact_or(reader, &mut dims, path, "dimension markers")?;
    let rows = i32::from_le_bytes(dims[1..5].try_into().unwrap());
    let cols = i32::from_le_bytes(dims[6..10].try_into().unwrap());
    if rows <= 0 || cols <= 0 {
        return Err(bad(path, format!("bad shape ({rows}, {cols})")));
    }
    let (rows, cols) = (rows as usize, cols as usize);

    let mut payload = vec![0u8; rows * cols * sample_size];
    read_exact_or(reader, &mut payload, path, "matrix payload")?;

    let values: Vec<f32> = if sample_size == 4 {
        payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    } else {
        payload
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()) as f32)
            .collect()
    };
    Array2::from_shape_vec((rows, cols), values).map_err(|_| bad(path, "bad matrix shape"))
}

/// Read the space-terminated token ahead of each stats matrix. Returns
/// `None` at end of file.
fn read_token<R: Read>(reader: &mut R) -> Result<Option<String>> {
    let mut token = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => {
                return if token.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(String::from_utf8_lossy(&token).into_owned()))
                };
            }
            Ok(_) => {
                if byte[0] == b' ' {
                    if token.is_empty() {
                        continue;
                    }
                    return Ok(Some(String::from_utf8_lossy(&token).into_owned()));
                }
                token.push(byte[0]);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Load a dense transform (e.g. LDA+MLLT), transposed so features
/// right-multiply it: shape `(D_in, D_out)`.
pub fn load_lda_matrix(path: impl AsRef<Path>) -> Result<Array2<f32>> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let mat = read_matrix_body(&mut reader, path)?;
    Ok(mat.reversed_axes().as_standard_layout().to_owned())
}

/// Load CMVN statistics: the matrix stored for `utt`, or the element-wise
/// sum across every utterance when `utt` is `None`.
pub fn load_global_stats(path: impl AsRef<Path>, utt: Option<&str>) -> Result<Array2<f32>> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let mut summed: Option<Array2<f32>> = None;

    while let Some(token) = read_token(&mut reader)? {
        let mat = read_matrix_body(&mut reader, path)?;
        match utt {
            Some(wanted) if token == wanted => return Ok(mat),
            Some(_) => {}
            None => {
                summed = Some(match summed {
                    Some(acc) => acc + mat,
                    None => mat,
                });
            }
        }
    }

    match (utt, summed) {
        (Some(wanted), _) => Err(FeatureError::UnknownUtterance {
            utt: wanted.to_string(),
        }
        .into()),
        (None, Some(stats)) => Ok(stats),
        (None, None) => Err(bad(path, "stats file holds no matrices")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_matrix(buf: &mut Vec<u8>, rows: i32, cols: i32, values: &[f32]) {
        buf.extend_from_slice(b"\0B");
        buf.extend_from_slice(b"FM ");
        buf.push(4);
        buf.extend_from_slice(&rows.to_le_bytes());
        buf.push(4);
        buf.extend_from_slice(&cols.to_le_bytes());
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    #[test]
    fn test_lda_matrix_is_transposed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lda.mat");
        let mut bytes = Vec::new();
        write_matrix(&mut bytes, 2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        File::create(&path).unwrap().write_all(&bytes).unwrap();

        let mat = load_lda_matrix(&path).unwrap();
        assert_eq!(mat.dim(), (3, 2));
        assert_eq!(mat[[0, 0]], 1.0);
        assert_eq!(mat[[0, 1]], 4.0);
        assert_eq!(mat[[2, 1]], 6.0);
    }

    #[test]
    fn test_global_stats_by_utterance_and_summed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmvn.ark");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"utt1 ");
        write_matrix(&mut bytes, 2, 3, &[1.0, 1.0, 10.0, 2.0, 2.0, 0.0]);
        bytes.extend_from_slice(b"utt2 ");
        write_matrix(&mut bytes, 2, 3, &[3.0, 3.0, 20.0, 4.0, 4.0, 0.0]);
        File::create(&path).unwrap().write_all(&bytes).unwrap();

        let one = load_global_stats(&path, Some("utt2")).unwrap();
        assert_eq!(one[[0, 2]], 20.0);

        let all = load_global_stats(&path, None).unwrap();
        assert_eq!(all[[0, 0]], 4.0);
        assert_eq!(all[[0, 2]], 30.0);

        assert!(load_global_stats(&path, Some("missing")).is_err());
    }

    #[test]
    fn test_double_matrices_are_narrowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lda64.mat");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\0B");
        bytes.extend_from_slice(b"DM ");
        bytes.push(4);
        bytes.extend_from_slice(&2i32.to_le_bytes());
        bytes.push(4);
        bytes.extend_from_slice(&2i32.to_le_bytes());
        for v in [1.5f64, 2.5, 3.5, 4.5] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        File::create(&path).unwrap().write_all(&bytes).unwrap();

        let mat = load_lda_matrix(&path).unwrap();
        assert_eq!(mat[[1, 0]], 2.5);
    }
}
