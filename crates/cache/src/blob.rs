//! On-disk mesh blob.
//!
//! Written by the disk cache level into its temporary directory and read back
//! on load; [`crate::FileMeshLoader`] reads the same format. Not an
//! interchange format.
//!
//! Layout (little endian):
//! `b"OOCM"` | version: u32 | vertex bytes: u64 | index bytes: u64 | vertices | indices

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::CacheError;
use crate::mesh::MeshData;

const MAGIC: &[u8; 4] = b"OOCM";
const VERSION: u32 = 1;

/// Size of the fixed header in bytes
pub const HEADER_LEN: usize = 4 + 4 + 8 + 8;

/// Size of the blob `data` encodes to
pub fn encoded_len(data: &MeshData) -> usize {
    HEADER_LEN + data.byte_size()
}

/// Write `data` to `path`, returning the number of bytes written
pub fn write_blob(path: &Path, data: &MeshData) -> io::Result<u64> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&(data.vertices.len() as u64).to_le_bytes())?;
    writer.write_all(&(data.indices.len() as u64).to_le_bytes())?;
    writer.write_all(&data.vertices)?;
    writer.write_all(&data.indices)?;

    let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.sync_all()?;

    Ok(encoded_len(data) as u64)
}

/// Vertex and index byte lengths recorded in the header
pub fn read_header(path: &Path) -> Result<(usize, usize), CacheError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    parse_header(path, &mut BufReader::new(file), file_len)
}

/// Read a complete blob
pub fn read_blob(path: &Path) -> Result<MeshData, CacheError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let (vertex_len, index_len) = parse_header(path, &mut reader, file_len)?;

    let mut vertices = vec![0u8; vertex_len];
    let mut indices = vec![0u8; index_len];
    reader
        .read_exact(&mut vertices)
        .and_then(|_| reader.read_exact(&mut indices))
        .map_err(|e| corrupt(path, format!("truncated payload: {e}")))?;

    Ok(MeshData { vertices, indices })
}

/// Parse and validate the header against the real file length.
///
/// Lengths are checked before anything is allocated for the payload.
fn parse_header(path: &Path, reader: &mut impl Read, file_len: u64) -> Result<(usize, usize), CacheError> {
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|e| corrupt(path, format!("truncated header: {e}")))?;

    if &header[0..4] != MAGIC {
        return Err(corrupt(path, "bad magic".to_string()));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != VERSION {
        return Err(corrupt(path, format!("unsupported version {version}")));
    }

    let mut len = [0u8; 8];
    len.copy_from_slice(&header[8..16]);
    let vertex_len = u64::from_le_bytes(len);
    len.copy_from_slice(&header[16..24]);
    let index_len = u64::from_le_bytes(len);

    let expected = (HEADER_LEN as u64)
        .checked_add(vertex_len)
        .and_then(|n| n.checked_add(index_len));
    if expected != Some(file_len) {
        return Err(corrupt(
            path,
            format!("header claims {vertex_len} + {index_len} payload bytes, file has {file_len} bytes"),
        ));
    }

    let vertex_len = usize::try_from(vertex_len).map_err(|_| corrupt(path, "vertex data too large".to_string()))?;
    let index_len = usize::try_from(index_len).map_err(|_| corrupt(path, "index data too large".to_string()))?;
    Ok((vertex_len, index_len))
}

fn corrupt(path: &Path, reason: String) -> CacheError {
    CacheError::CorruptBlob {
        path: path.to_path_buf(),
        reason,
    }
}
