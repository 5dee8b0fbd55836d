//! Readers for the little-endian binary files produced at ingest time.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use log::info;

use crate::constants::{
    ENDIAN_SENTINEL, INPUT_MAGIC, MAGIC_SIZE, MAX_COLUMNS, MAX_EVENTS, NAME_SIZE,
    TEXT_HEADER_SIZE, UNASSIGNED_MAGIC,
};
use crate::error::{Error, Result};

use super::EventTable;

/// Reads an ingested input file into an [`EventTable`].
///
/// The prelude is: 32-byte magic, endian sentinel, row count, column
/// count, subsampling factor, 2048-byte column-header text, sort-key
/// column, unique-name count, then the name strings (skipped here) and
/// the event records.
pub fn read_selected(path: &Path) -> Result<EventTable> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut r = BufReader::new(file);

    expect_magic(&mut r, path, INPUT_MAGIC, "dclust input file")?;
    expect_endian(&mut r, path)?;

    let rows = read_u32(&mut r, path)? as usize;
    let cols = read_u32(&mut r, path)? as usize;
    let load_every = read_u32(&mut r, path)?;
    if rows == 0 {
        return Err(Error::Config(format!("{}: no input data", path.display())));
    }
    if rows > MAX_EVENTS {
        return Err(Error::TooManyRows { got: rows, max: MAX_EVENTS });
    }
    if cols == 0 || cols > MAX_COLUMNS {
        return Err(Error::TooManyColumns { got: cols, max: MAX_COLUMNS });
    }

    let header = read_header_text(&mut r, path)?;
    let sort_key = read_u16(&mut r, path)? as usize;
    if sort_key >= cols {
        return Err(Error::Config(format!(
            "sort key {sort_key} is outside the {cols} data columns"
        )));
    }
    let name_count = read_u16(&mut r, path)? as u64;
    skip(&mut r, path, name_count * NAME_SIZE as u64)?;

    let mut names = Vec::with_capacity(rows);
    let mut data = Vec::with_capacity(rows * cols);
    let mut record = vec![0u8; 4 + 2 * cols];
    for _ in 0..rows {
        r.read_exact(&mut record).map_err(|e| Error::io(path, e))?;
        names.push(u32::from_le_bytes([record[0], record[1], record[2], record[3]]));
        for col in 0..cols {
            let at = 4 + 2 * col;
            data.push(u16::from_le_bytes([record[at], record[at + 1]]));
        }
    }

    info!("loaded {rows} rows of {cols} columns from {}", path.display());
    Ok(EventTable::from_sorted_parts(cols, sort_key, data, names, header, load_every))
}

/// Reads a leftover sidecar (unassigned-file format, float values).
///
/// Returns `Ok(None)` when the file does not exist; leftover handling is
/// optional and a missing sidecar is only worth a log line.
pub fn read_leftover(path: &Path, cols: usize) -> Result<Option<(Vec<u32>, Vec<u16>)>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(path, e)),
    };
    let mut r = BufReader::new(file);

    expect_magic(&mut r, path, UNASSIGNED_MAGIC, "dclust unassigned file")?;
    expect_endian(&mut r, path)?;

    let rows = read_u32(&mut r, path)? as usize;
    let got = read_u32(&mut r, path)? as usize;
    if got != cols {
        return Err(Error::ColumnMismatch { got, expected: cols });
    }
    // Max-cluster-id slot, unused here.
    let _ = read_u32(&mut r, path)?;
    skip(&mut r, path, TEXT_HEADER_SIZE as u64)?;

    let mut names = Vec::with_capacity(rows);
    let mut data = Vec::with_capacity(rows * cols);
    let mut record = vec![0u8; 4 + 4 * cols];
    for _ in 0..rows {
        r.read_exact(&mut record).map_err(|e| Error::io(path, e))?;
        names.push(u32::from_le_bytes([record[0], record[1], record[2], record[3]]));
        for col in 0..cols {
            let at = 4 + 4 * col;
            let value =
                f32::from_le_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]]);
            data.push(value as u16);
        }
    }

    info!("loaded {rows} leftover events from {}", path.display());
    Ok(Some((names, data)))
}

fn expect_magic(
    r: &mut impl Read,
    path: &Path,
    magic: &[u8; MAGIC_SIZE],
    expected: &'static str,
) -> Result<()> {
    let mut got = [0u8; MAGIC_SIZE];
    r.read_exact(&mut got).map_err(|e| Error::io(path, e))?;
    if &got != magic {
        return Err(Error::BadMagic { path: path.to_owned(), expected });
    }
    Ok(())
}

fn expect_endian(r: &mut impl Read, path: &Path) -> Result<()> {
    if read_u32(r, path)? != ENDIAN_SENTINEL {
        return Err(Error::BadEndian { path: path.to_owned() });
    }
    Ok(())
}

fn read_header_text(r: &mut impl Read, path: &Path) -> Result<String> {
    let mut raw = [0u8; TEXT_HEADER_SIZE];
    r.read_exact(&mut raw).map_err(|e| Error::io(path, e))?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(TEXT_HEADER_SIZE);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

fn read_u16(r: &mut impl Read, path: &Path) -> Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b).map_err(|e| Error::io(path, e))?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32(r: &mut impl Read, path: &Path) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b).map_err(|e| Error::io(path, e))?;
    Ok(u32::from_le_bytes(b))
}

fn skip(r: &mut impl Read, path: &Path, bytes: u64) -> Result<()> {
    let copied =
        io::copy(&mut r.by_ref().take(bytes), &mut io::sink()).map_err(|e| Error::io(path, e))?;
    if copied != bytes {
        return Err(Error::io(path, io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(())
}
