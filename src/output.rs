//! Per-pass sidecars and the final split binary outputs.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::constants::{
    ASSIGNED_MAGIC, ENDIAN_SENTINEL, MAGIC_SIZE, TEXT_HEADER_SIZE, UNASSIGNED_MAGIC,
};
use crate::dataset::EventTable;
use crate::error::{Error, Result};

/// `<root>-<cutoff>` with the cutoff printed to six decimals; cutoff
/// `0.0` names the in-progress sidecar of the running sweep.
pub fn sidecar_path(root: &Path, cutoff: f32) -> PathBuf {
    PathBuf::from(format!("{}-{:.6}", root.display(), cutoff))
}

/// Writes a per-pass id vector as raw little-endian words.
pub fn write_sidecar(root: &Path, cutoff: f32, ids: &[u32]) -> Result<()> {
    let path = sidecar_path(root, cutoff);
    let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
    let mut w = BufWriter::new(file);
    for &id in ids {
        w.write_all(&id.to_le_bytes()).map_err(|e| Error::io(&path, e))?;
    }
    w.flush().map_err(|e| Error::io(&path, e))
}

pub fn read_sidecar(root: &Path, cutoff: f32, rows: usize) -> Result<Vec<u32>> {
    let path = sidecar_path(root, cutoff);
    let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
    let mut r = BufReader::new(file);
    let mut ids = Vec::with_capacity(rows);
    let mut buf = [0u8; 4];
    for _ in 0..rows {
        r.read_exact(&mut buf).map_err(|e| Error::io(&path, e))?;
        ids.push(u32::from_le_bytes(buf));
    }
    Ok(ids)
}

/// Renames the in-progress sidecar to its real cutoff name. A missing
/// source is tolerated: the pass that merged pre-existing clusters has
/// already moved it.
pub fn rename_sidecar(root: &Path, from: f32, to: f32) {
    let old = sidecar_path(root, from);
    let new = sidecar_path(root, to);
    if old == new {
        return;
    }
    if let Err(e) = fs::rename(&old, &new) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("could not rename {} to {}: {e}", old.display(), new.display());
        }
    }
}

/// Splits the table into `<root>.assigned` and `<root>.unassigned`.
///
/// An event is assigned when its id lies in `1..=max_cluster`. Both
/// files reserve the row-count field and patch it once the records are
/// out. Returns the number of assigned events.
pub fn write_split(
    table: &EventTable,
    ids: &[u32],
    max_cluster: u32,
    root: &Path,
) -> Result<usize> {
    let assigned_path = PathBuf::from(format!("{}.assigned", root.display()));
    let unassigned_path = PathBuf::from(format!("{}.unassigned", root.display()));
    let with_cluster = format!("{},cluster", table.header());
    let mut af =
        open_split(&assigned_path, ASSIGNED_MAGIC, table.cols(), max_cluster, &with_cluster)?;
    let mut uf =
        open_split(&unassigned_path, UNASSIGNED_MAGIC, table.cols(), max_cluster, table.header())?;

    let mut assigned = 0usize;
    for i in 0..table.len() {
        let id = ids[i];
        if id > 0 && id <= max_cluster {
            write_record(&mut af, &assigned_path, table, i, Some(id))?;
            assigned += 1;
        } else {
            write_record(&mut uf, &unassigned_path, table, i, None)?;
        }
    }

    patch_row_count(af, &assigned_path, assigned as u32)?;
    patch_row_count(uf, &unassigned_path, (table.len() - assigned) as u32)?;
    info!(
        "wrote {assigned} assigned and {} unassigned events under {}",
        table.len() - assigned,
        root.display()
    );
    Ok(assigned)
}

fn open_split(
    path: &Path,
    magic: &[u8; MAGIC_SIZE],
    cols: usize,
    max_cluster: u32,
    header: &str,
) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut w = BufWriter::new(file);
    let prelude = |w: &mut BufWriter<File>| -> std::io::Result<()> {
        w.write_all(magic)?;
        w.write_all(&ENDIAN_SENTINEL.to_le_bytes())?;
        // Row count, patched once the records are written.
        w.write_all(&0u32.to_le_bytes())?;
        w.write_all(&(cols as u32).to_le_bytes())?;
        w.write_all(&max_cluster.to_le_bytes())?;
        let mut text = vec![0u8; TEXT_HEADER_SIZE];
        let bytes = header.as_bytes();
        let len = bytes.len().min(TEXT_HEADER_SIZE - 1);
        text[..len].copy_from_slice(&bytes[..len]);
        w.write_all(&text)
    };
    prelude(&mut w).map_err(|e| Error::io(path, e))?;
    Ok(w)
}

fn write_record(
    w: &mut BufWriter<File>,
    path: &Path,
    table: &EventTable,
    index: usize,
    cluster: Option<u32>,
) -> Result<()> {
    let mut out = || -> std::io::Result<()> {
        w.write_all(&table.name(index).to_le_bytes())?;
        for &value in table.row(index) {
            w.write_all(&f32::from(value).to_le_bytes())?;
        }
        if let Some(id) = cluster {
            w.write_all(&id.to_le_bytes())?;
        }
        Ok(())
    };
    out().map_err(|e| Error::io(path, e))
}

fn patch_row_count(mut w: BufWriter<File>, path: &Path, count: u32) -> Result<()> {
    w.flush().map_err(|e| Error::io(path, e))?;
    let mut file = w.into_inner().map_err(|e| Error::io(path, e.into_error()))?;
    file.seek(SeekFrom::Start((MAGIC_SIZE + 4) as u64)).map_err(|e| Error::io(path, e))?;
    file.write_all(&count.to_le_bytes()).map_err(|e| Error::io(path, e))
}

/// The leftover sidecar written at ingest, next to the input file.
pub fn leftover_path(input: &Path) -> PathBuf {
    PathBuf::from(input.display().to_string().replacen("selected", "leftover", 1))
}

/// Where the leftover cluster assignments go.
pub fn leftover_clusters_path(input: &Path) -> PathBuf {
    PathBuf::from(input.display().to_string().replacen("selected", "leftover.clusters", 1))
}

/// `name_index,cluster_id` rows, no header, zero meaning ambiguous or
/// out of range.
pub fn write_leftover_clusters(path: &Path, names: &[u32], clusters: &[u32]) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut w = BufWriter::new(file);
    for (name, cluster) in names.iter().zip(clusters) {
        writeln!(w, "{name},{cluster}").map_err(|e| Error::io(path, e))?;
    }
    w.flush().map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_round_trips_bitwise() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("run");
        let ids = vec![0u32, 1, 7, 4_000_001, u32::MAX];
        write_sidecar(&root, 2.5, &ids).unwrap();
        let back = read_sidecar(&root, 2.5, ids.len()).unwrap();
        assert_eq!(back, ids);

        let raw = fs::read(sidecar_path(&root, 2.5)).unwrap();
        let expected: Vec<u8> = ids.iter().flat_map(|id| id.to_le_bytes()).collect();
        assert_eq!(raw, expected);
    }

    #[test]
    fn in_progress_sidecar_is_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("run");
        write_sidecar(&root, 0.0, &[1, 2, 3]).unwrap();
        rename_sidecar(&root, 0.0, 3.5);
        assert!(!sidecar_path(&root, 0.0).exists());
        assert!(sidecar_path(&root, 3.5).exists());
        // Renaming again must not clobber anything.
        rename_sidecar(&root, 0.0, 4.0);
        assert!(sidecar_path(&root, 3.5).exists());
    }

    #[test]
    fn leftover_paths_swap_the_selected_suffix() {
        let input = Path::new("/data/run1.selected");
        assert_eq!(leftover_path(input), Path::new("/data/run1.leftover"));
        assert_eq!(leftover_clusters_path(input), Path::new("/data/run1.leftover.clusters"));
    }
}
