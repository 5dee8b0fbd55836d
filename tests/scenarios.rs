//! End-to-end clustering scenarios driven through the engine and the
//! sweep controller.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use dclust::core::IdForwarder;
use dclust::history::Retain;
use dclust::sweep::{self, SweepConfig};
use dclust::{dataset, output, reassign, squared_cutoff, Engine, EventTable};

fn table_2d(points: &[(u16, u16)]) -> EventTable {
    let rows = points
        .iter()
        .enumerate()
        .map(|(i, &(x, y))| (i as u32, vec![x, y, 0, 0]))
        .collect();
    EventTable::from_rows(4, 0, rows).unwrap()
}

fn sweep_config(dir: &Path, first: f32, last: f32, step: f32, min_events: u32) -> SweepConfig {
    SweepConfig {
        first_cutoff: first,
        last_cutoff: last,
        step,
        pct_target: 200.0,
        min_events,
        continue_on_decrease: false,
        out_root: dir.join("run"),
    }
}

/// One engine pass plus canonicalization, no files involved.
fn one_pass(
    table: &Arc<EventTable>,
    workers: usize,
    block: usize,
    cutoff: f32,
    min_events: u32,
) -> (Vec<u32>, u32) {
    let mut engine = Engine::new(Arc::clone(table), workers, Some(block)).unwrap();
    let mut ids = vec![0u32; table.len()];
    let outcome = engine.run_pass(&mut ids, squared_cutoff(cutoff, table.cols()), 0).unwrap();
    let mut forwarder = IdForwarder::new(&outcome.local_counts).unwrap();
    forwarder.apply_merges(&outcome.merges, &mut ids).unwrap();
    forwarder.mark_eliminated(&outcome.merges);
    let retained = forwarder.trim_small(&ids, min_events);
    forwarder.assign_dense(&mut ids, retained).unwrap();
    (ids, retained)
}

fn cluster_sizes(ids: &[u32], retained: u32) -> Vec<usize> {
    (1..=retained)
        .map(|cluster| ids.iter().filter(|&&id| id == cluster).count())
        .collect()
}

#[test]
fn two_separated_clusters_are_both_retained() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(table_2d(&[
        (10, 10),
        (11, 10),
        (10, 11),
        (100, 100),
        (101, 100),
        (100, 101),
    ]));
    let mut engine = Engine::new(Arc::clone(&table), 2, Some(4)).unwrap();
    let cfg = sweep_config(dir.path(), 2.0, 2.0, 0.5, 2);
    let outcome = sweep::run(&mut engine, &table, &cfg).unwrap();

    assert_eq!(outcome.retained, 2);
    assert!(outcome.ids.iter().all(|&id| id != 0), "every event is assigned");
    assert_eq!(cluster_sizes(&outcome.ids, 2), vec![3, 3]);
}

#[test]
fn chain_of_events_merges_transitively() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(table_2d(&[(0, 0), (3, 0), (6, 0), (9, 0)]));
    // One-row blocks force the chain to be discovered across workers
    // and resolved through merge requests.
    let mut engine = Engine::new(Arc::clone(&table), 2, Some(1)).unwrap();
    let cfg = sweep_config(dir.path(), 3.01, 3.01, 0.5, 4);
    let outcome = sweep::run(&mut engine, &table, &cfg).unwrap();

    assert_eq!(outcome.retained, 1);
    assert_eq!(outcome.ids, vec![1, 1, 1, 1]);
}

#[test]
fn undersized_clusters_leave_everything_unassigned() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(table_2d(&[
        (10, 10),
        (11, 10),
        (10, 11),
        (100, 100),
        (101, 100),
        (100, 101),
    ]));
    let mut engine = Engine::new(Arc::clone(&table), 2, Some(4)).unwrap();
    let cfg = sweep_config(dir.path(), 2.0, 2.0, 0.5, 4);
    let outcome = sweep::run(&mut engine, &table, &cfg).unwrap();

    assert_eq!(outcome.retained, 0);
    assert!(outcome.ids.iter().all(|&id| id == 0));
}

#[test]
fn genealogy_prefers_children_over_their_union() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(table_2d(&[
        (10, 10),
        (11, 10),
        (10, 11),
        (20, 20),
        (21, 20),
        (20, 21),
    ]));
    let mut engine = Engine::new(Arc::clone(&table), 2, Some(3)).unwrap();
    // Two passes: at d=2 the groups are separate clusters; at d=10 the
    // gap (squared distance 200 against a cutoff of 400) folds them
    // into one.
    let cfg = sweep_config(dir.path(), 2.0, 10.0, 8.0, 2);
    let outcome = sweep::run(&mut engine, &table, &cfg).unwrap();

    assert_eq!(outcome.retained, 2);
    assert_eq!(cluster_sizes(&outcome.ids, 2), vec![3, 3]);

    let verdicts: Vec<Retain> =
        outcome.genealogy.entries().iter().map(|row| row.retain).collect();
    assert_eq!(verdicts, vec![Retain::Yes, Retain::Yes, Retain::No]);
}

#[test]
fn descending_sweep_stops_when_nothing_survives() {
    let dir = tempfile::tempdir().unwrap();
    // Four isolated events: no pair is within any tested cutoff.
    let table = Arc::new(table_2d(&[(0, 0), (500, 0), (1000, 0), (1500, 0)]));
    let mut engine = Engine::new(Arc::clone(&table), 1, Some(4)).unwrap();
    let cfg = sweep_config(dir.path(), 10.0, 1.0, 2.0, 2);
    let outcome = sweep::run(&mut engine, &table, &cfg).unwrap();

    assert_eq!(outcome.retained, 0);
    assert!(outcome.ids.iter().all(|&id| id == 0));
}

#[test]
fn sort_key_pruning_does_not_change_the_result() {
    // Two groups far apart on the sort key; small blocks make the
    // pruned grid skip every cross block pair.
    let points = [
        (10, 0),
        (11, 0),
        (12, 5),
        (13, 5),
        (1000, 0),
        (1001, 0),
        (1002, 5),
        (1003, 5),
    ];
    let table = Arc::new(table_2d(&points));
    let (pruned, pruned_retained) = one_pass(&table, 1, 2, 3.0, 2);
    let (whole, whole_retained) = one_pass(&table, 1, 8, 3.0, 2);
    assert_eq!(pruned_retained, whole_retained);
    assert_eq!(pruned, whole);
}

#[test]
fn pass_partition_matches_the_neighbor_graph() {
    // Three well-separated blobs of seeded random events; the engine's
    // partition must equal the connected components of the graph whose
    // edges are pairs within the cutoff.
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let centers = [(1000u16, 1000u16), (5000, 5000), (9000, 1000)];
    let mut rows = Vec::new();
    for &(cx, cy) in &centers {
        for _ in 0..40 {
            let x = cx + rng.gen_range(0..50);
            let y = cy + rng.gen_range(0..50);
            rows.push((rows.len() as u32, vec![x, y, 0, 0]));
        }
    }
    let table = Arc::new(EventTable::from_rows(4, 0, rows).unwrap());
    let cutoff = 60.0f32;
    let test_dist = squared_cutoff(cutoff, 4);

    let (ids, _) = one_pass(&table, 3, 16, cutoff, 1);

    // Brute-force components over the same threshold graph.
    let n = table.len();
    let mut root: Vec<usize> = (0..n).collect();
    fn find(root: &mut Vec<usize>, mut x: usize) -> usize {
        while root[x] != x {
            root[x] = root[root[x]];
            x = root[x];
        }
        x
    }
    let mut linked = vec![false; n];
    for i in 0..n {
        for j in i + 1..n {
            let d: u64 = table
                .row(i)
                .iter()
                .zip(table.row(j))
                .map(|(&a, &b)| {
                    let diff = i64::from(a) - i64::from(b);
                    (diff * diff) as u64
                })
                .sum();
            if d <= test_dist {
                linked[i] = true;
                linked[j] = true;
                let (ri, rj) = (find(&mut root, i), find(&mut root, j));
                root[ri] = rj;
            }
        }
    }

    for i in 0..n {
        assert_eq!(ids[i] != 0, linked[i], "event {i} assignment disagrees with the graph");
        for j in i + 1..n {
            if linked[i] && linked[j] {
                let same_graph = find(&mut root, i) == find(&mut root, j);
                let same_cluster = ids[i] == ids[j];
                assert_eq!(same_cluster, same_graph, "events {i} and {j} disagree");
            }
        }
    }
}

#[test]
fn lost_events_come_back_through_reassignment() {
    let dir = tempfile::tempdir().unwrap();
    // Two big groups and one small satellite near the first; the size
    // filter drops the satellite, reassignment pulls its events back.
    let table = Arc::new(table_2d(&[
        (10, 10),
        (11, 10),
        (10, 11),
        (30, 10),
        (31, 10),
        (100, 100),
        (101, 100),
        (100, 101),
    ]));
    let mut engine = Engine::new(Arc::clone(&table), 2, Some(4)).unwrap();
    let cfg = sweep_config(dir.path(), 2.0, 2.0, 0.5, 3);
    let mut outcome = sweep::run(&mut engine, &table, &cfg).unwrap();
    drop(engine);
    assert_eq!(outcome.retained, 2);
    assert_eq!(outcome.ids[3], 0);
    assert_eq!(outcome.ids[4], 0);

    let previous =
        output::read_sidecar(&cfg.out_root, outcome.last_written, table.len()).unwrap();
    let flagged = reassign::flag_lost_events(&mut outcome.ids, &previous);
    assert_eq!(flagged, 2);
    reassign::attach_unassigned(&table, &mut outcome.ids, outcome.retained, 3);
    // The satellite pair was clustered at the final pass, so both its
    // events re-attach to the nearest retained cluster.
    assert_eq!(outcome.ids[3], 1);
    assert_eq!(outcome.ids[4], 1);
}

/// Writes a minimal ingested input file the way the ingest tool lays it
/// out, so the reader can be exercised end to end.
fn write_selected(path: &Path, cols: usize, sort_key: u16, rows: &[(u32, Vec<u16>)]) {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"dclust input file v1.0        \n\0");
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(cols as u32).to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes());
    let mut header = vec![0u8; 2048];
    header[..7].copy_from_slice(b"a,b,c,d");
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&sort_key.to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 64]); // two 32-byte name strings
    for (name, values) in rows {
        bytes.extend_from_slice(&name.to_le_bytes());
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    std::fs::File::create(path).unwrap().write_all(&bytes).unwrap();
}

#[test]
fn selected_files_round_trip_through_the_reader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.selected");
    let rows = vec![
        (7u32, vec![10u16, 1, 2, 3]),
        (8, vec![20, 4, 5, 6]),
        (9, vec![30, 7, 8, 9]),
    ];
    write_selected(&path, 4, 0, &rows);

    let table = dataset::read_selected(&path).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.cols(), 4);
    assert_eq!(table.sort_key(), 0);
    assert_eq!(table.header(), "a,b,c,d");
    assert_eq!(table.name(1), 8);
    assert_eq!(table.row(2), &[30, 7, 8, 9]);
}

#[test]
fn split_outputs_carry_the_expected_layout() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("run");
    let table = table_2d(&[(10, 10), (11, 10), (500, 500)]);
    let ids = vec![1, 1, 0];
    let assigned = output::write_split(&table, &ids, 1, &root).unwrap();
    assert_eq!(assigned, 2);

    let assigned_bytes = std::fs::read(format!("{}.assigned", root.display())).unwrap();
    assert_eq!(&assigned_bytes[..32], b"dclust assigned file v1.0     \n\0");
    assert_eq!(u32::from_le_bytes(assigned_bytes[32..36].try_into().unwrap()), 1);
    assert_eq!(u32::from_le_bytes(assigned_bytes[36..40].try_into().unwrap()), 2);
    assert_eq!(u32::from_le_bytes(assigned_bytes[40..44].try_into().unwrap()), 4);
    assert_eq!(u32::from_le_bytes(assigned_bytes[44..48].try_into().unwrap()), 1);
    // Records start after the 2048-byte header text: name, 4 floats,
    // cluster id.
    let record = &assigned_bytes[48 + 2048..];
    assert_eq!(record.len(), 2 * (4 + 16 + 4));
    assert_eq!(f32::from_le_bytes(record[4..8].try_into().unwrap()), 10.0);
    assert_eq!(u32::from_le_bytes(record[20..24].try_into().unwrap()), 1);

    let unassigned_bytes = std::fs::read(format!("{}.unassigned", root.display())).unwrap();
    assert_eq!(&unassigned_bytes[..32], b"dclust unassigned file v1.0   \n\0");
    assert_eq!(u32::from_le_bytes(unassigned_bytes[36..40].try_into().unwrap()), 1);
    assert_eq!(unassigned_bytes.len(), 48 + 2048 + (4 + 16));
}

#[test]
fn leftover_files_feed_nearest_cluster_assignment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.leftover");

    // Leftover files use the unassigned layout with float values.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"dclust unassigned file v1.0   \n\0");
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&2u32.to_le_bytes());
    bytes.extend_from_slice(&4u32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 2048]);
    for (name, values) in [(50u32, [12.0f32, 0.0, 0.0, 0.0]), (51, [800.0, 0.0, 0.0, 0.0])] {
        bytes.extend_from_slice(&name.to_le_bytes());
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    std::fs::File::create(&path).unwrap().write_all(&bytes).unwrap();

    let (names, data) = dataset::read_leftover(&path, 4).unwrap().unwrap();
    assert_eq!(names, vec![50, 51]);

    let table = table_2d(&[(10, 0), (11, 0), (40, 0), (41, 0)]);
    let ids = vec![1, 1, 2, 2];
    let clusters = reassign::attach_leftover(&table, &ids, 2, &data, 100, 2);
    assert_eq!(clusters, vec![1, 0]);

    let out = dir.path().join("events.leftover.clusters");
    output::write_leftover_clusters(&out, &names, &clusters).unwrap();
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "50,1\n51,0\n");
}
