use crate::shard::Shard;

/// Membership-filter cap most storage backends impose on one query.
pub const DEFAULT_MAX_QUERY_SIZE: u32 = 10;

/// Fleet size at which the identifier space stops growing.
///
/// Past this many workers the space stays at `PINNED_NODE_COUNT * max_query_size`
/// slots and every returned shard carries `node_count = PINNED_NODE_COUNT`;
/// extra workers split the existing slots instead of adding new ones.
pub const PINNED_NODE_COUNT: u32 = 11;

/// Shards worker `worker_index` listens to in a fleet of `fleet_size`.
///
/// | fleet size | result                                                       |
/// |------------|--------------------------------------------------------------|
/// | 0 or 1     | `None`: listen to every job                                  |
/// | 2 ..= 11   | ids `[i*m, (i+1)*m)` tagged with `node_count = fleet_size`   |
/// | > 11       | row `i` of the slot matrix, tagged with `node_count = 11`    |
///
/// Never returns more than `max_query_size` shards. A worker index outside the
/// fleet gets an empty assignment.
pub fn assigned_shards(worker_index: u32, fleet_size: u32, max_query_size: u32) -> Option<Vec<Shard>> {
    if fleet_size <= 1 {
        return None;
    }
    if worker_index >= fleet_size {
        return Some(Vec::new());
    }

    if fleet_size <= PINNED_NODE_COUNT {
        let start = worker_index * max_query_size;
        let shards = (start..start + max_query_size)
            .map(|id| Shard::new(id, fleet_size))
            .collect();
        return Some(shards);
    }

    let matrix = slot_matrix(fleet_size, max_query_size);
    let row = matrix
        .get(worker_index as usize)
        .map(|ids| {
            ids.iter()
                .map(|&id| Shard::new(id, PINNED_NODE_COUNT))
                .collect()
        })
        .unwrap_or_default();
    Some(row)
}

/// Slot ownership table for a fleet larger than [`PINNED_NODE_COUNT`].
///
/// Starts from 11 rows of `m` consecutive ids, then for every worker count
/// `i` in `12..=fleet_size` builds one more row by stealing
/// `floor(11 * m / i)` ids: pop the last id of row `k`, move the cursor to
/// `(k - 1) mod (i - 1)`, repeat. The cursor starts at row 10 and carries over
/// from one added row to the next. Each new row is sorted ascending.
fn slot_matrix(fleet_size: u32, m: u32) -> Vec<Vec<u32>> {
    let base_rows = PINNED_NODE_COUNT as usize;
    let mut matrix: Vec<Vec<u32>> = (0..PINNED_NODE_COUNT)
        .map(|y| (0..m).map(|x| x + y * m).collect())
        .collect();

    let total = PINNED_NODE_COUNT * m;
    let mut k = base_rows - 1;

    for i in (PINNED_NODE_COUNT + 1)..=fleet_size {
        let rows = (i - 1) as usize;
        let steal = total / i;
        let mut row = Vec::with_capacity(steal as usize);

        for _ in 0..steal {
            // skip rows that have already been emptied; give up if all are
            let mut probes = 0;
            while matrix[k].is_empty() && probes < rows {
                k = (k + rows - 1) % rows;
                probes += 1;
            }
            let Some(id) = matrix[k].pop() else {
                break;
            };
            row.push(id);
            k = (k + rows - 1) % rows;
        }

        row.sort_unstable();
        matrix.push(row);
    }
    matrix
}
