//! Skip-run-length encoding of per-message metadata.
//!
//! A batch carries one [`MetaColumn`] per metadata key. Walking the
//! messages in order, each value is assigned to the next message index;
//! before a value is placed, a skip run starting at the current index (if
//! any) advances the index past messages that have no value for the key.
//!
//! ```text
//! rows:   0:{k=a}  1:{}  2:{}  3:{k=b}
//! column: key=k value=[a, b] skip_start=[1] skip_length=[2]
//! ```
//!
//! Trailing messages without a value need no run: decoding simply stops
//! when the values are exhausted.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::error::DecodeError;
use crate::wire::MetaColumn;

/// Decode metadata columns for a batch of `count` messages.
///
/// Returns one map per message index; a key missing from a map means
/// "absent" for that message. Any reference past `count` is an error.
pub fn decode_meta(
    columns: &[MetaColumn],
    count: usize,
) -> Result<Vec<BTreeMap<String, String>>, DecodeError> {
    let mut rows = vec![BTreeMap::new(); count];

    for column in columns {
        if column.skip_start.len() != column.skip_length.len() {
            return Err(DecodeError::MismatchedSkipArrays {
                starts: column.skip_start.len(),
                lengths: column.skip_length.len(),
            });
        }

        let mut index = 0usize;
        let mut skip = 0usize;
        for value in &column.value {
            if skip < column.skip_start.len() && index == column.skip_start[skip] as usize {
                index += column.skip_length[skip] as usize;
                skip += 1;
            }
            if index >= count {
                return Err(DecodeError::IndexOutOfRange { index, count });
            }
            rows[index].insert(column.key.clone(), value.clone());
            index += 1;
        }
    }

    Ok(rows)
}

/// Encode per-message metadata into columns, one per distinct key.
///
/// Runs of absent values are merged into a single skip run; a run at the
/// tail of the batch is omitted.
pub fn encode_meta(rows: &[BTreeMap<String, String>]) -> Vec<MetaColumn> {
    let keys: BTreeSet<&String> = rows.iter().flat_map(|row| row.keys()).collect();

    keys.into_iter()
        .map(|key| {
            let mut column = MetaColumn {
                key: key.clone(),
                ..MetaColumn::default()
            };
            let mut run_start: Option<usize> = None;
            for (index, row) in rows.iter().enumerate() {
                match row.get(key) {
                    Some(value) => {
                        if let Some(start) = run_start.take() {
                            column.skip_start.push(start as u32);
                            column.skip_length.push((index - start) as u32);
                        }
                        column.value.push(value.clone());
                    }
                    None => {
                        run_start.get_or_insert(index);
                    }
                }
            }
            column
        })
        .collect()
}
