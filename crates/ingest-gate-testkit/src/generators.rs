//! Proptest generators for property-based testing.

use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;

use ingest_gate_core::{encode_meta, DataBatch, Request};

/// Generate a metadata value.
pub fn meta_value() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ._-]{0,12}".prop_map(String::from)
}

/// Generate per-message metadata for `count` messages. Keys are drawn from
/// a small set so columns are shared and sparse.
pub fn meta_rows(count: usize) -> impl Strategy<Value = Vec<BTreeMap<String, String>>> {
    prop::collection::vec(
        prop::collection::btree_map(
            prop::sample::select(vec!["host", "file", "level"]),
            meta_value(),
            0..=3,
        )
        .prop_map(|row| row.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
        count,
    )
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..=max_len).prop_map(Bytes::from)
}

/// Generate sizes of consecutive batches summing to `total`.
pub fn batch_sizes(total: usize) -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..=8, 1..=total.max(1)).prop_map(move |sizes| {
        let mut remaining = total;
        let mut out = Vec::new();
        for size in sizes {
            if remaining == 0 {
                break;
            }
            let take = size.min(remaining);
            out.push(take);
            remaining -= take;
        }
        if remaining > 0 {
            out.push(remaining);
        }
        out
    })
}

/// Parameters for generating one client stream's batches.
#[derive(Debug, Clone)]
pub struct StreamParams {
    /// Strictly increasing sequence numbers across all batches.
    pub seq_nos: Vec<u64>,
    /// How many consecutive sequence numbers go into each batch.
    pub batch_sizes: Vec<usize>,
    pub payloads: Vec<Bytes>,
    pub meta: Vec<BTreeMap<String, String>>,
}

impl Arbitrary for StreamParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (1usize..=40)
            .prop_flat_map(|count| {
                (
                    prop::collection::vec(1u64..=1000, count),
                    batch_sizes(count),
                    prop::collection::vec(payload(32), count),
                    meta_rows(count),
                )
            })
            .prop_map(|(gaps, batch_sizes, payloads, meta)| {
                let seq_nos = gaps
                    .into_iter()
                    .scan(0u64, |last, gap| {
                        *last += gap;
                        Some(*last)
                    })
                    .collect();
                StreamParams {
                    seq_nos,
                    batch_sizes,
                    payloads,
                    meta,
                }
            })
            .boxed()
    }
}

impl StreamParams {
    /// The `DataBatch` requests, in send order.
    pub fn requests(&self) -> Vec<Request> {
        let mut requests = Vec::with_capacity(self.batch_sizes.len());
        let mut start = 0;
        for &size in &self.batch_sizes {
            let end = start + size;
            requests.push(Request::DataBatch(DataBatch {
                seq_no: self.seq_nos[start..end].to_vec(),
                timestamp: self.seq_nos[start..end].iter().map(|s| s * 1000).collect(),
                payload: self.payloads[start..end].to_vec(),
                meta: encode_meta(&self.meta[start..end]),
            }));
            start = end;
        }
        requests
    }

    /// Sequence number that closes each batch, i.e. the acks to expect
    /// when every batch is acknowledged separately.
    pub fn batch_ends(&self) -> Vec<u64> {
        let mut ends = Vec::with_capacity(self.batch_sizes.len());
        let mut end = 0;
        for &size in &self.batch_sizes {
            end += size;
            ends.push(self.seq_nos[end - 1]);
        }
        ends
    }
}
