//! Bounded worker pool that embeds chunk batches and restores their order.

use std::collections::BTreeMap;
use std::ops::Range;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::embedder::Embedder;
use crate::metadata::ChunkRecord;

struct EmbeddingTask {
    id: usize,
    range: Range<usize>,
}

struct EmbeddingBatch {
    id: usize,
    vectors: Vec<Vec<f32>>,
}

type EmbeddingResult = Result<EmbeddingBatch>;

/// Embeds every chunk text; vector `i` always belongs to `chunks[i]`.
///
/// Batches follow the embedder's batch size and are spread over
/// `worker_threads` threads. The first failed batch aborts the whole run.
pub fn embed_chunks(
    embedder: &dyn Embedder,
    chunks: &[ChunkRecord],
    worker_threads: usize,
) -> Result<Vec<Vec<f32>>> {
    if chunks.is_empty() {
        return Ok(Vec::new());
    }
    let batch_size = embedder.batch_size().max(1);
    let worker_threads = worker_threads.max(1);
    let total_batches = chunks.len().div_ceil(batch_size);
    info!(
        chunks = chunks.len(),
        batches = total_batches,
        workers = worker_threads,
        model = embedder.model_id(),
        "embedding chunks"
    );

    thread::scope(|scope| {
        // Both channels live inside the scope so an early return disconnects
        // them and lets blocked workers exit before the scope joins.
        let (task_tx, task_rx) = bounded::<EmbeddingTask>(worker_threads * 2);
        let (result_tx, result_rx) = bounded::<EmbeddingResult>(worker_threads * 2);
        for worker_id in 0..worker_threads {
            let worker_rx = task_rx.clone();
            let worker_tx = result_tx.clone();
            scope.spawn(move || worker_loop(worker_id, worker_rx, worker_tx, embedder, chunks));
        }
        drop(task_rx);
        drop(result_tx);

        scope.spawn(move || {
            for id in 0..total_batches {
                let start = id * batch_size;
                let end = (start + batch_size).min(chunks.len());
                if task_tx.send(EmbeddingTask { id, range: start..end }).is_err() {
                    break;
                }
            }
        });

        collect_in_order(&result_rx, total_batches, chunks.len())
    })
}

fn collect_in_order(
    result_rx: &Receiver<EmbeddingResult>,
    total_batches: usize,
    total_chunks: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(total_chunks);
    let mut pending_results: BTreeMap<usize, Vec<Vec<f32>>> = BTreeMap::new();
    let mut next_result_id = 0usize;

    while next_result_id < total_batches {
        let result = match result_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    remaining = total_batches - next_result_id,
                    waiting_on = next_result_id,
                    "still waiting on embedding batches"
                );
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                anyhow::bail!("embedding worker channel closed unexpectedly")
            }
        };
        let batch = result?;
        pending_results.insert(batch.id, batch.vectors);
        while let Some(batch_vectors) = pending_results.remove(&next_result_id) {
            vectors.extend(batch_vectors);
            next_result_id += 1;
            info!(
                embedded = vectors.len(),
                total = total_chunks,
                "embedded batch {}/{}",
                next_result_id,
                total_batches
            );
        }
    }
    Ok(vectors)
}

fn worker_loop(
    worker_id: usize,
    receiver: Receiver<EmbeddingTask>,
    sender: Sender<EmbeddingResult>,
    embedder: &dyn Embedder,
    chunks: &[ChunkRecord],
) {
    for EmbeddingTask { id, range } in receiver.iter() {
        let count = range.len();
        debug!(worker_id, batch = id, chunks = count, "embedding batch");
        let inputs: Vec<&str> = chunks[range].iter().map(|chunk| chunk.text.as_str()).collect();
        let result = embedder
            .embed_batch(&inputs)
            .and_then(|vectors| {
                anyhow::ensure!(
                    vectors.len() == count,
                    "embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    count
                );
                Ok(EmbeddingBatch { id, vectors })
            })
            .map_err(|err| {
                anyhow!(
                    "worker {} failed batch {} ({} chunks): {:#}",
                    worker_id,
                    id,
                    count,
                    err
                )
            });
        let failed = result.is_err();
        if sender.send(result).is_err() || failed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Encodes the numeric suffix of each text; sleeps so batches finish out of order.
    struct IndexEmbedder {
        batch_size: usize,
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
    }

    impl IndexEmbedder {
        fn new(batch_size: usize) -> Self {
            Self {
                batch_size,
                calls: AtomicUsize::new(0),
                fail_on_call: None,
            }
        }
    }

    impl Embedder for IndexEmbedder {
        fn model_id(&self) -> &str {
            "index-embedder"
        }

        fn batch_size(&self) -> usize {
            self.batch_size
        }

        fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_call == Some(call) {
                anyhow::bail!("backend exploded");
            }
            let mut vectors = Vec::with_capacity(inputs.len());
            for input in inputs {
                let n: usize = input.trim_start_matches("chunk ").parse()?;
                thread::sleep(Duration::from_millis(((n * 7) % 5) as u64));
                vectors.push(vec![n as f32, 1.0]);
            }
            Ok(vectors)
        }
    }

    fn chunks(count: usize) -> Vec<ChunkRecord> {
        (0..count)
            .map(|i| ChunkRecord {
                title: "T".into(),
                text: format!("chunk {i}"),
            })
            .collect()
    }

    #[test]
    fn vectors_follow_chunk_order_for_any_thread_count() {
        let chunks = chunks(23);
        for threads in [1, 2, 3, 8] {
            let embedder = IndexEmbedder::new(4);
            let vectors = embed_chunks(&embedder, &chunks, threads).unwrap();
            assert_eq!(vectors.len(), chunks.len());
            for (i, vector) in vectors.iter().enumerate() {
                assert_eq!(vector[0], i as f32, "threads={threads}");
            }
        }
    }

    #[test]
    fn failed_batch_aborts() {
        let embedder = IndexEmbedder {
            fail_on_call: Some(2),
            ..IndexEmbedder::new(2)
        };
        let err = embed_chunks(&embedder, &chunks(20), 3).unwrap_err();
        assert!(format!("{err:#}").contains("backend exploded"), "{err:#}");
    }

    #[test]
    fn empty_input_makes_no_calls() {
        let embedder = IndexEmbedder::new(4);
        assert!(embed_chunks(&embedder, &[], 4).unwrap().is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }
}
