//! Chunked execution of a job's work
//!
//! A task hands out its work in offset-bounded chunks. The runner processes
//! every unit of a chunk, reports progress, lets the task close the chunk
//! (write its artifact, drop caches) and asks for the next one until a chunk
//! comes back empty.

use crate::error::Result;
use crate::gauge::MemoryGauge;
use crate::jobs::Progress;
use tracing::{debug, info};

/// Work that can be split into chunks of units
pub trait ChunkedTask {
    type Item;

    /// Units known so far. Sources that only learn their size while being
    /// read may report a growing number.
    fn total(&self) -> Result<u64>;

    /// Units of chunk `index`; an empty chunk ends the run
    fn next_chunk(&mut self, index: usize, size: usize) -> Result<Vec<Self::Item>>;

    fn process(&mut self, item: Self::Item) -> Result<()>;

    /// Called after every unit of chunk `index` has been processed
    fn finish_chunk(&mut self, _index: usize) -> Result<()> {
        Ok(())
    }

    /// Drop per-chunk caches
    fn release(&mut self) {}

    /// Called once after the last chunk, with the number of chunks run
    fn finish(&mut self, _chunks: usize) -> Result<()> {
        Ok(())
    }
}

/// Receives progress snapshots while a job runs
pub trait ProgressSink {
    fn report(&mut self, progress: &Progress) -> Result<()>;
}

/// Sink that discards progress
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _progress: &Progress) -> Result<()> {
        Ok(())
    }
}

pub struct ChunkRunner<'a> {
    chunk_size: usize,
    progress_interval: u64,
    gauge: &'a dyn MemoryGauge,
}

impl<'a> ChunkRunner<'a> {
    pub fn new(chunk_size: usize, progress_interval: u64, gauge: &'a dyn MemoryGauge) -> Self {
        ChunkRunner {
            chunk_size: chunk_size.max(1),
            progress_interval: progress_interval.max(1),
            gauge,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Run `task` to completion
    ///
    /// `progress` is updated in place so a failed run still shows how far
    /// it got.
    pub fn run<T: ChunkedTask + ?Sized>(
        &self,
        task: &mut T,
        progress: &mut Progress,
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        progress.total = task.total()?;
        sink.report(progress)?;

        let mut index = 0;
        loop {
            let chunk = task.next_chunk(index, self.chunk_size)?;
            if chunk.is_empty() {
                break;
            }
            progress.total = progress.total.max(task.total()?);
            info!(chunk = index, units = chunk.len(), "processing chunk");

            let mut unreported = 0;
            for item in chunk {
                task.process(item)?;
                progress.completed += 1;
                progress.peak_memory = progress.peak_memory.max(self.gauge.peak_bytes());
                unreported += 1;
                if unreported >= self.progress_interval {
                    sink.report(progress)?;
                    unreported = 0;
                }
            }

            task.finish_chunk(index)?;
            task.release();
            if unreported > 0 {
                sink.report(progress)?;
            }
            debug!(chunk = index, completed = progress.completed, "chunk finished");
            index += 1;
        }

        task.finish(index)?;
        progress.total = progress.total.max(progress.completed);
        sink.report(progress)
    }
}

/// Number of root units per chunk
pub fn chunk_size(memory_budget_bytes: u64, record_cost_bytes: u64, depth: usize) -> usize {
    let records = memory_budget_bytes / record_cost_bytes.max(1) / (1 + depth as u64);
    usize::try_from(records).unwrap_or(usize::MAX).max(1)
}
