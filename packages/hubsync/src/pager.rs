//! Offset/limit chunking driver for paged flows.
//!
//! Chunks are fetched strictly in sequence so the server-side cursor stays
//! stable; the parallelism lives inside the chunk callback, which typically
//! fans items out through the throttler.

use color_eyre::Result;
use futures::Future;

/// The window of one paged request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageBounds {
    pub offset: u64,
    pub limit: u64,
}

/// What processing one chunk yielded.
#[derive(Debug)]
pub struct ChunkOutcome<T> {
    /// How many items the chunk held before processing. Paging stops once a
    /// chunk comes back smaller than the requested limit.
    pub size: usize,
    /// How many items this chunk removed from the server, shifting later
    /// pages leftward. Only consulted when `adjust_offset` is set.
    pub removed: usize,
    /// Items to accumulate into the flow result.
    pub produced: Vec<T>,
}

/// Drive `list` and `process` over consecutive pages, accumulating produced
/// items.
///
/// With `adjust_offset`, the offset advance is reduced by the number of items
/// each chunk removed; delete-all flows use this so deletions don't cause the
/// next page to skip over survivors.
pub async fn each_page<I, T, L, LFut, P, PFut>(
    mut bounds: PageBounds,
    adjust_offset: bool,
    mut list: L,
    mut process: P,
) -> Result<Vec<T>>
where
    L: FnMut(PageBounds) -> LFut,
    LFut: Future<Output = Result<Vec<I>>>,
    P: FnMut(Vec<I>) -> PFut,
    PFut: Future<Output = Result<ChunkOutcome<T>>>,
{
    let mut produced = Vec::new();
    loop {
        let chunk = list(bounds).await?;
        let outcome = process(chunk).await?;
        produced.extend(outcome.produced);

        if (outcome.size as u64) < bounds.limit {
            break;
        }
        let advance = bounds.limit.saturating_sub(if adjust_offset {
            outcome.removed as u64
        } else {
            0
        });
        bounds.offset += advance;
    }
    Ok(produced)
}
