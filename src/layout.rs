//! Reconciling per-rank buffer lists with the substrate's flat layout.
//!
//! Variable-count primitives take one contiguous region plus a table of
//! per-rank element counts. [`flatten`] decides whether a caller's list of
//! buffers already *is* such a region (they sit back to back, in rank order,
//! inside one allocation) and only allocates a staging buffer when it is not.

use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Result of reconciling a list of per-rank buffers.
#[derive(Debug, Clone)]
pub struct FlatLayout {
    /// Element count of each buffer, in list order.
    pub lengths: Vec<usize>,
    /// One-dimensional region of `lengths.iter().sum()` elements.
    pub flat: Buffer,
    /// True when `flat` aliases the callers' memory and no copy is needed.
    pub is_flat: bool,
}

impl FlatLayout {
    /// Total element count.
    pub fn total(&self) -> usize {
        self.lengths.iter().sum()
    }

    /// Per-rank sub-views of the flat region.
    pub fn slices(&self) -> Result<Vec<Buffer>> {
        self.flat.split_with_sizes(&self.lengths)
    }

    /// Copy `buffers` into the staging region. No-op for flat layouts.
    pub fn pack(&self, buffers: &[Buffer]) -> Result<()> {
        if self.is_flat {
            return Ok(());
        }
        for (slice, buf) in self.slices()?.iter().zip(buffers) {
            slice.copy_from(buf)?;
        }
        Ok(())
    }

    /// Copy the staging region back out into `buffers`. No-op for flat layouts.
    pub fn unpack(&self, buffers: &[Buffer]) -> Result<()> {
        if self.is_flat {
            return Ok(());
        }
        for (buf, slice) in buffers.iter().zip(self.slices()?) {
            buf.copy_from(&slice)?;
        }
        Ok(())
    }
}

/// Compute per-buffer lengths and a flat region for `buffers`.
///
/// The first non-empty buffer anchors the layout. A buffer is in place when it
/// shares the anchor's allocation and starts exactly where the previous ones
/// end. Leading empty buffers never anchor, so a list of empties is trivially
/// flat with a zero-length region.
pub fn flatten(buffers: &[Buffer]) -> Result<FlatLayout> {
    let first = buffers
        .first()
        .ok_or_else(|| Error::validation("cannot reconcile an empty buffer list"))?;

    let mut anchor = first;
    let mut lengths = Vec::with_capacity(buffers.len());
    let mut running = 0usize;
    let mut is_flat = true;

    for buf in buffers {
        let len = buf.numel();
        if anchor.numel() == 0 && len != 0 {
            anchor = buf;
        }
        lengths.push(len);

        if is_flat
            && len != 0
            && (!anchor.same_storage(buf)
                || !buf.is_contiguous()
                || buf.offset() != anchor.offset() + running)
        {
            is_flat = false;
        }
        running += len;
    }

    let flat = if is_flat {
        anchor.extent(running)?
    } else {
        Buffer::zeros(anchor.dtype(), &[running])
    };

    log::trace!(
        "flatten: {} buffers, {running} elements, flat={is_flat}",
        buffers.len()
    );

    Ok(FlatLayout {
        lengths,
        flat,
        is_flat,
    })
}

/// Per-rank element counts for one side of a split all-to-all.
///
/// An empty `split_sizes` divides dimension 0 evenly across the group;
/// otherwise it must hold one row count per rank summing to dimension 0.
/// Counts are rows times the number of elements per row.
pub fn split_counts(buffer: &Buffer, split_sizes: &[usize], group_size: usize) -> Result<Vec<usize>> {
    let rows = buffer.leading_dim()?;
    let numel = buffer.numel();

    if split_sizes.is_empty() {
        Error::check(rows % group_size == 0, || {
            format!("dimension 0 of size {rows} does not divide equally across group size {group_size}")
        })?;
        return Ok(vec![numel / group_size; group_size]);
    }

    Error::check(split_sizes.len() == group_size, || {
        format!(
            "number of splits ({}) not equal to group size ({group_size})",
            split_sizes.len()
        )
    })?;
    let sum: usize = split_sizes.iter().sum();
    Error::check(sum == rows, || {
        format!("split sizes sum to {sum}, dimension 0 is {rows}")
    })?;

    let row_len = if numel == 0 { 0 } else { numel / rows };
    Ok(split_sizes.iter().map(|&s| s * row_len).collect())
}
