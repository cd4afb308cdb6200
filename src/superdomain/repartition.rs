//! Moving distributed data between two partitionings.

use crate::comm::Communicator;
use crate::error::{IoError, Result};
use crate::slab::{self, Region};

/// Redistribute an array from one partitioning to another.
///
/// Every rank holds `src_bytes`, the contents of `src`, and receives the
/// contents of `dst`. Both partitionings must tile `global` exactly once.
/// Collective over `comm`.
pub fn repartition(
    comm: &dyn Communicator,
    elem: usize,
    global: &[usize],
    src: &Region,
    src_bytes: &[u8],
    dst: &Region,
) -> Result<Vec<u8>> {
    let mut message = Vec::new();
    src.encode(&mut message);
    dst.encode(&mut message);
    let layouts = comm
        .all_gather(&message)?
        .iter()
        .map(|bytes| decode_pair(bytes))
        .collect::<Result<Vec<_>>>()?;

    check_layouts(global, &layouts)?;
    if src_bytes.len() != src.len() * elem {
        return Err(IoError::InvalidShape(format!(
            "rank {} holds {} bytes for a {:?} slab",
            comm.rank(),
            src_bytes.len(),
            src.count
        )));
    }

    let outgoing = layouts
        .iter()
        .map(|(_, their_dst)| match src.intersect(their_dst) {
            Some(overlap) => slab::extract(src_bytes, &src.count, &overlap.relative_to(src), elem),
            None => Ok(Vec::new()),
        })
        .collect::<Result<Vec<_>>>()?;

    let incoming = comm.all_to_all(outgoing)?;

    let mut out = vec![0u8; dst.len() * elem];
    for ((their_src, _), bytes) in layouts.iter().zip(&incoming) {
        if let Some(overlap) = their_src.intersect(dst) {
            slab::place(&mut out, &dst.count, &overlap.relative_to(dst), bytes, elem)?;
        }
    }
    Ok(out)
}

fn decode_pair(bytes: &[u8]) -> Result<(Region, Region)> {
    let (src, rest) = Region::decode_prefix(bytes)?;
    Ok((src, Region::decode(rest)?))
}

/// Both partitionings must lie inside `global` and cover it by volume.
fn check_layouts(global: &[usize], layouts: &[(Region, Region)]) -> Result<()> {
    let volume: usize = global.iter().product();
    let mut src_total = 0;
    let mut dst_total = 0;
    for (rank, (src, dst)) in layouts.iter().enumerate() {
        for (side, region) in [("source", src), ("target", dst)] {
            if !region.fits(global) {
                return Err(IoError::InvalidShape(format!(
                    "{side} slab {:?} at {:?} of rank {rank} does not fit {global:?}",
                    region.count, region.start
                )));
            }
        }
        if !src.is_empty() {
            src_total += src.len();
        }
        if !dst.is_empty() {
            dst_total += dst.len();
        }
    }
    if src_total != volume || dst_total != volume {
        return Err(IoError::InvalidShape(format!(
            "partitions cover {src_total} and {dst_total} of {volume} elements in {global:?}"
        )));
    }
    Ok(())
}
