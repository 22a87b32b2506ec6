/// Sparse binary delta codec for tile payloads.
///
/// A delta tile stores a patch against its base rather than a full plane.
/// The patch is a list of replace runs plus the target length, so applying
/// it is a single allocation and a handful of copies. Encoding walks base
/// and target once and merges nearby differing runs to keep op counts low.
///
/// Application is deterministic: the same base and patch always produce the
/// same bytes, which is what makes chained deltas and replay reproducible.
/// Chains apply oldest to newest, each output becoming the next base.
use crate::error::{TesseraError, TesseraResult};
use serde::{Deserialize, Serialize};

/// Differing runs closer than this many equal bytes are merged into one op.
const MERGE_GAP: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PatchOp {
    offset: u64,
    bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Patch {
    target_len: u64,
    ops: Vec<PatchOp>,
}

/// Encode `target` as a patch against `base`.
pub fn encode(base: &[u8], target: &[u8]) -> TesseraResult<Vec<u8>> {
    let common = base.len().min(target.len());
    let mut runs: Vec<(usize, usize)> = Vec::new();

    let mut i = 0;
    while i < common {
        if base[i] == target[i] {
            i += 1;
            continue;
        }
        let start = i;
        let mut end = i + 1;
        let mut gap = 0;
        while end < common && gap <= MERGE_GAP {
            if base[end] == target[end] {
                gap += 1;
            } else {
                gap = 0;
            }
            end += 1;
        }
        // Trim the trailing equal gap back off the run
        let run_end = end - gap;
        runs.push((start, run_end));
        i = end;
    }

    // Anything past the common prefix is one trailing run
    if target.len() > common {
        match runs.last_mut() {
            Some((_, end)) if common - *end <= MERGE_GAP => *end = target.len(),
            _ => runs.push((common, target.len())),
        }
    }

    let ops = runs
        .into_iter()
        .map(|(start, end)| PatchOp {
            offset: start as u64,
            bytes: target[start..end].to_vec(),
        })
        .collect();

    let patch = Patch {
        target_len: target.len() as u64,
        ops,
    };
    Ok(bincode::serialize(&patch)?)
}

/// Apply a patch to `base`, producing the target bytes.
pub fn apply(base: &[u8], patch_bytes: &[u8]) -> TesseraResult<Vec<u8>> {
    let patch: Patch = bincode::deserialize(patch_bytes)?;
    let target_len = patch.target_len as usize;

    let mut out = vec![0u8; target_len];
    let prefix = base.len().min(target_len);
    out[..prefix].copy_from_slice(&base[..prefix]);

    for op in &patch.ops {
        let start = op.offset as usize;
        let end = start
            .checked_add(op.bytes.len())
            .ok_or_else(|| TesseraError::Encoding("patch op offset overflow".to_string()))?;
        if end > target_len {
            return Err(TesseraError::Encoding(format!(
                "patch op [{start}, {end}) exceeds target length {target_len}"
            )));
        }
        out[start..end].copy_from_slice(&op.bytes);
    }

    Ok(out)
}

/// Apply a chain of patches oldest-first on top of a full base payload.
pub fn apply_chain(base: &[u8], patches: &[Vec<u8>]) -> TesseraResult<Vec<u8>> {
    let mut current = base.to_vec();
    for patch in patches {
        current = apply(&current, patch)?;
    }
    Ok(current)
}
