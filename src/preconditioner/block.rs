use super::{BlockInverse, PreconditionerContext};
use crate::assembly::{extract_block, BoundaryAssembler};
use crate::boundary_map::BoundaryMap;
use crate::element::DofKind;
use crate::error::SolverResult;
use hpsolve_traits::Real;
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Groups solve dofs into one block of all vertex dofs plus one block per edge and face.
pub fn dof_blocks(map: &BoundaryMap) -> Vec<Vec<usize>> {
    let mut blocks: BTreeMap<(DofKind, usize), Vec<usize>> = BTreeMap::new();
    for g in 0..map.num_solve_dofs() {
        let group = map.dof_group(g);
        let key = match group.kind {
            DofKind::Vertex => (DofKind::Vertex, 0),
            kind => (kind, group.id),
        };
        blocks.entry(key).or_default().push(g);
    }
    blocks.into_values().collect()
}

/// Extracts the given diagonal blocks of an assembled matrix, merges them across processes and
/// factors them in parallel.
pub(crate) fn factor_blocks<T: Real>(
    matrix: &CsrMatrix<T>,
    blocks: Vec<Vec<usize>>,
    context: &PreconditionerContext<T>,
    name: &str,
) -> SolverResult<Vec<BlockInverse<T>>> {
    let dense_blocks: Vec<_> = blocks
        .into_iter()
        .map(|dofs| {
            let mut block = extract_block(matrix, &dofs);
            context.comm.reduce_sum(block.as_mut_slice());
            (dofs, block)
        })
        .collect();
    let pinned = context.pinned;
    dense_blocks
        .into_par_iter()
        .enumerate()
        .map(|(index, (dofs, block))| BlockInverse::new(dofs, block, pinned, &format!("{} block {}", name, index)))
        .collect()
}

/// Exact inverses of the vertex block and of every edge and face block of the assembled matrix.
#[derive(Debug, Clone)]
pub struct BlockPreconditioner<T: Real> {
    blocks: Vec<BlockInverse<T>>,
}

impl<T: Real> BlockPreconditioner<T> {
    pub fn build(context: &PreconditionerContext<T>) -> SolverResult<Self> {
        let matrix = BoundaryAssembler::default().assemble_csr(context.condensed, context.map)?;
        let blocks = factor_blocks(&matrix, dof_blocks(context.map), context, "block preconditioner")?;
        Ok(Self { blocks })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn apply_into(&self, r: &[T], z: &mut [T]) {
        z.iter_mut().for_each(|z| *z = T::zero());
        for block in &self.blocks {
            block.apply_add(r, z);
        }
    }
}
