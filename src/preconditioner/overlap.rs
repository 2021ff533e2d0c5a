use super::{BlockInverse, PreconditionerContext};
use crate::boundary_map::BoundaryMap;
use crate::comm::Communicator;
use crate::element::DofKind;
use crate::error::{SolverError, SolverResult};
use crate::operator::BoundaryOperator;
use crate::settings::OverlapPatches;
use hpsolve_traits::Real;
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// Solve dofs of every patch owned by this process, sorted.
///
/// Element and partition patches are built from the elements of this process (partition
/// entries are local element indices). Vertex patches cover the elements of all processes
/// around a vertex and are dealt out round-robin over the processes.
pub fn overlap_patches<T>(
    map: &BoundaryMap,
    patches: &OverlapPatches,
    comm: &dyn Communicator<T>,
) -> SolverResult<Vec<Vec<usize>>> {
    let element_dofs = |elements: &mut dyn Iterator<Item = usize>| -> Vec<usize> {
        let mut dofs = BTreeSet::new();
        for e in elements {
            dofs.extend(map.element_solve_dofs(e).map(|(_, g)| g));
        }
        dofs.into_iter().collect()
    };

    let result: Vec<Vec<usize>> = match patches {
        OverlapPatches::ByElement => (0..map.num_elements())
            .map(|e| element_dofs(&mut std::iter::once(e)))
            .collect(),
        OverlapPatches::ByVertex => vertex_patches(map, comm),
        OverlapPatches::Partition(parts) => {
            for part in parts {
                if let Some(&e) = part.iter().find(|&&e| e >= map.num_elements()) {
                    return Err(SolverError::dimension(
                        "overlap partition element index",
                        Some(e),
                        map.num_elements(),
                        e,
                    ));
                }
            }
            parts
                .iter()
                .map(|part| element_dofs(&mut part.iter().copied()))
                .collect()
        }
    };

    let non_empty: Vec<_> = result.into_iter().filter(|dofs| !dofs.is_empty()).collect();
    if non_empty.is_empty() && map.num_solve_dofs() > 0 && comm.size() == 1 {
        warn!("Overlap preconditioner has no non-empty patches");
    }
    Ok(non_empty)
}

fn vertex_patches<T>(map: &BoundaryMap, comm: &dyn Communicator<T>) -> Vec<Vec<usize>> {
    let n = map.num_solve_dofs();
    let vertices: Vec<usize> = (0..n)
        .filter(|&g| map.dof_group(g).kind == DofKind::Vertex)
        .collect();
    let mut row_of = vec![None; n];
    for (row, &g) in vertices.iter().enumerate() {
        row_of[g] = Some(row);
    }

    // coupling[row * n + h] != 0 iff dof h shares an element with the vertex on some process
    let mut coupling = vec![0; vertices.len() * n];
    for e in 0..map.num_elements() {
        let dofs: Vec<usize> = map.element_solve_dofs(e).map(|(_, g)| g).collect();
        for row in dofs.iter().filter_map(|&g| row_of[g]) {
            for &h in &dofs {
                coupling[row * n + h] = 1;
            }
        }
    }
    comm.reduce_max(&mut coupling);

    let (rank, size) = (comm.rank(), comm.size().max(1));
    (0..vertices.len())
        .filter(|row| row % size == rank)
        .map(|row| (0..n).filter(|&h| coupling[row * n + h] != 0).collect())
        .collect()
}

/// Additive Schwarz: `z = Σ_p R_pᵀ A_p⁻¹ R_p r` over possibly overlapping patches.
///
/// Patch matrices are restrictions of the global operator, obtained by probing its columns.
/// Each process applies the patches it owns and the corrections are summed over processes.
#[derive(Debug, Clone)]
pub struct OverlapPreconditioner<T: Real> {
    patches: Vec<BlockInverse<T>>,
}

impl<T: Real> OverlapPreconditioner<T> {
    pub fn build(context: &PreconditionerContext<T>) -> SolverResult<Self> {
        let map = context.map;
        let patches = overlap_patches(map, &context.overlap.patches, context.comm)?;
        let operator = BoundaryOperator::new(context.condensed, map, context.comm);

        // Every process applies the operator to the union of the columns any patch needs, in increasing order,
        // so the reductions inside `column` line up across processes
        let mut needed = vec![0; map.num_solve_dofs()];
        for &dof in patches.iter().flatten() {
            needed[dof] = 1;
        }
        context.comm.reduce_max(&mut needed);
        let columns: FxHashMap<usize, DVector<T>> = needed
            .iter()
            .enumerate()
            .filter(|&(_, &used)| used != 0)
            .map(|(j, _)| (j, operator.column(j)))
            .collect();

        let matrices: Vec<_> = patches
            .into_iter()
            .map(|dofs| {
                let n = dofs.len();
                let mut matrix = DMatrix::zeros(n, n);
                for (j, &dof_j) in dofs.iter().enumerate() {
                    let column = &columns[&dof_j];
                    for (i, &dof_i) in dofs.iter().enumerate() {
                        matrix[(i, j)] = column[dof_i];
                    }
                }
                (dofs, matrix)
            })
            .collect();

        let pinned = context.pinned;
        let patches = matrices
            .into_par_iter()
            .enumerate()
            .map(|(index, (dofs, matrix))| BlockInverse::new(dofs, matrix, pinned, &format!("overlap patch {}", index)))
            .collect::<SolverResult<Vec<_>>>()?;

        info!(
            "Factored {} overlapping patches (largest {} dofs)",
            patches.len(),
            patches.iter().map(|p| p.dofs().len()).max().unwrap_or(0)
        );
        Ok(Self { patches })
    }

    pub fn num_patches(&self) -> usize {
        self.patches.len()
    }

    pub fn apply_into(&self, r: &[T], z: &mut [T], comm: &dyn Communicator<T>) {
        z.iter_mut().for_each(|z| *z = T::zero());
        for patch in &self.patches {
            patch.apply_add(r, z);
        }
        comm.reduce_sum(z);
    }
}
