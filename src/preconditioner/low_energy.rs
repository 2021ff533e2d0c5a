use super::{dof_blocks, BlockInverse, PreconditionerContext};
use crate::boundary_map::BoundaryMap;
use crate::comm::Communicator;
use crate::element::DofKind;
use crate::error::{BasisState, SolverError, SolverResult};
use hpsolve_traits::Real;
use log::debug;
use nalgebra::{Cholesky, DMatrix, DVector};
use rayon::prelude::*;

/// A global boundary vector tagged with the basis it is expressed in.
#[derive(Debug, Clone, PartialEq)]
pub struct BasisVector<T: Real> {
    values: DVector<T>,
    state: BasisState,
}

impl<T: Real> BasisVector<T> {
    pub fn standard(values: DVector<T>) -> Self {
        Self {
            values,
            state: BasisState::Standard,
        }
    }

    pub fn state(&self) -> BasisState {
        self.state
    }

    pub fn values(&self) -> &DVector<T> {
        &self.values
    }

    pub fn into_values(self) -> DVector<T> {
        self.values
    }

    fn expect(&self, expected: BasisState) -> SolverResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SolverError::WrongBasis {
                expected,
                found: self.state,
            })
        }
    }
}

fn select<T: Real>(m: &DMatrix<T>, rows: &[usize], cols: &[usize]) -> DMatrix<T> {
    DMatrix::from_fn(rows.len(), cols.len(), |i, j| m[(rows[i], cols[j])])
}

/// Local change of basis `R` for one family, computed from its condensed matrix.
///
/// `R = R₂ R₁`, where `R₁` removes the coupling of vertex and edge modes to face modes and `R₂`
/// then removes the coupling of vertex modes to edge modes. `R Ā Rᵀ` is block diagonal with
/// respect to vertex, edge and face modes.
pub fn family_transform<T: Real>(schur: &DMatrix<T>, kinds: &[DofKind], family: usize) -> SolverResult<DMatrix<T>> {
    let nb = schur.nrows();
    let indices_of = |pred: &dyn Fn(DofKind) -> bool| -> Vec<usize> {
        kinds
            .iter()
            .enumerate()
            .filter(|&(_, &k)| pred(k))
            .map(|(i, _)| i)
            .collect()
    };
    let vertices = indices_of(&|k| k == DofKind::Vertex);
    let edges = indices_of(&|k| k == DofKind::Edge);
    let vertices_and_edges = indices_of(&|k| matches!(k, DofKind::Vertex | DofKind::Edge));
    let faces = indices_of(&|k| matches!(k, DofKind::Face | DofKind::Element));

    let factor = |block: DMatrix<T>, what: &str| {
        let dim = block.nrows();
        Cholesky::new(block).ok_or_else(|| SolverError::SingularBlock {
            context: format!("{} block of low-energy family {}", what, family),
            dim,
        })
    };

    let mut r1 = DMatrix::identity(nb, nb);
    if !faces.is_empty() && !vertices_and_edges.is_empty() {
        let a_ff = factor(select(schur, &faces, &faces), "face")?;
        let a_f_ve = select(schur, &faces, &vertices_and_edges);
        // X = Ā[VE,F] Ā_FF⁻¹ = (Ā_FF⁻¹ Ā[F,VE])ᵀ
        let x = a_ff.solve(&a_f_ve).transpose();
        for (a, &i) in vertices_and_edges.iter().enumerate() {
            for (b, &j) in faces.iter().enumerate() {
                r1[(i, j)] = -x[(a, b)];
            }
        }
    }
    let intermediate = &r1 * schur * r1.transpose();

    let mut r2 = DMatrix::identity(nb, nb);
    if !edges.is_empty() && !vertices.is_empty() {
        let a_ee = factor(select(&intermediate, &edges, &edges), "edge")?;
        let a_e_v = select(&intermediate, &edges, &vertices);
        let y = a_ee.solve(&a_e_v).transpose();
        for (a, &i) in vertices.iter().enumerate() {
            for (b, &j) in edges.iter().enumerate() {
                r2[(i, j)] = -y[(a, b)];
            }
        }
    }
    Ok(r2 * r1)
}

/// Global change to and from the low-energy basis.
///
/// The global transform applies the family transforms element by element, with each
/// contribution weighted by the inverse multiplicity of its dof.
#[derive(Debug, Clone)]
pub struct LowEnergyTransform<T: Real> {
    map: BoundaryMap,
    element_family: Vec<usize>,
    transforms: Vec<DMatrix<T>>,
    weights: DVector<T>,
}

impl<T: Real> LowEnergyTransform<T> {
    pub fn build(context: &PreconditionerContext<T>) -> SolverResult<Self> {
        let map = context.map;
        let condensed = context.condensed;
        let mut family_kinds: Vec<Option<Vec<DofKind>>> = vec![None; condensed.num_families()];
        for e in 0..map.num_elements() {
            let family = condensed.element_family(e);
            if family_kinds[family].is_none() {
                let kinds = map
                    .element_dofs(e)
                    .iter()
                    .map(|&g| map.dof_group(g).kind)
                    .collect();
                family_kinds[family] = Some(kinds);
            }
        }

        let transforms = family_kinds
            .into_par_iter()
            .enumerate()
            .map(|(family, kinds)| {
                let schur = condensed.family(family).schur();
                match kinds {
                    Some(kinds) => family_transform(schur, &kinds, family),
                    None => Ok(DMatrix::identity(schur.nrows(), schur.nrows())),
                }
            })
            .collect::<SolverResult<Vec<_>>>()?;

        let mut weights = DVector::from_fn(map.num_global_dofs(), |g, _| T::from_usize(map.multiplicity(g)).unwrap_or_else(T::one));
        context.comm.reduce_sum(weights.as_mut_slice());
        weights.apply(|w| *w = T::one() / *w);

        debug!("Built low-energy transforms for {} families", transforms.len());
        Ok(Self {
            map: map.clone(),
            element_family: (0..map.num_elements()).map(|e| condensed.element_family(e)).collect(),
            transforms,
            weights,
        })
    }

    pub fn family_transform(&self, family: usize) -> &DMatrix<T> {
        &self.transforms[family]
    }

    fn transform(&self, v: &DVector<T>, comm: &dyn Communicator<T>, transpose: bool) -> DVector<T> {
        let n = self.map.num_solve_dofs();
        let mut out = DVector::zeros(self.map.num_global_dofs());
        let mut local = DVector::zeros(0);
        for e in 0..self.map.num_elements() {
            let dofs = self.map.element_dofs(e);
            local.resize_vertically_mut(dofs.len(), T::zero());
            self.map.scatter_element(e, v.as_slice(), local.as_mut_slice());
            let r = &self.transforms[self.element_family[e]];
            let mut y = if transpose {
                r.tr_mul(&local)
            } else {
                for (value, &g) in local.iter_mut().zip(dofs) {
                    *value *= self.weights[g];
                }
                r * &local
            };
            if transpose {
                for (value, &g) in y.iter_mut().zip(dofs) {
                    *value *= self.weights[g];
                }
            }
            self.map.gather_element_into(e, y.as_slice(), out.as_mut_slice());
        }
        comm.reduce_sum(out.as_mut_slice());
        out.rows(0, n).into_owned()
    }

    /// Expresses a standard-basis residual in the low-energy basis.
    pub fn to_low_energy(&self, v: BasisVector<T>, comm: &dyn Communicator<T>) -> SolverResult<BasisVector<T>> {
        v.expect(BasisState::Standard)?;
        SolverError::check_dimension("low-energy transform", None, self.map.num_solve_dofs(), v.values.len())?;
        Ok(BasisVector {
            values: self.transform(&v.values, comm, false),
            state: BasisState::LowEnergy,
        })
    }

    /// Maps a low-energy correction back to the standard basis.
    pub fn from_low_energy(&self, v: BasisVector<T>, comm: &dyn Communicator<T>) -> SolverResult<BasisVector<T>> {
        v.expect(BasisState::LowEnergy)?;
        SolverError::check_dimension("low-energy transform", None, self.map.num_solve_dofs(), v.values.len())?;
        Ok(BasisVector {
            values: self.transform(&v.values, comm, true),
            state: BasisState::Standard,
        })
    }
}

/// `M⁻¹ = R_gᵀ B⁻¹ R_g`, with `B` the vertex, edge and face blocks of the transformed system.
#[derive(Debug, Clone)]
pub struct LowEnergyPreconditioner<T: Real> {
    transform: LowEnergyTransform<T>,
    blocks: Vec<BlockInverse<T>>,
}

impl<T: Real> LowEnergyPreconditioner<T> {
    pub fn build(context: &PreconditionerContext<T>) -> SolverResult<Self> {
        let transform = LowEnergyTransform::build(context)?;
        let map = context.map;
        let groups = dof_blocks(map);

        // Position of every solve dof within its block
        let mut position = vec![(usize::MAX, usize::MAX); map.num_solve_dofs()];
        for (b, dofs) in groups.iter().enumerate() {
            for (i, &g) in dofs.iter().enumerate() {
                position[g] = (b, i);
            }
        }
        let mut blocks: Vec<DMatrix<T>> = groups.iter().map(|d| DMatrix::zeros(d.len(), d.len())).collect();
        for e in 0..map.num_elements() {
            let (family, scale) = context.condensed.element(e);
            let r = transform.family_transform(context.condensed.element_family(e));
            let transformed = r * family.schur() * r.transpose() * scale;
            let signs = map.element_signs(e);
            let solve: Vec<_> = map.element_solve_dofs(e).collect();
            for &(li, gi) in &solve {
                for &(lj, gj) in &solve {
                    let (bi, pi) = position[gi];
                    let (bj, pj) = position[gj];
                    if bi == bj {
                        blocks[bi][(pi, pj)] += (signs[li] * signs[lj]).apply(transformed[(li, lj)]);
                    }
                }
            }
        }
        for block in &mut blocks {
            context.comm.reduce_sum(block.as_mut_slice());
        }
        let pinned = context.pinned;
        let blocks = groups
            .into_par_iter()
            .zip(blocks)
            .enumerate()
            .map(|(index, (dofs, block))| BlockInverse::new(dofs, block, pinned, &format!("low-energy block {}", index)))
            .collect::<SolverResult<Vec<_>>>()?;

        Ok(Self { transform, blocks })
    }

    pub fn transform(&self) -> &LowEnergyTransform<T> {
        &self.transform
    }

    /// Applies the block inverses to a vector in the low-energy basis.
    pub fn solve_blocks(&self, v: BasisVector<T>) -> SolverResult<BasisVector<T>> {
        v.expect(BasisState::LowEnergy)?;
        let mut z = DVector::zeros(v.values.len());
        for block in &self.blocks {
            block.apply_add(v.values.as_slice(), z.as_mut_slice());
        }
        Ok(BasisVector {
            values: z,
            state: BasisState::LowEnergy,
        })
    }

    pub fn apply_into(&self, r: &DVector<T>, z: &mut DVector<T>, comm: &dyn Communicator<T>) -> SolverResult<()> {
        let transformed = self.transform.to_low_energy(BasisVector::standard(r.clone()), comm)?;
        let correction = self.solve_blocks(transformed)?;
        let result = self.transform.from_low_energy(correction, comm)?;
        z.copy_from(result.values());
        Ok(())
    }
}
