use super::assert_element_vectors_eq;
use hpsolve::boundary_map::Sign;
use hpsolve::comm::{Communicator, SerialCommunicator};
use hpsolve::element::DofGroup;
use hpsolve::error::ErrorCategory;
use hpsolve::nested_vec::NestedVec;
use hpsolve::partition::LocalElementMatrix;
use hpsolve::procedural::{QuadMesh, StokesQuadMesh};
use hpsolve::settings::{OverlapPatches, PreconditionerKind, RecursionSettings, SingularHandling, SolverSettings};
use hpsolve::source::{
    BoundaryDofSource, DivergenceOperator, ElementFamily, LocalOperatorSource, StokesOperatorSource,
};
use hpsolve::stokes::StokesSystem;
use hpsolve::{ElementVectors, GlobalBoundarySystem, Solution};
use matrixcompare::assert_matrix_eq;
use nalgebra::DVector;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

/// Serial communicator that counts collective calls and may claim a larger size.
#[derive(Debug, Default)]
struct CountingCommunicator {
    size: usize,
    sums: AtomicUsize,
    maxima: AtomicUsize,
}

impl Communicator<f64> for CountingCommunicator {
    fn size(&self) -> usize {
        self.size.max(1)
    }

    fn reduce_sum(&self, _values: &mut [f64]) {
        self.sums.fetch_add(1, Ordering::SeqCst);
    }

    fn reduce_max(&self, _values: &mut [usize]) {
        self.maxima.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct SharedBuffers {
    barrier: Barrier,
    sum: Mutex<Vec<f64>>,
    max: Mutex<Vec<usize>>,
}

/// Communicator between threads of one test, one thread per rank.
#[derive(Debug, Clone)]
struct ThreadCommunicator {
    rank: usize,
    size: usize,
    shared: Arc<SharedBuffers>,
}

impl ThreadCommunicator {
    fn group(size: usize) -> Vec<Self> {
        let shared = Arc::new(SharedBuffers {
            barrier: Barrier::new(size),
            sum: Mutex::new(Vec::new()),
            max: Mutex::new(Vec::new()),
        });
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                shared: shared.clone(),
            })
            .collect()
    }

    fn reduce<V: Copy + Default>(&self, buffer: &Mutex<Vec<V>>, values: &mut [V], combine: impl Fn(V, V) -> V) {
        self.shared.barrier.wait();
        if self.rank == 0 {
            let mut buffer = buffer.lock().unwrap();
            buffer.clear();
            buffer.resize(values.len(), V::default());
        }
        self.shared.barrier.wait();
        {
            let mut buffer = buffer.lock().unwrap();
            for (b, &v) in buffer.iter_mut().zip(values.iter()) {
                *b = combine(*b, v);
            }
        }
        self.shared.barrier.wait();
        values.copy_from_slice(&buffer.lock().unwrap());
    }
}

impl Communicator<f64> for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn reduce_sum(&self, values: &mut [f64]) {
        self.reduce(&self.shared.sum, values, |a, b| a + b)
    }

    fn reduce_max(&self, values: &mut [usize]) {
        self.reduce(&self.shared.max, values, usize::max)
    }
}

/// The elements of `source` owned by one process.
struct OwnedElements<'a, S> {
    source: &'a S,
    elements: Vec<usize>,
}

impl<'a, S: BoundaryDofSource> OwnedElements<'a, S> {
    fn round_robin(source: &'a S, rank: usize, size: usize) -> Self {
        Self {
            source,
            elements: (rank..source.num_elements()).step_by(size).collect(),
        }
    }

    fn restrict(&self, vectors: &ElementVectors<f64>) -> ElementVectors<f64> {
        let mut owned = NestedVec::new();
        for &e in &self.elements {
            owned.push(vectors.get(e).unwrap());
        }
        owned
    }
}

impl<'a, S: BoundaryDofSource> BoundaryDofSource for OwnedElements<'a, S> {
    fn num_elements(&self) -> usize {
        self.elements.len()
    }

    fn num_global_dofs(&self) -> usize {
        self.source.num_global_dofs()
    }

    fn num_solve_dofs(&self) -> usize {
        self.source.num_solve_dofs()
    }

    fn element_boundary_count(&self, element_index: usize) -> usize {
        self.source.element_boundary_count(self.elements[element_index])
    }

    fn populate_boundary_dofs(&self, output: &mut [usize], element_index: usize) {
        self.source
            .populate_boundary_dofs(output, self.elements[element_index])
    }

    fn populate_signs(&self, output: &mut [Sign], element_index: usize) {
        self.source.populate_signs(output, self.elements[element_index])
    }

    fn dof_group(&self, global_dof: usize) -> DofGroup {
        self.source.dof_group(global_dof)
    }
}

impl<'a, S: LocalOperatorSource<f64>> LocalOperatorSource<f64> for OwnedElements<'a, S> {
    fn element_family(&self, element_index: usize) -> Option<ElementFamily<f64>> {
        self.source.element_family(self.elements[element_index])
    }

    fn local_operator(&self, element_index: usize) -> eyre::Result<LocalElementMatrix<f64>> {
        self.source.local_operator(self.elements[element_index])
    }
}

impl<'a, S: StokesOperatorSource<f64>> StokesOperatorSource<f64> for OwnedElements<'a, S> {
    fn num_velocity_components(&self) -> usize {
        self.source.num_velocity_components()
    }

    fn divergence_operator(&self, element_index: usize) -> eyre::Result<DivergenceOperator<f64>> {
        self.source.divergence_operator(self.elements[element_index])
    }
}

fn poisson_mesh() -> QuadMesh<f64> {
    QuadMesh::unit_square(3, 3)
        .unwrap()
        .with_lambda(2.0)
        .with_mirrored_columns()
}

fn settings_for(kind: Option<PreconditionerKind>) -> SolverSettings {
    match kind {
        None => SolverSettings::direct(),
        Some(kind) => SolverSettings {
            tolerance: 1e-12,
            ..SolverSettings::iterative(kind)
        },
    }
}

fn solve_poisson<S>(source: &S, rhs: &ElementVectors<f64>, settings: SolverSettings, comm: Arc<dyn Communicator<f64>>) -> Solution<f64>
where
    S: LocalOperatorSource<f64>,
{
    let guess = DVector::zeros(source.num_global_dofs());
    let mut system = GlobalBoundarySystem::build_with_communicator(source, settings, comm).unwrap();
    system.solve(rhs, &guess).unwrap()
}

#[test]
fn distributed_poisson_solves_match_serial_solve() {
    let mesh = poisson_mesh();
    let rhs = mesh.load_vectors(|x| x[0] - 2.0 * x[1] * x[1]).unwrap();
    let mut cases: Vec<_> = [
        None,
        Some(PreconditionerKind::Diagonal),
        Some(PreconditionerKind::Block),
        Some(PreconditionerKind::LowEnergy),
        Some(PreconditionerKind::Overlap),
    ]
    .into_iter()
    .map(settings_for)
    .collect();
    let mut by_element = settings_for(Some(PreconditionerKind::Overlap));
    by_element.overlap.patches = OverlapPatches::ByElement;
    cases.push(by_element);

    for settings in cases {
        let serial = solve_poisson(&mesh, &rhs, settings.clone(), Arc::new(SerialCommunicator));
        let comms = ThreadCommunicator::group(2);
        let distributed: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let (mesh, rhs, settings) = (&mesh, &rhs, settings.clone());
                    scope.spawn(move || {
                        let owned = OwnedElements::round_robin(mesh, comm.rank, comm.size);
                        let solution = solve_poisson(&owned, &owned.restrict(rhs), settings, Arc::new(comm));
                        (owned.elements, solution)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (elements, solution) in &distributed {
            assert_matrix_eq!(solution.boundary, serial.boundary, comp = abs, tol = 1e-9);
            let owned = OwnedElements {
                source: &mesh,
                elements: elements.clone(),
            };
            assert_element_vectors_eq(&solution.elements, &owned.restrict(&serial.elements), 1e-9);
        }
    }
}

#[test]
fn stokes_systems_are_single_process_only() {
    let mesh = StokesQuadMesh::<f64>::unit_square(2, 3).unwrap();
    let settings = SolverSettings {
        singular: SingularHandling::Pinned { dof: None },
        ..SolverSettings::direct()
    };
    let comm = Arc::new(CountingCommunicator {
        size: 2,
        ..Default::default()
    });
    let owned = OwnedElements::round_robin(&mesh, 0, 2);
    let err = StokesSystem::build_with_communicator(&owned, settings, comm)
        .err()
        .unwrap();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn every_process_runs_the_collectives() {
    let mesh = poisson_mesh();
    let rhs = mesh.load_vectors(|_| 1.0).unwrap();
    let comm = Arc::new(CountingCommunicator::default());
    let solution = solve_poisson(
        &mesh,
        &rhs,
        settings_for(Some(PreconditionerKind::Diagonal)),
        comm.clone(),
    );
    assert!(solution.iterations > 0);
    // One operator application per iteration at least, plus assembly
    assert!(comm.sums.load(Ordering::SeqCst) > solution.iterations);
    assert!(comm.maxima.load(Ordering::SeqCst) >= 2);
}

#[test]
fn multilevel_solves_are_single_process_only() {
    let mesh = poisson_mesh();
    let comm = Arc::new(CountingCommunicator {
        size: 2,
        ..Default::default()
    });
    let settings = SolverSettings {
        recursion: Some(RecursionSettings::default()),
        ..SolverSettings::direct()
    };
    let err = GlobalBoundarySystem::build_with_communicator(&mesh, settings, comm)
        .err()
        .unwrap();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}
