//! Reuse of previous solutions as initial guesses for later right-hand sides.
//!
//! The cache holds a small set of A-orthonormal vectors `x_k` together with `A x_k`. For a new
//! right-hand side `b`, the A-projection of the solution onto their span is
//! `x₀ = Σ_k (x_kᵀ b) x_k`, which is then used as the initial guess of CG.
use crate::settings::{MultiRhsSettings, MultiRhsUpdate};
use hpsolve_traits::Real;
use log::{debug, warn};
use nalgebra::DVector;
use numeric_literals::replace_float_literals;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
struct CachedSolution<T: Real> {
    x: DVector<T>,
    ax: DVector<T>,
}

#[derive(Debug, Clone)]
pub struct MultiRhsCache<T: Real> {
    settings: MultiRhsSettings,
    entries: VecDeque<CachedSolution<T>>,
}

impl<T: Real> MultiRhsCache<T> {
    pub fn new(settings: MultiRhsSettings) -> Self {
        Self {
            entries: VecDeque::with_capacity(settings.capacity),
            settings,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// The projection of the solution of `A x = b` onto the cached space.
    pub fn initial_guess(&self, b: &DVector<T>) -> DVector<T> {
        let mut x0 = DVector::zeros(b.len());
        for entry in &self.entries {
            if entry.x.len() == b.len() {
                x0.axpy(entry.x.dot(b), &entry.x, T::one());
            }
        }
        x0
    }

    /// Modified Gram-Schmidt of `(x, A x)` against the cached entries in the A-inner product.
    fn orthogonalize(&self, x: &mut DVector<T>, ax: &mut DVector<T>) -> T {
        for entry in &self.entries {
            let c = entry.ax.dot(x);
            x.axpy(-c, &entry.x, T::one());
            ax.axpy(-c, &entry.ax, T::one());
        }
        x.dot(ax)
    }

    /// Orthogonalizes `(x, A x)` against the cache in the A-inner product and stores it.
    ///
    /// A full cache is evicted or cleared before orthogonalizing, so the stored vector only has
    /// components along entries that remain. Returns `false` if the vector was (numerically)
    /// already in the cached space.
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn insert(&mut self, x: DVector<T>, ax: DVector<T>) -> bool {
        let original = x.dot(&ax);
        if !(original > 0.0) {
            warn!("Multi-RHS cache: ignoring solution with non-positive energy");
            return false;
        }

        let threshold = original * T::default_epsilon() * 100.0;
        let (mut x_orth, mut ax_orth) = (x.clone(), ax.clone());
        let mut energy = self.orthogonalize(&mut x_orth, &mut ax_orth);
        if !(energy > threshold) {
            warn!("Multi-RHS cache: dropping nearly dependent solution");
            return false;
        }

        if self.entries.len() >= self.settings.capacity {
            match self.settings.update {
                MultiRhsUpdate::EvictOldest => {
                    self.entries.pop_front();
                }
                MultiRhsUpdate::Restart => self.entries.clear(),
            }
            debug!("Multi-RHS cache full ({:?})", self.settings.update);
            x_orth = x;
            ax_orth = ax;
            energy = self.orthogonalize(&mut x_orth, &mut ax_orth);
        }

        let norm = energy.sqrt();
        x_orth /= norm;
        ax_orth /= norm;
        self.entries.push_back(CachedSolution { x: x_orth, ax: ax_orth });
        debug!("Multi-RHS cache holds {} solutions", self.entries.len());
        true
    }
}
