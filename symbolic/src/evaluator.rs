//! Evaluators

use hashbrown::HashMap;
use itertools::Itertools;
use plonky2::field::extension::{Extendable, FieldExtension};
use plonky2::field::types::Field;
use plonky2::hash::hash_types::RichField;

use crate::expr::{coefficient, Expr, Operator};
use crate::metadata::Metadata;

/// Node-level semantics of an expression, producing values of type `V`.
///
/// Variables are resolved by a `leaf` callback supplied at evaluation time.
pub trait Evaluator<F: RichField + Extendable<D>, const D: usize, V> {
    fn constant(&mut self, value: F::Extension) -> V;
    fn lin_comb(&mut self, terms: &[V], coeffs: &[i64]) -> V;
    fn product(&mut self, factors: &[V], exponents: &[u64]) -> V;
    fn poly_eval(&mut self, x: &V, coeffs: &[V]) -> V;

    /// Applies `op` to already evaluated children.
    fn apply(
        &mut self,
        op: &Operator<F, D>,
        args: &[V],
        leaf: &mut dyn FnMut(&dyn Metadata) -> V,
    ) -> V {
        match op {
            Operator::Constant(value) => self.constant(*value),
            Operator::Variable(metadata) => leaf(metadata.as_ref()),
            Operator::LinComb { coeffs } => self.lin_comb(args, coeffs),
            Operator::Product { exponents } => self.product(args, exponents),
            Operator::PolyEval => match args {
                [x, coeffs @ ..] => self.poly_eval(x, coeffs),
                [] => panic!("PolyEval without an evaluation point"),
            },
        }
    }

    /// Evaluates the whole tree.  Shared subtrees are evaluated once per
    /// occurrence; see [`Caching`] for the memoized version.
    fn eval(&mut self, expr: &Expr<F, D>, leaf: &mut dyn FnMut(&dyn Metadata) -> V) -> V {
        let mut args = Vec::with_capacity(expr.children().len());
        for child in expr.children() {
            args.push(self.eval(child, leaf));
        }
        self.apply(expr.op(), &args, leaf)
    }
}

/// Default evaluator for pure field values.
#[derive(Clone, Copy, Debug)]
pub struct PureEvaluator<F: RichField + Extendable<D>, const D: usize, T> {
    lift: fn(F::Extension) -> T,
}

impl<F: RichField + Extendable<D>, const D: usize> PureEvaluator<F, D, F> {
    /// Evaluates over the base field.  Panics on constants outside of it.
    pub fn base() -> Self {
        Self {
            lift: |value| {
                assert!(
                    value.is_in_basefield(),
                    "constant {value} is not in the base field"
                );
                value.to_basefield_array()[0]
            },
        }
    }
}

impl<F: RichField + Extendable<D>, const D: usize> PureEvaluator<F, D, F::Extension> {
    pub fn extension() -> Self {
        Self { lift: |value| value }
    }
}

impl<F, const D: usize, T> Evaluator<F, D, T> for PureEvaluator<F, D, T>
where
    F: RichField + Extendable<D>,
    T: Field,
{
    fn constant(&mut self, value: F::Extension) -> T {
        (self.lift)(value)
    }

    fn lin_comb(&mut self, terms: &[T], coeffs: &[i64]) -> T {
        terms
            .iter()
            .zip_eq(coeffs)
            .map(|(&term, &c)| term * coefficient::<T>(c))
            .sum()
    }

    fn product(&mut self, factors: &[T], exponents: &[u64]) -> T {
        factors
            .iter()
            .zip_eq(exponents)
            .map(|(&factor, &e)| factor.exp_u64(e))
            .product()
    }

    fn poly_eval(&mut self, x: &T, coeffs: &[T]) -> T {
        coeffs
            .iter()
            .rev()
            .fold(T::ZERO, |acc, &c| acc * *x + c)
    }
}

/// Computes degrees: constants have degree zero, sums take the maximum and
/// products add up.
#[derive(Clone, Copy, Debug, Default)]
pub struct DegreeEvaluator;

impl<F: RichField + Extendable<D>, const D: usize> Evaluator<F, D, usize> for DegreeEvaluator {
    fn constant(&mut self, _value: F::Extension) -> usize {
        0
    }

    fn lin_comb(&mut self, terms: &[usize], _coeffs: &[i64]) -> usize {
        terms.iter().copied().max().unwrap_or_default()
    }

    fn product(&mut self, factors: &[usize], exponents: &[u64]) -> usize {
        factors
            .iter()
            .zip_eq(exponents)
            .map(|(&d, &e)| {
                usize::try_from(e)
                    .ok()
                    .and_then(|e| d.checked_mul(e))
                    .unwrap_or_else(|| {
                        panic!("degree overflow raising degree {d} to the power {e}")
                    })
            })
            .fold(0usize, |acc, term| {
                acc.checked_add(term)
                    .unwrap_or_else(|| panic!("degree overflow adding {acc} and {term}"))
            })
    }

    fn poly_eval(&mut self, x: &usize, coeffs: &[usize]) -> usize {
        coeffs.iter().copied().chain([*x]).max().unwrap_or_default()
    }
}

/// Counts how many operator nodes were evaluated.
#[derive(Debug, Default)]
pub struct Counting<E> {
    count: u64,
    pub evaluator: E,
}

impl<E> Counting<E> {
    pub fn new(evaluator: E) -> Self {
        Self {
            count: 0,
            evaluator,
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<E> From<E> for Counting<E> {
    fn from(evaluator: E) -> Self {
        Self::new(evaluator)
    }
}

impl<F, const D: usize, V, E> Evaluator<F, D, V> for Counting<E>
where
    F: RichField + Extendable<D>,
    E: Evaluator<F, D, V>,
{
    fn constant(&mut self, value: F::Extension) -> V {
        self.count += 1;
        self.evaluator.constant(value)
    }

    fn lin_comb(&mut self, terms: &[V], coeffs: &[i64]) -> V {
        self.count += 1;
        self.evaluator.lin_comb(terms, coeffs)
    }

    fn product(&mut self, factors: &[V], exponents: &[u64]) -> V {
        self.count += 1;
        self.evaluator.product(factors, exponents)
    }

    fn poly_eval(&mut self, x: &V, coeffs: &[V]) -> V {
        self.count += 1;
        self.evaluator.poly_eval(x, coeffs)
    }
}

/// Memoizes evaluation by ESHash, so that every distinct sub-expression is
/// evaluated once no matter how often it is shared.
pub struct Caching<F: RichField + Extendable<D>, const D: usize, V, E> {
    cache: HashMap<F::Extension, V>,
    pub evaluator: E,
}

impl<F: RichField + Extendable<D>, const D: usize, V, E> From<E> for Caching<F, D, V, E> {
    fn from(evaluator: E) -> Self {
        Self {
            cache: HashMap::new(),
            evaluator,
        }
    }
}

impl<F, const D: usize, V, E> Evaluator<F, D, V> for Caching<F, D, V, E>
where
    F: RichField + Extendable<D>,
    V: Clone,
    E: Evaluator<F, D, V>,
{
    fn constant(&mut self, value: F::Extension) -> V {
        self.evaluator.constant(value)
    }

    fn lin_comb(&mut self, terms: &[V], coeffs: &[i64]) -> V {
        self.evaluator.lin_comb(terms, coeffs)
    }

    fn product(&mut self, factors: &[V], exponents: &[u64]) -> V {
        self.evaluator.product(factors, exponents)
    }

    fn poly_eval(&mut self, x: &V, coeffs: &[V]) -> V {
        self.evaluator.poly_eval(x, coeffs)
    }

    fn eval(&mut self, expr: &Expr<F, D>, leaf: &mut dyn FnMut(&dyn Metadata) -> V) -> V {
        if let Some(value) = self.cache.get(&expr.hash()) {
            return value.clone();
        }
        let mut args = Vec::with_capacity(expr.children().len());
        for child in expr.children() {
            args.push(self.eval(child, leaf));
        }
        let value = self.evaluator.apply(expr.op(), &args, leaf);
        self.cache.insert(expr.hash(), value.clone());
        value
    }
}

#[cfg(test)]
mod tests {
    use plonky2::field::types::{Field, Sample};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::test_utils::{var, E, F};

    type Ext = <F as Extendable<2>>::Extension;

    #[test]
    fn it_works() {
        let (x, y) = (var("x"), var("y"));
        let e = (&x + 2 * &y) * (&x - 5) + x.square();
        let mut ev = PureEvaluator::<F, 2, F>::base();
        let value = ev.eval(&e, &mut |m| match m.id().as_str() {
            "x" => F::from_canonical_u64(7),
            _ => F::from_canonical_u64(3),
        });
        // (7 + 6) * 2 + 49
        assert_eq!(value, F::from_canonical_u64(75));
    }

    #[test]
    fn hash_is_evaluation_at_the_hash_point() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let (x, y) = (var("x"), var("y"));
        let c = Ext::sample(&mut rng);
        let e = E::poly_eval(&x, &[y.clone(), E::constant(c), x.clone()]) * (&y - 1);
        let mut ev = PureEvaluator::<F, 2, Ext>::extension();
        let (hx, hy) = (x.hash(), y.hash());
        let value = ev.eval(&e, &mut |m| match m.id().as_str() {
            "x" => hx,
            _ => hy,
        });
        assert_eq!(value, e.hash());
        assert_eq!(value, (hy + c * hx + hx * hx * hx) * (hy - Ext::ONE));
    }

    #[test]
    #[should_panic(expected = "not in the base field")]
    fn base_evaluation_rejects_extension_constants() {
        let gamma = Ext::from_basefield_array([F::ZERO, F::ONE]);
        PureEvaluator::<F, 2, F>::base().eval(&(var("x") + E::constant(gamma)), &mut |_| F::ONE);
    }

    #[test]
    fn count_depth() {
        let mut e = var("x");
        for i in 1..10 {
            e = &e * &var("x") + i;
        }
        let mut ev = Counting::new(DegreeEvaluator);
        assert_eq!(ev.eval(&e, &mut |_| 1usize), 10);
        let first = ev.count();
        assert!(first > 0);
        ev.reset();
        assert_eq!(ev.count(), 0);
    }

    #[test]
    fn avoids_exponential_blowup() {
        let mut e = var("x");
        // Each step doubles the tree, but there are only a handful of distinct
        // sub-expressions.
        for _ in 0..20 {
            e = &e * &e + &e;
        }
        let mut ev = Caching::<F, 2, usize, _>::from(Counting::new(DegreeEvaluator));
        assert_eq!(ev.eval(&e, &mut |_| 1), 1 << 20);
        // One square and one sum per step.
        assert_eq!(ev.evaluator.count(), 2 * 20);
    }
}
