//! Rewriting of expressions so that they fit a degree bound.
//!
//! The reducer repeatedly picks the sub-expression that occurs most often
//! among the expressions over the bound, names it with a fresh variable and
//! substitutes that variable everywhere.  Sub-products of products are
//! candidates too, so `a·b·c` can be split into `(b·c)·a`.

use core::cmp::Reverse;
use core::fmt;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use itertools::{izip, Itertools};
use log::info;
use plonky2::field::extension::Extendable;
use plonky2::hash::hash_types::RichField;
use serde::{Deserialize, Serialize};
use symbolic_maybe_rayon::*;

use crate::evaluator::{Caching, DegreeEvaluator, Evaluator};
use crate::expr::{Expr, Operator};
use crate::metadata::Metadata;

/// Pruning knobs.  Zero disables the corresponding limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegreeReductionConfig {
    /// Product factors of smaller degree are left out of sub-product
    /// enumeration.
    pub min_weight_for_term: usize,
    /// Only the last `n_last` factors left after `min_weight_for_term` are
    /// enumerated.
    pub n_last: usize,
    /// Sub-expressions of smaller degree are not candidates, nor is anything
    /// below them.
    pub min_degree_for_candidate: usize,
    /// Candidate collection stops once this many distinct candidates are
    /// known.
    pub max_candidates_per_round: usize,
    /// The reduction stops after this many new variables, even if some
    /// expressions are still over the bound.
    pub max_eliminations: usize,
}

/// Metadata of a variable introduced by the reducer.
#[derive(Clone)]
pub struct EliminatedVariable<F: RichField + Extendable<D>, const D: usize> {
    pub id: usize,
    /// The sub-expression the variable stands for.
    pub expr: Expr<F, D>,
}

impl<F: RichField + Extendable<D>, const D: usize> fmt::Debug for EliminatedVariable<F, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_elim_{} := {:?}", self.id, self.expr)
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Metadata for EliminatedVariable<F, D> {
    fn id(&self) -> String {
        format!("_elim_{}", self.id)
    }

    fn is_base(&self) -> bool {
        self.expr.is_base()
    }
}

/// Output of [`reduce_degree_of_expressions`].
#[derive(Clone, Debug)]
pub struct DegreeReduction<F: RichField + Extendable<D>, const D: usize> {
    /// The input expressions, rewritten over the new variables.
    pub reduced: Vec<Expr<F, D>>,
    /// `eliminated[i]` is the definition of `new_variables[i]`.
    pub eliminated: Vec<Expr<F, D>>,
    pub new_variables: Vec<Arc<EliminatedVariable<F, D>>>,
}

impl<F: RichField + Extendable<D>, const D: usize> DegreeReduction<F, D> {
    /// Inlines every eliminated variable of `expr`, recursively.
    pub fn expand(&self, expr: &Expr<F, D>) -> Expr<F, D> {
        let by_id: HashMap<String, usize> = self
            .new_variables
            .iter()
            .map(|variable| (Metadata::id(variable.as_ref()), variable.id))
            .collect();
        let mut memo = HashMap::new();
        self.expand_inner(expr, &by_id, &mut memo)
    }

    fn expand_inner(
        &self,
        expr: &Expr<F, D>,
        by_id: &HashMap<String, usize>,
        memo: &mut HashMap<F::Extension, Expr<F, D>>,
    ) -> Expr<F, D> {
        if let Some(expanded) = memo.get(&expr.hash()) {
            return expanded.clone();
        }
        let eliminated = expr
            .metadata()
            .and_then(|metadata| by_id.get(&metadata.id()).copied());
        let expanded = match eliminated {
            Some(i) => self.expand_inner(&self.eliminated[i], by_id, memo),
            None if expr.is_leaf() => expr.clone(),
            None => {
                let children = expr
                    .children()
                    .iter()
                    .map(|child| self.expand_inner(child, by_id, memo))
                    .collect_vec();
                rebuild_if_changed(expr, children)
            }
        };
        memo.insert(expr.hash(), expanded.clone());
        expanded
    }
}

/// Sub-multisets of a multiset of weighted elements, by total weight.
///
/// Yields exponent vectors `e` with `0 <= e[i] <= exponents[i]` and
/// `Σ e[i]·weights[i] <= max_weight`, in odometer order with the last
/// position moving fastest.  The empty and the full multiset are skipped.
#[derive(Clone, Debug)]
pub struct SubMultisets<'a> {
    exponents: &'a [u64],
    weights: &'a [usize],
    max_weight: usize,
    min_weight: usize,
    /// Positions that take part, least significant first.
    active: Vec<usize>,
    current: Vec<u64>,
    total: usize,
    exhausted: bool,
}

impl<'a> SubMultisets<'a> {
    pub fn new(
        exponents: &'a [u64],
        weights: &'a [usize],
        max_weight: usize,
        config: &DegreeReductionConfig,
    ) -> Self {
        assert_eq!(
            exponents.len(),
            weights.len(),
            "{} exponents for {} weights",
            exponents.len(),
            weights.len()
        );
        let limit = match config.n_last {
            0 => usize::MAX,
            n => n,
        };
        let active = (0..exponents.len())
            .rev()
            .filter(|&i| weights[i] >= config.min_weight_for_term)
            .take(limit)
            .collect();
        Self {
            exponents,
            weights,
            max_weight,
            min_weight: config.min_degree_for_candidate,
            active,
            current: vec![0; exponents.len()],
            total: 0,
            exhausted: false,
        }
    }

    fn advance(&mut self) -> bool {
        for &i in &self.active {
            let fits = self.total + self.weights[i] <= self.max_weight;
            if self.current[i] < self.exponents[i] && fits {
                self.current[i] += 1;
                self.total += self.weights[i];
                return true;
            }
            self.total -= self.current[i] as usize * self.weights[i];
            self.current[i] = 0;
        }
        false
    }
}

impl<'a> Iterator for SubMultisets<'a> {
    type Item = Vec<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.exhausted {
            if !self.advance() {
                self.exhausted = true;
                break;
            }
            let is_empty = self.current.iter().all(|&e| e == 0);
            if self.total < self.min_weight || is_empty || self.current == self.exponents {
                continue;
            }
            return Some(self.current.clone());
        }
        None
    }
}

struct Candidate<F: RichField + Extendable<D>, const D: usize> {
    expr: Expr<F, D>,
    count: usize,
}

struct Reducer<'a, F: RichField + Extendable<D>, const D: usize, G> {
    bound: usize,
    config: &'a DegreeReductionConfig,
    degree_of: G,
    degrees: Caching<F, D, usize, DegreeEvaluator>,
    /// Identities of the variables introduced so far, all of degree one.
    introduced: HashSet<String>,
    candidates: Vec<Candidate<F, D>>,
    positions: HashMap<F::Extension, usize>,
}

impl<'a, F, const D: usize, G> Reducer<'a, F, D, G>
where
    F: RichField + Extendable<D>,
    G: Fn(&dyn Metadata) -> usize,
{
    fn degree(&mut self, expr: &Expr<F, D>) -> usize {
        let Self {
            degrees,
            degree_of,
            introduced,
            ..
        } = self;
        degrees.eval(expr, &mut |metadata| {
            if introduced.contains(&metadata.id()) {
                1
            } else {
                degree_of(metadata)
            }
        })
    }

    fn add_candidate(&mut self, expr: Expr<F, D>) {
        match self.positions.get(&expr.hash()) {
            Some(&i) => self.candidates[i].count += 1,
            None => {
                self.positions.insert(expr.hash(), self.candidates.len());
                self.candidates.push(Candidate { expr, count: 1 });
            }
        }
    }

    /// Collects candidates from `exprs[i]` for every over-bound `i`.
    fn collect_candidates(&mut self, exprs: &[Expr<F, D>], over_bound: &[usize]) {
        self.candidates.clear();
        self.positions.clear();
        for &i in over_bound {
            if self.collect(&exprs[i]) == 0 {
                let children_degrees = exprs[i]
                    .children()
                    .iter()
                    .map(|child| self.degree(child))
                    .collect_vec();
                panic!(
                    "no candidate sub-expression to eliminate in {:?} (children degrees {:?})",
                    exprs[i], children_degrees
                );
            }
            let limit = self.config.max_candidates_per_round;
            if limit > 0 && self.candidates.len() >= limit {
                break;
            }
        }
    }

    fn collect(&mut self, expr: &Expr<F, D>) -> usize {
        let degree = self.degree(expr);
        if degree < self.config.min_degree_for_candidate {
            return 0;
        }
        let mut added = 0;
        if degree > 0 && degree <= self.bound && !expr.is_leaf() {
            self.add_candidate(expr.clone());
            added += 1;
        }
        for child in expr.children() {
            added += self.collect(child);
        }
        if let Operator::Product { exponents } = expr.op() {
            added += self.collect_sub_products(expr.children(), exponents);
        }
        added
    }

    fn collect_sub_products(&mut self, factors: &[Expr<F, D>], exponents: &[u64]) -> usize {
        let weights = factors.iter().map(|f| self.degree(f)).collect_vec();
        let subsets = SubMultisets::new(exponents, &weights, self.bound, self.config).collect_vec();
        let mut added = 0;
        for subset in subsets {
            // A lone factor is already a node of its own.
            if subset.iter().sum::<u64>() == 1 {
                continue;
            }
            let weight: usize = izip!(&subset, &weights).map(|(&e, &w)| e as usize * w).sum();
            if weight == 0 {
                continue;
            }
            let (children, exps): (Vec<_>, Vec<_>) = izip!(factors, &subset)
                .filter(|(_, e)| **e > 0)
                .map(|(f, &e)| (f.clone(), e))
                .unzip();
            let sub_product = Expr::product(&children, &exps);
            if sub_product.is_leaf() {
                continue;
            }
            self.add_candidate(sub_product);
            added += 1;
        }
        added
    }

    /// Most frequent candidate; ties go to more children, then to the first
    /// found.
    fn best_candidate(&self) -> Option<Expr<F, D>> {
        self.candidates
            .iter()
            .enumerate()
            .max_by_key(|(i, c)| (c.count, c.expr.children().len(), Reverse(*i)))
            .map(|(_, c)| c.expr.clone())
    }
}

/// Rewrites `exprs` until every one of them has degree at most `bound`, by
/// naming common sub-expressions with new variables.
///
/// `degree_of` gives the degree of the original variables; the new variables
/// have degree one.  Panics if `bound <= 1`, or if an expression over the
/// bound has nothing left to eliminate.
pub fn reduce_degree_of_expressions<F, const D: usize, G>(
    exprs: &[Expr<F, D>],
    bound: usize,
    degree_of: G,
    config: &DegreeReductionConfig,
) -> DegreeReduction<F, D>
where
    F: RichField + Extendable<D>,
    G: Fn(&dyn Metadata) -> usize,
{
    assert!(bound > 1, "cannot reduce the degree with a bound of {bound}");

    let mut reducer = Reducer {
        bound,
        config,
        degree_of,
        degrees: Caching::from(DegreeEvaluator),
        introduced: HashSet::new(),
        candidates: Vec::new(),
        positions: HashMap::new(),
    };
    let mut current = exprs.to_vec();
    let mut eliminated = Vec::new();
    let mut new_variables: Vec<Arc<EliminatedVariable<F, D>>> = Vec::new();

    loop {
        if config.max_eliminations > 0 && new_variables.len() >= config.max_eliminations {
            info!(
                "reached the maximum of {} eliminated sub-expressions",
                config.max_eliminations
            );
            break;
        }

        let over_bound = (0..current.len())
            .filter(|&i| reducer.degree(&current[i]) > bound)
            .collect_vec();
        if over_bound.is_empty() {
            break;
        }

        reducer.collect_candidates(&current, &over_bound);
        let Some(best) = reducer.best_candidate() else {
            break;
        };

        let variable = Arc::new(EliminatedVariable {
            id: new_variables.len(),
            expr: best.clone(),
        });
        reducer.introduced.insert(Metadata::id(variable.as_ref()));
        let replacement = Expr::from_metadata(variable.clone());
        current = current
            .par_iter()
            .map(|expr| substitute(expr, &best, &replacement))
            .collect();
        eliminated.push(best);
        new_variables.push(variable);

        if new_variables.len() % 100 == 0 {
            info!(
                "eliminated {} sub-expressions, {} expressions over degree {bound}, {} candidates",
                new_variables.len(),
                over_bound.len(),
                reducer.candidates.len()
            );
        }
    }

    info!(
        "done reducing {} expressions to degree {bound} with {} new variables",
        exprs.len(),
        new_variables.len()
    );

    DegreeReduction {
        reduced: current,
        eliminated,
        new_variables,
    }
}

fn rebuild_if_changed<F: RichField + Extendable<D>, const D: usize>(
    expr: &Expr<F, D>,
    children: Vec<Expr<F, D>>,
) -> Expr<F, D> {
    if izip!(&children, expr.children()).all(|(new, old)| new.ptr_eq(old)) {
        expr.clone()
    } else {
        expr.with_children(&children)
    }
}

/// Replaces every occurrence of `target` in `expr`.  When `target` is a
/// product, it is also factored out of the products containing its factors.
fn substitute<F: RichField + Extendable<D>, const D: usize>(
    expr: &Expr<F, D>,
    target: &Expr<F, D>,
    replacement: &Expr<F, D>,
) -> Expr<F, D> {
    let mut memo = HashMap::new();
    substitute_inner(expr, target, replacement, &mut memo)
}

fn substitute_inner<F: RichField + Extendable<D>, const D: usize>(
    expr: &Expr<F, D>,
    target: &Expr<F, D>,
    replacement: &Expr<F, D>,
    memo: &mut HashMap<F::Extension, Expr<F, D>>,
) -> Expr<F, D> {
    if expr.hash() == target.hash() {
        return replacement.clone();
    }
    if expr.is_leaf() {
        return expr.clone();
    }
    if let Some(done) = memo.get(&expr.hash()) {
        return done.clone();
    }

    let factored = match (expr.op(), target.op()) {
        (Operator::Product { .. }, Operator::Product { .. }) => factor_out(expr, target),
        _ => None,
    };
    let result = match factored {
        Some(remaining) if remaining.is_empty() => replacement.clone(),
        Some(remaining) => {
            let (children, exponents): (Vec<_>, Vec<_>) =
                core::iter::once((replacement.clone(), 1)).chain(remaining).unzip();
            Expr::product(&children, &exponents)
        }
        None => {
            let children = expr
                .children()
                .iter()
                .map(|child| substitute_inner(child, target, replacement, memo))
                .collect_vec();
            rebuild_if_changed(expr, children)
        }
    };
    memo.insert(expr.hash(), result.clone());
    result
}

/// The factors left in `expr` once those of `target` are divided out, if
/// `target` divides `expr`.
fn factor_out<F: RichField + Extendable<D>, const D: usize>(
    expr: &Expr<F, D>,
    target: &Expr<F, D>,
) -> Option<Vec<(Expr<F, D>, u64)>> {
    let mut remaining = expr.factors();
    for (factor, exponent) in target.factors() {
        let entry = remaining.iter_mut().find(|(f, _)| f.hash() == factor.hash())?;
        if entry.1 < exponent {
            return None;
        }
        entry.1 -= exponent;
    }
    remaining.retain(|&(_, e)| e > 0);
    Some(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_logger, var, E, F};

    fn unit(_: &dyn Metadata) -> usize {
        1
    }

    fn check(exprs: &[E], bound: usize, config: &DegreeReductionConfig) -> DegreeReduction<F, 2> {
        let reduction = reduce_degree_of_expressions(exprs, bound, unit, config);
        assert_eq!(reduction.reduced.len(), exprs.len());
        assert_eq!(reduction.eliminated.len(), reduction.new_variables.len());
        for (original, reduced) in exprs.iter().zip(&reduction.reduced) {
            assert!(reduced.degree(unit) <= bound, "{reduced:?} is over degree {bound}");
            assert_eq!(reduction.expand(reduced).hash(), original.hash());
        }
        for eliminated in &reduction.eliminated {
            assert!(eliminated.degree(unit) <= bound);
        }
        reduction
    }

    #[test]
    fn splits_a_cubic_product() {
        init_logger();
        let (a, b, c) = (var("a"), var("b"), var("c"));
        let e = &a * (&b * &c);
        let reduction = check(&[e], 2, &DegreeReductionConfig::default());
        assert_eq!(reduction.eliminated.len(), 1);
        assert_eq!(reduction.new_variables.len(), 1);
        assert_eq!(reduction.eliminated[0], &b * &c);
        assert_eq!(Metadata::id(reduction.new_variables[0].as_ref()), "_elim_0");
        assert!(reduction.new_variables[0].is_base());
    }

    #[test]
    fn batch_fits_the_bound() {
        init_logger();
        let (x, y, z, w) = (var("x"), var("y"), var("z"), var("w"));
        let exprs = vec![
            x.pow(5) * &y,
            (&x + &y).pow(4) - &z,
            &x * &y * &z * &w + x.square(),
            E::poly_eval(&x, &[y.clone(), z.clone(), w.clone()]),
            (&x * &y + &z * &w) * (&x - &w) * &z + 3,
            &x + 1,
        ];
        for bound in [2, 3, 4] {
            let reduction = check(&exprs, bound, &DegreeReductionConfig::default());
            assert!(reduction.reduced[5].ptr_eq(&exprs[5]));
            assert!(reduction.reduced[3].ptr_eq(&exprs[3]));
        }
    }

    #[test]
    fn shared_factor_is_eliminated_first() {
        let (x, y, a, b) = (var("x"), var("y"), var("a"), var("b"));
        let xy = &x * &y;
        let exprs = vec![&xy * &a, &xy * &b, &xy * &a * &b];
        let reduction = check(&exprs, 2, &DegreeReductionConfig::default());
        assert_eq!(reduction.eliminated[0], xy);
    }

    #[test]
    fn nothing_to_do_under_the_bound() {
        let (x, y) = (var("x"), var("y"));
        let exprs = vec![&x * &y, &x + &y];
        let reduction = check(&exprs, 2, &DegreeReductionConfig::default());
        assert!(reduction.eliminated.is_empty());
        assert!(reduction.reduced[0].ptr_eq(&exprs[0]));
    }

    #[test]
    fn candidate_limit_stops_collection_early() {
        init_logger();
        let (a, b, c) = (var("a"), var("b"), var("c"));
        let (x, y, u, w) = (var("x"), var("y"), var("u"), var("w"));
        let exprs = vec![&a * &b * &c, &x * &y * &u, &x * &y * &w];

        let everywhere = check(&exprs, 2, &DegreeReductionConfig::default());
        assert_eq!(everywhere.eliminated[0], &x * &y);

        let config = DegreeReductionConfig {
            max_candidates_per_round: 1,
            ..Default::default()
        };
        let first_only = check(&exprs, 2, &config);
        assert_eq!(first_only.eliminated[0], &b * &c);
    }

    #[test]
    fn min_degree_skips_low_degree_subtrees() {
        let (x, y, z) = (var("x"), var("y"), var("z"));
        let e = (&x + &y) * (&x - &y) * &z;

        let unrestricted = check(&[e.clone()], 2, &DegreeReductionConfig::default());
        assert_eq!(unrestricted.eliminated[0], &x + &y);

        let config = DegreeReductionConfig {
            min_degree_for_candidate: 2,
            ..Default::default()
        };
        let restricted = check(&[e], 2, &config);
        assert_eq!(restricted.eliminated, vec![(&x - &y) * &z]);
        for eliminated in &restricted.eliminated {
            assert!(eliminated.degree(unit) >= 2);
        }
    }

    #[test]
    fn stops_at_max_eliminations() {
        let x = var("x");
        let config = DegreeReductionConfig {
            max_eliminations: 1,
            ..Default::default()
        };
        let reduction = reduce_degree_of_expressions(&[x.pow(16)], 2, unit, &config);
        assert_eq!(reduction.new_variables.len(), 1);
        assert!(reduction.reduced[0].degree(unit) > 2);
        assert_eq!(reduction.expand(&reduction.reduced[0]), x.pow(16));
    }

    #[test]
    #[should_panic(expected = "bound of 1")]
    fn rejects_bound_one() {
        reduce_degree_of_expressions(&[var("x")], 1, unit, &DegreeReductionConfig::default());
    }

    #[test]
    #[should_panic(expected = "no candidate")]
    fn panics_without_candidates() {
        let x = var("x");
        reduce_degree_of_expressions(&[x], 2, |_| 3, &DegreeReductionConfig::default());
    }

    #[test]
    fn sub_multisets_in_odometer_order() {
        let config = DegreeReductionConfig::default();
        let all = SubMultisets::new(&[2, 1], &[1, 1], 2, &config).collect_vec();
        assert_eq!(all, vec![vec![0, 1], vec![1, 0], vec![1, 1], vec![2, 0]]);

        let last = DegreeReductionConfig {
            n_last: 1,
            ..Default::default()
        };
        let only_last = SubMultisets::new(&[2, 1], &[1, 1], 2, &last).collect_vec();
        assert_eq!(only_last, vec![vec![0, 1]]);

        let heavy = DegreeReductionConfig {
            min_weight_for_term: 2,
            ..Default::default()
        };
        let only_heavy = SubMultisets::new(&[2, 1], &[2, 1], 2, &heavy).collect_vec();
        assert_eq!(only_heavy, vec![vec![1, 0]]);

        let min_degree = DegreeReductionConfig {
            min_degree_for_candidate: 2,
            ..Default::default()
        };
        let at_least_two = SubMultisets::new(&[2, 1], &[1, 1], 2, &min_degree).collect_vec();
        assert_eq!(at_least_two, vec![vec![1, 1], vec![2, 0]]);
    }

    #[test]
    fn full_multiset_is_skipped() {
        let config = DegreeReductionConfig::default();
        let all = SubMultisets::new(&[1, 1], &[1, 1], 5, &config).collect_vec();
        assert_eq!(all, vec![vec![0, 1], vec![1, 0]]);
    }

    #[test]
    fn substitution_factors_out_sub_products() {
        let (x, y, z) = (var("x"), var("y"), var("z"));
        let v = E::variable("v");
        let e = x.pow(3) * y.square() * &z + &x * &y;
        let substituted = substitute(&e, &(&x * &y), &v);
        assert_eq!(substituted, &v * x.square() * &y * &z + &v);
    }
}
