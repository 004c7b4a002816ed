//! Canonicalizing constructors.
//!
//! Every constructor returns an expression in canonical form: linear
//! combinations and products are flattened one level, operands sharing an
//! ESHash are merged, constants are folded into a single trailing operand and
//! trivial nodes collapse to their only operand.  As a consequence
//! `x + 0` returns `x` itself and `x * x` is the same node as `x.square()`.

use std::sync::Arc;

use hashbrown::HashMap;
use itertools::{izip, Itertools};
use plonky2::field::extension::Extendable;
use plonky2::field::types::Field;
use plonky2::hash::hash_types::RichField;

use crate::expr::{coefficient, Expr, Operator};
use crate::metadata::Metadata;

/// Operands merged by ESHash, kept in first-seen order.
struct Accumulator<F: RichField + Extendable<D>, const D: usize, W> {
    operands: Vec<(Expr<F, D>, W)>,
    positions: HashMap<F::Extension, usize>,
}

impl<F: RichField + Extendable<D>, const D: usize, W: Copy> Accumulator<F, D, W> {
    fn new() -> Self {
        Self {
            operands: Vec::new(),
            positions: HashMap::new(),
        }
    }

    fn push(&mut self, operand: &Expr<F, D>, weight: W, merge: impl FnOnce(W, W) -> W) {
        match self.positions.get(&operand.hash()) {
            Some(&i) => self.operands[i].1 = merge(self.operands[i].1, weight),
            None => {
                self.positions.insert(operand.hash(), self.operands.len());
                self.operands.push((operand.clone(), weight));
            }
        }
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Expr<F, D> {
    pub fn constant(value: F::Extension) -> Self {
        Self::new_node(Operator::Constant(value), vec![])
    }

    pub fn zero() -> Self {
        Self::constant(F::Extension::ZERO)
    }

    pub fn one() -> Self {
        Self::constant(F::Extension::ONE)
    }

    pub fn variable(metadata: impl Metadata + 'static) -> Self {
        Self::from_metadata(Arc::new(metadata))
    }

    pub fn from_metadata(metadata: Arc<dyn Metadata>) -> Self {
        Self::new_node(Operator::Variable(metadata), vec![])
    }

    /// `Σ coeffs[i] · terms[i]` in canonical form.
    ///
    /// Panics when the slices are empty or of different lengths, or when a
    /// merged coefficient overflows `i64`.
    pub fn lin_comb(terms: &[Expr<F, D>], coeffs: &[i64]) -> Self {
        assert!(!terms.is_empty(), "linear combination without terms");
        assert_eq!(
            terms.len(),
            coeffs.len(),
            "linear combination with {} terms and {} coefficients",
            terms.len(),
            coeffs.len()
        );

        let checked_add = |a: i64, b: i64| {
            a.checked_add(b)
                .unwrap_or_else(|| panic!("coefficient overflow adding {a} and {b}"))
        };
        let mut constant = F::Extension::ZERO;
        let mut acc = Accumulator::new();
        let mut push = |term: &Expr<F, D>, c: i64| match term.op() {
            Operator::Constant(value) => constant += *value * coefficient(c),
            _ => acc.push(term, c, checked_add),
        };

        for (term, &c) in terms.iter().zip_eq(coeffs) {
            match term.op() {
                Operator::LinComb { coeffs: inner } => {
                    for (t, &ic) in term.children().iter().zip_eq(inner) {
                        let scaled = c.checked_mul(ic).unwrap_or_else(|| {
                            panic!("coefficient overflow multiplying {c} and {ic}")
                        });
                        push(t, scaled);
                    }
                }
                _ => push(term, c),
            }
        }

        let (mut children, mut coeffs): (Vec<_>, Vec<_>) = acc
            .operands
            .into_iter()
            .filter(|&(_, c)| c != 0)
            .unzip();
        if !constant.is_zero() {
            children.push(Self::constant(constant));
            coeffs.push(1);
        }

        match (children.len(), coeffs.first()) {
            (0, _) => Self::zero(),
            (1, Some(1)) => children.swap_remove(0),
            _ => Self::new_node(Operator::LinComb { coeffs }, children),
        }
    }

    /// `Π factors[i] ^ exponents[i]` in canonical form.
    ///
    /// Panics when the slices are empty or of different lengths, or when a
    /// merged exponent overflows `u64`.
    pub fn product(factors: &[Expr<F, D>], exponents: &[u64]) -> Self {
        assert!(!factors.is_empty(), "product without factors");
        assert_eq!(
            factors.len(),
            exponents.len(),
            "product with {} factors and {} exponents",
            factors.len(),
            exponents.len()
        );

        let checked_add = |a: u64, b: u64| {
            a.checked_add(b)
                .unwrap_or_else(|| panic!("exponent overflow adding {a} and {b}"))
        };
        let mut constant = F::Extension::ONE;
        let mut acc = Accumulator::new();
        let mut push = |factor: &Expr<F, D>, e: u64| match factor.op() {
            Operator::Constant(value) => constant *= value.exp_u64(e),
            _ => acc.push(factor, e, checked_add),
        };

        for (factor, &e) in factors.iter().zip_eq(exponents) {
            if e == 0 {
                continue;
            }
            match factor.op() {
                Operator::Product { exponents: inner } => {
                    for (f, &ie) in factor.children().iter().zip_eq(inner) {
                        let scaled = e.checked_mul(ie).unwrap_or_else(|| {
                            panic!("exponent overflow multiplying {e} and {ie}")
                        });
                        push(f, scaled);
                    }
                }
                _ => push(factor, e),
            }
        }

        if constant.is_zero() || acc.operands.iter().any(|(f, _)| f.hash().is_zero()) {
            return Self::zero();
        }
        let (mut children, mut exponents): (Vec<_>, Vec<_>) = acc.operands.into_iter().unzip();
        if constant != F::Extension::ONE {
            children.push(Self::constant(constant));
            exponents.push(1);
        }

        match (children.len(), exponents.first()) {
            (0, _) => Self::one(),
            (1, Some(1)) => children.swap_remove(0),
            _ => Self::new_node(Operator::Product { exponents }, children),
        }
    }

    /// `coeffs[0] + coeffs[1]·x + .. + coeffs[n]·xⁿ`.
    pub fn poly_eval(x: &Expr<F, D>, coeffs: &[Expr<F, D>]) -> Self {
        assert!(!coeffs.is_empty(), "polynomial evaluation without coefficients");
        if coeffs.len() == 1 {
            return coeffs[0].clone();
        }
        let children = core::iter::once(x)
            .chain(coeffs)
            .cloned()
            .collect_vec();
        Self::new_node(Operator::PolyEval, children)
    }

    /// Sum of all terms; zero when there are none.
    pub fn sum(terms: &[Expr<F, D>]) -> Self {
        match terms.is_empty() {
            true => Self::zero(),
            false => Self::lin_comb(terms, &vec![1; terms.len()]),
        }
    }

    pub fn square(&self) -> Self {
        Self::product(core::slice::from_ref(self), &[2])
    }

    /// `self^n` by square-and-multiply.
    pub fn pow(&self, n: u64) -> Self {
        if n == 0 {
            return Self::one();
        }
        let mut result: Option<Self> = None;
        let mut base = self.clone();
        let mut n = n;
        loop {
            if n & 1 == 1 {
                result = Some(match result {
                    None => base.clone(),
                    Some(acc) => Self::product(&[acc, base.clone()], &[1, 1]),
                });
            }
            n >>= 1;
            if n == 0 {
                break;
            }
            base = base.square();
        }
        result.unwrap_or_else(Self::one)
    }

    /// Rebuilds this node over new children, re-canonicalizing on the way.
    pub(crate) fn with_children(&self, children: &[Expr<F, D>]) -> Self {
        match self.op() {
            Operator::Constant(_) | Operator::Variable(_) => self.clone(),
            Operator::LinComb { coeffs } => Self::lin_comb(children, coeffs),
            Operator::Product { exponents } => Self::product(children, exponents),
            Operator::PolyEval => Self::poly_eval(&children[0], &children[1..]),
        }
    }

    /// Factors of a product with their exponents; any other expression is a
    /// single factor with exponent one.
    pub(crate) fn factors(&self) -> Vec<(Expr<F, D>, u64)> {
        match self.op() {
            Operator::Product { exponents } => {
                izip!(self.children().iter().cloned(), exponents.iter().copied()).collect()
            }
            _ => vec![(self.clone(), 1)],
        }
    }
}

impl<F: RichField + Extendable<D>, const D: usize> From<i64> for Expr<F, D> {
    fn from(value: i64) -> Self {
        Self::constant(coefficient(value))
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Default for Expr<F, D> {
    fn default() -> Self {
        Self::zero()
    }
}
