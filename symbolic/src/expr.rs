//! Canonical expression trees identified by their semantic hash.

use core::fmt::{self, Debug};
use core::hash::Hash;
use std::sync::Arc;

use anyhow::{ensure, Result};
use hashbrown::HashSet;
use itertools::{EitherOrBoth, Itertools};
use plonky2::field::extension::{Extendable, FieldExtension};
use plonky2::field::types::Field;
use plonky2::hash::hash_types::{RichField, NUM_HASH_OUT_ELTS};
use plonky2::hash::poseidon::PoseidonHash;
use plonky2::plonk::config::Hasher;

use crate::board::ExpressionBoard;
use crate::evaluator::{Caching, DegreeEvaluator, Evaluator, PureEvaluator};
use crate::metadata::Metadata;

/// Semantic hash of an expression: its value at a fixed pseudo-random point.
pub type ESHash<F, const D: usize> = <F as Extendable<D>>::Extension;

/// What a node computes from its children.
#[derive(Clone, Debug)]
pub enum Operator<F: RichField + Extendable<D>, const D: usize> {
    Constant(F::Extension),
    Variable(Arc<dyn Metadata>),
    /// `Σ coeffs[i] · children[i]`
    LinComb { coeffs: Vec<i64> },
    /// `Π children[i] ^ exponents[i]`
    Product { exponents: Vec<u64> },
    /// `children[0]` is the point `x`, the remaining children are the
    /// coefficients `c0, c1, ..` of `c0 + c1·x + c2·x² + ..`.
    PolyEval,
}

impl<F: RichField + Extendable<D>, const D: usize> Operator<F, D> {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Constant(_) => "Constant",
            Operator::Variable(_) => "Variable",
            Operator::LinComb { .. } => "LinComb",
            Operator::Product { .. } => "Product",
            Operator::PolyEval => "PolyEval",
        }
    }
}

/// Node of an expression tree.  Only reachable through [`Expr`].
pub struct ExprTree<F: RichField + Extendable<D>, const D: usize> {
    pub(crate) hash: F::Extension,
    pub(crate) op: Operator<F, D>,
    pub(crate) children: Vec<Expr<F, D>>,
    pub(crate) is_base: bool,
}

/// Shared handle on an immutable [`ExprTree`].
///
/// Equality and hashing go through the ESHash, so two expressions built
/// independently but equal as polynomials compare equal.
#[derive(Clone)]
pub struct Expr<F: RichField + Extendable<D>, const D: usize>(pub(crate) Arc<ExprTree<F, D>>);

impl<F: RichField + Extendable<D>, const D: usize> PartialEq for Expr<F, D> {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Eq for Expr<F, D> {}

impl<F: RichField + Extendable<D>, const D: usize> Hash for Expr<F, D> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.hash().hash(state);
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Debug for Expr<F, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let children = self.children();
        match self.op() {
            Operator::Constant(value) => match value.is_in_basefield() {
                true => write!(f, "{}", value.to_basefield_array()[0]),
                false => write!(f, "{value}"),
            },
            Operator::Variable(metadata) => write!(f, "{}", metadata.id()),
            Operator::LinComb { coeffs } => {
                write!(f, "(")?;
                for (i, pair) in children.iter().zip_longest(coeffs).enumerate() {
                    if i > 0 {
                        write!(f, " + ")?;
                    }
                    match pair {
                        EitherOrBoth::Both(child, 1) => write!(f, "{child:?}")?,
                        EitherOrBoth::Both(child, coeff) => write!(f, "{coeff}*{child:?}")?,
                        EitherOrBoth::Left(child) => write!(f, "?*{child:?}")?,
                        EitherOrBoth::Right(coeff) => write!(f, "{coeff}*?")?,
                    }
                }
                write!(f, ")")
            }
            Operator::Product { exponents } => {
                for (i, pair) in children.iter().zip_longest(exponents).enumerate() {
                    if i > 0 {
                        write!(f, "*")?;
                    }
                    match pair {
                        EitherOrBoth::Both(child, 1) => write!(f, "{child:?}")?,
                        EitherOrBoth::Both(child, exponent) => write!(f, "{child:?}^{exponent}")?,
                        EitherOrBoth::Left(child) => write!(f, "{child:?}^?")?,
                        EitherOrBoth::Right(exponent) => write!(f, "?^{exponent}")?,
                    }
                }
                Ok(())
            }
            Operator::PolyEval => match children.split_first() {
                Some((x, coeffs)) => write!(f, "PolyEval({x:?}; {coeffs:?})"),
                None => write!(f, "PolyEval()"),
            },
        }
    }
}

/// Maps a signed coefficient into any field.
pub(crate) fn coefficient<T: Field>(c: i64) -> T {
    let magnitude = T::from_noncanonical_u64(c.unsigned_abs());
    if c < 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// ESHash of a variable: Poseidon over the identity bytes, seven bytes per
/// element behind a length prefix.
pub(crate) fn variable_hash<F: RichField + Extendable<D>, const D: usize>(
    id: &str,
) -> F::Extension {
    let bytes = id.as_bytes();
    let inputs = core::iter::once(F::from_canonical_usize(bytes.len()))
        .chain(bytes.chunks(7).map(|chunk| {
            F::from_canonical_u64(
                chunk
                    .iter()
                    .rev()
                    .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte)),
            )
        }))
        .collect_vec();
    let digest = PoseidonHash::hash_no_pad(&inputs);
    F::Extension::from_basefield_array(core::array::from_fn(|i| {
        digest.elements[i % NUM_HASH_OUT_ELTS]
    }))
}

fn compute_hash<F: RichField + Extendable<D>, const D: usize>(
    op: &Operator<F, D>,
    children: &[Expr<F, D>],
) -> F::Extension {
    let hashes = children.iter().map(Expr::hash).collect_vec();
    PureEvaluator::<F, D, F::Extension>::extension().apply(op, &hashes, &mut |metadata| {
        variable_hash::<F, D>(&metadata.id())
    })
}

fn compute_is_base<F: RichField + Extendable<D>, const D: usize>(
    op: &Operator<F, D>,
    children: &[Expr<F, D>],
) -> bool {
    match op {
        Operator::Constant(value) => value.is_in_basefield(),
        Operator::Variable(metadata) => metadata.is_base(),
        _ => children.iter().all(Expr::is_base),
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Expr<F, D> {
    /// Builds a node with exactly the given operator and children.  Callers
    /// are responsible for canonical form.
    pub(crate) fn new_node(op: Operator<F, D>, children: Vec<Expr<F, D>>) -> Self {
        let hash = compute_hash(&op, &children);
        let is_base = compute_is_base(&op, &children);
        Expr(Arc::new(ExprTree {
            hash,
            op,
            children,
            is_base,
        }))
    }

    /// Assembles a node from caller supplied parts without any checking or
    /// canonicalization.  Use [`Expr::validate`] to check the result.
    pub fn from_raw_parts(
        hash: F::Extension,
        op: Operator<F, D>,
        children: Vec<Expr<F, D>>,
    ) -> Self {
        let is_base = compute_is_base(&op, &children);
        Expr(Arc::new(ExprTree {
            hash,
            op,
            children,
            is_base,
        }))
    }

    pub fn hash(&self) -> F::Extension {
        self.0.hash
    }

    pub fn op(&self) -> &Operator<F, D> {
        &self.0.op
    }

    pub fn children(&self) -> &[Expr<F, D>] {
        &self.0.children
    }

    /// Whether the expression provably takes its values in the base field.
    pub fn is_base(&self) -> bool {
        self.0.is_base
    }

    pub fn as_constant(&self) -> Option<F::Extension> {
        match self.op() {
            Operator::Constant(value) => Some(*value),
            _ => None,
        }
    }

    pub fn metadata(&self) -> Option<&Arc<dyn Metadata>> {
        match self.op() {
            Operator::Variable(metadata) => Some(metadata),
            _ => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children().is_empty()
    }

    /// Whether both handles point at the same allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Degree of the expression, given the degree of each variable.
    pub fn degree(&self, degree_of: impl Fn(&dyn Metadata) -> usize) -> usize {
        Caching::<F, D, usize, _>::from(DegreeEvaluator)
            .eval(self, &mut |metadata| degree_of(metadata))
    }

    /// Anchors the expression into a fresh [`ExpressionBoard`].
    pub fn board(&self) -> ExpressionBoard<F, D> {
        let mut board = ExpressionBoard::new();
        board.anchor(self);
        board
    }

    /// Recomputes every hash and checks operator arities across the tree.
    pub fn validate(&self) -> Result<()> {
        let mut visited = HashSet::new();
        self.validate_inner(&mut visited)
    }

    fn validate_inner(&self, visited: &mut HashSet<usize>) -> Result<()> {
        if !visited.insert(Arc::as_ptr(&self.0) as usize) {
            return Ok(());
        }
        for child in self.children() {
            child.validate_inner(visited)?;
        }
        let arity = self.children().len();
        match self.op() {
            Operator::Constant(_) | Operator::Variable(_) => {
                ensure!(
                    arity == 0,
                    "{} node must not have children, found {arity}",
                    self.op().name()
                );
            }
            Operator::LinComb { coeffs } => {
                ensure!(arity > 0, "LinComb node without operands");
                ensure!(
                    coeffs.len() == arity,
                    "LinComb node has {} coefficients for {arity} children",
                    coeffs.len()
                );
            }
            Operator::Product { exponents } => {
                ensure!(arity > 0, "Product node without operands");
                ensure!(
                    exponents.len() == arity,
                    "Product node has {} exponents for {arity} children",
                    exponents.len()
                );
            }
            Operator::PolyEval => {
                ensure!(
                    arity >= 2,
                    "PolyEval node needs a point and at least one coefficient, found {arity} children"
                );
            }
        }
        let expected = compute_hash(self.op(), self.children());
        ensure!(
            expected == self.hash(),
            "{} node carries ESHash {} but its operands give {}",
            self.op().name(),
            self.hash(),
            expected
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use plonky2::field::types::Field;

    use super::*;
    use crate::test_utils::{var, E, F};

    fn fingerprint(expr: &E) -> u64 {
        use core::hash::Hasher as _;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        Hash::hash(expr, &mut hasher);
        hasher.finish()
    }

    #[test]
    fn variables_hash_by_identity() {
        let x = var("x");
        assert_eq!(x, var("x"));
        assert_ne!(x, var("y"));
        assert_eq!(x.hash(), Expr::<F, 2>::variable(String::from("x")).hash());
        assert_eq!(fingerprint(&x), fingerprint(&var("x")));
        // Identities differing only past the first packed element.
        assert_ne!(var("columns_a"), var("columns_b"));
    }

    #[test]
    fn constants_hash_to_their_value() {
        let c = E::from(7);
        assert_eq!(
            c.hash(),
            <F as Extendable<2>>::Extension::from_canonical_u64(7)
        );
        assert!(c.is_base());
        assert!(c.is_leaf());
    }

    #[test]
    fn well_formed_expressions_validate() -> Result<()> {
        let (x, y) = (var("x"), var("y"));
        let e = (&x + &y) * (&x - 3) + Expr::poly_eval(&x, &[y.clone(), E::from(2), x.clone()]);
        e.validate()
    }

    #[test]
    fn validate_rejects_tampered_hash() {
        let x = var("x");
        let y = var("y");
        let tampered = Expr::from_raw_parts(
            x.hash(),
            Operator::LinComb { coeffs: vec![1, 1] },
            vec![x.clone(), y.clone()],
        );
        assert!(tampered.validate().is_err());

        // Corruption deep in the tree is found too.
        let wrapped = Expr::new_node(
            Operator::Product {
                exponents: vec![1, 2],
            },
            vec![tampered, x],
        );
        assert!(wrapped.validate().is_err());
    }

    #[test]
    fn validate_rejects_arity_mismatch() {
        let (x, y) = (var("x"), var("y"));
        let bad = Expr::from_raw_parts(
            x.hash(),
            Operator::LinComb { coeffs: vec![1] },
            vec![x.clone(), y.clone()],
        );
        let err = bad.validate().unwrap_err();
        assert!(err.to_string().contains("coefficients"));

        let bad = Expr::from_raw_parts(x.hash(), Operator::PolyEval, vec![x.clone()]);
        assert!(bad.validate().is_err());

        let bad = Expr::from_raw_parts(x.hash(), Operator::Variable(Arc::new("x")), vec![y]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn malformed_nodes_still_print() {
        let (x, y) = (var("x"), var("y"));
        let short = Expr::from_raw_parts(
            x.hash(),
            Operator::LinComb { coeffs: vec![3] },
            vec![x.clone(), y.clone()],
        );
        assert!(short.validate().is_err());
        assert_eq!(format!("{short:?}"), "(3*x + ?*y)");

        let long = Expr::from_raw_parts(
            x.hash(),
            Operator::Product {
                exponents: vec![2, 5],
            },
            vec![y.clone()],
        );
        assert_eq!(format!("{long:?}"), "y^2*?^5");

        let empty = E::from_raw_parts(x.hash(), Operator::PolyEval, vec![]);
        assert!(empty.validate().is_err());
        assert_eq!(format!("{empty:?}"), "PolyEval()");
    }

    #[test]
    fn base_flag_follows_operands() {
        #[derive(Debug)]
        struct ExtensionColumn;
        impl Metadata for ExtensionColumn {
            fn id(&self) -> String {
                "challenge".to_owned()
            }
            fn is_base(&self) -> bool {
                false
            }
        }

        let x = var("x");
        let alpha = Expr::variable(ExtensionColumn);
        assert!((&x * &x + 1).is_base());
        assert!(!(&x * &alpha).is_base());
        let gamma = <F as Extendable<2>>::Extension::from_basefield_array([F::ONE, F::ONE]);
        assert!(!Expr::constant(gamma).is_base());
    }

    #[test]
    fn degree_of_tree() {
        let (x, y) = (var("x"), var("y"));
        let e = x.pow(3) * &y + &y * 5 + 1;
        assert_eq!(e.degree(|_| 1), 4);
        assert_eq!(e.degree(|m| if m.id() == "x" { 2 } else { 1 }), 7);
        assert_eq!(E::from(9).degree(|_| 1), 0);
    }

    #[test]
    #[should_panic(expected = "degree overflow")]
    fn degree_overflow_is_reported() {
        var("x").pow(1 << 40).degree(|_| 1 << 30);
    }
}
