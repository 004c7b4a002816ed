//! Deduplicated, dependency-ordered view of an expression DAG.

use std::sync::Arc;

use hashbrown::HashMap;
use itertools::Itertools;
use plonky2::field::extension::{Extendable, FieldExtension};
use plonky2::hash::hash_types::RichField;
use plonky2::iop::ext_target::ExtensionTarget;
use plonky2::plonk::circuit_builder::CircuitBuilder;

use crate::circuit::CircuitBuilderEvaluator;
use crate::compiler::Program;
use crate::evaluator::{DegreeEvaluator, Evaluator};
use crate::expr::{Expr, Operator};
use crate::metadata::Metadata;
use crate::vm::{self, Evaluation, VectorView};

/// An expression flattened into a node array.  Children always come before
/// their parents.
#[derive(Clone, Debug)]
pub struct Node<F: RichField + Extendable<D>, const D: usize> {
    pub hash: F::Extension,
    pub op: Operator<F, D>,
    pub children: Vec<usize>,
}

/// Nodes of one or more expressions, with one node per distinct ESHash.
///
/// The last node is the root.  Compilation is done lazily and cached until
/// the board grows.
#[derive(Clone, Debug)]
pub struct ExpressionBoard<F: RichField + Extendable<D>, const D: usize> {
    nodes: Vec<Node<F, D>>,
    positions: HashMap<F::Extension, usize>,
    program: Option<Program<F, D>>,
}

impl<F: RichField + Extendable<D>, const D: usize> Default for ExpressionBoard<F, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: RichField + Extendable<D>, const D: usize> ExpressionBoard<F, D> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            positions: HashMap::new(),
            program: None,
        }
    }

    /// Adds `expr` and all its sub-expressions that are not on the board yet,
    /// returning the index of its node.
    pub fn anchor(&mut self, expr: &Expr<F, D>) -> usize {
        if let Some(index) = self.position(expr) {
            return index;
        }
        let children = expr
            .children()
            .iter()
            .map(|child| self.anchor(child))
            .collect_vec();
        let index = self.nodes.len();
        self.nodes.push(Node {
            hash: expr.hash(),
            op: expr.op().clone(),
            children,
        });
        self.positions.insert(expr.hash(), index);
        index
    }

    pub fn nodes(&self) -> &[Node<F, D>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<usize> {
        self.nodes.len().checked_sub(1)
    }

    pub fn position(&self, expr: &Expr<F, D>) -> Option<usize> {
        self.positions.get(&expr.hash()).copied()
    }

    /// Metadata of every variable, in the order evaluation expects inputs.
    pub fn list_variable_metadata(&self) -> Vec<Arc<dyn Metadata>> {
        self.nodes
            .iter()
            .filter_map(|node| match &node.op {
                Operator::Variable(metadata) => Some(metadata.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn num_variables(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node.op, Operator::Variable(_)))
            .count()
    }

    /// The compiled program, rebuilt if nodes were anchored since the last
    /// compilation.
    pub fn compile(&mut self) -> &Program<F, D> {
        if self
            .program
            .as_ref()
            .is_some_and(|program| program.nodes_count != self.nodes.len())
        {
            self.program = None;
        }
        let nodes = &self.nodes;
        self.program.get_or_insert_with(|| Program::compile(nodes))
    }

    /// One forward pass over the nodes.  Variables are resolved by `leaf`
    /// from their position among the variables and their metadata.
    fn forward<V: Clone, E: Evaluator<F, D, V>>(
        &self,
        evaluator: &mut E,
        mut leaf: impl FnMut(usize, &dyn Metadata) -> V,
    ) -> V {
        assert!(!self.is_empty(), "cannot evaluate an empty board");
        let mut values: Vec<V> = Vec::with_capacity(self.nodes.len());
        let mut next_input = 0;
        for node in &self.nodes {
            let args = node.children.iter().map(|&c| values[c].clone()).collect_vec();
            let value = evaluator.apply(&node.op, &args, &mut |metadata| {
                next_input += 1;
                leaf(next_input - 1, metadata)
            });
            values.push(value);
        }
        values.swap_remove(self.nodes.len() - 1)
    }

    /// Evaluates the root with any [`Evaluator`]; variables take the values
    /// of `inputs` in [`Self::list_variable_metadata`] order.
    pub fn eval_with<V: Clone, E: Evaluator<F, D, V>>(
        &self,
        evaluator: &mut E,
        inputs: &[V],
    ) -> V {
        assert_eq!(
            inputs.len(),
            self.num_variables(),
            "expected {} inputs, one per variable, got {}",
            self.num_variables(),
            inputs.len()
        );
        self.forward(evaluator, |i, _| inputs[i].clone())
    }

    /// Degree of the root given the degree of each variable.
    pub fn degree(&self, degree_of: impl Fn(&dyn Metadata) -> usize) -> usize {
        self.forward(&mut DegreeEvaluator, |_, metadata| degree_of(metadata))
    }

    /// Evaluates the root over base-field columns.  Panics if a constant lies
    /// outside the base field.
    pub fn evaluate(&mut self, inputs: &[&dyn VectorView<F>]) -> Evaluation<F> {
        let program = self.compile();
        let constants = program
            .constants
            .iter()
            .map(|value| {
                assert!(
                    value.is_in_basefield(),
                    "constant {value} is not in the base field"
                );
                value.to_basefield_array()[0]
            })
            .collect_vec();
        vm::run::<F, D, F>(program, &constants, inputs)
    }

    /// Evaluates the root over extension-field columns.
    pub fn evaluate_ext(
        &mut self,
        inputs: &[&dyn VectorView<F::Extension>],
    ) -> Evaluation<F::Extension> {
        let program = self.compile();
        vm::run::<F, D, F::Extension>(program, &program.constants, inputs)
    }

    /// Lays the root out as constraints on `builder`.
    pub fn eval_circuit(
        &self,
        builder: &mut CircuitBuilder<F, D>,
        inputs: &[ExtensionTarget<D>],
    ) -> ExtensionTarget<D> {
        self.eval_with(&mut CircuitBuilderEvaluator { builder }, inputs)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use hashbrown::HashSet;
    use plonky2::field::types::{Field, Sample};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::evaluator::{Caching, Counting, PureEvaluator};
    use crate::test_utils::{init_logger, var, E, F};
    use crate::vm::{ConstantVector, Lifted};

    type Ext = <F as Extendable<2>>::Extension;

    #[test]
    fn shared_subexpressions_are_anchored_once() {
        let (x, y) = (var("x"), var("y"));
        let shared = &x + 2 * &y;
        let e = &shared * &x + &shared * &y + shared.pow(3);
        let board = e.board();
        let occurrences = board
            .nodes()
            .iter()
            .filter(|node| node.hash == shared.hash())
            .count();
        assert_eq!(occurrences, 1);
        assert_eq!(board.num_variables(), 2);

        let distinct: HashSet<_> = board.nodes().iter().map(|node| node.hash).collect();
        assert_eq!(distinct.len(), board.len());
    }

    #[test]
    fn children_come_first() {
        let (x, y) = (var("x"), var("y"));
        let e = E::poly_eval(&x, &[y.clone(), &x * &y, y.square()]) + x.pow(4);
        let board = e.board();
        for (i, node) in board.nodes().iter().enumerate() {
            assert!(node.children.iter().all(|&c| c < i));
        }
        assert_eq!(board.root(), Some(board.len() - 1));
        assert_eq!(board.nodes()[board.len() - 1].hash, e.hash());
    }

    #[test]
    fn sum_of_two_variables() -> Result<()> {
        init_logger();
        let e = var("x") + var("y");
        let mut board = e.board();
        let names = board.list_variable_metadata().iter().map(|m| m.id()).collect_vec();
        assert_eq!(names, vec!["x", "y"]);
        let x = vec![F::from_canonical_u64(2)];
        let y = vec![F::from_canonical_u64(3)];
        let result = board.evaluate(&[&x, &y]);
        assert_eq!(result.into_vec(), vec![F::from_canonical_u64(5)]);
        Ok(())
    }

    #[test]
    fn sum_of_squares_over_long_vectors() -> Result<()> {
        init_logger();
        let (x, y) = (var("x"), var("y"));
        let mut board = (x.square() + y.square()).board();
        let xs = vec![F::from_canonical_u64(2); 1024];
        let ys = vec![F::from_canonical_u64(3); 1024];
        let result = board.evaluate(&[&xs, &ys]);
        assert!(matches!(result, Evaluation::Regular(_)));
        assert_eq!(result.into_vec(), vec![F::from_canonical_u64(13); 1024]);

        let (x1, y1) = (xs[..1].to_vec(), ys[..1].to_vec());
        let single = board.evaluate(&[&x1, &y1]);
        assert_eq!(single.get(0), F::from_canonical_u64(13));
        Ok(())
    }

    #[test]
    fn extension_evaluation_mixes_lifted_columns() {
        let mut rng = StdRng::seed_from_u64(3);
        let (x, alpha) = (var("x"), var("alpha"));
        let gamma = Ext::sample(&mut rng);
        let mut board = (&x * &alpha + E::constant(gamma)).board();
        let xs = (0..2 * crate::CHUNK_SIZE)
            .map(|_| F::sample(&mut rng))
            .collect_vec();
        let a = Ext::sample(&mut rng);
        let lifted = Lifted::<F, 2>::new(&xs);
        let alphas = ConstantVector {
            value: a,
            len: xs.len(),
        };
        let result = board.evaluate_ext(&[&lifted, &alphas]).into_vec();
        for (value, &x) in result.iter().zip(&xs) {
            assert_eq!(*value, Ext::from_basefield(x) * a + gamma);
        }
    }

    #[test]
    #[should_panic(expected = "not in the base field")]
    fn base_evaluation_rejects_extension_constants() {
        let gamma = Ext::from_basefield_array([F::ONE, F::ONE]);
        let mut board = (var("x") + E::constant(gamma)).board();
        board.evaluate(&[&vec![F::ONE]]);
    }

    #[test]
    fn anchoring_more_invalidates_the_program() {
        let (x, y) = (var("x"), var("y"));
        let mut board = (&x * &x).board();
        assert_eq!(board.compile().num_inputs, 1);
        let before = board.compile().nodes_count;

        board.anchor(&(&x * &y + 1));
        let program = board.compile();
        assert_eq!(program.num_inputs, 2);
        assert!(program.nodes_count > before);

        let xs = vec![F::from_canonical_u64(4)];
        let ys = vec![F::from_canonical_u64(5)];
        assert_eq!(board.evaluate(&[&xs, &ys]).get(0), F::from_canonical_u64(21));
    }

    #[test]
    fn board_agrees_with_tree_evaluation() {
        let mut rng = StdRng::seed_from_u64(99);
        let vars = ["a", "b", "c"].map(var);
        let e = (&vars[0] - &vars[1]).pow(3) * &vars[2]
            + E::poly_eval(&vars[2], &[vars[0].clone(), E::from(5), &vars[0] * &vars[1]])
            - 17;
        let board = e.board();
        let values = [0; 3].map(|_| F::sample(&mut rng));
        let names = board.list_variable_metadata().iter().map(|m| m.id()).collect_vec();
        let inputs = names
            .iter()
            .map(|name| values[["a", "b", "c"].iter().position(|v| *v == name.as_str()).unwrap()])
            .collect_vec();

        let mut base = PureEvaluator::<F, 2, F>::base();
        let on_board = board.eval_with(&mut base, &inputs);
        let on_tree = base.eval(&e, &mut |m| {
            values[["a", "b", "c"].iter().position(|v| *v == m.id()).unwrap()]
        });
        assert_eq!(on_board, on_tree);
    }

    #[test]
    fn board_visits_each_node_once() {
        let mut e = var("x");
        for _ in 0..30 {
            e = &e * &e + &e;
        }
        let board = e.board();
        assert_eq!(board.len(), 1 + 2 * 30);
        let mut counting = Counting::new(DegreeEvaluator);
        assert_eq!(board.eval_with(&mut counting, &[1usize]), 1 << 30);
        assert_eq!(counting.count(), 2 * 30);

        let mut caching = Caching::<F, 2, usize, _>::from(DegreeEvaluator);
        assert_eq!(caching.eval(&e, &mut |_| 1), board.degree(|_| 1));
    }

    #[test]
    fn degree_of_board() {
        let (x, y, z) = (var("x"), var("y"), var("z"));
        let e = x.pow(3) * &y + E::poly_eval(&z, &[x.clone(), y.square()]) + 11;
        let board = e.board();
        assert_eq!(board.degree(|_| 1), 4);
        assert_eq!(board.degree(|m| if m.id() == "z" { 5 } else { 1 }), 5);
        assert_eq!(board.degree(|_| 1), e.degree(|_| 1));
    }
}
