//! Symbolic expressions for polynomial-IOP constraint systems.
//!
//! Expressions are built through canonicalizing constructors (or the usual
//! `+`, `-`, `*` operators) and carry a semantic hash, the ESHash, which is the
//! value of the expression at a random point.  Two expressions with the same
//! ESHash are interchangeable, which is what lets an [`ExpressionBoard`]
//! deduplicate a whole expression DAG.
//!
//! The pipeline is
//!
//! - [`Expr`] trees, built bottom-up and shared through `Arc`s,
//! - [`Expr::board`], which anchors the tree into a topologically ordered
//!   [`ExpressionBoard`],
//! - [`ExpressionBoard::compile`], which lowers the board into a
//!   register-allocated [`Program`],
//! - [`ExpressionBoard::evaluate`] / [`ExpressionBoard::evaluate_ext`], which
//!   run the program chunk by chunk, in parallel, over column vectors,
//! - [`ExpressionBoard::degree`] and [`ExpressionBoard::eval_circuit`] for
//!   degree analysis and in-circuit evaluation.
//!
//! [`reduce_degree_of_expressions`] rewrites a batch of expressions so that
//! they all fit a degree bound, by naming shared sub-expressions with fresh
//! variables.
//!
//! All field arithmetic is delegated to `plonky2::field`.  ESHashes and
//! constants live in the extension field `F::Extension`.

pub mod board;
pub mod canonical;
pub mod circuit;
pub mod compiler;
pub mod degree_reduction;
pub mod evaluator;
pub mod expr;
pub mod metadata;
pub mod ops;
pub mod vm;

pub use board::{ExpressionBoard, Node};
pub use compiler::{Instruction, Program};
pub use degree_reduction::{
    reduce_degree_of_expressions, DegreeReduction, DegreeReductionConfig, EliminatedVariable,
    SubMultisets,
};
pub use evaluator::{Caching, Counting, DegreeEvaluator, Evaluator, PureEvaluator};
pub use expr::{ESHash, Expr, ExprTree, Operator};
pub use metadata::Metadata;
pub use vm::{ConstantVector, Evaluation, Lifted, VectorView, CHUNK_SIZE};
