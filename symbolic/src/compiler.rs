//! Lowering of an [`ExpressionBoard`](crate::ExpressionBoard) into a
//! register-allocated program.
//!
//! Slots are assigned by a linear scan over the nodes.  A node's result slot
//! is taken before the slots of its children are released, so an instruction
//! never writes into one of its own operands.

use hashbrown::HashMap;
use itertools::{izip, Itertools};
use log::debug;
use plonky2::field::extension::Extendable;
use plonky2::hash::hash_types::RichField;

use crate::board::Node;
use crate::expr::Operator;

/// One instruction per board node.  Operands are slot indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    LoadConst { dst: usize, constant: usize },
    LoadInput { dst: usize, input: usize },
    Product { dst: usize, factors: Vec<(usize, u64)> },
    LinComb { dst: usize, terms: Vec<(usize, i64)> },
    /// `operands[0]` holds the point, the rest the coefficients.
    PolyEval { dst: usize, operands: Vec<usize> },
}

impl Instruction {
    pub fn dst(&self) -> usize {
        match self {
            Instruction::LoadConst { dst, .. }
            | Instruction::LoadInput { dst, .. }
            | Instruction::Product { dst, .. }
            | Instruction::LinComb { dst, .. }
            | Instruction::PolyEval { dst, .. } => *dst,
        }
    }
}

/// Compiled form of a board.
#[derive(Clone, Debug)]
pub struct Program<F: RichField + Extendable<D>, const D: usize> {
    pub instructions: Vec<Instruction>,
    pub constants: Vec<F::Extension>,
    /// Number of slots live at the same time, at most.
    pub num_slots: usize,
    pub result_slot: usize,
    pub num_inputs: usize,
    /// Length of the board this program was compiled from.
    pub nodes_count: usize,
}

impl<F: RichField + Extendable<D>, const D: usize> Program<F, D> {
    pub fn compile(nodes: &[Node<F, D>]) -> Self {
        let n = nodes.len();
        if n == 0 {
            return Self {
                instructions: vec![],
                constants: vec![],
                num_slots: 0,
                result_slot: 0,
                num_inputs: 0,
                nodes_count: 0,
            };
        }

        // Index of the last node reading each node.  The root is read by a
        // virtual consumer past the end.
        let mut last_use: Vec<Option<usize>> = vec![None; n];
        for (i, node) in nodes.iter().enumerate() {
            for &child in &node.children {
                debug_assert!(child < i, "board is not in dependency order");
                last_use[child] = Some(i);
            }
        }
        last_use[n - 1] = Some(n);

        let mut free = Vec::new();
        let mut num_slots = 0;
        let mut slot_of = vec![0usize; n];
        let mut instructions = Vec::with_capacity(n);
        let mut constants = Vec::new();
        let mut constant_index = HashMap::new();
        let mut num_inputs = 0;

        for (i, node) in nodes.iter().enumerate() {
            let dst = free.pop().unwrap_or_else(|| {
                num_slots += 1;
                num_slots - 1
            });
            slot_of[i] = dst;

            let slots = node.children.iter().map(|&c| slot_of[c]);
            instructions.push(match &node.op {
                Operator::Constant(value) => {
                    let constant = *constant_index.entry(*value).or_insert_with(|| {
                        constants.push(*value);
                        constants.len() - 1
                    });
                    Instruction::LoadConst { dst, constant }
                }
                Operator::Variable(_) => {
                    num_inputs += 1;
                    Instruction::LoadInput {
                        dst,
                        input: num_inputs - 1,
                    }
                }
                Operator::LinComb { coeffs } => Instruction::LinComb {
                    dst,
                    terms: izip!(slots, coeffs.iter().copied()).collect(),
                },
                Operator::Product { exponents } => Instruction::Product {
                    dst,
                    factors: izip!(slots, exponents.iter().copied()).collect(),
                },
                Operator::PolyEval => Instruction::PolyEval {
                    dst,
                    operands: slots.collect(),
                },
            });

            for child in node.children.iter().copied().unique() {
                if last_use[child] == Some(i) {
                    free.push(slot_of[child]);
                }
            }
            if last_use[i].is_none() {
                free.push(dst);
            }
        }

        debug!(
            "compiled {} nodes into {} slots ({} constants, {} inputs)",
            n,
            num_slots,
            constants.len(),
            num_inputs
        );

        Self {
            instructions,
            constants,
            num_slots,
            result_slot: slot_of[n - 1],
            num_inputs,
            nodes_count: n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}
