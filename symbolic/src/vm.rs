//! Chunked, data-parallel execution of a [`Program`] over column vectors.
//!
//! Inputs are consumed `CHUNK_SIZE` rows at a time.  Every worker owns an
//! `Arena` of `num_slots` rows of scratch values and writes its results into
//! a disjoint range of the output.

use core::marker::PhantomData;
use core::mem;

use log::debug;
use plonky2::field::extension::{Extendable, FieldExtension};
use plonky2::field::types::Field;
use plonky2::hash::hash_types::RichField;
use static_assertions::const_assert;
use symbolic_maybe_rayon::*;

use crate::compiler::{Instruction, Program};
use crate::expr::coefficient;

/// Number of rows evaluated together by one worker.
pub const CHUNK_SIZE: usize = 1 << 7;
const_assert!(CHUNK_SIZE.is_power_of_two());

/// Read-only access to a column of values.
pub trait VectorView<T>: Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `dst.len()` values starting at row `start` into `dst`.
    fn write_chunk(&self, start: usize, dst: &mut [T]);

    /// The value of every row, if the column is constant.
    fn constant_value(&self) -> Option<T> {
        None
    }
}

impl<T: Copy + Sync> VectorView<T> for [T] {
    fn len(&self) -> usize {
        <[T]>::len(self)
    }

    fn write_chunk(&self, start: usize, dst: &mut [T]) {
        dst.copy_from_slice(&self[start..start + dst.len()]);
    }
}

impl<T: Copy + Sync> VectorView<T> for Vec<T> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn write_chunk(&self, start: usize, dst: &mut [T]) {
        self.as_slice().write_chunk(start, dst);
    }
}

/// `len` copies of one value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConstantVector<T> {
    pub value: T,
    pub len: usize,
}

impl<T: Copy + Sync> VectorView<T> for ConstantVector<T> {
    fn len(&self) -> usize {
        self.len
    }

    fn write_chunk(&self, _start: usize, dst: &mut [T]) {
        dst.fill(self.value);
    }

    fn constant_value(&self) -> Option<T> {
        Some(self.value)
    }
}

/// A base-field column read as extension-field values.
pub struct Lifted<'a, F: RichField + Extendable<D>, const D: usize> {
    inner: &'a dyn VectorView<F>,
    _marker: PhantomData<F::Extension>,
}

impl<'a, F: RichField + Extendable<D>, const D: usize> Lifted<'a, F, D> {
    pub fn new(inner: &'a dyn VectorView<F>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<'a, F: RichField + Extendable<D>, const D: usize> VectorView<F::Extension>
    for Lifted<'a, F, D>
{
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn write_chunk(&self, start: usize, dst: &mut [F::Extension]) {
        let mut buffer = [F::ZERO; CHUNK_SIZE];
        for (i, block) in dst.chunks_mut(CHUNK_SIZE).enumerate() {
            let lanes = &mut buffer[..block.len()];
            self.inner.write_chunk(start + i * CHUNK_SIZE, lanes);
            for (d, &value) in block.iter_mut().zip(lanes.iter()) {
                *d = F::Extension::from_basefield(value);
            }
        }
    }

    fn constant_value(&self) -> Option<F::Extension> {
        self.inner
            .constant_value()
            .map(F::Extension::from_basefield)
    }
}

/// Result of evaluating a board over vectors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Evaluation<T> {
    Regular(Vec<T>),
    /// Every input was constant, so is the result.
    Constant { value: T, len: usize },
}

impl<T: Copy> Evaluation<T> {
    pub fn len(&self) -> usize {
        match self {
            Evaluation::Regular(values) => values.len(),
            Evaluation::Constant { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, row: usize) -> T {
        match self {
            Evaluation::Regular(values) => values[row],
            Evaluation::Constant { value, len } => {
                assert!(row < *len, "row {row} out of range for length {len}");
                *value
            }
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            Evaluation::Regular(values) => values,
            Evaluation::Constant { value, len } => vec![value; len],
        }
    }
}

/// Scratch rows of one worker, indexed by slot.
#[derive(Debug)]
pub(crate) struct Arena<T> {
    slots: Vec<Vec<T>>,
}

impl<T: Field> Arena<T> {
    fn new(num_slots: usize, width: usize) -> Self {
        Self {
            slots: vec![vec![T::ZERO; width]; num_slots],
        }
    }

    /// Runs the program over rows `start..start + out.len()`.
    fn execute(
        &mut self,
        instructions: &[Instruction],
        constants: &[T],
        inputs: &[&dyn VectorView<T>],
        start: usize,
        result_slot: usize,
        out: &mut [T],
    ) {
        for instruction in instructions {
            let dst = instruction.dst();
            let mut row = mem::take(&mut self.slots[dst]);
            match instruction {
                Instruction::LoadConst { constant, .. } => row.fill(constants[*constant]),
                Instruction::LoadInput { input, .. } => {
                    inputs[*input].write_chunk(start, &mut row)
                }
                Instruction::LinComb { terms, .. } => {
                    row.fill(T::ZERO);
                    for &(slot, c) in terms {
                        let src = &self.slots[slot];
                        match c {
                            0 => {}
                            1 => row.iter_mut().zip(src).for_each(|(r, &s)| *r += s),
                            -1 => row.iter_mut().zip(src).for_each(|(r, &s)| *r -= s),
                            2 => row.iter_mut().zip(src).for_each(|(r, &s)| *r += s.double()),
                            _ => {
                                let c = coefficient::<T>(c);
                                row.iter_mut().zip(src).for_each(|(r, &s)| *r += c * s);
                            }
                        }
                    }
                }
                Instruction::Product { factors, .. } => {
                    row.fill(T::ONE);
                    for &(slot, e) in factors {
                        let src = &self.slots[slot];
                        match e {
                            1 => row.iter_mut().zip(src).for_each(|(r, &s)| *r *= s),
                            2 => row.iter_mut().zip(src).for_each(|(r, &s)| *r *= s.square()),
                            _ => row.iter_mut().zip(src).for_each(|(r, &s)| *r *= s.exp_u64(e)),
                        }
                    }
                }
                Instruction::PolyEval { operands, .. } => {
                    let (x, coeffs) = operands
                        .split_first()
                        .unwrap_or_else(|| panic!("PolyEval without an evaluation point"));
                    row.fill(T::ZERO);
                    for &coeff in coeffs.iter().rev() {
                        for (lane, r) in row.iter_mut().enumerate() {
                            *r = *r * self.slots[*x][lane] + self.slots[coeff][lane];
                        }
                    }
                }
            }
            self.slots[dst] = row;
        }
        out.copy_from_slice(&self.slots[result_slot][..out.len()]);
    }
}

/// Evaluates `program` over `inputs`, positionally matched with the
/// program's variables.  `constants` is the constant pool already converted
/// to `T`.
pub(crate) fn run<F, const D: usize, T>(
    program: &Program<F, D>,
    constants: &[T],
    inputs: &[&dyn VectorView<T>],
) -> Evaluation<T>
where
    F: RichField + Extendable<D>,
    T: Field,
{
    assert_eq!(
        inputs.len(),
        program.num_inputs,
        "expected {} inputs, one per variable, got {}",
        program.num_inputs,
        inputs.len()
    );
    assert!(!inputs.is_empty(), "evaluation needs at least one input");
    let len = inputs[0].len();
    assert!(len > 0, "inputs must not be empty");
    for (i, input) in inputs.iter().enumerate() {
        assert_eq!(
            input.len(),
            len,
            "input {i} has length {} but input 0 has length {len}",
            input.len()
        );
    }

    let constant_inputs: Option<Vec<ConstantVector<T>>> = inputs
        .iter()
        .map(|input| input.constant_value().map(|value| ConstantVector { value, len: 1 }))
        .collect();
    if let Some(constant_inputs) = constant_inputs {
        let views: Vec<&dyn VectorView<T>> =
            constant_inputs.iter().map(|v| v as &dyn VectorView<T>).collect();
        let mut out = [T::ZERO];
        Arena::new(program.num_slots, 1).execute(
            &program.instructions,
            constants,
            &views,
            0,
            program.result_slot,
            &mut out,
        );
        return Evaluation::Constant { value: out[0], len };
    }

    let mut output = vec![T::ZERO; len];
    if len <= CHUNK_SIZE {
        Arena::new(program.num_slots, len).execute(
            &program.instructions,
            constants,
            inputs,
            0,
            program.result_slot,
            &mut output,
        );
        return Evaluation::Regular(output);
    }

    assert_eq!(
        len % CHUNK_SIZE,
        0,
        "vector length {len} is not a multiple of the chunk size {CHUNK_SIZE}"
    );
    debug!(
        "evaluating {} instructions over {} rows in {} chunks",
        program.instructions.len(),
        len,
        len / CHUNK_SIZE
    );
    output
        .par_chunks_mut(CHUNK_SIZE)
        .enumerate()
        .par_for_each_init(
            || Arena::new(program.num_slots, CHUNK_SIZE),
            |arena, (i, chunk)| {
                arena.execute(
                    &program.instructions,
                    constants,
                    inputs,
                    i * CHUNK_SIZE,
                    program.result_slot,
                    chunk,
                )
            },
        );
    Evaluation::Regular(output)
}
