//! Splices emitted instruction sequences into an existing [`MethodBody`] at entry,
//! before every return, or at a caller-named byte offset; also supports replacing a
//! body wholesale. Every primitive here ultimately calls into the [`crate::emitter`]
//! insertion helpers so byte-offset bookkeeping stays in one place — callers of this
//! module never compute an offset themselves.

use crate::emitter::layout;
use crate::errors::{CoreError, CoreResult, ErrorCode};
use crate::model::{Instruction, InstructionIndex, Mnemonic, MethodBody};

/// Inserts `sequence` before the body's first instruction. An empty body simply
/// becomes `sequence`.
pub fn inject_at_entry(body: &mut MethodBody, sequence: Vec<Instruction>) {
	let rebased = rebase(body, sequence);
	match body.instructions.first().map(|i| i.id) {
		Some(first) => splice_before(body, first, rebased),
		None => body.instructions = rebased,
	}
}

/// For every `ret` in the body, clones `sequence` (same mnemonics and operands, fresh
/// instruction ids) and inserts the clone immediately before that return. Clones share
/// `Member`/`Type`/`String` operand payloads (those are `Arc`/owned-but-cheap values
/// compared by content, never by identity) but never an instruction id, so editing one
/// inserted copy's branch targets cannot alias another.
pub fn inject_before_returns(body: &mut MethodBody, sequence: Vec<Instruction>) {
	let return_sites: Vec<InstructionIndex> =
		body.instructions.iter().filter(|i| i.mnemonic == Mnemonic::Ret).map(|i| i.id).collect();

	for site in return_sites {
		let clone = rebase(body, sequence.clone());
		splice_before(body, site, clone);
	}
}

/// Finds the instruction whose byte offset is exactly `offset` (per the body's
/// current [`layout`]) and inserts `sequence` before it. Fails rather than rounding
/// to the nearest instruction if no instruction starts precisely there.
pub fn inject_at_offset(body: &mut MethodBody, offset: u32, sequence: Vec<Instruction>) -> CoreResult<()> {
	let computed = layout(&body.instructions);
	let target = computed
		.find_at_offset(offset)
		.ok_or_else(|| CoreError::new(ErrorCode::InvalidParameter, format!("no instruction starts at offset {offset}")))?;

	let rebased = rebase(body, sequence);
	splice_before(body, target, rebased);
	Ok(())
}

/// Clears instructions, locals, and exception handlers, then appends `sequence` as
/// the entire new body.
pub fn replace_body(body: &mut MethodBody, sequence: Vec<Instruction>) {
	body.instructions.clear();
	body.locals.clear();
	body.exception_handlers.clear();
	let rebased = rebase(body, sequence);
	body.instructions = rebased;
}

/// Layers entry injection and pre-return injection, in that order, matching the
/// component's `wrap` convenience: `before` runs first on entry, then `after` is
/// cloned ahead of every return site (including any return now present because
/// `before` itself ended in one, since pre-return injection reads the body after
/// entry injection has already run).
pub fn wrap(body: &mut MethodBody, before: Vec<Instruction>, after: Vec<Instruction>) {
	inject_at_entry(body, before);
	inject_before_returns(body, after);
}

/// Assigns every instruction in `sequence` a fresh id from `body`, preserving the
/// original relative order and rewriting any `Operand::Branch` that targets another
/// instruction within the same sequence so internal jumps stay internally consistent
/// after the splice. A `Branch` operand pointing outside the spliced sequence (into
/// the body it is being inserted into) is left untouched — the caller is responsible
/// for supplying sequences whose external branch targets already name live ids.
fn rebase(body: &mut MethodBody, sequence: Vec<Instruction>) -> Vec<Instruction> {
	use std::collections::HashMap;

	let mut remap: HashMap<InstructionIndex, InstructionIndex> = HashMap::with_capacity(sequence.len());
	for instruction in &sequence {
		remap.insert(instruction.id, body.fresh_instruction_id());
	}

	sequence
		.into_iter()
		.map(|instruction| {
			let id = remap[&instruction.id];
			let operand = match instruction.operand {
				crate::model::Operand::Branch(target) => {
					crate::model::Operand::Branch(*remap.get(&target).unwrap_or(&target))
				},
				other => other,
			};
			Instruction { id, mnemonic: instruction.mnemonic, operand }
		})
		.collect()
}

/// Inserts `sequence` directly before the instruction identified by `target`, which
/// must already be present in `body.instructions`.
fn splice_before(body: &mut MethodBody, target: InstructionIndex, sequence: Vec<Instruction>) {
	let position = body.find(target).expect("target instruction must belong to this body");
	body.instructions.splice(position..position, sequence);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::emitter::IlBuilder;

	fn opcodes(body: &MethodBody) -> Vec<Mnemonic> {
		body.instructions.iter().map(|i| i.mnemonic).collect()
	}

	#[test]
	fn entry_injection_on_empty_body_becomes_the_body() {
		let mut body = MethodBody::default();
		let mut seq = IlBuilder::new();
		seq.nop().ret();
		inject_at_entry(&mut body, seq.build());
		assert_eq!(opcodes(&body), vec![Mnemonic::Nop, Mnemonic::Ret]);
	}

	#[test]
	fn entry_injection_precedes_existing_instructions() {
		let mut body = MethodBody::default();
		let mut original = IlBuilder::new();
		original.ret();
		body.instructions = original.build();

		let mut prefix = IlBuilder::new();
		prefix.nop();
		inject_at_entry(&mut body, prefix.build());

		assert_eq!(opcodes(&body), vec![Mnemonic::Nop, Mnemonic::Ret]);
	}

	#[test]
	fn pre_return_injection_clones_before_every_return() {
		let mut body = MethodBody::default();
		let mut original = IlBuilder::new();
		original.nop().ret().nop().ret();
		body.instructions = original.build();

		let mut logger = IlBuilder::new();
		logger.load_int(1);
		inject_before_returns(&mut body, logger.build());

		assert_eq!(
			opcodes(&body),
			vec![
				Mnemonic::Nop,
				Mnemonic::LoadIntDedicated(1),
				Mnemonic::Ret,
				Mnemonic::Nop,
				Mnemonic::LoadIntDedicated(1),
				Mnemonic::Ret,
			]
		);

		let ids: Vec<_> = body.instructions.iter().map(|i| i.id).collect();
		let unique: std::collections::HashSet<_> = ids.iter().collect();
		assert_eq!(ids.len(), unique.len(), "every cloned instruction must carry its own id");
	}

	#[test]
	fn offset_injection_requires_exact_match() {
		let mut body = MethodBody::default();
		let mut original = IlBuilder::new();
		original.nop().load_int(200).ret();
		body.instructions = original.build();

		// load_int(200) is a short-form ldc.i4.s (2 bytes) starting right after the 1-byte nop.
		let mut seq = IlBuilder::new();
        seq.pop();
		assert!(inject_at_offset(&mut body, 1, seq.build()).is_ok());

		let mut seq2 = IlBuilder::new();
		seq2.pop();
		assert!(inject_at_offset(&mut body, 2, seq2.build()).is_err());
	}

	#[test]
	fn body_replacement_clears_locals_and_handlers() {
		let mut body = MethodBody::default();
		body.locals.push(crate::model::TypeRef::int32());
		let mut original = IlBuilder::new();
		original.ret();
		body.instructions = original.build();

		let mut replacement = IlBuilder::new();
		replacement.nop().ret();
		replace_body(&mut body, replacement.build());

		assert!(body.locals.is_empty());
		assert_eq!(opcodes(&body), vec![Mnemonic::Nop, Mnemonic::Ret]);
	}

	#[test]
	fn wrap_layers_entry_then_pre_return() {
		let mut body = MethodBody::default();
		let mut original = IlBuilder::new();
		original.ret();
		body.instructions = original.build();

		let mut entry = IlBuilder::new();
		entry.nop();
		let mut tail = IlBuilder::new();
		tail.pop();

		wrap(&mut body, entry.build(), tail.build());
		assert_eq!(opcodes(&body), vec![Mnemonic::Nop, Mnemonic::Pop, Mnemonic::Ret]);
	}
}
