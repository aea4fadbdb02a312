//! Type-checked builder that produces well-formed IL instruction sequences with
//! optimal short-form operand encoding.
//!
//! The builder never appends an implicit terminator — every `ret` or branch the
//! body ends on is an explicit call the caller makes. Branch targets are other
//! `Instruction` handles owned by the same body; [`IlBuilder::create_label`] /
//! [`IlBuilder::mark`] let a caller reference an instruction before it has been
//! emitted, the same forward-label pattern an assembler uses for forward jumps.
//! Byte offsets and short-vs-long branch encoding are resolved later, during the
//! [`crate::rewriter`]'s serialization pass, once every instruction in the body is
//! known.

use std::sync::Arc;

use crate::errors::{CoreError, CoreResult, ErrorCode};
use crate::model::{Instruction, InstructionIndex, MemberRef, MethodBody, Mnemonic, Operand, TypeRef};

/// A not-yet-placed branch target, returned by [`IlBuilder::create_label`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Label(pub InstructionIndex);

/// Accumulates instructions for one method body. Stateless with respect to any
/// particular `MethodBody` until [`IlBuilder::apply_to`]/[`IlBuilder::build`] is
/// called, so the same builder can compose a sequence destined for entry
/// injection, pre-return injection, or a brand new body.
#[derive(Debug, Default)]
pub struct IlBuilder {
	instructions: Vec<Instruction>,
	next_id: usize,
	pending_label: Option<InstructionIndex>,
}

impl IlBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Continues numbering fresh instruction ids past whatever a body already
	/// contains, so a sequence built for injection into an existing body never
	/// collides with one of its instruction ids.
	pub fn continuing_from(body: &MethodBody) -> Self {
		let next_id = body.instructions.iter().map(|i| i.id.0 + 1).max().unwrap_or(0);
		Self { instructions: Vec::new(), next_id, pending_label: None }
	}

	/// Reserves an instruction id for a branch that targets code not yet emitted.
	/// [`IlBuilder::mark`] attaches the reservation to the next instruction pushed.
	pub fn create_label(&mut self) -> Label {
		let id = InstructionIndex(self.next_id);
		self.next_id += 1;
		Label(id)
	}

	/// The next instruction pushed takes `label`'s id instead of a fresh one.
	pub fn mark(&mut self, label: Label) -> &mut Self {
		self.pending_label = Some(label.0);
		self
	}

	fn push(&mut self, mnemonic: Mnemonic, operand: Operand) -> InstructionIndex {
		let id = match self.pending_label.take() {
			Some(id) => id,
			None => {
				let id = InstructionIndex(self.next_id);
				self.next_id += 1;
				id
			},
		};
		self.instructions.push(Instruction { id, mnemonic, operand });
		id
	}

	pub fn nop(&mut self) -> &mut Self {
		self.push(Mnemonic::Nop, Operand::None);
		self
	}

	/// Dedicated opcodes for `-1..=8`, short form for the rest of `i8`'s range,
	/// full form otherwise.
	pub fn load_int(&mut self, value: i32) -> &mut Self {
		let mnemonic = match value {
			-1..=8 => Mnemonic::LoadIntDedicated(value as i8),
			-128..=127 => Mnemonic::LoadIntShort(value as i8),
			_ => Mnemonic::LoadIntLong(value),
		};
		self.push(mnemonic, Operand::None);
		self
	}

	pub fn load_long(&mut self, value: i64) -> &mut Self {
		self.push(Mnemonic::LoadLong(value), Operand::None);
		self
	}

	pub fn load_float32(&mut self, value: f32) -> &mut Self {
		self.push(Mnemonic::LoadFloat32(value.to_bits()), Operand::None);
		self
	}

	pub fn load_float64(&mut self, value: f64) -> &mut Self {
		self.push(Mnemonic::LoadFloat64(value.to_bits()), Operand::None);
		self
	}

	pub fn load_string(&mut self, value: impl Into<Arc<str>>) -> &mut Self {
		self.push(Mnemonic::LoadString, Operand::String(value.into()));
		self
	}

	pub fn load_null(&mut self) -> &mut Self {
		self.push(Mnemonic::LoadNull, Operand::None);
		self
	}

	/// Dedicated opcodes for `0..=3`, short form for `4..=255`, long form above.
	pub fn load_arg(&mut self, index: u16) -> &mut Self {
		let mnemonic = match index {
			0..=3 => Mnemonic::LoadArgDedicated(index as u8),
			4..=255 => Mnemonic::LoadArgShort(index as u8),
			_ => Mnemonic::LoadArgLong(index),
		};
		self.push(mnemonic, Operand::Argument(index));
		self
	}

	pub fn store_arg(&mut self, index: u16) -> &mut Self {
		let mnemonic = match index {
			0..=255 => Mnemonic::StoreArgShort(index as u8),
			_ => Mnemonic::StoreArgLong(index),
		};
		self.push(mnemonic, Operand::Argument(index));
		self
	}

	pub fn load_local(&mut self, index: u16) -> &mut Self {
		let mnemonic = match index {
			0..=3 => Mnemonic::LoadLocDedicated(index as u8),
			4..=255 => Mnemonic::LoadLocShort(index as u8),
			_ => Mnemonic::LoadLocLong(index),
		};
		self.push(mnemonic, Operand::Local(index));
		self
	}

	pub fn store_local(&mut self, index: u16) -> &mut Self {
		let mnemonic = match index {
			0..=3 => Mnemonic::StoreLocDedicated(index as u8),
			4..=255 => Mnemonic::StoreLocShort(index as u8),
			_ => Mnemonic::StoreLocLong(index),
		};
		self.push(mnemonic, Operand::Local(index));
		self
	}

	pub fn load_field(&mut self, field: MemberRef) -> &mut Self {
		self.push(Mnemonic::LoadField, Operand::Member(field));
		self
	}

	pub fn load_field_address(&mut self, field: MemberRef) -> &mut Self {
		self.push(Mnemonic::LoadFieldAddress, Operand::Member(field));
		self
	}

	pub fn store_field(&mut self, field: MemberRef) -> &mut Self {
		self.push(Mnemonic::StoreField, Operand::Member(field));
		self
	}

	pub fn load_static_field(&mut self, field: MemberRef) -> &mut Self {
		self.push(Mnemonic::LoadStaticField, Operand::Member(field));
		self
	}

	pub fn store_static_field(&mut self, field: MemberRef) -> &mut Self {
		self.push(Mnemonic::StoreStaticField, Operand::Member(field));
		self
	}

	pub fn call(&mut self, method: MemberRef) -> &mut Self {
		self.push(Mnemonic::Call, Operand::Member(method));
		self
	}

	pub fn call_virtual(&mut self, method: MemberRef) -> &mut Self {
		self.push(Mnemonic::CallVirtual, Operand::Member(method));
		self
	}

	pub fn new_object(&mut self, constructor: MemberRef) -> &mut Self {
		self.push(Mnemonic::NewObject, Operand::Member(constructor));
		self
	}

	pub fn cast_class(&mut self, ty: TypeRef) -> &mut Self {
		self.push(Mnemonic::CastClass, Operand::Type(ty));
		self
	}

	pub fn is_instance(&mut self, ty: TypeRef) -> &mut Self {
		self.push(Mnemonic::IsInstance, Operand::Type(ty));
		self
	}

	pub fn box_value(&mut self, ty: TypeRef) -> &mut Self {
		self.push(Mnemonic::Box, Operand::Type(ty));
		self
	}

	pub fn unbox_any(&mut self, ty: TypeRef) -> &mut Self {
		self.push(Mnemonic::UnboxAny, Operand::Type(ty));
		self
	}

	pub fn new_array(&mut self, element_type: TypeRef) -> &mut Self {
		self.push(Mnemonic::NewArray, Operand::Type(element_type));
		self
	}

	pub fn load_array_length(&mut self) -> &mut Self {
		self.push(Mnemonic::LoadArrayLength, Operand::None);
		self
	}

	pub fn throw(&mut self) -> &mut Self {
		self.push(Mnemonic::Throw, Operand::None);
		self
	}

	pub fn load_token(&mut self, member: MemberRef) -> &mut Self {
		self.push(Mnemonic::LoadToken, Operand::Member(member));
		self
	}

	pub fn add(&mut self) -> &mut Self {
		self.push(Mnemonic::Add, Operand::None);
		self
	}

	pub fn sub(&mut self) -> &mut Self {
		self.push(Mnemonic::Sub, Operand::None);
		self
	}

	pub fn mul(&mut self) -> &mut Self {
		self.push(Mnemonic::Mul, Operand::None);
		self
	}

	pub fn div(&mut self) -> &mut Self {
		self.push(Mnemonic::Div, Operand::None);
		self
	}

	pub fn ceq(&mut self) -> &mut Self {
		self.push(Mnemonic::Ceq, Operand::None);
		self
	}

	pub fn cgt(&mut self) -> &mut Self {
		self.push(Mnemonic::Cgt, Operand::None);
		self
	}

	pub fn clt(&mut self) -> &mut Self {
		self.push(Mnemonic::Clt, Operand::None);
		self
	}

	pub fn dup(&mut self) -> &mut Self {
		self.push(Mnemonic::Dup, Operand::None);
		self
	}

	pub fn pop(&mut self) -> &mut Self {
		self.push(Mnemonic::Pop, Operand::None);
		self
	}

	pub fn ret(&mut self) -> &mut Self {
		self.push(Mnemonic::Ret, Operand::None);
		self
	}

	pub fn branch(&mut self, target: Label) -> &mut Self {
		self.push(Mnemonic::Branch, Operand::Branch(target.0));
		self
	}

	pub fn branch_if_true(&mut self, target: Label) -> &mut Self {
		self.push(Mnemonic::BranchIfTrue, Operand::Branch(target.0));
		self
	}

	pub fn branch_if_false(&mut self, target: Label) -> &mut Self {
		self.push(Mnemonic::BranchIfFalse, Operand::Branch(target.0));
		self
	}

	pub fn branch_if_equal(&mut self, target: Label) -> &mut Self {
		self.push(Mnemonic::BranchIfEqual, Operand::Branch(target.0));
		self
	}

	pub fn build(self) -> Vec<Instruction> {
		self.instructions
	}

	/// Replaces the body's instructions wholesale and clears its locals and
	/// exception handlers, per the apply-operations contract.
	pub fn apply_to(self, body: &mut MethodBody) {
		body.instructions = self.instructions;
		body.locals.clear();
		body.exception_handlers.clear();
	}

	/// Inserts this sequence immediately before `target` in `body`. If `body` is
	/// empty the sequence becomes the body. Fails if `target` is not one of
	/// `body`'s instructions.
	pub fn insert_before(self, body: &mut MethodBody, target: InstructionIndex) -> CoreResult<()> {
		if body.instructions.is_empty() {
			body.instructions = self.instructions;
			return Ok(());
		}
		let position = body.find(target).ok_or_else(|| {
			CoreError::new(ErrorCode::InvalidParameter, format!("no instruction with id {target:?} in this body"))
		})?;
		body.instructions.splice(position..position, self.instructions);
		Ok(())
	}

	/// Inserts this sequence immediately after `target` in `body`.
	pub fn insert_after(self, body: &mut MethodBody, target: InstructionIndex) -> CoreResult<()> {
		let position = body.find(target).ok_or_else(|| {
			CoreError::new(ErrorCode::InvalidParameter, format!("no instruction with id {target:?} in this body"))
		})?;
		body.instructions.splice(position + 1..position + 1, self.instructions);
		Ok(())
	}
}

/// Byte layout of one method body's instructions, produced by [`layout`]. The
/// writer ([`crate::rewriter`]) consults `offsets` to patch branch targets and
/// exception-handler ranges into their final byte form; the [`crate::injector`]'s
/// offset-injection consults it to find the instruction starting at a caller-given
/// byte offset.
#[derive(Debug, Default, Clone)]
pub struct Layout {
	pub offsets: fxhash::FxHashMap<InstructionIndex, u32>,
	pub sizes: fxhash::FxHashMap<InstructionIndex, u32>,
	pub total_size: u32,
}

impl Layout {
	pub fn offset_of(&self, id: InstructionIndex) -> Option<u32> {
		self.offsets.get(&id).copied()
	}

	pub fn find_at_offset(&self, offset: u32) -> Option<InstructionIndex> {
		self.offsets.iter().find(|(_, &o)| o == offset).map(|(id, _)| *id)
	}
}

const SHORT_LOCAL_ARG_RAW_OPCODES: &[u16] = &[0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13];
const COMPOUND_LOCAL_ARG_RAW_OPCODES: &[u16] = &[0xFE09, 0xFE0A, 0xFE0B, 0xFE0C, 0xFE0D, 0xFE0E];
const SHORT_BRANCH_RAW_OPCODES: &[u16] = &[0x2B, 0x2C, 0x2D, 0x2E, 0x2F, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0xDE];
const LONG_BRANCH_RAW_OPCODES: &[u16] = &[0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F, 0x40, 0x41, 0x42, 0x43, 0x44, 0xDD];

pub(crate) fn raw_opcode_byte_len(opcode: crate::model::RawOpcode) -> u32 {
	if opcode.is_two_byte() { 2 } else { 1 }
}

/// Additional operand bytes for a [`Mnemonic::Raw`] instruction, derived from the
/// exact opcode value (mirrors the byte widths [`crate::raw::il::OpCode`] itself
/// reads) rather than from the operand's in-memory representation.
pub(crate) fn raw_operand_extra_bytes(opcode: crate::model::RawOpcode, operand: &Operand) -> u32 {
	match operand {
		Operand::None => 0,
		Operand::RawBytes(bytes) => bytes.len() as u32,
		Operand::Member(_) | Operand::Type(_) | Operand::String(_) => 4,
		Operand::Local(_) | Operand::Argument(_) => {
			if SHORT_LOCAL_ARG_RAW_OPCODES.contains(&opcode.0) {
				1
			} else if COMPOUND_LOCAL_ARG_RAW_OPCODES.contains(&opcode.0) {
				2
			} else {
				2
			}
		},
		Operand::Branch(_) => {
			if SHORT_BRANCH_RAW_OPCODES.contains(&opcode.0) {
				1
			} else {
				4
			}
		},
	}
}

pub(crate) fn fixed_instruction_size(instruction: &Instruction) -> Option<u32> {
	use Mnemonic::*;
	Some(match instruction.mnemonic {
		Nop | LoadNull | LoadIntDedicated(_) | LoadArgDedicated(_) | LoadLocDedicated(_) | StoreLocDedicated(_)
		| Add | Sub | Mul | Div | Dup | Pop | Ret | LoadArrayLength | Throw => 1,
		LoadIntShort(_) | LoadArgShort(_) | StoreArgShort(_) | LoadLocShort(_) | StoreLocShort(_) => 2,
		Ceq | Cgt | Clt => 2,
		LoadArgLong(_) | StoreArgLong(_) | LoadLocLong(_) | StoreLocLong(_) => 4,
		LoadIntLong(_) | LoadFloat32(_) => 5,
		LoadString | LoadField | LoadFieldAddress | StoreField | LoadStaticField | StoreStaticField | Call
		| CallVirtual | NewObject | CastClass | IsInstance | Box | UnboxAny | NewArray | LoadToken => 5,
		LoadLong(_) | LoadFloat64(_) => 9,
		Branch | BranchIfTrue | BranchIfFalse | BranchIfEqual => return None,
		Raw(opcode) => raw_opcode_byte_len(opcode) + raw_operand_extra_bytes(opcode, &instruction.operand),
	})
}

/// Computes byte offsets for every instruction in `instructions`, choosing short
/// (2-byte) versus long (5-byte) encodings for [`Mnemonic::Branch`] and its kin by
/// fixed-point relaxation: start every branch short, compute offsets, and widen any
/// branch whose target is out of `i8` range, repeating until a pass changes
/// nothing. This is the "writer" half of the IL Emitter's contract — the builder
/// itself never computes byte positions.
pub fn layout(instructions: &[Instruction]) -> Layout {
	let mut wide: fxhash::FxHashSet<InstructionIndex> = fxhash::FxHashSet::default();

	loop {
		let mut offsets = fxhash::FxHashMap::default();
		let mut sizes = fxhash::FxHashMap::default();
		let mut cursor = 0u32;

		for instruction in instructions {
			offsets.insert(instruction.id, cursor);
			let size = match fixed_instruction_size(instruction) {
				Some(size) => size,
				None => match wide.contains(&instruction.id) {
					true => 5,
					false => 2,
				},
			};
			sizes.insert(instruction.id, size);
			cursor += size;
		}

		let mut newly_widened = false;
		for instruction in instructions {
			if fixed_instruction_size(instruction).is_some() {
				continue;
			}
			let Operand::Branch(target) = instruction.operand else { continue };
			if wide.contains(&instruction.id) {
				continue;
			}
			let Some(&from) = offsets.get(&instruction.id) else { continue };
			let Some(&to) = offsets.get(&target) else { continue };
			// Displacement is measured from the end of the short-form instruction.
			let next = from as i64 + 2;
			let displacement = to as i64 - next;
			if displacement < i8::MIN as i64 || displacement > i8::MAX as i64 {
				wide.insert(instruction.id);
				newly_widened = true;
			}
		}

		if !newly_widened {
			let total_size = cursor;
			return Layout { offsets, sizes, total_size };
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn opcodes(instructions: &[Instruction]) -> Vec<Mnemonic> {
		instructions.iter().map(|i| i.mnemonic).collect()
	}

	#[test]
	fn load_int_selects_shortest_encoding() {
		let mut b = IlBuilder::new();
		b.load_int(0).load_int(8).load_int(127).load_int(200).ret();
		let code = b.build();
		assert_eq!(
			opcodes(&code),
			vec![
				Mnemonic::LoadIntDedicated(0),
				Mnemonic::LoadIntDedicated(8),
				Mnemonic::LoadIntShort(127),
				Mnemonic::LoadIntLong(200),
				Mnemonic::Ret,
			]
		);
	}

	#[test]
	fn load_int_handles_negative_one() {
		let mut b = IlBuilder::new();
		b.load_int(-1);
		assert_eq!(opcodes(&b.build()), vec![Mnemonic::LoadIntDedicated(-1)]);
	}

	#[test]
	fn load_arg_and_local_dedicated_ranges() {
		let mut b = IlBuilder::new();
		b.load_arg(0).load_arg(10).load_arg(300).load_local(2).load_local(50).load_local(1000);
		assert_eq!(
			opcodes(&b.build()),
			vec![
				Mnemonic::LoadArgDedicated(0),
				Mnemonic::LoadArgShort(10),
				Mnemonic::LoadArgLong(300),
				Mnemonic::LoadLocDedicated(2),
				Mnemonic::LoadLocShort(50),
				Mnemonic::LoadLocLong(1000),
			]
		);
	}

	#[test]
	fn never_appends_implicit_terminator() {
		let mut b = IlBuilder::new();
		b.load_int(1);
		assert_eq!(b.build().len(), 1);
	}

	#[test]
	fn forward_label_resolves_to_marked_instruction() {
		let mut b = IlBuilder::new();
		let label = b.create_label();
		b.load_int(1);
		b.branch(label);
		b.mark(label);
		b.ret();
		let code = b.build();
		let Operand::Branch(target) = code[1].operand.clone() else { panic!("expected branch operand") };
		assert_eq!(code[2].id, target);
	}

	#[test]
	fn entry_injection_preserves_body() {
		let mut body = MethodBody::default();
		let mut seed = IlBuilder::new();
		seed.load_int(0).ret();
		seed.apply_to(&mut body);

		let mut inject = IlBuilder::new();
		inject.nop();
		inject.insert_before(&mut body, body.instructions[0].id).unwrap();

		assert_eq!(opcodes(&body.instructions), vec![Mnemonic::Nop, Mnemonic::LoadIntDedicated(0), Mnemonic::Ret]);
		assert_eq!(body.instructions.len(), 3);
	}

	#[test]
	fn insert_before_missing_anchor_fails() {
		let mut body = MethodBody::default();
		let mut seed = IlBuilder::new();
		seed.load_int(0).ret();
		seed.apply_to(&mut body);

		let mut inject = IlBuilder::new();
		inject.nop();
		let bogus = InstructionIndex(9999);
		assert!(inject.insert_before(&mut body, bogus).is_err());
	}
}
