//! The mutable, owned object graph produced by the [`crate::loader`] and mutated by
//! the [`crate::rewriter`].
//!
//! Follows an arena-with-stable-indices shape: a module owns its types in a plain
//! `Vec`, a type owns its members in plain `Vec`s, and every member stores the index
//! of its declaring type rather than a pointer back to it. Indices double as the row
//! numbers the metadata token format already uses, so there is no separate identity
//! scheme to keep in sync with the on-disk tables.

use crate::identifiers::Mvid;
use crate::raw::heaps::table::{
	EventAttributes, FieldAttributes, MethodAttributes, MethodImplAttributes, PropertyAttributes,
	TypeAttributes,
};

/// The position of a type within `Module::types`. Doubles as the row index used to
/// build a `TypeDef` metadata token once the model is serialized.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TypeIndex(pub usize);

/// The position of a method within its declaring type's `methods`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MethodIndex(pub usize);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FieldIndex(pub usize);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PropertyIndex(pub usize);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EventIndex(pub usize);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct InstructionIndex(pub usize);

/// A reference to a type, either one declared in the owning module or an external
/// one imported by name. The [`crate::signature`] builder walks this recursively.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum TypeRef {
	/// A type declared in this module, addressed by its stable index.
	Local(TypeIndex),
	/// A type imported from another assembly, addressed by name.
	External { assembly: String, full_name: String },
	GenericInstance { base: Box<TypeRef>, args: Vec<TypeRef> },
	GenericParam { ordinal: u32, is_method_param: bool },
	Array { element: Box<TypeRef>, rank: u32 },
	ByRef(Box<TypeRef>),
	Pointer(Box<TypeRef>),
	RequiredModifier { modifier: Box<TypeRef>, referent: Box<TypeRef> },
	OptionalModifier { modifier: Box<TypeRef>, referent: Box<TypeRef> },
}

impl TypeRef {
	pub fn external(assembly: impl Into<String>, full_name: impl Into<String>) -> Self {
		Self::External { assembly: assembly.into(), full_name: full_name.into() }
	}

	/// Shorthand for the framework's root object type, used by the [`crate::type_factory`]
	/// as the default base type for new classes.
	pub fn object() -> Self {
		Self::external("System.Private.CoreLib", "System.Object")
	}

	pub fn value_type_base() -> Self {
		Self::external("System.Private.CoreLib", "System.ValueType")
	}

	pub fn enum_base() -> Self {
		Self::external("System.Private.CoreLib", "System.Enum")
	}

	pub fn int32() -> Self {
		Self::external("System.Private.CoreLib", "System.Int32")
	}

	pub fn void() -> Self {
		Self::external("System.Private.CoreLib", "System.Void")
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Accessibility {
	Private,
	FamilyAndAssembly,
	Assembly,
	Family,
	FamilyOrAssembly,
	Public,
}

#[derive(Debug, Clone)]
pub struct Param {
	pub name: String,
	pub ty: TypeRef,
}

#[derive(Debug, Clone)]
pub struct FieldDef {
	pub declaring_type: TypeIndex,
	pub name: String,
	pub ty: TypeRef,
	pub attributes: FieldAttributes,
	/// The constant value of a literal (`const`-like) field, stored as its already
	/// encoded blob bytes; `None` for ordinary instance/static fields.
	pub constant: Option<Vec<u8>>,
	/// Set by [`crate::rewriter::Rewriter::remove_field`] instead of physically
	/// removing the row, so `FieldIndex` values held anywhere else in the model stay
	/// valid. The writer skips a tombstoned field rather than serializing it.
	pub removed: bool,
}

/// A reference to a declared member, used as the operand of call/field/newobj-style
/// instructions. A `Local*` variant carries a type-level index plus the member's
/// position within that type's own member list, mirroring the metadata format's
/// table-plus-row shape without depending on a token having been assigned yet. An
/// `External*` variant names a member of a type the owning module does not declare
/// itself (the overwhelming majority of call targets in any real method body, since
/// almost every method calls into the framework) — the loader resolves a `MemberRef`
/// coded index to one or the other depending on whether its parent type is this
/// module's own `TypeDef` table or an imported `TypeRef`/`TypeSpec`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum MemberRef {
	Method(TypeIndex, MethodIndex),
	Field(TypeIndex, FieldIndex),
	ExternalMethod {
		declaring_type: TypeRef,
		name: String,
		param_types: Vec<TypeRef>,
		return_type: TypeRef,
		generic_arity: u32,
	},
	ExternalField {
		declaring_type: TypeRef,
		name: String,
		field_type: TypeRef,
	},
}

/// The instruction families listed in the component design's IL Emitter contract,
/// named after their CIL mnemonics. Each variant carries exactly the operand shape
/// that mnemonic accepts; [`Mnemonic::dedicated_or_short`] callers never have to
/// reach for a wider encoding than the value requires.
/// The 1- or 2-byte opcode of an instruction the emitter has no named mnemonic for.
/// Two-byte (`0xFE`-prefixed) opcodes are stored as `0xFE00 | second_byte` so the
/// value alone still identifies the exact instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RawOpcode(pub u16);

impl RawOpcode {
	pub fn is_two_byte(self) -> bool {
		self.0 > 0xFF
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Mnemonic {
	Nop,
	LoadIntDedicated(i8),
	LoadIntShort(i8),
	LoadIntLong(i32),
	LoadLong(i64),
	LoadFloat32(u32),
	LoadFloat64(u64),
	LoadString,
	LoadNull,
	LoadArgDedicated(u8),
	LoadArgShort(u8),
	LoadArgLong(u16),
	StoreArgShort(u8),
	StoreArgLong(u16),
	LoadLocDedicated(u8),
	LoadLocShort(u8),
	LoadLocLong(u16),
	StoreLocDedicated(u8),
	StoreLocShort(u8),
	StoreLocLong(u16),
	LoadField,
	LoadFieldAddress,
	StoreField,
	LoadStaticField,
	StoreStaticField,
	Call,
	CallVirtual,
	NewObject,
	Add,
	Sub,
	Mul,
	Div,
	Ceq,
	Cgt,
	Clt,
	Dup,
	Pop,
	Ret,
	Branch,
	BranchIfTrue,
	BranchIfFalse,
	BranchIfEqual,
	/// Beyond the required family: common enough in real bodies (casts, boxing,
	/// array allocation) that routing them through [`Mnemonic::Raw`] would make the
	/// model needlessly opaque for the Diff Engine and Code Injector alike.
	CastClass,
	IsInstance,
	Box,
	UnboxAny,
	NewArray,
	LoadArrayLength,
	Throw,
	LoadToken,
	/// Any opcode outside the families above, preserved losslessly so a loaded body
	/// round-trips even though the emitter never synthesizes it directly.
	Raw(RawOpcode),
}

impl Mnemonic {
	/// Whether this mnemonic requires a branch-target operand, resolved to a byte
	/// offset only by the writer's patch-up phase.
	pub fn is_branch(self) -> bool {
		matches!(self, Mnemonic::Branch | Mnemonic::BranchIfTrue | Mnemonic::BranchIfFalse | Mnemonic::BranchIfEqual)
	}

	pub fn is_terminator(self) -> bool {
		matches!(self, Mnemonic::Ret) || self.is_branch()
	}
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Operand {
	None,
	/// Index into the body's local-variable table.
	Local(u16),
	/// Index into the owning method's parameter list (0 = `this` for instance methods).
	Argument(u16),
	/// Literal string content. The writer interns it into the user-string heap (and
	/// assigns the token) only at serialization time, so the emitter can author a
	/// `ldstr` before any heap exists.
	String(std::sync::Arc<str>),
	Member(MemberRef),
	Type(TypeRef),
	/// A branch target: the index of another instruction owned by the same body.
	/// Resolved to a byte offset only during the writer's patch-up phase. Used both
	/// by the named branch mnemonics and by [`Mnemonic::Raw`] branch opcodes
	/// (`bge`, `leave`, ...), so every control-transfer instruction in a body — not
	/// only the ones the emitter's vocabulary names — upholds the invariant that a
	/// branch target belongs to the same method body.
	Branch(InstructionIndex),
	/// The verbatim operand bytes of a [`Mnemonic::Raw`] instruction that carries
	/// neither a local/argument index nor a branch target (e.g. a `switch` jump
	/// table, or a metadata token this crate does not remap).
	RawBytes(Vec<u8>),
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Instruction {
	/// Stable identity within the body; never reused even after removal, so a
	/// `Branch` operand recorded before an edit still resolves correctly after.
	pub id: InstructionIndex,
	pub mnemonic: Mnemonic,
	pub operand: Operand,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ExceptionHandler {
	pub try_start: InstructionIndex,
	pub try_end: InstructionIndex,
	pub handler_start: InstructionIndex,
	pub handler_end: InstructionIndex,
	pub catch_type: Option<TypeIndex>,
}

#[derive(Debug, Clone, Default)]
pub struct MethodBody {
	pub instructions: Vec<Instruction>,
	pub locals: Vec<TypeRef>,
	pub exception_handlers: Vec<ExceptionHandler>,
	next_instruction_id: usize,
}

impl MethodBody {
	pub fn local_count(&self) -> usize {
		self.locals.len()
	}

	pub fn fresh_instruction_id(&mut self) -> InstructionIndex {
		let id = InstructionIndex(self.next_instruction_id);
		self.next_instruction_id += 1;
		id
	}

	pub fn find(&self, id: InstructionIndex) -> Option<usize> {
		self.instructions.iter().position(|i| i.id == id)
	}
}

#[derive(Debug, Clone)]
pub struct MethodDef {
	pub declaring_type: TypeIndex,
	pub name: String,
	pub attributes: MethodAttributes,
	pub impl_attributes: MethodImplAttributes,
	pub return_type: TypeRef,
	pub params: Vec<Param>,
	pub generic_param_count: u32,
	pub body: MethodBody,
	/// Set by [`crate::rewriter::Rewriter::remove_method`] instead of physically
	/// removing the row, so `MethodIndex` values held by `PropertyDef`/`EventDef`
	/// accessors, `MemberRef::Method` operands in other bodies, and the journal all
	/// stay valid. The writer skips a tombstoned method rather than serializing it.
	pub removed: bool,
}

impl MethodDef {
	pub fn is_static(&self) -> bool {
		self.attributes.contains(MethodAttributes::STATIC)
	}
}

#[derive(Debug, Clone)]
pub struct PropertyDef {
	pub declaring_type: TypeIndex,
	pub name: String,
	pub attributes: PropertyAttributes,
	pub ty: TypeRef,
	pub getter: Option<MethodIndex>,
	pub setter: Option<MethodIndex>,
}

#[derive(Debug, Clone)]
pub struct EventDef {
	pub declaring_type: TypeIndex,
	pub name: String,
	pub attributes: EventAttributes,
	pub event_type: TypeRef,
	pub add: Option<MethodIndex>,
	pub remove: Option<MethodIndex>,
}

#[derive(Debug, Clone)]
pub struct TypeDef {
	pub namespace: String,
	pub name: String,
	pub attributes: TypeAttributes,
	pub base_type: Option<TypeRef>,
	pub fields: Vec<FieldDef>,
	pub methods: Vec<MethodDef>,
	pub properties: Vec<PropertyDef>,
	pub events: Vec<EventDef>,
	/// Set by [`crate::rewriter::Rewriter::remove_type`] instead of physically
	/// removing the row, so `TypeIndex` values held by `TypeRef::Local`,
	/// `MemberRef::Method`/`MemberRef::Field`, and every `declaring_type` elsewhere in
	/// the model stay valid. The writer skips a tombstoned type rather than
	/// serializing it.
	pub removed: bool,
}

impl TypeDef {
	pub fn full_name(&self) -> String {
		match self.namespace.is_empty() {
			true => self.name.clone(),
			false => format!("{}.{}", self.namespace, self.name),
		}
	}

	pub fn method_by_index(&self, index: MethodIndex) -> Option<&MethodDef> {
		self.methods.get(index.0).filter(|m| !m.removed)
	}

	pub fn field_by_index(&self, index: FieldIndex) -> Option<&FieldDef> {
		self.fields.get(index.0).filter(|f| !f.removed)
	}
}

#[derive(Debug, Clone)]
pub struct AssemblyRefDef {
	pub name: String,
	pub version: (u16, u16, u16, u16),
	pub public_key_or_token: Vec<u8>,
	pub culture: String,
}

#[derive(Debug, Clone)]
pub struct ManifestResourceDef {
	pub name: String,
	pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Module {
	pub name: String,
	pub types: Vec<TypeDef>,
	pub assembly_refs: Vec<AssemblyRefDef>,
	pub resources: Vec<ManifestResourceDef>,
}

impl Module {
	pub fn type_by_index(&self, index: TypeIndex) -> Option<&TypeDef> {
		self.types.get(index.0).filter(|t| !t.removed)
	}

	pub fn find_type(&self, namespace: &str, name: &str) -> Option<TypeIndex> {
		self.types
			.iter()
			.position(|t| !t.removed && t.namespace == namespace && t.name == name)
			.map(TypeIndex)
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AssemblyVersion {
	pub major: u16,
	pub minor: u16,
	pub build: u16,
	pub revision: u16,
}

/// The parsed contents of one image: a name, a version, an MVID and a single owning
/// [`Module`]. Multi-module assemblies are not modeled — every assembly this crate
/// loads is expected to carry exactly one module, matching what the .NET SDK emits.
#[derive(Debug, Clone)]
pub struct AssemblyModel {
	pub name: String,
	pub full_name: String,
	pub version: AssemblyVersion,
	pub mvid: Mvid,
	pub target_framework_moniker: Option<String>,
	pub module: Module,
}

impl AssemblyModel {
	pub fn type_count(&self) -> usize {
		self.module.types.iter().filter(|t| !t.removed).count()
	}

	pub fn dependency_names(&self) -> Vec<&str> {
		self.module.assembly_refs.iter().map(|r| r.name.as_str()).collect()
	}
}
