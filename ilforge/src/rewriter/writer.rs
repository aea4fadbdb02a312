//! Serializes an [`AssemblyModel`] back into a PE/CLI image.
//!
//! Mirrors the shape of [`crate::loader`] in reverse: where the loader walks tables
//! into the owned model, this module walks the model into tables, then the tables
//! into the `#~` stream, the heaps, and finally a minimal PE32 image around all of
//! it. Everything is built in memory as plain `Vec<u8>`s; nothing here touches a
//! file handle (that is [`super::Rewriter::save`]'s job).
//!
//! A handful of encoding choices are deliberately narrower than the full ECMA-335
//! grammar the loader can read; each is called out at its point of use and
//! collected in the repository's design notes.

use std::collections::HashMap;

use crate::errors::{CoreError, CoreResult, ErrorCode};
use crate::emitter::{fixed_instruction_size, layout, raw_operand_extra_bytes, Layout};
use crate::model::{
	AssemblyModel, ExceptionHandler, FieldDef, Instruction, MemberRef, MethodBody, Mnemonic, Operand, PropertyDef,
	TypeRef,
};
use crate::raw::heaps::table::{
	AssemblyFlags, AssemblyHashAlgorithm, ManifestResourceAttributes, MethodAttributes, MethodSemanticsAttributes,
	TableKind,
};
use crate::utilities::write_compressed_u32;

fn push_compressed(out: &mut Vec<u8>, value: u32) -> CoreResult<()> {
	write_compressed_u32(out, value)
		.map_err(|e| CoreError::with_cause(ErrorCode::CompilationError, "value too large for a compressed metadata integer", e))
}

fn write_at(out: &mut Vec<u8>, value: u32, width: usize) {
	let bytes = value.to_le_bytes();
	out.extend_from_slice(&bytes[..width]);
}

// ---------------------------------------------------------------------------
// Heap builders
// ---------------------------------------------------------------------------

/// Interning builder for `#Strings`. Offset 0 is reserved for the empty string, the
/// same sentinel the reader's `StringHeap` treats as "absent".
#[derive(Default)]
struct StringHeapBuilder {
	bytes: Vec<u8>,
	index: HashMap<String, u32>,
}

impl StringHeapBuilder {
	fn new() -> Self {
		Self { bytes: vec![0u8], index: HashMap::new() }
	}

	fn intern(&mut self, s: &str) -> u32 {
		if s.is_empty() {
			return 0;
		}
		if let Some(&offset) = self.index.get(s) {
			return offset;
		}
		let offset = self.bytes.len() as u32;
		self.bytes.extend_from_slice(s.as_bytes());
		self.bytes.push(0);
		self.index.insert(s.to_string(), offset);
		offset
	}

	fn finish(mut self) -> Vec<u8> {
		while self.bytes.len() % 4 != 0 {
			self.bytes.push(0);
		}
		self.bytes
	}
}

/// Interning builder for `#Blob`. Offset 0 is the one-byte empty blob (a compressed
/// length of `0` with no content), matching `BlobHeap::get`'s own convention.
#[derive(Default)]
struct BlobHeapBuilder {
	bytes: Vec<u8>,
	index: HashMap<Vec<u8>, u32>,
}

impl BlobHeapBuilder {
	fn new() -> Self {
		Self { bytes: vec![0u8], index: HashMap::new() }
	}

	fn intern(&mut self, content: &[u8]) -> CoreResult<u32> {
		if content.is_empty() {
			return Ok(0);
		}
		if let Some(&offset) = self.index.get(content) {
			return Ok(offset);
		}
		let offset = self.bytes.len() as u32;
		push_compressed(&mut self.bytes, content.len() as u32)?;
		self.bytes.extend_from_slice(content);
		self.index.insert(content.to_vec(), offset);
		Ok(offset)
	}

	fn finish(mut self) -> Vec<u8> {
		while self.bytes.len() % 4 != 0 {
			self.bytes.push(0);
		}
		self.bytes
	}
}

/// Non-interning builder for `#GUID`: each entry is a fixed 16 bytes, addressed by a
/// 1-based row number (`0` means absent, per `GuidHeap::get`).
#[derive(Default)]
struct GuidHeapBuilder {
	bytes: Vec<u8>,
}

impl GuidHeapBuilder {
	fn new() -> Self {
		Self::default()
	}

	/// `le_bytes` must already be in the little-endian layout `GuidHeap::get` expects
	/// (`Uuid::from_slice_le`), not RFC 4122 byte order.
	fn add(&mut self, le_bytes: [u8; 16]) -> u32 {
		self.bytes.extend_from_slice(&le_bytes);
		(self.bytes.len() / 16) as u32
	}

	fn finish(self) -> Vec<u8> {
		self.bytes
	}
}

/// Interning builder for `#US`. Offset 0 is the one-byte empty string (compressed
/// length `0`), which `UserStringHeap::get` special-cases before ever looking at a
/// trailing flag byte.
#[derive(Default)]
struct UserStringHeapBuilder {
	bytes: Vec<u8>,
	index: HashMap<String, u32>,
}

impl UserStringHeapBuilder {
	fn new() -> Self {
		Self { bytes: vec![0u8], index: HashMap::new() }
	}

	fn intern(&mut self, s: &str) -> CoreResult<u32> {
		if let Some(&offset) = self.index.get(s) {
			return Ok(offset);
		}
		let offset = self.bytes.len() as u32;
		let units: Vec<u16> = s.encode_utf16().collect();
		let content_len = units.len() * 2 + 1;
		push_compressed(&mut self.bytes, content_len as u32)?;
		for unit in units {
			self.bytes.extend_from_slice(&unit.to_le_bytes());
		}
		// Simplified "has special characters" heuristic: anything outside printable
		// ASCII trips the flag, matching the spirit (if not the letter) of ECMA-335
		// §II.24.2.4's table without reproducing its exact character class list.
		let special = s.chars().any(|c| !(' '..='~').contains(&c));
		self.bytes.push(special as u8);
		self.index.insert(s.to_string(), offset);
		Ok(offset)
	}

	fn finish(mut self) -> Vec<u8> {
		while self.bytes.len() % 4 != 0 {
			self.bytes.push(0);
		}
		self.bytes
	}
}

// ---------------------------------------------------------------------------
// Resolved references and their coded-index encodings
// ---------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ResolvedType {
	TypeDef(u32),
	TypeRef(u32),
	TypeSpec(u32),
}

impl ResolvedType {
	fn token(self) -> u32 {
		match self {
			Self::TypeDef(row) => (0x02 << 24) | row,
			Self::TypeRef(row) => (0x01 << 24) | row,
			Self::TypeSpec(row) => (0x1b << 24) | row,
		}
	}

	/// `TypeDefOrRef`: `[TypeDef, TypeRef, TypeSpec]`, 2-bit tag.
	fn coded_type_def_or_ref(self) -> u32 {
		match self {
			Self::TypeDef(row) => (row << 2) | 0,
			Self::TypeRef(row) => (row << 2) | 1,
			Self::TypeSpec(row) => (row << 2) | 2,
		}
	}

	/// `MemberRefParent`: `[TypeDef, TypeRef, ModuleRef, MethodDef, TypeSpec]`, 3-bit tag.
	fn coded_member_ref_parent(self) -> u32 {
		match self {
			Self::TypeDef(row) => (row << 3) | 0,
			Self::TypeRef(row) => (row << 3) | 1,
			Self::TypeSpec(row) => (row << 3) | 4,
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ResolvedMember {
	MethodDef(u32),
	Field(u32),
	MemberRef(u32),
}

impl ResolvedMember {
	fn token(self) -> u32 {
		match self {
			Self::MethodDef(row) => (0x06 << 24) | row,
			Self::Field(row) => (0x04 << 24) | row,
			Self::MemberRef(row) => (0x0a << 24) | row,
		}
	}

	/// `MethodDefOrRef`: `[MethodDef, MemberRef]`, 1-bit tag. Never called for `Field`.
	fn coded_method_def_or_ref(self) -> u32 {
		match self {
			Self::MethodDef(row) => (row << 1) | 0,
			Self::MemberRef(row) => (row << 1) | 1,
			Self::Field(_) => unreachable!("a field is never encoded as a MethodDefOrRef"),
		}
	}
}

// ---------------------------------------------------------------------------
// Table row shapes
// ---------------------------------------------------------------------------
// Every field holds its final resolved value as a plain `u32`; the field-width
// narrowing to 2 or 4 bytes happens once, in `Widths`, after every table's row
// count is known.

struct ModuleRow {
	name: u32,
	mv_id: u32,
}

struct TypeRefRow {
	resolution_scope: u32,
	type_name: u32,
	type_namespace: u32,
}

struct TypeDefRow {
	flags: u32,
	type_name: u32,
	type_namespace: u32,
	extends: u32,
	field_list: u32,
	method_list: u32,
}

struct FieldRow {
	flags: u16,
	name: u32,
	signature: u32,
}

struct MethodDefRow {
	rva: u32,
	impl_flags: u16,
	flags: u16,
	name: u32,
	signature: u32,
	param_list: u32,
}

struct ParamRow {
	sequence: u16,
	name: u32,
}

struct MemberRefRow {
	class: u32,
	name: u32,
	signature: u32,
}

struct ConstantRow {
	ty: u8,
	parent: u32,
	value: u32,
}

struct CustomAttributeRow {
	parent: u32,
	ty: u32,
	value: u32,
}

struct StandAloneSigRow {
	signature: u32,
}

struct EventMapRow {
	parent: u32,
	event_list: u32,
}

struct EventRow {
	flags: u16,
	name: u32,
	ty: u32,
}

struct PropertyMapRow {
	parent: u32,
	property_list: u32,
}

struct PropertyRow {
	flags: u16,
	name: u32,
	ty: u32,
}

struct MethodSemanticsRow {
	flags: u16,
	method: u32,
	association: u32,
}

struct TypeSpecRow {
	signature: u32,
}

struct AssemblyRow {
	major_version: u16,
	minor_version: u16,
	build_number: u16,
	revision_number: u16,
	public_key: u32,
	name: u32,
	culture: u32,
}

struct AssemblyRefRow {
	major_version: u16,
	minor_version: u16,
	build_number: u16,
	revision_number: u16,
	public_key_or_token: u32,
	name: u32,
	culture: u32,
}

struct ManifestResourceRow {
	offset: u32,
	name: u32,
}

struct GenericParamRow {
	number: u16,
	owner: u32,
	name: u32,
}

#[derive(Default)]
struct Tables {
	module: Vec<ModuleRow>,
	type_ref: Vec<TypeRefRow>,
	type_def: Vec<TypeDefRow>,
	field: Vec<FieldRow>,
	method_def: Vec<MethodDefRow>,
	param: Vec<ParamRow>,
	member_ref: Vec<MemberRefRow>,
	constant: Vec<ConstantRow>,
	custom_attribute: Vec<CustomAttributeRow>,
	stand_alone_sig: Vec<StandAloneSigRow>,
	event_map: Vec<EventMapRow>,
	event: Vec<EventRow>,
	property_map: Vec<PropertyMapRow>,
	property: Vec<PropertyRow>,
	method_semantics: Vec<MethodSemanticsRow>,
	type_spec: Vec<TypeSpecRow>,
	assembly: Vec<AssemblyRow>,
	assembly_ref: Vec<AssemblyRefRow>,
	manifest_resource: Vec<ManifestResourceRow>,
	generic_param: Vec<GenericParamRow>,
}

fn width_for(rows: usize) -> usize {
	if rows > 65535 {
		4
	} else {
		2
	}
}

/// Every index/coded-index byte width the `#~` stream needs, resolved once all
/// tables have their final row counts.
struct Widths {
	string: usize,
	guid: usize,
	blob: usize,
	type_def: usize,
	field: usize,
	method_def: usize,
	param: usize,
	property: usize,
	event: usize,
	type_def_or_ref: usize,
	has_constant: usize,
	has_custom_attribute: usize,
	member_ref_parent: usize,
	has_semantics: usize,
	method_def_or_ref: usize,
	implementation: usize,
	custom_attribute_type: usize,
	resolution_scope: usize,
	type_or_method_def: usize,
}

impl Widths {
	fn compute(tables: &Tables, string_heap_len: usize, guid_heap_len: usize, blob_heap_len: usize) -> Self {
		let type_def_rows = tables.type_def.len();
		let type_ref_rows = tables.type_ref.len();
		let type_spec_rows = tables.type_spec.len();
		let field_rows = tables.field.len();
		let param_rows = tables.param.len();
		let property_rows = tables.property.len();
		let event_rows = tables.event.len();
		let method_def_rows = tables.method_def.len();
		let member_ref_rows = tables.member_ref.len();
		let assembly_rows = tables.assembly.len();
		let assembly_ref_rows = tables.assembly_ref.len();
		let module_rows = tables.module.len();

		let type_def_or_ref_max = [type_def_rows, type_ref_rows, type_spec_rows].into_iter().max().unwrap_or(0);
		let has_constant_max = [field_rows, param_rows, property_rows].into_iter().max().unwrap_or(0);
		let has_custom_attribute_max = [
			method_def_rows, field_rows, type_ref_rows, type_def_rows, param_rows, member_ref_rows, property_rows,
			event_rows, assembly_rows, assembly_ref_rows, module_rows,
		]
		.into_iter()
		.max()
		.unwrap_or(0);
		let member_ref_parent_max = [type_def_rows, type_ref_rows, method_def_rows, type_spec_rows].into_iter().max().unwrap_or(0);
		let has_semantics_max = event_rows.max(property_rows);
		let method_def_or_ref_max = method_def_rows.max(member_ref_rows);
		let implementation_max = assembly_ref_rows;
		let resolution_scope_max = [module_rows, assembly_ref_rows, type_ref_rows].into_iter().max().unwrap_or(0);
		let type_or_method_def_max = type_def_rows.max(method_def_rows);

		let coded_width = |bits: u32, max_rows: usize| -> usize {
			if max_rows < (1usize << (16 - bits as usize)) {
				2
			} else {
				4
			}
		};

		Self {
			string: if string_heap_len > 65535 { 4 } else { 2 },
			guid: if guid_heap_len > 65535 { 4 } else { 2 },
			blob: if blob_heap_len > 65535 { 4 } else { 2 },
			type_def: width_for(type_def_rows),
			field: width_for(field_rows),
			method_def: width_for(method_def_rows),
			param: width_for(param_rows),
			property: width_for(property_rows),
			event: width_for(event_rows),
			type_def_or_ref: coded_width(2, type_def_or_ref_max),
			has_constant: coded_width(2, has_constant_max),
			has_custom_attribute: coded_width(5, has_custom_attribute_max),
			member_ref_parent: coded_width(3, member_ref_parent_max),
			has_semantics: coded_width(1, has_semantics_max),
			method_def_or_ref: coded_width(1, method_def_or_ref_max),
			implementation: coded_width(2, implementation_max),
			custom_attribute_type: coded_width(3, 0.max(method_def_rows).max(member_ref_rows)),
			resolution_scope: coded_width(2, resolution_scope_max),
			type_or_method_def: coded_width(1, type_or_method_def_max),
		}
	}
}

// ---------------------------------------------------------------------------
// Writer context
// ---------------------------------------------------------------------------

struct Writer<'a> {
	model: &'a AssemblyModel,
	strings: StringHeapBuilder,
	blobs: BlobHeapBuilder,
	guids: GuidHeapBuilder,
	user_strings: UserStringHeapBuilder,
	tables: Tables,
	type_ref_cache: HashMap<TypeRef, ResolvedType>,
	member_cache: HashMap<MemberRef, ResolvedMember>,
	assembly_ref_cache: HashMap<String, u32>,
	type_row_of: HashMap<usize, u32>,
	method_row_of: HashMap<(usize, usize), u32>,
	field_row_of: HashMap<(usize, usize), u32>,
	resources_blob: Vec<u8>,
}

impl<'a> Writer<'a> {
	fn new(model: &'a AssemblyModel) -> Self {
		let mut assembly_ref_cache = HashMap::new();
		let mut assembly_ref = Vec::new();
		let mut strings = StringHeapBuilder::new();
		let blobs = BlobHeapBuilder::new();
		for (i, reference) in model.module.assembly_refs.iter().enumerate() {
			assembly_ref.push(AssemblyRefRow {
				major_version: reference.version.0,
				minor_version: reference.version.1,
				build_number: reference.version.2,
				revision_number: reference.version.3,
				public_key_or_token: 0, // patched below once blobs exists
				name: strings.intern(&reference.name),
				culture: strings.intern(&reference.culture),
			});
			assembly_ref_cache.insert(reference.name.clone(), (i + 1) as u32);
		}

		let mut tables = Tables::default();
		tables.assembly_ref = assembly_ref;

		Self {
			model,
			strings,
			blobs,
			guids: GuidHeapBuilder::new(),
			user_strings: UserStringHeapBuilder::new(),
			tables,
			type_ref_cache: HashMap::new(),
			member_cache: HashMap::new(),
			assembly_ref_cache,
			type_row_of: HashMap::new(),
			method_row_of: HashMap::new(),
			field_row_of: HashMap::new(),
			resources_blob: Vec::new(),
		}
	}

	/// Patches in the real public-key-or-token blob for every pre-populated
	/// `AssemblyRef` row, now that `self.blobs` can be borrowed mutably on its own.
	fn finish_assembly_refs(&mut self) -> CoreResult<()> {
		for (i, reference) in self.model.module.assembly_refs.iter().enumerate() {
			let blob = self.blobs.intern(&reference.public_key_or_token)?;
			self.tables.assembly_ref[i].public_key_or_token = blob;
		}
		Ok(())
	}

	fn resolve_assembly_ref(&mut self, name: &str) -> u32 {
		if let Some(&row) = self.assembly_ref_cache.get(name) {
			return row;
		}
		let name_off = self.strings.intern(name);
		self.tables.assembly_ref.push(AssemblyRefRow {
			major_version: 0,
			minor_version: 0,
			build_number: 0,
			revision_number: 0,
			public_key_or_token: 0,
			name: name_off,
			culture: 0,
		});
		let row = self.tables.assembly_ref.len() as u32;
		self.assembly_ref_cache.insert(name.to_string(), row);
		row
	}

	fn split_full_name(full_name: &str) -> (&str, &str) {
		match full_name.rfind('.') {
			Some(at) => (&full_name[..at], &full_name[at + 1..]),
			None => ("", full_name),
		}
	}

	fn resolve_type(&mut self, ty: &TypeRef) -> CoreResult<ResolvedType> {
		if let Some(&resolved) = self.type_ref_cache.get(ty) {
			return Ok(resolved);
		}
		let resolved = match ty {
			TypeRef::Local(index) => {
				let row = *self
					.type_row_of
					.get(&index.0)
					.ok_or_else(|| CoreError::new(ErrorCode::TypeNotFound, format!("no type at index {}", index.0)))?;
				ResolvedType::TypeDef(row)
			},
			TypeRef::External { assembly, full_name } => {
				let (namespace, name) = Self::split_full_name(full_name);
				let scope_row = self.resolve_assembly_ref(assembly);
				// `ResolutionScope`: `[Module, ModuleRef, AssemblyRef, TypeRef]`, 2-bit tag.
				let resolution_scope = (scope_row << 2) | 2;
				let type_name = self.strings.intern(name);
				let type_namespace = self.strings.intern(namespace);
				self.tables.type_ref.push(TypeRefRow { resolution_scope, type_name, type_namespace });
				ResolvedType::TypeRef(self.tables.type_ref.len() as u32)
			},
			_ => {
				let mut signature = Vec::new();
				self.encode_type_signature(ty, &mut signature)?;
				let blob = self.blobs.intern(&signature)?;
				self.tables.type_spec.push(TypeSpecRow { signature: blob });
				ResolvedType::TypeSpec(self.tables.type_spec.len() as u32)
			},
		};
		self.type_ref_cache.insert(ty.clone(), resolved);
		Ok(resolved)
	}

	fn resolve_member(&mut self, member: &MemberRef) -> CoreResult<ResolvedMember> {
		if let Some(&resolved) = self.member_cache.get(member) {
			return Ok(resolved);
		}
		let resolved = match member {
			MemberRef::Method(type_index, method_index) => {
				let row = *self.method_row_of.get(&(type_index.0, method_index.0)).ok_or_else(|| {
					CoreError::new(ErrorCode::MethodNotFound, format!("no method at {:?}/{:?}", type_index, method_index))
				})?;
				ResolvedMember::MethodDef(row)
			},
			MemberRef::Field(type_index, field_index) => {
				let row = *self
					.field_row_of
					.get(&(type_index.0, field_index.0))
					.ok_or_else(|| CoreError::new(ErrorCode::TypeNotFound, format!("no field at {:?}/{:?}", type_index, field_index)))?;
				ResolvedMember::Field(row)
			},
			MemberRef::ExternalMethod { declaring_type, name, param_types, return_type, generic_arity } => {
				let parent = self.resolve_type(declaring_type)?;
				let has_this = name != ".cctor";
				let signature = self.encode_method_signature(has_this, *generic_arity, param_types, return_type)?;
				let signature = self.blobs.intern(&signature)?;
				let name_off = self.strings.intern(name);
				self.tables.member_ref.push(MemberRefRow { class: parent.coded_member_ref_parent(), name: name_off, signature });
				ResolvedMember::MemberRef(self.tables.member_ref.len() as u32)
			},
			MemberRef::ExternalField { declaring_type, name, field_type } => {
				let parent = self.resolve_type(declaring_type)?;
				let signature = self.encode_field_signature(field_type)?;
				let signature = self.blobs.intern(&signature)?;
				let name_off = self.strings.intern(name);
				self.tables.member_ref.push(MemberRefRow { class: parent.coded_member_ref_parent(), name: name_off, signature });
				ResolvedMember::MemberRef(self.tables.member_ref.len() as u32)
			},
		};
		self.member_cache.insert(member.clone(), resolved);
		Ok(resolved)
	}

	/// `System.Private.CoreLib`-rooted primitive element-type tags. Anything else
	/// falls through to a `ValueType`/`ClassType` coded reference.
	fn primitive_tag(ty: &TypeRef) -> Option<u8> {
		let TypeRef::External { assembly, full_name } = ty else { return None };
		if assembly != "System.Private.CoreLib" {
			return None;
		}
		Some(match full_name.as_str() {
			"System.Void" => 0x01,
			"System.Boolean" => 0x02,
			"System.Char" => 0x03,
			"System.SByte" => 0x04,
			"System.Byte" => 0x05,
			"System.Int16" => 0x06,
			"System.UInt16" => 0x07,
			"System.Int32" => 0x08,
			"System.UInt32" => 0x09,
			"System.Int64" => 0x0A,
			"System.UInt64" => 0x0B,
			"System.Single" => 0x0C,
			"System.Double" => 0x0D,
			"System.String" => 0x0E,
			"System.TypedReference" => 0x16,
			"System.IntPtr" => 0x18,
			"System.UIntPtr" => 0x19,
			"System.Object" => 0x1C,
			_ => return None,
		})
	}

	/// Only a `Local` type whose own `base_type` is `System.ValueType`/`System.Enum`
	/// is treated as a value type; every other (necessarily `External`) reference
	/// defaults to `ClassType`, including genuine framework value types that
	/// `primitive_tag` doesn't already special-case (e.g. user-defined structs
	/// imported from another assembly).
	fn is_value_type(&self, ty: &TypeRef) -> bool {
		let TypeRef::Local(index) = ty else { return false };
		match self.model.module.type_by_index(*index) {
			Some(def) => matches!(&def.base_type, Some(base) if *base == TypeRef::value_type_base() || *base == TypeRef::enum_base()),
			None => false,
		}
	}

	/// Encodes `ty` per ECMA-335 §II.23.2.12. `RequiredModifier`/`OptionalModifier`
	/// are deliberately collapsed to their `referent` alone: the reader's `CModOpt`
	/// decode arm does not consume the referent's own trailing signature bytes,
	/// so emitting either modifier tag would desynchronize parsing of anything that
	/// follows in the same blob. `Array` is always written as `SzArray` (rank 1);
	/// this crate's reader panics on the general `Array` tag.
	fn encode_type_signature(&mut self, ty: &TypeRef, out: &mut Vec<u8>) -> CoreResult<()> {
		if let Some(tag) = Self::primitive_tag(ty) {
			out.push(tag);
			return Ok(());
		}
		match ty {
			TypeRef::Local(_) | TypeRef::External { .. } => {
				let is_value = self.is_value_type(ty);
				let resolved = self.resolve_type(ty)?;
				out.push(if is_value { 0x11 } else { 0x12 });
				push_compressed(out, resolved.coded_type_def_or_ref())?;
			},
			TypeRef::GenericInstance { base, args } => {
				out.push(0x15);
				let is_value = self.is_value_type(base);
				let resolved = self.resolve_type(base)?;
				out.push(if is_value { 0x11 } else { 0x12 });
				push_compressed(out, resolved.coded_type_def_or_ref())?;
				push_compressed(out, args.len() as u32)?;
				for arg in args {
					self.encode_type_signature(arg, out)?;
				}
			},
			TypeRef::GenericParam { ordinal, is_method_param } => {
				out.push(if *is_method_param { 0x1E } else { 0x13 });
				push_compressed(out, *ordinal)?;
			},
			TypeRef::Array { element, .. } => {
				out.push(0x1D);
				self.encode_type_signature(element, out)?;
			},
			TypeRef::ByRef(referent) => {
				out.push(0x10);
				self.encode_type_signature(referent, out)?;
			},
			TypeRef::Pointer(referent) => {
				out.push(0x0F);
				self.encode_type_signature(referent, out)?;
			},
			TypeRef::RequiredModifier { referent, .. } | TypeRef::OptionalModifier { referent, .. } => {
				self.encode_type_signature(referent, out)?;
			},
		}
		Ok(())
	}

	fn encode_field_signature(&mut self, ty: &TypeRef) -> CoreResult<Vec<u8>> {
		let mut out = vec![0x06];
		self.encode_type_signature(ty, &mut out)?;
		Ok(out)
	}

	fn encode_method_signature(&mut self, has_this: bool, generic_arity: u32, params: &[TypeRef], return_type: &TypeRef) -> CoreResult<Vec<u8>> {
		let mut out = Vec::new();
		let mut convention = if has_this { 0x20 } else { 0x00 };
		if generic_arity > 0 {
			convention |= 0x10;
		}
		out.push(convention);
		if generic_arity > 0 {
			push_compressed(&mut out, generic_arity)?;
		}
		push_compressed(&mut out, params.len() as u32)?;
		self.encode_type_signature(return_type, &mut out)?;
		for param in params {
			self.encode_type_signature(param, &mut out)?;
		}
		Ok(out)
	}

	fn encode_property_signature(&mut self, ty: &TypeRef, has_this: bool) -> CoreResult<Vec<u8>> {
		let mut out = vec![if has_this { 0x28 } else { 0x08 }];
		push_compressed(&mut out, 0)?;
		self.encode_type_signature(ty, &mut out)?;
		Ok(out)
	}

	fn encode_local_var_signature(&mut self, locals: &[TypeRef]) -> CoreResult<Vec<u8>> {
		let mut out = vec![0x07];
		push_compressed(&mut out, locals.len() as u32)?;
		for local in locals {
			self.encode_type_signature(local, &mut out)?;
		}
		Ok(out)
	}

	// -----------------------------------------------------------------------
	// Table construction
	// -----------------------------------------------------------------------

	fn build(&mut self) -> CoreResult<()> {
		self.finish_assembly_refs()?;

		let module_name = self.strings.intern(&self.model.module.name);
		let mvid = self.guids.add(self.model.mvid.to_uuid().to_bytes_le());
		self.tables.module.push(ModuleRow { name: module_name, mv_id: mvid });

		self.tables.assembly.push(AssemblyRow {
			major_version: self.model.version.major,
			minor_version: self.model.version.minor,
			build_number: self.model.version.build,
			revision_number: self.model.version.revision,
			public_key: 0,
			name: self.strings.intern(&self.model.name),
			culture: 0,
		});

		let type_count = self.model.module.types.len();
		// Phase A: rows and per-type member ranges, in declaration order. A tombstoned
		// type (`Rewriter::remove_type`) contributes no `TypeDef` row at all, so
		// `model.module.types[i]` is no longer necessarily row `i + 1`; `type_row_of`
		// carries the mapping for whatever `TypeRef::Local` references survive. This
		// crate's loader never synthesizes a `<Module>` pseudo-type, so neither does
		// the writer.
		for type_index in 0..type_count {
			let def = &self.model.module.types[type_index];
			if def.removed {
				continue;
			}
			let field_list = (self.tables.field.len() + 1) as u32;
			let method_list = (self.tables.method_def.len() + 1) as u32;

			let extends = match &def.base_type {
				Some(base) => self.resolve_type(base)?.coded_type_def_or_ref(),
				// `0` is a *valid* `TypeDefOrRef` (TypeDef row 0) and would silently
				// resolve to this module's first declared type on read-back; `3` is
				// the one discriminant `TypeDefOrRef`'s 2-bit tag can't represent, so
				// `TryFrom` fails and the loader correctly produces `None`.
				None => 3,
			};

			self.tables.type_def.push(TypeDefRow {
				flags: def.attributes.bits(),
				type_name: self.strings.intern(&def.name),
				type_namespace: self.strings.intern(&def.namespace),
				extends,
				field_list,
				method_list,
			});
			self.type_row_of.insert(type_index, self.tables.type_def.len() as u32);

			for field in def.fields.iter().filter(|f| !f.removed) {
				self.build_field(type_index, field)?;
			}
			for method_index in 0..def.methods.len() {
				if def.methods[method_index].removed {
					continue;
				}
				self.build_method(type_index, method_index)?;
			}
		}

		// Properties/events/constants/generic params reference rows built above, so
		// they run as a second sweep over the same type list.
		for type_index in 0..type_count {
			if self.model.module.types[type_index].removed {
				continue;
			}
			self.build_properties_and_events(type_index)?;
		}

		self.build_target_framework_attribute()?;
		self.resources_blob = self.build_resources()?;

		Ok(())
	}

	fn build_field(&mut self, type_index: usize, field: &FieldDef) -> CoreResult<()> {
		let signature = self.encode_field_signature(&field.ty)?;
		let signature = self.blobs.intern(&signature)?;
		self.tables.field.push(FieldRow { flags: field.attributes.bits(), name: self.strings.intern(&field.name), signature });
		let row = self.tables.field.len() as u32;
		self.field_row_of.insert((type_index, self.tables.field.len() - 1), row);

		if let Some(constant) = &field.constant {
			let value = self.blobs.intern(constant)?;
			// `HasConstant`: `[Field, Param, Property]`, 2-bit tag; Field is 0.
			self.tables.constant.push(ConstantRow { ty: Self::constant_type_tag(&field.ty), parent: row << 2, value });
		}
		Ok(())
	}

	/// Best-effort element-type byte for a `Constant` row's `Type` column, derived
	/// from the field's own declared type. Anything outside the common primitive set
	/// used for literal constants (numbers, strings, `null`) falls back to `0x0E`
	/// (`String`) since .NET rarely gives a field a non-primitive constant.
	fn constant_type_tag(ty: &TypeRef) -> u8 {
		Self::primitive_tag(ty).unwrap_or(0x0E)
	}

	fn build_method(&mut self, type_index: usize, method_index: usize) -> CoreResult<()> {
		let def = &self.model.module.types[type_index].methods[method_index];
		let params: Vec<TypeRef> = def.params.iter().map(|p| p.ty.clone()).collect();
		let signature = self.encode_method_signature(!def.is_static(), def.generic_param_count, &params, &def.return_type)?;
		let signature = self.blobs.intern(&signature)?;
		let name = self.strings.intern(&def.name);
		let param_list = (self.tables.param.len() + 1) as u32;

		self.tables.method_def.push(MethodDefRow {
			rva: 0, // patched once method bodies are laid out in the image
			impl_flags: def.impl_attributes.bits(),
			flags: def.attributes.bits(),
			name,
			signature,
			param_list,
		});
		let row = self.tables.method_def.len() as u32;
		self.method_row_of.insert((type_index, method_index), row);

		for (i, param) in def.params.iter().enumerate() {
			let name = self.strings.intern(&param.name);
			self.tables.param.push(ParamRow { sequence: (i + 1) as u16, name });
		}

		for ordinal in 0..def.generic_param_count {
			let name = self.strings.intern(&format!("T{ordinal}"));
			// `TypeOrMethodDef`: `[TypeDef, MethodDef]`, 1-bit tag; MethodDef is 1.
			self.tables.generic_param.push(GenericParamRow { number: ordinal as u16, owner: (row << 1) | 1, name });
		}

		Ok(())
	}

	fn build_properties_and_events(&mut self, type_index: usize) -> CoreResult<()> {
		let def = &self.model.module.types[type_index];
		let type_row = self.type_row_of[&type_index];

		if !def.properties.is_empty() {
			let property_list = (self.tables.property.len() + 1) as u32;
			self.tables.property_map.push(PropertyMapRow { parent: type_row, property_list });
			for property_index in 0..def.properties.len() {
				self.build_property(type_index, property_index)?;
			}
		}

		if !def.events.is_empty() {
			let event_list = (self.tables.event.len() + 1) as u32;
			self.tables.event_map.push(EventMapRow { parent: type_row, event_list });
			for event_index in 0..def.events.len() {
				self.build_event(type_index, event_index)?;
			}
		}

		Ok(())
	}

	fn build_property(&mut self, type_index: usize, property_index: usize) -> CoreResult<()> {
		let property: &PropertyDef = &self.model.module.types[type_index].properties[property_index];
		let has_this = match property.getter.or(property.setter) {
			Some(method_index) => !self.model.module.types[type_index].methods[method_index.0].is_static(),
			None => true,
		};
		let signature = self.encode_property_signature(&property.ty, has_this)?;
		let signature = self.blobs.intern(&signature)?;
		let name = self.strings.intern(&property.name);
		self.tables.property.push(PropertyRow { flags: property.attributes.bits(), name, ty: signature });
		let property_row = self.tables.property.len() as u32;
		// `HasSemantics`: `[Event, Property]`, 1-bit tag; Property is 1.
		let association = (property_row << 1) | 1;

		if let Some(getter) = property.getter {
			if let Some(&method_row) = self.method_row_of.get(&(type_index, getter.0)) {
				self.tables.method_semantics.push(MethodSemanticsRow { flags: MethodSemanticsAttributes::GETTER.bits(), method: method_row, association });
			}
		}
		if let Some(setter) = property.setter {
			if let Some(&method_row) = self.method_row_of.get(&(type_index, setter.0)) {
				self.tables.method_semantics.push(MethodSemanticsRow { flags: MethodSemanticsAttributes::SETTER.bits(), method: method_row, association });
			}
		}
		Ok(())
	}

	fn build_event(&mut self, type_index: usize, event_index: usize) -> CoreResult<()> {
		let event = &self.model.module.types[type_index].events[event_index];
		let ty = self.resolve_type(&event.event_type)?.coded_type_def_or_ref();
		let name = self.strings.intern(&event.name);
		self.tables.event.push(EventRow { flags: event.attributes.bits(), name, ty });
		let event_row = self.tables.event.len() as u32;
		// `HasSemantics`: `[Event, Property]`, 1-bit tag; Event is 0.
		let association = event_row << 1;

		if let Some(add) = event.add {
			if let Some(&method_row) = self.method_row_of.get(&(type_index, add.0)) {
				self.tables.method_semantics.push(MethodSemanticsRow { flags: MethodSemanticsAttributes::ADD_ON.bits(), method: method_row, association });
			}
		}
		if let Some(remove) = event.remove {
			if let Some(&method_row) = self.method_row_of.get(&(type_index, remove.0)) {
				self.tables.method_semantics.push(MethodSemanticsRow { flags: MethodSemanticsAttributes::REMOVE_ON.bits(), method: method_row, association });
			}
		}
		Ok(())
	}

	/// A narrowly-scoped `CustomAttribute` addition: `TargetFrameworkAttribute`
	/// round-trips `target_framework_moniker` and nothing else goes through this
	/// table. Shaped exactly to what `loader::find_target_framework_attribute`
	/// requires: a `MemberRef`-typed attribute whose parent `TypeRef`'s `type_name`
	/// is literally `"TargetFrameworkAttribute"`, and a value blob of a `u16` prolog
	/// of `1` followed by a length-prefixed UTF-8 moniker string.
	fn build_target_framework_attribute(&mut self) -> CoreResult<()> {
		let Some(moniker) = &self.model.target_framework_moniker else { return Ok(()) };

		let attribute_type = TypeRef::external("System.Private.CoreLib", "System.Runtime.Versioning.TargetFrameworkAttribute");

		let ctor = MemberRef::ExternalMethod {
			declaring_type: attribute_type,
			name: ".ctor".to_string(),
			param_types: vec![TypeRef::external("System.Private.CoreLib", "System.String")],
			return_type: TypeRef::void(),
			generic_arity: 0,
		};
		let ctor_row = match self.resolve_member(&ctor)? {
			ResolvedMember::MemberRef(row) => row,
			_ => unreachable!("ExternalMethod always resolves to a MemberRef row"),
		};

		let mut value = Vec::new();
		value.extend_from_slice(&1u16.to_le_bytes());
		push_compressed(&mut value, moniker.len() as u32)?;
		value.extend_from_slice(moniker.as_bytes());
		let value = self.blobs.intern(&value)?;

		// `HasCustomAttribute` Assembly discriminant is 14 (5-bit tag); there is
		// exactly one `Assembly` row, at table row 1.
		let parent = (1u32 << 5) | 14;
		// `CustomAttributeType` uses a hardcoded 3-bit discriminant scheme rather
		// than a position index: MemberRef is `3` (not `1`).
		let ty = (ctor_row << 3) | 3;
		self.tables.custom_attribute.push(CustomAttributeRow { parent, ty, value });
		Ok(())
	}

	/// Resource bytes are embedded but `loader::read_manifest_resource` always
	/// returns an empty `Vec` regardless of what is written here — a pre-existing
	/// limitation of this crate's own reader, not a round-trip the writer can fix.
	/// The bytes are still written correctly per ECMA-335 §II.24.2.2 for any other
	/// consumer.
	fn build_resources(&mut self) -> CoreResult<Vec<u8>> {
		let mut blob = Vec::new();
		for resource in &self.model.module.resources {
			let offset = blob.len() as u32;
			blob.extend_from_slice(&(resource.data.len() as u32).to_le_bytes());
			blob.extend_from_slice(&resource.data);
			let name = self.strings.intern(&resource.name);
			self.tables.manifest_resource.push(ManifestResourceRow { offset, name });
		}
		Ok(blob)
	}

	// -----------------------------------------------------------------------
	// Method bodies
	// -----------------------------------------------------------------------

	/// Encodes one method body (always fat format, `InitLocals` always set) and
	/// returns its bytes plus the `StandAloneSig` blob index for its locals, if any.
	fn encode_body(&mut self, type_index: usize, method_index: usize, body: &MethodBody) -> CoreResult<Vec<u8>> {
		let layout = layout(&body.instructions);
		let mut code = Vec::with_capacity(layout.total_size as usize);
		for instruction in &body.instructions {
			self.encode_instruction(type_index, method_index, instruction, &layout, &mut code)?;
		}

		let local_sig_token = if body.locals.is_empty() {
			0
		} else {
			let signature = self.encode_local_var_signature(&body.locals)?;
			let signature = self.blobs.intern(&signature)?;
			self.tables.stand_alone_sig.push(StandAloneSigRow { signature });
			(0x11 << 24) | self.tables.stand_alone_sig.len() as u32
		};

		let has_eh = !body.exception_handlers.is_empty();
		let mut flags: u16 = 0x3; // CorILMethod_FatFormat
		flags |= 0x10; // CorILMethod_InitLocals
		if has_eh {
			flags |= 0x08; // CorILMethod_MoreSects
		}
		let header = (3u16 << 12) | flags;

		let mut out = Vec::new();
		out.extend_from_slice(&header.to_le_bytes());
		out.extend_from_slice(&8u16.to_le_bytes()); // max stack: always 8, see design notes
		out.extend_from_slice(&(code.len() as u32).to_le_bytes());
		out.extend_from_slice(&local_sig_token.to_le_bytes());
		out.extend_from_slice(&code);

		if has_eh {
			while out.len() % 4 != 0 {
				out.push(0);
			}
			self.encode_exception_handlers(&body.exception_handlers, &layout, &mut out)?;
		}

		Ok(out)
	}

	fn encode_exception_handlers(&self, handlers: &[ExceptionHandler], layout: &Layout, out: &mut Vec<u8>) -> CoreResult<()> {
		let data_size = 4 + handlers.len() * 24;
		out.push(0x41); // CorILMethod_Sect_EHTable | CorILMethod_Sect_FatFormat
		out.push((data_size & 0xFF) as u8);
		out.push(((data_size >> 8) & 0xFF) as u8);
		out.push(((data_size >> 16) & 0xFF) as u8);

		for handler in handlers {
			let try_offset = layout.offset_of(handler.try_start).unwrap_or(0);
			let try_end = layout.offset_of(handler.try_end).unwrap_or(try_offset);
			let handler_offset = layout.offset_of(handler.handler_start).unwrap_or(0);
			let handler_end = layout.offset_of(handler.handler_end).unwrap_or(handler_offset);

			let (flags, class_token) = match handler.catch_type {
				Some(type_index) => (0u32, (0x02u32 << 24) | (type_index.0 as u32 + 1)),
				None => (2u32, 0u32), // Finally
			};

			out.extend_from_slice(&flags.to_le_bytes());
			out.extend_from_slice(&try_offset.to_le_bytes());
			out.extend_from_slice(&(try_end.saturating_sub(try_offset)).to_le_bytes());
			out.extend_from_slice(&handler_offset.to_le_bytes());
			out.extend_from_slice(&(handler_end.saturating_sub(handler_offset)).to_le_bytes());
			out.extend_from_slice(&class_token.to_le_bytes());
		}
		Ok(())
	}

	fn push_member_token(&mut self, instruction: &Instruction, out: &mut Vec<u8>) -> CoreResult<()> {
		let Operand::Member(member) = &instruction.operand else {
			return Err(CoreError::new(ErrorCode::CompilationError, "instruction requires a member operand"));
		};
		let token = self.resolve_member(member)?.token();
		out.extend_from_slice(&token.to_le_bytes());
		Ok(())
	}

	fn push_type_token(&mut self, instruction: &Instruction, out: &mut Vec<u8>) -> CoreResult<()> {
		let Operand::Type(ty) = &instruction.operand else {
			return Err(CoreError::new(ErrorCode::CompilationError, "instruction requires a type operand"));
		};
		let token = self.resolve_type(ty)?.token();
		out.extend_from_slice(&token.to_le_bytes());
		Ok(())
	}

	fn push_string_token(&mut self, instruction: &Instruction, out: &mut Vec<u8>) -> CoreResult<()> {
		let Operand::String(s) = &instruction.operand else {
			return Err(CoreError::new(ErrorCode::CompilationError, "instruction requires a string operand"));
		};
		let offset = self.user_strings.intern(s)?;
		// `String` metadata token kind (`0x70`); the index is a raw byte offset into
		// `#US`, not a row number.
		let token = (0x70u32 << 24) | offset;
		out.extend_from_slice(&token.to_le_bytes());
		Ok(())
	}

	fn branch_displacement(layout: &Layout, instruction: &Instruction, target: crate::model::InstructionIndex) -> CoreResult<i64> {
		let from = layout.offset_of(instruction.id).ok_or_else(|| CoreError::new(ErrorCode::CompilationError, "branch instruction missing from layout"))?;
		let size = *layout.sizes.get(&instruction.id).ok_or_else(|| CoreError::new(ErrorCode::CompilationError, "branch instruction missing size"))?;
		let to = layout.offset_of(target).ok_or_else(|| CoreError::new(ErrorCode::CompilationError, "branch target missing from layout"))?;
		Ok(to as i64 - (from + size) as i64)
	}

	fn encode_instruction(&mut self, _type_index: usize, _method_index: usize, instruction: &Instruction, layout: &Layout, out: &mut Vec<u8>) -> CoreResult<()> {
		use Mnemonic::*;
		match instruction.mnemonic {
			Nop => out.push(0x00),
			LoadNull => out.push(0x14),
			LoadIntDedicated(v) => out.push(if v == -1 { 0x15 } else { (0x16 + v) as u8 }),
			LoadIntShort(v) => {
				out.push(0x1F);
				out.push(v as u8);
			},
			LoadIntLong(v) => {
				out.push(0x20);
				out.extend_from_slice(&v.to_le_bytes());
			},
			LoadLong(v) => {
				out.push(0x21);
				out.extend_from_slice(&v.to_le_bytes());
			},
			LoadFloat32(v) => {
				out.push(0x22);
				out.extend_from_slice(&v.to_le_bytes());
			},
			LoadFloat64(v) => {
				out.push(0x23);
				out.extend_from_slice(&v.to_le_bytes());
			},
			LoadString => {
				out.push(0x72);
				self.push_string_token(instruction, out)?;
			},
			LoadArgDedicated(v) => out.push(0x02 + v),
			LoadArgShort(v) => {
				out.push(0x0E);
				out.push(v);
			},
			LoadArgLong(v) => {
				out.push(0xFE);
				out.push(0x09);
				out.extend_from_slice(&v.to_le_bytes());
			},
			StoreArgShort(v) => {
				out.push(0x10);
				out.push(v);
			},
			StoreArgLong(v) => {
				out.push(0xFE);
				out.push(0x0B);
				out.extend_from_slice(&v.to_le_bytes());
			},
			LoadLocDedicated(v) => out.push(0x06 + v),
			LoadLocShort(v) => {
				out.push(0x11);
				out.push(v);
			},
			LoadLocLong(v) => {
				out.push(0xFE);
				out.push(0x0C);
				out.extend_from_slice(&v.to_le_bytes());
			},
			StoreLocDedicated(v) => out.push(0x0A + v),
			StoreLocShort(v) => {
				out.push(0x13);
				out.push(v);
			},
			StoreLocLong(v) => {
				out.push(0xFE);
				out.push(0x0E);
				out.extend_from_slice(&v.to_le_bytes());
			},
			LoadField => {
				out.push(0x7B);
				self.push_member_token(instruction, out)?;
			},
			LoadFieldAddress => {
				out.push(0x7C);
				self.push_member_token(instruction, out)?;
			},
			StoreField => {
				out.push(0x7D);
				self.push_member_token(instruction, out)?;
			},
			LoadStaticField => {
				out.push(0x7E);
				self.push_member_token(instruction, out)?;
			},
			StoreStaticField => {
				out.push(0x80);
				self.push_member_token(instruction, out)?;
			},
			Call => {
				out.push(0x28);
				self.push_member_token(instruction, out)?;
			},
			CallVirtual => {
				out.push(0x6F);
				self.push_member_token(instruction, out)?;
			},
			NewObject => {
				out.push(0x73);
				self.push_member_token(instruction, out)?;
			},
			Add => out.push(0x58),
			Sub => out.push(0x59),
			Mul => out.push(0x5A),
			Div => out.push(0x5B),
			Ceq => {
				out.push(0xFE);
				out.push(0x01);
			},
			Cgt => {
				out.push(0xFE);
				out.push(0x02);
			},
			Clt => {
				out.push(0xFE);
				out.push(0x04);
			},
			Dup => out.push(0x25),
			Pop => out.push(0x26),
			Ret => out.push(0x2A),
			Branch | BranchIfTrue | BranchIfFalse | BranchIfEqual => {
				let Operand::Branch(target) = &instruction.operand else {
					return Err(CoreError::new(ErrorCode::CompilationError, "branch instruction missing a target operand"));
				};
				let target = *target;
				let wide = fixed_instruction_size(instruction).is_none()
					&& layout.sizes.get(&instruction.id).copied().unwrap_or(2) == 5;
				let (short_op, long_op) = match instruction.mnemonic {
					Branch => (0x2Bu8, 0x38u8),
					BranchIfTrue => (0x2D, 0x3A),
					BranchIfFalse => (0x2C, 0x39),
					BranchIfEqual => (0x2E, 0x3B),
					_ => unreachable!(),
				};
				let displacement = Self::branch_displacement(layout, instruction, target)?;
				if wide {
					out.push(long_op);
					out.extend_from_slice(&(displacement as i32).to_le_bytes());
				} else {
					out.push(short_op);
					out.push(displacement as i8 as u8);
				}
			},
			CastClass => {
				out.push(0x74);
				self.push_type_token(instruction, out)?;
			},
			IsInstance => {
				out.push(0x75);
				self.push_type_token(instruction, out)?;
			},
			Box => {
				out.push(0x8C);
				self.push_type_token(instruction, out)?;
			},
			UnboxAny => {
				out.push(0xA5);
				self.push_type_token(instruction, out)?;
			},
			NewArray => {
				out.push(0x8D);
				self.push_type_token(instruction, out)?;
			},
			LoadArrayLength => out.push(0x8E),
			Throw => out.push(0x7A),
			LoadToken => {
				out.push(0xD0);
				self.push_member_token(instruction, out)?;
			},
			Raw(opcode) => {
				if opcode.is_two_byte() {
					out.push(0xFE);
					out.push((opcode.0 & 0xFF) as u8);
				} else {
					out.push(opcode.0 as u8);
				}
				match &instruction.operand {
					Operand::None => {},
					Operand::RawBytes(bytes) => out.extend_from_slice(bytes),
					Operand::Member(_) => self.push_member_token(instruction, out)?,
					Operand::Type(_) => self.push_type_token(instruction, out)?,
					Operand::String(_) => self.push_string_token(instruction, out)?,
					Operand::Local(v) | Operand::Argument(v) => {
						let extra = raw_operand_extra_bytes(opcode, &instruction.operand);
						if extra == 1 {
							out.push(*v as u8);
						} else {
							out.extend_from_slice(&v.to_le_bytes());
						}
					},
					Operand::Branch(target) => {
						let extra = raw_operand_extra_bytes(opcode, &instruction.operand);
						let displacement = Self::branch_displacement(layout, instruction, *target)?;
						if extra == 1 {
							out.push(displacement as i8 as u8);
						} else {
							out.extend_from_slice(&(displacement as i32).to_le_bytes());
						}
					},
				}
			},
		}
		Ok(())
	}

	// -----------------------------------------------------------------------
	// Final assembly: `#~` stream, heap streams, PE image
	// -----------------------------------------------------------------------

	fn finish(mut self) -> CoreResult<Vec<u8>> {
		// Bodies are encoded up front so every method's final byte size is known
		// before the image's layout (and thus every RVA) is fixed.
		let mut bodies: Vec<(usize, Vec<u8>)> = Vec::new();
		for type_index in 0..self.model.module.types.len() {
			if self.model.module.types[type_index].removed {
				continue;
			}
			for method_index in 0..self.model.module.types[type_index].methods.len() {
				let method = &self.model.module.types[type_index].methods[method_index];
				if method.removed || method.attributes.contains(MethodAttributes::ABSTRACT) || method.body.instructions.is_empty() {
					continue;
				}
				let body = method.body.clone();
				let bytes = self.encode_body(type_index, method_index, &body)?;
				let row = self.method_row_of[&(type_index, method_index)];
				bodies.push((row as usize, bytes));
			}
		}

		let resources_blob = std::mem::take(&mut self.resources_blob);

		let string_heap = self.strings.finish();
		let blob_heap = self.blobs.finish();
		let guid_heap = self.guids.finish();
		let user_string_heap = self.user_strings.finish();

		let widths = Widths::compute(&self.tables, string_heap.len(), guid_heap.len(), blob_heap.len());
		let metadata_root = build_metadata_root(&self.tables, &widths, &string_heap, &blob_heap, &guid_heap, &user_string_heap)?;

		assemble_image(&bodies, &metadata_root, &resources_blob, &mut self.tables, &widths)
	}
}

/// Computes the fat method-header RVA placement and patches every `MethodDefRow`'s
/// `rva` plus the image bytes in one pass, then assembles the full PE32 file.
fn assemble_image(bodies: &[(usize, Vec<u8>)], metadata_root: &[u8], resources: &[u8], tables: &mut Tables, _widths: &Widths) -> CoreResult<Vec<u8>> {
	const IMAGE_BASE: u32 = 0x0040_0000;
	const SECTION_ALIGNMENT: u32 = 0x2000;
	const FILE_ALIGNMENT: u32 = 0x200;
	const TEXT_RVA: u32 = 0x2000;

	fn round_up(value: u32, multiple: u32) -> u32 {
		((value + multiple - 1) / multiple) * multiple
	}

	// .text layout, in order: CLI header, method bodies (4-byte aligned each),
	// metadata root, resources blob.
	let cli_header_rva = TEXT_RVA;
	let cli_header_size = 72u32;
	let mut cursor = cli_header_rva + cli_header_size;

	let mut body_rvas = Vec::with_capacity(bodies.len());
	let mut text = vec![0u8; cli_header_size as usize];
	for (row, bytes) in bodies {
		while cursor % 4 != 0 {
			text.push(0);
			cursor += 1;
		}
		body_rvas.push((*row, cursor));
		text.extend_from_slice(bytes);
		cursor += bytes.len() as u32;
	}
	for (row, rva) in &body_rvas {
		tables.method_def[row - 1].rva = *rva;
	}

	while cursor % 4 != 0 {
		text.push(0);
		cursor += 1;
	}
	let metadata_rva = cursor;
	text.extend_from_slice(metadata_root);
	cursor += metadata_root.len() as u32;

	let resources_rva = cursor;
	text.extend_from_slice(resources);
	cursor += resources.len() as u32;

	let text_virtual_size = text.len() as u32;
	let text_raw_size = round_up(text_virtual_size, FILE_ALIGNMENT);
	text.resize(text_raw_size as usize, 0);

	// CLI header, now that every RVA it references is known.
	let cli_header = {
		let mut h = Vec::with_capacity(cli_header_size as usize);
		h.extend_from_slice(&cli_header_size.to_le_bytes());
		h.extend_from_slice(&2u16.to_le_bytes()); // major runtime version
		h.extend_from_slice(&5u16.to_le_bytes()); // minor runtime version
		h.extend_from_slice(&metadata_rva.to_le_bytes());
		h.extend_from_slice(&(metadata_root.len() as u32).to_le_bytes());
		h.extend_from_slice(&1u32.to_le_bytes()); // RuntimeFlags::IL_ONLY
		h.extend_from_slice(&0u32.to_le_bytes()); // entry point token: none
		h.extend_from_slice(&(if resources.is_empty() { 0 } else { resources_rva }).to_le_bytes());
		h.extend_from_slice(&(resources.len() as u32).to_le_bytes());
		h.extend_from_slice(&0u64.to_le_bytes()); // strong name signature
		h.extend_from_slice(&0u64.to_le_bytes()); // code manager table
		h.extend_from_slice(&0u64.to_le_bytes()); // v-table fixups
		h.extend_from_slice(&0u64.to_le_bytes()); // export address table jumps
		h.extend_from_slice(&0u64.to_le_bytes()); // managed native header
		h
	};
	text[..cli_header_size as usize].copy_from_slice(&cli_header);

	// --- Headers ---
	const SECTION_HEADER_SIZE: u32 = 40;
	const OPTIONAL_HEADER_SIZE: u32 = 224;
	const FILE_HEADER_SIZE: u32 = 20;
	const DOS_STUB_SIZE: u32 = 128; // DOSHeader (64 bytes) + padding up to the PE signature
	let headers_raw_size = DOS_STUB_SIZE + 4 + FILE_HEADER_SIZE + OPTIONAL_HEADER_SIZE + SECTION_HEADER_SIZE;
	let size_of_headers = round_up(headers_raw_size, FILE_ALIGNMENT);
	let size_of_image = round_up(TEXT_RVA + round_up(text_virtual_size, SECTION_ALIGNMENT), SECTION_ALIGNMENT);

	let mut image = Vec::with_capacity((size_of_headers + text_raw_size) as usize);

	// DOS header: only `magic` and `new_header_start` are meaningful; no native
	// bootstrap stub is emitted (this crate never produces an OS-loadable,
	// natively-runnable image — only IL-only assemblies the CLR loads).
	image.extend_from_slice(&0x5A4Du16.to_le_bytes());
	image.resize(60, 0);
	image.extend_from_slice(&DOS_STUB_SIZE.to_le_bytes());
	image.resize(DOS_STUB_SIZE as usize, 0);

	// PE signature + COFF file header.
	image.extend_from_slice(&0x0000_4550u32.to_le_bytes());
	image.extend_from_slice(&0x014Cu16.to_le_bytes()); // IMAGE_FILE_MACHINE_I386
	image.extend_from_slice(&1u16.to_le_bytes()); // number of sections
	image.extend_from_slice(&0u32.to_le_bytes()); // timestamp
	image.extend_from_slice(&0u32.to_le_bytes()); // pointer to symbol table
	image.extend_from_slice(&0u32.to_le_bytes()); // number of symbols
	image.extend_from_slice(&(OPTIONAL_HEADER_SIZE as u16).to_le_bytes());
	image.extend_from_slice(&0x2102u16.to_le_bytes()); // EXECUTABLE_IMAGE | 32BIT_MACHINE | DLL

	// PE32 optional header.
	image.extend_from_slice(&0x010Bu16.to_le_bytes());
	image.push(8); // major linker version
	image.push(0); // minor linker version
	image.extend_from_slice(&text_raw_size.to_le_bytes()); // size of code
	image.extend_from_slice(&0u32.to_le_bytes()); // size of initialized data
	image.extend_from_slice(&0u32.to_le_bytes()); // size of uninitialized data
	image.extend_from_slice(&0u32.to_le_bytes()); // entry point: none (IL-only)
	image.extend_from_slice(&TEXT_RVA.to_le_bytes()); // base of code
	image.extend_from_slice(&0u32.to_le_bytes()); // base of data
	image.extend_from_slice(&IMAGE_BASE.to_le_bytes());
	image.extend_from_slice(&SECTION_ALIGNMENT.to_le_bytes());
	image.extend_from_slice(&FILE_ALIGNMENT.to_le_bytes());
	image.extend_from_slice(&4u16.to_le_bytes()); // major OS version
	image.extend_from_slice(&0u16.to_le_bytes()); // minor OS version
	image.extend_from_slice(&0u16.to_le_bytes()); // major image version
	image.extend_from_slice(&0u16.to_le_bytes()); // minor image version
	image.extend_from_slice(&4u16.to_le_bytes()); // major subsystem version
	image.extend_from_slice(&0u16.to_le_bytes()); // minor subsystem version
	image.extend_from_slice(&0u32.to_le_bytes()); // win32 version value
	image.extend_from_slice(&size_of_image.to_le_bytes());
	image.extend_from_slice(&size_of_headers.to_le_bytes());
	image.extend_from_slice(&0u32.to_le_bytes()); // checksum
	image.extend_from_slice(&3u16.to_le_bytes()); // subsystem: CUI
	image.extend_from_slice(&0u16.to_le_bytes()); // DLL characteristics
	image.extend_from_slice(&0x10_0000u32.to_le_bytes()); // stack reserve
	image.extend_from_slice(&0x1000u32.to_le_bytes()); // stack commit
	image.extend_from_slice(&0x10_0000u32.to_le_bytes()); // heap reserve
	image.extend_from_slice(&0x1000u32.to_le_bytes()); // heap commit
	image.extend_from_slice(&0u32.to_le_bytes()); // loader flags
	image.extend_from_slice(&16u32.to_le_bytes()); // number of rva and sizes

	for i in 0..16u32 {
		let (rva, size) = if i == 14 { (cli_header_rva, cli_header_size) } else { (0, 0) };
		image.extend_from_slice(&rva.to_le_bytes());
		image.extend_from_slice(&size.to_le_bytes());
	}

	// Section header for `.text`.
	let mut name = [0u8; 8];
	name[..5].copy_from_slice(b".text");
	image.extend_from_slice(&name);
	image.extend_from_slice(&text_virtual_size.to_le_bytes());
	image.extend_from_slice(&TEXT_RVA.to_le_bytes());
	image.extend_from_slice(&text_raw_size.to_le_bytes());
	image.extend_from_slice(&size_of_headers.to_le_bytes());
	image.extend_from_slice(&0u32.to_le_bytes()); // relocations
	image.extend_from_slice(&0u32.to_le_bytes()); // line numbers
	image.extend_from_slice(&0u16.to_le_bytes());
	image.extend_from_slice(&0u16.to_le_bytes());
	image.extend_from_slice(&0x6000_0020u32.to_le_bytes()); // CODE | EXECUTE | READ

	image.resize(size_of_headers as usize, 0);
	image.extend_from_slice(&text);

	Ok(image)
}

fn write_heap_stream(out: &mut Vec<u8>, name: &str, offset: u32, size: u32) {
	out.extend_from_slice(&offset.to_le_bytes());
	out.extend_from_slice(&size.to_le_bytes());
	out.extend_from_slice(name.as_bytes());
	out.push(0);
	while out.len() % 4 != 0 {
		out.push(0);
	}
}

#[allow(clippy::too_many_arguments)]
fn build_metadata_root(
	tables: &Tables,
	widths: &Widths,
	string_heap: &[u8],
	blob_heap: &[u8],
	guid_heap: &[u8],
	user_string_heap: &[u8],
) -> CoreResult<Vec<u8>> {
	let table_stream = build_table_stream(tables, widths)?;

	let mut body = Vec::new(); // everything after the stream headers
	let streams: [(&str, &[u8]); 5] =
		[("#~", &table_stream), ("#Strings", string_heap), ("#US", user_string_heap), ("#GUID", guid_heap), ("#Blob", blob_heap)];

	// Stream headers are relative to the start of the metadata root, which is
	// computed below once the header block's own size is known.
	let mut header_sizes = Vec::new();
	for (name, _) in &streams {
		let mut h = Vec::new();
		write_heap_stream(&mut h, name, 0, 0);
		header_sizes.push(h.len());
	}
	let version = "v4.0.30319";
	let version_padded_len = ((version.len() + 1 + 3) / 4) * 4;
	let prologue_len = 4 + 2 + 2 + 4 + 4 + version_padded_len + 2 + 2;
	let headers_len: usize = header_sizes.iter().sum();
	let root_len = prologue_len + headers_len;

	let mut root = Vec::new();
	root.extend_from_slice(&0x424A_5342u32.to_le_bytes());
	root.extend_from_slice(&1u16.to_le_bytes()); // major version
	root.extend_from_slice(&1u16.to_le_bytes()); // minor version
	root.extend_from_slice(&0u32.to_le_bytes()); // reserved
	root.extend_from_slice(&(version_padded_len as u32).to_le_bytes());
	root.extend_from_slice(version.as_bytes());
	root.resize(root.len() + (version_padded_len - version.len()), 0);
	root.extend_from_slice(&0u16.to_le_bytes()); // flags
	root.extend_from_slice(&(streams.len() as u16).to_le_bytes());

	let mut offset = root_len as u32;
	for (name, data) in &streams {
		write_heap_stream(&mut root, name, offset, data.len() as u32);
		offset += data.len() as u32;
	}

	for (_, data) in &streams {
		body.extend_from_slice(data);
	}
	root.extend_from_slice(&body);
	Ok(root)
}

fn build_table_stream(tables: &Tables, widths: &Widths) -> CoreResult<Vec<u8>> {
	// (TableKind, row count, row-writer) in ascending discriminant order, matching
	// how `TableHeap::try_from` walks `valid`'s set bits.
	let mut valid: u64 = 0;
	let mut rows_present: Vec<(TableKind, u32)> = Vec::new();

	macro_rules! mark {
		($kind:expr, $count:expr) => {
			if $count > 0 {
				valid |= 1u64 << ($kind as u64);
				rows_present.push(($kind, $count as u32));
			}
		};
	}

	mark!(TableKind::Module, tables.module.len());
	mark!(TableKind::TypeRef, tables.type_ref.len());
	mark!(TableKind::TypeDef, tables.type_def.len());
	mark!(TableKind::Field, tables.field.len());
	mark!(TableKind::MethodDef, tables.method_def.len());
	mark!(TableKind::Param, tables.param.len());
	mark!(TableKind::MemberRef, tables.member_ref.len());
	mark!(TableKind::Constant, tables.constant.len());
	mark!(TableKind::CustomAttribute, tables.custom_attribute.len());
	mark!(TableKind::StandAloneSig, tables.stand_alone_sig.len());
	mark!(TableKind::EventMap, tables.event_map.len());
	mark!(TableKind::Event, tables.event.len());
	mark!(TableKind::PropertyMap, tables.property_map.len());
	mark!(TableKind::Property, tables.property.len());
	mark!(TableKind::MethodSemantics, tables.method_semantics.len());
	mark!(TableKind::TypeSpec, tables.type_spec.len());
	mark!(TableKind::Assembly, tables.assembly.len());
	mark!(TableKind::AssemblyRef, tables.assembly_ref.len());
	mark!(TableKind::ManifestResource, tables.manifest_resource.len());
	mark!(TableKind::GenericParam, tables.generic_param.len());

	rows_present.sort_by_key(|(kind, _)| *kind as u64);

	let mut out = Vec::new();
	out.extend_from_slice(&0u32.to_le_bytes()); // reserved
	out.push(2); // major version
	out.push(0); // minor version
	let heap_sizes = ((widths.string == 4) as u8) | (((widths.guid == 4) as u8) << 1) | (((widths.blob == 4) as u8) << 2);
	out.push(heap_sizes);
	out.push(1); // reserved
	out.extend_from_slice(&valid.to_le_bytes());
	out.extend_from_slice(&0u64.to_le_bytes()); // sorted: unused by this crate's reader

	for (_, count) in &rows_present {
		out.extend_from_slice(&count.to_le_bytes());
	}

	for (kind, _) in &rows_present {
		match kind {
			TableKind::Module => {
				for row in &tables.module {
					out.extend_from_slice(&0u16.to_le_bytes()); // generation
					write_at(&mut out, row.name, widths.string);
					write_at(&mut out, row.mv_id, widths.guid);
					write_at(&mut out, 0, widths.guid); // enc_id
					write_at(&mut out, 0, widths.guid); // enc_base_id
				}
			},
			TableKind::TypeRef => {
				for row in &tables.type_ref {
					write_at(&mut out, row.resolution_scope, widths.resolution_scope);
					write_at(&mut out, row.type_name, widths.string);
					write_at(&mut out, row.type_namespace, widths.string);
				}
			},
			TableKind::TypeDef => {
				for row in &tables.type_def {
					out.extend_from_slice(&row.flags.to_le_bytes());
					write_at(&mut out, row.type_name, widths.string);
					write_at(&mut out, row.type_namespace, widths.string);
					write_at(&mut out, row.extends, widths.type_def_or_ref);
					write_at(&mut out, row.field_list, widths.field);
					write_at(&mut out, row.method_list, widths.method_def);
				}
			},
			TableKind::Field => {
				for row in &tables.field {
					out.extend_from_slice(&row.flags.to_le_bytes());
					write_at(&mut out, row.name, widths.string);
					write_at(&mut out, row.signature, widths.blob);
				}
			},
			TableKind::MethodDef => {
				for row in &tables.method_def {
					out.extend_from_slice(&row.rva.to_le_bytes());
					out.extend_from_slice(&row.impl_flags.to_le_bytes());
					out.extend_from_slice(&row.flags.to_le_bytes());
					write_at(&mut out, row.name, widths.string);
					write_at(&mut out, row.signature, widths.blob);
					write_at(&mut out, row.param_list, widths.param);
				}
			},
			TableKind::Param => {
				for row in &tables.param {
					out.extend_from_slice(&0u16.to_le_bytes()); // flags
					out.extend_from_slice(&row.sequence.to_le_bytes());
					write_at(&mut out, row.name, widths.string);
				}
			},
			TableKind::MemberRef => {
				for row in &tables.member_ref {
					write_at(&mut out, row.class, widths.member_ref_parent);
					write_at(&mut out, row.name, widths.string);
					write_at(&mut out, row.signature, widths.blob);
				}
			},
			TableKind::Constant => {
				for row in &tables.constant {
					out.push(row.ty);
					out.push(0); // padding
					write_at(&mut out, row.parent, widths.has_constant);
					write_at(&mut out, row.value, widths.blob);
				}
			},
			TableKind::CustomAttribute => {
				for row in &tables.custom_attribute {
					write_at(&mut out, row.parent, widths.has_custom_attribute);
					write_at(&mut out, row.ty, widths.custom_attribute_type);
					write_at(&mut out, row.value, widths.blob);
				}
			},
			TableKind::StandAloneSig => {
				for row in &tables.stand_alone_sig {
					write_at(&mut out, row.signature, widths.blob);
				}
			},
			TableKind::EventMap => {
				for row in &tables.event_map {
					write_at(&mut out, row.parent, widths.type_def);
					write_at(&mut out, row.event_list, widths.event);
				}
			},
			TableKind::Event => {
				for row in &tables.event {
					out.extend_from_slice(&row.flags.to_le_bytes());
					write_at(&mut out, row.name, widths.string);
					write_at(&mut out, row.ty, widths.type_def_or_ref);
				}
			},
			TableKind::PropertyMap => {
				for row in &tables.property_map {
					write_at(&mut out, row.parent, widths.type_def);
					write_at(&mut out, row.property_list, widths.property);
				}
			},
			TableKind::Property => {
				for row in &tables.property {
					out.extend_from_slice(&row.flags.to_le_bytes());
					write_at(&mut out, row.name, widths.string);
					write_at(&mut out, row.ty, widths.blob);
				}
			},
			TableKind::MethodSemantics => {
				for row in &tables.method_semantics {
					out.extend_from_slice(&row.flags.to_le_bytes());
					write_at(&mut out, row.method, widths.method_def);
					write_at(&mut out, row.association, widths.has_semantics);
				}
			},
			TableKind::TypeSpec => {
				for row in &tables.type_spec {
					write_at(&mut out, row.signature, widths.blob);
				}
			},
			TableKind::Assembly => {
				for row in &tables.assembly {
					out.extend_from_slice(&(AssemblyHashAlgorithm::None as u32).to_le_bytes());
					out.extend_from_slice(&row.major_version.to_le_bytes());
					out.extend_from_slice(&row.minor_version.to_le_bytes());
					out.extend_from_slice(&row.build_number.to_le_bytes());
					out.extend_from_slice(&row.revision_number.to_le_bytes());
					out.extend_from_slice(&AssemblyFlags::empty().bits().to_le_bytes());
					write_at(&mut out, row.public_key, widths.blob);
					write_at(&mut out, row.name, widths.string);
					write_at(&mut out, row.culture, widths.string);
				}
			},
			TableKind::AssemblyRef => {
				for row in &tables.assembly_ref {
					out.extend_from_slice(&row.major_version.to_le_bytes());
					out.extend_from_slice(&row.minor_version.to_le_bytes());
					out.extend_from_slice(&row.build_number.to_le_bytes());
					out.extend_from_slice(&row.revision_number.to_le_bytes());
					out.extend_from_slice(&AssemblyFlags::empty().bits().to_le_bytes());
					write_at(&mut out, row.public_key_or_token, widths.blob);
					write_at(&mut out, row.name, widths.string);
					write_at(&mut out, row.culture, widths.string);
					write_at(&mut out, 0, widths.blob); // hash_value
				}
			},
			TableKind::ManifestResource => {
				for row in &tables.manifest_resource {
					out.extend_from_slice(&row.offset.to_le_bytes());
					out.extend_from_slice(&ManifestResourceAttributes::PUBLIC.bits().to_le_bytes());
					write_at(&mut out, row.name, widths.string);
					write_at(&mut out, 0, widths.implementation); // embedded in this module
				}
			},
			TableKind::GenericParam => {
				for row in &tables.generic_param {
					out.extend_from_slice(&row.number.to_le_bytes());
					out.extend_from_slice(&0u16.to_le_bytes()); // flags
					write_at(&mut out, row.owner, widths.type_or_method_def);
					write_at(&mut out, row.name, widths.string);
				}
			},
			_ => unreachable!("every marked table kind has a row writer above"),
		}
	}

	Ok(out)
}

/// Serializes `model` into a complete PE32/.NET assembly image.
pub fn serialize(model: &AssemblyModel) -> CoreResult<Vec<u8>> {
	let mut writer = Writer::new(model);
	writer.build()?;
	writer.finish()
}
