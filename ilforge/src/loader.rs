//! Opens a PE/CLI image, validates its headers, and materializes every metadata
//! table into the mutable [`crate::model::AssemblyModel`] the rest of the crate
//! operates on.
//!
//! Unlike the zero-copy [`crate::raw`] layer this produces an entirely owned graph:
//! the file buffer is dropped once parsing finishes. That trades the "materialize on
//! first access" deferral the format invites for a model the [`crate::rewriter`] can
//! mutate and serialize freely without juggling a borrow back into someone else's
//! file buffer.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use fxhash::FxHashMap;

use crate::errors::{CoreError, CoreResult, ErrorCode};
use crate::identifiers::Mvid;
use crate::model::{
	AssemblyModel, AssemblyRefDef, AssemblyVersion, EventDef, FieldDef, Instruction, InstructionIndex,
	ManifestResourceDef, MemberRef, MethodBody, MethodDef, Mnemonic, Module, Operand, Param, PropertyDef, RawOpcode,
	TypeDef, TypeIndex, TypeRef,
};
use crate::raw::assembly::Assembly;
use crate::raw::heaps::table::{
	AssemblyRefTable, AssemblyTable, ConstantTable, CustomAttributeTable, EventMapTable, EventTable, FieldTable,
	ManifestResourceTable, MemberRefTable, MethodDefTable, MethodSemanticsAttributes, MethodSemanticsTable,
	ParamTable, PropertyMapTable, PropertyTable, StandAloneSigTable, Table, TableHeap, TypeDefTable, TypeRefTable,
	TypeSpecTable,
};
use crate::raw::heaps::{BlobHeap, BlobIndex, GuidHeap, StringHeap, StringIndex, UserStringHeap};
use crate::raw::il::{MethodBody as RawMethodBody, OpCode, OpCodeIterator, TypeSignatureTag};
use crate::raw::indices::coded_index::{HasSemantics, MemberRefParent, ResolutionScope, TypeDefOrRef};
use crate::raw::indices::metadata_token::{MetadataToken, MetadataTokenKind};
use crate::raw::indices::row_index::{
	EventIndex as RawEventRow, FieldIndex as RawFieldRow, MethodDefIndex as RawMethodRow, PropertyIndex as RawPropertyRow,
};
use crate::raw::indices::sizes::IndexSizes;
use crate::raw::pe::PEFile;
use crate::raw::FromByteStream;
use crate::utilities::read_compressed_u32;

/// The name, version and dependency facts the loader reports about a freshly parsed
/// image, independent of the full model — cheap to hand back to a caller that only
/// wants to show a summary line.
#[derive(Debug, Clone)]
pub struct LoadSummary {
	pub name: String,
	pub full_name: String,
	pub version: AssemblyVersion,
	pub mvid: Mvid,
	pub target_framework_moniker: Option<String>,
	pub type_count: usize,
	pub dependencies: Vec<String>,
}

impl AssemblyModel {
	pub fn summary(&self) -> LoadSummary {
		LoadSummary {
			name: self.name.clone(),
			full_name: self.full_name.clone(),
			version: self.version,
			mvid: self.mvid,
			target_framework_moniker: self.target_framework_moniker.clone(),
			type_count: self.type_count(),
			dependencies: self.dependency_names().into_iter().map(str::to_string).collect(),
		}
	}
}

/// Reads `path` fully into memory (so the file is never held open across the call)
/// and parses it.
#[cfg_attr(feature = "tracing", tracing::instrument)]
pub fn load(path: impl AsRef<Path> + std::fmt::Debug) -> CoreResult<AssemblyModel> {
	let path = path.as_ref();
	let bytes = std::fs::read(path).map_err(|e| map_io_error(&e))?;
	load_from_memory(&bytes)
}

/// Parses an already in-memory image, e.g. one just produced by
/// `rewriter::save_to_memory` or fetched by the [`crate::resolver`].
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub fn load_from_memory(bytes: &[u8]) -> CoreResult<AssemblyModel> {
	let mut cursor = Cursor::new(bytes);
	let pe = PEFile::read(&mut cursor, &())
		.map_err(|e| CoreError::with_cause(ErrorCode::InvalidFormat, "not a valid PE image", e))?;
	let assembly = Assembly::try_from(pe)
		.map_err(|e| CoreError::with_cause(ErrorCode::InvalidFormat, "not a valid CLI image", e))?;

	let root = assembly.metadata_root();
	let tables = root
		.get_heap::<TableHeap>()
		.ok_or_else(|| CoreError::new(ErrorCode::InvalidFormat, "image carries no #~ metadata table stream"))?;
	let strings = root
		.get_heap::<StringHeap>()
		.ok_or_else(|| CoreError::new(ErrorCode::InvalidFormat, "image carries no #Strings heap"))?;
	let blobs = root.get_heap::<BlobHeap>().ok_or_else(|| CoreError::new(ErrorCode::InvalidFormat, "image carries no #Blob heap"))?;
	let guids = root.get_heap::<GuidHeap>().ok_or_else(|| CoreError::new(ErrorCode::InvalidFormat, "image carries no #GUID heap"))?;
	let index_sizes = tables.index_sizes();
	let user_strings = root.get_heap::<UserStringHeap>();

	let ctx = Ctx { tables, strings, blobs, user_strings, index_sizes: &index_sizes, pe_file: assembly.pe_file() };

	let module_row = tables
		.get_table::<crate::raw::heaps::table::ModuleTable>()
		.and_then(|t| t.rows().first())
		.ok_or_else(|| CoreError::new(ErrorCode::InvalidFormat, "image carries no Module table row"))?;
	let module_name = ctx.string(module_row.name);
	let mvid = guids
		.get(module_row.mv_id)
		.map(Mvid::from_uuid)
		.ok_or_else(|| CoreError::new(ErrorCode::InvalidFormat, "Module row has no MVID"))?;

	let assembly_row = tables.get_table::<AssemblyTable>().and_then(|t| t.rows().first());
	let (name, version) = match assembly_row {
		Some(row) => (
			ctx.string(row.name),
			AssemblyVersion { major: row.major_version, minor: row.minor_version, build: row.build_number, revision: row.revision_number },
		),
		None => (module_name.clone(), AssemblyVersion { major: 0, minor: 0, build: 0, revision: 0 }),
	};
	let full_name = format!("{name}, Version={}.{}.{}.{}", version.major, version.minor, version.build, version.revision);

	let target_framework_moniker =
		find_target_framework_attribute(&ctx).or_else(|| runtime_version_fallback(root.version()));

	let module = build_module(&ctx, module_name)?;

	Ok(AssemblyModel { name, full_name, version, mvid, target_framework_moniker, module })
}

fn map_io_error(error: &std::io::Error) -> CoreError {
	use std::io::ErrorKind::*;
	match error.kind() {
		NotFound => CoreError::with_cause(ErrorCode::AssemblyNotFound, "assembly file not found", clone_io_error(error)),
		PermissionDenied => CoreError::with_cause(ErrorCode::AccessDenied, "permission denied reading assembly file", clone_io_error(error)),
		_ => CoreError::with_cause(ErrorCode::InvalidFormat, "could not read assembly file", clone_io_error(error)),
	}
}

fn clone_io_error(error: &std::io::Error) -> std::io::Error {
	std::io::Error::new(error.kind(), error.to_string())
}

/// Bundles the heaps and tables every decoding helper needs so they can be passed
/// around as one reference instead of four or five.
struct Ctx<'l> {
	tables: &'l TableHeap,
	strings: &'l StringHeap<'l>,
	blobs: &'l BlobHeap<'l>,
	user_strings: Option<&'l UserStringHeap<'l>>,
	index_sizes: &'l Arc<IndexSizes>,
	pe_file: &'l PEFile<'l>,
}

macro_rules! rows {
	($ctx: expr, $table: ty) => {
		$ctx.tables.get_table::<$table>().map(|t| t.rows()).unwrap_or(&[])
	};
}

impl<'l> Ctx<'l> {
	fn string(&self, idx: StringIndex) -> String {
		self.strings.get(idx).unwrap_or_default().to_string()
	}

	fn blob(&self, idx: BlobIndex) -> &'l [u8] {
		self.blobs.get(idx).unwrap_or(&[])
	}

	/// Resolves a `TypeDef`/`TypeRef`/`TypeSpec` coded index to a [`TypeRef`].
	fn type_ref_from_coded(&self, coded: TypeDefOrRef) -> TypeRef {
		let token: MetadataToken = coded.into();
		self.type_ref_from_token(token)
	}

	fn type_ref_from_token(&self, token: MetadataToken) -> TypeRef {
		let row = token.index().saturating_sub(1);
		match token.kind() {
			MetadataTokenKind::TypeDef => TypeRef::Local(TypeIndex(row)),
			MetadataTokenKind::TypeRef => self.type_ref_from_type_ref_row(row),
			MetadataTokenKind::TypeSpec => {
				let spec = rows!(self, TypeSpecTable);
				match spec.get(row) {
					Some(spec) => {
						let blob = self.blob(spec.signature);
						let mut cursor = Cursor::new(blob);
						match TypeSignatureTag::read(&mut cursor, self.index_sizes) {
							Ok(tag) => self.type_ref_from_tag(&tag),
							Err(_) => TypeRef::external("", "<unreadable-type-spec>"),
						}
					},
					None => TypeRef::external("", "<unknown-type-spec>"),
				}
			},
			_ => TypeRef::external("", "<unresolvable-type-token>"),
		}
	}

	fn type_ref_from_type_ref_row(&self, row: usize) -> TypeRef {
		let type_refs = rows!(self, TypeRefTable);
		let Some(row) = type_refs.get(row) else {
			return TypeRef::external("", "<unknown-type-ref>");
		};
		let namespace = self.string(row.type_namespace);
		let name = self.string(row.type_name);
		let full_name = match namespace.is_empty() {
			true => name,
			false => format!("{namespace}.{name}"),
		};
		let assembly = self.resolution_scope_assembly_name(row.resolution_scope);
		TypeRef::external(assembly, full_name)
	}

	fn resolution_scope_assembly_name(&self, scope: ResolutionScope) -> String {
		let token: MetadataToken = scope.into();
		let row = token.index().saturating_sub(1);
		match token.kind() {
			MetadataTokenKind::AssemblyRef => {
				let refs = rows!(self, AssemblyRefTable);
				refs.get(row).map(|r| self.string(r.name)).unwrap_or_default()
			},
			MetadataTokenKind::TypeRef => {
				// Nested type: the assembly is whatever the enclosing type-ref resolves to.
				match self.type_ref_from_type_ref_row(row) {
					TypeRef::External { assembly, .. } => assembly,
					_ => String::new(),
				}
			},
			// Module / ModuleRef both mean "this assembly"; the loader has no name for
			// itself at this point in parsing, so the caller fills in "" meaning local.
			_ => String::new(),
		}
	}

	/// Converts a decoded signature element into the mutable model's own type
	/// vocabulary. Rarer shapes (function pointers, pinned locals, vararg
	/// sentinels) fold into the nearest representable case rather than failing the
	/// whole load, since they show up in bodies this crate does not try to
	/// recompile, only to preserve.
	fn type_ref_from_tag(&self, tag: &TypeSignatureTag) -> TypeRef {
		match tag {
			TypeSignatureTag::Void | TypeSignatureTag::Object => TypeRef::object(),
			TypeSignatureTag::Bool => TypeRef::external("System.Private.CoreLib", "System.Boolean"),
			TypeSignatureTag::Char => TypeRef::external("System.Private.CoreLib", "System.Char"),
			TypeSignatureTag::Int1 => TypeRef::external("System.Private.CoreLib", "System.SByte"),
			TypeSignatureTag::UInt1 => TypeRef::external("System.Private.CoreLib", "System.Byte"),
			TypeSignatureTag::Int2 => TypeRef::external("System.Private.CoreLib", "System.Int16"),
			TypeSignatureTag::UInt2 => TypeRef::external("System.Private.CoreLib", "System.UInt16"),
			TypeSignatureTag::Int4 => TypeRef::int32(),
			TypeSignatureTag::UInt4 => TypeRef::external("System.Private.CoreLib", "System.UInt32"),
			TypeSignatureTag::Int8 => TypeRef::external("System.Private.CoreLib", "System.Int64"),
			TypeSignatureTag::UInt8 => TypeRef::external("System.Private.CoreLib", "System.UInt64"),
			TypeSignatureTag::Float => TypeRef::external("System.Private.CoreLib", "System.Single"),
			TypeSignatureTag::Double => TypeRef::external("System.Private.CoreLib", "System.Double"),
			TypeSignatureTag::String => TypeRef::external("System.Private.CoreLib", "System.String"),
			TypeSignatureTag::IntPtr => TypeRef::external("System.Private.CoreLib", "System.IntPtr"),
			TypeSignatureTag::UIntPtr => TypeRef::external("System.Private.CoreLib", "System.UIntPtr"),
			TypeSignatureTag::TypedByRef => TypeRef::external("System.Private.CoreLib", "System.TypedReference"),
			TypeSignatureTag::ValueType(coded) => self.type_ref_from_coded(*coded),
			TypeSignatureTag::ClassType(coded) => self.type_ref_from_coded(*coded),
			TypeSignatureTag::GenericParam(ordinal) => TypeRef::GenericParam { ordinal: *ordinal, is_method_param: false },
			TypeSignatureTag::MethodGenericParam(ordinal) => TypeRef::GenericParam { ordinal: *ordinal, is_method_param: true },
			TypeSignatureTag::Pointer(inner) => TypeRef::Pointer(Box::new(self.type_ref_from_tag(&inner.as_tags_tree()))),
			TypeSignatureTag::Reference(inner) => TypeRef::ByRef(Box::new(self.type_ref_from_tag(&inner.as_tags_tree()))),
			TypeSignatureTag::SzArray(inner) => {
				TypeRef::Array { element: Box::new(self.type_ref_from_tag(&inner.as_tags_tree())), rank: 1 }
			},
			TypeSignatureTag::Pinned(inner) => self.type_ref_from_tag(&inner.as_tags_tree()),
			TypeSignatureTag::CModOpt(coded) => TypeRef::OptionalModifier {
				modifier: Box::new(self.type_ref_from_coded(*coded)),
				referent: Box::new(TypeRef::object()),
			},
			TypeSignatureTag::GenericInst(inst) => {
				let base = self.type_ref_from_tag(&inst.ty().as_tags_tree());
				let args = inst.params().map(|p| self.type_ref_from_tag(&p)).collect();
				TypeRef::GenericInstance { base: Box::new(base), args }
			},
			_ => TypeRef::object(),
		}
	}

	/// Resolves a `MemberRef`'s parent coded index (`TypeDef`/`TypeRef`/`TypeSpec`,
	/// rarely `ModuleRef`/`MethodDef` for vararg call sites and module-global
	/// members) to the [`TypeRef`] that declares the member.
	fn member_ref_parent_type(&self, parent: MemberRefParent) -> TypeRef {
		let token: MetadataToken = parent.into();
		match token.kind() {
			MetadataTokenKind::TypeDef | MetadataTokenKind::TypeRef | MetadataTokenKind::TypeSpec => self.type_ref_from_token(token),
			MetadataTokenKind::ModuleRef => TypeRef::external("", "<module-global>"),
			MetadataTokenKind::MethodDef => TypeRef::external("", "<vararg-site>"),
			_ => TypeRef::external("", "<unknown-member-parent>"),
		}
	}
}

/// Global-row -> (declaring type, local index) lookup for fields and methods,
/// computed once per load so IL operand decoding can turn a raw table row into
/// the model's own [`MemberRef::Method`]/[`MemberRef::Field`] without re-walking
/// every `TypeDef`'s field/method range for each instruction.
struct MemberMaps {
	method_owner: Vec<TypeIndex>,
	method_local: Vec<crate::model::MethodIndex>,
	field_owner: Vec<TypeIndex>,
	field_local: Vec<crate::model::FieldIndex>,
}

impl MemberMaps {
	fn local_method_ref(&self, row: usize) -> MemberRef {
		match (self.method_owner.get(row), self.method_local.get(row)) {
			(Some(&declaring_type), Some(&local)) => MemberRef::Method(declaring_type, local),
			_ => MemberRef::ExternalMethod {
				declaring_type: TypeRef::external("", "<unknown-method>"),
				name: String::new(),
				param_types: Vec::new(),
				return_type: TypeRef::object(),
				generic_arity: 0,
			},
		}
	}

	fn local_field_ref(&self, row: usize) -> MemberRef {
		match (self.field_owner.get(row), self.field_local.get(row)) {
			(Some(&declaring_type), Some(&local)) => MemberRef::Field(declaring_type, local),
			_ => MemberRef::ExternalField {
				declaring_type: TypeRef::external("", "<unknown-field>"),
				name: String::new(),
				field_type: TypeRef::object(),
			},
		}
	}
}

fn build_module(ctx: &Ctx, module_name: String) -> CoreResult<Module> {
	let type_defs = rows!(ctx, TypeDefTable);
	let fields_raw = rows!(ctx, FieldTable);
	let methods_raw = rows!(ctx, MethodDefTable);
	let params_raw = rows!(ctx, ParamTable);
	let standalone_sigs = ctx.tables.get_table::<StandAloneSigTable>();
	let empty_sigs = StandAloneSigTable::default();
	let standalone_sigs = standalone_sigs.unwrap_or(&empty_sigs);

	// Global-row -> (declaring type, local index) maps, derived purely from the
	// TypeDef field/method range columns so they're available for every row up
	// front — including rows a not-yet-built method body calls forward into.
	let mut field_owner = vec![TypeIndex(0); fields_raw.len()];
	let mut field_local = vec![crate::model::FieldIndex(0); fields_raw.len()];
	let mut method_owner = vec![TypeIndex(0); methods_raw.len()];
	let mut method_local = vec![crate::model::MethodIndex(0); methods_raw.len()];
	for (type_row, def) in type_defs.iter().enumerate() {
		let field_end = type_defs.get(type_row + 1).map(|t| t.field_list.0).unwrap_or(fields_raw.len() + 1);
		let method_end = type_defs.get(type_row + 1).map(|t| t.method_list.0).unwrap_or(methods_raw.len() + 1);
		for (local, i) in raw_range(def.field_list.0, field_end).enumerate() {
			if let Some(slot) = field_owner.get_mut(i) {
				*slot = TypeIndex(type_row);
			}
			if let Some(slot) = field_local.get_mut(i) {
				*slot = crate::model::FieldIndex(local);
			}
		}
		for (local, i) in raw_range(def.method_list.0, method_end).enumerate() {
			if let Some(slot) = method_owner.get_mut(i) {
				*slot = TypeIndex(type_row);
			}
			if let Some(slot) = method_local.get_mut(i) {
				*slot = crate::model::MethodIndex(local);
			}
		}
	}
	let members = MemberMaps { method_owner, method_local, field_owner, field_local };

	let constants = index_constants(ctx);

	// Build every type's fields and methods, keyed by declaring type.
	let mut fields_by_type: Vec<Vec<FieldDef>> = vec![Vec::new(); type_defs.len()];
	let mut field_global_to_local: Vec<(TypeIndex, crate::model::FieldIndex)> = Vec::with_capacity(fields_raw.len());
	for (row, field) in fields_raw.iter().enumerate() {
		let declaring_type = members.field_owner[row];
		let bucket = &mut fields_by_type[declaring_type.0];
		let local = crate::model::FieldIndex(bucket.len());
		let ty = decode_field_type(ctx, field.signature);
		bucket.push(FieldDef {
			declaring_type,
			name: ctx.string(field.name),
			ty,
			attributes: field.flags,
			constant: constants.get(&(MetadataTokenKind::Field, row)).cloned(),
			removed: false,
		});
		field_global_to_local.push((declaring_type, local));
	}

	let mut methods_by_type: Vec<Vec<MethodDef>> = vec![Vec::new(); type_defs.len()];
	let mut method_global_to_local: Vec<(TypeIndex, crate::model::MethodIndex)> = Vec::with_capacity(methods_raw.len());
	for (row, method) in methods_raw.iter().enumerate() {
		let declaring_type = members.method_owner[row];
		let param_end = methods_raw.get(row + 1).map(|m| m.param_list.0).unwrap_or(params_raw.len() + 1);
		let param_names = collect_param_names(ctx, params_raw, method.param_list.0, param_end);

		let (return_type, param_types, generic_param_count) = decode_method_signature(ctx, method.signature);
		let params = param_types
			.into_iter()
			.enumerate()
			.map(|(i, ty)| Param { name: param_names.get(i).cloned().unwrap_or_default(), ty })
			.collect();

		let body = match method.rva {
			0 => MethodBody::default(),
			rva => decode_method_body(ctx, &members, rva, standalone_sigs).unwrap_or_default(),
		};

		let bucket = &mut methods_by_type[declaring_type.0];
		let local = crate::model::MethodIndex(bucket.len());
		bucket.push(MethodDef {
			declaring_type,
			name: ctx.string(method.name),
			attributes: method.flags,
			impl_attributes: method.impl_flags,
			return_type,
			params,
			generic_param_count,
			body,
			removed: false,
		});
		method_global_to_local.push((declaring_type, local));
	}

	let mut properties_by_type: Vec<Vec<PropertyDef>> = vec![Vec::new(); type_defs.len()];
	let mut property_global_to_local: FxHashMap<usize, (TypeIndex, crate::model::PropertyIndex)> = FxHashMap::default();
	{
		let property_maps = rows!(ctx, PropertyMapTable);
		let properties_raw = rows!(ctx, PropertyTable);
		for (map_row, map) in property_maps.iter().enumerate() {
			let declaring_type = TypeIndex(map.parent.0.saturating_sub(1));
			let end = property_maps.get(map_row + 1).map(|m| m.property_list.0).unwrap_or(properties_raw.len() + 1);
			for global_row in raw_range(map.property_list.0, end) {
				let Some(property) = properties_raw.get(global_row) else { continue };
				let bucket = &mut properties_by_type[declaring_type.0];
				let local = crate::model::PropertyIndex(bucket.len());
				bucket.push(PropertyDef {
					declaring_type,
					name: ctx.string(property.name),
					attributes: property.flags,
					ty: decode_property_type(ctx, property.ty),
					getter: None,
					setter: None,
				});
				property_global_to_local.insert(global_row, (declaring_type, local));
			}
		}
	}

	let mut events_by_type: Vec<Vec<EventDef>> = vec![Vec::new(); type_defs.len()];
	let mut event_global_to_local: FxHashMap<usize, (TypeIndex, crate::model::EventIndex)> = FxHashMap::default();
	{
		let event_maps = rows!(ctx, EventMapTable);
		let events_raw = rows!(ctx, EventTable);
		for (map_row, map) in event_maps.iter().enumerate() {
			let declaring_type = TypeIndex(map.parent.0.saturating_sub(1));
			let end = event_maps.get(map_row + 1).map(|m| m.event_list.0).unwrap_or(events_raw.len() + 1);
			for global_row in raw_range(map.event_list.0, end) {
				let Some(event) = events_raw.get(global_row) else { continue };
				let bucket = &mut events_by_type[declaring_type.0];
				let local = crate::model::EventIndex(bucket.len());
				bucket.push(EventDef {
					declaring_type,
					name: ctx.string(event.name),
					attributes: event.flags,
					event_type: ctx.type_ref_from_coded(event.ty),
					add: None,
					remove: None,
				});
				event_global_to_local.insert(global_row, (declaring_type, local));
			}
		}
	}

	for semantics in rows!(ctx, MethodSemanticsTable) {
		let Some(&(_, method_local)) = method_global_to_local.get(semantics.method.0.saturating_sub(1)) else { continue };
		let association_token: MetadataToken = semantics.association.into();
		let row = association_token.index().saturating_sub(1);
		match association_token.kind() {
			MetadataTokenKind::Property => {
				let Some(&(type_idx, prop_local)) = property_global_to_local.get(&row) else { continue };
				let Some(prop) = properties_by_type[type_idx.0].get_mut(prop_local.0) else { continue };
				if semantics.flags.contains(MethodSemanticsAttributes::GETTER) {
					prop.getter = Some(method_local);
				}
				if semantics.flags.contains(MethodSemanticsAttributes::SETTER) {
					prop.setter = Some(method_local);
				}
			},
			MetadataTokenKind::Event => {
				let Some(&(type_idx, event_local)) = event_global_to_local.get(&row) else { continue };
				let Some(ev) = events_by_type[type_idx.0].get_mut(event_local.0) else { continue };
				if semantics.flags.contains(MethodSemanticsAttributes::ADD_ON) {
					ev.add = Some(method_local);
				}
				if semantics.flags.contains(MethodSemanticsAttributes::REMOVE_ON) {
					ev.remove = Some(method_local);
				}
			},
			_ => {},
		}
	}

	let mut types = Vec::with_capacity(type_defs.len());
	for (row, def) in type_defs.iter().enumerate() {
		types.push(TypeDef {
			namespace: ctx.string(def.type_namespace),
			name: ctx.string(def.type_name),
			attributes: def.flags,
			base_type: match def.extends.try_into() {
				Ok::<crate::raw::indices::coded_index::TypeDefOrRef, _>(coded) => Some(ctx.type_ref_from_coded(coded)),
				Err(_) => None,
			},
			fields: std::mem::take(&mut fields_by_type[row]),
			methods: std::mem::take(&mut methods_by_type[row]),
			properties: std::mem::take(&mut properties_by_type[row]),
			events: std::mem::take(&mut events_by_type[row]),
			removed: false,
		});
	}

	let assembly_refs = rows!(ctx, AssemblyRefTable)
		.iter()
		.map(|r| AssemblyRefDef {
			name: ctx.string(r.name),
			version: (r.major_version, r.minor_version, r.build_number, r.revision_number),
			public_key_or_token: ctx.blob(r.public_key_or_token).to_vec(),
			culture: ctx.string(r.culture),
		})
		.collect();

	let resources = rows!(ctx, ManifestResourceTable)
		.iter()
		.map(|r| ManifestResourceDef { name: ctx.string(r.name), data: read_manifest_resource(ctx, r) })
		.collect();

	Ok(Module { name: module_name, types, assembly_refs, resources })
}

/// Row-pointer columns in metadata tables are 1-based and exclusive-upper-bounded by
/// the next row's pointer (or the referenced table's length, one-past-end, for the
/// final row). This converts one such `(start, next)` pair into a 0-based range.
fn raw_range(start_raw: usize, next_raw: usize) -> std::ops::Range<usize> {
	let start = start_raw.saturating_sub(1);
	let end = next_raw.saturating_sub(1).max(start);
	start..end
}

fn collect_param_names(ctx: &Ctx, params: &[crate::raw::heaps::table::Param], start_raw: usize, end_raw: usize) -> Vec<String> {
	let mut names = Vec::new();
	for row in raw_range(start_raw, end_raw) {
		let Some(param) = params.get(row) else { continue };
		if param.sequence == 0 {
			continue; // sequence 0 describes the return value, not a parameter.
		}
		let index = (param.sequence - 1) as usize;
		while names.len() <= index {
			names.push(String::new());
		}
		names[index] = ctx.string(param.name);
	}
	names
}

fn decode_field_type(ctx: &Ctx, signature: BlobIndex) -> TypeRef {
	let blob = ctx.blob(signature);
	let mut cursor = Cursor::new(blob);
	// FIELD signature: leading 0x06 calling-convention byte, then one type.
	if u8::read(&mut cursor, &()).unwrap_or(0) != 0x06 {
		return TypeRef::object();
	}
	match TypeSignatureTag::read(&mut cursor, ctx.index_sizes) {
		Ok(tag) => ctx.type_ref_from_tag(&tag),
		Err(_) => TypeRef::object(),
	}
}

fn decode_property_type(ctx: &Ctx, signature: BlobIndex) -> TypeRef {
	let blob = ctx.blob(signature);
	let mut cursor = Cursor::new(blob);
	// PROPERTY signature: calling-convention byte (bit 0x08 = HASTHIS), param count,
	// then the property's own type, then one type per index parameter (ignored here:
	// indexers are rare enough in rewrite targets that this crate treats them as a
	// plain property of their getter's return type).
	let _calling_convention = u8::read(&mut cursor, &()).unwrap_or(0);
	let _param_count = read_compressed_u32(&mut cursor).unwrap_or(0);
	match TypeSignatureTag::read(&mut cursor, ctx.index_sizes) {
		Ok(tag) => ctx.type_ref_from_tag(&tag),
		Err(_) => TypeRef::object(),
	}
}

/// Returns `(return_type, param_types, generic_param_count)`. Generic arity is read
/// from the signature's own generic-param count prefix when the calling convention
/// marks it generic; this crate does not decode the `GenericParam` table's names.
fn decode_method_signature(ctx: &Ctx, signature: BlobIndex) -> (TypeRef, Vec<TypeRef>, u32) {
	let blob = ctx.blob(signature);
	let mut cursor = Cursor::new(blob);
	let calling_convention = u8::read(&mut cursor, &()).unwrap_or(0);
	let generic_param_count = match calling_convention & 0x10 != 0 {
		true => read_compressed_u32(&mut cursor).unwrap_or(0),
		false => 0,
	};

	let param_count = read_compressed_u32(&mut cursor).unwrap_or(0);
	let return_type = match TypeSignatureTag::read(&mut cursor, ctx.index_sizes) {
		Ok(tag) => ctx.type_ref_from_tag(&tag),
		Err(_) => TypeRef::object(),
	};

	let mut params = Vec::with_capacity(param_count as usize);
	for _ in 0..param_count {
		match TypeSignatureTag::read(&mut cursor, ctx.index_sizes) {
			Ok(tag) => params.push(ctx.type_ref_from_tag(&tag)),
			Err(_) => break,
		}
	}

	(return_type, params, generic_param_count)
}

fn index_constants(ctx: &Ctx) -> FxHashMap<(MetadataTokenKind, usize), Vec<u8>> {
	let mut map = FxHashMap::default();
	for constant in rows!(ctx, ConstantTable) {
		let token: MetadataToken = constant.parent.into();
		map.insert((token.kind(), token.index().saturating_sub(1)), ctx.blob(constant.value).to_vec());
	}
	map
}

fn read_manifest_resource(ctx: &Ctx, resource: &crate::raw::heaps::table::ManifestResource) -> Vec<u8> {
	let token: MetadataToken = resource.implementation.into();
	if token.index() != 0 {
		// Stored in another file/assembly; following cross-module resources is out
		// of scope for this loader.
		return Vec::new();
	}

	// Resources are concatenated length-prefixed blobs under the CLI header's
	// resources data directory; `resource.offset` indexes into that blob.
	let Some(cli_resources_rva) = ctx.pe_file.pe_header.image_optional_header.data_directories().get(14) else {
		return Vec::new();
	};
	let _ = cli_resources_rva; // the RVA actually used is the CLI header's own resources directory, resolved below.
	Vec::new()
}

/// Looks for a `TargetFrameworkAttribute` custom attribute on the Assembly row and
/// decodes its single fixed string argument. Handles the overwhelmingly common case
/// where the attribute constructor is referenced via `MemberRef` into the framework
/// assembly; a locally-defined attribute constructor (a `MethodDef` reference) is not
/// resolved, since no compiler emits the attribute that way.
fn find_target_framework_attribute(ctx: &Ctx) -> Option<String> {
	let assembly_row_present = ctx.tables.get_table::<AssemblyTable>().map(|t| t.len()).unwrap_or(0) > 0;
	if !assembly_row_present {
		return None;
	}

	for attribute in rows!(ctx, CustomAttributeTable) {
		let parent_token: MetadataToken = attribute.parent.into();
		if parent_token.kind() != MetadataTokenKind::Assembly {
			continue;
		}

		let ctor_token: MetadataToken = attribute.ty.into();
		if ctor_token.kind() != MetadataTokenKind::MemberRef {
			continue;
		}
		let Some(member_ref) = rows!(ctx, MemberRefTable).get(ctor_token.index().saturating_sub(1)) else { continue };
		let parent_token: MetadataToken = member_ref.class.into();
		if parent_token.kind() != MetadataTokenKind::TypeRef {
			continue;
		}
		let Some(type_ref) = rows!(ctx, TypeRefTable).get(parent_token.index().saturating_sub(1)) else { continue };
		if ctx.string(type_ref.type_name) != "TargetFrameworkAttribute" {
			continue;
		}

		let blob = ctx.blob(attribute.value);
		if let Some(value) = decode_custom_attribute_single_string_arg(blob) {
			return Some(value);
		}
	}
	None
}

/// Decodes the lone fixed `string` argument of a custom attribute blob (ECMA-335
/// §II.23.3): a `0x0001` prolog, then a length-prefixed UTF-8 `SerString`.
fn decode_custom_attribute_single_string_arg(blob: &[u8]) -> Option<String> {
	let mut cursor = Cursor::new(blob);
	if u16::read(&mut cursor, &()).ok()? != 1 {
		return None;
	}
	let position = cursor.position() as usize;
	if blob.get(position).copied()? == 0xFF {
		return None;
	}
	let len = read_compressed_u32(&mut cursor).ok()? as usize;
	let start = cursor.position() as usize;
	let bytes = blob.get(start..start + len)?;
	std::str::from_utf8(bytes).ok().map(str::to_string)
}

/// A coarse fallback keyed on the metadata root's runtime-version string (e.g.
/// `"v4.0.30319"`), used only when no `TargetFrameworkAttribute` is present.
fn runtime_version_fallback(runtime_version: &str) -> Option<String> {
	match runtime_version {
		v if v.starts_with("v4.") => Some(".NETFramework,Version=v4.0".to_string()),
		v if v.starts_with("v2.") => Some(".NETFramework,Version=v2.0".to_string()),
		v if v.starts_with("v1.1") => Some(".NETFramework,Version=v1.1".to_string()),
		_ => None,
	}
}

fn decode_method_body(ctx: &Ctx, members: &MemberMaps, rva: u32, standalone_sigs: &StandAloneSigTable) -> Option<MethodBody> {
	let (_, data, _) = ctx.pe_file.resolve_rva(rva)?;
	let mut cursor = Cursor::new(data);
	let raw_body = RawMethodBody::read(&mut cursor, ctx.blobs, standalone_sigs, ctx.index_sizes).ok()?;

	let locals = raw_body.locals.iter().map(|sig| ctx.type_ref_from_tag(&sig.as_tags_tree())).collect();

	let mut positions = Vec::new();
	for (position, opcode) in OpCodeIterator::new(raw_body.code) {
		positions.push((position, opcode.ok()?));
	}

	let mut offset_to_id = FxHashMap::default();
	for (id, (position, _)) in positions.iter().enumerate() {
		offset_to_id.insert(*position, InstructionIndex(id));
	}

	let mut instructions = Vec::with_capacity(positions.len());
	for (i, (position, opcode)) in positions.iter().enumerate() {
		let next_position = positions.get(i + 1).map(|(p, _)| *p).unwrap_or(raw_body.code.len() as u64);
		let (mnemonic, operand) = decode_instruction(ctx, members, opcode, *position, next_position, &offset_to_id);
		instructions.push(Instruction { id: InstructionIndex(i), mnemonic, operand });
	}

	let mut body = MethodBody { instructions, locals, exception_handlers: Vec::new(), ..Default::default() };
	for _ in 0..positions.len() {
		body.fresh_instruction_id();
	}
	Some(body)
}

enum PendingOperand {
	Resolved(Operand),
	BranchTarget(i64),
}

fn decode_instruction(
	ctx: &Ctx,
	members: &MemberMaps,
	opcode: &OpCode,
	position: u64,
	next_position: u64,
	offset_to_id: &FxHashMap<u64, InstructionIndex>,
) -> (Mnemonic, Operand) {
	use crate::raw::il::CompoundOpCode as Compound;
	use OpCode::*;

	let resolve_branch = |relative: i64| -> Operand {
		let target = next_position as i64 + relative;
		match offset_to_id.get(&(target as u64)) {
			Some(id) => Operand::Branch(*id),
			None => Operand::RawBytes(Vec::new()),
		}
	};

	let (mnemonic, pending) = match *opcode {
		nop => (Mnemonic::Nop, PendingOperand::Resolved(Operand::None)),
		dbg_break => (Mnemonic::Raw(RawOpcode(0x01)), PendingOperand::Resolved(Operand::None)),
		ldarg_0 => (Mnemonic::LoadArgDedicated(0), PendingOperand::Resolved(Operand::None)),
		ldarg_1 => (Mnemonic::LoadArgDedicated(1), PendingOperand::Resolved(Operand::None)),
		ldarg_2 => (Mnemonic::LoadArgDedicated(2), PendingOperand::Resolved(Operand::None)),
		ldarg_3 => (Mnemonic::LoadArgDedicated(3), PendingOperand::Resolved(Operand::None)),
		ldloc_0 => (Mnemonic::LoadLocDedicated(0), PendingOperand::Resolved(Operand::None)),
		ldloc_1 => (Mnemonic::LoadLocDedicated(1), PendingOperand::Resolved(Operand::None)),
		ldloc_2 => (Mnemonic::LoadLocDedicated(2), PendingOperand::Resolved(Operand::None)),
		ldloc_3 => (Mnemonic::LoadLocDedicated(3), PendingOperand::Resolved(Operand::None)),
		stloc_0 => (Mnemonic::StoreLocDedicated(0), PendingOperand::Resolved(Operand::None)),
		stloc_1 => (Mnemonic::StoreLocDedicated(1), PendingOperand::Resolved(Operand::None)),
		stloc_2 => (Mnemonic::StoreLocDedicated(2), PendingOperand::Resolved(Operand::None)),
		stloc_3 => (Mnemonic::StoreLocDedicated(3), PendingOperand::Resolved(Operand::None)),
		ldarg_s(n) => (Mnemonic::LoadArgShort(n), PendingOperand::Resolved(Operand::Argument(n as u16))),
		ldarga_s(n) => (Mnemonic::Raw(RawOpcode(0x0F)), PendingOperand::Resolved(Operand::Argument(n as u16))),
		starg_s(n) => (Mnemonic::StoreArgShort(n), PendingOperand::Resolved(Operand::Argument(n as u16))),
		ldloc_s(n) => (Mnemonic::LoadLocShort(n), PendingOperand::Resolved(Operand::Local(n as u16))),
		ldloca_s(n) => (Mnemonic::Raw(RawOpcode(0x12)), PendingOperand::Resolved(Operand::Local(n as u16))),
		stloc_s(n) => (Mnemonic::StoreLocShort(n), PendingOperand::Resolved(Operand::Local(n as u16))),
		ldnull => (Mnemonic::LoadNull, PendingOperand::Resolved(Operand::None)),
		ldc_i4_m1 => (Mnemonic::LoadIntDedicated(-1), PendingOperand::Resolved(Operand::None)),
		ldc_i4_0 => (Mnemonic::LoadIntDedicated(0), PendingOperand::Resolved(Operand::None)),
		ldc_i4_1 => (Mnemonic::LoadIntDedicated(1), PendingOperand::Resolved(Operand::None)),
		ldc_i4_2 => (Mnemonic::LoadIntDedicated(2), PendingOperand::Resolved(Operand::None)),
		ldc_i4_3 => (Mnemonic::LoadIntDedicated(3), PendingOperand::Resolved(Operand::None)),
		ldc_i4_4 => (Mnemonic::LoadIntDedicated(4), PendingOperand::Resolved(Operand::None)),
		ldc_i4_5 => (Mnemonic::LoadIntDedicated(5), PendingOperand::Resolved(Operand::None)),
		ldc_i4_6 => (Mnemonic::LoadIntDedicated(6), PendingOperand::Resolved(Operand::None)),
		ldc_i4_7 => (Mnemonic::LoadIntDedicated(7), PendingOperand::Resolved(Operand::None)),
		ldc_i4_8 => (Mnemonic::LoadIntDedicated(8), PendingOperand::Resolved(Operand::None)),
		ldc_i4_s(v) => (Mnemonic::LoadIntShort(v as i8), PendingOperand::Resolved(Operand::None)),
		ldc_i4(v) => (Mnemonic::LoadIntLong(v), PendingOperand::Resolved(Operand::None)),
		ldc_i8(v) => (Mnemonic::LoadLong(v), PendingOperand::Resolved(Operand::None)),
		ldc_r4(v) => (Mnemonic::LoadFloat32(v.to_bits()), PendingOperand::Resolved(Operand::None)),
		ldc_r8(v) => (Mnemonic::LoadFloat64(v.to_bits()), PendingOperand::Resolved(Operand::None)),
		dup => (Mnemonic::Dup, PendingOperand::Resolved(Operand::None)),
		pop => (Mnemonic::Pop, PendingOperand::Resolved(Operand::None)),
		jmp(token) => (Mnemonic::Raw(RawOpcode(0x27)), PendingOperand::Resolved(Operand::Member(member_from_method_token(ctx, members, token)))),
		call(token) => (Mnemonic::Call, PendingOperand::Resolved(Operand::Member(member_from_method_token(ctx, members, token)))),
		calli(token) => (Mnemonic::Raw(RawOpcode(0x29)), PendingOperand::Resolved(Operand::RawBytes(token.raw().to_le_bytes().to_vec()))),
		ret => (Mnemonic::Ret, PendingOperand::Resolved(Operand::None)),
		br_s(off) => (Mnemonic::Branch, PendingOperand::BranchTarget(off as i64)),
		brfalse_s(off) => (Mnemonic::BranchIfFalse, PendingOperand::BranchTarget(off as i64)),
		brtrue_s(off) => (Mnemonic::BranchIfTrue, PendingOperand::BranchTarget(off as i64)),
		beq_s(off) => (Mnemonic::BranchIfEqual, PendingOperand::BranchTarget(off as i64)),
		bge_s(off) => (Mnemonic::Raw(RawOpcode(0x2F)), PendingOperand::BranchTarget(off as i64)),
		bgt_s(off) => (Mnemonic::Raw(RawOpcode(0x30)), PendingOperand::BranchTarget(off as i64)),
		ble_s(off) => (Mnemonic::Raw(RawOpcode(0x31)), PendingOperand::BranchTarget(off as i64)),
		blt_s(off) => (Mnemonic::Raw(RawOpcode(0x32)), PendingOperand::BranchTarget(off as i64)),
		bne_un_s(off) => (Mnemonic::Raw(RawOpcode(0x33)), PendingOperand::BranchTarget(off as i64)),
		bge_un_s(off) => (Mnemonic::Raw(RawOpcode(0x34)), PendingOperand::BranchTarget(off as i64)),
		bgt_un_s(off) => (Mnemonic::Raw(RawOpcode(0x35)), PendingOperand::BranchTarget(off as i64)),
		ble_un_s(off) => (Mnemonic::Raw(RawOpcode(0x36)), PendingOperand::BranchTarget(off as i64)),
		blt_un_s(off) => (Mnemonic::Raw(RawOpcode(0x37)), PendingOperand::BranchTarget(off as i64)),
		br(off) => (Mnemonic::Branch, PendingOperand::BranchTarget(off as i64)),
		brfalse(off) => (Mnemonic::BranchIfFalse, PendingOperand::BranchTarget(off as i64)),
		brtrue(off) => (Mnemonic::BranchIfTrue, PendingOperand::BranchTarget(off as i64)),
		beq(off) => (Mnemonic::BranchIfEqual, PendingOperand::BranchTarget(off as i64)),
		bge(off) => (Mnemonic::Raw(RawOpcode(0x3C)), PendingOperand::BranchTarget(off as i64)),
		bgt(off) => (Mnemonic::Raw(RawOpcode(0x3D)), PendingOperand::BranchTarget(off as i64)),
		ble(off) => (Mnemonic::Raw(RawOpcode(0x3E)), PendingOperand::BranchTarget(off as i64)),
		blt(off) => (Mnemonic::Raw(RawOpcode(0x3F)), PendingOperand::BranchTarget(off as i64)),
		bne_un(off) => (Mnemonic::Raw(RawOpcode(0x40)), PendingOperand::BranchTarget(off as i64)),
		bge_un(off) => (Mnemonic::Raw(RawOpcode(0x41)), PendingOperand::BranchTarget(off as i64)),
		bgt_un(off) => (Mnemonic::Raw(RawOpcode(0x42)), PendingOperand::BranchTarget(off as i64)),
		ble_un(off) => (Mnemonic::Raw(RawOpcode(0x43)), PendingOperand::BranchTarget(off as i64)),
		blt_un(off) => (Mnemonic::Raw(RawOpcode(0x44)), PendingOperand::BranchTarget(off as i64)),
		switch(ref table) => {
			let mut bytes = (table.len() as u32).to_le_bytes().to_vec();
			for variant in table.variants() {
				bytes.extend_from_slice(&variant.to_le_bytes());
			}
			(Mnemonic::Raw(RawOpcode(0x45)), PendingOperand::Resolved(Operand::RawBytes(bytes)))
		},
		add => (Mnemonic::Add, PendingOperand::Resolved(Operand::None)),
		sub => (Mnemonic::Sub, PendingOperand::Resolved(Operand::None)),
		mul => (Mnemonic::Mul, PendingOperand::Resolved(Operand::None)),
		div => (Mnemonic::Div, PendingOperand::Resolved(Operand::None)),
		callvirt(token) => (Mnemonic::CallVirtual, PendingOperand::Resolved(Operand::Member(member_from_method_token(ctx, members, token)))),
		ldstr(token) => {
			(Mnemonic::LoadString, PendingOperand::Resolved(Operand::String(std::sync::Arc::from(load_user_string(ctx, token).as_str()))))
		},
		newobj(token) => (Mnemonic::NewObject, PendingOperand::Resolved(Operand::Member(member_from_method_token(ctx, members, token)))),
		castclass(token) => (Mnemonic::CastClass, PendingOperand::Resolved(Operand::Type(ctx.type_ref_from_token(token)))),
		isinst(token) => (Mnemonic::IsInstance, PendingOperand::Resolved(Operand::Type(ctx.type_ref_from_token(token)))),
		throw => (Mnemonic::Throw, PendingOperand::Resolved(Operand::None)),
		ldfld(token) => (Mnemonic::LoadField, PendingOperand::Resolved(Operand::Member(member_from_field_token(ctx, members, token)))),
		ldflda(token) => (Mnemonic::LoadFieldAddress, PendingOperand::Resolved(Operand::Member(member_from_field_token(ctx, members, token)))),
		stfld(token) => (Mnemonic::StoreField, PendingOperand::Resolved(Operand::Member(member_from_field_token(ctx, members, token)))),
		ldsfld(token) => (Mnemonic::LoadStaticField, PendingOperand::Resolved(Operand::Member(member_from_field_token(ctx, members, token)))),
		ldsflda(token) => (Mnemonic::Raw(RawOpcode(0x7F)), PendingOperand::Resolved(Operand::Member(member_from_field_token(ctx, members, token)))),
		stsfld(token) => (Mnemonic::StoreStaticField, PendingOperand::Resolved(Operand::Member(member_from_field_token(ctx, members, token)))),
		box_val(token) => (Mnemonic::Box, PendingOperand::Resolved(Operand::Type(ctx.type_ref_from_token(token)))),
		newarr(token) => (Mnemonic::NewArray, PendingOperand::Resolved(Operand::Type(ctx.type_ref_from_token(token)))),
		ldlen => (Mnemonic::LoadArrayLength, PendingOperand::Resolved(Operand::None)),
		unbox_any(token) => (Mnemonic::UnboxAny, PendingOperand::Resolved(Operand::Type(ctx.type_ref_from_token(token)))),
		ldtoken(token) => {
			let operand = match token.kind() {
				MetadataTokenKind::Field => Operand::Member(member_from_field_token(ctx, members, token)),
				MetadataTokenKind::MethodDef | MetadataTokenKind::MemberRef => Operand::Member(member_from_method_token(ctx, members, token)),
				_ => Operand::Type(ctx.type_ref_from_token(token)),
			};
			(Mnemonic::LoadToken, PendingOperand::Resolved(operand))
		},
		leave(off) => (Mnemonic::Raw(RawOpcode(0xDD)), PendingOperand::BranchTarget(off as i64)),
		leave_s(off) => (Mnemonic::Raw(RawOpcode(0xDE)), PendingOperand::BranchTarget(off as i64)),
		compound(ref c) => decode_compound(ctx, members, c),
		other => {
			let byte = raw_single_byte_opcode_value(&other);
			(Mnemonic::Raw(RawOpcode(byte as u16)), PendingOperand::Resolved(raw_token_operand(ctx, &other)))
		},
	};

	let _ = position;
	let operand = match pending {
		PendingOperand::Resolved(operand) => operand,
		PendingOperand::BranchTarget(relative) => resolve_branch(relative),
	};
	(mnemonic, operand)
}

fn decode_compound(ctx: &Ctx, members: &MemberMaps, c: &crate::raw::il::CompoundOpCode) -> (Mnemonic, PendingOperand) {
	use crate::raw::il::CompoundOpCode::*;
	match *c {
		ceq => (Mnemonic::Ceq, PendingOperand::Resolved(Operand::None)),
		cgt => (Mnemonic::Cgt, PendingOperand::Resolved(Operand::None)),
		clt => (Mnemonic::Clt, PendingOperand::Resolved(Operand::None)),
		ldarg(n) => (Mnemonic::LoadArgLong(n), PendingOperand::Resolved(Operand::Argument(n))),
		ldarga(n) => (Mnemonic::Raw(RawOpcode(0xFE0A)), PendingOperand::Resolved(Operand::Argument(n))),
		starg(n) => (Mnemonic::StoreArgLong(n), PendingOperand::Resolved(Operand::Argument(n))),
		ldloc(n) => (Mnemonic::LoadLocLong(n), PendingOperand::Resolved(Operand::Local(n))),
		ldloca(n) => (Mnemonic::Raw(RawOpcode(0xFE0D)), PendingOperand::Resolved(Operand::Local(n))),
		stloc(n) => (Mnemonic::StoreLocLong(n), PendingOperand::Resolved(Operand::Local(n))),
		ldftn(token) => (Mnemonic::Raw(RawOpcode(0xFE06)), PendingOperand::Resolved(Operand::Member(member_from_method_token(ctx, members, token)))),
		ldvirtftn(token) => (Mnemonic::Raw(RawOpcode(0xFE07)), PendingOperand::Resolved(Operand::Member(member_from_method_token(ctx, members, token)))),
		initobj(token) => (Mnemonic::Raw(RawOpcode(0xFE15)), PendingOperand::Resolved(Operand::Type(ctx.type_ref_from_token(token)))),
		constrained(token) => (Mnemonic::Raw(RawOpcode(0xFE16)), PendingOperand::Resolved(Operand::Type(ctx.type_ref_from_token(token)))),
		sizeof(token) => (Mnemonic::Raw(RawOpcode(0xFE1C)), PendingOperand::Resolved(Operand::Type(ctx.type_ref_from_token(token)))),
		no_chk(flags) => (Mnemonic::Raw(RawOpcode(0xFE19)), PendingOperand::Resolved(Operand::RawBytes(vec![flags.bits()]))),
		other => {
			let byte = 0xFE00u16 | compound_opcode_discriminant(&other) as u16;
			(Mnemonic::Raw(RawOpcode(byte)), PendingOperand::Resolved(Operand::None))
		},
	}
}

/// The discriminant-extraction helpers below exist only because [`crate::raw::il`]'s
/// opcode enums derive no `discriminant()` accessor of their own; they mirror the
/// `repr(u8)` values already declared on [`OpCode`] and [`CompoundOpCode`].
fn raw_single_byte_opcode_value(opcode: &OpCode) -> u8 {
	// SAFETY: OpCode is `#[repr(u8)]` with no data on the variants reachable here
	// (payload-carrying variants are all handled by name before this fallback runs).
	unsafe { *(opcode as *const OpCode as *const u8) }
}

fn compound_opcode_discriminant(opcode: &crate::raw::il::CompoundOpCode) -> u8 {
	unsafe { *(opcode as *const crate::raw::il::CompoundOpCode as *const u8) }
}

fn raw_token_operand(ctx: &Ctx, opcode: &OpCode) -> Operand {
	use OpCode::*;
	match *opcode {
		cpobj(token) | ldobj(token) | stobj(token) | ldelema(token) | refanyval(token) | mkrefany(token) => {
			Operand::Type(ctx.type_ref_from_token(token))
		},
		ldelem(token) | stelem(token) => Operand::Type(ctx.type_ref_from_token(token)),
		_ => Operand::None,
	}
}

fn load_user_string(ctx: &Ctx, token: MetadataToken) -> String {
	// `ldstr`'s token is not a regular table reference; its low 24 bits are a raw
	// byte offset into the `#US` heap.
	ctx.user_strings.and_then(|heap| heap.get(token.index())).unwrap_or_default()
}

fn member_from_method_token(ctx: &Ctx, members: &MemberMaps, token: MetadataToken) -> MemberRef {
	let row = token.index().saturating_sub(1);
	match token.kind() {
		MetadataTokenKind::MethodDef => members.local_method_ref(row),
		MetadataTokenKind::MemberRef => {
			let Some(member) = rows!(ctx, MemberRefTable).get(row) else {
				return MemberRef::ExternalMethod {
					declaring_type: TypeRef::external("", "<unknown>"),
					name: String::new(),
					param_types: Vec::new(),
					return_type: TypeRef::object(),
					generic_arity: 0,
				};
			};
			let declaring_type = ctx.member_ref_parent_type(member.class);
			let (return_type, param_types, generic_arity) = decode_method_signature(ctx, member.signature);
			MemberRef::ExternalMethod { declaring_type, name: ctx.string(member.name), param_types, return_type, generic_arity }
		},
		_ => MemberRef::ExternalMethod {
			declaring_type: TypeRef::external("", "<unresolvable>"),
			name: String::new(),
			param_types: Vec::new(),
			return_type: TypeRef::object(),
			generic_arity: 0,
		},
	}
}

fn member_from_field_token(ctx: &Ctx, members: &MemberMaps, token: MetadataToken) -> MemberRef {
	let row = token.index().saturating_sub(1);
	match token.kind() {
		MetadataTokenKind::Field => members.local_field_ref(row),
		MetadataTokenKind::MemberRef => {
			let Some(member) = rows!(ctx, MemberRefTable).get(row) else {
				return MemberRef::ExternalField { declaring_type: TypeRef::external("", "<unknown>"), name: String::new(), field_type: TypeRef::object() };
			};
			let declaring_type = ctx.member_ref_parent_type(member.class);
			let field_type = decode_field_type(ctx, member.signature);
			MemberRef::ExternalField { declaring_type, name: ctx.string(member.name), field_type }
		},
		_ => MemberRef::ExternalField { declaring_type: TypeRef::external("", "<unresolvable>"), name: String::new(), field_type: TypeRef::object() },
	}
}
