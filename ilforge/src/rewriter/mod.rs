//! Mutates an owned [`AssemblyModel`] and serializes it back into a PE/CLI image.
//!
//! Every mutation goes through the [`Rewriter`] rather than touching the model
//! directly, so the [`ModificationJournal`] stays an accurate record of what changed.
//! Values produced by the [`crate::type_factory`] arrive carrying the
//! [`crate::type_factory::DETACHED`] sentinel in place of their eventual
//! `declaring_type`; `add_type`/`add_method`/`add_field`/`add_auto_property` rewrite
//! every occurrence to the real index as part of attaching the value.

pub mod writer;

use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{CoreError, CoreResult, ErrorCode};
use crate::model::{
	AssemblyModel, EventDef, FieldDef, FieldIndex, MethodDef, MethodIndex, PropertyDef, PropertyIndex, TypeDef,
	TypeIndex, TypeRef,
};
use crate::raw::heaps::table::{MethodAttributes, TypeAttributes};
use crate::type_factory::DETACHED;

/// One kind of change recorded by the journal, named after the mutation that
/// produced it rather than after the table row it will eventually touch.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ModificationKind {
	TypeAdded,
	TypeRemoved,
	TypeModified,
	MethodAdded,
	MethodRemoved,
	MethodModified,
	MethodRenamed,
	FieldAdded,
	FieldRemoved,
	PropertyModified,
}

/// One entry in the [`ModificationJournal`]: what happened, to what, and when.
#[derive(Debug, Clone)]
pub struct JournalEntry {
	pub kind: ModificationKind,
	pub subject: String,
	pub timestamp: u64,
}

/// An append-only log of every mutation a [`Rewriter`] has applied to its model,
/// in application order.
#[derive(Debug, Clone, Default)]
pub struct ModificationJournal {
	entries: Vec<JournalEntry>,
}

impl ModificationJournal {
	pub fn entries(&self) -> &[JournalEntry] {
		&self.entries
	}

	fn record(&mut self, kind: ModificationKind, subject: impl Into<String>) {
		let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
		self.entries.push(JournalEntry { kind, subject, timestamp });
	}
}

/// Owns a model and every mutation applied to it, and knows how to turn the result
/// back into bytes via [`writer::serialize`].
pub struct Rewriter {
	model: AssemblyModel,
	journal: ModificationJournal,
}

impl Rewriter {
	pub fn new(model: AssemblyModel) -> Self {
		Self { model, journal: ModificationJournal::default() }
	}

	pub fn model(&self) -> &AssemblyModel {
		&self.model
	}

	pub fn into_model(self) -> AssemblyModel {
		self.model
	}

	pub fn journal(&self) -> &ModificationJournal {
		&self.journal
	}

	/// Attaches a (possibly [`DETACHED`](crate::type_factory::DETACHED)) type to the
	/// module, rewriting its own members' `declaring_type` and any self-referencing
	/// `TypeRef::Local(DETACHED)` (an enum's literal fields naming their own enum) to
	/// the index it is assigned.
	pub fn add_type(&mut self, mut def: TypeDef) -> TypeIndex {
		let index = TypeIndex(self.model.module.types.len());
		patch_declaring_type(&mut def, index);
		let subject = def.full_name();
		self.model.module.types.push(def);
		self.journal.record(ModificationKind::TypeAdded, subject);
		index
	}

	/// Tombstones the type rather than removing its row, since `index` may already be
	/// embedded as a live `TypeRef::Local`/`MemberRef`/`declaring_type` reference
	/// anywhere else in the model; shifting every later type down a slot would
	/// silently re-point those references at a different type. The returned `TypeDef`
	/// has `removed` set.
	pub fn remove_type(&mut self, index: TypeIndex) -> CoreResult<TypeDef> {
		let ty = self.type_mut(index)?;
		ty.removed = true;
		let removed = ty.clone();
		self.journal.record(ModificationKind::TypeRemoved, removed.full_name());
		Ok(removed)
	}

	pub fn add_method(&mut self, type_index: TypeIndex, mut def: MethodDef) -> CoreResult<MethodIndex> {
		let ty = self.type_mut(type_index)?;
		def.declaring_type = type_index;
		let subject = format!("{}::{}", ty.full_name(), def.name);
		let method_index = MethodIndex(ty.methods.len());
		ty.methods.push(def);
		self.journal.record(ModificationKind::MethodAdded, subject);
		Ok(method_index)
	}

	/// Tombstones the method rather than removing its row, since `method_index` may
	/// already be embedded as a live `PropertyDef::getter`/`setter`,
	/// `EventDef::add`/`remove`, or `MemberRef::Method` operand in another method's
	/// body; shifting every later method down a slot would silently re-point those
	/// references at a different method. The returned `MethodDef` has `removed` set.
	pub fn remove_method(&mut self, type_index: TypeIndex, method_index: MethodIndex) -> CoreResult<MethodDef> {
		let ty = self.type_mut(type_index)?;
		let type_name = ty.full_name();
		let method = ty
			.methods
			.get_mut(method_index.0)
			.ok_or_else(|| CoreError::new(ErrorCode::MethodNotFound, format!("no method at index {}", method_index.0)))?;
		if method.removed {
			return Err(CoreError::new(ErrorCode::MethodNotFound, format!("method at index {} already removed", method_index.0)));
		}
		method.removed = true;
		let removed = method.clone();
		let subject = format!("{}::{}", type_name, removed.name);
		self.journal.record(ModificationKind::MethodRemoved, subject);
		Ok(removed)
	}

	pub fn add_field(&mut self, type_index: TypeIndex, mut def: FieldDef) -> CoreResult<FieldIndex> {
		let ty = self.type_mut(type_index)?;
		def.declaring_type = type_index;
		let subject = format!("{}::{}", ty.full_name(), def.name);
		let field_index = FieldIndex(ty.fields.len());
		ty.fields.push(def);
		self.journal.record(ModificationKind::FieldAdded, subject);
		Ok(field_index)
	}

	/// Tombstones the field rather than removing its row, since `field_index` may
	/// already be embedded as a live `MemberRef::Field` operand in another method's
	/// body; shifting every later field down a slot would silently re-point those
	/// references at a different field. The returned `FieldDef` has `removed` set.
	pub fn remove_field(&mut self, type_index: TypeIndex, field_index: FieldIndex) -> CoreResult<FieldDef> {
		let ty = self.type_mut(type_index)?;
		let type_name = ty.full_name();
		let field = ty
			.fields
			.get_mut(field_index.0)
			.ok_or_else(|| CoreError::new(ErrorCode::TypeNotFound, format!("no field at index {}", field_index.0)))?;
		if field.removed {
			return Err(CoreError::new(ErrorCode::TypeNotFound, format!("field at index {} already removed", field_index.0)));
		}
		field.removed = true;
		let removed = field.clone();
		let subject = format!("{}::{}", type_name, removed.name);
		self.journal.record(ModificationKind::FieldRemoved, subject);
		Ok(removed)
	}

	/// Attaches the property/backing-field/getter/setter quadruple
	/// [`crate::type_factory::new_auto_property`] produces, resolving the relative
	/// [`crate::type_factory::GETTER_SLOT`]/[`crate::type_factory::SETTER_SLOT`]
	/// convention to the absolute [`MethodIndex`] values the getter and setter
	/// receive once pushed onto the type's own method list.
	pub fn add_auto_property(
		&mut self,
		type_index: TypeIndex,
		mut property: PropertyDef,
		backing_field: FieldDef,
		getter: MethodDef,
		setter: MethodDef,
	) -> CoreResult<PropertyIndex> {
		let getter_index = self.add_method(type_index, getter)?;
		let setter_index = self.add_method(type_index, setter)?;
		self.add_field(type_index, backing_field)?;

		let ty = self.type_mut(type_index)?;
		property.declaring_type = type_index;
		property.getter = Some(getter_index);
		property.setter = Some(setter_index);
		let subject = format!("{}::{}", ty.full_name(), property.name);
		let property_index = PropertyIndex(ty.properties.len());
		ty.properties.push(property);
		self.journal.record(ModificationKind::PropertyModified, subject);
		Ok(property_index)
	}

	/// Attaches the event/add/remove triple [`crate::type_factory::new_event`]
	/// produces, mirroring [`Rewriter::add_auto_property`]'s slot resolution.
	pub fn add_event(
		&mut self,
		type_index: TypeIndex,
		mut event: EventDef,
		add: MethodDef,
		remove: MethodDef,
	) -> CoreResult<()> {
		let add_index = self.add_method(type_index, add)?;
		let remove_index = self.add_method(type_index, remove)?;

		let ty = self.type_mut(type_index)?;
		event.declaring_type = type_index;
		event.add = Some(add_index);
		event.remove = Some(remove_index);
		let subject = format!("{}::{}", ty.full_name(), event.name);
		ty.events.push(event);
		self.journal.record(ModificationKind::PropertyModified, subject);
		Ok(())
	}

	pub fn set_type_attributes(&mut self, type_index: TypeIndex, attributes: TypeAttributes) -> CoreResult<()> {
		let ty = self.type_mut(type_index)?;
		ty.attributes = attributes;
		let subject = ty.full_name();
		self.journal.record(ModificationKind::TypeModified, subject);
		Ok(())
	}

	pub fn set_method_attributes(
		&mut self,
		type_index: TypeIndex,
		method_index: MethodIndex,
		attributes: MethodAttributes,
	) -> CoreResult<()> {
		let method = self.method_mut(type_index, method_index)?;
		method.attributes = attributes;
		let subject = method.name.clone();
		self.journal.record(ModificationKind::MethodModified, subject);
		Ok(())
	}

	pub fn rename_method(
		&mut self,
		type_index: TypeIndex,
		method_index: MethodIndex,
		new_name: impl Into<String>,
	) -> CoreResult<()> {
		let new_name = new_name.into();
		let method = self.method_mut(type_index, method_index)?;
		let subject = format!("{} -> {new_name}", method.name);
		method.name = new_name;
		self.journal.record(ModificationKind::MethodRenamed, subject);
		Ok(())
	}

	/// Serializes the current model to `path`, writing to a sibling temporary file
	/// first and renaming it into place so a failed write never leaves a half-written
	/// assembly where the caller expected one.
	pub fn save(&self, path: impl AsRef<std::path::Path>) -> CoreResult<()> {
		let bytes = self.save_to_memory()?;
		let path = path.as_ref();
		let tmp_path = path.with_extension("ilforge-tmp");
		std::fs::write(&tmp_path, &bytes)
			.map_err(|e| CoreError::with_cause(ErrorCode::AccessDenied, format!("failed writing {}", tmp_path.display()), e))?;
		std::fs::rename(&tmp_path, path)
			.map_err(|e| CoreError::with_cause(ErrorCode::AccessDenied, format!("failed renaming into {}", path.display()), e))?;
		Ok(())
	}

	pub fn save_to_memory(&self) -> CoreResult<Vec<u8>> {
		writer::serialize(&self.model)
	}

	fn type_mut(&mut self, index: TypeIndex) -> CoreResult<&mut TypeDef> {
		let ty = self
			.model
			.module
			.types
			.get_mut(index.0)
			.ok_or_else(|| CoreError::new(ErrorCode::TypeNotFound, format!("no type at index {}", index.0)))?;
		if ty.removed {
			return Err(CoreError::new(ErrorCode::TypeNotFound, format!("type at index {} has been removed", index.0)));
		}
		Ok(ty)
	}

	fn method_mut(&mut self, type_index: TypeIndex, method_index: MethodIndex) -> CoreResult<&mut MethodDef> {
		let ty = self.type_mut(type_index)?;
		let method = ty
			.methods
			.get_mut(method_index.0)
			.ok_or_else(|| CoreError::new(ErrorCode::MethodNotFound, format!("no method at index {}", method_index.0)))?;
		if method.removed {
			return Err(CoreError::new(ErrorCode::MethodNotFound, format!("method at index {} has been removed", method_index.0)));
		}
		Ok(method)
	}
}

fn patch_declaring_type(def: &mut TypeDef, index: TypeIndex) {
	for field in &mut def.fields {
		field.declaring_type = index;
		if field.ty == TypeRef::Local(DETACHED) {
			field.ty = TypeRef::Local(index);
		}
	}
	for method in &mut def.methods {
		method.declaring_type = index;
	}
	for property in &mut def.properties {
		property.declaring_type = index;
	}
	for event in &mut def.events {
		event.declaring_type = index;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::identifiers::Mvid;
	use crate::model::{AssemblyVersion, Module};
	use crate::type_factory;

	fn empty_model() -> AssemblyModel {
		AssemblyModel {
			name: "A".into(),
			full_name: "A".into(),
			version: AssemblyVersion { major: 1, minor: 0, build: 0, revision: 0 },
			mvid: Mvid([0; 16]),
			target_framework_moniker: None,
			module: Module { name: "A".into(), types: Vec::new(), assembly_refs: Vec::new(), resources: Vec::new() },
		}
	}

	#[test]
	fn add_type_patches_declaring_type_on_its_own_members() {
		let mut rewriter = Rewriter::new(empty_model());
		let ty = type_factory::new_class("My", "Widget");
		let index = rewriter.add_type(ty);
		let added = &rewriter.model().module.types[index.0];
		assert_eq!(added.methods[0].declaring_type, index);
	}

	#[test]
	fn add_type_resolves_self_referencing_enum_literals() {
		let mut rewriter = Rewriter::new(empty_model());
		let ty = type_factory::new_enum("My", "Color", &[("Red", 0)]);
		let index = rewriter.add_type(ty);
		let added = &rewriter.model().module.types[index.0];
		assert_eq!(added.fields[1].ty, TypeRef::Local(index));
	}

	#[test]
	fn add_method_records_journal_entry() {
		let mut rewriter = Rewriter::new(empty_model());
		let index = rewriter.add_type(type_factory::new_class("My", "Widget"));
		let method = type_factory::new_method("DoThing", TypeRef::void(), Vec::<(&str, TypeRef)>::new());
		rewriter.add_method(index, method).unwrap();
		let kinds: Vec<_> = rewriter.journal().entries().iter().map(|e| e.kind).collect();
		assert!(kinds.contains(&ModificationKind::MethodAdded));
	}

	#[test]
	fn add_auto_property_resolves_relative_slots_to_absolute_indices() {
		let mut rewriter = Rewriter::new(empty_model());
		let index = rewriter.add_type(type_factory::new_class("My", "Widget"));
		let (property, field, getter, setter) = type_factory::new_auto_property("Count", TypeRef::int32());
		let property_index = rewriter.add_auto_property(index, property, field, getter, setter).unwrap();

		let ty = &rewriter.model().module.types[index.0];
		let added = &ty.properties[property_index.0];
		// Slot 0 is the default constructor added by `new_class`; the getter and
		// setter land at slots 1 and 2.
		assert_eq!(added.getter, Some(MethodIndex(1)));
		assert_eq!(added.setter, Some(MethodIndex(2)));
		assert_eq!(ty.methods[1].name, "get_Count");
		assert_eq!(ty.methods[2].name, "set_Count");
	}

	#[test]
	fn remove_type_is_recorded_and_tombstones_the_row() {
		let mut rewriter = Rewriter::new(empty_model());
		let index = rewriter.add_type(type_factory::new_class("My", "Widget"));
		rewriter.remove_type(index).unwrap();
		// Tombstoned, not removed from the `Vec`: the slot stays put so no later
		// type's index shifts.
		assert_eq!(rewriter.model().module.types.len(), 1);
		assert!(rewriter.model().module.types[index.0].removed);
		assert!(rewriter.model().module.type_by_index(index).is_none());
	}

	#[test]
	fn removing_a_type_does_not_shift_a_later_type_s_index() {
		let mut rewriter = Rewriter::new(empty_model());
		let first = rewriter.add_type(type_factory::new_class("My", "First"));
		let second = rewriter.add_type(type_factory::new_class("My", "Second"));
		rewriter.remove_type(first).unwrap();
		assert_eq!(rewriter.model().module.type_by_index(second).unwrap().full_name(), "My.Second");
	}

	#[test]
	fn removing_a_method_does_not_shift_a_later_method_s_index() {
		let mut rewriter = Rewriter::new(empty_model());
		let index = rewriter.add_type(type_factory::new_class("My", "Widget"));
		let first = type_factory::new_method("First", TypeRef::void(), Vec::<(&str, TypeRef)>::new());
		let second = type_factory::new_method("Second", TypeRef::void(), Vec::<(&str, TypeRef)>::new());
		let first_index = rewriter.add_method(index, first).unwrap();
		let second_index = rewriter.add_method(index, second).unwrap();
		rewriter.remove_method(index, first_index).unwrap();
		let ty = &rewriter.model().module.types[index.0];
		assert_eq!(ty.method_by_index(second_index).unwrap().name, "Second");
		assert!(ty.method_by_index(first_index).is_none());
	}

	#[test]
	fn removing_a_method_twice_fails() {
		let mut rewriter = Rewriter::new(empty_model());
		let index = rewriter.add_type(type_factory::new_class("My", "Widget"));
		rewriter.remove_method(index, MethodIndex(0)).unwrap();
		assert!(rewriter.remove_method(index, MethodIndex(0)).is_err());
	}

	#[test]
	fn remove_method_on_missing_type_fails() {
		let mut rewriter = Rewriter::new(empty_model());
		assert!(rewriter.remove_method(TypeIndex(0), MethodIndex(0)).is_err());
	}

	#[test]
	fn rename_method_updates_name_and_records_both_names() {
		let mut rewriter = Rewriter::new(empty_model());
		let index = rewriter.add_type(type_factory::new_class("My", "Widget"));
		rewriter.rename_method(index, MethodIndex(0), "Init").unwrap();
		assert_eq!(rewriter.model().module.types[index.0].methods[0].name, "Init");
		let last = rewriter.journal().entries().last().unwrap();
		assert_eq!(last.kind, ModificationKind::MethodRenamed);
		assert_eq!(last.subject, ".ctor -> Init");
	}
}
