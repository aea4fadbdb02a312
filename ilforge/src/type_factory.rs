//! Constructs well-formed type and member definitions bound to a target module.
//!
//! Every value produced here is *detached*: it carries a sentinel [`TypeIndex`]
//! ([`DETACHED`]) anywhere it would otherwise need to name its own not-yet-assigned
//! position in the module, either as `declaring_type` or as a self-referencing
//! [`TypeRef::Local`] (an enum's literal member fields refer to the enum itself).
//! [`crate::rewriter::Rewriter::add_type`]/`add_method`/`add_field` rewrite every
//! occurrence of the sentinel to the real index once the value is attached.

use crate::model::{
	EventDef, FieldDef, MethodBody, MethodDef, Param, PropertyDef, TypeDef, TypeIndex, TypeRef,
};
use crate::raw::heaps::table::{FieldAttributes, MethodAttributes, MethodImplAttributes, PropertyAttributes, TypeAttributes};

/// Placeholder declaring-type index carried by every member this module produces,
/// rewritten to the real index once the Rewriter attaches the value to a module.
pub const DETACHED: TypeIndex = TypeIndex(usize::MAX);

fn empty_body() -> MethodBody {
	MethodBody::default()
}

fn method(name: impl Into<String>, attributes: MethodAttributes, return_type: TypeRef, params: Vec<Param>) -> MethodDef {
	MethodDef {
		declaring_type: DETACHED,
		name: name.into(),
		attributes,
		impl_attributes: MethodImplAttributes::IL | MethodImplAttributes::MANAGED,
		return_type,
		params,
		generic_param_count: 0,
		body: empty_body(),
		removed: false,
	}
}

/// A constructor that calls `base`'s no-argument constructor and returns. Real
/// bodies composed by the emitter would instead load `this`, push arguments, call
/// the base constructor, then append caller-supplied initialization, but the base
/// call's target is the only part the factory can name with certainty.
fn default_constructor(base: TypeRef) -> MethodDef {
	let mut ctor = method(
		".ctor",
		MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME | MethodAttributes::RT_SPECIAL_NAME | MethodAttributes::HIDE_BY_SIG,
		TypeRef::void(),
		Vec::new(),
	);

	let mut builder = crate::emitter::IlBuilder::new();
	builder
		.load_arg(0)
		.call(crate::model::MemberRef::ExternalMethod {
			declaring_type: base,
			name: ".ctor".into(),
			param_types: Vec::new(),
			return_type: TypeRef::void(),
			generic_arity: 0,
		})
		.ret();
	ctor.body.instructions = builder.build();
	ctor
}

/// A public class deriving from the framework's root object type, with a default
/// constructor already wired to call the base constructor.
pub fn new_class(namespace: impl Into<String>, name: impl Into<String>) -> TypeDef {
	TypeDef {
		namespace: namespace.into(),
		name: name.into(),
		attributes: TypeAttributes::PUBLIC,
		base_type: Some(TypeRef::object()),
		fields: Vec::new(),
		methods: vec![default_constructor(TypeRef::object())],
		properties: Vec::new(),
		events: Vec::new(),
		removed: false,
	}
}

/// An interface: `interface | abstract`, no parent.
pub fn new_interface(namespace: impl Into<String>, name: impl Into<String>) -> TypeDef {
	TypeDef {
		namespace: namespace.into(),
		name: name.into(),
		attributes: TypeAttributes::PUBLIC | TypeAttributes::INTERFACE | TypeAttributes::ABSTRACT,
		base_type: None,
		fields: Vec::new(),
		methods: Vec::new(),
		properties: Vec::new(),
		events: Vec::new(),
		removed: false,
	}
}

/// A sealed, sequentially-laid-out value type deriving from the framework's
/// value-type marker.
pub fn new_value_type(namespace: impl Into<String>, name: impl Into<String>) -> TypeDef {
	TypeDef {
		namespace: namespace.into(),
		name: name.into(),
		attributes: TypeAttributes::PUBLIC | TypeAttributes::SEALED | TypeAttributes::SEQUENTIAL_LAYOUT,
		base_type: Some(TypeRef::value_type_base()),
		fields: Vec::new(),
		methods: Vec::new(),
		properties: Vec::new(),
		events: Vec::new(),
		removed: false,
	}
}

/// A sealed enum deriving from the framework's enum marker, with the compiler's
/// `value__` backing field plus one literal static field per `(name, value)` pair
/// in `members`. Literal fields reference the enum's own (not-yet-attached) type.
pub fn new_enum(namespace: impl Into<String>, name: impl Into<String>, members: &[(&str, i32)]) -> TypeDef {
	let value_field = FieldDef {
		declaring_type: DETACHED,
		name: "value__".into(),
		ty: TypeRef::int32(),
		attributes: FieldAttributes::PUBLIC | FieldAttributes::SPECIAL_NAME | FieldAttributes::RT_SPECIAL_NAME,
		constant: None,
		removed: false,
	};

	let mut fields = vec![value_field];
	for (member_name, value) in members {
		fields.push(FieldDef {
			declaring_type: DETACHED,
			name: (*member_name).to_string(),
			ty: TypeRef::Local(DETACHED),
			attributes: FieldAttributes::PUBLIC | FieldAttributes::STATIC | FieldAttributes::LITERAL,
			constant: Some(value.to_le_bytes().to_vec()),
			removed: false,
		});
	}

	TypeDef {
		namespace: namespace.into(),
		name: name.into(),
		attributes: TypeAttributes::PUBLIC | TypeAttributes::SEALED,
		base_type: Some(TypeRef::enum_base()),
		fields,
		methods: Vec::new(),
		properties: Vec::new(),
		events: Vec::new(),
		removed: false,
	}
}

/// A detached, empty-bodied instance method. The caller composes the body with the
/// IL Emitter and Code Injector after the Rewriter attaches it to a type.
pub fn new_method(name: impl Into<String>, return_type: TypeRef, params: Vec<(impl Into<String>, TypeRef)>) -> MethodDef {
	let params = params.into_iter().map(|(name, ty)| Param { name: name.into(), ty }).collect();
	method(name, MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG, return_type, params)
}

/// A detached instance constructor (`.ctor`) with a caller-supplied parameter list
/// and an empty body — unlike [`new_class`]'s implicit default constructor, this one
/// does not presume a parameterless base call.
pub fn new_constructor(params: Vec<(impl Into<String>, TypeRef)>) -> MethodDef {
	let params = params.into_iter().map(|(name, ty)| Param { name: name.into(), ty }).collect();
	method(
		".ctor",
		MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME | MethodAttributes::RT_SPECIAL_NAME | MethodAttributes::HIDE_BY_SIG,
		TypeRef::void(),
		params,
	)
}

/// Relative position of the getter within the pair [`new_auto_property`] returns,
/// before the Rewriter has assigned either method a real [`crate::model::MethodIndex`].
pub const GETTER_SLOT: usize = 0;
/// Relative position of the setter within the same pair.
pub const SETTER_SLOT: usize = 1;

/// A property, its compiler-style backing field, and an empty-bodied getter/setter
/// pair, in that order. `property.getter`/`property.setter` already name
/// [`GETTER_SLOT`]/[`SETTER_SLOT`] as a relative pairing convention;
/// [`crate::rewriter::Rewriter::add_auto_property`] resolves them to the absolute
/// method indices the getter and setter receive once attached.
pub fn new_auto_property(name: impl Into<String>, ty: TypeRef) -> (PropertyDef, FieldDef, MethodDef, MethodDef) {
	let name = name.into();
	let backing_field_name = format!("<{name}>k__BackingField");

	let backing_field = FieldDef {
		declaring_type: DETACHED,
		name: backing_field_name,
		ty: ty.clone(),
		attributes: FieldAttributes::PRIVATE,
		constant: None,
		removed: false,
	};

	let getter = method(
		format!("get_{name}"),
		MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME | MethodAttributes::HIDE_BY_SIG,
		ty.clone(),
		Vec::new(),
	);
	let setter = method(
		format!("set_{name}"),
		MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME | MethodAttributes::HIDE_BY_SIG,
		TypeRef::void(),
		vec![Param { name: "value".into(), ty: ty.clone() }],
	);

	let property = PropertyDef {
		declaring_type: DETACHED,
		name,
		attributes: PropertyAttributes::empty(),
		ty,
		getter: Some(crate::model::MethodIndex(GETTER_SLOT)),
		setter: Some(crate::model::MethodIndex(SETTER_SLOT)),
	};

	(property, backing_field, getter, setter)
}

/// A detached event with add/remove accessors left for the caller to attach,
/// mirroring [`new_auto_property`]'s relative-slot convention.
pub fn new_event(name: impl Into<String>, event_type: TypeRef) -> (EventDef, MethodDef, MethodDef) {
	let name = name.into();
	let add = method(
		format!("add_{name}"),
		MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME | MethodAttributes::HIDE_BY_SIG,
		TypeRef::void(),
		vec![Param { name: "value".into(), ty: event_type.clone() }],
	);
	let remove = method(
		format!("remove_{name}"),
		MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME | MethodAttributes::HIDE_BY_SIG,
		TypeRef::void(),
		vec![Param { name: "value".into(), ty: event_type.clone() }],
	);

	let event = EventDef {
		declaring_type: DETACHED,
		name,
		attributes: crate::raw::heaps::table::EventAttributes::empty(),
		event_type,
		add: Some(crate::model::MethodIndex(GETTER_SLOT)),
		remove: Some(crate::model::MethodIndex(SETTER_SLOT)),
	};

	(event, add, remove)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::Mnemonic;

	#[test]
	fn new_class_is_public_and_derives_from_object() {
		let ty = new_class("My.Namespace", "Widget");
		assert!(ty.attributes.contains(TypeAttributes::PUBLIC));
		assert_eq!(ty.base_type, Some(TypeRef::object()));
		assert_eq!(ty.methods.len(), 1);
		assert_eq!(ty.methods[0].name, ".ctor");
	}

	#[test]
	fn default_constructor_calls_base_ctor_and_returns() {
		let ty = new_class("My", "Widget");
		let ctor = &ty.methods[0];
		let opcodes: Vec<_> = ctor.body.instructions.iter().map(|i| i.mnemonic).collect();
		assert!(opcodes.contains(&Mnemonic::Call));
		assert_eq!(opcodes.last(), Some(&Mnemonic::Ret));
	}

	#[test]
	fn interface_has_null_parent_and_interface_abstract_flags() {
		let ty = new_interface("My", "IWidget");
		assert!(ty.attributes.contains(TypeAttributes::INTERFACE));
		assert!(ty.attributes.contains(TypeAttributes::ABSTRACT));
		assert_eq!(ty.base_type, None);
	}

	#[test]
	fn value_type_is_sealed_and_sequential() {
		let ty = new_value_type("My", "Point");
		assert!(ty.attributes.contains(TypeAttributes::SEALED));
		assert!(ty.attributes.contains(TypeAttributes::SEQUENTIAL_LAYOUT));
		assert_eq!(ty.base_type, Some(TypeRef::value_type_base()));
	}

	#[test]
	fn enum_carries_value_field_and_one_literal_per_member() {
		let ty = new_enum("My", "Color", &[("Red", 0), ("Green", 1), ("Blue", 2)]);
		assert_eq!(ty.base_type, Some(TypeRef::enum_base()));
		assert_eq!(ty.fields.len(), 4);
		assert_eq!(ty.fields[0].name, "value__");
		assert!(ty.fields[1].attributes.contains(FieldAttributes::LITERAL));
		assert_eq!(ty.fields[2].constant, Some(1i32.to_le_bytes().to_vec()));
	}

	#[test]
	fn auto_property_wires_relative_getter_setter_slots() {
		let (property, field, getter, setter) = new_auto_property("Count", TypeRef::int32());
		assert_eq!(property.getter, Some(crate::model::MethodIndex(GETTER_SLOT)));
		assert_eq!(property.setter, Some(crate::model::MethodIndex(SETTER_SLOT)));
		assert_eq!(field.name, "<Count>k__BackingField");
		assert_eq!(getter.name, "get_Count");
		assert_eq!(setter.name, "set_Count");
		assert!(getter.body.instructions.is_empty());
	}
}
