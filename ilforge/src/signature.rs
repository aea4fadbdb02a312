//! Canonical textual signatures used to re-find a member after a rewrite has
//! changed its metadata token, plus the short hash used as a generic-instantiation
//! suffix. A signature string is pure and depends only on the reference's
//! structural content: two calls against equal input always agree byte-for-byte.

use crate::model::{MethodDef, Module, Param, TypeRef};

/// Walks a [`TypeRef`] and renders it per the recursive rules: generic instances
/// inline their arguments, arrays append `[,,]` with `rank - 1` commas, by-ref and
/// pointer markers suffix the referent, and modifiers wrap it with an inline
/// reference to the modifier type.
pub fn type_signature(module: &Module, ty: &TypeRef) -> String {
	match ty {
		TypeRef::Local(index) => match module.type_by_index(*index) {
			Some(def) => def.full_name(),
			None => format!("<unresolved:{}>", index.0),
		},
		TypeRef::External { full_name, .. } => full_name.clone(),
		TypeRef::GenericParam { ordinal, is_method_param } => match is_method_param {
			true => format!("!!{ordinal}"),
			false => format!("!{ordinal}"),
		},
		TypeRef::GenericInstance { base, args } => {
			let base = type_signature(module, base);
			let args: Vec<_> = args.iter().map(|a| type_signature(module, a)).collect();
			format!("{base}<{}>", args.join(","))
		},
		TypeRef::Array { element, rank } => {
			let element = type_signature(module, element);
			let commas = ",".repeat((*rank).saturating_sub(1) as usize);
			format!("{element}[{commas}]")
		},
		TypeRef::ByRef(referent) => format!("{}&", type_signature(module, referent)),
		TypeRef::Pointer(referent) => format!("{}*", type_signature(module, referent)),
		TypeRef::RequiredModifier { modifier, referent } => {
			format!("{} mod{{req}}({})", type_signature(module, referent), type_signature(module, modifier))
		},
		TypeRef::OptionalModifier { modifier, referent } => {
			format!("{} mod{{opt}}({})", type_signature(module, referent), type_signature(module, modifier))
		},
	}
}

fn param_signature(module: &Module, params: &[Param], generic_instance_args: Option<&[TypeRef]>) -> String {
	match generic_instance_args {
		Some(args) => args.iter().map(|a| type_signature(module, a)).collect::<Vec<_>>().join(", "),
		None => params.iter().map(|p| format!("{} {}", type_signature(module, &p.ty), p.name)).collect::<Vec<_>>().join(", "),
	}
}

/// `sig(return) ' ' name ['<' generics '>'] '(' params ')'`. Instantiated generic
/// methods embed their argument signatures in place of `generics`; uninstantiated
/// ones omit the angle-bracket clause entirely and embed parameter names by ordinal
/// in the parenthesized list.
pub fn method_signature(module: &Module, method: &MethodDef, generic_instance_args: Option<&[TypeRef]>) -> String {
	let return_sig = type_signature(module, &method.return_type);
	let generics = match (method.generic_param_count, generic_instance_args) {
		(0, _) => String::new(),
		(_, Some(args)) => format!("<{}>", args.iter().map(|a| type_signature(module, a)).collect::<Vec<_>>().join(",")),
		(n, None) => format!("<{}>", (0..n).map(|i| format!("!!{i}")).collect::<Vec<_>>().join(",")),
	};
	let params = param_signature(module, &method.params, None);
	format!("{return_sig} {}{generics}({params})", method.name)
}

/// A 64-bit FNV-1a digest of the signature's UTF-8 bytes, rendered as 16 uppercase
/// hex characters. Collision resistance here is documentation-level: the hash exists
/// to give generic instantiations a short, stable suffix, not to authenticate
/// anything.
pub fn signature_hash(signature: &str) -> String {
	const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
	const PRIME: u64 = 0x100000001b3;

	let mut hash = OFFSET_BASIS;
	for byte in signature.as_bytes() {
		hash ^= *byte as u64;
		hash = hash.wrapping_mul(PRIME);
	}

	format!("{hash:016X}")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{Module, TypeDef};
	use crate::raw::heaps::table::TypeAttributes;

	fn empty_module() -> Module {
		Module { name: "Test".into(), types: Vec::new(), assembly_refs: Vec::new(), resources: Vec::new() }
	}

	#[test]
	fn plain_reference_is_full_name() {
		let module = empty_module();
		let ty = TypeRef::external("mscorlib", "System.String");
		assert_eq!(type_signature(&module, &ty), "System.String");
	}

	#[test]
	fn array_signature_uses_commas_for_rank() {
		let module = empty_module();
		let ty = TypeRef::Array { element: Box::new(TypeRef::int32()), rank: 3 };
		assert_eq!(type_signature(&module, &ty), "System.Int32[,,]");
	}

	#[test]
	fn byref_and_pointer_suffix_referent() {
		let module = empty_module();
		let byref = TypeRef::ByRef(Box::new(TypeRef::int32()));
		let ptr = TypeRef::Pointer(Box::new(TypeRef::int32()));
		assert_eq!(type_signature(&module, &byref), "System.Int32&");
		assert_eq!(type_signature(&module, &ptr), "System.Int32*");
	}

	#[test]
	fn generic_instance_inlines_arguments() {
		let module = empty_module();
		let ty = TypeRef::GenericInstance {
			base: Box::new(TypeRef::external("mscorlib", "System.Collections.Generic.List")),
			args: vec![TypeRef::int32(), TypeRef::external("mscorlib", "System.String")],
		};
		assert_eq!(type_signature(&module, &ty), "System.Collections.Generic.List<System.Int32,System.String>");
	}

	#[test]
	fn signature_is_pure() {
		let module = empty_module();
		let ty = TypeRef::int32();
		assert_eq!(type_signature(&module, &ty), type_signature(&module, &ty));
	}

	#[test]
	fn hash_is_stable_sixteen_hex_chars() {
		let a = signature_hash("System.Int32 Foo(System.String s)");
		let b = signature_hash("System.Int32 Foo(System.String s)");
		assert_eq!(a, b);
		assert_eq!(a.len(), 16);
		assert!(a.chars().all(|c| c.is_ascii_hexdigit() && (c.is_ascii_digit() || c.is_ascii_uppercase())));
	}

	#[test]
	fn local_type_resolves_via_module() {
		let mut module = empty_module();
		module.types.push(TypeDef {
			namespace: "My".into(),
			name: "Thing".into(),
			attributes: TypeAttributes::PUBLIC,
			base_type: Some(TypeRef::object()),
			fields: Vec::new(),
			methods: Vec::new(),
			properties: Vec::new(),
			events: Vec::new(),
			removed: false,
		});
		let ty = TypeRef::Local(crate::model::TypeIndex(0));
		assert_eq!(type_signature(&module, &ty), "My.Thing");
	}
}
