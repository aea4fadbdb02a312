//! Structural comparison of two assembly models, producing a tree of type- and
//! member-level adds, removes, and modifications. Walks top-level types first; a
//! type present in both models recurses into its members, keyed by canonical
//! signature (methods) or by name (fields, properties, events). Reports only
//! structural drift — two bodies that compute the same result via different
//! instructions are still `modified`.

use crate::model::{AssemblyModel, MethodDef, TypeDef};
use crate::signature::method_signature;
use std::collections::HashMap;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DiffKind {
	Added,
	Removed,
	Modified,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemberDiff {
	pub kind: DiffKind,
	pub subject: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TypeDiff {
	pub kind: DiffKind,
	pub subject: String,
	pub members: Vec<MemberDiff>,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct AssemblyDiff {
	pub types: Vec<TypeDiff>,
}

impl AssemblyDiff {
	pub fn is_empty(&self) -> bool {
		self.types.is_empty()
	}
}

/// Compares `a` against `b`, keying types by full name (namespace-qualified), since
/// metadata tokens are not stable across independently loaded or rewritten models.
pub fn diff(a: &AssemblyModel, b: &AssemblyModel) -> AssemblyDiff {
	let a_types: HashMap<String, &TypeDef> =
		a.module.types.iter().filter(|t| !t.removed).map(|t| (t.full_name(), t)).collect();
	let b_types: HashMap<String, &TypeDef> =
		b.module.types.iter().filter(|t| !t.removed).map(|t| (t.full_name(), t)).collect();

	let mut names: Vec<&String> = a_types.keys().chain(b_types.keys()).collect();
	names.sort();
	names.dedup();

	let mut types = Vec::new();
	for name in names {
		match (a_types.get(name), b_types.get(name)) {
			(None, Some(_)) => types.push(TypeDiff { kind: DiffKind::Added, subject: name.clone(), members: Vec::new() }),
			(Some(_), None) => types.push(TypeDiff { kind: DiffKind::Removed, subject: name.clone(), members: Vec::new() }),
			(Some(ta), Some(tb)) => {
				let members = diff_members(a, ta, b, tb);
				if !members.is_empty() {
					types.push(TypeDiff { kind: DiffKind::Modified, subject: name.clone(), members });
				}
			},
			(None, None) => unreachable!("name collected from at least one side"),
		}
	}

	AssemblyDiff { types }
}

fn diff_members(a: &AssemblyModel, ta: &TypeDef, b: &AssemblyModel, tb: &TypeDef) -> Vec<MemberDiff> {
	let mut out = Vec::new();
	out.extend(diff_methods(a, ta, b, tb));
	out.extend(diff_by_name(
		ta.fields.iter().filter(|f| !f.removed).map(|f| &f.name),
		tb.fields.iter().filter(|f| !f.removed).map(|f| &f.name),
		|_| true,
	));
	out.extend(diff_by_name(ta.properties.iter().map(|p| &p.name), tb.properties.iter().map(|p| &p.name), |_| true));
	out.extend(diff_by_name(ta.events.iter().map(|e| &e.name), tb.events.iter().map(|e| &e.name), |_| true));
	out
}

fn diff_by_name<'a>(
	a_names: impl Iterator<Item = &'a String>,
	b_names: impl Iterator<Item = &'a String>,
	_keep: impl Fn(&str) -> bool,
) -> Vec<MemberDiff> {
	let a: std::collections::HashSet<&String> = a_names.collect();
	let b: std::collections::HashSet<&String> = b_names.collect();

	let mut names: Vec<&&String> = a.union(&b).collect();
	names.sort();

	names
		.into_iter()
		.filter_map(|name| match (a.contains(*name), b.contains(*name)) {
			(false, true) => Some(MemberDiff { kind: DiffKind::Added, subject: (*name).clone() }),
			(true, false) => Some(MemberDiff { kind: DiffKind::Removed, subject: (*name).clone() }),
			_ => None,
		})
		.collect()
}

fn diff_methods(a: &AssemblyModel, ta: &TypeDef, b: &AssemblyModel, tb: &TypeDef) -> Vec<MemberDiff> {
	let a_methods: HashMap<String, &MethodDef> =
		ta.methods.iter().filter(|m| !m.removed).map(|m| (method_signature(&a.module, m, None), m)).collect();
	let b_methods: HashMap<String, &MethodDef> =
		tb.methods.iter().filter(|m| !m.removed).map(|m| (method_signature(&b.module, m, None), m)).collect();

	let mut signatures: Vec<&String> = a_methods.keys().chain(b_methods.keys()).collect();
	signatures.sort();
	signatures.dedup();

	signatures
		.into_iter()
		.filter_map(|signature| match (a_methods.get(signature), b_methods.get(signature)) {
			(None, Some(_)) => Some(MemberDiff { kind: DiffKind::Added, subject: signature.clone() }),
			(Some(_), None) => Some(MemberDiff { kind: DiffKind::Removed, subject: signature.clone() }),
			(Some(ma), Some(mb)) if bodies_differ(ma, mb) => {
				Some(MemberDiff { kind: DiffKind::Modified, subject: signature.clone() })
			},
			_ => None,
		})
		.collect()
}

/// Length first, then opcode sequence — operand payloads are deliberately ignored
/// so renumbering an instruction's internal ids never registers as drift.
fn bodies_differ(a: &MethodDef, b: &MethodDef) -> bool {
	if a.body.instructions.len() != b.body.instructions.len() {
		return true;
	}
	a.body
		.instructions
		.iter()
		.zip(b.body.instructions.iter())
		.any(|(ia, ib)| ia.mnemonic != ib.mnemonic)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::identifiers::Mvid;
	use crate::model::{AssemblyVersion, Module, TypeRef};
	use crate::raw::heaps::table::{MethodAttributes, MethodImplAttributes, TypeAttributes};

	fn sample_type(methods: Vec<MethodDef>) -> TypeDef {
		TypeDef {
			namespace: "N".into(),
			name: "T".into(),
			attributes: TypeAttributes::PUBLIC,
			base_type: Some(TypeRef::object()),
			fields: Vec::new(),
			methods,
			properties: Vec::new(),
			events: Vec::new(),
			removed: false,
		}
	}

	fn sample_method(name: &str) -> MethodDef {
		MethodDef {
			declaring_type: crate::model::TypeIndex(0),
			name: name.into(),
			attributes: MethodAttributes::PUBLIC,
			impl_attributes: MethodImplAttributes::IL,
			return_type: TypeRef::void(),
			params: Vec::new(),
			generic_param_count: 0,
			body: Default::default(),
			removed: false,
		}
	}

	fn model_with(types: Vec<TypeDef>) -> AssemblyModel {
		AssemblyModel {
			name: "A".into(),
			full_name: "A".into(),
			version: AssemblyVersion { major: 1, minor: 0, build: 0, revision: 0 },
			mvid: Mvid([0; 16]),
			target_framework_moniker: None,
			module: Module { name: "A".into(), types, assembly_refs: Vec::new(), resources: Vec::new() },
		}
	}

	#[test]
	fn added_method_produces_one_modified_type_and_one_added_member() {
		let a = model_with(vec![sample_type(vec![])]);
		let b = model_with(vec![sample_type(vec![sample_method("M")])]);

		let result = diff(&a, &b);
		assert_eq!(result.types.len(), 1);
		let type_diff = &result.types[0];
		assert_eq!(type_diff.kind, DiffKind::Modified);
		assert_eq!(type_diff.subject, "N.T");
		assert_eq!(type_diff.members.len(), 1);
		assert_eq!(type_diff.members[0].kind, DiffKind::Added);
	}

	#[test]
	fn identical_models_produce_no_diff() {
		let a = model_with(vec![sample_type(vec![sample_method("M")])]);
		let b = model_with(vec![sample_type(vec![sample_method("M")])]);
		assert!(diff(&a, &b).is_empty());
	}

	#[test]
	fn added_type_has_no_member_diffs() {
		let a = model_with(vec![]);
		let b = model_with(vec![sample_type(vec![sample_method("M")])]);
		let result = diff(&a, &b);
		assert_eq!(result.types.len(), 1);
		assert_eq!(result.types[0].kind, DiffKind::Added);
		assert!(result.types[0].members.is_empty());
	}

	#[test]
	fn differing_body_length_is_modified() {
		let mut changed = sample_method("M");
		let mut builder = crate::emitter::IlBuilder::new();
		builder.nop().ret();
		changed.body.instructions = builder.build();

		let a = model_with(vec![sample_type(vec![sample_method("M")])]);
		let b = model_with(vec![sample_type(vec![changed])]);
		let result = diff(&a, &b);
		assert_eq!(result.types[0].members[0].kind, DiffKind::Modified);
	}
}
