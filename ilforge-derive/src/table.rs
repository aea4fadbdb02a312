use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Field};

pub fn derive(tokens: proc_macro::TokenStream) -> TokenStream {
	let DeriveInput { ident, data, .. } = syn::parse(tokens).unwrap();

	let data = match data {
		Data::Struct(data) => data,
		Data::Enum(_) => panic!("Enums are not supported"),
		Data::Union(_) => panic!("Unions are not supported"),
	};

	let table = format_ident!("{}Table", ident);
	let reads = data.fields.iter().map(|Field { ident, ty, .. }| {
		quote! { #ident: <#ty as crate::utilities::FromByteStream>::read(stream, sizes)? }
	});

	quote! {
		#[derive(Debug)]
		pub struct #table {
			rows: Vec<#ident>,
		}

		impl #table {
			pub fn read(stream: &mut Cursor<&[u8]>, sizes: &IndexSizes, len: usize) -> std::io::Result<Self> {
				let mut rows = Vec::with_capacity(len);
				for _ in 0..len {
					rows.push(#ident { #(#reads),* })
				}
				Ok(Self { rows })
			}

			pub fn rows(&self) -> &[#ident] {
				&self.rows
			}

			pub fn get(&self, row: usize) -> Option<&#ident> {
				self.rows.get(row)
			}

			pub fn iter(&self) -> std::slice::Iter<'_, #ident> {
				self.rows.iter()
			}
		}

		impl Table for #table {
			fn len(&self) -> usize {
				self.rows.len()
			}

			fn kind(&self) -> TableKind {
				TableKind::#ident
			}
		}

		impl std::ops::Index<usize> for #table {
			type Output = #ident;
			fn index(&self, row: usize) -> &#ident {
				&self.rows[row]
			}
		}
	}
}
