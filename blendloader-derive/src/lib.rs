//! # blendloader Derive Macros
//!
//! This crate provides `#[derive(DnaStruct)]` for `blendloader`. The derive describes a Rust
//! struct as an entry of the struct descriptor table and implements typed reads and writes
//! through `blendloader::dna::StructView`.
//!
//! Compatible with `syn 2.0`.
//!
//! ## Attributes
//!
//! * `#[dna(name = "ID")]` on the struct: table name (defaults to the Rust identifier).
//! * `#[dna(string = 66)]` on a `String` field: `char name[66]`.
//! * `#[dna(pointer)]` / `#[dna(pointer = "Library")]` on a `u64` field: `Library *name`
//!   (pointee `void` when omitted).
//! * `#[dna(rename = "...")]` on a field: member name in the table.
//!
//! Every other field type must implement `blendloader::dna::DnaField`: the scalar primitives,
//! fixed arrays of them and other `DnaStruct` types.

use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, LitInt, LitStr, parse_macro_input};

/// Derives `DnaStruct` and `DnaField`.
#[proc_macro_derive(DnaStruct, attributes(dna))]
pub fn derive_dna_struct(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let data_struct = match input.data {
        Data::Struct(ds) => ds,
        _ => {
            return syn::Error::new(name.span(), "DnaStruct only supports structs")
                .to_compile_error()
                .into();
        }
    };

    let Fields::Named(named) = data_struct.fields else {
        return syn::Error::new(name.span(), "DnaStruct requires named fields")
            .to_compile_error()
            .into();
    };

    let table_name = match parse_struct_attributes(&input.attrs) {
        Ok(Some(n)) => n,
        Ok(None) => name.to_string(),
        Err(e) => return e.to_compile_error().into(),
    };

    let mut fields = Vec::new();
    for field in named.named {
        let attrs = match parse_field_attributes(&field.attrs) {
            Ok(res) => res,
            Err(e) => return e.to_compile_error().into(),
        };
        let Some(ident) = field.ident.clone() else {
            continue;
        };
        let member = attrs
            .rename
            .clone()
            .unwrap_or_else(|| ident.to_string().trim_start_matches("r#").to_string());
        fields.push(FieldSpec {
            ident,
            ty: field.ty,
            member,
            repr: attrs.repr,
        });
    }

    let describe = generate_describe(&fields);
    let reads = generate_reads(&fields);
    let writes = generate_writes(&fields);

    let expanded = quote! {
        impl blendloader::dna::DnaStruct for #name {
            const NAME: &'static str = #table_name;

            fn describe(builder: &mut blendloader::dna::CatalogBuilder) -> blendloader::Result<usize> {
                if builder.has_struct(#table_name) {
                    return builder.add_struct(#table_name, &[]);
                }
                let mut members: Vec<(String, String)> = Vec::new();
                #(#describe)*
                builder.add_struct(#table_name, &members)
            }

            fn read(view: &blendloader::dna::StructView<'_>) -> blendloader::Result<Self> {
                Ok(Self {
                    #(#reads),*
                })
            }

            fn write(&self, view: &mut blendloader::dna::StructViewMut<'_>) -> blendloader::Result<()> {
                #(#writes)*
                Ok(())
            }
        }

        impl blendloader::dna::DnaField for #name {
            fn declare(
                builder: &mut blendloader::dna::CatalogBuilder,
                name: &str,
            ) -> blendloader::Result<(String, String)> {
                <Self as blendloader::dna::DnaStruct>::describe(builder)?;
                Ok((#table_name.to_string(), name.to_string()))
            }

            fn read_member(view: &blendloader::dna::StructView<'_>, name: &str) -> blendloader::Result<Self> {
                <Self as blendloader::dna::DnaStruct>::read(&view.substruct(name)?)
            }

            fn write_member(
                &self,
                view: &mut blendloader::dna::StructViewMut<'_>,
                name: &str,
            ) -> blendloader::Result<()> {
                <Self as blendloader::dna::DnaStruct>::write(self, &mut view.substruct_mut(name)?)
            }
        }
    };

    TokenStream::from(expanded)
}

// --- Internal Data Structures ---

enum Repr {
    Field,
    String(usize),
    Pointer(String),
}

struct FieldAttrs {
    repr: Repr,
    rename: Option<String>,
}

struct FieldSpec {
    ident: syn::Ident,
    ty: syn::Type,
    member: String,
    repr: Repr,
}

/// Parses `#[dna(name = "...")]` on the struct.
fn parse_struct_attributes(attrs: &[Attribute]) -> syn::Result<Option<String>> {
    let mut name = None;
    for attr in attrs {
        if attr.path().is_ident("dna") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    let s: LitStr = meta.value()?.parse()?;
                    name = Some(s.value());
                    return Ok(());
                }
                Err(meta.error("Unknown dna struct attribute. Supported: name"))
            })?;
        }
    }
    Ok(name)
}

/// Parses `#[dna(string = N)]`, `#[dna(pointer)]`, `#[dna(pointer = "T")]` and
/// `#[dna(rename = "...")]` on a field.
fn parse_field_attributes(attrs: &[Attribute]) -> syn::Result<FieldAttrs> {
    let mut repr = Repr::Field;
    let mut rename = None;

    for attr in attrs {
        if attr.path().is_ident("dna") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("string") {
                    let n: LitInt = meta.value()?.parse()?;
                    repr = Repr::String(n.base10_parse()?);
                    return Ok(());
                }

                if meta.path.is_ident("pointer") {
                    let pointee = if meta.input.peek(syn::Token![=]) {
                        let s: LitStr = meta.value()?.parse()?;
                        s.value()
                    } else {
                        "void".to_string()
                    };
                    repr = Repr::Pointer(pointee);
                    return Ok(());
                }

                if meta.path.is_ident("rename") {
                    let s: LitStr = meta.value()?.parse()?;
                    rename = Some(s.value());
                    return Ok(());
                }

                Err(meta.error("Unknown dna attribute key. Supported: string, pointer, rename"))
            })?;
        }
    }
    Ok(FieldAttrs { repr, rename })
}

// --- Generators ---

fn generate_describe(fields: &[FieldSpec]) -> Vec<proc_macro2::TokenStream> {
    fields
        .iter()
        .map(|f| {
            let member = &f.member;
            let ty = &f.ty;
            match &f.repr {
                Repr::String(capacity) => quote! {
                    members.push(builder.string_member(#member, #capacity));
                },
                Repr::Pointer(pointee) => quote! {
                    members.push(builder.pointer_member(#member, #pointee));
                },
                Repr::Field => quote! {
                    members.push(<#ty as blendloader::dna::DnaField>::declare(builder, #member)?);
                },
            }
        })
        .collect()
}

fn generate_reads(fields: &[FieldSpec]) -> Vec<proc_macro2::TokenStream> {
    fields
        .iter()
        .map(|f| {
            let ident = &f.ident;
            let member = &f.member;
            let ty = &f.ty;
            match &f.repr {
                Repr::String(_) => quote! { #ident: view.string(#member)? },
                Repr::Pointer(_) => quote! { #ident: view.pointer(#member)? },
                Repr::Field => quote! {
                    #ident: <#ty as blendloader::dna::DnaField>::read_member(view, #member)?
                },
            }
        })
        .collect()
}

fn generate_writes(fields: &[FieldSpec]) -> Vec<proc_macro2::TokenStream> {
    fields
        .iter()
        .map(|f| {
            let ident = &f.ident;
            let member = &f.member;
            let ty = &f.ty;
            match &f.repr {
                Repr::String(_) => quote! { view.set_string(#member, &self.#ident)?; },
                Repr::Pointer(_) => quote! { view.set_pointer(#member, self.#ident)?; },
                Repr::Field => quote! {
                    <#ty as blendloader::dna::DnaField>::write_member(&self.#ident, view, #member)?;
                },
            }
        })
        .collect()
}
