#![recursion_limit = "128"]

extern crate proc_macro;

use proc_macro2::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parenthesized, Result};
use syn::{punctuated::Punctuated, token::Comma, DeriveInput};

#[derive(Default, Debug)]
struct FieldTags {
    is_tag: bool,
}

impl Parse for FieldTags {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut is_tag = false;

        let content;
        parenthesized!(content in input);
        let punctuated = Punctuated::<syn::Ident, Comma>::parse_terminated(&content)?;

        for pair in punctuated.pairs() {
            let val = pair.into_value();
            match val.to_string().as_str() {
                "tag" => is_tag = true,
                _ => return Err(syn::Error::new(val.span(), "unknown message attribute")),
            }
        }

        Ok(FieldTags { is_tag })
    }
}

fn is_marked(field: &syn::Field) -> Result<bool> {
    let mut marked = false;
    for attr in &field.attrs {
        if attr.path.is_ident("message") {
            let tags: FieldTags = syn::parse2(attr.tokens.clone())?;
            marked = marked || tags.is_tag;
        }
    }

    Ok(marked)
}

fn is_tag_type(ty: &syn::Type) -> bool {
    match ty {
        syn::Type::Path(path) => path
            .path
            .segments
            .last()
            .map(|seg| seg.ident == "MessageTag")
            .unwrap_or(false),
        _ => false,
    }
}

fn field_access(index: usize, field: &syn::Field) -> TokenStream {
    match &field.ident {
        Some(ident) => quote! { self.#ident },
        None => {
            let index = syn::Index::from(index);
            quote! { self.#index }
        }
    }
}

/// Picks the field carrying the tag: an explicit `#[message(tag)]`, then a
/// field named `tag`, then the only field typed `MessageTag`.
fn tag_field(ast: &DeriveInput) -> Result<TokenStream> {
    let data = match &ast.data {
        syn::Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new_spanned(
                &ast.ident,
                "Message can only be derived for structs",
            ))
        }
    };

    let fields: Vec<_> = data.fields.iter().enumerate().collect();

    for (idx, field) in &fields {
        if is_marked(field)? {
            return Ok(field_access(*idx, field));
        }
    }

    for (idx, field) in &fields {
        if field.ident.as_ref().map(|i| i == "tag").unwrap_or(false) {
            return Ok(field_access(*idx, field));
        }
    }

    let typed: Vec<_> = fields.iter().filter(|(_, f)| is_tag_type(&f.ty)).collect();
    match typed.as_slice() {
        [(idx, field)] => Ok(field_access(*idx, field)),
        [] => Err(syn::Error::new_spanned(
            &ast.ident,
            "no MessageTag field found, mark one with #[message(tag)]",
        )),
        _ => Err(syn::Error::new_spanned(
            &ast.ident,
            "several MessageTag fields found, mark one with #[message(tag)]",
        )),
    }
}

#[proc_macro_derive(Message, attributes(message))]
pub fn derive_message(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let ast: DeriveInput = match syn::parse(input) {
        Ok(ast) => ast,
        Err(err) => return err.to_compile_error().into(),
    };

    let name = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();

    let access = match tag_field(&ast) {
        Ok(access) => access,
        Err(err) => return err.to_compile_error().into(),
    };

    let tokens = quote! {
        impl #impl_generics tagbus::Message for #name #ty_generics #where_clause {
            #[inline]
            fn tag(&self) -> tagbus::MessageTag { #access }
        }
    };

    tokens.into()
}
