//! `#[obs]` attaches a `tracing::instrument` span to queue operations.
//!
//! The span is only emitted when the consuming crate is built with its
//! `observability` feature; otherwise the attribute expands to nothing.
//! Every span records the operation name in an `op` field so backend and
//! session spans can be filtered together.

use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, LitStr, parse_macro_input};

#[proc_macro_attribute]
pub fn obs(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item = parse_macro_input!(input as ItemFn);
    let op = LitStr::new(&item.sig.ident.to_string(), item.sig.ident.span());
    let attr = if args.is_empty() {
        syn::parse_quote!(
            #[cfg_attr(
                feature = "observability",
                tracing::instrument(level = "debug", skip_all, fields(op = #op))
            )]
        )
    } else {
        let args = proc_macro2::TokenStream::from(args);
        syn::parse_quote!(
            #[cfg_attr(
                feature = "observability",
                tracing::instrument(level = "debug", fields(op = #op), #args)
            )]
        )
    };
    item.attrs.push(attr);
    TokenStream::from(quote!(#item))
}
