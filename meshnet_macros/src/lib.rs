//! `#[meshnet::handler]`: an attribute macro that turns a plain function into a reflective
//! default-data handler. Two parameter names are reserved and bound positionally —
//! `connection_uid` to the sending connection's `Uid`, `message_metadata` to the frame's
//! `Metadata` byte — every other parameter must have a codec registered for its type and is
//! decoded from the payload in declaration order.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::{format_ident, quote};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, FnArg, ItemFn, Lit, Meta, Pat, PatIdent, Token, Type};

struct HandlerArgs {
    key: syn::LitInt,
    side: Option<syn::LitStr>,
    required_flags: Option<syn::LitInt>,
}

impl syn::parse::Parse for HandlerArgs {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let mut key = None;
        let mut side = None;
        let mut required_flags = None;

        let pairs = Punctuated::<Meta, Token![,]>::parse_terminated(input)?;
        for pair in pairs {
            let name_value = match pair {
                Meta::NameValue(nv) => nv,
                other => return Err(syn::Error::new_spanned(other, "expected `name = value`")),
            };
            let ident = name_value
                .path
                .get_ident()
                .ok_or_else(|| syn::Error::new_spanned(&name_value.path, "expected an identifier"))?;

            match ident.to_string().as_str() {
                "key" => {
                    let lit = expect_lit(&name_value.value)?;
                    match lit {
                        Lit::Int(lit_int) => key = Some(lit_int.clone()),
                        _ => return Err(syn::Error::new_spanned(lit, "`key` must be an integer literal")),
                    }
                }
                "side" => {
                    let lit = expect_lit(&name_value.value)?;
                    match lit {
                        Lit::Str(lit_str) => side = Some(lit_str.clone()),
                        _ => return Err(syn::Error::new_spanned(lit, "`side` must be a string literal")),
                    }
                }
                "required_flags" => {
                    let lit = expect_lit(&name_value.value)?;
                    match lit {
                        Lit::Int(lit_int) => required_flags = Some(lit_int.clone()),
                        _ => return Err(syn::Error::new_spanned(lit, "`required_flags` must be an integer literal")),
                    }
                }
                other => {
                    return Err(syn::Error::new_spanned(
                        ident,
                        format!("unknown `#[handler]` attribute `{other}`"),
                    ))
                }
            }
        }

        let key = key.ok_or_else(|| syn::Error::new(Span::call_site(), "#[handler] requires `key = <integer>`"))?;
        Ok(HandlerArgs { key, side, required_flags })
    }
}

fn expect_lit(expr: &syn::Expr) -> syn::Result<&Lit> {
    match expr {
        syn::Expr::Lit(syn::ExprLit { lit, .. }) => Ok(lit),
        other => Err(syn::Error::new_spanned(other, "expected a literal")),
    }
}

fn side_tokens(side: &Option<syn::LitStr>) -> syn::Result<proc_macro2::TokenStream> {
    let value = side.as_ref().map(|lit| lit.value());
    Ok(match value.as_deref() {
        None | Some("Any") => quote! { meshnet::config::MessageSide::Any },
        Some("None") => quote! { meshnet::config::MessageSide::None },
        Some("Client") => quote! { meshnet::config::MessageSide::Client },
        Some("Server") => quote! { meshnet::config::MessageSide::Server },
        Some("Common") => quote! { meshnet::config::MessageSide::Common },
        Some(other) => {
            return Err(syn::Error::new(
                Span::call_site(),
                format!("unknown `side` value `{other}`, expected one of None/Client/Server/Common/Any"),
            ))
        }
    })
}

#[proc_macro_attribute]
pub fn handler(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as HandlerArgs);
    let func = parse_macro_input!(item as ItemFn);

    match expand(args, func) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(args: HandlerArgs, func: ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    let fn_name = &func.sig.ident;
    let register_fn_name = format_ident!("{}_register", fn_name);
    let key = &args.key;
    let side = side_tokens(&args.side)?;
    let required_flags = match &args.required_flags {
        Some(lit) => quote! { #lit },
        None => quote! { 0u16 },
    };

    let mut call_args = Vec::new();
    let mut decode_stmts = Vec::new();
    let mut arg_types: Vec<Type> = Vec::new();
    let mut seen_uid = false;
    let mut seen_metadata = false;
    let mut decode_idx = 0usize;

    for input in &func.sig.inputs {
        let pat_type = match input {
            FnArg::Typed(pat_type) => pat_type,
            FnArg::Receiver(r) => {
                return Err(syn::Error::new_spanned(r, "#[meshnet::handler] cannot be applied to a method"))
            }
        };
        let ident = match pat_type.pat.as_ref() {
            Pat::Ident(PatIdent { ident, .. }) => ident.clone(),
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "#[meshnet::handler] parameters must be simple identifiers",
                ))
            }
        };

        match ident.to_string().as_str() {
            "connection_uid" => {
                if seen_uid {
                    return Err(syn::Error::new_spanned(
                        &ident,
                        "duplicate `connection_uid` parameter",
                    ));
                }
                seen_uid = true;
                call_args.push(quote! { __uid });
            }
            "message_metadata" => {
                if seen_metadata {
                    return Err(syn::Error::new_spanned(
                        &ident,
                        "duplicate `message_metadata` parameter",
                    ));
                }
                seen_metadata = true;
                call_args.push(quote! { __metadata });
            }
            _ => {
                let ty = (*pat_type.ty).clone();
                let arg_ident = format_ident!("__arg{}", decode_idx);
                decode_idx += 1;

                decode_stmts.push(quote! {
                    let #arg_ident: #ty = __codecs.deserialize(&mut __cursor)?;
                });
                arg_types.push(ty);
                call_args.push(quote! { #arg_ident });
            }
        }
    }

    Ok(quote! {
        #func

        /// Registers `#fn_name` as a reflective default-data handler. Generated by
        /// `#[meshnet::handler]`.
        #[allow(non_snake_case)]
        pub fn #register_fn_name(
            __dispatcher: &meshnet::dispatch::Dispatcher,
        ) -> ::std::result::Result<(), meshnet::error::RegistrationError> {
            #( __dispatcher.codecs().require::<#arg_types>()?; )*

            let __codecs = __dispatcher.codecs_arc();
            __dispatcher.register_default(
                #key,
                #side,
                #required_flags,
                ::std::boxed::Box::new(move |__uid, __record, __metadata, __payload| {
                    let mut __cursor = ::std::io::Cursor::new(__payload);
                    #(#decode_stmts)*
                    let _ = __record;
                    #fn_name(#(#call_args),*);
                    Ok(())
                }),
            );
            Ok(())
        }
    })
}
