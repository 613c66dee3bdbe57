//! Procedural macros for Parallax.
//!
//! This crate provides the `#[parallax::parallelized]` attribute that turns a
//! plain function into one whose calls can be captured by a
//! `ParallelizedEnvironment` and executed on a backend.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{
    Expr, FnArg, Ident, ItemFn, Lit, MetaNameValue, Pat, ReturnType, Token, Type, parse_macro_input,
};

/// Marks a function as parallelized.
///
/// # Options
///
/// - `key = |a, b| ...` - routing key; calls with equal keys share a job unit.
///   Receives every argument by reference. Without it all calls share one unit.
/// - `default = |a, b| ...` - placeholder returned while capturing. Defaults
///   to `Default::default()`, so return types without `Default` (such as
///   `Result`) need it.
/// - `batch = expr` - batch strategy for this function's calls.
/// - `name = "..."` - stable name, defaults to `module_path!()::fn_name`.
/// - `fail_on_err = false` - do not treat an `Err` return as a failed call.
///
/// # Example
///
/// ```rust,ignore
/// use parallax::prelude::*;
///
/// #[parallelized(key = |a, _b| *a, default = |_, _| -1)]
/// pub fn add(a: i64, b: i64) -> i64 {
///     cached("add", &(a, b), || a + b)
/// }
///
/// // A worker process resolves the function through the generated static:
/// let registry = Registry::new().function(&ADD_PARALLELIZED);
/// ```
///
/// # Generated items
///
/// - the function itself, now forwarding to the handle
/// - `<NAME>_PARALLELIZED`, a `static` `Parallelized` handle with the same
///   visibility as the function
///
/// Arguments must be owned, serializable and deserializable. Generic, async
/// and method functions are rejected.
#[proc_macro_attribute]
pub fn parallelized(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let options = match Punctuated::<MetaNameValue, Token![,]>::parse_terminated.parse(attr) {
        Ok(options) => options,
        Err(e) => return e.to_compile_error().into(),
    };

    match expand(input, options) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

#[derive(Default)]
struct Options {
    key: Option<Expr>,
    default: Option<Expr>,
    batch: Option<Expr>,
    name: Option<Expr>,
    fail_on_err: Option<bool>,
}

impl Options {
    fn parse(options: Punctuated<MetaNameValue, Token![,]>) -> syn::Result<Self> {
        let mut parsed = Self::default();
        for option in options {
            let Some(ident) = option.path.get_ident() else {
                return Err(syn::Error::new_spanned(&option.path, "expected an option name"));
            };
            let slot = match ident.to_string().as_str() {
                "key" => &mut parsed.key,
                "default" => &mut parsed.default,
                "batch" => &mut parsed.batch,
                "name" => &mut parsed.name,
                "fail_on_err" => {
                    parsed.fail_on_err = Some(bool_literal(&option.value)?);
                    continue;
                }
                other => {
                    return Err(syn::Error::new_spanned(
                        ident,
                        format!(
                            "unknown option `{}`; expected key, default, batch, name or fail_on_err",
                            other
                        ),
                    ));
                }
            };
            if slot.replace(option.value).is_some() {
                return Err(syn::Error::new_spanned(ident, "duplicate option"));
            }
        }
        Ok(parsed)
    }
}

fn bool_literal(expr: &Expr) -> syn::Result<bool> {
    match expr {
        Expr::Lit(lit) => match &lit.lit {
            Lit::Bool(b) => Ok(b.value),
            _ => Err(syn::Error::new_spanned(expr, "expected `true` or `false`")),
        },
        _ => Err(syn::Error::new_spanned(expr, "expected `true` or `false`")),
    }
}

/// Whether `ty` looks like a `Result<T, E>` (any path ending in `Result`).
fn returns_result(ty: &Type) -> bool {
    match ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "Result"),
        _ => false,
    }
}

fn expand(input: ItemFn, options: Punctuated<MetaNameValue, Token![,]>) -> syn::Result<proc_macro2::TokenStream> {
    let options = Options::parse(options)?;
    let sig = &input.sig;

    if let Some(asyncness) = &sig.asyncness {
        return Err(syn::Error::new_spanned(asyncness, "parallelized functions cannot be async"));
    }
    if !sig.generics.params.is_empty() || sig.generics.where_clause.is_some() {
        return Err(syn::Error::new_spanned(&sig.generics, "parallelized functions cannot be generic"));
    }
    if let Some(variadic) = &sig.variadic {
        return Err(syn::Error::new_spanned(variadic, "parallelized functions cannot be variadic"));
    }

    // Collect (pattern, type, forwarding ident) per argument
    let mut pats = Vec::new();
    let mut types = Vec::new();
    let mut idents = Vec::new();
    for (i, arg) in sig.inputs.iter().enumerate() {
        let typed = match arg {
            FnArg::Receiver(receiver) => {
                return Err(syn::Error::new_spanned(
                    receiver,
                    "parallelized functions cannot take `self`",
                ));
            }
            FnArg::Typed(typed) => typed,
        };
        if let Type::Reference(reference) = typed.ty.as_ref() {
            return Err(syn::Error::new_spanned(
                reference,
                "parallelized arguments must be owned so calls can be recorded",
            ));
        }
        let ident = match typed.pat.as_ref() {
            Pat::Ident(pat) if pat.subpat.is_none() => pat.ident.clone(),
            _ => format_ident!("__parallax_arg{}", i),
        };
        pats.push(typed.pat.as_ref().clone());
        types.push(typed.ty.as_ref().clone());
        idents.push(ident);
    }

    let output: Type = match &sig.output {
        ReturnType::Default => syn::parse_quote!(()),
        ReturnType::Type(_, ty) => ty.as_ref().clone(),
    };

    let vis = &input.vis;
    let attrs = &input.attrs;
    let fn_name = &sig.ident;
    let block = &input.block;
    let static_name = Ident::new(
        &format!("{}_PARALLELIZED", fn_name.to_string().to_uppercase()),
        fn_name.span(),
    );
    let indices = (0..types.len()).map(syn::Index::from).collect::<Vec<_>>();

    let name = match &options.name {
        Some(name) => quote!(#name),
        None => quote!(::core::concat!(::core::module_path!(), "::", ::core::stringify!(#fn_name))),
    };

    let constructor = match &options.default {
        Some(default) => quote! {
            fn __parallax_default<__F>(f: __F) -> __F
            where
                __F: Fn(#(&#types),*) -> #output,
            {
                f
            }
            let __default = __parallax_default(#default);
            ::parallax::Parallelized::with_default(
                #name,
                __parallax_target,
                move |__args: &(#(#types,)*)| __default(#(&__args.#indices),*),
            )
        },
        None => quote! {
            ::parallax::Parallelized::new(#name, __parallax_target)
        },
    };

    let routing_key = options.key.as_ref().map(|key| {
        quote! {
            fn __parallax_key<__K, __F>(f: __F) -> __F
            where
                __F: Fn(#(&#types),*) -> __K,
            {
                f
            }
            let __key = __parallax_key(#key);
            let __handle = __handle.routing_key(move |__args: &(#(#types,)*)| __key(#(&__args.#indices),*));
        }
    });

    let batch = options.batch.as_ref().map(|batch| {
        quote! {
            let __handle = __handle.batch_strategy(#batch);
        }
    });

    let fail_on_err = (options.fail_on_err.unwrap_or(true) && returns_result(&output)).then(|| {
        quote! {
            let __handle = __handle.fail_on_err();
        }
    });

    let static_doc = format!("Parallelized handle of [`{}`].", fn_name);
    Ok(quote! {
        #(#attrs)*
        #vis fn #fn_name(#(#idents: #types),*) -> #output {
            #static_name.call((#(#idents,)*))
        }

        #[doc = #static_doc]
        #vis static #static_name: ::parallax::__private::LazyLock<
            ::parallax::Parallelized<(#(#types,)*), #output>,
        > = ::parallax::__private::LazyLock::new(|| {
            fn __parallax_target((#(#pats,)*): (#(#types,)*)) -> #output #block

            let __handle = { #constructor };
            #routing_key
            #batch
            #fail_on_err
            __handle
        });
    })
}
