use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::Parser, punctuated::Punctuated, Attribute, Expr, ExprLit, ItemFn, Lit, Token,
};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

struct TimeoutArgs {
    secs: u64,
    paused: bool,
}

/// Accepts `#[attr]`, `#[attr(10)]`, `#[attr(paused)]` and `#[attr(10, paused)]`.
fn parse_args(attr: TokenStream) -> syn::Result<TimeoutArgs> {
    let mut args = TimeoutArgs {
        secs: DEFAULT_TIMEOUT_SECS,
        paused: false,
    };
    let items = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for item in items {
        match &item {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "timeout must be greater than zero",
                    ));
                }
                args.secs = secs;
            }
            Expr::Path(path) if path.path.is_ident("paused") => args.paused = true,
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a timeout in seconds or `paused`",
                ))
            }
        }
    }
    Ok(args)
}

/// Runs an async test on a fresh current-thread Tokio runtime inside a helper
/// thread, failing it if it has not finished after the budget (default 30s).
///
/// With `paused`, the runtime starts with the Tokio clock frozen so timers
/// auto-advance; the budget is then only enforced against the wall clock.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = syn::parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test expects an async fn")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;

    let attrs = strip_attrs(attrs, &["tokio", "test"]);
    let secs = args.secs;
    let runtime = if args.paused {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .expect("failed to build Tokio runtime")
        }
    } else {
        quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime")
        }
    };
    // A virtual-time deadline would fire as soon as the runtime idles on real I/O.
    let run = if args.paused {
        quote! { runtime.block_on(async move #block) }
    } else {
        quote! {
            runtime.block_on(async {
                tokio::time::timeout(budget, async move #block)
                    .await
                    .expect("test timed out")
            })
        }
    };

    let body = quote! {
        let runtime = #runtime;
        #run
    };
    wrap_with_watchdog(attrs, vis, sig, secs, body).into()
}

/// Synchronous counterpart of [`tokio_timeout_test`].
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    if args.paused {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "`paused` only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = syn::parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(&sig.ident, "use tokio_timeout_test for async tests")
            .to_compile_error()
            .into();
    }

    let attrs = strip_attrs(attrs, &["test"]);
    let body = quote! { (|| #block)() };
    wrap_with_watchdog(attrs, vis, sig, args.secs, body).into()
}

fn wrap_with_watchdog(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    secs: u64,
    body: TokenStream2,
) -> TokenStream2 {
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
                    #body
                }));
                let _ = sender.send(outcome);
            });
            match receiver.recv_timeout(budget) {
                Ok(Ok(value)) => value,
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded its {}s budget", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    }
}

/// Drops attributes matching `path` exactly so the test is not registered twice.
fn strip_attrs(attrs: Vec<Attribute>, path: &[&str]) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            segments != path
        })
        .collect()
}
