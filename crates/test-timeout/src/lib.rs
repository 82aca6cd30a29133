//! `#[tokio_timeout_test]`: runs an async test on a dedicated current-thread runtime and
//! fails it once a wall-clock budget elapses.
//!
//! Arguments:
//! - `secs = N` or `ms = N` sets the budget (default 10 seconds);
//! - `paused` starts the runtime with tokio's clock paused, so timers advance instantly once
//!   the runtime is idle. Crates using it need tokio's `test-util` feature.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_BUDGET_MS: u64 = 10_000;

struct TestSettings {
    budget_ms: u64,
    paused: bool,
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut settings = TestSettings {
        budget_ms: DEFAULT_BUDGET_MS,
        paused: false,
    };
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("paused") {
            settings.paused = true;
            return Ok(());
        }
        let scale = if meta.path.is_ident("secs") {
            1_000
        } else if meta.path.is_ident("ms") {
            1
        } else {
            return Err(meta.error("expected `secs = N`, `ms = N` or `paused`"));
        };
        let lit: LitInt = meta.value()?.parse()?;
        let value: u64 = lit.base10_parse()?;
        if value == 0 {
            return Err(syn::Error::new(lit.span(), "budget must be greater than zero"));
        }
        settings.budget_ms = value.saturating_mul(scale);
        Ok(())
    });
    parse_macro_input!(attr with parser);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let name = sig.ident.to_string();
    let budget_ms = settings.budget_ms;

    // A paused clock auto-advances while idle, so a virtual-time timeout would fire
    // spuriously; paused tests rely on the wall-clock budget alone.
    let (builder, body) = if settings.paused {
        (
            quote! {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .start_paused(true)
                    .build()
            },
            quote! { runtime.block_on(async move #block); },
        )
    } else {
        (
            quote! {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
            },
            quote! {
                runtime.block_on(async {
                    if tokio::time::timeout(budget, async move #block).await.is_err() {
                        panic!("test `{}` exceeded its {:?} budget", #name, budget);
                    }
                });
            },
        )
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_millis(#budget_ms);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(format!("test-{}", #name))
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = #builder.expect("failed to build Tokio runtime");
                        #body
                    }));
                    let _ = sender.send(result);
                })
                .expect("failed to spawn test thread");
            match receiver.recv_timeout(budget + std::time::Duration::from_millis(250)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test `{}` timed out after {:?}", #name, budget)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test `{}` thread exited before reporting a result", #name)
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
