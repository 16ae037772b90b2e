//! Proc macros for opfixture
//!
//! Provides `#[opfixture::scenario]` for controller end-to-end tests.

use proc_macro::TokenStream;
use quote::quote;
use syn::{FnArg, ItemFn, Pat, PatType, ReturnType};

/// Attribute macro for controller scenarios.
///
/// Builds a `Suite` from the environment, installs the cluster-scoped
/// prerequisites once per test binary, sets up a `Fixture` and injects it
/// as `fx`. The fixture is torn down after the body, whether it passed or
/// panicked. The prerequisites stay installed; remove them with
/// `Suite::remove_prerequisites` or a `Rendezvous` leader.
///
/// # Example
///
/// ```ignore
/// use opfixture::Fixture;
///
/// #[opfixture::scenario]
/// async fn test_scale(fx: Fixture) {
///     create_memcached(&fx, 3).await;
///     fx.wait_for_deployment("example-memcached", 3).await.unwrap();
/// }
/// ```
///
/// # With Result Return Type
///
/// ```ignore
/// #[opfixture::scenario]
/// async fn test_with_result(fx: Fixture) -> Result<(), Box<dyn std::error::Error>> {
///     fx.wait_for_deployment("example-memcached", 3).await?;
///     Ok(())
/// }
/// ```
///
/// # Environment Variables
///
/// - `OPFIXTURE_KEEP_ALL=true` - Never tear down, even on success (debug mode)
/// - plus everything `SuiteConfig::from_env` reads
#[proc_macro_attribute]
pub fn scenario(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input_fn = syn::parse_macro_input!(item as ItemFn);
    scenario_impl(&input_fn).into()
}

/// Check if a function has a parameter named "fx"
fn has_fx_param(input_fn: &ItemFn) -> bool {
    input_fn.sig.inputs.iter().any(|arg| {
        if let FnArg::Typed(PatType { pat, .. }) = arg {
            if let Pat::Ident(ident) = pat.as_ref() {
                return ident.ident == "fx";
            }
        }
        false
    })
}

/// Check if a function has an explicit return type (e.g., `-> Result<...>`)
fn has_result_return(input_fn: &ItemFn) -> bool {
    matches!(&input_fn.sig.output, ReturnType::Type(..))
}

/// Inner implementation that works with `proc_macro2` types for testability
fn scenario_impl(input_fn: &ItemFn) -> proc_macro2::TokenStream {
    let fn_name = &input_fn.sig.ident;
    let fn_block = &input_fn.block;
    let fn_vis = &input_fn.vis;
    let fn_attrs = &input_fn.attrs;

    if !has_fx_param(input_fn) {
        // No fixture requested - just wrap with tokio::test
        return quote! {
            #(#fn_attrs)*
            #[tokio::test]
            #fn_vis async fn #fn_name() {
                #fn_block
            }
        };
    }

    let body = match &input_fn.sig.output {
        ReturnType::Type(_, ty) if has_result_return(input_fn) => quote! {
            let result: #ty = async move #fn_block.await;
            if let Err(e) = result {
                panic!("Scenario failed: {:?}", e);
            }
        },
        _ => quote! {
            #fn_block
        },
    };

    quote! {
        #(#fn_attrs)*
        #[tokio::test]
        #fn_vis async fn #fn_name() {
            ::opfixture::telemetry::init_logging();

            let suite = ::opfixture::Suite::from_env()
                .await
                .unwrap_or_else(|e| panic!("Failed to create Suite: {}", e));
            suite
                .ensure_prerequisites()
                .await
                .unwrap_or_else(|e| panic!("Failed to install prerequisites: {}", e));

            ::opfixture::Fixture::run(&suite, |fx: ::opfixture::Fixture| async move {
                #body
            })
            .await
            .unwrap_or_else(|e| panic!("Failed to set up Fixture: {}", e));
        }
    }
}
