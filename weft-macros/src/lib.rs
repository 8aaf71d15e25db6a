//! Attribute macros for the Weft coroutine engine.
//!
//! Both macros build an [`IoManager`] with `SchedulerBuilder::new()` on the
//! calling thread and run the function body inside a coroutine on it via
//! `block_on`. The manager is stopped when the body returns.
//!
//! [`IoManager`]: https://docs.rs/weft/latest/weft/struct.IoManager.html

mod utils;

use proc_macro::{TokenStream, TokenTree};

/// Runs `main` inside a coroutine.
///
/// ```rust,ignore
/// #[weft::main(worker_threads = 4)]
/// fn main() {
///     weft::yield_to();
/// }
/// ```
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match utils::parse_options(attr) {
        Ok(options) => options,
        Err(message) => return utils::compile_error(&message),
    };

    match utils::wrap_body(item, &options) {
        Ok(tokens) => tokens.into_iter().collect(),
        Err(message) => utils::compile_error(&message),
    }
}

/// Runs a test body inside a coroutine on its own I/O manager.
///
/// Accepts the same options as [`main`].
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match utils::parse_options(attr) {
        Ok(options) => options,
        Err(message) => return utils::compile_error(&message),
    };

    let tokens = match utils::wrap_body(item, &options) {
        Ok(tokens) => tokens,
        Err(message) => return utils::compile_error(&message),
    };

    let test_attr: TokenStream = "#[test]".parse().unwrap();
    let mut result: Vec<TokenTree> = test_attr.into_iter().collect();
    result.extend(tokens);

    result.into_iter().collect()
}
