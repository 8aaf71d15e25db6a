use proc_macro::{Delimiter, Group, TokenStream, TokenTree};

/// Splits a `TokenStream` into comma-separated arguments.
///
/// Commas at the top level are used as separators; empty arguments are
/// skipped.
pub(crate) fn split_args(input: TokenStream) -> Vec<Vec<TokenTree>> {
    let mut args = Vec::new();
    let mut current = Vec::new();

    for token in input {
        match &token {
            TokenTree::Punct(p) if p.as_char() == ',' => {
                if !current.is_empty() {
                    args.push(current);
                    current = Vec::new();
                }
            }
            _ => current.push(token),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}

/// Options accepted by `#[weft::main]` and `#[weft::test]`.
#[derive(Default)]
pub(crate) struct Options {
    pub(crate) worker_threads: Option<usize>,
}

/// Parses `worker_threads = N`, the only option understood so far.
pub(crate) fn parse_options(attr: TokenStream) -> Result<Options, String> {
    let mut options = Options::default();

    for arg in split_args(attr) {
        let [TokenTree::Ident(key), TokenTree::Punct(eq), TokenTree::Literal(value)] = &arg[..] else {
            return Err(format!("expected `key = value`, found `{}`", TokenStream::from_iter(arg)));
        };

        if eq.as_char() != '=' {
            return Err(format!("expected `=` after `{key}`"));
        }

        match key.to_string().as_str() {
            "worker_threads" => {
                let n = value
                    .to_string()
                    .parse::<usize>()
                    .map_err(|_| format!("`worker_threads` expects an integer, found `{value}`"))?;
                if n == 0 {
                    return Err("`worker_threads` must be > 0".to_string());
                }
                options.worker_threads = Some(n);
            }
            other => return Err(format!("unknown option `{other}`")),
        }
    }

    Ok(options)
}

/// Wraps the function body so it runs inside a coroutine on a fresh
/// I/O manager, whose result becomes the function's result.
pub(crate) fn wrap_body(item: TokenStream, options: &Options) -> Result<Vec<TokenTree>, String> {
    let mut tokens: Vec<TokenTree> = item.into_iter().collect();

    if tokens
        .iter()
        .any(|t| matches!(t, TokenTree::Ident(id) if id.to_string() == "async"))
    {
        return Err("weft runs plain functions inside coroutines; remove `async`".to_string());
    }

    let Some(pos) = tokens
        .iter()
        .rposition(|t| matches!(t, TokenTree::Group(g) if g.delimiter() == Delimiter::Brace))
    else {
        return Err("expected a function body".to_string());
    };

    let TokenTree::Group(body) = &tokens[pos] else {
        unreachable!()
    };

    let mut builder = String::from("::weft::SchedulerBuilder::new()");
    if let Some(n) = options.worker_threads {
        builder.push_str(&format!(".worker_threads({n})"));
    }

    let block = format!(
        "{{
            let manager = {builder}
                .build()
                .expect(\"failed to start the I/O manager\");
            manager.block_on(move || {{ {} }})
        }}",
        body.stream()
    );

    let stream = block.parse::<TokenStream>().map_err(|err| err.to_string())?;
    tokens[pos] = TokenTree::Group(Group::new(Delimiter::Brace, stream));

    Ok(tokens)
}

/// Renders `message` as a `compile_error!` invocation.
pub(crate) fn compile_error(message: &str) -> TokenStream {
    format!("compile_error!({message:?});")
        .parse()
        .unwrap_or_default()
}
