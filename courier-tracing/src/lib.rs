use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use syn::{ItemFn, Stmt, parse::Parse, parse_macro_input, parse_quote};

/// Unit the elapsed time of a traced call is reported in
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
enum Precision {
    #[default]
    Nanos,
    Micros,
    Millis,
    Seconds,
}

impl Precision {
    fn parse_unit(unit: &syn::LitStr) -> syn::Result<Self> {
        match unit.value().as_str() {
            "ns" | "nanos" | "nanoseconds" => Ok(Self::Nanos),
            "us" | "micros" | "microseconds" => Ok(Self::Micros),
            "ms" | "millis" | "milliseconds" => Ok(Self::Millis),
            "s" | "secs" | "seconds" => Ok(Self::Seconds),
            other => Err(syn::Error::new(
                unit.span(),
                format!("unknown precision `{other}`, expected one of ns, us, ms or s"),
            )),
        }
    }

    /// Name of the event field carrying the elapsed time
    fn field(self) -> syn::Ident {
        match self {
            Self::Nanos => format_ident!("elapsed_ns"),
            Self::Micros => format_ident!("elapsed_us"),
            Self::Millis => format_ident!("elapsed_ms"),
            Self::Seconds => format_ident!("elapsed_s"),
        }
    }

    /// Expression reading `elapsed` (a `Duration`) in this unit as a `u64`
    fn reading(self) -> syn::Expr {
        match self {
            Self::Nanos => parse_quote!(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)),
            Self::Micros => parse_quote!(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)),
            Self::Millis => parse_quote!(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)),
            Self::Seconds => parse_quote!(elapsed.as_secs()),
        }
    }
}

impl Parse for Precision {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        if !input.peek(syn::token::Paren) {
            return Ok(Self::default());
        }

        let content;
        let _ = syn::parenthesized!(content in input);
        let _ = content.parse::<keywords::precision>()?;
        let _ = content.parse::<syn::Token![=]>()?;
        Self::parse_unit(&content.parse()?)
    }
}

mod keywords {
    syn::custom_keyword!(timing);
    syn::custom_keyword!(precision);
    syn::custom_keyword!(instrument);
}

#[derive(Default)]
struct Options {
    timing: Option<Precision>,
    instrument: Option<TokenStream>,
    ignored: Vec<syn::Error>,
}

impl Options {
    /// Surface ignored arguments as compiler warnings without failing the build
    fn ignored_warnings(&self) -> TokenStream {
        let warnings = self.ignored.iter().map(|err| {
            let note = syn::LitStr::new(&format!("ignored argument to #[traced], {err}"), err.span());

            quote_spanned! {err.span()=>
                #[warn(deprecated)]
                {
                    #[deprecated(note = #note)]
                    const IGNORED_TRACED_ARGUMENT: () = ();
                    let () = IGNORED_TRACED_ARGUMENT;
                }
            }
        });

        quote! { #(#warnings)* }
    }
}

impl Parse for Options {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let mut options = Self::default();

        while !input.is_empty() {
            let lookahead = input.lookahead1();
            if lookahead.peek(keywords::timing) {
                let keyword = input.parse::<keywords::timing>()?;
                if options.timing.is_some() {
                    return Err(syn::Error::new(keyword.span, "`timing` given more than once"));
                }
                options.timing = Some(input.parse()?);
            } else if lookahead.peek(keywords::instrument) {
                let keyword = input.parse::<keywords::instrument>()?;
                if options.instrument.is_some() {
                    return Err(syn::Error::new(keyword.span, "`instrument` given more than once"));
                }
                options.instrument = Some(if input.peek(syn::token::Paren) {
                    let content;
                    let _ = syn::parenthesized!(content in input);
                    content.parse()?
                } else {
                    TokenStream::new()
                });
            } else if lookahead.peek(syn::Token![,]) {
                let _ = input.parse::<syn::Token![,]>()?;
            } else {
                options.ignored.push(lookahead.error());
                let _ = input.parse::<proc_macro2::TokenTree>()?;
            }
        }

        Ok(options)
    }
}

/// Emits structured `trace` events when the attributed function is entered
/// and when it returns, with the function name in a `function` field.
///
/// - `instrument(...)` also applies `#[tracing::instrument(...)]` with the
///   given arguments.
/// - `timing(precision = "ms")` adds the elapsed time to the exit event as an
///   `elapsed_ms` field (`ns`, `us` and `s` are accepted too).
///
/// The exit event fires from a drop guard, so it is emitted on early returns
/// and when an async function's future is dropped.
#[proc_macro_attribute]
pub fn traced(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let options = parse_macro_input!(args as Options);
    let mut item_fn = parse_macro_input!(item as ItemFn);

    let warnings = options.ignored_warnings();
    let function = item_fn.sig.ident.to_string();

    item_fn
        .attrs
        .push(parse_quote!(#[allow(clippy::items_after_statements)]));
    if let Some(arguments) = options.instrument {
        item_fn
            .attrs
            .push(parse_quote!(#[tracing::instrument(#arguments)]));
    }

    let on_exit: TokenStream = match options.timing {
        None => quote! {
            let _ = self.started;
            tracing::trace!(function = #function, "Exited");
        },
        Some(precision) => {
            let field = precision.field();
            let reading = precision.reading();
            quote! {
                let elapsed = self.started.elapsed();
                tracing::trace!(function = #function, #field = #reading, "Exited");
            }
        }
    };

    let guard: Vec<Stmt> = parse_quote! {
        struct TracedCall {
            started: std::time::Instant,
        }

        impl std::ops::Drop for TracedCall {
            fn drop(&mut self) {
                #on_exit
            }
        }

        #warnings
        tracing::trace!(function = #function, "Entered");
        let _traced_call = TracedCall {
            started: std::time::Instant::now(),
        };
    };

    item_fn.block.stmts.splice(0..0, guard);

    quote!(#item_fn).into()
}
