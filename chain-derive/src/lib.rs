//! `#[derive(NonVolatile)]` for types placed in a chain image.

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use proc_macro_crate::{FoundCrate, crate_name};
use quote::{ToTokens, quote};
use syn::{
    Data, DeriveInput, Error, Fields, GenericArgument, PathArguments, ReturnType, Type,
    parse_macro_input, parse_quote, spanned::Spanned,
};

/// Derives `chain::NonVolatile`.
///
/// The image is written by one boot and read back by the next, after the
/// program was reloaded and the memory remapped. The derive rejects, at
/// compile time, what cannot survive that:
///
/// | Rejected | Why |
/// |----------|-----|
/// | missing `#[repr(C)]` / `#[repr(transparent)]` (integer repr for enums) | field offsets must not change between builds of the same program |
/// | `&T`, `*const T`, `fn(..)`, `Box`, `Vec`, `String`, `Rc`, `Arc`, ... | addresses are meaningless after a reboot |
/// | `Cell`, `RefCell`, `Mutex`, ... | stores through them bypass the power probes; use `NvCell` |
/// | `Instant` | the monotonic clock restarts with the device; use `LogicalTime` |
/// | unions | the active variant is unknown to the next boot |
///
/// Every field type must itself be `NonVolatile`; the generated impl carries
/// one where-clause bound per field type.
///
/// # Example
///
/// ```
/// # use chain::NonVolatile;
/// use chain::channel::{Field, SelfField};
///
/// #[derive(NonVolatile, Default)]
/// #[repr(C)]
/// struct Sensor {
///     reading: Field<i16>,
///     samples: SelfField<u32>,
/// }
/// ```
///
/// ```compile_fail
/// # use chain::NonVolatile;
/// #[derive(NonVolatile)]
/// struct NoRepr {
///     x: u32,
/// }
/// ```
///
/// ```compile_fail
/// # use chain::NonVolatile;
/// #[derive(NonVolatile)]
/// #[repr(C)]
/// struct Callback {
///     on_boot: fn(),
/// }
/// ```
///
/// ```compile_fail
/// # use chain::NonVolatile;
/// #[derive(NonVolatile)]
/// #[repr(C)]
/// struct Started {
///     at: std::time::Instant,
/// }
/// ```
#[proc_macro_derive(NonVolatile)]
pub fn derive_non_volatile(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

/// Path of the `chain` crate as seen from the deriving crate.
fn chain_path() -> TokenStream2 {
    match crate_name("chain") {
        Ok(FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, Span::call_site());
            quote!(::#ident)
        }
        // `extern crate self as chain` makes this resolve inside the crate too.
        Ok(FoundCrate::Itself) | Err(_) => quote!(::chain),
    }
}

fn expand(mut input: DeriveInput) -> syn::Result<TokenStream2> {
    require_stable_layout(&input)?;

    let fields = field_types(&input.data)?;
    for ty in &fields {
        reject_unpersistable(ty, ty)?;
    }

    let chain = chain_path();
    let where_clause = input.generics.make_where_clause();
    for ty in &fields {
        where_clause
            .predicates
            .push(parse_quote!(#ty: #chain::__NonVolatilePrivate));
    }

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    Ok(quote! {
        unsafe impl #impl_generics #chain::__NonVolatilePrivate for #name #ty_generics #where_clause {}
    })
}

const LAYOUT_REPRS: &[&str] = &[
    "C",
    "transparent",
    "u8",
    "u16",
    "u32",
    "u64",
    "u128",
    "usize",
    "i8",
    "i16",
    "i32",
    "i64",
    "i128",
    "isize",
];

fn require_stable_layout(input: &DeriveInput) -> syn::Result<()> {
    let mut stable = false;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("repr")) {
        attr.parse_nested_meta(|meta| {
            if let Some(ident) = meta.path.get_ident() {
                stable |= LAYOUT_REPRS.iter().any(|r| ident == r);
            }
            // Skip the argument of `align(N)` / `packed(N)`.
            if meta.input.peek(syn::token::Paren) {
                meta.input.parse::<proc_macro2::TokenTree>()?;
            }
            Ok(())
        })?;
    }
    if stable {
        return Ok(());
    }

    let fix = match input.data {
        Data::Enum(_) => "#[repr(u8)] (or another integer repr)",
        _ => "#[repr(C)]",
    };
    Err(Error::new(
        input.ident.span(),
        format!(
            "`{}` needs a stable layout to be NonVolatile: the next boot reads \
             the image back field by field\nhelp: add {fix}",
            input.ident
        ),
    ))
}

fn field_types(data: &Data) -> syn::Result<Vec<Type>> {
    fn of(fields: &Fields) -> impl Iterator<Item = Type> + '_ {
        fields.iter().map(|f| f.ty.clone())
    }

    match data {
        Data::Struct(s) => Ok(of(&s.fields).collect()),
        Data::Enum(e) => Ok(e.variants.iter().flat_map(|v| of(&v.fields)).collect()),
        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "NonVolatile cannot be derived for unions: the next boot cannot \
             tell which variant was written",
        )),
    }
}

/// Type names that never belong in the image, with the hint shown to the user.
const REJECTED: &[(&[&str], &str, &str)] = &[
    (
        &["Box", "Vec", "String", "PathBuf", "OsString", "CString", "Rc", "Arc"],
        "points into the heap, which does not survive a reboot",
        "store inline data such as `[T; N]` or a fixed-size `Name`",
    ),
    (
        &["Cell", "RefCell", "OnceCell", "UnsafeCell"],
        "is mutated without power probes",
        "use `NvCell` for mutable persistent state",
    ),
    (
        &["Mutex", "RwLock", "Condvar", "Barrier", "AtomicBool", "AtomicU32", "AtomicU64"],
        "holds process-local synchronization state",
        "the runtime has a single thread of control; use `NvCell`",
    ),
    (
        &["Instant"],
        "is relative to a clock that restarts with the device",
        "order events with `LogicalTime`",
    ),
];

fn rejection(what: &impl ToTokens, field: &Type, why: &str, help: &str) -> Error {
    Error::new(
        what.span(),
        format!(
            "field type `{}` cannot be NonVolatile: `{}` {why}\nhelp: {help}",
            field.to_token_stream(),
            what.to_token_stream(),
        ),
    )
}

fn reject_unpersistable(ty: &Type, field: &Type) -> syn::Result<()> {
    match ty {
        Type::Path(path) => {
            for segment in &path.path.segments {
                if let Some((_, why, help)) = REJECTED
                    .iter()
                    .find(|(names, _, _)| names.iter().any(|n| segment.ident == n))
                {
                    return Err(rejection(&segment.ident, field, why, help));
                }
                match &segment.arguments {
                    PathArguments::AngleBracketed(args) => {
                        for arg in &args.args {
                            if let GenericArgument::Type(inner) = arg {
                                reject_unpersistable(inner, field)?;
                            }
                        }
                    }
                    PathArguments::Parenthesized(args) => {
                        for input in &args.inputs {
                            reject_unpersistable(input, field)?;
                        }
                        if let ReturnType::Type(_, output) = &args.output {
                            reject_unpersistable(output, field)?;
                        }
                    }
                    PathArguments::None => {}
                }
            }
            Ok(())
        }
        Type::Reference(r) => Err(rejection(
            r,
            field,
            "is a reference, an address that a reboot invalidates",
            "store an index or the value itself",
        )),
        Type::Ptr(p) => Err(rejection(
            p,
            field,
            "is a raw pointer, an address that a reboot invalidates",
            "store an index or the value itself",
        )),
        Type::BareFn(f) => Err(rejection(
            f,
            field,
            "is a function pointer; code may load elsewhere after a reboot",
            "store a `TaskId` or another index instead",
        )),
        Type::Tuple(t) => t
            .elems
            .iter()
            .try_for_each(|elem| reject_unpersistable(elem, field)),
        Type::Array(a) => reject_unpersistable(&a.elem, field),
        Type::Slice(s) => reject_unpersistable(&s.elem, field),
        Type::Group(g) => reject_unpersistable(&g.elem, field),
        Type::Paren(p) => reject_unpersistable(&p.elem, field),
        _ => Ok(()),
    }
}
