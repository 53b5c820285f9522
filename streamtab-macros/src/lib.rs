use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, DeriveInput};

mod component_meta;
use component_meta::{field_type_variant, parse_component_info, parse_fields, unwrap_option};

#[proc_macro_derive(Component, attributes(component, field))]
pub fn derive_component(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(e) => e.write_errors().into(),
    }
}

fn expand(input: &DeriveInput) -> darling::Result<TokenStream2> {
    let info = parse_component_info(input)?;
    let fields = parse_fields(input)?;

    let struct_name = &input.ident;
    let component_name = &info.name;
    let summary = info.summary.clone().unwrap_or_default();
    let constructor = &info.constructor;

    let (kind_variant, ctor_variant, product) = match info.kind.as_str() {
        "input" => ("Input", "Input", quote!(::std::boxed::Box<dyn crate::core::Source>)),
        "buffer" => ("Buffer", "Buffer", quote!(::std::boxed::Box<dyn crate::core::Buffer>)),
        "processor" => (
            "Processor",
            "Processor",
            quote!(::std::boxed::Box<dyn crate::core::TransformStage>),
        ),
        "output" => ("Output", "Output", quote!(::std::boxed::Box<dyn crate::core::Sink>)),
        "cache" => ("Cache", "Cache", quote!(::std::boxed::Box<dyn crate::core::Cache>)),
        "rate_limit" => (
            "RateLimit",
            "RateLimit",
            quote!(::std::boxed::Box<dyn crate::core::RateLimiter>),
        ),
        other => {
            return Err(darling::Error::custom(format!("unknown component kind '{other}'")));
        }
    };
    let kind_variant = format_ident!("{}", kind_variant);
    let ctor_variant = format_ident!("{}", ctor_variant);

    let status_variant = match info.status.as_deref().unwrap_or("stable") {
        "stable" => format_ident!("Stable"),
        "beta" => format_ident!("Beta"),
        "deprecated" => format_ident!("Deprecated"),
        other => return Err(darling::Error::custom(format!("unknown status '{other}'"))),
    };

    let mut field_specs = Vec::new();
    for field in &fields {
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        let field_name = ident.to_string();
        let description = field.description();
        let (inner_ty, optional) = unwrap_option(&field.ty);
        let type_variant = format_ident!("{}", field_type_variant(inner_ty));

        let default = match &field.default {
            Some(raw) => quote!(Some(crate::registry::parse_default(#raw))),
            None => quote!(None),
        };
        let required = field.default.is_none() && !optional;
        let min = match field.min {
            Some(v) => quote!(Some(#v)),
            None => quote!(None),
        };
        let max = match field.max {
            Some(v) => quote!(Some(#v)),
            None => quote!(None),
        };
        let options: Vec<String> = field
            .options
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let advanced = field.advanced;
        let resource = match field.resource.as_deref() {
            None => quote!(None),
            Some("cache") => quote!(Some(crate::registry::ResourceKind::Cache)),
            Some("rate_limit") => quote!(Some(crate::registry::ResourceKind::RateLimit)),
            Some(other) => {
                return Err(darling::Error::custom(format!("unknown resource kind '{other}'"))
                    .with_span(ident));
            }
        };

        field_specs.push(quote! {
            crate::registry::FieldSpec {
                name: #field_name.to_string(),
                field_type: crate::registry::FieldType::#type_variant,
                description: #description.to_string(),
                default: #default,
                required: #required,
                min: #min,
                max: #max,
                options: vec![#(#options.to_string()),*],
                advanced: #advanced,
                resource: #resource,
            }
        });
    }

    let mod_name = format_ident!(
        "__component_registration_{}",
        struct_name.to_string().to_lowercase()
    );

    Ok(quote! {
        impl crate::registry::Describe for #struct_name {
            fn spec() -> crate::registry::ComponentSpec {
                crate::registry::ComponentSpec {
                    name: #component_name.to_string(),
                    kind: crate::registry::ComponentKind::#kind_variant,
                    summary: #summary.to_string(),
                    status: crate::registry::Status::#status_variant,
                    fields: vec![#(#field_specs),*],
                }
            }

            fn registration() -> crate::registry::Registration {
                crate::registry::Registration {
                    spec: <Self as crate::registry::Describe>::spec(),
                    constructor: crate::registry::Constructor::#ctor_variant(#mod_name::construct),
                }
            }
        }

        #[doc(hidden)]
        mod #mod_name {
            use super::*;

            pub(super) fn construct(
                config: ::serde_json::Value,
                resources: &crate::resources::ResourceManager,
            ) -> ::anyhow::Result<#product> {
                let conf: #struct_name = ::serde_json::from_value(config)?;
                #constructor(conf, resources)
            }

            ::inventory::submit! {
                crate::registry::RegistrationFactory(
                    <#struct_name as crate::registry::Describe>::registration
                )
            }
        }
    })
}
