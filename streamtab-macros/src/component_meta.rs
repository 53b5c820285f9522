use darling::{FromAttributes, FromField};
use syn::{Attribute, DeriveInput, Expr, Fields, GenericArgument, Lit, Meta, PathArguments, Type};

/// Parsed attributes from #[component(...)]
#[derive(Debug, FromAttributes)]
#[darling(attributes(component))]
pub struct ComponentArgs {
    pub kind: String,
    pub name: String,

    #[darling(default)]
    pub summary: Option<String>,

    #[darling(default)]
    pub status: Option<String>,

    pub constructor: syn::Path,
}

/// Parsed attributes from #[field(...)]
#[derive(Debug, FromField)]
#[darling(attributes(field), forward_attrs(doc))]
pub struct FieldArgs {
    pub ident: Option<syn::Ident>,
    pub ty: syn::Type,
    pub attrs: Vec<Attribute>,

    #[darling(default)]
    pub description: Option<String>,

    #[darling(default)]
    pub default: Option<String>,

    #[darling(default)]
    pub min: Option<f64>,

    #[darling(default)]
    pub max: Option<f64>,

    /// Comma separated list of accepted string values
    #[darling(default)]
    pub options: Option<String>,

    #[darling(default)]
    pub advanced: bool,

    /// "cache" or "rate_limit"
    #[darling(default)]
    pub resource: Option<String>,
}

impl FieldArgs {
    /// Explicit description, falling back to the field's doc comment.
    pub fn description(&self) -> String {
        if let Some(desc) = &self.description {
            return desc.clone();
        }

        let lines: Vec<String> = self
            .attrs
            .iter()
            .filter_map(|attr| match &attr.meta {
                Meta::NameValue(nv) if nv.path.is_ident("doc") => match &nv.value {
                    Expr::Lit(expr) => match &expr.lit {
                        Lit::Str(s) => Some(s.value().trim().to_string()),
                        _ => None,
                    },
                    _ => None,
                },
                _ => None,
            })
            .collect();

        lines.join(" ")
    }
}

pub fn parse_component_info(input: &DeriveInput) -> darling::Result<ComponentArgs> {
    ComponentArgs::from_attributes(&input.attrs)
}

pub fn parse_fields(input: &DeriveInput) -> darling::Result<Vec<FieldArgs>> {
    let fields = match &input.data {
        syn::Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            Fields::Unit => return Ok(Vec::new()),
            _ => {
                return Err(darling::Error::custom(
                    "Component configs must use named fields",
                ))
            }
        },
        _ => return Err(darling::Error::custom("Component can only be derived for structs")),
    };

    fields.iter().map(FieldArgs::from_field).collect()
}

/// Strips `Option<..>`, reporting whether the field may be omitted.
pub fn unwrap_option(ty: &Type) -> (&Type, bool) {
    if let Type::Path(path) = ty {
        if let Some(segment) = path.path.segments.last() {
            if segment.ident == "Option" {
                if let PathArguments::AngleBracketed(args) = &segment.arguments {
                    if let Some(GenericArgument::Type(inner)) = args.args.first() {
                        return (inner, true);
                    }
                }
            }
        }
    }
    (ty, false)
}

/// Maps a Rust field type onto the name of a `FieldType` variant.
pub fn field_type_variant(ty: &Type) -> &'static str {
    let Type::Path(path) = ty else {
        return "Any";
    };
    let Some(segment) = path.path.segments.last() else {
        return "Any";
    };

    match segment.ident.to_string().as_str() {
        "String" | "str" => "String",
        "bool" => "Bool",
        "u8" | "u16" | "u32" | "u64" | "usize" | "i8" | "i16" | "i32" | "i64" | "isize" => {
            "Integer"
        }
        "f32" | "f64" => "Number",
        "Vec" => "Array",
        "HashMap" | "BTreeMap" => "Object",
        _ => "Any",
    }
}
