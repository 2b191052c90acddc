use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::ext::IdentExt;
use syn::{
    parse_macro_input, spanned::Spanned, Attribute, Data, DeriveInput, Fields, Ident, Path, Type,
};

#[proc_macro_derive(NestedSetsNode, attributes(sea_tree))]
pub fn derive_nested_sets_node(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match impl_nested_sets_node(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[proc_macro_derive(ClosureTableNode, attributes(sea_tree))]
pub fn derive_closure_table_node(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match impl_closure_table_node(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Default)]
struct Options {
    id_field: Option<String>,
    id_type: Option<Type>,
    entity_name: Option<String>,
    path_entity_name: Option<String>,
    left_field: Option<String>,
    right_field: Option<String>,
    top_level_field: Option<String>,
    path_module: Option<Path>,
    ancestor_field: Option<String>,
    descendant_field: Option<String>,
    depth_field: Option<String>,
    order_index_field: Option<String>,
}

/// What both derives share: the parsed options and the `TreeNode` impl.
struct Node {
    options: Options,
    tree_node: TokenStream2,
}

fn parse_node(input: &DeriveInput, derive: &str, path_entity: bool) -> syn::Result<Node> {
    let struct_ident = &input.ident;

    let data_struct = match &input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new(
                input.span(),
                format!("{derive} can only be derived for structs"),
            ))
        }
    };

    let mut options = Options::default();
    let mut table_name: Option<String> = None;

    for attr in &input.attrs {
        if attr.path().is_ident("sea_tree") {
            parse_sea_tree_attr(attr, &mut options)?;
        }

        if attr.path().is_ident("sea_orm") {
            if let Some(name) = parse_sea_orm_table_name(attr)? {
                table_name = Some(name);
            }
        }
    }

    let id_field_name = options.id_field.clone().unwrap_or_else(|| "id".to_string());
    let id_field_ident = Ident::new(&id_field_name, struct_ident.span());

    let mut id_field_type: Option<Type> = options.id_type.clone();
    if let Fields::Named(ref fields) = data_struct.fields {
        for field in &fields.named {
            if let Some(ident) = &field.ident {
                if ident == &id_field_ident && id_field_type.is_none() {
                    id_field_type = Some(field.ty.clone());
                }
            }
        }
    } else {
        return Err(syn::Error::new(
            data_struct.fields.span(),
            format!("{derive} requires named fields"),
        ));
    }

    let id_type = id_field_type.ok_or_else(|| {
        syn::Error::new(
            struct_ident.span(),
            "Unable to determine id field type; specify `id_type = ...` in #[sea_tree]",
        )
    })?;

    let entity_name = options
        .entity_name
        .clone()
        .or(table_name)
        .unwrap_or_else(|| struct_ident.unraw().to_string());
    let entity_name_literal = syn::LitStr::new(&entity_name, struct_ident.span());

    let config_options = if path_entity {
        let path_entity_name = options
            .path_entity_name
            .clone()
            .unwrap_or_else(|| format!("{entity_name}_paths"));
        let path_entity_literal = syn::LitStr::new(&path_entity_name, struct_ident.span());
        quote! { .path_entity_name(#path_entity_literal) }
    } else {
        quote! {}
    };

    let id_column_variant = format_ident!("{}", to_pascal_case(&id_field_name));

    let tree_node = quote! {
        impl ::sea_tree::TreeNode for #struct_ident {
            type Entity = Entity;
            type ActiveModel = ActiveModel;
            type Id = #id_type;

            fn tree_config() -> &'static ::sea_tree::TreeConfig {
                static CONFIG: ::sea_tree::__private::Lazy<::sea_tree::TreeConfig> =
                    ::sea_tree::__private::Lazy::new(|| {
                        let base = ::sea_tree::TreeConfig::new(#entity_name_literal);
                        ::sea_tree::TreeOptions::default()
                            #config_options
                            .apply(base)
                    });
                &CONFIG
            }

            fn id(&self) -> Self::Id {
                self.#id_field_ident.clone()
            }

            fn id_column() -> Column {
                Column::#id_column_variant
            }
        }
    };

    Ok(Node { options, tree_node })
}

fn impl_nested_sets_node(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let struct_ident = &input.ident;
    let Node { options, tree_node } = parse_node(input, "NestedSetsNode", false)?;

    if options.path_module.is_some() {
        return Err(syn::Error::new(
            struct_ident.span(),
            "`path_module` only applies to ClosureTableNode",
        ));
    }

    let left_field_name = options.left_field.unwrap_or_else(|| "lft".to_string());
    let right_field_name = options.right_field.unwrap_or_else(|| "rgt".to_string());
    let top_level_field_name = options
        .top_level_field
        .unwrap_or_else(|| "top_level".to_string());

    let left_field_ident = Ident::new(&left_field_name, struct_ident.span());
    let right_field_ident = Ident::new(&right_field_name, struct_ident.span());
    let top_level_field_ident = Ident::new(&top_level_field_name, struct_ident.span());

    let left_column_variant = format_ident!("{}", to_pascal_case(&left_field_name));
    let right_column_variant = format_ident!("{}", to_pascal_case(&right_field_name));
    let top_level_column_variant = format_ident!("{}", to_pascal_case(&top_level_field_name));

    Ok(quote! {
        #tree_node

        impl ::sea_tree::NestedSetsNode for #struct_ident {
            fn left_column() -> Column {
                Column::#left_column_variant
            }

            fn right_column() -> Column {
                Column::#right_column_variant
            }

            fn top_level_column() -> Column {
                Column::#top_level_column_variant
            }

            fn left(&self) -> i32 {
                self.#left_field_ident
            }

            fn right(&self) -> i32 {
                self.#right_field_ident
            }

            fn top_level(&self) -> Option<<Self as ::sea_tree::TreeNode>::Id> {
                self.#top_level_field_ident.clone()
            }
        }
    })
}

fn impl_closure_table_node(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let struct_ident = &input.ident;
    let Node { options, tree_node } = parse_node(input, "ClosureTableNode", true)?;

    let path_module = options
        .path_module
        .ok_or_else(|| syn::Error::new(struct_ident.span(), "`path_module` must be set"))?;

    let ancestor_field_name = options
        .ancestor_field
        .unwrap_or_else(|| "ancestor_id".to_string());
    let descendant_field_name = options
        .descendant_field
        .unwrap_or_else(|| "descendant_id".to_string());
    let depth_field_name = options.depth_field.unwrap_or_else(|| "depth".to_string());
    let order_index_field_name = options
        .order_index_field
        .unwrap_or_else(|| "order_index".to_string());

    let ancestor_field_ident = Ident::new(&ancestor_field_name, struct_ident.span());
    let descendant_field_ident = Ident::new(&descendant_field_name, struct_ident.span());
    let depth_field_ident = Ident::new(&depth_field_name, struct_ident.span());
    let order_index_field_ident = Ident::new(&order_index_field_name, struct_ident.span());

    let ancestor_column_variant = format_ident!("{}", to_pascal_case(&ancestor_field_name));
    let descendant_column_variant = format_ident!("{}", to_pascal_case(&descendant_field_name));
    let depth_column_variant = format_ident!("{}", to_pascal_case(&depth_field_name));
    let order_index_column_variant = format_ident!("{}", to_pascal_case(&order_index_field_name));

    Ok(quote! {
        #tree_node

        impl ::sea_tree::ClosureTableNode for #struct_ident {
            type PathEntity = #path_module::Entity;
            type PathModel = #path_module::Model;
            type PathActiveModel = #path_module::ActiveModel;

            fn path_ancestor_column() -> #path_module::Column {
                #path_module::Column::#ancestor_column_variant
            }

            fn path_descendant_column() -> #path_module::Column {
                #path_module::Column::#descendant_column_variant
            }

            fn path_depth_column() -> #path_module::Column {
                #path_module::Column::#depth_column_variant
            }

            fn path_order_index_column() -> #path_module::Column {
                #path_module::Column::#order_index_column_variant
            }

            fn path_ancestor(path: &#path_module::Model) -> <Self as ::sea_tree::TreeNode>::Id {
                path.#ancestor_field_ident.clone()
            }

            fn path_descendant(path: &#path_module::Model) -> <Self as ::sea_tree::TreeNode>::Id {
                path.#descendant_field_ident.clone()
            }

            fn path_depth(path: &#path_module::Model) -> i32 {
                path.#depth_field_ident
            }

            fn path_order_index(path: &#path_module::Model) -> i32 {
                path.#order_index_field_ident
            }

            fn build_path_row(
                ancestor: <Self as ::sea_tree::TreeNode>::Id,
                descendant: <Self as ::sea_tree::TreeNode>::Id,
                depth: i32,
                order_index: i32,
            ) -> #path_module::ActiveModel {
                #[allow(clippy::needless_update)]
                {
                    #path_module::ActiveModel {
                        #ancestor_field_ident: ::sea_orm::ActiveValue::Set(ancestor),
                        #descendant_field_ident: ::sea_orm::ActiveValue::Set(descendant),
                        #depth_field_ident: ::sea_orm::ActiveValue::Set(depth),
                        #order_index_field_ident: ::sea_orm::ActiveValue::Set(order_index),
                        ..::core::default::Default::default()
                    }
                }
            }
        }
    })
}

fn parse_sea_tree_attr(attr: &Attribute, options: &mut Options) -> syn::Result<()> {
    attr.parse_nested_meta(|meta| {
        let ident = meta
            .path
            .get_ident()
            .ok_or_else(|| syn::Error::new(meta.path.span(), "Invalid option key"))?
            .to_string();

        match ident.as_str() {
            "id_type" => {
                let ty: Type = meta.value()?.parse()?;
                options.id_type = Some(ty);
            }
            "path_module" => {
                let value: syn::LitStr = meta.value()?.parse()?;
                options.path_module = Some(parse_path(&value.value(), value.span())?);
            }
            key => {
                let value: syn::LitStr = meta.value()?.parse()?;
                let slot = match key {
                    "id_field" => &mut options.id_field,
                    "entity_name" => &mut options.entity_name,
                    "path_entity_name" => &mut options.path_entity_name,
                    "left_field" => &mut options.left_field,
                    "right_field" => &mut options.right_field,
                    "top_level_field" => &mut options.top_level_field,
                    "ancestor_field" => &mut options.ancestor_field,
                    "descendant_field" => &mut options.descendant_field,
                    "depth_field" => &mut options.depth_field,
                    "order_index_field" => &mut options.order_index_field,
                    other => {
                        return Err(syn::Error::new(
                            meta.path.span(),
                            format!("Unsupported sea_tree option `{other}`"),
                        ));
                    }
                };
                *slot = Some(value.value());
            }
        }

        Ok(())
    })
}

fn parse_sea_orm_table_name(attr: &Attribute) -> syn::Result<Option<String>> {
    let mut table_name: Option<String> = None;
    attr.parse_nested_meta(|meta| {
        if meta.path.is_ident("table_name") {
            let value: syn::LitStr = meta.value()?.parse()?;
            table_name = Some(value.value());
        } else if meta.input.peek(syn::Token![=]) {
            meta.value()?.parse::<syn::Expr>()?;
        }
        Ok(())
    })?;
    Ok(table_name)
}

fn parse_path(value: &str, span: proc_macro2::Span) -> syn::Result<Path> {
    syn::parse_str::<Path>(value).map_err(|_| syn::Error::new(span, "Invalid path"))
}

fn to_pascal_case(value: &str) -> String {
    value
        .split('_')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}
