use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Ident, LitStr, Type};

/// Which envelope parts a payload struct carries, located by field type.
#[derive(Default)]
struct Envelope<'a> {
    meta: Option<&'a Ident>,
    request: Option<&'a Ident>,
    response: Option<&'a Ident>,
}

impl<'a> Envelope<'a> {
    fn collect(input: &'a DeriveInput) -> syn::Result<Self> {
        let Data::Struct(data) = &input.data else {
            return Err(syn::Error::new_spanned(&input.ident, "Event can only be derived for structs"));
        };
        let Fields::Named(fields) = &data.fields else {
            return Err(syn::Error::new_spanned(&input.ident, "Event requires named fields"));
        };

        let mut envelope = Self::default();
        for field in &fields.named {
            let Some(ident) = field.ident.as_ref() else { continue };
            let slot = match type_name(&field.ty).as_deref() {
                Some("EventMeta") => &mut envelope.meta,
                Some("RequestMeta") => &mut envelope.request,
                Some("ResponseMeta") => &mut envelope.response,
                _ => continue,
            };
            if slot.replace(ident).is_some() {
                return Err(syn::Error::new_spanned(field, "envelope field declared twice"));
            }
        }

        if envelope.meta.is_none() {
            return Err(syn::Error::new_spanned(
                &input.ident,
                "Event payloads need an `EventMeta` field (usually `#[serde(flatten)] meta: EventMeta`)",
            ));
        }
        if envelope.request.is_some() && envelope.response.is_some() {
            return Err(syn::Error::new_spanned(
                &input.ident,
                "an event is either a request or a response, not both",
            ));
        }
        Ok(envelope)
    }
}

pub fn expand(input: DeriveInput) -> TokenStream {
    let envelope = match Envelope::collect(&input) {
        Ok(envelope) => envelope,
        Err(err) => return err.to_compile_error(),
    };
    let name = match event_name(&input) {
        Ok(name) => name,
        Err(err) => return err.to_compile_error(),
    };

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let meta = envelope.meta;

    let request_accessors = envelope.request.map(|field| {
        quote! {
            fn request_meta(&self) -> Option<&::courier_event_bus::RequestMeta> {
                Some(&self.#field)
            }

            fn request_meta_mut(&mut self) -> Option<&mut ::courier_event_bus::RequestMeta> {
                Some(&mut self.#field)
            }
        }
    });
    let response_accessors = envelope.response.map(|field| {
        quote! {
            fn response_meta(&self) -> Option<&::courier_event_bus::ResponseMeta> {
                Some(&self.#field)
            }

            fn response_meta_mut(&mut self) -> Option<&mut ::courier_event_bus::ResponseMeta> {
                Some(&mut self.#field)
            }
        }
    });

    let request_impl = envelope.request.map(|field| {
        quote! {
            #[automatically_derived]
            impl #impl_generics ::courier_event_bus::Request for #ident #ty_generics #where_clause {
                fn request(&self) -> &::courier_event_bus::RequestMeta {
                    &self.#field
                }

                fn request_mut(&mut self) -> &mut ::courier_event_bus::RequestMeta {
                    &mut self.#field
                }
            }
        }
    });
    let response_impl = envelope.response.map(|field| {
        quote! {
            #[automatically_derived]
            impl #impl_generics ::courier_event_bus::Response for #ident #ty_generics #where_clause {
                fn response(&self) -> &::courier_event_bus::ResponseMeta {
                    &self.#field
                }

                fn response_mut(&mut self) -> &mut ::courier_event_bus::ResponseMeta {
                    &mut self.#field
                }
            }
        }
    });

    quote! {
        #[automatically_derived]
        impl #impl_generics ::courier_event_bus::Event for #ident #ty_generics #where_clause {
            const NAME: &'static str = #name;

            fn meta(&self) -> &::courier_event_bus::EventMeta {
                &self.#meta
            }

            fn meta_mut(&mut self) -> &mut ::courier_event_bus::EventMeta {
                &mut self.#meta
            }

            #request_accessors
            #response_accessors
        }

        #request_impl
        #response_impl
    }
}

/// `#[event(name = "...")]` wins over the type identifier.
fn event_name(input: &DeriveInput) -> syn::Result<LitStr> {
    let mut name = None;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("event")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                if value.value().trim().is_empty() {
                    return Err(meta.error("event name cannot be empty"));
                }
                name = Some(value);
                Ok(())
            } else {
                Err(meta.error("unsupported event attribute, expected `name = \"...\"`"))
            }
        })?;
    }
    Ok(name.unwrap_or_else(|| LitStr::new(&input.ident.to_string(), input.ident.span())))
}

fn type_name(ty: &Type) -> Option<String> {
    match ty {
        Type::Path(path) => path.path.segments.last().map(|s| s.ident.to_string()),
        _ => None,
    }
}
