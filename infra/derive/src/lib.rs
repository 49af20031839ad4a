#![allow(unreachable_pub)]
#![allow(clippy::needless_pass_by_value)]

//! # Macros
//!
//! Procedural macros for the event bus workspace.
//!
//! * [`macro@bus_error`] turns a plain enum into the workspace error shape.
//! * [`derive@Event`] implements the event capability traits for a payload struct.
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! courier-derive = { path = "../derive" }
//! ```
//!
//! The examples below are `ignore`d because the generated code refers to crates that
//! depend on this one.

mod macros;

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

/// Attribute macro that standardises error enums across the workspace.
///
/// # Generated Items
///
/// * `Debug` and `thiserror::Error` derives when they are not already present.
/// * A `{Name}Ext<T>` trait with `context(..)` for `Result<T, Name>` and for every wrapped
///   `source` type.
/// * `From<Source>` for each variant with a `source` field (except `Internal`).
/// * `From<&'static str>` and `From<String>` when an `Internal` variant exists.
/// * A private `format_context` helper usable inside `#[error(..)]` strings.
///
/// # Requirements
///
/// Variants use named fields. Variants with a `source` must also declare
/// `context: Option<Cow<'static, str>>`.
///
/// # Example
///
/// ```rust,ignore
/// use std::borrow::Cow;
///
/// #[courier_derive::bus_error]
/// pub enum BrokerError {
///     #[error("Channel failure{}: {message}", format_context(.context))]
///     Channel { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
///
///     #[error("I/O error{}: {source}", format_context(.context))]
///     Io { source: std::io::Error, context: Option<Cow<'static, str>> },
///
///     #[error("Internal error{}: {message}", format_context(.context))]
///     Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
/// }
/// ```
#[proc_macro_attribute]
pub fn bus_error(_args: TokenStream, item: TokenStream) -> TokenStream {
    macros::error::expand(parse_macro_input!(item as DeriveInput)).into()
}

/// Derives `courier_event_bus::Event` for a payload struct.
///
/// Envelope fields are located by type: one `EventMeta` field is required, and an optional
/// `RequestMeta` or `ResponseMeta` field additionally implements `Request` or `Response`.
/// The wire name defaults to the struct identifier and can be overridden with
/// `#[event(name = "...")]`.
///
/// # Example
///
/// ```rust,ignore
/// use courier_event_bus::{Event, EventMeta};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize, Event)]
/// #[serde(rename_all = "camelCase")]
/// pub struct OrderCreated {
///     #[serde(flatten)]
///     pub meta: EventMeta,
///     pub order_id: u64,
/// }
/// ```
#[proc_macro_derive(Event, attributes(event))]
pub fn derive_event(item: TokenStream) -> TokenStream {
    macros::event::expand(parse_macro_input!(item as DeriveInput)).into()
}
