use std::borrow::Cow;

/// Failures reported by a broker connection or channel.
///
/// Reply codes follow AMQP 0-9-1: `406` maps to [`BrokerError::PreconditionFailed`] and
/// `404` to [`BrokerError::NotFound`]. Both close the channel they occurred on.
#[courier_derive::bus_error]
pub enum BrokerError {
    #[error("Broker connection error{}: {message}", format_context(.context))]
    Connection { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Broker channel error{}: {message}", format_context(.context))]
    Channel { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("PRECONDITION_FAILED (406){}: {message}", format_context(.context))]
    PreconditionFailed { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("NOT_FOUND (404){}: {message}", format_context(.context))]
    NotFound { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Broker resource closed{}: {message}", format_context(.context))]
    Closed { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[cfg(feature = "amqp")]
    #[error("AMQP client error{}: {source}", format_context(.context))]
    Amqp { source: lapin::Error, context: Option<Cow<'static, str>> },

    #[error("Internal broker error{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

impl BrokerError {
    /// The AMQP reply code carried by the error, if it has one.
    #[must_use]
    pub const fn reply_code(&self) -> Option<u16> {
        match self {
            Self::PreconditionFailed { .. } => Some(406),
            Self::NotFound { .. } => Some(404),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    pub(crate) fn closed(what: &'static str) -> Self {
        Self::Closed { message: Cow::Borrowed(what), context: None }
    }
}
