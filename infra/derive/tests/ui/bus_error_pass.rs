use courier_derive::bus_error;
use std::borrow::Cow;

#[bus_error]
pub enum DemoError {
    #[error("Queue error{}: {message}", format_context(.context))]
    Queue { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("IO error{}: {source}", format_context(.context))]
    Io {
        #[source]
        source: std::io::Error,
        context: Option<Cow<'static, str>>,
    },

    #[error("Internal error{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

fn read() -> Result<(), DemoError> {
    Err(std::io::Error::other("disk gone")).context("reading topology")
}

fn main() {
    let err = read().unwrap_err();
    assert_eq!(err.to_string(), "IO error (reading topology): disk gone");

    let err: Result<(), DemoError> = Err("boom".into());
    assert_eq!(err.context("startup").unwrap_err().to_string(), "Internal error (startup): boom");

    let err = DemoError::Queue { message: "missing".into(), context: None };
    assert_eq!(err.to_string(), "Queue error: missing");

    let converted: DemoError = std::io::Error::other("eof").into();
    assert!(matches!(converted, DemoError::Io { context: None, .. }));
}
