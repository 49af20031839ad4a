use courier_derive::bus_error;
use std::borrow::Cow;

#[bus_error]
#[derive(Debug, thiserror::Error)]
pub enum PlainError {
    #[error("Queue {queue} closed")]
    Closed { queue: String },

    #[error("Internal error{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

fn main() {
    let err: PlainError = String::from("late").into();
    assert_eq!(err.to_string(), "Internal error: late");
    assert_eq!(PlainError::Closed { queue: "q".into() }.to_string(), "Queue q closed");
}
