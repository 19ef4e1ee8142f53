pub use thiserror;
pub use thiserror::Error;

/// A FleetError is the trait to which every error surfaced by a fleet
/// component MUST adhere.
///
/// Implementors derive [Error](thiserror::Error) for the display and source
/// plumbing and then declare the marker impl.
///
/// ```
/// use error::*;
///
/// #[derive(Error, Debug)]
/// #[error("the bead store at {addr} could not be reached")]
/// struct StoreUnreachable {
///     addr: String,
///     #[source]
///     cause: std::io::Error,
/// }
///
/// impl FleetError for StoreUnreachable {}
/// ```
pub trait FleetError: std::error::Error + Send + Sync {}

/// This conversion supports the automatic boxing of any type that
/// implements [FleetError](crate::FleetError), which is what allows `?` to
/// lift a concrete error into the project-wide `result::Result<T>`.
impl<T: 'static + FleetError> From<T> for Box<dyn FleetError> {
    fn from(err: T) -> Self {
        Box::new(err)
    }
}

/// A `StringError` promotes a raw string into a first class
/// [FleetError](crate::FleetError). This is useful when an upstream API
/// hands back nothing better than a message, and that message needs to be
/// embedded as the [source](std::error::Error::source) of a higher error.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct StringError {
    message: String,
}

impl FleetError for StringError {}

impl From<String> for StringError {
    fn from(message: String) -> Self {
        StringError { message }
    }
}

impl From<&str> for StringError {
    fn from(message: &str) -> Self {
        StringError {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("the widget {widget} broke")]
    struct WidgetBroke {
        widget: String,
    }

    impl FleetError for WidgetBroke {}

    #[test]
    fn boxing_preserves_display() {
        let err: Box<dyn FleetError> = WidgetBroke {
            widget: "crank".to_string(),
        }
        .into();
        assert_eq!("the widget crank broke", format!("{}", err));
    }

    #[test]
    fn string_error_display() {
        let err = StringError::from("out of cheese");
        assert_eq!("out of cheese", format!("{}", err));
    }
}
