use error::FleetError;

/// A Result is an alias of [std::result::Result](std::result::Result) with
/// its error variant pre-populated with a `Box<dyn FleetError>`.
///
/// Instead of writing...
///
/// ```
/// use error::FleetError;
///
/// fn ready() -> Result<bool, Box<dyn FleetError>> {
///     Ok(true)
/// }
/// ```
///
/// ...you can simply say...
///
/// ```
/// use result::Result;
///
/// fn ready() -> Result<bool> {
///     Ok(true)
/// }
/// ```
pub type Result<T> = std::result::Result<T, Box<dyn FleetError>>;
