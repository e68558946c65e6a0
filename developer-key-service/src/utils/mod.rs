pub mod validation;

pub use validation::{normalized_site, validate_url};
