//! Small helpers shared by the pipeline and the CLI.
//!
//! - **Titles**: control-character and escape-sequence stripping
//! - **URLs**: validation of subscription URLs

mod text;
mod url_validator;

pub use text::clean_title;
pub use url_validator::{validate_feed_url, UrlValidationError};
