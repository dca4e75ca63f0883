//! Request decorators that attach feed credentials.

mod url_param;

pub use url_param::UrlParam;
