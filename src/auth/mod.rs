mod endpoint;

pub use endpoint::{StreamEndpoint, JWT_QUERY_PARAM};
