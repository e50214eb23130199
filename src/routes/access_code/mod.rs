mod handler;
mod model;

pub use handler::{create_access_code, delete_access_code, list_access_codes};
