mod handler;
mod model;

pub use handler::{guest, login, register};
pub use model::{AuthResponse, GuestRequest, LoginRequest, RegisterRequest};
