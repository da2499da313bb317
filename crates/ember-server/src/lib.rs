pub mod backend;
pub mod child;
pub mod error;
pub mod server;

pub use backend::{Backend, ServerModel};
pub use error::ServerError;
pub use server::{Flow, Server};
