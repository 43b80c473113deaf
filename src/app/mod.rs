pub mod errors;
pub mod factory;

pub use errors::AppError;
pub use factory::AppFactory;
