pub mod crd;
pub mod error;
pub mod prom;

pub use error::AppError;
