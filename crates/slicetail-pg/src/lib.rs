mod dao;
mod error;

pub use dao::{PgDaoConfig, PgQueryDao};
pub use error::{PgError, PgResult};
