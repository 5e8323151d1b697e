pub mod by_slice;
pub mod continuous;
pub mod dao;
pub mod error;
pub mod mock;

pub use by_slice::{BySliceQuery, CreateEnvelope, ExtractOffset};
pub use continuous::{adjust_next_delay, continuous_query};
pub use dao::{DaoError, QueryDao, RowQuery, RowStream};
pub use error::{QueryError, QueryResult};
pub use mock::MockDao;
