mod operation;
mod projection;
mod query;

pub use operation::*;
pub use projection::*;
pub use query::*;
