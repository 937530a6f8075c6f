pub mod aggregation;
pub mod api;
pub mod change;
pub mod dependency;
pub mod dependent;
pub mod error;
pub mod filter;
pub mod ids;
pub mod memory;
pub mod ordering;
pub mod schema;
pub mod selection;
pub mod time;
pub mod tracking;
pub mod value;

pub use aggregation::ChangeAggregation;
pub use api::*;
pub use change::*;
pub use dependency::*;
pub use dependent::{DependentGraph, DependentNode};
pub use error::{VesperError, VesperResult};
pub use filter::{CompareOp, Filter, REDUCTION_BUDGET};
pub use ids::*;
pub use memory::MemoryConnector;
pub use ordering::*;
pub use schema::*;
pub use selection::{Selected, Selection};
pub use time::*;
pub use tracking::MutationContext;
pub use value::*;
