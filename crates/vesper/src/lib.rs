//! Live change subscriptions: a durable broker feeds each
//! [`ChangesSubscriptionStream`] the mutations that may affect its query, and
//! the stream turns them into upserts and deletions of the selected view.

mod consumer;
pub mod stream;

pub mod model {
    pub use vesper_core::*;
}

pub mod storage {
    pub use vesper_store::*;
}

pub use stream::{
    ChangesSubscriptionDelta, ChangesSubscriptionInput, ChangesSubscriptionStream, StreamHandle,
    StreamState,
};
pub use vesper_core::{
    Broker, Connector, Filter, MemoryConnector, MutationContext, Schema, Selection,
    SubscriptionId, VesperError, VesperResult,
};
pub use vesper_store::{SqlBroker, VesperConfig, open_broker};
