//! Server traffic: requests out, responses and notifications in

pub mod correlator;
pub mod handler;
pub mod notification;
pub mod transport;

pub use correlator::{Completion, RequestOutcome, ResponseCorrelator, StoreResponseHandler};
pub use handler::{process_response, CompositeHandler, ResponseHandler};
pub use notification::{NotificationResolver, ReloadRequest, ResolveScope};
pub use transport::{Inbound, OutboundRequest, RecordingTransport, RequestId, ServerAction, Transport};
