pub mod access;
pub mod broker;
pub mod dynpage;
pub mod embfs;
pub mod error;
pub mod header;
pub mod http;
pub mod request;
pub mod response;
pub mod rsfilter;
pub mod session;
pub mod status;
pub mod sup_cgi;
pub mod sup_dyn;
pub mod sup_emb;
pub mod uri;
pub mod vhost;

pub use broker::{Broker, SupMatch, Supplier};
pub use dynpage::{DynRoutes, PageCtx, PageFn};
pub use embfs::{EmbFile, EmbFs, EmbPage, EmbRes};
pub use error::{HttpError, SessionError};
pub use http::{HttpEngine, TlsProvider, WorkerCtx};
pub use request::{Method, Request, Upload};
pub use response::Response;
pub use session::{Session, SessionOpts, SessionRef};
