pub mod attach;
pub mod config;
pub mod constants;
pub mod declaration;
pub mod demo;
pub mod dispatcher;
pub mod error;
pub mod logger;
pub mod schema;
pub mod tags;

pub use attach::{PortAttacher, attach_ports};
pub use config::AttachOptions;
pub use constants::{CallbackMode, LogLevel};
pub use declaration::{Callback, Declaration, Declarations, Handler, PortDeclaration};
pub use error::{AttachError, HandlerFailure};
pub use tags::TagFn;
