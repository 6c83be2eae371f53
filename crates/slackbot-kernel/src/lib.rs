pub mod args;
pub mod bot;
pub mod callback;
pub mod handler;
pub mod pager;
pub mod registry;
pub mod router;
pub mod signature;
pub mod storage;

pub use args::Args;
pub use bot::BotConfig;
pub use callback::{Callback, CallbackError, CallbackStore, NewCallback, Principal};
pub use handler::{
    CommandContext, EventContext, Handler, HandlerError, InteractionContext, MenuOptionsContext,
    Reply,
};
pub use pager::{Cursor, Pager, SliceCursor};
pub use registry::{HandlerNotFound, HandlerRegistry};
pub use router::{CommandEndpoint, CommandTarget, RouteBuilder, RouteNode};
pub use storage::{CallbackStorage, MemoryStorage, StorageError};
