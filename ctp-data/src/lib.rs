//! Data model, repositories, and the generic CRUD dispatcher.
//!
//! Entities publish an [`descriptor::EntityDescriptor`]; the dispatcher
//! in [`crud`] synthesizes the uniform REST semantics over it. The
//! message core ([`message`]) and channel authorization ([`channels`])
//! are the specialized, non-uniform parts of the domain.

pub mod channels;
pub mod crud;
pub mod descriptor;
pub mod message;
pub mod schema;

pub use channels::{Channel, ChannelAuthorizer, ChannelDenied, ChannelScope};
pub use crud::{CrudContext, PostCreateHook, PreWriteGuard};
pub use descriptor::{ColKind, ColumnSpec, CourseLink, EntityDescriptor, Writable, REGISTRY};
pub use message::{
    MessageCreate, MessageGet, MessageQuery, MessageScope, MessageStore, MessageTarget,
    MessageUpdate,
};
