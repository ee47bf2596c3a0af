//! Core types for the ekko chat-relay bot: layered configuration, the error
//! taxonomy shared by every crate, and the conversation/persona domain model.

pub mod config;
pub mod domain;
pub mod errors;

pub use domain::conversation::{
    ChannelId, ConversationKey, ConversationTurn, ParticipantRole, UserId,
};
pub use domain::persona::{FallbackMessages, PersonaCatalog, PersonaDefinition};
pub use errors::{ApplicationError, DomainError, InterfaceError, InterfaceErrorKind};
