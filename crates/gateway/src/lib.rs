//! Chat gateway - the Discord-facing edge of the Ekko relay bot
//!
//! This crate turns platform events into bot actions:
//! - **Runner** (`runner`) - transport loop with acknowledgement and reconnection
//! - **Events** (`events`) - messages, slash commands and reactions routed to handlers
//! - **Commands** (`commands`) - `/help`, `/reset`, `/set-persona` and the `!` prefix forms
//! - **Replies** (`reply`) - outbound actions, help embed, long-reply chunking
//!
//! # Architecture
//!
//! ```text
//! GatewayTransport → GatewayRunner → EventDispatcher → Handlers → services (server)
//!                         ↑                                   ↓
//!                         └──────── OutboundAction ←──────────┘
//! ```
//!
//! Handlers only see the service traits declared here; the server crate
//! implements them over the conversation service and relay policy.

pub mod commands;
pub mod events;
pub mod reply;
pub mod runner;

pub use commands::{
    CommandParseError, CommandRouteError, CommandRouter, CommandService, GatewayCommand,
    PersonaSelection, PrefixCommand, SlashCommandPayload,
};
pub use events::{
    default_dispatcher, Attachment, DispatchError, EventContext, EventDispatcher, EventHandler,
    EventHandlerError, GatewayEnvelope, GatewayEvent, GatewayEventType, HandlerResult,
    MessageEvent, MessageOutcome, MessageService, ReactionAddedEvent, ReactionService,
};
pub use reply::{Embed, EmbedBuilder, OutboundAction, ReplyBody};
pub use runner::{
    GatewayRunner, GatewayTransport, NoopGatewayTransport, ReconnectPolicy, TransportError,
};
